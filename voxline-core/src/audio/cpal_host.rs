//! cpal-backed [`AudioHost`].
//!
//! # Threading
//!
//! `cpal::Stream` is `!Send` on most platforms (COM on Windows, CoreAudio on
//! macOS), so every stream is built, played and dropped on a dedicated OS
//! thread. The opening thread reports success or failure back over a
//! one-slot channel before `open_*` returns, which keeps "acquired or not"
//! synchronous for the session.
//!
//! # Real-time callbacks
//!
//! Callbacks only move samples between the hardware buffer and a lock-free
//! SPSC ring. Rate conversion, framing and scheduling happen elsewhere:
//!
//! ```text
//! input:  callback ─► capture ring ─► drain thread (resample → sink)
//! output: schedule (resample, silence for gaps) ─► playback ring ─► callback
//! ```
//!
//! The output clock is the number of frames the callback has rendered,
//! silence included, divided by the device rate.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::{Device, SampleFormat, SampleRate, SizedSample, StreamConfig};
use crossbeam_channel::{bounded, Receiver, Sender, TryRecvError};
use tracing::{debug, error, info, warn};

use crate::audio::device::{
    AudioHost, DeviceDirection, DeviceInfo, InputDevice, InputRequest, OutputDevice,
    OutputRequest, SampleSink,
};
use crate::audio::resample::RateConverter;
use crate::buffering::{
    create_sample_ring, Consumer, PlaybackChunk, Producer, SampleConsumer,
    SampleProducer, CAPTURE_RING_CAPACITY, PLAYBACK_RING_CAPACITY,
};
use crate::error::DeviceError;

/// Input resampler block: 10 ms at 48 kHz.
const INPUT_RESAMPLE_CHUNK: usize = 480;
/// Output resampler block: 10 ms at 24 kHz.
const OUTPUT_RESAMPLE_CHUNK: usize = 240;
const DRAIN_IDLE: Duration = Duration::from_millis(5);
const DRAIN_BLOCK: usize = 4096;

/// The system's default audio host.
#[derive(Debug, Default, Clone, Copy)]
pub struct CpalHost;

impl CpalHost {
    pub fn new() -> Self {
        Self
    }
}

impl AudioHost for CpalHost {
    fn open_output(&self, request: &OutputRequest) -> Result<Box<dyn OutputDevice>, DeviceError> {
        CpalOutput::open(request.sample_rate).map(|o| Box::new(o) as Box<dyn OutputDevice>)
    }

    fn open_input(
        &self,
        request: &InputRequest,
        sink: SampleSink,
    ) -> Result<Box<dyn InputDevice>, DeviceError> {
        CpalInput::open(request, sink).map(|i| Box::new(i) as Box<dyn InputDevice>)
    }
}

/// Sort a cpal error into the session's device taxonomy.
fn classify(message: String) -> DeviceError {
    let lowered = message.to_ascii_lowercase();
    if lowered.contains("permission") || lowered.contains("denied") || lowered.contains("not allowed")
    {
        DeviceError::PermissionDenied(message)
    } else if lowered.contains("not available") || lowered.contains("no longer available") {
        DeviceError::NotFound(message)
    } else {
        DeviceError::Unavailable(message)
    }
}

/// Enumerate input devices, default first.
pub fn list_input_devices() -> Vec<DeviceInfo> {
    let host = cpal::default_host();
    let default_name = host.default_input_device().and_then(|d| d.name().ok());
    match host.input_devices() {
        Ok(devices) => describe(devices, DeviceDirection::Input, default_name.as_deref()),
        Err(e) => {
            warn!("failed to enumerate input devices: {e}");
            Vec::new()
        }
    }
}

/// Enumerate output devices, default first.
pub fn list_output_devices() -> Vec<DeviceInfo> {
    let host = cpal::default_host();
    let default_name = host.default_output_device().and_then(|d| d.name().ok());
    match host.output_devices() {
        Ok(devices) => describe(devices, DeviceDirection::Output, default_name.as_deref()),
        Err(e) => {
            warn!("failed to enumerate output devices: {e}");
            Vec::new()
        }
    }
}

fn describe(
    devices: impl Iterator<Item = Device>,
    direction: DeviceDirection,
    default_name: Option<&str>,
) -> Vec<DeviceInfo> {
    let mut list: Vec<DeviceInfo> = devices
        .enumerate()
        .map(|(idx, device)| {
            let name = device
                .name()
                .unwrap_or_else(|_| format!("Device {}", idx + 1));
            let is_default = default_name == Some(name.as_str());
            DeviceInfo {
                name,
                direction,
                is_default,
            }
        })
        .collect();
    list.sort_by_key(|d| (!d.is_default, d.name.to_ascii_lowercase()));
    list
}

/// Preferred name, then the default device, then the first one listed.
fn select_input_device(preferred: Option<&str>) -> Result<Device, DeviceError> {
    let host = cpal::default_host();

    if let Some(preferred) = preferred {
        match host.input_devices() {
            Ok(mut devices) => {
                if let Some(device) =
                    devices.find(|d| d.name().map(|n| n == preferred).unwrap_or(false))
                {
                    return Ok(device);
                }
                warn!(preferred, "preferred input device not found, falling back");
            }
            Err(e) => warn!("failed to list input devices while resolving preference: {e}"),
        }
    }

    if let Some(device) = host.default_input_device() {
        return Ok(device);
    }

    let mut devices = host.input_devices().map_err(|e| classify(e.to_string()))?;
    let fallback = devices
        .next()
        .ok_or_else(|| DeviceError::NotFound("no input device".into()))?;
    warn!("no default input device, falling back to first available input");
    Ok(fallback)
}

// ---------------------------------------------------------------------------
// Input
// ---------------------------------------------------------------------------

struct CpalInput {
    streaming: Arc<AtomicBool>,
    shutdown: Option<Sender<()>>,
    thread: Option<JoinHandle<()>>,
}

impl CpalInput {
    fn open(request: &InputRequest, sink: SampleSink) -> Result<Self, DeviceError> {
        let streaming = Arc::new(AtomicBool::new(false));
        let (ready_tx, ready_rx) = bounded::<Result<(), DeviceError>>(1);
        let (shutdown_tx, shutdown_rx) = bounded::<()>(1);

        let target_rate = request.sample_rate;
        let preferred = request.preferred_device.clone();
        let gate = Arc::clone(&streaming);

        let thread = std::thread::Builder::new()
            .name("voxline-input".into())
            .spawn(move || {
                let (producer, consumer) = create_sample_ring(CAPTURE_RING_CAPACITY);
                let opened = build_input_stream(preferred.as_deref(), producer, gate);
                let (stream, device_rate) = match opened {
                    Ok(pair) => pair,
                    Err(e) => {
                        let _ = ready_tx.send(Err(e));
                        return;
                    }
                };
                let converter =
                    match RateConverter::new(device_rate, target_rate, INPUT_RESAMPLE_CHUNK) {
                        Ok(c) => c,
                        Err(e) => {
                            let _ = ready_tx.send(Err(DeviceError::Unavailable(e.to_string())));
                            return;
                        }
                    };
                let _ = ready_tx.send(Ok(()));

                drain_input(consumer, converter, sink, &shutdown_rx);
                drop(stream);
                debug!("input stream released");
            })
            .map_err(|e| DeviceError::Unavailable(format!("spawning input thread: {e}")))?;

        match ready_rx.recv() {
            Ok(Ok(())) => Ok(Self {
                streaming,
                shutdown: Some(shutdown_tx),
                thread: Some(thread),
            }),
            Ok(Err(e)) => {
                let _ = thread.join();
                Err(e)
            }
            Err(_) => {
                let _ = thread.join();
                Err(DeviceError::Unavailable("input thread exited".into()))
            }
        }
    }
}

impl InputDevice for CpalInput {
    fn set_streaming(&self, enabled: bool) {
        self.streaming.store(enabled, Ordering::Release);
    }

    fn stop(&mut self) {
        self.streaming.store(false, Ordering::Release);
        if let Some(shutdown) = self.shutdown.take() {
            let _ = shutdown.send(());
        }
        if let Some(thread) = self.thread.take() {
            if thread.join().is_err() {
                error!("input thread panicked");
            }
            info!("microphone released");
        }
    }
}

impl Drop for CpalInput {
    fn drop(&mut self) {
        self.stop();
    }
}

fn drain_input(
    mut consumer: SampleConsumer,
    mut converter: RateConverter,
    mut sink: SampleSink,
    shutdown: &Receiver<()>,
) {
    let mut block = vec![0f32; DRAIN_BLOCK];
    loop {
        match shutdown.try_recv() {
            Ok(()) | Err(TryRecvError::Disconnected) => break,
            Err(TryRecvError::Empty) => {}
        }
        let n = consumer.pop_slice(&mut block);
        if n == 0 {
            std::thread::sleep(DRAIN_IDLE);
            continue;
        }
        let converted = converter.process(&block[..n]);
        if !converted.is_empty() {
            sink(&converted);
        }
    }
}

fn build_input_stream(
    preferred: Option<&str>,
    producer: SampleProducer,
    streaming: Arc<AtomicBool>,
) -> Result<(cpal::Stream, u32), DeviceError> {
    let device = select_input_device(preferred)?;
    info!(
        device = device.name().unwrap_or_default().as_str(),
        "opening input device"
    );

    let supported = device
        .default_input_config()
        .map_err(|e| classify(e.to_string()))?;
    let sample_rate = supported.sample_rate().0;
    let channels = supported.channels();
    info!(sample_rate, channels, "input config selected");

    let config = StreamConfig {
        channels,
        sample_rate: SampleRate(sample_rate),
        buffer_size: cpal::BufferSize::Default,
    };

    let stream = match supported.sample_format() {
        SampleFormat::F32 => input_stream::<f32>(&device, &config, producer, streaming, |s| s),
        SampleFormat::I16 => {
            input_stream::<i16>(&device, &config, producer, streaming, |s| s as f32 / 32768.0)
        }
        SampleFormat::U8 => input_stream::<u8>(&device, &config, producer, streaming, |s| {
            (s as f32 - 128.0) / 128.0
        }),
        fmt => {
            return Err(DeviceError::Unavailable(format!(
                "unsupported input sample format: {fmt:?}"
            )))
        }
    }?;

    stream.play().map_err(|e| classify(e.to_string()))?;
    Ok((stream, sample_rate))
}

/// Downmix to mono and push into the capture ring. Allocation-free after
/// the first callback.
fn input_stream<T>(
    device: &Device,
    config: &StreamConfig,
    mut producer: SampleProducer,
    streaming: Arc<AtomicBool>,
    to_f32: fn(T) -> f32,
) -> Result<cpal::Stream, DeviceError>
where
    T: SizedSample + Copy + Send + 'static,
{
    let ch = config.channels.max(1) as usize;
    let mut mono: Vec<f32> = Vec::new();
    device
        .build_input_stream(
            config,
            move |data: &[T], _info| {
                if !streaming.load(Ordering::Relaxed) {
                    return;
                }
                let frames = data.len() / ch;
                mono.resize(frames, 0.0);
                for (f, frame) in data.chunks_exact(ch).enumerate() {
                    let sum: f32 = frame.iter().map(|s| to_f32(*s)).sum();
                    mono[f] = sum / ch as f32;
                }
                let written = producer.push_slice(&mono);
                if written < mono.len() {
                    warn!("capture ring full: dropped {} samples", mono.len() - written);
                }
            },
            |err| error!("input stream error: {err}"),
            None,
        )
        .map_err(|e| classify(e.to_string()))
}

// ---------------------------------------------------------------------------
// Output
// ---------------------------------------------------------------------------

/// Counters shared between the scheduling side and the output callback.
#[derive(Default)]
struct OutputClock {
    /// Frames rendered by the callback, silence included.
    rendered: AtomicU64,
    /// Samples taken out of the ring (played or discarded).
    consumed: AtomicU64,
    /// Samples below this ring position are skipped rather than played.
    discard_until: AtomicU64,
}

struct CpalOutput {
    producer: SampleProducer,
    clock: Arc<OutputClock>,
    converter: RateConverter,
    device_rate: u32,
    /// Samples ever pushed into the ring.
    pushed: u64,
    shutdown: Option<Sender<()>>,
    thread: Option<JoinHandle<()>>,
}

impl CpalOutput {
    fn open(chunk_rate: u32) -> Result<Self, DeviceError> {
        let clock = Arc::new(OutputClock::default());
        let (producer, consumer) = create_sample_ring(PLAYBACK_RING_CAPACITY);
        let (ready_tx, ready_rx) = bounded::<Result<u32, DeviceError>>(1);
        let (shutdown_tx, shutdown_rx) = bounded::<()>(1);
        let callback_clock = Arc::clone(&clock);

        let thread = std::thread::Builder::new()
            .name("voxline-output".into())
            .spawn(move || {
                let stream = match build_output_stream(chunk_rate, consumer, callback_clock) {
                    Ok((stream, rate)) => {
                        let _ = ready_tx.send(Ok(rate));
                        stream
                    }
                    Err(e) => {
                        let _ = ready_tx.send(Err(e));
                        return;
                    }
                };
                let _ = shutdown_rx.recv();
                drop(stream);
                debug!("output stream released");
            })
            .map_err(|e| DeviceError::Unavailable(format!("spawning output thread: {e}")))?;

        let device_rate = match ready_rx.recv() {
            Ok(Ok(rate)) => rate,
            Ok(Err(e)) => {
                let _ = thread.join();
                return Err(e);
            }
            Err(_) => {
                let _ = thread.join();
                return Err(DeviceError::Unavailable("output thread exited".into()));
            }
        };

        let converter = RateConverter::new(chunk_rate, device_rate, OUTPUT_RESAMPLE_CHUNK)
            .map_err(|e| DeviceError::Unavailable(e.to_string()));
        let converter = match converter {
            Ok(c) => c,
            Err(e) => {
                let _ = shutdown_tx.send(());
                let _ = thread.join();
                return Err(e);
            }
        };

        Ok(Self {
            producer,
            clock,
            converter,
            device_rate,
            pushed: 0,
            shutdown: Some(shutdown_tx),
            thread: Some(thread),
        })
    }

    /// Device frame at which everything handed to `schedule` so far will
    /// have played: rendered frames, live ring contents, and whatever the
    /// converter still owes.
    fn committed_end(&self) -> u64 {
        let rendered = self.clock.rendered.load(Ordering::Acquire);
        let consumed = self.clock.consumed.load(Ordering::Acquire);
        let discarded = self.clock.discard_until.load(Ordering::Acquire);
        let live = self.pushed.saturating_sub(consumed.max(discarded));
        rendered + live + self.converter.backlog_frames()
    }

    fn push_samples(&mut self, seq: u64, samples: &[f32]) {
        let written = self.producer.push_slice(samples);
        self.pushed += written as u64;
        if written < samples.len() {
            warn!(seq, dropped = samples.len() - written, "playback ring full");
        }
    }

    fn push_silence(&mut self, frames: u64) {
        const ZEROS: [f32; 1024] = [0.0; 1024];
        let mut remaining = frames;
        while remaining > 0 {
            let n = remaining.min(ZEROS.len() as u64) as usize;
            let written = self.producer.push_slice(&ZEROS[..n]);
            self.pushed += written as u64;
            if written < n {
                warn!("playback ring full: gap truncated");
                return;
            }
            remaining -= n as u64;
        }
    }
}

impl OutputDevice for CpalOutput {
    fn now(&self) -> f64 {
        self.clock.rendered.load(Ordering::Acquire) as f64 / self.device_rate as f64
    }

    fn schedule(&mut self, start: f64, chunk: &PlaybackChunk) {
        let gap = lead_in_frames(start, self.device_rate, self.committed_end());
        if gap > 0 {
            self.push_silence(gap);
        }
        let samples = self.converter.process(&chunk.samples);
        self.push_samples(chunk.seq, &samples);
    }

    fn end_of_stream(&mut self) {
        let tail = self.converter.flush();
        if !tail.is_empty() {
            debug!(frames = tail.len(), "resampler tail flushed");
            self.push_samples(u64::MAX, &tail);
        }
    }

    fn flush(&mut self) {
        self.converter.clear();
        self.clock.discard_until.store(self.pushed, Ordering::Release);
    }

    fn close(&mut self) {
        if let Some(shutdown) = self.shutdown.take() {
            let _ = shutdown.send(());
        }
        if let Some(thread) = self.thread.take() {
            if thread.join().is_err() {
                error!("output thread panicked");
            }
            info!("speaker released");
        }
    }
}

impl Drop for CpalOutput {
    fn drop(&mut self) {
        self.close();
    }
}

/// Differences this small between a chunk's start and the end of committed
/// audio are rounding, not gaps.
const ROUNDING_SLACK_FRAMES: u64 = 2;

/// Frames of silence to insert so that a chunk meant to start at `start`
/// seconds really does, given audio already committed up to `committed_end`.
/// Zero when the chunk follows on back-to-back.
fn lead_in_frames(start: f64, device_rate: u32, committed_end: u64) -> u64 {
    let start_frame = (start.max(0.0) * device_rate as f64).round() as u64;
    match start_frame.checked_sub(committed_end) {
        Some(gap) if gap > ROUNDING_SLACK_FRAMES => gap,
        _ => 0,
    }
}

fn build_output_stream(
    preferred_rate: u32,
    consumer: SampleConsumer,
    clock: Arc<OutputClock>,
) -> Result<(cpal::Stream, u32), DeviceError> {
    let host = cpal::default_host();
    let device = host
        .default_output_device()
        .ok_or_else(|| DeviceError::NotFound("no output device".into()))?;

    let wanted = SampleRate(preferred_rate);
    let supported = device
        .supported_output_configs()
        .map_err(|e| classify(e.to_string()))?
        .filter(|c| c.min_sample_rate() <= wanted && c.max_sample_rate() >= wanted)
        .min_by_key(|c| c.channels())
        .map(|c| c.with_sample_rate(wanted));
    let supported = match supported {
        Some(c) => c,
        None => device
            .default_output_config()
            .map_err(|e| classify(e.to_string()))?,
    };

    let sample_rate = supported.sample_rate().0;
    let config = supported.config();
    info!(
        device = device.name().unwrap_or_default().as_str(),
        sample_rate,
        channels = config.channels,
        "output config selected"
    );

    let stream = match supported.sample_format() {
        SampleFormat::F32 => output_stream::<f32>(&device, &config, consumer, clock, |s| s),
        SampleFormat::I16 => output_stream::<i16>(&device, &config, consumer, clock, |s| {
            (s.clamp(-1.0, 1.0) * 32767.0) as i16
        }),
        SampleFormat::U16 => output_stream::<u16>(&device, &config, consumer, clock, |s| {
            ((s.clamp(-1.0, 1.0) + 1.0) * 32767.5) as u16
        }),
        fmt => {
            return Err(DeviceError::Unavailable(format!(
                "unsupported output sample format: {fmt:?}"
            )))
        }
    }?;

    stream.play().map_err(|e| classify(e.to_string()))?;
    Ok((stream, sample_rate))
}

/// Render one mono sample per frame, duplicated across channels; silence on
/// underrun. Discards flushed samples before rendering.
fn output_stream<T>(
    device: &Device,
    config: &StreamConfig,
    mut consumer: SampleConsumer,
    clock: Arc<OutputClock>,
    from_f32: fn(f32) -> T,
) -> Result<cpal::Stream, DeviceError>
where
    T: SizedSample + Copy + Send + 'static,
{
    let ch = config.channels.max(1) as usize;
    device
        .build_output_stream(
            config,
            move |data: &mut [T], _info| {
                let mut consumed = clock.consumed.load(Ordering::Relaxed);
                let discard_until = clock.discard_until.load(Ordering::Acquire);
                if consumed < discard_until {
                    let skipped = consumer.skip((discard_until - consumed) as usize);
                    consumed += skipped as u64;
                }

                let mut frames = 0u64;
                for frame in data.chunks_mut(ch) {
                    let sample = match consumer.try_pop() {
                        Some(s) => {
                            consumed += 1;
                            s
                        }
                        None => 0.0,
                    };
                    let value = from_f32(sample);
                    for out in frame.iter_mut() {
                        *out = value;
                    }
                    frames += 1;
                }

                clock.consumed.store(consumed, Ordering::Relaxed);
                clock.rendered.fetch_add(frames, Ordering::Release);
            },
            |err| error!("output stream error: {err}"),
            None,
        )
        .map_err(|e| classify(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::playback::PlaybackScheduler;

    #[test]
    fn permission_errors_are_classified() {
        assert!(matches!(
            classify("Access denied by the OS".into()),
            DeviceError::PermissionDenied(_)
        ));
        assert!(matches!(
            classify("The requested device is no longer available".into()),
            DeviceError::NotFound(_)
        ));
        assert!(matches!(
            classify("backend hiccup".into()),
            DeviceError::Unavailable(_)
        ));
    }

    #[test]
    fn lead_in_keeps_real_gaps_and_ignores_rounding() {
        assert_eq!(lead_in_frames(1.0, 48_000, 2_000), 46_000);
        assert_eq!(lead_in_frames(0.5, 44_100, 22_049), 0);
        assert_eq!(lead_in_frames(0.5, 44_100, 30_000), 0, "already past start");
        assert_eq!(lead_in_frames(-1.0, 48_000, 0), 0);
    }

    /// Mirror of `CpalOutput::schedule` with the device clock standing still:
    /// returns the silence inserted across back-to-back chunks.
    fn silence_between_back_to_back_chunks(device_rate: u32) -> u64 {
        let mut scheduler = PlaybackScheduler::new(0.05);
        let mut converter = RateConverter::new(24_000, device_rate, OUTPUT_RESAMPLE_CHUNK).unwrap();
        let chunk = vec![0.25f32; 1000];
        let mut pushed = 0u64;
        let mut silence = 0u64;
        for _ in 0..5 {
            let start = scheduler.schedule(0.0, chunk.len() as f64 / 24_000.0);
            let gap = lead_in_frames(start, device_rate, pushed + converter.backlog_frames());
            silence += gap;
            pushed += gap;
            pushed += converter.process(&chunk).len() as u64;
        }
        pushed += converter.flush().len() as u64;
        assert_eq!(
            pushed,
            (5_000.0 * (device_rate as f64 / 24_000.0)).round() as u64,
            "every scheduled frame reaches the ring"
        );
        silence
    }

    #[test]
    fn back_to_back_chunks_stay_gapless_at_48k() {
        assert_eq!(silence_between_back_to_back_chunks(48_000), 0);
    }

    #[test]
    fn back_to_back_chunks_stay_gapless_at_44_1k() {
        assert_eq!(silence_between_back_to_back_chunks(44_100), 0);
    }

    #[test]
    fn matching_rate_needs_no_conversion_or_padding() {
        assert_eq!(silence_between_back_to_back_chunks(24_000), 0);
    }
}
