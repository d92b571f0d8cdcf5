//! Fake hardware and backend shared by the integration tests.

#![allow(dead_code)]

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use parking_lot::Mutex;
use voxline_core::audio::device::{
    AudioHost, InputDevice, InputRequest, OutputDevice, OutputRequest, SampleSink,
};
use voxline_core::buffering::PlaybackChunk;
use voxline_core::error::{ConnectionError, DeviceError};
use voxline_core::tools::ToolInvocation;
use voxline_core::transport::{
    open_link, Control, LinkEnds, SessionConfig, Transport, TransportHandle,
};
use voxline_core::ConnectionEvent;

/// Which step touched what, in order.
pub type CallLog = Arc<Mutex<Vec<&'static str>>>;

// ── Audio ───────────────────────────────────────────────────────────────────

#[derive(Default)]
pub struct OutputRecord {
    pub clock: f64,
    pub scheduled: Vec<(f64, usize)>,
    /// `end_of_stream` calls.
    pub ends: usize,
    pub flushes: usize,
    pub closes: usize,
}

pub struct FakeHost {
    pub log: CallLog,
    pub input_error: Option<DeviceError>,
    pub output: Arc<Mutex<OutputRecord>>,
    pub sink: Arc<Mutex<Option<SampleSink>>>,
    pub streaming: Arc<AtomicBool>,
    pub input_stops: Arc<AtomicUsize>,
}

impl FakeHost {
    pub fn new(log: CallLog) -> Self {
        Self {
            log,
            input_error: None,
            output: Arc::new(Mutex::new(OutputRecord::default())),
            sink: Arc::new(Mutex::new(None)),
            streaming: Arc::new(AtomicBool::new(false)),
            input_stops: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub fn denying_microphone(log: CallLog) -> Self {
        Self {
            input_error: Some(DeviceError::PermissionDenied("microphone blocked".into())),
            ..Self::new(log)
        }
    }

    /// Deliver microphone samples the way the drain thread would: only
    /// while the gate is open.
    pub fn speak(&self, samples: &[f32]) {
        if !self.streaming.load(Ordering::Acquire) {
            return;
        }
        if let Some(sink) = self.sink.lock().as_mut() {
            sink(samples);
        }
    }

    pub fn set_clock(&self, seconds: f64) {
        self.output.lock().clock = seconds;
    }
}

impl AudioHost for FakeHost {
    fn open_output(&self, _request: &OutputRequest) -> Result<Box<dyn OutputDevice>, DeviceError> {
        self.log.lock().push("output");
        Ok(Box::new(FakeOutput(Arc::clone(&self.output))))
    }

    fn open_input(
        &self,
        _request: &InputRequest,
        sink: SampleSink,
    ) -> Result<Box<dyn InputDevice>, DeviceError> {
        self.log.lock().push("input");
        if let Some(err) = self.input_error.clone() {
            return Err(err);
        }
        *self.sink.lock() = Some(sink);
        Ok(Box::new(FakeInput {
            streaming: Arc::clone(&self.streaming),
            stops: Arc::clone(&self.input_stops),
            sink: Arc::clone(&self.sink),
        }))
    }
}

struct FakeOutput(Arc<Mutex<OutputRecord>>);

impl OutputDevice for FakeOutput {
    fn now(&self) -> f64 {
        self.0.lock().clock
    }

    fn schedule(&mut self, start: f64, chunk: &PlaybackChunk) {
        self.0.lock().scheduled.push((start, chunk.samples.len()));
    }

    fn end_of_stream(&mut self) {
        self.0.lock().ends += 1;
    }

    fn flush(&mut self) {
        self.0.lock().flushes += 1;
    }

    fn close(&mut self) {
        self.0.lock().closes += 1;
    }
}

struct FakeInput {
    streaming: Arc<AtomicBool>,
    stops: Arc<AtomicUsize>,
    sink: Arc<Mutex<Option<SampleSink>>>,
}

impl InputDevice for FakeInput {
    fn set_streaming(&self, enabled: bool) {
        self.streaming.store(enabled, Ordering::Release);
    }

    fn stop(&mut self) {
        self.streaming.store(false, Ordering::Release);
        self.sink.lock().take();
        self.stops.fetch_add(1, Ordering::SeqCst);
    }
}

// ── Backend ─────────────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub enum Handshake {
    /// Acknowledge the session right away.
    Ack,
    /// Accept the connection but never acknowledge.
    Silent,
    /// Refuse the connection.
    Refuse(String),
    /// Ask for a tool call, then acknowledge.
    ToolCallFirst(ToolInvocation),
}

pub struct FakeTransport {
    pub log: CallLog,
    pub handshake: Handshake,
    pub connects: AtomicUsize,
    pub ends: Arc<Mutex<Option<LinkEnds>>>,
    pub last_config: Arc<Mutex<Option<SessionConfig>>>,
}

impl FakeTransport {
    pub fn new(log: CallLog, handshake: Handshake) -> Self {
        Self {
            log,
            handshake,
            connects: AtomicUsize::new(0),
            ends: Arc::new(Mutex::new(None)),
            last_config: Arc::new(Mutex::new(None)),
        }
    }

    pub fn connects(&self) -> usize {
        self.connects.load(Ordering::SeqCst)
    }

    /// Push an inbound event as if the backend sent it.
    pub fn emit(&self, event: ConnectionEvent) {
        if let Some(ends) = self.ends.lock().as_ref() {
            ends.events.emit(event);
        }
    }

    pub fn sent_frames(&self) -> Vec<voxline_core::buffering::EncodedFrame> {
        let mut out = Vec::new();
        if let Some(ends) = self.ends.lock().as_mut() {
            while let Ok(frame) = ends.audio.try_recv() {
                out.push(frame);
            }
        }
        out
    }

    pub fn sent_controls(&self) -> Vec<Control> {
        let mut out = Vec::new();
        if let Some(ends) = self.ends.lock().as_mut() {
            while let Ok(control) = ends.control.try_recv() {
                out.push(control);
            }
        }
        out
    }
}

#[async_trait]
impl Transport for FakeTransport {
    async fn connect(&self, config: &SessionConfig) -> Result<TransportHandle, ConnectionError> {
        self.log.lock().push("transport");
        self.connects.fetch_add(1, Ordering::SeqCst);
        *self.last_config.lock() = Some(config.clone());

        if let Handshake::Refuse(reason) = &self.handshake {
            return Err(ConnectionError::Handshake(reason.clone()));
        }

        let (handle, ends) = open_link(config.outbound_capacity);
        match &self.handshake {
            Handshake::Ack => {
                ends.events.emit(ConnectionEvent::Opened);
            }
            Handshake::ToolCallFirst(invocation) => {
                ends.events
                    .emit(ConnectionEvent::ToolCall(vec![invocation.clone()]));
                ends.events.emit(ConnectionEvent::Opened);
            }
            Handshake::Silent | Handshake::Refuse(_) => {}
        }
        *self.ends.lock() = Some(ends);
        Ok(handle)
    }
}

// ── Helpers ─────────────────────────────────────────────────────────────────

/// Poll `cond` until it holds, yielding to the runtime in between.
pub async fn wait_for(what: &str, cond: impl Fn() -> bool) {
    let deadline = Instant::now() + Duration::from_secs(2);
    while !cond() {
        if Instant::now() >= deadline {
            panic!("timed out waiting for {what}");
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}

/// `samples` of silence as PCM16 LE bytes.
pub fn silent_pcm(samples: usize) -> Vec<u8> {
    vec![0u8; samples * 2]
}
