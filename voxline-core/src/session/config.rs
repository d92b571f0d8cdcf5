use std::time::Duration;

/// Configuration for `SessionManager`.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Rate of outbound audio (Hz). Default: 16000.
    pub capture_sample_rate: u32,
    /// Samples per capture frame. Default: 4096 (≈ 256 ms at 16 kHz).
    pub frame_samples: usize,
    /// Rate of inbound assistant audio (Hz). Default: 24000.
    pub output_sample_rate: u32,
    /// Prebuilt voice requested from the backend.
    pub voice_name: String,
    /// System instruction sent when the session opens.
    pub system_instruction: String,
    /// How long to wait for the backend to acknowledge the session.
    /// Default: 10 s.
    pub handshake_timeout: Duration,
    /// Outbound audio queue capacity in frames. Default: 64 (≈ 16 s).
    pub outbound_capacity: usize,
    /// Speaking clears once the device clock is this close to the end of
    /// the queued audio. Default: 50 ms.
    pub drain_tolerance: Duration,
    /// How often the speaking flag is re-evaluated. Default: 50 ms.
    pub poll_interval: Duration,
    /// RMS multiplier for the UI volume meter. Default: 5.0.
    pub volume_gain: f32,
    /// Exact input device name; `None` uses the system default.
    pub preferred_input_device: Option<String>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            capture_sample_rate: 16_000,
            frame_samples: 4096,
            output_sample_rate: 24_000,
            voice_name: "Puck".into(),
            system_instruction: "You are a friendly intake assistant. Interview the applicant \
                about their situation, then call submit_application with your assessment."
                .into(),
            handshake_timeout: Duration::from_secs(10),
            outbound_capacity: 64,
            drain_tolerance: Duration::from_millis(50),
            poll_interval: Duration::from_millis(50),
            volume_gain: 5.0,
            preferred_input_device: None,
        }
    }
}
