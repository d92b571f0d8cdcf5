//! Persistent host settings (JSON file in the app data directory).

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use voxline_core::{EngineConfig, WebSocketConfig};

pub const ENV_API_KEY: &str = "VOXLINE_API_KEY";
pub const ENV_ENDPOINT: &str = "VOXLINE_ENDPOINT";
pub const ENV_MODEL: &str = "VOXLINE_MODEL";

const VOICES: &[&str] = &[
    "Puck", "Charon", "Kore", "Fenrir", "Aoede", "Leda", "Orus", "Zephyr",
];

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
#[serde(default)]
pub struct AppSettings {
    pub api_key: Option<String>,
    pub endpoint: String,
    pub model: String,
    pub voice_name: String,
    pub system_instruction: String,
    pub preferred_input_device: Option<String>,
    pub volume_gain: f32,
    pub handshake_timeout_secs: u64,
    pub outbound_queue_frames: usize,
}

impl Default for AppSettings {
    fn default() -> Self {
        let core = EngineConfig::default();
        let ws = WebSocketConfig::default();
        Self {
            api_key: None,
            endpoint: ws.endpoint,
            model: ws.model,
            voice_name: core.voice_name,
            system_instruction: core.system_instruction,
            preferred_input_device: None,
            volume_gain: core.volume_gain,
            handshake_timeout_secs: core.handshake_timeout.as_secs(),
            outbound_queue_frames: core.outbound_capacity,
        }
    }
}

impl AppSettings {
    pub fn normalize(&mut self) {
        let defaults = Self::default();

        self.api_key = trimmed(self.api_key.take());
        self.preferred_input_device = trimmed(self.preferred_input_device.take());

        self.endpoint = self.endpoint.trim().to_string();
        if !(self.endpoint.starts_with("wss://") || self.endpoint.starts_with("ws://")) {
            self.endpoint = defaults.endpoint;
        }

        self.model = normalize_model(&self.model);
        self.voice_name = normalize_voice_name(&self.voice_name);

        self.system_instruction = self.system_instruction.trim().to_string();
        if self.system_instruction.is_empty() {
            self.system_instruction = defaults.system_instruction;
        }

        self.volume_gain = if self.volume_gain.is_finite() {
            self.volume_gain.clamp(1.0, 20.0)
        } else {
            defaults.volume_gain
        };
        self.handshake_timeout_secs = self.handshake_timeout_secs.clamp(1, 120);
        self.outbound_queue_frames = self.outbound_queue_frames.clamp(4, 1024);
    }

    /// Engine configuration for a live session.
    pub fn engine_config(&self) -> EngineConfig {
        EngineConfig {
            voice_name: self.voice_name.clone(),
            system_instruction: self.system_instruction.clone(),
            preferred_input_device: self.preferred_input_device.clone(),
            volume_gain: self.volume_gain,
            handshake_timeout: Duration::from_secs(self.handshake_timeout_secs),
            outbound_capacity: self.outbound_queue_frames,
            ..EngineConfig::default()
        }
    }
}

fn trimmed(value: Option<String>) -> Option<String> {
    value
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

/// Bare model ids get the `models/` prefix the backend expects.
pub fn normalize_model(raw: &str) -> String {
    let model = raw.trim();
    if model.is_empty() {
        WebSocketConfig::default().model
    } else if model.starts_with("models/") {
        model.to_string()
    } else {
        format!("models/{model}")
    }
}

/// Case-insensitive match against the prebuilt voices; unknown names fall
/// back to the default voice.
pub fn normalize_voice_name(raw: &str) -> String {
    let wanted = raw.trim();
    VOICES
        .iter()
        .find(|v| v.eq_ignore_ascii_case(wanted))
        .map(|v| (*v).to_string())
        .unwrap_or_else(|| EngineConfig::default().voice_name)
}

/// Export connection settings to the environment, without overriding
/// anything already set there.
pub fn apply_runtime_env_from_settings(settings: &AppSettings) {
    if std::env::var(ENV_API_KEY).is_err() {
        if let Some(key) = settings.api_key.as_ref() {
            std::env::set_var(ENV_API_KEY, key);
        }
    }
    if std::env::var(ENV_ENDPOINT).is_err() {
        std::env::set_var(ENV_ENDPOINT, &settings.endpoint);
    }
    if std::env::var(ENV_MODEL).is_err() {
        std::env::set_var(ENV_MODEL, &settings.model);
    }
}

/// Backend connection from the runtime environment.
pub fn websocket_config_from_env() -> WebSocketConfig {
    let defaults = WebSocketConfig::default();
    let var = |name: &str| {
        std::env::var(name)
            .ok()
            .map(|v| v.trim().to_string())
            .filter(|v| !v.is_empty())
    };
    WebSocketConfig {
        endpoint: var(ENV_ENDPOINT).unwrap_or(defaults.endpoint),
        api_key: var(ENV_API_KEY),
        model: var(ENV_MODEL)
            .map(|m| normalize_model(&m))
            .unwrap_or(defaults.model),
    }
}

/// `<data dir>/voxline`.
pub fn default_data_dir() -> PathBuf {
    #[cfg(target_os = "windows")]
    {
        std::env::var_os("APPDATA")
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from("."))
            .join("Lattice Labs")
            .join("Voxline")
    }
    #[cfg(not(target_os = "windows"))]
    {
        std::env::var_os("XDG_DATA_HOME")
            .map(PathBuf::from)
            .unwrap_or_else(|| {
                std::env::var_os("HOME")
                    .map(PathBuf::from)
                    .unwrap_or_else(|| PathBuf::from("/tmp"))
                    .join(".local")
                    .join("share")
            })
            .join("voxline")
    }
}

pub fn default_settings_path() -> PathBuf {
    default_data_dir().join("settings.json")
}

pub fn load_settings(path: &Path) -> AppSettings {
    let mut settings = fs::read_to_string(path)
        .ok()
        .and_then(|raw| serde_json::from_str::<AppSettings>(&raw).ok())
        .unwrap_or_default();
    settings.normalize();
    settings
}

pub fn save_settings(path: &Path, settings: &AppSettings) -> std::io::Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    let json = serde_json::to_string_pretty(settings).map_err(std::io::Error::other)?;
    fs::write(path, json)
}
