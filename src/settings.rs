use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::audio::{CaptureConfig, CAPTURE_SAMPLE_RATE, FRAME_SAMPLES, OUTPUT_SAMPLE_RATE};
use crate::streaming::{LiveConfig, DEFAULT_LIVE_MODEL, DEFAULT_VOICE, LIVE_API_URL};

const APP_DIR_NAME: &str = "livecall";
const SETTINGS_FILE_NAME: &str = "settings.json";

/// Environment variables checked for the API key, in order
pub const API_KEY_VARS: [&str; 5] = [
    "GEMINI_API_KEY",
    "API_KEY",
    "VITE_API_KEY",
    "REACT_APP_API_KEY",
    "NEXT_PUBLIC_API_KEY",
];

pub const DEFAULT_TEXT_MODEL: &str = "gemini-2.5-flash";
pub const DEFAULT_TTS_MODEL: &str = "gemini-2.5-flash-preview-tts";
pub const DEFAULT_REST_ENDPOINT: &str = "https://generativelanguage.googleapis.com/v1beta";

#[derive(Debug, thiserror::Error)]
pub enum SettingsError {
    #[error("Could not determine config directory")]
    NoConfigDir,
    #[error("Failed to read settings {path:?}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("Failed to parse settings {path:?}: {source}")]
    Parse {
        path: PathBuf,
        source: serde_json::Error,
    },
    #[error("Serialize settings: {0}")]
    Serialize(serde_json::Error),
    #[error("Write settings {path:?}: {source}")]
    Write {
        path: PathBuf,
        source: std::io::Error,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AppSettings {
    /// Model used for live voice sessions.
    pub live_model: String,

    /// Prebuilt voice for live sessions and one-shot speech.
    pub voice_name: String,

    /// WebSocket endpoint of the live service.
    pub live_endpoint: String,

    /// Model used for text replies.
    pub text_model: String,

    /// Model used for one-shot speech synthesis.
    pub tts_model: String,

    /// Base URL of the REST API.
    pub rest_endpoint: String,

    /// Attach web search grounding to text requests.
    pub search_enabled: bool,

    /// Instruction used when a session is started without one.
    pub default_instruction: String,

    pub input_sample_rate: u32,
    pub output_sample_rate: u32,

    /// Samples per outbound microphone frame.
    pub frame_samples: usize,

    /// Level meter refresh interval (~30 fps).
    pub meter_interval_ms: u64,

    pub connect_timeout_secs: u64,
    pub setup_timeout_secs: u64,

    /// Handshake attempts before giving up (transient failures only).
    pub connect_retries: u32,

    /// Timeout for REST requests.
    pub request_timeout_secs: u64,
}

impl Default for AppSettings {
    fn default() -> Self {
        Self {
            live_model: DEFAULT_LIVE_MODEL.to_string(),
            voice_name: DEFAULT_VOICE.to_string(),
            live_endpoint: LIVE_API_URL.to_string(),
            text_model: DEFAULT_TEXT_MODEL.to_string(),
            tts_model: DEFAULT_TTS_MODEL.to_string(),
            rest_endpoint: DEFAULT_REST_ENDPOINT.to_string(),
            search_enabled: true,
            default_instruction: "You are a helpful assistant. Keep spoken answers short and natural."
                .to_string(),
            input_sample_rate: CAPTURE_SAMPLE_RATE,
            output_sample_rate: OUTPUT_SAMPLE_RATE,
            frame_samples: FRAME_SAMPLES,
            meter_interval_ms: 33,
            connect_timeout_secs: 10,
            setup_timeout_secs: 5,
            connect_retries: 3,
            request_timeout_secs: 60,
        }
    }
}

impl AppSettings {
    /// Live session parameters for this configuration
    pub fn live_config(&self, api_key: impl Into<String>) -> LiveConfig {
        LiveConfig {
            endpoint: self.live_endpoint.clone(),
            model: self.live_model.clone(),
            voice: self.voice_name.clone(),
            input_sample_rate: self.input_sample_rate,
            output_sample_rate: self.output_sample_rate,
            connect_timeout: Duration::from_secs(self.connect_timeout_secs),
            setup_timeout: Duration::from_secs(self.setup_timeout_secs),
            max_retries: self.connect_retries,
            ..LiveConfig::new(api_key)
        }
    }

    pub fn capture_config(&self) -> CaptureConfig {
        CaptureConfig {
            sample_rate: self.input_sample_rate,
            frame_samples: self.frame_samples,
        }
    }

    pub fn meter_interval(&self) -> Duration {
        Duration::from_millis(self.meter_interval_ms.max(1))
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }
}

/// `<config_dir>/livecall/settings.json`
pub fn settings_path() -> Result<PathBuf, SettingsError> {
    let dir = dirs::config_dir().ok_or(SettingsError::NoConfigDir)?;
    Ok(dir.join(APP_DIR_NAME).join(SETTINGS_FILE_NAME))
}

/// Load settings from the default location, falling back to defaults.
pub fn load_settings() -> AppSettings {
    let path = match settings_path() {
        Ok(p) => p,
        Err(e) => {
            log::warn!("Settings: {}", e);
            return AppSettings::default();
        }
    };

    match load_settings_from(&path) {
        Ok(settings) => settings,
        Err(e) => {
            log::warn!("Settings: {}", e);
            AppSettings::default()
        }
    }
}

/// Load settings from `path`. A missing file yields defaults.
pub fn load_settings_from(path: &Path) -> Result<AppSettings, SettingsError> {
    match std::fs::read_to_string(path) {
        Ok(contents) => {
            serde_json::from_str::<AppSettings>(&contents).map_err(|source| SettingsError::Parse {
                path: path.to_path_buf(),
                source,
            })
        }
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(AppSettings::default()),
        Err(source) => Err(SettingsError::Read {
            path: path.to_path_buf(),
            source,
        }),
    }
}

/// Write settings atomically: temp file in the same directory, then rename.
pub fn save_settings_to(path: &Path, settings: &AppSettings) -> Result<(), SettingsError> {
    let write_err = |path: &Path| {
        let path = path.to_path_buf();
        move |source| SettingsError::Write { path, source }
    };

    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).map_err(write_err(parent))?;
    }

    let contents = serde_json::to_string_pretty(settings).map_err(SettingsError::Serialize)?;

    let tmp_path = path.with_extension("json.tmp");
    std::fs::write(&tmp_path, &contents).map_err(write_err(&tmp_path))?;

    // Windows refuses to rename over an existing file
    if cfg!(windows) && path.exists() {
        if let Err(e) = std::fs::remove_file(path) {
            if e.kind() != std::io::ErrorKind::NotFound {
                return Err(write_err(path)(e));
            }
        }
    }

    std::fs::rename(&tmp_path, path).map_err(write_err(path))?;
    Ok(())
}

/// API key from the first non-empty variable in [`API_KEY_VARS`]
pub fn get_api_key() -> Option<String> {
    api_key_from(|name| std::env::var(name).ok())
}

pub fn is_api_key_configured() -> bool {
    get_api_key().is_some()
}

fn api_key_from(lookup: impl Fn(&str) -> Option<String>) -> Option<String> {
    API_KEY_VARS
        .iter()
        .filter_map(|name| lookup(name))
        .map(|key| key.trim().to_string())
        .find(|key| !key.is_empty())
}
