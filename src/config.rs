//! Persisted user settings and engine tuning knobs

use crate::llm::GenerationOptions;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

pub const DEFAULT_SERVER_URL: &str = "http://localhost:11434";

/// User-facing settings persisted as JSON under the config directory.
///
/// Unknown and missing fields both deserialize to defaults, so settings files
/// written by older or newer builds always load.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    /// Base URL of the local inference server
    pub server_url: String,
    /// Model used when a conversation has no model of its own
    pub default_model: Option<String>,
    /// Sampling parameters applied to every request
    pub default_params: GenerationOptions,
    /// Route every request to the local provider regardless of model
    pub local_only: bool,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            server_url: DEFAULT_SERVER_URL.to_string(),
            default_model: None,
            default_params: GenerationOptions::default(),
            local_only: false,
        }
    }
}

impl Settings {
    /// Settings file location: `$XDG_CONFIG_HOME/freshet/settings.json`,
    /// falling back to `~/.config/freshet/settings.json`.
    pub fn path() -> PathBuf {
        let base = std::env::var("XDG_CONFIG_HOME")
            .map(PathBuf::from)
            .unwrap_or_else(|_| {
                let home = std::env::var("HOME").unwrap_or_else(|_| "/tmp".to_string());
                PathBuf::from(home).join(".config")
            });
        base.join("freshet").join("settings.json")
    }

    /// Load settings from disk. A missing or unreadable file yields defaults;
    /// corrupt JSON is logged and replaced by defaults rather than failing
    /// startup.
    pub fn load() -> Self {
        Self::load_from(&Self::path())
    }

    pub fn load_from(path: &std::path::Path) -> Self {
        match std::fs::read_to_string(path) {
            Ok(raw) => match serde_json::from_str(&raw) {
                Ok(settings) => settings,
                Err(e) => {
                    tracing::warn!(path = %path.display(), error = %e, "Ignoring corrupt settings file");
                    Self::default()
                }
            },
            Err(_) => Self::default(),
        }
    }

    pub fn save(&self) -> std::io::Result<()> {
        self.save_to(&Self::path())
    }

    pub fn save_to(&self, path: &std::path::Path) -> std::io::Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let raw = serde_json::to_string_pretty(self).map_err(std::io::Error::other)?;
        std::fs::write(path, raw)
    }

    /// Apply environment overrides on top of the loaded file.
    pub fn apply_env(mut self) -> Self {
        if let Ok(url) = std::env::var("FRESHET_SERVER_URL") {
            if !url.is_empty() {
                self.server_url = url;
            }
        }
        if let Ok(model) = std::env::var("FRESHET_DEFAULT_MODEL") {
            if !model.is_empty() {
                self.default_model = Some(model);
            }
        }
        self
    }
}

/// Tuning for the background title job
#[derive(Debug, Clone)]
pub struct TitleConfig {
    /// Small models to prefer for titling, in order
    pub preferred_models: Vec<String>,
    /// Substrings that mark a conversation model as too heavy for titling
    pub heavyweight_markers: Vec<String>,
    /// How much of the first user message to quote in the title prompt
    pub max_excerpt: usize,
    /// Hard cap on the generated title length, in characters
    pub max_length: usize,
    /// Only title conversations at most this many messages long
    pub max_transcript_len: usize,
    pub timeout: Duration,
}

impl Default for TitleConfig {
    fn default() -> Self {
        Self {
            preferred_models: vec![
                "llama3.2:1b".to_string(),
                "llama3.2:3b".to_string(),
                "qwen2.5:0.5b".to_string(),
            ],
            heavyweight_markers: vec![
                "70b".to_string(),
                "72b".to_string(),
                "405b".to_string(),
                ":32b".to_string(),
            ],
            max_excerpt: 400,
            max_length: 60,
            max_transcript_len: 5,
            timeout: Duration::from_secs(60),
        }
    }
}

/// Timing and capacity knobs for the streaming engine.
///
/// The defaults match interactive use; tests shrink the intervals to keep
/// paused-clock runs fast.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Cadence of the drip buffer's release tick
    pub drip_interval: Duration,
    /// Wall-clock ceiling on a generation session
    pub generation_timeout: Duration,
    /// How long an edit waits for the previous session to tear down
    pub teardown_wait: Duration,
    /// Capacity of the shared stream signal bus
    pub bus_capacity: usize,
    /// Messages hydrated when resuming a stored conversation
    pub history_limit: usize,
    pub title: TitleConfig,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            drip_interval: Duration::from_millis(30),
            generation_timeout: Duration::from_secs(60),
            teardown_wait: Duration::from_secs(5),
            bus_capacity: 256,
            history_limit: 200,
            title: TitleConfig::default(),
        }
    }
}
