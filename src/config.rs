//! Configuration management for copilot-speaker.
//!
//! Loads config from YAML files in standard locations and owns the live
//! [`AppConfig`] through [`ConfigStore`], which validates every voice update.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use tracing::{debug, info, warn};

use crate::error::{Result, SpeakerError};

pub const PITCH_RANGE: (f32, f32) = (0.0, 2.0);
pub const SPEED_RANGE: (f32, f32) = (0.1, 10.0);
pub const VOLUME_RANGE: (f32, f32) = (0.0, 1.0);

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct VoiceConfig {
    pub pitch: f32,
    pub speed: f32,
    pub volume: f32,
    pub voice: Option<String>,
}

impl Default for VoiceConfig {
    fn default() -> Self {
        Self {
            pitch: 1.0,
            speed: 1.0,
            volume: 1.0,
            voice: None,
        }
    }
}

impl VoiceConfig {
    /// Check every numeric parameter against its range, reporting the first offender.
    pub fn validate(&self) -> Result<()> {
        check_range("pitch", self.pitch, PITCH_RANGE)?;
        check_range("speed", self.speed, SPEED_RANGE)?;
        check_range("volume", self.volume, VOLUME_RANGE)?;
        Ok(())
    }
}

fn check_range(field: &'static str, value: f32, (min, max): (f32, f32)) -> Result<()> {
    // NaN fails the range check too
    if (min..=max).contains(&value) {
        Ok(())
    } else {
        Err(SpeakerError::InvalidParameter {
            field,
            min,
            max,
            value,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CopilotConfig {
    pub api_url: Option<String>,
    #[serde(skip_serializing)]
    pub api_key: Option<String>,
    pub enabled: bool,
    /// Delay between feed polls while listening.
    pub poll_interval_ms: u64,
    /// Skip a suggestion whose text equals the previously delivered one.
    pub dedupe: bool,
}

impl Default for CopilotConfig {
    fn default() -> Self {
        Self {
            api_url: None,
            api_key: None,
            enabled: false,
            poll_interval_ms: 5000,
            dedupe: false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub voice: VoiceConfig,
    pub real_time_enabled: bool,
    pub copilot: CopilotConfig,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            voice: VoiceConfig::default(),
            real_time_enabled: true,
            copilot: CopilotConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SpeechConfig {
    /// `espeak-ng` or `say`.
    pub backend: String,
}

impl Default for SpeechConfig {
    fn default() -> Self {
        let backend = if cfg!(target_os = "macos") {
            "say"
        } else {
            "espeak-ng"
        };
        Self {
            backend: backend.into(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ApiConfig {
    pub enabled: bool,
    pub port: u16,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            port: 8768,
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Config {
    #[serde(flatten)]
    pub app: AppConfig,
    pub speech: SpeechConfig,
    pub api: ApiConfig,
}

impl Config {
    /// Load configuration from YAML file.
    ///
    /// Searches standard locations if no path is provided:
    /// 1. ./config.yaml
    /// 2. ~/.config/copilot-speaker/config.yaml
    /// 3. /etc/copilot-speaker/config.yaml
    pub fn load(path: Option<&Path>) -> Self {
        let resolved = path.map(PathBuf::from).or_else(|| {
            let candidates = [
                std::env::current_dir().ok().map(|d| d.join("config.yaml")),
                dirs::home_dir().map(|h| h.join(".config/copilot-speaker/config.yaml")),
                Some(PathBuf::from("/etc/copilot-speaker/config.yaml")),
            ];
            candidates.into_iter().flatten().find(|p| p.exists())
        });

        let Some(config_path) = resolved else {
            info!("No config file found, using defaults");
            return Self::default();
        };

        match std::fs::read_to_string(&config_path) {
            Ok(contents) => match serde_yml::from_str(&contents) {
                Ok(config) => {
                    info!("Loaded config from {}", config_path.display());
                    config
                }
                Err(e) => {
                    warn!("Failed to parse {}: {e}, using defaults", config_path.display());
                    Self::default()
                }
            },
            Err(e) => {
                warn!("Failed to read {}: {e}, using defaults", config_path.display());
                Self::default()
            }
        }
    }
}

/// Partial voice update. `None` fields keep their current value.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct VoiceConfigUpdate {
    pub pitch: Option<f32>,
    pub speed: Option<f32>,
    pub volume: Option<f32>,
    pub voice: Option<String>,
}

impl VoiceConfigUpdate {
    fn apply_to(self, base: &VoiceConfig) -> VoiceConfig {
        VoiceConfig {
            pitch: self.pitch.unwrap_or(base.pitch),
            speed: self.speed.unwrap_or(base.speed),
            volume: self.volume.unwrap_or(base.volume),
            voice: self.voice.or_else(|| base.voice.clone()),
        }
    }
}

/// Partial suggestion-source update. `None` fields keep their current value.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct CopilotConfigUpdate {
    pub api_url: Option<String>,
    pub api_key: Option<String>,
    pub enabled: Option<bool>,
    pub poll_interval_ms: Option<u64>,
    pub dedupe: Option<bool>,
}

impl CopilotConfigUpdate {
    fn apply_to(self, base: &CopilotConfig) -> CopilotConfig {
        CopilotConfig {
            api_url: self.api_url.or_else(|| base.api_url.clone()),
            api_key: self.api_key.or_else(|| base.api_key.clone()),
            enabled: self.enabled.unwrap_or(base.enabled),
            poll_interval_ms: self.poll_interval_ms.unwrap_or(base.poll_interval_ms),
            dedupe: self.dedupe.unwrap_or(base.dedupe),
        }
    }
}

/// Owner of the live [`AppConfig`].
///
/// Reads hand out snapshots; writes go through the update methods only.
pub struct ConfigStore {
    config: Mutex<AppConfig>,
}

impl ConfigStore {
    pub fn new(config: AppConfig) -> Result<Self> {
        config.voice.validate()?;
        Ok(Self {
            config: Mutex::new(config),
        })
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, AppConfig> {
        // The config is plain data; a poisoned lock still holds a consistent value.
        self.config.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn config(&self) -> AppConfig {
        self.lock().clone()
    }

    /// Merge `update` over the current voice config. On a range violation the
    /// stored config is left untouched.
    pub fn update_voice(&self, update: VoiceConfigUpdate) -> Result<VoiceConfig> {
        let mut config = self.lock();
        let merged = update.apply_to(&config.voice);
        merged.validate()?;
        debug!("Voice config updated: {merged:?}");
        config.voice = merged.clone();
        Ok(merged)
    }

    pub fn update_copilot(&self, update: CopilotConfigUpdate) -> CopilotConfig {
        let mut config = self.lock();
        config.copilot = update.apply_to(&config.copilot);
        config.copilot.clone()
    }

    pub fn set_real_time_enabled(&self, enabled: bool) {
        self.lock().real_time_enabled = enabled;
    }
}
