use serde::Deserialize;
use std::fs;
use std::path::Path;
use std::time::Duration;

use crate::error::ConfigError;

pub const DEFAULT_CONFIG_PATH: &str = "sop-voice.toml";

#[derive(Debug, Clone, Deserialize, Default)]
pub struct Config {
    #[serde(default)]
    pub recognition: RecognitionConfig,
    #[serde(default)]
    pub commands: CommandsConfig,
    #[serde(default)]
    pub normalizer: NormalizerConfig,
}

// ============================================================================
// Recognition Config
// ============================================================================

#[derive(Debug, Clone, Deserialize)]
pub struct RecognitionConfig {
    /// Ceiling on total active listening time before auto-stop
    #[serde(default = "default_max_listening_ms")]
    pub max_listening_ms: u64,

    /// Stop when nothing is heard for this long
    #[serde(default = "default_max_silence_ms")]
    pub max_silence_ms: u64,

    /// Retries allowed before a transient error becomes fatal
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,

    #[serde(default = "default_base_retry_delay_ms")]
    pub base_retry_delay_ms: u64,

    /// Growth of the retry delay per attempt
    #[serde(default = "default_backoff_multiplier")]
    pub backoff_multiplier: f64,

    /// Upper bound of the random delay added to each retry
    #[serde(default = "default_retry_jitter_ms")]
    pub retry_jitter_ms: u64,

    /// Restart the engine after each finalized utterance
    #[serde(default)]
    pub continuous: bool,
}

impl Default for RecognitionConfig {
    fn default() -> Self {
        Self {
            max_listening_ms: default_max_listening_ms(),
            max_silence_ms: default_max_silence_ms(),
            max_retries: default_max_retries(),
            base_retry_delay_ms: default_base_retry_delay_ms(),
            backoff_multiplier: default_backoff_multiplier(),
            retry_jitter_ms: default_retry_jitter_ms(),
            continuous: false,
        }
    }
}

impl RecognitionConfig {
    pub fn max_listening(&self) -> Duration {
        Duration::from_millis(self.max_listening_ms)
    }

    pub fn max_silence(&self) -> Duration {
        Duration::from_millis(self.max_silence_ms)
    }

    pub fn base_retry_delay(&self) -> Duration {
        Duration::from_millis(self.base_retry_delay_ms)
    }
}

fn default_max_listening_ms() -> u64 {
    60_000
}

fn default_max_silence_ms() -> u64 {
    10_000
}

fn default_max_retries() -> u32 {
    5
}

fn default_base_retry_delay_ms() -> u64 {
    1_500
}

fn default_backoff_multiplier() -> f64 {
    1.5
}

fn default_retry_jitter_ms() -> u64 {
    500
}

// ============================================================================
// Commands Config
// ============================================================================

#[derive(Debug, Clone, Deserialize)]
pub struct CommandsConfig {
    /// Window in which a follow-up utterance continues the previous one
    #[serde(default = "default_pause_timeout_ms")]
    pub pause_timeout_ms: u64,

    /// Minimum keyword ratio for a fuzzy match (inclusive)
    #[serde(default = "default_fuzzy_threshold")]
    pub fuzzy_threshold: f32,

    /// Register the built-in SOP editing commands
    #[serde(default = "default_enable_builtin")]
    pub enable_builtin: bool,
}

impl Default for CommandsConfig {
    fn default() -> Self {
        Self {
            pause_timeout_ms: default_pause_timeout_ms(),
            fuzzy_threshold: default_fuzzy_threshold(),
            enable_builtin: default_enable_builtin(),
        }
    }
}

impl CommandsConfig {
    pub fn pause_timeout(&self) -> Duration {
        Duration::from_millis(self.pause_timeout_ms)
    }
}

fn default_pause_timeout_ms() -> u64 {
    5_000
}

fn default_fuzzy_threshold() -> f32 {
    0.7
}

fn default_enable_builtin() -> bool {
    true
}

// ============================================================================
// Normalizer Config
// ============================================================================

#[derive(Debug, Clone, Deserialize, Default)]
pub struct NormalizerConfig {
    /// Extra mishearing corrections, applied after the built-in table
    #[serde(default)]
    pub corrections: Vec<Correction>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Correction {
    pub heard: String,
    pub meant: String,
}

impl Config {
    /// Load from `sop-voice.toml` in the working directory
    pub fn load() -> Result<Self, ConfigError> {
        Self::load_from(Path::new(DEFAULT_CONFIG_PATH))
    }

    /// Load from `path`; a missing file yields the defaults
    pub fn load_from(path: &Path) -> Result<Self, ConfigError> {
        if !path.exists() {
            log::debug!("[config] {} not found, using defaults", path.display());
            return Ok(Self::default());
        }

        let text = fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        let config: Config = toml::from_str(&text).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let threshold = self.commands.fuzzy_threshold;
        if !(0.0..=1.0).contains(&threshold) {
            return Err(ConfigError::Invalid(format!(
                "fuzzy_threshold must be within 0.0..=1.0, got {}",
                threshold
            )));
        }
        if self.recognition.backoff_multiplier < 1.0 {
            return Err(ConfigError::Invalid(format!(
                "backoff_multiplier must be at least 1.0, got {}",
                self.recognition.backoff_multiplier
            )));
        }
        if self
            .normalizer
            .corrections
            .iter()
            .any(|c| c.heard.trim().is_empty())
        {
            return Err(ConfigError::Invalid(
                "corrections must not have an empty `heard` phrase".to_string(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = Config::default();
        assert_eq!(config.recognition.max_listening_ms, 60_000);
        assert_eq!(config.recognition.max_silence_ms, 10_000);
        assert_eq!(config.recognition.max_retries, 5);
        assert_eq!(config.recognition.base_retry_delay_ms, 1_500);
        assert_eq!(config.commands.pause_timeout_ms, 5_000);
        assert!((config.commands.fuzzy_threshold - 0.7).abs() < f32::EPSILON);
        assert!(!config.recognition.continuous);
    }

    #[test]
    fn test_partial_toml_keeps_defaults() {
        let text = r#"
            [recognition]
            continuous = true
            max_silence_ms = 4000

            [[normalizer.corrections]]
            heard = "add steep"
            meant = "add step"
        "#;
        let config: Config = toml::from_str(text).unwrap();
        assert!(config.recognition.continuous);
        assert_eq!(config.recognition.max_silence_ms, 4_000);
        assert_eq!(config.recognition.max_listening_ms, 60_000);
        assert_eq!(config.normalizer.corrections.len(), 1);
        assert_eq!(config.normalizer.corrections[0].meant, "add step");
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_invalid_threshold_rejected() {
        let mut config = Config::default();
        config.commands.fuzzy_threshold = 1.5;
        assert!(matches!(config.validate(), Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn test_missing_file_is_default() {
        let config = Config::load_from(Path::new("does/not/exist.toml")).unwrap();
        assert_eq!(config.recognition.max_retries, 5);
    }
}
