//! Analyzer configuration and persisted user settings
//!
//! [`AnalyzerConfig`] carries the budgets and limits of one analysis run.
//! [`Settings`] is the small JSON file under `~/.chunkwise` (or
//! `$CHUNKWISE_DIR`) that the CLI reads to build one.

use crate::doc::chunker::{ChunkBudget, ChunkStrategy};
use crate::error::{AnalysisError, ConfigError, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::debug;

/// Model used when nothing else is configured
pub const DEFAULT_MODEL: &str = "claude-sonnet-4-20250514";

/// Overrides the settings directory
pub const DIR_ENV: &str = "CHUNKWISE_DIR";

/// Overrides the stored API key
pub const API_KEY_ENV: &str = "ANTHROPIC_API_KEY";

/// Keys accepted by [`Settings::set`]
pub const SETTING_KEYS: &[&str] = &["model", "temperature", "max_tokens", "api_key", "concurrency_cap"];

/// Budgets and limits for one analysis run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AnalyzerConfig {
    /// Documents estimated at or below this size are analyzed in one call
    pub single_call_budget: usize,

    /// Maximum estimated units per chunk, overlap included
    pub max_unit_budget: usize,

    /// Units of context repeated at the start of each chunk
    pub overlap_units: usize,

    /// Maximum concurrent map calls
    pub concurrency_cap: usize,

    /// Per-call timeout for map calls
    pub call_timeout_secs: u64,

    pub model: String,

    /// Output limit for direct and synthesis calls
    pub max_output_tokens: u32,

    /// Output limit for per-chunk map calls
    pub map_output_tokens: u32,

    pub temperature: f32,

    /// Stream direct and synthesis responses
    pub stream: bool,

    /// Mark stable prompt prefixes for provider-side caching
    pub cache_prompts: bool,

    pub chunk_strategy: ChunkStrategy,
}

impl Default for AnalyzerConfig {
    fn default() -> Self {
        Self {
            single_call_budget: 180_000,
            max_unit_budget: 100_000,
            overlap_units: 500,
            concurrency_cap: 4,
            call_timeout_secs: 120,
            model: DEFAULT_MODEL.to_string(),
            max_output_tokens: 4096,
            map_output_tokens: 2048,
            temperature: 0.0,
            stream: false,
            cache_prompts: true,
            chunk_strategy: ChunkStrategy::Structural,
        }
    }
}

impl AnalyzerConfig {
    /// Check that budgets and limits are consistent
    pub fn validate(&self) -> Result<()> {
        if self.single_call_budget == 0 {
            return Err(AnalysisError::InvalidConfig(
                "single_call_budget must be greater than zero".to_string(),
            ));
        }
        self.chunk_budget().validate()?;
        if self.concurrency_cap == 0 {
            return Err(AnalysisError::InvalidConfig(
                "concurrency_cap must be at least 1".to_string(),
            ));
        }
        if self.call_timeout_secs == 0 {
            return Err(AnalysisError::InvalidConfig(
                "call_timeout_secs must be greater than zero".to_string(),
            ));
        }
        if self.model.trim().is_empty() {
            return Err(AnalysisError::InvalidConfig("model must not be empty".to_string()));
        }
        if !(0.0..=1.0).contains(&self.temperature) {
            return Err(AnalysisError::InvalidConfig(format!(
                "temperature must be between 0.0 and 1.0, got {}",
                self.temperature
            )));
        }
        Ok(())
    }

    pub fn chunk_budget(&self) -> ChunkBudget {
        ChunkBudget::new(self.max_unit_budget, self.overlap_units)
    }

    pub fn call_timeout(&self) -> Duration {
        Duration::from_secs(self.call_timeout_secs)
    }
}

/// Persisted user settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub model: String,

    pub temperature: f32,

    pub max_tokens: u32,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub api_key: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub concurrency_cap: Option<usize>,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            model: DEFAULT_MODEL.to_string(),
            temperature: 0.0,
            max_tokens: 4096,
            api_key: None,
            concurrency_cap: None,
        }
    }
}

/// Settings directory: `$CHUNKWISE_DIR` if set, else `~/.chunkwise`
pub fn config_dir() -> PathBuf {
    resolve_dir(std::env::var(DIR_ENV).ok())
}

fn resolve_dir(env_dir: Option<String>) -> PathBuf {
    match env_dir.filter(|d| !d.is_empty()) {
        Some(dir) => PathBuf::from(dir),
        None => dirs::home_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(".chunkwise"),
    }
}

/// Path of the settings file
pub fn config_path() -> PathBuf {
    config_dir().join("config.json")
}

impl Settings {
    /// Load settings from the default location, falling back to defaults
    pub fn load() -> std::result::Result<Self, ConfigError> {
        Self::load_from(&config_path())
    }

    /// Load settings from `path`; a missing file yields defaults
    pub fn load_from(path: &Path) -> std::result::Result<Self, ConfigError> {
        if !path.exists() {
            debug!("No settings at {}, using defaults", path.display());
            return Ok(Self::default());
        }

        let content = fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;

        serde_json::from_str(&content).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    /// Write settings to `path`, creating parent directories
    pub fn save_to(&self, path: &Path) -> std::result::Result<(), ConfigError> {
        let io_err = |source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        };

        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(io_err)?;
        }

        let content = serde_json::to_string_pretty(self).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })?;
        // The file may hold an API key; it is created owner-only
        let mut options = fs::OpenOptions::new();
        options.write(true).create(true).truncate(true);
        #[cfg(unix)]
        {
            use std::os::unix::fs::OpenOptionsExt;
            options.mode(0o600);
        }
        let mut file = options.open(path).map_err(io_err)?;

        // An existing file keeps its old mode on open
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            file.set_permissions(fs::Permissions::from_mode(0o600))
                .map_err(io_err)?;
        }
        file.write_all(content.as_bytes()).map_err(io_err)?;

        debug!("Saved settings to {}", path.display());
        Ok(())
    }

    /// Create a default settings file at `path`; fails if one exists
    pub fn init_at(path: &Path) -> std::result::Result<Self, ConfigError> {
        if path.exists() {
            return Err(ConfigError::AlreadyExists(path.to_path_buf()));
        }
        let settings = Self::default();
        settings.save_to(path)?;
        Ok(settings)
    }

    /// Set one key from its string form
    pub fn set(&mut self, key: &str, value: &str) -> std::result::Result<(), ConfigError> {
        let invalid = || ConfigError::InvalidValue {
            key: key.to_string(),
            value: value.to_string(),
        };

        match key {
            "model" => {
                if value.trim().is_empty() {
                    return Err(invalid());
                }
                self.model = value.trim().to_string();
            }
            "temperature" => {
                let temperature: f32 = value.parse().map_err(|_| invalid())?;
                if !(0.0..=1.0).contains(&temperature) {
                    return Err(invalid());
                }
                self.temperature = temperature;
            }
            "max_tokens" => {
                let max_tokens: u32 = value.parse().map_err(|_| invalid())?;
                if max_tokens == 0 {
                    return Err(invalid());
                }
                self.max_tokens = max_tokens;
            }
            "api_key" => {
                self.api_key = Some(value.trim().to_string()).filter(|k| !k.is_empty());
            }
            "concurrency_cap" => {
                let cap: usize = value.parse().map_err(|_| invalid())?;
                if cap == 0 {
                    return Err(invalid());
                }
                self.concurrency_cap = Some(cap);
            }
            _ => return Err(ConfigError::UnknownKey(key.to_string())),
        }
        Ok(())
    }

    /// Set one key in the file at `path`, creating the file if needed
    pub fn set_value_at(path: &Path, key: &str, value: &str) -> std::result::Result<Self, ConfigError> {
        let mut settings = Self::load_from(path)?;
        settings.set(key, value)?;
        settings.save_to(path)?;
        Ok(settings)
    }

    /// API key from the environment, else from the settings file
    pub fn api_key(&self) -> Option<String> {
        resolve_api_key(std::env::var(API_KEY_ENV).ok(), self.api_key.as_deref())
    }

    /// Copy with the API key masked, for display
    pub fn redacted(&self) -> Self {
        let mut shown = self.clone();
        shown.api_key = self.api_key.as_deref().map(mask_key);
        shown
    }

    /// Analyzer configuration seeded from these settings
    pub fn analyzer_config(&self) -> AnalyzerConfig {
        let mut config = AnalyzerConfig {
            model: self.model.clone(),
            temperature: self.temperature,
            max_output_tokens: self.max_tokens,
            map_output_tokens: self.max_tokens.min(2048),
            ..AnalyzerConfig::default()
        };
        if let Some(cap) = self.concurrency_cap {
            config.concurrency_cap = cap;
        }
        config
    }
}

fn resolve_api_key(env_key: Option<String>, stored: Option<&str>) -> Option<String> {
    env_key
        .filter(|k| !k.trim().is_empty())
        .or_else(|| stored.map(str::to_string))
        .filter(|k| !k.trim().is_empty())
}

fn mask_key(key: &str) -> String {
    let visible: String = key.chars().take(7).collect();
    if key.chars().count() <= 7 {
        "***".to_string()
    } else {
        format!("{}***", visible)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_default_config_is_valid() {
        let config = AnalyzerConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.single_call_budget, 180_000);
        assert_eq!(config.concurrency_cap, 4);
        assert_eq!(config.call_timeout(), Duration::from_secs(120));
    }

    #[test]
    fn test_overlap_must_be_below_budget() {
        let config = AnalyzerConfig {
            max_unit_budget: 10,
            overlap_units: 10,
            ..Default::default()
        };
        assert!(matches!(config.validate(), Err(AnalysisError::InvalidConfig(_))));
    }

    #[test]
    fn test_zero_concurrency_rejected() {
        let config = AnalyzerConfig {
            concurrency_cap: 0,
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_partial_config_json_uses_defaults() {
        let config: AnalyzerConfig = serde_json::from_str(r#"{"max_unit_budget": 50}"#).unwrap();
        assert_eq!(config.max_unit_budget, 50);
        assert_eq!(config.overlap_units, 500);
    }

    #[test]
    fn test_resolve_dir() {
        assert_eq!(resolve_dir(Some("/tmp/cw".to_string())), PathBuf::from("/tmp/cw"));
        assert!(resolve_dir(None).ends_with(".chunkwise"));
        assert!(resolve_dir(Some(String::new())).ends_with(".chunkwise"));
    }

    #[test]
    fn test_load_missing_file_gives_defaults() {
        let temp = TempDir::new().unwrap();
        let settings = Settings::load_from(&temp.path().join("config.json")).unwrap();
        assert_eq!(settings, Settings::default());
    }

    #[test]
    fn test_init_then_init_again_fails() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("nested").join("config.json");
        Settings::init_at(&path).unwrap();
        assert!(path.exists());
        assert!(matches!(
            Settings::init_at(&path),
            Err(ConfigError::AlreadyExists(_))
        ));
    }

    #[cfg(unix)]
    #[test]
    fn test_settings_file_is_private() {
        use std::os::unix::fs::PermissionsExt;
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("config.json");
        Settings::init_at(&path).unwrap();
        let mode = fs::metadata(&path).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o600);
    }

    #[cfg(unix)]
    #[test]
    fn test_save_tightens_existing_file_mode() {
        use std::os::unix::fs::PermissionsExt;
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("config.json");
        fs::write(&path, "{}").unwrap();
        fs::set_permissions(&path, fs::Permissions::from_mode(0o644)).unwrap();

        Settings::set_value_at(&path, "api_key", "sk-ant-secret").unwrap();

        let mode = fs::metadata(&path).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o600);
        assert_eq!(
            Settings::load_from(&path).unwrap().api_key.as_deref(),
            Some("sk-ant-secret")
        );
    }

    #[test]
    fn test_set_value_persists() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("config.json");
        Settings::set_value_at(&path, "temperature", "0.5").unwrap();
        Settings::set_value_at(&path, "concurrency_cap", "8").unwrap();

        let settings = Settings::load_from(&path).unwrap();
        assert_eq!(settings.temperature, 0.5);
        assert_eq!(settings.concurrency_cap, Some(8));
        assert_eq!(settings.analyzer_config().concurrency_cap, 8);
    }

    #[test]
    fn test_set_rejects_bad_values() {
        let mut settings = Settings::default();
        assert!(matches!(
            settings.set("temperature", "hot"),
            Err(ConfigError::InvalidValue { .. })
        ));
        assert!(settings.set("max_tokens", "0").is_err());
        assert!(matches!(
            settings.set("colour", "blue"),
            Err(ConfigError::UnknownKey(_))
        ));
    }

    #[test]
    fn test_invalid_json_reports_path() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("config.json");
        fs::write(&path, "{ not json").unwrap();
        let err = Settings::load_from(&path).unwrap_err();
        assert!(matches!(err, ConfigError::Parse { .. }));
        assert!(err.to_string().contains("config.json"));
    }

    #[test]
    fn test_env_key_overrides_stored_key() {
        assert_eq!(
            resolve_api_key(Some("sk-env".into()), Some("sk-file")),
            Some("sk-env".to_string())
        );
        assert_eq!(
            resolve_api_key(None, Some("sk-file")),
            Some("sk-file".to_string())
        );
        assert_eq!(resolve_api_key(Some("  ".into()), None), None);
    }

    #[test]
    fn test_redacted_masks_key() {
        let settings = Settings {
            api_key: Some("sk-ant-secret-value".to_string()),
            ..Default::default()
        };
        assert_eq!(settings.redacted().api_key.as_deref(), Some("sk-ant-***"));
    }
}
