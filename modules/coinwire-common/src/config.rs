use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::Deserialize;

use crate::error::CoinwireError;

/// Application configuration loaded from environment variables.
/// Contains only secrets and env-specific values; thresholds and cadences
/// live in the TOML FileConfig.
#[derive(Debug, Clone)]
pub struct AppConfig {
    pub database_url: String,
    /// Path to the TOML tuning file. Defaults apply when unset.
    pub config_path: Option<PathBuf>,
    /// Emit JSON log lines instead of the human-readable format.
    pub log_json: bool,
}

impl AppConfig {
    pub fn from_env() -> Result<Self> {
        dotenvy::dotenv().ok();

        let config = Self {
            database_url: std::env::var("DATABASE_URL")
                .map_err(|_| CoinwireError::Config("DATABASE_URL is required".to_string()))?,
            config_path: std::env::var("COINWIRE_CONFIG").ok().map(PathBuf::from),
            log_json: std::env::var("LOG_JSON")
                .unwrap_or_else(|_| "false".to_string())
                .parse()
                .unwrap_or(false),
        };

        Ok(config)
    }

    pub fn log_redacted(&self) {
        let db = match self.database_url.split_once('@') {
            Some((_, host)) => format!("postgres://***@{host}"),
            None => "<unparsed>".to_string(),
        };
        tracing::info!("Config loaded:");
        tracing::info!("  DATABASE_URL: {db}");
        tracing::info!(
            "  COINWIRE_CONFIG: {}",
            self.config_path
                .as_deref()
                .map(|p| p.display().to_string())
                .unwrap_or_else(|| "<defaults>".to_string())
        );
    }

    /// Load the TOML file named by `COINWIRE_CONFIG`, or defaults.
    pub fn file_config(&self) -> Result<FileConfig> {
        let config = match &self.config_path {
            Some(path) => load_config(path)?,
            None => FileConfig::default(),
        };
        config.validate()?;
        Ok(config)
    }
}

/// Upper bound on conflict retries per write.
pub const MAX_MERGE_ATTEMPTS: u32 = 10;

/// TOML-backed tuning configuration. Every section is optional.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct FileConfig {
    pub matching: MatchingConfig,
    pub lifecycle: LifecycleConfig,
    pub schedule: ScheduleConfig,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct MatchingConfig {
    /// Minimum similarity for a cluster to join a narrative (inclusive).
    pub similarity_threshold: f64,
    /// Minimum similarity for two narratives to be treated as duplicates.
    pub duplicate_threshold: f64,
    /// Share of a cluster's articles a narrative must already own to claim it.
    pub containment_threshold: f64,
    pub top_actors: usize,
    pub max_merge_attempts: u32,
    /// Archived narratives updated within this window can still be resurrected.
    pub resurrection_window_days: i64,
}

impl Default for MatchingConfig {
    fn default() -> Self {
        Self {
            similarity_threshold: 0.6,
            duplicate_threshold: 0.9,
            containment_threshold: 0.5,
            top_actors: 10,
            max_merge_attempts: 3,
            resurrection_window_days: 30,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LifecycleConfig {
    /// Narratives stay emerging while they hold fewer articles than this.
    pub emerging_max_articles: u32,
    pub mature_min_articles: u32,
    /// Articles per day at which a recently updated narrative is hot.
    pub hot_velocity: f64,
    pub hot_window_hours: i64,
    pub cooling_after_hours: i64,
    pub archive_after_days: i64,
}

impl Default for LifecycleConfig {
    fn default() -> Self {
        Self {
            emerging_max_articles: 3,
            mature_min_articles: 12,
            hot_velocity: 5.0,
            hot_window_hours: 24,
            cooling_after_hours: 72,
            archive_after_days: 14,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ScheduleConfig {
    pub detection_interval_minutes: u64,
    pub lookback_hours: i64,
    pub sweep_interval_minutes: u64,
    /// Run duplicate consolidation after every sweep.
    pub consolidate_after_sweep: bool,
}

impl Default for ScheduleConfig {
    fn default() -> Self {
        Self {
            detection_interval_minutes: 30,
            lookback_hours: 24,
            sweep_interval_minutes: 360,
            consolidate_after_sweep: true,
        }
    }
}

impl FileConfig {
    pub fn validate(&self) -> Result<(), CoinwireError> {
        let m = &self.matching;
        for (name, value) in [
            ("matching.similarity_threshold", m.similarity_threshold),
            ("matching.duplicate_threshold", m.duplicate_threshold),
            ("matching.containment_threshold", m.containment_threshold),
        ] {
            if !(value > 0.0 && value <= 1.0) {
                return Err(CoinwireError::Validation(format!(
                    "{name} must be in (0, 1], got {value}"
                )));
            }
        }
        if m.top_actors == 0 {
            return Err(CoinwireError::Validation("matching.top_actors must be positive".into()));
        }
        if m.max_merge_attempts == 0 || m.max_merge_attempts > MAX_MERGE_ATTEMPTS {
            return Err(CoinwireError::Validation(format!(
                "matching.max_merge_attempts must be in 1..={MAX_MERGE_ATTEMPTS}, got {}",
                m.max_merge_attempts
            )));
        }

        let l = &self.lifecycle;
        if l.hot_velocity <= 0.0 {
            return Err(CoinwireError::Validation("lifecycle.hot_velocity must be positive".into()));
        }
        if l.hot_window_hours <= 0 || l.cooling_after_hours <= 0 || l.archive_after_days <= 0 {
            return Err(CoinwireError::Validation("lifecycle windows must be positive".into()));
        }
        if l.cooling_after_hours >= l.archive_after_days * 24 {
            return Err(CoinwireError::Validation(
                "lifecycle.cooling_after_hours must be shorter than archive_after_days".into(),
            ));
        }

        let s = &self.schedule;
        if s.detection_interval_minutes == 0 || s.sweep_interval_minutes == 0 || s.lookback_hours <= 0 {
            return Err(CoinwireError::Validation("schedule intervals must be positive".into()));
        }
        Ok(())
    }
}

/// Load and parse a TOML config file.
pub fn load_config(path: &Path) -> Result<FileConfig> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;
    let config: FileConfig = toml::from_str(&content)
        .with_context(|| format!("Failed to parse config file: {}", path.display()))?;
    Ok(config)
}
