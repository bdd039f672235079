use std::fs;
use std::time::Duration;

use camino::{Utf8Path, Utf8PathBuf};
use directories::BaseDirs;
use serde::{Deserialize, Serialize};

use crate::error::SyncError;

pub const DEFAULT_CONFIG_FILE: &str = "isodb-sync.json";
pub const DEFAULT_BASE_URL: &str = "https://adsorption.nist.gov/isodb/api";
pub const DATABASE_ENV: &str = "ISODB_SYNC_DB";

#[derive(Debug, Default, Deserialize, Serialize)]
pub struct Config {
    #[serde(default)]
    pub schema_version: Option<u32>,
    #[serde(default)]
    pub database: Option<String>,
    #[serde(default)]
    pub api: ApiSection,
    #[serde(default)]
    pub sync: SyncSection,
    #[serde(default)]
    pub campaign: CampaignSection,
    #[serde(default)]
    pub conversions: Option<String>,
}

#[derive(Debug, Default, Deserialize, Serialize)]
pub struct ApiSection {
    #[serde(default)]
    pub base_url: Option<String>,
    #[serde(default)]
    pub min_request_interval_ms: Option<u64>,
    #[serde(default)]
    pub timeout_secs: Option<u64>,
    #[serde(default)]
    pub max_attempts: Option<u32>,
    #[serde(default)]
    pub base_backoff_ms: Option<u64>,
    #[serde(default)]
    pub max_backoff_ms: Option<u64>,
}

#[derive(Debug, Default, Deserialize, Serialize)]
pub struct SyncSection {
    #[serde(default)]
    pub deletion_threshold: Option<f64>,
}

#[derive(Debug, Default, Deserialize, Serialize)]
pub struct CampaignSection {
    #[serde(default)]
    pub batch_size: Option<usize>,
    #[serde(default)]
    pub max_batch_failure_rate: Option<f64>,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl RetryPolicy {
    /// Delay before retry number `attempt` (0-based): `base * 2^attempt`, capped.
    pub fn backoff(&self, attempt: u32) -> Duration {
        let factor = 2u32.saturating_pow(attempt.min(16));
        self.base_delay.saturating_mul(factor).min(self.max_delay)
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 4,
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(8),
        }
    }
}

#[derive(Debug, Clone)]
pub struct ApiSettings {
    pub base_url: String,
    pub min_request_interval: Duration,
    pub timeout: Duration,
    pub retry: RetryPolicy,
}

impl Default for ApiSettings {
    fn default() -> Self {
        Self {
            base_url: DEFAULT_BASE_URL.to_string(),
            min_request_interval: Duration::from_millis(100),
            timeout: Duration::from_secs(30),
            retry: RetryPolicy::default(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CampaignSettings {
    pub batch_size: usize,
    pub max_batch_failure_rate: f64,
}

impl Default for CampaignSettings {
    fn default() -> Self {
        Self {
            batch_size: 50,
            max_batch_failure_rate: 0.5,
        }
    }
}

#[derive(Debug, Clone)]
pub struct ResolvedConfig {
    pub schema_version: u32,
    pub database: Utf8PathBuf,
    pub api: ApiSettings,
    pub deletion_threshold: f64,
    pub campaign: CampaignSettings,
    pub conversions: Option<Utf8PathBuf>,
}

pub struct ConfigLoader;

impl ConfigLoader {
    /// Loads `path`, or `isodb-sync.json` from the working directory when it
    /// exists. Without either, built-in defaults apply.
    pub fn resolve(path: Option<&str>) -> Result<ResolvedConfig, SyncError> {
        let config_path = match path {
            Some(path) => Utf8PathBuf::from(path),
            None => Utf8PathBuf::from(DEFAULT_CONFIG_FILE),
        };

        let config = if path.is_none() && !config_path.as_std_path().exists() {
            Config::default()
        } else {
            Self::read(&config_path)?
        };

        let mut resolved = Self::resolve_config(config)?;
        if let Ok(database) = std::env::var(DATABASE_ENV) {
            if !database.trim().is_empty() {
                resolved.database = Utf8PathBuf::from(database.trim());
            }
        }
        Ok(resolved)
    }

    fn read(path: &Utf8Path) -> Result<Config, SyncError> {
        let content = fs::read_to_string(path.as_std_path())
            .map_err(|_| SyncError::ConfigRead(path.to_path_buf()))?;
        serde_json::from_str(&content).map_err(|err| SyncError::ConfigParse(err.to_string()))
    }

    pub fn resolve_config(config: Config) -> Result<ResolvedConfig, SyncError> {
        let schema_version = config.schema_version.unwrap_or(1);
        if schema_version != 1 {
            return Err(SyncError::InvalidConfig(format!(
                "unsupported schema_version {schema_version}"
            )));
        }

        let database = match config.database {
            Some(path) => Utf8PathBuf::from(path),
            None => default_database_path()?,
        };

        let defaults = ApiSettings::default();
        let retry_defaults = RetryPolicy::default();
        let api = ApiSettings {
            base_url: config
                .api
                .base_url
                .map(|url| url.trim_end_matches('/').to_string())
                .unwrap_or(defaults.base_url),
            min_request_interval: config
                .api
                .min_request_interval_ms
                .map(Duration::from_millis)
                .unwrap_or(defaults.min_request_interval),
            timeout: config
                .api
                .timeout_secs
                .map(Duration::from_secs)
                .unwrap_or(defaults.timeout),
            retry: RetryPolicy {
                max_attempts: config
                    .api
                    .max_attempts
                    .unwrap_or(retry_defaults.max_attempts),
                base_delay: config
                    .api
                    .base_backoff_ms
                    .map(Duration::from_millis)
                    .unwrap_or(retry_defaults.base_delay),
                max_delay: config
                    .api
                    .max_backoff_ms
                    .map(Duration::from_millis)
                    .unwrap_or(retry_defaults.max_delay),
            },
        };
        if api.retry.max_attempts == 0 {
            return Err(SyncError::InvalidConfig(
                "api.max_attempts must be at least 1".to_string(),
            ));
        }

        let deletion_threshold = config.sync.deletion_threshold.unwrap_or(0.10);
        check_fraction("sync.deletion_threshold", deletion_threshold)?;

        let campaign_defaults = CampaignSettings::default();
        let campaign = CampaignSettings {
            batch_size: config
                .campaign
                .batch_size
                .unwrap_or(campaign_defaults.batch_size),
            max_batch_failure_rate: config
                .campaign
                .max_batch_failure_rate
                .unwrap_or(campaign_defaults.max_batch_failure_rate),
        };
        if campaign.batch_size == 0 {
            return Err(SyncError::InvalidConfig(
                "campaign.batch_size must be at least 1".to_string(),
            ));
        }
        check_fraction(
            "campaign.max_batch_failure_rate",
            campaign.max_batch_failure_rate,
        )?;

        Ok(ResolvedConfig {
            schema_version,
            database,
            api,
            deletion_threshold,
            campaign,
            conversions: config.conversions.map(Utf8PathBuf::from),
        })
    }
}

fn check_fraction(name: &str, value: f64) -> Result<(), SyncError> {
    if !(0.0..=1.0).contains(&value) {
        return Err(SyncError::InvalidConfig(format!(
            "{name} must be within 0..=1, got {value}"
        )));
    }
    Ok(())
}

pub fn default_database_path() -> Result<Utf8PathBuf, SyncError> {
    BaseDirs::new()
        .and_then(|dirs| {
            Utf8PathBuf::from_path_buf(dirs.data_dir().join("isodb-sync").join("materials.db"))
                .ok()
        })
        .ok_or_else(|| SyncError::Filesystem("unable to resolve data directory".to_string()))
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;

    use super::*;

    #[test]
    fn defaults_apply() {
        let config = Config {
            database: Some("/tmp/isodb.db".to_string()),
            ..Config::default()
        };
        let resolved = ConfigLoader::resolve_config(config).unwrap();
        assert_eq!(resolved.schema_version, 1);
        assert_eq!(resolved.deletion_threshold, 0.10);
        assert_eq!(resolved.api.min_request_interval, Duration::from_millis(100));
        assert_eq!(resolved.campaign.batch_size, 50);
        assert!(resolved.conversions.is_none());
    }

    #[test]
    fn rejects_out_of_range_threshold() {
        let config = Config {
            database: Some("/tmp/isodb.db".to_string()),
            sync: SyncSection {
                deletion_threshold: Some(1.5),
            },
            ..Config::default()
        };
        let err = ConfigLoader::resolve_config(config).unwrap_err();
        assert_matches!(err, SyncError::InvalidConfig(_));
    }

    #[test]
    fn backoff_doubles_and_caps() {
        let policy = RetryPolicy {
            max_attempts: 5,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_millis(350),
        };
        assert_eq!(policy.backoff(0), Duration::from_millis(100));
        assert_eq!(policy.backoff(1), Duration::from_millis(200));
        assert_eq!(policy.backoff(2), Duration::from_millis(350));
        assert_eq!(policy.backoff(30), Duration::from_millis(350));
    }
}
