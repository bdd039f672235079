use std::fs;
use std::time::Duration;

use assert_matches::assert_matches;

use isodb_sync::config::{
    ApiSection, CampaignSection, Config, ConfigLoader, DEFAULT_BASE_URL, SyncSection,
};
use isodb_sync::error::SyncError;

fn base() -> Config {
    Config {
        database: Some("/tmp/isodb-test.db".to_string()),
        ..Config::default()
    }
}

#[test]
fn resolve_uses_defaults() {
    let resolved = ConfigLoader::resolve_config(base()).unwrap();
    assert_eq!(resolved.api.base_url, DEFAULT_BASE_URL);
    assert_eq!(resolved.api.retry.max_attempts, 4);
    assert_eq!(resolved.deletion_threshold, 0.10);
    assert_eq!(resolved.campaign.max_batch_failure_rate, 0.5);
    assert_eq!(resolved.database.as_str(), "/tmp/isodb-test.db");
}

#[test]
fn resolve_applies_overrides() {
    let config = Config {
        api: ApiSection {
            base_url: Some("http://localhost:8080/isodb/api/".to_string()),
            min_request_interval_ms: Some(0),
            max_attempts: Some(2),
            ..ApiSection::default()
        },
        sync: SyncSection {
            deletion_threshold: Some(0.25),
        },
        campaign: CampaignSection {
            batch_size: Some(10),
            max_batch_failure_rate: Some(1.0),
        },
        conversions: Some("units.json".to_string()),
        ..base()
    };
    let resolved = ConfigLoader::resolve_config(config).unwrap();
    assert_eq!(resolved.api.base_url, "http://localhost:8080/isodb/api");
    assert_eq!(resolved.api.min_request_interval, Duration::ZERO);
    assert_eq!(resolved.api.retry.max_attempts, 2);
    assert_eq!(resolved.deletion_threshold, 0.25);
    assert_eq!(resolved.campaign.batch_size, 10);
    assert_eq!(resolved.conversions.unwrap().as_str(), "units.json");
}

#[test]
fn resolve_rejects_invalid_values() {
    let zero_batch = Config {
        campaign: CampaignSection {
            batch_size: Some(0),
            ..CampaignSection::default()
        },
        ..base()
    };
    assert_matches!(
        ConfigLoader::resolve_config(zero_batch),
        Err(SyncError::InvalidConfig(_))
    );

    let no_attempts = Config {
        api: ApiSection {
            max_attempts: Some(0),
            ..ApiSection::default()
        },
        ..base()
    };
    assert_matches!(
        ConfigLoader::resolve_config(no_attempts),
        Err(SyncError::InvalidConfig(_))
    );

    let future = Config {
        schema_version: Some(2),
        ..base()
    };
    assert_matches!(
        ConfigLoader::resolve_config(future),
        Err(SyncError::InvalidConfig(_))
    );
}

#[test]
fn resolve_reads_config_file() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("isodb-sync.json");
    fs::write(
        &path,
        r#"{"schema_version": 1, "database": "/tmp/from-file.db", "sync": {"deletion_threshold": 0.05}}"#,
    )
    .unwrap();
    let resolved = ConfigLoader::resolve(path.to_str()).unwrap();
    assert_eq!(resolved.deletion_threshold, 0.05);

    let broken = dir.path().join("broken.json");
    fs::write(&broken, "{ not json").unwrap();
    assert_matches!(
        ConfigLoader::resolve(broken.to_str()),
        Err(SyncError::ConfigParse(_))
    );

    let missing = dir.path().join("missing.json");
    assert_matches!(
        ConfigLoader::resolve(missing.to_str()),
        Err(SyncError::ConfigRead(_))
    );
}
