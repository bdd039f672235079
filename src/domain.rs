use std::fmt;
use std::str::FromStr;

use clap::ValueEnum;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::checksum::{Checksum, content_checksum};
use crate::error::SyncError;

/// Upstream resource collections mirrored into the local store.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, ValueEnum,
)]
#[serde(rename_all = "lowercase")]
pub enum ResourceKind {
    Materials,
    Isotherms,
    Gases,
    Bibliography,
}

impl ResourceKind {
    pub const ALL: [ResourceKind; 4] = [
        ResourceKind::Materials,
        ResourceKind::Isotherms,
        ResourceKind::Gases,
        ResourceKind::Bibliography,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ResourceKind::Materials => "materials",
            ResourceKind::Isotherms => "isotherms",
            ResourceKind::Gases => "gases",
            ResourceKind::Bibliography => "bibliography",
        }
    }

    /// File name of the collection endpoint below the API base URL.
    pub fn endpoint(&self) -> &'static str {
        match self {
            ResourceKind::Materials => "materials.json",
            ResourceKind::Isotherms => "isotherms.json",
            ResourceKind::Gases => "gases.json",
            ResourceKind::Bibliography => "biblio.json",
        }
    }
}

impl fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ResourceKind {
    type Err = SyncError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "materials" | "material" => Ok(ResourceKind::Materials),
            "isotherms" | "isotherm" => Ok(ResourceKind::Isotherms),
            "gases" | "gas" => Ok(ResourceKind::Gases),
            "bibliography" | "biblio" => Ok(ResourceKind::Bibliography),
            _ => Err(SyncError::InvalidResource(value.to_string())),
        }
    }
}

/// Stable upstream identifier (material hashkey, isotherm filename, InChIKey, DOI).
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RecordKey(String);

impl RecordKey {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for RecordKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for RecordKey {
    type Err = SyncError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let trimmed = value.trim();
        if trimmed.is_empty() || trimmed.chars().any(|ch| ch.is_control()) {
            return Err(SyncError::InvalidKey(value.to_string()));
        }
        Ok(Self(trimmed.to_string()))
    }
}

/// One upstream entity in its normalized field representation.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SourceRecord {
    pub kind: ResourceKind,
    pub key: RecordKey,
    pub payload: Value,
    pub last_modified: Option<String>,
    pub checksum: Checksum,
}

impl SourceRecord {
    pub fn new(
        kind: ResourceKind,
        key: RecordKey,
        payload: Value,
        last_modified: Option<String>,
    ) -> Result<Self, SyncError> {
        let checksum = content_checksum(&payload)?;
        Ok(Self {
            kind,
            key,
            payload,
            last_modified,
            checksum,
        })
    }

    /// Replaces one payload field and refreshes the checksum.
    pub fn set_field(&mut self, field: &str, value: Value) -> Result<(), SyncError> {
        let object = self
            .payload
            .as_object_mut()
            .ok_or_else(|| SyncError::Payload(format!("{} is not an object", self.key)))?;
        object.insert(field.to_string(), value);
        self.checksum = content_checksum(&self.payload)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;
    use serde_json::json;

    use super::*;

    #[test]
    fn parse_resource_kind_aliases() {
        assert_eq!(
            "biblio".parse::<ResourceKind>().unwrap(),
            ResourceKind::Bibliography
        );
        assert_eq!(" Gas ".parse::<ResourceKind>().unwrap(), ResourceKind::Gases);
        let err = "zeolites".parse::<ResourceKind>().unwrap_err();
        assert_matches!(err, SyncError::InvalidResource(_));
    }

    #[test]
    fn record_key_rejects_blank() {
        let err = "   ".parse::<RecordKey>().unwrap_err();
        assert_matches!(err, SyncError::InvalidKey(_));
        let key: RecordKey = " NIST-MATDB-1 ".parse().unwrap();
        assert_eq!(key.as_str(), "NIST-MATDB-1");
    }

    #[test]
    fn set_field_refreshes_checksum() {
        let mut record = SourceRecord::new(
            ResourceKind::Materials,
            "m1".parse().unwrap(),
            json!({"name": "ZIF-8", "isotherm_count": 0}),
            None,
        )
        .unwrap();
        let before = record.checksum.clone();
        record.set_field("isotherm_count", json!(3)).unwrap();
        assert_ne!(before, record.checksum);
    }
}
