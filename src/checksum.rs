use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};

use crate::error::SyncError;

/// Hex-encoded SHA-256 of a record's canonical payload.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Checksum(String);

impl Checksum {
    pub fn from_hex(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Checksum {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Hashes the canonical JSON form of `payload`.
///
/// Object keys are ordered recursively before serialization, so two payloads
/// that differ only in field order produce the same checksum.
pub fn content_checksum(payload: &Value) -> Result<Checksum, SyncError> {
    let bytes = canonical_bytes(payload)?;
    Ok(Checksum(hex::encode(Sha256::digest(&bytes))))
}

pub fn canonical_bytes(payload: &Value) -> Result<Vec<u8>, SyncError> {
    serde_json::to_vec(&canonicalize(payload)).map_err(|err| SyncError::Payload(err.to_string()))
}

fn canonicalize(value: &Value) -> Value {
    match value {
        Value::Object(map) => {
            let mut entries = map.iter().collect::<Vec<_>>();
            entries.sort_by(|a, b| a.0.cmp(b.0));
            Value::Object(
                entries
                    .into_iter()
                    .map(|(key, value)| (key.clone(), canonicalize(value)))
                    .collect(),
            )
        }
        Value::Array(items) => Value::Array(items.iter().map(canonicalize).collect()),
        other => other.clone(),
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn stable_under_field_order() {
        let a: Value =
            serde_json::from_str(r#"{"name":"HKUST-1","formula":"Cu3(BTC)2","meta":{"b":1,"a":2}}"#)
                .unwrap();
        let b: Value =
            serde_json::from_str(r#"{"meta":{"a":2,"b":1},"formula":"Cu3(BTC)2","name":"HKUST-1"}"#)
                .unwrap();
        assert_eq!(content_checksum(&a).unwrap(), content_checksum(&b).unwrap());
    }

    #[test]
    fn changes_with_any_value() {
        let base = json!({"name": "HKUST-1", "isotherm_count": 4, "synonyms": null});
        let original = content_checksum(&base).unwrap();
        for changed in [
            json!({"name": "HKUST-2", "isotherm_count": 4, "synonyms": null}),
            json!({"name": "HKUST-1", "isotherm_count": 5, "synonyms": null}),
            json!({"name": "HKUST-1", "isotherm_count": 4, "synonyms": "Cu-BTC"}),
        ] {
            assert_ne!(content_checksum(&changed).unwrap(), original);
        }
    }

    #[test]
    fn array_order_is_significant() {
        let a = json!({"adsorbates": ["CO2", "N2"]});
        let b = json!({"adsorbates": ["N2", "CO2"]});
        assert_ne!(content_checksum(&a).unwrap(), content_checksum(&b).unwrap());
    }

    #[test]
    fn hex_digest_shape() {
        let checksum = content_checksum(&json!({})).unwrap();
        assert_eq!(checksum.as_str().len(), 64);
        assert!(checksum.as_str().chars().all(|ch| ch.is_ascii_hexdigit()));
    }
}
