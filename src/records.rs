//! Mapping of raw ISODB JSON into the normalized field sets that are hashed
//! and stored.

use std::collections::BTreeMap;

use serde::Serialize;
use serde_json::{Map, Value, json};
use tracing::warn;

use crate::domain::{RecordKey, ResourceKind, SourceRecord};
use crate::error::SyncError;

/// Records parsed from one collection response.
#[derive(Debug, Clone)]
pub struct RecordBatch {
    pub kind: ResourceKind,
    pub records: Vec<SourceRecord>,
    /// Entries dropped because no stable key could be derived.
    pub skipped: usize,
    /// `Last-Modified` header of the collection response, if any.
    pub last_modified: Option<String>,
}

/// Per-isotherm detail: unit context plus raw measurement points.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct IsothermDetail {
    pub filename: RecordKey,
    pub pressure_units: Option<String>,
    pub adsorption_units: Option<String>,
    /// One InChIKey per component, empty when upstream gave none.
    pub adsorbates: Vec<String>,
    pub temperature: Option<f64>,
    pub points: Vec<RawPoint>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RawPoint {
    pub pressure: Option<f64>,
    pub total_adsorption: Option<f64>,
    pub species_data: Value,
}

pub fn parse_collection(
    kind: ResourceKind,
    body: &Value,
    last_modified: Option<String>,
) -> Result<RecordBatch, SyncError> {
    let items = body
        .as_array()
        .ok_or_else(|| SyncError::Payload(format!("{kind} response is not a JSON array")))?;

    let mut records = Vec::with_capacity(items.len());
    let mut skipped = 0usize;
    for item in items {
        match normalize_record(kind, item)? {
            Some(record) => records.push(record),
            None => {
                skipped += 1;
                warn!(%kind, "skipping upstream entry without a usable key");
            }
        }
    }

    Ok(RecordBatch {
        kind,
        records,
        skipped,
        last_modified,
    })
}

/// Returns `None` when the entry carries no usable key.
pub fn normalize_record(kind: ResourceKind, raw: &Value) -> Result<Option<SourceRecord>, SyncError> {
    let (key, payload) = match kind {
        ResourceKind::Materials => normalize_material(raw),
        ResourceKind::Isotherms => normalize_isotherm(raw),
        ResourceKind::Gases => normalize_gas(raw),
        ResourceKind::Bibliography => normalize_biblio(raw),
    };
    let Some(key) = key.and_then(|value| value.parse::<RecordKey>().ok()) else {
        return Ok(None);
    };
    let last_modified = str_field(raw, "last_modified").or_else(|| str_field(raw, "lastModified"));
    SourceRecord::new(kind, key, payload, last_modified).map(Some)
}

fn normalize_material(raw: &Value) -> (Option<String>, Value) {
    let name = str_field(raw, "name").unwrap_or_default();
    let key = str_field(raw, "hashkey").or_else(|| {
        (!name.trim().is_empty()).then(|| name.replace(' ', "_"))
    });
    let payload = json!({
        "name": name,
        "synonyms": joined_synonyms(raw.get("synonyms")),
        "formula": str_field(raw, "formula"),
        "category": str_field(raw, "family"),
        "isotherm_count": raw.get("isotherm_count").and_then(Value::as_u64).unwrap_or(0),
    });
    (key, payload)
}

fn normalize_isotherm(raw: &Value) -> (Option<String>, Value) {
    let adsorbates = raw
        .get("adsorbates")
        .and_then(Value::as_array)
        .map(|items| {
            items
                .iter()
                .map(|item| str_field(item, "InChIKey").unwrap_or_default())
                .collect::<Vec<_>>()
        })
        .unwrap_or_default();
    let payload = json!({
        "doi": str_field(raw, "DOI"),
        "adsorbent_id": raw.get("adsorbent").and_then(|value| str_field(value, "hashkey")),
        "adsorbates": adsorbates,
        "category": str_field(raw, "category"),
        "temperature": raw.get("temperature").and_then(Value::as_f64),
        "tabular_data": raw.get("tabular_data").and_then(Value::as_i64).unwrap_or(0),
        "isotherm_type": str_field(raw, "isotherm_type"),
    });
    (str_field(raw, "filename"), payload)
}

fn normalize_gas(raw: &Value) -> (Option<String>, Value) {
    let payload = json!({
        "name": str_field(raw, "name").unwrap_or_default(),
        "synonyms": joined_synonyms(raw.get("synonyms")),
    });
    (str_field(raw, "InChIKey"), payload)
}

fn normalize_biblio(raw: &Value) -> (Option<String>, Value) {
    let list = |field: &str| raw.get(field).cloned().unwrap_or_else(|| json!([]));
    let refs = |field: &str, primary: &str| -> Vec<String> {
        raw.get(field)
            .and_then(Value::as_array)
            .map(|items| {
                items
                    .iter()
                    .map(|item| {
                        str_field(item, primary)
                            .or_else(|| str_field(item, "name"))
                            .unwrap_or_default()
                    })
                    .collect()
            })
            .unwrap_or_default()
    };
    let payload = json!({
        "title": str_field(raw, "title"),
        "journal": str_field(raw, "journal"),
        "year": raw.get("year").and_then(Value::as_i64),
        "authors": list("authors"),
        "categories": list("categories"),
        "adsorbents": refs("adsorbents", "hashkey"),
        "adsorbates": refs("adsorbates", "InChIKey"),
        "temperatures": list("temperatures"),
        "pressures": list("pressures"),
    });
    (str_field(raw, "DOI"), payload)
}

pub fn parse_isotherm_detail(filename: &RecordKey, raw: &Value) -> Result<IsothermDetail, SyncError> {
    let object = raw
        .as_object()
        .ok_or_else(|| SyncError::Payload(format!("isotherm {filename} is not an object")))?;

    let adsorbates = object
        .get("adsorbates")
        .and_then(Value::as_array)
        .map(|items| {
            items
                .iter()
                .map(|item| str_field(item, "InChIKey").unwrap_or_default())
                .collect::<Vec<_>>()
        })
        .unwrap_or_default();

    let points = object
        .get("isotherm_data")
        .and_then(Value::as_array)
        .ok_or_else(|| SyncError::Payload(format!("isotherm {filename} has no isotherm_data")))?
        .iter()
        .map(|item| RawPoint {
            pressure: item.get("pressure").and_then(Value::as_f64),
            total_adsorption: item.get("total_adsorption").and_then(Value::as_f64),
            species_data: item.get("species_data").cloned().unwrap_or(Value::Null),
        })
        .collect();

    Ok(IsothermDetail {
        filename: filename.clone(),
        pressure_units: str_field(raw, "pressureUnits"),
        adsorption_units: str_field(raw, "adsorptionUnits"),
        adsorbates,
        temperature: object.get("temperature").and_then(Value::as_f64),
        points,
    })
}

/// Counts isotherms per adsorbent hashkey (falling back to adsorbent name).
pub fn isotherm_counts(isotherms: &Value) -> BTreeMap<String, u64> {
    let mut counts = BTreeMap::new();
    for isotherm in isotherms.as_array().into_iter().flatten() {
        let adsorbent = isotherm.get("adsorbent").cloned().unwrap_or(Value::Object(Map::new()));
        let material_id = str_field(&adsorbent, "hashkey").or_else(|| str_field(&adsorbent, "name"));
        if let Some(id) = material_id {
            *counts.entry(id).or_insert(0) += 1;
        }
    }
    counts
}

fn str_field(value: &Value, field: &str) -> Option<String> {
    value
        .get(field)
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|value| !value.is_empty())
        .map(str::to_string)
}

fn joined_synonyms(value: Option<&Value>) -> Value {
    match value {
        Some(Value::Array(items)) => {
            let names = items.iter().filter_map(Value::as_str).collect::<Vec<_>>();
            if names.is_empty() {
                Value::Null
            } else {
                Value::String(names.join("; "))
            }
        }
        Some(Value::String(text)) => Value::String(text.clone()),
        _ => Value::Null,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn material_key_falls_back_to_name() {
        let raw = json!({"name": "Zeolite 13X", "synonyms": ["13X", "NaX"], "family": "zeolite"});
        let record = normalize_record(ResourceKind::Materials, &raw).unwrap().unwrap();
        assert_eq!(record.key.as_str(), "Zeolite_13X");
        assert_eq!(record.payload["synonyms"], json!("13X; NaX"));
        assert_eq!(record.payload["category"], json!("zeolite"));
        assert_eq!(record.payload["isotherm_count"], json!(0));
    }

    #[test]
    fn entries_without_key_are_skipped() {
        let body = json!([{"name": "CO2"}, {"InChIKey": "CURLTUGMZLYLDI-UHFFFAOYSA-N", "name": "CO2"}]);
        let batch = parse_collection(ResourceKind::Gases, &body, None).unwrap();
        assert_eq!(batch.records.len(), 1);
        assert_eq!(batch.skipped, 1);
    }

    #[test]
    fn isotherm_detail_parses_points() {
        let raw = json!({
            "filename": "10.1002adfm.201200084.Isotherm1",
            "pressureUnits": "bar",
            "adsorptionUnits": "mmol/g",
            "adsorbates": [{"InChIKey": "CURLTUGMZLYLDI-UHFFFAOYSA-N", "name": "Carbon Dioxide"}],
            "temperature": 298.0,
            "isotherm_data": [
                {"pressure": 0.1, "total_adsorption": 1.2, "species_data": []},
                {"pressure": 1.0, "total_adsorption": 3.4}
            ]
        });
        let key: RecordKey = "10.1002adfm.201200084.Isotherm1".parse().unwrap();
        let detail = parse_isotherm_detail(&key, &raw).unwrap();
        assert_eq!(detail.pressure_units.as_deref(), Some("bar"));
        assert_eq!(detail.adsorbates, vec!["CURLTUGMZLYLDI-UHFFFAOYSA-N"]);
        assert_eq!(detail.points.len(), 2);
        assert_eq!(detail.points[1].species_data, Value::Null);
    }

    #[test]
    fn keyless_adsorbate_keeps_its_slot() {
        let raw = json!({
            "pressureUnits": "bar",
            "adsorptionUnits": "mmol/g",
            "adsorbates": [
                {"InChIKey": "CURLTUGMZLYLDI-UHFFFAOYSA-N"},
                {"name": "Unknown gas"}
            ],
            "isotherm_data": [{"pressure": 1.0, "total_adsorption": 2.0}]
        });
        let key: RecordKey = "mix.Isotherm1".parse().unwrap();
        let detail = parse_isotherm_detail(&key, &raw).unwrap();
        assert_eq!(detail.adsorbates, vec!["CURLTUGMZLYLDI-UHFFFAOYSA-N", ""]);
    }

    #[test]
    fn counts_isotherms_per_adsorbent() {
        let body = json!([
            {"adsorbent": {"hashkey": "A"}},
            {"adsorbent": {"hashkey": "A"}},
            {"adsorbent": {"name": "B"}},
            {}
        ]);
        let counts = isotherm_counts(&body);
        assert_eq!(counts.get("A"), Some(&2));
        assert_eq!(counts.get("B"), Some(&1));
        assert_eq!(counts.len(), 2);
    }
}
