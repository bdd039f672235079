//! Table-driven unit conversion.
//!
//! A [`ConversionRegistry`] maps `(axis, source unit, target unit)` to a
//! [`Conversion`]. The built-in table covers the units seen in ISODB; a JSON
//! file with the same shape replaces it wholesale.

use std::collections::BTreeMap;
use std::fmt;
use std::fs;
use std::sync::LazyLock;

use camino::Utf8Path;
use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::error::SyncError;

pub const PRESSURE_TARGET: &str = "Pa";
pub const ADSORPTION_TARGET: &str = "mol/kg";

/// Molar volume of an ideal gas at STP, cm3/mmol.
const STP_MOLAR_VOLUME: f64 = 22.414;

static AREA_UNIT: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)/\s*(?:[cmnu]|µ)?m\s*(?:\^\s*2|2|²)").expect("area unit pattern")
});

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Axis {
    Pressure,
    Adsorption,
}

impl Axis {
    pub fn target_unit(&self) -> &'static str {
        match self {
            Axis::Pressure => PRESSURE_TARGET,
            Axis::Adsorption => ADSORPTION_TARGET,
        }
    }
}

impl fmt::Display for Axis {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Axis::Pressure => f.write_str("pressure"),
            Axis::Adsorption => f.write_str("adsorption"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Conversion {
    /// `value * factor + offset`
    Linear { factor: f64, offset: f64 },
    /// `value * factor / molar_mass(gas)`
    PerMolarMass { factor: f64 },
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ConversionEntry {
    pub axis: Axis,
    pub from: String,
    pub to: String,
    pub conversion: Conversion,
    pub description: String,
}

/// Why a value could not be converted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConversionFailure {
    UnsupportedUnit,
    UnresolvedMolarMass,
}

#[derive(Debug, Clone, Deserialize)]
struct TableFile {
    conversions: Vec<EntryFile>,
    #[serde(default)]
    molar_masses: BTreeMap<String, f64>,
}

#[derive(Debug, Clone, Deserialize)]
struct EntryFile {
    from: String,
    to: String,
    axis: Axis,
    factor: f64,
    #[serde(default)]
    offset: f64,
    #[serde(default)]
    per_molar_mass: bool,
    #[serde(default)]
    description: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ConversionRegistry {
    entries: BTreeMap<(Axis, String, String), ConversionEntry>,
    molar_masses: BTreeMap<String, f64>,
}

impl ConversionRegistry {
    pub fn builtin() -> Self {
        let mut registry = Self {
            entries: BTreeMap::new(),
            molar_masses: BTreeMap::new(),
        };
        let pressure = [
            ("Pa", 1.0, "Pascal (identity)"),
            ("bar", 1e5, "bar to Pascal"),
            ("kPa", 1e3, "kilopascal to Pascal"),
            ("MPa", 1e6, "megapascal to Pascal"),
            ("atm", 101_325.0, "atmosphere to Pascal"),
            ("psi", 6894.76, "pounds per square inch to Pascal"),
            ("mmHg", 133.322, "millimeters of mercury to Pascal"),
            ("torr", 133.322, "torr to Pascal"),
            ("Torr", 133.322, "torr to Pascal"),
        ];
        for (from, factor, description) in pressure {
            registry.insert_linear(Axis::Pressure, from, factor, description);
        }
        let adsorption = [
            ("mmol/g", 1.0, "millimoles per gram to moles per kilogram"),
            ("mol/kg", 1.0, "moles per kilogram (identity)"),
            ("mol/g", 1000.0, "moles per gram to moles per kilogram"),
            ("mmol/kg", 0.001, "millimoles per kilogram to moles per kilogram"),
            (
                "cm3(STP)/g",
                1.0 / STP_MOLAR_VOLUME,
                "cubic centimeters at STP per gram to moles per kilogram",
            ),
        ];
        for (from, factor, description) in adsorption {
            registry.insert_linear(Axis::Adsorption, from, factor, description);
        }
        let per_mass = [
            ("mg/g", 1.0, "milligrams per gram over molar mass"),
            ("g/g", 1000.0, "grams per gram over molar mass"),
            ("wt%", 10.0, "weight percent over molar mass"),
        ];
        for (from, factor, description) in per_mass {
            registry.insert(ConversionEntry {
                axis: Axis::Adsorption,
                from: from.to_string(),
                to: ADSORPTION_TARGET.to_string(),
                conversion: Conversion::PerMolarMass { factor },
                description: description.to_string(),
            });
        }

        let molar_masses = [
            ("CURLTUGMZLYLDI-UHFFFAOYSA-N", 44.0095),  // CO2
            ("IJGRMHOSHXDMSA-UHFFFAOYSA-N", 28.0134),  // N2
            ("VNWKTOKETHGBQD-UHFFFAOYSA-N", 16.0425),  // CH4
            ("UFHFLCQGNIYNRP-UHFFFAOYSA-N", 2.01588),  // H2
            ("MYMOFIZGZYHOMD-UHFFFAOYSA-N", 31.9988),  // O2
            ("XKRFYHLGVUSROY-UHFFFAOYSA-N", 39.948),   // Ar
            ("SWQJXJOGLNCZEY-UHFFFAOYSA-N", 4.002602), // He
            ("XLYOFNOQVPJJNP-UHFFFAOYSA-N", 18.01528), // H2O
        ];
        for (inchikey, mass) in molar_masses {
            registry.molar_masses.insert(inchikey.to_string(), mass);
        }
        registry
    }

    pub fn load(path: &Utf8Path) -> Result<Self, SyncError> {
        let content = fs::read_to_string(path.as_std_path())
            .map_err(|err| SyncError::ConversionTable(format!("{path}: {err}")))?;
        Self::from_json(&content)
    }

    pub fn from_json(content: &str) -> Result<Self, SyncError> {
        let table: TableFile = serde_json::from_str(content)
            .map_err(|err| SyncError::ConversionTable(err.to_string()))?;
        let mut registry = Self {
            entries: BTreeMap::new(),
            molar_masses: BTreeMap::new(),
        };
        for entry in table.conversions {
            if !entry.factor.is_finite() || entry.factor <= 0.0 {
                return Err(SyncError::ConversionTable(format!(
                    "{} -> {}: factor must be a positive number",
                    entry.from, entry.to
                )));
            }
            if !entry.offset.is_finite() || (entry.per_molar_mass && entry.offset != 0.0) {
                return Err(SyncError::ConversionTable(format!(
                    "{} -> {}: invalid offset",
                    entry.from, entry.to
                )));
            }
            let conversion = if entry.per_molar_mass {
                Conversion::PerMolarMass {
                    factor: entry.factor,
                }
            } else {
                Conversion::Linear {
                    factor: entry.factor,
                    offset: entry.offset,
                }
            };
            let description = entry
                .description
                .unwrap_or_else(|| format!("{} to {}", entry.from, entry.to));
            registry.insert(ConversionEntry {
                axis: entry.axis,
                from: canonical_unit(&entry.from),
                to: canonical_unit(&entry.to),
                conversion,
                description,
            });
        }
        for (gas, mass) in table.molar_masses {
            if !mass.is_finite() || mass <= 0.0 {
                return Err(SyncError::ConversionTable(format!(
                    "molar mass for {gas} must be a positive number"
                )));
            }
            registry.molar_masses.insert(gas, mass);
        }
        Ok(registry)
    }

    fn insert_linear(&mut self, axis: Axis, from: &str, factor: f64, description: &str) {
        self.insert(ConversionEntry {
            axis,
            from: from.to_string(),
            to: axis.target_unit().to_string(),
            conversion: Conversion::Linear {
                factor,
                offset: 0.0,
            },
            description: description.to_string(),
        });
    }

    fn insert(&mut self, entry: ConversionEntry) {
        self.entries
            .insert((entry.axis, entry.from.clone(), entry.to.clone()), entry);
    }

    pub fn lookup(&self, axis: Axis, from: &str, to: &str) -> Option<&ConversionEntry> {
        self.entries
            .get(&(axis, canonical_unit(from), canonical_unit(to)))
    }

    pub fn molar_mass(&self, gas: &str) -> Option<f64> {
        self.molar_masses.get(gas).copied()
    }

    pub fn entries(&self) -> impl Iterator<Item = &ConversionEntry> {
        self.entries.values()
    }

    pub fn molar_masses(&self) -> &BTreeMap<String, f64> {
        &self.molar_masses
    }

    /// Converts `value` from `unit` into the axis' standard unit.
    pub fn to_standard(
        &self,
        axis: Axis,
        unit: &str,
        value: f64,
        gas: Option<&str>,
    ) -> Result<f64, ConversionFailure> {
        if axis == Axis::Adsorption && is_area_unit(unit) {
            return Err(ConversionFailure::UnsupportedUnit);
        }
        let entry = self
            .lookup(axis, unit, axis.target_unit())
            .ok_or(ConversionFailure::UnsupportedUnit)?;
        match entry.conversion {
            Conversion::Linear { factor, offset } => Ok(value * factor + offset),
            Conversion::PerMolarMass { factor } => {
                let mass = gas
                    .and_then(|gas| self.molar_mass(gas))
                    .ok_or(ConversionFailure::UnresolvedMolarMass)?;
                Ok(value * factor / mass)
            }
        }
    }
}

impl Default for ConversionRegistry {
    fn default() -> Self {
        Self::builtin()
    }
}

/// Adsorption units normalized per surface area (`mg/m2`, `mmol/m^2`, ...).
pub fn is_area_unit(unit: &str) -> bool {
    AREA_UNIT.is_match(unit)
}

/// Trims and drops inner whitespace so `mmol / g` matches `mmol/g`.
pub fn canonical_unit(unit: &str) -> String {
    unit.chars().filter(|ch| !ch.is_whitespace()).collect()
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;

    use super::*;

    #[test]
    fn builtin_pressure_factors_are_exact() {
        let registry = ConversionRegistry::builtin();
        assert_eq!(registry.to_standard(Axis::Pressure, "bar", 1.0, None), Ok(100_000.0));
        assert_eq!(registry.to_standard(Axis::Pressure, "atm", 1.0, None), Ok(101_325.0));
        assert_eq!(registry.to_standard(Axis::Pressure, " kPa ", 2.0, None), Ok(2000.0));
    }

    #[test]
    fn molar_mass_conversions_need_a_known_gas() {
        let registry = ConversionRegistry::builtin();
        let co2 = "CURLTUGMZLYLDI-UHFFFAOYSA-N";
        let converted = registry
            .to_standard(Axis::Adsorption, "mg/g", 44.0095, Some(co2))
            .unwrap();
        assert!((converted - 1.0).abs() < 1e-12);
        assert_eq!(
            registry.to_standard(Axis::Adsorption, "mg/g", 10.0, Some("UNKNOWN-KEY")),
            Err(ConversionFailure::UnresolvedMolarMass)
        );
        assert_eq!(
            registry.to_standard(Axis::Adsorption, "mg/g", 10.0, None),
            Err(ConversionFailure::UnresolvedMolarMass)
        );
    }

    #[test]
    fn detects_area_units() {
        for unit in ["mg/m2", "mmol/m^2", "mol/m²", "umol / cm2", "mmol/M2"] {
            assert!(is_area_unit(unit), "{unit}");
        }
        for unit in ["mmol/g", "mol/kg", "cm3(STP)/g", "mg/g", "wt%"] {
            assert!(!is_area_unit(unit), "{unit}");
        }
    }

    #[test]
    fn loads_replacement_table() {
        let registry = ConversionRegistry::from_json(
            r#"{
                "conversions": [
                    {"from": "bar", "to": "Pa", "axis": "pressure", "factor": 100000.0},
                    {"from": "mg/g", "to": "mol/kg", "axis": "adsorption", "factor": 1.0, "per_molar_mass": true}
                ],
                "molar_masses": {"X": 2.0}
            }"#,
        )
        .unwrap();
        assert_eq!(registry.entries().count(), 2);
        assert_eq!(registry.to_standard(Axis::Adsorption, "mg/g", 4.0, Some("X")), Ok(2.0));
        assert_eq!(
            registry.to_standard(Axis::Pressure, "atm", 1.0, None),
            Err(ConversionFailure::UnsupportedUnit)
        );
    }

    #[test]
    fn rejects_non_positive_factor() {
        let err = ConversionRegistry::from_json(
            r#"{"conversions": [{"from": "bar", "to": "Pa", "axis": "pressure", "factor": 0}]}"#,
        )
        .unwrap_err();
        assert_matches!(err, SyncError::ConversionTable(_));
    }
}
