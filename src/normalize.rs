use std::collections::BTreeMap;

use serde::Serialize;
use tracing::{debug, info, warn};

use crate::error::SyncError;
use crate::records::RawPoint;
use crate::store::Store;
use crate::units::{Axis, ConversionFailure, ConversionRegistry};

/// Why a normalized value is null.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum NullReason {
    UnsupportedUnit,
    InvalidValue,
    Mixture,
    UnresolvedMolarMass,
}

impl NullReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            NullReason::UnsupportedUnit => "unsupported_unit",
            NullReason::InvalidValue => "invalid_value",
            NullReason::Mixture => "mixture",
            NullReason::UnresolvedMolarMass => "unresolved_molar_mass",
        }
    }
}

impl From<ConversionFailure> for NullReason {
    fn from(failure: ConversionFailure) -> Self {
        match failure {
            ConversionFailure::UnsupportedUnit => NullReason::UnsupportedUnit,
            ConversionFailure::UnresolvedMolarMass => NullReason::UnresolvedMolarMass,
        }
    }
}

/// Units and adsorbates shared by every point of one isotherm.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct UnitContext {
    pub pressure_unit: Option<String>,
    pub adsorption_unit: Option<String>,
    /// InChIKeys of the adsorbed gases.
    pub adsorbates: Vec<String>,
}

/// One axis of a normalized point. Exactly one of `value` and `reason` is set;
/// the original value and unit are always kept.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AxisValue {
    pub original_value: Option<f64>,
    pub original_unit: Option<String>,
    pub value: Option<f64>,
    pub reason: Option<NullReason>,
}

impl AxisValue {
    fn converted(original_value: f64, original_unit: Option<String>, value: f64) -> Self {
        Self {
            original_value: Some(original_value),
            original_unit,
            value: Some(value),
            reason: None,
        }
    }

    fn null(original_value: Option<f64>, original_unit: Option<String>, reason: NullReason) -> Self {
        Self {
            original_value,
            original_unit,
            value: None,
            reason: Some(reason),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct NormalizedPoint {
    pub pressure: AxisValue,
    pub adsorption: AxisValue,
}

impl NormalizedPoint {
    pub fn is_complete(&self) -> bool {
        self.pressure.value.is_some() && self.adsorption.value.is_some()
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct NormalizationStats {
    pub total_points: usize,
    pub pressure_converted: usize,
    pub adsorption_converted: usize,
    pub fully_normalized: usize,
    pub pressure_reasons: BTreeMap<String, usize>,
    pub adsorption_reasons: BTreeMap<String, usize>,
    /// Isotherms per original pressure unit.
    pub pressure_units: BTreeMap<String, usize>,
    /// Isotherms per original adsorption unit.
    pub adsorption_units: BTreeMap<String, usize>,
}

#[derive(Debug, Clone)]
pub struct Normalizer {
    registry: ConversionRegistry,
}

impl Normalizer {
    pub fn new(registry: ConversionRegistry) -> Self {
        Self { registry }
    }

    pub fn registry(&self) -> &ConversionRegistry {
        &self.registry
    }

    pub fn normalize(&self, point: &RawPoint, context: &UnitContext) -> NormalizedPoint {
        if context.adsorbates.len() > 1 {
            return NormalizedPoint {
                pressure: AxisValue::null(
                    point.pressure,
                    context.pressure_unit.clone(),
                    NullReason::Mixture,
                ),
                adsorption: AxisValue::null(
                    point.total_adsorption,
                    context.adsorption_unit.clone(),
                    NullReason::Mixture,
                ),
            };
        }
        let gas = context
            .adsorbates
            .first()
            .map(String::as_str)
            .filter(|gas| !gas.is_empty());
        NormalizedPoint {
            pressure: self.axis(Axis::Pressure, point.pressure, &context.pressure_unit, gas),
            adsorption: self.axis(
                Axis::Adsorption,
                point.total_adsorption,
                &context.adsorption_unit,
                gas,
            ),
        }
    }

    fn axis(
        &self,
        axis: Axis,
        raw: Option<f64>,
        unit: &Option<String>,
        gas: Option<&str>,
    ) -> AxisValue {
        let value = match raw {
            Some(value) if value.is_finite() && value >= 0.0 => value,
            other => return AxisValue::null(other, unit.clone(), NullReason::InvalidValue),
        };
        let Some(unit_name) = unit.as_deref() else {
            return AxisValue::null(Some(value), None, NullReason::UnsupportedUnit);
        };
        match self.registry.to_standard(axis, unit_name, value, gas) {
            Ok(converted) if converted.is_finite() && converted >= 0.0 => {
                AxisValue::converted(value, unit.clone(), converted)
            }
            Ok(_) => AxisValue::null(Some(value), unit.clone(), NullReason::InvalidValue),
            Err(failure) => {
                if failure == ConversionFailure::UnresolvedMolarMass {
                    debug!(%axis, unit = unit_name, gas, "no molar mass for conversion");
                }
                AxisValue::null(Some(value), unit.clone(), failure.into())
            }
        }
    }

    /// Recomputes the derived table from every stored raw point.
    pub fn renormalize(&self, store: &Store) -> Result<NormalizationStats, SyncError> {
        let mut unresolved = 0usize;
        let written = store.rebuild_normalized(|stored| {
            let normalized = self.normalize(&stored.point, &stored.context);
            if normalized.adsorption.reason == Some(NullReason::UnresolvedMolarMass) {
                unresolved += 1;
            }
            normalized
        })?;
        if unresolved > 0 {
            warn!(
                points = unresolved,
                "adsorption values left null for lack of a molar mass"
            );
        }
        let stats = store.normalization_stats()?;
        info!(
            points = written,
            complete = stats.fully_normalized,
            "normalized points rebuilt"
        );
        Ok(stats)
    }
}

impl Default for Normalizer {
    fn default() -> Self {
        Self::new(ConversionRegistry::builtin())
    }
}

#[cfg(test)]
mod tests {
    use serde_json::Value;

    use super::*;

    fn point(pressure: f64, adsorption: f64) -> RawPoint {
        RawPoint {
            pressure: Some(pressure),
            total_adsorption: Some(adsorption),
            species_data: Value::Null,
        }
    }

    fn context(pressure: &str, adsorption: &str, adsorbates: &[&str]) -> UnitContext {
        UnitContext {
            pressure_unit: Some(pressure.to_string()),
            adsorption_unit: Some(adsorption.to_string()),
            adsorbates: adsorbates.iter().map(|gas| gas.to_string()).collect(),
        }
    }

    const CO2: &str = "CURLTUGMZLYLDI-UHFFFAOYSA-N";

    #[test]
    fn converts_both_axes() {
        let normalizer = Normalizer::default();
        let result = normalizer.normalize(&point(1.0, 2.5), &context("bar", "mmol/g", &[CO2]));
        assert_eq!(result.pressure.value, Some(100_000.0));
        assert_eq!(result.adsorption.value, Some(2.5));
        assert!(result.is_complete());

        let result = normalizer.normalize(&point(1.0, 2.5), &context("atm", "mol/kg", &[CO2]));
        assert_eq!(result.pressure.value, Some(101_325.0));
    }

    #[test]
    fn negative_value_is_invalid() {
        let normalizer = Normalizer::default();
        let result = normalizer.normalize(&point(-0.5, 1.0), &context("bar", "mmol/g", &[CO2]));
        assert_eq!(result.pressure.value, None);
        assert_eq!(result.pressure.reason, Some(NullReason::InvalidValue));
        assert_eq!(result.pressure.original_value, Some(-0.5));
        assert_eq!(result.adsorption.value, Some(1.0));
    }

    #[test]
    fn area_unit_keeps_raw_value() {
        let normalizer = Normalizer::default();
        let result = normalizer.normalize(&point(1.0, 0.8), &context("bar", "mg/m2", &[CO2]));
        assert_eq!(result.adsorption.value, None);
        assert_eq!(result.adsorption.reason, Some(NullReason::UnsupportedUnit));
        assert_eq!(result.adsorption.original_value, Some(0.8));
        assert_eq!(result.adsorption.original_unit.as_deref(), Some("mg/m2"));
        assert_eq!(result.pressure.value, Some(100_000.0));
    }

    #[test]
    fn mixtures_are_not_converted() {
        let normalizer = Normalizer::default();
        let result = normalizer.normalize(
            &point(1.0, 1.0),
            &context("bar", "mmol/g", &[CO2, "IJGRMHOSHXDMSA-UHFFFAOYSA-N"]),
        );
        assert_eq!(result.pressure.reason, Some(NullReason::Mixture));
        assert_eq!(result.adsorption.reason, Some(NullReason::Mixture));
    }

    #[test]
    fn keyless_component_still_counts_as_mixture() {
        let normalizer = Normalizer::default();
        let result = normalizer.normalize(&point(1.0, 2.0), &context("bar", "mmol/g", &[CO2, ""]));
        assert_eq!(result.pressure.value, None);
        assert_eq!(result.pressure.reason, Some(NullReason::Mixture));
        assert_eq!(result.adsorption.reason, Some(NullReason::Mixture));
        assert_eq!(result.adsorption.original_value, Some(2.0));
    }

    #[test]
    fn negative_conversion_result_is_invalid() {
        let registry = ConversionRegistry::from_json(
            r#"{"conversions": [
                {"from": "barg", "to": "Pa", "axis": "pressure", "factor": 1.0, "offset": -5.0}
            ]}"#,
        )
        .unwrap();
        let normalizer = Normalizer::new(registry);
        let result = normalizer.normalize(&point(1.0, 1.0), &context("barg", "mmol/g", &[CO2]));
        assert_eq!(result.pressure.value, None);
        assert_eq!(result.pressure.reason, Some(NullReason::InvalidValue));
        assert_eq!(result.pressure.original_value, Some(1.0));

        let result = normalizer.normalize(&point(10.0, 1.0), &context("barg", "mmol/g", &[CO2]));
        assert_eq!(result.pressure.value, Some(5.0));
    }

    #[test]
    fn molar_mass_fails_closed() {
        let normalizer = Normalizer::default();
        let result = normalizer.normalize(&point(1.0, 10.0), &context("bar", "mg/g", &[]));
        assert_eq!(result.adsorption.reason, Some(NullReason::UnresolvedMolarMass));

        let result = normalizer.normalize(&point(1.0, 10.0), &context("bar", "mg/g", &[""]));
        assert_eq!(result.adsorption.reason, Some(NullReason::UnresolvedMolarMass));

        let result = normalizer.normalize(&point(1.0, 44.0095), &context("bar", "mg/g", &[CO2]));
        let value = result.adsorption.value.unwrap();
        assert!((value - 1.0).abs() < 1e-12);
    }

    #[test]
    fn missing_unit_or_value() {
        let normalizer = Normalizer::default();
        let raw = RawPoint {
            pressure: None,
            total_adsorption: Some(1.0),
            species_data: Value::Null,
        };
        let ctx = UnitContext {
            pressure_unit: Some("bar".to_string()),
            adsorption_unit: None,
            adsorbates: vec![CO2.to_string()],
        };
        let result = normalizer.normalize(&raw, &ctx);
        assert_eq!(result.pressure.reason, Some(NullReason::InvalidValue));
        assert_eq!(result.adsorption.reason, Some(NullReason::UnsupportedUnit));
    }
}
