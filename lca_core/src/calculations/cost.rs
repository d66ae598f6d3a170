//! # Cost Calculation
//!
//! One cost record per element, independent of its material layers:
//!
//! ```text
//! cost = quantity × cost_per_unit
//! ```
//!
//! The quantity follows the declared unit of the matched cost entry:
//!
//! | Unit     | Quantity                                  |
//! |----------|-------------------------------------------|
//! | `area`   | net area if present, else gross area (m²) |
//! | `length` | length (m)                                |
//! | other    | unsupported, record fails                 |

use std::sync::Arc;

use tracing::{debug, warn};

use super::{CalculationResult, CostValues, Failure, FailureReason, Indicators, Outcome, Processor, ResultKind};
use crate::elements::{Element, ElementBatch, Geometry};
use crate::errors::{EngineError, EngineResult};
use crate::reference::{CostTable, PinnedVersions, ReferencePin, UnitType};
use crate::units::{round3, Meters, SquareMeters};

/// Element quantity in the unit a cost rate is declared in.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Quantity {
    Area(SquareMeters),
    Length(Meters),
}

impl Quantity {
    /// Quantity of `geometry` for `unit`.
    ///
    /// `Err` for unsupported units, `Ok(None)` when the value is absent.
    pub fn of(geometry: &Geometry, unit: &UnitType) -> Result<Option<Quantity>, String> {
        match unit {
            UnitType::Area => Ok(geometry
                .area_net
                .or(geometry.area_gross)
                .map(|a| Quantity::Area(SquareMeters(a)))),
            UnitType::Length => Ok(geometry.length.map(|l| Quantity::Length(Meters(l)))),
            UnitType::Other(other) => Err(other.clone()),
        }
    }

    pub fn value(&self) -> f64 {
        match self {
            Quantity::Area(a) => a.0,
            Quantity::Length(l) => l.0,
        }
    }
}

/// Cost engine bound to one reference pin.
#[derive(Debug, Clone)]
pub struct CostProcessor {
    requested_version: String,
    versions: PinnedVersions,
    cost: Arc<CostTable>,
}

impl CostProcessor {
    pub fn new(pin: &ReferencePin) -> Self {
        CostProcessor {
            requested_version: pin.requested().to_string(),
            versions: pin.versions(),
            cost: Arc::clone(&pin.cost),
        }
    }

    fn record(&self, element: &Element, reference_key: Option<&str>, outcome: Outcome<Indicators>) -> CalculationResult {
        CalculationResult {
            element_id: element.id.clone(),
            kind: ResultKind::Cost,
            material_name: None,
            classification_code: element.code().map(str::to_string),
            reference_key: reference_key.map(str::to_string),
            versions: self.versions.clone(),
            outcome,
        }
    }
}

impl Processor for CostProcessor {
    fn name(&self) -> &'static str {
        "cost"
    }

    fn validate(&self, batch: &ElementBatch) -> EngineResult<()> {
        if batch.reference_version.trim() != self.requested_version {
            return Err(EngineError::invalid_input(
                "reference_version",
                &batch.reference_version,
                format!("processor is pinned to version '{}'", self.requested_version),
            ));
        }
        Ok(())
    }

    fn compute(&self, element: &Element) -> Vec<CalculationResult> {
        let fail = |key: Option<&str>, reason: FailureReason, detail: String| {
            vec![self.record(element, key, Outcome::Failed(Failure::new(reason, detail)))]
        };

        let Some(code) = element.code() else {
            return fail(
                None,
                FailureReason::MissingCostReference,
                format!("element '{}' has no classification code", element.id),
            );
        };

        let Some(entry) = self.cost.get(code) else {
            warn!(element = %element.id, code, version = %self.cost.version(), "no cost reference");
            return fail(
                None,
                FailureReason::MissingCostReference,
                format!("no cost entry for '{}' in version {}", code, self.cost.version()),
            );
        };

        let quantity = match Quantity::of(&element.geometry, &entry.unit) {
            Ok(q) => q.filter(|q| q.value().is_finite() && q.value() > 0.0),
            Err(unit) => {
                return fail(
                    Some(code),
                    FailureReason::UnknownUnitType,
                    format!("cost entry '{}' declares unsupported unit '{}'", code, unit),
                );
            }
        };

        let Some(quantity) = quantity else {
            return fail(
                Some(code),
                FailureReason::MissingQuantity,
                format!("element '{}' has no positive {} for code '{}'", element.id, entry.unit, code),
            );
        };

        let total = quantity.value() * entry.cost_per_unit;
        debug!(element = %element.id, code, quantity = quantity.value(), total, "cost computed");

        vec![self.record(
            element,
            Some(code),
            Outcome::Valid(Indicators::Cost(CostValues {
                quantity: round3(quantity.value()),
                unit: entry.unit.clone(),
                unit_cost: round3(entry.cost_per_unit),
                total_cost: round3(total),
            })),
        )]
    }
}
