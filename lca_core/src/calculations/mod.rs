//! # Calculations
//!
//! Per-element calculation engines. Each engine implements [`Processor`]:
//!
//! - `validate(batch)` - batch-level preconditions, failing the whole batch
//! - `compute(element)` - pure per-element calculation returning result records
//!
//! Record-level problems never fail a batch. They produce a result record
//! whose outcome is [`Outcome::Failed`] with a canonical [`FailureReason`].
//!
//! ## Available Engines
//!
//! - [`lca`] - environmental indicators per material layer
//! - [`cost`] - construction cost per element

pub mod cost;
pub mod lca;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::elements::{Element, ElementBatch};
use crate::errors::EngineResult;
use crate::reference::{PinnedVersions, UnitType};

pub use cost::CostProcessor;
pub use lca::LcaProcessor;

/// Capability interface shared by the calculation engines.
pub trait Processor: Send + Sync {
    /// Short name used in logs
    fn name(&self) -> &'static str;

    /// Reject a batch this processor cannot handle
    fn validate(&self, batch: &ElementBatch) -> EngineResult<()>;

    /// Result records for one element. Must not fail.
    fn compute(&self, element: &Element) -> Vec<CalculationResult>;
}

/// Valid value or a recorded failure.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "state", content = "value", rename_all = "snake_case")]
pub enum Outcome<T> {
    Valid(T),
    Failed(Failure),
}

impl<T> Outcome<T> {
    pub fn is_valid(&self) -> bool {
        matches!(self, Outcome::Valid(_))
    }

    pub fn valid(&self) -> Option<&T> {
        match self {
            Outcome::Valid(v) => Some(v),
            Outcome::Failed(_) => None,
        }
    }

    pub fn failure(&self) -> Option<&Failure> {
        match self {
            Outcome::Valid(_) => None,
            Outcome::Failed(f) => Some(f),
        }
    }
}

/// Error taxonomy for failed records and processing errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCategory {
    /// Material or classification code unresolved
    Mapping,
    /// Missing or invalid volume, density or quantity
    InputValidation,
    /// Unknown cost unit type
    UnsupportedData,
}

impl ErrorCategory {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorCategory::Mapping => "mapping",
            ErrorCategory::InputValidation => "input_validation",
            ErrorCategory::UnsupportedData => "unsupported_data",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "mapping" => Some(ErrorCategory::Mapping),
            "input_validation" => Some(ErrorCategory::InputValidation),
            "unsupported_data" => Some(ErrorCategory::UnsupportedData),
            _ => None,
        }
    }
}

/// Canonical failure reasons.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureReason {
    UnmappedMaterial,
    ReferenceMaterialNotFound,
    MissingDensity,
    InvalidVolume,
    NoMaterialLayers,
    MissingCostReference,
    UnknownUnitType,
    MissingQuantity,
}

impl FailureReason {
    /// Canonical reason string stored on the record
    pub fn as_str(&self) -> &'static str {
        match self {
            FailureReason::UnmappedMaterial => "unmapped material",
            FailureReason::ReferenceMaterialNotFound => "reference material not found",
            FailureReason::MissingDensity => "missing density",
            FailureReason::InvalidVolume => "invalid volume",
            FailureReason::NoMaterialLayers => "no material layers",
            FailureReason::MissingCostReference => "missing cost reference",
            FailureReason::UnknownUnitType => "unknown unit type",
            FailureReason::MissingQuantity => "missing quantity",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        [
            FailureReason::UnmappedMaterial,
            FailureReason::ReferenceMaterialNotFound,
            FailureReason::MissingDensity,
            FailureReason::InvalidVolume,
            FailureReason::NoMaterialLayers,
            FailureReason::MissingCostReference,
            FailureReason::UnknownUnitType,
            FailureReason::MissingQuantity,
        ]
        .into_iter()
        .find(|r| r.as_str() == s)
    }

    pub fn category(&self) -> ErrorCategory {
        match self {
            FailureReason::UnmappedMaterial
            | FailureReason::ReferenceMaterialNotFound
            | FailureReason::MissingCostReference => ErrorCategory::Mapping,
            FailureReason::MissingDensity
            | FailureReason::InvalidVolume
            | FailureReason::NoMaterialLayers
            | FailureReason::MissingQuantity => ErrorCategory::InputValidation,
            FailureReason::UnknownUnitType => ErrorCategory::UnsupportedData,
        }
    }
}

impl std::fmt::Display for FailureReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// A failed record: canonical reason plus a human-readable detail.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Failure {
    pub reason: FailureReason,
    pub detail: String,
}

impl Failure {
    pub fn new(reason: FailureReason, detail: impl Into<String>) -> Self {
        Failure {
            reason,
            detail: detail.into(),
        }
    }
}

/// Which engine produced a record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResultKind {
    Lca,
    Cost,
}

impl ResultKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ResultKind::Lca => "lca",
            ResultKind::Cost => "cost",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "lca" => Some(ResultKind::Lca),
            "cost" => Some(ResultKind::Cost),
            _ => None,
        }
    }
}

impl std::fmt::Display for ResultKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Indicators divided by the project's reference floor area.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PerAreaValues {
    pub gwp: f64,
    pub penr: f64,
    pub ubp: f64,
}

/// Environmental indicators of one material layer, rounded to 3 decimals.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LcaValues {
    /// Layer volume (m³)
    pub volume: f64,
    /// Density used (kg/m³)
    pub density: f64,
    /// Mass (kg)
    pub mass: f64,
    /// Amortization period (years)
    pub life_span_years: u32,
    /// Life-expectancy entry that matched; `None` when the default applied
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub life_span_code: Option<String>,
    pub gwp_absolute: f64,
    pub gwp_per_year: f64,
    pub penr_absolute: f64,
    pub penr_per_year: f64,
    pub ubp_absolute: f64,
    pub ubp_per_year: f64,
    /// Annual values per m² floor area, when the project has one
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub per_area: Option<PerAreaValues>,
}

/// Cost of one element, rounded to 3 decimals.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CostValues {
    /// Quantity in the declared unit
    pub quantity: f64,
    pub unit: UnitType,
    pub unit_cost: f64,
    pub total_cost: f64,
}

/// Values of a valid record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum Indicators {
    Lca(LcaValues),
    Cost(CostValues),
}

impl Indicators {
    pub fn lca(&self) -> Option<&LcaValues> {
        match self {
            Indicators::Lca(v) => Some(v),
            Indicators::Cost(_) => None,
        }
    }

    pub fn cost(&self) -> Option<&CostValues> {
        match self {
            Indicators::Cost(v) => Some(v),
            Indicators::Lca(_) => None,
        }
    }
}

/// One result record. Carries no timestamps; identical inputs produce
/// identical records.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CalculationResult {
    /// Element identifier (GUID)
    pub element_id: String,
    pub kind: ResultKind,
    /// Source material name (LCA records only)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub material_name: Option<String>,
    /// Element classification code
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub classification_code: Option<String>,
    /// Resolved material key or cost code
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reference_key: Option<String>,
    /// Reference versions the record was computed against
    pub versions: PinnedVersions,
    pub outcome: Outcome<Indicators>,
}

impl CalculationResult {
    pub fn is_valid(&self) -> bool {
        self.outcome.is_valid()
    }

    pub fn failure(&self) -> Option<&Failure> {
        self.outcome.failure()
    }

    pub fn lca(&self) -> Option<&LcaValues> {
        self.outcome.valid().and_then(Indicators::lca)
    }

    pub fn cost(&self) -> Option<&CostValues> {
        self.outcome.valid().and_then(Indicators::cost)
    }
}

/// A record-level error, persisted alongside the failed result record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProcessingError {
    pub project_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub element_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub material_name: Option<String>,
    pub kind: ResultKind,
    pub category: ErrorCategory,
    /// Canonical reason
    pub reason: FailureReason,
    /// Detail message
    pub message: String,
    pub created_at: DateTime<Utc>,
}

impl ProcessingError {
    /// Error row for a failed record; `None` for valid ones.
    pub fn from_result(project_id: &str, result: &CalculationResult, at: DateTime<Utc>) -> Option<Self> {
        let failure = result.failure()?;
        Some(ProcessingError {
            project_id: project_id.to_string(),
            element_id: Some(result.element_id.clone()),
            material_name: result.material_name.clone(),
            kind: result.kind,
            category: failure.reason.category(),
            reason: failure.reason,
            message: failure.detail.clone(),
            created_at: at,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reason_strings_roundtrip() {
        for reason in [
            FailureReason::MissingDensity,
            FailureReason::InvalidVolume,
            FailureReason::UnknownUnitType,
            FailureReason::NoMaterialLayers,
        ] {
            assert_eq!(FailureReason::parse(reason.as_str()), Some(reason));
        }
        assert_eq!(FailureReason::MissingDensity.as_str(), "missing density");
        assert_eq!(FailureReason::parse("something else"), None);
    }

    #[test]
    fn test_reason_categories() {
        assert_eq!(FailureReason::UnmappedMaterial.category(), ErrorCategory::Mapping);
        assert_eq!(FailureReason::MissingQuantity.category(), ErrorCategory::InputValidation);
        assert_eq!(FailureReason::UnknownUnitType.category(), ErrorCategory::UnsupportedData);
    }

    #[test]
    fn test_processing_error_only_for_failures() {
        let versions = PinnedVersions {
            materials: "2024".to_string(),
            life_expectancy: "2024".to_string(),
            cost: "2024".to_string(),
        };
        let failed = CalculationResult {
            element_id: "e1".to_string(),
            kind: ResultKind::Cost,
            material_name: None,
            classification_code: Some("X9".to_string()),
            reference_key: None,
            versions: versions.clone(),
            outcome: Outcome::Failed(Failure::new(FailureReason::MissingCostReference, "no cost for X9")),
        };
        let error = ProcessingError::from_result("P-1", &failed, Utc::now()).unwrap();
        assert_eq!(error.category, ErrorCategory::Mapping);
        assert_eq!(error.element_id.as_deref(), Some("e1"));

        let valid = CalculationResult {
            outcome: Outcome::Valid(Indicators::Cost(CostValues {
                quantity: 1.0,
                unit: UnitType::Area,
                unit_cost: 2.0,
                total_cost: 2.0,
            })),
            ..failed
        };
        assert!(ProcessingError::from_result("P-1", &valid, Utc::now()).is_none());
    }

    #[test]
    fn test_outcome_serialization() {
        let outcome: Outcome<f64> = Outcome::Failed(Failure::new(FailureReason::MissingDensity, "layer Beton"));
        let json = serde_json::to_string(&outcome).unwrap();
        assert!(json.contains("\"state\":\"failed\""));
        assert!(json.contains("\"missing_density\""));
    }
}
