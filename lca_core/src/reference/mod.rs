//! # Reference Data
//!
//! Versioned lookup tables joined against building elements:
//!
//! - **Materials**: environmental indicator coefficients (GWP, PENR, UBP per
//!   kg) plus the mapping from source material names to material keys
//! - **Life expectancy**: amortization periods keyed by classification code
//! - **Cost**: unit costs keyed by classification code
//!
//! A table is validated once at ingestion and never mutated afterwards.
//! Corrections are loaded as a new version. Tables are shared as
//! `Arc<...>` snapshots so a running batch keeps reading the version it
//! pinned while newer versions are loaded and activated.
//!
//! ## Example
//!
//! ```rust
//! use lca_core::reference::{MaterialTable, ReferenceMaterial, MaterialMapping};
//!
//! let table = MaterialTable::new(
//!     "2024",
//!     vec![ReferenceMaterial::new("kbob-01", "Beton C30/37", 0.1, 0.2, 150.0).with_density(2300.0)],
//!     vec![MaterialMapping::new("Beton", "kbob-01")],
//! ).unwrap();
//!
//! assert_eq!(table.get("kbob-01").unwrap().default_density, Some(2300.0));
//! ```

pub mod life_expectancy;
pub mod store;

pub use life_expectancy::{LifeExpectancyEntry, LifeExpectancyTable, LifeSpan};
pub use store::{PinnedVersions, ReferencePin, ReferenceStore};

use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;

use serde::{Deserialize, Deserializer, Serialize};

use crate::errors::{EngineError, EngineResult};

/// The three independently versioned datasets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReferenceKind {
    Materials,
    LifeExpectancy,
    Cost,
}

impl ReferenceKind {
    /// All kinds, in pin-resolution order
    pub const ALL: [ReferenceKind; 3] = [
        ReferenceKind::Materials,
        ReferenceKind::LifeExpectancy,
        ReferenceKind::Cost,
    ];

    /// Column value
    pub fn as_str(&self) -> &'static str {
        match self {
            ReferenceKind::Materials => "materials",
            ReferenceKind::LifeExpectancy => "life_expectancy",
            ReferenceKind::Cost => "cost",
        }
    }

    /// Parse a column value
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "materials" => Some(ReferenceKind::Materials),
            "life_expectancy" => Some(ReferenceKind::LifeExpectancy),
            "cost" => Some(ReferenceKind::Cost),
            _ => None,
        }
    }
}

impl std::fmt::Display for ReferenceKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

// ============================================================================
// Materials
// ============================================================================

/// Environmental indicator coefficients of one reference material.
///
/// Coefficients are per kilogram; `default_density` (kg/m³) is used when a
/// material layer carries no density of its own.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReferenceMaterial {
    /// Material key (e.g. the KBOB UUID)
    pub key: String,
    /// Material name
    pub name: String,
    /// Greenhouse-gas emissions (kg CO2-eq / kg)
    pub gwp: f64,
    /// Non-renewable primary energy (kWh oil-eq / kg)
    pub penr: f64,
    /// Environmental impact points (UBP / kg)
    pub ubp: f64,
    /// Default density; ranges such as "1400 - 1500" resolve to the midpoint
    #[serde(default, deserialize_with = "deserialize_density", skip_serializing_if = "Option::is_none")]
    pub default_density: Option<f64>,
}

impl ReferenceMaterial {
    pub fn new(key: impl Into<String>, name: impl Into<String>, gwp: f64, penr: f64, ubp: f64) -> Self {
        ReferenceMaterial {
            key: key.into(),
            name: name.into(),
            gwp,
            penr,
            ubp,
            default_density: None,
        }
    }

    /// Builder-style default density
    pub fn with_density(mut self, density: f64) -> Self {
        self.default_density = Some(density);
        self
    }
}

/// Source material name → reference material key.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MaterialMapping {
    /// Material name as it appears in building models
    pub source_name: String,
    /// Key of the reference material
    pub material_key: String,
}

impl MaterialMapping {
    pub fn new(source_name: impl Into<String>, material_key: impl Into<String>) -> Self {
        MaterialMapping {
            source_name: source_name.into(),
            material_key: material_key.into(),
        }
    }
}

/// One version of the materials dataset with its mapping table.
#[derive(Debug, Clone, PartialEq)]
pub struct MaterialTable {
    version: String,
    materials: BTreeMap<String, ReferenceMaterial>,
    mappings: Vec<MaterialMapping>,
}

impl MaterialTable {
    /// Validate and build a materials version.
    pub fn new(version: impl Into<String>, materials: Vec<ReferenceMaterial>, mappings: Vec<MaterialMapping>) -> EngineResult<Self> {
        let version = validate_version(ReferenceKind::Materials, version.into())?;
        let invalid = |reason: String| EngineError::invalid_reference("materials", version.clone(), reason);

        let mut by_key = BTreeMap::new();
        for mut material in materials {
            material.key = material.key.trim().to_string();
            if material.key.is_empty() {
                return Err(invalid(format!("material '{}' has an empty key", material.name)));
            }
            for (label, value) in [("gwp", material.gwp), ("penr", material.penr), ("ubp", material.ubp)] {
                if !value.is_finite() {
                    return Err(invalid(format!("material '{}' has a non-finite {} coefficient", material.key, label)));
                }
            }
            if let Some(density) = material.default_density {
                if !density.is_finite() || density < 0.0 {
                    return Err(invalid(format!("material '{}' has an invalid density {}", material.key, density)));
                }
                // Zero marks an unknown density in the source tables
                if density == 0.0 {
                    material.default_density = None;
                }
            }
            if by_key.contains_key(&material.key) {
                return Err(invalid(format!("duplicate material key '{}'", material.key)));
            }
            by_key.insert(material.key.clone(), material);
        }

        let mut seen = HashSet::new();
        let mut clean_mappings = Vec::with_capacity(mappings.len());
        for mut mapping in mappings {
            mapping.material_key = mapping.material_key.trim().to_string();
            if mapping.source_name.trim().is_empty() {
                return Err(invalid("mapping with an empty source name".to_string()));
            }
            if !by_key.contains_key(&mapping.material_key) {
                return Err(invalid(format!(
                    "mapping '{}' points to unknown material '{}'",
                    mapping.source_name, mapping.material_key
                )));
            }
            if seen.insert((mapping.source_name.clone(), mapping.material_key.clone())) {
                clean_mappings.push(mapping);
            }
        }

        Ok(MaterialTable {
            version,
            materials: by_key,
            mappings: clean_mappings,
        })
    }

    /// Version tag
    pub fn version(&self) -> &str {
        &self.version
    }

    /// Material by key
    pub fn get(&self, key: &str) -> Option<&ReferenceMaterial> {
        self.materials.get(key)
    }

    /// All materials, ordered by key
    pub fn materials(&self) -> impl Iterator<Item = &ReferenceMaterial> {
        self.materials.values()
    }

    /// Mapping rows, in load order
    pub fn mappings(&self) -> &[MaterialMapping] {
        &self.mappings
    }

    pub fn len(&self) -> usize {
        self.materials.len()
    }

    pub fn is_empty(&self) -> bool {
        self.materials.is_empty()
    }
}

// ============================================================================
// Cost
// ============================================================================

/// Unit a cost rate is declared in.
///
/// Accepts `area`/`m2`/`m²` and `length`/`m`; anything else is kept verbatim
/// as `Other` and rejected by the cost engine at calculation time.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum UnitType {
    Area,
    Length,
    Other(String),
}

impl UnitType {
    pub fn parse(s: &str) -> Self {
        match s.trim().to_lowercase().as_str() {
            "area" | "m2" | "m²" => UnitType::Area,
            "length" | "m" => UnitType::Length,
            _ => UnitType::Other(s.trim().to_string()),
        }
    }

    pub fn as_str(&self) -> &str {
        match self {
            UnitType::Area => "area",
            UnitType::Length => "length",
            UnitType::Other(s) => s,
        }
    }
}

impl From<String> for UnitType {
    fn from(s: String) -> Self {
        UnitType::parse(&s)
    }
}

impl From<UnitType> for String {
    fn from(unit: UnitType) -> Self {
        unit.as_str().to_string()
    }
}

impl std::fmt::Display for UnitType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Unit cost of a classification code.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CostReferenceEntry {
    /// Classification code (eBKP-H)
    pub code: String,
    /// Description
    #[serde(default)]
    pub description: String,
    /// Declared unit of `cost_per_unit`
    pub unit: UnitType,
    /// Cost per declared unit
    pub cost_per_unit: f64,
}

impl CostReferenceEntry {
    pub fn new(code: impl Into<String>, unit: UnitType, cost_per_unit: f64) -> Self {
        CostReferenceEntry {
            code: code.into(),
            description: String::new(),
            unit,
            cost_per_unit,
        }
    }
}

/// One version of the cost dataset. Identity is (code, version).
#[derive(Debug, Clone, PartialEq)]
pub struct CostTable {
    version: String,
    entries: BTreeMap<String, CostReferenceEntry>,
}

impl CostTable {
    /// Validate and build a cost version.
    pub fn new(version: impl Into<String>, entries: Vec<CostReferenceEntry>) -> EngineResult<Self> {
        let version = validate_version(ReferenceKind::Cost, version.into())?;
        let mut by_code = BTreeMap::new();
        for mut entry in entries {
            entry.code = entry.code.trim().to_string();
            if entry.code.is_empty() {
                return Err(EngineError::invalid_reference("cost", &version, "entry with an empty code"));
            }
            if !entry.cost_per_unit.is_finite() || entry.cost_per_unit < 0.0 {
                return Err(EngineError::invalid_reference(
                    "cost",
                    &version,
                    format!("code '{}' has an invalid cost {}", entry.code, entry.cost_per_unit),
                ));
            }
            if by_code.contains_key(&entry.code) {
                return Err(EngineError::invalid_reference(
                    "cost",
                    &version,
                    format!("duplicate code '{}'", entry.code),
                ));
            }
            by_code.insert(entry.code.clone(), entry);
        }
        Ok(CostTable {
            version,
            entries: by_code,
        })
    }

    pub fn version(&self) -> &str {
        &self.version
    }

    /// Exact (trimmed) code lookup
    pub fn get(&self, code: &str) -> Option<&CostReferenceEntry> {
        self.entries.get(code.trim())
    }

    pub fn entries(&self) -> impl Iterator<Item = &CostReferenceEntry> {
        self.entries.values()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

// ============================================================================
// Ingestion payloads
// ============================================================================

/// Raw rows for `load_reference_version`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ReferenceRows {
    Materials {
        materials: Vec<ReferenceMaterial>,
        #[serde(default)]
        mappings: Vec<MaterialMapping>,
    },
    LifeExpectancy {
        entries: Vec<LifeExpectancyEntry>,
    },
    Cost {
        entries: Vec<CostReferenceEntry>,
    },
}

impl ReferenceRows {
    /// Dataset these rows belong to
    pub fn kind(&self) -> ReferenceKind {
        match self {
            ReferenceRows::Materials { .. } => ReferenceKind::Materials,
            ReferenceRows::LifeExpectancy { .. } => ReferenceKind::LifeExpectancy,
            ReferenceRows::Cost { .. } => ReferenceKind::Cost,
        }
    }

    /// Validate into an immutable table
    pub fn into_table(self, version: impl Into<String>) -> EngineResult<ReferenceTable> {
        Ok(match self {
            ReferenceRows::Materials { materials, mappings } => {
                ReferenceTable::Materials(Arc::new(MaterialTable::new(version, materials, mappings)?))
            }
            ReferenceRows::LifeExpectancy { entries } => {
                ReferenceTable::LifeExpectancy(Arc::new(LifeExpectancyTable::new(version, entries)?))
            }
            ReferenceRows::Cost { entries } => ReferenceTable::Cost(Arc::new(CostTable::new(version, entries)?)),
        })
    }
}

/// A validated, immutable table of one kind and version.
#[derive(Debug, Clone)]
pub enum ReferenceTable {
    Materials(Arc<MaterialTable>),
    LifeExpectancy(Arc<LifeExpectancyTable>),
    Cost(Arc<CostTable>),
}

impl ReferenceTable {
    pub fn kind(&self) -> ReferenceKind {
        match self {
            ReferenceTable::Materials(_) => ReferenceKind::Materials,
            ReferenceTable::LifeExpectancy(_) => ReferenceKind::LifeExpectancy,
            ReferenceTable::Cost(_) => ReferenceKind::Cost,
        }
    }

    pub fn version(&self) -> &str {
        match self {
            ReferenceTable::Materials(t) => t.version(),
            ReferenceTable::LifeExpectancy(t) => t.version(),
            ReferenceTable::Cost(t) => t.version(),
        }
    }

    /// Number of data rows (mappings excluded)
    pub fn row_count(&self) -> usize {
        match self {
            ReferenceTable::Materials(t) => t.len(),
            ReferenceTable::LifeExpectancy(t) => t.len(),
            ReferenceTable::Cost(t) => t.len(),
        }
    }
}

// ============================================================================
// Helpers
// ============================================================================

fn validate_version(kind: ReferenceKind, version: String) -> EngineResult<String> {
    let trimmed = version.trim();
    if trimmed.is_empty() {
        return Err(EngineError::invalid_reference(kind.as_str(), version, "version tag must not be empty"));
    }
    Ok(trimmed.to_string())
}

/// Parse a density cell: a number, or a range "low - high" (midpoint).
pub fn parse_density(raw: &str) -> Option<f64> {
    let raw = raw.trim();
    if let Some((low, high)) = raw.split_once('-') {
        let low: f64 = low.trim().parse().ok()?;
        let high: f64 = high.trim().parse().ok()?;
        return Some((low + high) / 2.0);
    }
    raw.parse().ok()
}

fn deserialize_density<'de, D>(deserializer: D) -> Result<Option<f64>, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Cell {
        Number(f64),
        Text(String),
    }

    Ok(match Option::<Cell>::deserialize(deserializer)? {
        Some(Cell::Number(n)) => Some(n),
        Some(Cell::Text(s)) => parse_density(&s),
        None => None,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn concrete() -> ReferenceMaterial {
        ReferenceMaterial::new("kbob-01", "Beton", 0.1, 0.2, 150.0).with_density(2300.0)
    }

    #[test]
    fn test_material_table_validation() {
        let table = MaterialTable::new(" 2024 ", vec![concrete()], vec![MaterialMapping::new("Beton", "kbob-01")]).unwrap();
        assert_eq!(table.version(), "2024");
        assert_eq!(table.len(), 1);

        let dup = MaterialTable::new("2024", vec![concrete(), concrete()], vec![]);
        assert_eq!(dup.unwrap_err().error_code(), "INVALID_REFERENCE_DATA");

        let dangling = MaterialTable::new("2024", vec![concrete()], vec![MaterialMapping::new("Holz", "kbob-99")]);
        assert!(dangling.is_err());

        let nan = MaterialTable::new("2024", vec![ReferenceMaterial::new("k", "x", f64::NAN, 0.0, 0.0)], vec![]);
        assert!(nan.is_err());
    }

    #[test]
    fn test_zero_density_means_unknown() {
        let table = MaterialTable::new("2024", vec![concrete().with_density(0.0)], vec![]).unwrap();
        assert_eq!(table.get("kbob-01").unwrap().default_density, None);
    }

    #[test]
    fn test_density_parsing() {
        assert_eq!(parse_density("2300"), Some(2300.0));
        assert_eq!(parse_density("1400 - 1500"), Some(1450.0));
        assert_eq!(parse_density("n/a"), None);

        let json = r#"{"key": "k1", "name": "Ziegel", "gwp": 0.2, "penr": 0.5, "ubp": 300, "default_density": "1400 - 1500"}"#;
        let material: ReferenceMaterial = serde_json::from_str(json).unwrap();
        assert_eq!(material.default_density, Some(1450.0));
    }

    #[test]
    fn test_unit_type_parsing() {
        assert_eq!(UnitType::parse("m2"), UnitType::Area);
        assert_eq!(UnitType::parse("Area"), UnitType::Area);
        assert_eq!(UnitType::parse("m"), UnitType::Length);
        assert_eq!(UnitType::parse("Stk"), UnitType::Other("Stk".to_string()));

        let entry: CostReferenceEntry = serde_json::from_str(r#"{"code": "C2.1", "unit": "m2", "cost_per_unit": 120.0}"#).unwrap();
        assert_eq!(entry.unit, UnitType::Area);
        let json = serde_json::to_string(&entry).unwrap();
        assert!(json.contains("\"unit\":\"area\""));
    }

    #[test]
    fn test_cost_table_lookup() {
        let table = CostTable::new(
            "2024",
            vec![CostReferenceEntry::new(" C2.1 ", UnitType::Area, 120.0)],
        )
        .unwrap();
        assert!(table.get("C2.1").is_some());
        assert!(table.get(" C2.1").is_some());
        assert!(table.get("C2").is_none());

        let negative = CostTable::new("2024", vec![CostReferenceEntry::new("C1", UnitType::Length, -5.0)]);
        assert!(negative.is_err());
    }

    #[test]
    fn test_rows_into_table() {
        let rows = ReferenceRows::Cost {
            entries: vec![CostReferenceEntry::new("C1", UnitType::Length, 10.0)],
        };
        assert_eq!(rows.kind(), ReferenceKind::Cost);
        let table = rows.into_table("2024").unwrap();
        assert_eq!(table.kind(), ReferenceKind::Cost);
        assert_eq!(table.version(), "2024");
        assert_eq!(table.row_count(), 1);

        let err = ReferenceRows::Cost { entries: vec![] }.into_table("  ").unwrap_err();
        assert_eq!(err.error_code(), "INVALID_REFERENCE_DATA");
    }

    #[test]
    fn test_reference_rows_json() {
        let json = r#"{"kind": "life_expectancy", "entries": [{"code": "C", "description": "Rohbau", "years": 50}]}"#;
        let rows: ReferenceRows = serde_json::from_str(json).unwrap();
        assert_eq!(rows.kind(), ReferenceKind::LifeExpectancy);
    }
}
