//! # LCA Calculation
//!
//! Environmental indicators of each material layer:
//!
//! ```text
//! mass     = volume × density
//! absolute = mass × coefficient          (GWP, PENR, UBP)
//! annual   = absolute / life_span_years
//! per_area = annual / reference floor area   (only when the project has one)
//! ```
//!
//! Per layer, in order: the source name must map to a material key, the
//! key must exist in the pinned materials version, a density must be known
//! (layer value, else the material's default), and the layer volume must be
//! positive. The first check that fails decides the failure reason.
//!
//! Values are rounded to 3 decimals only when the record is built.
//!
//! ## Example
//!
//! Beton, 3.684 m³ at 2300 kg/m³, GWP 0.1 kg CO2-eq/kg, 50 years:
//!
//! ```text
//! mass         = 8473.2 kg
//! gwp_absolute = 847.32
//! gwp_per_year = 16.946
//! ```

use std::sync::Arc;

use tracing::{debug, warn};

use super::{
    CalculationResult, Failure, FailureReason, Indicators, LcaValues, Outcome, PerAreaValues, Processor, ResultKind,
};
use crate::elements::{Element, ElementBatch, MaterialLayer};
use crate::errors::{EngineError, EngineResult};
use crate::mapping::{MappingOutcome, MaterialMappingResolver, Unmapped};
use crate::reference::{LifeExpectancyTable, LifeSpan, MaterialTable, PinnedVersions, ReferenceMaterial, ReferencePin};
use crate::units::{round3, CubicMeters, KgPerCubicMeter, Years};

/// LCA engine bound to one reference pin.
#[derive(Debug, Clone)]
pub struct LcaProcessor {
    requested_version: String,
    versions: PinnedVersions,
    materials: Arc<MaterialTable>,
    life_expectancy: Arc<LifeExpectancyTable>,
    resolver: MaterialMappingResolver,
    default_life_years: u32,
    floor_area_m2: Option<f64>,
}

impl LcaProcessor {
    /// Engine for `pin`, with the project's life-span fallback and floor area.
    pub fn new(pin: &ReferencePin, default_life_years: u32, floor_area_m2: Option<f64>) -> Self {
        LcaProcessor {
            requested_version: pin.requested().to_string(),
            versions: pin.versions(),
            materials: Arc::clone(&pin.materials),
            life_expectancy: Arc::clone(&pin.life_expectancy),
            resolver: MaterialMappingResolver::new(&pin.materials),
            default_life_years,
            floor_area_m2: floor_area_m2.filter(|a| a.is_finite() && *a > 0.0),
        }
    }

    fn record(
        &self,
        element: &Element,
        material_name: Option<&str>,
        reference_key: Option<&str>,
        outcome: Outcome<Indicators>,
    ) -> CalculationResult {
        CalculationResult {
            element_id: element.id.clone(),
            kind: ResultKind::Lca,
            material_name: material_name.map(str::to_string),
            classification_code: element.code().map(str::to_string),
            reference_key: reference_key.map(str::to_string),
            versions: self.versions.clone(),
            outcome,
        }
    }

    fn layer(&self, element: &Element, layer: &MaterialLayer, life: &LifeSpan) -> CalculationResult {
        let name = layer.name.trim();
        let fail = |key: Option<&str>, reason: FailureReason, detail: String| {
            self.record(element, Some(name), key, Outcome::Failed(Failure::new(reason, detail)))
        };

        let key = match self.resolver.resolve(name) {
            MappingOutcome::Mapped(key) => key,
            MappingOutcome::Unmapped(Unmapped::NotFound) => {
                warn!(element = %element.id, material = name, version = %self.materials.version(), "unmapped material");
                return fail(None, FailureReason::UnmappedMaterial, format!("no mapping for material '{}'", name));
            }
            MappingOutcome::Unmapped(Unmapped::Ambiguous { candidates }) => {
                warn!(
                    element = %element.id,
                    material = name,
                    version = %self.materials.version(),
                    candidates = candidates.len(),
                    "ambiguous material mapping"
                );
                return fail(
                    None,
                    FailureReason::UnmappedMaterial,
                    format!("material '{}' maps to several keys: {}", name, candidates.join(", ")),
                );
            }
        };

        let Some(material) = self.materials.get(&key) else {
            return fail(
                Some(key.as_str()),
                FailureReason::ReferenceMaterialNotFound,
                format!("material key '{}' not in version {}", key, self.materials.version()),
            );
        };

        let Some(density) = layer.usable_density().or(material.default_density) else {
            return fail(
                Some(key.as_str()),
                FailureReason::MissingDensity,
                format!("no density for '{}' and no default for '{}'", name, material.name),
            );
        };

        let Some(volume) = element.layer_volume(layer) else {
            return fail(
                Some(key.as_str()),
                FailureReason::InvalidVolume,
                format!(
                    "layer '{}' has no positive volume (volume={:?}, fraction={:?})",
                    name, layer.volume, layer.fraction
                ),
            );
        };

        let values = indicators(material, volume, density, life, self.floor_area_m2);
        self.record(element, Some(name), Some(key.as_str()), Outcome::Valid(Indicators::Lca(values)))
    }
}

/// Indicator values for one valid layer.
fn indicators(
    material: &ReferenceMaterial,
    volume: CubicMeters,
    density: f64,
    life: &LifeSpan,
    floor_area_m2: Option<f64>,
) -> LcaValues {
    let mass = volume * KgPerCubicMeter(density);
    let years = Years(life.years);

    let gwp = mass.times(material.gwp);
    let penr = mass.times(material.penr);
    let ubp = mass.times(material.ubp);
    let (gwp_year, penr_year, ubp_year) = (years.annualize(gwp), years.annualize(penr), years.annualize(ubp));

    LcaValues {
        volume: round3(volume.0),
        density: round3(density),
        mass: round3(mass.0),
        life_span_years: life.years,
        life_span_code: life.matched_code.clone(),
        gwp_absolute: round3(gwp),
        gwp_per_year: round3(gwp_year),
        penr_absolute: round3(penr),
        penr_per_year: round3(penr_year),
        ubp_absolute: round3(ubp),
        ubp_per_year: round3(ubp_year),
        per_area: floor_area_m2.map(|area| PerAreaValues {
            gwp: round3(gwp_year / area),
            penr: round3(penr_year / area),
            ubp: round3(ubp_year / area),
        }),
    }
}

impl Processor for LcaProcessor {
    fn name(&self) -> &'static str {
        "lca"
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
        if element.materials.is_empty() {
            return vec![self.record(
                element,
                None,
                None,
                Outcome::Failed(Failure::new(
                    FailureReason::NoMaterialLayers,
                    format!("element '{}' has no material layers", element.id),
                )),
            )];
        }

        let life = self.life_expectancy.resolve(element.code(), self.default_life_years);
        let results: Vec<CalculationResult> = element
            .materials
            .iter()
            .map(|layer| self.layer(element, layer, &life))
            .collect();

        debug!(
            element = %element.id,
            layers = results.len(),
            failed = results.iter().filter(|r| !r.is_valid()).count(),
            "lca computed"
        );
        results
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::elements::Geometry;
    use crate::reference::{
        CostReferenceEntry, LifeExpectancyEntry, MaterialMapping, ReferenceKind, ReferenceRows, ReferenceStore,
        UnitType,
    };

    fn pin() -> ReferencePin {
        let store = ReferenceStore::new();
        let tables = [
            ReferenceRows::Materials {
                materials: vec![
                    ReferenceMaterial::new("k-beton", "Beton", 0.1, 0.25, 120.0),
                    ReferenceMaterial::new("k-holz", "Holz", -1.2, 0.5, 80.0).with_density(450.0),
                ],
                mappings: vec![MaterialMapping::new("Beton", "k-beton"), MaterialMapping::new("Holz", "k-holz")],
            },
            ReferenceRows::LifeExpectancy {
                entries: vec![LifeExpectancyEntry::new("C2", 50)],
            },
            ReferenceRows::Cost {
                entries: vec![CostReferenceEntry::new("C2.1", UnitType::Area, 100.0)],
            },
        ];
        for rows in tables {
            store.insert(rows.into_table("2024").unwrap()).unwrap();
        }
        for kind in ReferenceKind::ALL {
            store.activate(kind, "2024").unwrap();
        }
        store.pin("2024").unwrap()
    }

    fn wall(layer: MaterialLayer) -> Element {
        Element::new("wall-1", "C2.1").with_layer(layer)
    }

    #[test]
    fn test_worked_example() {
        let processor = LcaProcessor::new(&pin(), 60, None);
        let results = processor.compute(&wall(MaterialLayer::new("Beton", 3.684).with_density(2300.0)));
        assert_eq!(results.len(), 1);

        let values = results[0].lca().unwrap();
        assert_eq!(values.mass, 8473.2);
        assert_eq!(values.gwp_absolute, 847.32);
        assert_eq!(values.life_span_years, 50);
        assert_eq!(values.life_span_code.as_deref(), Some("C2"));
        assert_eq!(values.gwp_per_year, 16.946);
        assert_eq!(values.penr_absolute, 2118.3);
        assert_eq!(values.ubp_absolute, 1016784.0);
        assert!(values.per_area.is_none());
        assert_eq!(results[0].reference_key.as_deref(), Some("k-beton"));
    }

    #[test]
    fn test_annual_times_years_matches_absolute() {
        let processor = LcaProcessor::new(&pin(), 60, None);
        for volume in [0.013, 1.0, 3.684, 17.25, 250.5] {
            let results = processor.compute(&wall(MaterialLayer::new("Beton", volume).with_density(2350.0)));
            let v = results[0].lca().unwrap();
            let years = f64::from(v.life_span_years);
            let tolerance = 0.0005 * (years + 1.0) + 1e-6;
            assert!((v.gwp_per_year * years - v.gwp_absolute).abs() <= tolerance);
            assert!((v.ubp_per_year * years - v.ubp_absolute).abs() <= tolerance);
        }
    }

    #[test]
    fn test_default_density_fallback() {
        let processor = LcaProcessor::new(&pin(), 60, None);
        let results = processor.compute(&wall(MaterialLayer::new("Holz", 2.0)));
        let values = results[0].lca().unwrap();
        assert_eq!(values.density, 450.0);
        assert_eq!(values.mass, 900.0);
        assert_eq!(values.gwp_absolute, -1080.0);
    }

    #[test]
    fn test_missing_density() {
        let processor = LcaProcessor::new(&pin(), 60, None);
        let results = processor.compute(&wall(MaterialLayer::new("Beton", 2.0).with_density(0.0)));
        assert_eq!(results[0].failure().unwrap().reason, FailureReason::MissingDensity);
    }

    #[test]
    fn test_invalid_volume() {
        let processor = LcaProcessor::new(&pin(), 60, None);
        let results = processor.compute(&wall(MaterialLayer::new("Beton", 0.0).with_density(2300.0)));
        assert_eq!(results[0].failure().unwrap().reason, FailureReason::InvalidVolume);
    }

    #[test]
    fn test_unmapped_material_does_not_affect_siblings() {
        let processor = LcaProcessor::new(&pin(), 60, None);
        let element = wall(MaterialLayer::new("Unobtainium", 1.0).with_density(1000.0))
            .with_layer(MaterialLayer::new("Beton", 1.0).with_density(2300.0));
        let results = processor.compute(&element);
        assert_eq!(results.len(), 2);
        assert_eq!(results[0].failure().unwrap().reason, FailureReason::UnmappedMaterial);
        assert!(results[1].is_valid());
    }

    #[test]
    fn test_ambiguous_mapping_fails_layer() {
        let store = ReferenceStore::new();
        let tables = [
            ReferenceRows::Materials {
                materials: vec![
                    ReferenceMaterial::new("k-beton", "Beton", 0.1, 0.25, 120.0),
                    ReferenceMaterial::new("k-holz", "Holz", -1.2, 0.5, 80.0),
                ],
                mappings: vec![MaterialMapping::new("Mix", "k-beton"), MaterialMapping::new("Mix", "k-holz")],
            },
            ReferenceRows::LifeExpectancy { entries: vec![] },
            ReferenceRows::Cost { entries: vec![] },
        ];
        for rows in tables {
            store.insert(rows.into_table("2024").unwrap()).unwrap();
        }
        for kind in ReferenceKind::ALL {
            store.activate(kind, "2024").unwrap();
        }

        let processor = LcaProcessor::new(&store.pin("2024").unwrap(), 60, None);
        let results = processor.compute(&wall(MaterialLayer::new("Mix", 1.0).with_density(1000.0)));
        let failure = results[0].failure().unwrap();
        assert_eq!(failure.reason, FailureReason::UnmappedMaterial);
        assert!(failure.detail.contains("k-beton"));
        assert!(failure.detail.contains("k-holz"));
        assert!(results[0].reference_key.is_none());
    }

    #[test]
    fn test_no_material_layers() {
        let processor = LcaProcessor::new(&pin(), 60, None);
        let results = processor.compute(&Element::new("slab-1", "C4.1"));
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].failure().unwrap().reason, FailureReason::NoMaterialLayers);
        assert!(results[0].material_name.is_none());
    }

    #[test]
    fn test_default_life_span_and_fraction_volume() {
        let processor = LcaProcessor::new(&pin(), 60, Some(200.0));
        let element = Element::new("col-1", "G1")
            .with_geometry(Geometry {
                volume_net: Some(4.0),
                ..Geometry::default()
            })
            .with_layer(MaterialLayer {
                name: "beton".to_string(),
                fraction: Some(0.5),
                volume: None,
                density: Some(2000.0),
                width: None,
            });
        let results = processor.compute(&element);
        let values = results[0].lca().unwrap();
        assert_eq!(values.volume, 2.0);
        assert_eq!(values.life_span_years, 60);
        assert!(values.life_span_code.is_none());
        // 4000 kg × 0.1 / 60 years / 200 m²
        assert_eq!(values.per_area.as_ref().unwrap().gwp, 0.033);
    }

    #[test]
    fn test_validate_rejects_other_version() {
        let processor = LcaProcessor::new(&pin(), 60, None);
        assert!(processor.validate(&ElementBatch::new("P-1", "2024")).is_ok());
        assert!(processor.validate(&ElementBatch::new("P-1", "2023")).is_err());
    }
}
