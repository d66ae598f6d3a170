//! # Building Elements
//!
//! Normalized element records as delivered by the model-extraction
//! collaborator, and the inbound batch message that carries them.
//!
//! ## JSON Example
//!
//! ```json
//! {
//!   "project_id": "P-001",
//!   "reference_version": "2024",
//!   "elements": [
//!     {
//!       "id": "2O2Fr$t4X7Zf8NOew3FLOH",
//!       "classification_code": "C2.1",
//!       "geometry": { "volume_net": 3.684, "area_net": 12.28 },
//!       "materials": [
//!         { "name": "Beton", "fraction": 1.0, "volume": 3.684, "density": 2300.0 }
//!       ]
//!     }
//!   ]
//! }
//! ```

use serde::{Deserialize, Serialize};

use crate::errors::{EngineError, EngineResult};
use crate::units::CubicMeters;

/// Geometric quantities of an element. Any subset may be absent.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Geometry {
    /// Net volume (m³)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub volume_net: Option<f64>,
    /// Gross volume (m³)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub volume_gross: Option<f64>,
    /// Net area (m²)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub area_net: Option<f64>,
    /// Gross area (m²)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub area_gross: Option<f64>,
    /// Length (m)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub length: Option<f64>,
    /// Width (m)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub width: Option<f64>,
    /// Height (m)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub height: Option<f64>,
}

impl Geometry {
    /// Net volume, gross as fallback
    pub fn volume(&self) -> Option<f64> {
        positive(self.volume_net).or_else(|| positive(self.volume_gross))
    }
}

/// One material layer of an element.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MaterialLayer {
    /// Material name as given by the source model
    pub name: String,
    /// Volumetric fraction of the element (0-1)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fraction: Option<f64>,
    /// Absolute layer volume (m³)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub volume: Option<f64>,
    /// Density (kg/m³)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub density: Option<f64>,
    /// Layer width (m)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub width: Option<f64>,
}

impl MaterialLayer {
    /// Layer with a name and absolute volume
    pub fn new(name: impl Into<String>, volume: f64) -> Self {
        MaterialLayer {
            name: name.into(),
            fraction: None,
            volume: Some(volume),
            density: None,
            width: None,
        }
    }

    /// Builder-style density
    pub fn with_density(mut self, density: f64) -> Self {
        self.density = Some(density);
        self
    }

    /// Builder-style fraction
    pub fn with_fraction(mut self, fraction: f64) -> Self {
        self.fraction = Some(fraction);
        self
    }

    /// Provided density, treating non-positive values as absent
    pub fn usable_density(&self) -> Option<f64> {
        positive(self.density)
    }
}

/// A building element.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Element {
    /// Stable identifier (GUID) from the source model
    #[serde(alias = "guid")]
    pub id: String,

    /// Hierarchical classification code (eBKP-H)
    #[serde(default, alias = "ebkp", skip_serializing_if = "Option::is_none")]
    pub classification_code: Option<String>,

    /// Geometric quantities
    #[serde(default)]
    pub geometry: Geometry,

    /// Material layers
    #[serde(default)]
    pub materials: Vec<MaterialLayer>,
}

impl Element {
    /// Element without geometry or layers
    pub fn new(id: impl Into<String>, classification_code: impl Into<String>) -> Self {
        Element {
            id: id.into(),
            classification_code: Some(classification_code.into()),
            geometry: Geometry::default(),
            materials: Vec::new(),
        }
    }

    /// Builder-style layer
    pub fn with_layer(mut self, layer: MaterialLayer) -> Self {
        self.materials.push(layer);
        self
    }

    /// Builder-style geometry
    pub fn with_geometry(mut self, geometry: Geometry) -> Self {
        self.geometry = geometry;
        self
    }

    /// Trimmed classification code, if present and non-empty
    pub fn code(&self) -> Option<&str> {
        self.classification_code
            .as_deref()
            .map(str::trim)
            .filter(|c| !c.is_empty())
    }

    /// Volume of `layer`: its absolute volume, or `fraction × element volume`.
    ///
    /// Returns `None` when neither yields a positive value.
    pub fn layer_volume(&self, layer: &MaterialLayer) -> Option<CubicMeters> {
        if let Some(volume) = layer.volume {
            return positive(Some(volume)).map(CubicMeters);
        }
        let fraction = layer.fraction.filter(|f| f.is_finite() && *f > 0.0 && *f <= 1.0)?;
        let element_volume = self.geometry.volume()?;
        positive(Some(fraction * element_volume)).map(CubicMeters)
    }
}

/// Inbound batch message from the transport collaborator.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ElementBatch {
    /// Project identifier
    pub project_id: String,

    /// Display name; defaults to the project identifier
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub project_name: Option<String>,

    /// Pinned reference-data version
    pub reference_version: String,

    /// Reference floor area for per-area indicators
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reference_floor_area_m2: Option<f64>,

    /// Elements to process
    pub elements: Vec<Element>,
}

impl ElementBatch {
    /// Batch with no elements yet
    pub fn new(project_id: impl Into<String>, reference_version: impl Into<String>) -> Self {
        ElementBatch {
            project_id: project_id.into(),
            project_name: None,
            reference_version: reference_version.into(),
            reference_floor_area_m2: None,
            elements: Vec::new(),
        }
    }

    /// Builder-style element
    pub fn with_element(mut self, element: Element) -> Self {
        self.elements.push(element);
        self
    }

    /// Parse an inbound JSON message
    pub fn from_json(payload: &str) -> EngineResult<Self> {
        serde_json::from_str(payload).map_err(|e| EngineError::SerializationError {
            reason: format!("Invalid batch message: {}", e),
        })
    }

    /// Shape checks that reject the whole batch.
    ///
    /// Record-level problems (bad volume, unknown material) are not checked
    /// here; they become failed result records instead.
    pub fn validate(&self) -> EngineResult<()> {
        if self.project_id.trim().is_empty() {
            return Err(EngineError::missing_field("project_id"));
        }
        if self.reference_version.trim().is_empty() {
            return Err(EngineError::missing_field("reference_version"));
        }
        for (index, element) in self.elements.iter().enumerate() {
            if element.id.trim().is_empty() {
                return Err(EngineError::invalid_input(
                    format!("elements[{}].id", index),
                    "",
                    "Element identifier must not be empty",
                ));
            }
        }
        Ok(())
    }

    /// Display name for the project row
    pub fn display_name(&self) -> String {
        self.project_name
            .clone()
            .unwrap_or_else(|| self.project_id.clone())
    }
}

fn positive(value: Option<f64>) -> Option<f64> {
    value.filter(|v| v.is_finite() && *v > 0.0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_batch_from_json() {
        let payload = r#"{
            "project_id": "P-1",
            "reference_version": "2024",
            "elements": [{
                "guid": "abc",
                "ebkp": "C2.1",
                "geometry": { "volume_net": 3.684 },
                "materials": [{ "name": "Beton", "fraction": 1.0, "volume": 3.684, "density": 2300.0 }]
            }]
        }"#;
        let batch = ElementBatch::from_json(payload).unwrap();
        assert_eq!(batch.elements.len(), 1);
        assert_eq!(batch.elements[0].id, "abc");
        assert_eq!(batch.elements[0].code(), Some("C2.1"));
        assert!(batch.validate().is_ok());
        assert_eq!(batch.display_name(), "P-1");
    }

    #[test]
    fn test_validate_rejects_empty_ids() {
        let batch = ElementBatch::new("P-1", "2024").with_element(Element::new("  ", "C1"));
        assert_eq!(batch.validate().unwrap_err().error_code(), "INVALID_INPUT");

        let batch = ElementBatch::new("", "2024");
        assert_eq!(batch.validate().unwrap_err().error_code(), "MISSING_FIELD");
    }

    #[test]
    fn test_layer_volume_derivation() {
        let element = Element::new("e1", "C1").with_geometry(Geometry {
            volume_gross: Some(10.0),
            ..Geometry::default()
        });

        let absolute = MaterialLayer::new("Beton", 2.5);
        assert_eq!(element.layer_volume(&absolute), Some(CubicMeters(2.5)));

        let derived = MaterialLayer {
            name: "Daemmung".to_string(),
            fraction: Some(0.25),
            volume: None,
            density: None,
            width: None,
        };
        assert_eq!(element.layer_volume(&derived), Some(CubicMeters(2.5)));

        let negative = MaterialLayer::new("Beton", -1.0);
        assert_eq!(element.layer_volume(&negative), None);
    }

    #[test]
    fn test_blank_code_is_absent() {
        let mut element = Element::new("e1", "  ");
        assert_eq!(element.code(), None);
        element.classification_code = None;
        assert_eq!(element.code(), None);
    }
}
