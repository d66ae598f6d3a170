//! # Project Data Structures
//!
//! A `Project` is the unit a batch is persisted against: it pins the
//! reference-data version and carries the life-span fallback used when no
//! life-expectancy entry matches.
//!
//! ## Lifecycle
//!
//! ```text
//! active ──► processing ──► completed
//!    │            └───────► failed
//!    └──► completed | failed
//! ```
//!
//! `completed` and `failed` are terminal; there is no backward transition.
//!
//! ## Example
//!
//! ```rust
//! use lca_core::project::{Project, ProjectStatus};
//!
//! let mut project = Project::new("P-001", "Schulhaus Nord", "2024", 60);
//! project.transition(ProjectStatus::Processing).unwrap();
//! project.transition(ProjectStatus::Completed).unwrap();
//! assert!(project.transition(ProjectStatus::Processing).is_err());
//! ```

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::errors::{EngineError, EngineResult};

/// Processing lifecycle status stored on the project row.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProjectStatus {
    #[default]
    Active,
    Processing,
    Completed,
    Failed,
}

impl ProjectStatus {
    /// Column value
    pub fn as_str(&self) -> &'static str {
        match self {
            ProjectStatus::Active => "active",
            ProjectStatus::Processing => "processing",
            ProjectStatus::Completed => "completed",
            ProjectStatus::Failed => "failed",
        }
    }

    /// Parse a column value
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "active" => Some(ProjectStatus::Active),
            "processing" => Some(ProjectStatus::Processing),
            "completed" => Some(ProjectStatus::Completed),
            "failed" => Some(ProjectStatus::Failed),
            _ => None,
        }
    }

    /// Terminal states accept no further transition
    pub fn is_terminal(&self) -> bool {
        matches!(self, ProjectStatus::Completed | ProjectStatus::Failed)
    }

    /// Whether `self -> next` moves forward
    pub fn can_transition_to(&self, next: ProjectStatus) -> bool {
        use ProjectStatus::*;
        matches!(
            (self, next),
            (Active, Processing) | (Active, Completed) | (Active, Failed) | (Processing, Completed) | (Processing, Failed)
        )
    }
}

impl std::fmt::Display for ProjectStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Project row.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Project {
    /// Project identifier (from the inbound batch)
    pub project_id: String,

    /// Display name
    pub name: String,

    /// Fallback life span (years) when no life-expectancy entry matches
    pub default_life_expectancy_years: u32,

    /// Reference-data version requested for this project
    pub reference_version: String,

    /// Reference floor area (m²) for per-area indicators, if known
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reference_floor_area_m2: Option<f64>,

    /// Lifecycle status
    pub status: ProjectStatus,

    /// When the project was created
    pub created_at: DateTime<Utc>,

    /// When the project row last changed
    pub updated_at: DateTime<Utc>,
}

impl Project {
    /// Create a new project in `active` state.
    pub fn new(
        project_id: impl Into<String>,
        name: impl Into<String>,
        reference_version: impl Into<String>,
        default_life_expectancy_years: u32,
    ) -> Self {
        let now = Utc::now();
        Project {
            project_id: project_id.into(),
            name: name.into(),
            default_life_expectancy_years,
            reference_version: reference_version.into(),
            reference_floor_area_m2: None,
            status: ProjectStatus::Active,
            created_at: now,
            updated_at: now,
        }
    }

    /// Builder-style reference floor area
    pub fn with_floor_area(mut self, area_m2: f64) -> Self {
        self.reference_floor_area_m2 = Some(area_m2);
        self
    }

    /// Move to `next`, rejecting backward or terminal transitions.
    pub fn transition(&mut self, next: ProjectStatus) -> EngineResult<()> {
        if !self.status.can_transition_to(next) {
            return Err(EngineError::InvalidStatusTransition {
                project_id: self.project_id.clone(),
                from: self.status.to_string(),
                to: next.to_string(),
            });
        }
        self.status = next;
        self.touch();
        Ok(())
    }

    /// Update the modified timestamp.
    pub fn touch(&mut self) {
        self.updated_at = Utc::now();
    }

    /// Usable floor area, ignoring non-positive values
    pub fn floor_area(&self) -> Option<f64> {
        self.reference_floor_area_m2.filter(|a| a.is_finite() && *a > 0.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_project_creation() {
        let project = Project::new("P-1", "Test", "2024", 60);
        assert_eq!(project.status, ProjectStatus::Active);
        assert_eq!(project.default_life_expectancy_years, 60);
        assert!(project.floor_area().is_none());
    }

    #[test]
    fn test_monotonic_transitions() {
        let mut project = Project::new("P-1", "Test", "2024", 60);
        project.transition(ProjectStatus::Processing).unwrap();
        assert!(project.transition(ProjectStatus::Active).is_err());
        project.transition(ProjectStatus::Failed).unwrap();
        assert!(project.transition(ProjectStatus::Completed).is_err());
        assert_eq!(project.status, ProjectStatus::Failed);
    }

    #[test]
    fn test_status_serialization() {
        let json = serde_json::to_string(&ProjectStatus::Completed).unwrap();
        assert_eq!(json, "\"completed\"");
        assert_eq!(ProjectStatus::parse("processing"), Some(ProjectStatus::Processing));
        assert_eq!(ProjectStatus::parse("done"), None);
    }

    #[test]
    fn test_floor_area_filter() {
        let project = Project::new("P-1", "Test", "2024", 60).with_floor_area(0.0);
        assert!(project.floor_area().is_none());
        let project = Project::new("P-1", "Test", "2024", 60).with_floor_area(1250.0);
        assert_eq!(project.floor_area(), Some(1250.0));
    }
}
