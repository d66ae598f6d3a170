//! Row types written and read by [`super::Store`].

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::calculations::{CalculationResult, ProcessingError};
use crate::config::ResultPolicy;
use crate::elements::Element;
use crate::project::{Project, ProjectStatus};
use crate::reference::PinnedVersions;

/// Material row of an element. One row per (element, material name).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MaterialAssignment {
    pub element_id: String,
    pub material_name: String,
    pub fraction: Option<f64>,
    pub volume: Option<f64>,
    pub density: Option<f64>,
    pub width: Option<f64>,
}

impl MaterialAssignment {
    /// Assignment rows for `elements`, merging repeated (element, material)
    /// pairs: volumes and fractions are summed, the first density and width
    /// are kept.
    pub fn merged(elements: &[Element]) -> Vec<MaterialAssignment> {
        let mut rows: Vec<MaterialAssignment> = Vec::new();
        // (element id, material name) -> position in `rows`
        let mut index: HashMap<(String, String), usize> = HashMap::new();
        for element in elements {
            for layer in &element.materials {
                let name = layer.name.trim();
                if name.is_empty() {
                    continue;
                }
                let key = (element.id.clone(), name.to_string());
                match index.get(&key) {
                    Some(&i) => {
                        let row = &mut rows[i];
                        row.volume = sum(row.volume, layer.volume);
                        row.fraction = sum(row.fraction, layer.fraction);
                        row.density = row.density.or(layer.density);
                        row.width = row.width.or(layer.width);
                    }
                    None => {
                        index.insert(key, rows.len());
                        rows.push(MaterialAssignment {
                            element_id: element.id.clone(),
                            material_name: name.to_string(),
                            fraction: layer.fraction,
                            volume: layer.volume,
                            density: layer.density,
                            width: layer.width,
                        });
                    }
                }
            }
        }
        rows
    }
}

fn sum(a: Option<f64>, b: Option<f64>) -> Option<f64> {
    match (a, b) {
        (Some(a), Some(b)) => Some(a + b),
        (a, b) => a.or(b),
    }
}

/// One processing run of a project.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProcessingHistory {
    pub run_id: String,
    pub project_id: String,
    pub requested_version: String,
    /// Resolved versions; absent when the run failed before pinning
    pub versions: Option<PinnedVersions>,
    pub total_elements: usize,
    pub processed_elements: usize,
    pub failed_elements: usize,
    pub result_count: usize,
    pub error_count: usize,
    pub duration_secs: f64,
    /// Outcome of the run (`completed` or `failed`)
    pub status: ProjectStatus,
    pub policy: ResultPolicy,
    /// Failure detail for aborted runs
    pub detail: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// Everything one batch commit writes, in one transaction.
#[derive(Debug, Clone)]
pub struct CommitBatch<'a> {
    pub project: &'a Project,
    pub elements: &'a [Element],
    pub assignments: &'a [MaterialAssignment],
    pub results: &'a [CalculationResult],
    pub errors: &'a [ProcessingError],
    pub history: &'a ProcessingHistory,
}

/// Row counts of a successful commit.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommitSummary {
    pub elements_inserted: usize,
    pub assignments_inserted: usize,
    pub results_written: usize,
    pub errors_written: usize,
    /// Rows removed under `ReplaceProject`
    pub results_replaced: usize,
    /// Project status after the commit
    pub project_status: ProjectStatus,
}

/// A persisted result record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoredResult {
    pub id: i64,
    pub run_id: String,
    pub project_id: String,
    pub created_at: DateTime<Utc>,
    pub result: CalculationResult,
}

/// A persisted processing error.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoredError {
    pub id: i64,
    pub run_id: String,
    pub error: ProcessingError,
}

/// Project row with run statistics.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProjectInfo {
    pub project: Project,
    pub result_count: usize,
    pub error_count: usize,
    pub latest_run: Option<ProcessingHistory>,
}
