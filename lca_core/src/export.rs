//! # Analytics Export
//!
//! Columnar snapshots of a project's committed results, one object per
//! result kind:
//!
//! ```text
//! {kind}/{project_id}/{project_id}_{generation}.json
//! ```
//!
//! `generation` is the UTC export time (`20241019T101500.123Z`). Each
//! object is written whole; readers never see a partial snapshot. Export
//! reads committed rows only and is not part of the commit transaction.

use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::calculations::ResultKind;
use crate::config::ExportConfig;
use crate::errors::{EngineError, EngineResult};
use crate::file_io::{write_atomic, FileLock};
use crate::store::{Store, StoredResult};

/// Destination for export objects.
pub trait ExportSink: Send + Sync {
    /// Store `bytes` under `object_path`, replacing any previous object.
    fn put_object(&self, object_path: &str, bytes: &[u8]) -> EngineResult<()>;
}

/// Export sink on the local filesystem: `{root_dir}/{bucket}/{object_path}`.
#[derive(Debug, Clone)]
pub struct FsExportSink {
    root: PathBuf,
}

impl FsExportSink {
    pub fn new(config: &ExportConfig) -> Self {
        FsExportSink {
            root: config.root_dir.join(&config.bucket),
        }
    }

    /// File backing `object_path`
    pub fn object_file(&self, object_path: &str) -> PathBuf {
        self.root.join(object_path)
    }
}

impl ExportSink for FsExportSink {
    fn put_object(&self, object_path: &str, bytes: &[u8]) -> EngineResult<()> {
        let file = self.object_file(object_path);
        let partition = file.parent().map(|p| p.to_path_buf()).unwrap_or_else(|| self.root.clone());
        std::fs::create_dir_all(&partition)
            .map_err(|e| EngineError::file_error("create partition", partition.display().to_string(), e.to_string()))?;

        let _lock = FileLock::acquire(&partition.join(".partition"))?;
        write_atomic(&file, bytes)
    }
}

/// LCA result columns.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct LcaColumns {
    pub run_id: Vec<String>,
    pub element_id: Vec<String>,
    pub material_name: Vec<Option<String>>,
    pub classification_code: Vec<Option<String>>,
    pub material_key: Vec<Option<String>>,
    pub materials_version: Vec<String>,
    pub life_expectancy_version: Vec<String>,
    pub valid: Vec<bool>,
    pub failure_reason: Vec<Option<String>>,
    pub volume: Vec<Option<f64>>,
    pub density: Vec<Option<f64>>,
    pub mass: Vec<Option<f64>>,
    pub life_span_years: Vec<Option<u32>>,
    pub gwp_absolute: Vec<Option<f64>>,
    pub gwp_per_year: Vec<Option<f64>>,
    pub penr_absolute: Vec<Option<f64>>,
    pub penr_per_year: Vec<Option<f64>>,
    pub ubp_absolute: Vec<Option<f64>>,
    pub ubp_per_year: Vec<Option<f64>>,
}

impl LcaColumns {
    fn push(&mut self, row: &StoredResult) {
        let r = &row.result;
        let v = r.lca();
        self.run_id.push(row.run_id.clone());
        self.element_id.push(r.element_id.clone());
        self.material_name.push(r.material_name.clone());
        self.classification_code.push(r.classification_code.clone());
        self.material_key.push(r.reference_key.clone());
        self.materials_version.push(r.versions.materials.clone());
        self.life_expectancy_version.push(r.versions.life_expectancy.clone());
        self.valid.push(r.is_valid());
        self.failure_reason.push(r.failure().map(|f| f.reason.as_str().to_string()));
        self.volume.push(v.map(|v| v.volume));
        self.density.push(v.map(|v| v.density));
        self.mass.push(v.map(|v| v.mass));
        self.life_span_years.push(v.map(|v| v.life_span_years));
        self.gwp_absolute.push(v.map(|v| v.gwp_absolute));
        self.gwp_per_year.push(v.map(|v| v.gwp_per_year));
        self.penr_absolute.push(v.map(|v| v.penr_absolute));
        self.penr_per_year.push(v.map(|v| v.penr_per_year));
        self.ubp_absolute.push(v.map(|v| v.ubp_absolute));
        self.ubp_per_year.push(v.map(|v| v.ubp_per_year));
    }
}

/// Cost result columns.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CostColumns {
    pub run_id: Vec<String>,
    pub element_id: Vec<String>,
    pub classification_code: Vec<Option<String>>,
    pub cost_version: Vec<String>,
    pub valid: Vec<bool>,
    pub failure_reason: Vec<Option<String>>,
    pub quantity: Vec<Option<f64>>,
    pub unit: Vec<Option<String>>,
    pub unit_cost: Vec<Option<f64>>,
    pub total_cost: Vec<Option<f64>>,
}

impl CostColumns {
    fn push(&mut self, row: &StoredResult) {
        let r = &row.result;
        let c = r.cost();
        self.run_id.push(row.run_id.clone());
        self.element_id.push(r.element_id.clone());
        self.classification_code.push(r.classification_code.clone());
        self.cost_version.push(r.versions.cost.clone());
        self.valid.push(r.is_valid());
        self.failure_reason.push(r.failure().map(|f| f.reason.as_str().to_string()));
        self.quantity.push(c.map(|c| c.quantity));
        self.unit.push(c.map(|c| c.unit.as_str().to_string()));
        self.unit_cost.push(c.map(|c| c.unit_cost));
        self.total_cost.push(c.map(|c| c.total_cost));
    }
}

/// One exported object.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ColumnarSnapshot<C> {
    pub kind: ResultKind,
    pub project_id: String,
    pub generated_at: DateTime<Utc>,
    pub row_count: usize,
    pub columns: C,
}

/// Objects written by one export.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExportReport {
    pub project_id: String,
    pub objects: Vec<String>,
    pub lca_rows: usize,
    pub cost_rows: usize,
}

/// Object path for a snapshot of `kind`
pub fn object_path(kind: ResultKind, project_id: &str, generated_at: &DateTime<Utc>) -> String {
    let safe_id: String = project_id
        .chars()
        .map(|c| if matches!(c, '/' | '\\' | ':') { '_' } else { c })
        .collect();
    format!(
        "{}/{}/{}_{}.json",
        kind.as_str(),
        safe_id,
        safe_id,
        generated_at.format("%Y%m%dT%H%M%S%.3fZ")
    )
}

/// Split stored rows into per-kind column sets.
pub fn columns(rows: &[StoredResult]) -> (LcaColumns, CostColumns) {
    let mut lca = LcaColumns::default();
    let mut cost = CostColumns::default();
    for row in rows {
        match row.result.kind {
            ResultKind::Lca => lca.push(row),
            ResultKind::Cost => cost.push(row),
        }
    }
    (lca, cost)
}

/// Export the committed results of `project_id` to `sink`.
///
/// A kind without rows writes no object.
pub fn export_project(
    store: &Store,
    sink: &dyn ExportSink,
    project_id: &str,
    generated_at: DateTime<Utc>,
) -> EngineResult<ExportReport> {
    if store.project(project_id)?.is_none() {
        return Err(EngineError::invalid_input("project_id", project_id, "unknown project"));
    }

    let rows = store.results_for_project(project_id)?;
    let (lca, cost) = columns(&rows);
    let mut report = ExportReport {
        project_id: project_id.to_string(),
        objects: Vec::new(),
        lca_rows: lca.element_id.len(),
        cost_rows: cost.element_id.len(),
    };

    if report.lca_rows > 0 {
        let snapshot = ColumnarSnapshot {
            kind: ResultKind::Lca,
            project_id: project_id.to_string(),
            generated_at,
            row_count: report.lca_rows,
            columns: lca,
        };
        let path = object_path(ResultKind::Lca, project_id, &generated_at);
        sink.put_object(&path, &serde_json::to_vec(&snapshot)?)?;
        report.objects.push(path);
    }

    if report.cost_rows > 0 {
        let snapshot = ColumnarSnapshot {
            kind: ResultKind::Cost,
            project_id: project_id.to_string(),
            generated_at,
            row_count: report.cost_rows,
            columns: cost,
        };
        let path = object_path(ResultKind::Cost, project_id, &generated_at);
        sink.put_object(&path, &serde_json::to_vec(&snapshot)?)?;
        report.objects.push(path);
    }

    info!(
        project = project_id,
        objects = report.objects.len(),
        lca_rows = report.lca_rows,
        cost_rows = report.cost_rows,
        "project exported"
    );
    Ok(report)
}
