//! # Persistence
//!
//! SQLite-backed store for reference versions, projects, elements, results,
//! processing errors and run history.
//!
//! A batch is written by [`Store::commit`] in a single transaction: either
//! every row of the batch becomes visible or none does. A failed commit is
//! recorded afterwards by [`Store::record_failure`] in its own transaction,
//! so an aborted run still leaves a queryable trace.
//!
//! ## Example
//!
//! ```rust
//! use lca_core::store::Store;
//!
//! let store = Store::open_in_memory().unwrap();
//! assert!(store.project("P-404").unwrap().is_none());
//! ```

pub mod records;
pub mod schema;

pub use records::{
    CommitBatch, CommitSummary, MaterialAssignment, ProcessingHistory, ProjectInfo, StoredError, StoredResult,
};

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::types::Type;
use rusqlite::{params, Connection, OptionalExtension, Row};
use tracing::{debug, info, warn};

use crate::calculations::{
    CalculationResult, CostValues, ErrorCategory, Failure, FailureReason, Indicators, LcaValues, Outcome,
    PerAreaValues, ProcessingError, ResultKind,
};
use crate::config::ResultPolicy;
use crate::errors::{EngineError, EngineResult};
use crate::project::{Project, ProjectStatus};
use crate::reference::{
    CostReferenceEntry, CostTable, LifeExpectancyEntry, LifeExpectancyTable, MaterialMapping, MaterialTable,
    PinnedVersions, ReferenceKind, ReferenceMaterial, ReferenceTable, UnitType,
};

/// Handle to the SQLite database. All access is serialized on one connection.
pub struct Store {
    conn: Mutex<Connection>,
    path: Option<PathBuf>,
}

impl std::fmt::Debug for Store {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Store").field("path", &self.path).finish()
    }
}

impl Store {
    /// Open (or create) the database at `path` and migrate it.
    pub fn open(path: &Path, busy_timeout: Duration) -> EngineResult<Self> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent).map_err(|e| {
                    EngineError::file_error("create database directory", parent.display().to_string(), e.to_string())
                })?;
            }
        }
        let conn = Connection::open(path)?;
        schema::migrate(&conn, busy_timeout)?;
        info!(path = %path.display(), "store opened");
        Ok(Store {
            conn: Mutex::new(conn),
            path: Some(path.to_path_buf()),
        })
    }

    /// Private in-memory database
    pub fn open_in_memory() -> EngineResult<Self> {
        let conn = Connection::open_in_memory()?;
        schema::migrate(&conn, Duration::from_millis(1_000))?;
        Ok(Store {
            conn: Mutex::new(conn),
            path: None,
        })
    }

    /// Database file, `None` for in-memory stores
    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    // The connection survives a panic in another holder; keep using it.
    fn with_conn<R>(&self, f: impl FnOnce(&mut Connection) -> EngineResult<R>) -> EngineResult<R> {
        let mut guard = self.conn.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        f(&mut guard)
    }

    // ------------------------------------------------------------------------
    // Reference data
    // ------------------------------------------------------------------------

    /// Persist a new reference version. Fails with `VersionExists` if the
    /// (kind, version) pair is already stored.
    pub fn insert_reference_version(&self, table: &ReferenceTable) -> EngineResult<()> {
        let kind = table.kind();
        let version = table.version();
        self.with_conn(|conn| {
            let tx = conn.transaction()?;
            if version_exists(&tx, kind, version)? {
                return Err(EngineError::version_exists(kind.as_str(), version));
            }
            tx.execute(
                "INSERT INTO reference_versions (kind, version, row_count, loaded_at) VALUES (?1, ?2, ?3, ?4)",
                params![kind.as_str(), version, table.row_count() as i64, timestamp(&Utc::now())],
            )?;

            match table {
                ReferenceTable::Materials(t) => {
                    let mut stmt = tx.prepare(
                        "INSERT INTO reference_materials (material_key, version, name, gwp, penr, ubp, default_density) \
                         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                    )?;
                    for m in t.materials() {
                        stmt.execute(params![m.key, version, m.name, m.gwp, m.penr, m.ubp, m.default_density])?;
                    }
                    let mut stmt = tx.prepare(
                        "INSERT INTO material_mappings (version, source_name, material_key) VALUES (?1, ?2, ?3)",
                    )?;
                    for mapping in t.mappings() {
                        stmt.execute(params![version, mapping.source_name, mapping.material_key])?;
                    }
                }
                ReferenceTable::LifeExpectancy(t) => {
                    let mut stmt = tx.prepare(
                        "INSERT INTO life_expectancy (version, code, description, years, model_based) \
                         VALUES (?1, ?2, ?3, ?4, ?5)",
                    )?;
                    for e in t.entries() {
                        stmt.execute(params![version, e.code, e.description, e.years, e.model_based])?;
                    }
                }
                ReferenceTable::Cost(t) => {
                    let mut stmt = tx.prepare(
                        "INSERT INTO cost_reference (code, version, description, unit, cost_per_unit) \
                         VALUES (?1, ?2, ?3, ?4, ?5)",
                    )?;
                    for e in t.entries() {
                        stmt.execute(params![e.code, version, e.description, e.unit.as_str(), e.cost_per_unit])?;
                    }
                }
            }

            tx.commit()?;
            info!(kind = %kind, version, rows = table.row_count(), "reference version stored");
            Ok(())
        })
    }

    /// Point `kind` at a stored version.
    pub fn activate_version(&self, kind: ReferenceKind, version: &str) -> EngineResult<()> {
        self.with_conn(|conn| {
            let tx = conn.transaction()?;
            if !version_exists(&tx, kind, version)? {
                return Err(EngineError::version_not_found(kind.as_str(), version));
            }
            tx.execute(
                "INSERT INTO reference_active (kind, version, activated_at) VALUES (?1, ?2, ?3) \
                 ON CONFLICT(kind) DO UPDATE SET version = excluded.version, activated_at = excluded.activated_at",
                params![kind.as_str(), version, timestamp(&Utc::now())],
            )?;
            tx.commit()?;
            Ok(())
        })
    }

    /// Active version per kind
    pub fn active_versions(&self) -> EngineResult<Vec<(ReferenceKind, String)>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare("SELECT kind, version FROM reference_active ORDER BY kind")?;
            let rows = stmt.query_map([], |row| Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?)))?;
            let mut active = Vec::new();
            for row in rows {
                let (kind, version) = row?;
                let kind = ReferenceKind::parse(&kind).ok_or_else(|| EngineError::Internal {
                    message: format!("unknown reference kind '{}' in database", kind),
                })?;
                active.push((kind, version));
            }
            Ok(active)
        })
    }

    /// Every stored reference version, rebuilt and re-validated.
    pub fn load_reference_tables(&self) -> EngineResult<Vec<ReferenceTable>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare("SELECT kind, version FROM reference_versions ORDER BY rowid")?;
            let stored = stmt
                .query_map([], |row| Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?)))?
                .collect::<Result<Vec<_>, _>>()?;

            let mut tables = Vec::with_capacity(stored.len());
            for (kind, version) in stored {
                let table = match ReferenceKind::parse(&kind) {
                    Some(ReferenceKind::Materials) => ReferenceTable::Materials(Arc::new(load_materials(conn, &version)?)),
                    Some(ReferenceKind::LifeExpectancy) => {
                        ReferenceTable::LifeExpectancy(Arc::new(load_life_expectancy(conn, &version)?))
                    }
                    Some(ReferenceKind::Cost) => ReferenceTable::Cost(Arc::new(load_cost(conn, &version)?)),
                    None => {
                        return Err(EngineError::Internal {
                            message: format!("unknown reference kind '{}' in database", kind),
                        })
                    }
                };
                tables.push(table);
            }
            debug!(tables = tables.len(), "reference versions loaded from store");
            Ok(tables)
        })
    }

    // ------------------------------------------------------------------------
    // Runs
    // ------------------------------------------------------------------------

    /// Create the project if absent and move it to `processing` when allowed.
    ///
    /// Returns the stored project. A terminal project keeps its status.
    pub fn begin_run(&self, project: &Project) -> EngineResult<Project> {
        self.with_conn(|conn| {
            let tx = conn.transaction()?;
            insert_project_if_absent(&tx, project)?;
            if let Some(area) = project.floor_area() {
                tx.execute(
                    "UPDATE projects SET reference_floor_area_m2 = ?2 WHERE project_id = ?1",
                    params![project.project_id, area],
                )?;
            }
            let mut stored = read_project(&tx, &project.project_id)?.ok_or_else(|| EngineError::Internal {
                message: format!("project '{}' vanished", project.project_id),
            })?;
            if stored.status.can_transition_to(ProjectStatus::Processing) {
                stored.transition(ProjectStatus::Processing)?;
                update_status(&tx, &stored)?;
            }
            tx.commit()?;
            Ok(stored)
        })
    }

    /// Write one batch atomically.
    ///
    /// Checks that every referenced version exists, applies the history
    /// row's result policy, inserts elements and assignments if absent,
    /// then results, errors and the history row, and marks the project
    /// `completed` when that transition is allowed. Any failure rolls the
    /// whole transaction back.
    pub fn commit(&self, batch: &CommitBatch<'_>) -> EngineResult<CommitSummary> {
        let project_id = batch.project.project_id.as_str();
        let run_id = batch.history.run_id.as_str();
        let now = timestamp(&batch.history.created_at);

        self.with_conn(|conn| {
            let tx = conn.transaction()?;
            let mut summary = CommitSummary::default();

            let pinned: HashSet<&PinnedVersions> = batch
                .results
                .iter()
                .map(|r| &r.versions)
                .chain(batch.history.versions.iter())
                .collect();
            for versions in pinned {
                for kind in ReferenceKind::ALL {
                    if !version_exists(&tx, kind, versions.get(kind))? {
                        return Err(EngineError::version_not_found(kind.as_str(), versions.get(kind)));
                    }
                }
            }

            insert_project_if_absent(&tx, batch.project)?;

            if batch.history.policy == ResultPolicy::ReplaceProject {
                summary.results_replaced =
                    tx.execute("DELETE FROM calculation_results WHERE project_id = ?1", params![project_id])?;
                tx.execute("DELETE FROM processing_errors WHERE project_id = ?1", params![project_id])?;
            }

            {
                let mut stmt = tx.prepare(
                    "INSERT INTO elements (project_id, id, classification_code, volume_net, volume_gross, \
                     area_net, area_gross, length, width, height, created_at) \
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11) \
                     ON CONFLICT(project_id, id) DO NOTHING",
                )?;
                for e in batch.elements {
                    let g = &e.geometry;
                    summary.elements_inserted += stmt.execute(params![
                        project_id,
                        e.id,
                        e.code(),
                        g.volume_net,
                        g.volume_gross,
                        g.area_net,
                        g.area_gross,
                        g.length,
                        g.width,
                        g.height,
                        now,
                    ])?;
                }

                let mut stmt = tx.prepare(
                    "INSERT INTO material_assignments (project_id, element_id, material_name, fraction, volume, density, width) \
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7) \
                     ON CONFLICT(project_id, element_id, material_name) DO NOTHING",
                )?;
                for a in batch.assignments {
                    summary.assignments_inserted += stmt.execute(params![
                        project_id,
                        a.element_id,
                        a.material_name,
                        a.fraction,
                        a.volume,
                        a.density,
                        a.width,
                    ])?;
                }

                let mut stmt = tx.prepare(INSERT_RESULT)?;
                for r in batch.results {
                    let lca = r.lca();
                    let cost = r.cost();
                    let failure = r.failure();
                    let per_area = lca.and_then(|v| v.per_area.as_ref());
                    stmt.execute(params![
                        run_id,
                        project_id,
                        r.element_id,
                        r.kind.as_str(),
                        r.material_name,
                        r.classification_code,
                        r.reference_key,
                        r.versions.materials,
                        r.versions.life_expectancy,
                        r.versions.cost,
                        r.is_valid(),
                        failure.map(|f| f.reason.as_str()),
                        failure.map(|f| f.detail.as_str()),
                        lca.map(|v| v.volume),
                        lca.map(|v| v.density),
                        lca.map(|v| v.mass),
                        lca.map(|v| v.life_span_years),
                        lca.and_then(|v| v.life_span_code.as_deref()),
                        lca.map(|v| v.gwp_absolute),
                        lca.map(|v| v.gwp_per_year),
                        lca.map(|v| v.penr_absolute),
                        lca.map(|v| v.penr_per_year),
                        lca.map(|v| v.ubp_absolute),
                        lca.map(|v| v.ubp_per_year),
                        per_area.map(|p| p.gwp),
                        per_area.map(|p| p.penr),
                        per_area.map(|p| p.ubp),
                        cost.map(|c| c.quantity),
                        cost.map(|c| c.unit.as_str()),
                        cost.map(|c| c.unit_cost),
                        cost.map(|c| c.total_cost),
                        now,
                    ])?;
                    summary.results_written += 1;
                }

                let mut stmt = tx.prepare(
                    "INSERT INTO processing_errors (run_id, project_id, element_id, material_name, kind, category, \
                     reason, message, created_at) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
                )?;
                for e in batch.errors {
                    stmt.execute(params![
                        run_id,
                        project_id,
                        e.element_id,
                        e.material_name,
                        e.kind.as_str(),
                        e.category.as_str(),
                        e.reason.as_str(),
                        e.message,
                        timestamp(&e.created_at),
                    ])?;
                    summary.errors_written += 1;
                }
            }

            let mut stored = read_project(&tx, project_id)?.ok_or_else(|| EngineError::Internal {
                message: format!("project '{}' vanished", project_id),
            })?;
            if stored.status.can_transition_to(ProjectStatus::Completed) {
                stored.transition(ProjectStatus::Completed)?;
                update_status(&tx, &stored)?;
            }
            summary.project_status = stored.status;

            insert_history(&tx, batch.history)?;
            tx.commit()?;

            info!(
                project = project_id,
                run = run_id,
                results = summary.results_written,
                errors = summary.errors_written,
                replaced = summary.results_replaced,
                "batch committed"
            );
            Ok(summary)
        })
    }

    /// Record an aborted run: project to `failed` when allowed, plus a
    /// history row carrying the failure detail.
    pub fn record_failure(&self, project: &Project, history: &ProcessingHistory) -> EngineResult<()> {
        self.with_conn(|conn| {
            let tx = conn.transaction()?;
            insert_project_if_absent(&tx, project)?;
            if let Some(mut stored) = read_project(&tx, &project.project_id)? {
                if stored.status.can_transition_to(ProjectStatus::Failed) {
                    stored.transition(ProjectStatus::Failed)?;
                    update_status(&tx, &stored)?;
                }
            }
            insert_history(&tx, history)?;
            tx.commit()?;
            warn!(
                project = %project.project_id,
                run = %history.run_id,
                detail = history.detail.as_deref().unwrap_or(""),
                "run failure recorded"
            );
            Ok(())
        })
    }

    // ------------------------------------------------------------------------
    // Queries
    // ------------------------------------------------------------------------

    pub fn project(&self, project_id: &str) -> EngineResult<Option<Project>> {
        self.with_conn(|conn| read_project(conn, project_id))
    }

    /// Project row with counts and its latest run
    pub fn project_info(&self, project_id: &str) -> EngineResult<Option<ProjectInfo>> {
        self.with_conn(|conn| {
            let Some(project) = read_project(conn, project_id)? else {
                return Ok(None);
            };
            let result_count: i64 = conn.query_row(
                "SELECT COUNT(*) FROM calculation_results WHERE project_id = ?1",
                params![project_id],
                |row| row.get(0),
            )?;
            let error_count: i64 = conn.query_row(
                "SELECT COUNT(*) FROM processing_errors WHERE project_id = ?1",
                params![project_id],
                |row| row.get(0),
            )?;
            let latest_run = conn
                .query_row(
                    &format!("{} WHERE project_id = ?1 ORDER BY id DESC LIMIT 1", SELECT_HISTORY),
                    params![project_id],
                    row_to_history,
                )
                .optional()?;
            Ok(Some(ProjectInfo {
                project,
                result_count: result_count as usize,
                error_count: error_count as usize,
                latest_run,
            }))
        })
    }

    /// Result records of a project in insertion order
    pub fn results_for_project(&self, project_id: &str) -> EngineResult<Vec<StoredResult>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(&format!("{} WHERE project_id = ?1 ORDER BY id", SELECT_RESULT))?;
            let rows = stmt
                .query_map(params![project_id], row_to_result)?
                .collect::<Result<Vec<_>, _>>()?;
            Ok(rows)
        })
    }

    /// Processing errors of a project in insertion order
    pub fn errors_for_project(&self, project_id: &str) -> EngineResult<Vec<StoredError>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT id, run_id, project_id, element_id, material_name, kind, category, reason, message, created_at \
                 FROM processing_errors WHERE project_id = ?1 ORDER BY id",
            )?;
            let rows = stmt
                .query_map(params![project_id], row_to_error)?
                .collect::<Result<Vec<_>, _>>()?;
            Ok(rows)
        })
    }

    /// Run history of a project, oldest first
    pub fn history_for_project(&self, project_id: &str) -> EngineResult<Vec<ProcessingHistory>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(&format!("{} WHERE project_id = ?1 ORDER BY id", SELECT_HISTORY))?;
            let rows = stmt
                .query_map(params![project_id], row_to_history)?
                .collect::<Result<Vec<_>, _>>()?;
            Ok(rows)
        })
    }
}

// ============================================================================
// SQL
// ============================================================================

const INSERT_RESULT: &str = "INSERT INTO calculation_results (\
    run_id, project_id, element_id, kind, material_name, classification_code, reference_key, \
    materials_version, life_expectancy_version, cost_version, valid, failure_reason, failure_detail, \
    volume, density, mass, life_span_years, life_span_code, \
    gwp_absolute, gwp_per_year, penr_absolute, penr_per_year, ubp_absolute, ubp_per_year, \
    gwp_per_area, penr_per_area, ubp_per_area, quantity, unit, unit_cost, total_cost, created_at) \
    VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?17, ?18, ?19, ?20, \
    ?21, ?22, ?23, ?24, ?25, ?26, ?27, ?28, ?29, ?30, ?31, ?32)";

const SELECT_RESULT: &str = "SELECT id, run_id, project_id, element_id, kind, material_name, classification_code, \
    reference_key, materials_version, life_expectancy_version, cost_version, valid, failure_reason, failure_detail, \
    volume, density, mass, life_span_years, life_span_code, gwp_absolute, gwp_per_year, penr_absolute, \
    penr_per_year, ubp_absolute, ubp_per_year, gwp_per_area, penr_per_area, ubp_per_area, quantity, unit, \
    unit_cost, total_cost, created_at FROM calculation_results";

const SELECT_HISTORY: &str = "SELECT run_id, project_id, requested_version, materials_version, \
    life_expectancy_version, cost_version, total_elements, processed_elements, failed_elements, result_count, \
    error_count, duration_secs, status, policy, detail, created_at FROM processing_history";

const SELECT_PROJECT: &str = "SELECT project_id, name, default_life_expectancy_years, reference_version, \
    reference_floor_area_m2, status, created_at, updated_at FROM projects";

// ============================================================================
// Helpers
// ============================================================================

fn timestamp(at: &DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn conversion(idx: usize, message: String) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, message.into())
}

fn parse_timestamp(row: &Row<'_>, idx: usize) -> rusqlite::Result<DateTime<Utc>> {
    let raw: String = row.get(idx)?;
    DateTime::parse_from_rfc3339(&raw)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(e)))
}

fn version_exists(conn: &Connection, kind: ReferenceKind, version: &str) -> EngineResult<bool> {
    let found = conn
        .query_row(
            "SELECT 1 FROM reference_versions WHERE kind = ?1 AND version = ?2",
            params![kind.as_str(), version],
            |_| Ok(()),
        )
        .optional()?;
    Ok(found.is_some())
}

fn insert_project_if_absent(conn: &Connection, project: &Project) -> EngineResult<()> {
    conn.execute(
        "INSERT INTO projects (project_id, name, default_life_expectancy_years, reference_version, \
         reference_floor_area_m2, status, created_at, updated_at) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8) \
         ON CONFLICT(project_id) DO NOTHING",
        params![
            project.project_id,
            project.name,
            project.default_life_expectancy_years,
            project.reference_version,
            project.floor_area(),
            project.status.as_str(),
            timestamp(&project.created_at),
            timestamp(&project.updated_at),
        ],
    )?;
    Ok(())
}

fn update_status(conn: &Connection, project: &Project) -> EngineResult<()> {
    conn.execute(
        "UPDATE projects SET status = ?2, updated_at = ?3 WHERE project_id = ?1",
        params![project.project_id, project.status.as_str(), timestamp(&project.updated_at)],
    )?;
    Ok(())
}

fn read_project(conn: &Connection, project_id: &str) -> EngineResult<Option<Project>> {
    let project = conn
        .query_row(
            &format!("{} WHERE project_id = ?1", SELECT_PROJECT),
            params![project_id],
            row_to_project,
        )
        .optional()?;
    Ok(project)
}

fn insert_history(conn: &Connection, h: &ProcessingHistory) -> EngineResult<()> {
    let versions = h.versions.as_ref();
    conn.execute(
        "INSERT INTO processing_history (run_id, project_id, requested_version, materials_version, \
         life_expectancy_version, cost_version, total_elements, processed_elements, failed_elements, \
         result_count, error_count, duration_secs, status, policy, detail, created_at) \
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16)",
        params![
            h.run_id,
            h.project_id,
            h.requested_version,
            versions.map(|v| v.materials.as_str()),
            versions.map(|v| v.life_expectancy.as_str()),
            versions.map(|v| v.cost.as_str()),
            h.total_elements as i64,
            h.processed_elements as i64,
            h.failed_elements as i64,
            h.result_count as i64,
            h.error_count as i64,
            h.duration_secs,
            h.status.as_str(),
            h.policy.as_str(),
            h.detail,
            timestamp(&h.created_at),
        ],
    )?;
    Ok(())
}

fn load_materials(conn: &Connection, version: &str) -> EngineResult<MaterialTable> {
    let mut stmt = conn.prepare(
        "SELECT material_key, name, gwp, penr, ubp, default_density FROM reference_materials \
         WHERE version = ?1 ORDER BY material_key",
    )?;
    let materials = stmt
        .query_map(params![version], |row| {
            Ok(ReferenceMaterial {
                key: row.get(0)?,
                name: row.get(1)?,
                gwp: row.get(2)?,
                penr: row.get(3)?,
                ubp: row.get(4)?,
                default_density: row.get(5)?,
            })
        })?
        .collect::<Result<Vec<_>, _>>()?;

    let mut stmt =
        conn.prepare("SELECT source_name, material_key FROM material_mappings WHERE version = ?1 ORDER BY id")?;
    let mappings = stmt
        .query_map(params![version], |row| Ok(MaterialMapping::new(row.get::<_, String>(0)?, row.get::<_, String>(1)?)))?
        .collect::<Result<Vec<_>, _>>()?;

    MaterialTable::new(version, materials, mappings)
}

fn load_life_expectancy(conn: &Connection, version: &str) -> EngineResult<LifeExpectancyTable> {
    let mut stmt = conn.prepare(
        "SELECT code, description, years, model_based FROM life_expectancy WHERE version = ?1 ORDER BY id",
    )?;
    let entries = stmt
        .query_map(params![version], |row| {
            Ok(LifeExpectancyEntry {
                code: row.get(0)?,
                description: row.get(1)?,
                years: row.get(2)?,
                model_based: row.get(3)?,
            })
        })?
        .collect::<Result<Vec<_>, _>>()?;
    LifeExpectancyTable::new(version, entries)
}

fn load_cost(conn: &Connection, version: &str) -> EngineResult<CostTable> {
    let mut stmt = conn.prepare(
        "SELECT code, description, unit, cost_per_unit FROM cost_reference WHERE version = ?1 ORDER BY code",
    )?;
    let entries = stmt
        .query_map(params![version], |row| {
            Ok(CostReferenceEntry {
                code: row.get(0)?,
                description: row.get(1)?,
                unit: UnitType::from(row.get::<_, String>(2)?),
                cost_per_unit: row.get(3)?,
            })
        })?
        .collect::<Result<Vec<_>, _>>()?;
    CostTable::new(version, entries)
}

// ============================================================================
// Row converters
// ============================================================================

fn row_to_project(row: &Row<'_>) -> rusqlite::Result<Project> {
    let status: String = row.get(5)?;
    Ok(Project {
        project_id: row.get(0)?,
        name: row.get(1)?,
        default_life_expectancy_years: row.get(2)?,
        reference_version: row.get(3)?,
        reference_floor_area_m2: row.get(4)?,
        status: ProjectStatus::parse(&status).ok_or_else(|| conversion(5, format!("unknown status '{}'", status)))?,
        created_at: parse_timestamp(row, 6)?,
        updated_at: parse_timestamp(row, 7)?,
    })
}

fn row_to_result(row: &Row<'_>) -> rusqlite::Result<StoredResult> {
    let kind_raw: String = row.get(4)?;
    let kind = ResultKind::parse(&kind_raw).ok_or_else(|| conversion(4, format!("unknown kind '{}'", kind_raw)))?;
    let valid: bool = row.get(11)?;

    let outcome = if valid {
        match kind {
            ResultKind::Lca => {
                let per_area = match row.get::<_, Option<f64>>(25)? {
                    Some(gwp) => Some(PerAreaValues {
                        gwp,
                        penr: row.get(26)?,
                        ubp: row.get(27)?,
                    }),
                    None => None,
                };
                Outcome::Valid(Indicators::Lca(LcaValues {
                    volume: row.get(14)?,
                    density: row.get(15)?,
                    mass: row.get(16)?,
                    life_span_years: row.get(17)?,
                    life_span_code: row.get(18)?,
                    gwp_absolute: row.get(19)?,
                    gwp_per_year: row.get(20)?,
                    penr_absolute: row.get(21)?,
                    penr_per_year: row.get(22)?,
                    ubp_absolute: row.get(23)?,
                    ubp_per_year: row.get(24)?,
                    per_area,
                }))
            }
            ResultKind::Cost => Outcome::Valid(Indicators::Cost(CostValues {
                quantity: row.get(28)?,
                unit: UnitType::from(row.get::<_, String>(29)?),
                unit_cost: row.get(30)?,
                total_cost: row.get(31)?,
            })),
        }
    } else {
        let reason_raw: String = row.get(12)?;
        let reason = FailureReason::parse(&reason_raw)
            .ok_or_else(|| conversion(12, format!("unknown failure reason '{}'", reason_raw)))?;
        Outcome::Failed(Failure::new(reason, row.get::<_, Option<String>>(13)?.unwrap_or_default()))
    };

    Ok(StoredResult {
        id: row.get(0)?,
        run_id: row.get(1)?,
        project_id: row.get(2)?,
        created_at: parse_timestamp(row, 32)?,
        result: CalculationResult {
            element_id: row.get(3)?,
            kind,
            material_name: row.get(5)?,
            classification_code: row.get(6)?,
            reference_key: row.get(7)?,
            versions: PinnedVersions {
                materials: row.get(8)?,
                life_expectancy: row.get(9)?,
                cost: row.get(10)?,
            },
            outcome,
        },
    })
}

fn row_to_error(row: &Row<'_>) -> rusqlite::Result<StoredError> {
    let kind_raw: String = row.get(5)?;
    let category_raw: String = row.get(6)?;
    let reason_raw: String = row.get(7)?;
    Ok(StoredError {
        id: row.get(0)?,
        run_id: row.get(1)?,
        error: ProcessingError {
            project_id: row.get(2)?,
            element_id: row.get(3)?,
            material_name: row.get(4)?,
            kind: ResultKind::parse(&kind_raw).ok_or_else(|| conversion(5, format!("unknown kind '{}'", kind_raw)))?,
            category: ErrorCategory::parse(&category_raw)
                .ok_or_else(|| conversion(6, format!("unknown category '{}'", category_raw)))?,
            reason: FailureReason::parse(&reason_raw)
                .ok_or_else(|| conversion(7, format!("unknown failure reason '{}'", reason_raw)))?,
            message: row.get(8)?,
            created_at: parse_timestamp(row, 9)?,
        },
    })
}

fn row_to_history(row: &Row<'_>) -> rusqlite::Result<ProcessingHistory> {
    let materials: Option<String> = row.get(3)?;
    let life_expectancy: Option<String> = row.get(4)?;
    let cost: Option<String> = row.get(5)?;
    let versions = match (materials, life_expectancy, cost) {
        (Some(materials), Some(life_expectancy), Some(cost)) => Some(PinnedVersions {
            materials,
            life_expectancy,
            cost,
        }),
        _ => None,
    };
    let status: String = row.get(12)?;
    let policy: String = row.get(13)?;
    Ok(ProcessingHistory {
        run_id: row.get(0)?,
        project_id: row.get(1)?,
        requested_version: row.get(2)?,
        versions,
        total_elements: row.get::<_, i64>(6)? as usize,
        processed_elements: row.get::<_, i64>(7)? as usize,
        failed_elements: row.get::<_, i64>(8)? as usize,
        result_count: row.get::<_, i64>(9)? as usize,
        error_count: row.get::<_, i64>(10)? as usize,
        duration_secs: row.get(11)?,
        status: ProjectStatus::parse(&status).ok_or_else(|| conversion(12, format!("unknown status '{}'", status)))?,
        policy: ResultPolicy::parse(&policy).ok_or_else(|| conversion(13, format!("unknown policy '{}'", policy)))?,
        detail: row.get(14)?,
        created_at: parse_timestamp(row, 15)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::aggregate::AggregatedBatch;
    use crate::calculations::{CostProcessor, LcaProcessor};
    use crate::elements::{Element, ElementBatch, Geometry, MaterialLayer};
    use crate::pipeline::Pipeline;
    use crate::reference::{ReferenceRows, ReferenceStore};

    fn reference_rows() -> Vec<ReferenceRows> {
        vec![
            ReferenceRows::Materials {
                materials: vec![ReferenceMaterial::new("k1", "Beton", 0.1, 0.3, 150.0).with_density(2300.0)],
                mappings: vec![MaterialMapping::new("Beton", "k1")],
            },
            ReferenceRows::LifeExpectancy {
                entries: vec![LifeExpectancyEntry::new("C", 50), LifeExpectancyEntry::new("C2", 40)],
            },
            ReferenceRows::Cost {
                entries: vec![CostReferenceEntry::new("C2.1", UnitType::Area, 100.0)],
            },
        ]
    }

    fn seeded() -> (Store, ReferenceStore) {
        let store = Store::open_in_memory().unwrap();
        let references = ReferenceStore::new();
        for rows in reference_rows() {
            let table = rows.into_table("2024").unwrap();
            store.insert_reference_version(&table).unwrap();
            references.insert(table).unwrap();
        }
        for kind in ReferenceKind::ALL {
            store.activate_version(kind, "2024").unwrap();
            references.activate(kind, "2024").unwrap();
        }
        (store, references)
    }

    fn batch() -> ElementBatch {
        ElementBatch::new("P-1", "2024")
            .with_element(
                Element::new("w1", "C2.1")
                    .with_geometry(Geometry {
                        area_net: Some(10.0),
                        ..Geometry::default()
                    })
                    .with_layer(MaterialLayer::new("Beton", 2.0)),
            )
            .with_element(Element::new("w2", "C2.1").with_layer(MaterialLayer::new("Stahl", 0.1)))
    }

    struct Computed {
        project: Project,
        results: Vec<CalculationResult>,
        errors: Vec<ProcessingError>,
        history: ProcessingHistory,
    }

    fn compute(references: &ReferenceStore, batch: &ElementBatch, policy: ResultPolicy) -> Computed {
        let pin = references.pin(&batch.reference_version).unwrap();
        let lca = LcaProcessor::new(&pin, 60, None);
        let cost = CostProcessor::new(&pin);
        let now = Utc::now();
        let outcomes = Pipeline::new(2).with_processor(&lca).with_processor(&cost).run(batch, now).unwrap();
        let aggregated = AggregatedBatch::from_outcomes(outcomes);
        let results: Vec<CalculationResult> = aggregated.results().cloned().collect();
        let errors: Vec<ProcessingError> = aggregated.errors().cloned().collect();
        let history = ProcessingHistory {
            run_id: uuid::Uuid::new_v4().to_string(),
            project_id: batch.project_id.clone(),
            requested_version: batch.reference_version.clone(),
            versions: Some(pin.versions()),
            total_elements: batch.elements.len(),
            processed_elements: aggregated.processed_count(),
            failed_elements: aggregated.failed_count(),
            result_count: results.len(),
            error_count: errors.len(),
            duration_secs: 0.01,
            status: ProjectStatus::Completed,
            policy,
            detail: None,
            created_at: now,
        };
        Computed {
            project: Project::new(&batch.project_id, "Test", &batch.reference_version, 60),
            results,
            errors,
            history,
        }
    }

    fn commit(store: &Store, batch: &ElementBatch, c: &Computed) -> EngineResult<CommitSummary> {
        let assignments = MaterialAssignment::merged(&batch.elements);
        store.commit(&CommitBatch {
            project: &c.project,
            elements: &batch.elements,
            assignments: &assignments,
            results: &c.results,
            errors: &c.errors,
            history: &c.history,
        })
    }

    #[test]
    fn test_reference_version_roundtrip() {
        let (store, _) = seeded();
        let tables = store.load_reference_tables().unwrap();
        assert_eq!(tables.len(), 3);
        assert!(matches!(&tables[1], ReferenceTable::LifeExpectancy(t) if t.len() == 2));

        let active = store.active_versions().unwrap();
        assert_eq!(active.len(), 3);
        assert!(active.iter().all(|(_, v)| v == "2024"));

        let duplicate = reference_rows().remove(0).into_table("2024").unwrap();
        let err = store.insert_reference_version(&duplicate).unwrap_err();
        assert_eq!(err.error_code(), "VERSION_EXISTS");

        let err = store.activate_version(ReferenceKind::Cost, "2031").unwrap_err();
        assert_eq!(err.error_code(), "VERSION_NOT_FOUND");
    }

    #[test]
    fn test_commit_writes_everything() {
        let (store, references) = seeded();
        let batch = batch();
        let computed = compute(&references, &batch, ResultPolicy::AppendWithRun);
        store.begin_run(&computed.project).unwrap();

        let summary = commit(&store, &batch, &computed).unwrap();
        assert_eq!(summary.elements_inserted, 2);
        assert_eq!(summary.assignments_inserted, 2);
        assert_eq!(summary.results_written, 4);
        assert_eq!(summary.errors_written, 2);
        assert_eq!(summary.project_status, ProjectStatus::Completed);

        let stored = store.results_for_project("P-1").unwrap();
        let roundtrip: Vec<CalculationResult> = stored.iter().map(|s| s.result.clone()).collect();
        assert_eq!(roundtrip, computed.results);
        assert!(stored.iter().all(|s| s.run_id == computed.history.run_id));

        let errors = store.errors_for_project("P-1").unwrap();
        assert_eq!(errors.len(), 2);
        assert_eq!(errors[0].error.reason, FailureReason::UnmappedMaterial);

        let info = store.project_info("P-1").unwrap().unwrap();
        assert_eq!(info.project.status, ProjectStatus::Completed);
        assert_eq!(info.result_count, 4);
        assert_eq!(info.latest_run.unwrap().run_id, computed.history.run_id);
    }

    #[test]
    fn test_orphan_result_rolls_back_everything() {
        let (store, references) = seeded();
        let batch = batch();
        let mut computed = compute(&references, &batch, ResultPolicy::AppendWithRun);
        let mut orphan = computed.results[0].clone();
        orphan.element_id = "not-in-batch".to_string();
        computed.results.push(orphan);

        let err = commit(&store, &batch, &computed).unwrap_err();
        assert_eq!(err.error_code(), "PERSISTENCE_ERROR");

        assert!(store.project("P-1").unwrap().is_none());
        assert!(store.results_for_project("P-1").unwrap().is_empty());
        assert!(store.errors_for_project("P-1").unwrap().is_empty());
        assert!(store.history_for_project("P-1").unwrap().is_empty());
    }

    #[test]
    fn test_unknown_version_rejected_at_commit() {
        let (store, references) = seeded();
        let batch = batch();
        let mut computed = compute(&references, &batch, ResultPolicy::AppendWithRun);
        computed.results[0].versions.cost = "1999".to_string();
        let err = commit(&store, &batch, &computed).unwrap_err();
        assert_eq!(err.error_code(), "VERSION_NOT_FOUND");
        assert!(store.results_for_project("P-1").unwrap().is_empty());
    }

    #[test]
    fn test_append_and_replace_policies() {
        let (store, references) = seeded();
        let batch = batch();

        let first = compute(&references, &batch, ResultPolicy::AppendWithRun);
        commit(&store, &batch, &first).unwrap();
        let second = compute(&references, &batch, ResultPolicy::AppendWithRun);
        let summary = commit(&store, &batch, &second).unwrap();
        assert_eq!(summary.elements_inserted, 0);
        assert_eq!(summary.assignments_inserted, 0);
        assert_eq!(store.results_for_project("P-1").unwrap().len(), 8);

        let third = compute(&references, &batch, ResultPolicy::ReplaceProject);
        let summary = commit(&store, &batch, &third).unwrap();
        assert_eq!(summary.results_replaced, 8);
        let stored = store.results_for_project("P-1").unwrap();
        assert_eq!(stored.len(), 4);
        assert!(stored.iter().all(|s| s.run_id == third.history.run_id));
        assert_eq!(store.errors_for_project("P-1").unwrap().len(), 2);

        let history = store.history_for_project("P-1").unwrap();
        assert_eq!(history.len(), 3);
        assert_eq!(history[2].policy, ResultPolicy::ReplaceProject);
    }

    #[test]
    fn test_record_failure() {
        let (store, _) = seeded();
        let project = Project::new("P-9", "Failing", "2024", 60);
        store.begin_run(&project).unwrap();
        assert_eq!(store.project("P-9").unwrap().unwrap().status, ProjectStatus::Processing);

        let history = ProcessingHistory {
            run_id: "run-1".to_string(),
            project_id: "P-9".to_string(),
            requested_version: "2024".to_string(),
            versions: None,
            total_elements: 3,
            processed_elements: 0,
            failed_elements: 3,
            result_count: 0,
            error_count: 0,
            duration_secs: 0.0,
            status: ProjectStatus::Failed,
            policy: ResultPolicy::AppendWithRun,
            detail: Some("disk full".to_string()),
            created_at: Utc::now(),
        };
        store.record_failure(&project, &history).unwrap();

        let info = store.project_info("P-9").unwrap().unwrap();
        assert_eq!(info.project.status, ProjectStatus::Failed);
        let latest = info.latest_run.unwrap();
        assert_eq!(latest.detail.as_deref(), Some("disk full"));
        assert!(latest.versions.is_none());
    }

    #[test]
    fn test_terminal_project_keeps_status() {
        let (store, references) = seeded();
        let batch = batch();
        let computed = compute(&references, &batch, ResultPolicy::AppendWithRun);
        store.begin_run(&computed.project).unwrap();
        commit(&store, &batch, &computed).unwrap();

        let stored = store.begin_run(&computed.project).unwrap();
        assert_eq!(stored.status, ProjectStatus::Completed);
    }
}
