//! SQLite schema.
//!
//! Reference rows are keyed by (key, version) and never updated in place.
//! Result rows reference their element through (project_id, element_id);
//! an orphan element identifier violates the foreign key and rolls the
//! whole commit back.

use std::time::Duration;

use rusqlite::Connection;
use tracing::debug;

use crate::errors::EngineResult;

/// Value of `PRAGMA user_version` after migration
pub const SCHEMA_VERSION: i64 = 1;

const CREATE_TABLES: &str = "
CREATE TABLE IF NOT EXISTS reference_versions (
    kind TEXT NOT NULL CHECK (kind IN ('materials', 'life_expectancy', 'cost')),
    version TEXT NOT NULL,
    row_count INTEGER NOT NULL,
    loaded_at TEXT NOT NULL,
    PRIMARY KEY (kind, version)
);

CREATE TABLE IF NOT EXISTS reference_active (
    kind TEXT PRIMARY KEY,
    version TEXT NOT NULL,
    activated_at TEXT NOT NULL,
    FOREIGN KEY (kind, version) REFERENCES reference_versions (kind, version)
);

CREATE TABLE IF NOT EXISTS reference_materials (
    material_key TEXT NOT NULL,
    version TEXT NOT NULL,
    name TEXT NOT NULL,
    gwp REAL NOT NULL,
    penr REAL NOT NULL,
    ubp REAL NOT NULL,
    default_density REAL,
    PRIMARY KEY (material_key, version)
);

CREATE TABLE IF NOT EXISTS material_mappings (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    version TEXT NOT NULL,
    source_name TEXT NOT NULL,
    material_key TEXT NOT NULL,
    FOREIGN KEY (material_key, version) REFERENCES reference_materials (material_key, version)
);

CREATE TABLE IF NOT EXISTS life_expectancy (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    version TEXT NOT NULL,
    code TEXT NOT NULL,
    description TEXT NOT NULL DEFAULT '',
    years INTEGER NOT NULL CHECK (years > 0),
    model_based INTEGER NOT NULL DEFAULT 0,
    UNIQUE (version, code)
);

CREATE TABLE IF NOT EXISTS cost_reference (
    code TEXT NOT NULL,
    version TEXT NOT NULL,
    description TEXT NOT NULL DEFAULT '',
    unit TEXT NOT NULL,
    cost_per_unit REAL NOT NULL,
    PRIMARY KEY (code, version)
);

CREATE TABLE IF NOT EXISTS projects (
    project_id TEXT PRIMARY KEY,
    name TEXT NOT NULL,
    default_life_expectancy_years INTEGER NOT NULL CHECK (default_life_expectancy_years > 0),
    reference_version TEXT NOT NULL,
    reference_floor_area_m2 REAL,
    status TEXT NOT NULL CHECK (status IN ('active', 'processing', 'completed', 'failed')),
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS elements (
    project_id TEXT NOT NULL REFERENCES projects (project_id),
    id TEXT NOT NULL,
    classification_code TEXT,
    volume_net REAL,
    volume_gross REAL,
    area_net REAL,
    area_gross REAL,
    length REAL,
    width REAL,
    height REAL,
    created_at TEXT NOT NULL,
    PRIMARY KEY (project_id, id)
);

CREATE TABLE IF NOT EXISTS material_assignments (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    project_id TEXT NOT NULL,
    element_id TEXT NOT NULL,
    material_name TEXT NOT NULL,
    fraction REAL,
    volume REAL,
    density REAL,
    width REAL,
    UNIQUE (project_id, element_id, material_name),
    FOREIGN KEY (project_id, element_id) REFERENCES elements (project_id, id)
);

CREATE TABLE IF NOT EXISTS calculation_results (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    run_id TEXT NOT NULL,
    project_id TEXT NOT NULL,
    element_id TEXT NOT NULL,
    kind TEXT NOT NULL CHECK (kind IN ('lca', 'cost')),
    material_name TEXT,
    classification_code TEXT,
    reference_key TEXT,
    materials_version TEXT NOT NULL,
    life_expectancy_version TEXT NOT NULL,
    cost_version TEXT NOT NULL,
    valid INTEGER NOT NULL,
    failure_reason TEXT,
    failure_detail TEXT,
    volume REAL,
    density REAL,
    mass REAL,
    life_span_years INTEGER,
    life_span_code TEXT,
    gwp_absolute REAL,
    gwp_per_year REAL,
    penr_absolute REAL,
    penr_per_year REAL,
    ubp_absolute REAL,
    ubp_per_year REAL,
    gwp_per_area REAL,
    penr_per_area REAL,
    ubp_per_area REAL,
    quantity REAL,
    unit TEXT,
    unit_cost REAL,
    total_cost REAL,
    created_at TEXT NOT NULL,
    FOREIGN KEY (project_id, element_id) REFERENCES elements (project_id, id)
);

CREATE TABLE IF NOT EXISTS processing_errors (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    run_id TEXT NOT NULL,
    project_id TEXT NOT NULL REFERENCES projects (project_id),
    element_id TEXT,
    material_name TEXT,
    kind TEXT NOT NULL,
    category TEXT NOT NULL,
    reason TEXT NOT NULL,
    message TEXT NOT NULL,
    created_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS processing_history (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    run_id TEXT NOT NULL UNIQUE,
    project_id TEXT NOT NULL REFERENCES projects (project_id),
    requested_version TEXT NOT NULL,
    materials_version TEXT,
    life_expectancy_version TEXT,
    cost_version TEXT,
    total_elements INTEGER NOT NULL,
    processed_elements INTEGER NOT NULL,
    failed_elements INTEGER NOT NULL,
    result_count INTEGER NOT NULL,
    error_count INTEGER NOT NULL,
    duration_secs REAL NOT NULL,
    status TEXT NOT NULL,
    policy TEXT NOT NULL,
    detail TEXT,
    created_at TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_mappings_version ON material_mappings (version);
CREATE INDEX IF NOT EXISTS idx_life_expectancy_version ON life_expectancy (version, code);
CREATE INDEX IF NOT EXISTS idx_results_project ON calculation_results (project_id, run_id);
CREATE INDEX IF NOT EXISTS idx_errors_project ON processing_errors (project_id, run_id);
CREATE INDEX IF NOT EXISTS idx_history_project ON processing_history (project_id);
";

/// Connection pragmas, tables and indexes.
pub fn migrate(conn: &Connection, busy_timeout: Duration) -> EngineResult<()> {
    conn.busy_timeout(busy_timeout)?;
    conn.execute_batch(
        "PRAGMA journal_mode=WAL;\
         PRAGMA synchronous=NORMAL;\
         PRAGMA foreign_keys=ON;",
    )?;

    let current: i64 = conn.query_row("PRAGMA user_version", [], |row| row.get(0))?;
    if current < SCHEMA_VERSION {
        conn.execute_batch(CREATE_TABLES)?;
        conn.execute_batch(&format!("PRAGMA user_version = {};", SCHEMA_VERSION))?;
        debug!(from = current, to = SCHEMA_VERSION, "schema migrated");
    }
    Ok(())
}
