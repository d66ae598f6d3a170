//! # lca_core - Building Element LCA and Cost Engine
//!
//! `lca_core` turns building elements and their material layers into
//! environmental indicators (GWP, PENR, UBP) and construction costs, computed
//! against immutable, versioned reference data and committed to SQLite one
//! batch per transaction.
//!
//! ## Design Philosophy
//!
//! - **Pinned reference data**: every batch resolves its reference versions once and
//!   records them on each result
//! - **Failures are values**: record-level problems become failed result records,
//!   never batch errors
//! - **All or nothing**: a batch's rows are either all committed or none are
//! - **JSON-first**: all records implement Serialize/Deserialize
//!
//! ## Quick Start
//!
//! ```rust
//! use lca_core::config::EngineConfig;
//! use lca_core::elements::{Element, ElementBatch, MaterialLayer};
//! use lca_core::reference::{MaterialMapping, ReferenceMaterial, ReferenceRows};
//! use lca_core::store::Store;
//! use lca_core::Engine;
//!
//! let engine = Engine::with_store(EngineConfig::default(), Store::open_in_memory().unwrap()).unwrap();
//! let reference = [
//!     ReferenceRows::Materials {
//!         materials: vec![ReferenceMaterial::new("kbob-01", "Beton", 0.1, 0.8, 120.0).with_density(2300.0)],
//!         mappings: vec![MaterialMapping::new("Beton", "kbob-01")],
//!     },
//!     ReferenceRows::LifeExpectancy { entries: vec![] },
//!     ReferenceRows::Cost { entries: vec![] },
//! ];
//! for rows in reference {
//!     let kind = rows.kind();
//!     engine.load_reference_version(kind, "2024", rows).unwrap();
//!     engine.activate_version(kind, "2024").unwrap();
//! }
//!
//! let batch = ElementBatch::new("P-001", "2024")
//!     .with_element(Element::new("wall-1", "C2.1").with_layer(MaterialLayer::new("Beton", 3.684)));
//! let report = engine.process_batch(&batch).unwrap();
//! assert_eq!(report.processed_elements, 1);
//! ```
//!
//! ## Modules
//!
//! - [`engine`] - Batch processing, reference ingestion and export entry points
//! - [`elements`] - Inbound elements, geometry and material layers
//! - [`reference`] - Versioned reference tables and the active-version arena
//! - [`mapping`] - Source material name to reference key resolution
//! - [`calculations`] - LCA and cost processors
//! - [`aggregate`] - Grouping of records by element identifier
//! - [`pipeline`] - Parallel per-element calculation
//! - [`store`] - SQLite persistence
//! - [`export`] - Columnar analytics snapshots
//! - [`collaborators`] - Model extraction and completion signal interfaces
//! - [`config`] - Engine configuration
//! - [`retry`] - Bounded retry with backoff
//! - [`project`] - Project row and lifecycle
//! - [`units`] - Type-safe unit wrappers and rounding
//! - [`errors`] - Structured error types
//! - [`file_io`] - Atomic writes and file locking

pub mod aggregate;
pub mod calculations;
pub mod collaborators;
pub mod config;
pub mod elements;
pub mod engine;
pub mod errors;
pub mod export;
pub mod file_io;
pub mod mapping;
pub mod pipeline;
pub mod project;
pub mod reference;
pub mod retry;
pub mod store;
pub mod units;

// Re-export commonly used types at crate root for convenience
pub use config::{EngineConfig, ResultPolicy};
pub use elements::{Element, ElementBatch, MaterialLayer};
pub use engine::{BatchReport, Engine};
pub use errors::{EngineError, EngineResult};
pub use project::{Project, ProjectStatus};
pub use reference::{ReferenceKind, ReferenceRows};
