//! In-memory arena of loaded reference versions.
//!
//! Versions are stored as `Arc` snapshots keyed by (kind, version) with one
//! active pointer per kind. A [`ReferencePin`] clones the `Arc`s it needs,
//! so loading or activating a version never affects a batch already running.

use std::collections::HashMap;
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use super::{CostTable, LifeExpectancyTable, MaterialTable, ReferenceKind, ReferenceTable};
use crate::errors::{EngineError, EngineResult};

/// Version actually used per kind for one batch.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PinnedVersions {
    pub materials: String,
    pub life_expectancy: String,
    pub cost: String,
}

impl PinnedVersions {
    /// Version for `kind`
    pub fn get(&self, kind: ReferenceKind) -> &str {
        match kind {
            ReferenceKind::Materials => &self.materials,
            ReferenceKind::LifeExpectancy => &self.life_expectancy,
            ReferenceKind::Cost => &self.cost,
        }
    }
}

/// Immutable reference snapshot pinned for the duration of one batch.
#[derive(Debug, Clone)]
pub struct ReferencePin {
    requested: String,
    pub materials: Arc<MaterialTable>,
    pub life_expectancy: Arc<LifeExpectancyTable>,
    pub cost: Arc<CostTable>,
}

impl ReferencePin {
    /// Version named by the batch
    pub fn requested(&self) -> &str {
        &self.requested
    }

    /// Resolved version per kind
    pub fn versions(&self) -> PinnedVersions {
        PinnedVersions {
            materials: self.materials.version().to_string(),
            life_expectancy: self.life_expectancy.version().to_string(),
            cost: self.cost.version().to_string(),
        }
    }
}

#[derive(Debug, Default)]
struct Arena {
    materials: HashMap<String, Arc<MaterialTable>>,
    life_expectancy: HashMap<String, Arc<LifeExpectancyTable>>,
    cost: HashMap<String, Arc<CostTable>>,
    active: HashMap<ReferenceKind, String>,
}

impl Arena {
    fn contains(&self, kind: ReferenceKind, version: &str) -> bool {
        match kind {
            ReferenceKind::Materials => self.materials.contains_key(version),
            ReferenceKind::LifeExpectancy => self.life_expectancy.contains_key(version),
            ReferenceKind::Cost => self.cost.contains_key(version),
        }
    }

    // Requested version if this kind has it, else the kind's active version
    fn resolve(&self, kind: ReferenceKind, requested: &str) -> EngineResult<String> {
        if self.contains(kind, requested) {
            return Ok(requested.to_string());
        }
        self.active
            .get(&kind)
            .cloned()
            .ok_or_else(|| EngineError::NoActiveVersion {
                kind: kind.as_str().to_string(),
            })
    }
}

/// Thread-safe registry of reference versions.
#[derive(Debug, Default)]
pub struct ReferenceStore {
    inner: RwLock<Arena>,
}

impl ReferenceStore {
    pub fn new() -> Self {
        ReferenceStore::default()
    }

    fn read(&self) -> EngineResult<RwLockReadGuard<'_, Arena>> {
        self.inner.read().map_err(|_| EngineError::Internal {
            message: "reference store lock poisoned".to_string(),
        })
    }

    fn write(&self) -> EngineResult<RwLockWriteGuard<'_, Arena>> {
        self.inner.write().map_err(|_| EngineError::Internal {
            message: "reference store lock poisoned".to_string(),
        })
    }

    /// Register a validated table. Existing (kind, version) pairs are immutable.
    pub fn insert(&self, table: ReferenceTable) -> EngineResult<()> {
        let kind = table.kind();
        let version = table.version().to_string();
        let mut arena = self.write()?;
        if arena.contains(kind, &version) {
            return Err(EngineError::version_exists(kind.as_str(), version));
        }
        match table {
            ReferenceTable::Materials(t) => {
                arena.materials.insert(version.clone(), t);
            }
            ReferenceTable::LifeExpectancy(t) => {
                arena.life_expectancy.insert(version.clone(), t);
            }
            ReferenceTable::Cost(t) => {
                arena.cost.insert(version.clone(), t);
            }
        }
        debug!(kind = %kind, version = %version, "reference version registered");
        Ok(())
    }

    /// Point `kind` at an already loaded version.
    pub fn activate(&self, kind: ReferenceKind, version: &str) -> EngineResult<()> {
        self.activate_with(kind, version, || Ok(()))
    }

    /// Like [`ReferenceStore::activate`], running `persist` under the write
    /// lock first. The pointer only moves if `persist` succeeds, so
    /// concurrent activations persist and swap in the same order.
    pub fn activate_with<F>(&self, kind: ReferenceKind, version: &str, persist: F) -> EngineResult<()>
    where
        F: FnOnce() -> EngineResult<()>,
    {
        let mut arena = self.write()?;
        if !arena.contains(kind, version) {
            return Err(EngineError::version_not_found(kind.as_str(), version));
        }
        persist()?;
        let previous = arena.active.insert(kind, version.to_string());
        info!(kind = %kind, version, previous = previous.as_deref().unwrap_or("none"), "reference version activated");
        Ok(())
    }

    /// Active version of `kind`
    pub fn active_version(&self, kind: ReferenceKind) -> EngineResult<Option<String>> {
        Ok(self.read()?.active.get(&kind).cloned())
    }

    pub fn contains(&self, kind: ReferenceKind, version: &str) -> EngineResult<bool> {
        Ok(self.read()?.contains(kind, version))
    }

    /// Loaded versions of `kind`, sorted
    pub fn versions(&self, kind: ReferenceKind) -> EngineResult<Vec<String>> {
        let arena = self.read()?;
        let mut versions: Vec<String> = match kind {
            ReferenceKind::Materials => arena.materials.keys().cloned().collect(),
            ReferenceKind::LifeExpectancy => arena.life_expectancy.keys().cloned().collect(),
            ReferenceKind::Cost => arena.cost.keys().cloned().collect(),
        };
        versions.sort();
        Ok(versions)
    }

    /// Pin a snapshot for `requested`.
    ///
    /// Each kind uses `requested` when loaded, otherwise its active version.
    /// Fails with `VersionNotFound` when no kind knows `requested`.
    pub fn pin(&self, requested: &str) -> EngineResult<ReferencePin> {
        let requested = requested.trim();
        let arena = self.read()?;

        if !ReferenceKind::ALL.iter().any(|kind| arena.contains(*kind, requested)) {
            return Err(EngineError::version_not_found("reference", requested));
        }

        let missing = |kind: ReferenceKind, version: &str| EngineError::Internal {
            message: format!("active {} version '{}' is not loaded", kind, version),
        };

        let version = arena.resolve(ReferenceKind::Materials, requested)?;
        let materials = arena
            .materials
            .get(&version)
            .cloned()
            .ok_or_else(|| missing(ReferenceKind::Materials, &version))?;

        let version = arena.resolve(ReferenceKind::LifeExpectancy, requested)?;
        let life_expectancy = arena
            .life_expectancy
            .get(&version)
            .cloned()
            .ok_or_else(|| missing(ReferenceKind::LifeExpectancy, &version))?;

        let version = arena.resolve(ReferenceKind::Cost, requested)?;
        let cost = arena
            .cost
            .get(&version)
            .cloned()
            .ok_or_else(|| missing(ReferenceKind::Cost, &version))?;

        Ok(ReferencePin {
            requested: requested.to_string(),
            materials,
            life_expectancy,
            cost,
        })
    }
}
