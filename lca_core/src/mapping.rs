//! Source material name → reference material key.
//!
//! Matching is exact after trimming and lowercasing. There is no fuzzy or
//! substring matching. A name mapped to more than one key within the same
//! version is ambiguous and resolves to nothing.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::reference::MaterialTable;

/// Why a name did not map.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "reason", rename_all = "snake_case")]
pub enum Unmapped {
    NotFound,
    Ambiguous { candidates: Vec<String> },
}

/// Resolution of one source name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MappingOutcome {
    Mapped(String),
    Unmapped(Unmapped),
}

impl MappingOutcome {
    pub fn key(&self) -> Option<&str> {
        match self {
            MappingOutcome::Mapped(key) => Some(key),
            MappingOutcome::Unmapped(_) => None,
        }
    }
}

/// Lookup index over the mappings of one materials version.
#[derive(Debug, Clone, Default)]
pub struct MaterialMappingResolver {
    // normalized name -> distinct keys in load order
    index: HashMap<String, Vec<String>>,
}

impl MaterialMappingResolver {
    pub fn new(table: &MaterialTable) -> Self {
        let mut index: HashMap<String, Vec<String>> = HashMap::new();
        for mapping in table.mappings() {
            let keys = index.entry(normalize(&mapping.source_name)).or_default();
            if !keys.contains(&mapping.material_key) {
                keys.push(mapping.material_key.clone());
            }
        }
        MaterialMappingResolver { index }
    }

    pub fn resolve(&self, source_name: &str) -> MappingOutcome {
        match self.index.get(&normalize(source_name)).map(Vec::as_slice) {
            Some([key]) => MappingOutcome::Mapped(key.clone()),
            Some(keys) if keys.len() > 1 => MappingOutcome::Unmapped(Unmapped::Ambiguous {
                candidates: keys.to_vec(),
            }),
            _ => MappingOutcome::Unmapped(Unmapped::NotFound),
        }
    }
}

fn normalize(name: &str) -> String {
    name.trim().to_lowercase()
}
