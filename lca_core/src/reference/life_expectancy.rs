//! Life-expectancy lookup by classification code.
//!
//! Resolution order for an element code:
//!
//! 1. exact match (trimmed, case-insensitive)
//! 2. the longest entry code that is a whole-segment prefix of the element code
//! 3. the project default
//!
//! A prefix only counts when it ends on a segment boundary: `C2` covers `C2.10`
//! and `C` covers `C2`, but `C2.1` does not cover `C2.10`.
//!
//! Entry codes are unique within one version (compared trimmed, case-insensitive).

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::errors::{EngineError, EngineResult};

/// Amortization period of a classification code.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LifeExpectancyEntry {
    /// Classification code (eBKP-H)
    pub code: String,
    /// Description
    #[serde(default)]
    pub description: String,
    /// Amortization period (years)
    pub years: u32,
    /// Whether the source marks the entry as relevant for model-based takeoff
    #[serde(default)]
    pub model_based: bool,
}

impl LifeExpectancyEntry {
    pub fn new(code: impl Into<String>, years: u32) -> Self {
        LifeExpectancyEntry {
            code: code.into(),
            description: String::new(),
            years,
            model_based: false,
        }
    }
}

/// Resolved life span of one element.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LifeSpan {
    /// Years used to annualize
    pub years: u32,
    /// Entry code that matched; `None` when the default was used
    pub matched_code: Option<String>,
}

impl LifeSpan {
    pub fn is_default(&self) -> bool {
        self.matched_code.is_none()
    }
}

/// One version of the life-expectancy dataset.
#[derive(Debug, Clone, PartialEq)]
pub struct LifeExpectancyTable {
    version: String,
    entries: Vec<LifeExpectancyEntry>,
    // normalized code -> entry index
    index: HashMap<String, usize>,
}

impl LifeExpectancyTable {
    /// Validate and build a life-expectancy version.
    pub fn new(version: impl Into<String>, entries: Vec<LifeExpectancyEntry>) -> EngineResult<Self> {
        let version = version.into().trim().to_string();
        if version.is_empty() {
            return Err(EngineError::invalid_reference("life_expectancy", version, "version tag must not be empty"));
        }

        let mut index = HashMap::new();
        let mut kept = Vec::with_capacity(entries.len());
        for mut entry in entries {
            entry.code = entry.code.trim().to_string();
            if entry.code.is_empty() {
                return Err(EngineError::invalid_reference("life_expectancy", &version, "entry with an empty code"));
            }
            if entry.years == 0 {
                return Err(EngineError::invalid_reference(
                    "life_expectancy",
                    &version,
                    format!("code '{}' has a zero life span", entry.code),
                ));
            }
            if index.insert(normalize(&entry.code), kept.len()).is_some() {
                return Err(EngineError::invalid_reference(
                    "life_expectancy",
                    &version,
                    format!("duplicate code '{}'", entry.code),
                ));
            }
            kept.push(entry);
        }

        Ok(LifeExpectancyTable {
            version,
            entries: kept,
            index,
        })
    }

    pub fn version(&self) -> &str {
        &self.version
    }

    /// Entries in load order
    pub fn entries(&self) -> &[LifeExpectancyEntry] {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Matching entry for `code`: exact first, then longest segment prefix.
    pub fn find(&self, code: &str) -> Option<&LifeExpectancyEntry> {
        let code = normalize(code);
        if code.is_empty() {
            return None;
        }
        if let Some(&i) = self.index.get(&code) {
            return Some(&self.entries[i]);
        }
        self.index
            .iter()
            .filter(|(entry_code, _)| is_segment_prefix(entry_code, &code))
            .max_by_key(|(entry_code, _)| entry_code.len())
            .map(|(_, &i)| &self.entries[i])
    }

    /// Life span for `code`, falling back to `default_years`.
    ///
    /// Falling back logs a warning; it is never an error.
    pub fn resolve(&self, code: Option<&str>, default_years: u32) -> LifeSpan {
        match code.and_then(|c| self.find(c)) {
            Some(entry) => LifeSpan {
                years: entry.years,
                matched_code: Some(entry.code.clone()),
            },
            None => {
                warn!(
                    code = code.unwrap_or(""),
                    version = %self.version,
                    default_years,
                    "no life expectancy entry, using default"
                );
                LifeSpan {
                    years: default_years,
                    matched_code: None,
                }
            }
        }
    }
}

fn normalize(code: &str) -> String {
    code.trim().to_uppercase()
}

// `prefix` covers `code` when the next char of `code` starts a new segment:
// a `.` separator, or a digit right after a letter (`C` -> `C2`).
fn is_segment_prefix(prefix: &str, code: &str) -> bool {
    let Some(rest) = code.strip_prefix(prefix) else {
        return false;
    };
    let Some(next) = rest.chars().next() else {
        return true;
    };
    if next == '.' {
        return true;
    }
    let last = prefix.chars().last();
    next.is_ascii_digit() && last.is_some_and(|c| c.is_alphabetic())
}
