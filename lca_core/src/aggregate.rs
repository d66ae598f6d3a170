//! Groups result and error records by element identifier.
//!
//! Groups appear in first-appearance order of their identifier. When several
//! source elements share one identifier their records are concatenated into
//! a single group marked `shared_guid`. A group is `Failed` only when it has
//! no valid record at all.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::calculations::{CalculationResult, ProcessingError, ResultKind};

/// Per-element output of the pipeline, in source order.
#[derive(Debug, Clone, PartialEq)]
pub struct ElementOutcome {
    pub element_id: String,
    pub results: Vec<CalculationResult>,
    pub errors: Vec<ProcessingError>,
}

/// Overall state of an element group.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GroupState {
    /// Every record is valid
    Valid,
    /// Valid and failed records side by side
    Mixed,
    /// No valid record
    Failed,
}

/// All records of one element identifier.
#[derive(Debug, Clone, PartialEq)]
pub struct ElementGroup {
    pub element_id: String,
    /// Number of source elements folded into this group
    pub source_count: usize,
    /// LCA records, concatenated across source elements
    pub details: Vec<CalculationResult>,
    /// Cost records
    pub costs: Vec<CalculationResult>,
    pub errors: Vec<ProcessingError>,
    pub state: GroupState,
}

impl ElementGroup {
    /// More than one source element carried this identifier
    pub fn shared_guid(&self) -> bool {
        self.source_count > 1
    }

    /// Records of both kinds, LCA first
    pub fn results(&self) -> impl Iterator<Item = &CalculationResult> {
        self.details.iter().chain(self.costs.iter())
    }

    fn settle(&mut self) {
        let (valid, total) = self
            .results()
            .fold((0, 0), |(v, t), r| (v + usize::from(r.is_valid()), t + 1));
        self.state = if valid == 0 {
            GroupState::Failed
        } else if valid == total {
            GroupState::Valid
        } else {
            GroupState::Mixed
        };
    }
}

/// Aggregated output of one batch.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct AggregatedBatch {
    pub groups: Vec<ElementGroup>,
}

impl AggregatedBatch {
    /// Fold per-element outcomes into groups.
    pub fn from_outcomes(outcomes: Vec<ElementOutcome>) -> Self {
        let mut groups: Vec<ElementGroup> = Vec::new();
        let mut index: HashMap<String, usize> = HashMap::new();

        for outcome in outcomes {
            let i = *index.entry(outcome.element_id.clone()).or_insert_with(|| {
                groups.push(ElementGroup {
                    element_id: outcome.element_id.clone(),
                    source_count: 0,
                    details: Vec::new(),
                    costs: Vec::new(),
                    errors: Vec::new(),
                    state: GroupState::Failed,
                });
                groups.len() - 1
            });
            let group = &mut groups[i];
            group.source_count += 1;
            for result in outcome.results {
                match result.kind {
                    ResultKind::Lca => group.details.push(result),
                    ResultKind::Cost => group.costs.push(result),
                }
            }
            group.errors.extend(outcome.errors);
        }

        for group in &mut groups {
            group.settle();
        }
        AggregatedBatch { groups }
    }

    /// Every result record in group order
    pub fn results(&self) -> impl Iterator<Item = &CalculationResult> {
        self.groups.iter().flat_map(ElementGroup::results)
    }

    /// Every error record in group order
    pub fn errors(&self) -> impl Iterator<Item = &ProcessingError> {
        self.groups.iter().flat_map(|g| g.errors.iter())
    }

    pub fn result_count(&self) -> usize {
        self.groups.iter().map(|g| g.details.len() + g.costs.len()).sum()
    }

    pub fn error_count(&self) -> usize {
        self.groups.iter().map(|g| g.errors.len()).sum()
    }

    /// Groups with at least one valid record
    pub fn processed_count(&self) -> usize {
        self.groups.iter().filter(|g| g.state != GroupState::Failed).count()
    }

    pub fn failed_count(&self) -> usize {
        self.groups.iter().filter(|g| g.state == GroupState::Failed).count()
    }
}
