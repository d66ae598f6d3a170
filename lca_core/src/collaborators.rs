//! Interfaces to the systems around the engine.
//!
//! The engine never parses building models or talks to a message broker
//! itself. It calls a [`ModelExtractor`] for elements and a
//! [`CompletionPublisher`] for the completion signal. Both calls are bounded
//! by the configured collaborator timeout and retried with
//! [`crate::retry::with_retry`]; a transient failure should be reported as
//! [`crate::EngineError::Collaborator`] so it is retried.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::elements::Element;
use crate::errors::EngineResult;
use crate::project::ProjectStatus;
use crate::reference::PinnedVersions;

/// Turns a model reference into normalized elements.
pub trait ModelExtractor: Send + Sync {
    fn extract(&self, model_ref: &str, timeout: Duration) -> EngineResult<Vec<Element>>;
}

/// Emits the completion signal after a batch has committed.
pub trait CompletionPublisher: Send + Sync {
    fn publish(&self, notice: &CompletionNotice, timeout: Duration) -> EngineResult<()>;
}

/// Outbound completion message.
///
/// ## JSON Example
///
/// ```json
/// {
///   "status": "completed",
///   "project_id": "P-001",
///   "run_id": "4f1c...",
///   "message": "42 of 45 elements processed",
///   "versions": { "materials": "2024", "life_expectancy": "2024", "cost": "2024" },
///   "total_elements": 45,
///   "processed_elements": 42,
///   "failed_elements": 3
/// }
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompletionNotice {
    pub status: ProjectStatus,
    pub project_id: String,
    pub run_id: String,
    pub message: String,
    pub versions: PinnedVersions,
    pub total_elements: usize,
    pub processed_elements: usize,
    pub failed_elements: usize,
}

impl CompletionNotice {
    pub fn to_json(&self) -> EngineResult<String> {
        Ok(serde_json::to_string(self)?)
    }
}
