//! # Engine
//!
//! Entry point tying reference data, calculation and persistence together.
//!
//! One [`Engine`] owns the SQLite [`Store`] and the in-memory
//! [`ReferenceStore`]. It is `Sync`: batches for different projects may be
//! processed from several threads at once, each pinning its own reference
//! snapshot and committing in its own transaction.
//!
//! ## Batch flow
//!
//! 1. shape validation (rejects before anything is written)
//! 2. pin reference versions
//! 3. project row to `processing`
//! 4. per-element LCA and cost calculation on the worker pool
//! 5. aggregation by element identifier
//! 6. single-transaction commit
//!
//! A failure after step 1 rolls back the commit and is recorded as a failed
//! history row; the caller receives the error.

use std::time::{Duration, Instant};

use chrono::Utc;
use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::aggregate::{AggregatedBatch, GroupState};
use crate::calculations::{CalculationResult, CostProcessor, LcaProcessor, ProcessingError};
use crate::collaborators::{CompletionNotice, CompletionPublisher, ModelExtractor};
use crate::config::EngineConfig;
use crate::elements::ElementBatch;
use crate::errors::{EngineError, EngineResult};
use crate::export::{self, ExportReport, ExportSink, FsExportSink};
use crate::pipeline::Pipeline;
use crate::project::{Project, ProjectStatus};
use crate::reference::{PinnedVersions, ReferenceKind, ReferenceRows, ReferenceStore};
use crate::retry::with_retry;
use crate::store::{CommitBatch, MaterialAssignment, ProcessingHistory, Store};

/// Terminal disposition of one element identifier.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ElementDisposition {
    pub element_id: String,
    pub state: GroupState,
    pub shared_guid: bool,
    pub valid_records: usize,
    pub failed_records: usize,
}

/// Outcome of a committed batch.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BatchReport {
    pub run_id: String,
    pub project_id: String,
    /// Project status after the commit
    pub status: ProjectStatus,
    pub versions: PinnedVersions,
    pub total_elements: usize,
    pub processed_elements: usize,
    pub failed_elements: usize,
    pub result_count: usize,
    pub error_count: usize,
    /// Prior rows removed under the replace policy
    pub results_replaced: usize,
    pub duration_secs: f64,
    pub elements: Vec<ElementDisposition>,
}

impl BatchReport {
    /// Completion message for the transport collaborator
    pub fn notice(&self) -> CompletionNotice {
        CompletionNotice {
            status: self.status,
            project_id: self.project_id.clone(),
            run_id: self.run_id.clone(),
            message: format!("{} of {} elements processed", self.processed_elements, self.total_elements),
            versions: self.versions.clone(),
            total_elements: self.total_elements,
            processed_elements: self.processed_elements,
            failed_elements: self.failed_elements,
        }
    }
}

/// LCA and cost processing engine.
#[derive(Debug)]
pub struct Engine {
    config: EngineConfig,
    store: Store,
    references: ReferenceStore,
}

impl Engine {
    /// Open the database named by `config` and load its reference versions.
    pub fn open(config: EngineConfig) -> EngineResult<Self> {
        config.validate()?;
        let store = Store::open(&config.database_path, Duration::from_millis(config.busy_timeout_ms))?;
        Engine::with_store(config, store)
    }

    /// Engine over an already opened store.
    pub fn with_store(config: EngineConfig, store: Store) -> EngineResult<Self> {
        config.validate()?;
        let references = ReferenceStore::new();
        let mut loaded = 0;
        for table in store.load_reference_tables()? {
            references.insert(table)?;
            loaded += 1;
        }
        for (kind, version) in store.active_versions()? {
            references.activate(kind, &version)?;
        }
        info!(versions = loaded, workers = config.worker_threads, "engine ready");
        Ok(Engine {
            config,
            store,
            references,
        })
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Durable store, for queries
    pub fn store(&self) -> &Store {
        &self.store
    }

    pub fn references(&self) -> &ReferenceStore {
        &self.references
    }

    // ------------------------------------------------------------------------
    // Reference data
    // ------------------------------------------------------------------------

    /// Validate and store a new reference version of `kind`.
    ///
    /// The version is not active until [`Engine::activate_version`] points
    /// at it. Existing versions are never overwritten.
    pub fn load_reference_version(&self, kind: ReferenceKind, version: &str, rows: ReferenceRows) -> EngineResult<()> {
        if rows.kind() != kind {
            return Err(EngineError::invalid_input(
                "kind",
                kind.as_str(),
                format!("rows are {} data", rows.kind()),
            ));
        }
        let table = rows.into_table(version)?;
        if self.references.contains(kind, table.version())? {
            return Err(EngineError::version_exists(kind.as_str(), table.version()));
        }
        self.store.insert_reference_version(&table)?;
        self.references.insert(table)?;
        Ok(())
    }

    /// Point `kind` at a loaded version. Batches already pinned are unaffected.
    pub fn activate_version(&self, kind: ReferenceKind, version: &str) -> EngineResult<()> {
        // The database pointer is written under the arena lock, so the two
        // pointers never disagree.
        self.references
            .activate_with(kind, version, || self.store.activate_version(kind, version))
    }

    /// Active version of `kind`
    pub fn get_active_version(&self, kind: ReferenceKind) -> EngineResult<String> {
        self.references
            .active_version(kind)?
            .ok_or_else(|| EngineError::NoActiveVersion {
                kind: kind.as_str().to_string(),
            })
    }

    // ------------------------------------------------------------------------
    // Processing
    // ------------------------------------------------------------------------

    /// Calculate and commit one batch.
    pub fn process_batch(&self, batch: &ElementBatch) -> EngineResult<BatchReport> {
        batch.validate()?;
        let started = Instant::now();
        let run_id = Uuid::new_v4().to_string();
        let project = self.project_for(batch);
        info!(
            project = %batch.project_id,
            run = %run_id,
            version = %batch.reference_version,
            elements = batch.elements.len(),
            "batch started"
        );

        let pin = match self.references.pin(&batch.reference_version) {
            Ok(pin) => pin,
            Err(e) => return Err(self.abort(&project, &run_id, None, batch.elements.len(), started, e)),
        };
        let versions = pin.versions();

        let run = || -> EngineResult<BatchReport> {
            let stored = self.store.begin_run(&project)?;
            let lca = LcaProcessor::new(&pin, stored.default_life_expectancy_years, stored.floor_area());
            let cost = CostProcessor::new(&pin);
            let pipeline = Pipeline::new(self.config.worker_threads)
                .with_processor(&lca)
                .with_processor(&cost);

            let at = Utc::now();
            let aggregated = AggregatedBatch::from_outcomes(pipeline.run(batch, at)?);
            let results: Vec<CalculationResult> = aggregated.results().cloned().collect();
            let errors: Vec<ProcessingError> = aggregated.errors().cloned().collect();
            let assignments = MaterialAssignment::merged(&batch.elements);

            let history = ProcessingHistory {
                run_id: run_id.clone(),
                project_id: batch.project_id.clone(),
                requested_version: batch.reference_version.clone(),
                versions: Some(versions.clone()),
                total_elements: batch.elements.len(),
                processed_elements: aggregated.processed_count(),
                failed_elements: aggregated.failed_count(),
                result_count: results.len(),
                error_count: errors.len(),
                duration_secs: started.elapsed().as_secs_f64(),
                status: ProjectStatus::Completed,
                policy: self.config.result_policy,
                detail: None,
                created_at: at,
            };

            let summary = self.store.commit(&CommitBatch {
                project: &project,
                elements: &batch.elements,
                assignments: &assignments,
                results: &results,
                errors: &errors,
                history: &history,
            })?;

            Ok(BatchReport {
                run_id: run_id.clone(),
                project_id: batch.project_id.clone(),
                status: summary.project_status,
                versions: versions.clone(),
                total_elements: history.total_elements,
                processed_elements: history.processed_elements,
                failed_elements: history.failed_elements,
                result_count: summary.results_written,
                error_count: summary.errors_written,
                results_replaced: summary.results_replaced,
                duration_secs: history.duration_secs,
                elements: aggregated
                    .groups
                    .iter()
                    .map(|g| {
                        let valid = g.results().filter(|r| r.is_valid()).count();
                        ElementDisposition {
                            element_id: g.element_id.clone(),
                            state: g.state,
                            shared_guid: g.shared_guid(),
                            valid_records: valid,
                            failed_records: g.details.len() + g.costs.len() - valid,
                        }
                    })
                    .collect(),
            })
        };

        match run() {
            Ok(report) => {
                info!(
                    project = %report.project_id,
                    run = %report.run_id,
                    processed = report.processed_elements,
                    failed = report.failed_elements,
                    results = report.result_count,
                    errors = report.error_count,
                    "batch completed"
                );
                Ok(report)
            }
            Err(e) => Err(self.abort(&project, &run_id, Some(versions), batch.elements.len(), started, e)),
        }
    }

    /// Extract elements from a building model, then process them as a batch.
    ///
    /// Extraction is retried per the configured policy; exhausting it fails
    /// the run without writing any result.
    pub fn process_model(
        &self,
        extractor: &dyn ModelExtractor,
        model_ref: &str,
        project_id: &str,
        reference_version: &str,
    ) -> EngineResult<BatchReport> {
        let mut batch = ElementBatch::new(project_id, reference_version);
        batch.validate()?;

        let started = Instant::now();
        let timeout = self.config.collaborator_timeout();
        let extracted = with_retry(&self.config.retry, "model extraction", |attempt| {
            debug!(model = model_ref, attempt, "extracting elements");
            extractor.extract(model_ref, timeout)
        });

        match extracted {
            Ok(elements) => {
                info!(model = model_ref, elements = elements.len(), "model extracted");
                batch.elements = elements;
                self.process_batch(&batch)
            }
            Err(e) => {
                let project = self.project_for(&batch);
                let run_id = Uuid::new_v4().to_string();
                Err(self.abort(&project, &run_id, None, 0, started, e))
            }
        }
    }

    /// Process a batch, then publish the completion notice.
    ///
    /// The notice goes out only after a successful commit. If publishing
    /// fails after retries the committed rows stay and the error is returned.
    pub fn process_and_notify(
        &self,
        batch: &ElementBatch,
        publisher: &dyn CompletionPublisher,
    ) -> EngineResult<BatchReport> {
        let report = self.process_batch(batch)?;
        let notice = report.notice();
        let timeout = self.config.collaborator_timeout();

        if let Err(e) = with_retry(&self.config.retry, "completion notice", |_| publisher.publish(&notice, timeout)) {
            error!(project = %report.project_id, run = %report.run_id, error = %e, "completion notice not delivered");
            return Err(e);
        }
        debug!(project = %report.project_id, run = %report.run_id, "completion notice published");
        Ok(report)
    }

    // ------------------------------------------------------------------------
    // Export
    // ------------------------------------------------------------------------

    /// Filesystem sink configured by `export` settings
    pub fn fs_export_sink(&self) -> FsExportSink {
        FsExportSink::new(&self.config.export)
    }

    /// Export committed results of `project_id`. A locked partition is retried.
    pub fn export_project(&self, sink: &dyn ExportSink, project_id: &str) -> EngineResult<ExportReport> {
        let generated_at = Utc::now();
        with_retry(&self.config.retry, "export", |_| {
            export::export_project(&self.store, sink, project_id, generated_at)
        })
    }

    // ------------------------------------------------------------------------
    // Helpers
    // ------------------------------------------------------------------------

    fn project_for(&self, batch: &ElementBatch) -> Project {
        let project = Project::new(
            &batch.project_id,
            batch.display_name(),
            &batch.reference_version,
            self.config.default_life_expectancy_years,
        );
        match batch.reference_floor_area_m2 {
            Some(area) => project.with_floor_area(area),
            None => project,
        }
    }

    // Record a failed run and hand the error back to the caller.
    fn abort(
        &self,
        project: &Project,
        run_id: &str,
        versions: Option<PinnedVersions>,
        total_elements: usize,
        started: Instant,
        cause: EngineError,
    ) -> EngineError {
        error!(project = %project.project_id, run = run_id, error = %cause, "batch aborted");
        let history = ProcessingHistory {
            run_id: run_id.to_string(),
            project_id: project.project_id.clone(),
            requested_version: project.reference_version.clone(),
            versions,
            total_elements,
            processed_elements: 0,
            failed_elements: total_elements,
            result_count: 0,
            error_count: 0,
            duration_secs: started.elapsed().as_secs_f64(),
            status: ProjectStatus::Failed,
            policy: self.config.result_policy,
            detail: Some(cause.to_string()),
            created_at: Utc::now(),
        };
        if let Err(e) = self.store.record_failure(project, &history) {
            warn!(project = %project.project_id, run = run_id, error = %e, "could not record failed run");
        }
        cause
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::elements::{Element, Geometry, MaterialLayer};
    use crate::reference::{CostReferenceEntry, LifeExpectancyEntry, MaterialMapping, ReferenceMaterial, UnitType};
    use crate::retry::RetryPolicy;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Mutex;

    fn engine() -> Engine {
        let config = EngineConfig {
            retry: RetryPolicy::immediate(3),
            worker_threads: 2,
            ..EngineConfig::default()
        };
        Engine::with_store(config, Store::open_in_memory().unwrap()).unwrap()
    }

    fn seeded() -> Engine {
        let engine = engine();
        engine
            .load_reference_version(
                ReferenceKind::Materials,
                "2024",
                ReferenceRows::Materials {
                    materials: vec![ReferenceMaterial::new("k1", "Beton", 0.1, 0.3, 150.0).with_density(2300.0)],
                    mappings: vec![MaterialMapping::new("Beton", "k1")],
                },
            )
            .unwrap();
        engine
            .load_reference_version(
                ReferenceKind::LifeExpectancy,
                "2024",
                ReferenceRows::LifeExpectancy {
                    entries: vec![LifeExpectancyEntry::new("C2", 50)],
                },
            )
            .unwrap();
        engine
            .load_reference_version(
                ReferenceKind::Cost,
                "2024",
                ReferenceRows::Cost {
                    entries: vec![CostReferenceEntry::new("C2.1", UnitType::Area, 100.0)],
                },
            )
            .unwrap();
        for kind in ReferenceKind::ALL {
            engine.activate_version(kind, "2024").unwrap();
        }
        engine
    }

    fn wall(id: &str, material: &str) -> Element {
        Element::new(id, "C2.1")
            .with_geometry(Geometry {
                area_net: Some(10.0),
                ..Geometry::default()
            })
            .with_layer(MaterialLayer::new(material, 3.684))
    }

    fn batch() -> ElementBatch {
        ElementBatch::new("P-1", "2024")
            .with_element(wall("w1", "Beton"))
            .with_element(wall("w2", "Stahl"))
    }

    #[test]
    fn test_rows_must_match_kind() {
        let engine = engine();
        let err = engine
            .load_reference_version(
                ReferenceKind::Cost,
                "2024",
                ReferenceRows::LifeExpectancy { entries: vec![] },
            )
            .unwrap_err();
        assert_eq!(err.error_code(), "INVALID_INPUT");
    }

    #[test]
    fn test_active_version_lifecycle() {
        let engine = engine();
        let err = engine.get_active_version(ReferenceKind::Cost).unwrap_err();
        assert_eq!(err.error_code(), "NO_ACTIVE_VERSION");

        let err = engine.activate_version(ReferenceKind::Cost, "2024").unwrap_err();
        assert_eq!(err.error_code(), "VERSION_NOT_FOUND");

        let engine = seeded();
        assert_eq!(engine.get_active_version(ReferenceKind::Cost).unwrap(), "2024");

        let err = engine
            .load_reference_version(
                ReferenceKind::Cost,
                "2024",
                ReferenceRows::Cost { entries: vec![] },
            )
            .unwrap_err();
        assert_eq!(err.error_code(), "VERSION_EXISTS");
    }

    #[test]
    fn test_process_batch_partial_failure() {
        let engine = seeded();
        let report = engine.process_batch(&batch()).unwrap();

        assert_eq!(report.status, ProjectStatus::Completed);
        assert_eq!(report.total_elements, 2);
        assert_eq!(report.processed_elements, 2);
        assert_eq!(report.result_count, 4);
        assert_eq!(report.error_count, 1);
        assert_eq!(report.elements[0].state, GroupState::Valid);
        assert_eq!(report.elements[1].state, GroupState::Mixed);

        let stored = engine.store().results_for_project("P-1").unwrap();
        let lca = stored[0].result.lca().unwrap();
        assert!((lca.gwp_absolute - 847.32).abs() < 1e-9);
        assert!((lca.gwp_per_year - 16.946).abs() < 1e-9);
        assert_eq!(lca.life_span_years, 50);
        let cost = stored[1].result.cost().unwrap();
        assert!((cost.total_cost - 1000.0).abs() < 1e-9);
    }

    #[test]
    fn test_unknown_version_aborts_and_records() {
        let engine = seeded();
        let err = engine
            .process_batch(&ElementBatch::new("P-2", "1999").with_element(wall("w1", "Beton")))
            .unwrap_err();
        assert_eq!(err.error_code(), "VERSION_NOT_FOUND");

        let info = engine.store().project_info("P-2").unwrap().unwrap();
        assert_eq!(info.project.status, ProjectStatus::Failed);
        assert_eq!(info.result_count, 0);
        let run = info.latest_run.unwrap();
        assert_eq!(run.status, ProjectStatus::Failed);
        assert_eq!(run.failed_elements, 1);
        assert!(run.versions.is_none());
        assert!(run.detail.unwrap().contains("1999"));
    }

    #[test]
    fn test_invalid_shape_writes_nothing() {
        let engine = seeded();
        let err = engine.process_batch(&ElementBatch::new(" ", "2024")).unwrap_err();
        assert_eq!(err.error_code(), "MISSING_FIELD");
        assert!(engine.store().project(" ").unwrap().is_none());
    }

    struct FlakyExtractor {
        calls: AtomicU32,
        fail_first: u32,
    }

    impl ModelExtractor for FlakyExtractor {
        fn extract(&self, model_ref: &str, _timeout: Duration) -> EngineResult<Vec<Element>> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
            if call <= self.fail_first {
                return Err(EngineError::collaborator("extractor", format!("{} unavailable", model_ref)));
            }
            Ok(vec![wall("w1", "Beton")])
        }
    }

    #[test]
    fn test_process_model_retries_extraction() {
        let engine = seeded();
        let extractor = FlakyExtractor {
            calls: AtomicU32::new(0),
            fail_first: 2,
        };
        let report = engine.process_model(&extractor, "model.ifc", "P-3", "2024").unwrap();
        assert_eq!(extractor.calls.load(Ordering::SeqCst), 3);
        assert_eq!(report.total_elements, 1);
        assert_eq!(report.status, ProjectStatus::Completed);
    }

    #[test]
    fn test_process_model_exhaustion_fails_run() {
        let engine = seeded();
        let extractor = FlakyExtractor {
            calls: AtomicU32::new(0),
            fail_first: u32::MAX,
        };
        let err = engine.process_model(&extractor, "model.ifc", "P-4", "2024").unwrap_err();
        assert_eq!(err.error_code(), "RETRIES_EXHAUSTED");
        assert_eq!(extractor.calls.load(Ordering::SeqCst), 3);

        let info = engine.store().project_info("P-4").unwrap().unwrap();
        assert_eq!(info.project.status, ProjectStatus::Failed);
        assert_eq!(info.result_count, 0);
    }

    #[derive(Default)]
    struct RecordingPublisher {
        notices: Mutex<Vec<CompletionNotice>>,
    }

    impl CompletionPublisher for RecordingPublisher {
        fn publish(&self, notice: &CompletionNotice, _timeout: Duration) -> EngineResult<()> {
            self.notices.lock().unwrap().push(notice.clone());
            Ok(())
        }
    }

    #[test]
    fn test_notice_published_after_commit() {
        let engine = seeded();
        let publisher = RecordingPublisher::default();
        let report = engine.process_and_notify(&batch(), &publisher).unwrap();

        let notices = publisher.notices.lock().unwrap();
        assert_eq!(notices.len(), 1);
        assert_eq!(notices[0].run_id, report.run_id);
        assert_eq!(notices[0].status, ProjectStatus::Completed);
        assert_eq!(notices[0].processed_elements, 2);
        assert_eq!(notices[0].message, "2 of 2 elements processed");
    }

    #[test]
    fn test_no_notice_for_aborted_batch() {
        let engine = seeded();
        let publisher = RecordingPublisher::default();
        let result = engine.process_and_notify(&ElementBatch::new("P-5", "1999"), &publisher);
        assert!(result.is_err());
        assert!(publisher.notices.lock().unwrap().is_empty());
    }

    #[test]
    fn test_concurrent_activations_keep_pointers_in_sync() {
        let engine = seeded();
        let versions = ["2025", "2026", "2027"];
        for version in versions {
            engine
                .load_reference_version(
                    ReferenceKind::Cost,
                    version,
                    ReferenceRows::Cost {
                        entries: vec![CostReferenceEntry::new("C2.1", UnitType::Area, 100.0)],
                    },
                )
                .unwrap();
        }

        std::thread::scope(|s| {
            for i in 0..8 {
                let engine = &engine;
                s.spawn(move || {
                    for round in 0..25 {
                        let version = versions[(i + round) % versions.len()];
                        engine.activate_version(ReferenceKind::Cost, version).unwrap();
                    }
                });
            }
        });

        let in_memory = engine.get_active_version(ReferenceKind::Cost).unwrap();
        let persisted = engine
            .store()
            .active_versions()
            .unwrap()
            .into_iter()
            .find(|(kind, _)| *kind == ReferenceKind::Cost)
            .map(|(_, version)| version);
        assert_eq!(persisted.as_deref(), Some(in_memory.as_str()));
    }
}
