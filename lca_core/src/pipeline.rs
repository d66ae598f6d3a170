//! Per-element calculation across worker threads.
//!
//! Elements are independent, so the batch is split into contiguous chunks
//! computed on scoped threads. Chunks are joined in order, which keeps the
//! output in source order regardless of scheduling.

use std::thread;

use chrono::{DateTime, Utc};
use tracing::{debug, info_span};

use crate::aggregate::ElementOutcome;
use crate::calculations::{ProcessingError, Processor};
use crate::elements::{Element, ElementBatch};
use crate::errors::{EngineError, EngineResult};

/// Ordered set of processors applied to every element.
pub struct Pipeline<'a> {
    processors: Vec<&'a dyn Processor>,
    workers: usize,
}

impl<'a> Pipeline<'a> {
    pub fn new(workers: usize) -> Self {
        Pipeline {
            processors: Vec::new(),
            workers: workers.max(1),
        }
    }

    /// Builder-style processor
    pub fn with_processor(mut self, processor: &'a dyn Processor) -> Self {
        self.processors.push(processor);
        self
    }

    /// Validate `batch` against every processor.
    pub fn validate(&self, batch: &ElementBatch) -> EngineResult<()> {
        for processor in &self.processors {
            processor.validate(batch)?;
        }
        Ok(())
    }

    /// Compute every element. `at` stamps the error records of this run.
    pub fn run(&self, batch: &ElementBatch, at: DateTime<Utc>) -> EngineResult<Vec<ElementOutcome>> {
        self.validate(batch)?;
        let span = info_span!("pipeline", project = %batch.project_id, elements = batch.elements.len());
        let _guard = span.enter();

        if batch.elements.is_empty() {
            return Ok(Vec::new());
        }

        let project_id = batch.project_id.as_str();
        let chunk_size = batch.elements.len().div_ceil(self.workers);

        thread::scope(|scope| {
            let handles: Vec<_> = batch
                .elements
                .chunks(chunk_size)
                .map(|chunk| scope.spawn(move || self.compute_chunk(project_id, chunk, at)))
                .collect();

            let mut outcomes = Vec::with_capacity(batch.elements.len());
            for handle in handles {
                let chunk = handle.join().map_err(|_| EngineError::Internal {
                    message: "calculation worker panicked".to_string(),
                })?;
                outcomes.extend(chunk);
            }
            debug!(outcomes = outcomes.len(), chunk_size, "pipeline finished");
            Ok(outcomes)
        })
    }

    fn compute_chunk(&self, project_id: &str, chunk: &[Element], at: DateTime<Utc>) -> Vec<ElementOutcome> {
        chunk
            .iter()
            .map(|element| {
                let results: Vec<_> = self
                    .processors
                    .iter()
                    .flat_map(|p| p.compute(element))
                    .collect();
                let errors = results
                    .iter()
                    .filter_map(|r| ProcessingError::from_result(project_id, r, at))
                    .collect();
                ElementOutcome {
                    element_id: element.id.clone(),
                    results,
                    errors,
                }
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::calculations::{CostProcessor, LcaProcessor};
    use crate::elements::{Geometry, MaterialLayer};
    use crate::reference::{
        CostReferenceEntry, LifeExpectancyEntry, MaterialMapping, ReferenceKind, ReferenceMaterial, ReferencePin,
        ReferenceRows, ReferenceStore, UnitType,
    };

    fn pin() -> ReferencePin {
        let store = ReferenceStore::new();
        let tables = [
            ReferenceRows::Materials {
                materials: vec![ReferenceMaterial::new("k1", "Beton", 0.1, 0.3, 150.0).with_density(2300.0)],
                mappings: vec![MaterialMapping::new("Beton", "k1")],
            },
            ReferenceRows::LifeExpectancy {
                entries: vec![LifeExpectancyEntry::new("C", 50)],
            },
            ReferenceRows::Cost {
                entries: vec![CostReferenceEntry::new("C2.1", UnitType::Area, 100.0)],
            },
        ];
        for rows in tables {
            store.insert(rows.into_table("2024").unwrap()).unwrap();
        }
        for kind in ReferenceKind::ALL {
            store.activate(kind, "2024").unwrap();
        }
        store.pin("2024").unwrap()
    }

    fn batch(n: usize) -> ElementBatch {
        (0..n).fold(ElementBatch::new("P-1", "2024"), |batch, i| {
            batch.with_element(
                Element::new(format!("el-{i}"), "C2.1")
                    .with_geometry(Geometry {
                        area_net: Some(1.0 + i as f64),
                        ..Geometry::default()
                    })
                    .with_layer(MaterialLayer::new("Beton", 0.5 + i as f64 / 10.0))
                    .with_layer(MaterialLayer::new(if i % 3 == 0 { "Unbekannt" } else { "Beton" }, 0.2)),
            )
        })
    }

    #[test]
    fn test_output_in_source_order() {
        let pin = pin();
        let lca = LcaProcessor::new(&pin, 60, None);
        let cost = CostProcessor::new(&pin);
        let pipeline = Pipeline::new(4).with_processor(&lca).with_processor(&cost);

        let outcomes = pipeline.run(&batch(23), Utc::now()).unwrap();
        let ids: Vec<&str> = outcomes.iter().map(|o| o.element_id.as_str()).collect();
        let expected: Vec<String> = (0..23).map(|i| format!("el-{i}")).collect();
        assert_eq!(ids, expected.iter().map(String::as_str).collect::<Vec<_>>());
        assert!(outcomes.iter().all(|o| o.results.len() == 3));
        assert_eq!(outcomes[0].errors.len(), 1);
        assert!(outcomes[1].errors.is_empty());
    }

    #[test]
    fn test_deterministic_across_worker_counts() {
        let pin = pin();
        let lca = LcaProcessor::new(&pin, 60, Some(500.0));
        let cost = CostProcessor::new(&pin);
        let at = Utc::now();
        let batch = batch(17);

        let single = Pipeline::new(1).with_processor(&lca).with_processor(&cost).run(&batch, at).unwrap();
        let many = Pipeline::new(8).with_processor(&lca).with_processor(&cost).run(&batch, at).unwrap();
        assert_eq!(single, many);

        let a = serde_json::to_string(&single.iter().flat_map(|o| o.results.clone()).collect::<Vec<_>>()).unwrap();
        let b = serde_json::to_string(&many.iter().flat_map(|o| o.results.clone()).collect::<Vec<_>>()).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn test_empty_batch() {
        let pin = pin();
        let cost = CostProcessor::new(&pin);
        let outcomes = Pipeline::new(2).with_processor(&cost).run(&ElementBatch::new("P-1", "2024"), Utc::now()).unwrap();
        assert!(outcomes.is_empty());
    }

    #[test]
    fn test_validation_failure_aborts() {
        let pin = pin();
        let cost = CostProcessor::new(&pin);
        let result = Pipeline::new(2).with_processor(&cost).run(&ElementBatch::new("P-1", "1999"), Utc::now());
        assert!(result.is_err());
    }
}
