// 📦 Bundle Dispatcher - chunked, ordered delivery
// Splits a run's objects into bounded bundles and hands them to the sink one at a time

use crate::sink::Sink;
use crate::stix::GraphObject;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{error, info};

pub const DEFAULT_CHUNK_SIZE: usize = 5000;

/// Transport grouping of objects; the id is random and means nothing across runs
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Bundle {
    #[serde(rename = "type")]
    pub bundle_type: String,
    pub id: String,
    pub objects: Vec<GraphObject>,
}

impl Bundle {
    pub fn new(objects: Vec<GraphObject>) -> Self {
        Bundle {
            bundle_type: "bundle".to_string(),
            id: format!("bundle--{}", uuid::Uuid::new_v4()),
            objects,
        }
    }

    pub fn len(&self) -> usize {
        self.objects.len()
    }

    pub fn is_empty(&self) -> bool {
        self.objects.is_empty()
    }

    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string(self)
    }
}

/// A chunk send failed; everything before it was accepted
#[derive(Debug, Error)]
#[error("bundle chunk {} of {} failed after {} accepted objects: {}", .chunk_index + 1, .chunks_total, .accepted, .reason)]
pub struct DispatchError {
    /// 0-based index of the failing chunk
    pub chunk_index: usize,
    pub chunks_total: usize,
    /// Objects the sink accepted before the failure
    pub accepted: usize,
    pub reason: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct DispatchReport {
    pub chunks_sent: usize,
    pub objects_sent: usize,
}

pub struct BundleDispatcher {
    chunk_size: usize,
}

impl BundleDispatcher {
    /// A chunk size of zero is treated as one
    pub fn new(chunk_size: usize) -> Self {
        BundleDispatcher {
            chunk_size: chunk_size.max(1),
        }
    }

    pub fn chunk_size(&self) -> usize {
        self.chunk_size
    }

    /// Number of sends needed for `total` objects
    pub fn chunk_count(&self, total: usize) -> usize {
        total.div_ceil(self.chunk_size)
    }

    /// Send `objects` in order, one bundle per chunk, stopping at the first failure
    pub fn dispatch<S: Sink + ?Sized>(
        &self,
        sink: &mut S,
        objects: &[GraphObject],
    ) -> Result<DispatchReport, DispatchError> {
        let total = objects.len();
        let chunks_total = self.chunk_count(total);
        let mut report = DispatchReport::default();

        info!(
            "Preparing to send {} objects in {} chunk(s) of at most {}",
            total, chunks_total, self.chunk_size
        );

        for (chunk_index, chunk) in objects.chunks(self.chunk_size).enumerate() {
            let start = chunk_index * self.chunk_size;
            let bundle = Bundle::new(chunk.to_vec());

            info!(
                chunk = chunk_index + 1,
                size = chunk.len(),
                "Sending bundle chunk {} ({} objects, items {}-{})",
                chunk_index + 1,
                chunk.len(),
                start,
                start + chunk.len() - 1
            );

            if let Err(e) = sink.send_bundle(&bundle) {
                let err = DispatchError {
                    chunk_index,
                    chunks_total,
                    accepted: report.objects_sent,
                    reason: format!("{:#}", e),
                };
                error!("Bundle import failed: {}", err);
                return Err(err);
            }

            report.chunks_sent += 1;
            report.objects_sent += chunk.len();
        }

        Ok(report)
    }
}

impl Default for BundleDispatcher {
    fn default() -> Self {
        BundleDispatcher::new(DEFAULT_CHUNK_SIZE)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sink::WorkHandle;
    use crate::stix::{FileObservable, GraphObject};
    use anyhow::Result;
    use std::collections::BTreeMap;

    /// Records bundle sizes and first object ids; fails on the configured send
    struct RecordingSink {
        sizes: Vec<usize>,
        first_ids: Vec<String>,
        fail_on: Option<usize>,
    }

    impl RecordingSink {
        fn new(fail_on: Option<usize>) -> Self {
            RecordingSink { sizes: Vec::new(), first_ids: Vec::new(), fail_on }
        }
    }

    impl Sink for RecordingSink {
        fn begin_work(&mut self, name: &str) -> Result<WorkHandle> {
            Ok(WorkHandle::new(name))
        }

        fn send_bundle(&mut self, bundle: &Bundle) -> Result<()> {
            if self.fail_on == Some(self.sizes.len()) {
                anyhow::bail!("queue unavailable");
            }
            self.sizes.push(bundle.len());
            self.first_ids.push(bundle.objects[0].id().to_string());
            Ok(())
        }

        fn complete_work(&mut self, _work: &WorkHandle, _message: &str) -> Result<()> {
            Ok(())
        }

        fn fail_work(&mut self, _work: &WorkHandle, _message: &str) -> Result<()> {
            Ok(())
        }
    }

    fn objects(n: usize) -> Vec<GraphObject> {
        (0..n)
            .map(|i| {
                GraphObject::Observable(FileObservable {
                    spec_version: "2.1".to_string(),
                    id: format!("file--{}", i),
                    name: format!("MAL-{}", i),
                    hashes: BTreeMap::new(),
                    x_opencti_description: String::new(),
                    object_marking_refs: Vec::new(),
                })
            })
            .collect()
    }

    #[test]
    fn test_twelve_thousand_objects_in_three_chunks() {
        let dispatcher = BundleDispatcher::new(5000);
        let mut sink = RecordingSink::new(None);

        let report = dispatcher.dispatch(&mut sink, &objects(12000)).unwrap();

        assert_eq!(sink.sizes, vec![5000, 5000, 2000]);
        assert_eq!(sink.first_ids, vec!["file--0", "file--5000", "file--10000"]);
        assert_eq!(report, DispatchReport { chunks_sent: 3, objects_sent: 12000 });
    }

    #[test]
    fn test_chunk_bound_holds_for_various_sizes() {
        for (len, chunk) in [(0usize, 3usize), (1, 3), (3, 3), (4, 3), (10, 1), (7, 100)] {
            let dispatcher = BundleDispatcher::new(chunk);
            let mut sink = RecordingSink::new(None);
            dispatcher.dispatch(&mut sink, &objects(len)).unwrap();

            assert_eq!(sink.sizes.len(), len.div_ceil(chunk), "len={} chunk={}", len, chunk);
            assert!(sink.sizes.iter().all(|s| *s <= chunk));
            assert_eq!(sink.sizes.iter().sum::<usize>(), len);
        }
    }

    #[test]
    fn test_failure_stops_and_reports_progress() {
        let dispatcher = BundleDispatcher::new(2);
        let mut sink = RecordingSink::new(Some(1));

        let err = dispatcher.dispatch(&mut sink, &objects(5)).unwrap_err();

        assert_eq!(err.chunk_index, 1);
        assert_eq!(err.chunks_total, 3);
        assert_eq!(err.accepted, 2);
        assert!(err.reason.contains("queue unavailable"));
        // Chunk 3 was never attempted
        assert_eq!(sink.sizes, vec![2]);
    }

    #[test]
    fn test_zero_chunk_size_is_clamped() {
        let dispatcher = BundleDispatcher::new(0);
        assert_eq!(dispatcher.chunk_size(), 1);
        assert_eq!(dispatcher.chunk_count(3), 3);
    }

    #[test]
    fn test_bundle_serialization() {
        let bundle = Bundle::new(objects(2));
        let json: serde_json::Value = serde_json::from_str(&bundle.to_json().unwrap()).unwrap();

        assert_eq!(json["type"], "bundle");
        assert!(json["id"].as_str().unwrap().starts_with("bundle--"));
        assert_eq!(json["objects"].as_array().unwrap().len(), 2);
    }
}
