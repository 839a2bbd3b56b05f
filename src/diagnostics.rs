//! Per granule trace collection
//!
//! Collection is off until [`TraceCollector::start`] is called and is kept
//! per thread, so concurrent sessions on different threads never mix their
//! traces. Traces are saved as pretty printed JSON.

use crate::types::{BlockType, GranuleInfo};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs::File;
use std::io::Write;
use std::path::Path;
use std::sync::{Mutex, MutexGuard};
use std::thread::ThreadId;

/// Outcome of the outer loop for one granule and channel
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GranuleTrace {
    /// Zero based frame counter of the session
    pub frame: u64,
    pub granule: usize,
    pub channel: usize,
    pub block_type: BlockType,
    pub global_gain: i32,
    pub scalefac_scale: i32,
    pub preflag: bool,
    /// Huffman bits plus scalefactor bits
    pub part2_3_length: i32,
    pub part2_length: i32,
    pub over_count: i32,
}

/// A finished collection run
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TraceRecord {
    pub label: String,
    pub created_at: chrono::DateTime<chrono::Utc>,
    pub granules: Vec<GranuleTrace>,
}

#[derive(Debug, thiserror::Error)]
pub enum DiagnosticsError {
    #[error("No trace collection running on this thread")]
    NotCollecting,

    #[error("Failed to write trace: {0}")]
    Io(#[from] std::io::Error),

    #[error("Failed to serialize trace: {0}")]
    Json(#[from] serde_json::Error),
}

lazy_static::lazy_static! {
    static ref COLLECTORS: Mutex<HashMap<ThreadId, TraceRecord>> = Mutex::new(HashMap::new());
}

fn collectors() -> MutexGuard<'static, HashMap<ThreadId, TraceRecord>> {
    // a panicking recorder leaves the map itself consistent
    COLLECTORS.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Entry points of the per thread collector
pub struct TraceCollector;

impl TraceCollector {
    /// Begin a new run on the current thread, dropping any unsaved one
    pub fn start(label: &str) {
        let record = TraceRecord {
            label: label.to_string(),
            created_at: chrono::Utc::now(),
            granules: Vec::new(),
        };
        collectors().insert(std::thread::current().id(), record);
    }

    pub fn is_collecting() -> bool {
        collectors().contains_key(&std::thread::current().id())
    }

    /// Stop collecting on the current thread and hand back the run
    pub fn take() -> Option<TraceRecord> {
        collectors().remove(&std::thread::current().id())
    }

    /// Save the current thread's run without stopping it
    pub fn save_to_file(path: impl AsRef<Path>) -> Result<(), DiagnosticsError> {
        let json = {
            let guard = collectors();
            let record = guard
                .get(&std::thread::current().id())
                .ok_or(DiagnosticsError::NotCollecting)?;
            serde_json::to_string_pretty(record)?
        };
        let mut file = File::create(path.as_ref())?;
        file.write_all(json.as_bytes())?;
        log::info!("granule trace saved to {}", path.as_ref().display());
        Ok(())
    }

    pub fn load_from_file(path: impl AsRef<Path>) -> Result<TraceRecord, DiagnosticsError> {
        let content = std::fs::read_to_string(path)?;
        Ok(serde_json::from_str(&content)?)
    }
}

pub(crate) fn record_granule(frame: u64, granule: usize, channel: usize, gi: &GranuleInfo, over_count: i32) {
    let mut guard = collectors();
    if let Some(record) = guard.get_mut(&std::thread::current().id()) {
        record.granules.push(GranuleTrace {
            frame,
            granule,
            channel,
            block_type: gi.block_type,
            global_gain: gi.global_gain,
            scalefac_scale: gi.scalefac_scale,
            preflag: gi.preflag,
            part2_3_length: gi.part2_3_length,
            part2_length: gi.part2_length,
            over_count,
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_collection_is_per_thread() {
        TraceCollector::start("main");
        let gi = GranuleInfo::default();
        record_granule(0, 0, 0, &gi, 0);

        std::thread::spawn(move || {
            assert!(!TraceCollector::is_collecting());
            record_granule(0, 1, 1, &gi, 3);
        })
        .join()
        .unwrap();

        let record = TraceCollector::take().unwrap();
        assert_eq!(record.label, "main");
        assert_eq!(record.granules.len(), 1);
        assert_eq!(record.granules[0].global_gain, 210);
        assert!(!TraceCollector::is_collecting());
    }

    #[test]
    fn test_save_requires_running_collection() {
        assert!(matches!(
            TraceCollector::save_to_file(std::env::temp_dir().join("never_written.json")),
            Err(DiagnosticsError::NotCollecting)
        ));
    }
}
