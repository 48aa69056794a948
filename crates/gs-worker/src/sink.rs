//! Append-only persistence of worker events.

use gs_types::{ResultEvent, ResultRecord, SinkError};
use parking_lot::Mutex;
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

/// Receives events in the order the worker produces them.
///
/// `append` is synchronous and is called from inside the job's async loop.
/// Implementations must stay cheap: one small write per call.
pub trait ResultSink: Send + Sync {
    fn append(&self, event: &ResultEvent) -> Result<(), SinkError>;
}

/// Keeps events in memory.
#[derive(Debug, Default)]
pub struct MemorySink {
    events: Mutex<Vec<ResultEvent>>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<ResultEvent> {
        self.events.lock().clone()
    }

    pub fn records(&self) -> Vec<ResultRecord> {
        self.events
            .lock()
            .iter()
            .filter_map(|e| match e {
                ResultEvent::Record(record) => Some(record.clone()),
                _ => None,
            })
            .collect()
    }
}

impl ResultSink for MemorySink {
    fn append(&self, event: &ResultEvent) -> Result<(), SinkError> {
        self.events.lock().push(event.clone());
        Ok(())
    }
}

/// `<data dir>/gpusweep/results`, falling back to the working directory.
pub fn default_results_dir() -> PathBuf {
    dirs::data_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("gpusweep")
        .join("results")
}

/// One JSON object per line in `<dir>/<group>.jsonl`.
///
/// Writes go straight to `std::fs` rather than through `spawn_blocking`: a
/// worker runs a single job, each event is one short line on a local disk,
/// and the runner must persist records in the order the lines were read.
#[derive(Debug)]
pub struct JsonlSink {
    dir: PathBuf,
    // serializes writers so lines never interleave
    lock: Mutex<()>,
}

impl JsonlSink {
    pub fn new(dir: impl Into<PathBuf>) -> Result<Self, SinkError> {
        let dir = dir.into();
        fs::create_dir_all(&dir).map_err(|source| SinkError::Io {
            path: dir.display().to_string(),
            source,
        })?;
        Ok(Self {
            dir,
            lock: Mutex::new(()),
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Log file for an experiment group.
    ///
    /// Characters outside `[A-Za-z0-9._-]` are written as `%XX` per UTF-8
    /// byte, `%` included, so distinct groups never share a file and no
    /// group can name a path outside `dir`.
    pub fn path_for(dir: &Path, group: &str) -> PathBuf {
        let mut file = String::with_capacity(group.len() + 6);
        for byte in group.bytes() {
            if byte.is_ascii_alphanumeric() || matches!(byte, b'-' | b'_' | b'.') {
                file.push(char::from(byte));
            } else {
                file.push_str(&format!("%{byte:02X}"));
            }
        }
        dir.join(format!("{file}.jsonl"))
    }
}

impl ResultSink for JsonlSink {
    fn append(&self, event: &ResultEvent) -> Result<(), SinkError> {
        let mut line = serde_json::to_vec(event)?;
        line.push(b'\n');

        let path = Self::path_for(&self.dir, event.experiment_group());
        let io_err = |source| SinkError::Io {
            path: path.display().to_string(),
            source,
        };

        let _guard = self.lock.lock();
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .map_err(io_err)?;
        file.write_all(&line).map_err(io_err)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use gs_types::{OutputStream, Stage};
    use std::collections::BTreeMap;
    use tempfile::TempDir;
    use uuid::Uuid;

    fn record(group: &str) -> ResultEvent {
        ResultEvent::Record(ResultRecord {
            task_id: Uuid::new_v4(),
            experiment_group: group.to_string(),
            trial_id: 1,
            stage: Stage::Train,
            stream: OutputStream::Stderr,
            metrics: BTreeMap::from([("accuracy".to_string(), 0.7)]),
            ordinal: 1,
            recorded_at: Utc::now(),
        })
    }

    #[test]
    fn jsonl_appends_per_group() {
        let dir = TempDir::new().unwrap();
        let sink = JsonlSink::new(dir.path().join("results")).unwrap();

        sink.append(&record("alpha")).unwrap();
        sink.append(&record("alpha")).unwrap();
        sink.append(&record("beta")).unwrap();

        let alpha = fs::read_to_string(JsonlSink::path_for(sink.dir(), "alpha")).unwrap();
        assert_eq!(alpha.lines().count(), 2);
        let first: ResultEvent = serde_json::from_str(alpha.lines().next().unwrap()).unwrap();
        assert_eq!(first.experiment_group(), "alpha");

        let beta = fs::read_to_string(JsonlSink::path_for(sink.dir(), "beta")).unwrap();
        assert_eq!(beta.lines().count(), 1);
    }

    #[test]
    fn group_names_are_escaped() {
        let path = JsonlSink::path_for(Path::new("/r"), "../etc/passwd run 1");
        assert_eq!(path, PathBuf::from("/r/..%2Fetc%2Fpasswd%20run%201.jsonl"));
        assert_eq!(
            JsonlSink::path_for(Path::new("/r"), "lr-0.5_x"),
            PathBuf::from("/r/lr-0.5_x.jsonl")
        );
    }

    #[test]
    fn similar_group_names_get_their_own_files() {
        let dir = TempDir::new().unwrap();
        let sink = JsonlSink::new(dir.path()).unwrap();
        let groups = ["lr/sweep", "lr_sweep", "lr%2Fsweep", "lr sweep"];
        for group in groups {
            sink.append(&record(group)).unwrap();
        }

        let mut paths: Vec<PathBuf> =
            groups.iter().map(|g| JsonlSink::path_for(dir.path(), g)).collect();
        paths.sort();
        paths.dedup();
        assert_eq!(paths.len(), groups.len());
        for group in groups {
            let body = fs::read_to_string(JsonlSink::path_for(dir.path(), group)).unwrap();
            let event: ResultEvent = serde_json::from_str(body.trim_end()).unwrap();
            assert_eq!(event.experiment_group(), group);
        }
    }

    #[test]
    fn memory_sink_filters_records() {
        let sink = MemorySink::new();
        sink.append(&record("g")).unwrap();
        assert_eq!(sink.records().len(), 1);
        assert_eq!(sink.events().len(), 1);
    }
}
