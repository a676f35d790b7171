//! Queue snapshots on disk.
//!
//! The file is a JSON array of task records in arrival order. Writes go to a
//! sibling temp file first and are renamed into place.

use super::PriorityTaskQueue;
use crate::error::{PoolError, PoolResult};
use crate::task::Task;
use serde_json::Value;
use std::fs;
use std::io::ErrorKind;
use std::path::Path;

/// Result of reloading a snapshot
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RestoreReport {
    /// Records accepted back into the queue
    pub restored: usize,
    /// Position and reason of every rejected record
    pub rejected: Vec<(usize, String)>,
}

/// Write `tasks` to `path`, replacing any previous snapshot.
pub fn save_snapshot(path: impl AsRef<Path>, tasks: &[Task]) -> PoolResult<()> {
    let path = path.as_ref();
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent)?;
    }

    let tmp = path.with_extension("tmp");
    fs::write(&tmp, serde_json::to_vec_pretty(tasks)?)?;
    fs::rename(&tmp, path)?;

    tracing::debug!("Saved {} queued tasks to {}", tasks.len(), path.display());
    Ok(())
}

/// Read a snapshot. A missing file is an empty snapshot.
///
/// The outer array must parse; each record is decoded separately so one bad
/// record does not discard the rest.
pub fn load_snapshot(path: impl AsRef<Path>) -> PoolResult<Vec<PoolResult<Task>>> {
    let path = path.as_ref();
    let bytes = match fs::read(path) {
        Ok(bytes) => bytes,
        Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(e.into()),
    };

    let records: Vec<Value> = serde_json::from_slice(&bytes)?;
    Ok(records
        .into_iter()
        .map(|record| {
            serde_json::from_value::<Task>(record)
                .map_err(|e| PoolError::validation(format!("invalid snapshot record: {e}")))
        })
        .collect())
}

impl PriorityTaskQueue {
    /// Persist the queued tasks.
    pub fn save_to(&self, path: impl AsRef<Path>) -> PoolResult<()> {
        save_snapshot(path, &self.snapshot())
    }

    /// Re-enqueue every valid record of a snapshot, in file order.
    pub fn restore_from(&mut self, path: impl AsRef<Path>) -> PoolResult<RestoreReport> {
        let mut report = RestoreReport::default();
        for (position, record) in load_snapshot(path)?.into_iter().enumerate() {
            match record.and_then(|task| self.enqueue(task)) {
                Ok(()) => report.restored += 1,
                Err(e) => report.rejected.push((position, e.to_string())),
            }
        }
        Ok(report)
    }
}
