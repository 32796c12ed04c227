use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

use chrono::{DateTime, Local};

/// One memory observation of a running job.
#[derive(Debug, Clone, PartialEq)]
pub struct MemorySample {
    pid: i32,
    captured_at: DateTime<Local>,
    bytes: u64,
    argv: Arc<[String]>,
}

impl MemorySample {
    pub fn new(pid: i32, bytes: u64, argv: Arc<[String]>) -> Self {
        Self::captured_at(pid, Local::now(), bytes, argv)
    }

    pub fn captured_at(
        pid: i32,
        captured_at: DateTime<Local>,
        bytes: u64,
        argv: Arc<[String]>,
    ) -> Self {
        Self { pid, captured_at, bytes, argv }
    }

    pub fn pid(&self) -> i32 {
        self.pid
    }

    pub fn timestamp(&self) -> DateTime<Local> {
        self.captured_at
    }

    /// Capture time in whole seconds since the epoch.
    pub fn second(&self) -> i64 {
        self.captured_at.timestamp()
    }

    pub fn bytes(&self) -> u64 {
        self.bytes
    }

    pub fn argv(&self) -> &[String] {
        &self.argv
    }
}

/// Append-only log of samples, kept in insertion order.
#[derive(Debug, Default)]
pub struct EntryStore {
    samples: RwLock<Vec<MemorySample>>,
}

impl EntryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn append(&self, sample: MemorySample) {
        self.write().push(sample);
    }

    /// Samples captured during the given epoch second.
    pub fn running_at(&self, second: i64) -> Vec<MemorySample> {
        self.read()
            .iter()
            .filter(|sample| sample.second() == second)
            .cloned()
            .collect()
    }

    /// Full chronological history of one pid.
    pub fn history(&self, pid: i32) -> Vec<MemorySample> {
        self.read()
            .iter()
            .filter(|sample| sample.pid == pid)
            .cloned()
            .collect()
    }

    /// Distinct pids with at least one sample above `percent` of `total`
    /// bytes, in the order they were first seen.
    pub fn over_threshold(&self, percent: f64, total: u64) -> Vec<i32> {
        if total == 0 {
            return Vec::new();
        }

        let mut pids = Vec::new();
        for sample in self.read().iter() {
            let used = sample.bytes as f64 / total as f64 * 100.0;
            if used > percent && !pids.contains(&sample.pid) {
                pids.push(sample.pid);
            }
        }
        pids
    }

    pub fn len(&self) -> usize {
        self.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.read().is_empty()
    }

    /// Drops every sample, returning how many there were.
    pub fn clear(&self) -> usize {
        let mut samples = self.write();
        let count = samples.len();
        samples.clear();
        count
    }

    // Writers only push or clear, so a poisoned lock still holds a valid Vec.
    fn read(&self) -> RwLockReadGuard<'_, Vec<MemorySample>> {
        self.samples.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, Vec<MemorySample>> {
        self.samples.write().unwrap_or_else(PoisonError::into_inner)
    }
}
