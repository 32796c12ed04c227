use std::{collections::HashSet, fmt::Write, sync::Arc};

use chrono::{DateTime, Duration, Local};
use log::{debug, info, warn};
use nix::sys::signal::Signal;
use thiserror::Error;

use crate::{
    entry::{EntryStore, MemorySample},
    job, memory, TIME_FORMAT,
};

#[derive(Debug, Error)]
pub enum Error {
    #[error(transparent)]
    Memory(#[from] memory::Error),
}

/// Answers `mem` and `memkill` requests from the sample log.
#[derive(Debug, Clone)]
pub struct Controller {
    store: Arc<EntryStore>,
}

impl Controller {
    pub fn new(store: Arc<EntryStore>) -> Self {
        Self { store }
    }

    /// Without a pid: one line per job sampled in the second before `now`.
    /// With a pid: that job's full history, empty if it is unknown.
    pub fn query(&self, pid: Option<i32>, now: DateTime<Local>) -> String {
        match pid {
            Some(pid) => format_history(&self.store.history(pid)),
            None => {
                // Samples land once per second, so the current second may
                // still be filling up.
                let window = (now - Duration::seconds(1)).timestamp();
                format_running(&self.store.running_at(window))
            }
        }
    }

    /// SIGKILLs every pid that was ever sampled above `percent` of total RAM
    /// and returns the ones still alive to receive it.
    pub fn enforce(&self, percent: f64) -> Result<Vec<i32>, Error> {
        let total = memory::total_memory()?;
        Ok(self.enforce_with_total(percent, total))
    }

    pub fn enforce_with_total(&self, percent: f64, total: u64) -> Vec<i32> {
        // Collected under the store's lock, signalled after it is released.
        let pids = self.store.over_threshold(percent, total);

        let mut killed = Vec::with_capacity(pids.len());
        for pid in pids {
            match job::send_signal(pid, Signal::SIGKILL) {
                Ok(true) => {
                    info!("sent SIGKILL to {} (over {}% of memory)", pid, percent);
                    killed.push(pid);
                }
                Ok(false) => debug!("{} already exited", pid),
                Err(err) => warn!("{}", err),
            }
        }
        killed
    }
}

/// `<pid> <bytes> <argv...>` per job, first sample of each pid wins.
pub fn format_running(samples: &[MemorySample]) -> String {
    let mut seen = HashSet::new();
    let mut out = String::new();
    for sample in samples.iter().filter(|s| seen.insert(s.pid())) {
        let _ = write!(out, "{} {} ", sample.pid(), sample.bytes());
        for arg in sample.argv() {
            let _ = write!(out, "{} ", arg);
        }
        out.push('\n');
    }
    out
}

/// `<time> - PID:<pid> - Mem:<bytes>` per sample.
pub fn format_history(samples: &[MemorySample]) -> String {
    let mut out = String::new();
    for sample in samples {
        let _ = writeln!(
            out,
            "{} - PID:{} - Mem:{}",
            sample.timestamp().format(TIME_FORMAT),
            sample.pid(),
            sample.bytes()
        );
    }
    out
}
