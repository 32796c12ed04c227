//! Resident memory of a job, read from procfs.
//!
//! Only anonymous mappings (inode `0` in `/proc/<pid>/maps`) are counted:
//! heap, stack and private allocations. File-backed mappings such as the
//! executable and shared libraries are excluded.
use std::{
    fs::File,
    io::{BufRead, BufReader},
    path::{Path, PathBuf},
};

use log::debug;
use thiserror::Error;

pub const PROC_ROOT: &str = "/proc";
pub const MEMINFO: &str = "/proc/meminfo";

#[derive(Debug, Error)]
pub enum Error {
    #[error(transparent)]
    IOError(#[from] std::io::Error),

    #[error("Malformed maps line '{0}'")]
    MalformedMapping(String),

    #[error("MemTotal missing from meminfo")]
    MissingMemTotal,
}

#[derive(Debug, PartialEq, Eq)]
struct Mapping {
    start: u64,
    end: u64,
    inode: u64,
}

impl Mapping {
    fn is_anonymous(&self) -> bool {
        self.inode == 0
    }

    fn len(&self) -> u64 {
        self.end - self.start
    }
}

impl TryFrom<&str> for Mapping {
    type Error = Error;

    // 00400000-00452000 r-xp 00000000 08:02 173521      /usr/bin/dbus-daemon
    fn try_from(line: &str) -> Result<Self, Self::Error> {
        let malformed = || Error::MalformedMapping(line.to_owned());
        let mut fields = line.split_whitespace();

        let range = fields.next().ok_or_else(malformed)?;
        let (start, end) = range.split_once('-').ok_or_else(malformed)?;
        let start = u64::from_str_radix(start, 16).map_err(|_| malformed())?;
        let end = u64::from_str_radix(end, 16).map_err(|_| malformed())?;
        if end < start {
            return Err(malformed());
        }

        // perms, offset, dev
        let inode = fields.nth(3).ok_or_else(malformed)?;
        let inode = inode.parse::<u64>().map_err(|_| malformed())?;

        Ok(Mapping { start, end, inode })
    }
}

/// Bytes of anonymous memory mapped by `pid`, or `0` when the process is
/// gone or its maps cannot be parsed.
pub fn resident_bytes(pid: i32) -> u64 {
    resident_bytes_in(Path::new(PROC_ROOT), pid)
}

pub fn resident_bytes_in(proc_root: &Path, pid: i32) -> u64 {
    let maps = maps_path(proc_root, pid);
    let file = match File::open(&maps) {
        Ok(file) => file,
        Err(err) => {
            debug!("Cannot open {}: {}", maps.display(), err);
            return 0;
        }
    };

    match anonymous_bytes(BufReader::new(file)) {
        Ok(total) => total,
        Err(err) => {
            debug!("Discarding sample for {}: {}", pid, err);
            0
        }
    }
}

/// Sums the anonymous ranges of a maps listing. Any malformed line fails
/// the whole scan.
pub fn anonymous_bytes<R: BufRead>(reader: R) -> Result<u64, Error> {
    let mut total = 0u64;
    for line in reader.lines() {
        let line = line?;
        if line.trim().is_empty() {
            continue;
        }

        let mapping = Mapping::try_from(line.as_str())?;
        if mapping.is_anonymous() {
            total = total.saturating_add(mapping.len());
        }
    }

    Ok(total)
}

/// Total RAM in bytes.
pub fn total_memory() -> Result<u64, Error> {
    let meminfo = std::fs::read_to_string(MEMINFO)?;
    parse_mem_total(&meminfo)
}

fn parse_mem_total(meminfo: &str) -> Result<u64, Error> {
    meminfo
        .lines()
        .find_map(|line| line.strip_prefix("MemTotal:"))
        .and_then(|rest| rest.split_whitespace().next())
        .and_then(|kb| kb.parse::<u64>().ok())
        .map(|kb| kb * 1024)
        .ok_or(Error::MissingMemTotal)
}

fn maps_path(proc_root: &Path, pid: i32) -> PathBuf {
    proc_root.join(pid.to_string()).join("maps")
}
