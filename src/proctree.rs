//! Direct children of a process, found by scanning `/proc/*/stat`.
use std::path::Path;

use crate::memory::PROC_ROOT;

pub fn children_of(pid: i32) -> std::io::Result<Vec<i32>> {
    children_in(Path::new(PROC_ROOT), pid)
}

/// Pids whose parent is `parent`, in ascending order.
///
/// Entries that vanish or cannot be parsed mid-scan are skipped.
pub fn children_in(proc_root: &Path, parent: i32) -> std::io::Result<Vec<i32>> {
    let mut children = Vec::new();

    for entry in std::fs::read_dir(proc_root)? {
        let Ok(entry) = entry else { continue };

        let pid: i32 = match entry.file_name().to_string_lossy().parse() {
            Ok(pid) if pid > 0 => pid,
            _ => continue,
        };

        let Ok(stat) = std::fs::read_to_string(entry.path().join("stat")) else { continue };
        if parent_pid(&stat) == Some(parent) {
            children.push(pid);
        }
    }

    children.sort_unstable();
    Ok(children)
}

// `pid (comm) state ppid ...`; comm may itself contain spaces and parens.
fn parent_pid(stat: &str) -> Option<i32> {
    let (_, rest) = stat.rsplit_once(')')?;
    let mut fields = rest.split_whitespace();
    let _state = fields.next()?;
    fields.next()?.parse().ok()
}
