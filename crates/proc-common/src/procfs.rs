//! Snapshot queries against procfs.
//!
//! Everything here is forgiving by design: processes come and go while we
//! enumerate them, so a pid that vanished mid-scan is never an error.

use std::{collections::HashSet, fs, path::PathBuf};

use glob::glob;
use nix::unistd::Pid;

/// Transient procfs inconsistency can in theory present a parent loop;
/// stop walking the tree past this depth.
const MAX_TREE_DEPTH: usize = 32;

/// Read-only view of a procfs mount.
///
/// The root is injectable so tests can fabricate a process tree inside a
/// temporary directory; production code uses [`Procfs::new`].
#[derive(Debug, Clone)]
pub struct Procfs {
    root: PathBuf,
}

impl Default for Procfs {
    fn default() -> Self {
        Self::new()
    }
}

impl Procfs {
    pub fn new() -> Self {
        Self::at("/proc")
    }

    pub fn at(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn pid_dir(&self, pid: Pid) -> PathBuf {
        self.root.join(pid.to_string())
    }

    /// All numeric entries under the procfs root.
    pub fn pids(&self) -> Vec<Pid> {
        let pattern = self.root.join("[0-9]*");
        let entries = match glob(&pattern.to_string_lossy()) {
            Ok(entries) => entries,
            Err(err) => {
                log::warn!("cannot enumerate {}: {}", pattern.display(), err);
                return Vec::new();
            }
        };
        entries
            .filter_map(|entry| entry.ok())
            .filter_map(|entry| {
                entry
                    .file_name()
                    .and_then(|name| name.to_str())
                    .and_then(parse_pid)
            })
            .collect()
    }

    /// Resolve the executable image of a process through its `exe` symlink.
    ///
    /// Returns `None` for anything that cannot be resolved: the process was
    /// already reaped, it's a kernel thread without an image, or we lack the
    /// permission to read the link.
    pub fn path_for_pid(&self, pid: Pid) -> Option<String> {
        let link = self.pid_dir(pid).join("exe");
        fs::read_link(link)
            .ok()
            .and_then(|target| target.to_str().map(str::to_owned))
    }

    /// Parent pid from the `PPid:` line of the process status file.
    pub fn parent_pid_of(&self, pid: Pid) -> Option<Pid> {
        let status = fs::read_to_string(self.pid_dir(pid).join("status")).ok()?;
        let line = status.lines().find_map(|line| line.strip_prefix("PPid:"))?;
        line.trim().parse().ok().map(Pid::from_raw)
    }

    /// Live pids whose executable image resolves to `path`.
    pub fn pids_for_path(&self, path: &str) -> HashSet<Pid> {
        self.pids()
            .into_iter()
            .filter(|pid| self.path_for_pid(*pid).as_deref() == Some(path))
            .collect()
    }

    /// Transitive closure of the child relation, excluding `pid` itself.
    ///
    /// Re-reads the pid list on every level, so children forked while we
    /// walk the tree still converge into the result.
    pub fn descendants_of(&self, pid: Pid) -> HashSet<Pid> {
        let mut found = HashSet::new();
        let mut parents = HashSet::from([pid]);
        for _ in 0..MAX_TREE_DEPTH {
            let next: HashSet<Pid> = self
                .pids()
                .into_iter()
                .filter(|candidate| *candidate != pid && !found.contains(candidate))
                .filter(|candidate| {
                    self.parent_pid_of(*candidate)
                        .is_some_and(|ppid| parents.contains(&ppid))
                })
                .collect();
            if next.is_empty() {
                break;
            }
            found.extend(next.iter().copied());
            parents = next;
        }
        found
    }
}

fn parse_pid(name: &str) -> Option<Pid> {
    let pid: i32 = name.parse().ok()?;
    (pid > 0).then(|| Pid::from_raw(pid))
}
