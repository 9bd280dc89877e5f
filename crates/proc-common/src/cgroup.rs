//! Cgroup membership changes.
//!
//! Membership is changed by writing the decimal pid into the cgroup's
//! task file. A pid lives in exactly one cgroup per hierarchy, so there is
//! no "remove" operation: moving a pid out of a specialized cgroup means
//! writing it into the parent cgroup's file instead.

use std::{
    fs::OpenOptions,
    io::{self, Write},
    path::{Path, PathBuf},
};

use nix::unistd::Pid;

use crate::procfs::Procfs;

/// The three task files the engine writes to. All caller-supplied absolute
/// paths; the cgroups themselves are created by the packaging, not by us.
#[derive(Debug, Clone)]
pub struct CgroupPaths {
    /// Task file of the cgroup whose traffic bypasses the tunnel.
    pub exclusions: PathBuf,
    /// Task file of the cgroup whose traffic is forced through the tunnel.
    pub vpn_only: PathBuf,
    /// Task file of the parent cgroup, used to move pids back out.
    pub parent: PathBuf,
}

pub fn write_pid(cgroup_file: &Path, pid: Pid) -> io::Result<()> {
    let mut file = OpenOptions::new().append(true).open(cgroup_file)?;
    writeln!(file, "{pid}")
}

/// Write `pid` and every descendant currently visible in procfs into
/// `cgroup_file`.
///
/// The descendant walk is what makes exec-event ordering irrelevant: a
/// child forked before our rule existed (or before the parent's assignment
/// completed) is picked up here. Failures are logged and swallowed; a pid
/// that exited in the meantime is not worth reporting upwards.
pub fn assign_with_descendants(procfs: &Procfs, cgroup_file: &Path, pid: Pid) {
    assign_one(cgroup_file, pid);
    for child in procfs.descendants_of(pid) {
        log::debug!("assigning descendant {child} of {pid}");
        assign_one(cgroup_file, child);
    }
}

fn assign_one(cgroup_file: &Path, pid: Pid) {
    if let Err(err) = write_pid(cgroup_file, pid) {
        log::warn!("cannot move {pid} to {}: {err}", cgroup_file.display());
    }
}
