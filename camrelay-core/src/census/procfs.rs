//! /proc based opener census

use std::collections::BTreeSet;
use std::fs;
use std::os::unix::fs::{FileTypeExt, MetadataExt};
use std::path::{Path, PathBuf};

use tracing::{debug, trace};

use super::{CensusProvider, Exclusions};

/// Resolve symlinks (udev's /dev/v4l/by-id/... aliases) to the real node
///
/// Falls back to the path as given when it cannot be resolved.
pub fn canonical_device_path(path: impl AsRef<Path>) -> PathBuf {
    let path = path.as_ref();
    fs::canonicalize(path).unwrap_or_else(|e| {
        debug!("Cannot canonicalize {}: {}", path.display(), e);
        path.to_path_buf()
    })
}

/// Opener census that walks `/proc/<pid>/fd`
#[derive(Debug, Clone)]
pub struct ProcCensus {
    /// Canonical device path compared against fd link targets
    device: PathBuf,
    /// Character device number, used when a link cannot be read
    device_rdev: Option<u64>,
    /// Process table root
    proc_root: PathBuf,
    /// Skip processes owned by other users
    same_user_only: bool,
    /// Effective uid of the monitor
    uid: u32,
}

impl ProcCensus {
    /// Create a census for `device`
    pub fn new(device: impl AsRef<Path>) -> Self {
        let device = canonical_device_path(device);
        let device_rdev = fs::metadata(&device)
            .ok()
            .filter(|m| m.file_type().is_char_device())
            .map(|m| m.rdev());

        Self {
            device,
            device_rdev,
            proc_root: PathBuf::from("/proc"),
            same_user_only: true,
            // SAFETY: geteuid has no preconditions and cannot fail.
            uid: unsafe { libc::geteuid() },
        }
    }

    /// Walk a different process table root
    pub fn with_proc_root(mut self, root: impl Into<PathBuf>) -> Self {
        self.proc_root = root.into();
        self
    }

    /// Restrict the walk to processes owned by the monitor's user
    pub fn with_same_user_only(mut self, enabled: bool) -> Self {
        self.same_user_only = enabled;
        self
    }

    /// Canonical device path being counted
    pub fn device(&self) -> &Path {
        &self.device
    }

    fn owned_by_us(&self, proc_dir: &Path) -> bool {
        match fs::metadata(proc_dir) {
            Ok(meta) => meta.uid() == self.uid,
            Err(_) => false,
        }
    }

    fn holds_device(&self, proc_dir: &Path) -> bool {
        // EACCES / ENOENT: not ours to inspect, or already gone
        let Ok(fds) = fs::read_dir(proc_dir.join("fd")) else {
            return false;
        };

        for fd in fds.flatten() {
            match fs::read_link(fd.path()) {
                Ok(target) if target == self.device => return true,
                Ok(_) => {}
                Err(_) => {
                    if let Some(rdev) = self.device_rdev {
                        let matches = fs::metadata(fd.path())
                            .map(|m| m.file_type().is_char_device() && m.rdev() == rdev)
                            .unwrap_or(false);
                        if matches {
                            return true;
                        }
                    }
                }
            }
        }

        false
    }
}

/// Process group from `/proc/<pid>/stat`
///
/// The comm field may contain spaces and parentheses, so parsing starts
/// after the last `)`: state, ppid, pgrp.
fn read_pgrp(proc_dir: &Path) -> Option<u32> {
    read_stat(proc_dir).map(|(_, pgrp)| pgrp)
}

fn read_stat(proc_dir: &Path) -> Option<(char, u32)> {
    let stat = fs::read_to_string(proc_dir.join("stat")).ok()?;
    let mut fields = stat[stat.rfind(')')? + 1..].split_whitespace();
    let state = fields.next()?.chars().next()?;
    let pgrp = fields.nth(1)?.parse().ok()?;
    Some((state, pgrp))
}

/// PIDs under `proc_root` that belong to process group `pgid`, zombies excluded
pub(crate) fn live_group_members(proc_root: &Path, pgid: u32) -> Vec<u32> {
    let Ok(entries) = fs::read_dir(proc_root) else {
        return Vec::new();
    };

    let mut members: Vec<u32> = entries
        .flatten()
        .filter_map(|entry| {
            let pid = entry.file_name().to_str()?.parse::<u32>().ok()?;
            match read_stat(&entry.path())? {
                ('Z' | 'X', _) => None,
                (_, pgrp) if pgrp == pgid => Some(pid),
                _ => None,
            }
        })
        .collect();
    members.sort_unstable();
    members
}

impl CensusProvider for ProcCensus {
    fn openers(&self, exclude: &Exclusions) -> BTreeSet<u32> {
        let mut found = BTreeSet::new();

        let entries = match fs::read_dir(&self.proc_root) {
            Ok(entries) => entries,
            Err(e) => {
                debug!("Cannot read {}: {}", self.proc_root.display(), e);
                return found;
            }
        };

        for entry in entries.flatten() {
            let Some(pid) = entry
                .file_name()
                .to_str()
                .and_then(|name| name.parse::<u32>().ok())
            else {
                continue;
            };

            if exclude.pids.contains(&pid) {
                continue;
            }

            let proc_dir = entry.path();

            if self.same_user_only && !self.owned_by_us(&proc_dir) {
                continue;
            }

            if exclude.has_process_groups() {
                match read_pgrp(&proc_dir) {
                    Some(pgrp) if exclude.process_groups.contains(&pgrp) => continue,
                    Some(_) => {}
                    None => continue,
                }
            }

            if self.holds_device(&proc_dir) {
                trace!("pid {} holds {}", pid, self.device.display());
                found.insert(pid);
            }
        }

        found
    }
}
