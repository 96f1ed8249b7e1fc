//! Opener census
//!
//! Counts the processes that currently hold the loopback device open. The
//! state machine only talks to [`CensusProvider`], so a platform with a
//! native "who holds this device" API can replace the /proc walker.

mod procfs;

pub use procfs::{canonical_device_path, ProcCensus};
pub(crate) use procfs::live_group_members;

use std::collections::BTreeSet;

/// Processes that never count as consumers
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Exclusions {
    /// Individual PIDs (the monitor itself)
    pub pids: BTreeSet<u32>,
    /// Whole process groups (the pipeline and anything it spawned)
    pub process_groups: BTreeSet<u32>,
}

impl Exclusions {
    /// Exclude only the monitor's own process
    pub fn own_process() -> Self {
        Self::default().with_pid(std::process::id())
    }

    /// Exclude one more PID
    pub fn with_pid(mut self, pid: u32) -> Self {
        self.pids.insert(pid);
        self
    }

    /// Exclude one more process group
    pub fn with_process_group(mut self, pgid: u32) -> Self {
        self.process_groups.insert(pgid);
        self
    }

    /// Whether any process group needs to be resolved per candidate
    pub fn has_process_groups(&self) -> bool {
        !self.process_groups.is_empty()
    }
}

/// Source of opener snapshots
///
/// Implementations must never fail: anything that cannot be enumerated is
/// simply not counted.
pub trait CensusProvider {
    /// PIDs of other processes holding the device open
    fn openers(&self, exclude: &Exclusions) -> BTreeSet<u32>;

    /// Number of other processes holding the device open
    fn count_openers(&self, exclude: &Exclusions) -> usize {
        self.openers(exclude).len()
    }
}

impl<T: CensusProvider + ?Sized> CensusProvider for &T {
    fn openers(&self, exclude: &Exclusions) -> BTreeSet<u32> {
        (**self).openers(exclude)
    }

    fn count_openers(&self, exclude: &Exclusions) -> usize {
        (**self).count_openers(exclude)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_own_process_exclusion() {
        let exclude = Exclusions::own_process();
        assert!(exclude.pids.contains(&std::process::id()));
        assert!(!exclude.has_process_groups());

        let exclude = exclude.with_process_group(4242);
        assert!(exclude.has_process_groups());
    }
}
