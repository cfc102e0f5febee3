use crate::channel::PolicyId;
use nix::unistd::Pid;
use std::collections::BTreeMap;
use std::path::PathBuf;

/// Per-process tracking record, one per monitored pid.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TrackedProcess {
    pub pid: Pid,
    /// Currently-executing image path; unset before the first exec commits.
    pub name: Option<PathBuf>,
    /// Image path an in-flight execve is attempting to switch to. Alive
    /// only between that call's entry and exit.
    pub pending_name: Option<PathBuf>,
    pub policy_id: PolicyId,
    /// Syscall number of an in-flight execve, used to correlate its entry
    /// and exit notifications.
    pub exec_in_flight: Option<u64>,
}

impl TrackedProcess {
    fn new(pid: Pid) -> Self {
        Self {
            pid,
            name: None,
            pending_name: None,
            policy_id: 0,
            exec_in_flight: None,
        }
    }
}

/// Ordered pid -> TrackedProcess index. Records are created on first
/// reference and destroyed when the backend reports the process gone or on
/// explicit detach.
#[derive(Debug, Default)]
pub struct ProcessRegistry {
    procs: BTreeMap<Pid, TrackedProcess>,
}

impl ProcessRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get_or_create(&mut self, pid: Pid) -> &mut TrackedProcess {
        self.procs.entry(pid).or_insert_with(|| TrackedProcess::new(pid))
    }

    pub fn get(&self, pid: Pid) -> Option<&TrackedProcess> {
        self.procs.get(&pid)
    }

    pub fn get_mut(&mut self, pid: Pid) -> Option<&mut TrackedProcess> {
        self.procs.get_mut(&pid)
    }

    /// Silent no-op for a pid that is not tracked.
    pub fn remove(&mut self, pid: Pid) -> Option<TrackedProcess> {
        self.procs.remove(&pid)
    }

    pub fn has_processes(&self) -> bool {
        !self.procs.is_empty()
    }

    pub fn len(&self) -> usize {
        self.procs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.procs.is_empty()
    }
}
