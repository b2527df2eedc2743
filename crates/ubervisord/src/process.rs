use std::collections::HashMap;

use tokio::task::JoinHandle;

pub type Pid = i32;

/// One live child. Exists from spawn until its exit is handled; the
/// heartbeat task is aborted when the record is dropped from the table.
#[derive(Debug)]
pub struct ProcessRecord {
    pub pid: Pid,
    /// Back-reference to the owning group. Cleared when the group is
    /// deleted or the slot is decommissioned while the child still runs;
    /// such orphans are reaped but never respawned.
    pub group: Option<String>,
    pub instance: usize,
    /// Unix seconds at spawn.
    pub started_at: i64,
    /// Age limit snapshotted from the group at spawn time.
    pub age: i64,
    /// Set once a TERM was sent for exceeding the age limit.
    pub terminated: bool,
    pub heartbeat: Option<JoinHandle<()>>,
}

/// Live children keyed by pid.
#[derive(Debug, Default)]
pub struct ProcessTable {
    map: HashMap<Pid, ProcessRecord>,
}

impl ProcessTable {
    pub fn new() -> ProcessTable {
        ProcessTable::default()
    }

    pub fn insert(&mut self, record: ProcessRecord) {
        self.map.insert(record.pid, record);
    }

    pub fn remove(&mut self, pid: Pid) -> Option<ProcessRecord> {
        self.map.remove(&pid)
    }

    pub fn get(&self, pid: Pid) -> Option<&ProcessRecord> {
        self.map.get(&pid)
    }

    pub fn get_mut(&mut self, pid: Pid) -> Option<&mut ProcessRecord> {
        self.map.get_mut(&pid)
    }

    /// Clear the group back-reference, leaving the child running as an
    /// orphan until it exits on its own.
    pub fn detach(&mut self, pid: Pid) {
        if let Some(rec) = self.map.get_mut(&pid) {
            rec.group = None;
        }
    }

    pub fn len(&self) -> usize {
        self.map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }
}
