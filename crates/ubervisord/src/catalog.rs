use std::collections::HashMap;

use ubervisor_proto::wire::{self, GroupSpec};
use ubervisor_proto::GroupStatus;

use crate::process::Pid;

/// Rolling failure counter: the count resets whenever the previous failure
/// is older than the window at the moment the next failure is recorded.
#[derive(Debug, Default, Clone)]
pub struct ErrorWindow {
    count: u32,
    last_secs: i64,
}

impl ErrorWindow {
    pub fn new() -> ErrorWindow {
        ErrorWindow::default()
    }

    /// Rebuild a window from a dumped count. The window anchor is left at
    /// zero, so the next failure starts a fresh period.
    pub fn restore(count: u32) -> ErrorWindow {
        ErrorWindow {
            count,
            last_secs: 0,
        }
    }

    /// Record a failure at `now_secs` and return the count within the
    /// current window.
    pub fn record(&mut self, now_secs: i64, period_secs: i64) -> u32 {
        if self.last_secs + period_secs < now_secs {
            self.count = 0;
        }
        self.count += 1;
        self.last_secs = now_secs;
        self.count
    }

    pub fn reset(&mut self) {
        self.count = 0;
    }

    pub fn count(&self) -> u32 {
        self.count
    }
}

/// Why a [`GroupSpec`] could not become a [`Group`].
#[derive(Debug, PartialEq, Eq)]
pub enum GroupError {
    MissingName,
    MissingCommand,
    BadInstances,
    TooManyInstances,
    BadStatus,
    BadId,
}

impl std::fmt::Display for GroupError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            GroupError::MissingName => write!(f, "need name"),
            GroupError::MissingCommand => write!(f, "need command"),
            GroupError::BadInstances => write!(f, "instances > 0 required."),
            GroupError::TooManyInstances => write!(f, "too many instances."),
            GroupError::BadStatus => write!(f, "invalid status"),
            GroupError::BadId => write!(f, "invalid uid/gid"),
        }
    }
}

impl std::error::Error for GroupError {}

/// A named process group: the spawn specification plus the supervision
/// bookkeeping for its instance slots.
#[derive(Debug)]
pub struct Group {
    pub name: String,
    pub command: Vec<String>,
    pub dir: Option<String>,
    pub stdout_path: Option<String>,
    pub stderr_path: Option<String>,
    pub heartbeat_cmd: Option<String>,
    pub fatal_cmd: Option<String>,
    pub username: Option<String>,
    pub groupname: Option<String>,
    pub uid: Option<u32>,
    pub gid: Option<u32>,
    pub instances: usize,
    pub status: GroupStatus,
    pub killsig: i32,
    /// Maximum child uptime in seconds; 0 = unlimited.
    pub age: i64,
    pub errors: ErrorWindow,
    /// Pid occupying each instance slot; len always equals `instances`.
    pub childs: Vec<Option<Pid>>,
}

impl Group {
    /// Build a group from a spec that already had defaults applied.
    pub fn from_spec(spec: GroupSpec) -> Result<Group, GroupError> {
        let name = spec.name.ok_or(GroupError::MissingName)?;
        let command = match spec.args {
            Some(args) if !args.is_empty() => args,
            _ => return Err(GroupError::MissingCommand),
        };
        let instances = match spec.instances {
            Some(n) if n < 1 => return Err(GroupError::BadInstances),
            Some(n) if n > wire::MAX_INSTANCES => return Err(GroupError::TooManyInstances),
            Some(n) => n as usize,
            None => return Err(GroupError::BadInstances),
        };
        let status = spec
            .status
            .unwrap_or(GroupStatus::Running.code())
            .try_into()
            .map_err(|_| GroupError::BadStatus)?;
        let uid = convert_id(spec.uid)?;
        let gid = convert_id(spec.gid)?;
        Ok(Group {
            name,
            command,
            dir: spec.dir,
            stdout_path: spec.stdout,
            stderr_path: spec.stderr,
            heartbeat_cmd: spec.heartbeat,
            fatal_cmd: spec.fatal_cb,
            username: spec.username,
            groupname: spec.groupname,
            uid,
            gid,
            instances,
            status,
            killsig: spec.killsig.unwrap_or(wire::DEFAULT_KILLSIG) as i32,
            age: spec.age.unwrap_or(0),
            errors: match spec.error {
                Some(n) if n > 0 => ErrorWindow::restore(n as u32),
                _ => ErrorWindow::new(),
            },
            childs: vec![None; instances],
        })
    }

    /// Serialize back to the wire shape. Internal slot state never leaves
    /// the server; the failure count does.
    pub fn to_spec(&self) -> GroupSpec {
        GroupSpec {
            name: Some(self.name.clone()),
            args: Some(self.command.clone()),
            dir: self.dir.clone(),
            stdout: self.stdout_path.clone(),
            stderr: self.stderr_path.clone(),
            heartbeat: self.heartbeat_cmd.clone(),
            fatal_cb: self.fatal_cmd.clone(),
            username: self.username.clone(),
            groupname: self.groupname.clone(),
            instances: Some(self.instances as i64),
            status: Some(self.status.code()),
            killsig: Some(self.killsig as i64),
            uid: self.uid.map(|u| u as i64),
            gid: self.gid.map(|g| g as i64),
            age: if self.age > 0 { Some(self.age) } else { None },
            error: Some(self.errors.count() as i64),
        }
    }

    /// Pids of the currently live children, slot order.
    pub fn live_pids(&self) -> Vec<Pid> {
        self.childs.iter().flatten().copied().collect()
    }
}

fn convert_id(v: Option<i64>) -> Result<Option<u32>, GroupError> {
    match v {
        None => Ok(None),
        Some(n) if (0..=u32::MAX as i64).contains(&n) => Ok(Some(n as u32)),
        Some(_) => Err(GroupError::BadId),
    }
}

/// Name -> group map that preserves insertion order for LIST and DUMP.
#[derive(Debug, Default)]
pub struct Catalog {
    order: Vec<String>,
    groups: HashMap<String, Group>,
}

impl Catalog {
    pub fn new() -> Catalog {
        Catalog::default()
    }

    /// Insert a group; rejects a duplicate name, returning the group back.
    pub fn insert(&mut self, group: Group) -> Result<(), Group> {
        if self.groups.contains_key(&group.name) {
            return Err(group);
        }
        self.order.push(group.name.clone());
        self.groups.insert(group.name.clone(), group);
        Ok(())
    }

    pub fn contains(&self, name: &str) -> bool {
        self.groups.contains_key(name)
    }

    pub fn get(&self, name: &str) -> Option<&Group> {
        self.groups.get(name)
    }

    pub fn get_mut(&mut self, name: &str) -> Option<&mut Group> {
        self.groups.get_mut(name)
    }

    pub fn remove(&mut self, name: &str) -> Option<Group> {
        let group = self.groups.remove(name)?;
        self.order.retain(|n| n != name);
        Some(group)
    }

    /// Group names in insertion order.
    pub fn names(&self) -> Vec<String> {
        self.order.clone()
    }

    /// Groups in insertion order.
    pub fn iter(&self) -> impl Iterator<Item = &Group> {
        self.order.iter().filter_map(|n| self.groups.get(n))
    }

    pub fn len(&self) -> usize {
        self.groups.len()
    }

    pub fn is_empty(&self) -> bool {
        self.groups.is_empty()
    }
}
