use std::io::{self, Write};
use std::os::unix::fs::OpenOptionsExt;
use std::os::unix::process::ExitStatusExt;
use std::process::{ExitStatus, Stdio};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use tokio::process::{Child, Command};
use tokio::sync::{mpsc, Mutex, MutexGuard};
use tracing::warn;

use ubervisor_proto::GroupStatus;

use crate::bus::Bus;
use crate::catalog::{Catalog, Group};
use crate::process::{Pid, ProcessRecord, ProcessTable};

/// A group is marked broken once it collects ERROR_MAX * instances error
/// exits within a rolling ERROR_PERIOD-second window.
pub const ERROR_MAX: u32 = 6;
pub const ERROR_PERIOD: i64 = 10;

/// Per-process heartbeat interval.
pub const HEARTBEAT_SEC: u64 = 5;

/// Token in log paths replaced by the instance number.
const INSTANCE_TOKEN: &str = "%(NUM)";

/// Everything the supervision engine mutates, behind one lock.
pub struct State {
    pub catalog: Catalog,
    pub processes: ProcessTable,
}

/// A reaped child: pid plus the wait status, when the runtime could
/// deliver one.
pub struct ExitEvent {
    pub pid: Pid,
    pub status: Option<ExitStatus>,
}

pub struct Supervisor {
    state: Mutex<State>,
    bus: Bus,
    exit_tx: mpsc::UnboundedSender<ExitEvent>,
}

impl Supervisor {
    pub fn new(bus: Bus) -> (Arc<Supervisor>, mpsc::UnboundedReceiver<ExitEvent>) {
        let (exit_tx, exit_rx) = mpsc::unbounded_channel();
        let sup = Arc::new(Supervisor {
            state: Mutex::new(State {
                catalog: Catalog::new(),
                processes: ProcessTable::new(),
            }),
            bus,
            exit_tx,
        });
        (sup, exit_rx)
    }

    pub async fn lock_state(&self) -> MutexGuard<'_, State> {
        self.state.lock().await
    }

    pub fn bus(&self) -> &Bus {
        &self.bus
    }

    /// Start one child for an instance slot. On success the process is
    /// recorded, the slot filled, the heartbeat scheduled and a waiter
    /// task posted to the exit pump.
    ///
    /// A failed attempt writes a one-line diagnostic to the group's own
    /// log, counts toward the group's error window and is retried until
    /// the group either spawns or goes broken.
    pub fn spawn_instance(
        self: &Arc<Supervisor>,
        state: &mut State,
        name: &str,
        instance: usize,
    ) -> bool {
        loop {
            let Some(group) = state.catalog.get_mut(name) else {
                return false;
            };
            if instance >= group.instances {
                return false;
            }
            match try_spawn_child(group, instance) {
                Ok(child) => {
                    let Some(pid) = child.id().map(|p| p as Pid) else {
                        warn!(group = name, "spawned child has no pid");
                        reap_detached(child);
                        return false;
                    };
                    group.childs[instance] = Some(pid);
                    let age = group.age;
                    state.processes.insert(ProcessRecord {
                        pid,
                        group: Some(name.to_string()),
                        instance,
                        started_at: now_secs(),
                        age,
                        terminated: false,
                        heartbeat: None,
                    });

                    let sup = Arc::clone(self);
                    let hb = tokio::spawn(async move { heartbeat_loop(sup, pid).await });
                    if let Some(rec) = state.processes.get_mut(pid) {
                        rec.heartbeat = Some(hb);
                    }

                    let tx = self.exit_tx.clone();
                    let mut child = child;
                    tokio::spawn(async move {
                        let status = child.wait().await.ok();
                        let _ = tx.send(ExitEvent { pid, status });
                    });

                    self.bus.log(&format!("[process_start] {} pid: {}", name, pid));
                    return true;
                }
                Err(e) => {
                    warn!(group = name, instance, stage = e.stage, error = %e.err,
                        "spawn failed");
                    write_spawn_diagnostic(group, instance, e.stage, &e.err);
                    self.record_failure(state, name);
                    let running = state
                        .catalog
                        .get(name)
                        .map(|g| g.status == GroupStatus::Running)
                        .unwrap_or(false);
                    if !running {
                        return false;
                    }
                }
            }
        }
    }

    /// Count an error exit for a group. Crossing the threshold flips the
    /// group to broken, notifies STATUS subscribers and runs the fatal
    /// callback. Returns true if the group is now broken.
    fn record_failure(&self, state: &mut State, name: &str) -> bool {
        let Some(group) = state.catalog.get_mut(name) else {
            return false;
        };
        let count = group.errors.record(now_secs(), ERROR_PERIOD);
        if count < ERROR_MAX * group.instances as u32 {
            return false;
        }
        group.status = GroupStatus::Broken;
        let fatal = group.fatal_cmd.clone();
        self.bus
            .log(&format!("spawn failures. setting broken on {}", name));
        self.bus.status_event(name, GroupStatus::Broken.code());
        if let Some(cmd) = fatal {
            self.run_fatal_cb(&cmd, name);
        }
        true
    }

    /// Fork+exec `fatal_cmd <name>`. A spawn failure is logged, not
    /// retried.
    fn run_fatal_cb(&self, cmd: &str, name: &str) {
        match Command::new(cmd).arg(name).spawn() {
            Ok(child) => {
                self.bus
                    .log(&format!("running fatal_cb \"{}\" for {} ...", cmd, name));
                reap_detached(child);
            }
            Err(_) => {
                self.bus
                    .log(&format!("fork failed when running fatal_cb for {}", name));
            }
        }
    }

    /// Handle one reaped child: drop its record and heartbeat, clear its
    /// slot, apply the restart policy.
    pub async fn handle_exit(self: &Arc<Supervisor>, ev: ExitEvent) {
        let mut state = self.state.lock().await;
        let Some(mut rec) = state.processes.remove(ev.pid) else {
            return;
        };
        if let Some(hb) = rec.heartbeat.take() {
            hb.abort();
        }
        let group_name = rec.group.take();
        self.bus.log(&format!(
            "[process_exit] {} pid: {}",
            group_name.as_deref().unwrap_or("-"),
            ev.pid
        ));
        let Some(name) = group_name else {
            return;
        };
        let instance = rec.instance;

        let error_exit = {
            let Some(group) = state.catalog.get_mut(&name) else {
                return;
            };
            if instance < group.instances {
                group.childs[instance] = None;
            }
            exit_is_error(ev.status.as_ref(), group.killsig)
        };
        if error_exit {
            self.record_failure(&mut state, &name);
        }

        let respawn = state
            .catalog
            .get(&name)
            .map(|g| instance < g.instances && g.status == GroupStatus::Running)
            .unwrap_or(false);
        if respawn {
            self.spawn_instance(&mut state, &name, instance);
        }
    }

    /// One heartbeat tick for a process: enforce the age limit, otherwise
    /// run the group's heartbeat command. Returns false once the process
    /// is no longer tracked.
    pub async fn heartbeat_tick(&self, pid: Pid) -> bool {
        let mut state = self.state.lock().await;
        let Some(rec) = state.processes.get_mut(pid) else {
            return false;
        };
        let uptime = now_secs() - rec.started_at;
        if rec.age > 0 && uptime > rec.age {
            if rec.terminated {
                self.bus
                    .log(&format!("pid {} exceeded uptime. Sending KILL", pid));
                send_signal(pid, libc::SIGKILL);
            } else {
                self.bus
                    .log(&format!("pid {} exceeded uptime. Sending TERM", pid));
                send_signal(pid, libc::SIGTERM);
                rec.terminated = true;
            }
            return true;
        }

        let Some(name) = rec.group.clone() else {
            return true;
        };
        let instance = rec.instance;
        let Some(cmd) = state
            .catalog
            .get(&name)
            .and_then(|g| g.heartbeat_cmd.clone())
        else {
            return true;
        };
        drop(state);

        match Command::new(&cmd)
            .arg(&name)
            .arg(pid.to_string())
            .arg(instance.to_string())
            .spawn()
        {
            Ok(child) => reap_detached(child),
            Err(_) => {
                self.bus
                    .log(&format!("heartbeat spawn error in group {}.", name));
            }
        }
        true
    }
}

/// Drain exit events from the per-child waiter tasks.
pub async fn run_exit_pump(sup: Arc<Supervisor>, mut rx: mpsc::UnboundedReceiver<ExitEvent>) {
    while let Some(ev) = rx.recv().await {
        sup.handle_exit(ev).await;
    }
}

async fn heartbeat_loop(sup: Arc<Supervisor>, pid: Pid) {
    loop {
        tokio::time::sleep(Duration::from_secs(HEARTBEAT_SEC)).await;
        if !sup.heartbeat_tick(pid).await {
            return;
        }
    }
}

/// An error exit is a non-zero normal exit or a termination by the
/// group's kill signal.
pub fn exit_is_error(status: Option<&ExitStatus>, killsig: i32) -> bool {
    let Some(status) = status else {
        return false;
    };
    if let Some(code) = status.code() {
        return code != 0;
    }
    status.signal() == Some(killsig)
}

/// Deliver a signal, ignoring failures (the pid may already be gone).
pub fn send_signal(pid: Pid, sig: i32) {
    // SAFETY: kill() is safe for any pid/signal combination.
    unsafe {
        libc::kill(pid, sig);
    }
}

/// Replace the first `%(NUM)` in a log path with the instance number.
/// The replacement must fit within the token it replaces; a wider one
/// leaves the path untouched.
pub fn substitute_instance(path: &str, instance: usize) -> String {
    let num = instance.to_string();
    match path.find(INSTANCE_TOKEN) {
        Some(pos) if num.len() <= INSTANCE_TOKEN.len() => {
            let mut out = String::with_capacity(path.len());
            out.push_str(&path[..pos]);
            out.push_str(&num);
            out.push_str(&path[pos + INSTANCE_TOKEN.len()..]);
            out
        }
        _ => path.to_string(),
    }
}

pub fn now_secs() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}

struct SpawnError {
    stage: &'static str,
    err: io::Error,
}

impl SpawnError {
    fn new(stage: &'static str, err: io::Error) -> SpawnError {
        SpawnError { stage, err }
    }
}

/// Build and start the child process for one instance slot.
///
/// Identity names are resolved before spawning; only async-signal-safe
/// syscalls run between fork and exec (the `pre_exec` hook applies gid
/// then uid, verifies the privileges cannot be regained, and detaches the
/// child into its own session).
fn try_spawn_child(group: &Group, instance: usize) -> Result<Child, SpawnError> {
    let mut uid = group.uid;
    if let Some(name) = &group.username {
        match nix::unistd::User::from_name(name) {
            Ok(Some(user)) => uid = Some(user.uid.as_raw()),
            Ok(None) => {
                return Err(SpawnError::new(
                    "getpwnam",
                    io::Error::new(io::ErrorKind::NotFound, "unknown user"),
                ))
            }
            Err(e) => {
                return Err(SpawnError::new(
                    "getpwnam",
                    io::Error::from_raw_os_error(e as i32),
                ))
            }
        }
    }
    let mut gid = group.gid;
    if let Some(name) = &group.groupname {
        match nix::unistd::Group::from_name(name) {
            Ok(Some(grp)) => gid = Some(grp.gid.as_raw()),
            Ok(None) => {
                return Err(SpawnError::new(
                    "getgrnam",
                    io::Error::new(io::ErrorKind::NotFound, "unknown group"),
                ))
            }
            Err(e) => {
                return Err(SpawnError::new(
                    "getgrnam",
                    io::Error::from_raw_os_error(e as i32),
                ))
            }
        }
    }

    let mut cmd = Command::new(&group.command[0]);
    cmd.args(&group.command[1..]);
    if let Some(dir) = &group.dir {
        cmd.current_dir(dir);
    }
    cmd.stdin(Stdio::null());
    match &group.stdout_path {
        Some(path) => {
            let file = open_log(&substitute_instance(path, instance))
                .map_err(|e| SpawnError::new("open (stdout)", e))?;
            cmd.stdout(Stdio::from(file));
        }
        None => {
            cmd.stdout(Stdio::null());
        }
    }
    match &group.stderr_path {
        Some(path) => {
            let file = open_log(&substitute_instance(path, instance))
                .map_err(|e| SpawnError::new("open (stderr)", e))?;
            cmd.stderr(Stdio::from(file));
        }
        None => {
            cmd.stderr(Stdio::null());
        }
    }

    // SAFETY: the hook only performs async-signal-safe syscalls.
    unsafe {
        cmd.pre_exec(move || {
            if let Some(gid) = gid {
                if libc::setgid(gid) != 0 {
                    return Err(io::Error::last_os_error());
                }
                if libc::setegid(gid) != 0 {
                    return Err(io::Error::last_os_error());
                }
            }
            if let Some(uid) = uid {
                if libc::setuid(uid) != 0 {
                    return Err(io::Error::last_os_error());
                }
                if libc::seteuid(uid) != 0 {
                    return Err(io::Error::last_os_error());
                }
                if uid != 0 && libc::setuid(0) != -1 {
                    return Err(io::Error::new(
                        io::ErrorKind::Other,
                        "privilege drop check failed (uid)",
                    ));
                }
            }
            if let Some(gid) = gid {
                if gid > 0 && libc::setgid(0) != -1 {
                    return Err(io::Error::new(
                        io::ErrorKind::Other,
                        "privilege drop check failed (gid)",
                    ));
                }
            }
            if libc::setsid() == -1 {
                return Err(io::Error::last_os_error());
            }
            Ok(())
        });
    }

    cmd.spawn().map_err(|e| SpawnError::new("spawn", e))
}

fn open_log(path: &str) -> io::Result<std::fs::File> {
    std::fs::OpenOptions::new()
        .append(true)
        .create(true)
        .mode(0o644)
        .open(path)
}

/// Append the spawn-failure diagnostic to the group's stderr log, falling
/// back to the stdout log. Children have no usable stdio of their own.
fn write_spawn_diagnostic(group: &Group, instance: usize, stage: &str, err: &io::Error) {
    let line = format!(
        "ubervisor: spawn failed for \"{}\": {}: {}\n",
        group.name, stage, err
    );
    for path in [&group.stderr_path, &group.stdout_path].into_iter().flatten() {
        let path = substitute_instance(path, instance);
        if let Ok(mut file) = open_log(&path) {
            if file.write_all(line.as_bytes()).is_ok() {
                return;
            }
        }
    }
}

/// Wait out a helper child in the background so it never lingers as a
/// zombie.
fn reap_detached(mut child: Child) {
    tokio::spawn(async move {
        let _ = child.wait().await;
    });
}
