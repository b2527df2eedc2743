use std::io::SeekFrom;
use std::sync::Arc;

use serde::de::DeserializeOwned;
use tokio::io::{AsyncReadExt, AsyncSeekExt};
use tracing::warn;

use ubervisor_proto::wire::{
    self, GroupSpec, KillRequest, NameRequest, PidsReply, ReadReply, ReadRequest, StatusReply,
    SubscribeRequest,
};
use ubervisor_proto::{Command, GroupStatus};

use crate::catalog::{Catalog, Group, GroupError};
use crate::process::Pid;
use crate::server::{ConnHandle, Server};
use crate::supervisor::{send_signal, substitute_instance};

/// Hard cap on one READ reply payload.
const READ_MAX: i64 = 16383;

/// Route one request to its handler. The return value is the connection's
/// fate: false drops it after the current reply.
pub async fn dispatch(
    server: &Arc<Server>,
    conn: &ConnHandle,
    cmd: Command,
    body: &[u8],
) -> bool {
    match cmd {
        Command::Dele => dele(server, conn, body).await,
        Command::Dump => dump(server, conn).await,
        Command::Exit => exit(server, conn).await,
        Command::Getc => getc(server, conn, body).await,
        Command::Helo => helo(conn),
        Command::Kill => kill(server, conn, body).await,
        Command::List => list(server, conn).await,
        Command::Pids => pids(server, conn, body).await,
        Command::Read => read(server, conn, body).await,
        Command::Spwn => spwn(server, conn, body).await,
        Command::Subs => subs(server, conn, body),
        Command::Updt => updt(server, conn, body).await,
    }
}

/// Parse a JSON body; a malformed one is answered with the generic
/// failure reply and `None` (callers then drop the connection).
fn parse_body<T: DeserializeOwned>(conn: &ConnHandle, body: &[u8]) -> Option<T> {
    match serde_json::from_slice(body) {
        Ok(v) => Some(v),
        Err(_) => {
            conn.send_json(&StatusReply::fail("failure"));
            None
        }
    }
}

fn dump_reply(server: &Arc<Server>, conn: &ConnHandle, catalog: &Catalog) {
    match server.dumper.dump(catalog) {
        Ok(_) => conn.send_json(&StatusReply::ok("dump successful.")),
        Err(e) => {
            warn!(error = %e, "dump failed");
            conn.send_json(&StatusReply::fail("failure"));
        }
    }
}

/// Liveness probe. Answered through the normal framed channel.
fn helo(conn: &ConnHandle) -> bool {
    conn.send_json(&StatusReply::ok("HELO"));
    true
}

async fn list(server: &Arc<Server>, conn: &ConnHandle) -> bool {
    let state = server.sup.lock_state().await;
    conn.send_json(&state.catalog.names());
    true
}

async fn spwn(server: &Arc<Server>, conn: &ConnHandle, body: &[u8]) -> bool {
    let Some(mut spec) = parse_body::<GroupSpec>(conn, body) else {
        return false;
    };
    spec.normalize();
    spec.error = None;

    let mut guard = server.sup.lock_state().await;
    let state = &mut *guard;

    let Some(name) = spec.name.clone() else {
        conn.send_json(&StatusReply::fail("need name"));
        return true;
    };
    if spec.args.as_ref().map_or(true, |a| a.is_empty()) {
        conn.send_json(&StatusReply::fail("need command"));
        return true;
    }
    if state.catalog.contains(&name) {
        conn.send_json(&StatusReply::fail("name exists"));
        return true;
    }
    spec.apply_defaults();
    let group = match Group::from_spec(spec) {
        Ok(group) => group,
        Err(GroupError::BadInstances) => {
            conn.send_json(&StatusReply::fail("instances > 0 required."));
            return true;
        }
        Err(GroupError::TooManyInstances) => {
            conn.send_json(&StatusReply::fail("too many instances."));
            return true;
        }
        Err(_) => {
            conn.send_json(&StatusReply::fail("failure"));
            return true;
        }
    };
    let status = group.status;
    let instances = group.instances;
    if state.catalog.insert(group).is_err() {
        conn.send_json(&StatusReply::fail("name exists"));
        return true;
    }

    if server.auto_dump {
        dump_reply(server, conn, &state.catalog);
    } else {
        conn.send_json(&StatusReply::ok("success"));
    }

    server.bus.log(&format!("[start] creating group {}", name));
    server.bus.status_event(&name, wire::STATUS_CREATE);
    server.bus.status_event(&name, status.code());
    if status == GroupStatus::Running {
        for i in 0..instances {
            server.sup.spawn_instance(state, &name, i);
        }
    }
    true
}

async fn updt(server: &Arc<Server>, conn: &ConnHandle, body: &[u8]) -> bool {
    let Some(mut spec) = parse_body::<GroupSpec>(conn, body) else {
        server.bus.log("[update] parse error");
        return false;
    };
    spec.normalize();
    let Some(name) = spec.name.clone() else {
        conn.send_json(&StatusReply::fail("need name"));
        return false;
    };

    let mut guard = server.sup.lock_state().await;
    let state = &mut *guard;
    if !state.catalog.contains(&name) {
        conn.send_json(&StatusReply::fail("not found"));
        return false;
    }
    if spec.uid.is_some() {
        conn.send_json(&StatusReply::fail("cannot update uid"));
        return true;
    }
    if spec.gid.is_some() {
        conn.send_json(&StatusReply::fail("cannot update gid"));
        return true;
    }
    if spec.args.is_some() {
        conn.send_json(&StatusReply::fail("command cannot be updated"));
        return true;
    }
    if let Some(n) = spec.instances {
        if n < 1 {
            conn.send_json(&StatusReply::fail("instances > 0 required."));
            return true;
        }
        if n > wire::MAX_INSTANCES {
            conn.send_json(&StatusReply::fail("too many instances."));
            return true;
        }
    }

    if let Some(group) = state.catalog.get_mut(&name) {
        if let Some(dir) = spec.dir.take() {
            server.bus.log(&format!(
                "[update] {} dir \"{}\" -> \"{}\"",
                name,
                group.dir.as_deref().unwrap_or("-"),
                dir
            ));
            group.dir = Some(dir);
        }
        if let Some(cmd) = spec.heartbeat.take() {
            server.bus.log(&format!(
                "[update] {} heartbeat \"{}\" -> \"{}\"",
                name,
                group.heartbeat_cmd.as_deref().unwrap_or("-"),
                cmd
            ));
            group.heartbeat_cmd = Some(cmd);
        }
        if let Some(cmd) = spec.fatal_cb.take() {
            server.bus.log(&format!(
                "[update] {} fatal_cb \"{}\" -> \"{}\"",
                name,
                group.fatal_cmd.as_deref().unwrap_or("-"),
                cmd
            ));
            group.fatal_cmd = Some(cmd);
        }
        if let Some(path) = spec.stdout.take() {
            server.bus.log(&format!(
                "[update] {} stdout \"{}\" -> \"{}\"",
                name,
                group.stdout_path.as_deref().unwrap_or("-"),
                path
            ));
            group.stdout_path = Some(path);
        }
        if let Some(path) = spec.stderr.take() {
            server.bus.log(&format!(
                "[update] {} stderr \"{}\" -> \"{}\"",
                name,
                group.stderr_path.as_deref().unwrap_or("-"),
                path
            ));
            group.stderr_path = Some(path);
        }
        if let Some(sig) = spec.killsig {
            server.bus.log(&format!(
                "[update] {} killsig {} -> {}",
                name, group.killsig, sig
            ));
            group.killsig = sig as i32;
        }
    }

    if let Some(n) = spec.instances {
        let n = n as usize;
        let mut spawn_from = None;
        let mut detached: Vec<Pid> = Vec::new();
        if let Some(group) = state.catalog.get_mut(&name) {
            let old = group.instances;
            server.bus.log(&format!(
                "[update] {} instances {} -> {}",
                name, old, n
            ));
            if n > old {
                group.childs.resize(n, None);
                group.instances = n;
                if group.status == GroupStatus::Running {
                    spawn_from = Some(old);
                }
            } else if n < old {
                // Children in decommissioned slots keep running but lose
                // their group: reaped, never respawned.
                detached = group.childs[n..].iter().flatten().copied().collect();
                group.childs.truncate(n);
                group.instances = n;
            }
        }
        for pid in detached {
            state.processes.detach(pid);
        }
        if let Some(from) = spawn_from {
            for i in from..n {
                server.sup.spawn_instance(state, &name, i);
            }
        }
    }

    if let Some(code) = spec.status {
        let Ok(new_status) = GroupStatus::try_from(code) else {
            conn.send_json(&StatusReply::fail("failure"));
            return true;
        };
        let mut spawn_missing: Vec<usize> = Vec::new();
        if let Some(group) = state.catalog.get_mut(&name) {
            server.bus.log(&format!(
                "[update] {} status {} -> {}",
                name,
                group.status.code(),
                code
            ));
            let was = group.status;
            group.errors.reset();
            group.status = new_status;
            if was != GroupStatus::Running && new_status == GroupStatus::Running {
                spawn_missing = group
                    .childs
                    .iter()
                    .enumerate()
                    .filter_map(|(i, slot)| slot.is_none().then_some(i))
                    .collect();
            }
        }
        for i in spawn_missing {
            server.sup.spawn_instance(state, &name, i);
        }
        server.bus.status_event(&name, new_status.code());
    }

    if let Some(age) = spec.age {
        if age > 0 {
            if let Some(group) = state.catalog.get_mut(&name) {
                server.bus.log(&format!(
                    "[update] {} age {} -> {}",
                    name, group.age, age
                ));
                group.age = age;
            }
        }
    }

    if server.auto_dump {
        dump_reply(server, conn, &state.catalog);
    } else {
        conn.send_json(&StatusReply::ok("success"));
    }
    true
}

async fn dele(server: &Arc<Server>, conn: &ConnHandle, body: &[u8]) -> bool {
    let Some(req) = parse_body::<NameRequest>(conn, body) else {
        return false;
    };
    let mut guard = server.sup.lock_state().await;
    let state = &mut *guard;
    let Some(group) = state.catalog.remove(&req.name) else {
        conn.send_json(&StatusReply::fail("name not found"));
        return true;
    };
    server.bus.log(&format!("[dele] {}", group.name));
    let pids = group.live_pids();
    for pid in &pids {
        state.processes.detach(*pid);
    }
    server.bus.status_event(&group.name, wire::STATUS_DELETE);
    conn.send_json(&PidsReply { code: true, pids });
    true
}

async fn getc(server: &Arc<Server>, conn: &ConnHandle, body: &[u8]) -> bool {
    let Some(req) = parse_body::<NameRequest>(conn, body) else {
        return false;
    };
    let state = server.sup.lock_state().await;
    match state.catalog.get(&req.name) {
        Some(group) => conn.send_json(&group.to_spec()),
        None => conn.send_json(&StatusReply::fail("name not found")),
    }
    true
}

async fn pids(server: &Arc<Server>, conn: &ConnHandle, body: &[u8]) -> bool {
    let Some(req) = parse_body::<NameRequest>(conn, body) else {
        return false;
    };
    let state = server.sup.lock_state().await;
    match state.catalog.get(&req.name) {
        Some(group) => conn.send_json(&PidsReply {
            code: true,
            pids: group.live_pids(),
        }),
        None => conn.send_json(&StatusReply::fail("name not found")),
    }
    true
}

async fn kill(server: &Arc<Server>, conn: &ConnHandle, body: &[u8]) -> bool {
    let Some(req) = parse_body::<KillRequest>(conn, body) else {
        return false;
    };
    let state = server.sup.lock_state().await;
    let Some(group) = state.catalog.get(&req.name) else {
        conn.send_json(&StatusReply::fail("name not found"));
        return true;
    };
    let sig = req.sig.unwrap_or(group.killsig as i64) as i32;
    let slots: Vec<usize> = match req.index {
        Some(i) if i < 0 || i as usize >= group.instances => {
            conn.send_json(&StatusReply::fail("instance out of bounds."));
            return true;
        }
        Some(i) => vec![i as usize],
        None => (0..group.instances).collect(),
    };
    server.bus.log(&format!("[kill] {} signal {}", group.name, sig));
    let mut pids = Vec::new();
    for slot in slots {
        if let Some(pid) = group.childs[slot] {
            send_signal(pid, sig);
            pids.push(pid);
        }
    }
    conn.send_json(&PidsReply { code: true, pids });
    true
}

async fn read(server: &Arc<Server>, conn: &ConnHandle, body: &[u8]) -> bool {
    let Some(req) = parse_body::<ReadRequest>(conn, body) else {
        return false;
    };
    if !(1..=2).contains(&req.stream) || req.bytes <= 0 || req.bytes > READ_MAX {
        conn.send_json(&StatusReply::fail("parameters out of bounds."));
        return false;
    }

    let path = {
        let state = server.sup.lock_state().await;
        let Some(group) = state.catalog.get(&req.name) else {
            conn.send_json(&StatusReply::fail("no such group."));
            return true;
        };
        if req.instance < 0 || req.instance as usize >= group.instances {
            conn.send_json(&StatusReply::fail("instance out of bounds."));
            return true;
        }
        let source = if req.stream == 1 {
            &group.stdout_path
        } else {
            &group.stderr_path
        };
        match source {
            Some(path) => substitute_instance(path, req.instance as usize),
            None => {
                conn.send_json(&StatusReply::fail("stream is not logged."));
                return true;
            }
        }
    };

    // The log may not exist yet right after a group was started.
    let Ok(mut file) = tokio::fs::File::open(&path).await else {
        conn.send_json(&StatusReply::fail("can't open logfile."));
        return true;
    };
    let fsize = match file.metadata().await {
        Ok(meta) => meta.len() as i64,
        Err(_) => {
            conn.send_json(&StatusReply::fail("read failed."));
            return true;
        }
    };
    let mut offset = req.offset as i64;
    if offset < 0 {
        offset = (fsize - req.bytes).max(0);
    }
    if file.seek(SeekFrom::Start(offset as u64)).await.is_err() {
        conn.send_json(&StatusReply::fail("read failed."));
        return true;
    }

    let mut buf = vec![0u8; req.bytes as usize];
    let mut filled = 0;
    loop {
        match file.read(&mut buf[filled..]).await {
            Ok(0) => break,
            Ok(n) => {
                filled += n;
                if filled == buf.len() {
                    break;
                }
            }
            Err(_) => {
                conn.send_json(&StatusReply::fail("read failed."));
                return true;
            }
        }
    }
    buf.truncate(filled);

    conn.send_json(&ReadReply {
        code: true,
        log: String::from_utf8_lossy(&buf).into_owned(),
        offset: offset as f64,
        fsize: fsize as f64,
    });
    true
}

fn subs(server: &Arc<Server>, conn: &ConnHandle, body: &[u8]) -> bool {
    let Some(req) = parse_body::<SubscribeRequest>(conn, body) else {
        return false;
    };
    server.bus.subscribe(
        conn.conn,
        req.ident as u32,
        conn.cid,
        conn.notification_sender(),
    );
    conn.send_json(&StatusReply::ok("success"));
    true
}

async fn dump(server: &Arc<Server>, conn: &ConnHandle) -> bool {
    let state = server.sup.lock_state().await;
    dump_reply(server, conn, &state.catalog);
    true
}

async fn exit(server: &Arc<Server>, conn: &ConnHandle) -> bool {
    if !server.allow_exit {
        conn.send_json(&StatusReply::fail("prohibited"));
        return true;
    }
    {
        let state = server.sup.lock_state().await;
        if server.auto_dump {
            dump_reply(server, conn, &state.catalog);
        } else {
            conn.send_json(&StatusReply::ok("exiting"));
        }
    }
    server.bus.log("server exiting due to exit command.");
    server.shutdown.notify_one();
    false
}
