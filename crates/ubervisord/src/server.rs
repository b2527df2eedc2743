use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use serde::Serialize;
use tokio::io::AsyncWriteExt;
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::mpsc::{self, UnboundedSender};
use tokio::sync::Notify;
use tracing::debug;

use ubervisor_proto::{frame, Command};

use crate::bus::Bus;
use crate::dump::Dumper;
use crate::handlers;
use crate::supervisor::Supervisor;

pub struct Server {
    pub sup: Arc<Supervisor>,
    pub bus: Bus,
    pub dumper: Dumper,
    pub auto_dump: bool,
    pub allow_exit: bool,
    /// Signalled by the EXIT handler; the main task exits after a short
    /// grace period for reply flushing.
    pub shutdown: Notify,
    next_conn: AtomicU64,
}

impl Server {
    pub fn new(
        sup: Arc<Supervisor>,
        bus: Bus,
        dumper: Dumper,
        auto_dump: bool,
        allow_exit: bool,
    ) -> Arc<Server> {
        Arc::new(Server {
            sup,
            bus,
            dumper,
            auto_dump,
            allow_exit,
            shutdown: Notify::new(),
            next_conn: AtomicU64::new(0),
        })
    }

    pub async fn run(self: Arc<Server>, listener: UnixListener) -> std::io::Result<()> {
        loop {
            let (stream, _addr) = listener.accept().await?;
            let conn = self.next_conn.fetch_add(1, Ordering::Relaxed) + 1;
            let server = Arc::clone(&self);
            tokio::spawn(async move {
                handle_connection(server, stream, conn).await;
            });
        }
    }
}

/// Per-request view of a connection handed to command handlers: replies
/// are framed with the request's cid and go through the connection's
/// writer task, serialized with any notifications for that client.
pub struct ConnHandle {
    pub conn: u64,
    pub cid: u16,
    tx: UnboundedSender<Vec<u8>>,
}

impl ConnHandle {
    pub fn new(conn: u64, cid: u16, tx: UnboundedSender<Vec<u8>>) -> ConnHandle {
        ConnHandle { conn, cid, tx }
    }

    pub fn send_raw(&self, payload: &[u8]) {
        let _ = self.tx.send(frame::encode_message(self.cid, payload));
    }

    pub fn send_json<T: Serialize>(&self, value: &T) {
        if let Ok(body) = serde_json::to_vec(value) {
            self.send_raw(&body);
        }
    }

    /// Sender a subscription keeps to push notifications to this client.
    pub fn notification_sender(&self) -> UnboundedSender<Vec<u8>> {
        self.tx.clone()
    }
}

async fn handle_connection(server: Arc<Server>, stream: UnixStream, conn: u64) {
    let (mut reader, mut writer) = stream.into_split();
    let (tx, mut rx) = mpsc::unbounded_channel::<Vec<u8>>();

    let writer_task = tokio::spawn(async move {
        while let Some(buf) = rx.recv().await {
            if writer.write_all(&buf).await.is_err() {
                break;
            }
        }
        let _ = writer.shutdown().await;
    });

    loop {
        match frame::read_message(&mut reader).await {
            Ok(None) => break,
            Ok(Some(msg)) => {
                if msg.payload.len() < 4 {
                    server.bus.log("command payload too small.");
                    break;
                }
                let Some(cmd) = Command::parse(&msg.payload) else {
                    debug!(conn, "unknown command, dropping connection");
                    break;
                };
                let handle = ConnHandle::new(conn, msg.cid, tx.clone());
                if !handlers::dispatch(&server, &handle, cmd, &msg.payload[4..]).await {
                    break;
                }
            }
            Err(e) => {
                server.bus.log(&format!("{}", e));
                break;
            }
        }
    }

    // Subscriptions die with the connection; dropping the last sender
    // lets the writer flush what is queued and close.
    server.bus.remove_for_conn(conn);
    drop(tx);
    let _ = writer_task.await;
}
