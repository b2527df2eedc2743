use std::io::Write;
use std::sync::{Arc, Mutex};

use chrono::Utc;
use tokio::sync::mpsc::UnboundedSender;
use tracing::{debug, warn};

use ubervisor_proto::frame;
use ubervisor_proto::wire::{LogEvent, StatusEvent, SUBS_SERVER, SUBS_STATUS};
use ubervisor_proto::CHUNKSIZ;

/// Timestamp prefix of every server log line.
const LOG_TS_FORMAT: &str = "%b %d %T";

/// One client subscription: which channels it wants and the cid its
/// notifications are framed with (the cid of the SUBS request).
struct Subscription {
    conn: u64,
    ident: u32,
    channel: u16,
    tx: UnboundedSender<Vec<u8>>,
}

struct BusInner {
    subs: Mutex<Vec<Subscription>>,
    sink: Mutex<Box<dyn Write + Send>>,
}

/// Server log plus notification fan-out. Clone-safe — hand a copy to any
/// component that logs or emits events.
#[derive(Clone)]
pub struct Bus {
    inner: Arc<BusInner>,
}

impl Bus {
    pub fn new(sink: Box<dyn Write + Send>) -> Bus {
        Bus {
            inner: Arc::new(BusInner {
                subs: Mutex::new(Vec::new()),
                sink: Mutex::new(sink),
            }),
        }
    }

    pub fn subscribe(&self, conn: u64, ident: u32, channel: u16, tx: UnboundedSender<Vec<u8>>) {
        let mut subs = self.inner.subs.lock().unwrap();
        subs.push(Subscription {
            conn,
            ident,
            channel,
            tx,
        });
    }

    /// Drop every subscription belonging to a disconnected client.
    pub fn remove_for_conn(&self, conn: u64) {
        let mut subs = self.inner.subs.lock().unwrap();
        subs.retain(|s| s.conn != conn);
    }

    /// Fan a payload out to every subscription matching the channel mask.
    /// Notifications must fit a single chunk; oversized ones are dropped.
    pub fn publish(&self, mask: u32, payload: &str) {
        if payload.len() > CHUNKSIZ {
            warn!(len = payload.len(), "notification exceeds chunk size, dropped");
            return;
        }
        let subs = self.inner.subs.lock().unwrap();
        for sub in subs.iter() {
            if sub.ident & mask != 0 {
                let _ = sub.tx.send(frame::encode_message(sub.channel, payload.as_bytes()));
            }
        }
    }

    /// Emit a group status transition on the STATUS channel.
    pub fn status_event(&self, name: &str, status: i64) {
        let event = StatusEvent {
            name: name.to_string(),
            status,
        };
        if let Ok(payload) = serde_json::to_string(&event) {
            self.publish(SUBS_STATUS, &payload);
        }
    }

    /// Write a timestamped line to the server log and fan it out on the
    /// SERVER_LOG channel.
    pub fn log(&self, msg: &str) {
        let line = format!("{} -- {}", Utc::now().format(LOG_TS_FORMAT), msg);
        {
            let mut sink = self.inner.sink.lock().unwrap();
            let _ = writeln!(sink, "{}", line);
            let _ = sink.flush();
        }
        debug!("{}", msg);
        let event = LogEvent { msg: line };
        if let Ok(payload) = serde_json::to_string(&event) {
            self.publish(SUBS_SERVER, &payload);
        }
    }

    #[cfg(test)]
    fn subscription_count(&self) -> usize {
        self.inner.subs.lock().unwrap().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use tokio::sync::mpsc;
    use ubervisor_proto::wire::SUBS_CFG;

    #[derive(Clone, Default)]
    struct SharedSink(Arc<Mutex<Vec<u8>>>);

    impl Write for SharedSink {
        fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
            self.0.lock().unwrap().extend_from_slice(buf);
            Ok(buf.len())
        }
        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    fn test_bus() -> (Bus, SharedSink) {
        let sink = SharedSink::default();
        (Bus::new(Box::new(sink.clone())), sink)
    }

    async fn recv_message(
        rx: &mut mpsc::UnboundedReceiver<Vec<u8>>,
    ) -> ubervisor_proto::Message {
        let bytes = rx.try_recv().expect("expected a notification");
        let mut slice = bytes.as_slice();
        frame::read_message(&mut slice).await.unwrap().unwrap()
    }

    #[tokio::test]
    async fn status_event_reaches_matching_subscriber() {
        let (bus, _) = test_bus();
        let (tx, mut rx) = mpsc::unbounded_channel();
        bus.subscribe(1, SUBS_STATUS, 7, tx);

        bus.status_event("g", 4);
        let msg = recv_message(&mut rx).await;
        assert_eq!(msg.cid, 7);
        let event: StatusEvent = serde_json::from_slice(&msg.payload).unwrap();
        assert_eq!(event.name, "g");
        assert_eq!(event.status, 4);
    }

    #[tokio::test]
    async fn mask_filters_channels() {
        let (bus, _) = test_bus();
        let (tx, mut rx) = mpsc::unbounded_channel();
        bus.subscribe(1, SUBS_CFG, 3, tx);

        bus.status_event("g", 1);
        bus.log("hello");
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn log_line_fans_out_with_timestamp_prefix() {
        let (bus, sink) = test_bus();
        let (tx, mut rx) = mpsc::unbounded_channel();
        bus.subscribe(1, SUBS_SERVER, 9, tx);

        bus.log("server started.");
        let msg = recv_message(&mut rx).await;
        assert_eq!(msg.cid, 9);
        let event: LogEvent = serde_json::from_slice(&msg.payload).unwrap();
        assert!(event.msg.ends_with(" -- server started."));

        let written = String::from_utf8(sink.0.lock().unwrap().clone()).unwrap();
        assert!(written.ends_with("-- server started.\n"));
    }

    #[tokio::test]
    async fn subscriber_with_combined_mask_gets_both() {
        let (bus, _) = test_bus();
        let (tx, mut rx) = mpsc::unbounded_channel();
        bus.subscribe(1, SUBS_SERVER | SUBS_STATUS, 2, tx);

        bus.status_event("g", 1);
        bus.log("x");
        assert!(rx.try_recv().is_ok());
        assert!(rx.try_recv().is_ok());
    }

    #[tokio::test]
    async fn remove_for_conn_drops_only_that_client() {
        let (bus, _) = test_bus();
        let (tx_a, mut rx_a) = mpsc::unbounded_channel();
        let (tx_b, mut rx_b) = mpsc::unbounded_channel();
        bus.subscribe(1, SUBS_STATUS, 2, tx_a);
        bus.subscribe(2, SUBS_STATUS, 5, tx_b);

        bus.remove_for_conn(1);
        assert_eq!(bus.subscription_count(), 1);

        bus.status_event("g", 2);
        assert!(rx_a.try_recv().is_err());
        assert!(rx_b.try_recv().is_ok());
    }

    #[tokio::test]
    async fn oversized_notification_is_dropped() {
        let (bus, _) = test_bus();
        let (tx, mut rx) = mpsc::unbounded_channel();
        bus.subscribe(1, SUBS_STATUS, 2, tx);

        let big = "x".repeat(CHUNKSIZ + 1);
        bus.publish(SUBS_STATUS, &big);
        assert!(rx.try_recv().is_err());
    }
}
