use bytes::Bytes;
use dropwatch_common::event::ClientEvent;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};

/// Pending text events a client may have queued before it counts as stuck.
const EVENT_QUEUE_DEPTH: usize = 16;

/// Identity of a connected client. Never reused within a hub.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ClientId(u64);

impl fmt::Display for ClientId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SendError {
    #[error("client connection closed")]
    Closed,
    #[error("client buffer full")]
    Full,
}

/// Outbound half of a client connection.
///
/// Sends must not wait on the peer: they either hand the payload off
/// immediately or fail.
pub trait ClientSink: Send + Sync {
    fn send_binary(&self, payload: Bytes) -> Result<(), SendError>;
    fn send_text(&self, text: String) -> Result<(), SendError>;
}

/// Message handed to a connection task by its [`ClientMailbox`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outbound {
    Binary(Bytes),
    Text(String),
}

/// In-process client: frames go through a latest-value slot, events through
/// a short bounded queue.
pub struct ChannelClient {
    frames: watch::Sender<Option<Bytes>>,
    events: mpsc::Sender<String>,
}

/// Receiving side of a [`ChannelClient`], drained by the connection task.
pub struct ClientMailbox {
    frames: watch::Receiver<Option<Bytes>>,
    events: mpsc::Receiver<String>,
}

impl ChannelClient {
    pub fn pair(event_depth: usize) -> (Self, ClientMailbox) {
        let (frames_tx, frames_rx) = watch::channel(None);
        let (events_tx, events_rx) = mpsc::channel(event_depth.max(1));
        (
            Self {
                frames: frames_tx,
                events: events_tx,
            },
            ClientMailbox {
                frames: frames_rx,
                events: events_rx,
            },
        )
    }
}

impl ClientSink for ChannelClient {
    fn send_binary(&self, payload: Bytes) -> Result<(), SendError> {
        // Overwrites any frame the client has not picked up yet
        self.frames
            .send(Some(payload))
            .map_err(|_| SendError::Closed)
    }

    fn send_text(&self, text: String) -> Result<(), SendError> {
        self.events.try_send(text).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => SendError::Full,
            mpsc::error::TrySendError::Closed(_) => SendError::Closed,
        })
    }
}

impl ClientMailbox {
    /// Next message for the peer. Events are delivered ahead of frames.
    /// Returns `None` once the hub has dropped this client.
    pub async fn recv(&mut self) -> Option<Outbound> {
        loop {
            tokio::select! {
                biased;
                event = self.events.recv() => return event.map(Outbound::Text),
                changed = self.frames.changed() => {
                    changed.ok()?;
                    let latest = self.frames.borrow_and_update().clone();
                    if let Some(frame) = latest {
                        return Some(Outbound::Binary(frame));
                    }
                }
            }
        }
    }
}

/// The set of live clients and best-effort fan-out to all of them.
///
/// Broadcasts work on a snapshot of the client set taken under the lock, so
/// clients may connect or disconnect concurrently. A client whose send fails
/// is removed; the failure is never reported to the caller.
#[derive(Default)]
pub struct BroadcastHub {
    clients: Mutex<HashMap<ClientId, Arc<dyn ClientSink>>>,
    next_id: AtomicU64,
}

impl BroadcastHub {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a new in-process client and return its mailbox.
    pub fn connect(&self) -> (ClientId, ClientMailbox) {
        let (client, mailbox) = ChannelClient::pair(EVENT_QUEUE_DEPTH);
        let id = self.register(Arc::new(client));
        (id, mailbox)
    }

    pub fn register(&self, sink: Arc<dyn ClientSink>) -> ClientId {
        let id = ClientId(self.next_id.fetch_add(1, Ordering::Relaxed) + 1);
        let count = {
            let mut clients = self.clients.lock();
            clients.insert(id, sink);
            clients.len()
        };
        info!(client = %id, clients = count, "client connected");
        id
    }

    /// Remove `id`. Returns `false` if it was already gone.
    pub fn disconnect(&self, id: ClientId) -> bool {
        let removed = self.clients.lock().remove(&id).is_some();
        if removed {
            info!(client = %id, "client disconnected");
        }
        removed
    }

    pub fn len(&self) -> usize {
        self.clients.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.clients.lock().is_empty()
    }

    pub fn contains(&self, id: ClientId) -> bool {
        self.clients.lock().contains_key(&id)
    }

    /// Send `payload` to every client. Returns how many accepted it.
    pub fn broadcast_binary(&self, payload: Bytes) -> usize {
        self.broadcast(|sink| sink.send_binary(payload.clone()))
    }

    /// Serialize `event` and send it to every client. Returns how many
    /// accepted it.
    pub fn broadcast_json(&self, event: &ClientEvent) -> usize {
        match event.to_json() {
            Ok(text) => self.broadcast(|sink| sink.send_text(text.clone())),
            Err(e) => {
                warn!(error = %e, "failed to serialize client event");
                0
            }
        }
    }

    fn broadcast<F>(&self, mut send: F) -> usize
    where
        F: FnMut(&dyn ClientSink) -> Result<(), SendError>,
    {
        let snapshot: Vec<(ClientId, Arc<dyn ClientSink>)> = self
            .clients
            .lock()
            .iter()
            .map(|(id, sink)| (*id, Arc::clone(sink)))
            .collect();

        let mut delivered = 0;
        let mut failed = Vec::new();
        for (id, sink) in &snapshot {
            match send(sink.as_ref()) {
                Ok(()) => delivered += 1,
                Err(e) => {
                    debug!(client = %id, error = %e, "send failed");
                    failed.push(*id);
                }
            }
        }

        if !failed.is_empty() {
            let mut clients = self.clients.lock();
            for id in failed {
                if clients.remove(&id).is_some() {
                    info!(client = %id, "dropped client after failed send");
                }
            }
        }
        delivered
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use dropwatch_common::event::TriggerEvent;
    use std::sync::atomic::AtomicBool;

    /// Records payloads; fails every send once `broken` is set.
    #[derive(Default)]
    struct RecordingSink {
        broken: AtomicBool,
        binary: Mutex<Vec<Bytes>>,
        text: Mutex<Vec<String>>,
    }

    impl RecordingSink {
        fn broken() -> Self {
            let sink = Self::default();
            sink.broken.store(true, Ordering::SeqCst);
            sink
        }
    }

    impl ClientSink for RecordingSink {
        fn send_binary(&self, payload: Bytes) -> Result<(), SendError> {
            if self.broken.load(Ordering::SeqCst) {
                return Err(SendError::Closed);
            }
            self.binary.lock().push(payload);
            Ok(())
        }

        fn send_text(&self, text: String) -> Result<(), SendError> {
            if self.broken.load(Ordering::SeqCst) {
                return Err(SendError::Closed);
            }
            self.text.lock().push(text);
            Ok(())
        }
    }

    fn trigger() -> ClientEvent {
        ClientEvent::from(TriggerEvent {
            file: "snapshots/snap_1.jpg".into(),
            ts: 12.5,
        })
    }

    #[test]
    fn failing_client_is_removed_others_still_served() {
        let hub = BroadcastHub::new();
        let healthy_a = Arc::new(RecordingSink::default());
        let dead = Arc::new(RecordingSink::broken());
        let healthy_b = Arc::new(RecordingSink::default());
        let a = hub.register(healthy_a.clone());
        let d = hub.register(dead.clone());
        let b = hub.register(healthy_b.clone());

        let delivered = hub.broadcast_binary(Bytes::from_static(b"jpeg"));
        assert_eq!(delivered, 2);
        assert!(hub.contains(a));
        assert!(!hub.contains(d));
        assert!(hub.contains(b));
        assert_eq!(hub.len(), 2);
        assert_eq!(healthy_a.binary.lock().len(), 1);
        assert_eq!(healthy_b.binary.lock().len(), 1);
    }

    #[test]
    fn json_broadcast_uses_event_schema() {
        let hub = BroadcastHub::new();
        let sink = Arc::new(RecordingSink::default());
        let dead = hub.register(Arc::new(RecordingSink::broken()));
        hub.register(sink.clone());

        assert_eq!(hub.broadcast_json(&trigger()), 1);
        assert!(!hub.contains(dead));
        let sent = sink.text.lock();
        let value: serde_json::Value = serde_json::from_str(&sent[0]).unwrap();
        assert_eq!(value["type"], "trigger");
        assert_eq!(value["payload"]["file"], "snapshots/snap_1.jpg");
        assert_eq!(value["payload"]["ts"], 12.5);
    }

    #[test]
    fn disconnect_is_idempotent() {
        let hub = BroadcastHub::new();
        let id = hub.register(Arc::new(RecordingSink::default()));
        assert!(hub.disconnect(id));
        assert!(!hub.disconnect(id));
        assert!(hub.is_empty());
    }

    #[test]
    fn ids_are_not_reused() {
        let hub = BroadcastHub::new();
        let first = hub.register(Arc::new(RecordingSink::default()));
        hub.disconnect(first);
        let second = hub.register(Arc::new(RecordingSink::default()));
        assert_ne!(first, second);
    }

    #[test]
    fn broadcast_to_nobody_is_a_no_op() {
        let hub = BroadcastHub::new();
        assert_eq!(hub.broadcast_binary(Bytes::from_static(b"x")), 0);
        assert_eq!(hub.broadcast_json(&trigger()), 0);
    }

    #[tokio::test]
    async fn slow_client_sees_only_latest_frame() {
        let hub = BroadcastHub::new();
        let (_id, mut mailbox) = hub.connect();
        for i in 0..5u8 {
            assert_eq!(hub.broadcast_binary(Bytes::from(vec![i])), 1);
        }
        assert_eq!(
            mailbox.recv().await,
            Some(Outbound::Binary(Bytes::from(vec![4u8])))
        );
    }

    #[tokio::test]
    async fn events_are_delivered_before_frames() {
        let hub = BroadcastHub::new();
        let (_id, mut mailbox) = hub.connect();
        hub.broadcast_binary(Bytes::from_static(b"frame"));
        hub.broadcast_json(&trigger());
        assert!(matches!(mailbox.recv().await, Some(Outbound::Text(_))));
        assert_eq!(
            mailbox.recv().await,
            Some(Outbound::Binary(Bytes::from_static(b"frame")))
        );
    }

    #[tokio::test]
    async fn dropped_mailbox_counts_as_failure() {
        let hub = BroadcastHub::new();
        let (gone, mailbox) = hub.connect();
        let (kept, _mailbox) = hub.connect();
        drop(mailbox);
        assert_eq!(hub.broadcast_binary(Bytes::from_static(b"x")), 1);
        assert!(!hub.contains(gone));
        assert!(hub.contains(kept));
    }

    #[tokio::test]
    async fn stuck_client_is_dropped_when_event_queue_fills() {
        let hub = BroadcastHub::new();
        let (id, _mailbox) = hub.connect();
        for _ in 0..EVENT_QUEUE_DEPTH {
            assert_eq!(hub.broadcast_json(&trigger()), 1);
        }
        assert_eq!(hub.broadcast_json(&trigger()), 0);
        assert!(!hub.contains(id));
    }

    #[tokio::test]
    async fn mailbox_ends_after_disconnect() {
        let hub = BroadcastHub::new();
        let (id, mut mailbox) = hub.connect();
        hub.disconnect(id);
        assert_eq!(mailbox.recv().await, None);
    }

    #[test]
    fn concurrent_connects_during_broadcast() {
        let hub = Arc::new(BroadcastHub::new());
        let writers: Vec<_> = (0..4)
            .map(|_| {
                let hub = Arc::clone(&hub);
                std::thread::spawn(move || {
                    for _ in 0..50 {
                        let id = hub.register(Arc::new(RecordingSink::default()));
                        hub.broadcast_binary(Bytes::from_static(b"f"));
                        hub.disconnect(id);
                    }
                })
            })
            .collect();
        for w in writers {
            w.join().unwrap();
        }
        assert!(hub.is_empty());
    }
}
