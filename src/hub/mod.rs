//! Registry of live device sockets and the fan-out path to them.
//!
//! The registry map is mutated only by the coordinator task, which drains
//! three event streams (register, unregister, fan-out) serially. Readers
//! (`send_to_device`, `is_online`) take the read lock. Per-connection I/O
//! runs in the reader/writer pumps in [`connection`].

pub mod connection;
pub mod wire;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, RwLock};
use uuid::Uuid;

use crate::models::Message;
use crate::store::Store;
use wire::WireMessage;

/// Liveness and queueing knobs, all defaulted from [`crate::config::Config`].
#[derive(Debug, Clone)]
pub struct HubConfig {
    pub ping_interval: Duration,
    pub pong_timeout: Duration,
    pub write_wait: Duration,
    pub queue_size: usize,
}

impl Default for HubConfig {
    fn default() -> Self {
        Self {
            ping_interval: Duration::from_secs(30),
            pong_timeout: Duration::from_secs(60),
            write_wait: Duration::from_secs(10),
            queue_size: 256,
        }
    }
}

/// A live socket's hub-side handle: identity plus the bounded outgoing queue.
#[derive(Debug)]
pub struct Connection {
    id: Uuid,
    device_key: String,
    device_id: i64,
    outbound: mpsc::Sender<String>,
}

impl Connection {
    /// Returns the handle and the receiver half the writer pump drains.
    pub fn new(
        device_key: String,
        device_id: i64,
        queue_size: usize,
    ) -> (Self, mpsc::Receiver<String>) {
        let (tx, rx) = mpsc::channel(queue_size);
        (
            Self {
                id: Uuid::new_v4(),
                device_key,
                device_id,
                outbound: tx,
            },
            rx,
        )
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    fn sender(&self) -> mpsc::Sender<String> {
        self.outbound.clone()
    }
}

enum Unregister {
    IfCurrent { device_key: String, conn_id: Uuid },
}

#[derive(Clone)]
pub struct Hub {
    registry: Arc<RwLock<HashMap<String, Connection>>>,
    register_tx: mpsc::Sender<Connection>,
    unregister_tx: mpsc::Sender<Unregister>,
    fanout_tx: mpsc::Sender<(String, String)>,
    store: Store,
    config: HubConfig,
}

impl Hub {
    /// Create the hub and spawn its coordinator task.
    pub fn new(store: Store, config: HubConfig) -> Self {
        let registry: Arc<RwLock<HashMap<String, Connection>>> = Arc::default();
        let (register_tx, register_rx) = mpsc::channel(64);
        let (unregister_tx, unregister_rx) = mpsc::channel(64);
        let (fanout_tx, fanout_rx) = mpsc::channel(256);

        tokio::spawn(coordinator(
            registry.clone(),
            store.clone(),
            register_rx,
            unregister_rx,
            fanout_rx,
        ));

        Self {
            registry,
            register_tx,
            unregister_tx,
            fanout_tx,
            store,
            config,
        }
    }

    pub fn config(&self) -> &HubConfig {
        &self.config
    }

    pub fn store(&self) -> &Store {
        &self.store
    }

    /// Hand a new connection to the coordinator. Any previous connection for
    /// the same key is dropped, which closes its queue and shuts its pumps
    /// down; replay of the outbox is scheduled as a separate task.
    pub async fn register(&self, connection: Connection) {
        let _ = self.register_tx.send(connection).await;
    }

    /// Remove `conn_id`'s registration. A later connection under the same key
    /// is left untouched.
    pub async fn unregister(&self, device_key: &str, conn_id: Uuid) {
        let _ = self
            .unregister_tx
            .send(Unregister::IfCurrent {
                device_key: device_key.to_string(),
                conn_id,
            })
            .await;
    }

    /// Offer a frame to the device's live socket.
    ///
    /// Returns whether the device was online; the actual queueing happens on
    /// the coordinator, and a full queue evicts the connection rather than
    /// blocking fan-out to other devices.
    pub async fn send_to_device(&self, device_key: &str, message: &WireMessage) -> bool {
        let payload = match message.to_json() {
            Ok(json) => json,
            Err(e) => {
                tracing::error!(error = %e, "failed to serialize wire message");
                return false;
            }
        };

        let online = self.registry.read().await.contains_key(device_key);
        if online {
            let _ = self
                .fanout_tx
                .send((device_key.to_string(), payload))
                .await;
        }
        online
    }

    pub async fn is_online(&self, device_key: &str) -> bool {
        self.registry.read().await.contains_key(device_key)
    }

    pub async fn connection_count(&self) -> usize {
        self.registry.read().await.len()
    }
}

async fn coordinator(
    registry: Arc<RwLock<HashMap<String, Connection>>>,
    store: Store,
    mut register_rx: mpsc::Receiver<Connection>,
    mut unregister_rx: mpsc::Receiver<Unregister>,
    mut fanout_rx: mpsc::Receiver<(String, String)>,
) {
    loop {
        tokio::select! {
            maybe = register_rx.recv() => {
                let Some(connection) = maybe else { break };
                let device_key = connection.device_key.clone();
                let device_id = connection.device_id;
                let replay_tx = connection.sender();
                {
                    let mut registry = registry.write().await;
                    if registry.insert(device_key.clone(), connection).is_some() {
                        // Dropping the old handle closes its queue; the old
                        // writer emits a close frame and both pumps exit.
                        tracing::info!(device_key = %device_key, "replaced live connection");
                    } else {
                        tracing::info!(device_key = %device_key, "client registered");
                    }
                }
                crate::metrics::set_live_connections(registry.read().await.len());
                // Replay off the coordinator so store I/O never blocks it.
                let store = store.clone();
                tokio::spawn(replay_undelivered(store, device_id, replay_tx));
            }

            maybe = unregister_rx.recv() => {
                let Some(Unregister::IfCurrent { device_key, conn_id }) = maybe else { break };
                let mut registry_guard = registry.write().await;
                if registry_guard.get(&device_key).map(Connection::id) == Some(conn_id) {
                    registry_guard.remove(&device_key);
                    tracing::info!(device_key = %device_key, "client unregistered");
                }
                let len = registry_guard.len();
                drop(registry_guard);
                crate::metrics::set_live_connections(len);
            }

            maybe = fanout_rx.recv() => {
                let Some((device_key, payload)) = maybe else { break };
                let mut evict = None;
                {
                    let registry_guard = registry.read().await;
                    if let Some(connection) = registry_guard.get(&device_key) {
                        if connection.outbound.try_send(payload).is_err() {
                            evict = Some(connection.id);
                        }
                    }
                }
                if let Some(conn_id) = evict {
                    let mut registry_guard = registry.write().await;
                    if registry_guard.get(&device_key).map(Connection::id) == Some(conn_id) {
                        registry_guard.remove(&device_key);
                        tracing::warn!(device_key = %device_key, "outgoing queue full, evicting connection");
                    }
                    let len = registry_guard.len();
                    drop(registry_guard);
                    crate::metrics::set_live_connections(len);
                }
            }
        }
    }
}

/// Enqueue the device's outbox onto a fresh connection, oldest first. A full
/// queue aborts the remainder; the unchanged outbox is replayed on the next
/// reconnect.
async fn replay_undelivered(store: Store, device_id: i64, tx: mpsc::Sender<String>) {
    let pending = match store.get_undelivered(device_id).await {
        Ok(pending) => pending,
        Err(e) => {
            tracing::error!(device_id, error = %e, "failed to load undelivered messages");
            return;
        }
    };
    if pending.is_empty() {
        return;
    }
    tracing::info!(device_id, count = pending.len(), "replaying undelivered messages");

    for message in &pending {
        let frame = replay_frame(message);
        let Ok(payload) = frame.to_json() else {
            continue;
        };
        if tx.try_send(payload).is_err() {
            return;
        }
    }
}

/// Frame shape for a stored message: encrypted envelope when present,
/// otherwise the visible fields in clear.
fn replay_frame(message: &Message) -> WireMessage {
    let data = if message.encrypted_payload.is_empty() {
        serde_json::json!({
            "title": message.title,
            "body": message.body,
            "group": message.group,
            "icon": message.icon,
            "url": message.url,
            "sound": message.sound,
            "badge": message.badge,
        })
    } else {
        serde_json::json!({
            "encrypted_content": String::from_utf8_lossy(&message.encrypted_payload),
        })
    };

    WireMessage {
        kind: wire::WireKind::Message,
        id: Some(message.message_id.clone()),
        timestamp: message.created_at.timestamp(),
        data: Some(data),
    }
}
