//! Per-connection reader and writer pumps.
//!
//! The writer is the single owner of the sink: pings and message frames never
//! interleave. The reader is the single owner of the stream and enforces the
//! pong deadline. When either pump exits, the socket task tears both down and
//! unregisters.

use std::time::Duration;

use axum::extract::ws::{Message, WebSocket};
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio::time::{interval_at, timeout, timeout_at, Instant, MissedTickBehavior};

use super::wire::{WireKind, WireMessage};
use crate::store::Store;

/// Largest frame a device may send.
pub const MAX_MESSAGE_SIZE: usize = 512 * 1024;

/// Drain the outgoing queue and emit heartbeats.
///
/// A closed queue (the hub dropped this connection) produces a close frame
/// and a clean exit. Write errors and deadline misses exit immediately; the
/// reader observes the dead socket and unregisters.
pub async fn writer_loop(
    mut sink: SplitSink<WebSocket, Message>,
    mut outbound: mpsc::Receiver<String>,
    ping_interval: Duration,
    write_wait: Duration,
) {
    let mut ticker = interval_at(Instant::now() + ping_interval, ping_interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            maybe = outbound.recv() => {
                match maybe {
                    Some(payload) => {
                        match timeout(write_wait, sink.send(Message::Text(payload))).await {
                            Ok(Ok(())) => {}
                            _ => return,
                        }
                    }
                    None => {
                        let _ = timeout(write_wait, sink.send(Message::Close(None))).await;
                        return;
                    }
                }
            }
            _ = ticker.tick() => {
                let Ok(payload) = WireMessage::ping().to_json() else { continue };
                match timeout(write_wait, sink.send(Message::Text(payload))).await {
                    Ok(Ok(())) => {}
                    _ => return,
                }
            }
        }
    }
}

/// Drain the socket: dispatch acks, observe liveness.
///
/// The deadline starts at `pong_timeout` and is extended only by pongs
/// (protocol-level or JSON). Read errors are expected on disconnect and are
/// logged once at info.
pub async fn reader_loop(
    mut stream: SplitStream<WebSocket>,
    store: Store,
    pong_timeout: Duration,
    device_key: String,
) {
    let mut deadline = Instant::now() + pong_timeout;

    loop {
        match timeout_at(deadline, stream.next()).await {
            Err(_) => {
                tracing::info!(device_key = %device_key, "no pong within deadline, closing");
                return;
            }
            Ok(None) => return,
            Ok(Some(Err(e))) => {
                tracing::info!(device_key = %device_key, error = %e, "socket read ended");
                return;
            }
            Ok(Some(Ok(frame))) => match frame {
                Message::Text(text) => {
                    if handle_incoming(&store, &text).await {
                        deadline = Instant::now() + pong_timeout;
                    }
                }
                Message::Pong(_) => {
                    deadline = Instant::now() + pong_timeout;
                }
                Message::Close(_) => return,
                _ => {}
            },
        }
    }
}

/// Decode one inbound frame. Returns whether it counts as a pong.
async fn handle_incoming(store: &Store, text: &str) -> bool {
    let Ok(frame) = WireMessage::from_json(text) else {
        return false;
    };

    match frame.kind {
        WireKind::Ack => {
            if let Some(id) = frame.id.as_deref().filter(|id| !id.is_empty()) {
                if let Err(e) = store.mark_message_delivered(id).await {
                    tracing::error!(message_id = %id, error = %e, "failed to mark delivered");
                }
            }
            false
        }
        WireKind::Pong => true,
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::DeviceKind;
    use crate::store::{NewDevice, NewMessage};

    async fn store_with_message() -> (Store, i64) {
        let store = Store::connect_in_memory().await.unwrap();
        let device = store
            .create_device(&NewDevice {
                device_key: "k".into(),
                kind: DeviceKind::Android,
                device_token: String::new(),
                public_key: String::new(),
                name: String::new(),
            })
            .await
            .unwrap();
        store
            .create_message(&NewMessage {
                device_id: device.id,
                message_id: "m-1".into(),
                body: "hello".into(),
                ..Default::default()
            })
            .await
            .unwrap();
        (store, device.id)
    }

    #[tokio::test]
    async fn ack_marks_message_delivered() {
        let (store, device_id) = store_with_message().await;
        let extends =
            handle_incoming(&store, r#"{"type":"ack","id":"m-1","timestamp":1}"#).await;
        assert!(!extends);
        assert!(store.get_undelivered(device_id).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn ack_without_id_is_ignored() {
        let (store, device_id) = store_with_message().await;
        handle_incoming(&store, r#"{"type":"ack","timestamp":1}"#).await;
        handle_incoming(&store, r#"{"type":"ack","id":"","timestamp":1}"#).await;
        assert_eq!(store.get_undelivered(device_id).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn json_pong_counts_as_liveness() {
        let (store, _) = store_with_message().await;
        assert!(handle_incoming(&store, r#"{"type":"pong","timestamp":1}"#).await);
    }

    #[tokio::test]
    async fn garbage_frames_are_ignored() {
        let (store, device_id) = store_with_message().await;
        assert!(!handle_incoming(&store, "not json").await);
        assert!(!handle_incoming(&store, r#"{"type":"register"}"#).await);
        assert_eq!(store.get_undelivered(device_id).await.unwrap().len(), 1);
    }
}
