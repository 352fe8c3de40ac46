//! WebSocket upgrade for device connections.

use axum::extract::ws::{WebSocket, WebSocketUpgrade};
use axum::extract::{Query, State};
use axum::response::Response;
use futures_util::StreamExt;
use serde::Deserialize;

use crate::error::AppError;
use crate::hub::connection::{reader_loop, writer_loop, MAX_MESSAGE_SIZE};
use crate::hub::{Connection, Hub};
use crate::models::Device;
use crate::state::AppState;

#[derive(Debug, Deserialize)]
pub struct WsParams {
    #[serde(default)]
    pub key: String,
}

/// `GET /ws?key=<device_key>`: unknown key is a 401, store failures a 500.
pub async fn ws_handler(
    State(state): State<AppState>,
    Query(params): Query<WsParams>,
    ws: WebSocketUpgrade,
) -> Result<Response, AppError> {
    if params.key.is_empty() {
        return Err(AppError::BadRequest("missing device key".into()));
    }

    let device = state
        .store
        .get_device(&params.key)
        .await?
        .ok_or(AppError::Unauthorized)?;

    state.store.update_device_last_seen(&device.device_key).await?;

    let hub = state.hub.clone();
    Ok(ws
        .max_message_size(MAX_MESSAGE_SIZE)
        .on_upgrade(move |socket| handle_socket(hub, device, socket)))
}

/// Run the connection: register with the hub, split the socket into the
/// writer and reader pumps, and tear both down when either exits.
async fn handle_socket(hub: Hub, device: Device, socket: WebSocket) {
    let config = hub.config().clone();
    let (sink, stream) = socket.split();

    let (connection, outbound_rx) = Connection::new(
        device.device_key.clone(),
        device.id,
        config.queue_size,
    );
    let conn_id = connection.id();
    hub.register(connection).await;

    let mut writer = tokio::spawn(writer_loop(
        sink,
        outbound_rx,
        config.ping_interval,
        config.write_wait,
    ));
    let mut reader = tokio::spawn(reader_loop(
        stream,
        hub.store().clone(),
        config.pong_timeout,
        device.device_key.clone(),
    ));

    tokio::select! {
        _ = &mut writer => reader.abort(),
        _ = &mut reader => writer.abort(),
    }

    hub.unregister(&device.device_key, conn_id).await;
}
