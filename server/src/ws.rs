use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::{extract::State, response::IntoResponse};
use chatline_core::{Dispatcher, InboundEvent};
use futures::{SinkExt, StreamExt};
use tokio_stream::wrappers::UnboundedReceiverStream;
use tracing::{debug, info, warn};

use crate::api::AppState;

pub async fn ws_handler(ws: WebSocketUpgrade, State(state): State<AppState>) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, state.dispatcher))
}

/// Pump one connection: outbound events are written by a forwarding task,
/// inbound frames are dispatched in arrival order.
pub async fn handle_socket(socket: WebSocket, dispatcher: Dispatcher) {
    let (conn, rx) = dispatcher.rooms().connect();
    let (mut sink, mut stream) = socket.split();
    info!(conn = %conn, open = dispatcher.rooms().connection_count(), "socket connected");

    let mut outbound = UnboundedReceiverStream::new(rx);
    let forward = tokio::spawn(async move {
        while let Some(event) = outbound.next().await {
            let frame = match event.encode() {
                Ok(frame) => frame,
                Err(e) => {
                    warn!(conn = %conn, event = event.name(), error = %e, "cannot encode event");
                    continue;
                }
            };
            if sink.send(Message::Text(frame)).await.is_err() {
                break;
            }
        }
    });

    while let Some(msg) = stream.next().await {
        let text = match msg {
            Ok(Message::Text(text)) => text,
            Ok(Message::Close(_)) | Err(_) => break,
            Ok(_) => continue,
        };
        let event = match InboundEvent::decode(&text) {
            Ok(event) => event,
            Err(e) => {
                warn!(conn = %conn, error = %e, "dropping malformed frame");
                continue;
            }
        };
        debug!(conn = %conn, ?event, "inbound event");
        if let Err(e) = dispatcher.handle(conn, event).await {
            warn!(conn = %conn, kind = e.kind(), error = %e, "event rejected");
        }
    }

    dispatcher.rooms().disconnect(conn);
    forward.abort();
    info!(conn = %conn, open = dispatcher.rooms().connection_count(), "socket closed");
}
