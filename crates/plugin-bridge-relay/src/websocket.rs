//! WebSocket endpoint the plugin UI connects to.

use std::sync::Arc;

use axum::{
    Router,
    extract::{
        State, WebSocketUpgrade,
        ws::{Message, WebSocket},
    },
    response::IntoResponse,
};
use futures::{SinkExt, StreamExt};
use tokio::sync::mpsc;

use crate::channel::CommandChannel;

/// WebSocket handler state.
#[derive(Clone)]
pub struct RelayState {
    pub channel: Arc<CommandChannel>,
}

/// WebSocket upgrade handler.
///
/// Use this as an Axum route handler.
pub async fn ws_handler(
    ws: WebSocketUpgrade,
    State(state): State<RelayState>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, state.channel))
}

async fn handle_socket(socket: WebSocket, channel: Arc<CommandChannel>) {
    let (mut sender, mut receiver) = socket.split();

    let (tx, mut rx) = mpsc::unbounded_channel::<String>();
    let token = channel.attach(tx);

    let send_task = tokio::spawn(async move {
        while let Some(text) = rx.recv().await {
            if sender.send(Message::Text(text.into())).await.is_err() {
                break;
            }
        }
    });

    while let Some(msg) = receiver.next().await {
        match msg {
            Ok(Message::Text(text)) => channel.handle_frame(text.as_str()),
            Ok(Message::Binary(data)) => match std::str::from_utf8(&data) {
                Ok(text) => channel.handle_frame(text),
                Err(_) => tracing::warn!("Dropping non-UTF-8 relay frame"),
            },
            Ok(Message::Close(_)) => break,
            Ok(_) => {}
            Err(e) => {
                tracing::error!("Relay WebSocket error: {e}");
                break;
            }
        }
    }

    channel.detach(token);
    send_task.abort();
}

/// Create the relay router, serving the plugin socket at `/ws`.
///
/// # Example
/// ```ignore
/// let app = Router::new()
///     .merge(create_relay_router(channel));
/// ```
#[must_use]
pub fn create_relay_router(channel: Arc<CommandChannel>) -> Router {
    Router::new()
        .route("/ws", axum::routing::get(ws_handler))
        .with_state(RelayState { channel })
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use serde_json::json;
    use tokio_tungstenite::tungstenite;

    use super::*;
    use crate::protocol::{EXECUTE_CODE, RelayRequest};

    #[tokio::test]
    async fn test_plugin_socket_round_trip() {
        let channel = Arc::new(CommandChannel::new());
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let app = create_relay_router(Arc::clone(&channel));
        tokio::spawn(async move { axum::serve(listener, app).await.unwrap() });

        let (mut plugin, _) = tokio_tungstenite::connect_async(format!("ws://{addr}/ws"))
            .await
            .unwrap();
        channel
            .wait_for_client(Duration::from_secs(2))
            .await
            .unwrap();

        let call = tokio::spawn({
            let channel = Arc::clone(&channel);
            async move {
                channel
                    .send_command(EXECUTE_CODE, json!({"code": "return 1"}), Duration::from_secs(2))
                    .await
            }
        });
        let frame = plugin.next().await.unwrap().unwrap();
        let request: RelayRequest = serde_json::from_str(frame.to_text().unwrap()).unwrap();
        assert_eq!(request.command_type, EXECUTE_CODE);
        plugin
            .send(tungstenite::Message::Text(
                json!({"id": request.id, "result": 1}).to_string(),
            ))
            .await
            .unwrap();
        assert_eq!(call.await.unwrap().unwrap(), json!(1));

        plugin.close(None).await.unwrap();
        for _ in 0..100 {
            if !channel.is_connected() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(!channel.is_connected());
    }
}
