//! Media-stream WebSocket entrypoint.
//!
//! Upgrades the carrier's stream request and pumps frames between the socket
//! and the `MediaStreamHandler`.

use axum::{
    extract::{
        State,
        ws::{Message, WebSocket, WebSocketUpgrade},
    },
    response::{IntoResponse, Response},
};
use futures::{sink::SinkExt, stream::StreamExt};
use tracing::{debug, info, warn};

use callforge_media::{MediaStreamHandler, StreamConnection, StreamOutput};

use crate::server::GatewayState;

pub async fn ws_handler(ws: WebSocketUpgrade, State(state): State<GatewayState>) -> Response {
    let Some(media) = state.media.clone() else {
        return axum::http::StatusCode::NOT_FOUND.into_response();
    };
    ws.on_upgrade(move |socket| handle_connection(socket, media))
}

async fn handle_connection(socket: WebSocket, media: MediaStreamHandler) {
    let (mut sender, mut receiver) = socket.split();
    let (mut conn, mut outbound) = StreamConnection::new();

    // Handler output -> socket.
    let mut send_task = tokio::spawn(async move {
        while let Some(output) = outbound.recv().await {
            match output {
                StreamOutput::Text(text) => {
                    if sender.send(Message::Text(text)).await.is_err() {
                        break;
                    }
                }
                StreamOutput::Close => {
                    let _ = sender.send(Message::Close(None)).await;
                    break;
                }
            }
        }
    });

    // Socket -> handler. The connection stays with this task so the
    // disconnect below sees the final stream id.
    let handler = media.clone();
    let mut recv_task = tokio::spawn(async move {
        while let Some(Ok(msg)) = receiver.next().await {
            match msg {
                Message::Text(text) => {
                    if let Err(e) = handler.handle_message(&mut conn, &text).await {
                        warn!("[MediaStream] Dropping bad frame: {e}");
                    }
                }
                Message::Close(_) => break,
                _ => {}
            }
        }
        handler.handle_disconnect(&conn).await;
    });

    tokio::select! {
        _ = (&mut send_task) => {
            debug!("[MediaStream] Outbound side closed");
            let _ = (&mut recv_task).await;
        }
        _ = (&mut recv_task) => send_task.abort(),
    }

    info!("[MediaStream] WebSocket connection closed");
}
