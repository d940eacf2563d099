//! WebSocket transport
//!
//! One reader loop and one writer task per connection. The writer drains the
//! session's outbound queue; the reader hands text and binary frames to the hub. Ping
//! frames are answered by axum. A close frame, a read error or a dead writer
//! ends the session, which the hub then tears down.

use crate::hub::Hub;
use crate::AppState;
use axum::{
    extract::{
        ws::{CloseFrame, Message, WebSocket},
        State, WebSocketUpgrade,
    },
    response::Response,
};
use futures::{SinkExt, StreamExt};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Close code for "try again later" (RFC 6455 registry).
const CLOSE_TRY_AGAIN_LATER: u16 = 1013;

/// Upgrade `GET /ws` to a hub session.
pub async fn ws_handler(ws: WebSocketUpgrade, State(state): State<AppState>) -> Response {
    ws.on_upgrade(move |socket| handle_socket(socket, state.hub))
}

async fn handle_socket(mut socket: WebSocket, hub: Arc<Hub>) {
    let (session_id, mut outbound) = match hub.connect() {
        Ok(session) => session,
        Err(e) => {
            warn!(error = %e, "Refusing WebSocket session");
            let _ = socket
                .send(Message::Close(Some(CloseFrame {
                    code: CLOSE_TRY_AGAIN_LATER,
                    reason: e.to_string().into(),
                })))
                .await;
            return;
        }
    };

    info!(session_id = %session_id, "WebSocket connected");
    let (mut sender, mut receiver) = socket.split();

    let writer_session = session_id.clone();
    let mut writer = tokio::spawn(async move {
        while let Some(frame) = outbound.recv().await {
            if let Err(e) = sender.send(Message::Text(frame.to_json().into())).await {
                debug!(session_id = %writer_session, error = %e, "WebSocket write failed");
                break;
            }
        }
        let _ = sender.close().await;
    });

    loop {
        tokio::select! {
            incoming = receiver.next() => {
                match incoming {
                    Some(Ok(Message::Text(text))) => hub.handle_text(&session_id, text.as_str()),
                    Some(Ok(Message::Binary(data))) => hub.handle_binary(&session_id, &data),
                    Some(Ok(Message::Ping(_))) | Some(Ok(Message::Pong(_))) => {}
                    Some(Ok(Message::Close(_))) | None => {
                        debug!(session_id = %session_id, "Client closed connection");
                        break;
                    }
                    Some(Err(e)) => {
                        warn!(session_id = %session_id, error = %e, "WebSocket receive error");
                        break;
                    }
                }
            }
            _ = &mut writer => {
                debug!(session_id = %session_id, "Writer finished");
                break;
            }
        }
    }

    hub.disconnect(&session_id);
    writer.abort();
    info!(session_id = %session_id, "WebSocket disconnected");
}
