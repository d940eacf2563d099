//! Liveness probe for orchestrators
//!
//! Connects to a running hub, sends a JSON-RPC `ping` and waits a short
//! window for any frame. A `pong` result or any other reply counts as
//! healthy; silence or a refused connection does not.

use futures::{SinkExt, StreamExt};
use serde_json::{json, Value};
use std::time::{Duration, Instant};
use tokio_tungstenite::{connect_async, tungstenite::Message};

#[derive(Debug, thiserror::Error)]
pub enum ProbeError {
    #[error("cannot connect to {url}: {reason}")]
    Connect { url: String, reason: String },

    #[error("connection to {0} timed out")]
    ConnectTimeout(String),

    #[error("failed to send ping: {0}")]
    Send(String),

    #[error("no frame within {0} ms")]
    Silent(u64),

    #[error("connection closed before any reply")]
    Closed,
}

#[derive(Debug, Clone)]
pub struct ProbeReport {
    /// Reply was a JSON-RPC `pong`
    pub pong: bool,
    pub latency: Duration,
}

pub async fn probe(url: &str, window: Duration) -> Result<ProbeReport, ProbeError> {
    let started = Instant::now();
    let (mut stream, _) = tokio::time::timeout(window, connect_async(url))
        .await
        .map_err(|_| ProbeError::ConnectTimeout(url.to_string()))?
        .map_err(|e| ProbeError::Connect {
            url: url.to_string(),
            reason: e.to_string(),
        })?;

    let ping = json!({ "jsonrpc": "2.0", "id": 1, "method": "ping" }).to_string();
    stream
        .send(Message::text(ping))
        .await
        .map_err(|e| ProbeError::Send(e.to_string()))?;

    let remaining = window.saturating_sub(started.elapsed());
    let frame = tokio::time::timeout(remaining, stream.next())
        .await
        .map_err(|_| ProbeError::Silent(window.as_millis() as u64))?;

    let pong = match frame {
        Some(Ok(Message::Text(text))) => is_pong(text.as_str()),
        Some(Ok(Message::Close(_))) | None => return Err(ProbeError::Closed),
        Some(Ok(_)) => false,
        Some(Err(e)) => {
            return Err(ProbeError::Connect {
                url: url.to_string(),
                reason: e.to_string(),
            })
        }
    };

    let _ = stream.close(None).await;
    Ok(ProbeReport {
        pong,
        latency: started.elapsed(),
    })
}

fn is_pong(text: &str) -> bool {
    serde_json::from_str::<Value>(text)
        .map(|v| v.get("result") == Some(&json!("pong")))
        .unwrap_or(false)
}
