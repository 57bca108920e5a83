//! WebSocket server that pushes alerts to connected clients.

use chrono::{DateTime, Utc};
use flow_scanner::{AlertRecord, Engine, engine::SymbolView};
use futures::{SinkExt, StreamExt};
use serde::Serialize;
use std::{net::SocketAddr, sync::Arc};
use tokio::{
    net::{TcpListener, TcpStream},
    sync::broadcast,
};
use tokio_tungstenite::{accept_async, tungstenite::Message};
use tracing::{debug, error, info, warn};

/// Frames sent to clients.
#[derive(Debug, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum ServerMessage<'a> {
    /// Sent once on connect with the current state of every symbol.
    Welcome {
        message: &'static str,
        timestamp: DateTime<Utc>,
        symbols: Vec<SymbolView>,
    },
    Alert(&'a AlertRecord),
}

/// Accept clients until the listener fails.
pub async fn serve(listener: TcpListener, engine: Arc<Engine>) {
    while let Ok((stream, peer_addr)) = listener.accept().await {
        info!(%peer_addr, "new alert subscriber");
        tokio::spawn(handle_client(stream, peer_addr, Arc::clone(&engine)));
    }
    warn!("alert server stopped accepting connections");
}

async fn handle_client(stream: TcpStream, peer_addr: SocketAddr, engine: Arc<Engine>) {
    let ws_stream = match accept_async(stream).await {
        Ok(ws) => ws,
        Err(error) => {
            error!(%peer_addr, %error, "WebSocket handshake failed");
            return;
        }
    };

    let (mut ws_sender, mut ws_receiver) = ws_stream.split();
    let mut rx = engine.subscribe_alerts();

    let welcome = ServerMessage::Welcome {
        message: "Connected to flow scanner alerts",
        timestamp: Utc::now(),
        symbols: engine
            .symbols()
            .filter_map(|symbol| engine.state_view(symbol).ok())
            .collect(),
    };
    if let Ok(json) = serde_json::to_string(&welcome) {
        let _ = ws_sender.send(Message::Text(json.into())).await;
    }

    let mut send_task = tokio::spawn(async move {
        loop {
            match rx.recv().await {
                Ok(alert) => {
                    let Ok(json) = serde_json::to_string(&ServerMessage::Alert(&alert)) else {
                        continue;
                    };
                    if ws_sender.send(Message::Text(json.into())).await.is_err() {
                        break;
                    }
                }
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    // Slow subscribers lose alerts rather than stall the engine
                    warn!(%peer_addr, skipped, "alert subscriber lagged");
                }
                Err(broadcast::error::RecvError::Closed) => {
                    info!(%peer_addr, "alert channel closed");
                    break;
                }
            }
        }
    });

    let mut recv_task = tokio::spawn(async move {
        while let Some(message) = ws_receiver.next().await {
            match message {
                Ok(Message::Close(_)) => break,
                Ok(Message::Text(text)) => {
                    debug!(%peer_addr, text = text.as_str(), "ignoring client text");
                }
                Err(error) => {
                    error!(%peer_addr, %error, "WebSocket error");
                    break;
                }
                _ => {}
            }
        }
    });

    tokio::select! {
        _ = &mut send_task => recv_task.abort(),
        _ = &mut recv_task => send_task.abort(),
    }

    info!(%peer_addr, "alert subscriber disconnected");
}
