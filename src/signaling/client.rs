//! WebSocket Client für den Relay-Server
//!
//! Implementiert den SignalBus über eine einzelne WebSocket-Verbindung:
//! - Topics werden beim Relay abonniert
//! - Nachrichten werden als JSON-Frames gesendet
//! - Heartbeat hält die Verbindung offen

use super::bus::{subscription_from, BusError, SignalBus, Subscription};
use async_trait::async_trait;
use chrono::Utc;
use futures::{SinkExt, StreamExt};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tokio_tungstenite::{connect_async, tungstenite::Message};
use url::Url;

/// Intervall für Heartbeats (der Relay trennt inaktive Verbindungen)
const HEARTBEAT_INTERVAL_SECS: u64 = 25;

const TOPIC_CAPACITY: usize = 1024;

// ============================================================================
// WIRE FRAMES
// ============================================================================

/// Client → Relay
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "action", rename_all = "snake_case")]
enum ClientFrame<'a> {
    Subscribe {
        topic: &'a str,
    },
    Publish {
        topic: &'a str,
        payload: &'a str,
        timestamp: i64,
    },
    Ping {
        timestamp: i64,
    },
}

/// Relay → Client
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum ServerFrame {
    Message { topic: String, payload: String },
    Pong {},
    Error { code: i32, message: String },
}

// ============================================================================
// CLIENT STATE
// ============================================================================

#[derive(Debug, Clone, Default)]
struct ClientState {
    is_connected: bool,
}

// ============================================================================
// WEBSOCKET BUS
// ============================================================================

/// SignalBus über einen WebSocket-Relay
pub struct WebSocketBus {
    server_url: String,
    state: Arc<RwLock<ClientState>>,
    tx: mpsc::Sender<String>,
    topics: Arc<RwLock<HashMap<String, broadcast::Sender<String>>>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl WebSocketBus {
    /// Verbindet mit dem Relay-Server
    pub async fn connect(server_url: &str) -> Result<Self, BusError> {
        let ws_url = websocket_url(server_url)?;

        tracing::info!("Connecting to signaling relay: {}", ws_url);

        let (ws_stream, _) = connect_async(ws_url.as_str())
            .await
            .map_err(|e| BusError::Unavailable(e.to_string()))?;

        let (mut write, mut read) = ws_stream.split();

        let (tx, mut rx) = mpsc::channel::<String>(100);
        let state = Arc::new(RwLock::new(ClientState { is_connected: true }));
        let topics: Arc<RwLock<HashMap<String, broadcast::Sender<String>>>> =
            Arc::new(RwLock::new(HashMap::new()));

        // Read-Task
        let read_state = Arc::clone(&state);
        let read_topics = Arc::clone(&topics);
        let reader = tokio::spawn(async move {
            while let Some(msg_result) = read.next().await {
                match msg_result {
                    Ok(Message::Text(text)) => match serde_json::from_str::<ServerFrame>(&text) {
                        Ok(frame) => Self::handle_frame(frame, &read_topics),
                        Err(e) => tracing::debug!("Ignoring unknown relay frame: {}", e),
                    },
                    Ok(Message::Close(_)) => {
                        tracing::info!("WebSocket closed by relay");
                        break;
                    }
                    Err(e) => {
                        tracing::error!("WebSocket error: {}", e);
                        break;
                    }
                    _ => {}
                }
            }

            read_state.write().is_connected = false;
            // Abonnements enden mit der Verbindung
            read_topics.write().clear();
        });

        // Write-Task
        let writer = tokio::spawn(async move {
            while let Some(msg) = rx.recv().await {
                if let Err(e) = write.send(Message::Text(msg)).await {
                    tracing::error!("Failed to send WebSocket message: {}", e);
                    break;
                }
            }
        });

        // Heartbeat-Task
        let heartbeat_state = Arc::clone(&state);
        let heartbeat_tx = tx.clone();
        let heartbeat = tokio::spawn(async move {
            let mut interval =
                tokio::time::interval(tokio::time::Duration::from_secs(HEARTBEAT_INTERVAL_SECS));
            interval.tick().await;
            loop {
                interval.tick().await;
                if !heartbeat_state.read().is_connected {
                    tracing::info!("Heartbeat: relay disconnected, stopping heartbeat task");
                    break;
                }
                let frame = ClientFrame::Ping {
                    timestamp: Utc::now().timestamp_millis(),
                };
                let Ok(text) = serde_json::to_string(&frame) else {
                    break;
                };
                if let Err(e) = heartbeat_tx.send(text).await {
                    tracing::warn!("Failed to send heartbeat: {}", e);
                    break;
                }
            }
        });

        Ok(Self {
            server_url: server_url.to_string(),
            state,
            tx,
            topics,
            tasks: Mutex::new(vec![reader, writer, heartbeat]),
        })
    }

    /// Prüft ob verbunden
    pub fn is_connected(&self) -> bool {
        self.state.read().is_connected
    }

    fn handle_frame(
        frame: ServerFrame,
        topics: &Arc<RwLock<HashMap<String, broadcast::Sender<String>>>>,
    ) {
        match frame {
            ServerFrame::Message { topic, payload } => {
                if let Some(tx) = topics.read().get(&topic) {
                    let _ = tx.send(payload);
                }
            }
            ServerFrame::Error { code, message } => {
                tracing::error!("Relay error {}: {}", code, message);
            }
            ServerFrame::Pong {} => {}
        }
    }

    async fn send_frame(&self, frame: ClientFrame<'_>) -> Result<(), BusError> {
        if !self.is_connected() {
            return Err(BusError::Unavailable("not connected to relay".to_string()));
        }
        let text =
            serde_json::to_string(&frame).map_err(|e| BusError::Malformed(e.to_string()))?;
        self.tx
            .send(text)
            .await
            .map_err(|e| BusError::PublishFailed(e.to_string()))
    }
}

#[async_trait]
impl SignalBus for WebSocketBus {
    async fn publish(&self, topic: &str, message: String) -> Result<(), BusError> {
        self.send_frame(ClientFrame::Publish {
            topic,
            payload: &message,
            timestamp: Utc::now().timestamp_millis(),
        })
        .await
    }

    async fn subscribe(&self, topic: &str) -> Result<Subscription, BusError> {
        if !self.is_connected() {
            return Err(BusError::Unavailable("not connected to relay".to_string()));
        }

        let (rx, is_new) = {
            let mut topics = self.topics.write();
            match topics.get(topic) {
                Some(tx) => (tx.subscribe(), false),
                None => {
                    let (tx, rx) = broadcast::channel(TOPIC_CAPACITY);
                    topics.insert(topic.to_string(), tx);
                    (rx, true)
                }
            }
        };

        if is_new {
            if let Err(e) = self.send_frame(ClientFrame::Subscribe { topic }).await {
                // Sonst hielte der nächste subscribe() das Topic für abonniert
                self.topics.write().remove(topic);
                return Err(e);
            }
        }

        Ok(subscription_from(rx))
    }
}

impl Drop for WebSocketBus {
    fn drop(&mut self) {
        for task in self.tasks.lock().drain(..) {
            task.abort();
        }
    }
}

impl std::fmt::Debug for WebSocketBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WebSocketBus")
            .field("server_url", &self.server_url)
            .field("state", &*self.state.read())
            .finish()
    }
}

/// Baut die WebSocket-URL (`http` → `ws`, `https` → `wss`, Pfad `/ws`)
fn websocket_url(server_url: &str) -> Result<Url, BusError> {
    let mut url = Url::parse(server_url).map_err(|e| BusError::Unavailable(e.to_string()))?;

    let scheme = match url.scheme() {
        "http" | "ws" => "ws",
        "https" | "wss" => "wss",
        other => {
            return Err(BusError::Unavailable(format!(
                "unsupported relay scheme: {other}"
            )))
        }
    };
    url.set_scheme(scheme)
        .map_err(|_| BusError::Unavailable(format!("cannot use scheme {scheme}")))?;

    if !url.path().ends_with("/ws") {
        let path = format!("{}/ws", url.path().trim_end_matches('/'));
        url.set_path(&path);
    }
    Ok(url)
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Bus ohne Socket; die Frames landen im zurückgegebenen Receiver
    fn detached_bus() -> (WebSocketBus, mpsc::Receiver<String>) {
        let (tx, rx) = mpsc::channel(8);
        let bus = WebSocketBus {
            server_url: "ws://localhost:8787/ws".to_string(),
            state: Arc::new(RwLock::new(ClientState { is_connected: true })),
            tx,
            topics: Arc::new(RwLock::new(HashMap::new())),
            tasks: Mutex::new(Vec::new()),
        };
        (bus, rx)
    }

    #[tokio::test]
    async fn test_subscribe_sends_frame_once_per_topic() {
        let (bus, mut rx) = detached_bus();

        let _first = bus.subscribe("room:1:signaling").await.unwrap();
        let _second = bus.subscribe("room:1:signaling").await.unwrap();

        let frame: serde_json::Value = serde_json::from_str(&rx.try_recv().unwrap()).unwrap();
        assert_eq!(frame["action"], "subscribe");
        assert_eq!(frame["topic"], "room:1:signaling");
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_failed_subscribe_is_not_remembered() {
        let (bus, rx) = detached_bus();
        drop(rx);

        for _ in 0..2 {
            let result = bus.subscribe("room:1:signaling").await;
            assert!(matches!(result, Err(BusError::PublishFailed(_))));
        }
        assert!(bus.topics.read().is_empty());
    }

    #[test]
    fn test_websocket_url_conversion() {
        assert_eq!(
            websocket_url("https://relay.example.com").unwrap().as_str(),
            "wss://relay.example.com/ws"
        );
        assert_eq!(
            websocket_url("http://localhost:8787/").unwrap().as_str(),
            "ws://localhost:8787/ws"
        );
        assert_eq!(
            websocket_url("ws://localhost:8787/ws").unwrap().as_str(),
            "ws://localhost:8787/ws"
        );
        assert!(websocket_url("ftp://relay.example.com").is_err());
    }

    #[test]
    fn test_client_frame_shape() {
        let frame = ClientFrame::Publish {
            topic: "room:1:signaling",
            payload: "{}",
            timestamp: 1,
        };
        let json: serde_json::Value =
            serde_json::from_str(&serde_json::to_string(&frame).unwrap()).unwrap();
        assert_eq!(json["action"], "publish");
        assert_eq!(json["topic"], "room:1:signaling");
    }

    #[test]
    fn test_server_frame_parsing() {
        let frame: ServerFrame =
            serde_json::from_str(r#"{"type":"message","topic":"t","payload":"p"}"#).unwrap();
        assert!(matches!(frame, ServerFrame::Message { .. }));

        let frame: ServerFrame = serde_json::from_str(r#"{"type":"pong"}"#).unwrap();
        assert!(matches!(frame, ServerFrame::Pong {}));
    }
}
