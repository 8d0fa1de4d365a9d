use std::sync::Arc;

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use futures::{stream::SplitSink, SinkExt, StreamExt};
use shared::protocol::{ClientEnvelope, ServerEvent};
use tokio::{
    net::TcpStream,
    sync::{broadcast, watch, Mutex},
    task::JoinHandle,
};
use tokio_tungstenite::{connect_async, tungstenite::Message, MaybeTlsStream, WebSocketStream};
use tracing::{info, warn};
use url::Url;

use crate::{error::SyncError, EVENT_BUFFER};

/// Topic-scoped bidirectional event channel between this client and the
/// remote peer. Events arrive in transport order (FIFO per channel); nothing
/// is guaranteed between distinct channels.
#[async_trait]
pub trait Channel: Send + Sync {
    fn topic(&self) -> &str;

    /// Join the remote topic. Idempotent: calling it again on a live channel
    /// must not create a second subscription or re-run the join handshake.
    async fn connect(&self) -> Result<()>;

    /// Ordered stream of inbound events. Dropping the receiver detaches it.
    fn subscribe(&self) -> broadcast::Receiver<ServerEvent>;

    /// Fire-and-forget send. Ok means the local send was accepted; remote
    /// outcome, if any, arrives later as an inbound event.
    async fn publish(&self, envelope: &ClientEnvelope) -> Result<()>;

    /// Tear the channel down. Idempotent.
    async fn leave(&self);

    /// Flips false when the transport drops. Reconnecting is the caller's
    /// decision, never automatic.
    fn connectivity(&self) -> watch::Receiver<bool>;
}

/// Creates channels on demand for the lifecycle manager.
pub trait ChannelFactory: Send + Sync {
    fn create(&self, topic: &str) -> Arc<dyn Channel>;
}

type WsSink = SplitSink<WebSocketStream<MaybeTlsStream<TcpStream>>, Message>;

#[derive(Default)]
struct WsInner {
    started: bool,
    writer: Option<WsSink>,
    reader_task: Option<JoinHandle<()>>,
}

/// One WebSocket per topic, speaking JSON text frames.
pub struct WebSocketChannel {
    server_url: String,
    topic: String,
    events: broadcast::Sender<ServerEvent>,
    connected: watch::Sender<bool>,
    inner: Arc<Mutex<WsInner>>,
}

impl WebSocketChannel {
    pub fn new(server_url: impl Into<String>, topic: impl Into<String>) -> Self {
        let (events, _) = broadcast::channel(EVENT_BUFFER);
        let (connected, _) = watch::channel(false);
        Self {
            server_url: server_url.into(),
            topic: topic.into(),
            events,
            connected,
            inner: Arc::new(Mutex::new(WsInner::default())),
        }
    }

    fn endpoint(&self) -> Result<String> {
        let ws_base = if self.server_url.starts_with("https://") {
            self.server_url.replacen("https://", "wss://", 1)
        } else if self.server_url.starts_with("http://") {
            self.server_url.replacen("http://", "ws://", 1)
        } else if self.server_url.starts_with("ws://") || self.server_url.starts_with("wss://") {
            self.server_url.clone()
        } else {
            return Err(anyhow!(
                "server_url must start with http://, https://, ws:// or wss://"
            ));
        };
        let mut url = Url::parse(&format!("{ws_base}/socket/websocket"))
            .with_context(|| format!("invalid server url: {ws_base}"))?;
        url.query_pairs_mut().append_pair("topic", &self.topic);
        Ok(url.to_string())
    }
}

#[async_trait]
impl Channel for WebSocketChannel {
    fn topic(&self) -> &str {
        &self.topic
    }

    async fn connect(&self) -> Result<()> {
        let mut inner = self.inner.lock().await;
        if inner.started {
            return Ok(());
        }

        let endpoint = self.endpoint()?;
        let (stream, _) = connect_async(endpoint.as_str()).await.map_err(|err| {
            self.connected.send_replace(false);
            SyncError::Connect {
                topic: self.topic.clone(),
                message: err.to_string(),
            }
        })?;
        let (writer, mut reader) = stream.split();

        inner.writer = Some(writer);
        inner.started = true;
        self.connected.send_replace(true);
        info!(topic = %self.topic, "channel: joined");

        let topic = self.topic.clone();
        let events = self.events.clone();
        let connected = self.connected.clone();
        let shared_inner = Arc::clone(&self.inner);
        inner.reader_task = Some(tokio::spawn(async move {
            while let Some(message) = reader.next().await {
                match message {
                    Ok(Message::Text(text)) => match serde_json::from_str::<ServerEvent>(&text) {
                        Ok(event) => {
                            let _ = events.send(event);
                        }
                        Err(err) => {
                            warn!(topic = %topic, "channel: dropping malformed frame: {err}");
                        }
                    },
                    Ok(Message::Close(_)) => break,
                    Ok(_) => {}
                    Err(err) => {
                        warn!(topic = %topic, "channel: receive failed: {err}");
                        break;
                    }
                }
            }
            connected.send_replace(false);
            let mut guard = shared_inner.lock().await;
            guard.started = false;
            guard.writer = None;
            info!(topic = %topic, "channel: closed by peer");
        }));

        Ok(())
    }

    fn subscribe(&self) -> broadcast::Receiver<ServerEvent> {
        self.events.subscribe()
    }

    async fn publish(&self, envelope: &ClientEnvelope) -> Result<()> {
        let json = serde_json::to_string(envelope).context("failed to encode outbound frame")?;
        let mut inner = self.inner.lock().await;
        let writer = inner.writer.as_mut().ok_or_else(|| SyncError::NotConnected {
            topic: self.topic.clone(),
        })?;
        writer
            .send(Message::Text(json))
            .await
            .map_err(|err| SyncError::Publish {
                event: envelope.request.event_name(),
                message: err.to_string(),
            })?;
        Ok(())
    }

    async fn leave(&self) {
        let mut inner = self.inner.lock().await;
        if let Some(task) = inner.reader_task.take() {
            task.abort();
        }
        if let Some(mut writer) = inner.writer.take() {
            let _ = writer.send(Message::Close(None)).await;
        }
        if inner.started {
            info!(topic = %self.topic, "channel: left");
        }
        inner.started = false;
        self.connected.send_replace(false);
    }

    fn connectivity(&self) -> watch::Receiver<bool> {
        self.connected.subscribe()
    }
}

pub struct WebSocketChannelFactory {
    server_url: String,
}

impl WebSocketChannelFactory {
    pub fn new(server_url: impl Into<String>) -> Self {
        Self {
            server_url: server_url.into(),
        }
    }
}

impl ChannelFactory for WebSocketChannelFactory {
    fn create(&self, topic: &str) -> Arc<dyn Channel> {
        Arc::new(WebSocketChannel::new(self.server_url.clone(), topic))
    }
}
