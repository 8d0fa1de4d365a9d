use std::sync::{Arc, Mutex};

use anyhow::Result;
use shared::protocol::{ClientEnvelope, ClientRequest, ServerEvent, Snapshot};
use tokio::{
    sync::{broadcast, watch},
    task::JoinHandle,
};
use tracing::{debug, warn};

use crate::{
    correlator::{CorrelatorConfig, PendingReply, RequestCorrelator},
    lifecycle::ChannelHandle,
    lock,
};

#[derive(Default)]
struct MirrorInner {
    started: bool,
    dispatch_task: Option<JoinHandle<()>>,
}

/// Mirrors one channel's server-owned snapshot and correlates request/reply
/// pairs on it. The server is the sole authority: every `state-changed`
/// replaces the snapshot wholesale, last write wins.
pub struct StateMirror {
    channel: ChannelHandle,
    correlator: Arc<RequestCorrelator>,
    snapshot: watch::Sender<Snapshot>,
    inner: Mutex<MirrorInner>,
}

impl StateMirror {
    pub fn new(channel: ChannelHandle) -> Self {
        Self::with_config(channel, CorrelatorConfig::default())
    }

    pub fn with_config(channel: ChannelHandle, config: CorrelatorConfig) -> Self {
        let (snapshot, _) = watch::channel(Snapshot::default());
        Self {
            channel,
            correlator: Arc::new(RequestCorrelator::new(config)),
            snapshot,
            inner: Mutex::new(MirrorInner::default()),
        }
    }

    /// Join the channel and start dispatching. Safe to call on every consumer
    /// mount; only the first call subscribes.
    pub async fn connect(&self) -> Result<()> {
        if lock(&self.inner).started {
            return Ok(());
        }
        self.channel.connect().await?;

        let mut inner = lock(&self.inner);
        if inner.started {
            return Ok(());
        }
        let mut events = self.channel.subscribe();
        let snapshot = self.snapshot.clone();
        let correlator = Arc::clone(&self.correlator);
        let topic = self.channel.topic().to_string();
        inner.dispatch_task = Some(tokio::spawn(async move {
            loop {
                match events.recv().await {
                    Ok(ServerEvent::StateChanged { state }) => {
                        snapshot.send_replace(state);
                    }
                    Ok(ServerEvent::Reply {
                        request_id,
                        response,
                    }) => {
                        correlator.resolve(request_id, response);
                    }
                    Ok(_) => {
                        debug!(topic = %topic, "state mirror: ignoring job-stream event");
                    }
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!(topic = %topic, skipped, "state mirror: event stream lagged");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        }));
        inner.started = true;
        Ok(())
    }

    pub fn snapshot(&self) -> Snapshot {
        self.snapshot.borrow().clone()
    }

    /// Watch snapshot replacements without polling.
    pub fn subscribe_snapshot(&self) -> watch::Receiver<Snapshot> {
        self.snapshot.subscribe()
    }

    pub fn is_connected(&self) -> bool {
        *self.channel.connectivity().borrow()
    }

    /// Publish and get an awaitable for the correlated reply. The slot is
    /// registered before the send so a near-synchronous reply still lands.
    pub async fn push_event(&self, request: ClientRequest) -> Result<PendingReply> {
        let (request_id, reply) = self.correlator.register();
        let envelope = ClientEnvelope {
            request_id,
            request,
        };
        if let Err(err) = self.channel.publish(&envelope).await {
            self.correlator.abandon(request_id);
            return Err(err);
        }
        Ok(reply)
    }

    /// Fire-and-forget publish: Ok means the local send was accepted, nothing
    /// more. The remote outcome, if any, arrives later as an inbound event.
    pub async fn publish(&self, request: ClientRequest) -> Result<()> {
        self.channel.publish(&ClientEnvelope::new(request)).await
    }
}

impl Drop for StateMirror {
    fn drop(&mut self) {
        // Detaches this consumer's dispatch only; outstanding awaitables stay
        // unresolved and the channel itself lives as long as other handles.
        if let Some(task) = lock(&self.inner).dispatch_task.take() {
            task.abort();
        }
    }
}
