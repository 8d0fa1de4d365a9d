//! Client-side real-time synchronization for the mystery-generation backend.
//!
//! Two consumer surfaces sit on top of topic-scoped channels:
//! [`JobManagementClient`] mirrors a server-owned snapshot and issues
//! fire-and-forget actions, and [`JobQueueMonitor`] reconciles incremental
//! job updates into bounded `{running, completed}` collections. Channels are
//! shared through the reference-counted [`ConnectionLifecycleManager`].

use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc, Mutex as StdMutex, MutexGuard,
};

use anyhow::Result;
use shared::{
    domain::{Difficulty, JobId, UserId},
    protocol::{ClientEnvelope, ClientRequest, JobQueueData, ServerEvent, Snapshot},
};
use tokio::{
    sync::{broadcast, watch},
    task::JoinHandle,
};
use tokio_stream::wrappers::BroadcastStream;
use tracing::{debug, warn};

pub mod correlator;
pub mod error;
pub mod lifecycle;
pub mod reconciler;
pub mod state_mirror;
pub mod transport;

pub use correlator::{CorrelatorConfig, PendingReply, RequestCorrelator};
pub use error::{ReplyError, SyncError};
pub use lifecycle::{ChannelHandle, ConnectionLifecycleManager};
pub use reconciler::{
    JobQueueReconciler, JobTransition, ReconcilerConfig, DEFAULT_COMPLETED_CAPACITY,
};
pub use state_mirror::StateMirror;
pub use transport::{Channel, ChannelFactory, WebSocketChannel, WebSocketChannelFactory};

pub(crate) const EVENT_BUFFER: usize = 1024;

/// Topic carrying one user's job stream.
pub fn job_topic(user_id: UserId) -> String {
    format!("job_updates:{}", user_id.0)
}

pub(crate) fn lock<T>(mutex: &StdMutex<T>) -> MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

/// Snapshot view plus typed actions over one live-state channel. The
/// synchronous Ok of every action means the local send was accepted; job
/// creation, cancellation, or rejection is reported later through the job
/// stream, never through these return values.
pub struct JobManagementClient {
    mirror: StateMirror,
}

impl JobManagementClient {
    pub fn new(channel: ChannelHandle) -> Self {
        Self {
            mirror: StateMirror::new(channel),
        }
    }

    pub fn with_config(channel: ChannelHandle, config: CorrelatorConfig) -> Self {
        Self {
            mirror: StateMirror::with_config(channel, config),
        }
    }

    pub async fn connect(&self) -> Result<()> {
        self.mirror.connect().await
    }

    pub fn state(&self) -> Snapshot {
        self.mirror.snapshot()
    }

    pub fn subscribe_state(&self) -> watch::Receiver<Snapshot> {
        self.mirror.subscribe_snapshot()
    }

    pub fn is_connected(&self) -> bool {
        self.mirror.is_connected()
    }

    /// Correlated publish for callers that want the reply payload.
    pub async fn push_event(&self, request: ClientRequest) -> Result<PendingReply> {
        self.mirror.push_event(request).await
    }

    pub async fn generate_mystery(
        &self,
        theme: Option<String>,
        difficulty: Difficulty,
    ) -> Result<()> {
        self.mirror
            .publish(ClientRequest::GenerateMystery { theme, difficulty })
            .await
    }

    pub async fn cancel_job(&self, job_id: JobId) -> Result<()> {
        self.mirror.publish(ClientRequest::CancelJob { job_id }).await
    }

    pub async fn refresh_jobs(&self) -> Result<()> {
        self.mirror.publish(ClientRequest::RefreshJobs {}).await
    }

    pub async fn get_job_status(&self, job_id: JobId) -> Result<()> {
        self.mirror
            .publish(ClientRequest::GetJobStatus { job_id })
            .await
    }
}

#[derive(Debug, Clone)]
pub enum JobQueueEvent {
    /// The collections were replaced wholesale from an `initial_jobs` event.
    Replaced,
    Updated {
        job_id: JobId,
        transition: JobTransition,
    },
    ConnectionChanged(bool),
    Error(String),
}

#[derive(Debug, Clone, Default)]
pub struct MonitorConfig {
    pub reconciler: ReconcilerConfig,
    /// Publish one `get_jobs` when an update references an id we do not
    /// hold, instead of only dropping it. Off by default: the server sends
    /// `initial_jobs` before deltas, so an unknown id is normally stale.
    pub refresh_on_unknown: bool,
}

#[derive(Default)]
struct MonitorInner {
    started: bool,
    dispatch_task: Option<JoinHandle<()>>,
}

struct MonitorState {
    refresh_on_unknown: bool,
    refresh_inflight: AtomicBool,
    reconciler: StdMutex<JobQueueReconciler>,
    last_error: StdMutex<Option<String>>,
    events: broadcast::Sender<JobQueueEvent>,
}

impl MonitorState {
    async fn handle_event(&self, channel: &ChannelHandle, topic: &str, event: ServerEvent) {
        match event {
            ServerEvent::InitialJobs { running, completed } => {
                lock(&self.reconciler).replace(JobQueueData { running, completed });
                self.refresh_inflight.store(false, Ordering::SeqCst);
                let _ = self.events.send(JobQueueEvent::Replaced);
            }
            ServerEvent::JobUpdate(update) => {
                let transition = lock(&self.reconciler).apply(&update);
                if let Some(error) = &update.error {
                    *lock(&self.last_error) = Some(error.clone());
                }
                let _ = self.events.send(JobQueueEvent::Updated {
                    job_id: update.job_id,
                    transition,
                });
                if transition == JobTransition::Unknown {
                    warn!(topic = %topic, job_id = update.job_id.0, "job monitor: update for unknown job");
                    self.maybe_refresh(channel, topic).await;
                }
            }
            ServerEvent::Error(error) => {
                *lock(&self.last_error) = Some(error.message.clone());
                let _ = self.events.send(JobQueueEvent::Error(error.message));
            }
            ServerEvent::StateChanged { .. } | ServerEvent::Reply { .. } => {
                debug!(topic = %topic, "job monitor: ignoring state-channel event");
            }
        }
    }

    /// At most one refresh is in flight until the next `initial_jobs` lands.
    async fn maybe_refresh(&self, channel: &ChannelHandle, topic: &str) {
        if !self.refresh_on_unknown {
            return;
        }
        if self.refresh_inflight.swap(true, Ordering::SeqCst) {
            return;
        }
        if let Err(err) = channel
            .publish(&ClientEnvelope::new(ClientRequest::GetJobs {}))
            .await
        {
            self.refresh_inflight.store(false, Ordering::SeqCst);
            warn!(topic = %topic, "job monitor: refresh after unknown job failed: {err}");
        }
    }
}

async fn run_monitor_dispatch(
    state: Arc<MonitorState>,
    channel: ChannelHandle,
    mut events: broadcast::Receiver<ServerEvent>,
    mut connectivity: watch::Receiver<bool>,
) {
    let topic = channel.topic().to_string();
    let mut watch_open = true;
    loop {
        tokio::select! {
            event = events.recv() => match event {
                Ok(event) => state.handle_event(&channel, &topic, event).await,
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!(topic = %topic, skipped, "job monitor: event stream lagged");
                }
                Err(broadcast::error::RecvError::Closed) => break,
            },
            changed = connectivity.changed(), if watch_open => match changed {
                Ok(()) => {
                    let connected = *connectivity.borrow();
                    let _ = state.events.send(JobQueueEvent::ConnectionChanged(connected));
                }
                Err(_) => watch_open = false,
            },
        }
    }
}

/// Maintains the `{running, completed}` collections for one user's job
/// stream and surfaces them to consumers.
pub struct JobQueueMonitor {
    channel: ChannelHandle,
    state: Arc<MonitorState>,
    inner: StdMutex<MonitorInner>,
}

impl JobQueueMonitor {
    pub fn new(channel: ChannelHandle) -> Self {
        Self::with_config(channel, MonitorConfig::default())
    }

    pub fn with_config(channel: ChannelHandle, config: MonitorConfig) -> Self {
        let (events, _) = broadcast::channel(EVENT_BUFFER);
        Self {
            channel,
            state: Arc::new(MonitorState {
                refresh_on_unknown: config.refresh_on_unknown,
                refresh_inflight: AtomicBool::new(false),
                reconciler: StdMutex::new(JobQueueReconciler::new(config.reconciler)),
                last_error: StdMutex::new(None),
                events,
            }),
            inner: StdMutex::new(MonitorInner::default()),
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
        let events = self.channel.subscribe();
        let connectivity = self.channel.connectivity();
        inner.dispatch_task = Some(tokio::spawn(run_monitor_dispatch(
            Arc::clone(&self.state),
            self.channel.clone(),
            events,
            connectivity,
        )));
        inner.started = true;
        Ok(())
    }

    /// Current collections, cloned at the observation point.
    pub fn jobs(&self) -> JobQueueData {
        lock(&self.state.reconciler).jobs().clone()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<JobQueueEvent> {
        self.state.events.subscribe()
    }

    pub fn event_stream(&self) -> BroadcastStream<JobQueueEvent> {
        BroadcastStream::new(self.subscribe())
    }

    pub fn is_connected(&self) -> bool {
        *self.channel.connectivity().borrow()
    }

    /// Most recent error reported on this stream, local or remote.
    pub fn last_error(&self) -> Option<String> {
        lock(&self.state.last_error).clone()
    }

    pub async fn cancel_job(&self, job_id: JobId) -> Result<()> {
        self.channel
            .publish(&ClientEnvelope::new(ClientRequest::CancelJob { job_id }))
            .await
    }

    pub async fn refresh_jobs(&self) -> Result<()> {
        self.channel
            .publish(&ClientEnvelope::new(ClientRequest::GetJobs {}))
            .await
    }
}

impl Drop for JobQueueMonitor {
    fn drop(&mut self) {
        if let Some(task) = lock(&self.inner).dispatch_task.take() {
            task.abort();
        }
    }
}

#[cfg(test)]
mod tests;
