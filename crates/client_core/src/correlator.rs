use std::{
    collections::{HashMap, VecDeque},
    sync::Mutex,
    time::{Duration, Instant},
};

use serde_json::Value;
use shared::domain::RequestId;
use tokio::sync::oneshot;
use tracing::warn;

use crate::{error::ReplyError, lock};

#[derive(Debug, Clone, Default)]
pub struct CorrelatorConfig {
    /// Expire pending requests after this long. None (the default) keeps a
    /// slot open until a reply arrives or the awaitable is dropped; callers
    /// wanting a deadline of their own use [`PendingReply::deadline`].
    pub reply_timeout: Option<Duration>,
}

struct PendingSlot {
    tx: oneshot::Sender<Result<Value, ReplyError>>,
    issued_at: Instant,
}

#[derive(Default)]
struct PendingState {
    slots: HashMap<RequestId, PendingSlot>,
    /// Issue order, oldest first, for replies that carry no id. Entries may
    /// be stale; they are skipped lazily on resolve.
    order: VecDeque<RequestId>,
}

/// Awaitable side of one outstanding publish.
pub struct PendingReply {
    request_id: RequestId,
    rx: oneshot::Receiver<Result<Value, ReplyError>>,
}

impl PendingReply {
    pub fn request_id(&self) -> RequestId {
        self.request_id
    }

    /// Wait for the correlated reply. With no `reply_timeout` configured this
    /// waits forever if the peer never answers.
    pub async fn wait(self) -> Result<Value, ReplyError> {
        match self.rx.await {
            Ok(outcome) => outcome,
            Err(_) => Err(ReplyError::Abandoned),
        }
    }

    /// Wait, giving up after `limit`.
    pub async fn deadline(self, limit: Duration) -> Result<Value, ReplyError> {
        match tokio::time::timeout(limit, self.wait()).await {
            Ok(outcome) => outcome,
            Err(_) => Err(ReplyError::TimedOut),
        }
    }
}

/// Matches replies to the publishes that caused them via explicit request
/// ids. One correlator per channel.
pub struct RequestCorrelator {
    config: CorrelatorConfig,
    pending: Mutex<PendingState>,
}

impl RequestCorrelator {
    pub fn new(config: CorrelatorConfig) -> Self {
        Self {
            config,
            pending: Mutex::new(PendingState::default()),
        }
    }

    /// Open a slot for the reply. Callers must register BEFORE publishing so
    /// a near-synchronous reply is not missed.
    pub fn register(&self) -> (RequestId, PendingReply) {
        let request_id = RequestId::generate();
        let (tx, rx) = oneshot::channel();
        let mut pending = lock(&self.pending);
        Self::sweep(&mut pending, self.config.reply_timeout);
        pending.slots.insert(
            request_id,
            PendingSlot {
                tx,
                issued_at: Instant::now(),
            },
        );
        pending.order.push_back(request_id);
        (request_id, PendingReply { request_id, rx })
    }

    /// Complete the matching awaitable. A reply carrying no id resolves the
    /// oldest outstanding request; a reply matching nothing is dropped.
    /// Returns whether a slot was completed.
    pub fn resolve(&self, request_id: Option<RequestId>, response: Value) -> bool {
        let mut pending = lock(&self.pending);
        Self::sweep(&mut pending, self.config.reply_timeout);
        let slot = match request_id {
            Some(id) => {
                let slot = pending.slots.remove(&id);
                if slot.is_none() {
                    warn!(request_id = %id.0, "correlator: reply for unknown request dropped");
                }
                slot
            }
            None => loop {
                let Some(id) = pending.order.pop_front() else {
                    warn!("correlator: reply with no pending request dropped");
                    break None;
                };
                if let Some(slot) = pending.slots.remove(&id) {
                    break Some(slot);
                }
            },
        };
        match slot {
            Some(slot) => {
                let _ = slot.tx.send(Ok(response));
                true
            }
            None => false,
        }
    }

    /// Discard a slot whose publish failed locally.
    pub fn abandon(&self, request_id: RequestId) {
        lock(&self.pending).slots.remove(&request_id);
    }

    pub fn outstanding(&self) -> usize {
        lock(&self.pending).slots.len()
    }

    fn sweep(pending: &mut PendingState, reply_timeout: Option<Duration>) {
        let Some(limit) = reply_timeout else {
            return;
        };
        let expired: Vec<RequestId> = pending
            .slots
            .iter()
            .filter(|(_, slot)| slot.issued_at.elapsed() > limit)
            .map(|(id, _)| *id)
            .collect();
        for id in expired {
            if let Some(slot) = pending.slots.remove(&id) {
                let _ = slot.tx.send(Err(ReplyError::TimedOut));
            }
        }
    }
}
