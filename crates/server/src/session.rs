//! Per-session negotiation state and candidate buffering.
//!
//! Every session moves through a small state machine: `Waiting` (no media
//! resources yet, candidates buffer), `Negotiating` (a start is in flight),
//! `Established` (endpoint live, candidates forward directly), and `Closed`
//! (tombstone left behind so stale handles notice teardown). The registry
//! and the candidate queue share one lock per session, so "queue or
//! forward" and "install and drain" are single atomic decisions.
//!
//! A negotiation is identified by the ticket `begin` hands out; `commit`
//! and `abort` only act while that ticket still matches the entry. That is
//! what lets a stopped-but-uncommitted session be reclaimed by a new start:
//! the superseded task finds its stale ticket at commit and backs out.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use mediagate_protocol::IceCandidate;
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, warn};
use uuid::Uuid;

use crate::backend::{BackendError, EndpointHandle, PipelineHandle};

/// The media objects backing one established session.
#[derive(Clone)]
pub struct SessionRecord {
    pub pipeline: PipelineHandle,
    pub endpoint: EndpointHandle,
}

#[derive(Debug, Clone, thiserror::Error)]
pub enum SessionError {
    #[error("negotiation already in progress for this session")]
    NegotiationInFlight,
    #[error("session already established; send stop before a new start")]
    AlreadyEstablished,
}

/// Identifies one negotiation attempt for a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NegotiationToken(u64);

/// How an in-flight negotiation was cancelled.
#[derive(Debug, Clone, Copy)]
enum Cancel {
    /// Explicit stop message. The client is still connected and may start
    /// again, so the entry stays (and is reclaimable by a new start).
    Stop,
    /// The signaling channel went away. Nothing can reach this session
    /// again, so the entry is tombstoned once the in-flight task observes
    /// the cancellation.
    Close,
}

enum EntryState {
    /// No negotiation yet (or a previous one failed). Candidates buffer.
    Waiting { queued: Vec<IceCandidate> },
    /// A start is in flight. Candidates keep buffering; `cancel` is set by
    /// a concurrent stop or channel close and observed at commit/abort.
    Negotiating {
        queued: Vec<IceCandidate>,
        cancel: Option<Cancel>,
        token: NegotiationToken,
    },
    Established { record: SessionRecord },
    /// Tombstone: the entry was torn down while someone held its Arc.
    Closed,
}

/// Outcome of committing a finished negotiation.
#[derive(Debug, PartialEq)]
pub enum CommitOutcome {
    Committed,
    /// The session was stopped, closed, or superseded mid-negotiation; the
    /// caller must release the media resources it built and send nothing
    /// to the client.
    Cancelled,
}

/// Registry of all live sessions, keyed by the gateway session id.
#[derive(Default)]
pub struct Sessions {
    entries: RwLock<HashMap<Uuid, Arc<Mutex<EntryState>>>>,
    next_token: AtomicU64,
}

impl Sessions {
    pub fn new() -> Self {
        Self::default()
    }

    fn mint(&self) -> NegotiationToken {
        NegotiationToken(self.next_token.fetch_add(1, Ordering::Relaxed))
    }

    /// Get or create the entry for `id`. Callers must re-check for the
    /// `Closed` tombstone after locking: teardown may have raced the map
    /// lookup, in which case they retry with a fresh entry.
    async fn entry_arc(&self, id: Uuid) -> Arc<Mutex<EntryState>> {
        if let Some(entry) = self.entries.read().await.get(&id) {
            return Arc::clone(entry);
        }
        let mut entries = self.entries.write().await;
        Arc::clone(entries.entry(id).or_insert_with(|| {
            Arc::new(Mutex::new(EntryState::Waiting { queued: Vec::new() }))
        }))
    }

    /// Remove `id` from the map, but only if it still points at `stale`.
    /// A concurrent start may already have replaced the entry.
    async fn retire(&self, id: Uuid, stale: &Arc<Mutex<EntryState>>) {
        let mut entries = self.entries.write().await;
        if let Some(current) = entries.get(&id) {
            if Arc::ptr_eq(current, stale) {
                entries.remove(&id);
            }
        }
    }

    /// Route a candidate from the client: forward it if the session is
    /// established, buffer it otherwise.
    pub async fn add_candidate(
        &self,
        id: Uuid,
        candidate: IceCandidate,
    ) -> Result<(), BackendError> {
        loop {
            let arc = self.entry_arc(id).await;
            let mut state = arc.lock().await;
            match &mut *state {
                EntryState::Waiting { queued } | EntryState::Negotiating { queued, .. } => {
                    queued.push(candidate);
                    return Ok(());
                }
                EntryState::Established { record } => {
                    let endpoint = record.endpoint.clone();
                    drop(state);
                    return endpoint.add_ice_candidate(&candidate).await;
                }
                EntryState::Closed => {
                    drop(state);
                    self.retire(id, &arc).await;
                }
            }
        }
    }

    /// Claim the session for a new negotiation, taking any buffered
    /// candidates into the in-flight queue. A negotiation that was stopped
    /// but has not yet committed is superseded rather than rejected.
    pub async fn begin(&self, id: Uuid) -> Result<NegotiationToken, SessionError> {
        loop {
            let arc = self.entry_arc(id).await;
            let mut state = arc.lock().await;
            match &mut *state {
                EntryState::Waiting { queued } => {
                    let queued = std::mem::take(queued);
                    let token = self.mint();
                    *state = EntryState::Negotiating {
                        queued,
                        cancel: None,
                        token,
                    };
                    return Ok(token);
                }
                EntryState::Negotiating {
                    cancel: Some(Cancel::Stop),
                    ..
                } => {
                    // The stop already cleared the queue; the old task's
                    // stale token makes its commit a no-op.
                    let token = self.mint();
                    *state = EntryState::Negotiating {
                        queued: Vec::new(),
                        cancel: None,
                        token,
                    };
                    return Ok(token);
                }
                EntryState::Negotiating { .. } => return Err(SessionError::NegotiationInFlight),
                EntryState::Established { .. } => return Err(SessionError::AlreadyEstablished),
                EntryState::Closed => {
                    drop(state);
                    self.retire(id, &arc).await;
                }
            }
        }
    }

    /// Install the finished negotiation's media objects and drain every
    /// buffered candidate to the endpoint, in arrival order, before any
    /// later candidate can observe the established state.
    pub async fn commit(
        &self,
        id: Uuid,
        token: NegotiationToken,
        record: SessionRecord,
    ) -> CommitOutcome {
        let arc = self.entry_arc(id).await;
        let mut state = arc.lock().await;
        let queued = match &mut *state {
            EntryState::Negotiating {
                queued,
                cancel,
                token: current,
            } if *current == token => match cancel {
                Some(Cancel::Stop) => {
                    *state = EntryState::Waiting { queued: Vec::new() };
                    return CommitOutcome::Cancelled;
                }
                Some(Cancel::Close) => {
                    *state = EntryState::Closed;
                    drop(state);
                    self.retire(id, &arc).await;
                    return CommitOutcome::Cancelled;
                }
                None => std::mem::take(queued),
            },
            // Superseded, tombstoned, or otherwise clobbered while we
            // negotiated.
            _ => return CommitOutcome::Cancelled,
        };

        let endpoint = record.endpoint.clone();
        *state = EntryState::Established { record };
        debug!(session = %id, buffered = queued.len(), "Draining buffered candidates");
        for candidate in queued {
            if let Err(e) = endpoint.add_ice_candidate(&candidate).await {
                warn!(session = %id, "Dropping buffered candidate: {e}");
            }
        }
        CommitOutcome::Committed
    }

    /// Roll back a failed negotiation. Candidates buffered so far survive
    /// for a retry, unless the channel already went away.
    pub async fn abort(&self, id: Uuid, token: NegotiationToken) {
        let arc = self.entry_arc(id).await;
        let mut state = arc.lock().await;
        if let EntryState::Negotiating {
            queued,
            cancel,
            token: current,
        } = &mut *state
        {
            if *current != token {
                return;
            }
            if matches!(cancel, Some(Cancel::Close)) {
                *state = EntryState::Closed;
                drop(state);
                self.retire(id, &arc).await;
                return;
            }
            let queued = std::mem::take(queued);
            *state = EntryState::Waiting { queued };
        }
    }

    /// Handle an explicit stop. Returns the record to release when one was
    /// installed; a stop that lands mid-negotiation instead flags the entry
    /// as cancelled and lets the negotiating task release its own objects.
    /// The entry itself survives so the client can start again.
    pub async fn stop(&self, id: Uuid) -> Option<SessionRecord> {
        self.cancel_or_take(id, Cancel::Stop).await
    }

    /// Tear the session down because its signaling channel is gone. Like
    /// `stop`, but nothing can reach the session again, so the entry is
    /// retired (immediately, or at the in-flight task's commit/abort).
    pub async fn close(&self, id: Uuid) -> Option<SessionRecord> {
        self.cancel_or_take(id, Cancel::Close).await
    }

    async fn cancel_or_take(&self, id: Uuid, cancel: Cancel) -> Option<SessionRecord> {
        let arc = {
            let entries = self.entries.read().await;
            Arc::clone(entries.get(&id)?)
        };
        let mut state = arc.lock().await;
        match &mut *state {
            EntryState::Established { record } => {
                let record = record.clone();
                *state = EntryState::Closed;
                drop(state);
                self.retire(id, &arc).await;
                Some(record)
            }
            EntryState::Negotiating {
                queued,
                cancel: pending,
                ..
            } => {
                queued.clear();
                // A close supersedes an earlier stop; never the reverse.
                if !matches!(pending, Some(Cancel::Close)) {
                    *pending = Some(cancel);
                }
                None
            }
            EntryState::Waiting { .. } => {
                *state = EntryState::Closed;
                drop(state);
                self.retire(id, &arc).await;
                None
            }
            EntryState::Closed => None,
        }
    }

    /// The established record for `id`, if any.
    pub async fn record(&self, id: Uuid) -> Option<SessionRecord> {
        let arc = {
            let entries = self.entries.read().await;
            Arc::clone(entries.get(&id)?)
        };
        let state = arc.lock().await;
        match &*state {
            EntryState::Established { record } => Some(record.clone()),
            _ => None,
        }
    }

    #[cfg(test)]
    pub(crate) async fn len(&self) -> usize {
        self.entries.read().await.len()
    }
}
