//! Per-user routing state.
//!
//! One `UserSession` per sender, created lazily and kept for the process
//! lifetime. Inbound messages of one sender pass through the session's lane
//! and are handled one at a time in arrival order. Every mutation of the
//! queue, the waiting flag and the debounce handle happens under the
//! session's own state mutex.

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use rb_backend::{Backend, BackendClient, BackendConfig, RetryPolicy};
use rb_channels::{InboundMessage, SenderId, ThreadId};
use std::sync::Arc;
use tokio::sync::{Mutex, MutexGuard, mpsc};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

/// Builds the backend handles a new session owns.
pub trait BackendFactory: Send + Sync {
    fn classifier(&self) -> Arc<dyn Backend>;
    fn escalation(&self) -> Arc<dyn Backend>;
}

/// Hands out HTTP backend clients sharing one connection pool.
pub struct HttpBackendFactory {
    http: reqwest::Client,
    classifier: BackendConfig,
    escalation: BackendConfig,
    retry: RetryPolicy,
}

impl HttpBackendFactory {
    pub fn new(
        http: reqwest::Client,
        classifier: BackendConfig,
        escalation: BackendConfig,
    ) -> Self {
        Self {
            http,
            classifier,
            escalation,
            retry: RetryPolicy::default(),
        }
    }
}

impl BackendFactory for HttpBackendFactory {
    fn classifier(&self) -> Arc<dyn Backend> {
        Arc::new(
            BackendClient::new(self.http.clone(), self.classifier.clone())
                .with_retry_policy(self.retry),
        )
    }

    fn escalation(&self) -> Arc<dyn Backend> {
        Arc::new(
            BackendClient::new(self.http.clone(), self.escalation.clone())
                .with_retry_policy(self.retry),
        )
    }
}

pub struct UserSession {
    user_id: SenderId,
    session_id: Uuid,
    created_at: DateTime<Utc>,
    classifier: Arc<dyn Backend>,
    escalation: Arc<dyn Backend>,
    lane: mpsc::UnboundedSender<InboundMessage>,
    /// Receiving end of `lane` until a worker claims it.
    lane_rx: std::sync::Mutex<Option<mpsc::UnboundedReceiver<InboundMessage>>>,
    state: Mutex<SessionState>,
}

impl UserSession {
    fn new(user_id: SenderId, backends: &dyn BackendFactory) -> Self {
        let created_at = Utc::now();
        let (lane, lane_rx) = mpsc::unbounded_channel();
        Self {
            user_id,
            session_id: Uuid::new_v4(),
            created_at,
            classifier: backends.classifier(),
            escalation: backends.escalation(),
            lane,
            lane_rx: std::sync::Mutex::new(Some(lane_rx)),
            state: Mutex::new(SessionState::new(created_at)),
        }
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    /// Queue a message for this sender's worker.
    pub fn push_inbound(
        &self,
        inbound: InboundMessage,
    ) -> Result<(), mpsc::error::SendError<InboundMessage>> {
        self.lane.send(inbound)
    }

    /// Hands out the lane receiver exactly once; later calls get `None`.
    pub fn claim_lane(&self) -> Option<mpsc::UnboundedReceiver<InboundMessage>> {
        self.lane_rx.lock().ok()?.take()
    }

    pub fn user_id(&self) -> &SenderId {
        &self.user_id
    }

    pub fn session_id(&self) -> Uuid {
        self.session_id
    }

    pub fn classifier(&self) -> &dyn Backend {
        self.classifier.as_ref()
    }

    pub fn escalation(&self) -> &dyn Backend {
        self.escalation.as_ref()
    }

    pub async fn lock(&self) -> MutexGuard<'_, SessionState> {
        self.state.lock().await
    }
}

/// Outstanding debounce timer. The generation tells a woken timer whether it
/// has been superseded even if its cancellation raced with the wake-up.
#[derive(Debug)]
struct DebounceHandle {
    generation: u64,
    token: CancellationToken,
}

#[derive(Debug)]
pub struct SessionState {
    pub reply_to: Option<ThreadId>,
    pub last_active: DateTime<Utc>,
    pending: Vec<String>,
    waiting: bool,
    last_signal_at: Option<Instant>,
    debounce: Option<DebounceHandle>,
    next_generation: u64,
}

impl SessionState {
    fn new(now: DateTime<Utc>) -> Self {
        Self {
            reply_to: None,
            last_active: now,
            pending: Vec::new(),
            waiting: false,
            last_signal_at: None,
            debounce: None,
            next_generation: 0,
        }
    }

    pub fn pending(&self) -> &[String] {
        &self.pending
    }

    pub fn is_waiting(&self) -> bool {
        self.waiting
    }

    pub fn last_signal_at(&self) -> Option<Instant> {
        self.last_signal_at
    }

    pub fn enqueue(&mut self, text: impl Into<String>) {
        self.pending.push(text.into());
    }

    /// Hand the whole queue to the caller, leaving it empty.
    pub fn take_pending(&mut self) -> Vec<String> {
        std::mem::take(&mut self.pending)
    }

    /// Cancel the outstanding timer, if any, and leave the waiting state.
    pub fn cancel_debounce(&mut self) -> bool {
        self.waiting = false;
        match self.debounce.take() {
            Some(handle) => {
                handle.token.cancel();
                true
            }
            None => false,
        }
    }

    /// Replace any outstanding timer with a fresh one signalled at `now`.
    /// Returns the generation and token the new timer task must carry.
    pub fn arm_debounce(
        &mut self,
        parent: &CancellationToken,
        now: Instant,
    ) -> (u64, CancellationToken) {
        self.cancel_debounce();
        self.next_generation += 1;
        let generation = self.next_generation;
        let token = parent.child_token();
        self.debounce = Some(DebounceHandle {
            generation,
            token: token.clone(),
        });
        self.waiting = true;
        self.last_signal_at = Some(now);
        (generation, token)
    }

    pub fn is_current_debounce(&self, generation: u64) -> bool {
        self.debounce
            .as_ref()
            .is_some_and(|handle| handle.generation == generation)
    }

    /// Called by the timer that is about to fire; returns false if it was
    /// superseded in the meantime.
    pub fn complete_debounce(&mut self, generation: u64) -> bool {
        if !self.is_current_debounce(generation) {
            return false;
        }
        self.debounce = None;
        self.waiting = false;
        true
    }
}

/// Registry of every session, keyed by sender.
pub struct SessionRegistry {
    sessions: DashMap<SenderId, Arc<UserSession>>,
    backends: Arc<dyn BackendFactory>,
}

impl SessionRegistry {
    pub fn new(backends: Arc<dyn BackendFactory>) -> Self {
        Self {
            sessions: DashMap::new(),
            backends,
        }
    }

    pub fn get_or_create(&self, user_id: &SenderId) -> Arc<UserSession> {
        if let Some(existing) = self.sessions.get(user_id) {
            return Arc::clone(existing.value());
        }
        let session = self
            .sessions
            .entry(user_id.clone())
            .or_insert_with(|| {
                let session = UserSession::new(user_id.clone(), self.backends.as_ref());
                tracing::info!(
                    user_id = %user_id,
                    session_id = %session.session_id,
                    "session created"
                );
                Arc::new(session)
            });
        Arc::clone(session.value())
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    /// Point-in-time view of every session, oldest first.
    pub async fn summaries(&self) -> Vec<SessionSummary> {
        let sessions: Vec<Arc<UserSession>> = self
            .sessions
            .iter()
            .map(|entry| Arc::clone(entry.value()))
            .collect();
        let mut summaries = Vec::with_capacity(sessions.len());
        for session in sessions {
            let state = session.lock().await;
            summaries.push(SessionSummary {
                user_id: session.user_id.clone(),
                session_id: session.session_id,
                created_at: session.created_at,
                last_active: state.last_active,
                pending: state.pending.len(),
                waiting: state.waiting,
            });
        }
        summaries.sort_by_key(|summary| summary.created_at);
        summaries
    }
}

#[derive(Debug, Clone)]
pub struct SessionSummary {
    pub user_id: SenderId,
    pub session_id: Uuid,
    pub created_at: DateTime<Utc>,
    pub last_active: DateTime<Utc>,
    pub pending: usize,
    pub waiting: bool,
}
