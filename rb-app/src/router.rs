//! Classification-driven routing with per-user debounce aggregation.
//!
//! Every inbound text is first shown to the classifier backend. Its verdict
//! decides what happens next:
//!
//! - a marker asking to wait queues the text and (re)arms the debounce timer;
//! - escalate and clarify markers flush the queue to the escalation backend
//!   right away, cancelling any armed timer;
//! - anything else is the answer itself and goes straight back to the chat.
//!
//! Messages enter through [`Router::submit`], which hands them to the
//! sender's lane. One worker per sender drains its lane, so a user's messages
//! are classified and queued strictly in arrival order even when the
//! classifier answers them at different speeds.
//!
//! The classifier and escalation calls run outside the session state lock.
//! Every queue or timer mutation runs inside it, so a debounce timer firing
//! while a message is being handled can never lose or duplicate a queued text.

use crate::sanitize::sanitize;
use crate::session::{SessionRegistry, UserSession};
use anyhow::Result;
use rb_channels::{ChannelAdapter, InboundMessage, OutboundMessage, ThreadId};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

pub const ESCALATE_MARKER: &str = "Спецзапрос";
pub const CLARIFY_MARKER: &str = "Уточнение";
pub const WAIT_MARKER: &str = "Ожидание";

pub const DEFAULT_DEBOUNCE_WINDOW: Duration = Duration::from_secs(10);

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Classification {
    Escalate,
    Clarify,
    Wait,
    /// Not a marker: the classifier already answered the user.
    Answer(String),
}

impl Classification {
    pub fn parse(raw: &str) -> Self {
        match raw.trim() {
            ESCALATE_MARKER => Self::Escalate,
            CLARIFY_MARKER => Self::Clarify,
            WAIT_MARKER => Self::Wait,
            _ => Self::Answer(raw.to_string()),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DebounceSettings {
    /// Quiet period after the last wait signal before the queue is flushed.
    pub window: Duration,
    /// How often a sleeping timer wakes up to re-check the window.
    pub check_interval: Duration,
}

impl DebounceSettings {
    pub fn fixed(window: Duration) -> Self {
        Self {
            window,
            check_interval: window,
        }
    }
}

impl Default for DebounceSettings {
    fn default() -> Self {
        Self::fixed(DEFAULT_DEBOUNCE_WINDOW)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RouteOutcome {
    Answered { delivered: bool },
    Queued { pending: usize },
    Flushed { delivered: bool },
}

pub struct Router {
    sessions: SessionRegistry,
    sink: Arc<dyn ChannelAdapter>,
    debounce: DebounceSettings,
    shutdown: CancellationToken,
}

impl Router {
    pub fn new(
        sessions: SessionRegistry,
        sink: Arc<dyn ChannelAdapter>,
        debounce: DebounceSettings,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            sessions,
            sink,
            debounce,
            shutdown,
        }
    }

    pub fn sessions(&self) -> &SessionRegistry {
        &self.sessions
    }

    /// Hand a message to its sender's lane, starting the lane worker on the
    /// sender's first message.
    pub fn submit(self: &Arc<Self>, inbound: InboundMessage) {
        let session = self.sessions.get_or_create(&inbound.sender_id);
        if let Some(lane) = session.claim_lane() {
            self.spawn_lane(Arc::clone(&session), lane);
        }
        if let Err(rejected) = session.push_inbound(inbound) {
            tracing::warn!(
                user_id = %session.user_id(),
                text = %rejected.0.content,
                "session lane closed; message dropped"
            );
        }
    }

    fn spawn_lane(
        self: &Arc<Self>,
        session: Arc<UserSession>,
        mut lane: mpsc::UnboundedReceiver<InboundMessage>,
    ) {
        let router = Arc::clone(self);
        tokio::spawn(async move {
            loop {
                let inbound = tokio::select! {
                    _ = router.shutdown.cancelled() => break,
                    inbound = lane.recv() => match inbound {
                        Some(inbound) => inbound,
                        None => break,
                    },
                };
                router.process(&inbound).await;
            }
            tracing::debug!(user_id = %session.user_id(), "session lane stopped");
        });
    }

    /// Failures stop here: they are logged and the message is dropped, the
    /// user gets no reply for it.
    async fn process(self: &Arc<Self>, inbound: &InboundMessage) {
        match self.handle_message(inbound).await {
            Ok(outcome) => {
                tracing::debug!(user_id = %inbound.sender_id, ?outcome, "message routed");
            }
            Err(e) => {
                tracing::warn!(
                    error = %e,
                    user_id = %inbound.sender_id,
                    text = %inbound.content,
                    "message handling failed; message dropped"
                );
            }
        }
    }

    /// Route one message. Callers must not run two of these for the same
    /// sender at once; `submit` guarantees that.
    #[tracing::instrument(
        level = "info",
        skip_all,
        fields(
            user_id = %inbound.sender_id,
            chat_id = %inbound.thread_id,
            message_id = %inbound.message_id
        )
    )]
    pub async fn handle_message(
        self: &Arc<Self>,
        inbound: &InboundMessage,
    ) -> Result<RouteOutcome> {
        let session = self.sessions.get_or_create(&inbound.sender_id);
        {
            let mut state = session.lock().await;
            state.reply_to = Some(inbound.thread_id.clone());
            state.last_active = chrono::Utc::now();
        }

        let session_id = session.session_id().to_string();
        let classifier = session.classifier();
        let verdict = classifier
            .call(&inbound.content, inbound.sender_id.as_str(), &session_id)
            .await;
        let classification = Classification::parse(&verdict);
        tracing::debug!(
            backend = classifier.name(),
            ?classification,
            %session_id,
            "message classified"
        );

        match classification {
            Classification::Answer(answer) => {
                let delivered = self.deliver(&inbound.thread_id, &answer).await?;
                Ok(RouteOutcome::Answered { delivered })
            }
            Classification::Wait => {
                let (generation, token, pending) = {
                    let mut state = session.lock().await;
                    state.enqueue(inbound.content.as_str());
                    let (generation, token) = state.arm_debounce(&self.shutdown, Instant::now());
                    (generation, token, state.pending().len())
                };
                tracing::debug!(pending, generation, "debounce timer armed");
                self.spawn_debounce(session, generation, token);
                Ok(RouteOutcome::Queued { pending })
            }
            Classification::Escalate => {
                self.flush_now(&session, inbound.content.clone(), &inbound.thread_id)
                    .await
            }
            Classification::Clarify => {
                let text = format!("{} {CLARIFY_MARKER}", inbound.content);
                self.flush_now(&session, text, &inbound.thread_id).await
            }
        }
    }

    /// Cancel any armed timer, append `text` and flush the whole queue in one
    /// critical section.
    async fn flush_now(
        &self,
        session: &UserSession,
        text: String,
        reply_to: &ThreadId,
    ) -> Result<RouteOutcome> {
        let batch = {
            let mut state = session.lock().await;
            if state.cancel_debounce() {
                tracing::debug!("pending debounce timer cancelled by immediate flush");
            }
            state.enqueue(text);
            state.take_pending()
        };
        self.flush(session, batch, reply_to).await
    }

    async fn flush(
        &self,
        session: &UserSession,
        batch: Vec<String>,
        reply_to: &ThreadId,
    ) -> Result<RouteOutcome> {
        if batch.is_empty() {
            return Ok(RouteOutcome::Flushed { delivered: false });
        }
        let question = batch.join(" ");
        let session_id = session.session_id().to_string();
        let escalation = session.escalation();
        tracing::info!(
            user_id = %session.user_id(),
            %session_id,
            backend = escalation.name(),
            batched = batch.len(),
            "flushing queued messages"
        );
        let answer = escalation
            .call(&question, session.user_id().as_str(), &session_id)
            .await;
        let delivered = self.deliver(reply_to, &answer).await?;
        if !delivered {
            tracing::debug!(
                user_id = %session.user_id(),
                "escalation backend returned no text; nothing delivered"
            );
        }
        Ok(RouteOutcome::Flushed { delivered })
    }

    async fn deliver(&self, reply_to: &ThreadId, answer: &str) -> Result<bool> {
        let text = sanitize(answer);
        if text.is_empty() {
            return Ok(false);
        }
        self.sink
            .send(reply_to.as_str(), OutboundMessage::text(text))
            .await
            .map_err(|e| anyhow::anyhow!("deliver reply to chat {reply_to}: {e}"))?;
        Ok(true)
    }

    fn spawn_debounce(
        self: &Arc<Self>,
        session: Arc<UserSession>,
        generation: u64,
        token: CancellationToken,
    ) {
        let router = Arc::clone(self);
        tokio::spawn(async move {
            router.run_debounce(session, generation, token).await;
        });
    }

    #[tracing::instrument(
        level = "debug",
        skip_all,
        fields(user_id = %session.user_id(), generation = generation)
    )]
    async fn run_debounce(
        &self,
        session: Arc<UserSession>,
        generation: u64,
        token: CancellationToken,
    ) {
        loop {
            tokio::select! {
                _ = token.cancelled() => {
                    tracing::debug!("debounce timer cancelled");
                    return;
                }
                _ = tokio::time::sleep(self.debounce.check_interval) => {}
            }

            let (batch, reply_to) = {
                let mut state = session.lock().await;
                if token.is_cancelled() || !state.is_current_debounce(generation) {
                    tracing::debug!("debounce timer superseded before firing");
                    return;
                }
                let quiet_for = state
                    .last_signal_at()
                    .map(|signalled| signalled.elapsed())
                    .unwrap_or(self.debounce.window);
                if quiet_for < self.debounce.window {
                    continue;
                }
                state.complete_debounce(generation);
                (state.take_pending(), state.reply_to.clone())
            };

            let Some(reply_to) = reply_to else {
                tracing::warn!(
                    dropped = batch.len(),
                    "debounce fired without a reply target; queued messages dropped"
                );
                return;
            };
            if let Err(e) = self.flush(&session, batch, &reply_to).await {
                tracing::warn!(%e, "debounced flush failed");
            }
            return;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{RecordingSink, ScriptedBackend, StaticBackends, text_message};
    use rb_channels::SenderId;

    struct Harness {
        router: Arc<Router>,
        backends: Arc<StaticBackends>,
        sink: Arc<RecordingSink>,
        shutdown: CancellationToken,
    }

    fn harness(backends: StaticBackends) -> Harness {
        harness_with_sink(backends, RecordingSink::default())
    }

    fn harness_with_sink(backends: StaticBackends, sink: RecordingSink) -> Harness {
        harness_with(backends, sink, DebounceSettings::default())
    }

    fn harness_with(
        backends: StaticBackends,
        sink: RecordingSink,
        debounce: DebounceSettings,
    ) -> Harness {
        let backends = Arc::new(backends);
        let sink = Arc::new(sink);
        let shutdown = CancellationToken::new();
        let router = Arc::new(Router::new(
            SessionRegistry::new(backends.clone()),
            sink.clone(),
            debounce,
            shutdown.clone(),
        ));
        Harness {
            router,
            backends,
            sink,
            shutdown,
        }
    }

    fn classifier_with(pairs: &[(&str, &str)]) -> ScriptedBackend {
        pairs
            .iter()
            .fold(ScriptedBackend::new("classifier", "ответ"), |b, (q, a)| {
                b.reply(q, a)
            })
    }

    async fn assert_idle(h: &Harness, user: &str) {
        let session = h.router.sessions().get_or_create(&SenderId::from(user));
        let state = session.lock().await;
        assert!(state.pending().is_empty(), "queue must be empty");
        assert!(!state.is_waiting(), "no timer may be armed");
    }

    #[test]
    fn markers_are_recognized_after_trimming() {
        assert_eq!(Classification::parse(" Ожидание\n"), Classification::Wait);
        assert_eq!(Classification::parse("Спецзапрос"), Classification::Escalate);
        assert_eq!(Classification::parse("\tУточнение "), Classification::Clarify);
        assert_eq!(
            Classification::parse("Ожидание ответа"),
            Classification::Answer("Ожидание ответа".to_string())
        );
    }

    #[tokio::test(start_paused = true)]
    async fn plain_answer_is_sanitized_and_delivered_directly() {
        let h = harness(StaticBackends::new(
            classifier_with(&[("привет", "**Здравствуйте!** #Чем помочь?")]),
            ScriptedBackend::new("escalation", "unused"),
        ));

        let outcome = h
            .router
            .handle_message(&text_message("u1", "chat-1", "привет"))
            .await
            .expect("handled");

        assert_eq!(outcome, RouteOutcome::Answered { delivered: true });
        assert_eq!(
            h.sink.sent(),
            vec![("chat-1".to_string(), "Здравствуйте! Чем помочь?".to_string())]
        );
        assert!(h.backends.escalation.calls().is_empty());
        assert_idle(&h, "u1").await;
    }

    #[tokio::test(start_paused = true)]
    async fn wait_markers_within_window_flush_once_in_arrival_order() {
        let h = harness(StaticBackends::new(
            ScriptedBackend::new("classifier", WAIT_MARKER),
            ScriptedBackend::new("escalation", "**Итог**"),
        ));

        for (i, text) in ["первое", "второе", "третье"].into_iter().enumerate() {
            if i > 0 {
                tokio::time::sleep(Duration::from_secs(5)).await;
            }
            let outcome = h
                .router
                .handle_message(&text_message("u1", "chat-1", text))
                .await
                .expect("handled");
            assert_eq!(outcome, RouteOutcome::Queued { pending: i + 1 });
        }

        // 9s after the last signal: the window has not elapsed yet.
        tokio::time::sleep(Duration::from_secs(9)).await;
        assert!(h.backends.escalation.calls().is_empty());
        assert!(h.sink.sent().is_empty());

        tokio::time::sleep(Duration::from_secs(2)).await;
        let calls = h.backends.escalation.calls();
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].question, "первое второе третье");
        assert_eq!(h.sink.sent(), vec![("chat-1".to_string(), "Итог".to_string())]);
        assert_idle(&h, "u1").await;

        tokio::time::sleep(Duration::from_secs(60)).await;
        assert_eq!(h.backends.escalation.calls().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn escalate_while_waiting_flushes_everything_once() {
        let h = harness(StaticBackends::new(
            classifier_with(&[("a", WAIT_MARKER), ("b", WAIT_MARKER), ("c", ESCALATE_MARKER)]),
            ScriptedBackend::new("escalation", "готово"),
        ));

        for text in ["a", "b"] {
            h.router
                .handle_message(&text_message("u1", "chat-1", text))
                .await
                .expect("handled");
        }
        tokio::time::sleep(Duration::from_secs(3)).await;
        let outcome = h
            .router
            .handle_message(&text_message("u1", "chat-1", "c"))
            .await
            .expect("handled");

        assert_eq!(outcome, RouteOutcome::Flushed { delivered: true });
        assert_idle(&h, "u1").await;

        tokio::time::sleep(Duration::from_secs(30)).await;
        let calls = h.backends.escalation.calls();
        assert_eq!(calls.len(), 1, "stale timer must not flush again");
        assert_eq!(calls[0].question, "a b c");
        assert_eq!(h.sink.sent().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn clarify_appends_marker_suffix_and_flushes() {
        let h = harness(StaticBackends::new(
            classifier_with(&[("a", WAIT_MARKER), ("что именно?", CLARIFY_MARKER)]),
            ScriptedBackend::new("escalation", "уточнено"),
        ));

        h.router
            .handle_message(&text_message("u1", "chat-1", "a"))
            .await
            .expect("handled");
        h.router
            .handle_message(&text_message("u1", "chat-1", "что именно?"))
            .await
            .expect("handled");

        tokio::time::sleep(Duration::from_secs(30)).await;
        let calls = h.backends.escalation.calls();
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].question, "a что именно? Уточнение");
    }

    #[tokio::test(start_paused = true)]
    async fn escalate_from_idle_sends_only_current_message() {
        let h = harness(StaticBackends::new(
            ScriptedBackend::new("classifier", ESCALATE_MARKER),
            ScriptedBackend::new("escalation", "ok"),
        ));

        h.router
            .handle_message(&text_message("u1", "chat-1", "срочно"))
            .await
            .expect("handled");

        let calls = h.backends.escalation.calls();
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].question, "срочно");
    }

    #[tokio::test(start_paused = true)]
    async fn session_id_is_stable_across_calls_and_backends() {
        let h = harness(StaticBackends::new(
            classifier_with(&[("x", WAIT_MARKER), ("y", ESCALATE_MARKER)]),
            ScriptedBackend::new("escalation", "ok"),
        ));

        for text in ["x", "y", "z"] {
            h.router
                .handle_message(&text_message("u1", "chat-1", text))
                .await
                .expect("handled");
        }
        h.router
            .handle_message(&text_message("u2", "chat-2", "z"))
            .await
            .expect("handled");

        let classifier_calls = h.backends.classifier.calls();
        let escalation_calls = h.backends.escalation.calls();
        let u1_sid = &classifier_calls[0].session_id;
        assert!(
            classifier_calls
                .iter()
                .filter(|c| c.user_id == "u1")
                .all(|c| &c.session_id == u1_sid)
        );
        assert!(escalation_calls.iter().all(|c| &c.session_id == u1_sid));
        let u2_call = classifier_calls
            .iter()
            .find(|c| c.user_id == "u2")
            .expect("u2 classified");
        assert_ne!(&u2_call.session_id, u1_sid);
    }

    #[tokio::test(start_paused = true)]
    async fn empty_escalation_answer_is_silently_dropped() {
        let h = harness(StaticBackends::new(
            ScriptedBackend::new("classifier", ESCALATE_MARKER),
            ScriptedBackend::new("escalation", ""),
        ));

        let outcome = h
            .router
            .handle_message(&text_message("u1", "chat-1", "вопрос"))
            .await
            .expect("handled");

        assert_eq!(outcome, RouteOutcome::Flushed { delivered: false });
        assert!(h.sink.sent().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn timer_flush_replies_to_latest_chat() {
        let h = harness(StaticBackends::new(
            ScriptedBackend::new("classifier", WAIT_MARKER),
            ScriptedBackend::new("escalation", "ok"),
        ));

        h.router
            .handle_message(&text_message("u1", "chat-old", "a"))
            .await
            .expect("handled");
        h.router
            .handle_message(&text_message("u1", "chat-new", "b"))
            .await
            .expect("handled");
        tokio::time::sleep(Duration::from_secs(11)).await;

        assert_eq!(h.sink.sent(), vec![("chat-new".to_string(), "ok".to_string())]);
    }

    #[tokio::test(start_paused = true)]
    async fn shutdown_stops_armed_timers_without_flushing() {
        let h = harness(StaticBackends::new(
            ScriptedBackend::new("classifier", WAIT_MARKER),
            ScriptedBackend::new("escalation", "ok"),
        ));

        h.router
            .handle_message(&text_message("u1", "chat-1", "a"))
            .await
            .expect("handled");
        h.shutdown.cancel();
        tokio::time::sleep(Duration::from_secs(30)).await;

        assert!(h.backends.escalation.calls().is_empty());
        assert!(h.sink.sent().is_empty());
    }

    fn escalated_questions(h: &Harness) -> Vec<String> {
        h.backends
            .escalation
            .calls()
            .into_iter()
            .map(|c| c.question)
            .collect()
    }

    #[tokio::test(start_paused = true)]
    async fn slow_classification_does_not_reorder_queued_messages() {
        let h = harness(StaticBackends::new(
            ScriptedBackend::new("classifier", WAIT_MARKER).slow("first", Duration::from_secs(2)),
            ScriptedBackend::new("escalation", "ok"),
        ));

        h.router.submit(text_message("u1", "chat-1", "first"));
        tokio::time::sleep(Duration::from_millis(100)).await;
        h.router.submit(text_message("u1", "chat-1", "second"));
        tokio::time::sleep(Duration::from_secs(30)).await;

        assert_eq!(escalated_questions(&h), vec!["first second"]);
        assert_eq!(h.sink.sent().len(), 1);
        assert_idle(&h, "u1").await;
    }

    #[tokio::test(start_paused = true)]
    async fn escalation_behind_slow_wait_flushes_both_in_one_call() {
        let h = harness(StaticBackends::new(
            classifier_with(&[("first", WAIT_MARKER), ("now", ESCALATE_MARKER)])
                .slow("first", Duration::from_secs(2)),
            ScriptedBackend::new("escalation", "ok"),
        ));

        h.router.submit(text_message("u1", "chat-1", "first"));
        tokio::time::sleep(Duration::from_millis(100)).await;
        h.router.submit(text_message("u1", "chat-1", "now"));
        tokio::time::sleep(Duration::from_secs(30)).await;

        assert_eq!(escalated_questions(&h), vec!["first now"]);
        assert_eq!(h.sink.sent(), vec![("chat-1".to_string(), "ok".to_string())]);
        assert_idle(&h, "u1").await;
    }

    #[tokio::test(start_paused = true)]
    async fn different_users_are_not_serialized_behind_each_other() {
        let h = harness(StaticBackends::new(
            classifier_with(&[("slow", "медленно"), ("fast", "быстро")])
                .slow("slow", Duration::from_secs(5)),
            ScriptedBackend::new("escalation", "unused"),
        ));

        h.router.submit(text_message("u1", "chat-1", "slow"));
        h.router.submit(text_message("u2", "chat-2", "fast"));
        tokio::time::sleep(Duration::from_secs(1)).await;
        assert_eq!(h.sink.sent(), vec![("chat-2".to_string(), "быстро".to_string())]);

        tokio::time::sleep(Duration::from_secs(5)).await;
        assert_eq!(h.sink.sent().len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn lane_keeps_running_after_a_failed_message() {
        let h = harness_with_sink(
            StaticBackends::new(
                ScriptedBackend::new("classifier", ESCALATE_MARKER),
                ScriptedBackend::new("escalation", "ответ"),
            ),
            RecordingSink::failing(),
        );

        h.router.submit(text_message("u1", "chat-1", "раз"));
        h.router.submit(text_message("u1", "chat-1", "два"));
        tokio::time::sleep(Duration::from_millis(50)).await;

        assert_eq!(escalated_questions(&h), vec!["раз", "два"]);
    }

    #[tokio::test(start_paused = true)]
    async fn timer_waking_before_window_elapses_keeps_waiting() {
        let h = harness_with(
            StaticBackends::new(
                ScriptedBackend::new("classifier", WAIT_MARKER),
                ScriptedBackend::new("escalation", "ok"),
            ),
            RecordingSink::default(),
            DebounceSettings {
                window: Duration::from_secs(10),
                check_interval: Duration::from_secs(3),
            },
        );

        h.router
            .handle_message(&text_message("u1", "chat-1", "a"))
            .await
            .expect("handled");

        // Wakes at 3s, 6s and 9s find the window still open.
        tokio::time::sleep(Duration::from_secs(11)).await;
        assert!(h.backends.escalation.calls().is_empty());
        {
            let session = h.router.sessions().get_or_create(&SenderId::from("u1"));
            let state = session.lock().await;
            assert!(state.is_waiting());
            assert_eq!(state.pending(), ["a".to_string()]);
        }

        // The 12s wake sees a full quiet window and flushes.
        tokio::time::sleep(Duration::from_secs(2)).await;
        assert_eq!(escalated_questions(&h), vec!["a"]);
        assert_idle(&h, "u1").await;
    }

    #[tokio::test(start_paused = true)]
    async fn delivery_failure_surfaces_as_error() {
        let h = harness_with_sink(StaticBackends::answering("ответ"), RecordingSink::failing());

        let err = h
            .router
            .handle_message(&text_message("u1", "chat-1", "привет"))
            .await
            .expect_err("sink failure propagates");
        assert!(err.to_string().contains("chat-1"));
    }
}
