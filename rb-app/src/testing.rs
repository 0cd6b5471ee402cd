//! In-memory backends and chat sink for router and gateway tests.

use crate::session::BackendFactory;
use anyhow::Result;
use async_trait::async_trait;
use rb_backend::Backend;
use rb_channels::{ChannelAdapter, InboundMessage, InboundMessageKind, OutboundMessage};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackendCall {
    pub question: String,
    pub user_id: String,
    pub session_id: String,
}

/// Answers from a fixed question -> answer table, falling back to one text.
/// Per-question latency lets tests make answers finish out of order.
pub struct ScriptedBackend {
    name: String,
    script: HashMap<String, String>,
    latency: HashMap<String, Duration>,
    fallback: String,
    calls: Mutex<Vec<BackendCall>>,
}

impl ScriptedBackend {
    pub fn new(name: &str, fallback: &str) -> Self {
        Self {
            name: name.to_string(),
            script: HashMap::new(),
            latency: HashMap::new(),
            fallback: fallback.to_string(),
            calls: Mutex::new(Vec::new()),
        }
    }

    pub fn reply(mut self, question: &str, answer: &str) -> Self {
        self.script.insert(question.to_string(), answer.to_string());
        self
    }

    pub fn slow(mut self, question: &str, latency: Duration) -> Self {
        self.latency.insert(question.to_string(), latency);
        self
    }

    pub fn calls(&self) -> Vec<BackendCall> {
        self.calls.lock().expect("calls lock").clone()
    }
}

#[async_trait]
impl Backend for ScriptedBackend {
    fn name(&self) -> &str {
        &self.name
    }

    async fn call(&self, question: &str, user_id: &str, session_id: &str) -> String {
        if let Some(latency) = self.latency.get(question) {
            tokio::time::sleep(*latency).await;
        }
        self.calls.lock().expect("calls lock").push(BackendCall {
            question: question.to_string(),
            user_id: user_id.to_string(),
            session_id: session_id.to_string(),
        });
        self.script
            .get(question)
            .cloned()
            .unwrap_or_else(|| self.fallback.clone())
    }
}

/// Every session shares the same two scripted backends so tests can inspect
/// all calls in one place.
pub struct StaticBackends {
    pub classifier: Arc<ScriptedBackend>,
    pub escalation: Arc<ScriptedBackend>,
}

impl StaticBackends {
    pub fn new(classifier: ScriptedBackend, escalation: ScriptedBackend) -> Self {
        Self {
            classifier: Arc::new(classifier),
            escalation: Arc::new(escalation),
        }
    }

    pub fn answering(answer: &str) -> Self {
        Self::new(
            ScriptedBackend::new("classifier", answer),
            ScriptedBackend::new("escalation", "**Эскалация** выполнена"),
        )
    }
}

impl BackendFactory for StaticBackends {
    fn classifier(&self) -> Arc<dyn Backend> {
        self.classifier.clone()
    }

    fn escalation(&self) -> Arc<dyn Backend> {
        self.escalation.clone()
    }
}

#[derive(Default)]
pub struct RecordingSink {
    sent: Mutex<Vec<(String, String)>>,
    fail_sends: bool,
}

impl RecordingSink {
    pub fn failing() -> Self {
        Self {
            sent: Mutex::new(Vec::new()),
            fail_sends: true,
        }
    }

    /// (recipient, content) pairs in delivery order.
    pub fn sent(&self) -> Vec<(String, String)> {
        self.sent.lock().expect("sent lock").clone()
    }
}

#[async_trait]
impl ChannelAdapter for RecordingSink {
    fn channel_id(&self) -> &str {
        "recording"
    }

    async fn start(
        &self,
        _tx: mpsc::Sender<InboundMessage>,
        _shutdown: CancellationToken,
    ) -> Result<()> {
        Ok(())
    }

    async fn send(&self, recipient_id: &str, message: OutboundMessage) -> Result<()> {
        if self.fail_sends {
            return Err(anyhow::anyhow!("sink unavailable"));
        }
        self.sent
            .lock()
            .expect("sent lock")
            .push((recipient_id.to_string(), message.content));
        Ok(())
    }
}

pub fn text_message(user: &str, chat: &str, text: &str) -> InboundMessage {
    InboundMessage {
        kind: InboundMessageKind::Message,
        message_id: format!("{user}:{text}").into(),
        sender_id: user.into(),
        thread_id: chat.into(),
        content: text.to_string(),
    }
}
