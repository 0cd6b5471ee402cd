//! Inbound queue drain: every channel adapter feeds one mpsc queue and each
//! routable message is handed to its sender's lane on the router.

use crate::router::Router;
use anyhow::Result;
use rb_channels::{InboundMessage, InboundMessageKind};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

pub struct Gateway {
    router: Arc<Router>,
    inbound_rx: tokio::sync::Mutex<mpsc::Receiver<InboundMessage>>,
}

impl Gateway {
    pub fn new(router: Arc<Router>, inbound_rx: mpsc::Receiver<InboundMessage>) -> Self {
        Self {
            router,
            inbound_rx: tokio::sync::Mutex::new(inbound_rx),
        }
    }

    pub fn start(self: Arc<Self>, shutdown: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(async move {
            if let Err(e) = self.run_loop(shutdown).await {
                tracing::error!(%e, "gateway loop exited");
            }
            self.log_sessions().await;
        })
    }

    async fn log_sessions(&self) {
        let summaries = self.router.sessions().summaries().await;
        tracing::info!(sessions = summaries.len(), "gateway stopped");
        for summary in summaries {
            tracing::info!(
                user_id = %summary.user_id,
                session_id = %summary.session_id,
                created_at = %summary.created_at,
                last_active = %summary.last_active,
                pending = summary.pending,
                waiting = summary.waiting,
                "session"
            );
        }
    }

    #[tracing::instrument(level = "info", skip_all)]
    async fn run_loop(&self, shutdown: CancellationToken) -> Result<()> {
        let mut rx = self.inbound_rx.lock().await;
        loop {
            let msg = tokio::select! {
                _ = shutdown.cancelled() => return Ok(()),
                msg = rx.recv() => msg,
            };
            let Some(inbound) = msg else {
                return Ok(());
            };
            self.dispatch(inbound);
        }
    }

    fn dispatch(&self, inbound: InboundMessage) {
        match inbound.kind {
            InboundMessageKind::Membership => {
                tracing::info!(
                    user_id = %inbound.sender_id,
                    chat_id = %inbound.thread_id,
                    change = %inbound.content,
                    "membership update; nothing to route"
                );
            }
            InboundMessageKind::Message => self.router.submit(inbound),
        }
    }
}
