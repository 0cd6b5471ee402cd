use crate::traits::ChannelAdapter;
use crate::types::{InboundMessage, InboundMessageKind, OutboundMessage};
use anyhow::Result;
use reqwest::{StatusCode, Url};
use serde::Deserialize;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

const TELEGRAM_CHANNEL_ID: &str = "telegram";
const TELEGRAM_DEFAULT_API_BASE: &str = "https://api.telegram.org";
const TELEGRAM_LONG_POLL_TIMEOUT_SECS: &str = "30";
const TELEGRAM_ALLOWED_UPDATES: &str = r#"["message","my_chat_member","chat_member"]"#;
const TELEGRAM_NON_TRANSIENT_DELAY: Duration = Duration::from_secs(10);
const TELEGRAM_RETRY_BASE_MS: u64 = 250;
const TELEGRAM_RETRY_MAX_MS: u64 = 30_000;

#[derive(Clone)]
pub struct TelegramAdapter {
    http: reqwest::Client,
    api_base: String,
    bot_token: String,
}

impl TelegramAdapter {
    pub fn new(bot_token: &str) -> Result<Self> {
        // Must outlive the long-poll timeout.
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(60))
            .build()?;
        Ok(Self {
            http,
            api_base: TELEGRAM_DEFAULT_API_BASE.to_string(),
            bot_token: bot_token.to_string(),
        })
    }

    /// Point the adapter at a different Bot API host (local bot API server, tests).
    pub fn with_api_base(mut self, api_base: &str) -> Self {
        self.api_base = api_base.trim_end_matches('/').to_string();
        self
    }

    fn api_url(&self, method: &str) -> Result<Url> {
        Ok(Url::parse(&format!(
            "{}/bot{}/{}",
            self.api_base, self.bot_token, method
        ))?)
    }
}

#[async_trait::async_trait]
impl ChannelAdapter for TelegramAdapter {
    fn channel_id(&self) -> &str {
        TELEGRAM_CHANNEL_ID
    }

    async fn start(
        &self,
        tx: mpsc::Sender<InboundMessage>,
        shutdown: CancellationToken,
    ) -> Result<()> {
        let adapter = self.clone();
        tokio::spawn(async move {
            if let Err(e) = adapter.run_poll_loop(tx, shutdown).await {
                tracing::error!(%e, "telegram poll loop exited");
            }
        });
        Ok(())
    }

    async fn send(&self, recipient_id: &str, message: OutboundMessage) -> Result<()> {
        let url = self.api_url("sendMessage")?;
        let body = serde_json::json!({
            "chat_id": recipient_id,
            "text": message.content,
        });
        let resp = self.http.post(url).json(&body).send().await?;
        if !resp.status().is_success() {
            let status = resp.status();
            let text = resp.text().await?;
            return Err(anyhow::anyhow!(
                "telegram send failed: status={status} body={text}"
            ));
        }
        Ok(())
    }
}

impl TelegramAdapter {
    #[tracing::instrument(level = "info", skip_all)]
    async fn run_poll_loop(
        &self,
        tx: mpsc::Sender<InboundMessage>,
        shutdown: CancellationToken,
    ) -> Result<()> {
        let mut offset: i64 = 0;
        let mut consecutive_failures: u32 = 0;

        loop {
            let url = self.api_url("getUpdates")?;
            let offset_param = offset.to_string();
            let request = self
                .http
                .get(url)
                .query(&[
                    ("timeout", TELEGRAM_LONG_POLL_TIMEOUT_SECS),
                    ("offset", offset_param.as_str()),
                    ("allowed_updates", TELEGRAM_ALLOWED_UPDATES),
                ])
                .send();
            let response = tokio::select! {
                _ = shutdown.cancelled() => {
                    tracing::info!("telegram poll loop stopping on shutdown");
                    return Ok(());
                }
                response = request => response,
            };

            let response = match response {
                Ok(response) => response,
                Err(error) => {
                    consecutive_failures += 1;
                    let delay = transient_retry_delay(consecutive_failures);
                    tracing::warn!(
                        %error,
                        attempt = consecutive_failures,
                        ?delay,
                        "telegram getUpdates request failed; retrying with backoff"
                    );
                    if !sleep_unless_shutdown(delay, &shutdown).await {
                        return Ok(());
                    }
                    continue;
                }
            };

            let status = response.status();
            if !status.is_success() {
                let body = response.text().await.unwrap_or_else(|error| {
                    format!("<failed to read telegram error body: {error}>")
                });
                let delay = if is_transient_status(status) {
                    consecutive_failures += 1;
                    let delay = transient_retry_delay(consecutive_failures);
                    tracing::warn!(
                        %status,
                        %body,
                        attempt = consecutive_failures,
                        ?delay,
                        "telegram getUpdates transient failure; retrying with backoff"
                    );
                    delay
                } else {
                    consecutive_failures = 0;
                    tracing::error!(
                        %status,
                        %body,
                        ?TELEGRAM_NON_TRANSIENT_DELAY,
                        "telegram getUpdates non-transient failure; keeping poll loop alive"
                    );
                    TELEGRAM_NON_TRANSIENT_DELAY
                };
                if !sleep_unless_shutdown(delay, &shutdown).await {
                    return Ok(());
                }
                continue;
            }

            let parsed = match response.json::<TelegramGetUpdatesResponse>().await {
                Ok(parsed) => parsed,
                Err(error) => {
                    consecutive_failures += 1;
                    let delay = transient_retry_delay(consecutive_failures);
                    tracing::warn!(
                        %error,
                        attempt = consecutive_failures,
                        ?delay,
                        "telegram getUpdates payload parse failed; retrying with backoff"
                    );
                    if !sleep_unless_shutdown(delay, &shutdown).await {
                        return Ok(());
                    }
                    continue;
                }
            };

            consecutive_failures = 0;

            let mut updates = parsed.result;
            updates.sort_by_key(|update| update.update_id);
            for update in updates {
                // Advance offset before conversion to avoid poison-update replay loops.
                if update.update_id < offset {
                    continue;
                }
                offset = update.update_id.saturating_add(1);

                for inbound in build_inbound_messages(&update) {
                    tx.send(inbound)
                        .await
                        .map_err(|e| anyhow::anyhow!("telegram inbound queue closed: {e}"))?;
                }
            }
        }
    }
}

/// Returns false when shutdown fired first.
async fn sleep_unless_shutdown(delay: Duration, shutdown: &CancellationToken) -> bool {
    tokio::select! {
        _ = shutdown.cancelled() => false,
        _ = tokio::time::sleep(delay) => true,
    }
}

fn transient_retry_delay(attempt: u32) -> Duration {
    let multiplier = 1_u64 << attempt.saturating_sub(1).min(10);
    Duration::from_millis((TELEGRAM_RETRY_BASE_MS * multiplier).min(TELEGRAM_RETRY_MAX_MS))
}

fn is_transient_status(status: StatusCode) -> bool {
    status == StatusCode::TOO_MANY_REQUESTS
        || status == StatusCode::REQUEST_TIMEOUT
        || status.is_server_error()
}

fn build_inbound_messages(update: &TelegramUpdate) -> Vec<InboundMessage> {
    let mut inbound = Vec::new();
    if let Some(message) = build_message_inbound(update.update_id, update.message.as_ref()) {
        inbound.push(message);
    }
    for membership in [update.my_chat_member.as_ref(), update.chat_member.as_ref()] {
        if let Some(event) = build_membership_inbound(update.update_id, membership) {
            inbound.push(event);
        }
    }
    inbound
}

fn build_message_inbound(
    update_id: i64,
    message: Option<&TelegramMessage>,
) -> Option<InboundMessage> {
    let message = message?;
    let chat = message.chat.as_ref()?;
    let content = message
        .text
        .as_deref()
        .filter(|text| !text.trim().is_empty())?
        .to_string();
    let sender_id = message
        .from
        .as_ref()
        .map(|user| user.id.to_string())
        .unwrap_or_else(|| format!("chat:{}", chat.id));
    let message_id = message
        .message_id
        .map(|id| id.to_string())
        .unwrap_or_else(|| format!("update:{update_id}:message"));

    Some(InboundMessage {
        kind: InboundMessageKind::Message,
        message_id: message_id.into(),
        sender_id: sender_id.into(),
        thread_id: chat.id.to_string().into(),
        content,
    })
}

fn build_membership_inbound(
    update_id: i64,
    membership: Option<&TelegramChatMemberUpdated>,
) -> Option<InboundMessage> {
    let membership = membership?;
    let sender_id = membership
        .new_chat_member
        .user
        .as_ref()
        .or(membership.from.as_ref())
        .map(|user| user.id.to_string())
        .unwrap_or_else(|| format!("chat:{}", membership.chat.id));

    Some(InboundMessage {
        kind: InboundMessageKind::Membership,
        message_id: format!("update:{update_id}:membership").into(),
        sender_id: sender_id.into(),
        thread_id: membership.chat.id.to_string().into(),
        content: format!(
            "{} -> {}",
            membership.old_chat_member.status, membership.new_chat_member.status
        ),
    })
}

#[derive(Debug, Deserialize)]
struct TelegramGetUpdatesResponse {
    #[serde(default)]
    result: Vec<TelegramUpdate>,
}

#[derive(Debug, Deserialize)]
struct TelegramUpdate {
    update_id: i64,
    #[serde(default)]
    message: Option<TelegramMessage>,
    #[serde(default)]
    my_chat_member: Option<TelegramChatMemberUpdated>,
    #[serde(default)]
    chat_member: Option<TelegramChatMemberUpdated>,
}

#[derive(Debug, Deserialize)]
struct TelegramMessage {
    #[serde(default)]
    message_id: Option<i64>,
    #[serde(default)]
    from: Option<TelegramUser>,
    #[serde(default)]
    chat: Option<TelegramChat>,
    #[serde(default)]
    text: Option<String>,
}

#[derive(Debug, Deserialize)]
struct TelegramChatMemberUpdated {
    chat: TelegramChat,
    #[serde(default)]
    from: Option<TelegramUser>,
    old_chat_member: TelegramChatMember,
    new_chat_member: TelegramChatMember,
}

#[derive(Debug, Deserialize)]
struct TelegramChatMember {
    status: String,
    #[serde(default)]
    user: Option<TelegramUser>,
}

#[derive(Debug, Deserialize)]
struct TelegramUser {
    id: i64,
}

#[derive(Debug, Deserialize)]
struct TelegramChat {
    id: i64,
}
