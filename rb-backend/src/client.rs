use crate::error::{BackendError, Result};
use crate::retry::RetryPolicy;
use crate::traits::Backend;
use crate::types::{BackendRequest, BackendResponse};
use async_trait::async_trait;
use reqwest::Url;
use std::time::Duration;

/// Returned once every attempt has failed.
pub const BACKEND_FAILURE_TEXT: &str =
    "Произошла ошибка при обращении к сервису. Пожалуйста, попробуйте позже.";

/// Returned when the backend answered but the payload carried no `text`.
pub const NO_RESPONSE_TEXT: &str = "Сервис не вернул текст ответа.";

#[derive(Debug, Clone)]
pub struct BackendConfig {
    pub name: String,
    pub url: Url,
    pub token: String,
}

#[derive(Clone)]
pub struct BackendClient {
    http: reqwest::Client,
    config: BackendConfig,
    retry: RetryPolicy,
}

impl BackendClient {
    pub fn new(http: reqwest::Client, config: BackendConfig) -> Self {
        Self {
            http,
            config,
            retry: RetryPolicy::default(),
        }
    }

    pub fn with_retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Shared connection pool for every backend handle in the process.
    #[tracing::instrument(level = "debug", skip_all)]
    pub fn build_http_client(timeout: Duration) -> reqwest::Client {
        reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .unwrap_or_else(|e| {
                tracing::warn!(%e, "reqwest client build failed; falling back to default client");
                reqwest::Client::new()
            })
    }

    async fn send_once(&self, request: &BackendRequest<'_>) -> Result<Option<String>> {
        let response = self
            .http
            .post(self.config.url.clone())
            .bearer_auth(&self.config.token)
            .json(request)
            .send()
            .await?;

        let status = response.status();
        let body = response.text().await?;
        if !status.is_success() {
            return Err(BackendError::Status {
                status: status.as_u16(),
                body,
            });
        }

        let parsed: BackendResponse = serde_json::from_str(&body)?;
        Ok(parsed.text)
    }
}

#[async_trait]
impl Backend for BackendClient {
    fn name(&self) -> &str {
        &self.config.name
    }

    #[tracing::instrument(
        level = "info",
        skip_all,
        fields(backend = %self.config.name, user_id = %user_id, session_id = %session_id)
    )]
    async fn call(&self, question: &str, user_id: &str, session_id: &str) -> String {
        let request = BackendRequest::new(question, user_id, session_id);

        for attempt in 0..self.retry.max_attempts {
            let error = match self.send_once(&request).await {
                Ok(Some(text)) => return text,
                Ok(None) => {
                    tracing::warn!(attempt, "backend response carried no text field");
                    return NO_RESPONSE_TEXT.to_string();
                }
                Err(error) => error,
            };

            if self.retry.is_last(attempt) {
                tracing::error!(
                    %error,
                    attempt,
                    max_attempts = self.retry.max_attempts,
                    "backend call failed; retries exhausted"
                );
                break;
            }

            let delay = self.retry.delay_for(attempt);
            tracing::warn!(
                %error,
                attempt,
                ?delay,
                "backend call failed; retrying with backoff"
            );
            tokio::time::sleep(delay).await;
        }

        BACKEND_FAILURE_TEXT.to_string()
    }
}
