use thiserror::Error;

pub type Result<T> = std::result::Result<T, BackendError>;

/// Failure of a single backend attempt. Never surfaced past [`crate::Backend::call`].
#[derive(Debug, Error)]
pub enum BackendError {
    #[error("http error: {0}")]
    Http(String),

    #[error("unexpected status {status}: {body}")]
    Status { status: u16, body: String },

    #[error("unexpected response format: {0}")]
    ResponseFormat(String),
}

impl From<reqwest::Error> for BackendError {
    fn from(e: reqwest::Error) -> Self {
        Self::Http(e.to_string())
    }
}

impl From<serde_json::Error> for BackendError {
    fn from(e: serde_json::Error) -> Self {
        Self::ResponseFormat(e.to_string())
    }
}
