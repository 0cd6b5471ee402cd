//! HTTP client for the downstream conversational backends.
//!
//! Each backend is an opaque prediction endpoint: one question in, one text
//! answer out. Callers only ever see text; transport failures are retried and
//! then collapsed into a sentinel string.

mod client;
mod error;
mod retry;
mod traits;
mod types;

pub use client::{BACKEND_FAILURE_TEXT, BackendClient, BackendConfig, NO_RESPONSE_TEXT};
pub use error::{BackendError, Result};
pub use retry::RetryPolicy;
pub use traits::Backend;
pub use types::{BackendRequest, BackendResponse, OverrideConfig};
