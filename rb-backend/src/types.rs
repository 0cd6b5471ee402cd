use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BackendRequest<'a> {
    pub question: &'a str,
    pub user_id: &'a str,
    pub override_config: OverrideConfig<'a>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct OverrideConfig<'a> {
    pub session_id: &'a str,
    pub return_source_documents: bool,
}

impl<'a> BackendRequest<'a> {
    pub fn new(question: &'a str, user_id: &'a str, session_id: &'a str) -> Self {
        Self {
            question,
            user_id,
            override_config: OverrideConfig {
                session_id,
                return_source_documents: true,
            },
        }
    }
}

/// Only `text` matters to the router; source documents and the rest of the
/// payload are ignored.
#[derive(Debug, Clone, Deserialize)]
pub struct BackendResponse {
    #[serde(default)]
    pub text: Option<String>,
}
