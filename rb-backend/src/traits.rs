use async_trait::async_trait;

#[async_trait]
pub trait Backend: Send + Sync {
    /// Short label used in logs: "classifier", "escalation".
    fn name(&self) -> &str;

    /// Ask the backend one question. Always yields text: failures come back as
    /// sentinel strings, never as errors.
    async fn call(&self, question: &str, user_id: &str, session_id: &str) -> String;
}
