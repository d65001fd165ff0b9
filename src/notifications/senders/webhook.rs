use async_trait::async_trait;
use reqwest::Client;
use serde_json::json;

use super::{MessageSender, SenderError};
use crate::notifications::AlertEvent;

/// POSTs alerts as JSON to an operator-supplied URL. Supports structured
/// delivery, so the template fallback never fires for this sink.
pub struct WebhookSender {
    url: String,
    client: Client,
}

impl WebhookSender {
    pub fn new(url: String) -> Self {
        Self {
            url,
            client: Client::new(),
        }
    }

    async fn post(&self, body: serde_json::Value) -> Result<(), SenderError> {
        if self.url.is_empty() {
            return Err(SenderError::InvalidConfiguration(
                "webhook url is not set".into(),
            ));
        }
        let response = self.client.post(&self.url).json(&body).send().await?;
        let status = response.status();
        if !status.is_success() {
            let body = response
                .text()
                .await
                .unwrap_or_else(|_| "failed to read error body".to_owned());
            return Err(SenderError::SendFailed(format!(
                "webhook returned {status}: {body}"
            )));
        }
        Ok(())
    }
}

#[async_trait]
impl MessageSender for WebhookSender {
    fn name(&self) -> &'static str {
        "webhook"
    }

    async fn init(&self) -> Result<(), SenderError> {
        if self.url.is_empty() {
            return Err(SenderError::InvalidConfiguration(
                "webhook url is not set".into(),
            ));
        }
        Ok(())
    }

    async fn send_text_message(&self, message: &str, title: &str) -> Result<(), SenderError> {
        self.post(json!({ "title": title, "message": message })).await
    }

    async fn send_event(&self, event: &AlertEvent) -> Result<(), SenderError> {
        self.post(json!({
            "emoji": event.emoji,
            "event": event.event,
            "client": event.client,
            "message": event.message,
            "time": event.time.to_rfc3339(),
        }))
        .await
    }
}
