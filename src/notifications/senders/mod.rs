//! Sink implementations. Each variant is one capability: deliver a text
//! message, optionally a structured event.

pub mod telegram;
pub mod webhook;

pub use telegram::TelegramSender;
pub use webhook::WebhookSender;

use async_trait::async_trait;
use thiserror::Error;

use super::AlertEvent;

#[derive(Error, Debug)]
pub enum SenderError {
    #[error("structured delivery not implemented")]
    Unsupported,
    #[error("invalid sink configuration: {0}")]
    InvalidConfiguration(String),
    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),
    #[error("delivery failed: {0}")]
    SendFailed(String),
}

#[async_trait]
pub trait MessageSender: Send + Sync {
    fn name(&self) -> &'static str;

    async fn init(&self) -> Result<(), SenderError> {
        Ok(())
    }

    async fn destroy(&self) {}

    async fn send_text_message(&self, message: &str, title: &str) -> Result<(), SenderError>;

    /// Structured delivery; the hub falls back to the rendered text template
    /// when a sink leaves this unimplemented.
    async fn send_event(&self, _event: &AlertEvent) -> Result<(), SenderError> {
        Err(SenderError::Unsupported)
    }
}

/// Drops every message; the configured default until an operator picks a
/// transport.
pub struct NoneSender;

#[async_trait]
impl MessageSender for NoneSender {
    fn name(&self) -> &'static str {
        "none"
    }

    async fn send_text_message(&self, _message: &str, _title: &str) -> Result<(), SenderError> {
        Ok(())
    }
}
