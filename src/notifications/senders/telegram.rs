use async_trait::async_trait;
use reqwest::Client;
use serde::Serialize;

use super::{MessageSender, SenderError};

/// Pushes messages through the Telegram Bot API.
pub struct TelegramSender {
    bot_token: String,
    chat_id: String,
    client: Client,
}

impl TelegramSender {
    pub fn new(bot_token: String, chat_id: String) -> Self {
        Self {
            bot_token,
            chat_id,
            client: Client::new(),
        }
    }
}

/// Characters MarkdownV2 requires escaping:
/// _ * [ ] ( ) ~ ` > # + - = | { } . !
fn escape_markdown_v2(text: &str) -> String {
    let mut escaped = String::with_capacity(text.len());
    for c in text.chars() {
        match c {
            '_' | '*' | '[' | ']' | '(' | ')' | '~' | '`' | '>' | '#' | '+' | '-' | '=' | '|'
            | '{' | '}' | '.' | '!' => {
                escaped.push('\\');
                escaped.push(c);
            }
            _ => escaped.push(c),
        }
    }
    escaped
}

#[derive(Serialize)]
struct SendMessage<'a> {
    chat_id: &'a str,
    text: &'a str,
    parse_mode: &'a str,
}

#[async_trait]
impl MessageSender for TelegramSender {
    fn name(&self) -> &'static str {
        "telegram"
    }

    async fn init(&self) -> Result<(), SenderError> {
        if self.bot_token.is_empty() || self.chat_id.is_empty() {
            return Err(SenderError::InvalidConfiguration(
                "telegram bot token and chat id are required".into(),
            ));
        }
        Ok(())
    }

    async fn send_text_message(&self, message: &str, title: &str) -> Result<(), SenderError> {
        let text = format!("*{}*\n{}", escape_markdown_v2(title), escape_markdown_v2(message));
        let url = format!("https://api.telegram.org/bot{}/sendMessage", self.bot_token);
        let payload = SendMessage {
            chat_id: &self.chat_id,
            text: &text,
            parse_mode: "MarkdownV2",
        };
        let response = self.client.post(&url).json(&payload).send().await?;
        let status = response.status();
        if !status.is_success() {
            let body = response
                .text()
                .await
                .unwrap_or_else(|_| "failed to read error body".to_owned());
            return Err(SenderError::SendFailed(format!(
                "telegram returned {status}: {body}"
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn markdown_escape_covers_reserved_characters() {
        assert_eq!(escape_markdown_v2("a.b-c!"), "a\\.b\\-c\\!");
        assert_eq!(escape_markdown_v2("plain"), "plain");
    }
}
