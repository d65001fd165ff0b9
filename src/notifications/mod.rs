//! Notification hub: renders alerts and hands them to the configured sink.
//!
//! The sink is chosen by `notification.method` and rebuilt whenever that
//! setting changes. Delivery is at-most-once per alert edge: a failure is
//! logged and announced as `notification.failed`, never retried.

pub mod senders;

use std::sync::Arc;

use chrono::{DateTime, Utc};
use tokio::sync::RwLock;
use tracing::{info, warn};

use crate::config::{Config, ConfigStore};
use crate::event::{Event, EventBus, Topic};
use senders::{MessageSender, NoneSender, SenderError, TelegramSender, WebhookSender};

/// A rendered-ready alert.
#[derive(Debug, Clone)]
pub struct AlertEvent {
    pub emoji: String,
    pub event: String,
    pub client: String,
    pub message: String,
    pub time: DateTime<Utc>,
}

/// Fill the operator-configured template. Unknown placeholders are left
/// alone.
pub fn render_template(template: &str, event: &AlertEvent) -> String {
    template
        .replace("{{emoji}}", &event.emoji)
        .replace("{{event}}", &event.event)
        .replace("{{client}}", &event.client)
        .replace("{{message}}", &event.message)
        .replace("{{time}}", &event.time.format("%Y-%m-%d %H:%M:%S UTC").to_string())
}

pub struct NotificationHub {
    config: Arc<ConfigStore>,
    bus: Arc<EventBus>,
    sender: RwLock<Arc<dyn MessageSender>>,
}

impl NotificationHub {
    pub async fn new(config: Arc<ConfigStore>, bus: Arc<EventBus>) -> Arc<Self> {
        let sender = build_sender(&config.get());
        if let Err(e) = sender.init().await {
            warn!(sink = sender.name(), error = %e, "notification sink init failed");
        }
        Arc::new(Self {
            config,
            bus,
            sender: RwLock::new(sender),
        })
    }

    /// Swap in the sink named by the current config.
    pub async fn reload(&self) {
        let next = build_sender(&self.config.get());
        if let Err(e) = next.init().await {
            warn!(sink = next.name(), error = %e, "notification sink init failed");
        }
        let previous = {
            let mut guard = self.sender.write().await;
            std::mem::replace(&mut *guard, next)
        };
        previous.destroy().await;
        let sink_name = self.sender.read().await.name().to_string();
        info!(sink = sink_name, "notification sink reloaded");
    }

    /// React to `config.updated`: rebuild only when the method changed.
    pub fn register(self: &Arc<Self>, bus: &Arc<EventBus>) {
        let hub = self.clone();
        bus.on(Topic::ConfigUpdated, 0, move |event| {
            let hub = hub.clone();
            async move {
                if let Event::ConfigUpdated { old, new } = event.as_ref() {
                    if old.notification.method != new.notification.method {
                        hub.reload().await;
                    }
                }
                Ok(())
            }
        });
    }

    /// Deliver one alert. Sinks without structured delivery get the rendered
    /// text template.
    pub async fn notify(&self, event: AlertEvent) {
        let config = self.config.get();
        if !config.notification.enabled {
            return;
        }
        let sender = self.sender.read().await.clone();
        let title = event.event.clone();

        let outcome = match sender.send_event(&event).await {
            Err(SenderError::Unsupported) => {
                let rendered = render_template(&config.notification.template, &event);
                sender.send_text_message(&rendered, &title).await
            }
            other => other,
        };

        match outcome {
            Ok(()) => {
                self.bus.trigger_async(Event::NotificationSent { title });
            }
            Err(e) => {
                warn!(sink = sender.name(), error = %e, "notification delivery failed");
                self.bus.trigger_async(Event::NotificationFailed {
                    title,
                    error: e.to_string(),
                });
            }
        }
    }
}

fn build_sender(config: &Config) -> Arc<dyn MessageSender> {
    match config.notification.method.as_str() {
        "webhook" => Arc::new(WebhookSender::new(config.notification.webhook_url.clone())),
        "telegram" => Arc::new(TelegramSender::new(
            config.notification.telegram_bot_token.clone(),
            config.notification.telegram_chat_id.clone(),
        )),
        "none" | "" => Arc::new(NoneSender),
        other => {
            warn!(method = other, "unknown notification method, falling back to none");
            Arc::new(NoneSender)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn template_placeholders_are_substituted() {
        let event = AlertEvent {
            emoji: "🔴".into(),
            event: "offline".into(),
            client: "web-01".into(),
            message: "no reports for 180s".into(),
            time: Utc.with_ymd_and_hms(2025, 6, 1, 8, 30, 0).unwrap(),
        };
        let rendered = render_template("{{emoji}} {{event}} {{client}}: {{message}} at {{time}}", &event);
        assert_eq!(
            rendered,
            "🔴 offline web-01: no reports for 180s at 2025-06-01 08:30:00 UTC"
        );
    }

    #[test]
    fn unknown_placeholders_survive_rendering() {
        let event = AlertEvent {
            emoji: String::new(),
            event: "x".into(),
            client: String::new(),
            message: String::new(),
            time: Utc::now(),
        };
        assert_eq!(render_template("{{nope}} {{event}}", &event), "{{nope}} x");
    }
}
