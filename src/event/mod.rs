//! In-process publish/subscribe bus.
//!
//! Every transition of interest in the server is announced here so that the
//! record pipeline, alert evaluator and notification hub stay decoupled from
//! the code that produces the transition. Handlers are registered against a
//! [`Topic`] with a priority; synchronous triggers run handlers in priority
//! order and stop at the first error, asynchronous triggers hand the whole
//! dispatch to a worker task.
//!
//! The bus is in-process only and is not reentrancy-safe: a handler must not
//! synchronously trigger the topic it is currently handling.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use tracing::error;

use crate::config::Config;

#[derive(Debug, thiserror::Error)]
pub enum EventError {
    #[error("database error: {0}")]
    Db(#[from] sea_orm::DbErr),
    #[error("{0}")]
    Listener(String),
}

/// Ticker cadence carried by scheduler events.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Every {
    Minute,
    FiveMinutes,
    ThirtyMinutes,
    Hour,
    Day,
}

/// Named topics a listener can subscribe to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Topic {
    ProcessStart,
    ProcessExit,
    ServerInitStart,
    ServerInitDone,
    ConfigUpdated,
    ClientCreated,
    ClientUpdated,
    ClientDeleted,
    SchedulerEvery1m,
    SchedulerEvery5m,
    SchedulerEvery30m,
    SchedulerEvery1h,
    SchedulerEvery1d,
    NotificationSent,
    NotificationFailed,
    LoginSucceeded,
    LoginFailed,
    UserLogout,
    TerminalEstablished,
    TerminalClosed,
}

/// Typed event envelope. The variant fixes both the topic and the payload
/// shape, so a listener can never observe a payload it does not understand.
#[derive(Debug, Clone)]
pub enum Event {
    ProcessStart,
    ProcessExit,
    ServerInitStart,
    ServerInitDone,
    ConfigUpdated {
        old: Arc<Config>,
        new: Arc<Config>,
    },
    ClientCreated {
        uuid: String,
        name: String,
    },
    ClientUpdated {
        uuid: String,
    },
    ClientDeleted {
        uuid: String,
        name: String,
    },
    Tick(Every),
    NotificationSent {
        title: String,
    },
    NotificationFailed {
        title: String,
        error: String,
    },
    LoginSucceeded {
        username: String,
        method: String,
        ip: String,
        user_agent: String,
    },
    LoginFailed {
        username: String,
        method: String,
        ip: String,
        user_agent: String,
    },
    UserLogout {
        ip: String,
    },
    TerminalEstablished {
        client: String,
    },
    TerminalClosed {
        client: String,
    },
}

impl Event {
    pub fn topic(&self) -> Topic {
        match self {
            Event::ProcessStart => Topic::ProcessStart,
            Event::ProcessExit => Topic::ProcessExit,
            Event::ServerInitStart => Topic::ServerInitStart,
            Event::ServerInitDone => Topic::ServerInitDone,
            Event::ConfigUpdated { .. } => Topic::ConfigUpdated,
            Event::ClientCreated { .. } => Topic::ClientCreated,
            Event::ClientUpdated { .. } => Topic::ClientUpdated,
            Event::ClientDeleted { .. } => Topic::ClientDeleted,
            Event::Tick(Every::Minute) => Topic::SchedulerEvery1m,
            Event::Tick(Every::FiveMinutes) => Topic::SchedulerEvery5m,
            Event::Tick(Every::ThirtyMinutes) => Topic::SchedulerEvery30m,
            Event::Tick(Every::Hour) => Topic::SchedulerEvery1h,
            Event::Tick(Every::Day) => Topic::SchedulerEvery1d,
            Event::NotificationSent { .. } => Topic::NotificationSent,
            Event::NotificationFailed { .. } => Topic::NotificationFailed,
            Event::LoginSucceeded { .. } => Topic::LoginSucceeded,
            Event::LoginFailed { .. } => Topic::LoginFailed,
            Event::UserLogout { .. } => Topic::UserLogout,
            Event::TerminalEstablished { .. } => Topic::TerminalEstablished,
            Event::TerminalClosed { .. } => Topic::TerminalClosed,
        }
    }

    /// Wall-clock instant the event was triggered at, for renderers.
    pub fn now() -> DateTime<Utc> {
        Utc::now()
    }
}

type BoxFut = Pin<Box<dyn Future<Output = Result<(), EventError>> + Send>>;
type Handler = Arc<dyn Fn(Arc<Event>) -> BoxFut + Send + Sync>;

struct Registration {
    priority: i32,
    handler: Handler,
}

#[derive(Default)]
pub struct EventBus {
    listeners: RwLock<HashMap<Topic, Vec<Registration>>>,
}

impl EventBus {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Register a handler for `topic`. Higher priority runs first; equal
    /// priorities run in registration order.
    pub fn on<F, Fut>(&self, topic: Topic, priority: i32, f: F)
    where
        F: Fn(Arc<Event>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), EventError>> + Send + 'static,
    {
        let handler: Handler = Arc::new(move |ev| Box::pin(f(ev)));
        let mut listeners = self.listeners.write();
        let entries = listeners.entry(topic).or_default();
        entries.push(Registration { priority, handler });
        entries.sort_by_key(|r| std::cmp::Reverse(r.priority));
    }

    fn handlers_for(&self, topic: Topic) -> Vec<Handler> {
        self.listeners
            .read()
            .get(&topic)
            .map(|rs| rs.iter().map(|r| r.handler.clone()).collect())
            .unwrap_or_default()
    }

    /// Run all handlers for the event's topic in order. The first handler
    /// error short-circuits the remaining handlers and is returned.
    pub async fn trigger(&self, event: Event) -> Result<(), EventError> {
        let topic = event.topic();
        let ev = Arc::new(event);
        for handler in self.handlers_for(topic) {
            handler(ev.clone()).await?;
        }
        Ok(())
    }

    /// Hand the dispatch to a worker task and return immediately. Handler
    /// errors are logged and do not stop later handlers; scheduled-event
    /// listeners are expected to be idempotent since missed dispatches are
    /// not replayed.
    pub fn trigger_async(self: &Arc<Self>, event: Event) {
        let bus = self.clone();
        tokio::spawn(async move {
            let topic = event.topic();
            let ev = Arc::new(event);
            for handler in bus.handlers_for(topic) {
                if let Err(e) = handler(ev.clone()).await {
                    error!(topic = ?topic, error = %e, "event handler failed");
                }
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::sync::Mutex;

    #[tokio::test]
    async fn handlers_run_in_priority_order() {
        let bus = EventBus::new();
        let order = Arc::new(Mutex::new(Vec::new()));

        for (priority, tag) in [(0, "low"), (10, "high"), (5, "mid")] {
            let order = order.clone();
            bus.on(Topic::ProcessStart, priority, move |_| {
                let order = order.clone();
                async move {
                    order.lock().await.push(tag);
                    Ok(())
                }
            });
        }

        bus.trigger(Event::ProcessStart).await.unwrap();
        assert_eq!(*order.lock().await, vec!["high", "mid", "low"]);
    }

    #[tokio::test]
    async fn first_error_short_circuits_sync_trigger() {
        let bus = EventBus::new();
        let ran = Arc::new(AtomicUsize::new(0));

        bus.on(Topic::ProcessExit, 10, |_| async {
            Err(EventError::Listener("boom".into()))
        });
        let ran2 = ran.clone();
        bus.on(Topic::ProcessExit, 0, move |_| {
            let ran2 = ran2.clone();
            async move {
                ran2.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }
        });

        assert!(bus.trigger(Event::ProcessExit).await.is_err());
        assert_eq!(ran.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn async_trigger_runs_all_handlers() {
        let bus = EventBus::new();
        let ran = Arc::new(AtomicUsize::new(0));

        bus.on(Topic::ServerInitDone, 1, |_| async {
            Err(EventError::Listener("ignored".into()))
        });
        let ran2 = ran.clone();
        bus.on(Topic::ServerInitDone, 0, move |_| {
            let ran2 = ran2.clone();
            async move {
                ran2.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }
        });

        bus.trigger_async(Event::ServerInitDone);
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        assert_eq!(ran.load(Ordering::SeqCst), 1);
    }
}
