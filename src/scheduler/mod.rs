//! Fixed-interval tickers driving the scheduler topics.
//!
//! Each cadence runs on its own task and publishes asynchronously; listeners
//! must be idempotent because a tick that lands during contention is not
//! replayed. The first tick of every cadence fires one full period after
//! start, so the daily topic never fires on the boot day.

pub mod ping;

use std::sync::Arc;

use tokio::time::{interval_at, Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::event::{Event, EventBus, Every};

const CADENCES: &[(Every, u64)] = &[
    (Every::Minute, 60),
    (Every::FiveMinutes, 5 * 60),
    (Every::ThirtyMinutes, 30 * 60),
    (Every::Hour, 3600),
    (Every::Day, 24 * 3600),
];

pub fn start_tickers(bus: Arc<EventBus>, cancel: CancellationToken) {
    for &(every, seconds) in CADENCES {
        let bus = bus.clone();
        let cancel = cancel.clone();
        tokio::spawn(async move {
            let period = Duration::from_secs(seconds);
            let mut ticker = interval_at(Instant::now() + period, period);
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => bus.trigger_async(Event::Tick(every)),
                }
            }
        });
    }
    info!("scheduler tickers started");
}
