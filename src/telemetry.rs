//! Pool telemetry: a best-effort, non-blocking publication hook fired after
//! every acquire, release, and disposal. spec.md §6 fixes the wire format
//! as `"live|max|idle"` on a topic named `usenet-connections`; the trait
//! keeps that detail out of [`crate::pool::ConnectionPool`] itself so other
//! sinks (metrics registries, log lines, a test probe) can be swapped in.

use std::sync::Arc;

use tokio::sync::broadcast;
use tracing::trace;

use crate::pool::PoolEvent;

/// Topic name used by [`ChannelTelemetry`]'s broadcast channel.
pub const TOPIC: &str = "usenet-connections";

/// Receives pool state snapshots. Implementations must not block or fail
/// the caller: a dropped or full telemetry sink is never allowed to affect
/// pool behavior, so `publish` returns nothing and swallows its own errors.
pub trait PoolTelemetry: Send + Sync {
    fn publish(&self, event: PoolEvent);
}

/// Formats a [`PoolEvent`] as spec.md's `"live|max|idle"` string.
pub fn format_event(event: PoolEvent) -> String {
    format!("{}|{}|{}", event.live, event.max, event.idle)
}

/// Publishes formatted snapshots on a [`tokio::sync::broadcast`] channel.
/// Sending is fire-and-forget: `send` only fails when there are no
/// subscribers, which is the normal state when nobody is watching and is
/// not an error worth surfacing.
pub struct ChannelTelemetry {
    tx: broadcast::Sender<String>,
}

impl ChannelTelemetry {
    pub fn new(capacity: usize) -> Arc<Self> {
        let (tx, _rx) = broadcast::channel(capacity.max(1));
        Arc::new(Self { tx })
    }

    pub fn subscribe(&self) -> broadcast::Receiver<String> {
        self.tx.subscribe()
    }
}

impl PoolTelemetry for ChannelTelemetry {
    fn publish(&self, event: PoolEvent) {
        let line = format_event(event);
        trace!(topic = TOPIC, line = %line, "publishing pool telemetry");
        let _ = self.tx.send(line);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn formats_live_max_idle_in_that_order() {
        let event = PoolEvent {
            live: 3,
            idle: 2,
            max: 10,
        };
        assert_eq!(format_event(event), "3|10|2");
    }

    #[tokio::test]
    async fn subscribers_receive_published_events() {
        let telemetry = ChannelTelemetry::new(16);
        let mut rx = telemetry.subscribe();
        telemetry.publish(PoolEvent {
            live: 1,
            idle: 0,
            max: 5,
        });
        let received = rx.recv().await.unwrap();
        assert_eq!(received, "1|5|0");
    }

    #[test]
    fn publish_without_subscribers_does_not_panic() {
        let telemetry = ChannelTelemetry::new(4);
        telemetry.publish(PoolEvent {
            live: 0,
            idle: 0,
            max: 1,
        });
    }
}
