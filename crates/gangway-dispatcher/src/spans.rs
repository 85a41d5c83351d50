//! Trace span lifetime management.
//!
//! Each admitted deployment opens one span stored under its ID; the span
//! is closed when a terminal status for that ID is relayed. A cleanup
//! pass prunes spans whose deadline has long passed, covering agents
//! that crash without reporting a terminal state.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::watch;
use tracing::{Span, debug};

/// Grace period past the request deadline before a span is pruned.
const PRUNE_GRACE: chrono::Duration = chrono::Duration::hours(1);

struct TrackedSpan {
    span: Span,
    deadline: DateTime<Utc>,
}

/// In-flight deployment spans, keyed by request ID.
pub struct SpanRegistry {
    spans: Mutex<HashMap<String, TrackedSpan>>,
}

impl SpanRegistry {
    pub fn new() -> Self {
        SpanRegistry {
            spans: Mutex::new(HashMap::new()),
        }
    }

    pub fn open(&self, id: &str, span: Span, deadline: DateTime<Utc>) {
        let mut spans = self.spans.lock().expect("span registry lock");
        spans.insert(id.to_string(), TrackedSpan { span, deadline });
    }

    /// Close and drop the span for a finished deployment.
    pub fn close(&self, id: &str) -> Option<Span> {
        let mut spans = self.spans.lock().expect("span registry lock");
        spans.remove(id).map(|tracked| tracked.span)
    }

    /// Drop spans whose deadline passed more than the grace period ago.
    pub fn prune(&self, now: DateTime<Utc>) -> usize {
        let mut spans = self.spans.lock().expect("span registry lock");
        let before = spans.len();
        spans.retain(|id, tracked| {
            let keep = tracked.deadline + PRUNE_GRACE > now;
            if !keep {
                debug!(%id, "pruning span for abandoned deployment");
            }
            keep
        });
        before - spans.len()
    }

    pub fn len(&self) -> usize {
        self.spans.lock().expect("span registry lock").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Periodic prune loop; runs until the shutdown signal flips.
    pub async fn run(&self, interval: Duration, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(interval);
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let pruned = self.prune(Utc::now());
                    if pruned > 0 {
                        debug!(count = pruned, "pruned abandoned deployment spans");
                    }
                }
                _ = shutdown.changed() => break,
            }
        }
    }
}

impl Default for SpanRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tracing::info_span;

    #[test]
    fn open_close_cycle() {
        let registry = SpanRegistry::new();
        registry.open("d1", info_span!("deployment"), Utc::now());
        assert_eq!(registry.len(), 1);

        assert!(registry.close("d1").is_some());
        assert!(registry.is_empty());
        assert!(registry.close("d1").is_none());
    }

    #[test]
    fn prune_respects_grace_period() {
        let registry = SpanRegistry::new();
        let now = Utc::now();

        registry.open("recent", info_span!("deployment"), now - chrono::Duration::minutes(30));
        registry.open("stale", info_span!("deployment"), now - chrono::Duration::hours(2));

        assert_eq!(registry.prune(now), 1);
        assert_eq!(registry.len(), 1);
        assert!(registry.close("recent").is_some());
    }
}
