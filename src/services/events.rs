//! Event system for redemption operations
//!
//! Services emit an event after every committed write. Listeners use them for:
//! - Audit logging
//! - Business portal notifications
//! - Analytics counters kept outside this core

use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::{debug, info, trace, warn};

/// Events emitted by services
#[derive(Debug, Clone)]
pub enum RedemptionEvent {
    // Ledger events
    PointsEarned {
        entry_id: String,
        user_id: String,
        amount: i64,
    },
    PointsSpent {
        entry_id: String,
        user_id: String,
        amount: i64,
    },

    // Redemption lifecycle
    RedemptionCreated {
        id: String,
        reward_id: String,
        business_id: String,
        points_spent: i64,
    },
    RedemptionFulfilled {
        id: String,
        business_id: String,
        verified_by: String,
    },
    RedemptionExpired {
        id: String,
    },
    RedemptionCancelled {
        id: String,
        reason: String,
        refunded: bool,
    },
    ExpirySweepCompleted {
        expired: usize,
    },

    // Degradations that did not fail the request
    CounterIncrementFailed {
        reward_id: String,
        error: String,
    },
    LedgerLinkFailed {
        redemption_id: String,
        entry_id: String,
        error: String,
    },

    // Affiliate events
    AffiliateClickTracked {
        click_id: String,
        reward_id: String,
        redemption_id: String,
    },
}

/// Trait for event listeners
pub trait EventListener: Send + Sync {
    /// Handle an event
    fn on_event(&self, event: &RedemptionEvent);
}

/// Event bus for broadcasting redemption events
pub struct EventBus {
    sender: broadcast::Sender<RedemptionEvent>,
}

impl EventBus {
    /// Create a new event bus with default capacity
    pub fn new() -> Self {
        Self::with_capacity(1024)
    }

    /// Create a new event bus with specified capacity
    pub fn with_capacity(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self { sender }
    }

    /// Emit an event to all subscribers
    pub fn emit(&self, event: RedemptionEvent) {
        trace!(event = ?event, "Emitting redemption event");
        // No subscribers is fine
        let _ = self.sender.send(event);
    }

    /// Subscribe to events
    pub fn subscribe(&self) -> broadcast::Receiver<RedemptionEvent> {
        self.sender.subscribe()
    }

    /// Get the number of active subscribers
    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

/// Logging event listener for audit trails
pub struct LoggingEventListener;

impl EventListener for LoggingEventListener {
    fn on_event(&self, event: &RedemptionEvent) {
        match event {
            RedemptionEvent::RedemptionCreated {
                id,
                reward_id,
                business_id,
                points_spent,
            } => {
                info!(
                    redemption_id = %id,
                    reward_id = %reward_id,
                    business_id = %business_id,
                    points = points_spent,
                    "Redemption created"
                );
            }
            RedemptionEvent::RedemptionFulfilled { id, business_id, verified_by } => {
                info!(
                    redemption_id = %id,
                    business_id = %business_id,
                    verified_by = %verified_by,
                    "Redemption fulfilled"
                );
            }
            RedemptionEvent::RedemptionCancelled { id, reason, refunded } => {
                info!(redemption_id = %id, reason = %reason, refunded, "Redemption cancelled");
            }
            RedemptionEvent::CounterIncrementFailed { reward_id, error } => {
                warn!(reward_id = %reward_id, error = %error, "Reward counter not incremented");
            }
            RedemptionEvent::LedgerLinkFailed { redemption_id, entry_id, error } => {
                warn!(
                    redemption_id = %redemption_id,
                    entry_id = %entry_id,
                    error = %error,
                    "Ledger entry not linked to redemption"
                );
            }
            _ => {
                debug!(event = ?event, "Redemption event");
            }
        }
    }
}

/// Spawn a background task that logs all events
pub fn spawn_logging_listener(event_bus: Arc<EventBus>) -> tokio::task::JoinHandle<()> {
    let mut receiver = event_bus.subscribe();
    let listener = LoggingEventListener;

    tokio::spawn(async move {
        loop {
            match receiver.recv().await {
                Ok(event) => listener.on_event(&event),
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    debug!(skipped = n, "Event listener lagged, skipped events");
                }
                Err(broadcast::error::RecvError::Closed) => {
                    debug!("Event bus closed, stopping listener");
                    break;
                }
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::time::{timeout, Duration};

    #[tokio::test]
    async fn test_event_bus_emit_receive() {
        let bus = EventBus::new();
        let mut receiver = bus.subscribe();

        bus.emit(RedemptionEvent::RedemptionFulfilled {
            id: "redeem-1".into(),
            business_id: "biz-1".into(),
            verified_by: "Sam".into(),
        });

        let event = timeout(Duration::from_millis(100), receiver.recv())
            .await
            .expect("timeout")
            .expect("receive error");

        match event {
            RedemptionEvent::RedemptionFulfilled { id, verified_by, .. } => {
                assert_eq!(id, "redeem-1");
                assert_eq!(verified_by, "Sam");
            }
            _ => panic!("Wrong event type"),
        }
    }

    #[test]
    fn test_event_bus_no_subscribers() {
        let bus = EventBus::new();
        assert_eq!(bus.subscriber_count(), 0);
        bus.emit(RedemptionEvent::RedemptionExpired { id: "redeem-1".into() });
    }
}
