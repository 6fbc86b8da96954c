//! Service layer for rewards-redemption
//!
//! Services hold the business rules between HTTP handlers and the stores.
//! Each one validates input, orchestrates the multi-step writes, and emits an
//! event once a write commits.
//!
//! ## Architecture
//!
//! ```text
//! HTTP Handlers (thin)
//!     ↓
//! Service Layer (ledger, redemption, verification, affiliate)
//!     ↓
//! Store traits (store/*.rs)
//!     ↓
//! sled trees / in-memory maps
//! ```

pub mod response;
pub mod events;
pub mod ledger_service;
pub mod redemption_service;
pub mod verification_service;
pub mod affiliate_service;

// Re-exports
pub use response::*;
pub use events::{spawn_logging_listener, EventBus, EventListener, RedemptionEvent};
pub use ledger_service::{EarnRequest, LedgerService};
pub use redemption_service::{
    CancelRedemptionRequest, CreateRedemptionRequest, RedemptionReceipt, RedemptionService,
};
pub use verification_service::{VerificationResult, VerificationService, VerifyRedemptionRequest};
pub use affiliate_service::{AffiliateClickResult, AffiliateService, TrackAffiliateClickRequest};

use crate::clock::Clock;
use crate::config::RedemptionPolicy;
use crate::store::Stores;
use std::sync::Arc;

/// Service container for dependency injection
///
/// All services share one set of stores, one clock and one event bus.
/// Pass this to HttpServer for handler access.
pub struct Services {
    pub ledger: Arc<LedgerService>,
    pub redemptions: Arc<RedemptionService>,
    pub verification: Arc<VerificationService>,
    pub affiliate: Arc<AffiliateService>,
    pub events: Arc<EventBus>,
    pub stores: Stores,
}

impl Services {
    /// Create all services over the given stores
    pub fn new(stores: Stores, clock: Arc<dyn Clock>, policy: RedemptionPolicy) -> Self {
        let events = Arc::new(EventBus::new());

        let ledger = Arc::new(LedgerService::new(
            stores.ledger.clone(),
            clock.clone(),
            events.clone(),
        ));
        let redemptions = Arc::new(RedemptionService::new(
            stores.clone(),
            ledger.clone(),
            clock.clone(),
            events.clone(),
            policy.clone(),
        ));
        let verification = Arc::new(VerificationService::new(
            stores.redemptions.clone(),
            clock.clone(),
            events.clone(),
            policy.unknown_operator_label.clone(),
        ));
        let affiliate = Arc::new(AffiliateService::new(
            stores.clone(),
            ledger.clone(),
            redemptions.clone(),
            clock,
            events.clone(),
            policy.amazon_associate_tag,
        ));

        Self {
            ledger,
            redemptions,
            verification,
            affiliate,
            events,
            stores,
        }
    }
}
