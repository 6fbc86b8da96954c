//! Storage seams for the redemption core
//!
//! Each logical table sits behind an async trait so the services never know
//! whether they talk to sled or to memory.
//!
//! ## Architecture
//!
//! ```text
//! Services (redemption, verification, affiliate, ledger)
//!     ↓
//! Store traits (this module)
//!     ↓
//! SledStore (one tree per table)  |  MemoryStore (dashmap)
//! ```
//!
//! Writes that guard invariants are conditional:
//! - redemption inserts fail on a taken id or code
//! - status changes compare-and-swap on the expected current status
//! - checked spends atomically test the running balance

pub mod memory;
pub mod sled_store;

pub use memory::MemoryStore;
pub use sled_store::SledStore;

use async_trait::async_trait;
use std::sync::Arc;

use crate::error::StorageError;
use crate::models::{
    AffiliateClick, Business, PointsLedgerEntry, Redemption, RedemptionStatus, Reward,
};

/// Whether an append must keep the user's balance non-negative
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SpendGuard {
    Unchecked,
    RequireNonNegative,
}

/// Result of a ledger append
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AppendOutcome {
    Appended,
    /// Guard tripped; balance at the time of the check
    Rejected { balance: i64 },
    /// Balance would leave the i64 range; nothing written
    Overflow { balance: i64 },
}

/// Result of a conditional status write
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransitionOutcome {
    Applied(Redemption),
    /// Status had already moved on; carries the record as found
    StatusMismatch(Redemption),
    NotFound,
}

#[async_trait]
pub trait LedgerStore: Send + Sync {
    /// Append one immutable entry
    async fn append(
        &self,
        entry: &PointsLedgerEntry,
        guard: SpendGuard,
    ) -> Result<AppendOutcome, StorageError>;

    /// Entries for a user, oldest first
    async fn entries_for_user(&self, user_id: &str) -> Result<Vec<PointsLedgerEntry>, StorageError>;

    /// Entries for a family, oldest first
    async fn entries_for_family(&self, family_id: &str)
        -> Result<Vec<PointsLedgerEntry>, StorageError>;
}

#[async_trait]
pub trait RedemptionStore: Send + Sync {
    /// Insert a new redemption. Fails with `Conflict` if the id or code is taken.
    async fn insert(&self, redemption: &Redemption) -> Result<(), StorageError>;

    async fn get(&self, id: &str) -> Result<Option<Redemption>, StorageError>;

    /// Exact match through the unique code index
    async fn find_by_code(&self, code: &str) -> Result<Option<Redemption>, StorageError>;

    /// Replace the record only if its stored status is still `expected`
    async fn update_if_status(
        &self,
        expected: RedemptionStatus,
        updated: &Redemption,
    ) -> Result<TransitionOutcome, StorageError>;

    async fn list_all(&self) -> Result<Vec<Redemption>, StorageError>;

    async fn count(&self) -> Result<usize, StorageError>;
}

#[async_trait]
pub trait RewardDirectory: Send + Sync {
    async fn get_reward(&self, id: &str) -> Result<Option<Reward>, StorageError>;

    async fn put_reward(&self, reward: &Reward) -> Result<(), StorageError>;

    /// Atomically bump `redemptions` and `current_redemptions`
    async fn increment_redemptions(&self, id: &str) -> Result<Option<Reward>, StorageError>;

    /// Atomically bump `affiliate_click_count`
    async fn increment_affiliate_clicks(&self, id: &str) -> Result<Option<Reward>, StorageError>;
}

#[async_trait]
pub trait BusinessDirectory: Send + Sync {
    async fn get_business(&self, id: &str) -> Result<Option<Business>, StorageError>;

    async fn put_business(&self, business: &Business) -> Result<(), StorageError>;
}

#[async_trait]
pub trait AffiliateClickStore: Send + Sync {
    async fn insert_click(&self, click: &AffiliateClick) -> Result<(), StorageError>;

    async fn get_click(&self, id: &str) -> Result<Option<AffiliateClick>, StorageError>;
}

/// Apply a transition on top of the stored record.
///
/// Ledger links only ever grow, so ids the stored copy has and the
/// caller's copy lacks were added by a concurrent writer and are kept.
pub(crate) fn carry_ledger_links(current: &Redemption, updated: &Redemption) -> Redemption {
    let mut next = updated.clone();
    for id in &current.ledger_entry_ids {
        if !next.ledger_entry_ids.contains(id) {
            next.ledger_entry_ids.push(id.clone());
        }
    }
    next
}

/// Handles to every table, shared by the services
#[derive(Clone)]
pub struct Stores {
    pub ledger: Arc<dyn LedgerStore>,
    pub redemptions: Arc<dyn RedemptionStore>,
    pub rewards: Arc<dyn RewardDirectory>,
    pub businesses: Arc<dyn BusinessDirectory>,
    pub affiliate_clicks: Arc<dyn AffiliateClickStore>,
}

impl Stores {
    /// Back every table with one store value
    pub fn from_backend<S>(backend: Arc<S>) -> Self
    where
        S: LedgerStore
            + RedemptionStore
            + RewardDirectory
            + BusinessDirectory
            + AffiliateClickStore
            + 'static,
    {
        Self {
            ledger: backend.clone(),
            redemptions: backend.clone(),
            rewards: backend.clone(),
            businesses: backend.clone(),
            affiliate_clicks: backend,
        }
    }

    pub fn in_memory() -> Self {
        Self::from_backend(Arc::new(MemoryStore::new()))
    }
}
