//! In-memory store for tests and ephemeral runs
//!
//! Per-key atomicity comes from dashmap shard locks: a ledger append holds
//! the user's entry for the whole check-and-push, and a status transition
//! holds the redemption's entry for the whole compare-and-replace.

use async_trait::async_trait;
use chrono::Utc;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;

use super::{
    carry_ledger_links, AffiliateClickStore, AppendOutcome, BusinessDirectory, LedgerStore, RedemptionStore,
    RewardDirectory, SpendGuard, TransitionOutcome,
};
use crate::error::StorageError;
use crate::models::{
    AffiliateClick, Business, PointsLedgerEntry, Redemption, RedemptionStatus, Reward,
};

#[derive(Default)]
pub struct MemoryStore {
    /// user_id -> entries in append order
    ledger: DashMap<String, Vec<PointsLedgerEntry>>,
    redemptions: DashMap<String, Redemption>,
    /// redemption code -> redemption id
    codes: DashMap<String, String>,
    rewards: DashMap<String, Reward>,
    businesses: DashMap<String, Business>,
    clicks: DashMap<String, AffiliateClick>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl LedgerStore for MemoryStore {
    async fn append(
        &self,
        entry: &PointsLedgerEntry,
        guard: SpendGuard,
    ) -> Result<AppendOutcome, StorageError> {
        let mut entries = self.ledger.entry(entry.user_id.clone()).or_default();

        if entries.iter().any(|e| e.id == entry.id) {
            return Err(StorageError::Conflict(format!("ledger entry {} exists", entry.id)));
        }

        // Every accepted append kept the running sum in range
        let balance = entries.iter().fold(0i64, |sum, e| sum.saturating_add(e.amount));
        let next = match balance.checked_add(entry.amount) {
            Some(next) => next,
            None => return Ok(AppendOutcome::Overflow { balance }),
        };
        if guard == SpendGuard::RequireNonNegative && next < 0 {
            return Ok(AppendOutcome::Rejected { balance });
        }

        entries.push(entry.clone());
        Ok(AppendOutcome::Appended)
    }

    async fn entries_for_user(&self, user_id: &str) -> Result<Vec<PointsLedgerEntry>, StorageError> {
        let mut entries = self
            .ledger
            .get(user_id)
            .map(|e| e.value().clone())
            .unwrap_or_default();
        entries.sort_by_key(|e| e.timestamp);
        Ok(entries)
    }

    async fn entries_for_family(
        &self,
        family_id: &str,
    ) -> Result<Vec<PointsLedgerEntry>, StorageError> {
        let mut entries: Vec<PointsLedgerEntry> = self
            .ledger
            .iter()
            .flat_map(|user| {
                user.value()
                    .iter()
                    .filter(|e| e.family_id == family_id)
                    .cloned()
                    .collect::<Vec<_>>()
            })
            .collect();
        entries.sort_by_key(|e| e.timestamp);
        Ok(entries)
    }
}

#[async_trait]
impl RedemptionStore for MemoryStore {
    async fn insert(&self, redemption: &Redemption) -> Result<(), StorageError> {
        // Lock order: codes, then redemptions
        let code_slot = match self.codes.entry(redemption.redemption_code.clone()) {
            Entry::Occupied(_) => {
                return Err(StorageError::Conflict(format!(
                    "redemption code {} already issued",
                    redemption.redemption_code
                )))
            }
            Entry::Vacant(slot) => slot,
        };

        match self.redemptions.entry(redemption.id.clone()) {
            Entry::Occupied(_) => Err(StorageError::Conflict(format!(
                "redemption {} exists",
                redemption.id
            ))),
            Entry::Vacant(slot) => {
                slot.insert(redemption.clone());
                code_slot.insert(redemption.id.clone());
                Ok(())
            }
        }
    }

    async fn get(&self, id: &str) -> Result<Option<Redemption>, StorageError> {
        Ok(self.redemptions.get(id).map(|r| r.value().clone()))
    }

    async fn find_by_code(&self, code: &str) -> Result<Option<Redemption>, StorageError> {
        let id = match self.codes.get(code) {
            Some(id) => id.value().clone(),
            None => return Ok(None),
        };
        self.get(&id).await
    }

    async fn update_if_status(
        &self,
        expected: RedemptionStatus,
        updated: &Redemption,
    ) -> Result<TransitionOutcome, StorageError> {
        let mut current = match self.redemptions.get_mut(&updated.id) {
            Some(r) => r,
            None => return Ok(TransitionOutcome::NotFound),
        };
        if current.status != expected {
            return Ok(TransitionOutcome::StatusMismatch(current.clone()));
        }
        if current.redemption_code != updated.redemption_code {
            return Err(StorageError::Conflict("redemption code is immutable".into()));
        }
        *current = carry_ledger_links(&current, updated);
        Ok(TransitionOutcome::Applied(current.clone()))
    }

    async fn list_all(&self) -> Result<Vec<Redemption>, StorageError> {
        let mut all: Vec<Redemption> = self.redemptions.iter().map(|r| r.value().clone()).collect();
        all.sort_by_key(|r| r.created_at);
        Ok(all)
    }

    async fn count(&self) -> Result<usize, StorageError> {
        Ok(self.redemptions.len())
    }
}

#[async_trait]
impl RewardDirectory for MemoryStore {
    async fn get_reward(&self, id: &str) -> Result<Option<Reward>, StorageError> {
        Ok(self.rewards.get(id).map(|r| r.value().clone()))
    }

    async fn put_reward(&self, reward: &Reward) -> Result<(), StorageError> {
        self.rewards.insert(reward.id.clone(), reward.clone());
        Ok(())
    }

    async fn increment_redemptions(&self, id: &str) -> Result<Option<Reward>, StorageError> {
        Ok(self.rewards.get_mut(id).map(|mut reward| {
            reward.redemptions += 1;
            reward.current_redemptions += 1;
            reward.updated_at = Some(Utc::now());
            reward.clone()
        }))
    }

    async fn increment_affiliate_clicks(&self, id: &str) -> Result<Option<Reward>, StorageError> {
        Ok(self.rewards.get_mut(id).map(|mut reward| {
            reward.affiliate_click_count += 1;
            reward.updated_at = Some(Utc::now());
            reward.clone()
        }))
    }
}

#[async_trait]
impl BusinessDirectory for MemoryStore {
    async fn get_business(&self, id: &str) -> Result<Option<Business>, StorageError> {
        Ok(self.businesses.get(id).map(|b| b.value().clone()))
    }

    async fn put_business(&self, business: &Business) -> Result<(), StorageError> {
        self.businesses.insert(business.id.clone(), business.clone());
        Ok(())
    }
}

#[async_trait]
impl AffiliateClickStore for MemoryStore {
    async fn insert_click(&self, click: &AffiliateClick) -> Result<(), StorageError> {
        match self.clicks.entry(click.id.clone()) {
            Entry::Occupied(_) => Err(StorageError::Conflict(format!("click {} exists", click.id))),
            Entry::Vacant(slot) => {
                slot.insert(click.clone());
                Ok(())
            }
        }
    }

    async fn get_click(&self, id: &str) -> Result<Option<AffiliateClick>, StorageError> {
        Ok(self.clicks.get(id).map(|c| c.value().clone()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::SourceKind;
    use chrono::TimeZone;
    use std::sync::Arc;

    fn entry(id: &str, amount: i64) -> PointsLedgerEntry {
        PointsLedgerEntry {
            id: id.into(),
            user_id: "kid-1".into(),
            family_id: "fam-1".into(),
            amount,
            source_kind: SourceKind::Redemption,
            source_id: id.into(),
            description: None,
            redemption_id: None,
            timestamp: Utc.with_ymd_and_hms(2026, 4, 1, 8, 0, 0).unwrap(),
        }
    }

    #[tokio::test]
    async fn test_guarded_spends_never_overdraw() {
        let store = Arc::new(MemoryStore::new());
        store.append(&entry("earn", 250), SpendGuard::Unchecked).await.unwrap();

        let mut handles = Vec::new();
        for i in 0..10 {
            let store = store.clone();
            handles.push(tokio::spawn(async move {
                store
                    .append(&entry(&format!("spend-{}", i), -100), SpendGuard::RequireNonNegative)
                    .await
                    .unwrap()
            }));
        }

        let mut appended = 0;
        for handle in handles {
            if handle.await.unwrap() == AppendOutcome::Appended {
                appended += 1;
            }
        }
        assert_eq!(appended, 2);

        let balance: i64 = store
            .entries_for_user("kid-1")
            .await
            .unwrap()
            .iter()
            .map(|e| e.amount)
            .sum();
        assert_eq!(balance, 50);
    }

    #[tokio::test]
    async fn test_duplicate_entry_id_conflicts() {
        let store = MemoryStore::new();
        store.append(&entry("e1", 10), SpendGuard::Unchecked).await.unwrap();
        assert!(matches!(
            store.append(&entry("e1", 10), SpendGuard::Unchecked).await,
            Err(StorageError::Conflict(_))
        ));
    }

    #[tokio::test]
    async fn test_append_past_i64_max_writes_nothing() {
        let store = MemoryStore::new();
        store.append(&entry("big", i64::MAX), SpendGuard::Unchecked).await.unwrap();
        assert_eq!(
            store.append(&entry("one", 1), SpendGuard::Unchecked).await.unwrap(),
            AppendOutcome::Overflow { balance: i64::MAX }
        );
        assert_eq!(store.entries_for_user("kid-1").await.unwrap().len(), 1);
    }
}
