//! Redemption service - the redemption state machine
//!
//! ```text
//!            ┌──> REDEEMED   (business verifies before expiry)
//! PENDING ───┼──> EXPIRED    (verify or sweep after expiresAt)
//!            └──> CANCELLED  (family/admin, or saga compensation)
//! ```
//!
//! Creation is a saga over separate atomic writes: redemption row, ledger
//! debit, reward counters. A failed debit is compensated by cancelling the
//! row; a failed counter bump is logged and tolerated.

use chrono::Duration;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{error, info, warn};

use crate::clock::Clock;
use crate::codes::{generate_code, generate_payload, random_suffix, QrPayload};
use crate::config::RedemptionPolicy;
use crate::error::{RedemptionError, StorageError};
use crate::models::{
    LedgerSource, Redemption, RedemptionKind, RedemptionStatus, SourceKind,
};
use crate::store::{Stores, TransitionOutcome};

use super::events::{EventBus, RedemptionEvent};
use super::ledger_service::LedgerService;

const DEFAULT_USER_NAME: &str = "Family Member";

/// Input for redeeming an in-person reward
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateRedemptionRequest {
    pub reward_id: String,
    pub user_id: String,
    #[serde(default)]
    pub user_name: Option<String>,
    pub family_id: String,
    pub points_to_spend: i64,
    #[serde(default)]
    pub child_age: Option<u32>,
    #[serde(default)]
    pub job_ids: Vec<String>,
    #[serde(default)]
    pub city: Option<String>,
    #[serde(default, alias = "zipCode")]
    pub zip: Option<String>,
}

impl CreateRedemptionRequest {
    fn validate(&self) -> Result<(), RedemptionError> {
        for (field, value) in [
            ("rewardId", &self.reward_id),
            ("userId", &self.user_id),
            ("familyId", &self.family_id),
        ] {
            if value.trim().is_empty() {
                return Err(RedemptionError::InvalidInput(format!("{} is required", field)));
            }
        }
        Ok(())
    }
}

/// What the family app shows after a successful redemption
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RedemptionReceipt {
    pub redemption_id: String,
    pub redemption_code: String,
    pub qr_code_data: String,
    pub expires_at: chrono::DateTime<chrono::Utc>,
    pub business_name: String,
    pub reward_title: String,
    pub points_spent: i64,
}

/// Input for cancelling a pending redemption
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CancelRedemptionRequest {
    #[serde(default)]
    pub cancelled_by: Option<String>,
    #[serde(default)]
    pub reason: Option<String>,
}

/// Fields fixed before a code is issued
pub(crate) struct RedemptionDraft {
    pub reward_id: String,
    pub user_id: String,
    pub user_name: Option<String>,
    pub family_id: String,
    pub child_age: Option<u32>,
    pub kind: RedemptionKind,
    pub points_spent: i64,
    pub jobs_used: Vec<String>,
    pub business_id: String,
    pub city: Option<String>,
    pub zip: Option<String>,
    pub affiliate_click_id: Option<String>,
}

pub struct RedemptionService {
    stores: Stores,
    ledger: Arc<LedgerService>,
    clock: Arc<dyn Clock>,
    events: Arc<EventBus>,
    policy: RedemptionPolicy,
}

impl RedemptionService {
    pub fn new(
        stores: Stores,
        ledger: Arc<LedgerService>,
        clock: Arc<dyn Clock>,
        events: Arc<EventBus>,
        policy: RedemptionPolicy,
    ) -> Self {
        Self {
            stores,
            ledger,
            clock,
            events,
            policy,
        }
    }

    // =========================================================================
    // Read Operations
    // =========================================================================

    pub async fn get(&self, id: &str) -> Result<Redemption, RedemptionError> {
        self.stores
            .redemptions
            .get(id)
            .await?
            .ok_or_else(|| RedemptionError::RedemptionNotFound(id.to_string()))
    }

    pub async fn list_for_family(&self, family_id: &str) -> Result<Vec<Redemption>, RedemptionError> {
        let all = self.stores.redemptions.list_all().await?;
        Ok(all.into_iter().filter(|r| r.family_id == family_id).collect())
    }

    pub async fn list_for_business(
        &self,
        business_id: &str,
    ) -> Result<Vec<Redemption>, RedemptionError> {
        let all = self.stores.redemptions.list_all().await?;
        Ok(all.into_iter().filter(|r| r.business_id == business_id).collect())
    }

    // =========================================================================
    // Write Operations
    // =========================================================================

    /// Redeem an in-person reward: debit points and issue a 48h code
    pub async fn create_redemption(
        &self,
        request: CreateRedemptionRequest,
    ) -> Result<RedemptionReceipt, RedemptionError> {
        request.validate()?;
        info!(
            reward_id = %request.reward_id,
            user_id = %request.user_id,
            points = request.points_to_spend,
            "Redeem reward request"
        );

        // Preconditions: no side effects before this block passes
        let reward = self
            .stores
            .rewards
            .get_reward(&request.reward_id)
            .await?
            .ok_or_else(|| RedemptionError::RewardNotFound(request.reward_id.clone()))?;

        if !reward.is_redeemable() {
            return Err(RedemptionError::RewardInactive(reward.id));
        }
        if request.points_to_spend != reward.point_cost {
            return Err(RedemptionError::PointsMismatch {
                expected: reward.point_cost,
                actual: request.points_to_spend,
            });
        }
        if request.points_to_spend <= 0 {
            return Err(RedemptionError::InvalidAmount(request.points_to_spend));
        }
        if !reward.has_inventory() {
            return Err(RedemptionError::RewardSoldOut(reward.id));
        }
        if self.policy.require_sufficient_balance {
            let available = self.ledger.get_balance(&request.user_id).await?;
            if available < reward.point_cost {
                return Err(RedemptionError::InsufficientPoints {
                    available,
                    required: reward.point_cost,
                });
            }
        }

        // Only the owning business can verify, so a code without one is dead on issue
        let business_id = match reward.business_id.as_deref() {
            Some(id) if !id.trim().is_empty() => id.to_string(),
            _ => return Err(RedemptionError::RewardInactive(reward.id)),
        };
        let business_name = self.business_name(&business_id).await;

        let redemption = self
            .issue(RedemptionDraft {
                reward_id: reward.id.clone(),
                user_id: request.user_id,
                user_name: request.user_name,
                family_id: request.family_id,
                child_age: request.child_age,
                kind: RedemptionKind::InPerson,
                points_spent: request.points_to_spend,
                jobs_used: request.job_ids,
                business_id,
                city: request.city,
                zip: request.zip,
                affiliate_click_id: None,
            })
            .await?;

        let source = LedgerSource::new(SourceKind::Redemption, &redemption.id)
            .with_description(format!("Redeemed: {}", reward.title));
        let debit = if self.policy.require_sufficient_balance {
            self.ledger
                .record_spend_checked(
                    &redemption.user_id,
                    &redemption.family_id,
                    redemption.points_spent,
                    source,
                )
                .await
        } else {
            self.ledger
                .record_spend(
                    &redemption.user_id,
                    &redemption.family_id,
                    redemption.points_spent,
                    source,
                )
                .await
        };
        let entry_id = match debit {
            Ok(entry_id) => entry_id,
            Err(e) => {
                self.compensate(&redemption, "ledger debit failed").await;
                return Err(e);
            }
        };
        self.link_debit(&redemption.id, &entry_id).await;

        self.bump_counters(&reward.id).await;

        self.events.emit(RedemptionEvent::RedemptionCreated {
            id: redemption.id.clone(),
            reward_id: reward.id.clone(),
            business_id: redemption.business_id.clone(),
            points_spent: redemption.points_spent,
        });

        Ok(RedemptionReceipt {
            redemption_id: redemption.id,
            redemption_code: redemption.redemption_code,
            qr_code_data: redemption.qr_code_data,
            expires_at: redemption.expires_at,
            business_name,
            reward_title: reward.title,
            points_spent: redemption.points_spent,
        })
    }

    /// Cancel a pending redemption, refunding its points when configured
    pub async fn cancel(
        &self,
        id: &str,
        request: CancelRedemptionRequest,
    ) -> Result<Redemption, RedemptionError> {
        let current = self.get(id).await?;
        if !current.status.can_transition_to(RedemptionStatus::Cancelled) {
            return Err(invalid_transition(current.status, RedemptionStatus::Cancelled));
        }

        let reason = match (request.reason, request.cancelled_by) {
            (Some(reason), Some(by)) => format!("{} (by {})", reason, by),
            (Some(reason), None) => reason,
            (None, Some(by)) => format!("Cancelled by {}", by),
            (None, None) => "Cancelled".to_string(),
        };

        let now = self.clock.now();
        let cancelled = match self
            .stores
            .redemptions
            .update_if_status(RedemptionStatus::Pending, &current.cancelled(now, &reason))
            .await?
        {
            TransitionOutcome::Applied(r) => r,
            TransitionOutcome::StatusMismatch(found) => {
                return Err(invalid_transition(found.status, RedemptionStatus::Cancelled))
            }
            TransitionOutcome::NotFound => {
                return Err(RedemptionError::RedemptionNotFound(id.to_string()))
            }
        };

        let refunded = if self.policy.refund_on_cancel && self.debit_posted(&cancelled).await {
            self.refund(&cancelled).await
        } else {
            false
        };

        self.events.emit(RedemptionEvent::RedemptionCancelled {
            id: cancelled.id.clone(),
            reason,
            refunded,
        });

        self.get(id).await
    }

    /// Move every overdue PENDING redemption to EXPIRED. Runs only when asked.
    pub async fn expire_stale(&self) -> Result<usize, RedemptionError> {
        let now = self.clock.now();
        let mut expired = 0;

        for redemption in self.stores.redemptions.list_all().await? {
            if redemption.status != RedemptionStatus::Pending || !redemption.is_expired_at(now) {
                continue;
            }
            if let TransitionOutcome::Applied(r) = self
                .stores
                .redemptions
                .update_if_status(RedemptionStatus::Pending, &redemption.expired(now))
                .await?
            {
                expired += 1;
                self.events.emit(RedemptionEvent::RedemptionExpired { id: r.id });
            }
        }

        info!(expired, "Expiry sweep complete");
        self.events.emit(RedemptionEvent::ExpirySweepCompleted { expired });
        Ok(expired)
    }

    // =========================================================================
    // Saga steps
    // =========================================================================

    /// Persist a PENDING redemption under a fresh unique code
    pub(crate) async fn issue(&self, draft: RedemptionDraft) -> Result<Redemption, RedemptionError> {
        let hold = match draft.kind {
            RedemptionKind::InPerson => Duration::hours(self.policy.in_person_hold_hours),
            RedemptionKind::Affiliate => Duration::days(self.policy.affiliate_hold_days),
        };

        let mut attempt = 0;
        loop {
            attempt += 1;
            let now = self.clock.now();
            let id = format!("redeem-{}-{}", now.timestamp_millis(), random_suffix());
            let code = generate_code();
            let qr_code_data = generate_payload(&QrPayload {
                redemption_id: id.clone(),
                redemption_code: code.clone(),
                reward_id: draft.reward_id.clone(),
                business_id: draft.business_id.clone(),
                user_id: draft.user_id.clone(),
                points_spent: draft.points_spent,
                timestamp: now,
            })?;

            let redemption = Redemption {
                id,
                reward_id: draft.reward_id.clone(),
                user_id: draft.user_id.clone(),
                user_name: draft
                    .user_name
                    .clone()
                    .unwrap_or_else(|| DEFAULT_USER_NAME.to_string()),
                family_id: draft.family_id.clone(),
                child_age: draft.child_age,
                kind: draft.kind,
                points_spent: draft.points_spent,
                jobs_used: draft.jobs_used.clone(),
                ledger_entry_ids: Vec::new(),
                redemption_code: code,
                qr_code_data,
                status: RedemptionStatus::Pending,
                created_at: now,
                expires_at: now + hold,
                fulfilled_at: None,
                cancelled_at: None,
                cancel_reason: None,
                business_id: draft.business_id.clone(),
                business_verified_at: None,
                business_verified_by: None,
                redemption_city: draft.city.clone(),
                redemption_zip: draft.zip.clone(),
                affiliate_click_id: draft.affiliate_click_id.clone(),
                updated_at: now,
            };

            match self.stores.redemptions.insert(&redemption).await {
                Ok(()) => return Ok(redemption),
                Err(StorageError::Conflict(reason)) if attempt < self.policy.max_code_attempts => {
                    warn!(attempt, reason = %reason, "Redemption code collision, regenerating");
                }
                Err(e) => return Err(e.into()),
            }
        }
    }

    /// Attach a ledger entry id to the redemption, whatever its status
    async fn link_entry(
        &self,
        redemption_id: &str,
        entry_id: &str,
    ) -> Result<Redemption, RedemptionError> {
        loop {
            let mut current = self.get(redemption_id).await?;
            let status = current.status;
            current.ledger_entry_ids.push(entry_id.to_string());
            current.updated_at = self.clock.now();

            match self.stores.redemptions.update_if_status(status, &current).await? {
                TransitionOutcome::Applied(r) => return Ok(r),
                TransitionOutcome::StatusMismatch(_) => continue,
                TransitionOutcome::NotFound => {
                    return Err(RedemptionError::RedemptionNotFound(redemption_id.to_string()))
                }
            }
        }
    }

    /// Link the debit once it has posted. The points are already spent, so a
    /// failure here is reported and the caller still gets its receipt.
    pub(crate) async fn link_debit(&self, redemption_id: &str, entry_id: &str) {
        if let Err(e) = self.link_entry(redemption_id, entry_id).await {
            warn!(redemption_id = %redemption_id, entry_id = %entry_id, error = %e, "Debit posted but not linked");
            self.events.emit(RedemptionEvent::LedgerLinkFailed {
                redemption_id: redemption_id.to_string(),
                entry_id: entry_id.to_string(),
                error: e.to_string(),
            });
        }
    }

    /// Whether the ledger holds a debit for this redemption, linked or not
    async fn debit_posted(&self, redemption: &Redemption) -> bool {
        if !redemption.ledger_entry_ids.is_empty() {
            return true;
        }
        match self.ledger.history(&redemption.user_id).await {
            Ok(entries) => entries
                .iter()
                .any(|e| e.amount < 0 && e.redemption_id.as_deref() == Some(redemption.id.as_str())),
            Err(e) => {
                warn!(redemption_id = %redemption.id, error = %e, "Could not read ledger, skipping refund");
                false
            }
        }
    }

    /// Undo a half-created redemption
    pub(crate) async fn compensate(&self, redemption: &Redemption, reason: &str) {
        let cancelled = redemption.cancelled(self.clock.now(), reason);
        match self
            .stores
            .redemptions
            .update_if_status(RedemptionStatus::Pending, &cancelled)
            .await
        {
            Ok(TransitionOutcome::Applied(_)) => {
                warn!(redemption_id = %redemption.id, reason = %reason, "Redemption compensated");
                self.events.emit(RedemptionEvent::RedemptionCancelled {
                    id: redemption.id.clone(),
                    reason: reason.to_string(),
                    refunded: false,
                });
            }
            Ok(outcome) => {
                error!(redemption_id = %redemption.id, outcome = ?outcome, "Compensation found redemption already moved");
            }
            Err(e) => {
                error!(redemption_id = %redemption.id, error = %e, "Compensation failed; redemption left PENDING");
            }
        }
    }

    async fn refund(&self, cancelled: &Redemption) -> bool {
        let source = LedgerSource::new(SourceKind::Redemption, &cancelled.id)
            .with_description("Refund: cancelled redemption");
        let entry_id = match self
            .ledger
            .record_earn(
                &cancelled.user_id,
                &cancelled.family_id,
                cancelled.points_spent,
                source,
            )
            .await
        {
            Ok(entry_id) => entry_id,
            Err(e) => {
                error!(redemption_id = %cancelled.id, error = %e, "Refund failed after cancellation");
                return false;
            }
        };
        if let Err(e) = self.link_entry(&cancelled.id, &entry_id).await {
            warn!(redemption_id = %cancelled.id, entry_id = %entry_id, error = %e, "Refund entry not linked");
        }
        true
    }

    async fn business_name(&self, business_id: &str) -> String {
        match self.stores.businesses.get_business(business_id).await {
            Ok(Some(business)) => business.name,
            Ok(None) => self.policy.default_business_name.clone(),
            Err(e) => {
                warn!(business_id = %business_id, error = %e, "Could not fetch business name, using default");
                self.policy.default_business_name.clone()
            }
        }
    }

    pub(crate) async fn bump_counters(&self, reward_id: &str) {
        let error = match self.stores.rewards.increment_redemptions(reward_id).await {
            Ok(Some(_)) => return,
            Ok(None) => "reward disappeared".to_string(),
            Err(e) => e.to_string(),
        };
        warn!(reward_id = %reward_id, error = %error, "Reward redemption counter not incremented");
        self.events.emit(RedemptionEvent::CounterIncrementFailed {
            reward_id: reward_id.to_string(),
            error,
        });
    }
}

fn invalid_transition(from: RedemptionStatus, to: RedemptionStatus) -> RedemptionError {
    RedemptionError::InvalidTransition {
        from: from.to_string(),
        to: to.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::SystemClock;
    use crate::error::StorageError;
    use crate::models::{PointsLedgerEntry, Reward};
    use crate::store::{AppendOutcome, LedgerStore, MemoryStore, RedemptionStore, SpendGuard};
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicBool, Ordering};

    /// Ledger that refuses every append
    struct RefusingLedger;

    #[async_trait]
    impl LedgerStore for RefusingLedger {
        async fn append(
            &self,
            _entry: &PointsLedgerEntry,
            _guard: SpendGuard,
        ) -> Result<AppendOutcome, StorageError> {
            Err(StorageError::Internal("ledger offline".into()))
        }

        async fn entries_for_user(&self, _user_id: &str) -> Result<Vec<PointsLedgerEntry>, StorageError> {
            Ok(Vec::new())
        }

        async fn entries_for_family(
            &self,
            _family_id: &str,
        ) -> Result<Vec<PointsLedgerEntry>, StorageError> {
            Ok(Vec::new())
        }
    }

    /// Redemption table whose status writes fail while `failing` is set
    struct FlakyRedemptions {
        inner: MemoryStore,
        failing: AtomicBool,
    }

    #[async_trait]
    impl RedemptionStore for FlakyRedemptions {
        async fn insert(&self, redemption: &Redemption) -> Result<(), StorageError> {
            self.inner.insert(redemption).await
        }

        async fn get(&self, id: &str) -> Result<Option<Redemption>, StorageError> {
            self.inner.get(id).await
        }

        async fn find_by_code(&self, code: &str) -> Result<Option<Redemption>, StorageError> {
            self.inner.find_by_code(code).await
        }

        async fn update_if_status(
            &self,
            expected: RedemptionStatus,
            updated: &Redemption,
        ) -> Result<TransitionOutcome, StorageError> {
            if self.failing.load(Ordering::SeqCst) {
                return Err(StorageError::Internal("write timed out".into()));
            }
            self.inner.update_if_status(expected, updated).await
        }

        async fn list_all(&self) -> Result<Vec<Redemption>, StorageError> {
            self.inner.list_all().await
        }

        async fn count(&self) -> Result<usize, StorageError> {
            self.inner.count().await
        }
    }

    fn service(stores: Stores) -> RedemptionService {
        let clock: Arc<dyn Clock> = Arc::new(SystemClock);
        let events = Arc::new(EventBus::new());
        let ledger = Arc::new(LedgerService::new(stores.ledger.clone(), clock.clone(), events.clone()));
        RedemptionService::new(stores, ledger, clock, events, RedemptionPolicy::default())
    }

    fn request() -> CreateRedemptionRequest {
        CreateRedemptionRequest {
            reward_id: "r1".into(),
            user_id: "kid-1".into(),
            user_name: None,
            family_id: "fam-1".into(),
            points_to_spend: 100,
            child_age: Some(9),
            job_ids: vec!["job-1".into()],
            city: None,
            zip: None,
        }
    }

    async fn put_reward(stores: &Stores) {
        let reward: Reward = serde_json::from_value(serde_json::json!({
            "id": "r1", "title": "Free Cone", "pointCost": 100,
            "status": "ACTIVE", "businessId": "biz-1"
        }))
        .unwrap();
        stores.rewards.put_reward(&reward).await.unwrap();
    }

    #[tokio::test]
    async fn test_failed_debit_cancels_the_redemption() {
        let memory = Arc::new(MemoryStore::new());
        let mut stores = Stores::from_backend(memory);
        stores.ledger = Arc::new(RefusingLedger);
        put_reward(&stores).await;

        let service = service(stores.clone());
        let err = service.create_redemption(request()).await.unwrap_err();
        assert!(matches!(err, RedemptionError::Storage(StorageError::Internal(_))));

        let all = stores.redemptions.list_all().await.unwrap();
        assert_eq!(all.len(), 1);
        assert_eq!(all[0].status, RedemptionStatus::Cancelled);
        assert_eq!(all[0].cancel_reason.as_deref(), Some("ledger debit failed"));
        assert!(all[0].ledger_entry_ids.is_empty());

        // Counters only move for completed redemptions
        let reward = stores.rewards.get_reward("r1").await.unwrap().unwrap();
        assert_eq!(reward.current_redemptions, 0);
    }

    #[tokio::test]
    async fn test_defaults_fill_missing_names() {
        let stores = Stores::in_memory();
        put_reward(&stores).await;
        let service = service(stores);

        let receipt = service.create_redemption(request()).await.unwrap();
        let redemption = service.get(&receipt.redemption_id).await.unwrap();
        assert_eq!(redemption.user_name, "Family Member");
        assert_eq!(redemption.jobs_used, vec!["job-1".to_string()]);
        assert!(redemption.id.starts_with("redeem-"));
    }

    #[tokio::test]
    async fn test_blank_ids_rejected_before_lookup() {
        let service = service(Stores::in_memory());
        let mut blank = request();
        blank.user_id = "  ".into();
        assert!(matches!(
            service.create_redemption(blank).await,
            Err(RedemptionError::InvalidInput(_))
        ));
    }

    #[tokio::test]
    async fn test_unlinked_debit_still_returns_receipt_and_refunds() {
        let redemptions = Arc::new(FlakyRedemptions {
            inner: MemoryStore::new(),
            failing: AtomicBool::new(true),
        });
        let mut stores = Stores::in_memory();
        stores.redemptions = redemptions.clone();
        put_reward(&stores).await;

        let service = service(stores.clone());
        let mut events = service.events.subscribe();

        let receipt = service.create_redemption(request()).await.unwrap();
        assert_eq!(service.ledger.get_balance("kid-1").await.unwrap(), -100);

        let stored = service.get(&receipt.redemption_id).await.unwrap();
        assert_eq!(stored.status, RedemptionStatus::Pending);
        assert!(stored.ledger_entry_ids.is_empty());

        let mut link_failed = false;
        while let Ok(event) = events.try_recv() {
            if let RedemptionEvent::LedgerLinkFailed { redemption_id, .. } = event {
                assert_eq!(redemption_id, receipt.redemption_id);
                link_failed = true;
            }
        }
        assert!(link_failed);

        // Cancel finds the debit through the ledger and gives the points back
        redemptions.failing.store(false, Ordering::SeqCst);
        let cancelled = service
            .cancel(&receipt.redemption_id, CancelRedemptionRequest::default())
            .await
            .unwrap();
        assert_eq!(cancelled.status, RedemptionStatus::Cancelled);
        assert_eq!(service.ledger.get_balance("kid-1").await.unwrap(), 0);
    }
}
