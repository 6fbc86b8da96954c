//! Verification service - business-side fulfillment
//!
//! A business operator scans or types a code. The stored redemption is the
//! only authority; the QR payload is never consulted here.

use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{info, warn};

use crate::clock::Clock;
use crate::codes::{is_well_formed_code, normalize_code};
use crate::error::RedemptionError;
use crate::models::{Redemption, RedemptionStatus};
use crate::store::{RedemptionStore, TransitionOutcome};

use super::events::{EventBus, RedemptionEvent};

/// Input from the business portal
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VerifyRedemptionRequest {
    pub redemption_code: String,
    pub business_id: String,
    #[serde(default)]
    pub verified_by: Option<String>,
}

/// Successful verification
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct VerificationResult {
    pub success: bool,
    pub redemption: Redemption,
}

pub struct VerificationService {
    redemptions: Arc<dyn RedemptionStore>,
    clock: Arc<dyn Clock>,
    events: Arc<EventBus>,
    unknown_operator_label: String,
}

impl VerificationService {
    pub fn new(
        redemptions: Arc<dyn RedemptionStore>,
        clock: Arc<dyn Clock>,
        events: Arc<EventBus>,
        unknown_operator_label: impl Into<String>,
    ) -> Self {
        Self {
            redemptions,
            clock,
            events,
            unknown_operator_label: unknown_operator_label.into(),
        }
    }

    /// Validate a code for a business and fulfill it.
    ///
    /// Repeating a successful call returns `AlreadyFulfilled` and leaves
    /// `fulfilled_at` untouched.
    pub async fn verify(
        &self,
        request: VerifyRedemptionRequest,
    ) -> Result<VerificationResult, RedemptionError> {
        let code = normalize_code(&request.redemption_code);
        if code.is_empty() || request.business_id.trim().is_empty() {
            return Err(RedemptionError::InvalidInput(
                "redemptionCode and businessId are required".into(),
            ));
        }
        info!(code = %code, business_id = %request.business_id, "Verify redemption");

        // Not a code we could have issued; skip the lookup
        if !is_well_formed_code(&code) {
            return Err(RedemptionError::CodeNotFound);
        }

        let mut redemption = self
            .redemptions
            .find_by_code(&code)
            .await?
            .ok_or(RedemptionError::CodeNotFound)?;

        if redemption.business_id != request.business_id {
            warn!(
                redemption_id = %redemption.id,
                business_id = %request.business_id,
                "Code presented at the wrong business"
            );
            return Err(RedemptionError::BusinessMismatch);
        }

        let verified_by = request
            .verified_by
            .filter(|v| !v.trim().is_empty())
            .unwrap_or_else(|| self.unknown_operator_label.clone());

        loop {
            check_not_terminal(redemption.status)?;

            let now = self.clock.now();
            let (next, expiring) = if redemption.is_expired_at(now) {
                (redemption.expired(now), true)
            } else {
                (redemption.fulfilled(now, &verified_by), false)
            };

            match self
                .redemptions
                .update_if_status(RedemptionStatus::Pending, &next)
                .await?
            {
                TransitionOutcome::Applied(updated) if expiring => {
                    info!(redemption_id = %updated.id, "Redemption expired at verification");
                    self.events.emit(RedemptionEvent::RedemptionExpired { id: updated.id });
                    return Err(RedemptionError::RedemptionExpired);
                }
                TransitionOutcome::Applied(updated) => {
                    info!(redemption_id = %updated.id, verified_by = %verified_by, "Redemption verified and fulfilled");
                    self.events.emit(RedemptionEvent::RedemptionFulfilled {
                        id: updated.id.clone(),
                        business_id: updated.business_id.clone(),
                        verified_by,
                    });
                    return Ok(VerificationResult {
                        success: true,
                        redemption: updated,
                    });
                }
                // Lost a race with another verifier or the sweep; judge the winner's state
                TransitionOutcome::StatusMismatch(found) => redemption = found,
                TransitionOutcome::NotFound => return Err(RedemptionError::CodeNotFound),
            }
        }
    }
}

fn check_not_terminal(status: RedemptionStatus) -> Result<(), RedemptionError> {
    match status {
        RedemptionStatus::Pending => Ok(()),
        RedemptionStatus::Redeemed => Err(RedemptionError::AlreadyFulfilled),
        RedemptionStatus::Expired => Err(RedemptionError::RedemptionExpired),
        RedemptionStatus::Cancelled => Err(RedemptionError::RedemptionCancelled),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::models::RedemptionKind;
    use crate::store::MemoryStore;
    use chrono::{Duration, TimeZone, Utc};

    fn pending(code: &str) -> Redemption {
        let at = Utc.with_ymd_and_hms(2026, 5, 2, 10, 0, 0).unwrap();
        Redemption {
            id: "redeem-1".into(),
            reward_id: "r1".into(),
            user_id: "kid-1".into(),
            user_name: "Ava".into(),
            family_id: "fam-1".into(),
            child_age: None,
            kind: RedemptionKind::InPerson,
            points_spent: 100,
            jobs_used: Vec::new(),
            ledger_entry_ids: Vec::new(),
            redemption_code: code.into(),
            qr_code_data: String::new(),
            status: RedemptionStatus::Pending,
            created_at: at,
            expires_at: at + Duration::hours(48),
            fulfilled_at: None,
            cancelled_at: None,
            cancel_reason: None,
            business_id: "biz-1".into(),
            business_verified_at: None,
            business_verified_by: None,
            redemption_city: None,
            redemption_zip: None,
            affiliate_click_id: None,
            updated_at: at,
        }
    }

    async fn setup(code: &str) -> Arc<VerificationService> {
        let store = Arc::new(MemoryStore::new());
        let redemption = pending(code);
        store.insert(&redemption).await.unwrap();
        let clock = Arc::new(ManualClock::new(redemption.created_at + Duration::hours(1)));
        Arc::new(VerificationService::new(
            store,
            clock,
            Arc::new(EventBus::new()),
            "unknown operator",
        ))
    }

    fn request(code: &str, verified_by: &str) -> VerifyRedemptionRequest {
        VerifyRedemptionRequest {
            redemption_code: code.into(),
            business_id: "biz-1".into(),
            verified_by: Some(verified_by.into()),
        }
    }

    #[tokio::test]
    async fn test_concurrent_verifiers_fulfill_once() {
        let service = setup("HJKM-NPQR-STUV").await;

        let mut handles = Vec::new();
        for i in 0..8 {
            let service = service.clone();
            handles.push(tokio::spawn(async move {
                service.verify(request("HJKM-NPQR-STUV", &format!("clerk-{}", i))).await
            }));
        }

        let mut fulfilled = 0;
        for handle in handles {
            match handle.await.unwrap() {
                Ok(result) => {
                    assert!(result.success);
                    fulfilled += 1;
                }
                Err(e) => assert!(matches!(e, RedemptionError::AlreadyFulfilled)),
            }
        }
        assert_eq!(fulfilled, 1);
    }

    #[tokio::test]
    async fn test_malformed_code_is_not_found() {
        let service = setup("HJKM-NPQR-STUV").await;
        for code in ["HJKM-NPQR-STU0", "HJKMNPQRSTUV", "   "] {
            let err = service.verify(request(code, "clerk")).await.unwrap_err();
            assert!(
                matches!(err, RedemptionError::CodeNotFound | RedemptionError::InvalidInput(_)),
                "{}: {:?}",
                code,
                err
            );
        }
    }

    #[tokio::test]
    async fn test_blank_operator_gets_label() {
        let service = setup("HJKM-NPQR-STUV").await;
        let result = service.verify(request("HJKM-NPQR-STUV", "  ")).await.unwrap();
        assert_eq!(
            result.redemption.business_verified_by.as_deref(),
            Some("unknown operator")
        );
    }
}
