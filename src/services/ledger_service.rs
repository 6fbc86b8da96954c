//! Ledger service - points accounting
//!
//! Balances are never stored on their own as the source of truth; a user's
//! balance is the sum of their entries. Every call appends exactly one entry.

use serde::Deserialize;
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::clock::Clock;
use crate::codes::random_suffix;
use crate::error::RedemptionError;
use crate::models::{LedgerSource, PointsLedgerEntry, SourceKind};
use crate::store::{AppendOutcome, LedgerStore, SpendGuard};

use super::events::{EventBus, RedemptionEvent};

/// Credit posted by a job approval, school sync or admin
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EarnRequest {
    pub user_id: String,
    pub family_id: String,
    pub amount: i64,
    #[serde(default = "default_earn_kind")]
    pub source_kind: SourceKind,
    pub source_id: String,
    #[serde(default)]
    pub description: Option<String>,
}

fn default_earn_kind() -> SourceKind {
    SourceKind::Job
}

impl EarnRequest {
    pub fn source(&self) -> LedgerSource {
        let source = LedgerSource::new(self.source_kind, &self.source_id);
        match &self.description {
            Some(description) => source.with_description(description.clone()),
            None => source,
        }
    }
}

pub struct LedgerService {
    store: Arc<dyn LedgerStore>,
    clock: Arc<dyn Clock>,
    events: Arc<EventBus>,
}

impl LedgerService {
    pub fn new(store: Arc<dyn LedgerStore>, clock: Arc<dyn Clock>, events: Arc<EventBus>) -> Self {
        Self { store, clock, events }
    }

    // =========================================================================
    // Read Operations
    // =========================================================================

    /// Sum of all signed amounts; 0 for an unknown user
    pub async fn get_balance(&self, user_id: &str) -> Result<i64, RedemptionError> {
        let entries = self.store.entries_for_user(user_id).await?;
        // Widened so an out-of-order partial sum cannot overflow
        let total: i128 = entries.iter().map(|e| i128::from(e.amount)).sum();
        i64::try_from(total).map_err(|_| RedemptionError::BalanceOverflow {
            balance: if total > 0 { i64::MAX } else { i64::MIN },
            amount: 0,
        })
    }

    /// A user's entries, oldest first
    pub async fn history(&self, user_id: &str) -> Result<Vec<PointsLedgerEntry>, RedemptionError> {
        Ok(self.store.entries_for_user(user_id).await?)
    }

    /// A family's entries across all members, oldest first
    pub async fn family_history(
        &self,
        family_id: &str,
    ) -> Result<Vec<PointsLedgerEntry>, RedemptionError> {
        Ok(self.store.entries_for_family(family_id).await?)
    }

    // =========================================================================
    // Write Operations
    // =========================================================================

    /// Append a positive entry
    pub async fn record_earn(
        &self,
        user_id: &str,
        family_id: &str,
        amount: i64,
        source: LedgerSource,
    ) -> Result<String, RedemptionError> {
        check_positive(amount)?;
        let entry = self.append(user_id, family_id, amount, source, SpendGuard::Unchecked).await?;

        info!(user_id = %user_id, amount, entry_id = %entry, "Points earned");
        self.events.emit(RedemptionEvent::PointsEarned {
            entry_id: entry.clone(),
            user_id: user_id.to_string(),
            amount,
        });
        Ok(entry)
    }

    /// Append a negative entry without looking at the balance.
    ///
    /// The caller owns the sufficiency decision; see [`Self::record_spend_checked`].
    pub async fn record_spend(
        &self,
        user_id: &str,
        family_id: &str,
        amount: i64,
        source: LedgerSource,
    ) -> Result<String, RedemptionError> {
        check_positive(amount)?;
        let entry = self.append(user_id, family_id, -amount, source, SpendGuard::Unchecked).await?;
        self.spent(user_id, amount, &entry);
        Ok(entry)
    }

    /// Append a negative entry only if the balance stays non-negative.
    ///
    /// The check and the append are one conditional write in the store.
    pub async fn record_spend_checked(
        &self,
        user_id: &str,
        family_id: &str,
        amount: i64,
        source: LedgerSource,
    ) -> Result<String, RedemptionError> {
        check_positive(amount)?;
        let entry = self
            .append(user_id, family_id, -amount, source, SpendGuard::RequireNonNegative)
            .await?;
        self.spent(user_id, amount, &entry);
        Ok(entry)
    }

    fn spent(&self, user_id: &str, amount: i64, entry_id: &str) {
        info!(user_id = %user_id, amount, entry_id = %entry_id, "Points spent");
        self.events.emit(RedemptionEvent::PointsSpent {
            entry_id: entry_id.to_string(),
            user_id: user_id.to_string(),
            amount,
        });
    }

    async fn append(
        &self,
        user_id: &str,
        family_id: &str,
        signed_amount: i64,
        source: LedgerSource,
        guard: SpendGuard,
    ) -> Result<String, RedemptionError> {
        if user_id.trim().is_empty() || family_id.trim().is_empty() {
            return Err(RedemptionError::InvalidInput(
                "userId and familyId are required".into(),
            ));
        }

        let now = self.clock.now();
        let redemption_id = match source.kind {
            SourceKind::Redemption => Some(source.id.clone()),
            _ => None,
        };
        let entry = PointsLedgerEntry {
            id: format!("pt-{}-{}", now.timestamp_millis(), random_suffix()),
            user_id: user_id.to_string(),
            family_id: family_id.to_string(),
            amount: signed_amount,
            source_kind: source.kind,
            source_id: source.id,
            description: source.description,
            redemption_id,
            timestamp: now,
        };

        match self.store.append(&entry, guard).await? {
            AppendOutcome::Appended => {
                debug!(entry_id = %entry.id, amount = signed_amount, "Ledger entry appended");
                Ok(entry.id)
            }
            AppendOutcome::Rejected { balance } => Err(RedemptionError::InsufficientPoints {
                available: balance,
                required: -signed_amount,
            }),
            AppendOutcome::Overflow { balance } => {
                warn!(user_id = %user_id, balance, amount = signed_amount, "Ledger append would overflow the balance");
                Err(RedemptionError::BalanceOverflow {
                    balance,
                    amount: signed_amount,
                })
            }
        }
    }
}

fn check_positive(amount: i64) -> Result<(), RedemptionError> {
    if amount <= 0 {
        return Err(RedemptionError::InvalidAmount(amount));
    }
    Ok(())
}
