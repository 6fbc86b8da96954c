//! Records owned or referenced by the redemption core
//!
//! Field names serialize as camelCase so HTTP bodies line up with the
//! family app and business portal. The same structs are stored in sled
//! with named msgpack encoding.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

// ============================================================================
// Ledger
// ============================================================================

/// What produced a ledger entry
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SourceKind {
    Job,
    Redemption,
    School,
    AdminAdjustment,
}

/// Source tag attached to an earn or spend
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LedgerSource {
    pub kind: SourceKind,
    pub id: String,
    #[serde(default)]
    pub description: Option<String>,
}

impl LedgerSource {
    pub fn new(kind: SourceKind, id: impl Into<String>) -> Self {
        Self {
            kind,
            id: id.into(),
            description: None,
        }
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }
}

/// Immutable points movement. Positive = earned, negative = spent.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PointsLedgerEntry {
    pub id: String,
    pub user_id: String,
    pub family_id: String,
    pub amount: i64,
    pub source_kind: SourceKind,
    pub source_id: String,
    #[serde(default)]
    pub description: Option<String>,
    /// Set on entries that debit or refund a redemption
    #[serde(default)]
    pub redemption_id: Option<String>,
    pub timestamp: DateTime<Utc>,
}

// ============================================================================
// Redemption
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RedemptionStatus {
    Pending,
    Redeemed,
    Expired,
    Cancelled,
}

impl RedemptionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "PENDING",
            Self::Redeemed => "REDEEMED",
            Self::Expired => "EXPIRED",
            Self::Cancelled => "CANCELLED",
        }
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self, Self::Pending)
    }

    /// Only PENDING has outgoing edges.
    pub fn can_transition_to(&self, next: RedemptionStatus) -> bool {
        matches!(self, Self::Pending) && next.is_terminal()
    }
}

impl fmt::Display for RedemptionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// How the reward is delivered, which fixes the hold window
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RedemptionKind {
    InPerson,
    Affiliate,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Redemption {
    pub id: String,
    pub reward_id: String,
    pub user_id: String,
    pub user_name: String,
    pub family_id: String,
    #[serde(default)]
    pub child_age: Option<u32>,
    pub kind: RedemptionKind,
    pub points_spent: i64,
    #[serde(default)]
    pub jobs_used: Vec<String>,
    #[serde(default)]
    pub ledger_entry_ids: Vec<String>,
    pub redemption_code: String,
    pub qr_code_data: String,
    pub status: RedemptionStatus,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    #[serde(default)]
    pub fulfilled_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub cancelled_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub cancel_reason: Option<String>,
    pub business_id: String,
    #[serde(default)]
    pub business_verified_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub business_verified_by: Option<String>,
    #[serde(default)]
    pub redemption_city: Option<String>,
    #[serde(default)]
    pub redemption_zip: Option<String>,
    #[serde(default)]
    pub affiliate_click_id: Option<String>,
    pub updated_at: DateTime<Utc>,
}

impl Redemption {
    /// Expiry is strict: a verification at exactly `expires_at` still succeeds.
    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        now > self.expires_at
    }

    /// PENDING -> REDEEMED, stamping who fulfilled it
    pub fn fulfilled(&self, at: DateTime<Utc>, verified_by: &str) -> Redemption {
        let mut next = self.clone();
        next.status = RedemptionStatus::Redeemed;
        next.fulfilled_at = Some(at);
        next.business_verified_at = Some(at);
        next.business_verified_by = Some(verified_by.to_string());
        next.updated_at = at;
        next
    }

    /// PENDING -> EXPIRED
    pub fn expired(&self, at: DateTime<Utc>) -> Redemption {
        let mut next = self.clone();
        next.status = RedemptionStatus::Expired;
        next.updated_at = at;
        next
    }

    /// PENDING -> CANCELLED
    pub fn cancelled(&self, at: DateTime<Utc>, reason: &str) -> Redemption {
        let mut next = self.clone();
        next.status = RedemptionStatus::Cancelled;
        next.cancelled_at = Some(at);
        next.cancel_reason = Some(reason.to_string());
        next.updated_at = at;
        next
    }
}

// ============================================================================
// Collaborators
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RewardStatus {
    Draft,
    PendingApproval,
    Approved,
    Active,
    Paused,
    Completed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RewardSource {
    #[default]
    LocalBusiness,
    AffiliateLink,
    PlatformReward,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AffiliateNetwork {
    Amazon,
    Target,
    Walmart,
    Rakuten,
    Shareasale,
    Cj,
    #[default]
    Custom,
}

impl AffiliateNetwork {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Amazon => "AMAZON",
            Self::Target => "TARGET",
            Self::Walmart => "WALMART",
            Self::Rakuten => "RAKUTEN",
            Self::Shareasale => "SHAREASALE",
            Self::Cj => "CJ",
            Self::Custom => "CUSTOM",
        }
    }
}

/// Reward campaign, read and counter-incremented by the core
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Reward {
    pub id: String,
    pub title: String,
    pub point_cost: i64,
    pub status: RewardStatus,
    #[serde(default = "default_true")]
    pub is_active: bool,
    /// None = unlimited
    #[serde(default)]
    pub total_available: Option<i64>,
    #[serde(default)]
    pub current_redemptions: i64,
    #[serde(default)]
    pub redemptions: i64,
    #[serde(default)]
    pub business_id: Option<String>,
    #[serde(default)]
    pub reward_source: RewardSource,
    #[serde(default)]
    pub affiliate_network: Option<AffiliateNetwork>,
    #[serde(default)]
    pub affiliate_link: Option<String>,
    #[serde(default)]
    pub affiliate_click_count: i64,
    #[serde(default)]
    pub updated_at: Option<DateTime<Utc>>,
}

fn default_true() -> bool {
    true
}

impl Reward {
    pub fn is_redeemable(&self) -> bool {
        self.status == RewardStatus::Active && self.is_active
    }

    pub fn has_inventory(&self) -> bool {
        match self.total_available {
            Some(total) => self.current_redemptions < total,
            None => true,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Business {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub city: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Platform {
    Ios,
    Tvos,
}

/// One outbound affiliate click and its attribution window
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AffiliateClick {
    pub id: String,
    pub click_id: String,
    pub reward_id: String,
    pub family_id: String,
    #[serde(default)]
    pub child_id: Option<String>,
    pub tracking_url: String,
    pub affiliate_network: AffiliateNetwork,
    pub platform: Platform,
    pub clicked_at: DateTime<Utc>,
    #[serde(default)]
    pub converted: bool,
    pub attribution_window_days: u32,
    #[serde(default)]
    pub user_agent: Option<String>,
    #[serde(default)]
    pub ip_city: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_terminal_states_have_no_exits() {
        let all = [
            RedemptionStatus::Pending,
            RedemptionStatus::Redeemed,
            RedemptionStatus::Expired,
            RedemptionStatus::Cancelled,
        ];
        for from in all.iter().filter(|s| s.is_terminal()) {
            for to in all {
                assert!(!from.can_transition_to(to), "{} -> {} allowed", from, to);
            }
        }
        assert!(RedemptionStatus::Pending.can_transition_to(RedemptionStatus::Redeemed));
        assert!(!RedemptionStatus::Pending.can_transition_to(RedemptionStatus::Pending));
    }

    #[test]
    fn test_reward_wire_names() {
        let reward: Reward = serde_json::from_value(serde_json::json!({
            "id": "r1",
            "title": "Free Cone",
            "pointCost": 100,
            "status": "PENDING_APPROVAL",
            "businessId": "b1",
            "affiliateNetwork": "SHAREASALE"
        }))
        .unwrap();

        assert_eq!(reward.status, RewardStatus::PendingApproval);
        assert_eq!(reward.affiliate_network, Some(AffiliateNetwork::Shareasale));
        assert!(reward.is_active);
        assert_eq!(reward.reward_source, RewardSource::LocalBusiness);
        assert!(!reward.is_redeemable());
    }

    #[test]
    fn test_inventory_cap() {
        let mut reward: Reward = serde_json::from_value(serde_json::json!({
            "id": "r1", "title": "t", "pointCost": 10, "status": "ACTIVE",
            "totalAvailable": 2, "currentRedemptions": 1
        }))
        .unwrap();
        assert!(reward.has_inventory());
        reward.current_redemptions = 2;
        assert!(!reward.has_inventory());
        reward.total_available = None;
        assert!(reward.has_inventory());
    }
}
