//! Affiliate service - redemptions fulfilled by an outside merchant
//!
//! A click on an affiliate reward spends the points up front and opens an
//! AFFILIATE redemption that stays PENDING for the attribution window
//! while the merchant confirms the purchase.

use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{debug, info, warn};
use url::Url;
use uuid::Uuid;

use crate::clock::Clock;
use crate::error::RedemptionError;
use crate::models::{
    AffiliateClick, AffiliateNetwork, LedgerSource, Platform, RedemptionKind, RewardSource,
    SourceKind,
};
use crate::store::Stores;

use super::events::{EventBus, RedemptionEvent};
use super::ledger_service::LedgerService;
use super::redemption_service::{RedemptionDraft, RedemptionService};

/// Business id recorded on affiliate redemptions with no local business
pub const AFFILIATE_BUSINESS_ID: &str = "AFFILIATE";

const ATTRIBUTION_WINDOW_DAYS: u32 = 30;

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClickMetadata {
    #[serde(default)]
    pub user_agent: Option<String>,
    #[serde(default)]
    pub ip_city: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TrackAffiliateClickRequest {
    pub reward_id: String,
    pub family_id: String,
    #[serde(default)]
    pub child_id: Option<String>,
    pub platform: Platform,
    #[serde(default)]
    pub metadata: ClickMetadata,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AffiliateClickResult {
    pub click_id: String,
    pub tracking_url: String,
    pub redemption_id: String,
    pub points_spent: i64,
}

pub struct AffiliateService {
    stores: Stores,
    ledger: Arc<LedgerService>,
    redemptions: Arc<RedemptionService>,
    clock: Arc<dyn Clock>,
    events: Arc<EventBus>,
    amazon_tag: Option<String>,
}

impl AffiliateService {
    pub fn new(
        stores: Stores,
        ledger: Arc<LedgerService>,
        redemptions: Arc<RedemptionService>,
        clock: Arc<dyn Clock>,
        events: Arc<EventBus>,
        amazon_tag: Option<String>,
    ) -> Self {
        Self {
            stores,
            ledger,
            redemptions,
            clock,
            events,
            amazon_tag,
        }
    }

    /// Record a click, debit the points and open an affiliate redemption
    pub async fn track_click(
        &self,
        request: TrackAffiliateClickRequest,
    ) -> Result<AffiliateClickResult, RedemptionError> {
        if request.reward_id.trim().is_empty() || request.family_id.trim().is_empty() {
            return Err(RedemptionError::InvalidInput(
                "rewardId and familyId are required".into(),
            ));
        }
        info!(reward_id = %request.reward_id, family_id = %request.family_id, "Track affiliate click");

        let reward = self
            .stores
            .rewards
            .get_reward(&request.reward_id)
            .await?
            .ok_or_else(|| RedemptionError::RewardNotFound(request.reward_id.clone()))?;

        if reward.reward_source != RewardSource::AffiliateLink {
            return Err(RedemptionError::NotAffiliateReward(reward.id));
        }
        let base_link = match reward.affiliate_link.as_deref() {
            Some(link) if !link.trim().is_empty() => link.to_string(),
            _ => return Err(RedemptionError::MissingAffiliateLink(reward.id)),
        };
        if !reward.is_redeemable() {
            return Err(RedemptionError::RewardInactive(reward.id));
        }

        let user_id = request
            .child_id
            .clone()
            .unwrap_or_else(|| request.family_id.clone());
        let cost = reward.point_cost.max(0);
        let available = self.ledger.get_balance(&user_id).await?;
        if available < cost {
            return Err(RedemptionError::InsufficientPoints {
                available,
                required: cost,
            });
        }

        let network = reward.affiliate_network.unwrap_or_default();
        let click_id = Uuid::new_v4().to_string();
        let tracking_url =
            build_tracking_url(&base_link, &click_id, network, self.amazon_tag.as_deref());
        debug!(click_id = %click_id, network = network.as_str(), "Tracking URL built");

        let click = AffiliateClick {
            id: Uuid::new_v4().to_string(),
            click_id: click_id.clone(),
            reward_id: reward.id.clone(),
            family_id: request.family_id.clone(),
            child_id: request.child_id.clone(),
            tracking_url: tracking_url.clone(),
            affiliate_network: network,
            platform: request.platform,
            clicked_at: self.clock.now(),
            converted: false,
            attribution_window_days: ATTRIBUTION_WINDOW_DAYS,
            user_agent: request.metadata.user_agent.clone(),
            ip_city: request.metadata.ip_city.clone(),
        };
        self.stores.affiliate_clicks.insert_click(&click).await?;

        if let Err(e) = self.stores.rewards.increment_affiliate_clicks(&reward.id).await {
            warn!(reward_id = %reward.id, error = %e, "Affiliate click counter not incremented");
        }

        let redemption = self
            .redemptions
            .issue(RedemptionDraft {
                reward_id: reward.id.clone(),
                user_id: user_id.clone(),
                user_name: None,
                family_id: request.family_id.clone(),
                child_age: None,
                kind: RedemptionKind::Affiliate,
                points_spent: cost,
                jobs_used: Vec::new(),
                business_id: reward
                    .business_id
                    .clone()
                    .unwrap_or_else(|| AFFILIATE_BUSINESS_ID.to_string()),
                city: request.metadata.ip_city.clone(),
                zip: None,
                affiliate_click_id: Some(click.id.clone()),
            })
            .await?;

        if cost > 0 {
            let source = LedgerSource::new(SourceKind::Redemption, &redemption.id)
                .with_description(format!("Affiliate link: {}", reward.title));
            match self
                .ledger
                .record_spend_checked(&user_id, &request.family_id, cost, source)
                .await
            {
                Ok(entry_id) => self.redemptions.link_debit(&redemption.id, &entry_id).await,
                Err(e) => {
                    self.redemptions.compensate(&redemption, "ledger debit failed").await;
                    return Err(e);
                }
            }
        }

        self.events.emit(RedemptionEvent::AffiliateClickTracked {
            click_id: click_id.clone(),
            reward_id: reward.id.clone(),
            redemption_id: redemption.id.clone(),
        });

        Ok(AffiliateClickResult {
            click_id,
            tracking_url,
            redemption_id: redemption.id,
            points_spent: cost,
        })
    }
}

/// Add the network's sub-id parameter so the merchant reports the click back
pub fn build_tracking_url(
    base: &str,
    click_id: &str,
    network: AffiliateNetwork,
    amazon_tag: Option<&str>,
) -> String {
    let mut url = match Url::parse(base) {
        Ok(url) => url,
        Err(e) => {
            warn!(base = %base, error = %e, "Unparseable affiliate link, appending tracking id");
            return format!("{}?tracking_id={}", base, click_id);
        }
    };

    match network {
        AffiliateNetwork::Amazon => {
            let has_tag = url.query_pairs().any(|(k, _)| k == "tag");
            if let (false, Some(tag)) = (has_tag, amazon_tag) {
                set_param(&mut url, "tag", tag);
            }
            set_param(&mut url, "linkId", click_id);
        }
        AffiliateNetwork::Target => set_param(&mut url, "afid", click_id),
        AffiliateNetwork::Walmart => set_param(&mut url, "sourceid", click_id),
        AffiliateNetwork::Rakuten => set_param(&mut url, "ranSiteID", click_id),
        AffiliateNetwork::Shareasale => set_param(&mut url, "afftrack", click_id),
        AffiliateNetwork::Cj => set_param(&mut url, "sid", click_id),
        AffiliateNetwork::Custom => set_param(&mut url, "tracking_id", click_id),
    }

    url.to_string()
}

fn set_param(url: &mut Url, key: &str, value: &str) {
    let kept: Vec<(String, String)> = url
        .query_pairs()
        .filter(|(k, _)| k != key)
        .map(|(k, v)| (k.into_owned(), v.into_owned()))
        .collect();

    let mut pairs = url.query_pairs_mut();
    pairs.clear();
    for (k, v) in &kept {
        pairs.append_pair(k, v);
    }
    pairs.append_pair(key, value);
}
