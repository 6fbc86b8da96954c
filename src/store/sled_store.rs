//! sled-backed store
//!
//! One tree per logical table, named by [`TableNames`]:
//!
//! ```text
//! rewards.sled/
//! ├── Reward                      reward id  -> Reward
//! ├── Business                    biz id     -> Business
//! ├── RewardRedemption            id         -> Redemption
//! ├── RewardRedemption-byCode     code       -> id (unique)
//! ├── PointsTransaction           user\0millis\0entry id -> entry
//! ├── PointsTransaction-balances  user       -> i64 running balance
//! └── AffiliateClick              id         -> AffiliateClick
//! ```
//!
//! Values are named msgpack. Ledger keys sort by user then time, so a
//! prefix scan yields a user's history in order.

use async_trait::async_trait;
use chrono::Utc;
use serde::de::DeserializeOwned;
use serde::Serialize;
use sled::transaction::{ConflictableTransactionError, ConflictableTransactionResult, TransactionError};
use sled::Transactional;
use std::path::Path;
use tracing::{debug, info};

use super::{
    carry_ledger_links, AffiliateClickStore, AppendOutcome, BusinessDirectory, LedgerStore,
    RedemptionStore, RewardDirectory, SpendGuard, TransitionOutcome,
};
use crate::config::TableNames;
use crate::error::StorageError;
use crate::models::{
    AffiliateClick, Business, PointsLedgerEntry, Redemption, RedemptionStatus, Reward,
};

fn encode<T: Serialize>(value: &T) -> Result<Vec<u8>, StorageError> {
    rmp_serde::to_vec_named(value).map_err(|e| StorageError::Serialization(e.to_string()))
}

fn decode<T: DeserializeOwned>(bytes: &[u8]) -> Result<T, StorageError> {
    rmp_serde::from_slice(bytes).map_err(|e| StorageError::Serialization(e.to_string()))
}

fn decode_balance(bytes: Option<sled::IVec>) -> i64 {
    bytes
        .and_then(|b| <[u8; 8]>::try_from(&b[..]).ok())
        .map(i64::from_be_bytes)
        .unwrap_or(0)
}

fn ledger_key(entry: &PointsLedgerEntry) -> Vec<u8> {
    format!(
        "{}\0{:020}\0{}",
        entry.user_id,
        entry.timestamp.timestamp_millis().max(0),
        entry.id
    )
    .into_bytes()
}

fn ledger_prefix(user_id: &str) -> Vec<u8> {
    format!("{}\0", user_id).into_bytes()
}

/// Read-modify-write a record with compare-and-swap, retrying on contention
fn update_record<T, F>(tree: &sled::Tree, key: &str, mutate: F) -> Result<Option<T>, StorageError>
where
    T: Serialize + DeserializeOwned,
    F: Fn(&mut T),
{
    loop {
        let current = match tree.get(key.as_bytes())? {
            Some(bytes) => bytes,
            None => return Ok(None),
        };
        let mut record: T = decode(&current)?;
        mutate(&mut record);
        let next = encode(&record)?;

        if tree
            .compare_and_swap(key.as_bytes(), Some(&current), Some(next))?
            .is_ok()
        {
            return Ok(Some(record));
        }
        debug!(key = %key, "CAS contention, retrying");
    }
}

enum LedgerAbort {
    Duplicate,
    Insufficient(i64),
    Overflow(i64),
}

enum InsertAbort {
    CodeTaken,
    IdTaken,
}

/// sled database holding every table
pub struct SledStore {
    db: sled::Db,
    rewards: sled::Tree,
    businesses: sled::Tree,
    redemptions: sled::Tree,
    codes: sled::Tree,
    ledger: sled::Tree,
    balances: sled::Tree,
    clicks: sled::Tree,
}

impl SledStore {
    /// Open or create the database and resolve every table once
    pub fn open<P: AsRef<Path>>(path: P, tables: &TableNames) -> Result<Self, StorageError> {
        tables.validate()?;
        let db = sled::open(path.as_ref())?;
        let store = Self::from_db(db, tables)?;
        info!(path = %path.as_ref().display(), "Opened rewards database");
        Ok(store)
    }

    pub fn from_db(db: sled::Db, tables: &TableNames) -> Result<Self, StorageError> {
        Ok(Self {
            rewards: db.open_tree(&tables.rewards)?,
            businesses: db.open_tree(&tables.businesses)?,
            redemptions: db.open_tree(&tables.redemptions)?,
            codes: db.open_tree(&tables.redemption_codes)?,
            ledger: db.open_tree(&tables.ledger)?,
            balances: db.open_tree(&tables.balances)?,
            clicks: db.open_tree(&tables.affiliate_clicks)?,
            db,
        })
    }

    /// Flush dirty pages to disk
    pub async fn flush(&self) -> Result<(), StorageError> {
        self.db.flush_async().await?;
        Ok(())
    }
}

#[async_trait]
impl LedgerStore for SledStore {
    async fn append(
        &self,
        entry: &PointsLedgerEntry,
        guard: SpendGuard,
    ) -> Result<AppendOutcome, StorageError> {
        let key = ledger_key(entry);
        let value = encode(entry)?;
        let user = entry.user_id.as_bytes();

        let result = (&self.ledger, &self.balances).transaction(
            |(ledger, balances)| -> ConflictableTransactionResult<(), LedgerAbort> {
                if ledger.get(key.as_slice())?.is_some() {
                    return Err(ConflictableTransactionError::Abort(LedgerAbort::Duplicate));
                }
                let balance = decode_balance(balances.get(user)?);
                let next = match balance.checked_add(entry.amount) {
                    Some(next) => next,
                    None => {
                        return Err(ConflictableTransactionError::Abort(LedgerAbort::Overflow(
                            balance,
                        )))
                    }
                };
                if guard == SpendGuard::RequireNonNegative && next < 0 {
                    return Err(ConflictableTransactionError::Abort(LedgerAbort::Insufficient(
                        balance,
                    )));
                }
                ledger.insert(key.as_slice(), value.clone())?;
                balances.insert(user, next.to_be_bytes().to_vec())?;
                Ok(())
            },
        );

        match result {
            Ok(()) => Ok(AppendOutcome::Appended),
            Err(TransactionError::Abort(LedgerAbort::Insufficient(balance))) => {
                Ok(AppendOutcome::Rejected { balance })
            }
            Err(TransactionError::Abort(LedgerAbort::Overflow(balance))) => {
                Ok(AppendOutcome::Overflow { balance })
            }
            Err(TransactionError::Abort(LedgerAbort::Duplicate)) => Err(StorageError::Conflict(
                format!("ledger entry {} exists", entry.id),
            )),
            Err(TransactionError::Storage(e)) => Err(e.into()),
        }
    }

    async fn entries_for_user(&self, user_id: &str) -> Result<Vec<PointsLedgerEntry>, StorageError> {
        let mut entries = Vec::new();
        for item in self.ledger.scan_prefix(ledger_prefix(user_id)) {
            let (_, value) = item?;
            entries.push(decode(&value)?);
        }
        Ok(entries)
    }

    async fn entries_for_family(
        &self,
        family_id: &str,
    ) -> Result<Vec<PointsLedgerEntry>, StorageError> {
        let mut entries = Vec::new();
        for item in self.ledger.iter() {
            let (_, value) = item?;
            let entry: PointsLedgerEntry = decode(&value)?;
            if entry.family_id == family_id {
                entries.push(entry);
            }
        }
        entries.sort_by_key(|e| e.timestamp);
        Ok(entries)
    }
}

#[async_trait]
impl RedemptionStore for SledStore {
    async fn insert(&self, redemption: &Redemption) -> Result<(), StorageError> {
        let id = redemption.id.as_bytes();
        let code = redemption.redemption_code.as_bytes();
        let value = encode(redemption)?;

        let result = (&self.redemptions, &self.codes).transaction(
            |(redemptions, codes)| -> ConflictableTransactionResult<(), InsertAbort> {
                if codes.get(code)?.is_some() {
                    return Err(ConflictableTransactionError::Abort(InsertAbort::CodeTaken));
                }
                if redemptions.get(id)?.is_some() {
                    return Err(ConflictableTransactionError::Abort(InsertAbort::IdTaken));
                }
                redemptions.insert(id, value.clone())?;
                codes.insert(code, id)?;
                Ok(())
            },
        );

        match result {
            Ok(()) => Ok(()),
            Err(TransactionError::Abort(InsertAbort::CodeTaken)) => Err(StorageError::Conflict(
                format!("redemption code {} already issued", redemption.redemption_code),
            )),
            Err(TransactionError::Abort(InsertAbort::IdTaken)) => Err(StorageError::Conflict(
                format!("redemption {} exists", redemption.id),
            )),
            Err(TransactionError::Storage(e)) => Err(e.into()),
        }
    }

    async fn get(&self, id: &str) -> Result<Option<Redemption>, StorageError> {
        match self.redemptions.get(id.as_bytes())? {
            Some(bytes) => Ok(Some(decode(&bytes)?)),
            None => Ok(None),
        }
    }

    async fn find_by_code(&self, code: &str) -> Result<Option<Redemption>, StorageError> {
        let id = match self.codes.get(code.as_bytes())? {
            Some(id) => id,
            None => return Ok(None),
        };
        match self.redemptions.get(&id)? {
            Some(bytes) => Ok(Some(decode(&bytes)?)),
            None => Err(StorageError::Internal(format!(
                "code index points at missing redemption {}",
                String::from_utf8_lossy(&id)
            ))),
        }
    }

    async fn update_if_status(
        &self,
        expected: RedemptionStatus,
        updated: &Redemption,
    ) -> Result<TransitionOutcome, StorageError> {
        let key = updated.id.as_bytes();

        loop {
            let current_bytes = match self.redemptions.get(key)? {
                Some(bytes) => bytes,
                None => return Ok(TransitionOutcome::NotFound),
            };
            let current: Redemption = decode(&current_bytes)?;
            if current.status != expected {
                return Ok(TransitionOutcome::StatusMismatch(current));
            }
            if current.redemption_code != updated.redemption_code {
                return Err(StorageError::Conflict("redemption code is immutable".into()));
            }

            let next = carry_ledger_links(&current, updated);
            if self
                .redemptions
                .compare_and_swap(key, Some(&current_bytes), Some(encode(&next)?))?
                .is_ok()
            {
                return Ok(TransitionOutcome::Applied(next));
            }
            debug!(redemption_id = %updated.id, "Redemption changed underneath transition, re-reading");
        }
    }

    async fn list_all(&self) -> Result<Vec<Redemption>, StorageError> {
        let mut all = Vec::new();
        for item in self.redemptions.iter() {
            let (_, value) = item?;
            all.push(decode::<Redemption>(&value)?);
        }
        all.sort_by_key(|r| r.created_at);
        Ok(all)
    }

    async fn count(&self) -> Result<usize, StorageError> {
        Ok(self.redemptions.len())
    }
}

#[async_trait]
impl RewardDirectory for SledStore {
    async fn get_reward(&self, id: &str) -> Result<Option<Reward>, StorageError> {
        match self.rewards.get(id.as_bytes())? {
            Some(bytes) => Ok(Some(decode(&bytes)?)),
            None => Ok(None),
        }
    }

    async fn put_reward(&self, reward: &Reward) -> Result<(), StorageError> {
        self.rewards.insert(reward.id.as_bytes(), encode(reward)?)?;
        Ok(())
    }

    async fn increment_redemptions(&self, id: &str) -> Result<Option<Reward>, StorageError> {
        update_record(&self.rewards, id, |reward: &mut Reward| {
            reward.redemptions += 1;
            reward.current_redemptions += 1;
            reward.updated_at = Some(Utc::now());
        })
    }

    async fn increment_affiliate_clicks(&self, id: &str) -> Result<Option<Reward>, StorageError> {
        update_record(&self.rewards, id, |reward: &mut Reward| {
            reward.affiliate_click_count += 1;
            reward.updated_at = Some(Utc::now());
        })
    }
}

#[async_trait]
impl BusinessDirectory for SledStore {
    async fn get_business(&self, id: &str) -> Result<Option<Business>, StorageError> {
        match self.businesses.get(id.as_bytes())? {
            Some(bytes) => Ok(Some(decode(&bytes)?)),
            None => Ok(None),
        }
    }

    async fn put_business(&self, business: &Business) -> Result<(), StorageError> {
        self.businesses.insert(business.id.as_bytes(), encode(business)?)?;
        Ok(())
    }
}

#[async_trait]
impl AffiliateClickStore for SledStore {
    async fn insert_click(&self, click: &AffiliateClick) -> Result<(), StorageError> {
        let swapped = self.clicks.compare_and_swap(
            click.id.as_bytes(),
            None as Option<&[u8]>,
            Some(encode(click)?),
        )?;
        swapped.map_err(|_| StorageError::Conflict(format!("click {} exists", click.id)))
    }

    async fn get_click(&self, id: &str) -> Result<Option<AffiliateClick>, StorageError> {
        match self.clicks.get(id.as_bytes())? {
            Some(bytes) => Ok(Some(decode(&bytes)?)),
            None => Ok(None),
        }
    }
}
