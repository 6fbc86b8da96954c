//! Rewards Redemption - points ledger and reward redemption lifecycle
//!
//! Families earn points for completed jobs and spend them on rewards offered
//! by local businesses or affiliate merchants. A redemption debits the
//! ledger, issues a short human-readable code plus a QR payload, and waits
//! for the business to verify it before it expires.
//!
//! ## Components
//!
//! - **Ledger**: append-only signed entries; a balance is their sum
//! - **Redemption state machine**: PENDING to REDEEMED, EXPIRED or CANCELLED
//! - **Code generator**: `XXXX-XXXX-XXXX` codes and base64 QR payloads
//! - **Verification**: business-side fulfillment with conditional writes
//! - **Affiliate**: click tracking, tracking URLs and 30-day holds
//!
//! ## Storage Layout
//!
//! ```text
//! ~/.local/share/rewards-redemption/
//! ├── rewards.sled/          # One tree per table (names in config.toml)
//! └── config.toml            # Configuration
//! ```

pub mod clock;
pub mod codes;
pub mod config;
pub mod error;
pub mod http;
pub mod models;
pub mod services;
pub mod store;

// Re-exports
pub use clock::{Clock, ManualClock, SystemClock};
pub use config::{Config, RedemptionPolicy, TableNames};
pub use error::{RedemptionError, StorageError};
pub use http::HttpServer;
pub use models::{Redemption, RedemptionKind, RedemptionStatus};
pub use services::Services;
pub use store::{MemoryStore, SledStore, Stores};
