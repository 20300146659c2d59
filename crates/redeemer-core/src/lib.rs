//! redeemer-core: ownership resolution and redemption reconciliation
//!
//! This crate decides which content-provider keys are safe to redeem on the
//! platform, redeems them one at a time under the platform's rate limit, and
//! records every outcome so repeated runs are idempotent and resumable.
//!
//! # Architecture
//!
//! ```text
//! KeySource → Friend Classifier ─┐
//!                                ├→ Engine → Redemption Machine → Ledger
//! CatalogCache → Ownership Resolver ┘                              ↓
//!                                                        Completion Tracker
//! ```
//!
//! # Modules
//!
//! - `error`: Error types with remediation and exit codes
//! - `config`: TOML configuration
//! - `logging`: tracing subscriber setup
//! - `model`: Key, catalog and outcome types
//! - `retry`: Exponential backoff
//! - `tabular`: CSV reading and writing
//! - `similarity`: Title normalization and fuzzy scoring
//! - `catalog`: Checksummed catalog and owned-set cache
//! - `resolver`: Ownership decisions
//! - `friend`: Friend/co-op key classification
//! - `ledger`: Durable outcome files
//! - `completion`: Completed bundle record
//! - `redemption`: Per-key redemption state machine and collaborator traits
//! - `engine`: Run orchestration and summary
//! - `export`: Offline key export
//!
//! # Safety
//!
//! This crate forbids unsafe code.

#![forbid(unsafe_code)]

pub mod catalog;
pub mod completion;
pub mod config;
pub mod engine;
pub mod error;
pub mod export;
pub mod friend;
pub mod ledger;
pub mod logging;
pub mod model;
pub mod redemption;
pub mod resolver;
pub mod retry;
pub mod similarity;
pub mod tabular;

pub use error::{Error, Result};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
