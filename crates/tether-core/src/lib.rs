//! tether-core - Core library for Tether
//!
//! This crate contains the sync record models, payload encryption, local
//! storage layer, and the reconciliation engine used by all Tether clients
//! (desktop, mobile, CLI).

pub mod crypto;
pub mod db;
pub mod error;
pub mod models;
pub mod sync;

pub use error::{Error, Result};
pub use models::SyncableRecord;
pub use sync::DataProvider;
