//! Device synchronization engine.
//!
//! Each feature (bookmarks, settings) plugs into the same four-phase
//! protocol through its [`DataProvider`]: the orchestrator collects locally
//! changed records, exchanges encrypted batches with the server, then hands
//! back what was sent and what was received. Reconciliation applies the
//! received records under deterministic merge rules (first-sync
//! deduplication, last-write-wins bounded by the cycle's snapshot time,
//! tombstone propagation) inside a single transaction, retrying the whole
//! pass when the store reports a write conflict.

mod bookmarks;
mod provider;
mod response;
mod settings;

pub use bookmarks::{collect_changed_bookmarks, BookmarksProvider, BookmarksResponseHandler};
pub use provider::DataProvider;
pub use response::{ReconcileContext, ResponseHandler};
pub use settings::{collect_changed_settings, SettingsProvider, SettingsResponseHandler};
