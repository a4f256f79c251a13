//! Data provider façade and the sync-cycle plumbing shared by all features.

use std::time::Duration;

use rusqlite::{params, Connection};

use crate::crypto::Crypter;
use crate::error::{Error, Result};
use crate::models::SyncableRecord;

/// Upper bound on merge-conflict retries before the cycle fails
pub(crate) const MAX_MERGE_RETRIES: u32 = 5;

/// Pause between conflict retries
const MERGE_RETRY_DELAY: Duration = Duration::from_millis(50);

/// Per-feature sync surface exposed to the sync orchestrator.
///
/// One provider exists per feature; the orchestrator serializes cycles for a
/// feature but may run different features concurrently.
#[allow(async_fn_in_trait)]
pub trait DataProvider {
    /// Feature name, namespacing records and persisted sync state
    fn feature(&self) -> &'static str;

    /// Mark every local record as modified so the next
    /// [`DataProvider::fetch_changed_objects`] uploads everything, and
    /// forget the server cursor
    async fn prepare_for_first_sync(&self) -> Result<()>;

    /// Collect locally changed records, encrypted and upload-ready.
    /// Pure read: a failed upload must never lose local state.
    async fn fetch_changed_objects(&self, crypter: &dyn Crypter) -> Result<Vec<SyncableRecord>>;

    /// Apply the first-ever server response for this feature; every received
    /// record applies unconditionally
    async fn handle_initial_sync_response(
        &self,
        received: &[SyncableRecord],
        client_timestamp: i64,
        server_timestamp: &str,
        crypter: &dyn Crypter,
    ) -> Result<()>;

    /// Apply a steady-state server response, then settle the pending-sync
    /// markers of the records that were sent
    async fn handle_sync_response(
        &self,
        sent: &[SyncableRecord],
        received: &[SyncableRecord],
        client_timestamp: i64,
        server_timestamp: &str,
        crypter: &dyn Crypter,
    ) -> Result<()>;

    /// Opaque server cursor; `None` forces a full sync
    async fn last_sync_timestamp(&self) -> Result<Option<String>>;

    /// Persist the server cursor (outside any reconciliation transaction)
    async fn set_last_sync_timestamp(&self, timestamp: Option<&str>) -> Result<()>;

    /// Report an error surfaced during the cycle; reporting never resolves it
    fn handle_sync_error(&self, error: &Error);
}

/// Run one reconciliation pass, retrying on storage merge conflicts.
///
/// Discarding the transaction and re-running is safe because a pass is
/// idempotent given the same inputs; the retry count is bounded so a
/// persistent conflict surfaces instead of looping forever.
pub(crate) async fn run_with_merge_retry<T>(
    feature: &str,
    mut operation: impl FnMut() -> Result<T>,
) -> Result<T> {
    let mut attempt: u32 = 0;
    loop {
        match operation() {
            Err(error) if error.is_merge_conflict() && attempt < MAX_MERGE_RETRIES => {
                attempt += 1;
                tracing::warn!(feature, attempt, "storage merge conflict, retrying reconciliation");
                tokio::time::sleep(MERGE_RETRY_DELAY).await;
            }
            result => return result,
        }
    }
}

/// Read a feature's persisted server cursor
pub(crate) fn read_last_sync_timestamp(conn: &Connection, feature: &str) -> Result<Option<String>> {
    let result = conn.query_row(
        "SELECT last_sync_timestamp FROM sync_state WHERE feature = ?",
        params![feature],
        |row| row.get::<_, Option<String>>(0),
    );

    match result {
        Ok(timestamp) => Ok(timestamp),
        Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
        Err(e) => Err(e.into()),
    }
}

/// Persist a feature's server cursor
pub(crate) fn write_last_sync_timestamp(
    conn: &Connection,
    feature: &str,
    timestamp: Option<&str>,
) -> Result<()> {
    conn.execute(
        "INSERT INTO sync_state (feature, last_sync_timestamp) VALUES (?1, ?2)
         ON CONFLICT(feature) DO UPDATE SET last_sync_timestamp = excluded.last_sync_timestamp",
        params![feature, timestamp],
    )?;
    Ok(())
}
