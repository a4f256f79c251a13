//! Settings sync: change collection, flat key/value reconciliation, and the
//! provider façade.

use std::collections::HashSet;
use std::sync::Arc;

use rusqlite::Connection;
use tokio::sync::Mutex;

use crate::crypto::{Crypter, SecretKey};
use crate::db::{Database, SettingRepository, SqliteSettingRepository};
use crate::error::{Error, Result};
use crate::models::{SettingKey, SettingPayload, SyncableRecord};

use super::provider::{
    read_last_sync_timestamp, run_with_merge_retry, write_last_sync_timestamp, DataProvider,
};
use super::response::{
    decrypt_record_payload, local_change_wins, ReconcileContext, ResponseHandler,
};

const FEATURE: &str = "settings";

/// Collect locally changed settings as upload-ready records. Pure read.
pub fn collect_changed_settings(
    repo: &impl SettingRepository,
    crypter: &dyn Crypter,
    key: &SecretKey,
) -> Result<Vec<SyncableRecord>> {
    let mut records = Vec::new();

    for setting_key in repo.modified_keys()? {
        let last_modified = repo.last_modified(setting_key)?;
        match repo.get_value(setting_key)? {
            Some(value) => {
                let payload = SettingPayload { value };
                let encrypted = crypter.encrypt(&serde_json::to_vec(&payload)?, key)?;
                records.push(SyncableRecord::new(
                    setting_key.as_str(),
                    encrypted,
                    last_modified,
                ));
            }
            None => {
                records.push(SyncableRecord::tombstone(setting_key.as_str(), last_modified));
            }
        }
    }

    Ok(records)
}

/// Flat key/value response handler for the settings feature.
pub struct SettingsResponseHandler<'a, R: SettingRepository> {
    repo: &'a R,
    crypter: &'a dyn Crypter,
    key: &'a SecretKey,
}

impl<'a, R: SettingRepository> SettingsResponseHandler<'a, R> {
    pub const fn new(repo: &'a R, crypter: &'a dyn Crypter, key: &'a SecretKey) -> Self {
        Self { repo, crypter, key }
    }
}

impl<R: SettingRepository> ResponseHandler for SettingsResponseHandler<'_, R> {
    fn apply_batch(&self, received: &[SyncableRecord], context: &ReconcileContext) -> Result<()> {
        for record in received {
            // Unknown keys come from newer clients; ignoring them keeps old
            // versions forward compatible
            let Some(setting_key) = SettingKey::from_record_id(&record.id) else {
                tracing::debug!(id = %record.id, "ignoring unknown setting key");
                continue;
            };

            if local_change_wins(self.repo.last_modified(setting_key)?, context) {
                continue;
            }

            if record.is_deleted {
                self.repo.set_value(setting_key, None)?;
            } else {
                let Some(plain) = decrypt_record_payload(self.crypter, self.key, record)? else {
                    continue;
                };
                let payload: SettingPayload = serde_json::from_slice(&plain)?;
                self.repo.set_value(setting_key, Some(&payload.value))?;
            }

            // The remote state is now authoritative and acknowledged
            self.repo.set_last_modified(setting_key, None)?;
        }

        Ok(())
    }
}

/// Settle pending-sync markers for the settings sent this cycle.
fn reconcile_sent(
    repo: &impl SettingRepository,
    sent: &[SyncableRecord],
    received: &[SyncableRecord],
    client_timestamp: i64,
) -> Result<()> {
    let received_ids: HashSet<&str> = received.iter().map(|record| record.id.as_str()).collect();

    let sent_keys: Vec<SettingKey> = sent
        .iter()
        .filter_map(|record| SettingKey::from_record_id(&record.id))
        .collect();
    let still_dirty = repo.last_modified_many(&sent_keys)?;

    for setting_key in sent_keys {
        if still_dirty
            .get(&setting_key)
            .is_some_and(|modified| *modified > client_timestamp)
        {
            // Changed again during the round trip
            continue;
        }
        if received_ids.contains(setting_key.as_str()) {
            // The response handler already arbitrated this key
            continue;
        }
        repo.set_last_modified(setting_key, None)?;
    }

    Ok(())
}

/// Settings data provider exposing the four-phase sync protocol.
#[derive(Clone)]
pub struct SettingsProvider {
    db: Arc<Mutex<Database>>,
}

impl SettingsProvider {
    #[must_use]
    pub fn new(db: Arc<Mutex<Database>>) -> Self {
        Self { db }
    }

    fn apply(
        conn: &mut Connection,
        crypter: &dyn Crypter,
        key: &SecretKey,
        sent: Option<&[SyncableRecord]>,
        received: &[SyncableRecord],
        context: &ReconcileContext,
    ) -> Result<()> {
        let tx = conn.transaction()?;
        {
            let repo = SqliteSettingRepository::new(&tx);
            let handler = SettingsResponseHandler::new(&repo, crypter, key);
            handler.apply_batch(received, context)?;
            if let Some(sent) = sent {
                reconcile_sent(&repo, sent, received, context.client_timestamp)?;
            }
        }
        tx.commit()?;
        Ok(())
    }
}

impl DataProvider for SettingsProvider {
    fn feature(&self) -> &'static str {
        FEATURE
    }

    async fn prepare_for_first_sync(&self) -> Result<()> {
        let mut db = self.db.lock().await;
        let now = chrono::Utc::now().timestamp_millis();

        let tx = db.connection_mut().transaction()?;
        SqliteSettingRepository::new(&tx).mark_all_modified(now)?;
        tx.commit()?;

        write_last_sync_timestamp(db.connection(), FEATURE, None)?;
        tracing::info!(feature = FEATURE, "prepared for first sync");
        Ok(())
    }

    async fn fetch_changed_objects(&self, crypter: &dyn Crypter) -> Result<Vec<SyncableRecord>> {
        let key = crypter.fetch_secret_key()?;
        let db = self.db.lock().await;
        let repo = SqliteSettingRepository::new(db.connection());
        collect_changed_settings(&repo, crypter, &key)
    }

    async fn handle_initial_sync_response(
        &self,
        received: &[SyncableRecord],
        client_timestamp: i64,
        server_timestamp: &str,
        crypter: &dyn Crypter,
    ) -> Result<()> {
        // Key errors are fatal before any transaction is opened
        let key = crypter.fetch_secret_key()?;
        let context = ReconcileContext::first_sync(client_timestamp);

        let mut db = self.db.lock().await;
        run_with_merge_retry(FEATURE, || {
            Self::apply(db.connection_mut(), crypter, &key, None, received, &context)
        })
        .await?;

        write_last_sync_timestamp(db.connection(), FEATURE, Some(server_timestamp))?;
        tracing::debug!(feature = FEATURE, records = received.len(), "initial sync applied");
        Ok(())
    }

    async fn handle_sync_response(
        &self,
        sent: &[SyncableRecord],
        received: &[SyncableRecord],
        client_timestamp: i64,
        server_timestamp: &str,
        crypter: &dyn Crypter,
    ) -> Result<()> {
        let key = crypter.fetch_secret_key()?;
        let context = ReconcileContext::steady(client_timestamp);

        let mut db = self.db.lock().await;
        run_with_merge_retry(FEATURE, || {
            Self::apply(
                db.connection_mut(),
                crypter,
                &key,
                Some(sent),
                received,
                &context,
            )
        })
        .await?;

        write_last_sync_timestamp(db.connection(), FEATURE, Some(server_timestamp))?;
        tracing::debug!(
            feature = FEATURE,
            sent = sent.len(),
            received = received.len(),
            "sync response applied"
        );
        Ok(())
    }

    async fn last_sync_timestamp(&self) -> Result<Option<String>> {
        let db = self.db.lock().await;
        read_last_sync_timestamp(db.connection(), FEATURE)
    }

    async fn set_last_sync_timestamp(&self, timestamp: Option<&str>) -> Result<()> {
        let db = self.db.lock().await;
        write_last_sync_timestamp(db.connection(), FEATURE, timestamp)
    }

    fn handle_sync_error(&self, error: &Error) {
        tracing::error!(feature = FEATURE, %error, "sync cycle failed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::{XChaChaCrypter, SECRET_KEY_SIZE};
    use pretty_assertions::assert_eq;

    fn setup() -> Database {
        Database::open_in_memory().unwrap()
    }

    fn crypter() -> XChaChaCrypter {
        XChaChaCrypter::new(SecretKey::from_bytes([7u8; SECRET_KEY_SIZE]))
    }

    fn value_record(key: SettingKey, value: &str) -> SyncableRecord {
        let crypter = crypter();
        let secret = crypter.fetch_secret_key().unwrap();
        let payload = SettingPayload {
            value: value.to_string(),
        };
        let encrypted = crypter
            .encrypt(&serde_json::to_vec(&payload).unwrap(), &secret)
            .unwrap();
        SyncableRecord::new(key.as_str(), encrypted, Some(1))
    }

    fn apply(db: &Database, received: &[SyncableRecord], context: &ReconcileContext) {
        let repo = SqliteSettingRepository::new(db.connection());
        let crypter = crypter();
        let secret = crypter.fetch_secret_key().unwrap();
        let handler = SettingsResponseHandler::new(&repo, &crypter, &secret);
        handler.apply_batch(received, context).unwrap();
    }

    #[test]
    fn test_new_remote_value_applies_and_clears_metadata() {
        // Scenario: key has no metadata entry; the remote value lands
        let db = setup();
        apply(
            &db,
            &[value_record(SettingKey::Theme, "v1")],
            &ReconcileContext::steady(1_000),
        );

        let repo = SqliteSettingRepository::new(db.connection());
        assert_eq!(repo.get_value(SettingKey::Theme).unwrap().as_deref(), Some("v1"));
        assert!(repo.last_modified(SettingKey::Theme).unwrap().is_none());
    }

    #[test]
    fn test_local_change_past_snapshot_wins() {
        // Scenario: metadata says T+10, cycle snapshot is T
        let db = setup();
        let repo = SqliteSettingRepository::new(db.connection());
        repo.set_value(SettingKey::Theme, Some("local")).unwrap();
        repo.set_last_modified(SettingKey::Theme, Some(1_010)).unwrap();

        apply(
            &db,
            &[value_record(SettingKey::Theme, "v2")],
            &ReconcileContext::steady(1_000),
        );

        assert_eq!(repo.get_value(SettingKey::Theme).unwrap().as_deref(), Some("local"));
        assert_eq!(repo.last_modified(SettingKey::Theme).unwrap(), Some(1_010));
    }

    #[test]
    fn test_first_sync_applies_unconditionally() {
        let db = setup();
        let repo = SqliteSettingRepository::new(db.connection());
        repo.set_value(SettingKey::Theme, Some("local")).unwrap();
        repo.set_last_modified(SettingKey::Theme, Some(999_999)).unwrap();

        apply(
            &db,
            &[value_record(SettingKey::Theme, "remote")],
            &ReconcileContext::first_sync(1_000),
        );

        assert_eq!(
            repo.get_value(SettingKey::Theme).unwrap().as_deref(),
            Some("remote")
        );
        assert!(repo.last_modified(SettingKey::Theme).unwrap().is_none());
    }

    #[test]
    fn test_unknown_keys_are_ignored() {
        let db = setup();
        let crypter = crypter();
        let secret = crypter.fetch_secret_key().unwrap();
        let payload = SettingPayload {
            value: "x".to_string(),
        };
        let encrypted = crypter
            .encrypt(&serde_json::to_vec(&payload).unwrap(), &secret)
            .unwrap();

        apply(
            &db,
            &[
                SyncableRecord::new("setting_from_the_future", encrypted, Some(1)),
                value_record(SettingKey::Theme, "dark"),
            ],
            &ReconcileContext::steady(1_000),
        );

        let repo = SqliteSettingRepository::new(db.connection());
        assert_eq!(repo.get_value(SettingKey::Theme).unwrap().as_deref(), Some("dark"));
        let rows: i64 = db
            .connection()
            .query_row("SELECT COUNT(*) FROM settings", [], |row| row.get(0))
            .unwrap();
        assert_eq!(rows, 1);
    }

    #[test]
    fn test_tombstone_clears_value_idempotently() {
        let db = setup();
        let repo = SqliteSettingRepository::new(db.connection());
        repo.set_value(SettingKey::Theme, Some("dark")).unwrap();

        let tombstone = SyncableRecord::tombstone(SettingKey::Theme.as_str(), Some(1));
        apply(&db, std::slice::from_ref(&tombstone), &ReconcileContext::steady(1_000));
        apply(&db, std::slice::from_ref(&tombstone), &ReconcileContext::steady(1_000));

        let setting = repo.get(SettingKey::Theme).unwrap().unwrap();
        assert!(setting.value.is_none());
    }

    #[test]
    fn test_malformed_ciphertext_skips_only_that_record() {
        let db = setup();
        apply(
            &db,
            &[
                SyncableRecord::new(SettingKey::Theme.as_str(), vec![0u8; 3], Some(1)),
                value_record(SettingKey::NewTabLayout, "grid"),
            ],
            &ReconcileContext::steady(1_000),
        );

        let repo = SqliteSettingRepository::new(db.connection());
        assert!(repo.get_value(SettingKey::Theme).unwrap().is_none());
        assert_eq!(
            repo.get_value(SettingKey::NewTabLayout).unwrap().as_deref(),
            Some("grid")
        );
    }

    #[test]
    fn test_applying_same_batch_twice_is_idempotent() {
        let db = setup();
        let batch = vec![
            value_record(SettingKey::Theme, "dark"),
            SyncableRecord::tombstone(SettingKey::SearchSuggestions.as_str(), Some(1)),
        ];
        let context = ReconcileContext::steady(1_000);
        let repo = SqliteSettingRepository::new(db.connection());

        apply(&db, &batch, &context);
        let first = repo.all().unwrap();
        apply(&db, &batch, &context);
        assert_eq!(repo.all().unwrap(), first);
    }

    #[test]
    fn test_reconcile_sent_clears_acknowledged_keys_only() {
        let db = setup();
        let repo = SqliteSettingRepository::new(db.connection());
        repo.set_value(SettingKey::Theme, Some("dark")).unwrap();
        repo.set_last_modified(SettingKey::Theme, Some(900)).unwrap();
        repo.set_value(SettingKey::NewTabLayout, Some("grid")).unwrap();
        // This one changed again mid-flight
        repo.set_last_modified(SettingKey::NewTabLayout, Some(1_500)).unwrap();

        let sent = vec![
            value_record(SettingKey::Theme, "dark"),
            value_record(SettingKey::NewTabLayout, "grid"),
        ];
        reconcile_sent(&repo, &sent, &[], 1_000).unwrap();

        assert!(repo.last_modified(SettingKey::Theme).unwrap().is_none());
        assert_eq!(repo.last_modified(SettingKey::NewTabLayout).unwrap(), Some(1_500));
    }

    #[test]
    fn test_sent_tombstone_overridden_by_received_value() {
        // The local deletion lost: the server replied with a live value for
        // the same key, and the response handler restored it
        let db = setup();
        let repo = SqliteSettingRepository::new(db.connection());
        repo.set_value(SettingKey::Theme, None).unwrap();
        repo.set_last_modified(SettingKey::Theme, Some(900)).unwrap();

        let sent = vec![SyncableRecord::tombstone(SettingKey::Theme.as_str(), Some(900))];
        let received = vec![value_record(SettingKey::Theme, "kept")];

        apply(&db, &received, &ReconcileContext::steady(1_000));
        reconcile_sent(&repo, &sent, &received, 1_000).unwrap();

        assert_eq!(repo.get_value(SettingKey::Theme).unwrap().as_deref(), Some("kept"));
        assert!(repo.last_modified(SettingKey::Theme).unwrap().is_none());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_provider_roundtrip_converges_two_devices() {
        let device_a = Arc::new(Mutex::new(setup()));
        let device_b = Arc::new(Mutex::new(setup()));
        let provider_a = SettingsProvider::new(Arc::clone(&device_a));
        let provider_b = SettingsProvider::new(Arc::clone(&device_b));
        let crypter = crypter();

        {
            let db = device_a.lock().await;
            let repo = SqliteSettingRepository::new(db.connection());
            repo.update_value(SettingKey::Theme, Some("dark")).unwrap();
        }

        let sent = provider_a.fetch_changed_objects(&crypter).await.unwrap();
        assert_eq!(sent.len(), 1);

        let now = chrono::Utc::now().timestamp_millis();
        provider_b
            .handle_sync_response(&[], &sent, now, "cursor-1", &crypter)
            .await
            .unwrap();
        provider_a
            .handle_sync_response(&sent, &[], now, "cursor-1", &crypter)
            .await
            .unwrap();

        let value_b = {
            let db = device_b.lock().await;
            SqliteSettingRepository::new(db.connection())
                .get_value(SettingKey::Theme)
                .unwrap()
        };
        assert_eq!(value_b.as_deref(), Some("dark"));

        let leftover = provider_a.fetch_changed_objects(&crypter).await.unwrap();
        assert!(leftover.is_empty());
        assert_eq!(
            provider_b.last_sync_timestamp().await.unwrap().as_deref(),
            Some("cursor-1")
        );
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_initial_sync_response_applies_and_stores_cursor() {
        let db = Arc::new(Mutex::new(setup()));
        let provider = SettingsProvider::new(Arc::clone(&db));
        let crypter = crypter();

        {
            let guard = db.lock().await;
            let repo = SqliteSettingRepository::new(guard.connection());
            repo.update_value(SettingKey::Theme, Some("local")).unwrap();
        }

        provider
            .handle_initial_sync_response(
                &[value_record(SettingKey::Theme, "remote")],
                1_000,
                "cursor-0",
                &crypter,
            )
            .await
            .unwrap();

        let value = {
            let guard = db.lock().await;
            SqliteSettingRepository::new(guard.connection())
                .get_value(SettingKey::Theme)
                .unwrap()
        };
        assert_eq!(value.as_deref(), Some("remote"));
        assert_eq!(
            provider.last_sync_timestamp().await.unwrap().as_deref(),
            Some("cursor-0")
        );
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_prepare_for_first_sync_reuploads_existing_rows() {
        let db = Arc::new(Mutex::new(setup()));
        let provider = SettingsProvider::new(Arc::clone(&db));
        let crypter = crypter();

        {
            let guard = db.lock().await;
            let repo = SqliteSettingRepository::new(guard.connection());
            repo.set_value(SettingKey::Theme, Some("dark")).unwrap();
        }
        provider.set_last_sync_timestamp(Some("stale")).await.unwrap();

        provider.prepare_for_first_sync().await.unwrap();

        assert!(provider.last_sync_timestamp().await.unwrap().is_none());
        let records = provider.fetch_changed_objects(&crypter).await.unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].id, SettingKey::Theme.as_str());
    }
}
