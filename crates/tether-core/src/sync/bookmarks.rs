//! Bookmarks sync: change collection, tree reconciliation, and the provider
//! façade wiring them into the four-phase protocol.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use rusqlite::Connection;
use tokio::sync::Mutex;

use crate::crypto::{Crypter, SecretKey};
use crate::db::{BookmarkRepository, Database, SqliteBookmarkRepository};
use crate::error::{Error, Result};
use crate::models::{BookmarkPayload, FormFactor, SyncableRecord, BOOKMARKS_ROOT_ID};

use super::provider::{
    read_last_sync_timestamp, run_with_merge_retry, write_last_sync_timestamp, DataProvider,
};
use super::response::{
    decrypt_record_payload, local_change_wins, ReconcileContext, ResponseHandler,
};

const FEATURE: &str = "bookmarks";

/// Collect locally changed bookmarks as upload-ready records.
///
/// Pure read: markers are settled only after the server round trip, so a
/// failed upload never loses local state.
pub fn collect_changed_bookmarks(
    repo: &impl BookmarkRepository,
    crypter: &dyn Crypter,
    key: &SecretKey,
) -> Result<Vec<SyncableRecord>> {
    let mut records = Vec::new();

    for node in repo.modified()? {
        if node.pending_deletion {
            records.push(SyncableRecord::tombstone(node.id, node.modified_at));
            continue;
        }

        let children = if node.is_folder {
            repo.children(&node.id)?
        } else {
            Vec::new()
        };
        let payload = BookmarkPayload {
            title: node.title,
            url: node.url,
            is_folder: node.is_folder,
            children,
        };
        let encrypted = crypter.encrypt(&serde_json::to_vec(&payload)?, key)?;
        records.push(SyncableRecord::new(node.id, encrypted, node.modified_at));
    }

    for form in FormFactor::ALL {
        if let Some(modified_at) = repo.favorites_modified_at(form)? {
            let payload = BookmarkPayload {
                title: None,
                url: None,
                is_folder: true,
                children: repo.favorites(form)?,
            };
            let encrypted = crypter.encrypt(&serde_json::to_vec(&payload)?, key)?;
            records.push(SyncableRecord::new(
                form.root_record_id(),
                encrypted,
                Some(modified_at),
            ));
        }
    }

    Ok(records)
}

/// A received record after decryption and decoding
enum Incoming {
    Tombstone { id: String },
    Node { id: String, payload: BookmarkPayload },
    Favorites { form: FormFactor, children: Vec<String> },
}

/// Tree-shaped response handler for the bookmarks feature.
pub struct BookmarksResponseHandler<'a, R: BookmarkRepository> {
    repo: &'a R,
    crypter: &'a dyn Crypter,
    key: &'a SecretKey,
}

impl<'a, R: BookmarkRepository> BookmarksResponseHandler<'a, R> {
    pub const fn new(repo: &'a R, crypter: &'a dyn Crypter, key: &'a SecretKey) -> Self {
        Self { repo, crypter, key }
    }

    fn decode(&self, received: &[SyncableRecord]) -> Result<Vec<Incoming>> {
        let mut decoded = Vec::with_capacity(received.len());

        for record in received {
            if let Some(form) = FormFactor::from_record_id(&record.id) {
                if record.is_deleted {
                    tracing::debug!(id = %record.id, "ignoring tombstone for a favorites list");
                    continue;
                }
                let Some(plain) = decrypt_record_payload(self.crypter, self.key, record)? else {
                    continue;
                };
                let payload: BookmarkPayload = serde_json::from_slice(&plain)?;
                decoded.push(Incoming::Favorites {
                    form,
                    children: payload.children,
                });
                continue;
            }

            if record.is_deleted {
                decoded.push(Incoming::Tombstone {
                    id: record.id.clone(),
                });
                continue;
            }

            let Some(plain) = decrypt_record_payload(self.crypter, self.key, record)? else {
                continue;
            };
            let payload: BookmarkPayload = serde_json::from_slice(&plain)?;
            decoded.push(Incoming::Node {
                id: record.id.clone(),
                payload,
            });
        }

        Ok(decoded)
    }

    /// Attaching `child` under `folder_id` must not close a loop: walk up
    /// from the folder and refuse if the candidate child is an ancestor.
    fn would_create_cycle(&self, folder_id: &str, child: &str) -> Result<bool> {
        let mut current = Some(folder_id.to_string());
        let mut seen = HashSet::new();
        while let Some(id) = current {
            if id == child {
                return Ok(true);
            }
            if !seen.insert(id.clone()) {
                break;
            }
            current = self.repo.get(&id)?.and_then(|node| node.parent_id);
        }
        Ok(false)
    }

    /// Whether `child` may become a member of `folder_id` given this batch
    fn child_is_eligible(
        &self,
        folder_id: &str,
        child: &str,
        deleted_in_batch: &HashSet<&str>,
        child_to_parents: &HashMap<&str, Vec<&str>>,
    ) -> Result<bool> {
        if child == BOOKMARKS_ROOT_ID || deleted_in_batch.contains(child) {
            return Ok(false);
        }
        // When several folders in the batch claim the same child, the last
        // one in arrival order is authoritative
        if let Some(last) = child_to_parents.get(child).and_then(|parents| parents.last()) {
            if *last != folder_id {
                return Ok(false);
            }
        }
        if self.would_create_cycle(folder_id, child)? {
            tracing::warn!(folder = folder_id, child, "refusing membership that would form a cycle");
            return Ok(false);
        }
        let node = self.repo.fetch_or_create(child)?;
        Ok(!node.pending_deletion)
    }

    /// Merge a folder's received children with local state.
    ///
    /// In first-sync mode the received order replaces the local one
    /// wholesale; in steady state membership is updated while the relative
    /// order of untouched siblings is preserved and newcomers are appended
    /// in received order.
    fn merged_children(
        &self,
        folder_id: &str,
        received: &[String],
        context: &ReconcileContext,
        deleted_in_batch: &HashSet<&str>,
        child_to_parents: &HashMap<&str, Vec<&str>>,
    ) -> Result<Vec<String>> {
        if context.deduplicate {
            let mut merged = Vec::with_capacity(received.len());
            for child in received {
                if self.child_is_eligible(folder_id, child, deleted_in_batch, child_to_parents)? {
                    merged.push(child.clone());
                }
            }
            return Ok(merged);
        }

        let current = self.repo.children(folder_id)?;
        let received_set: HashSet<&str> = received.iter().map(String::as_str).collect();

        let mut merged = Vec::new();
        for child in &current {
            if received_set.contains(child.as_str())
                && self.child_is_eligible(folder_id, child, deleted_in_batch, child_to_parents)?
            {
                merged.push(child.clone());
            }
        }
        for child in received {
            if current.contains(child) {
                continue;
            }
            if self.child_is_eligible(folder_id, child, deleted_in_batch, child_to_parents)? {
                merged.push(child.clone());
            }
        }

        Ok(merged)
    }

    fn apply_favorites(
        &self,
        form: FormFactor,
        received: &[String],
        context: &ReconcileContext,
        deleted_in_batch: &HashSet<&str>,
    ) -> Result<()> {
        if local_change_wins(self.repo.favorites_modified_at(form)?, context) {
            return Ok(());
        }

        let member_eligible = |child: &str| -> Result<bool> {
            if deleted_in_batch.contains(child) {
                return Ok(false);
            }
            let node = self.repo.fetch_or_create(child)?;
            Ok(!node.pending_deletion)
        };

        let current = self.repo.favorites(form)?;
        let mut merged = Vec::new();
        if context.deduplicate {
            for child in received {
                if member_eligible(child)? {
                    merged.push(child.clone());
                }
            }
        } else {
            let received_set: HashSet<&str> = received.iter().map(String::as_str).collect();
            for child in &current {
                if received_set.contains(child.as_str()) && !deleted_in_batch.contains(child.as_str())
                {
                    merged.push(child.clone());
                }
            }
            for child in received {
                if current.contains(child) {
                    continue;
                }
                if member_eligible(child)? {
                    merged.push(child.clone());
                }
            }
        }

        // A bookmark dropped from the unified list stops being a favorite on
        // every form factor; untouched entries keep their relative order.
        if form == FormFactor::Unified {
            let merged_set: HashSet<&str> = merged.iter().map(String::as_str).collect();
            let removed: HashSet<&str> = current
                .iter()
                .map(String::as_str)
                .filter(|id| !merged_set.contains(*id))
                .collect();
            if !removed.is_empty() {
                for other in [FormFactor::Desktop, FormFactor::Mobile] {
                    let list = self.repo.favorites(other)?;
                    let kept: Vec<String> = list
                        .iter()
                        .filter(|id| !removed.contains(id.as_str()))
                        .cloned()
                        .collect();
                    if kept.len() != list.len() {
                        self.repo.set_favorites(other, &kept)?;
                    }
                }
            }
        }

        self.repo.set_favorites(form, &merged)?;
        self.repo.set_favorites_modified_at(form, None)?;
        Ok(())
    }
}

impl<R: BookmarkRepository> ResponseHandler for BookmarksResponseHandler<'_, R> {
    fn apply_batch(&self, received: &[SyncableRecord], context: &ReconcileContext) -> Result<()> {
        let decoded = self.decode(received)?;

        // Indices over the whole batch, built before anything is applied, so
        // structure resolves without assuming receipt order
        let mut parent_to_children: HashMap<&str, &[String]> = HashMap::new();
        let mut child_to_parents: HashMap<&str, Vec<&str>> = HashMap::new();
        let mut deleted_in_batch: HashSet<&str> = HashSet::new();
        for item in &decoded {
            match item {
                Incoming::Tombstone { id } => {
                    deleted_in_batch.insert(id.as_str());
                }
                Incoming::Node { id, payload } if payload.is_folder => {
                    parent_to_children.insert(id.as_str(), payload.children.as_slice());
                    for child in &payload.children {
                        // A folder listing itself is malformed; it must not
                        // count as a parent claim
                        if child == id {
                            continue;
                        }
                        child_to_parents
                            .entry(child.as_str())
                            .or_default()
                            .push(id.as_str());
                    }
                }
                _ => {}
            }
        }

        // Node contents, in arrival order: for an id appearing more than
        // once, the last record wins
        let mut applied_folders: Vec<&str> = Vec::new();
        let mut applied_favorites: Vec<(FormFactor, &[String])> = Vec::new();
        for item in &decoded {
            match item {
                Incoming::Tombstone { id } => {
                    if id == BOOKMARKS_ROOT_ID {
                        tracing::debug!("ignoring tombstone for the root folder");
                        continue;
                    }
                    let Some(local) = self.repo.get(id)? else {
                        continue;
                    };
                    if local_change_wins(local.modified_at, context) {
                        continue;
                    }
                    // Detach and keep the node so the deletion can propagate
                    // before physical removal
                    self.repo.detach(id)?;
                    self.repo.mark_pending_deletion(id)?;
                    self.repo.set_modified_at(id, None)?;
                }
                Incoming::Node { id, payload } => {
                    if let Some(local) = self.repo.get(id)? {
                        if local_change_wins(local.modified_at, context) {
                            continue;
                        }
                    }
                    self.repo.upsert(
                        id,
                        payload.title.as_deref(),
                        payload.url.as_deref(),
                        payload.is_folder,
                    )?;
                    self.repo.set_modified_at(id, None)?;
                    if payload.is_folder {
                        applied_folders.push(id.as_str());
                    }
                }
                Incoming::Favorites { form, children } => {
                    applied_favorites.push((*form, children.as_slice()));
                }
            }
        }

        // Folder structure for the records that were actually applied
        for folder_id in applied_folders {
            let received_children = parent_to_children
                .get(folder_id)
                .copied()
                .unwrap_or_default();
            let merged = self.merged_children(
                folder_id,
                received_children,
                context,
                &deleted_in_batch,
                &child_to_parents,
            )?;
            self.repo.set_children(folder_id, &merged)?;
        }

        for (form, received_children) in applied_favorites {
            self.apply_favorites(form, received_children, context, &deleted_in_batch)?;
        }

        Ok(())
    }
}

/// Settle pending-sync markers for the records sent this cycle.
fn reconcile_sent(
    repo: &impl BookmarkRepository,
    sent: &[SyncableRecord],
    received: &[SyncableRecord],
    client_timestamp: i64,
) -> Result<()> {
    let received_live: HashSet<&str> = received
        .iter()
        .filter(|record| !record.is_deleted)
        .map(|record| record.id.as_str())
        .collect();

    for record in sent {
        if let Some(form) = FormFactor::from_record_id(&record.id) {
            let still_dirty = repo
                .favorites_modified_at(form)?
                .is_some_and(|modified| modified > client_timestamp);
            if !still_dirty {
                repo.set_favorites_modified_at(form, None)?;
            }
            continue;
        }

        let Some(node) = repo.get(&record.id)? else {
            continue;
        };

        // Changed again during the round trip: stays dirty for next cycle
        if node
            .modified_at
            .is_some_and(|modified| modified > client_timestamp)
        {
            continue;
        }

        if record.is_deleted {
            if received_live.contains(record.id.as_str()) {
                // The server says this record still exists elsewhere: cancel
                // the deletion instead of deleting data another device kept
                tracing::debug!(id = %record.id, "sent tombstone superseded, resurrecting");
                repo.upsert(
                    &record.id,
                    node.title.as_deref(),
                    node.url.as_deref(),
                    node.is_folder,
                )?;
                repo.set_modified_at(&record.id, None)?;
            } else if node.pending_deletion {
                // Deletion acknowledged everywhere it needs to be; the
                // tombstone can finally be removed for real
                repo.purge(&record.id)?;
            }
            continue;
        }

        repo.set_modified_at(&record.id, None)?;
    }

    Ok(())
}

/// Bookmarks data provider exposing the four-phase sync protocol.
#[derive(Clone)]
pub struct BookmarksProvider {
    db: Arc<Mutex<Database>>,
}

impl BookmarksProvider {
    #[must_use]
    pub fn new(db: Arc<Mutex<Database>>) -> Self {
        Self { db }
    }

    /// One reconciliation pass inside a single transaction; the caller
    /// retries on merge conflicts
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
            let repo = SqliteBookmarkRepository::new(&tx);
            let handler = BookmarksResponseHandler::new(&repo, crypter, key);
            handler.apply_batch(received, context)?;
            if let Some(sent) = sent {
                reconcile_sent(&repo, sent, received, context.client_timestamp)?;
            }
        }
        tx.commit()?;
        Ok(())
    }
}

impl DataProvider for BookmarksProvider {
    fn feature(&self) -> &'static str {
        FEATURE
    }

    async fn prepare_for_first_sync(&self) -> Result<()> {
        let mut db = self.db.lock().await;
        let now = chrono::Utc::now().timestamp_millis();

        let tx = db.connection_mut().transaction()?;
        SqliteBookmarkRepository::new(&tx).mark_all_modified(now)?;
        tx.commit()?;

        write_last_sync_timestamp(db.connection(), FEATURE, None)?;
        tracing::info!(feature = FEATURE, "prepared for first sync");
        Ok(())
    }

    async fn fetch_changed_objects(&self, crypter: &dyn Crypter) -> Result<Vec<SyncableRecord>> {
        let key = crypter.fetch_secret_key()?;
        let db = self.db.lock().await;
        let repo = SqliteBookmarkRepository::new(db.connection());
        collect_changed_bookmarks(&repo, crypter, &key)
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
