//! Shared reconciliation rules applied to every received batch.

use crate::crypto::{Crypter, CryptoError, SecretKey};
use crate::error::{Error, Result};
use crate::models::SyncableRecord;

/// Per-cycle inputs shared by every feature shape.
#[derive(Debug, Clone, Copy)]
pub struct ReconcileContext {
    /// Snapshot time this cycle's local-change detection is based on
    /// (Unix ms); the precedence boundary for "local wins" decisions
    pub client_timestamp: i64,
    /// First-sync mode: the device has no history to protect, so every
    /// received record applies unconditionally
    pub deduplicate: bool,
}

impl ReconcileContext {
    /// Context for the very first sync of a feature on this device
    #[must_use]
    pub const fn first_sync(client_timestamp: i64) -> Self {
        Self {
            client_timestamp,
            deduplicate: true,
        }
    }

    /// Context for a steady-state sync cycle
    #[must_use]
    pub const fn steady(client_timestamp: i64) -> Self {
        Self {
            client_timestamp,
            deduplicate: false,
        }
    }
}

/// Whether an unacknowledged local change takes precedence over an incoming
/// record: only outside first-sync mode, and only when the local change
/// postdates the cycle's snapshot.
pub(crate) fn local_change_wins(last_modified: Option<i64>, context: &ReconcileContext) -> bool {
    if context.deduplicate {
        return false;
    }
    last_modified.is_some_and(|modified| modified > context.client_timestamp)
}

/// Decrypt one record's payload.
///
/// Returns `Ok(None)` when the record should be skipped without failing the
/// batch: a payload too short to be valid ciphertext, or a non-tombstone
/// record arriving with no payload at all. An authentication failure means
/// the key is wrong for the whole batch and is returned as an error.
pub(crate) fn decrypt_record_payload(
    crypter: &dyn Crypter,
    key: &SecretKey,
    record: &SyncableRecord,
) -> Result<Option<Vec<u8>>> {
    let Some(payload) = record.encrypted_payload.as_deref() else {
        tracing::warn!(id = %record.id, "skipping record with missing payload");
        return Ok(None);
    };

    match crypter.decrypt(payload, key) {
        Ok(plain) => Ok(Some(plain)),
        Err(CryptoError::InvalidCiphertextLength(len)) => {
            tracing::warn!(id = %record.id, len, "skipping record with malformed ciphertext");
            Ok(None)
        }
        Err(error) => Err(Error::Crypto(error)),
    }
}

/// Reconciliation strategy for one feature shape, selected per feature when
/// its data provider is constructed.
pub trait ResponseHandler {
    /// Apply `received` to local state under the shared merge rules
    fn apply_batch(&self, received: &[SyncableRecord], context: &ReconcileContext) -> Result<()>;
}
