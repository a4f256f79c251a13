//! Wire-level sync record model

use serde::{Deserialize, Serialize};

/// One unit of exchange with the sync server.
///
/// A record either carries an encrypted payload or is a tombstone announcing
/// a deletion; deletions are exchanged rather than silently dropped so other
/// devices learn about them.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncableRecord {
    /// Stable identifier, unique within a feature's namespace
    pub id: String,
    /// Encrypted payload; `None` only for tombstones
    pub encrypted_payload: Option<Vec<u8>>,
    /// Tombstone marker
    pub is_deleted: bool,
    /// When the sending device last changed this record (Unix ms)
    pub client_last_modified: Option<i64>,
}

impl SyncableRecord {
    /// Create a record carrying an encrypted payload
    #[must_use]
    pub fn new(
        id: impl Into<String>,
        encrypted_payload: Vec<u8>,
        client_last_modified: Option<i64>,
    ) -> Self {
        Self {
            id: id.into(),
            encrypted_payload: Some(encrypted_payload),
            is_deleted: false,
            client_last_modified,
        }
    }

    /// Create a tombstone announcing a deletion
    #[must_use]
    pub fn tombstone(id: impl Into<String>, client_last_modified: Option<i64>) -> Self {
        Self {
            id: id.into(),
            encrypted_payload: None,
            is_deleted: true,
            client_last_modified,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_payload_record() {
        let record = SyncableRecord::new("abc", vec![1, 2, 3], Some(42));
        assert!(!record.is_deleted);
        assert_eq!(record.encrypted_payload.as_deref(), Some(&[1, 2, 3][..]));
        assert_eq!(record.client_last_modified, Some(42));
    }

    #[test]
    fn test_tombstone_carries_no_payload() {
        let record = SyncableRecord::tombstone("abc", None);
        assert!(record.is_deleted);
        assert!(record.encrypted_payload.is_none());
    }
}
