//! Bookmark tree model

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Well-known record id of the bookmarks root folder
pub const BOOKMARKS_ROOT_ID: &str = "bookmarks_root";

/// Favorites lists are kept per form factor so a desktop and a phone can
/// pin different subsets while the unified list tracks the union.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FormFactor {
    /// Union list shared by all devices
    Unified,
    Desktop,
    Mobile,
}

impl FormFactor {
    /// All form factors, unified first
    pub const ALL: [Self; 3] = [Self::Unified, Self::Desktop, Self::Mobile];

    /// Stable name used as the storage key
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Unified => "unified",
            Self::Desktop => "desktop",
            Self::Mobile => "mobile",
        }
    }

    /// Well-known record id of this form factor's favorites list
    #[must_use]
    pub const fn root_record_id(self) -> &'static str {
        match self {
            Self::Unified => "favorites_root",
            Self::Desktop => "desktop_favorites_root",
            Self::Mobile => "mobile_favorites_root",
        }
    }

    /// Map a received record id back to a favorites form factor
    #[must_use]
    pub fn from_record_id(id: &str) -> Option<Self> {
        Self::ALL
            .into_iter()
            .find(|form| form.root_record_id() == id)
    }

    /// Map a storage key back to a form factor
    #[must_use]
    pub fn from_str_key(key: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|form| form.as_str() == key)
    }
}

/// A node in the local bookmark tree.
///
/// Nodes live in a flat id-keyed table; the tree structure is carried by the
/// `parent_id` relation. A node with no parent (other than the root) is an
/// orphan awaiting re-parenting by a later sync cycle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BookmarkNode {
    /// Stable identifier, shared across devices
    pub id: String,
    pub title: Option<String>,
    /// Target URL; `None` for folders
    pub url: Option<String>,
    pub is_folder: bool,
    /// Owning folder; `None` marks an orphan (or the root itself)
    pub parent_id: Option<String>,
    /// Local modification time not yet acknowledged by the server (Unix ms)
    pub modified_at: Option<i64>,
    /// Soft-delete marker; the node is kept until the deletion has
    /// propagated, then physically removed
    pub pending_deletion: bool,
}

impl BookmarkNode {
    /// Create a new bookmark with a fresh id, marked locally modified
    #[must_use]
    pub fn new_bookmark(title: impl Into<String>, url: impl Into<String>) -> Self {
        Self {
            id: Uuid::now_v7().to_string(),
            title: Some(title.into()),
            url: Some(url.into()),
            is_folder: false,
            parent_id: None,
            modified_at: Some(chrono::Utc::now().timestamp_millis()),
            pending_deletion: false,
        }
    }

    /// Create a new folder with a fresh id, marked locally modified
    #[must_use]
    pub fn new_folder(title: impl Into<String>) -> Self {
        Self {
            id: Uuid::now_v7().to_string(),
            title: Some(title.into()),
            url: None,
            is_folder: true,
            parent_id: None,
            modified_at: Some(chrono::Utc::now().timestamp_millis()),
            pending_deletion: false,
        }
    }

    /// Whether this node is detached from the tree
    #[must_use]
    pub fn is_orphan(&self) -> bool {
        self.parent_id.is_none() && self.id != BOOKMARKS_ROOT_ID
    }
}

/// Decrypted wire payload of a bookmark record.
///
/// Folders carry their ordered `children` ids; membership changes always
/// travel with the owning folder's record.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BookmarkPayload {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    #[serde(default)]
    pub is_folder: bool,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub children: Vec<String>,
}
