//! Bookmark tree repository implementation

#![allow(clippy::cast_possible_wrap)] // SQLite uses i64 for positions

use crate::error::{Error, Result};
use crate::models::{BookmarkNode, FormFactor, BOOKMARKS_ROOT_ID};
use rusqlite::{params, Connection};

/// Trait for bookmark tree storage operations
pub trait BookmarkRepository {
    /// Get a node by id
    fn get(&self, id: &str) -> Result<Option<BookmarkNode>>;

    /// Get a node by id, creating a detached placeholder when absent.
    ///
    /// Placeholders are filled in once the node's own record arrives; until
    /// then they carry no title, no url and no modification marker.
    fn fetch_or_create(&self, id: &str) -> Result<BookmarkNode>;

    /// Create or overwrite a node's content fields.
    ///
    /// Structure (parent, position) is managed separately via
    /// [`BookmarkRepository::set_children`]; a pending deletion is cancelled
    /// because the node demonstrably exists again.
    fn upsert(&self, id: &str, title: Option<&str>, url: Option<&str>, is_folder: bool)
        -> Result<()>;

    /// Ordered child ids of a folder
    fn children(&self, folder_id: &str) -> Result<Vec<String>>;

    /// Replace a folder's ordered children; previous members not listed are
    /// detached into orphans
    fn set_children(&self, folder_id: &str, children: &[String]) -> Result<()>;

    /// Detach a node from its parent, leaving it as an orphan
    fn detach(&self, id: &str) -> Result<()>;

    /// Soft-delete a node so the deletion can propagate before removal
    fn mark_pending_deletion(&self, id: &str) -> Result<()>;

    /// Physically remove a node and its favorites membership
    fn purge(&self, id: &str) -> Result<()>;

    /// Set or clear a node's local modification marker
    fn set_modified_at(&self, id: &str, modified_at: Option<i64>) -> Result<()>;

    /// Stamp every live node as locally modified (first-sync preparation)
    fn mark_all_modified(&self, modified_at: i64) -> Result<()>;

    /// Nodes with an unacknowledged local change or a pending deletion
    fn modified(&self) -> Result<Vec<BookmarkNode>>;

    /// Detached nodes awaiting re-parenting
    fn orphans(&self) -> Result<Vec<BookmarkNode>>;

    /// Ordered favorites of one form factor
    fn favorites(&self, form: FormFactor) -> Result<Vec<String>>;

    /// Replace one form factor's ordered favorites
    fn set_favorites(&self, form: FormFactor, ids: &[String]) -> Result<()>;

    /// Local modification marker of one favorites list
    fn favorites_modified_at(&self, form: FormFactor) -> Result<Option<i64>>;

    /// Set or clear a favorites list's modification marker
    fn set_favorites_modified_at(&self, form: FormFactor, modified_at: Option<i64>) -> Result<()>;

    /// Create a bookmark at the end of a folder (local edit)
    fn create_bookmark(&self, title: &str, url: &str, parent_id: &str) -> Result<BookmarkNode>;

    /// Create a folder at the end of a folder (local edit)
    fn create_folder(&self, title: &str, parent_id: &str) -> Result<BookmarkNode>;

    /// Rename a node (local edit)
    fn rename(&self, id: &str, title: &str) -> Result<()>;

    /// Soft-delete a node (local edit); the tombstone uploads on the next
    /// sync cycle
    fn delete(&self, id: &str) -> Result<()>;

    /// Add a bookmark to a favorites list (local edit); non-unified
    /// additions propagate into the unified list
    fn add_favorite(&self, form: FormFactor, id: &str) -> Result<()>;

    /// Remove a bookmark from a favorites list (local edit); unified
    /// removals propagate to every form factor
    fn remove_favorite(&self, form: FormFactor, id: &str) -> Result<()>;
}

/// `SQLite` implementation of `BookmarkRepository`
pub struct SqliteBookmarkRepository<'a> {
    conn: &'a Connection,
}

impl<'a> SqliteBookmarkRepository<'a> {
    /// Create a new repository with the given connection
    pub const fn new(conn: &'a Connection) -> Self {
        Self { conn }
    }

    /// Parse a node from a database row
    fn parse_node(row: &rusqlite::Row<'_>) -> rusqlite::Result<BookmarkNode> {
        Ok(BookmarkNode {
            id: row.get(0)?,
            title: row.get(1)?,
            url: row.get(2)?,
            is_folder: row.get::<_, i32>(3)? != 0,
            parent_id: row.get(4)?,
            modified_at: row.get(5)?,
            pending_deletion: row.get::<_, i32>(6)? != 0,
        })
    }

    const SELECT_NODE: &'static str =
        "SELECT id, title, url, is_folder, parent_id, modified_at, pending_deletion FROM bookmarks";

    fn append_to_parent(&self, id: &str, parent_id: &str) -> Result<()> {
        self.conn.execute(
            "UPDATE bookmarks
             SET parent_id = ?1,
                 position = (SELECT COALESCE(MAX(position), -1) + 1
                             FROM bookmarks WHERE parent_id = ?1)
             WHERE id = ?2",
            params![parent_id, id],
        )?;
        Ok(())
    }

    fn insert_node(&self, node: &BookmarkNode, parent_id: &str) -> Result<BookmarkNode> {
        let folder = self.get(parent_id)?.ok_or_else(|| Error::NotFound(parent_id.to_string()))?;
        if !folder.is_folder {
            return Err(Error::InvalidInput(format!("{parent_id} is not a folder")));
        }

        self.conn.execute(
            "INSERT INTO bookmarks (id, title, url, is_folder, parent_id, position, modified_at, pending_deletion)
             VALUES (?1, ?2, ?3, ?4, NULL, 0, ?5, 0)",
            params![node.id, node.title, node.url, i32::from(node.is_folder), node.modified_at],
        )?;
        self.append_to_parent(&node.id, parent_id)?;

        // The folder's child list changed, so it re-uploads too
        self.set_modified_at(parent_id, node.modified_at)?;

        self.get(&node.id)?.ok_or_else(|| Error::NotFound(node.id.clone()))
    }
}

impl BookmarkRepository for SqliteBookmarkRepository<'_> {
    fn get(&self, id: &str) -> Result<Option<BookmarkNode>> {
        let result = self.conn.query_row(
            &format!("{} WHERE id = ?", Self::SELECT_NODE),
            params![id],
            Self::parse_node,
        );

        match result {
            Ok(node) => Ok(Some(node)),
            Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    fn fetch_or_create(&self, id: &str) -> Result<BookmarkNode> {
        self.conn.execute(
            "INSERT OR IGNORE INTO bookmarks (id, is_folder, position) VALUES (?1, 0, 0)",
            params![id],
        )?;
        self.get(id)?.ok_or_else(|| Error::NotFound(id.to_string()))
    }

    fn upsert(
        &self,
        id: &str,
        title: Option<&str>,
        url: Option<&str>,
        is_folder: bool,
    ) -> Result<()> {
        self.conn.execute(
            "INSERT INTO bookmarks (id, title, url, is_folder, parent_id, position, modified_at, pending_deletion)
             VALUES (?1, ?2, ?3, ?4, NULL, 0, NULL, 0)
             ON CONFLICT(id) DO UPDATE SET
               title = excluded.title,
               url = excluded.url,
               is_folder = excluded.is_folder,
               pending_deletion = 0",
            params![id, title, url, i32::from(is_folder)],
        )?;
        Ok(())
    }

    fn children(&self, folder_id: &str) -> Result<Vec<String>> {
        let mut stmt = self.conn.prepare(
            "SELECT id FROM bookmarks WHERE parent_id = ? ORDER BY position ASC, id ASC",
        )?;
        let ids = stmt
            .query_map(params![folder_id], |row| row.get(0))?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(ids)
    }

    fn set_children(&self, folder_id: &str, children: &[String]) -> Result<()> {
        for previous in self.children(folder_id)? {
            if !children.contains(&previous) {
                self.detach(&previous)?;
            }
        }

        let mut stmt = self
            .conn
            .prepare("UPDATE bookmarks SET parent_id = ?1, position = ?2 WHERE id = ?3")?;
        for (index, child) in children.iter().enumerate() {
            stmt.execute(params![folder_id, index as i64, child])?;
        }
        Ok(())
    }

    fn detach(&self, id: &str) -> Result<()> {
        self.conn.execute(
            "UPDATE bookmarks SET parent_id = NULL, position = 0 WHERE id = ?",
            params![id],
        )?;
        Ok(())
    }

    fn mark_pending_deletion(&self, id: &str) -> Result<()> {
        self.conn.execute(
            "UPDATE bookmarks SET pending_deletion = 1 WHERE id = ?",
            params![id],
        )?;
        Ok(())
    }

    fn purge(&self, id: &str) -> Result<()> {
        self.conn
            .execute("DELETE FROM favorites WHERE bookmark_id = ?", params![id])?;
        self.conn
            .execute("DELETE FROM bookmarks WHERE id = ?", params![id])?;
        Ok(())
    }

    fn set_modified_at(&self, id: &str, modified_at: Option<i64>) -> Result<()> {
        self.conn.execute(
            "UPDATE bookmarks SET modified_at = ?1 WHERE id = ?2",
            params![modified_at, id],
        )?;
        Ok(())
    }

    fn mark_all_modified(&self, modified_at: i64) -> Result<()> {
        self.conn.execute(
            "UPDATE bookmarks SET modified_at = ?1 WHERE pending_deletion = 0",
            params![modified_at],
        )?;
        for form in FormFactor::ALL {
            self.set_favorites_modified_at(form, Some(modified_at))?;
        }
        Ok(())
    }

    fn modified(&self) -> Result<Vec<BookmarkNode>> {
        let mut stmt = self.conn.prepare(&format!(
            "{} WHERE modified_at IS NOT NULL OR pending_deletion = 1 ORDER BY id ASC",
            Self::SELECT_NODE
        ))?;
        let nodes = stmt
            .query_map([], Self::parse_node)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(nodes)
    }

    fn orphans(&self) -> Result<Vec<BookmarkNode>> {
        let mut stmt = self.conn.prepare(&format!(
            "{} WHERE parent_id IS NULL AND id != ?1 AND pending_deletion = 0 ORDER BY id ASC",
            Self::SELECT_NODE
        ))?;
        let nodes = stmt
            .query_map(params![BOOKMARKS_ROOT_ID], Self::parse_node)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(nodes)
    }

    fn favorites(&self, form: FormFactor) -> Result<Vec<String>> {
        let mut stmt = self.conn.prepare(
            "SELECT bookmark_id FROM favorites WHERE form_factor = ? ORDER BY position ASC",
        )?;
        let ids = stmt
            .query_map(params![form.as_str()], |row| row.get(0))?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(ids)
    }

    fn set_favorites(&self, form: FormFactor, ids: &[String]) -> Result<()> {
        self.conn.execute(
            "DELETE FROM favorites WHERE form_factor = ?",
            params![form.as_str()],
        )?;
        let mut stmt = self.conn.prepare(
            "INSERT INTO favorites (form_factor, bookmark_id, position) VALUES (?1, ?2, ?3)",
        )?;
        for (index, id) in ids.iter().enumerate() {
            stmt.execute(params![form.as_str(), id, index as i64])?;
        }
        Ok(())
    }

    fn favorites_modified_at(&self, form: FormFactor) -> Result<Option<i64>> {
        let result = self.conn.query_row(
            "SELECT modified_at FROM favorites_state WHERE form_factor = ?",
            params![form.as_str()],
            |row| row.get(0),
        );

        match result {
            Ok(modified_at) => Ok(modified_at),
            Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    fn set_favorites_modified_at(&self, form: FormFactor, modified_at: Option<i64>) -> Result<()> {
        self.conn.execute(
            "INSERT INTO favorites_state (form_factor, modified_at) VALUES (?1, ?2)
             ON CONFLICT(form_factor) DO UPDATE SET modified_at = excluded.modified_at",
            params![form.as_str(), modified_at],
        )?;
        Ok(())
    }

    fn create_bookmark(&self, title: &str, url: &str, parent_id: &str) -> Result<BookmarkNode> {
        let node = BookmarkNode::new_bookmark(title, url);
        self.insert_node(&node, parent_id)
    }

    fn create_folder(&self, title: &str, parent_id: &str) -> Result<BookmarkNode> {
        let node = BookmarkNode::new_folder(title);
        self.insert_node(&node, parent_id)
    }

    fn rename(&self, id: &str, title: &str) -> Result<()> {
        let now = chrono::Utc::now().timestamp_millis();
        let rows = self.conn.execute(
            "UPDATE bookmarks SET title = ?1, modified_at = ?2 WHERE id = ?3 AND pending_deletion = 0",
            params![title, now, id],
        )?;
        if rows == 0 {
            return Err(Error::NotFound(id.to_string()));
        }
        Ok(())
    }

    fn delete(&self, id: &str) -> Result<()> {
        if id == BOOKMARKS_ROOT_ID {
            return Err(Error::InvalidInput("cannot delete the root folder".to_string()));
        }
        let node = self.get(id)?.ok_or_else(|| Error::NotFound(id.to_string()))?;
        let now = chrono::Utc::now().timestamp_millis();

        if node.is_folder {
            for child in self.children(id)? {
                self.detach(&child)?;
            }
        }
        self.detach(id)?;
        self.conn.execute(
            "UPDATE bookmarks SET pending_deletion = 1, modified_at = ?1 WHERE id = ?2",
            params![now, id],
        )?;
        self.conn
            .execute("DELETE FROM favorites WHERE bookmark_id = ?", params![id])?;

        // The old parent's child list changed, so it re-uploads too
        if let Some(parent_id) = node.parent_id {
            self.set_modified_at(&parent_id, Some(now))?;
        }
        Ok(())
    }

    fn add_favorite(&self, form: FormFactor, id: &str) -> Result<()> {
        let now = chrono::Utc::now().timestamp_millis();
        let inserted = self.conn.execute(
            "INSERT OR IGNORE INTO favorites (form_factor, bookmark_id, position)
             VALUES (?1, ?2, (SELECT COALESCE(MAX(position), -1) + 1
                              FROM favorites WHERE form_factor = ?1))",
            params![form.as_str(), id],
        )?;
        if inserted > 0 {
            self.set_favorites_modified_at(form, Some(now))?;
        }

        if form != FormFactor::Unified {
            self.add_favorite(FormFactor::Unified, id)?;
        }
        Ok(())
    }

    fn remove_favorite(&self, form: FormFactor, id: &str) -> Result<()> {
        let now = chrono::Utc::now().timestamp_millis();
        let forms: &[FormFactor] = if form == FormFactor::Unified {
            &FormFactor::ALL
        } else {
            std::slice::from_ref(&form)
        };

        for target in forms {
            let removed = self.conn.execute(
                "DELETE FROM favorites WHERE form_factor = ?1 AND bookmark_id = ?2",
                params![target.as_str(), id],
            )?;
            if removed > 0 {
                self.set_favorites_modified_at(*target, Some(now))?;
            }
        }
        Ok(())
    }
}
