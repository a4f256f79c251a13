//! Synced settings repository implementation

use crate::error::Result;
use crate::models::{Setting, SettingKey};
use rusqlite::{params, Connection};
use std::collections::HashMap;

/// Trait for synced settings storage, including per-key sync metadata
pub trait SettingRepository {
    /// Get a setting; `None` when the key was never written
    fn get(&self, key: SettingKey) -> Result<Option<Setting>>;

    /// Current value of a key; soft-deleted and never-written both read as
    /// `None`
    fn get_value(&self, key: SettingKey) -> Result<Option<String>>;

    /// Write a value without touching sync metadata (sync application
    /// path). `None` is the tombstone state and setting it twice is a no-op.
    fn set_value(&self, key: SettingKey, value: Option<&str>) -> Result<()>;

    /// Write a value and stamp the key as locally modified (local edit path)
    fn update_value(&self, key: SettingKey, value: Option<&str>) -> Result<()>;

    /// All settings rows that exist
    fn all(&self) -> Result<Vec<Setting>>;

    /// Unacknowledged local modification time of a key
    fn last_modified(&self, key: SettingKey) -> Result<Option<i64>>;

    /// Unacknowledged local modification times for a set of keys
    fn last_modified_many(&self, keys: &[SettingKey]) -> Result<HashMap<SettingKey, i64>>;

    /// Set or clear a key's modification marker; the metadata row is kept
    /// either way as the merge anchor
    fn set_last_modified(&self, key: SettingKey, last_modified: Option<i64>) -> Result<()>;

    /// Keys with an unacknowledged local change
    fn modified_keys(&self) -> Result<Vec<SettingKey>>;

    /// Stamp every existing settings row as locally modified (first-sync
    /// preparation)
    fn mark_all_modified(&self, modified_at: i64) -> Result<()>;
}

/// `SQLite` implementation of `SettingRepository`
pub struct SqliteSettingRepository<'a> {
    conn: &'a Connection,
}

impl<'a> SqliteSettingRepository<'a> {
    /// Create a new repository with the given connection
    pub const fn new(conn: &'a Connection) -> Self {
        Self { conn }
    }
}

impl SettingRepository for SqliteSettingRepository<'_> {
    fn get(&self, key: SettingKey) -> Result<Option<Setting>> {
        let result = self.conn.query_row(
            "SELECT value FROM settings WHERE key = ?",
            params![key.as_str()],
            |row| row.get::<_, Option<String>>(0),
        );

        match result {
            Ok(value) => Ok(Some(Setting { key, value })),
            Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    fn get_value(&self, key: SettingKey) -> Result<Option<String>> {
        Ok(self.get(key)?.and_then(|setting| setting.value))
    }

    fn set_value(&self, key: SettingKey, value: Option<&str>) -> Result<()> {
        self.conn.execute(
            "INSERT INTO settings (key, value) VALUES (?1, ?2)
             ON CONFLICT(key) DO UPDATE SET value = excluded.value",
            params![key.as_str(), value],
        )?;
        Ok(())
    }

    fn update_value(&self, key: SettingKey, value: Option<&str>) -> Result<()> {
        self.set_value(key, value)?;
        self.set_last_modified(key, Some(chrono::Utc::now().timestamp_millis()))
    }

    fn all(&self) -> Result<Vec<Setting>> {
        let mut stmt = self
            .conn
            .prepare("SELECT key, value FROM settings ORDER BY key ASC")?;
        let rows = stmt
            .query_map([], |row| {
                Ok((row.get::<_, String>(0)?, row.get::<_, Option<String>>(1)?))
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;

        // Unknown keys written by newer clients are skipped, not errors
        Ok(rows
            .into_iter()
            .filter_map(|(key, value)| {
                SettingKey::from_record_id(&key).map(|key| Setting { key, value })
            })
            .collect())
    }

    fn last_modified(&self, key: SettingKey) -> Result<Option<i64>> {
        let result = self.conn.query_row(
            "SELECT last_modified FROM settings_metadata WHERE key = ?",
            params![key.as_str()],
            |row| row.get::<_, Option<i64>>(0),
        );

        match result {
            Ok(last_modified) => Ok(last_modified),
            Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    fn last_modified_many(&self, keys: &[SettingKey]) -> Result<HashMap<SettingKey, i64>> {
        let mut map = HashMap::with_capacity(keys.len());
        for key in keys {
            if let Some(last_modified) = self.last_modified(*key)? {
                map.insert(*key, last_modified);
            }
        }
        Ok(map)
    }

    fn set_last_modified(&self, key: SettingKey, last_modified: Option<i64>) -> Result<()> {
        self.conn.execute(
            "INSERT INTO settings_metadata (key, last_modified) VALUES (?1, ?2)
             ON CONFLICT(key) DO UPDATE SET last_modified = excluded.last_modified",
            params![key.as_str(), last_modified],
        )?;
        Ok(())
    }

    fn modified_keys(&self) -> Result<Vec<SettingKey>> {
        let mut stmt = self.conn.prepare(
            "SELECT key FROM settings_metadata WHERE last_modified IS NOT NULL ORDER BY key ASC",
        )?;
        let keys = stmt
            .query_map([], |row| row.get::<_, String>(0))?
            .collect::<rusqlite::Result<Vec<_>>>()?;

        Ok(keys
            .iter()
            .filter_map(|key| SettingKey::from_record_id(key))
            .collect())
    }

    fn mark_all_modified(&self, modified_at: i64) -> Result<()> {
        self.conn.execute(
            "INSERT INTO settings_metadata (key, last_modified)
             SELECT key, ?1 FROM settings WHERE true
             ON CONFLICT(key) DO UPDATE SET last_modified = excluded.last_modified",
            params![modified_at],
        )?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::Database;

    fn setup() -> Database {
        Database::open_in_memory().unwrap()
    }

    #[test]
    fn test_get_missing_key() {
        let db = setup();
        let repo = SqliteSettingRepository::new(db.connection());
        assert!(repo.get(SettingKey::Theme).unwrap().is_none());
        assert!(repo.get_value(SettingKey::Theme).unwrap().is_none());
    }

    #[test]
    fn test_set_and_get_value() {
        let db = setup();
        let repo = SqliteSettingRepository::new(db.connection());

        repo.set_value(SettingKey::Theme, Some("dark")).unwrap();
        assert_eq!(repo.get_value(SettingKey::Theme).unwrap().as_deref(), Some("dark"));

        // Sync application path leaves no local modification marker
        assert!(repo.last_modified(SettingKey::Theme).unwrap().is_none());
    }

    #[test]
    fn test_clearing_value_twice_is_a_noop() {
        let db = setup();
        let repo = SqliteSettingRepository::new(db.connection());

        repo.set_value(SettingKey::Theme, Some("dark")).unwrap();
        repo.set_value(SettingKey::Theme, None).unwrap();
        repo.set_value(SettingKey::Theme, None).unwrap();

        let setting = repo.get(SettingKey::Theme).unwrap().unwrap();
        assert!(setting.value.is_none());
    }

    #[test]
    fn test_update_value_stamps_metadata() {
        let db = setup();
        let repo = SqliteSettingRepository::new(db.connection());

        repo.update_value(SettingKey::NewTabLayout, Some("grid")).unwrap();
        assert!(repo.last_modified(SettingKey::NewTabLayout).unwrap().is_some());
        assert_eq!(repo.modified_keys().unwrap(), vec![SettingKey::NewTabLayout]);
    }

    #[test]
    fn test_metadata_row_survives_clearing() {
        let db = setup();
        let repo = SqliteSettingRepository::new(db.connection());

        repo.update_value(SettingKey::Theme, Some("dark")).unwrap();
        repo.set_last_modified(SettingKey::Theme, None).unwrap();

        assert!(repo.last_modified(SettingKey::Theme).unwrap().is_none());
        let rows: i64 = db
            .connection()
            .query_row("SELECT COUNT(*) FROM settings_metadata", [], |row| row.get(0))
            .unwrap();
        assert_eq!(rows, 1);
    }

    #[test]
    fn test_last_modified_many() {
        let db = setup();
        let repo = SqliteSettingRepository::new(db.connection());

        repo.set_last_modified(SettingKey::Theme, Some(100)).unwrap();
        repo.set_last_modified(SettingKey::SearchSuggestions, None).unwrap();

        let map = repo.last_modified_many(&SettingKey::ALL).unwrap();
        assert_eq!(map.get(&SettingKey::Theme), Some(&100));
        assert!(!map.contains_key(&SettingKey::SearchSuggestions));
    }

    #[test]
    fn test_mark_all_modified_stamps_existing_rows_only() {
        let db = setup();
        let repo = SqliteSettingRepository::new(db.connection());

        repo.set_value(SettingKey::Theme, Some("dark")).unwrap();
        repo.mark_all_modified(500).unwrap();

        assert_eq!(repo.last_modified(SettingKey::Theme).unwrap(), Some(500));
        assert!(repo.last_modified(SettingKey::NewTabLayout).unwrap().is_none());
    }

    #[test]
    fn test_all_skips_unknown_keys() {
        let db = setup();
        let repo = SqliteSettingRepository::new(db.connection());

        repo.set_value(SettingKey::Theme, Some("dark")).unwrap();
        db.connection()
            .execute(
                "INSERT INTO settings (key, value) VALUES ('from_the_future', 'x')",
                [],
            )
            .unwrap();

        let all = repo.all().unwrap();
        assert_eq!(all.len(), 1);
        assert_eq!(all[0].key, SettingKey::Theme);
    }
}
