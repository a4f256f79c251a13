//! Database layer for Tether

mod bookmark_repository;
mod connection;
mod migrations;
mod setting_repository;

pub use bookmark_repository::{BookmarkRepository, SqliteBookmarkRepository};
pub use connection::Database;
pub use setting_repository::{SettingRepository, SqliteSettingRepository};
