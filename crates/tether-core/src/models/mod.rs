//! Data models for Tether

mod bookmark;
mod record;
mod setting;

pub use bookmark::{BookmarkNode, BookmarkPayload, FormFactor, BOOKMARKS_ROOT_ID};
pub use record::SyncableRecord;
pub use setting::{Setting, SettingKey, SettingPayload};
