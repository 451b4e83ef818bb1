//! # Unread Store
//!
//! Per-profile unread message counters for a messaging client, kept in
//! memory, mirrored to durable storage on a best-effort basis, and pushed
//! to observers as snapshots.
//!
//! ## Core Concepts
//!
//! - **Unread maps**: conversation id → count, one map per profile
//! - **Listeners**: callbacks or channels that get a snapshot after every change
//! - **Persistence**: whole-map writes on a background thread, never awaited
//! - **Badges**: an adapter that follows the signed-in profile and exposes a total
//! - **Read markers**: last-read timestamps per conversation
//!
//! ## Example
//!
//! ```ignore
//! use std::sync::Arc;
//! use unread_store::{FileStorage, FileStorageConfig, UnreadBadge, UnreadStore, UnreadStoreConfig};
//!
//! let storage = FileStorage::open_or_create(FileStorageConfig {
//!     path: "./unread".into(),
//!     ..Default::default()
//! })?;
//! let store = Arc::new(UnreadStore::new(Arc::new(storage), UnreadStoreConfig::default())?);
//!
//! let mut badge = UnreadBadge::new(store.clone());
//! badge.set_profile(Some("profile-1"));
//!
//! // A message arrives in a conversation that isn't open.
//! store.increment("profile-1", "conversation-9", 1);
//! assert_eq!(badge.total_unread(), 1);
//!
//! // The user opens it.
//! badge.reset("conversation-9");
//! ```

pub mod adapter;
pub mod error;
pub mod read_markers;
pub mod storage;
pub mod store;
pub mod subscriptions;
pub mod types;
mod writer;

// Re-exports
pub use adapter::{BadgeState, UnreadBadge};
pub use error::{Result, StoreError};
pub use read_markers::{
    ConversationActivity, LatestMessage, ReadMarkers, ReadMarkersConfig, SenderRole, ViewerRole,
    DEFAULT_READ_KEY_PREFIX,
};
pub use storage::{FileStorage, FileStorageConfig, KeyValueStorage, MemoryStorage};
pub use store::{UnreadStore, UnreadStoreConfig, DEFAULT_KEY_PREFIX};
pub use subscriptions::{ListenerFn, ListenerId, ListenerRegistry, SnapshotReceiver, Subscription};
pub use types::{now_millis, ReadMap, UnreadMap};
