//! Last-read markers per conversation.
//!
//! Alongside the live counters, the messages list remembers when each
//! conversation was last opened. Markers only move forward and are stored
//! per profile as a flat JSON object of epoch milliseconds. Like the
//! counter store, every storage failure degrades to "nothing recorded".

use crate::storage::KeyValueStorage;
use crate::types::{now_millis, ReadMap};
use std::sync::Arc;

/// Default storage key prefix; the profile id is appended.
pub const DEFAULT_READ_KEY_PREFIX: &str = "puol:messages:last_read:";

#[derive(Clone, Debug)]
pub struct ReadMarkersConfig {
    pub key_prefix: String,
}

impl Default for ReadMarkersConfig {
    fn default() -> Self {
        Self {
            key_prefix: DEFAULT_READ_KEY_PREFIX.to_string(),
        }
    }
}

/// Persisted last-read timestamps.
pub struct ReadMarkers {
    storage: Arc<dyn KeyValueStorage>,
    config: ReadMarkersConfig,
}

impl ReadMarkers {
    pub fn new(storage: Arc<dyn KeyValueStorage>, config: ReadMarkersConfig) -> Self {
        Self { storage, config }
    }

    pub fn storage_key(&self, profile_id: &str) -> String {
        format!("{}{}", self.config.key_prefix, profile_id)
    }

    /// Load a profile's markers. No profile, missing data, storage errors
    /// and malformed payloads all yield an empty map.
    pub fn load(&self, profile_id: Option<&str>) -> ReadMap {
        let Some(profile_id) = profile_id.filter(|id| !id.is_empty()) else {
            return ReadMap::new();
        };
        let key = self.storage_key(profile_id);
        match self.storage.get(&key) {
            Ok(Some(raw)) => ReadMap::decode(&key, &raw).unwrap_or_else(|e| {
                tracing::warn!(profile_id, error = %e, "discarding malformed read markers");
                ReadMap::new()
            }),
            Ok(None) => ReadMap::new(),
            Err(e) => {
                tracing::warn!(profile_id, error = %e, "failed to load read markers");
                ReadMap::new()
            }
        }
    }

    /// Record that a conversation was read up to `timestamp`.
    ///
    /// Returns true if the marker advanced and was written. Older or equal
    /// timestamps are ignored.
    pub fn record_read(&self, profile_id: Option<&str>, conversation_id: &str, timestamp: u64) -> bool {
        let Some(profile_id) = profile_id.filter(|id| !id.is_empty()) else {
            return false;
        };
        if conversation_id.is_empty() {
            return false;
        }

        let mut markers = self.load(Some(profile_id));
        if !markers.advance(conversation_id, timestamp) {
            return false;
        }

        let key = self.storage_key(profile_id);
        let result = markers
            .encode()
            .and_then(|payload| self.storage.set(&key, &payload));
        match result {
            Ok(()) => true,
            Err(e) => {
                tracing::warn!(profile_id, conversation_id, error = %e, "failed to persist read marker");
                false
            }
        }
    }

    /// Record a read at the current time, for conversations whose latest
    /// message timestamp is unknown.
    pub fn record_read_now(&self, profile_id: Option<&str>, conversation_id: &str) -> bool {
        self.record_read(profile_id, conversation_id, now_millis())
    }
}

/// Which side of a rental conversation the viewer is on.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ViewerRole {
    Host,
    Guest,
}

/// Role of a message's sender.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SenderRole {
    Host,
    Guest,
    System,
}

/// Latest message of a conversation, as seen by the list.
#[derive(Clone, Debug)]
pub struct LatestMessage {
    pub sender_role: SenderRole,
    pub sender_profile_id: Option<String>,
    /// Epoch milliseconds; 0 if unknown.
    pub created_at: u64,
}

/// What the list knows about a conversation when no live count exists.
#[derive(Clone, Debug)]
pub struct ConversationActivity {
    pub viewer_role: ViewerRole,
    /// A reservation or visit request is waiting on the host.
    pub requires_host_action: bool,
    pub latest: Option<LatestMessage>,
}

impl ConversationActivity {
    /// Best guess at whether the viewer has something unread (0 or 1),
    /// before read markers are taken into account.
    pub fn fallback_unread(&self, viewer_profile_id: Option<&str>) -> u64 {
        let Some(latest) = &self.latest else {
            return 0;
        };

        match self.viewer_role {
            ViewerRole::Host => {
                if self.requires_host_action || latest.sender_role == SenderRole::Guest {
                    return 1;
                }
            }
            ViewerRole::Guest => match latest.sender_profile_id.as_deref() {
                Some(sender) if Some(sender) != viewer_profile_id => return 1,
                None if latest.sender_role != SenderRole::Guest => return 1,
                _ => {}
            },
        }

        0
    }

    /// Unread indicator combining the read marker with the fallback: a
    /// marker at or past the latest message means read, a newer message
    /// means unread, anything else defers to the fallback.
    pub fn unread_indicator(&self, last_read: u64, viewer_profile_id: Option<&str>) -> u64 {
        let latest_at = self.latest.as_ref().map(|m| m.created_at).unwrap_or(0);
        if latest_at > 0 {
            if last_read >= latest_at {
                return 0;
            }
            return 1;
        }
        self.fallback_unread(viewer_profile_id)
    }
}
