//! Core types for the unread store.

use crate::error::{Result, StoreError};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::time::{SystemTime, UNIX_EPOCH};

/// Unread counts per conversation for a single profile.
///
/// A conversation missing from the map has an unread count of 0. Counts
/// are never negative.
#[derive(Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct UnreadMap(HashMap<String, u64>);

impl UnreadMap {
    pub fn new() -> Self {
        Self::default()
    }

    /// Unread count for a conversation (0 when untracked).
    pub fn get(&self, conversation_id: &str) -> u64 {
        self.0.get(conversation_id).copied().unwrap_or(0)
    }

    /// Whether the conversation has an explicit entry.
    pub fn contains(&self, conversation_id: &str) -> bool {
        self.0.contains_key(conversation_id)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Sum of all counts.
    pub fn total(&self) -> u64 {
        self.0.values().fold(0u64, |acc, v| acc.saturating_add(*v))
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, u64)> + '_ {
        self.0.iter().map(|(k, v)| (k.as_str(), *v))
    }

    /// Add a signed step to a count, clamping at zero. Returns the new count.
    pub(crate) fn apply_step(&mut self, conversation_id: &str, step: i64) -> u64 {
        let current = self.get(conversation_id);
        let next = if step >= 0 {
            current.saturating_add(step as u64)
        } else {
            current.saturating_sub(step.unsigned_abs())
        };
        self.0.insert(conversation_id.to_string(), next);
        next
    }

    /// Insert a zero entry if none exists. Returns true if inserted.
    pub(crate) fn track(&mut self, conversation_id: &str) -> bool {
        if self.0.contains_key(conversation_id) {
            return false;
        }
        self.0.insert(conversation_id.to_string(), 0);
        true
    }

    /// Set a count to zero. Returns true unless it was already an explicit 0.
    pub(crate) fn zero(&mut self, conversation_id: &str) -> bool {
        match self.0.get_mut(conversation_id) {
            Some(0) => false,
            Some(count) => {
                *count = 0;
                true
            }
            None => {
                self.0.insert(conversation_id.to_string(), 0);
                true
            }
        }
    }

    /// Parse a persisted payload. Anything other than a flat object of
    /// non-negative integers is rejected.
    pub fn decode(key: &str, raw: &str) -> Result<Self> {
        decode_payload(key, raw)
    }

    /// Serialize to the persisted JSON form.
    pub fn encode(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }
}

impl fmt::Debug for UnreadMap {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_map().entries(self.0.iter()).finish()
    }
}

impl FromIterator<(String, u64)> for UnreadMap {
    fn from_iter<I: IntoIterator<Item = (String, u64)>>(iter: I) -> Self {
        Self(iter.into_iter().collect())
    }
}

impl<'a> FromIterator<(&'a str, u64)> for UnreadMap {
    fn from_iter<I: IntoIterator<Item = (&'a str, u64)>>(iter: I) -> Self {
        Self(iter.into_iter().map(|(k, v)| (k.to_string(), v)).collect())
    }
}

impl<const N: usize> From<[(&str, u64); N]> for UnreadMap {
    fn from(entries: [(&str, u64); N]) -> Self {
        entries.into_iter().collect()
    }
}

impl From<UnreadMap> for HashMap<String, u64> {
    fn from(map: UnreadMap) -> Self {
        map.0
    }
}

/// Last-read timestamps (epoch milliseconds) per conversation.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ReadMap(HashMap<String, u64>);

impl ReadMap {
    pub fn new() -> Self {
        Self::default()
    }

    /// Last-read timestamp for a conversation (0 when never read).
    pub fn last_read(&self, conversation_id: &str) -> u64 {
        self.0.get(conversation_id).copied().unwrap_or(0)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Move the marker forward. Returns false if it is already at or past
    /// `timestamp`.
    pub fn advance(&mut self, conversation_id: &str, timestamp: u64) -> bool {
        if self.last_read(conversation_id) >= timestamp {
            return false;
        }
        self.0.insert(conversation_id.to_string(), timestamp);
        true
    }

    pub fn decode(key: &str, raw: &str) -> Result<Self> {
        decode_payload(key, raw)
    }

    pub fn encode(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }
}

fn decode_payload<T: DeserializeOwned>(key: &str, raw: &str) -> Result<T> {
    serde_json::from_str(raw).map_err(|e| StoreError::MalformedPayload {
        key: key.to_string(),
        reason: e.to_string(),
    })
}

/// Milliseconds since Unix epoch.
pub fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_apply_step_clamps_at_zero() {
        let mut map = UnreadMap::from([("c1", 2)]);
        assert_eq!(map.apply_step("c1", -5), 0);
        assert_eq!(map.get("c1"), 0);
        assert!(map.contains("c1"));
    }

    #[test]
    fn test_apply_step_on_missing_entry() {
        let mut map = UnreadMap::new();
        assert_eq!(map.apply_step("c1", 3), 3);
        assert_eq!(map.apply_step("c2", -1), 0);
        assert_eq!(map.total(), 3);
    }

    #[test]
    fn test_zero_reports_change() {
        let mut map = UnreadMap::from([("c1", 4), ("c2", 0)]);
        assert!(map.zero("c1"));
        assert!(!map.zero("c2"));
        // Untracked ids gain an explicit zero.
        assert!(map.zero("c3"));
        assert!(map.contains("c3"));
        assert!(!map.zero("c3"));
    }

    #[test]
    fn test_track_only_inserts_missing() {
        let mut map = UnreadMap::from([("c1", 5)]);
        assert!(!map.track("c1"));
        assert!(map.track("c2"));
        assert_eq!(map.get("c1"), 5);
        assert_eq!(map.get("c2"), 0);
    }

    #[test]
    fn test_decode_rejects_malformed() {
        assert!(UnreadMap::decode("k", "not json").is_err());
        assert!(UnreadMap::decode("k", "[1, 2]").is_err());
        assert!(UnreadMap::decode("k", r#"{"c1": -1}"#).is_err());
        assert!(UnreadMap::decode("k", r#"{"c1": 1.5}"#).is_err());
        assert!(UnreadMap::decode("k", r#"{"c1": "3"}"#).is_err());
        assert!(UnreadMap::decode("k", "null").is_err());
    }

    #[test]
    fn test_decode_flat_object() {
        let map = UnreadMap::decode("k", r#"{"c1": 3, "c2": 0}"#).unwrap();
        assert_eq!(map, UnreadMap::from([("c1", 3), ("c2", 0)]));
    }

    #[test]
    fn test_encode_is_flat_object() {
        assert_eq!(UnreadMap::from([("c1", 3)]).encode().unwrap(), r#"{"c1":3}"#);

        let mut reads = ReadMap::new();
        reads.advance("c1", 7);
        assert_eq!(reads.encode().unwrap(), r#"{"c1":7}"#);
        assert_eq!(ReadMap::decode("k", r#"{"c1":7}"#).unwrap(), reads);
    }

    #[test]
    fn test_encode_decode_preserves_entries() {
        let map = UnreadMap::from([("a", 1), ("b", 0), ("c", 42)]);
        let raw = map.encode().unwrap();
        assert_eq!(UnreadMap::decode("k", &raw).unwrap(), map);
    }

    #[test]
    fn test_read_map_only_advances() {
        let mut reads = ReadMap::new();
        assert!(reads.advance("c1", 100));
        assert!(!reads.advance("c1", 50));
        assert!(!reads.advance("c1", 100));
        assert!(reads.advance("c1", 101));
        assert_eq!(reads.last_read("c1"), 101);
        assert_eq!(reads.last_read("c2"), 0);
    }
}
