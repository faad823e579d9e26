use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::identity::TabId;

/// One live tab, as replicated into the shared registry.
///
/// Only the owning tab writes its record. `seq` and `epoch` default to zero
/// so records from peers that never set them still parse.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct TabRecord {
    pub id: String,
    #[serde(with = "chrono::serde::ts_milliseconds")]
    pub created_at: DateTime<Utc>,
    #[serde(with = "chrono::serde::ts_milliseconds")]
    pub last_heartbeat: DateTime<Utc>,
    #[serde(default, alias = "isActive")]
    pub is_active_flag: bool,
    #[serde(default)]
    pub url: String,
    #[serde(default)]
    pub user_agent: String,
    /// Registration order within the registry.
    #[serde(default)]
    pub seq: u64,
    /// Claim generation; bumped by a forced claim.
    #[serde(default)]
    pub epoch: u64,
}

impl TabRecord {
    pub fn new(id: &TabId, now: DateTime<Utc>, url: &str, user_agent: &str) -> Self {
        Self {
            id: id.to_string(),
            created_at: now,
            last_heartbeat: now,
            is_active_flag: false,
            url: url.to_string(),
            user_agent: user_agent.to_string(),
            seq: 0,
            epoch: 0,
        }
    }

    /// Milliseconds since the last heartbeat (negative under clock skew).
    pub fn age_ms(&self, now: DateTime<Utc>) -> i64 {
        (now - self.last_heartbeat).num_milliseconds()
    }

    /// Live iff `now - lastHeartbeat <= timeout`.
    pub fn is_live(&self, now: DateTime<Utc>, timeout_ms: u64) -> bool {
        self.age_ms(now) <= i64::try_from(timeout_ms).unwrap_or(i64::MAX)
    }
}

/// Registry snapshot: tab id to record, as observed at one instant.
pub type TabMap = BTreeMap<String, TabRecord>;

/// Wire-level message kinds exchanged over a transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageKind {
    Announce,
    Heartbeat,
    Depart,
    Ack,
}

impl fmt::Display for MessageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Announce => write!(f, "announce"),
            Self::Heartbeat => write!(f, "heartbeat"),
            Self::Depart => write!(f, "depart"),
            Self::Ack => write!(f, "ack"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TabMessage {
    #[serde(rename = "type")]
    pub kind: MessageKind,
    pub tab_id: String,
    #[serde(with = "chrono::serde::ts_milliseconds")]
    pub timestamp: DateTime<Utc>,
}

impl TabMessage {
    pub fn new(kind: MessageKind, tab_id: &TabId, timestamp: DateTime<Utc>) -> Self {
        Self {
            kind,
            tab_id: tab_id.to_string(),
            timestamp,
        }
    }
}

/// Per-tab leadership state. Never shared.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LeaderState {
    #[default]
    Unclaimed,
    Active,
    Conflicted,
}

impl fmt::Display for LeaderState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Unclaimed => write!(f, "unclaimed"),
            Self::Active => write!(f, "active"),
            Self::Conflicted => write!(f, "conflicted"),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Visibility {
    #[default]
    Visible,
    Hidden,
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn record(now: DateTime<Utc>) -> TabRecord {
        TabRecord::new(&TabId::from("tab_a"), now, "https://app.test/", "test-agent")
    }

    #[test]
    fn record_uses_wire_field_names() {
        let now = DateTime::from_timestamp_millis(1_704_067_200_000).unwrap();
        let json = serde_json::to_value(record(now)).unwrap();
        assert_eq!(json["id"], "tab_a");
        assert_eq!(json["createdAt"], 1_704_067_200_000_i64);
        assert_eq!(json["lastHeartbeat"], 1_704_067_200_000_i64);
        assert_eq!(json["isActiveFlag"], false);
        assert_eq!(json["userAgent"], "test-agent");
    }

    #[test]
    fn record_accepts_legacy_shape() {
        let raw = r#"{"id":"tab_x","createdAt":10,"lastHeartbeat":20,"isActive":true}"#;
        let rec: TabRecord = serde_json::from_str(raw).unwrap();
        assert!(rec.is_active_flag);
        assert_eq!(rec.seq, 0);
        assert_eq!(rec.epoch, 0);
        assert!(rec.url.is_empty());
    }

    #[test]
    fn liveness_boundary_is_inclusive() {
        let now = Utc::now();
        let rec = record(now);
        assert!(rec.is_live(now + Duration::milliseconds(5000), 5000));
        assert!(!rec.is_live(now + Duration::milliseconds(5001), 5000));
    }

    #[test]
    fn huge_timeout_keeps_fresh_records_live() {
        let now = Utc::now();
        assert!(record(now).is_live(now, u64::MAX));
    }

    #[test]
    fn message_wire_shape() {
        let now = DateTime::from_timestamp_millis(42).unwrap();
        let msg = TabMessage::new(MessageKind::Depart, &TabId::from("tab_a"), now);
        let json = serde_json::to_string(&msg).unwrap();
        assert_eq!(json, r#"{"type":"depart","tabId":"tab_a","timestamp":42}"#);
    }
}
