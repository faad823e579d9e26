use chrono::{DateTime, Utc};

use crate::election;
use crate::identity::TabId;
use crate::model::{MessageKind, TabMap, TabMessage, TabRecord};
use crate::registry::Registry;

/// Upkeep of one tab's own registry record.
///
/// The record's identity (`id`, `created_at`, `url`, `user_agent`) is fixed
/// for the life of the tab; each beat renews `last_heartbeat` and, if a peer
/// pruned the record meanwhile, registers it again with a fresh `seq`.
#[derive(Debug, Clone)]
pub struct Heartbeat {
    id: TabId,
    created_at: DateTime<Utc>,
    url: String,
    user_agent: String,
}

impl Heartbeat {
    pub fn new(id: TabId, created_at: DateTime<Utc>, url: String, user_agent: String) -> Self {
        Self {
            id,
            created_at,
            url,
            user_agent,
        }
    }

    pub fn id(&self) -> &TabId {
        &self.id
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    pub fn user_agent(&self) -> &str {
        &self.user_agent
    }

    /// Renew (or re-create) the own record in `map`. Returns true when the
    /// record had to be registered.
    pub fn stamp(&self, map: &mut TabMap, now: DateTime<Utc>, epoch: u64) -> bool {
        if let Some(record) = map.get_mut(self.id.as_str()) {
            record.last_heartbeat = now;
            record.epoch = epoch;
            return false;
        }
        let mut record = TabRecord::new(&self.id, self.created_at, &self.url, &self.user_agent);
        record.last_heartbeat = now;
        record.seq = election::next_seq(map);
        record.epoch = epoch;
        map.insert(self.id.to_string(), record);
        true
    }

    /// One heartbeat tick against the shared registry. False when the
    /// storage refused the write.
    pub fn beat(&self, registry: &Registry, now: DateTime<Utc>, epoch: u64) -> bool {
        registry
            .update(|map| self.stamp(map, now, epoch))
            .is_some()
    }

    pub fn message(&self, kind: MessageKind, now: DateTime<Utc>) -> TabMessage {
        TabMessage::new(kind, &self.id, now)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::logging::TabLog;
    use crate::store::memory::MemoryArea;
    use chrono::Duration;

    fn heartbeat(id: &str, created: DateTime<Utc>) -> Heartbeat {
        Heartbeat::new(TabId::from(id), created, "https://app.test/".into(), "ua".into())
    }

    #[test]
    fn first_stamp_registers_with_next_seq() {
        let now = Utc::now();
        let mut map = TabMap::new();
        assert!(heartbeat("tab_a", now).stamp(&mut map, now, 0));
        assert!(heartbeat("tab_b", now).stamp(&mut map, now, 0));
        assert_eq!(map["tab_a"].seq, 1);
        assert_eq!(map["tab_b"].seq, 2);
        assert_eq!(map["tab_b"].url, "https://app.test/");
    }

    #[test]
    fn later_stamps_only_renew() {
        let created = Utc::now();
        let hb = heartbeat("tab_a", created);
        let mut map = TabMap::new();
        hb.stamp(&mut map, created, 0);
        let later = created + Duration::milliseconds(800);
        assert!(!hb.stamp(&mut map, later, 3));
        let rec = &map["tab_a"];
        assert_eq!(rec.last_heartbeat, later);
        assert_eq!(rec.created_at, created);
        assert_eq!(rec.seq, 1);
        assert_eq!(rec.epoch, 3);
    }

    #[test]
    fn re_registration_keeps_creation_time() {
        let created = Utc::now();
        let hb = heartbeat("tab_a", created);
        let mut map = TabMap::new();
        heartbeat("tab_b", created).stamp(&mut map, created, 0);
        hb.stamp(&mut map, created, 0);
        map.remove("tab_a");
        let later = created + Duration::seconds(30);
        assert!(hb.stamp(&mut map, later, 0));
        assert_eq!(map["tab_a"].created_at, created);
        assert_eq!(map["tab_a"].seq, 2);
    }

    #[test]
    fn beat_reports_storage_failure() {
        let area = MemoryArea::new();
        let registry = Registry::new(area.connect(), "k", TabLog::new("heartbeat", "t", false));
        let hb = heartbeat("tab_a", Utc::now());
        assert!(hb.beat(&registry, Utc::now(), 0));
        area.set_failing(true);
        assert!(!hb.beat(&registry, Utc::now(), 0));
    }
}
