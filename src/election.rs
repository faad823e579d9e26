//! Who wins among the live tabs.
//!
//! The winner is the record with the smallest precedence key
//! `(Reverse(epoch), seq, created_at, id)`: a forced claim outranks
//! everything before it, then registration order decides, then age, then
//! the id as a final tie-break. With equal epoch and seq this is plain
//! "oldest tab wins, ties by id".

use std::cmp::Reverse;
use std::collections::HashMap;

use chrono::{DateTime, Utc};

use crate::model::{TabMap, TabRecord};

/// Registrations known to have left: tab id to the `seq` it left with. A tab
/// that registers again gets a new entry in the registry and is not masked.
pub type Departed = HashMap<String, u64>;

pub type PrecedenceKey<'a> = (Reverse<u64>, u64, DateTime<Utc>, &'a str);

pub fn precedence(record: &TabRecord) -> PrecedenceKey<'_> {
    (
        Reverse(record.epoch),
        record.seq,
        record.created_at,
        record.id.as_str(),
    )
}

/// Outcome of one election from a single tab's point of view.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Decision {
    /// This tab wins, or is alone.
    Lead,
    /// A peer wins; carries its record.
    Yield(TabRecord),
}

/// The record that wins among `records`, as every tab would compute it.
pub fn winner<'a>(records: impl IntoIterator<Item = &'a TabRecord>) -> Option<&'a TabRecord> {
    records
        .into_iter()
        .min_by(|a, b| precedence(a).cmp(&precedence(b)))
}

/// Decide between `own_id` and the live records in `live`, ignoring any
/// registration listed in `departed`. The own record may be missing, in which case any live peer
/// wins.
pub fn decide(own_id: &str, live: &TabMap, departed: &Departed) -> Decision {
    let candidates = live
        .values()
        .filter(|r| r.id == own_id || departed.get(&r.id) != Some(&r.seq));
    match winner(candidates) {
        Some(record) if record.id != own_id => Decision::Yield(record.clone()),
        _ => Decision::Lead,
    }
}

/// Registration number for a newcomer: one past the highest in `map`.
pub fn next_seq(map: &TabMap) -> u64 {
    map.values().map(|r| r.seq).max().map_or(1, |max| max + 1)
}

/// Claim generation that outranks every record in `map`.
pub fn next_epoch(map: &TabMap) -> u64 {
    map.values().map(|r| r.epoch).max().map_or(1, |max| max + 1)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::TabId;
    use chrono::Duration;

    fn rec(id: &str, created_offset_ms: i64, seq: u64, epoch: u64) -> TabRecord {
        let base = DateTime::from_timestamp_millis(1_704_067_200_000).unwrap();
        let mut r = TabRecord::new(
            &TabId::from(id),
            base + Duration::milliseconds(created_offset_ms),
            "",
            "",
        );
        r.seq = seq;
        r.epoch = epoch;
        r
    }

    fn map(records: Vec<TabRecord>) -> TabMap {
        records.into_iter().map(|r| (r.id.clone(), r)).collect()
    }

    #[test]
    fn alone_leads() {
        let live = map(vec![rec("me", 0, 1, 0)]);
        assert_eq!(decide("me", &live, &Departed::new()), Decision::Lead);
        assert_eq!(decide("me", &TabMap::new(), &Departed::new()), Decision::Lead);
    }

    #[test]
    fn oldest_wins_when_seq_ties() {
        let live = map(vec![rec("tab_b", 0, 1, 0), rec("tab_a", 10, 1, 0)]);
        assert_eq!(
            decide("tab_a", &live, &Departed::new()),
            Decision::Yield(rec("tab_b", 0, 1, 0))
        );
        assert_eq!(decide("tab_b", &live, &Departed::new()), Decision::Lead);
    }

    #[test]
    fn id_breaks_full_ties() {
        let live = map(vec![rec("tab_b", 0, 1, 0), rec("tab_a", 0, 1, 0)]);
        assert_eq!(decide("tab_a", &live, &Departed::new()), Decision::Lead);
        assert!(matches!(
            decide("tab_b", &live, &Departed::new()),
            Decision::Yield(r) if r.id == "tab_a"
        ));
    }

    #[test]
    fn seq_outranks_creation_time() {
        // Re-registered after being pruned: old created_at, fresh seq.
        let live = map(vec![rec("old", 0, 5, 0), rec("young", 1000, 2, 0)]);
        assert_eq!(decide("young", &live, &Departed::new()), Decision::Lead);
    }

    #[test]
    fn epoch_outranks_everything() {
        let live = map(vec![rec("first", 0, 1, 0), rec("claimer", 500, 2, 1)]);
        assert_eq!(decide("claimer", &live, &Departed::new()), Decision::Lead);
        assert!(matches!(
            decide("first", &live, &Departed::new()),
            Decision::Yield(r) if r.id == "claimer"
        ));
    }

    #[test]
    fn departed_peers_are_ignored() {
        let live = map(vec![rec("gone", 0, 1, 0), rec("me", 10, 2, 0)]);
        let departed: Departed = [("gone".to_string(), 1)].into();
        assert_eq!(decide("me", &live, &departed), Decision::Lead);
    }

    #[test]
    fn re_registered_peer_is_not_masked() {
        // "gone" left with seq 1 and came back as seq 3.
        let live = map(vec![rec("gone", 0, 3, 0), rec("me", 10, 2, 0)]);
        let departed: Departed = [("gone".to_string(), 1)].into();
        assert!(matches!(
            decide("me", &live, &departed),
            Decision::Yield(r) if r.id == "gone"
        ));
    }

    #[test]
    fn missing_own_record_yields_to_any_peer() {
        let live = map(vec![rec("peer", 100, 3, 0)]);
        assert!(matches!(
            decide("me", &live, &Departed::new()),
            Decision::Yield(_)
        ));
    }

    #[test]
    fn numbering() {
        assert_eq!(next_seq(&TabMap::new()), 1);
        assert_eq!(next_epoch(&TabMap::new()), 1);
        let live = map(vec![rec("a", 0, 3, 0), rec("b", 0, 7, 2)]);
        assert_eq!(next_seq(&live), 8);
        assert_eq!(next_epoch(&live), 3);
    }
}
