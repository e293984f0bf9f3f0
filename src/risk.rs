use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};

/// Per-user risk record. Score contributions are namespaced by the source
/// bot; only the owning bot ever overwrites its own entry, and the aggregate
/// is always recomputed from the map, never stored.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct UserRisk {
    /// Group id -> timestamp of the most recent join event.
    pub join: BTreeMap<i64, i64>,
    /// Group id -> timestamp of the most recent enforcement trigger.
    pub detected: BTreeMap<i64, i64>,
    /// Source bot -> score contribution.
    pub score: BTreeMap<String, f64>,
}

impl UserRisk {
    pub fn total_score(&self) -> f64 {
        self.score.values().sum()
    }
}

/// All user risk records, created lazily on first observation.
#[derive(Debug, Default, Serialize, Deserialize)]
pub struct RiskStore {
    pub users: HashMap<i64, UserRisk>,
}

impl RiskStore {
    pub fn ensure(&mut self, user_id: i64) -> &mut UserRisk {
        self.users.entry(user_id).or_default()
    }

    pub fn get(&self, user_id: i64) -> Option<&UserRisk> {
        self.users.get(&user_id)
    }

    pub fn remove(&mut self, user_id: i64) {
        self.users.remove(&user_id);
    }

    pub fn record_join(&mut self, user_id: i64, group_id: i64, now: i64) {
        self.ensure(user_id).join.insert(group_id, now);
    }

    pub fn record_detection(&mut self, user_id: i64, group_id: i64, now: i64) {
        self.ensure(user_id).detected.insert(group_id, now);
    }

    pub fn set_score(&mut self, user_id: i64, source: &str, score: f64) {
        self.ensure(user_id)
            .score
            .insert(source.to_lowercase(), score);
    }

    pub fn total_score(&self, user_id: i64) -> f64 {
        self.get(user_id).map(UserRisk::total_score).unwrap_or(0.0)
    }

    /// Whether the user joined within the new-member window, in one group or
    /// across all groups.
    pub fn is_new(&self, user_id: i64, now: i64, group_id: Option<i64>, time_new: i64) -> bool {
        let Some(user) = self.get(user_id) else {
            return false;
        };

        match group_id {
            Some(group_id) => user
                .join
                .get(&group_id)
                .map(|join| now - join < time_new)
                .unwrap_or(false),
            None => user.join.values().any(|join| now - join < time_new),
        }
    }

    /// Whether the user is still inside the punishment cooldown for a group.
    pub fn is_detected(&self, user_id: i64, group_id: i64, now: i64, time_punish: i64) -> bool {
        self.get(user_id)
            .and_then(|user| user.detected.get(&group_id))
            .map(|detected| now - detected < time_punish)
            .unwrap_or(false)
    }

    /// Number of groups the user joined within the tracking window.
    pub fn joins_within(&self, user_id: i64, now: i64, time_track: i64) -> usize {
        self.get(user_id)
            .map(|user| {
                user.join
                    .values()
                    .filter(|join| now - **join < time_track)
                    .count()
            })
            .unwrap_or(0)
    }
}

/// Time-bounded elevated-suspicion flags, independent of the numeric score.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WatchKind {
    Ban,
    Delete,
}

#[derive(Debug, Default, Serialize, Deserialize)]
pub struct WatchList {
    pub ban: BTreeMap<i64, i64>,
    pub delete: BTreeMap<i64, i64>,
}

impl WatchList {
    fn table(&self, kind: WatchKind) -> &BTreeMap<i64, i64> {
        match kind {
            WatchKind::Ban => &self.ban,
            WatchKind::Delete => &self.delete,
        }
    }

    pub fn insert(&mut self, kind: WatchKind, user_id: i64, until: i64) {
        match kind {
            WatchKind::Ban => self.ban.insert(user_id, until),
            WatchKind::Delete => self.delete.insert(user_id, until),
        };
    }

    pub fn remove(&mut self, user_id: i64) {
        self.ban.remove(&user_id);
        self.delete.remove(&user_id);
    }

    /// Watched iff the expiry is still in the future.
    pub fn is_watched(&self, kind: WatchKind, user_id: i64, now: i64) -> bool {
        self.table(kind)
            .get(&user_id)
            .map(|until| now < *until)
            .unwrap_or(false)
    }
}

/// Messages already claimed by a cooperating bot, keyed (group, message).
/// Deliberately session-scoped: staleness after a restart only risks one
/// redundant local check.
#[derive(Debug, Default)]
pub struct DeclaredSet {
    groups: HashMap<i64, HashSet<i64>>,
}

impl DeclaredSet {
    pub fn contains(&self, group_id: i64, message_id: i64) -> bool {
        self.groups
            .get(&group_id)
            .map(|ids| ids.contains(&message_id))
            .unwrap_or(false)
    }

    pub fn insert(&mut self, group_id: i64, message_id: i64) {
        self.groups.entry(group_id).or_default().insert(message_id);
    }

    pub fn remove_group(&mut self, group_id: i64) {
        self.groups.remove(&group_id);
    }

    pub fn clear(&mut self) {
        self.groups.clear();
    }
}

/// Blacklisted (Class D) or exempted (Class E sources) user/channel ids.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct IdSets {
    pub users: BTreeSet<i64>,
    pub channels: BTreeSet<i64>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_aggregate_is_sum_and_sources_isolated() {
        let mut store = RiskStore::default();
        store.set_score(1, "LONG", 0.6);
        store.set_score(1, "NOSPAM", 1.2);
        assert!((store.total_score(1) - 1.8).abs() < f64::EPSILON);

        // Updating one source must not alter the other's stored value.
        store.set_score(1, "LONG", 1.8);
        let user = store.get(1).unwrap();
        assert_eq!(user.score.get("nospam"), Some(&1.2));
        assert!((store.total_score(1) - 3.0).abs() < f64::EPSILON);
    }

    #[test]
    fn test_is_new_scoped_and_global() {
        let mut store = RiskStore::default();
        let now = 1_000_000;
        store.record_join(7, 100, now - 50);
        store.record_join(7, 200, now - 5000);

        assert!(store.is_new(7, now, Some(100), 3600));
        assert!(!store.is_new(7, now, Some(200), 3600));
        assert!(store.is_new(7, now, None, 3600));
        assert!(!store.is_new(8, now, None, 3600));
    }

    #[test]
    fn test_detection_cooldown_window() {
        let mut store = RiskStore::default();
        let now = 500_000;
        store.record_detection(4, 10, now - 100);
        assert!(store.is_detected(4, 10, now, 600));
        assert!(!store.is_detected(4, 10, now + 600, 600));
        assert!(!store.is_detected(4, 11, now, 600));
    }

    #[test]
    fn test_watch_expiry() {
        let mut watch = WatchList::default();
        watch.insert(WatchKind::Ban, 9, 1000);
        assert!(watch.is_watched(WatchKind::Ban, 9, 999));
        assert!(!watch.is_watched(WatchKind::Ban, 9, 1000));
        assert!(!watch.is_watched(WatchKind::Delete, 9, 999));

        watch.remove(9);
        assert!(!watch.is_watched(WatchKind::Ban, 9, 999));
    }

    #[test]
    fn test_declared_set_membership() {
        let mut declared = DeclaredSet::default();
        assert!(!declared.contains(1, 2));
        declared.insert(1, 2);
        assert!(declared.contains(1, 2));
        declared.remove_group(1);
        assert!(!declared.contains(1, 2));
    }
}
