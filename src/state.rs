use crate::config::{Config, GroupConfig, GroupConfigs};
use crate::risk::{DeclaredSet, IdSets, RiskStore, WatchList};
use crate::rules::{RuleCategory, RuleStore};
use crate::storage::ObjectStore;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

/// Process-wide mutable state. Exclusively owned by this process; peers see
/// it only by value through the envelope protocol.
#[derive(Default)]
pub struct State {
    pub configs: GroupConfigs,
    pub admin_ids: BTreeMap<i64, BTreeSet<i64>>,
    pub bad_ids: IdSets,
    pub except_ids: IdSets,
    pub watch: WatchList,
    pub risk: RiskStore,
    pub declared: DeclaredSet,
}

impl State {
    /// Loads every persisted object, defaulting whatever is missing.
    /// The declared set is intentionally not persisted.
    pub fn load(store: &ObjectStore) -> Self {
        State {
            configs: store.load("configs").unwrap_or_default(),
            admin_ids: store.load("admin_ids").unwrap_or_default(),
            bad_ids: store.load("bad_ids").unwrap_or_default(),
            except_ids: store.load("except_ids").unwrap_or_default(),
            watch: store.load("watch_ids").unwrap_or_default(),
            risk: store.load("user_ids").unwrap_or_default(),
            declared: DeclaredSet::default(),
        }
    }

    pub fn group_config(&self, config: &Config, group_id: i64) -> GroupConfig {
        self.configs
            .get(&group_id)
            .cloned()
            .unwrap_or_else(|| config.default_group.clone())
    }

    pub fn ensure_group(&mut self, config: &Config, group_id: i64) -> &mut GroupConfig {
        self.configs
            .entry(group_id)
            .or_insert_with(|| config.default_group.clone())
    }

    /// Class C: local group admin or trusted bot.
    pub fn is_class_c(&self, config: &Config, group_id: i64, user_id: i64) -> bool {
        config.trusted_bot_ids.contains(&user_id)
            || self
                .admin_ids
                .get(&group_id)
                .map(|admins| admins.contains(&user_id))
                .unwrap_or(false)
    }

    /// Class D: globally blacklisted actor.
    pub fn is_class_d(&self, user_id: i64) -> bool {
        self.bad_ids.users.contains(&user_id)
    }

    /// Class E: admin of any group, exempt from risk scoring.
    pub fn is_class_e(&self, user_id: i64) -> bool {
        self.admin_ids
            .values()
            .any(|admins| admins.contains(&user_id))
    }

    /// Aggregate score if it crosses the reporting threshold, else 0.
    pub fn high_score(&self, config: &Config, user_id: i64) -> f64 {
        if self.is_class_e(user_id) {
            return 0.0;
        }

        let score = self.risk.total_score(user_id);
        if score >= config.score_high {
            score
        } else {
            0.0
        }
    }

    /// Layered suspicion check: brand-new accounts, previously flagged
    /// accounts, and accounts joining many groups in a burst are all
    /// elevated risk independent of message content.
    pub fn is_limited(&self, config: &Config, group_id: i64, user_id: i64, now: i64) -> bool {
        if self.is_class_e(user_id) {
            return false;
        }

        if self.group_config(config, group_id).new
            && self
                .risk
                .is_new(user_id, now, Some(group_id), config.time_new)
        {
            return true;
        }

        let Some(user) = self.risk.get(user_id) else {
            return false;
        };
        if user.join.is_empty() {
            return false;
        }

        // The score layer goes through the high-score predicate, which
        // reports 0 below the reporting threshold; a moderate aggregate
        // alone never marks a user limited.
        if self.high_score(config, user_id) >= config.score_limited {
            return true;
        }

        if let Some(join) = user.join.get(&group_id) {
            if now - join < config.time_short {
                return true;
            }
        }

        self.risk.joins_within(user_id, now, config.time_track) >= config.limit_track
    }
}

/// The three coarse mutual-exclusion domains of the processing paths.
/// Detection, protocol dispatch, and the diagnostics path are serialized
/// independently; there is no ordering across them.
#[derive(Default)]
pub struct Domains {
    pub message: tokio::sync::Mutex<()>,
    pub receive: tokio::sync::Mutex<()>,
    pub test: tokio::sync::Mutex<()>,
}

/// Explicit shared context handed to every component; nothing ambient.
pub struct Shared {
    pub config: Config,
    pub store: ObjectStore,
    pub state: Mutex<State>,
    /// Fine-grained lock: read by the classifier concurrently with ruleset
    /// broadcast updates.
    pub rules: Arc<Mutex<RuleStore>>,
    pub should_hide: Arc<AtomicBool>,
    pub domains: Domains,
}

impl Shared {
    pub fn new(config: Config) -> anyhow::Result<Arc<Self>> {
        let store = ObjectStore::new(&config.data_dir)?;
        let state = State::load(&store);

        let mut rules = RuleStore::new();
        for category in RuleCategory::all() {
            if let Some(patterns) = store.load(&category.object_name()) {
                rules.load(category, patterns);
            }
        }

        Ok(Arc::new(Shared {
            config,
            store,
            state: Mutex::new(state),
            rules: Arc::new(Mutex::new(rules)),
            should_hide: Arc::new(AtomicBool::new(false)),
            domains: Domains::default(),
        }))
    }

    pub fn hiding(&self) -> bool {
        self.should_hide.load(Ordering::SeqCst)
    }

    pub fn persist_users(&self, state: &State) {
        self.store.persist("user_ids", &state.risk);
    }

    pub fn persist_configs(&self, state: &State) {
        self.store.persist("configs", &state.configs);
    }

    pub fn persist_admins(&self, state: &State) {
        self.store.persist("admin_ids", &state.admin_ids);
    }

    pub fn persist_bad(&self, state: &State) {
        self.store.persist("bad_ids", &state.bad_ids);
    }

    pub fn persist_except(&self, state: &State) {
        self.store.persist("except_ids", &state.except_ids);
    }

    pub fn persist_watch(&self, state: &State) {
        self.store.persist("watch_ids", &state.watch);
    }

    pub fn persist_rules(&self, category: RuleCategory) {
        let snapshot = self.rules.lock().unwrap().snapshot(category);
        self.store.persist(&category.object_name(), &snapshot);
    }
}
