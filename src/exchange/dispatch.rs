use crate::config::GroupConfig;
use crate::exchange::codec::{Envelope, Payload};
use crate::exchange::files::{self, FileCipher};
use crate::exchange::router::ChannelRouter;
use crate::maintenance;
use crate::platform::ChatClient;
use crate::risk::WatchKind;
use crate::rules::{PatternEntry, RuleCategory};
use crate::state::Shared;
use serde::de::DeserializeOwned;
use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;
use std::sync::atomic::Ordering;
use std::sync::Arc;

/// Local operations a peer may trigger. Every accepted
/// (sender, action, type) triple maps to exactly one of these.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandlerKind {
    UserScore,
    AddBad,
    AddExcept,
    AddWatch,
    Declare,
    ConfigCommit,
    ConfigReply,
    ConfigShow,
    BackupNow,
    Rollback,
    ClearData,
    LeaveApprove,
    RemoveBad,
    RemoveExcept,
    RemoveScore,
    RemoveWatch,
    Refresh,
    RegexUpdate,
    RegexCountAsk,
}

/// The routing table. Permissions are deliberately spelled out per sender:
/// a triple not listed here is ignored, which keeps older nodes forward
/// compatible with envelopes from newer peers.
pub fn resolve(sender: &str, action: &str, kind: &str) -> Option<HandlerKind> {
    use HandlerKind::*;

    Some(match (sender, action, kind) {
        ("CAPTCHA" | "WARN", "update", "score") => UserScore,

        ("CLEAN" | "LANG" | "NOFLOOD" | "NOPORN" | "NOSPAM" | "RECHECK", "add", "bad") => AddBad,
        ("CLEAN" | "LANG" | "NOFLOOD" | "NOPORN" | "NOSPAM" | "RECHECK", "add", "watch") => {
            AddWatch
        }
        ("CLEAN" | "LANG" | "NOFLOOD" | "NOPORN" | "NOSPAM" | "RECHECK", "update", "declare") => {
            Declare
        }
        ("CLEAN" | "LANG" | "NOFLOOD" | "NOPORN" | "NOSPAM" | "RECHECK", "update", "score") => {
            UserScore
        }

        ("CONFIG", "config", "commit") => ConfigCommit,
        ("CONFIG", "config", "reply") => ConfigReply,

        ("MANAGE", "add", "bad") => AddBad,
        ("MANAGE", "add", "except") => AddExcept,
        ("MANAGE", "backup", "now") => BackupNow,
        ("MANAGE", "backup", "rollback") => Rollback,
        ("MANAGE", "clear", _) => ClearData,
        ("MANAGE", "config", "show") => ConfigShow,
        ("MANAGE", "leave", "approve") => LeaveApprove,
        ("MANAGE", "remove", "bad") => RemoveBad,
        ("MANAGE", "remove", "except") => RemoveExcept,
        ("MANAGE", "remove", "score") => RemoveScore,
        ("MANAGE", "remove", "watch") => RemoveWatch,
        ("MANAGE", "update", "refresh") => Refresh,

        ("REGEX", "regex", "update") => RegexUpdate,
        ("REGEX", "regex", "count") => RegexCountAsk,

        ("WATCH", "add", "watch") => AddWatch,

        _ => return None,
    })
}

/// Routes decoded envelopes from the exchange channel to their local
/// handlers. Holds no state of its own; every mutation goes through the
/// shared context under the receive domain.
pub struct ProtocolDispatcher {
    shared: Arc<Shared>,
    router: Arc<ChannelRouter>,
    client: Arc<dyn ChatClient>,
    cipher: Arc<dyn FileCipher>,
}

impl ProtocolDispatcher {
    pub fn new(
        shared: Arc<Shared>,
        router: Arc<ChannelRouter>,
        client: Arc<dyn ChatClient>,
        cipher: Arc<dyn FileCipher>,
    ) -> Self {
        ProtocolDispatcher {
            shared,
            router,
            client,
            cipher,
        }
    }

    /// Handles one inbound envelope, with its attached file when present.
    /// Returns whether a handler ran. Malformed payloads are dropped
    /// per-message; they never abort processing of later envelopes.
    pub async fn dispatch(&self, envelope: &Envelope, attachment: Option<&Path>) -> bool {
        if !envelope.addressed_to(&self.shared.config.identity) {
            return false;
        }

        let Some(handler) = resolve(&envelope.from, &envelope.action, &envelope.kind) else {
            log::debug!(
                "Ignoring unknown triple {}/{}/{}",
                envelope.from,
                envelope.action,
                envelope.kind
            );
            return false;
        };

        let _guard = self.shared.domains.receive.lock().await;
        match handler {
            HandlerKind::UserScore => self.user_score(&envelope.from, &envelope.data),
            HandlerKind::AddBad => self.add_bad(&envelope.data),
            HandlerKind::AddExcept => self.add_except(&envelope.data),
            HandlerKind::AddWatch => self.add_watch(&envelope.data),
            HandlerKind::Declare => self.declare(&envelope.data),
            HandlerKind::ConfigCommit => self.config_commit(&envelope.data),
            HandlerKind::ConfigReply => self.config_reply(&envelope.data),
            HandlerKind::ConfigShow => self.config_show(&envelope.data),
            HandlerKind::BackupNow => maintenance::backup_files(&self.shared, &self.router),
            HandlerKind::Rollback => self.rollback(&envelope.data, attachment),
            HandlerKind::ClearData => self.clear_data(&envelope.kind),
            HandlerKind::LeaveApprove => self.leave_approve(&envelope.data),
            HandlerKind::RemoveBad => self.remove_bad(&envelope.data),
            HandlerKind::RemoveExcept => self.remove_except(&envelope.data),
            HandlerKind::RemoveScore => self.remove_score(&envelope.data),
            HandlerKind::RemoveWatch => self.remove_watch(&envelope.data),
            HandlerKind::Refresh => self.refresh(&envelope.data),
            HandlerKind::RegexUpdate => self.regex_update(&envelope.data, attachment),
            HandlerKind::RegexCountAsk => {
                if envelope.data.as_str() == Some("ask") {
                    maintenance::send_count(&self.shared, &self.router);
                }
            }
        }
        true
    }

    /// The emergency channel-transfer instruction. Any peer may enable
    /// hiding; only the management node may clear it and restore the
    /// primary channel.
    pub fn handle_emergency(&self, envelope: &Envelope) {
        if !envelope.addressed_to("EMERGENCY")
            || envelope.action != "backup"
            || envelope.kind != "hide"
        {
            return;
        }

        match envelope.data.as_bool() {
            Some(true) => self.shared.should_hide.store(true, Ordering::SeqCst),
            Some(false) if envelope.from == "MANAGE" => {
                self.shared.should_hide.store(false, Ordering::SeqCst)
            }
            _ => return,
        }

        let enabled = self.shared.hiding();
        log::info!("Emergency channel transfer: hiding {enabled}");
        if self.shared.config.debug_channel_id != 0 {
            let text = format!("Transfer to emergency channel: {enabled}");
            if let Err(e) = self
                .client
                .send_message(self.shared.config.debug_channel_id, &text)
            {
                log::warn!("Debug notice error: {e:#}");
            }
        }
    }

    /// Decrypts an attached file into scratch and parses it.
    fn read_attachment<T: DeserializeOwned>(&self, path: &Path) -> Option<T> {
        let scratch_dir = Path::new(&self.shared.config.scratch_dir);
        if let Err(e) = std::fs::create_dir_all(scratch_dir) {
            log::warn!("Create scratch dir error: {e}");
            return None;
        }

        let staged = files::scratch_path(scratch_dir);
        if let Err(e) = self.cipher.decrypt(path, &staged) {
            log::warn!("Decrypt attachment {} error: {e:#}", path.display());
            return None;
        }

        let result = std::fs::read_to_string(&staged)
            .map_err(anyhow::Error::from)
            .and_then(|content| serde_json::from_str(&content).map_err(anyhow::Error::from));
        files::remove_scratch(&staged);

        match result {
            Ok(value) => Some(value),
            Err(e) => {
                log::warn!("Parse attachment {} error: {e:#}", path.display());
                None
            }
        }
    }

    fn user_score(&self, sender: &str, data: &Payload) {
        let (Some(user_id), Some(score)) = (data.map_i64("id"), data.map_f64("score")) else {
            log::debug!("Dropping malformed score update from {sender}");
            return;
        };

        let mut state = self.shared.state.lock().unwrap();
        state.risk.set_score(user_id, sender, score);
        self.shared.persist_users(&state);
    }

    fn add_bad(&self, data: &Payload) {
        let Some(id) = data.map_i64("id") else {
            return;
        };

        let mut state = self.shared.state.lock().unwrap();
        match data.map_str("type") {
            Some("user") => {
                state.bad_ids.users.insert(id);
            }
            Some("channel") => {
                state.bad_ids.channels.insert(id);
            }
            _ => return,
        }
        self.shared.persist_bad(&state);
    }

    fn add_except(&self, data: &Payload) {
        let Some(id) = data.map_i64("id") else {
            return;
        };

        let mut state = self.shared.state.lock().unwrap();
        match data.map_str("type") {
            Some("user") => {
                state.except_ids.users.insert(id);
            }
            Some("channel") => {
                state.except_ids.channels.insert(id);
            }
            _ => return,
        }
        self.shared.persist_except(&state);
    }

    fn add_watch(&self, data: &Payload) {
        let (Some(id), Some(until)) = (data.map_i64("id"), data.map_i64("until")) else {
            return;
        };
        let kind = match data.map_str("type") {
            Some("ban") => WatchKind::Ban,
            Some("delete") => WatchKind::Delete,
            _ => return,
        };

        let mut state = self.shared.state.lock().unwrap();
        state.watch.insert(kind, id, until);
        self.shared.persist_watch(&state);
    }

    fn declare(&self, data: &Payload) {
        let (Some(group_id), Some(message_id)) =
            (data.map_i64("group_id"), data.map_i64("message_id"))
        else {
            return;
        };

        let mut state = self.shared.state.lock().unwrap();
        state.declared.insert(group_id, message_id);
    }

    fn config_commit(&self, data: &Payload) {
        let Some(group_id) = data.map_i64("group_id") else {
            return;
        };
        let Some(committed) = data
            .as_map()
            .and_then(|map| map.get("config"))
            .and_then(|value| serde_json::from_value::<GroupConfig>(value.clone()).ok())
        else {
            log::debug!("Dropping malformed config commit for {group_id}");
            return;
        };

        let mut state = self.shared.state.lock().unwrap();
        let previous = state.group_config(&self.shared.config, group_id);
        let mut accepted = committed;
        if !self.shared.config.limit_allowed(accepted.limit) {
            accepted.limit = previous.limit;
        }
        accepted.lock = previous.lock;
        state.configs.insert(group_id, accepted);
        self.shared.persist_configs(&state);
    }

    fn config_reply(&self, data: &Payload) {
        let (Some(group_id), Some(user_id), Some(link)) = (
            data.map_i64("group_id"),
            data.map_i64("user_id"),
            data.map_str("config_link"),
        ) else {
            return;
        };

        let text = format!("Admin {user_id}: adjust the settings here: {link}");
        if let Err(e) = self.client.send_message(group_id, &text) {
            log::warn!("Config reply to {group_id} error: {e:#}");
        }
    }

    fn config_show(&self, data: &Payload) {
        let Some(group_id) = data.map_i64("group_id") else {
            return;
        };

        let group = {
            let state = self.shared.state.lock().unwrap();
            state.group_config(&self.shared.config, group_id)
        };

        let mut map = serde_json::Map::new();
        map.insert("group_id".to_string(), serde_json::json!(group_id));
        match serde_json::to_value(&group) {
            Ok(value) => {
                map.insert("config".to_string(), value);
            }
            Err(e) => {
                log::warn!("Serialize config for {group_id} error: {e}");
                return;
            }
        }
        self.router
            .share(&["MANAGE"], "config", "show", Payload::Map(map), None);
    }

    fn rollback(&self, data: &Payload, attachment: Option<&Path>) {
        let Some(name) = data.as_str().or_else(|| data.map_str("name")) else {
            return;
        };
        let Some(path) = attachment else {
            log::warn!("Rollback of {name} without attachment");
            return;
        };

        let mut state = self.shared.state.lock().unwrap();
        match name {
            "user_ids" => {
                if let Some(risk) = self.read_attachment(path) {
                    state.risk = risk;
                    self.shared.persist_users(&state);
                }
            }
            "configs" => {
                if let Some(configs) = self.read_attachment(path) {
                    state.configs = configs;
                    self.shared.persist_configs(&state);
                }
            }
            "admin_ids" => {
                if let Some(admins) = self.read_attachment(path) {
                    state.admin_ids = admins;
                    self.shared.persist_admins(&state);
                }
            }
            "bad_ids" => {
                if let Some(bad) = self.read_attachment(path) {
                    state.bad_ids = bad;
                    self.shared.persist_bad(&state);
                }
            }
            "except_ids" => {
                if let Some(except) = self.read_attachment(path) {
                    state.except_ids = except;
                    self.shared.persist_except(&state);
                }
            }
            "watch_ids" => {
                if let Some(watch) = self.read_attachment(path) {
                    state.watch = watch;
                    self.shared.persist_watch(&state);
                }
            }
            _ => log::debug!("Ignoring rollback for unknown object {name}"),
        }
    }

    fn clear_data(&self, target: &str) {
        let mut state = self.shared.state.lock().unwrap();
        match target {
            "bad" => {
                state.bad_ids = Default::default();
                self.shared.persist_bad(&state);
            }
            "except" => {
                state.except_ids = Default::default();
                self.shared.persist_except(&state);
            }
            "user" => {
                state.risk = Default::default();
                self.shared.persist_users(&state);
            }
            "watch" => {
                state.watch = Default::default();
                self.shared.persist_watch(&state);
            }
            "declared" => state.declared.clear(),
            _ => log::debug!("Ignoring clear for unknown target {target}"),
        }
    }

    fn leave_approve(&self, data: &Payload) {
        let Some(group_id) = data.map_i64("group_id") else {
            return;
        };

        let mut state = self.shared.state.lock().unwrap();
        state.configs.remove(&group_id);
        state.admin_ids.remove(&group_id);
        state.declared.remove_group(group_id);
        self.shared.persist_configs(&state);
        self.shared.persist_admins(&state);
        log::info!("Leave approved for group {group_id}");
    }

    fn remove_bad(&self, data: &Payload) {
        let Some(id) = data.map_i64("id") else {
            return;
        };

        let mut state = self.shared.state.lock().unwrap();
        state.bad_ids.users.remove(&id);
        // A pardoned actor starts over with a clean record.
        state.risk.remove(id);
        self.shared.persist_bad(&state);
        self.shared.persist_users(&state);
    }

    fn remove_except(&self, data: &Payload) {
        let Some(id) = data.map_i64("id") else {
            return;
        };

        let mut state = self.shared.state.lock().unwrap();
        state.except_ids.users.remove(&id);
        state.except_ids.channels.remove(&id);
        self.shared.persist_except(&state);
    }

    fn remove_score(&self, data: &Payload) {
        let Some(id) = data.map_i64("id") else {
            return;
        };

        let mut state = self.shared.state.lock().unwrap();
        if let Some(user) = state.risk.users.get_mut(&id) {
            user.score.clear();
        }
        self.shared.persist_users(&state);
    }

    fn remove_watch(&self, data: &Payload) {
        let Some(id) = data.map_i64("id") else {
            return;
        };

        let mut state = self.shared.state.lock().unwrap();
        state.watch.remove(id);
        self.shared.persist_watch(&state);
    }

    fn refresh(&self, data: &Payload) {
        let Some(map) = data.as_map() else {
            return;
        };

        let mut admins: BTreeMap<i64, BTreeSet<i64>> = BTreeMap::new();
        for (group, ids) in map {
            let Ok(group_id) = group.parse::<i64>() else {
                continue;
            };
            let Some(ids) = ids.as_array() else {
                continue;
            };
            admins.insert(group_id, ids.iter().filter_map(|id| id.as_i64()).collect());
        }
        maintenance::renew_admins(&self.shared, admins);
    }

    fn regex_update(&self, data: &Payload, attachment: Option<&Path>) {
        let Some(category) = data
            .as_str()
            .and_then(RuleCategory::parse_object_name)
        else {
            log::debug!("Dropping regex update with unknown category");
            return;
        };
        let Some(path) = attachment else {
            log::warn!("Regex update for {} without attachment", category.name());
            return;
        };
        let Some(patterns) = self.read_attachment::<BTreeMap<String, PatternEntry>>(path) else {
            return;
        };

        self.shared.rules.lock().unwrap().replace(category, patterns);
        self.shared.persist_rules(category);
        log::info!("Ruleset {} replaced by broadcast update", category.name());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::exchange::files::Base64Cipher;
    use crate::exchange::router::{Transport, TransportError};
    use crate::platform::LogClient;
    use std::sync::Mutex;

    #[derive(Default)]
    struct Recorder {
        sent: Mutex<Vec<String>>,
    }

    impl Transport for Recorder {
        fn send_text(&self, text: &str) -> Result<(), TransportError> {
            self.sent.lock().unwrap().push(text.to_string());
            Ok(())
        }

        fn send_file(&self, _file: &Path, caption: &str) -> Result<(), TransportError> {
            self.send_text(caption)
        }
    }

    fn dispatcher(dir: &Path) -> ProtocolDispatcher {
        let config = Config {
            data_dir: dir.join("data").to_string_lossy().into_owned(),
            scratch_dir: dir.join("tmp").to_string_lossy().into_owned(),
            ..Config::default()
        };
        let shared = Shared::new(config).unwrap();
        let router = Arc::new(ChannelRouter::new(
            shared.config.identity.clone(),
            Arc::new(Recorder::default()),
            Arc::new(Recorder::default()),
            Arc::new(Base64Cipher),
            shared.config.scratch_dir.clone(),
            shared.should_hide.clone(),
        ));
        ProtocolDispatcher::new(shared, router, Arc::new(LogClient), Arc::new(Base64Cipher))
    }

    fn score_envelope(sender: &str) -> Envelope {
        let mut map = serde_json::Map::new();
        map.insert("id".to_string(), serde_json::json!(42));
        map.insert("score".to_string(), serde_json::json!(1.2));
        Envelope::new(sender, &["LONG"], "update", "score", Payload::Map(map))
    }

    #[tokio::test]
    async fn test_score_update_applies_namespaced() {
        let dir = tempfile::tempdir().unwrap();
        let dispatcher = dispatcher(dir.path());

        assert!(dispatcher.dispatch(&score_envelope("NOSPAM"), None).await);
        assert!(dispatcher.dispatch(&score_envelope("WARN"), None).await);

        let state = dispatcher.shared.state.lock().unwrap();
        let user = state.risk.get(42).unwrap();
        assert_eq!(user.score.get("nospam"), Some(&1.2));
        assert_eq!(user.score.get("warn"), Some(&1.2));
        assert!((user.total_score() - 2.4).abs() < f64::EPSILON);
    }

    #[tokio::test]
    async fn test_unknown_triple_is_ignored() {
        let dir = tempfile::tempdir().unwrap();
        let dispatcher = dispatcher(dir.path());

        let envelope = Envelope::new("FUTURE", &["LONG"], "teleport", "now", Payload::Null);
        assert!(!dispatcher.dispatch(&envelope, None).await);

        // Known sender with an unknown action is ignored too.
        let envelope = Envelope::new("MANAGE", &["LONG"], "add", "halo", Payload::Null);
        assert!(!dispatcher.dispatch(&envelope, None).await);
    }

    #[tokio::test]
    async fn test_not_addressed_is_ignored() {
        let dir = tempfile::tempdir().unwrap();
        let dispatcher = dispatcher(dir.path());

        let mut envelope = score_envelope("NOSPAM");
        envelope.to = ["CLEAN".to_string()].into_iter().collect();
        assert!(!dispatcher.dispatch(&envelope, None).await);
        assert!(dispatcher.shared.state.lock().unwrap().risk.get(42).is_none());
    }

    #[tokio::test]
    async fn test_watch_add_and_remove() {
        let dir = tempfile::tempdir().unwrap();
        let dispatcher = dispatcher(dir.path());

        let mut map = serde_json::Map::new();
        map.insert("id".to_string(), serde_json::json!(7));
        map.insert("type".to_string(), serde_json::json!("ban"));
        map.insert("until".to_string(), serde_json::json!(10_000));
        let envelope = Envelope::new("WATCH", &["LONG"], "add", "watch", Payload::Map(map));
        assert!(dispatcher.dispatch(&envelope, None).await);
        {
            let state = dispatcher.shared.state.lock().unwrap();
            assert!(state.watch.is_watched(WatchKind::Ban, 7, 9_999));
        }

        let mut map = serde_json::Map::new();
        map.insert("id".to_string(), serde_json::json!(7));
        let envelope = Envelope::new("MANAGE", &["LONG"], "remove", "watch", Payload::Map(map));
        assert!(dispatcher.dispatch(&envelope, None).await);
        let state = dispatcher.shared.state.lock().unwrap();
        assert!(!state.watch.is_watched(WatchKind::Ban, 7, 9_999));
    }

    #[tokio::test]
    async fn test_declare_and_clear() {
        let dir = tempfile::tempdir().unwrap();
        let dispatcher = dispatcher(dir.path());

        let mut map = serde_json::Map::new();
        map.insert("group_id".to_string(), serde_json::json!(-100));
        map.insert("message_id".to_string(), serde_json::json!(555));
        let envelope = Envelope::new("CLEAN", &["LONG"], "update", "declare", Payload::Map(map));
        assert!(dispatcher.dispatch(&envelope, None).await);
        assert!(dispatcher
            .shared
            .state
            .lock()
            .unwrap()
            .declared
            .contains(-100, 555));

        let envelope = Envelope::new("MANAGE", &["LONG"], "clear", "declared", Payload::Null);
        assert!(dispatcher.dispatch(&envelope, None).await);
        assert!(!dispatcher
            .shared
            .state
            .lock()
            .unwrap()
            .declared
            .contains(-100, 555));
    }

    #[tokio::test]
    async fn test_emergency_hide_and_authorized_clear() {
        let dir = tempfile::tempdir().unwrap();
        let dispatcher = dispatcher(dir.path());

        let hide = |from: &str, value: bool| {
            Envelope::new(from, &["EMERGENCY"], "backup", "hide", Payload::Bool(value))
        };

        dispatcher.handle_emergency(&hide("NOSPAM", true));
        assert!(dispatcher.shared.hiding());

        // Only the management node may restore the primary channel.
        dispatcher.handle_emergency(&hide("NOSPAM", false));
        assert!(dispatcher.shared.hiding());
        dispatcher.handle_emergency(&hide("MANAGE", false));
        assert!(!dispatcher.shared.hiding());
    }

    #[tokio::test]
    async fn test_regex_update_replaces_category() {
        let dir = tempfile::tempdir().unwrap();
        let dispatcher = dispatcher(dir.path());

        dispatcher
            .shared
            .rules
            .lock()
            .unwrap()
            .insert(RuleCategory::Ban, "old", false)
            .unwrap();

        // Peer-side staging: serialize the table and encrypt it.
        let mut patterns: BTreeMap<String, PatternEntry> = BTreeMap::new();
        patterns.insert("fresh".to_string(), PatternEntry::default());
        let plain = dir.path().join("update.json");
        std::fs::write(&plain, serde_json::to_string(&patterns).unwrap()).unwrap();
        let sealed = dir.path().join("update.sealed");
        Base64Cipher.encrypt(&plain, &sealed).unwrap();

        let envelope = Envelope::new(
            "REGEX",
            &["LONG"],
            "regex",
            "update",
            Payload::Text("ban_words".to_string()),
        );
        assert!(dispatcher.dispatch(&envelope, Some(&sealed)).await);

        let rules = dispatcher.shared.rules.lock().unwrap();
        let table = rules.snapshot(RuleCategory::Ban);
        assert!(table.contains_key("fresh"));
        assert!(!table.contains_key("old"));
    }

    #[tokio::test]
    async fn test_malformed_payload_does_not_abort() {
        let dir = tempfile::tempdir().unwrap();
        let dispatcher = dispatcher(dir.path());

        // Score update with no map payload: dropped, but the handler ran.
        let envelope = Envelope::new("NOSPAM", &["LONG"], "update", "score", Payload::Bool(true));
        assert!(dispatcher.dispatch(&envelope, None).await);
        assert!(dispatcher.shared.state.lock().unwrap().risk.users.is_empty());

        // And the next, well-formed envelope still lands.
        assert!(dispatcher.dispatch(&score_envelope("NOSPAM"), None).await);
        assert!(dispatcher.shared.state.lock().unwrap().risk.get(42).is_some());
    }
}
