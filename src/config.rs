use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

/// Operator configuration, loaded from a YAML file at startup.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// This node's identity in the federation (the `from` field of every
    /// envelope it emits).
    pub identity: String,
    /// Directory holding the named-object store.
    pub data_dir: String,
    /// Scratch directory for staged attachments. Files in here are deleted
    /// after a successful transmission.
    pub scratch_dir: String,
    /// User id of the supervising anti-spam bot. Benign-content overrides
    /// only apply in groups where this bot is an admin.
    pub supervisor_id: i64,
    /// Bots whose messages count as Class C regardless of admin status.
    pub trusted_bot_ids: BTreeSet<i64>,
    /// Channel the evidence forwards go to.
    pub logging_channel_id: i64,
    /// Channel operational notices go to.
    pub debug_channel_id: i64,
    /// Receiver sets per broadcast topic.
    pub receivers: Receivers,
    /// Seconds a member counts as newly joined.
    pub time_new: i64,
    /// Seconds after a join during which a member is rate-suspect.
    pub time_short: i64,
    /// Window for counting join-burst groups.
    pub time_track: i64,
    /// Punishment cooldown after a detection.
    pub time_punish: i64,
    /// Joins within `time_track` at or above this count mark a user limited.
    pub limit_track: usize,
    /// Aggregate score at or above this is reported as high.
    pub score_high: f64,
    /// Reported high score at or above this marks a user limited. The
    /// report is zero below `score_high`, so the effective gate is the
    /// reporting threshold.
    pub score_limited: f64,
    /// Own score contribution per recorded detection.
    pub score_per_detection: f64,
    /// Cooldown between config sessions for one group, seconds.
    pub config_lock_secs: i64,
    /// Fixed verdict returned while a user is inside the punishment window.
    pub detected_sentinel: i64,
    /// Messages longer than this are always actioned, content regardless.
    pub bulk_ceiling: usize,
    /// Byte-length thresholds a group may configure.
    pub permitted_limits: BTreeSet<usize>,
    pub emoji: EmojiConfig,
    pub default_group: GroupConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Receivers {
    pub bad: Vec<String>,
    pub declare: Vec<String>,
    pub score: Vec<String>,
    pub watch: Vec<String>,
}

/// Emoji-density tunables. Thresholds differ per classification kind.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EmojiConfig {
    pub set: BTreeSet<String>,
    /// Emojis never counted towards density.
    pub protect: BTreeSet<String>,
    pub ad_single: usize,
    pub ad_total: usize,
    pub many_total: usize,
    pub wb_single: usize,
    pub wb_total: usize,
}

/// Per-group settings. `lock` is the timestamp of the last config-session
/// start; a session may not be reopened within `config_lock_secs` of it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GroupConfig {
    pub default: bool,
    pub lock: i64,
    /// Ask the helper bot to also delete the user's other messages.
    pub delete: bool,
    /// Treat newly joined members as elevated risk.
    pub new: bool,
    /// Byte-length threshold; must come from `permitted_limits`.
    pub limit: usize,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            identity: "LONG".to_string(),
            data_dir: "data".to_string(),
            scratch_dir: "tmp".to_string(),
            supervisor_id: 0,
            trusted_bot_ids: BTreeSet::new(),
            logging_channel_id: 0,
            debug_channel_id: 0,
            receivers: Receivers::default(),
            time_new: 86400,
            time_short: 3600,
            time_track: 3600,
            time_punish: 600,
            limit_track: 3,
            score_high: 3.0,
            score_limited: 1.8,
            score_per_detection: 0.6,
            config_lock_secs: 310,
            detected_sentinel: 79,
            bulk_ceiling: 10000,
            permitted_limits: (2..=10).map(|n| n * 1000).collect(),
            emoji: EmojiConfig::default(),
            default_group: GroupConfig::default(),
        }
    }
}

impl Default for Receivers {
    fn default() -> Self {
        let wide = || -> Vec<String> {
            ["CAPTCHA", "CLEAN", "LANG", "NOFLOOD", "NOPORN", "NOSPAM", "RECHECK", "USER", "WARN"]
                .iter()
                .map(|s| s.to_string())
                .collect()
        };
        Receivers {
            bad: wide(),
            declare: wide(),
            score: wide(),
            watch: wide(),
        }
    }
}

impl Default for EmojiConfig {
    fn default() -> Self {
        EmojiConfig {
            set: ["💰", "💵", "🤑", "🎁", "🎉", "🔥", "👉", "👇", "🆓", "❤️", "✅", "📣"]
                .iter()
                .map(|s| s.to_string())
                .collect(),
            protect: ["⚠️"].iter().map(|s| s.to_string()).collect(),
            ad_single: 15,
            ad_total: 30,
            many_total: 15,
            wb_single: 10,
            wb_total: 15,
        }
    }
}

impl Default for GroupConfig {
    fn default() -> Self {
        GroupConfig {
            default: true,
            lock: 0,
            delete: true,
            new: false,
            limit: 3000,
        }
    }
}

impl Config {
    pub fn from_file(path: &str) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Config = serde_yaml::from_str(&content)?;
        Ok(config)
    }

    pub fn to_file(&self, path: &str) -> anyhow::Result<()> {
        let content = serde_yaml::to_string(self)?;
        std::fs::write(path, content)?;
        Ok(())
    }

    pub fn limit_allowed(&self, limit: usize) -> bool {
        self.permitted_limits.contains(&limit)
    }
}

/// Persisted group-config map, keyed by group id.
pub type GroupConfigs = BTreeMap<i64, GroupConfig>;
