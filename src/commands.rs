use crate::config::GroupConfig;
use crate::exchange::codec::Payload;
use crate::exchange::router::ChannelRouter;
use crate::pipeline::{DetectionPipeline, InboundMessage};
use crate::state::Shared;

/// Outcome of an admin command. The platform layer posts `text` and removes
/// it again after `lifetime_secs` to keep group chatter down.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandReply {
    pub text: String,
    pub lifetime_secs: u64,
}

impl CommandReply {
    fn success(text: impl Into<String>) -> Self {
        CommandReply {
            text: text.into(),
            lifetime_secs: 10,
        }
    }

    fn failure(text: impl Into<String>) -> Self {
        CommandReply {
            text: text.into(),
            lifetime_secs: 5,
        }
    }
}

fn render(group_id: i64, group: &GroupConfig) -> String {
    format!(
        "Settings for {group_id}\n\
         custom: {}\n\
         delete collateral: {}\n\
         restrict new members: {}\n\
         length limit: {} bytes",
        if group.default { "no" } else { "yes" },
        on_off(group.delete),
        on_off(group.new),
        group.limit,
    )
}

fn on_off(value: bool) -> &'static str {
    if value {
        "on"
    } else {
        "off"
    }
}

/// `/config`: opens an interactive settings session through the config
/// service. Rate limited per group; a second request inside the cooldown
/// is rejected without touching the session lock.
pub fn request_config_session(
    shared: &Shared,
    router: &ChannelRouter,
    group_id: i64,
    user_id: i64,
    now: i64,
) -> CommandReply {
    let group = {
        let mut state = shared.state.lock().unwrap();
        let group = state.ensure_group(&shared.config, group_id);
        if now - group.lock < shared.config.config_lock_secs {
            return CommandReply::failure("A settings session was opened recently; try again later");
        }
        group.lock = now;
        let group = group.clone();
        shared.persist_configs(&state);
        group
    };

    let mut data = serde_json::Map::new();
    data.insert("group_id".to_string(), serde_json::json!(group_id));
    data.insert("user_id".to_string(), serde_json::json!(user_id));
    match serde_json::to_value(&group) {
        Ok(value) => {
            data.insert("config".to_string(), value);
        }
        Err(e) => log::warn!("Serialize config for {group_id} error: {e}"),
    }
    router.share(&["CONFIG"], "config", "ask", Payload::Map(data), None);

    CommandReply {
        text: "Settings session requested; a link follows shortly".to_string(),
        lifetime_secs: 30,
    }
}

/// `/longconfig`: in-place settings changes without a session. `show` is
/// always available; mutations respect the session cooldown and mark the
/// group's settings as custom.
pub fn config_directly(shared: &Shared, group_id: i64, args: &str, now: i64) -> CommandReply {
    let mut state = shared.state.lock().unwrap();

    let mut words = args.split_whitespace();
    let (setting, value) = (words.next().unwrap_or(""), words.next());

    if setting == "show" {
        let group = state.group_config(&shared.config, group_id);
        return CommandReply {
            text: render(group_id, &group),
            lifetime_secs: 30,
        };
    }

    {
        let group = state.ensure_group(&shared.config, group_id);
        if now - group.lock < shared.config.config_lock_secs {
            return CommandReply::failure("Settings are locked; try again later");
        }
    }

    let reply = match (setting, value) {
        ("default", None) => {
            let lock = state.ensure_group(&shared.config, group_id).lock;
            let mut group = shared.config.default_group.clone();
            group.lock = lock;
            state.configs.insert(group_id, group);
            CommandReply::success("Settings restored to defaults")
        }
        ("delete" | "new", Some(flag @ ("on" | "off"))) => {
            let enabled = flag == "on";
            let group = state.ensure_group(&shared.config, group_id);
            if setting == "delete" {
                group.delete = enabled;
            } else {
                group.new = enabled;
            }
            group.default = false;
            CommandReply::success(format!("Setting {setting} is now {flag}"))
        }
        ("limit", Some(number)) => match number.parse::<usize>() {
            Ok(limit) if shared.config.limit_allowed(limit) => {
                let group = state.ensure_group(&shared.config, group_id);
                group.limit = limit;
                group.default = false;
                CommandReply::success(format!("Length limit is now {limit} bytes"))
            }
            Ok(limit) => {
                return CommandReply::failure(format!("Limit {limit} is not a permitted value"))
            }
            Err(_) => return CommandReply::failure(format!("Not a number: {number}")),
        },
        _ => {
            return CommandReply::failure(
                "Usage: show | default | delete on/off | new on/off | limit <bytes>",
            )
        }
    };

    shared.persist_configs(&state);
    reply
}

/// `/check`: admin-requested re-examination of a replied-to message the
/// normal flow already passed over. The detection path does all the work;
/// the reply only acknowledges.
pub async fn force_check(pipeline: &DetectionPipeline, message: &InboundMessage) -> CommandReply {
    pipeline.process(message).await;
    CommandReply::success("Check complete")
}

/// `/version` reply text.
pub fn version() -> String {
    format!(
        "{} v{}",
        env!("CARGO_PKG_NAME"),
        env!("CARGO_PKG_VERSION")
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::exchange::codec;
    use crate::exchange::files::Base64Cipher;
    use crate::exchange::router::{Transport, TransportError};
    use std::path::Path;
    use std::sync::{Arc, Mutex};

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

    fn fixture(dir: &Path) -> (Arc<Shared>, ChannelRouter, Arc<Recorder>) {
        let config = Config {
            data_dir: dir.join("data").to_string_lossy().into_owned(),
            scratch_dir: dir.join("tmp").to_string_lossy().into_owned(),
            ..Config::default()
        };
        let shared = Shared::new(config).unwrap();
        let recorder = Arc::new(Recorder::default());
        let router = ChannelRouter::new(
            shared.config.identity.clone(),
            recorder.clone(),
            Arc::new(Recorder::default()),
            Arc::new(Base64Cipher),
            shared.config.scratch_dir.clone(),
            shared.should_hide.clone(),
        );
        (shared, router, recorder)
    }

    #[test]
    fn test_session_rate_limited_per_group() {
        let dir = tempfile::tempdir().unwrap();
        let (shared, router, recorder) = fixture(dir.path());
        let now = 1_000_000;

        let first = request_config_session(&shared, &router, -100, 5, now);
        assert_eq!(first.lifetime_secs, 30);
        assert_eq!(recorder.sent.lock().unwrap().len(), 1);

        // Second request within the cooldown is rejected and not forwarded.
        let second = request_config_session(&shared, &router, -100, 5, now + 10);
        assert_eq!(second.lifetime_secs, 5);
        assert_eq!(recorder.sent.lock().unwrap().len(), 1);

        // Another group is unaffected.
        let other = request_config_session(&shared, &router, -200, 5, now + 10);
        assert_eq!(other.lifetime_secs, 30);

        // And after the cooldown the same group may ask again.
        let later = request_config_session(
            &shared,
            &router,
            -100,
            5,
            now + shared.config.config_lock_secs,
        );
        assert_eq!(later.lifetime_secs, 30);
    }

    #[test]
    fn test_session_request_carries_current_config() {
        let dir = tempfile::tempdir().unwrap();
        let (shared, router, recorder) = fixture(dir.path());

        request_config_session(&shared, &router, -100, 5, 1_000_000);
        let sent = recorder.sent.lock().unwrap();
        let envelope = codec::decode(&sent[0]).unwrap();
        assert_eq!(envelope.action, "config");
        assert_eq!(envelope.kind, "ask");
        assert!(envelope.addressed_to("CONFIG"));
        assert_eq!(envelope.data.map_i64("group_id"), Some(-100));
        assert_eq!(envelope.data.map_i64("user_id"), Some(5));
        assert!(envelope.data.as_map().unwrap().contains_key("config"));
    }

    #[test]
    fn test_limit_must_be_permitted() {
        let dir = tempfile::tempdir().unwrap();
        let (shared, _router, _recorder) = fixture(dir.path());
        let now = 1_000_000;

        let reply = config_directly(&shared, -100, "limit 2500", now);
        assert_eq!(reply.lifetime_secs, 5);
        let reply = config_directly(&shared, -100, "limit nope", now);
        assert_eq!(reply.lifetime_secs, 5);

        let reply = config_directly(&shared, -100, "limit 4000", now);
        assert_eq!(reply.lifetime_secs, 10);
        let state = shared.state.lock().unwrap();
        let group = state.configs.get(&-100).unwrap();
        assert_eq!(group.limit, 4000);
        assert!(!group.default);
    }

    #[test]
    fn test_show_works_during_lock() {
        let dir = tempfile::tempdir().unwrap();
        let (shared, _router, _recorder) = fixture(dir.path());
        let now = 1_000_000;

        {
            let mut state = shared.state.lock().unwrap();
            state.ensure_group(&shared.config, -100).lock = now - 1;
        }
        let reply = config_directly(&shared, -100, "show", now);
        assert_eq!(reply.lifetime_secs, 30);
        assert!(reply.text.contains("3000"));

        // Mutations are still locked out.
        let reply = config_directly(&shared, -100, "new on", now);
        assert_eq!(reply.lifetime_secs, 5);
    }

    #[tokio::test]
    async fn test_force_check_runs_detection() {
        let dir = tempfile::tempdir().unwrap();
        let (shared, router, recorder) = fixture(dir.path());
        let pipeline = DetectionPipeline::new(
            shared.clone(),
            Arc::new(router),
            Arc::new(crate::platform::LogClient),
        );

        let message = InboundMessage {
            group_id: -100,
            message_id: 1,
            user_id: 42,
            text: "a".repeat(5000),
            display_name: "someone".to_string(),
            forward_name: None,
            forward_from_id: None,
            timestamp: 1_000_000,
        };
        let reply = force_check(&pipeline, &message).await;
        assert_eq!(reply.lifetime_secs, 10);
        assert!(shared.state.lock().unwrap().declared.contains(-100, 1));
        assert!(!recorder.sent.lock().unwrap().is_empty());
    }

    #[test]
    fn test_default_resets_but_keeps_lock() {
        let dir = tempfile::tempdir().unwrap();
        let (shared, _router, _recorder) = fixture(dir.path());
        let now = 1_000_000;
        let lock = now - shared.config.config_lock_secs - 1;

        {
            let mut state = shared.state.lock().unwrap();
            let group = state.ensure_group(&shared.config, -100);
            group.lock = lock;
            group.limit = 9000;
            group.default = false;
        }
        let reply = config_directly(&shared, -100, "default", now);
        assert_eq!(reply.lifetime_secs, 10);

        let state = shared.state.lock().unwrap();
        let group = state.configs.get(&-100).unwrap();
        assert!(group.default);
        assert_eq!(group.limit, shared.config.default_group.limit);
        assert_eq!(group.lock, lock);
    }
}
