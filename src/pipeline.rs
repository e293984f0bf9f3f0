use crate::classifier::{normalize_text, Classifier, EmojiKind};
use crate::exchange::codec::Payload;
use crate::exchange::router::ChannelRouter;
use crate::platform::ChatClient;
use crate::risk::WatchKind;
use crate::state::{Shared, State};
use crate::tasks;
use std::sync::Arc;

/// One group message as the platform layer hands it over.
#[derive(Debug, Clone)]
pub struct InboundMessage {
    pub group_id: i64,
    pub message_id: i64,
    pub user_id: i64,
    pub text: String,
    pub display_name: String,
    pub forward_name: Option<String>,
    /// Channel the message was forwarded from, when it was.
    pub forward_from_id: Option<i64>,
    pub timestamp: i64,
}

/// End-to-end handling of inbound group messages: verdict computation,
/// enforcement, and the follow-up broadcasts that keep the federation
/// consistent.
pub struct DetectionPipeline {
    shared: Arc<Shared>,
    classifier: Classifier,
    router: Arc<ChannelRouter>,
    client: Arc<dyn ChatClient>,
}

impl DetectionPipeline {
    pub fn new(
        shared: Arc<Shared>,
        router: Arc<ChannelRouter>,
        client: Arc<dyn ChatClient>,
    ) -> Self {
        let classifier = Classifier::new(
            shared.rules.clone(),
            shared.store.clone(),
            shared.config.emoji.clone(),
        );
        DetectionPipeline {
            shared,
            classifier,
            router,
            client,
        }
    }

    /// Computes the verdict for one message: `0` means no action, the
    /// punishment-cooldown sentinel means repeat offender, any other
    /// positive value is the offending byte length.
    ///
    /// Checks are ordered cheapest first; the content overrides at the end
    /// only run for messages that already crossed the group's threshold.
    pub fn evaluate(&self, state: &State, message: &InboundMessage) -> i64 {
        if state.declared.contains(message.group_id, message.message_id) {
            return 0;
        }

        let config = &self.shared.config;
        if state.risk.is_detected(
            message.user_id,
            message.group_id,
            message.timestamp,
            config.time_punish,
        ) {
            return config.detected_sentinel;
        }

        let length = message.text.len();
        let group = state.group_config(config, message.group_id);
        if length < group.limit {
            return 0;
        }

        // Oversize messages are actioned unconditionally. Below the ceiling
        // the benign-content overrides apply, but only where the supervising
        // anti-spam bot is present to pick the message up instead.
        if length <= config.bulk_ceiling
            && state.is_class_c(config, message.group_id, config.supervisor_id)
        {
            if let Some(forward_name) = &message.forward_name {
                if self.classifier.is_nm_text(forward_name) {
                    return 0;
                }
            }
            if self.classifier.is_nm_text(&message.display_name) {
                return 0;
            }

            let normalized = normalize_text(&message.text);
            if self.classifier.is_ban_text(&normalized, false)
                || self.classifier.is_delete_text(&normalized)
            {
                return 0;
            }
        }

        length as i64
    }

    /// Processes one message under the detection domain. Messages from
    /// group admins, trusted bots, and globally blacklisted actors are not
    /// examined here; the latter are another node's responsibility.
    pub async fn process(&self, message: &InboundMessage) {
        let _guard = self.shared.domains.message.lock().await;

        let verdict = {
            let state = self.shared.state.lock().unwrap();
            if state.is_class_c(&self.shared.config, message.group_id, message.user_id)
                || state.is_class_d(message.user_id)
                || state.except_ids.users.contains(&message.user_id)
            {
                return;
            }
            // Forwards from blacklisted channels belong to the blacklist
            // handler; forwards from exempted channels are never examined.
            if let Some(channel_id) = message.forward_from_id {
                if state.bad_ids.channels.contains(&channel_id)
                    || state.except_ids.channels.contains(&channel_id)
                {
                    return;
                }
            }
            self.evaluate(&state, message)
        };

        if verdict > 0 {
            self.terminate(message, verdict);
        }
    }

    /// Enforcement and federation follow-up for a positive verdict.
    pub fn terminate(&self, message: &InboundMessage, verdict: i64) {
        let config = &self.shared.config;

        if let Err(e) = self
            .client
            .delete_message(message.group_id, message.message_id)
        {
            log::warn!(
                "Delete message {} in {} error: {e:#}",
                message.message_id,
                message.group_id
            );
        }
        if config.logging_channel_id != 0 {
            // Evidence logging never gates the verdict path.
            let client = self.client.clone();
            let (from, to, message_id) = (
                message.group_id,
                config.logging_channel_id,
                message.message_id,
            );
            tasks::submit(move || {
                if let Err(e) = client.forward_message(from, to, message_id) {
                    log::warn!("Evidence forward error: {e:#}");
                }
            });
        }

        // Claim the message so cooperating bots skip it.
        {
            let mut state = self.shared.state.lock().unwrap();
            state.declared.insert(message.group_id, message.message_id);
        }
        let mut declare = serde_json::Map::new();
        declare.insert("group_id".to_string(), serde_json::json!(message.group_id));
        declare.insert(
            "message_id".to_string(),
            serde_json::json!(message.message_id),
        );
        self.router.share(
            &receiver_refs(&config.receivers.declare),
            "update",
            "declare",
            Payload::Map(declare),
            None,
        );

        // A repeat offense inside the cooldown is deleted but not re-scored.
        if verdict == config.detected_sentinel {
            return;
        }

        let (score, escalate, delete_collateral) = {
            let mut state = self.shared.state.lock().unwrap();
            state
                .risk
                .record_detection(message.user_id, message.group_id, message.timestamp);

            let detections = state
                .risk
                .get(message.user_id)
                .map(|user| user.detected.len())
                .unwrap_or(0);
            let score = detections as f64 * config.score_per_detection;
            state
                .risk
                .set_score(message.user_id, &config.identity, score);
            self.shared.persist_users(&state);

            let escalate = state
                .watch
                .is_watched(WatchKind::Ban, message.user_id, message.timestamp)
                || state.high_score(config, message.user_id) > 0.0;
            let delete_collateral = state.group_config(config, message.group_id).delete;
            (score, escalate, delete_collateral)
        };

        let mut update = serde_json::Map::new();
        update.insert("id".to_string(), serde_json::json!(message.user_id));
        update.insert("score".to_string(), serde_json::json!(score));
        self.router.share(
            &receiver_refs(&config.receivers.score),
            "update",
            "score",
            Payload::Map(update),
            None,
        );

        // The helper bot sweeps up the offender's other recent messages.
        if delete_collateral {
            let mut help = serde_json::Map::new();
            help.insert("group_id".to_string(), serde_json::json!(message.group_id));
            help.insert("user_id".to_string(), serde_json::json!(message.user_id));
            self.router
                .share(&["USER"], "help", "delete", Payload::Map(help), None);
        }

        // Bait-heavy messages put the sender on the federation watch list.
        if self
            .classifier
            .emoji_density(EmojiKind::WatchBait, &message.text)
        {
            let mut watch = serde_json::Map::new();
            watch.insert("id".to_string(), serde_json::json!(message.user_id));
            watch.insert("type".to_string(), serde_json::json!("ban"));
            watch.insert(
                "until".to_string(),
                serde_json::json!(message.timestamp + config.time_new),
            );
            self.router.share(
                &receiver_refs(&config.receivers.watch),
                "add",
                "watch",
                Payload::Map(watch),
                None,
            );
        }

        if escalate {
            if let Err(e) = self.client.ban_user(message.group_id, message.user_id) {
                log::warn!("Ban user {} error: {e:#}", message.user_id);
            }
            let mut bad = serde_json::Map::new();
            bad.insert("id".to_string(), serde_json::json!(message.user_id));
            bad.insert("type".to_string(), serde_json::json!("user"));
            self.router.share(
                &receiver_refs(&config.receivers.bad),
                "add",
                "bad",
                Payload::Map(bad),
                None,
            );
        } else if let Err(e) = self.client.restrict_user(
            message.group_id,
            message.user_id,
            message.timestamp + config.time_punish,
        ) {
            log::warn!("Restrict user {} error: {e:#}", message.user_id);
        }
    }

    /// Member-join bookkeeping; feeds the burst and new-member checks.
    pub async fn record_join(&self, group_id: i64, user_id: i64, now: i64) {
        let _guard = self.shared.domains.message.lock().await;
        let mut state = self.shared.state.lock().unwrap();
        state.risk.record_join(user_id, group_id, now);
        self.shared.persist_users(&state);
    }
}

fn receiver_refs(receivers: &[String]) -> Vec<&str> {
    receivers.iter().map(String::as_str).collect()
}
