use crate::exchange::codec::Payload;
use crate::exchange::files;
use crate::exchange::router::{Attachment, ChannelRouter};
use crate::rules::RuleCategory;
use crate::state::Shared;
use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;

/// Periodic maintenance invoked by the external scheduler. None of these
/// functions own a timer; wiring them to a cron surface is the embedder's
/// concern (the demo binary runs them once).

const PERSISTED_OBJECTS: [&str; 6] = [
    "user_ids",
    "configs",
    "admin_ids",
    "bad_ids",
    "except_ids",
    "watch_ids",
];

/// Monthly score reset: every user's score contributions and detection
/// history are cleared so stale suspicion does not accumulate forever.
pub fn reset_scores(shared: &Shared) {
    let mut state = shared.state.lock().unwrap();
    for user in state.risk.users.values_mut() {
        user.score.clear();
        user.detected.clear();
    }
    shared.persist_users(&state);
    log::info!("Score reset complete for {} users", state.risk.users.len());
}

/// Ships every persisted object to the backup keeper as an encrypted
/// attachment.
pub fn backup_files(shared: &Shared, router: &ChannelRouter) {
    let mut names: Vec<String> = PERSISTED_OBJECTS.iter().map(|s| s.to_string()).collect();
    names.extend(RuleCategory::all().iter().map(|c| c.object_name()));

    for name in names {
        let path = shared.store.path(&name);
        if !path.exists() {
            continue;
        }

        let delivery = router.share(
            &["BACKUP"],
            "backup",
            "data",
            Payload::Text(name.clone()),
            Some(Attachment::encrypted(path)),
        );
        log::debug!("Backup of {name}: {delivery:?}");
    }
}

/// Shares each rule category's hit telemetry with the ruleset keeper.
pub fn send_count(shared: &Shared, router: &ChannelRouter) {
    for category in RuleCategory::all() {
        let snapshot = {
            let rules = shared.rules.lock().unwrap();
            if rules.is_empty(category) {
                continue;
            }
            rules.snapshot(category)
        };

        let staged = match files::stage_json(Path::new(&shared.config.scratch_dir), &snapshot) {
            Ok(staged) => staged,
            Err(e) => {
                log::warn!("Stage count for {} error: {e:#}", category.name());
                continue;
            }
        };

        router.share(
            &["REGEX"],
            "regex",
            "count",
            Payload::Text(category.object_name()),
            Some(Attachment::encrypted(staged)),
        );
    }
}

/// Applies a refreshed admin map, e.g. after the platform-side admin scan.
pub fn renew_admins(shared: &Shared, admins: BTreeMap<i64, BTreeSet<i64>>) {
    let mut state = shared.state.lock().unwrap();
    state.admin_ids = admins;
    shared.persist_admins(&state);
}
