use clap::{Arg, Command};
use log::LevelFilter;
use longwatch::classifier::{Classifier, EmojiKind};
use longwatch::config::Config;
use longwatch::exchange::codec;
use longwatch::exchange::dispatch::ProtocolDispatcher;
use longwatch::exchange::files::Base64Cipher;
use longwatch::exchange::router::{BroadcastTransport, ChannelRouter};
use longwatch::pipeline::{DetectionPipeline, InboundMessage};
use longwatch::platform::LogClient;
use longwatch::rules::RuleCategory;
use longwatch::state::Shared;
use std::process;
use std::sync::Arc;

#[tokio::main]
async fn main() {
    let matches = Command::new("longwatch")
        .version(env!("CARGO_PKG_VERSION"))
        .about("Federated moderation node for super-long group messages")
        .arg(
            Arg::new("config")
                .short('c')
                .long("config")
                .value_name("FILE")
                .help("Configuration file path")
                .default_value("longwatch.yaml"),
        )
        .arg(
            Arg::new("generate-config")
                .long("generate-config")
                .value_name("FILE")
                .help("Generate a default configuration file")
                .action(clap::ArgAction::Set),
        )
        .arg(
            Arg::new("test-config")
                .long("test-config")
                .help("Validate the configuration and the persisted rule tables")
                .action(clap::ArgAction::SetTrue),
        )
        .arg(
            Arg::new("check-text")
                .long("check-text")
                .value_name("FILE")
                .help("Run the classifier over a text file and report matches")
                .action(clap::ArgAction::Set),
        )
        .arg(
            Arg::new("demo")
                .long("demo")
                .help("Run in demonstration mode (simulate message processing)")
                .action(clap::ArgAction::SetTrue),
        )
        .arg(
            Arg::new("verbose")
                .short('v')
                .long("verbose")
                .help("Enable verbose logging")
                .action(clap::ArgAction::SetTrue),
        )
        .get_matches();

    let log_level = if matches.get_flag("verbose") {
        LevelFilter::Debug
    } else {
        LevelFilter::Info
    };
    env_logger::Builder::from_default_env()
        .filter_level(log_level)
        .init();

    if let Some(generate_path) = matches.get_one::<String>("generate-config") {
        generate_default_config(generate_path);
        return;
    }

    let config_path = matches.get_one::<String>("config").unwrap();
    let config = match Config::from_file(config_path) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("Error loading configuration: {e}");
            process::exit(1);
        }
    };

    let shared = match Shared::new(config) {
        Ok(shared) => shared,
        Err(e) => {
            eprintln!("Error initializing state: {e}");
            process::exit(1);
        }
    };

    if matches.get_flag("test-config") {
        test_config(&shared);
        return;
    }

    if let Some(text_file) = matches.get_one::<String>("check-text") {
        check_text_file(&shared, text_file).await;
        return;
    }

    if matches.get_flag("demo") {
        run_demo(shared).await;
        return;
    }

    eprintln!("No platform connector is built in; use --demo, --check-text or --test-config");
    process::exit(1);
}

fn generate_default_config(path: &str) {
    match Config::default().to_file(path) {
        Ok(()) => println!("Default configuration written to {path}"),
        Err(e) => {
            eprintln!("Error writing configuration: {e}");
            process::exit(1);
        }
    }
}

fn test_config(shared: &Shared) {
    println!("Node identity: {}", shared.config.identity);
    println!(
        "Permitted limits: {:?}",
        shared.config.permitted_limits
    );

    let rules = shared.rules.lock().unwrap();
    let mut loaded = 0;
    let mut patterns = 0;
    for category in RuleCategory::all() {
        let table = rules.snapshot(category);
        if !table.is_empty() {
            loaded += 1;
            patterns += table.len();
        }
    }
    println!("Rule categories loaded: {loaded} ({patterns} patterns)");
    println!("Configuration OK");
}

async fn check_text_file(shared: &Arc<Shared>, path: &str) {
    let text = match std::fs::read_to_string(path) {
        Ok(text) => text,
        Err(e) => {
            eprintln!("Error reading {path}: {e}");
            process::exit(1);
        }
    };

    // Diagnostics run under their own domain, never the detection one.
    let _guard = shared.domains.test.lock().await;
    let classifier = Classifier::new(
        shared.rules.clone(),
        shared.store.clone(),
        shared.config.emoji.clone(),
    );

    println!("Text length: {} bytes", text.len());
    for category in RuleCategory::all() {
        if let Some(pattern) = classifier.regex_match(category, &text, false) {
            println!("  {} matched: {pattern}", category.name());
        }
    }
    for (label, kind) in [
        ("emoji ad", EmojiKind::Ad),
        ("emoji many", EmojiKind::Many),
        ("emoji watch", EmojiKind::WatchBait),
    ] {
        if classifier.emoji_density(kind, &text) {
            println!("  {label} density exceeded");
        }
    }
    println!(
        "Ban text: {}, delete text: {}",
        classifier.is_ban_text(&text, false),
        classifier.is_delete_text(&text)
    );
}

/// Simulates one node against an in-process broadcast channel: a join, an
/// oversize message, and an inbound score update from a peer.
async fn run_demo(shared: Arc<Shared>) {
    let (primary, mut channel) = BroadcastTransport::new(64);
    let (backup, _backup_rx) = BroadcastTransport::new(64);
    let router = Arc::new(ChannelRouter::new(
        shared.config.identity.clone(),
        Arc::new(primary),
        Arc::new(backup),
        Arc::new(Base64Cipher),
        shared.config.scratch_dir.clone(),
        shared.should_hide.clone(),
    ));
    let client = Arc::new(LogClient);
    let pipeline = DetectionPipeline::new(shared.clone(), router.clone(), client.clone());
    let dispatcher = ProtocolDispatcher::new(
        shared.clone(),
        router.clone(),
        client,
        Arc::new(Base64Cipher),
    );

    println!("{}", longwatch::commands::version());

    let group_id = -1_000_001;
    let user_id = 123_456;
    let now = chrono::Utc::now().timestamp();

    pipeline.record_join(group_id, user_id, now).await;

    let limit = shared
        .state
        .lock()
        .unwrap()
        .group_config(&shared.config, group_id)
        .limit;
    let message = InboundMessage {
        group_id,
        message_id: 1,
        user_id,
        text: "long ".repeat(limit / 5 + 1),
        display_name: "demo user".to_string(),
        forward_name: None,
        forward_from_id: None,
        timestamp: now,
    };
    println!("Processing a {}-byte message (limit {limit})", message.text.len());
    pipeline.process(&message).await;

    while let Ok(text) = channel.try_recv() {
        println!("--- broadcast ---\n{text}");
    }

    let mut data = serde_json::Map::new();
    data.insert("id".to_string(), serde_json::json!(user_id));
    data.insert("score".to_string(), serde_json::json!(1.2));
    let envelope = longwatch::Envelope::new(
        "NOSPAM",
        &[shared.config.identity.as_str()],
        "update",
        "score",
        longwatch::Payload::Map(data),
    );
    println!("--- inbound ---\n{}", codec::encode(&envelope));
    dispatcher.dispatch(&envelope, None).await;

    let total = shared.state.lock().unwrap().risk.total_score(user_id);
    println!("User {user_id} aggregate score: {total}");
}
