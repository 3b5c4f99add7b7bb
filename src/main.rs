use clap::{Arg, Command};
use join_warden::config::AppConfig;
use join_warden::events::{apply, parse_event, Event};
use join_warden::platform::{LoggingExecutor, LoggingNotifier, MEMBERS_FILE};
use join_warden::signals::{CaseHistoryBanLookup, KeywordUsernameStrategy};
use join_warden::store::JsonFileStore;
use join_warden::{AuditLog, Collaborators, InMemoryConfigStore, Pipeline};
use log::LevelFilter;
use std::process;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::Notify;

const AUDIT_FLUSH_SECONDS: u64 = 5;

#[tokio::main]
async fn main() {
    let matches = Command::new("join-warden")
        .version(env!("CARGO_PKG_VERSION"))
        .about("Risk assessment and verification for newly joined community members")
        .long_about(
            "Reads join, decision and moderation events as JSON lines on stdin, scores each \
             new member, applies the community policy and follows every case through to \
             approval, removal or admin review.",
        )
        .arg(
            Arg::new("config")
                .short('c')
                .long("config")
                .value_name("FILE")
                .help("Configuration file path")
                .default_value("/etc/join-warden.yaml"),
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
                .help("Validate every community policy and exit")
                .action(clap::ArgAction::SetTrue),
        )
        .arg(
            Arg::new("recover-only")
                .long("recover-only")
                .help("Reconcile persisted cases (expire overdue approvals) and exit")
                .action(clap::ArgAction::SetTrue),
        )
        .arg(
            Arg::new("verbose")
                .short('v')
                .long("verbose")
                .help("Enable verbose logging with per-signal detail")
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

    let config_path = matches
        .get_one::<String>("config")
        .map(String::as_str)
        .unwrap_or("/etc/join-warden.yaml");
    let config = match load_config(config_path) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("Error loading configuration: {e:#}");
            process::exit(1);
        }
    };

    if matches.get_flag("test-config") {
        test_config(&config);
        return;
    }

    if let Err(e) = config.service.validate() {
        eprintln!("{e}");
        process::exit(1);
    }
    for error in config.invalid_policies() {
        log::error!("{error}");
    }

    if let Err(e) = run(config, matches.get_flag("recover-only")).await {
        log::error!("join-warden stopped: {e:#}");
        process::exit(1);
    }
}

async fn run(config: AppConfig, recover_only: bool) -> anyhow::Result<()> {
    use anyhow::Context;

    let store = Arc::new(
        JsonFileStore::open(&config.service.data_dir)
            .with_context(|| format!("Failed to open data directory {}", config.service.data_dir))?,
    );
    let audit = Arc::new(AuditLog::new(
        config.service.audit_log_path.clone(),
        AUDIT_FLUSH_SECONDS,
    )?);
    let members_path = std::path::Path::new(&config.service.data_dir).join(MEMBERS_FILE);
    let executor = Arc::new(
        LoggingExecutor::open(&members_path)
            .with_context(|| format!("Failed to load membership table {}", members_path.display()))?,
    );

    let (pipeline, timer_events) = Pipeline::new(
        &config.service,
        Collaborators {
            configs: Arc::new(InMemoryConfigStore::new(&config)),
            cases: store.clone(),
            flags: store.clone(),
            warnings: store.clone(),
            bans: Arc::new(CaseHistoryBanLookup::new(store)),
            username: Arc::new(KeywordUsernameStrategy::new()),
            notifier: Arc::new(LoggingNotifier),
            executor: executor.clone(),
            audit: audit.clone(),
        },
    );
    let pipeline = Arc::new(pipeline);

    let report = pipeline.recover().await?;
    if recover_only {
        println!(
            "Recovered: {} interrupted, {} re-armed, {} expired",
            report.interrupted, report.rearmed, report.expired
        );
        audit.flush().await;
        return Ok(());
    }

    let timer_pipeline = pipeline.clone();
    tokio::spawn(async move {
        timer_pipeline.run_timer_loop(timer_events).await;
    });

    let shutdown = Arc::new(Notify::new());
    let signal = shutdown.clone();
    if let Err(e) = ctrlc::set_handler(move || {
        log::info!("Received shutdown signal, flushing audit log...");
        signal.notify_one();
    }) {
        log::warn!("Failed to install signal handler: {e}");
    }

    log::info!("join-warden ready, reading events from stdin");
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut interrupted = false;
    loop {
        tokio::select! {
            line = lines.next_line() => {
                match line {
                    Ok(Some(line)) => {
                        if line.trim().is_empty() {
                            continue;
                        }
                        handle_line(&pipeline, &executor, &line).await;
                    }
                    Ok(None) => break,
                    Err(e) => {
                        log::error!("Failed to read stdin: {e}");
                        break;
                    }
                }
            }
            _ = shutdown.notified() => {
                interrupted = true;
                break;
            }
        }
    }

    let pending = pipeline.machine().timers().armed_count();
    if !interrupted && pending > 0 {
        log::info!("Input closed, waiting on {pending} approval timer(s); Ctrl-C to stop");
        shutdown.notified().await;
    }

    audit.flush().await;
    log::info!("Audit log flushed to {}", audit.path());
    Ok(())
}

async fn handle_line(pipeline: &Pipeline, executor: &LoggingExecutor, line: &str) {
    let event = match parse_event(line) {
        Ok(event) => event,
        Err(e) => {
            log::warn!("{e}");
            return;
        }
    };
    if let Event::Join { membership, .. } = &event {
        if let Err(e) = executor.register_member(membership) {
            log::warn!("Could not record membership of {}: {e}", membership.identity_id);
        }
    }
    if let Err(e) = apply(pipeline, event).await {
        if e.is_informational() {
            log::debug!("{e}");
        } else {
            log::error!("{e}");
        }
    }
}

fn load_config(path: &str) -> anyhow::Result<AppConfig> {
    if std::path::Path::new(path).exists() {
        AppConfig::from_file(path)
    } else {
        log::warn!("Configuration file '{path}' not found, using default configuration");
        Ok(AppConfig::default())
    }
}

fn generate_default_config(path: &str) {
    let config = AppConfig::default();
    match config.to_file(path) {
        Ok(()) => {
            println!("Default configuration written to: {path}");
            println!("Please edit the configuration file to suit your needs.");
        }
        Err(e) => {
            eprintln!("Error writing configuration file: {e}");
            process::exit(1);
        }
    }
}

fn test_config(config: &AppConfig) {
    println!("🔍 Testing configuration...");
    println!();
    println!("Data directory: {}", config.service.data_dir);
    println!("Audit log: {}", config.service.audit_log_path);
    println!("Analysis deadline: {}ms", config.service.analysis_deadline_ms);
    println!("Communities with their own policy: {}", config.communities.len());
    for community in config.communities.keys() {
        println!("  - {community}");
    }

    let errors = config.invalid_policies();
    if errors.is_empty() {
        println!("✅ All policies are valid");
    } else {
        println!("❌ Configuration validation failed:");
        for error in errors {
            println!("  {error}");
        }
        process::exit(1);
    }
}
