//! madflow CLI — run the orchestrator, manage configuration and issues.
//!
//! Usage:
//!   madflow init                  — Write the default configuration
//!   madflow start                 — Run the orchestrator until Ctrl+C
//!   madflow status                — Show configuration and issue summary
//!   madflow issue add <title>     — Create a local issue

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Result;
use clap::{Parser, Subcommand};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use madflow_core::chatlog::Chatlog;
use madflow_core::config::Config;
use madflow_core::dormancy::Dormancy;
use madflow_core::issue::store::{FileIssueStore, IssueStore};
use madflow_core::issue::StatusFilter;
use madflow_core::orchestrator::factory::AgentFactory;
use madflow_core::orchestrator::Orchestrator;
use madflow_core::sync::events::EventWatcher;
use madflow_core::sync::github::GithubClient;
use madflow_core::sync::idle::IdleDetector;
use madflow_core::sync::SyncPoller;
use madflow_core::team::TeamManager;
use madflow_core::throttle::Throttle;

#[derive(Parser)]
#[command(
    name = "madflow",
    version,
    about = "Multi-agent orchestration runtime for engineering tickets"
)]
struct Cli {
    /// Data directory (chatlog, issues, memos, config.json)
    #[arg(long, default_value = madflow_core::config::DEFAULT_DATA_DIR, global = true)]
    data_dir: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Write the default configuration
    Init,

    /// Run the orchestrator until Ctrl+C
    Start,

    /// Show configuration and issue summary
    Status,

    /// Manage local issues
    Issue {
        #[command(subcommand)]
        action: IssueCommands,
    },
}

#[derive(Subcommand)]
enum IssueCommands {
    /// Create a local issue
    Add {
        /// Issue title
        title: String,

        /// Issue body
        #[arg(short, long, default_value = "")]
        body: String,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_target(false)
        .compact()
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Init => cmd_init(&cli.data_dir),
        Commands::Start => cmd_start(&cli.data_dir).await,
        Commands::Status => cmd_status(&cli.data_dir),
        Commands::Issue { action } => cmd_issue(&cli.data_dir, action),
    }
}

fn load_config(data_dir: &PathBuf) -> Result<Config> {
    let config = Config::load(data_dir)?;
    if let Err(errors) = config.validate() {
        for error in &errors {
            eprintln!("  config error: {error}");
        }
        anyhow::bail!("fix the above {} error(s) in config.json", errors.len());
    }
    Ok(config)
}

// ── init ────────────────────────────────────────────────────────────

fn cmd_init(data_dir: &PathBuf) -> Result<()> {
    let path = Config::write_default_template(data_dir)?;
    println!("configuration written to {}", path.display());
    println!("edit it, then run `madflow start`");
    Ok(())
}

// ── start ───────────────────────────────────────────────────────────

async fn cmd_start(data_dir: &PathBuf) -> Result<()> {
    let config = load_config(data_dir)?;
    std::fs::create_dir_all(data_dir)?;

    let chatlog = Chatlog::new(config.chatlog_path());
    let store: Arc<dyn IssueStore> = Arc::new(FileIssueStore::new(config.issues_dir()));
    let client = reqwest::Client::new();

    let throttle = (config.agents.requests_per_minute > 0)
        .then(|| Arc::new(Throttle::new(config.agents.requests_per_minute)));
    let dormancy = Some(Dormancy::new());

    let factory = Arc::new(AgentFactory::from_config(
        &config,
        Arc::clone(&store),
        throttle,
        dormancy,
        client.clone(),
    ));
    let superintendent = factory.build_superintendent()?;
    let teams = Arc::new(TeamManager::new(
        factory,
        chatlog.clone(),
        config.agents.max_teams,
    ));

    let idle = Arc::new(IdleDetector::new(
        std::time::Duration::from_secs(config.sync.idle_threshold_seconds),
        std::time::Duration::from_secs(config.sync.dormancy_threshold_seconds),
    ));
    let github = GithubClient::new(client, config.github_token());
    let (events_tx, events_rx) = mpsc::channel(64);

    let (poller, watcher) = if config.sync.repos.is_empty() {
        (None, None)
    } else {
        let poller = SyncPoller::new(
            Arc::clone(&store),
            github.clone(),
            config.sync.repos.clone(),
            Arc::clone(&idle),
            std::time::Duration::from_secs(config.sync.interval_seconds),
            std::time::Duration::from_secs(config.sync.idle_interval_seconds),
            config.authorized_users(),
        );
        let watcher = EventWatcher::new(
            Arc::clone(&store),
            github,
            config.sync.repos.clone(),
            Arc::clone(&idle),
            std::time::Duration::from_secs(config.sync.events_interval_seconds),
            config.authorized_users(),
            events_tx,
        );
        (Some(poller), Some(watcher))
    };

    let orchestrator = Orchestrator::new(
        chatlog,
        store,
        teams,
        superintendent,
        poller,
        watcher,
        events_rx,
    );

    println!("madflow starting (data dir: {})", data_dir.display());
    println!("press Ctrl+C to stop");

    let cancel = CancellationToken::new();
    let run = tokio::spawn(orchestrator.run(cancel.clone()));

    tokio::signal::ctrl_c().await?;
    println!("shutting down...");
    cancel.cancel();
    run.await??;

    println!("stopped");
    Ok(())
}

// ── status ──────────────────────────────────────────────────────────

fn cmd_status(data_dir: &PathBuf) -> Result<()> {
    let config = Config::load(data_dir)?;
    let config_path = data_dir.join(madflow_core::config::CONFIG_FILE);

    println!();
    println!("  madflow status");
    if config_path.exists() {
        println!("  config:   {}", config_path.display());
    } else {
        println!("  config:   not found (run `madflow init`)");
    }
    println!("  provider: {:?}", config.provider.kind);
    if config.sync.repos.is_empty() {
        println!("  repos:    none (local issues only)");
    } else {
        println!("  repos:    {}", config.sync.repos.join(", "));
    }

    let store = FileIssueStore::new(config.issues_dir());
    let issues = store.list(StatusFilter::any())?;
    let active = issues.iter().filter(|i| i.status.is_active()).count();
    let pending = issues.iter().filter(|i| i.pending_approval).count();
    println!("  issues:   {} total, {} active, {} awaiting approval", issues.len(), active, pending);
    println!();
    Ok(())
}

// ── issue ───────────────────────────────────────────────────────────

fn cmd_issue(data_dir: &PathBuf, action: IssueCommands) -> Result<()> {
    let config = Config::load(data_dir)?;
    let store = FileIssueStore::new(config.issues_dir());

    match action {
        IssueCommands::Add { title, body } => {
            let issue = store.create(&title, &body)?;
            println!("created {}: {}", issue.id, issue.title);
        }
    }
    Ok(())
}
