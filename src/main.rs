//! vidtrackr-sync: run a sync process for the shared pipeline board
//!
//! `run` starts an engine and takes line commands on stdin, so several
//! terminals pointed at the same data directory behave like several browser
//! tabs: one becomes leader, the others relay through it.

use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use serde_json::json;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::info;

use vidtrackr_sync::auth::{CredentialProvider, StaticCredentials};
use vidtrackr_sync::clock::{Clock, SystemClock};
use vidtrackr_sync::config::{Config, RemoteKind};
use vidtrackr_sync::leader::{LeaseStore, SqliteLeaseStore};
use vidtrackr_sync::local_store::{SnapshotStore, SqliteSnapshotStore};
use vidtrackr_sync::remote::{FileRemote, HttpRemote, HttpRemoteConfig, RemoteStore};
use vidtrackr_sync::{DomainSnapshot, EngineParts, Resolution, SyncEngine};

#[derive(Parser)]
#[command(name = "vidtrackr-sync")]
#[command(about = "Leader-elected, offline-first sync for a shared pipeline board")]
struct Cli {
    /// Path to configuration file
    #[arg(short, long, default_value = "vidtrackr-sync.toml")]
    config: String,

    /// Data directory (overrides config file)
    #[arg(short, long, env = "VIDTRACKR_DATA_DIR")]
    data_dir: Option<String>,

    /// Shared document path for the file remote
    #[arg(long, env = "VIDTRACKR_REMOTE_PATH")]
    remote_path: Option<String>,

    /// Bearer token for the HTTP remote
    #[arg(long, env = "VIDTRACKR_API_TOKEN", hide_env_values = true)]
    api_token: Option<String>,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Start a sync process reading commands from stdin (default)
    Run,
    /// Print the locally stored snapshot
    Show,
    /// Print persisted sync metadata and the current lease
    Status,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("vidtrackr_sync=info".parse()?),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let mut config = Config::load(std::path::Path::new(&cli.config))?;

    // Apply CLI overrides
    if let Some(data_dir) = cli.data_dir {
        config.node.data_dir = PathBuf::from(data_dir);
    }
    if let Some(remote_path) = cli.remote_path {
        config.remote.path = PathBuf::from(remote_path);
    }
    if let Some(token) = cli.api_token {
        config.remote.api_token = Some(token);
    }
    config.validate()?;

    match cli.command.unwrap_or(Commands::Run) {
        Commands::Run => run(config).await,
        Commands::Show => show(&config),
        Commands::Status => status(&config),
    }
}

async fn run(config: Config) -> anyhow::Result<()> {
    let data_dir = config.node.data_dir.clone();
    let process_id = config
        .node
        .process_id
        .clone()
        .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());

    let local = Arc::new(SqliteSnapshotStore::open(&data_dir)?);
    let client_id = local.client_id()?;
    let clock: Arc<dyn Clock> = Arc::new(SystemClock);

    info!(%process_id, %client_id, data_dir = %data_dir.display(), "Starting vidtrackr-sync");

    let (credentials, remote): (Arc<dyn CredentialProvider>, Arc<dyn RemoteStore>) =
        match config.remote.kind {
            RemoteKind::File => (
                Arc::new(StaticCredentials::anonymous()),
                Arc::new(FileRemote::new(
                    &config.remote.path,
                    process_id.clone(),
                    client_id.clone(),
                    clock.clone(),
                )),
            ),
            RemoteKind::Http => {
                let credentials: Arc<dyn CredentialProvider> =
                    Arc::new(StaticCredentials::new(config.remote.api_token.clone()));
                let remote = HttpRemote::new(
                    HttpRemoteConfig {
                        base_url: config.remote.base_url.clone(),
                        document_id: config.remote.document_id.clone(),
                        timeout_secs: config.sync.remote_timeout_ms.div_ceil(1000),
                    },
                    credentials.clone(),
                    process_id.clone(),
                    client_id.clone(),
                    clock.clone(),
                )?;
                (credentials, Arc::new(remote))
            }
        };

    let (lease, bus) = config.device_channel();

    let engine = SyncEngine::start(
        config.engine_config(process_id),
        EngineParts {
            local,
            remote,
            credentials,
            lease,
            bus,
            clock,
        },
    )?;

    let mut status_rx = engine.subscribe_status();
    let printer = tokio::spawn(async move {
        while status_rx.changed().await.is_ok() {
            let status = status_rx.borrow_and_update().clone();
            println!(
                "[{}] role={} dirty={} conflict={}",
                status.state, status.role, status.dirty, status.has_conflict
            );
        }
    });

    println!("commands: add <title> | rename <n> <title> | remove <n> | pull | resolve remote|overwrite | auth | status | show | quit");
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        let line = tokio::select! {
            line = lines.next_line() => line?,
            _ = tokio::signal::ctrl_c() => None,
        };
        let Some(line) = line else { break };
        match execute(&engine, line.trim()).await {
            Ok(Flow::Continue) => {}
            Ok(Flow::Quit) => break,
            Err(e) => eprintln!("Error: {}", e),
        }
    }

    printer.abort();
    engine.stop().await?;
    Ok(())
}

enum Flow {
    Continue,
    Quit,
}

async fn execute(engine: &SyncEngine, line: &str) -> anyhow::Result<Flow> {
    let (verb, rest) = line.split_once(' ').unwrap_or((line, ""));
    match verb {
        "" => {}
        "add" => {
            let mut snapshot = engine.snapshot();
            let status = snapshot
                .stages
                .first()
                .map(|s| s.label.clone())
                .unwrap_or_default();
            snapshot.items.push(json!({
                "id": uuid::Uuid::new_v4().to_string(),
                "title": rest,
                "status": status,
                "createdDate": chrono::Utc::now().to_rfc3339(),
            }));
            engine.apply_local_mutation(snapshot).await?;
        }
        "rename" => {
            let (index, title) = rest
                .split_once(' ')
                .ok_or_else(|| anyhow::anyhow!("usage: rename <n> <title>"))?;
            let mut snapshot = engine.snapshot();
            let item = item_at(&mut snapshot, index)?;
            item["title"] = json!(title);
            engine.apply_local_mutation(snapshot).await?;
        }
        "remove" => {
            let mut snapshot = engine.snapshot();
            let position = parse_index(&snapshot, rest)?;
            snapshot.items.remove(position);
            engine.apply_local_mutation(snapshot).await?;
        }
        "pull" => engine.pull().await?,
        "resolve" => {
            let resolution = match rest {
                "remote" => Resolution::LoadRemote,
                "overwrite" => Resolution::Overwrite,
                _ => anyhow::bail!("usage: resolve remote|overwrite"),
            };
            engine.resolve_conflict(resolution).await?;
        }
        "auth" => engine.authorize().await?,
        "status" => println!("{}", serde_json::to_string_pretty(&engine.status())?),
        "show" => print_snapshot(&engine.snapshot()),
        "quit" | "exit" => return Ok(Flow::Quit),
        other => anyhow::bail!("unknown command: {}", other),
    }
    Ok(Flow::Continue)
}

fn parse_index(snapshot: &DomainSnapshot, raw: &str) -> anyhow::Result<usize> {
    let n: usize = raw.trim().parse()?;
    if n == 0 || n > snapshot.items.len() {
        anyhow::bail!("no item {} (have {})", n, snapshot.items.len());
    }
    Ok(n - 1)
}

fn item_at<'a>(snapshot: &'a mut DomainSnapshot, raw: &str) -> anyhow::Result<&'a mut serde_json::Value> {
    let position = parse_index(snapshot, raw)?;
    Ok(&mut snapshot.items[position])
}

fn print_snapshot(snapshot: &DomainSnapshot) {
    for (i, item) in snapshot.items.iter().enumerate() {
        println!(
            "{:>3}. {} [{}]",
            i + 1,
            item["title"].as_str().unwrap_or("(untitled)"),
            item["status"].as_str().unwrap_or("-")
        );
    }
    println!("{} items, {} stages", snapshot.items.len(), snapshot.stages.len());
}

fn show(config: &Config) -> anyhow::Result<()> {
    let local = SqliteSnapshotStore::open(&config.node.data_dir)?;
    match local.load()? {
        Some(snapshot) => print_snapshot(&snapshot),
        None => println!("No local snapshot in {}", config.node.data_dir.display()),
    }
    Ok(())
}

fn status(config: &Config) -> anyhow::Result<()> {
    let local = SqliteSnapshotStore::open(&config.node.data_dir)?;
    let meta = local.load_meta()?;
    let lease = SqliteLeaseStore::open(&config.node.data_dir)?.read()?;
    let now = SystemClock.now_ms();

    println!("client id:    {}", local.client_id()?);
    println!(
        "last version: {}",
        meta.last_version.map(|v| v.to_string()).unwrap_or_else(|| "-".to_string())
    );
    println!("dirty:        {}", meta.dirty);
    match lease {
        Some(lease) if lease.is_valid_at(now) => {
            println!("leader:       {} ({}ms left)", lease.owner_id, lease.expires_at - now)
        }
        Some(lease) => println!("leader:       none (lease of {} expired)", lease.owner_id),
        None => println!("leader:       none"),
    }
    Ok(())
}
