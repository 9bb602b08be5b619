use anyhow::{Context, bail};
use chrono::{DateTime, Duration, Utc};
use clap::{Parser, Subcommand};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::debug;
use tracing_subscriber::EnvFilter;
use worldstate_common::{ManualClock, SnapshotId, StateCategory, StateValue};
use worldstate_engine::{EngineConfig, RepositoryBackend, RepositoryConfig, WorldStateManager};
use worldstate_kernel::{StateQuery, StateWrite};
use worldstate_persist::FileRepository;

const DEFAULT_DATA_DIR: &str = "worldstate-data";

#[derive(Parser)]
#[command(name = "worldstate-cli", about = "CLI tool for world state operations")]
struct Cli {
    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,

    /// YAML engine configuration
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Store directory; selects the file repository
    #[arg(short, long)]
    data_dir: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Print version and store info
    Info,
    /// Run the set / snapshot / rewind / rollback walkthrough in memory
    Demo,
    /// Write a value (JSON, or a bare string)
    Set {
        key: String,
        value: String,
        #[arg(short, long)]
        region: Option<String>,
        #[arg(long)]
        category: Option<String>,
        #[arg(long)]
        reason: Option<String>,
        /// Acting entity
        #[arg(long)]
        entity: Option<String>,
    },
    /// Read a value
    Get {
        key: String,
        #[arg(short, long)]
        region: Option<String>,
    },
    /// List values matching filters
    Query {
        #[arg(short, long)]
        region: Option<String>,
        #[arg(long)]
        category: Option<String>,
        /// Substring the key must contain
        #[arg(long)]
        contains: Option<String>,
    },
    /// Remove a key
    Delete {
        key: String,
        #[arg(short, long)]
        region: Option<String>,
        #[arg(long)]
        reason: Option<String>,
    },
    /// Take a snapshot, or list existing ones
    Snapshot {
        #[arg(short, long)]
        region: Option<String>,
        /// Capture calendar and active effects too
        #[arg(long)]
        global_context: bool,
        #[arg(long)]
        list: bool,
    },
    /// Restore a region to a snapshot
    Rollback {
        snapshot_id: String,
        #[arg(short, long)]
        region: Option<String>,
        /// Skip the backup snapshot taken before restoring
        #[arg(long)]
        no_backup: bool,
    },
    /// Show a key's change history, or a region's state at a past instant
    History {
        key: Option<String>,
        #[arg(short, long)]
        region: Option<String>,
        /// RFC 3339 instant to reconstruct
        #[arg(long)]
        at: Option<String>,
    },
    /// Advance time, expire effects and run due summarization
    Tick,
    /// Run summarization now
    Summarize {
        /// Run every tier, due or not
        #[arg(long)]
        force: bool,
    },
    /// List summaries overlapping a period
    Summaries {
        /// RFC 3339 start (default: 30 days ago)
        #[arg(long)]
        from: Option<String>,
        /// RFC 3339 end (default: now)
        #[arg(long)]
        to: Option<String>,
        #[arg(short, long)]
        region: Option<String>,
    },
    /// Check the store's integrity manifest
    Verify,
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let config = load_config(cli.config.as_deref(), cli.data_dir.as_deref())?;

    let filter = if cli.verbose {
        "debug"
    } else {
        config.logging.filter.as_str()
    };
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::new(filter))
        .init();

    match cli.command {
        Commands::Info => {
            println!("worldstate-cli v{}", env!("CARGO_PKG_VERSION"));
            print_store_info(&config);
        }
        Commands::Demo => run_demo()?,
        Commands::Verify => {
            let path = file_path(&config)?;
            let repo = FileRepository::open(path)
                .with_context(|| format!("opening store at {}", path.display()))?;
            repo.verify_integrity()?;
            let meta = repo.meta();
            println!(
                "OK: {} snapshots, {} summaries, {} state saves",
                meta.snapshot_count, meta.summary_count, meta.state_saves
            );
        }
        command => {
            let manager = WorldStateManager::new(config)?;
            if !manager.load_from_repository() {
                debug!("no stored world state; starting fresh");
            }
            if run_command(&manager, command)? && !manager.save_to_repository() {
                bail!("failed to save world state");
            }
        }
    }

    Ok(())
}

/// Config from file (or defaults), then `--data-dir`. Without either, the
/// CLI keeps its data in `./worldstate-data` so invocations share state.
fn load_config(path: Option<&Path>, data_dir: Option<&Path>) -> anyhow::Result<EngineConfig> {
    let mut config = match path {
        Some(path) => EngineConfig::from_file(path)
            .with_context(|| format!("loading config {}", path.display()))?,
        None => EngineConfig::parse("{}")?,
    };
    if let Some(dir) = data_dir {
        config.repository = RepositoryConfig::file(dir);
    } else if path.is_none() && config.repository.backend == RepositoryBackend::Memory {
        config.repository = RepositoryConfig::file(DEFAULT_DATA_DIR);
    }
    Ok(config)
}

fn file_path(config: &EngineConfig) -> anyhow::Result<&Path> {
    match (&config.repository.backend, &config.repository.path) {
        (RepositoryBackend::File, Some(path)) => Ok(path.as_path()),
        _ => bail!("this command needs the file repository"),
    }
}

fn print_store_info(config: &EngineConfig) {
    match file_path(config) {
        Ok(path) => match FileRepository::open(path) {
            Ok(repo) => {
                let meta = repo.meta();
                println!("store: {}", path.display());
                println!(
                    "schema: state v{}, records v{}",
                    meta.state_schema_version, meta.record_schema_version
                );
                println!(
                    "records: {} snapshots, {} summaries",
                    meta.snapshot_count, meta.summary_count
                );
            }
            Err(err) => println!("store: {} (unavailable: {err})", path.display()),
        },
        Err(_) => println!("store: {:?}", config.repository.backend),
    }
    let tiers: Vec<_> = config
        .summarization
        .tiers
        .iter()
        .map(|(level, policy)| {
            format!(
                "{level} {}d/{}d",
                policy.frequency_days, policy.retention_days
            )
        })
        .collect();
    println!(
        "summarization: {} [{}]",
        if config.summarization.enabled { "on" } else { "off" },
        tiers.join(", ")
    );
}

/// Run a stateful command. Returns whether the state changed.
fn run_command(manager: &WorldStateManager, command: Commands) -> anyhow::Result<bool> {
    let store = manager.store();
    match command {
        Commands::Set {
            key,
            value,
            region,
            category,
            reason,
            entity,
        } => {
            let mut write = StateWrite::new(key, parse_value(&value));
            if let Some(region) = region {
                write = write.region(region);
            }
            if let Some(category) = category {
                write = write.category(category.parse::<StateCategory>()?);
            }
            if let Some(reason) = reason {
                write = write.reason(reason);
            }
            if let Some(entity) = entity {
                write = write.entity(entity);
            }
            let change = store.apply(write)?;
            println!(
                "{} {}/{}: {} -> {}",
                change.change_type,
                change.region,
                change.state_key,
                to_json(&change.old_value)?,
                to_json(&change.new_value)?
            );
            Ok(true)
        }
        Commands::Get { key, region } => {
            match store.get(&key, region.as_deref()) {
                Some(value) => println!("{}", to_json(&value)?),
                None => println!("(not set)"),
            }
            Ok(false)
        }
        Commands::Query {
            region,
            category,
            contains,
        } => {
            let mut query = StateQuery::new();
            if let Some(category) = category {
                query = query.category(category.parse()?);
            }
            if let Some(pattern) = contains {
                query = query.key_contains(pattern);
            }
            for (key, value) in store.query(&query, region.as_deref()) {
                println!("{key} = {}", to_json(&value)?);
            }
            Ok(false)
        }
        Commands::Delete {
            key,
            region,
            reason,
        } => match store.delete(&key, region.as_deref(), reason.as_deref())? {
            Some(change) => {
                println!("deleted {}/{}", change.region, change.state_key);
                Ok(true)
            }
            None => {
                println!("(not set)");
                Ok(false)
            }
        },
        Commands::Snapshot {
            region,
            global_context,
            list,
        } => {
            if list {
                for snap in manager.snapshots().snapshots(region.as_deref()) {
                    println!(
                        "{} {} {} keys{}",
                        snap.snapshot_id,
                        snap.timestamp.to_rfc3339(),
                        snap.local_state.len(),
                        snap.kind().map(|k| format!(" ({k})")).unwrap_or_default()
                    );
                }
                return Ok(false);
            }
            let snap = manager.snapshots().create_snapshot(
                region.as_deref(),
                global_context,
                BTreeMap::new(),
            )?;
            println!(
                "snapshot {} of {} at {}",
                snap.snapshot_id,
                snap.region_id,
                snap.timestamp.to_rfc3339()
            );
            Ok(true)
        }
        Commands::Rollback {
            snapshot_id,
            region,
            no_backup,
        } => {
            let id: SnapshotId = snapshot_id
                .parse()
                .with_context(|| format!("invalid snapshot id {snapshot_id}"))?;
            if !manager
                .snapshots()
                .rollback_to_snapshot(region.as_deref(), id, !no_backup)
            {
                bail!("rollback to {id} failed");
            }
            println!("rolled back to {id}");
            Ok(true)
        }
        Commands::History { key, region, at } => {
            if let Some(at) = at {
                let at = parse_time(&at)?;
                let Some(state) = manager
                    .history()
                    .get_historical_state(region.as_deref(), at, true)
                else {
                    bail!("no reconstructible state at {}", at.to_rfc3339());
                };
                println!(
                    "base snapshot {} + {} changes",
                    state.base_snapshot_id, state.changes_applied
                );
                for (key, value) in state
                    .regional_state
                    .iter()
                    .filter(|(k, _)| key.as_ref().is_none_or(|wanted| wanted == *k))
                {
                    println!("{key} = {}", to_json(value)?);
                }
                return Ok(false);
            }
            let Some(key) = key else {
                bail!("give a key, or --at to reconstruct a whole region");
            };
            for change in store.history(&key, region.as_deref()) {
                println!(
                    "#{} {} {} {} -> {}{}",
                    change.seq,
                    change.timestamp.to_rfc3339(),
                    change.change_type,
                    to_json(&change.old_value)?,
                    to_json(&change.new_value)?,
                    change
                        .reason
                        .as_ref()
                        .map(|r| format!(" ({r})"))
                        .unwrap_or_default()
                );
            }
            Ok(false)
        }
        Commands::Tick => {
            let report = manager.process_tick();
            println!("tick at {}", report.timestamp.to_rfc3339());
            for effect in &report.expired_effects {
                println!("expired: {}", effect.name);
            }
            for (level, count) in &report.summaries_created {
                println!("{level}: {count} summaries");
            }
            Ok(true)
        }
        Commands::Summarize { force } => {
            let created = manager.scheduler().process_batch_summarization(force);
            if created.is_empty() {
                println!("no tier due");
            }
            for (level, count) in &created {
                println!("{level}: {count} summaries");
            }
            Ok(true)
        }
        Commands::Summaries { from, to, region } => {
            let end = to
                .as_deref()
                .map(parse_time)
                .transpose()?
                .unwrap_or_else(Utc::now);
            let start = match from {
                Some(from) => parse_time(&from)?,
                None => end - Duration::days(30),
            };
            for summary in manager.summaries_for_period(start, end, region.as_deref()) {
                println!(
                    "[{}] {} .. {}: {}",
                    summary.period_type,
                    summary.period_start.to_rfc3339(),
                    summary.period_end.to_rfc3339(),
                    summary.summary_text
                );
            }
            Ok(false)
        }
        Commands::Info | Commands::Demo | Commands::Verify => Ok(false),
    }
}

/// Walk through write, snapshot, reconstruct and rollback on one region.
fn run_demo() -> anyhow::Result<()> {
    let start = Utc::now();
    let clock = Arc::new(ManualClock::new(start));
    let manager = WorldStateManager::from_parts(EngineConfig::default(), None, clock.clone());
    let store = manager.store();

    store.set("gold", 100, Some("r1"))?;
    let snap = manager
        .snapshots()
        .create_snapshot(Some("r1"), true, BTreeMap::new())?;
    println!("set gold=100, snapshot {}", snap.snapshot_id);

    clock.advance(Duration::minutes(5));
    store.set("gold", 50, Some("r1"))?;
    println!("set gold=50");

    let past = manager
        .history()
        .get_historical_state(Some("r1"), snap.timestamp, false)
        .context("snapshot time should be reconstructible")?;
    let then = past
        .regional_state
        .get("gold")
        .cloned()
        .unwrap_or_default();
    println!("gold at snapshot time: {}", to_json(&then)?);
    println!(
        "gold now: {}",
        to_json(&store.get_or("gold", Some("r1"), StateValue::Null))?
    );

    let snapshots = manager.snapshots();
    if !snapshots.rollback_to_snapshot(Some("r1"), snap.snapshot_id, true) {
        bail!("rollback failed");
    }
    let restored = store.get_or("gold", Some("r1"), StateValue::Null);
    println!("gold after rollback: {}", to_json(&restored)?);
    println!(
        "Match: {}",
        if restored == StateValue::Int(100) {
            "OK"
        } else {
            "MISMATCH"
        }
    );
    Ok(())
}

/// JSON if it parses, otherwise the raw text.
fn parse_value(raw: &str) -> StateValue {
    serde_json::from_str(raw).unwrap_or_else(|_| StateValue::Text(raw.to_string()))
}

fn parse_time(raw: &str) -> anyhow::Result<DateTime<Utc>> {
    Ok(DateTime::parse_from_rfc3339(raw)
        .with_context(|| format!("invalid RFC 3339 time {raw}"))?
        .with_timezone(&Utc))
}

fn to_json(value: &StateValue) -> anyhow::Result<String> {
    Ok(serde_json::to_string(value)?)
}
