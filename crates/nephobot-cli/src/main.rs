use std::path::{Path, PathBuf};

use anyhow::{anyhow, Result};
use clap::{Args, Parser, Subcommand};
use nephobot_core::{now_utc, EntityId, EventId, EventLedger, MemoryKvStore, StatsAggregator};
use nephobot_provider::{
    HttpContentRepository, HttpDecisionEngine, HttpFeedSource, HttpPublisher,
    HttpStatsCardRenderer, Notification, RecordingPublisher, ScriptedFeed,
};
use nephobot_store_sqlite::SqliteKvStore;
use nephobot_workflow::{load_config_from_path, BotConfig, Coordinator, CycleOutcome};
use serde_json::json;
use tracing::info;

#[derive(Debug, Parser)]
#[command(name = "nephobot")]
#[command(about = "Mention-reply bot with an idempotent processing ledger")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Continuous poll loop.
    Run(ConfigArgs),
    /// Exactly one feed cycle; prints the cycle report.
    Cycle(ConfigArgs),
    /// One synthetic notification against the real content and decision
    /// endpoints, with a volatile store and no outbound post.
    DryRun(DryRunArgs),
    /// Per-entity statistics snapshot.
    Stats(StatsArgs),
    /// Category or entity rankings.
    Ranking(RankingArgs),
    /// Ledger inspection and manual replay.
    Ledger(LedgerArgs),
}

#[derive(Debug, Args)]
struct ConfigArgs {
    #[arg(long)]
    config: PathBuf,
}

#[derive(Debug, Args)]
struct DryRunArgs {
    #[arg(long)]
    config: PathBuf,
    /// Raw content reference, as it would arrive in a mention.
    #[arg(long)]
    reference: String,
    #[arg(long, default_value = "dry-run")]
    actor: String,
    #[arg(long, default_value_t = 0)]
    event_id: i64,
}

#[derive(Debug, Args)]
struct StatsArgs {
    #[arg(long)]
    db: PathBuf,
    #[arg(long)]
    entity: String,
    /// Print the N most recent action records instead of the snapshot.
    #[arg(long)]
    recent: Option<usize>,
}

#[derive(Debug, Args)]
struct RankingArgs {
    #[command(subcommand)]
    command: RankingSubcommand,
}

#[derive(Debug, Subcommand)]
enum RankingSubcommand {
    Categories {
        #[arg(long)]
        db: PathBuf,
    },
    Entities {
        #[arg(long)]
        db: PathBuf,
        #[arg(long, default_value_t = 10)]
        limit: usize,
    },
}

#[derive(Debug, Args)]
struct LedgerArgs {
    #[command(subcommand)]
    command: LedgerSubcommand,
}

#[derive(Debug, Subcommand)]
enum LedgerSubcommand {
    List {
        #[arg(long)]
        db: PathBuf,
    },
    Show {
        #[arg(long)]
        db: PathBuf,
        #[arg(long)]
        event_id: i64,
    },
    /// Removes a ledger record so the notification is retried on the next
    /// cycle. Manual replay only.
    Clear {
        #[arg(long)]
        db: PathBuf,
        #[arg(long)]
        event_id: i64,
    },
}

fn main() -> Result<()> {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    match cli.command {
        Commands::Run(args) => run_command(&args),
        Commands::Cycle(args) => cycle_command(&args),
        Commands::DryRun(args) => dry_run_command(&args),
        Commands::Stats(args) => stats_command(&args),
        Commands::Ranking(args) => ranking_command(args),
        Commands::Ledger(args) => ledger_command(args),
    }
}

fn open_store(path: &Path) -> Result<SqliteKvStore> {
    let store = SqliteKvStore::open(path)?;
    store.migrate()?;
    Ok(store)
}

struct HttpCollaborators {
    feed: HttpFeedSource,
    content: HttpContentRepository,
    decision: HttpDecisionEngine,
    publisher: HttpPublisher,
    renderer: Option<HttpStatsCardRenderer>,
}

fn build_collaborators(config: &BotConfig) -> Result<HttpCollaborators> {
    let renderer = match (&config.render, config.attach_stats_card) {
        (Some(render), true) => Some(HttpStatsCardRenderer::new(render)?),
        _ => None,
    };
    Ok(HttpCollaborators {
        feed: HttpFeedSource::new(&config.feed)?,
        content: HttpContentRepository::new(&config.content)?,
        decision: HttpDecisionEngine::new(&config.decision)?,
        publisher: HttpPublisher::new(&config.publish)?,
        renderer,
    })
}

fn run_command(args: &ConfigArgs) -> Result<()> {
    let config = load_config_from_path(&args.config)?;
    let store = open_store(&config.db_path)?;
    let collaborators = build_collaborators(&config)?;

    info!(db = %config.db_path.display(), "nephobot starting");
    let mut coordinator = Coordinator::new(
        store,
        &collaborators.feed,
        &collaborators.content,
        &collaborators.decision,
        &collaborators.publisher,
        collaborators
            .renderer
            .as_ref()
            .map(|renderer| renderer as &dyn nephobot_provider::MediaRenderer),
        config.cycle_config()?,
    );
    coordinator.run_forever(config.poll_interval())
}

fn cycle_command(args: &ConfigArgs) -> Result<()> {
    let config = load_config_from_path(&args.config)?;
    let store = open_store(&config.db_path)?;
    let collaborators = build_collaborators(&config)?;

    let mut coordinator = Coordinator::new(
        store,
        &collaborators.feed,
        &collaborators.content,
        &collaborators.decision,
        &collaborators.publisher,
        collaborators
            .renderer
            .as_ref()
            .map(|renderer| renderer as &dyn nephobot_provider::MediaRenderer),
        config.cycle_config()?,
    );

    match coordinator.run_cycle(now_utc())? {
        CycleOutcome::Completed(report) => {
            println!("{}", serde_json::to_string(&report)?);
        }
        CycleOutcome::Busy => {
            println!("{}", json!({"busy": true}));
        }
    }
    Ok(())
}

fn dry_run_command(args: &DryRunArgs) -> Result<()> {
    let config = load_config_from_path(&args.config)?;

    let feed = ScriptedFeed::new(Vec::new());
    let content = HttpContentRepository::new(&config.content)?;
    let decision = HttpDecisionEngine::new(&config.decision)?;
    let publisher = RecordingPublisher::new();

    let mut coordinator = Coordinator::new(
        MemoryKvStore::new(),
        &feed,
        &content,
        &decision,
        &publisher,
        None,
        config.cycle_config()?,
    );

    let notification = Notification {
        id: EventId(args.event_id),
        source_actor: args.actor.clone(),
        content_ref: args.reference.clone(),
        trigger_context: "dry-run".to_string(),
    };
    let disposition = coordinator
        .process_notification(&notification, now_utc())
        .map_err(|fault| anyhow!(fault))?;

    let would_post: Vec<_> = publisher
        .posted()
        .into_iter()
        .map(|(reference, summary, _media)| {
            json!({"content_ref": reference.as_str(), "summary_text": summary})
        })
        .collect();
    println!(
        "{}",
        json!({
            "disposition": disposition.as_str(),
            "would_post": would_post,
        })
    );
    Ok(())
}

fn stats_command(args: &StatsArgs) -> Result<()> {
    let mut store = open_store(&args.db)?;
    let entity = EntityId::new(args.entity.clone());

    if let Some(limit) = args.recent {
        let records = StatsAggregator::new(&mut store).get_recent(&entity, limit)?;
        if records.is_empty() {
            println!("no recent records for entity {entity}");
            return Ok(());
        }
        for record in records {
            println!("{}", serde_json::to_string(&record)?);
        }
        return Ok(());
    }

    match StatsAggregator::new(&mut store).get_stats(&entity)? {
        Some(stats) => println!("{}", serde_json::to_string(&stats)?),
        None => println!("no statistics recorded for entity {entity}"),
    }
    Ok(())
}

fn ranking_command(args: RankingArgs) -> Result<()> {
    match args.command {
        RankingSubcommand::Categories { db } => {
            let mut store = open_store(&db)?;
            let ranking = StatsAggregator::new(&mut store).global_category_ranking()?;
            for (label, count) in ranking {
                println!("{}", json!({"label": label, "count": count}));
            }
        }
        RankingSubcommand::Entities { db, limit } => {
            let mut store = open_store(&db)?;
            let ranking = StatsAggregator::new(&mut store).active_entity_ranking(limit)?;
            for row in ranking {
                println!("{}", serde_json::to_string(&row)?);
            }
        }
    }
    Ok(())
}

fn ledger_command(args: LedgerArgs) -> Result<()> {
    match args.command {
        LedgerSubcommand::List { db } => {
            let mut store = open_store(&db)?;
            let ids = EventLedger::new(&mut store).list_processed()?;
            for id in ids {
                let record = EventLedger::new(&mut store).get_processed(id)?;
                match record {
                    Some(record) => println!("{}", serde_json::to_string(&record)?),
                    None => println!("{}", json!({"event_id": id.0, "missing": true})),
                }
            }
        }
        LedgerSubcommand::Show { db, event_id } => {
            let mut store = open_store(&db)?;
            match EventLedger::new(&mut store).get_processed(EventId(event_id))? {
                Some(record) => println!("{}", serde_json::to_string(&record)?),
                None => println!("no ledger record for event {event_id}"),
            }
        }
        LedgerSubcommand::Clear { db, event_id } => {
            let mut store = open_store(&db)?;
            let removed = EventLedger::new(&mut store).delete_processed(EventId(event_id))?;
            println!("{}", json!({"event_id": event_id, "removed": removed}));
        }
    }
    Ok(())
}
