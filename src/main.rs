//! `fleet-scheduler` binary: wires the store, streams, node manager and
//! strategy chain together per the loaded config and runs the
//! scheduler loops (or a one-shot debug invocation). See
//! SPEC_FULL.md §6.

use std::sync::Arc;

use clap::{Parser, Subcommand};
use common::Id;
use scheduler::{NodeManager, Scheduler, StrategyChain};
use tokio_util::sync::CancellationToken;

#[derive(Parser, Debug)]
#[command(name = "fleet-scheduler", author, version, about = "Fleet scheduling control plane")]
struct Cli {
    /// Path (without extension) to a config file consumed via the
    /// `config` crate's layered file+env loader. Missing file falls
    /// back to defaults.
    #[arg(long, default_value = "config/scheduler")]
    config: String,

    /// Use in-memory store/stream/cache doubles instead of Postgres and
    /// Redis. Intended for local exploration, not production use.
    #[arg(long)]
    memory: bool,

    /// Postgres connection string, required unless `--memory` is set.
    #[arg(long)]
    database_url: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Start the scheduler and block until SIGINT.
    Run,

    /// Invoke `schedule_run_by_id` once for the given run and exit.
    /// Debug aid; does not start the fallback loop.
    ScheduleOnce { run_id: Id },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let settings = config::load(&cli.config)?;
    common::init_logging(settings.logging.max_level);

    tracing::info!(node_id = %settings.node_id, memory = cli.memory, "fleet-scheduler starting");

    let store: Arc<dyn store::Store> = if cli.memory {
        Arc::new(store::MemoryStore::new())
    } else {
        let dsn = cli
            .database_url
            .as_deref()
            .expect("--database-url is required unless --memory is set");
        let (client, connection) = tokio_postgres::connect(dsn, tokio_postgres::NoTls).await?;
        tokio::spawn(async move {
            if let Err(e) = connection.await {
                tracing::error!(error = %e, "postgres connection closed with error");
            }
        });
        Arc::new(store::PgStore::new(client))
    };

    let heartbeat_cache: Option<Arc<dyn streams::HeartbeatCache>> = if cli.memory {
        Some(Arc::new(streams::InMemoryHeartbeatCache::new()))
    } else {
        let ttl_secs = config::HEARTBEAT_FRESHNESS_WINDOW.as_secs() * 2;
        match streams::RedisHeartbeatCache::connect(&settings.redis.addr, ttl_secs).await {
            Ok(cache) => Some(Arc::new(cache)),
            Err(e) => {
                tracing::warn!(error = %e, "failed to connect heartbeat cache, falling back to store time-window");
                None
            }
        }
    };

    // `MessageStream`'s factory signature is synchronous (SPEC_FULL.md
    // §6), so the Redis path mints per-node handles from one shared
    // `ConnectionManager` rather than reconnecting per node.
    let use_memory = cli.memory;
    let (scheduler_stream, redis_conn): (Arc<dyn streams::MessageStream>, Option<redis::aio::ConnectionManager>) =
        if use_memory {
            (Arc::new(streams::InMemoryMessageStream::new()), None)
        } else {
            let handle =
                streams::RedisMessageStream::connect(&settings.redis.addr, "fleet:scheduler".to_owned()).await?;
            let conn = handle.connection();
            (Arc::new(handle), Some(conn))
        };

    let node_stream_factory = Box::new(move |node_id: Id| -> Arc<dyn streams::MessageStream> {
        if use_memory {
            Arc::new(streams::InMemoryMessageStream::new())
        } else {
            let conn = redis_conn.clone().expect("redis connection manager available in non-memory mode");
            Arc::new(streams::RedisMessageStream::with_connection(conn, format!("fleet:node:{node_id}")))
        }
    });

    let node_manager = Arc::new(NodeManager::new(
        store.clone(),
        heartbeat_cache,
        config::HEARTBEAT_FRESHNESS_WINDOW,
    ));

    let chain = StrategyChain::from_names(&settings.strategy.chain, settings.strategy.label_match.load_balance);

    let scheduler = Arc::new(Scheduler::new(
        settings.node_id.clone(),
        "fleet-scheduler".to_owned(),
        store,
        scheduler_stream,
        node_stream_factory,
        node_manager,
        chain,
        scheduler::FallbackConfig {
            interval: settings.fallback.interval,
            stale_threshold: settings.fallback.stale_threshold,
        },
        settings.redis.read_count,
        settings.redis.read_timeout,
        settings.requeue.offline_threshold,
    ));

    match cli.command {
        Command::Run => {
            let ctx = CancellationToken::new();
            let shutdown = ctx.clone();
            tokio::spawn(async move {
                let _ = tokio::signal::ctrl_c().await;
                tracing::info!("received shutdown signal");
                shutdown.cancel();
            });
            scheduler.start(ctx).await?;
        }
        Command::ScheduleOnce { run_id } => {
            let outcome = scheduler.schedule_run_by_id(run_id).await?;
            println!("{outcome:?}");
        }
    }

    Ok(())
}
