use clap::{Parser, ValueEnum};
use sesh_service::{build_router, spawn_sweeper, ServiceConfig, ServiceState};
use sesh_store::StoreConfig;
use std::net::SocketAddr;
use std::time::Duration;
use tracing::info;

#[derive(Debug, Clone, Copy, ValueEnum)]
enum StoreMode {
    Auto,
    Memory,
    Postgres,
}

#[derive(Debug, Parser)]
#[command(name = "seshd", version, about = "Sesh verification and settlement service")]
struct Cli {
    /// REST socket address to bind, e.g. 127.0.0.1:8080
    #[arg(long, default_value = "127.0.0.1:8080")]
    listen: SocketAddr,
    /// Store backend. `auto` picks postgres when a database url is configured.
    #[arg(long, value_enum, default_value_t = StoreMode::Auto, env = "SESH_STORE")]
    store: StoreMode,
    /// PostgreSQL url for the durable document store.
    #[arg(long, env = "SESH_DATABASE_URL")]
    database_url: Option<String>,
    /// Max PostgreSQL pool connections.
    #[arg(long, default_value_t = 5, env = "SESH_PG_MAX_CONNECTIONS")]
    pg_max_connections: u32,
    /// Seconds between bounty expiry sweep ticks.
    #[arg(long, default_value_t = 3600, env = "SESH_SWEEP_INTERVAL_SECS")]
    sweep_interval_secs: u64,
    /// Max bounty candidates examined per sweep tick.
    #[arg(long, default_value_t = 500, env = "SESH_SWEEP_BATCH_LIMIT")]
    sweep_batch_limit: usize,
    /// Disable the periodic sweep task (manual /v1/sweep/run only).
    #[arg(long, default_value_t = false)]
    no_sweeper: bool,
}

fn resolve_store(cli: &Cli) -> anyhow::Result<StoreConfig> {
    let resolved_url = cli
        .database_url
        .clone()
        .or_else(|| std::env::var("DATABASE_URL").ok());

    let store = match cli.store {
        StoreMode::Memory => StoreConfig::Memory,
        StoreMode::Postgres => {
            let database_url = resolved_url.ok_or_else(|| {
                anyhow::anyhow!("store=postgres requires --database-url or DATABASE_URL")
            })?;
            StoreConfig::postgres(database_url, cli.pg_max_connections)
        }
        StoreMode::Auto => match resolved_url {
            Some(database_url) => StoreConfig::postgres(database_url, cli.pg_max_connections),
            None => StoreConfig::Memory,
        },
    };

    Ok(store)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "sesh_service=info,info".to_string()),
        )
        .init();

    let cli = Cli::parse();
    let config = ServiceConfig {
        store: resolve_store(&cli)?,
        sweep_interval: Duration::from_secs(cli.sweep_interval_secs.max(1)),
        sweep_batch_limit: cli.sweep_batch_limit,
    };
    let sweep_interval = config.sweep_interval;
    info!(store = config.store.label(), "bootstrapping sesh-service");

    let state = ServiceState::bootstrap(config).await?;

    if cli.no_sweeper {
        info!("periodic sweep disabled; use POST /v1/sweep/run");
    } else {
        spawn_sweeper(state.clone(), sweep_interval);
        info!(interval_secs = sweep_interval.as_secs(), "bounty expiry sweeper started");
    }

    let app = build_router(state);
    let listener = tokio::net::TcpListener::bind(cli.listen).await?;
    info!("sesh-service REST listening on {}", listener.local_addr()?);
    axum::serve(listener, app).await?;

    Ok(())
}
