use clap::{Parser, ValueEnum};
use escrow_core::{ReleaseWindowConfig, RetryPolicy, StorageConfig, WorkflowConfig};
use escrow_service::{build_router, spawn_scheduler, ServiceConfig, ServiceState};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;
use tracing::{info, warn};

#[derive(Debug, Clone, Copy, ValueEnum)]
enum StorageMode {
    Auto,
    Memory,
    Postgres,
}

#[derive(Debug, Parser)]
#[command(name = "escrowd", version, about = "Milestone escrow REST service")]
struct Cli {
    /// REST socket address to bind, e.g. 127.0.0.1:8092
    #[arg(long, default_value = "127.0.0.1:8092")]
    listen: SocketAddr,
    /// File used to persist the release retry queue.
    #[arg(long, default_value = "escrow/data/releases.json")]
    release_queue: PathBuf,
    /// Persistence backend. `auto` picks postgres when a database url is configured.
    #[arg(long, value_enum, default_value_t = StorageMode::Auto, env = "ESCROW_STORAGE")]
    storage: StorageMode,
    /// PostgreSQL url for escrows, milestones and the transition journal.
    #[arg(long, env = "ESCROW_DATABASE_URL")]
    database_url: Option<String>,
    #[arg(long, default_value_t = 5, env = "ESCROW_PG_MAX_CONNECTIONS")]
    pg_max_connections: u32,
    /// Days a submitted milestone waits before it is auto-approved.
    #[arg(long, default_value_t = 7)]
    release_window_days: i64,
    /// Per-contract-type window override, e.g. `--contract-window hourly=3`. Repeatable.
    #[arg(long = "contract-window", value_parser = parse_contract_window)]
    contract_windows: Vec<(String, i64)>,
    /// Seconds between scheduler passes.
    #[arg(long, default_value_t = 60)]
    tick_interval_secs: u64,
    #[arg(long, default_value_t = 30)]
    retry_base_secs: i64,
    #[arg(long, default_value_t = 3_600)]
    retry_max_secs: i64,
    /// Shared secret for funding callbacks and release listings. Those routes stay closed without it.
    #[arg(long, env = "ESCROW_SERVICE_TOKEN", hide_env_values = true)]
    service_token: Option<String>,
    /// Failed attempts before a pending release is flagged for an operator.
    #[arg(long, default_value_t = 10)]
    escalate_after: u32,
}

fn parse_contract_window(raw: &str) -> Result<(String, i64), String> {
    let (kind, days) = raw
        .split_once('=')
        .ok_or_else(|| format!("expected TYPE=DAYS, got '{raw}'"))?;
    let kind = kind.trim();
    if kind.is_empty() {
        return Err("contract type cannot be empty".to_string());
    }
    let days: i64 = days
        .trim()
        .parse()
        .map_err(|_| format!("invalid day count in '{raw}'"))?;
    if days <= 0 {
        return Err(format!("window for '{kind}' must be positive"));
    }
    Ok((kind.to_string(), days))
}

fn resolve_storage(cli: &Cli) -> anyhow::Result<StorageConfig> {
    let resolved_url = cli
        .database_url
        .clone()
        .or_else(|| std::env::var("DATABASE_URL").ok());

    let storage = match cli.storage {
        StorageMode::Memory => StorageConfig::memory(),
        StorageMode::Postgres => {
            let database_url = resolved_url.ok_or_else(|| {
                anyhow::anyhow!("storage=postgres requires --database-url or DATABASE_URL")
            })?;
            StorageConfig::postgres(database_url, cli.pg_max_connections)
        }
        StorageMode::Auto => match resolved_url {
            Some(database_url) => StorageConfig::postgres(database_url, cli.pg_max_connections),
            None => StorageConfig::memory(),
        },
    };

    Ok(storage)
}

fn workflow_config(cli: &Cli) -> anyhow::Result<WorkflowConfig> {
    if cli.release_window_days <= 0 {
        anyhow::bail!("--release-window-days must be positive");
    }
    if cli.retry_base_secs <= 0 || cli.retry_max_secs < cli.retry_base_secs {
        anyhow::bail!("retry delays must satisfy 0 < base <= max");
    }

    let mut release_windows =
        ReleaseWindowConfig::new(chrono::Duration::days(cli.release_window_days));
    for (kind, days) in &cli.contract_windows {
        release_windows = release_windows.with_override(kind.clone(), chrono::Duration::days(*days));
    }

    Ok(WorkflowConfig {
        release_windows,
        retry_policy: RetryPolicy {
            base_delay: chrono::Duration::seconds(cli.retry_base_secs),
            max_delay: chrono::Duration::seconds(cli.retry_max_secs),
            escalate_after: cli.escalate_after,
        },
        storage: resolve_storage(cli)?,
        ..WorkflowConfig::default()
    })
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "escrow_service=info,info".to_string()),
        )
        .init();

    let cli = Cli::parse();
    let tick_interval = Duration::from_secs(cli.tick_interval_secs.max(1));
    let config = ServiceConfig {
        queue_path: cli.release_queue.clone(),
        tick_interval,
        service_token: cli.service_token.clone(),
        workflow: workflow_config(&cli)?,
    };
    if config.service_token.is_none() {
        warn!("no service token configured; funding callbacks and release listings are disabled");
    }
    let state = ServiceState::bootstrap(config).await?;
    let app = build_router(state.clone());

    let scheduler = spawn_scheduler(state, tick_interval);

    let listener = tokio::net::TcpListener::bind(cli.listen).await?;
    info!("escrow-service REST listening on {}", listener.local_addr()?);

    let served = axum::serve(listener, app).await;
    scheduler.abort();
    served?;
    Ok(())
}
