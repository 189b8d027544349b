//! View server daemon.
//!
//! Reads upstream grid events as JSON lines on stdin and serves views to
//! WebSocket subscribers at `ws://{bind}{prefix}/{user}/{view}`.

use clap::{Parser, ValueEnum};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::mpsc;
use viewserver_core::Budget;
use viewserver_sync::{
    ApplyPolicy, SeedPolicy, ServerConfig, ServiceConfig, SnapshotConfig, ViewServer, ViewService,
};

/// In-memory grid view server
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Address to bind the WebSocket listener to
    #[arg(long, default_value = "127.0.0.1:8080")]
    bind: String,

    /// Path prefix in front of /{user}/{view}
    #[arg(long, default_value = "/ws/grid")]
    path_prefix: String,

    /// Rows of a newly created view
    #[arg(long, default_value_t = 10_000)]
    rows: u32,

    /// Columns of a newly created view
    #[arg(long, default_value_t = 100)]
    columns: u32,

    /// Maximum number of live views
    #[arg(long, default_value_t = 100)]
    max_views: usize,

    /// Cells per snapshot chunk
    #[arg(long, default_value_t = 1000)]
    chunk_size: usize,

    /// Pause between snapshot chunks in milliseconds (0 disables)
    #[arg(long, default_value_t = 5)]
    chunk_pause_ms: u64,

    /// Changes per outbound update frame
    #[arg(long, default_value_t = Budget::EGRESS.max_count)]
    egress_max_count: usize,

    /// Outbound frames buffered per connection before it is dropped
    #[arg(long, default_value_t = 4096)]
    outbound_buffer: usize,

    /// Whether batches for unobserved views are applied
    #[arg(long, value_enum, default_value_t = ApplyMode::Always)]
    apply: ApplyMode,

    /// Fill new views with a demo pattern
    #[arg(long)]
    seed_demo: bool,

    /// Do not read events from stdin
    #[arg(long)]
    no_stdin: bool,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum ApplyMode {
    Always,
    OnlyWhenObserved,
}

impl From<ApplyMode> for ApplyPolicy {
    fn from(mode: ApplyMode) -> Self {
        match mode {
            ApplyMode::Always => ApplyPolicy::Always,
            ApplyMode::OnlyWhenObserved => ApplyPolicy::OnlyWhenObserved,
        }
    }
}

impl Args {
    fn service_config(&self) -> ServiceConfig {
        ServiceConfig {
            default_rows: self.rows,
            default_columns: self.columns,
            max_views: self.max_views,
            snapshot: SnapshotConfig {
                chunk_size: self.chunk_size,
                chunk_pause: (self.chunk_pause_ms > 0)
                    .then(|| Duration::from_millis(self.chunk_pause_ms)),
            },
            egress_budget: Budget {
                max_count: self.egress_max_count,
                ..Budget::EGRESS
            },
            apply_policy: self.apply.into(),
            seed_policy: if self.seed_demo {
                SeedPolicy::DemoPattern
            } else {
                SeedPolicy::Empty
            },
            ..ServiceConfig::default()
        }
    }

    fn server_config(&self) -> ServerConfig {
        ServerConfig {
            bind_addr: self.bind.clone(),
            path_prefix: self.path_prefix.clone(),
            outbound_buffer: self.outbound_buffer,
        }
    }
}

/// Forward stdin lines to the ingestion channel until EOF.
async fn read_stdin(tx: mpsc::Sender<String>) {
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        match lines.next_line().await {
            Ok(Some(line)) if line.trim().is_empty() => continue,
            Ok(Some(line)) => {
                if tx.send(line).await.is_err() {
                    break;
                }
            }
            Ok(None) => {
                log::info!("Event input reached end of stream");
                break;
            }
            Err(e) => {
                log::error!("Failed to read event input: {e}");
                break;
            }
        }
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let args = Args::parse();
    log::info!("Starting view server {}", env!("CARGO_PKG_VERSION"));

    let service = Arc::new(ViewService::new(args.service_config()));

    if !args.no_stdin {
        let (tx, rx) = mpsc::channel(1024);
        tokio::spawn(service.ingestion().clone().run(rx));
        tokio::spawn(read_stdin(tx));
    }

    let server = ViewServer::new(args.server_config(), service.clone());
    tokio::select! {
        result = server.run() => result?,
        _ = tokio::signal::ctrl_c() => {
            let stats = service.stats();
            log::info!(
                "Shutting down: {} views, {} cells, {} subscribers, {} events processed",
                stats.grids.view_count,
                stats.grids.total_cells,
                stats.sessions.active_handles,
                stats.processing.total_messages
            );
        }
    }
    Ok(())
}
