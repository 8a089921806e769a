//! watcher CLI: runs the change controller over a directory of files.

use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use clap::{Parser, Subcommand};
use tokio_util::sync::CancellationToken;
use tracing::info;
use watcher_base::cache::Indexer;
use watcher_base::config::Config;
use watcher_base::controller::{Controller, Handler, HandlerContext};
use watcher_base::informer::ListWatchInformer;
use watcher_base::model::{Action, Change};
use watcher_base::queue::RateLimitingQueue;
use watcher_base::source::{DirectoryListWatch, FileObject};
use watcher_base::telemetry::{TelemetryConfig, init_telemetry};

#[derive(Parser)]
#[command(name = "watcher", about = "Reconcile changes to a directory of files")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Watch a directory and log every change through the controller
    Watch {
        /// Directory whose regular files are the watched resources
        #[arg(long)]
        dir: PathBuf,
        /// Number of parallel workers (overrides config)
        #[arg(long)]
        workers: Option<usize>,
        /// Directory poll interval in milliseconds (overrides config)
        #[arg(long)]
        poll_ms: Option<u64>,
    },
    /// Print the effective configuration as TOML
    Config,
}

/// Logs each change together with the cached file it refers to.
struct LogHandler;

#[async_trait]
impl Handler<FileObject> for LogHandler {
    async fn process_item(
        &self,
        ctx: &HandlerContext<FileObject>,
        change: &Change,
    ) -> Vec<anyhow::Error> {
        match ctx.get(&change.key) {
            Some(file) => {
                let json = match serde_json::to_string(file.as_ref()) {
                    Ok(json) => json,
                    Err(e) => return vec![e.into()],
                };
                info!(action = %change.action, key = %change.key, file = %json, "file reconciled");
            }
            None if change.action == Action::Delete => {
                info!(key = %change.key, "file deleted");
            }
            None => {
                // Gone again before we got to it; the delete change follows.
                info!(action = %change.action, key = %change.key, "file no longer cached");
            }
        }
        Vec::new()
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();
    let mut config = Config::from_env()?;

    match cli.command {
        Command::Watch {
            dir,
            workers,
            poll_ms,
        } => {
            if let Some(workers) = workers {
                config.workers = workers;
            }
            if let Some(poll_ms) = poll_ms {
                config.poll_interval_ms = poll_ms;
            }
            config.validate()?;
            cmd_watch(config, dir).await
        }
        Command::Config => {
            print!("{}", toml::to_string_pretty(&config)?);
            Ok(())
        }
    }
}

async fn cmd_watch(config: Config, dir: PathBuf) -> anyhow::Result<()> {
    let _guard = init_telemetry(TelemetryConfig {
        endpoint: config.otel_endpoint.clone(),
        service_name: "watcher".to_string(),
        log_level: config.log_level.clone(),
    })?;

    let queue = Arc::new(RateLimitingQueue::new(Box::new(config.rate_limit.build())));
    let indexer = Arc::new(Indexer::new(FileObject::key));
    let source = Arc::new(DirectoryListWatch::new(&dir, config.poll_interval()));
    let informer = Arc::new(ListWatchInformer::new(
        source,
        Arc::clone(&indexer),
        Arc::clone(&queue),
    ));

    let mut controller = Controller::new(queue, indexer, informer);
    controller.set_handler(Arc::new(LogHandler));

    let shutdown = CancellationToken::new();
    let signal = shutdown.clone();
    tokio::spawn(async move {
        tokio::signal::ctrl_c().await.ok();
        signal.cancel();
    });

    info!(dir = %dir.display(), workers = config.workers, "watching directory");
    controller.run(config.workers, shutdown).await?;
    Ok(())
}
