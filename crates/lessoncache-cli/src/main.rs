//! Lessoncache CLI - drive the offline caching proxy from a terminal.
//!
//! Each subcommand assembles a proxy over the file-backed cache in the
//! configured cache directory, performs one operation and exits once any
//! background refreshes it started have finished.

use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use tracing::info;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use lessoncache_core::store::format_age;
use lessoncache_core::{
    CacheKey, ControlMessage, ControlReply, DeferredQueue, FileStorage, HttpFetcher, Proxy,
    ProxyConfig,
};

// ============================================================================
// Constants
// ============================================================================

/// Prefix for daily rolling log files
const LOG_FILE_PREFIX: &str = "lessoncache.log";

#[derive(Parser, Debug)]
#[command(name = "lessoncache")]
#[command(about = "Offline caching proxy for lesson content")]
#[command(version)]
struct Args {
    /// Path to config file (default: $XDG_CONFIG_HOME/lessoncache/config.json)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Also write logs to a daily rolling file in this directory
    #[arg(long, global = true)]
    log_dir: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Install the configured version and activate it
    Install {
        /// Wait for sessions held by older versions instead of taking over
        #[arg(long)]
        wait: bool,
    },
    /// Serve one GET request through the proxy
    Fetch {
        /// URL or path relative to the origin
        url: String,

        /// Treat as a page navigation
        #[arg(long)]
        navigate: bool,

        /// Write the body here instead of stdout
        #[arg(short, long)]
        output: Option<PathBuf>,
    },
    /// Print the current version
    Version,
    /// Delete every cached generation
    Clear,
    /// Fetch one resource into the cache
    Prewarm { url: String },
    /// Send a raw control message, e.g. '{"type":"GetVersion"}'
    Control { message: String },
    /// List cached generations
    Generations,
    /// List entries in a generation (default: current)
    Entries { generation: Option<String> },
    /// Queue a JSON record for deferred delivery
    Enqueue { payload: String },
    /// Deliver queued records to the sync endpoint
    Sync,
}

/// Initialize the tracing subscriber for logging
fn init_tracing(log_dir: Option<&Path>) -> Option<WorkerGuard> {
    // Use RUST_LOG env var to control log level (e.g., RUST_LOG=debug)
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));

    let (file_layer, guard) = match log_dir {
        Some(dir) => {
            let appender = tracing_appender::rolling::daily(dir, LOG_FILE_PREFIX);
            let (writer, guard) = tracing_appender::non_blocking(appender);
            (
                Some(fmt::layer().with_writer(writer).with_ansi(false)),
                Some(guard),
            )
        }
        None => (None, None),
    };

    tracing_subscriber::registry()
        .with(fmt::layer().with_writer(io::stderr))
        .with(file_layer)
        .with(filter)
        .init();

    guard
}

#[tokio::main]
async fn main() -> Result<()> {
    // Load .env file if present (silently ignore if not found)
    let _ = dotenvy::dotenv();

    let args = Args::parse();
    let _guard = init_tracing(args.log_dir.as_deref());

    let config = ProxyConfig::load(args.config.as_deref()).context("Failed to load config")?;
    let proxy = build_proxy(config).await?;
    info!(version = %proxy.config().version, "Lessoncache starting");

    let result = run(&proxy, args.command).await;

    // Let revalidation and prewarm tasks finish before exiting
    proxy.tasks().wait_idle().await;
    result
}

async fn build_proxy(config: ProxyConfig) -> Result<Proxy> {
    let generations = config.generations_dir()?;
    let storage = FileStorage::new(&generations)
        .with_context(|| format!("Failed to open cache at {}", generations.display()))?;
    let fetcher = HttpFetcher::new().context("Failed to build HTTP client")?;

    let queue_path = config.queue_path()?;
    let queue = DeferredQueue::open(&queue_path)
        .await
        .with_context(|| format!("Failed to open queue at {}", queue_path.display()))?;

    Ok(Proxy::open(config, Arc::new(storage), Arc::new(fetcher), queue).await?)
}

async fn run(proxy: &Proxy, command: Command) -> Result<()> {
    match command {
        Command::Install { wait } => {
            if !wait {
                proxy.state().skip_waiting();
            }
            let report = proxy
                .run_lifecycle()
                .await
                .context("Installation failed")?;
            println!("Installed and activated {}", proxy.config().version);
            for generation in &report.deleted {
                println!("  removed {}", generation);
            }
            for generation in &report.failed {
                eprintln!("  could not remove {} (will retry on next activation)", generation);
            }
        }
        Command::Fetch {
            url,
            navigate,
            output,
        } => {
            let result = proxy.get(&url, navigate).await?;
            let age = result
                .cached_at
                .map(|at| format!(", cached {}", format_age(at)))
                .unwrap_or_default();
            eprintln!("{} ({}{})", result.response.status, result.source, age);

            match output {
                Some(path) => std::fs::write(&path, &result.response.body)
                    .with_context(|| format!("Failed to write {}", path.display()))?,
                None => io::stdout().write_all(&result.response.body)?,
            }
        }
        Command::Version => {
            let reply = proxy.control().request(ControlMessage::GetVersion).await?;
            print_json(&reply)?;
        }
        Command::Clear => {
            let reply = proxy.control().request(ControlMessage::ClearCache).await?;
            print_json(&reply)?;
            if let ControlReply::Cleared { success: false, error } = reply {
                bail!("Clear failed: {}", error.unwrap_or_default());
            }
        }
        Command::Prewarm { url } => {
            let url = proxy.resolve(&url)?;
            proxy
                .control()
                .request(ControlMessage::PrewarmResource { url: url.clone() })
                .await?;
            proxy.tasks().wait_idle().await;

            if proxy.engine().store().lookup(&CacheKey::get(&url)).await.is_none() {
                bail!("Prewarm of {} failed, see logs", url);
            }
            println!("Prewarmed {}", url);
        }
        Command::Control { message } => match proxy.control().post_json(&message).await? {
            Some(reply) => print_json(&reply)?,
            None => eprintln!("Message ignored"),
        },
        Command::Generations => {
            let storage = proxy.engine().store().storage();
            let current = proxy.state().current_generation();
            for generation in storage.generations().await? {
                let marker = if current.as_deref() == Some(generation.as_str()) {
                    "*"
                } else {
                    " "
                };
                println!("{} {}", marker, generation);
            }
        }
        Command::Entries { generation } => {
            let storage = proxy.engine().store().storage();
            let generation = generation
                .or_else(|| proxy.state().current_generation())
                .unwrap_or_else(|| proxy.config().version.clone());
            for key in storage.keys(&generation).await? {
                if let Some(entry) = storage.get(&generation, &key).await? {
                    println!(
                        "{:>3}  {:>8}  {:>9}  {}",
                        entry.response.status,
                        entry.response.body.len(),
                        entry.age_display(),
                        key
                    );
                }
            }
        }
        Command::Enqueue { payload } => {
            let payload = serde_json::from_str(&payload).context("Payload is not valid JSON")?;
            let record = proxy.enqueue(payload).await?;
            println!("Queued record {} ({} pending)", record.id, proxy.queue().len().await);
        }
        Command::Sync => {
            let outcome = proxy.sync().await?;
            print_json(&outcome)?;
        }
    }
    Ok(())
}

fn print_json<T: serde::Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}
