//! Channelmux CLI - tail a real-time feed from the terminal.
//!
//! Every view change is printed to stdout as one JSON line; logs go to
//! stderr (or `CHANNELMUX_LOG_FILE`). Ctrl-C unsubscribes and exits.

use anyhow::{Context, Result};
use channelmux::{ChatFeed, Config, Feed, RealtimeClient};
use clap::{Parser, Subcommand};
use serde::Serialize;

// CLI
#[derive(Parser)]
#[command(name = "channelmux")]
#[command(version)]
#[command(about = "Resilient multiplexed real-time channel client")]
struct Cli {
    /// Real-time endpoint (overrides config and CHANNELMUX_BASE_URL)
    #[arg(long, global = true)]
    base_url: Option<String>,
    /// Bearer token (overrides CHANNELMUX_TOKEN)
    #[arg(long, global = true)]
    token: Option<String>,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Follow a chat room
    Chat {
        /// Room id
        room: String,
        /// Send this message once connected
        #[arg(long)]
        send: Option<String>,
        /// Load this many history messages first
        #[arg(long)]
        history: Option<usize>,
    },
    /// Follow the payment event stream
    Payments,
    /// Follow who is online
    Presence,
    /// Follow live fleet positions
    Fleet,
    /// Follow a support thread (REST polling)
    Support {
        /// Thread id
        thread: String,
        /// Post this message before following
        #[arg(long)]
        send: Option<String>,
    },
}

#[derive(Serialize)]
struct ViewLine<'a, T> {
    status: String,
    count: usize,
    items: &'a [T],
}

fn init_logging() -> Result<()> {
    let mut builder =
        env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"));
    if let Ok(path) = std::env::var("CHANNELMUX_LOG_FILE") {
        let log_file = std::fs::File::create(&path)
            .with_context(|| format!("Failed to create log file at {path}"))?;
        builder.target(env_logger::Target::Pipe(Box::new(log_file)));
    }
    builder.format_timestamp_secs().init();
    Ok(())
}

/// Print the view of `feed` on every change until Ctrl-C.
async fn follow<F>(feed: &F) -> Result<()>
where
    F: Feed,
    F::Item: Serialize,
{
    let mut changes = feed.changes();
    print_view(feed)?;
    loop {
        tokio::select! {
            changed = changes.changed() => {
                if changed.is_err() {
                    break;
                }
                print_view(feed)?;
            }
            _ = tokio::signal::ctrl_c() => {
                log::info!("[Cli] Interrupted");
                break;
            }
        }
    }
    Ok(())
}

fn print_view<F>(feed: &F) -> Result<()>
where
    F: Feed,
    F::Item: Serialize,
{
    let items = feed.items();
    let line = ViewLine {
        status: feed.status().to_string(),
        count: items.len(),
        items: &items,
    };
    println!("{}", serde_json::to_string(&line)?);
    Ok(())
}

/// Wait until `feed` is live, then send `text`.
async fn send_when_live<F: ChatFeed>(feed: &F, text: &str) -> Result<()> {
    let mut changes = feed.changes();
    while feed.status() != channelmux::FeedStatus::Live {
        changes
            .changed()
            .await
            .context("Feed closed before it went live")?;
    }
    let status = feed.send_text(text).await?;
    log::info!("[Cli] Send: {:?}", status);
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    init_logging()?;
    let cli = Cli::parse();

    let mut config = Config::load()?;
    if let Some(base_url) = cli.base_url {
        config.base_url = base_url;
    }
    if let Some(token) = cli.token {
        config.token = Some(token).filter(|t| !t.is_empty());
    }
    log::debug!("[Cli] {:?}", config);

    let client = RealtimeClient::from_config(&config)?;

    match cli.command {
        Commands::Chat {
            room,
            send,
            history,
        } => {
            let feed = client.room(&room)?;
            if let Some(limit) = history {
                if let Err(e) = feed.load_history(client.rest(), limit).await {
                    log::warn!("[Cli] History load failed: {:#}", e);
                }
            }
            if let Some(text) = send {
                send_when_live(&feed, &text).await?;
            }
            follow(&feed).await?;
        }
        Commands::Payments => follow(&client.payments()?).await?,
        Commands::Presence => follow(&client.presence()?).await?,
        Commands::Fleet => follow(&client.fleet_live()?).await?,
        Commands::Support { thread, send } => {
            let feed = client.support_thread(&thread)?;
            if let Some(text) = send {
                feed.send_text(&text).await?;
            }
            follow(&feed).await?;
        }
    }

    // Shutdown
    client.shutdown();
    Ok(())
}
