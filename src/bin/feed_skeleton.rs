//! Compose one feed page from a database file and print the response JSON
//!
//! Usage:
//!   cargo run --bin feed_skeleton -- --limit 30
//!   cargo run --bin feed_skeleton -- --cursor '<cursor from previous page>'

use anyhow::{Context, Result};
use clap::Parser;
use skyfeed::config::FeedgenConfig;
use skyfeed::feed::{ComposerSettings, FeedComposer, FeedService};
use skyfeed::store::SqlitePostStore;
use std::path::PathBuf;
use std::sync::Arc;

#[derive(Parser)]
#[command(name = "feed_skeleton", about = "Print one page of the feed skeleton")]
struct Cli {
    /// Database file (defaults to FEEDGEN_DB_PATH)
    #[arg(long)]
    db: Option<PathBuf>,

    /// Cursor returned by the previous page
    #[arg(long)]
    cursor: Option<String>,

    #[arg(long, default_value_t = 30, allow_negative_numbers = true)]
    limit: i64,

    /// Requester DID recorded in the request log
    #[arg(long)]
    requester: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenv::dotenv().ok();
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("warn"))
        .target(env_logger::Target::Stderr)
        .init();

    let cli = Cli::parse();
    let config = FeedgenConfig::from_env().context("invalid configuration")?;
    let db_path = cli.db.unwrap_or(config.db_path);

    let store = Arc::new(
        SqlitePostStore::open(&db_path)
            .with_context(|| format!("failed to open {}", db_path.display()))?,
    );
    let settings = ComposerSettings {
        ranked_window: chrono::Duration::hours(config.trending_window_hours),
        min_interactions: config.trending_min_interactions,
        ..ComposerSettings::default()
    };
    let service = FeedService::new(FeedComposer::new(store.clone(), settings), store);

    let response = service
        .skeleton(cli.cursor.as_deref(), cli.limit, cli.requester.as_deref())
        .await;
    println!("{}", serde_json::to_string_pretty(&response)?);
    Ok(())
}
