use std::collections::HashSet;
use std::path::{Path, PathBuf};

use anyhow::Context;
use clap::Parser;
use tracing::info;
use tracing_subscriber::EnvFilter;

use announce_core::backend::{DEFAULT_CHOICE, SUPPORTED_CHOICES};
use announce_core::config::Config;
use announce_core::fetch::{PageFetcher, SearchFilters};
use announce_core::ingest::{ingest, IngestRequest};

/// Fetch open startup-support announcements and optionally filter them with an AI
/// backend. The report is printed to stdout as JSON.
#[derive(Debug, Parser)]
#[command(name = "announce-ingest", version)]
struct Args {
    /// Natural-language condition the announcements must satisfy.
    #[arg(long)]
    condition: Option<String>,

    /// Backend choice, `platform-modelVariant`.
    #[arg(long, default_value = DEFAULT_CHOICE)]
    model: String,

    #[arg(long)]
    region: Option<String>,

    #[arg(long)]
    startup_period: Option<String>,

    #[arg(long)]
    target_age: Option<String>,

    /// Page size; overrides PER_PAGE_FOR_API.
    #[arg(long)]
    per_page: Option<u32>,

    /// JSON array of serial numbers that are already stored.
    #[arg(long)]
    known_serials: Option<PathBuf>,

    /// Print the supported backend choices and exit.
    #[arg(long)]
    list_models: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::from_default_env().add_directive(tracing::Level::INFO.into()),
        )
        .with_writer(std::io::stderr)
        .with_ansi(false)
        .init();

    let args = Args::parse();
    if args.list_models {
        for choice in SUPPORTED_CHOICES {
            println!("{choice}");
        }
        return Ok(());
    }

    dotenvy::dotenv().ok();
    let config = Config::from_env().context("loading configuration")?;
    info!(
        base_url = %config.upstream.base_url,
        per_page = config.upstream.per_page,
        item_cap = ?config.upstream.item_cap,
        openai = config.ai.openai.is_some(),
        gemini = config.ai.gemini.is_some(),
        "configuration loaded"
    );

    let known = match &args.known_serials {
        Some(path) => load_known_serials(path)?,
        None => HashSet::new(),
    };

    let mut request = IngestRequest::new(&config.upstream, &config.ai);
    request.filters = SearchFilters {
        region: args.region,
        startup_period: args.startup_period,
        target_age: args.target_age,
    };
    if let Some(per_page) = args.per_page.filter(|n| *n > 0) {
        request.per_page = per_page;
    }
    request.condition = args.condition;
    request.choice = args.model;

    let source = PageFetcher::new(&config.upstream)?;
    let report = ingest(&source, &known, &config.ai, &request)
        .await
        .context("no announcements could be fetched")?;

    println!("{}", serde_json::to_string_pretty(&report)?);
    Ok(())
}

fn load_known_serials(path: &Path) -> anyhow::Result<HashSet<String>> {
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("reading {}", path.display()))?;
    let serials: Vec<String> = serde_json::from_str(&raw)
        .with_context(|| format!("{} is not a JSON array of strings", path.display()))?;
    info!(path = %path.display(), count = serials.len(), "loaded known serial numbers");
    Ok(serials.into_iter().collect())
}
