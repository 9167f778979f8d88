mod breaker;
mod config;
mod dedup;
mod driver;
mod ledger;
mod models;
mod orchestrator;
mod profile;
mod ratelimit;
mod report;
mod score;
mod source;
mod worker;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::info;

use config::SessionConfig;
use driver::{DriverFactory, InteractionPacing, WebDriverFactory};
use ledger::Ledger;
use models::ApplicationState;
use orchestrator::Orchestrator;
use profile::{JsonProfileSource, ProfileSource};
use source::{HttpFeedAdapter, SourceAdapter};

#[derive(Parser)]
#[command(name = "jobpilot")]
#[command(about = "Job application orchestration - discover, score, and submit")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Initialize the application ledger
    Init {
        /// Ledger database path (defaults to the per-user data directory)
        #[arg(long)]
        db: Option<PathBuf>,
    },

    /// Run one orchestration session
    Run {
        /// Path to the session configuration file
        config: PathBuf,
    },

    /// List application records
    List {
        /// Filter by state (discovered, scored, queued, in_progress,
        /// submitted, failed, skipped, needs_review)
        #[arg(short, long)]
        state: Option<String>,

        /// Profile id to list records for
        #[arg(short, long)]
        profile: String,

        /// Ledger database path
        #[arg(long)]
        db: Option<PathBuf>,
    },

    /// Show one record with its full transition history
    Show {
        /// Record ID
        id: i64,

        /// Ledger database path
        #[arg(long)]
        db: Option<PathBuf>,
    },
}

const DEFAULT_WEBDRIVER_URL: &str = "http://localhost:9515";

async fn run_session(config_path: &PathBuf) -> Result<()> {
    let config = SessionConfig::load(config_path)?;
    let profile = JsonProfileSource
        .parse_profile(&config.profile_path)
        .context("Failed to load candidate profile")?;

    let ledger = Ledger::open(config.db_path.as_deref())?;
    ledger.init()?;
    let ledger = Arc::new(ledger);

    let client = reqwest::Client::new();
    let adapters: Vec<Arc<dyn SourceAdapter>> = config
        .sources
        .iter()
        .map(|s| {
            Arc::new(HttpFeedAdapter::new(
                s.id.clone(),
                s.feed_url.clone(),
                s.supports_direct_apply,
                client.clone(),
            )) as Arc<dyn SourceAdapter>
        })
        .collect();

    let webdriver_url = config
        .webdriver_url
        .clone()
        .unwrap_or_else(|| DEFAULT_WEBDRIVER_URL.to_string());
    let drivers: Arc<dyn DriverFactory> = Arc::new(WebDriverFactory::new(
        webdriver_url,
        InteractionPacing::new(&config.pacing),
        config.output_dir.join("screenshots"),
    ));

    let cancel = CancellationToken::new();
    {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                info!("interrupt received, cancelling session");
                cancel.cancel();
            }
        });
    }

    let orchestrator = Orchestrator::new(config, profile, ledger, adapters, drivers, cancel);
    let report = orchestrator.run().await?;
    report.print_summary();
    Ok(())
}

fn list_records(state: Option<&str>, profile_id: &str, db: Option<&PathBuf>) -> Result<()> {
    let ledger = Ledger::open(db.map(|p| p.as_path()))?;
    ledger.ensure_initialized()?;
    let records = match state {
        Some(s) => {
            let state = ApplicationState::parse(s)
                .with_context(|| format!("Unknown state '{s}'"))?;
            ledger.records_in_state(profile_id, state)?
        }
        None => ledger.list_records(profile_id)?,
    };
    if records.is_empty() {
        println!("No records found.");
        return Ok(());
    }
    println!(
        "{:<6} {:<13} {:<28} {:<20} {:<10} {:>6} {:>9}",
        "ID", "STATE", "TITLE", "ORGANIZATION", "SOURCE", "SCORE", "ATTEMPTS"
    );
    println!("{}", "-".repeat(98));
    for rec in records {
        println!(
            "{:<6} {:<13} {:<28} {:<20} {:<10} {:>6.1} {:>9}",
            rec.id,
            rec.state.as_str(),
            truncate(&rec.title, 26),
            truncate(&rec.organization, 18),
            truncate(&rec.source_id, 10),
            rec.score,
            rec.attempts
        );
    }
    Ok(())
}

fn show_record(id: i64, db: Option<&PathBuf>) -> Result<()> {
    let ledger = Ledger::open(db.map(|p| p.as_path()))?;
    ledger.ensure_initialized()?;
    let Some(rec) = ledger.get_record(id)? else {
        println!("Record #{} not found.", id);
        return Ok(());
    };
    println!("Record #{}", rec.id);
    println!("Title: {}", rec.title);
    println!("Organization: {}", rec.organization);
    println!("Source: {}", rec.source_id);
    println!("URL: {}", rec.url);
    println!("State: {}", rec.state.as_str());
    println!("Score: {:.1} ({})", rec.score, rec.tier.as_str());
    println!("Attempts: {}", rec.attempts);
    if let Some(kind) = rec.last_error {
        println!("Last error: {}", kind.as_str());
    }
    if let Some(conf) = &rec.confirmation_id {
        println!("Confirmation: {}", conf);
    }
    if let Some(shot) = &rec.screenshot {
        println!("Screenshot: {}", shot);
    }
    println!("Created: {}", rec.created_at);

    let transitions = ledger.transitions_for_record(rec.id)?;
    if !transitions.is_empty() {
        println!("\nHistory:");
        for t in transitions {
            let error = t
                .error_kind
                .map(|k| format!(" [{}]", k.as_str()))
                .unwrap_or_default();
            let note = t.note.map(|n| format!(" ({n})")).unwrap_or_default();
            println!(
                "  {} {} -> {}{}{}",
                t.at,
                t.from_state.as_str(),
                t.to_state.as_str(),
                error,
                note
            );
        }
    }
    Ok(())
}

fn truncate(s: &str, max: usize) -> String {
    if s.chars().count() <= max {
        s.to_string()
    } else {
        let cut: String = s.chars().take(max.saturating_sub(1)).collect();
        format!("{}…", cut)
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt::init();
    let cli = Cli::parse();

    match cli.command {
        Commands::Init { db } => {
            let ledger = Ledger::open(db.as_deref())?;
            ledger.init()?;
            println!("Ledger initialized at {}", ledger.path().display());
        }

        Commands::Run { config } => {
            run_session(&config).await?;
        }

        Commands::List { state, profile, db } => {
            list_records(state.as_deref(), &profile, db.as_ref())?;
        }

        Commands::Show { id, db } => {
            show_record(id, db.as_ref())?;
        }
    }

    Ok(())
}
