mod config;
mod db;
mod detail;
mod error;
mod fetch;
mod listing;
mod model;
mod parser;
mod pipeline;
mod store;

use std::time::Instant;

use anyhow::Context;
use clap::{Parser, Subcommand};
use indicatif::{ProgressBar, ProgressStyle};

use config::{Settings, StoreCredentials, StoreKind};
use detail::DetailFetcher;
use fetch::HttpFetcher;
use listing::Paginator;
use pipeline::Pipeline;
use store::{Backend, Filter, IngestionStore, LocalStore, SupabaseStore, TableStore};

const STATS_SAMPLE: usize = 10;

#[derive(Parser)]
#[command(name = "company_harvester", about = "Incremental company directory harvester")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Walk the listing pages, enrich each company and insert the new ones
    Run {
        /// First listing page to fetch (1-based)
        #[arg(short = 'p', long, conflicts_with = "resume")]
        start_page: Option<u32>,
        /// Continue after the last checkpointed page
        #[arg(short, long)]
        resume: bool,
        /// Table store backend (overrides settings)
        #[arg(short, long, value_enum)]
        store: Option<StoreKind>,
    },
    /// Retry pages and inserts that failed in earlier runs
    Retry {
        #[arg(short, long, value_enum)]
        store: Option<StoreKind>,
    },
    /// Show how much of the directory is stored
    Stats {
        #[arg(short, long, value_enum)]
        store: Option<StoreKind>,
    },
    /// Check that the page parameter really paginates the listing
    CheckPagination {
        #[arg(short, long, default_value = "1")]
        page: u32,
    },
    /// Fetch one detail page and print the fields it yields
    Inspect {
        url: String,
    },
    /// Delete one company row so a later run ingests it again
    Forget {
        name: String,
        #[arg(short, long, value_enum)]
        store: Option<StoreKind>,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .init();

    let t0 = Instant::now();
    let cli = Cli::parse();
    let settings = Settings::load().context("loading settings")?;

    let result = match cli.command {
        Commands::Run { start_page, resume, store } => {
            let backend = open_backend(&settings, store)?;
            let state = db::connect(&settings.db_path)?;
            let start = match (start_page, resume) {
                (Some(page), _) => page,
                (None, true) => db::load_checkpoint(&state, db::LISTING_RUN_KEY)?
                    .map_or(1, |page| page + 1),
                (None, false) => 1,
            };

            let mut pipeline = build_pipeline(&settings, backend, state)?;
            let report = pipeline.run(start).await;
            println!("Scraping completed!");
            report.print();
            Ok(())
        }
        Commands::Retry { store } => {
            let backend = open_backend(&settings, store)?;
            let state = db::connect(&settings.db_path)?;
            let (pages, inserts) = db::count_dead_letters(&state)?;
            if pages + inserts == 0 {
                println!("Nothing to retry.");
                return Ok(());
            }
            println!("Retrying {} pages and {} inserts...", pages, inserts);
            let mut pipeline = build_pipeline(&settings, backend, state)?;
            let report = pipeline.retry_dead_letters().await?;
            report.print();
            Ok(())
        }
        Commands::Stats { store } => {
            let backend = open_backend(&settings, store)?;
            print_stats(&backend, &settings).await
        }
        Commands::CheckPagination { page } => {
            let paginator = Paginator::new(HttpFetcher::new(&settings)?, &settings);
            let check = paginator.check_pagination(page.max(1)).await?;
            println!(
                "{}={}: {} companies, {}={}: {} companies",
                settings.page_param,
                check.page,
                check.first_count,
                settings.page_param,
                check.page + 1,
                check.second_count
            );
            if check.distinct {
                println!("Pagination parameter works.");
            } else {
                println!("Both pages are identical; '{}' looks ignored.", settings.page_param);
            }
            Ok(())
        }
        Commands::Inspect { url } => {
            let details = DetailFetcher::new(HttpFetcher::new(&settings)?);
            let fields = details.fetch_details(&url).await;
            println!("description: {}", fields.description.as_deref().unwrap_or("-"));
            println!("location:    {}", fields.location.as_deref().unwrap_or("-"));
            Ok(())
        }
        Commands::Forget { name, store } => {
            let backend = open_backend(&settings, store)?;
            let removed = backend.delete(&Filter::NameEq(name.clone())).await?;
            println!("Removed {} row(s) named '{}'", removed, name);
            Ok(())
        }
    };

    let elapsed = t0.elapsed();
    if elapsed.as_secs() >= 1 {
        println!("\nDone in {}", format_duration(elapsed));
    }

    result
}

/// Fails before any fetching when the remote store has no credentials.
fn open_backend(settings: &Settings, choice: Option<StoreKind>) -> anyhow::Result<Backend> {
    match choice.unwrap_or(settings.store) {
        StoreKind::Remote => {
            let creds = StoreCredentials::from_env()?;
            Ok(Backend::Remote(SupabaseStore::new(&creds, settings.timeout())?))
        }
        StoreKind::Local => Ok(Backend::Local(LocalStore::open(&settings.db_path)?)),
    }
}

fn build_pipeline(
    settings: &Settings,
    backend: Backend,
    state: rusqlite::Connection,
) -> anyhow::Result<Pipeline<Backend>> {
    let fetcher = HttpFetcher::new(settings)?;

    let pb = ProgressBar::new(0);
    pb.set_style(
        ProgressStyle::default_bar()
            .template("[{elapsed_precise}] {bar:40} {pos}/{len} {msg} (eta {eta})")?
            .progress_chars("=> "),
    );

    Ok(Pipeline::new(
        Paginator::new(fetcher.clone(), settings),
        DetailFetcher::new(fetcher),
        IngestionStore::new(backend),
        settings.pacing(),
        settings.last_page(),
    )
    .with_state_db(state)
    .with_progress(pb))
}

async fn print_stats(backend: &Backend, settings: &Settings) -> anyhow::Result<()> {
    let stats = store::collect_stats(backend, STATS_SAMPLE).await?;

    println!("Total companies:   {}", stats.total);
    println!("With industry:     {}", stats.with_description);
    println!("With location:     {}", stats.with_location);

    println!("\n=== Sample Companies ===");
    for company in &stats.sample {
        println!("- {}", company.name);
        if let Some(description) = &company.description {
            println!("  Description: {}", description);
        }
        if let Some(location) = &company.location {
            println!("  Location: {}", location);
        }
    }
    println!();

    let estimate = settings.total_records.max(1);
    let progress = stats.total as f64 / f64::from(estimate) * 100.0;
    println!("Progress:          {:.1}% ({}/{})", progress, stats.total, estimate);

    if let Ok(state) = db::connect(&settings.db_path) {
        if let Some(page) = db::load_checkpoint(&state, db::LISTING_RUN_KEY)? {
            println!("Checkpoint:        page {}/{}", page, settings.last_page());
        }
        let (pages, inserts) = db::count_dead_letters(&state)?;
        println!("Pending retries:   {} pages, {} inserts", pages, inserts);
    }
    Ok(())
}

fn format_duration(d: std::time::Duration) -> String {
    let secs = d.as_secs();
    if secs < 60 {
        format!("{:.1}s", d.as_secs_f64())
    } else if secs < 3600 {
        format!("{}m {}s", secs / 60, secs % 60)
    } else {
        format!("{}h {}m {}s", secs / 3600, (secs % 3600) / 60, secs % 60)
    }
}
