//! Command-line surface embedding the engine controller.

use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, Subcommand, ValueEnum};
use console::style;
use indicatif::{ProgressBar, ProgressStyle};
use tokio::sync::mpsc;

use corpusgrab::config::{DataSetConfig, EngineSettings};
use corpusgrab::engine::{Controller, EngineEvent, OperationMode};
use corpusgrab::fetch::HttpFetcher;
use corpusgrab::models::StatsSnapshot;
use corpusgrab::repository::WorkStore;
use corpusgrab::utils::format_speed;

#[derive(Parser)]
#[command(name = "corpusgrab")]
#[command(about = "Resumable bulk acquisition of paginated document disclosures")]
#[command(version)]
struct Cli {
    /// Work-store database path
    #[arg(long, global = true, default_value = "corpusgrab.db")]
    db: PathBuf,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

/// Check if verbose mode is enabled (for early logging setup).
pub fn is_verbose() -> bool {
    std::env::args().any(|arg| arg == "-v" || arg == "--verbose")
}

#[derive(Subcommand)]
enum Commands {
    /// Acquire a data set
    Run {
        /// Data set number to download (1-12)
        #[arg(short, long, default_value = "11")]
        data_set: u32,
        /// Discovery mode
        #[arg(short, long, value_enum, default_value_t = ModeArg::Scrape)]
        mode: ModeArg,
        /// Output directory for downloaded files
        #[arg(short, long, default_value = "downloads")]
        output: PathBuf,
        /// Netscape cookie file for authentication
        #[arg(short = 'k', long)]
        cookies: Option<PathBuf>,
        /// Literal Cookie header value (takes precedence over --cookies)
        #[arg(long)]
        cookie: Option<String>,
        /// Max concurrent downloads
        #[arg(short, long, default_value = "1000")]
        concurrent: usize,
        /// Max retry attempts per file
        #[arg(short, long, default_value = "3")]
        retries: u32,
        /// Enumeration start id (overrides the data set default)
        #[arg(short, long)]
        start: Option<u64>,
        /// Enumeration end id (overrides the data set default)
        #[arg(short, long)]
        end: Option<u64>,
        /// Re-download files that already exist on disk
        #[arg(long)]
        overwrite: bool,
    },

    /// Show stored progress for a data set
    Status {
        #[arg(short, long, default_value = "11")]
        data_set: u32,
    },

    /// Maintenance operations on stored work
    State {
        #[command(subcommand)]
        command: StateCommands,
    },
}

#[derive(Subcommand)]
enum StateCommands {
    /// Reset interrupted downloads back to pending
    ResetInterrupted {
        #[arg(short, long, default_value = "11")]
        data_set: u32,
    },
    /// Queue failed downloads for another attempt
    RetryFailed {
        #[arg(short, long, default_value = "11")]
        data_set: u32,
    },
    /// Reset every item to pending for a full redownload
    ResetAll {
        #[arg(short, long, default_value = "11")]
        data_set: u32,
    },
    /// Delete all records for a data set
    Clear {
        #[arg(short, long, default_value = "11")]
        data_set: u32,
    },
}

#[derive(Clone, Copy, Debug, ValueEnum)]
enum ModeArg {
    /// Scrape index pages and download found files
    Scrape,
    /// Walk the integer id range
    Enumerate,
    /// Scrape and enumerate at once
    Hybrid,
    /// Only drain the existing queue
    Download,
}

impl From<ModeArg> for OperationMode {
    fn from(mode: ModeArg) -> Self {
        match mode {
            ModeArg::Scrape => OperationMode::ScraperOnly,
            ModeArg::Enumerate => OperationMode::EnumerateOnly,
            ModeArg::Hybrid => OperationMode::Hybrid,
            ModeArg::Download => OperationMode::DownloadOnly,
        }
    }
}

pub async fn run() -> anyhow::Result<()> {
    let cli = Cli::parse();
    if cli.verbose {
        tracing::debug!("verbose output enabled");
    }

    match cli.command {
        Commands::Run {
            data_set,
            mode,
            output,
            cookies,
            cookie,
            concurrent,
            retries,
            start,
            end,
            overwrite,
        } => {
            let mut config = DataSetConfig::for_data_set(data_set)?;
            if let Some(start) = start {
                config.first_id = Some(start);
            }
            if let Some(end) = end {
                config.last_id = Some(end);
            }

            let settings = EngineSettings {
                db_path: cli.db,
                storage_root: output,
                max_concurrent_downloads: concurrent,
                max_retries: retries,
                cookie,
                cookie_file: cookies,
                overwrite_existing: overwrite,
                ..Default::default()
            };

            run_engine(config, mode.into(), settings).await
        }

        Commands::Status { data_set } => {
            let store = WorkStore::new(&cli.db)?;
            print_status(&store, data_set)?;
            Ok(())
        }

        Commands::State { command } => {
            let store = WorkStore::new(&cli.db)?;
            match command {
                StateCommands::ResetInterrupted { data_set } => {
                    let count = store.reset_in_progress(data_set)?;
                    println!("Reset {count} interrupted downloads to pending");
                }
                StateCommands::RetryFailed { data_set } => {
                    let count = store.reset_failed(data_set)?;
                    println!("Queued {count} failed downloads for retry");
                }
                StateCommands::ResetAll { data_set } => {
                    let count = store.reset_all(data_set)?;
                    println!("Reset {count} items to pending");
                }
                StateCommands::Clear { data_set } => {
                    let count = store.clear_data_set(data_set)?;
                    println!("Removed {count} items for data set {data_set}");
                }
            }
            Ok(())
        }
    }
}

async fn run_engine(
    config: DataSetConfig,
    mode: OperationMode,
    settings: EngineSettings,
) -> anyhow::Result<()> {
    let data_set = config.id;
    let store = Arc::new(WorkStore::new(&settings.db_path)?);
    let fetcher = Arc::new(HttpFetcher::with_cookies(
        settings.cookie.clone(),
        settings.cookie_file.as_deref(),
    )?);

    println!("{} {}", style("Acquiring").green().bold(), config.name);
    println!("  mode: {mode:?}");
    println!("  output: {}", settings.storage_root.display());
    println!("  concurrency: {}", settings.max_concurrent_downloads);
    if let (Some(first), Some(last)) = (config.first_id, config.last_id) {
        println!(
            "  range: {} - {}",
            config.format_key(first),
            config.format_key(last)
        );
    }
    println!();

    let (event_tx, mut event_rx) = mpsc::channel(512);
    let mut controller = Controller::new(store.clone(), fetcher, settings, event_tx);
    controller.start(config, mode)?;

    let bar = ProgressBar::new_spinner();
    bar.set_style(
        ProgressStyle::default_spinner()
            .template("{spinner:.green} {msg}")
            .unwrap_or_else(|_| ProgressStyle::default_spinner()),
    );

    loop {
        tokio::select! {
            signal = tokio::signal::ctrl_c() => {
                if signal.is_ok() {
                    bar.println(format!("{}", style("Interrupt received, stopping...").yellow()));
                    controller.stop().await;
                    break;
                }
            }
            event = event_rx.recv() => {
                match event {
                    Some(EngineEvent::Stats(snapshot)) => {
                        bar.set_message(stats_line(&snapshot));
                        bar.tick();
                    }
                    Some(EngineEvent::PageScraped { page, count }) => {
                        tracing::debug!("page {page} scraped: {count} links");
                    }
                    Some(EngineEvent::FileStateChanged { key, state }) => {
                        tracing::debug!("{key} -> {}", state.as_str());
                    }
                    Some(EngineEvent::Error(message)) => {
                        bar.println(format!("{} {message}", style("[!]").red().bold()));
                    }
                    Some(EngineEvent::WorkerLifecycle { name, started }) => {
                        tracing::debug!("worker {name} {}", if started { "started" } else { "finished" });
                    }
                    Some(EngineEvent::RunComplete) => {
                        bar.println(format!("{}", style("Run complete").green().bold()));
                        controller.stop().await;
                        break;
                    }
                    None => break,
                }
            }
        }
    }
    bar.finish_and_clear();

    println!();
    print_status(&store, data_set)?;
    Ok(())
}

fn stats_line(snapshot: &StatsSnapshot) -> String {
    let store = &snapshot.store;
    let total = store.total_items().max(1);
    let progress = 100.0 * store.completed as f64 / total as f64;
    format!(
        "{progress:.1}% | done {} | failed {} | 404 {} | pending {} | active {} | {} | wire {}",
        store.completed,
        store.failed,
        store.not_found,
        store.pending,
        snapshot.active_downloads,
        format_speed(snapshot.wall_speed_bps),
        format_speed(snapshot.wire_speed_bps),
    )
}

fn print_status(store: &WorkStore, data_set: u32) -> anyhow::Result<()> {
    let stats = store.stats(data_set)?;
    println!("{}", style(format!("Data set {data_set}")).bold());
    println!("  completed:  {}", stats.completed);
    println!("  pending:    {}", stats.pending);
    println!("  in flight:  {}", stats.in_progress);
    println!("  failed:     {}", stats.failed);
    println!("  not found:  {}", stats.not_found);
    println!("  skipped:    {}", stats.skipped);
    println!("  pages:      {}/{}", stats.pages_scraped, stats.total_pages);
    println!("  keys found: {}", stats.keys_found);
    if stats.enumerator_current > 0 {
        println!("  enumerator: {}", stats.enumerator_current);
    }
    Ok(())
}
