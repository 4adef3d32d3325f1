use anyhow::{bail, Result};
use chrono::Utc;
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{error, info, warn};

use tender_scout::config::{self, Config};
use tender_scout::db::{self, NotificationFilter, Pool};
use tender_scout::engine::chromium::ChromiumLauncher;
use tender_scout::inference::ollama::OllamaClient;
use tender_scout::inference::{Inference, RetryPolicy};
use tender_scout::job::{JobRunner, JobSettings};
use tender_scout::model::{ExtractionHints, NewSource, NotificationStatus, PageType};
use tender_scout::pool::{PoolConfig, ResourcePool};
use tender_scout::scheduler::{Scheduler, SchedulerSettings};

#[derive(Debug, Parser)]
#[command(author, version, about)]
struct Args {
    /// Path to YAML config file
    #[arg(long, default_value = "config.yaml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Run the scheduler until interrupted (default)
    Run,
    /// Register a source to watch
    AddSource {
        #[arg(long)]
        name: String,
        #[arg(long)]
        url: String,
        /// table, list, generic, or auto to classify the page first
        #[arg(long, default_value = "auto")]
        page_type: String,
        #[arg(long, default_value_t = 24)]
        frequency_hours: u32,
        /// Extraction hints as JSON
        #[arg(long)]
        hints: Option<String>,
        #[arg(long)]
        notes: Option<String>,
    },
    ListSources,
    DeactivateSource { id: i64 },
    /// Scrape one source now and print the outcome
    Scrape { id: i64 },
    /// Run-log summary for the last few days
    Stats {
        #[arg(long, default_value_t = 7)]
        days: i64,
        /// Also list this source's recent runs
        #[arg(long)]
        source: Option<i64>,
    },
    Notifications {
        #[arg(long)]
        source: Option<i64>,
        /// active, expired or cancelled
        #[arg(long)]
        status: Option<String>,
        #[arg(long)]
        only_new: bool,
        #[arg(long, default_value_t = 50)]
        limit: i64,
        /// Clear the "new" flag on the listed scope afterwards
        #[arg(long)]
        mark_seen: bool,
    },
    /// Print an example config
    ExampleConfig,
}

struct Runtime {
    db: Pool,
    pool: Arc<ResourcePool>,
    runner: Arc<JobRunner>,
}

async fn runtime(cfg: &Config, db: Pool) -> Result<Runtime> {
    let launcher = Arc::new(ChromiumLauncher::from_config(&cfg.scraper));
    let pool = ResourcePool::new(launcher, PoolConfig::from_config(&cfg.scraper));

    let client = OllamaClient::from_config(&cfg.inference)?;
    if !client.health_check().await {
        warn!(base_url = %cfg.inference.base_url, "inference service unreachable; generic pages will degrade");
    } else if !client.ensure_model_available().await.unwrap_or(false) {
        warn!(model = client.model(), "inference model not pulled");
    }
    let inference = Inference::new(Arc::new(client), RetryPolicy::from_config(&cfg.inference));

    let runner = Arc::new(JobRunner::new(
        pool.clone(),
        db.clone(),
        inference,
        JobSettings::from_config(cfg)?,
    ));
    Ok(Runtime { db, pool, runner })
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_target(false)
        .compact()
        .init();

    let args = Args::parse();
    let command = args.command.unwrap_or(Command::Run);
    if let Command::ExampleConfig = command {
        print!("{}", config::example());
        return Ok(());
    }

    let cfg = config::load(Some(&args.config))?;
    cfg.ensure_dirs()?;

    let db = db::init_pool(&cfg.database_url()).await?;
    db::run_migrations(&db).await?;

    match command {
        Command::Run => serve(&cfg, db).await,
        Command::AddSource {
            name,
            url,
            page_type,
            frequency_hours,
            hints,
            notes,
        } => {
            let hints: ExtractionHints = match hints {
                Some(raw) => serde_json::from_str(&raw)?,
                None => ExtractionHints::default(),
            };
            let page_type = if page_type.eq_ignore_ascii_case("auto") {
                let rt = runtime(&cfg, db.clone()).await?;
                let detected = rt.runner.probe_page_type(&url).await;
                rt.pool.shutdown().await;
                detected?
            } else {
                match PageType::parse(&page_type) {
                    Some(t) => t,
                    None => bail!("unknown page type {page_type:?}"),
                }
            };
            let id = db::create_source(
                &db,
                &NewSource {
                    name,
                    url,
                    page_type,
                    scrape_frequency_hours: frequency_hours,
                    hints,
                    notes,
                },
            )
            .await?;
            println!("source {id} added as {}", page_type.as_str());
            Ok(())
        }
        Command::ListSources => {
            for s in db::list_sources(&db).await? {
                println!(
                    "{:>4}  {:<8} every {:>2}h  {}  ok={} err={}  {}  {}",
                    s.id,
                    s.page_type.as_str(),
                    s.scrape_frequency_hours,
                    if s.active { "active  " } else { "inactive" },
                    s.success_count,
                    s.error_count,
                    s.name,
                    s.url
                );
            }
            Ok(())
        }
        Command::DeactivateSource { id } => {
            if db::deactivate_source(&db, id).await? {
                println!("source {id} deactivated");
            } else {
                println!("source {id} not found");
            }
            Ok(())
        }
        Command::Scrape { id } => {
            let Some(source) = db::get_source(&db, id).await? else {
                bail!("source {id} not found");
            };
            let rt = runtime(&cfg, db).await?;
            let report = rt.runner.run(&source).await;
            rt.pool.shutdown().await;
            println!("{}", serde_json::to_string_pretty(&report?)?);
            Ok(())
        }
        Command::Stats { days, source } => {
            let since = Utc::now() - chrono::Duration::days(days);
            if let Some(id) = source {
                for run in db::recent_run_outcomes(&db, Some(id), since, 50).await? {
                    println!(
                        "{}  {:<8} found={} new={} {}ms  {}",
                        run.ran_at.format("%Y-%m-%d %H:%M"),
                        run.status.as_str(),
                        run.records_found,
                        run.records_new,
                        run.duration_ms,
                        run.error_detail.as_deref().unwrap_or("")
                    );
                }
            }
            for row in db::run_status_counts(&db, since).await? {
                println!(
                    "{:<8} runs={:<5} new_records={}",
                    row.status.as_str(),
                    row.runs,
                    row.records_new
                );
            }
            println!("notifications stored: {}", db::count_notifications(&db, None).await?);
            Ok(())
        }
        Command::Notifications {
            source,
            status,
            only_new,
            limit,
            mark_seen,
        } => {
            let status = match status.as_deref().map(NotificationStatus::parse_status) {
                Some(None) => bail!("unknown notification status {status:?}"),
                Some(parsed) => parsed,
                None => None,
            };
            let filter = NotificationFilter {
                source_id: source,
                status,
                only_new,
                limit,
                ..Default::default()
            };
            let today = Utc::now().with_timezone(&cfg.timezone()?).date_naive();
            for n in db::list_notifications(&db, &filter, today).await? {
                let days = n
                    .days_remaining(today)
                    .map(|d| format!("{d}d left"))
                    .unwrap_or_else(|| "open".into());
                println!(
                    "{:>5}  [{}] {}  {}  {}",
                    n.id,
                    n.effective_status(today).as_str(),
                    if n.is_new { "*" } else { " " },
                    days,
                    n.title
                );
            }
            if mark_seen {
                let cleared = db::mark_notifications_seen(&db, source).await?;
                println!("{cleared} notifications marked seen");
            }
            Ok(())
        }
        Command::ExampleConfig => Ok(()),
    }
}

async fn serve(cfg: &Config, db: Pool) -> Result<()> {
    let rt = runtime(cfg, db).await?;
    if let Err(err) = rt.pool.warm_up(1).await {
        error!(?err, "could not start a rendering instance; continuing lazily");
    }
    let scheduler = Scheduler::new(
        rt.db.clone(),
        rt.pool.clone(),
        rt.runner.clone(),
        SchedulerSettings::from_config(cfg)?,
    );
    scheduler.start();

    info!("scheduler running; press Ctrl-C to stop");
    tokio::signal::ctrl_c().await?;
    info!("shutdown requested");
    scheduler.stop().await;
    Ok(())
}
