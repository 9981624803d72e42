mod output;

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;
use uuid::Uuid;

use carve_client::{ReqwestFetcher, ReqwestNotifier};
use carve_core::cache::SchemaCache;
use carve_core::config::DispatcherConfig;
use carve_core::dispatcher::Dispatcher;
use carve_core::executor::TaskExecutor;
use carve_core::http_source::HttpPageSource;
use carve_core::memory::{MemoryRecordStore, MemoryStore};
use carve_core::schema::{SchemaFilter, load_schema_file};
use carve_core::service::{SchemaService, TaskService};
use carve_core::stats::StatsAggregator;
use carve_core::task::{CreateTaskRequest, TaskFilter, TaskStatus};
use carve_core::throttle::SourceRateLimiter;
use carve_core::traits::{PageSource, RecordStore};
use carve_core::worker::{TracingWorkerReporter, Worker, WorkerConfig};
use carve_core::{Mode, SchemaStore};
use carve_db::{Database, DatabaseConfig, PgRecordRepository, PgSchemaRepository, PgTaskRepository};

use crate::output::{Format, write_records};

#[derive(Parser)]
#[command(name = "carve", version, about = "Schema-driven web extraction engine")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Extract records from one URL locally, without a database
    Extract {
        /// Target URL
        #[arg(short, long)]
        url: String,

        /// Path to the schema file (JSON)
        #[arg(short, long)]
        schema: PathBuf,

        /// Render with a headless browser (requires the `browser` feature)
        #[arg(long, default_value_t = false)]
        browser: bool,

        /// Output format
        #[arg(short, long, value_enum, default_value_t = Format::Json)]
        format: Format,
    },

    /// Run worker pools against the database queue until Ctrl+C
    ///
    /// Per-source rate limits are enforced within one worker process; run a
    /// single `carve worker` per database to keep them.
    Worker {
        /// HTTP workers (overrides CARVE_HTTP_WORKERS)
        #[arg(long)]
        http_workers: Option<usize>,

        /// Browser workers (overrides CARVE_BROWSER_WORKERS)
        #[arg(long)]
        browser_workers: Option<usize>,
    },

    /// Manage parsing schemas
    Schema {
        #[command(subcommand)]
        action: SchemaAction,
    },

    /// Manage extraction tasks
    Task {
        #[command(subcommand)]
        action: TaskAction,
    },

    /// Show queue depth and task outcomes
    Stats,
}

#[derive(Subcommand)]
enum SchemaAction {
    /// Register a schema file as version 1, or publish it as a new version
    Push {
        /// Path to the schema file (JSON)
        path: PathBuf,
    },
    /// Show a schema (latest version unless --version is given)
    Show {
        schema_id: String,
        #[arg(long)]
        version: Option<u32>,
    },
    /// List schemas
    List {
        #[arg(long)]
        source_id: Option<String>,
        #[arg(long, default_value_t = false)]
        active_only: bool,
    },
    /// Deactivate a schema
    Deactivate { schema_id: String },
    /// List every published version of a schema
    Versions { schema_id: String },
    /// Make a schema the active one of its source again
    Activate { schema_id: String },
    /// Dry-run a schema against up to 5 sample URLs; nothing is stored
    Validate {
        schema_id: String,
        /// Sample URL (repeatable)
        #[arg(short, long = "url", required = true)]
        urls: Vec<String>,
        #[arg(long)]
        version: Option<u32>,
    },
}

#[derive(Subcommand)]
enum TaskAction {
    /// Queue a task
    Submit {
        #[arg(long)]
        source_id: String,
        #[arg(long)]
        schema_id: String,
        #[arg(short, long)]
        url: String,
        /// Pin a schema version
        #[arg(long)]
        schema_version: Option<u32>,
        /// http or browser
        #[arg(long, value_parser = parse_mode)]
        mode: Option<Mode>,
        /// 1 (highest) to 5
        #[arg(long)]
        priority: Option<u8>,
        #[arg(long)]
        max_attempts: Option<u32>,
        #[arg(long)]
        callback_url: Option<String>,
    },
    /// Show a task with its errors and status history
    Show { id: Uuid },
    /// List tasks, newest first
    List {
        #[arg(long, value_parser = parse_status)]
        status: Option<TaskStatus>,
        #[arg(long)]
        source_id: Option<String>,
        #[arg(long)]
        schema_id: Option<String>,
        #[arg(short, long, default_value_t = 20)]
        limit: usize,
        #[arg(long, default_value_t = 0)]
        offset: usize,
    },
    /// Export a task's records
    Records {
        id: Uuid,
        #[arg(short, long, value_enum, default_value_t = Format::Json)]
        format: Format,
        #[arg(short, long, default_value_t = 1000)]
        limit: usize,
    },
    /// Requeue a failed or dead-lettered task
    Retry { id: Uuid },
    /// Cancel a task
    Cancel { id: Uuid },
}

fn parse_mode(s: &str) -> Result<Mode, String> {
    s.parse()
}

fn parse_status(s: &str) -> Result<TaskStatus, String> {
    s.parse()
}

#[tokio::main]
async fn main() -> Result<()> {
    let _ = dotenvy::dotenv();

    // Logs go to stderr; stdout carries records.
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive("carve=info".parse()?))
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Extract {
            url,
            schema,
            browser,
            format,
        } => cmd_extract(&url, &schema, browser, format).await,
        Commands::Worker {
            http_workers,
            browser_workers,
        } => {
            let mut config = DispatcherConfig::from_env()?;
            if let Some(n) = http_workers {
                config.http_workers = n;
            }
            if let Some(n) = browser_workers {
                config.browser_workers = n;
            }
            cmd_worker(connect_db().await?, config).await
        }
        Commands::Schema { action } => cmd_schema(connect_db().await?, action).await,
        Commands::Task { action } => cmd_task(connect_db().await?, action).await,
        Commands::Stats => {
            let db = connect_db().await?;
            let snapshot = StatsAggregator::new(db.task_repo()).snapshot().await?;
            print_json(&snapshot)
        }
    }
}

/// Connect to PostgreSQL using DATABASE_URL and apply migrations.
async fn connect_db() -> Result<Database> {
    let config = DatabaseConfig::from_env().context("DATABASE_URL not set")?;
    let db = Database::connect(&config)
        .await
        .context("Failed to connect to database")?;
    db.migrate().await?;
    Ok(db)
}

fn print_json<T: serde::Serialize + ?Sized>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

// ---------------------------------------------------------------------------
// extract
// ---------------------------------------------------------------------------

async fn cmd_extract(url: &str, schema_path: &Path, browser: bool, format: Format) -> Result<()> {
    let schema = load_schema_file(schema_path)?;
    tracing::info!(schema_id = %schema.schema_id, %url, "Extracting");

    if browser {
        #[cfg(feature = "browser")]
        {
            let source = carve_client::BrowserPageSource::launch().await?.allow_private_urls();
            return run_local(source, schema, url, format).await;
        }
        #[cfg(not(feature = "browser"))]
        anyhow::bail!("--browser requires carve to be built with the `browser` feature");
    }

    let fetcher = ReqwestFetcher::new()?.allow_private_urls();
    run_local(HttpPageSource::new(fetcher), schema, url, format).await
}

/// Push one task through the full pipeline against in-memory stores.
async fn run_local<P: PageSource>(
    source: P,
    schema: carve_core::NewSchema,
    url: &str,
    format: Format,
) -> Result<()> {
    let store = MemoryStore::new();
    let records = MemoryRecordStore::new();
    let mode = source.mode();

    let schema = store.create_schema(schema).await?;
    let notifier = ReqwestNotifier::new()?.allow_private_urls();
    let tasks = TaskService::new(store.clone(), store.clone(), records.clone(), notifier.clone());
    let request = CreateTaskRequest::new(&schema.source_id, &schema.schema_id, url)
        .with_mode(mode)
        .with_max_attempts(1);
    let task = tasks.create_task(request).await?;
    if task.mode != mode {
        anyhow::bail!("schema {} requires javascript; rerun with --browser", schema.schema_id);
    }

    let worker = Worker::new(
        store.clone(),
        store.clone(),
        TaskExecutor::new(source, records.clone(), SourceRateLimiter::new()),
        notifier,
        SchemaCache::default(),
        WorkerConfig::default().with_worker_id("local"),
    );
    let landed = worker
        .process_next(&TracingWorkerReporter)
        .await?
        .context("task was not claimed")?;

    for error in &landed.errors {
        tracing::warn!(kind = %error.kind, page = ?error.page, field = ?error.field, "{}", error.message);
    }
    tracing::info!(
        status = %landed.status,
        records = landed.records_extracted,
        rejected = landed.records_rejected,
        pages = landed.pages_processed,
        "Extraction finished"
    );

    let extracted = records.list_records(landed.id, usize::MAX, 0).await?;
    write_records(&extracted, format, std::io::stdout().lock())?;

    if matches!(landed.status, TaskStatus::Failed | TaskStatus::Dlq) {
        anyhow::bail!("extraction failed");
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// worker
// ---------------------------------------------------------------------------

async fn cmd_worker(db: Database, config: DispatcherConfig) -> Result<()> {
    let fetcher = ReqwestFetcher::new()?;
    let mut dispatcher = Dispatcher::new(
        db.task_repo(),
        db.schema_repo(),
        db.record_repo(),
        ReqwestNotifier::new()?,
        config.clone(),
    );

    if config.http_workers > 0 {
        dispatcher.spawn_pool(HttpPageSource::new(fetcher), config.http_workers);
    }
    if config.browser_workers > 0 {
        #[cfg(feature = "browser")]
        {
            let source = carve_client::BrowserPageSource::launch().await?;
            dispatcher.spawn_pool(source, config.browser_workers);
        }
        #[cfg(not(feature = "browser"))]
        tracing::warn!(
            workers = config.browser_workers,
            "Built without the `browser` feature; browser tasks will wait in queue"
        );
    }
    dispatcher.spawn_reclaimer();

    let shutdown = dispatcher.shutdown_token();
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => tracing::info!("Shutdown signal received"),
            Err(e) => tracing::error!(error = %e, "Failed to listen for shutdown signal"),
        }
        shutdown.cancel();
    });

    dispatcher.run().await;
    Ok(())
}

// ---------------------------------------------------------------------------
// schema / task admin
// ---------------------------------------------------------------------------

async fn cmd_schema(db: Database, action: SchemaAction) -> Result<()> {
    let schemas: SchemaService<PgSchemaRepository> = SchemaService::new(db.schema_repo());

    match action {
        SchemaAction::Push { path } => {
            let schema = schemas.upsert(load_schema_file(&path)?).await?;
            tracing::info!(schema_id = %schema.schema_id, version = schema.version, "Schema pushed");
            print_json(&schema)
        }
        SchemaAction::Show { schema_id, version } => {
            print_json(&schemas.get(&schema_id, version).await?)
        }
        SchemaAction::List {
            source_id,
            active_only,
        } => {
            let list = schemas
                .list(&SchemaFilter {
                    source_id,
                    active_only,
                })
                .await?;
            if list.is_empty() {
                println!("No schemas found");
            }
            for s in &list {
                println!(
                    "{:<30} v{:<4} {:<20} {}",
                    s.schema_id,
                    s.version,
                    s.source_id,
                    if s.is_active { "active" } else { "inactive" }
                );
            }
            Ok(())
        }
        SchemaAction::Deactivate { schema_id } => {
            schemas.deactivate(&schema_id).await?;
            println!("Schema {schema_id} deactivated");
            Ok(())
        }
        SchemaAction::Versions { schema_id } => {
            for s in schemas.versions(&schema_id).await? {
                println!(
                    "v{:<4} {}  {}",
                    s.version,
                    s.created_at.format("%Y-%m-%d %H:%M:%S"),
                    if s.is_active { "active" } else { "inactive" }
                );
            }
            Ok(())
        }
        SchemaAction::Activate { schema_id } => {
            let schema = schemas.activate(&schema_id).await?;
            println!("Schema {} v{} activated", schema.schema_id, schema.version);
            Ok(())
        }
        SchemaAction::Validate {
            schema_id,
            urls,
            version,
        } => {
            let fetcher = ReqwestFetcher::new()?.allow_private_urls();
            let report = schemas.dry_run(&fetcher, &schema_id, version, &urls).await?;
            print_json(&report)?;
            if !report.overall_success {
                anyhow::bail!("schema {schema_id} extracted nothing from at least one URL");
            }
            Ok(())
        }
    }
}

async fn cmd_task(db: Database, action: TaskAction) -> Result<()> {
    let tasks: TaskService<PgTaskRepository, PgSchemaRepository, PgRecordRepository, ReqwestNotifier> =
        TaskService::new(db.task_repo(), db.schema_repo(), db.record_repo(), ReqwestNotifier::new()?)
            .with_inline_callbacks();

    match action {
        TaskAction::Submit {
            source_id,
            schema_id,
            url,
            schema_version,
            mode,
            priority,
            max_attempts,
            callback_url,
        } => {
            let mut request = CreateTaskRequest::new(source_id, schema_id, url);
            if let Some(mode) = mode {
                request = request.with_mode(mode);
            }
            if let Some(priority) = priority {
                request = request.with_priority(priority);
            }
            if let Some(max) = max_attempts {
                request = request.with_max_attempts(max);
            }
            if let Some(version) = schema_version {
                request = request.with_schema_version(version);
            }
            if let Some(url) = callback_url {
                request = request.with_callback_url(url);
            }
            let task = tasks.create_task(request).await?;
            println!("{}", task.id);
            Ok(())
        }
        TaskAction::Show { id } => print_json(&tasks.get_task(id).await?),
        TaskAction::List {
            status,
            source_id,
            schema_id,
            limit,
            offset,
        } => {
            let page = tasks
                .list_tasks(&TaskFilter {
                    status,
                    source_id,
                    schema_id,
                    mode: None,
                    limit,
                    offset,
                })
                .await?;
            for t in &page.tasks {
                println!(
                    "{}  {:<9} p{} {:<7} {}/{}  {:>5} rec  {}",
                    t.id,
                    t.status,
                    t.priority,
                    t.mode,
                    t.attempt,
                    t.max_attempts,
                    t.records_extracted,
                    t.target_url,
                );
            }
            println!("\nShowing {} of {} tasks", page.tasks.len(), page.total);
            Ok(())
        }
        TaskAction::Records { id, format, limit } => {
            let records = tasks.records(id, limit, 0).await?;
            write_records(&records, format, std::io::stdout().lock())
        }
        TaskAction::Retry { id } => {
            let task = tasks.retry(id).await?;
            println!("Task {} requeued (attempt {}/{})", task.id, task.attempt, task.max_attempts);
            Ok(())
        }
        TaskAction::Cancel { id } => {
            let task = tasks.cancel(id).await?;
            if task.status == TaskStatus::Cancelled {
                println!("Task {} cancelled", task.id);
            } else {
                println!("Task {} is running; cancellation requested", task.id);
            }
            Ok(())
        }
    }
}
