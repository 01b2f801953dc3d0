use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use clap::{Args, Parser, Subcommand};
use tokio::sync::watch;
use tokio::time::Instant;

use scanhive::banner::{BannerInfo, print_banner, print_scan_summary};
use scanhive::catalog::DirCatalog;
use scanhive::consts::{DEFAULT_CONCURRENCY, DEFAULT_TIMEOUT, default_db_path, default_templates_dir};
use scanhive::engine::{EngineBuilder, ThreadSafeEngine};
use scanhive::interactions::StaticInteractions;
use scanhive::logging::init_tracing;
use scanhive::options::{
    ScanOption, with_concurrency, with_exclude_tags, with_headers, with_rate_limit,
    with_rate_limit_minute, with_retries, with_severities, with_tags, with_template_ids,
    with_timeout, with_verbose, without_color,
};
use scanhive::output::{Colorizer, ConsoleWriter, JsonLinesWriter, OutputWriter};
use scanhive::registry::sqlite::SqliteRegistry;
use scanhive::registry::{NewScan, ScanRecord, ScanRegistry};
use scanhive::service::ScanService;

#[derive(Parser)]
#[command(name = "scanhive", version, about = "Template-driven scans, many at once, on one engine.")]
struct Cli {
    /// Debug logging (SCANHIVE_LOG takes precedence)
    #[arg(short, long, global = true, default_value_t = false)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Scan targets with the template catalog
    Scan(ScanArgs),
    /// Manage registered scans
    Scans {
        /// SQLite database holding scan records
        #[arg(long, global = true, default_value_os_t = default_db_path())]
        db: PathBuf,

        #[command(subcommand)]
        action: ScansAction,
    },
}

#[derive(Args)]
struct ScanArgs {
    /// Target URL or host (repeatable)
    #[arg(short = 'u', long = "target", required = true)]
    targets: Vec<String>,

    #[command(flatten)]
    engine: EngineArgs,
}

#[derive(Args)]
struct EngineArgs {
    /// Template catalog directory
    #[arg(short = 't', long, default_value_os_t = default_templates_dir())]
    templates_dir: PathBuf,

    /// Only templates with these ids
    #[arg(long = "id", value_delimiter = ',')]
    template_ids: Vec<String>,

    /// Only templates with at least one of these tags
    #[arg(long, value_delimiter = ',')]
    tags: Vec<String>,

    /// Skip templates with any of these tags
    #[arg(long, value_delimiter = ',')]
    exclude_tags: Vec<String>,

    /// Only templates with these severities
    #[arg(short, long, value_delimiter = ',')]
    severity: Vec<String>,

    /// Work items in flight at once
    #[arg(short, long, default_value_t = DEFAULT_CONCURRENCY)]
    concurrency: usize,

    /// Requests per second (0 = unlimited)
    #[arg(long, default_value_t = 0)]
    rate_limit: u32,

    /// Requests per minute; wins over --rate-limit
    #[arg(long, default_value_t = 0)]
    rate_limit_minute: u32,

    /// Request timeout in seconds
    #[arg(long, default_value_t = DEFAULT_TIMEOUT.as_secs())]
    timeout: u64,

    /// Retries per failed request
    #[arg(long, default_value_t = 0)]
    retries: u32,

    /// Extra header, "Name: value" (repeatable)
    #[arg(short = 'H', long = "header")]
    headers: Vec<String>,

    /// Print results as JSON lines
    #[arg(long, default_value_t = false)]
    json: bool,

    /// Disable colored output
    #[arg(long, default_value_t = false)]
    no_color: bool,

    /// Base URL for {{interaction_url}} placeholders
    #[arg(long)]
    interaction_server: Option<String>,
}

#[derive(Subcommand)]
enum ScansAction {
    /// Register a scan
    Add {
        #[arg(long)]
        name: String,

        /// Template id or path (repeatable)
        #[arg(long = "template")]
        templates: Vec<String>,

        /// Target URL or host (repeatable)
        #[arg(short = 'u', long = "target", required = true)]
        targets: Vec<String>,

        /// Named engine configuration
        #[arg(long, default_value = "")]
        config: String,

        /// Start the scan right away
        #[arg(long, default_value_t = false)]
        run_now: bool,

        #[arg(long, default_value = "")]
        reporting: String,

        #[arg(long, default_value = "")]
        schedule_occurrence: String,

        #[arg(long, default_value = "")]
        schedule_time: String,

        #[arg(long, default_value = "cli")]
        source: String,

        #[command(flatten)]
        engine: EngineArgs,
    },
    /// List registered scans
    List {
        /// Only scans whose name contains this
        #[arg(long)]
        search: Option<String>,
    },
    /// Show one scan as JSON
    Show { id: i64 },
    /// Run a registered scan now
    Run {
        id: i64,

        #[command(flatten)]
        engine: EngineArgs,
    },
}

impl EngineArgs {
    fn options(&self, verbose: bool) -> Vec<ScanOption> {
        let mut options = vec![
            with_concurrency(self.concurrency),
            with_rate_limit(self.rate_limit),
            with_rate_limit_minute(self.rate_limit_minute),
            with_timeout(Duration::from_secs(self.timeout)),
            with_retries(self.retries),
            with_template_ids(self.template_ids.clone()),
            with_tags(self.tags.clone()),
            with_exclude_tags(self.exclude_tags.clone()),
            with_severities(self.severity.clone()),
            with_headers(self.headers.clone()),
            with_verbose(verbose),
        ];
        if self.no_color {
            options.push(without_color());
        }
        options
    }

    fn rate_label(&self) -> String {
        if self.rate_limit_minute > 0 {
            format!("{}/min", self.rate_limit_minute)
        } else if self.rate_limit > 0 {
            format!("{}/s", self.rate_limit)
        } else {
            "unlimited".to_string()
        }
    }

    fn builder(&self, verbose: bool) -> Result<EngineBuilder> {
        let output: Arc<dyn OutputWriter> = if self.json {
            Arc::new(JsonLinesWriter::new(std::io::stdout()))
        } else {
            Arc::new(ConsoleWriter::stdout(Colorizer::new(!self.no_color)))
        };
        let mut builder = EngineBuilder::new(self.options(verbose))?
            .catalog(Arc::new(DirCatalog::new(self.templates_dir.clone())))
            .output(output);
        if let Some(server) = &self.interaction_server {
            builder = builder.interactions(Arc::new(StaticInteractions::new(server.clone())));
        }
        Ok(builder)
    }

    fn banner(&self, targets: usize) {
        print_banner(&BannerInfo {
            templates_dir: &self.templates_dir,
            targets,
            concurrency: self.concurrency,
            rate_limit: &self.rate_label(),
            output: if self.json { "json lines" } else { "console" },
        });
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    match cli.command {
        Command::Scan(args) => scan(args, cli.verbose).await,
        Command::Scans { db, action } => {
            let registry: Arc<dyn ScanRegistry> = Arc::new(
                SqliteRegistry::new(&db)
                    .with_context(|| format!("failed to open {}", db.display()))?,
            );
            scans(action, registry, cli.verbose).await
        }
    }
}

async fn scan(args: ScanArgs, verbose: bool) -> Result<()> {
    let builder = args.engine.builder(verbose)?;
    if !args.engine.json {
        args.engine.banner(args.targets.len());
    }
    let engine = builder.build();
    let started = Instant::now();

    // Ctrl+C stops new requests; in-flight ones still drain.
    let (cancel, cancelled) = watch::channel(false);
    let result = {
        let run = engine.execute_with_cancel(&args.targets, Vec::new(), cancelled);
        tokio::pin!(run);
        tokio::select! {
            result = &mut run => result,
            _ = tokio::signal::ctrl_c() => {
                eprintln!("\ninterrupted, draining in-flight requests");
                let _ = cancel.send(true);
                run.await
            }
        }
    };

    print_scan_summary(engine.progress(), started.elapsed());
    engine.close()?;
    result?;
    Ok(())
}

async fn scans(action: ScansAction, registry: Arc<dyn ScanRegistry>, verbose: bool) -> Result<()> {
    match action {
        ScansAction::Add {
            name,
            templates,
            targets,
            config,
            run_now,
            reporting,
            schedule_occurrence,
            schedule_time,
            source,
            engine,
        } => {
            let scan = NewScan {
                name,
                templates,
                targets,
                config,
                run_now,
                reporting,
                schedule_occurrence,
                schedule_time,
                source,
            };
            if !run_now {
                let id = registry.add_scan(scan).await?;
                println!("scan {id} registered");
                return Ok(());
            }
            let id = with_service(&engine, &registry, verbose, |service| async move {
                service.submit(scan).await
            })
            .await?;
            print_record(registry.as_ref(), id).await
        }
        ScansAction::List { search } => {
            for record in registry.scans(search.as_deref()).await? {
                println!(
                    "{:>4}  {:<9}  {:<24}  {:>4} hosts  {:>7.1}s",
                    record.id,
                    record.status,
                    record.scan.name,
                    record.hosts,
                    record.scan_time().as_secs_f64(),
                );
            }
            Ok(())
        }
        ScansAction::Show { id } => print_record(registry.as_ref(), id).await,
        ScansAction::Run { id, engine } => {
            with_service(&engine, &registry, verbose, |service| async move {
                service.run(id).await
            })
            .await?;
            print_record(registry.as_ref(), id).await
        }
    }
}

/// Build an engine, hand a service over it to `f`, wait for every scan it
/// started, then close the engine.
async fn with_service<F, Fut, T>(
    args: &EngineArgs,
    registry: &Arc<dyn ScanRegistry>,
    verbose: bool,
    f: F,
) -> Result<T>
where
    F: FnOnce(Arc<ScanService>) -> Fut,
    Fut: std::future::Future<Output = Result<T>>,
{
    let engine: Arc<ThreadSafeEngine> = Arc::new(args.builder(verbose)?.build());
    let service = Arc::new(ScanService::new(Arc::clone(&engine), Arc::clone(registry)));
    let started = Instant::now();

    let result = f(Arc::clone(&service)).await;
    service.drain().await;
    drop(service);

    print_scan_summary(engine.progress(), started.elapsed());
    match Arc::into_inner(engine) {
        Some(engine) => engine.close()?,
        None => bail!("engine still in use after all scans drained"),
    }
    result
}

async fn print_record(registry: &dyn ScanRegistry, id: i64) -> Result<()> {
    let record: ScanRecord = registry
        .scan(id)
        .await?
        .with_context(|| format!("scan {id} not found"))?;
    println!("{}", serde_json::to_string_pretty(&record)?);
    Ok(())
}
