use anyhow::Result;
use clap::{Parser, Subcommand};
use scout_adapters::{LinkResolver, ResolverPolicy};
use scout_storage::HttpFetcher;
use scout_sync::{report_recent_markdown, run_watch, shutdown_on_signal, ScanConfig, ScanPipeline};
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "scout-cli")]
#[command(about = "Course coupon scout command-line interface")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Run one scan cycle over every enabled source
    Scan,
    /// Scan on an interval until Ctrl-C
    Watch {
        /// Minutes between cycles; overrides SCOUT_INTERVAL_MINUTES
        #[arg(long)]
        interval_minutes: Option<u64>,
    },
    /// Resolve a single link to its canonical destination
    Resolve {
        href: String,
        /// Page the link was found on, used to root relative links
        #[arg(long)]
        source: String,
    },
    /// Summarize recent scan runs
    Report {
        #[arg(long, default_value_t = 5)]
        runs: usize,
    },
}

fn init_tracing(config: &ScanConfig) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.log_level));
    tracing_subscriber::fmt().with_env_filter(filter).with_target(false).init();
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let mut config = ScanConfig::from_env();
    init_tracing(&config);

    match cli.command.unwrap_or(Commands::Scan) {
        Commands::Scan => {
            let summary = ScanPipeline::new(config)?.run_once().await?;
            info!(
                run_id = %summary.run_id,
                sources = summary.sources_total,
                failed = summary.sources_failed,
                emitted = summary.emitted,
                merged = summary.merged,
                reports = %summary.reports_dir,
                "scan complete"
            );
        }
        Commands::Watch { interval_minutes } => {
            if let Some(minutes) = interval_minutes {
                config.interval_minutes = minutes;
            }
            let interval = config.interval();
            info!(interval_secs = interval.as_secs(), "starting watch loop");
            let pipeline = ScanPipeline::new(config)?;
            let cycles = run_watch(&pipeline, interval, shutdown_on_signal()).await;
            info!(cycles, "watch stopped");
        }
        Commands::Resolve { href, source } => {
            let fetcher = HttpFetcher::new(config.http_client_config())?;
            let resolver = LinkResolver::new(ResolverPolicy::default());
            let resolution = resolver.resolve(&fetcher, &href, &source).await?;
            println!("{} ({:?})", resolution.url, resolution.origin);
            if let Some(nested) = resolution.nested_url() {
                println!("  nested: {nested}");
            }
        }
        Commands::Report { runs } => {
            println!("{}", report_recent_markdown(runs, &config.reports_dir)?);
        }
    }

    Ok(())
}
