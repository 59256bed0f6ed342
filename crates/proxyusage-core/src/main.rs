//! ProxyUsage CLI
//!
//! Command-line interface for the ProxyUsage analytics service.

use std::process::ExitCode;
use std::sync::Arc;

use anyhow::Context;
use chrono::{NaiveDate, Utc};
use clap::{Parser, Subcommand};
use dialoguer::Confirm;
use metrics_exporter_prometheus::PrometheusBuilder;
use serde::Serialize;
use tracing::info;

use proxyusage::api::{AppState, HttpServer};
use proxyusage::db::{self, ResetScope, UsageStore};
use proxyusage::models::{ModelPrice, OverviewRequest};
use proxyusage::query::normalize_request;
use proxyusage::rollup::{backfill, BackfillOptions, Backfiller, BucketClock};
use proxyusage::Config;

/// ProxyUsage - usage and cost analytics for LLM proxies
#[derive(Parser)]
#[command(name = "proxyusage")]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
struct Cli {
    /// Configuration file path
    #[arg(short, long, global = true, env = "PROXYUSAGE_CONFIG")]
    config: Option<String>,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Output format (for commands that support it)
    #[arg(long, global = true, default_value = "text")]
    format: OutputFormat,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Clone, Copy, Debug, Default, clap::ValueEnum)]
enum OutputFormat {
    #[default]
    Text,
    Json,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the HTTP API server
    Serve {
        /// HTTP API port (overrides server.port)
        #[arg(long, env = "PROXYUSAGE_HTTP_PORT")]
        http_port: Option<u16>,
    },

    /// Pull the upstream usage snapshot once
    Sync,

    /// Print a usage overview
    Overview {
        /// Relative window in days
        #[arg(long)]
        days: Option<String>,

        /// Custom range start (YYYY-MM-DD)
        #[arg(long)]
        start: Option<String>,

        /// Custom range end (YYYY-MM-DD)
        #[arg(long)]
        end: Option<String>,

        /// Model filter
        #[arg(long)]
        model: Option<String>,

        /// Route filter
        #[arg(long)]
        route: Option<String>,

        /// Page of the model list
        #[arg(long)]
        page: Option<String>,

        /// Models per page
        #[arg(long)]
        page_size: Option<String>,

        /// Force a storage path (raw, rollup, auto)
        #[arg(long)]
        source: Option<String>,
    },

    /// Manage model prices
    Prices {
        #[command(subcommand)]
        command: PricesCommands,
    },

    /// Rebuild rollups from raw records
    Backfill {
        /// First local day (defaults to the earliest raw event)
        #[arg(long)]
        from: Option<NaiveDate>,

        /// Last local day (defaults to today)
        #[arg(long)]
        to: Option<NaiveDate>,

        /// hourly, daily or both
        #[arg(long, default_value = "both")]
        granularity: String,

        /// Preview the buckets without writing
        #[arg(long)]
        dry_run: bool,
    },

    /// Database management
    Db {
        #[command(subcommand)]
        command: DbCommands,
    },

    /// Show system health status
    Health,
}

#[derive(Subcommand)]
enum PricesCommands {
    /// List prices
    List,

    /// Insert or replace a price (per one million tokens)
    Set {
        /// Model name; a trailing `*` matches by prefix
        model: String,

        /// Prompt token price
        #[arg(long)]
        input: f64,

        /// Cached prompt token price
        #[arg(long, default_value = "0")]
        cached: f64,

        /// Completion token price
        #[arg(long)]
        output: f64,
    },

    /// Delete a price
    Delete {
        /// Model name
        model: String,
    },
}

#[derive(Subcommand)]
enum DbCommands {
    /// Run database migrations
    Migrate,

    /// Reset database (WARNING: deletes all usage records)
    Reset {
        /// Also wipe the rollup tables
        #[arg(long)]
        rollups: bool,

        /// Skip confirmation prompt
        #[arg(long)]
        force: bool,
    },
}

#[tokio::main]
async fn main() -> ExitCode {
    // Parse CLI arguments
    let cli = Cli::parse();

    // .env is optional
    let _ = dotenvy::dotenv();

    // Load configuration
    let config = match Config::load(cli.config.as_deref()) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("Error loading configuration: {e}");
            return ExitCode::FAILURE;
        }
    };

    init_logging(&config, cli.verbose);

    // Execute command
    let result = match cli.command {
        Commands::Serve { http_port } => run_serve(config, http_port).await,
        Commands::Sync => run_sync(config, cli.format).await,
        Commands::Overview {
            days,
            start,
            end,
            model,
            route,
            page,
            page_size,
            source,
        } => {
            let request = OverviewRequest {
                days,
                start,
                end,
                model,
                route,
                page,
                page_size,
                preagg: source,
            };
            run_overview(config, &request, cli.format).await
        }
        Commands::Prices { command } => run_prices(config, command, cli.format).await,
        Commands::Backfill {
            from,
            to,
            granularity,
            dry_run,
        } => run_backfill(config, from, to, &granularity, dry_run, cli.format).await,
        Commands::Db { command } => run_db(config, command).await,
        Commands::Health => run_health(config).await,
    };

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("Error: {e:#}");
            ExitCode::FAILURE
        }
    }
}

fn init_logging(config: &Config, verbose: bool) {
    let level = if verbose { "debug" } else { config.logging.level.as_str() };
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(level));

    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    if config.logging.format == "json" {
        builder.json().init();
    } else {
        builder.init();
    }
}

fn print<T: Serialize + std::fmt::Debug>(value: &T, format: OutputFormat) -> anyhow::Result<()> {
    match format {
        OutputFormat::Json => println!("{}", serde_json::to_string_pretty(value)?),
        OutputFormat::Text => println!("{value:#?}"),
    }
    Ok(())
}

async fn open_store(config: &Config) -> anyhow::Result<Arc<dyn UsageStore>> {
    db::connect(config)
        .await
        .context("failed to open usage store")
}

async fn run_serve(config: Config, http_port: Option<u16>) -> anyhow::Result<()> {
    let recorder = PrometheusBuilder::new()
        .install_recorder()
        .context("failed to install metrics recorder")?;

    let store = open_store(&config).await?;
    let state = AppState::new(&config, store)?.with_metrics(recorder);
    let addr = format!(
        "{}:{}",
        config.server.host,
        http_port.unwrap_or(config.server.port)
    );
    info!(rollup_reads = config.rollup.read_enabled, rollup_writes = config.rollup.write_enabled, "Starting ProxyUsage on {}", addr);

    HttpServer::new(state).serve(&addr).await?;
    Ok(())
}

async fn run_sync(config: Config, format: OutputFormat) -> anyhow::Result<()> {
    let store = open_store(&config).await?;
    let state = AppState::new(&config, store)?;
    let report = state.sync.sync_now().await?;
    print(&report, format)
}

async fn run_overview(config: Config, request: &OverviewRequest, format: OutputFormat) -> anyhow::Result<()> {
    let store = open_store(&config).await?;
    let state = AppState::new(&config, store)?;
    let params = normalize_request(request, &state.clock)?;
    let result = state.overview.build(&params, Utc::now()).await?;

    match format {
        OutputFormat::Json => print(&result, format),
        OutputFormat::Text => {
            let o = &result.overview;
            println!("Usage over {} day(s)", result.days);
            println!("  Requests: {} ({} failed, success rate {:.2}%)", o.total_requests, o.failure_count, o.success_rate * 100.0);
            println!("  Tokens:   {} (in {}, out {}, cached {})", o.total_tokens, o.total_input_tokens, o.total_output_tokens, o.total_cached_tokens);
            println!("  Cost:     {:.4}", o.total_cost);
            println!();
            for m in &o.models {
                let cost = if m.priced { format!("{:.4}", m.cost) } else { "unpriced".to_string() };
                println!("  {:<40} {:>10} req {:>14} tok  {}", m.model, m.requests, m.tokens, cost);
            }
            println!(
                "  page {}/{} ({} models)",
                result.meta.page, result.meta.total_pages, result.meta.total_models
            );
            Ok(())
        }
    }
}

async fn run_prices(config: Config, command: PricesCommands, format: OutputFormat) -> anyhow::Result<()> {
    let store = open_store(&config).await?;
    match command {
        PricesCommands::List => {
            let prices = store.list_prices().await?;
            match format {
                OutputFormat::Json => print(&prices, format)?,
                OutputFormat::Text => {
                    for p in prices {
                        println!(
                            "{:<40} in {:>8} cached {:>8} out {:>8}",
                            p.model, p.input_price_per_1m, p.cached_input_price_per_1m, p.output_price_per_1m
                        );
                    }
                }
            }
        }
        PricesCommands::Set {
            model,
            input,
            cached,
            output,
        } => {
            let price = ModelPrice::from_json(&serde_json::json!({
                "model": model,
                "inputPricePer1M": input,
                "cachedInputPricePer1M": cached,
                "outputPricePer1M": output,
            }))?;
            store.upsert_price(&price).await?;
            println!("Saved price for {}", price.model);
        }
        PricesCommands::Delete { model } => {
            if store.delete_price(&model).await? {
                println!("Deleted price for {model}");
            } else {
                println!("No price configured for {model}");
            }
        }
    }
    Ok(())
}

async fn run_backfill(
    config: Config,
    from: Option<NaiveDate>,
    to: Option<NaiveDate>,
    granularity: &str,
    dry_run: bool,
    format: OutputFormat,
) -> anyhow::Result<()> {
    let store = open_store(&config).await?;
    let clock = BucketClock::from_config(&config.rollup)?;
    let options = BackfillOptions {
        from,
        to,
        intervals: backfill::parse_granularity(granularity)?,
        dry_run,
    };

    let report = Backfiller::new(store, clock).run(&options, Utc::now()).await?;
    match format {
        OutputFormat::Json => print(&report, format),
        OutputFormat::Text => {
            let (Some(from), Some(to)) = (report.from, report.to) else {
                println!("No raw usage records; nothing to backfill");
                return Ok(());
            };
            println!("Backfill {from} .. {to}{}", if report.dry_run { " (dry run)" } else { "" });
            for table in &report.intervals {
                match &table.preview {
                    Some(preview) => {
                        println!("  {}: {} bucket(s) would be written", table.interval, preview.total_buckets);
                        for b in &preview.buckets {
                            println!(
                                "    {}  {}  {}  {} record(s)",
                                clock.render(b.bucket_start),
                                b.route,
                                b.model,
                                b.record_count
                            );
                        }
                    }
                    None => println!("  {}: {} bucket(s) rebuilt", table.interval, table.buckets_written),
                }
            }
            Ok(())
        }
    }
}

async fn run_db(config: Config, command: DbCommands) -> anyhow::Result<()> {
    let store = open_store(&config).await?;
    match command {
        DbCommands::Migrate => {
            store.migrate().await?;
            println!("Migrations applied");
        }
        DbCommands::Reset { rollups, force } => {
            if config.environment.is_production() {
                anyhow::bail!("reset is disabled in production");
            }
            if !force {
                let what = if rollups { "usage records and rollups" } else { "usage records" };
                let confirmed = Confirm::new()
                    .with_prompt(format!("This deletes all {what}. Continue?"))
                    .default(false)
                    .interact()?;
                if !confirmed {
                    println!("Aborted");
                    return Ok(());
                }
            }
            let scope = if rollups {
                ResetScope::RawAndRollups
            } else {
                ResetScope::RawOnly
            };
            let summary = store.reset(scope).await?;
            println!(
                "Deleted {} usage record(s) and {} rollup row(s)",
                summary.raw_deleted, summary.rollups_deleted
            );
        }
    }
    Ok(())
}

async fn run_health(config: Config) -> anyhow::Result<()> {
    println!("System Health Check");
    let store = open_store(&config).await?;
    match store.health_check().await {
        Ok(()) => println!("Database:  connected"),
        Err(e) => {
            println!("Database:  unavailable ({e})");
            anyhow::bail!("health check failed");
        }
    }
    let upstream = if config.upstream.base_url.trim().is_empty() {
        "not configured"
    } else {
        config.upstream.base_url.as_str()
    };
    println!("Upstream:  {upstream}");
    println!("Auth:      {}", if config.has_auth_secret() { "configured" } else { "missing secret" });
    Ok(())
}
