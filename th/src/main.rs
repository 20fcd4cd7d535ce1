//! th - rate- and concurrency-bounded HTTP batch dispatcher
//!
//! CLI entry point for running batches and searching for a sustainable rate.

use std::fs;
use std::sync::Arc;

use clap::Parser;
use colored::Colorize;
use eyre::{Context, Result};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use throttler::cli::{Cli, Command, LimitArgs, OutputFormat, SearchArgs, TargetArgs, apply_timeout, get_log_path};
use throttler::config::Config;
use throttler::error::ItemError;
use throttler::events::{EventBus, spawn_event_logger};
use throttler::finder::{RateFinder, RateSearch};
use throttler::http::{HttpProbe, ProbeError, ProbeResponse};
use throttler::scheduler::{BatchResult, Scheduler};
use throttler::stats::BatchStats;

fn setup_logging(cli_log_level: Option<&str>, config_log_level: Option<&str>) -> Result<()> {
    let log_path = get_log_path();
    if let Some(log_dir) = log_path.parent() {
        fs::create_dir_all(log_dir).context("Failed to create log directory")?;
    }

    // Priority: CLI --log-level > config file > INFO
    let level = match cli_log_level.or(config_log_level) {
        Some(s) => match s.to_uppercase().as_str() {
            "TRACE" => tracing::Level::TRACE,
            "DEBUG" => tracing::Level::DEBUG,
            "INFO" => tracing::Level::INFO,
            "WARN" | "WARNING" => tracing::Level::WARN,
            "ERROR" => tracing::Level::ERROR,
            _ => {
                eprintln!("Warning: Unknown log-level '{}', defaulting to INFO", s);
                tracing::Level::INFO
            }
        },
        None => tracing::Level::INFO,
    };

    let log_file = fs::File::create(&log_path).context("Failed to create log file")?;

    tracing_subscriber::fmt()
        .with_writer(log_file)
        .with_ansi(false)
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env().add_directive(level.into()))
        .init();

    info!("Logging initialized (level: {:?})", level);
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Load log level from config file early (before full config load)
    let config_log_level = Config::load_log_level(cli.config.as_ref());

    setup_logging(cli.log_level.as_deref(), config_log_level.as_deref()).context("Failed to setup logging")?;

    let config = Config::load(cli.config.as_ref()).context("Failed to load configuration")?;

    debug!(command = ?cli.command, "main: dispatching command");
    match cli.command {
        Command::Run {
            targets,
            limits,
            timeout_ms,
            format,
        } => {
            debug!("main: matched Run command");
            cmd_run(&config, &targets, &limits, timeout_ms, format).await
        }
        Command::FindRate {
            targets,
            search,
            concurrency,
            timeout_ms,
            format,
        } => {
            debug!("main: matched FindRate command");
            cmd_find_rate(&config, &targets, &search, concurrency, timeout_ms, format).await
        }
        Command::Config => {
            debug!("main: matched Config command");
            cmd_config(&config)
        }
    }
}

/// Cancel `token` on Ctrl-C
fn cancel_on_ctrl_c(token: CancellationToken) {
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupted, cancelling batch");
            eprintln!("{}", "Interrupted, cancelling...".yellow());
            token.cancel();
        }
    });
}

/// Run one batch of GETs
async fn cmd_run(
    config: &Config,
    targets: &TargetArgs,
    limits: &LimitArgs,
    timeout_ms: Option<u64>,
    format: OutputFormat,
) -> Result<()> {
    debug!(?limits, ?timeout_ms, %format, "cmd_run: called");
    let mut scheduler_config = config.scheduler.clone();
    limits.apply(&mut scheduler_config);
    let mut http_config = config.http.clone();
    apply_timeout(timeout_ms, &mut http_config);

    let bus = Arc::new(EventBus::with_default_capacity());
    let event_logger = spawn_event_logger(&bus);
    let scheduler = Scheduler::new(scheduler_config)
        .context("Invalid scheduler configuration")?
        .with_events(bus.clone());
    let targets = targets.load()?;
    let probe = HttpProbe::new(&http_config).context("Failed to build HTTP client")?;

    let cancel = CancellationToken::new();
    cancel_on_ctrl_c(cancel.clone());

    let batch = scheduler
        .run_until_cancelled(
            targets.clone(),
            move |url| {
                let probe = probe.clone();
                async move { probe.get(url).await }
            },
            cancel,
        )
        .await;

    // Closing the last sender lets the logger drain and exit
    drop(scheduler);
    drop(bus);
    match event_logger.await {
        Ok(logged) => debug!(logged, "cmd_run: event logger finished"),
        Err(e) => warn!(error = %e, "cmd_run: event logger task failed"),
    }
    let stats = BatchStats::from_batch(&batch).with_status_counts(&batch, |response| response.status);

    match format {
        OutputFormat::Json => {
            let items: Vec<_> = batch
                .iter()
                .map(|settled| {
                    let (status, bytes, error) = match &settled.outcome {
                        Ok(response) => (Some(response.status), Some(response.bytes), None),
                        Err(e) => (None, None, Some(e.to_string())),
                    };
                    serde_json::json!({
                        "index": settled.index,
                        "url": targets[settled.index],
                        "status": status,
                        "bytes": bytes,
                        "error": error,
                        "latency_secs": settled.latency().map(|l| l.as_secs_f64()),
                    })
                })
                .collect();
            let report = serde_json::json!({
                "run_id": batch.run_id,
                "started_at": batch.started_at,
                "elapsed_ms": batch.elapsed.as_millis() as u64,
                "cancelled": batch.cancelled,
                "launched": batch.launched,
                "peak_in_flight": batch.peak_in_flight,
                "items": items,
                "stats": stats,
            });
            println!("{}", serde_json::to_string_pretty(&report)?);
        }
        OutputFormat::Text => print_run_report(&targets, &batch, &stats),
    }
    Ok(())
}

fn print_run_report(targets: &[String], batch: &BatchResult<ProbeResponse, ProbeError>, stats: &BatchStats) {
    for settled in batch {
        let url = &targets[settled.index];
        let latency = settled
            .latency()
            .map(|l| format!("{:.3}s", l.as_secs_f64()))
            .unwrap_or_default();
        let line = match &settled.outcome {
            Ok(response) if response.is_success() => {
                format!("{} {} {}", response.status.to_string().green(), url, latency.dimmed())
            }
            Ok(response) => format!("{} {} {}", response.status.to_string().yellow(), url, latency.dimmed()),
            Err(ItemError::Cancelled) => format!("{} {}", "---".dimmed(), url.dimmed()),
            Err(e) => format!("{} {} {}", "ERR".red(), url, e.to_string().red()),
        };
        println!("{:>4} {}", settled.index, line);
    }

    println!();
    println!("{}", "Summary".bold());
    println!("  Run:          {}", batch.run_id);
    println!("  Elapsed:      {:.3}s", batch.elapsed.as_secs_f64());
    println!(
        "  Requests:     {} ok, {} failed, {} cancelled",
        stats.succeeded.to_string().green(),
        stats.failed.to_string().red(),
        stats.cancelled
    );
    println!("  Error rate:   {:.1}%", stats.error_rate * 100.0);
    println!("  Peak flight:  {}", batch.peak_in_flight);
    if let Some(latency) = &stats.latency {
        println!(
            "  Latency:      mean {:.4}s, std {:.4}s, min {:.4}s, max {:.4}s",
            latency.mean, latency.std_dev, latency.min, latency.max
        );
    }
    if !stats.status_distribution.is_empty() {
        let statuses: Vec<String> = stats
            .status_distribution
            .iter()
            .map(|(code, count)| format!("{}: {}", code, count))
            .collect();
        println!("  Statuses:     {}", statuses.join(", "));
    }
    if batch.cancelled {
        println!("  {}", "Batch was cancelled before all requests settled".yellow());
    }
}

/// Search for the highest rate the targets sustain
async fn cmd_find_rate(
    config: &Config,
    targets: &TargetArgs,
    search: &SearchArgs,
    concurrency: Option<usize>,
    timeout_ms: Option<u64>,
    format: OutputFormat,
) -> Result<()> {
    debug!(?search, ?concurrency, ?timeout_ms, %format, "cmd_find_rate: called");
    let mut base = config.scheduler.clone();
    if let Some(concurrency) = concurrency {
        base.concurrency = concurrency;
    }
    let mut finder_config = config.finder.clone();
    search.apply(&mut finder_config);
    let mut http_config = config.http.clone();
    apply_timeout(timeout_ms, &mut http_config);

    let finder = RateFinder::new(finder_config, base).context("Invalid finder configuration")?;
    let targets = targets.load()?;
    let probe = HttpProbe::new(&http_config).context("Failed to build HTTP client")?;

    let cancel = CancellationToken::new();
    cancel_on_ctrl_c(cancel.clone());

    let result = finder
        .search_targets(
            targets,
            move |url| {
                let probe = probe.clone();
                async move { probe.get(url).await }
            },
            |response: &ProbeResponse| response.status,
            cancel,
        )
        .await?;

    match format {
        OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&result)?),
        OutputFormat::Text => print_search_report(&result),
    }
    Ok(())
}

fn print_search_report(search: &RateSearch) {
    for trial in &search.trials {
        let verdict = match &trial.rejection {
            None => "ok".green().to_string(),
            Some(reason) => format!("{} ({})", "too fast".red(), reason),
        };
        let mean = trial
            .stats
            .mean_latency()
            .map(|m| format!("{:.4}s", m))
            .unwrap_or_else(|| "-".to_string());
        println!(
            "{:>3}  rate {:>8.3}  mean {:>9} / {:.4}s  errors {:>5.1}%  {}",
            trial.iteration,
            trial.rate,
            mean,
            trial.latency_threshold,
            trial.stats.error_rate * 100.0,
            verdict
        );
    }

    println!();
    match search.best_rate {
        Some(rate) => println!("{} {:.3} requests per period", "Best rate:".bold(), rate),
        None => println!("{}", "No acceptable rate found in the search range".yellow()),
    }
}

/// Print the effective configuration
fn cmd_config(config: &Config) -> Result<()> {
    debug!("cmd_config: called");
    print!("{}", serde_yaml::to_string(config).context("Failed to serialize config")?);
    Ok(())
}
