//! CLI command definitions and subcommands

use clap::{Args, Parser, Subcommand};
use eyre::{Context, Result};
use std::fs;
use std::path::PathBuf;
use tracing::debug;

use crate::finder::FinderConfig;
use crate::gate::RateAlgorithm;
use crate::http::HttpConfig;
use crate::scheduler::SchedulerConfig;

/// th - rate- and concurrency-bounded HTTP batch dispatcher
#[derive(Parser)]
#[command(
    name = "th",
    about = "Dispatch batches of HTTP requests under a rate limit and a concurrency limit",
    version = env!("GIT_DESCRIBE"),
    after_help = after_help(),
)]
pub struct Cli {
    /// Path to config file
    #[arg(short, long, global = true, help = "Path to config file")]
    pub config: Option<PathBuf>,

    /// Log level (TRACE, DEBUG, INFO, WARN, ERROR)
    #[arg(
        short = 'l',
        long = "log-level",
        global = true,
        help = "Log level (TRACE, DEBUG, INFO, WARN, ERROR)"
    )]
    pub log_level: Option<String>,

    /// Subcommand to execute
    #[command(subcommand)]
    pub command: Command,
}

/// CLI subcommands
#[derive(Debug, Subcommand)]
pub enum Command {
    /// Send one GET per target under the configured limits
    Run {
        #[command(flatten)]
        targets: TargetArgs,

        #[command(flatten)]
        limits: LimitArgs,

        /// Per-request timeout in milliseconds
        #[arg(long)]
        timeout_ms: Option<u64>,

        /// Output format (text, json)
        #[arg(short = 'o', long, default_value = "text")]
        format: OutputFormat,
    },

    /// Search for the highest rate the targets sustain
    FindRate {
        #[command(flatten)]
        targets: TargetArgs,

        #[command(flatten)]
        search: SearchArgs,

        /// Max requests in flight during each trial
        #[arg(short = 'n', long)]
        concurrency: Option<usize>,

        /// Per-request timeout in milliseconds
        #[arg(long)]
        timeout_ms: Option<u64>,

        /// Output format (text, json)
        #[arg(short = 'o', long, default_value = "text")]
        format: OutputFormat,
    },

    /// Print the effective configuration as YAML
    Config,
}

/// Where the target URLs come from
#[derive(Debug, Clone, Args)]
pub struct TargetArgs {
    /// Target URLs
    #[arg(value_name = "URL")]
    pub urls: Vec<String>,

    /// File with one URL per line (blank lines and # comments ignored)
    #[arg(short = 'f', long = "file", value_name = "FILE")]
    pub file: Option<PathBuf>,
}

impl TargetArgs {
    /// Collect the URLs from the arguments and the target file, in that order
    pub fn load(&self) -> Result<Vec<String>> {
        debug!(urls = self.urls.len(), file = ?self.file, "TargetArgs::load: called");
        let mut targets = self.urls.clone();

        if let Some(path) = &self.file {
            let content =
                fs::read_to_string(path).context(format!("Failed to read target file {}", path.display()))?;
            targets.extend(parse_targets(&content));
        }

        if targets.is_empty() {
            return Err(eyre::eyre!("No targets given. Pass URLs or --file FILE."));
        }
        debug!(count = targets.len(), "TargetArgs::load: loaded targets");
        Ok(targets)
    }
}

/// One URL per line; blank lines and `#` comments are skipped
pub fn parse_targets(content: &str) -> Vec<String> {
    content
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty() && !line.starts_with('#'))
        .map(String::from)
        .collect()
}

/// Scheduler limit overrides
#[derive(Debug, Clone, Default, Args)]
pub struct LimitArgs {
    /// Max requests started per period
    #[arg(short = 'r', long)]
    pub rate: Option<f64>,

    /// Max requests in flight
    #[arg(short = 'n', long)]
    pub concurrency: Option<usize>,

    /// Rate period in milliseconds
    #[arg(long)]
    pub period_ms: Option<u64>,

    /// Rate limiting algorithm
    #[arg(long, value_enum)]
    pub algorithm: Option<RateAlgorithm>,
}

impl LimitArgs {
    pub fn apply(&self, config: &mut SchedulerConfig) {
        if let Some(rate) = self.rate {
            config.rate = rate;
        }
        if let Some(concurrency) = self.concurrency {
            config.concurrency = concurrency;
        }
        if let Some(period_ms) = self.period_ms {
            config.period_ms = period_ms;
        }
        if let Some(algorithm) = self.algorithm {
            config.algorithm = algorithm;
        }
    }
}

/// Rate finder overrides
#[derive(Debug, Clone, Default, Args)]
pub struct SearchArgs {
    /// Lowest rate to try
    #[arg(long)]
    pub min_rate: Option<f64>,

    /// Highest rate to try
    #[arg(long)]
    pub max_rate: Option<f64>,

    /// Number of trial batches
    #[arg(long)]
    pub max_iterations: Option<u32>,

    /// Highest acceptable share of failed requests
    #[arg(long)]
    pub error_threshold: Option<f64>,

    /// Highest acceptable share of 429/500 answers
    #[arg(long)]
    pub bad_status_threshold: Option<f64>,
}

impl SearchArgs {
    pub fn apply(&self, config: &mut FinderConfig) {
        if let Some(min_rate) = self.min_rate {
            config.min_rate = min_rate;
        }
        if let Some(max_rate) = self.max_rate {
            config.max_rate = max_rate;
        }
        if let Some(max_iterations) = self.max_iterations {
            config.max_iterations = max_iterations;
        }
        if let Some(error_threshold) = self.error_threshold {
            config.error_threshold = error_threshold;
        }
        if let Some(bad_status_threshold) = self.bad_status_threshold {
            config.bad_status_threshold = bad_status_threshold;
        }
    }
}

/// Apply a `--timeout-ms` override
pub fn apply_timeout(timeout_ms: Option<u64>, config: &mut HttpConfig) {
    if let Some(timeout_ms) = timeout_ms {
        config.timeout_ms = timeout_ms;
    }
}

/// Get the log file path
pub fn get_log_path() -> PathBuf {
    debug!("get_log_path: called");
    let path = dirs::data_local_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("throttler")
        .join("logs")
        .join("throttler.log");
    debug!(?path, "get_log_path: returning path");
    path
}

fn after_help() -> String {
    format!("Logs are written to: {}", get_log_path().display())
}

/// Output format for run/find-rate reports
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum OutputFormat {
    #[default]
    Text,
    Json,
}

impl std::str::FromStr for OutputFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        debug!(%s, "OutputFormat::from_str: called");
        match s.to_lowercase().as_str() {
            "text" | "plain" => Ok(Self::Text),
            "json" => Ok(Self::Json),
            _ => {
                debug!(%s, "OutputFormat::from_str: unknown format");
                Err(format!("Unknown format: {}. Use: text or json", s))
            }
        }
    }
}

impl std::fmt::Display for OutputFormat {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Text => write!(f, "text"),
            Self::Json => write!(f, "json"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;
    use tempfile::TempDir;

    #[test]
    fn test_cli_definition_is_valid() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_parse_run() {
        let cli = Cli::try_parse_from([
            "th",
            "-l",
            "debug",
            "run",
            "http://a.test/",
            "http://b.test/",
            "--rate",
            "2.5",
            "-n",
            "3",
            "--algorithm",
            "sliding-log",
            "-o",
            "json",
        ])
        .unwrap();

        assert_eq!(cli.log_level.as_deref(), Some("debug"));
        let Command::Run {
            targets,
            limits,
            timeout_ms,
            format,
        } = cli.command
        else {
            panic!("expected run command");
        };
        assert_eq!(targets.urls.len(), 2);
        assert_eq!(limits.rate, Some(2.5));
        assert_eq!(limits.concurrency, Some(3));
        assert_eq!(limits.algorithm, Some(RateAlgorithm::SlidingLog));
        assert_eq!(timeout_ms, None);
        assert_eq!(format, OutputFormat::Json);

        let mut config = SchedulerConfig::default();
        limits.apply(&mut config);
        assert_eq!(config.rate, 2.5);
        assert_eq!(config.concurrency, 3);
        assert_eq!(config.period_ms, 1000);
        assert_eq!(config.algorithm, RateAlgorithm::SlidingLog);
    }

    #[test]
    fn test_parse_find_rate_overrides() {
        let cli = Cli::try_parse_from([
            "th",
            "find-rate",
            "http://a.test/",
            "--max-rate",
            "40",
            "--max-iterations",
            "4",
        ])
        .unwrap();

        let Command::FindRate { search, .. } = cli.command else {
            panic!("expected find-rate command");
        };
        let mut config = FinderConfig::default();
        search.apply(&mut config);
        assert_eq!(config.max_rate, 40.0);
        assert_eq!(config.max_iterations, 4);
        assert_eq!(config.min_rate, 1.0);
    }

    #[test]
    fn test_parse_targets_skips_blanks_and_comments() {
        let content = "# staging\nhttp://a.test/\n\n   \n  http://b.test/  \n# http://c.test/\n";
        assert_eq!(parse_targets(content), vec!["http://a.test/", "http://b.test/"]);
    }

    #[test]
    fn test_target_args_load() {
        let dir = TempDir::new().unwrap();
        let file = dir.path().join("targets.txt");
        fs::write(&file, "http://b.test/\nhttp://c.test/\n").unwrap();

        let args = TargetArgs {
            urls: vec!["http://a.test/".to_string()],
            file: Some(file),
        };
        assert_eq!(
            args.load().unwrap(),
            vec!["http://a.test/", "http://b.test/", "http://c.test/"]
        );
    }

    #[test]
    fn test_target_args_empty_is_an_error() {
        let args = TargetArgs {
            urls: vec![],
            file: None,
        };
        assert!(args.load().is_err());

        let args = TargetArgs {
            urls: vec![],
            file: Some(PathBuf::from("/nonexistent/targets.txt")),
        };
        assert!(args.load().is_err());
    }

    #[test]
    fn test_output_format_from_str() {
        assert_eq!("JSON".parse::<OutputFormat>(), Ok(OutputFormat::Json));
        assert_eq!("plain".parse::<OutputFormat>(), Ok(OutputFormat::Text));
        assert!("table".parse::<OutputFormat>().is_err());
    }

    #[test]
    fn test_log_path() {
        let path = get_log_path();
        assert!(path.ends_with("throttler/logs/throttler.log"));
    }
}
