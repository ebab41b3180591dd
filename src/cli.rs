//! Command line surface and logging setup.

use std::path::PathBuf;
use std::time::Duration;

use clap::{Parser, ValueEnum};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

use crate::util::{time_string_to_seconds, validate_time_string};

/// Observability experiments engine.
#[derive(Debug, Parser)]
#[command(name = "oxn", about = "Observability experiments engine", version)]
pub struct Cli {
    /// Path to an oxn experiment specification to execute.
    #[arg(value_parser = existing_file)]
    pub spec: PathBuf,

    /// Run the experiment n times.
    #[arg(long, default_value_t = 1)]
    pub times: u32,

    /// Create an experiment report at the specified location. An existing
    /// file is overwritten.
    #[arg(long)]
    pub report: Option<PathBuf>,

    /// Capture resource usage for the sue. Requires --report and adds
    /// roughly two seconds per service to each run.
    #[arg(long, requires = "report")]
    pub accounting: bool,

    /// Randomize the treatment execution order. Per default, treatments are
    /// executed in specification order.
    #[arg(long)]
    pub randomize: bool,

    /// Set the log level.
    #[arg(long, value_enum, default_value_t = LogLevel::Info)]
    pub loglevel: LogLevel,

    /// Write logs to a file instead of the console.
    #[arg(long)]
    pub logfile: Option<PathBuf>,

    /// Timeout after which we stop trying to build the SUE.
    #[arg(long, default_value = "1m", value_parser = parse_duration)]
    pub timeout: Duration,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum LogLevel {
    Debug,
    Info,
    Warning,
    Error,
    Critical,
}

impl LogLevel {
    /// The default env-filter directive for this level.
    fn directive(self) -> &'static str {
        match self {
            LogLevel::Debug => "oxn=debug",
            LogLevel::Info => "oxn=info",
            LogLevel::Warning => "oxn=warn",
            // tracing has no level above error.
            LogLevel::Error | LogLevel::Critical => "oxn=error",
        }
    }
}

fn existing_file(value: &str) -> Result<PathBuf, String> {
    let path = PathBuf::from(value);
    if path.is_file() {
        Ok(path)
    } else {
        Err(format!("Experiment specification {value} does not exist"))
    }
}

fn parse_duration(value: &str) -> Result<Duration, String> {
    if !validate_time_string(value) {
        return Err(format!(
            "{value} is not a duration string (expected e.g. 30s, 1m30s)"
        ));
    }
    Ok(Duration::from_secs_f64(time_string_to_seconds(value)))
}

/// Initialize tracing with the CLI's level and optional log file.
pub fn initialize_logging(level: LogLevel, logfile: Option<&PathBuf>) -> std::io::Result<()> {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(level.directive()));
    match logfile {
        Some(path) => {
            let file = std::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)?;
            tracing_subscriber::registry()
                .with(filter)
                .with(
                    tracing_subscriber::fmt::layer()
                        .with_writer(std::sync::Arc::new(file))
                        .with_ansi(false),
                )
                .init();
        }
        None => {
            tracing_subscriber::registry()
                .with(filter)
                .with(tracing_subscriber::fmt::layer())
                .init();
        }
    }
    Ok(())
}
