//! Serialtest - run an example's serial test plan against a device
//!
//! Opens the serial link, puts the device into test mode and uploads every
//! test input listed in the example's plan, checking each inference result.

use anyhow::Context;
use clap::builder::PossibleValuesParser;
use clap::{Parser, ValueEnum};
use serialtest_core::config::{self, EXAMPLES};
use serialtest_core::{
    CliResult, ExitCodes, FilePayloadResolver, HarnessError, HarnessSettings, LineChannel,
    LinkConfig, ResponseDispatcher, SerialLink, TestPlan, TestResults, TestSequencer,
    TransportPort,
};
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{fmt, EnvFilter};

/// Log detail
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum Verbosity {
    /// Test progress and verdicts
    Test,
    /// Test progress plus every line on the wire
    All,
}

impl Verbosity {
    fn filter(self) -> &'static str {
        match self {
            Self::Test => "info",
            Self::All => "debug",
        }
    }
}

/// Serialtest CLI
#[derive(Parser, Debug)]
#[command(
    name = "serialtest",
    version,
    about = "Run serial test plans against embedded inference examples",
    long_about = None
)]
struct Cli {
    /// Example whose test plan to run
    #[arg(
        short,
        long,
        required_unless_present = "list_ports",
        value_parser = PossibleValuesParser::new(EXAMPLES.iter().copied())
    )]
    example: Option<String>,

    /// Log detail
    #[arg(short, long, value_enum, default_value_t = Verbosity::Test)]
    verbose: Verbosity,

    /// Serial port (platform default if omitted)
    #[arg(short, long, env = "SERIALTEST_PORT")]
    port: Option<String>,

    /// Test plan file (defaults to the example's serial_test_config.json)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Harness settings file (TOML)
    #[arg(short, long)]
    settings: Option<PathBuf>,

    /// Also write a daily log file to this directory
    #[arg(long)]
    log_dir: Option<PathBuf>,

    /// List available serial ports and exit
    #[arg(long)]
    list_ports: bool,
}

fn init_logging(cli: &Cli) -> anyhow::Result<Option<WorkerGuard>> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(cli.verbose.filter()));

    let (file_layer, guard) = match &cli.log_dir {
        Some(dir) => {
            std::fs::create_dir_all(dir)
                .with_context(|| format!("Unable to create log directory {}", dir.display()))?;
            let appender = tracing_appender::rolling::daily(dir, "serialtest.log");
            let (writer, guard) = tracing_appender::non_blocking(appender);
            (Some(fmt::layer().with_ansi(false).with_writer(writer)), Some(guard))
        }
        None => (None, None),
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_target(false).with_writer(std::io::stderr))
        .with(file_layer)
        .try_init()
        .context("Unable to initialize logging")?;
    Ok(guard)
}

fn print_ports() -> anyhow::Result<()> {
    let ports = serialtest_core::core::transport::list_ports().context("Unable to enumerate serial ports")?;
    if ports.is_empty() {
        println!("No serial ports found");
    }
    for port in ports {
        println!("{:<30} {:?}", port.port_name, port.port_type);
    }
    Ok(())
}

fn load_inputs(cli: &Cli, example: &str) -> Result<(HarnessSettings, TestPlan, PathBuf), HarnessError> {
    let settings = HarnessSettings::load(cli.settings.as_deref())?;
    let plan_path = cli
        .config
        .clone()
        .unwrap_or_else(|| config::default_plan_path(example));
    let plan = TestPlan::load(&plan_path)?;
    tracing::info!(
        "Loaded {} tests ({}) from {}",
        plan.len(),
        plan.data_kind,
        plan_path.display()
    );
    let base_dir = plan_path
        .parent()
        .map_or_else(|| PathBuf::from("."), Path::to_path_buf);
    Ok((settings, plan, base_dir))
}

async fn run_plan(
    settings: HarnessSettings,
    plan: &TestPlan,
    base_dir: PathBuf,
    port_name: Option<String>,
) -> (TestResults, Result<(), HarnessError>) {
    let link = LinkConfig::new(port_name).baud_rate(settings.link.baud_rate);
    let port: Arc<dyn TransportPort> = match SerialLink::open(&link) {
        Ok(link) => Arc::new(link),
        Err(e) => return (TestResults::default(), Err(e.into())),
    };
    tracing::info!("Connected to {}", port.describe());

    let dispatcher = Arc::new(ResponseDispatcher::new());
    let reader = LineChannel::spawn(
        Arc::clone(&port),
        Arc::clone(&dispatcher),
        settings.link.poll_interval(),
    );
    let mut sequencer = TestSequencer::new(
        Arc::clone(&port),
        dispatcher,
        Arc::new(FilePayloadResolver::new().with_base_dir(base_dir)),
        settings,
    );

    let outcome = tokio::select! {
        result = sequencer.run(plan) => result,
        _ = tokio::signal::ctrl_c() => {
            tracing::warn!("Interrupted, stopping test run");
            Err(HarnessError::Cancelled)
        }
    };

    reader.stop().await;
    if let Err(e) = port.close().await {
        tracing::warn!("Error closing {}: {}", port.describe(), e);
    }

    let summary = sequencer.summary();
    if let Some(finished_at) = summary.finished_at {
        tracing::info!(
            "Run started {} took {} ms",
            summary.started_at.format("%Y-%m-%d %H:%M:%S"),
            (finished_at - summary.started_at).num_milliseconds()
        );
    }
    (summary.results, outcome)
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    let _guard = match init_logging(&cli) {
        Ok(guard) => guard,
        Err(e) => {
            eprintln!("Error: {e:#}");
            return ExitCode::from(ExitCodes::ERROR);
        }
    };

    if cli.list_ports {
        return match print_ports() {
            Ok(()) => ExitCode::SUCCESS,
            Err(e) => {
                eprintln!("Error: {e:#}");
                ExitCode::from(ExitCodes::ERROR)
            }
        };
    }

    let Some(example) = cli.example.as_deref() else {
        return ExitCode::from(ExitCodes::INVALID_ARGS);
    };
    tracing::info!("Starting serialtest v{} for {}", env!("CARGO_PKG_VERSION"), example);

    let (results, outcome) = match load_inputs(&cli, example) {
        Ok((settings, plan, base_dir)) => run_plan(settings, &plan, base_dir, cli.port.clone()).await,
        Err(e) => (TestResults::default(), Err(e)),
    };

    println!("Test end: {results}");
    let result = match &outcome {
        Ok(()) => CliResult::from_results(&results),
        Err(e) => {
            eprintln!("Error: {e}");
            CliResult::from(e)
        }
    };
    result.to_exit_code()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_verbosity_shows_verdicts() {
        let cli = Cli::try_parse_from(["serialtest", "--example", "micro_speech"]).unwrap();
        assert_eq!(cli.verbose, Verbosity::Test);
        assert_eq!(cli.verbose.filter(), "info");

        let cli = Cli::try_parse_from(["serialtest", "-e", "hello_world", "--verbose", "all"]).unwrap();
        assert_eq!(cli.verbose.filter(), "debug");
    }

    #[test]
    fn test_example_required_unless_listing() {
        assert!(Cli::try_parse_from(["serialtest"]).is_err());
        assert!(Cli::try_parse_from(["serialtest", "--example", "cat_detector"]).is_err());
        assert!(Cli::try_parse_from(["serialtest", "--list-ports"]).is_ok());
    }
}
