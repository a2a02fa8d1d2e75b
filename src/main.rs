mod channel;
mod config;
mod coordinator;
mod driver;
mod error;
mod fleet;
mod logging;
mod types;

use std::process::ExitCode;

use clap::{Args, CommandFactory, Parser, Subcommand};
use crate::channel::TASK_CHANNEL;
use crate::channel::local::LocalNamespace;
use crate::config::{Backend, SimConfig, Timing};
use crate::coordinator::RunSummary;
use crate::error::{FleetError, Result};
use crate::fleet::ThreadFleet;

/// Simulate a fleet of drivers pulling ride tasks from a shared bounded queue.
#[derive(Parser, Debug)]
#[command(
    name = "driver_fleet",
    version,
    args_conflicts_with_subcommands = true,
    subcommand_negates_reqs = true
)]
struct Cli {
    /// Number of drivers (at least 1)
    #[arg(value_name = "N", required = true, value_parser = clap::value_parser!(u32).range(1..))]
    drivers: Option<u32>,

    /// Simulation duration in seconds (at least 5)
    #[arg(value_name = "T", required = true, value_parser = clap::value_parser!(u64).range(5..))]
    duration: Option<u64>,

    /// Drivers do not report trip distances back to the coordinator
    #[arg(long)]
    no_report: bool,

    /// Seed for task generation [default: coordinator pid]
    #[arg(long)]
    seed: Option<u64>,

    /// Divide every simulated delay by this factor
    #[arg(long, default_value_t = 1, value_parser = clap::value_parser!(u32).range(1..))]
    speedup: u32,

    /// How drivers are executed
    #[arg(long, value_enum, default_value_t = Backend::Process)]
    backend: Backend,

    /// Name of the shared task channel
    #[arg(long, default_value = TASK_CHANNEL)]
    task_channel: String,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run one driver process; spawned by the coordinator.
    #[command(hide = true)]
    Driver(DriverArgs),
}

#[derive(Args, Debug)]
struct DriverArgs {
    #[arg(long, value_parser = clap::value_parser!(u32).range(1..))]
    fleet_size: u32,

    #[arg(long)]
    no_report: bool,

    #[arg(long, default_value_t = 1, value_parser = clap::value_parser!(u32).range(1..))]
    speedup: u32,

    #[arg(long, default_value = TASK_CHANNEL)]
    task_channel: String,
}

fn exit_with(err: FleetError) -> ExitCode {
    eprintln!("driver_fleet: {err}");
    if matches!(err, FleetError::Usage(_)) {
        eprintln!("{}", Cli::command().render_usage());
    }
    ExitCode::from(err.exit_code())
}

/// Arguments that make a re-executed binary run as one driver of `config`'s fleet.
fn driver_args(config: &SimConfig, speedup: u32) -> Vec<String> {
    let mut args = vec![
        "driver".to_string(),
        "--fleet-size".to_string(),
        config.drivers.to_string(),
        "--speedup".to_string(),
        speedup.to_string(),
        "--task-channel".to_string(),
        config.task_channel.clone(),
    ];
    if !config.report {
        args.push("--no-report".to_string());
    }
    args
}

#[cfg(target_os = "linux")]
fn run_process_fleet(config: &SimConfig, speedup: u32) -> Result<RunSummary> {
    use crate::channel::posix::PosixFactory;
    use crate::fleet::ProcessFleet;

    let mut fleet = ProcessFleet::from_current_exe(driver_args(config, speedup))?;
    coordinator::run(config, &PosixFactory, &mut fleet)
}

#[cfg(not(target_os = "linux"))]
fn run_process_fleet(_config: &SimConfig, _speedup: u32) -> Result<RunSummary> {
    Err(FleetError::Usage(
        "the process backend needs POSIX message queues; use --backend thread".to_string(),
    ))
}

fn run_thread_fleet(config: &SimConfig) -> Result<RunSummary> {
    let namespace = LocalNamespace::new();
    let mut fleet = ThreadFleet::new(namespace.clone(), config.driver_config());
    coordinator::run(config, &namespace, &mut fleet)
}

fn run_coordinator(cli: Cli) -> ExitCode {
    logging::init("coordinator");
    let mut config = match SimConfig::new(cli.drivers.unwrap_or(0), cli.duration.unwrap_or(0)) {
        Ok(config) => config,
        Err(err) => return exit_with(err),
    };
    config.report = !cli.no_report;
    if let Some(seed) = cli.seed {
        config.seed = seed;
    }
    config.task_channel = cli.task_channel;
    config.timing = Timing::with_speedup(cli.speedup);

    let outcome = match cli.backend {
        Backend::Process => run_process_fleet(&config, cli.speedup),
        Backend::Thread => run_thread_fleet(&config),
    };
    match outcome {
        Ok(summary) => {
            summary.print();
            ExitCode::SUCCESS
        }
        Err(err) => exit_with(err),
    }
}

#[cfg(target_os = "linux")]
fn run_driver_process(args: DriverArgs) -> ExitCode {
    use crate::channel::posix::PosixFactory;
    use crate::config::DriverConfig;
    use log::error;

    let id = std::process::id();
    logging::init(&format!("driver-{id}"));
    let config = DriverConfig {
        fleet_size: args.fleet_size,
        report: !args.no_report,
        task_channel: args.task_channel,
        timing: Timing::with_speedup(args.speedup),
    };
    match driver::run_driver(id, &config, &PosixFactory) {
        Ok(_) => ExitCode::SUCCESS,
        Err(err) => {
            error!("[DRIVER] {id} failed: {err}");
            eprintln!("driver {id}: {err}");
            ExitCode::FAILURE
        }
    }
}

#[cfg(not(target_os = "linux"))]
fn run_driver_process(_args: DriverArgs) -> ExitCode {
    exit_with(FleetError::Usage(
        "driver processes need POSIX message queues".to_string(),
    ))
}

/// Text printed for a rejected command line: clap's error followed by the usage line.
fn rejection_text(err: &clap::Error) -> String {
    let mut text = err.render().to_string();
    if !text.contains("Usage:") {
        text.push_str(&format!("\n{}\n", Cli::command().render_usage()));
    }
    text
}

fn main() -> ExitCode {
    let cli = match Cli::try_parse() {
        Ok(cli) => cli,
        Err(err) if !err.use_stderr() => err.exit(),
        Err(err) => {
            eprint!("{}", rejection_text(&err));
            return ExitCode::from(FleetError::Usage(String::new()).exit_code());
        }
    };
    match cli.command {
        Some(Command::Driver(args)) => run_driver_process(args),
        None => run_coordinator(cli),
    }
}
