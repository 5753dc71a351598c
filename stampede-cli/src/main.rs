//! Stampede CLI - Command-line interface
//!
//! This binary exercises the Stampede coalescer from the command line.

mod commands;
mod error;

use clap::{Parser, Subcommand};
use commands::simulate::{self, SimulateArgs};
use error::CliError;
use stampede::logging::{default_log_dir, default_log_file, init_logging_full};
use tracing::info;

#[derive(Parser)]
#[command(name = "stampede")]
#[command(version = stampede::VERSION)]
#[command(about = "Request coalescing toolkit", long_about = None)]
struct Cli {
    /// Enable debug-level logging regardless of RUST_LOG
    #[arg(long, global = true)]
    debug: bool,

    /// Also print log lines to stdout
    #[arg(long, global = true)]
    log_stdout: bool,

    /// Directory for the log file
    #[arg(long, global = true, default_value_t = default_log_dir().to_string())]
    log_dir: String,

    /// Log file name
    #[arg(long, global = true, default_value_t = default_log_file().to_string())]
    log_file: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Fire a thundering herd of concurrent requests at a coalescer
    Simulate(SimulateArgs),
}

fn main() {
    let cli = Cli::parse();

    let _logging_guard =
        match init_logging_full(&cli.log_dir, &cli.log_file, cli.log_stdout, cli.debug) {
            Ok(guard) => guard,
            Err(e) => CliError::LoggingInit(e.to_string()).exit(),
        };

    info!("Stampede v{}", stampede::VERSION);

    let result = match cli.command {
        Commands::Simulate(args) => {
            info!("Stampede CLI: simulate command");
            simulate::run(args)
        }
    };

    if let Err(e) = result {
        e.exit();
    }
}
