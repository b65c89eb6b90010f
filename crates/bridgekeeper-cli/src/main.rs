mod commands;

use bridgekeeper_core::CoreConfig;
use clap::{Parser, Subcommand};
use commands::{EXIT_CONFIG_ERROR, EXIT_FAILURE, EXIT_RUNTIME_ERROR};
use std::path::PathBuf;
use std::process::ExitCode;

#[derive(Debug, Parser)]
#[command(
    name = "bridgekeeper",
    version,
    about = "Reconcile home-automation bridges against a container runtime."
)]
struct Cli {
    /// Configuration file (TOML). Defaults apply when omitted.
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Output results as JSON.
    #[arg(long, default_value_t = false, global = true)]
    json: bool,

    /// Enable verbose output.
    #[arg(short, long, default_value_t = false, global = true)]
    verbose: bool,

    /// Enable trace-level logging.
    #[arg(long, default_value_t = false, global = true)]
    trace: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Run the core until interrupted.
    Run,
    /// List the bridge types offered by the configured catalog.
    Catalog,
    /// List bridge types installed or staged in the data directory.
    Types,
    /// List the managed containers known to the runtime.
    Inventory {
        /// Include containers whose names are not managed by the core.
        #[arg(long, default_value_t = false)]
        all: bool,
    },
    /// Print the effective configuration after environment overrides.
    Config,
}

fn main() -> ExitCode {
    let cli = Cli::parse();

    let default_level = if cli.trace {
        "trace"
    } else if cli.verbose {
        "debug"
    } else {
        "info"
    };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_env("BRIDGEKEEPER_LOG")
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_level)),
        )
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    let config = match CoreConfig::load_with_env(cli.config.as_deref()) {
        Ok(c) => c,
        Err(e) => {
            eprintln!("error: {e}");
            return ExitCode::from(EXIT_CONFIG_ERROR);
        }
    };
    let json_output = cli.json;

    let result = match cli.command {
        Commands::Run => commands::run::run(config),
        Commands::Catalog => commands::catalog::run(&config, json_output),
        Commands::Types => commands::types::run(&config, json_output),
        Commands::Inventory { all } => commands::inventory::run(&config, all, json_output),
        Commands::Config => commands::config::run(&config, json_output),
    };

    match result {
        Ok(code) => ExitCode::from(code),
        Err(msg) => {
            eprintln!("error: {msg}");
            let code = if msg.starts_with("configuration error:") {
                EXIT_CONFIG_ERROR
            } else if msg.starts_with("runtime error:") {
                EXIT_RUNTIME_ERROR
            } else {
                EXIT_FAILURE
            };
            ExitCode::from(code)
        }
    }
}
