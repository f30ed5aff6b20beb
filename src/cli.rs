// src/cli.rs

//! CLI argument parsing using `clap`.

use clap::{Parser, Subcommand, ValueEnum};

/// Exit codes of the `gridflow` binary.
pub const EXIT_OK: i32 = 0;
pub const EXIT_USER_TODO: i32 = 2;
pub const EXIT_NOT_IMPLEMENTED: i32 = 3;
pub const EXIT_ARGUMENT_ERROR: i32 = 4;
pub const EXIT_ENGINE_ERROR: i32 = 5;
pub const EXIT_WRONG_COMMAND: i32 = 6;

/// Command-line arguments for `gridflow`.
#[derive(Debug, Clone, Parser)]
#[command(
    name = "gridflow",
    version,
    about = "Run DAGs of targets across local, ssh and batch-scheduler backends.",
    long_about = None
)]
pub struct CliArgs {
    /// Path to the config file (TOML).
    ///
    /// Default: `Gridflow.toml` in the current working directory, if it
    /// exists; otherwise defaults + environment only.
    #[arg(long, value_name = "PATH")]
    pub config: Option<String>,

    /// Logging level (error, warn, info, debug, trace).
    ///
    /// If omitted, `GRIDFLOW_LOG` or a default level will be used.
    #[arg(long, value_enum, value_name = "LEVEL")]
    pub log_level: Option<LogLevel>,

    #[command(subcommand)]
    pub command: CliCommand,
}

#[derive(Debug, Clone, Subcommand)]
pub enum CliCommand {
    /// Print configuration and store statistics.
    Info,

    /// Invoke a user-defined term.
    Call {
        /// Name of the term to invoke.
        term: String,
    },

    /// Run the engine.
    Run {
        #[command(subcommand)]
        mode: RunMode,
    },

    /// Run the engine loop together with the HTTP API server.
    Serve,

    /// Append a kill command for each id to the command pipe.
    Kill {
        #[arg(required = true)]
        ids: Vec<String>,
    },

    /// Append a restart command for each id to the command pipe.
    Restart {
        #[arg(required = true)]
        ids: Vec<String>,
    },

    /// Append an activate command for each id to the command pipe.
    Activate {
        #[arg(required = true)]
        ids: Vec<String>,
    },
}

#[derive(Debug, Clone, Subcommand)]
pub enum RunMode {
    /// Run exactly one tick and print what happened.
    Step,
    /// Run ticks until interrupted (or until idle with `--once`).
    Loop {
        /// Exit once nothing is in progress.
        #[arg(long)]
        once: bool,
    },
}

/// Log level as exposed on the CLI.
#[derive(Debug, Copy, Clone, ValueEnum)]
pub enum LogLevel {
    Error,
    Warn,
    Info,
    Debug,
    Trace,
}

/// Convenience wrapper around `CliArgs::try_parse()`.
pub fn try_parse() -> Result<CliArgs, clap::Error> {
    CliArgs::try_parse()
}
