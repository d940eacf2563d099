//! CLI for the ares-mcp-server binary
//!
//! Uses clap for argument parsing and owo-colors for terminal output.

pub mod output;
pub mod probe;

use clap::{Parser, Subcommand};
use std::path::PathBuf;

/// A.R.E.S MCP Hub - research agent orchestration server
#[derive(Parser, Debug)]
#[command(
    name = "ares-mcp-server",
    author = "Dirmacs <build@dirmacs.com>",
    version,
    about = "A.R.E.S MCP Hub - research agent orchestration server",
    long_about = "WebSocket hub that registers research agents, routes tasks to them with\n\
                  load balancing, circuit breaking and retry, and tracks multi-stage\n\
                  research contexts.\n\n\
                  Run without arguments to start the server.",
    after_help = "EXAMPLES:\n    \
                  ares-mcp-server                        # Start the hub (ares-mcp.toml or defaults)\n    \
                  ares-mcp-server --config hub.toml      # Use a custom config file\n    \
                  ares-mcp-server config --validate      # Check the configuration\n    \
                  ares-mcp-server probe                  # Liveness probe against a running hub"
)]
pub struct Cli {
    /// Path to the configuration file
    #[arg(short, long, default_value = "ares-mcp.toml", global = true)]
    pub config: PathBuf,

    /// Enable verbose output
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Disable colored output
    #[arg(long, global = true)]
    pub no_color: bool,

    /// Emit logs as JSON lines
    #[arg(long, global = true)]
    pub log_json: bool,

    /// Subcommand to execute
    #[command(subcommand)]
    pub command: Option<Commands>,
}

/// Available CLI subcommands
#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Start the hub (default)
    Serve,

    /// Show configuration information
    Config {
        /// Print the effective configuration as TOML
        #[arg(short = 'f', long)]
        full: bool,

        /// Validate the configuration and report warnings
        #[arg(long)]
        validate: bool,
    },

    /// Check that a running hub answers
    ///
    /// Exits 0 when a pong, or any frame, arrives within the timeout.
    Probe {
        /// WebSocket URL of the hub
        #[arg(long, default_value = "ws://127.0.0.1:8765/ws")]
        url: String,

        /// Read window in milliseconds
        #[arg(long, default_value_t = 2000)]
        timeout_ms: u64,
    },

    /// Serve hub operations as MCP tools over stdio
    #[cfg(feature = "mcp")]
    Mcp,
}
