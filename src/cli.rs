use clap::{Args, Parser, Subcommand};

use crate::config::DEFAULT_CONFIG_PATH;
use crate::event::LogType;

#[derive(Parser)]
#[command(name = "svcwatch")]
#[command(about = "Service monitoring and control engine for systemd hosts", long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Option<Commands>,

    /// Override server port
    #[arg(long, global = true)]
    pub port: Option<u16>,

    /// Config file path
    #[arg(long, global = true, default_value = DEFAULT_CONFIG_PATH)]
    pub config: String,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Run the API server and background poller (default if no command specified)
    Run,

    /// List monitored services with live status
    Services {
        /// List every installed service instead of the monitored set
        #[arg(long)]
        installed: bool,

        /// Output format
        #[arg(short, long, default_value = "human")]
        format: OutputFormat,
    },

    /// Start a monitored service
    Start { name: String },

    /// Stop a monitored service
    Stop { name: String },

    /// Restart a monitored service
    Restart { name: String },

    /// Create a unit for a monitored service
    Register {
        #[arg(long)]
        name: String,

        /// Executable path; relative paths resolve against this binary's directory
        #[arg(long)]
        binary_path: String,

        /// Fallback executable path
        #[arg(long)]
        binary_path_alt: Option<String>,

        #[arg(long)]
        display_name: Option<String>,

        #[arg(long)]
        description: Option<String>,

        /// auto, delayed, manual or disabled
        #[arg(long, default_value = "manual")]
        startup_type: String,

        /// Account to run as (default: stored service defaults)
        #[arg(long)]
        account: Option<String>,
    },

    /// Stop (if running) and remove the unit of a monitored service
    Unregister { name: String },

    /// Manage the runtime monitored set
    Monitor {
        #[command(subcommand)]
        command: MonitorCommands,
    },

    /// Query the audit log
    Logs {
        #[command(subcommand)]
        command: Option<LogsCommands>,

        #[command(flatten)]
        query: LogQueryArgs,

        /// Output format
        #[arg(short, long, default_value = "human")]
        format: OutputFormat,
    },

    /// Check status of a running server
    Status {
        /// Server URL
        #[arg(default_value = "http://localhost:8080")]
        url: String,

        /// Output format
        #[arg(short, long, default_value = "human")]
        format: OutputFormat,
    },

    /// Configuration management
    Config {
        #[command(subcommand)]
        command: ConfigCommands,
    },
}

#[derive(Subcommand)]
pub enum MonitorCommands {
    /// Add an installed service to the monitored set
    Add {
        name: String,

        #[arg(long)]
        display_name: Option<String>,

        #[arg(long)]
        description: Option<String>,

        /// Mark the service as critical
        #[arg(long)]
        critical: bool,
    },

    /// Remove a runtime-added service from the monitored set
    Remove { name: String },
}

#[derive(Subcommand)]
pub enum LogsCommands {
    /// Export audit entries
    Export {
        /// Output file path (default: stdout)
        #[arg(short, long)]
        output: Option<String>,

        /// Output format
        #[arg(short, long, default_value = "json")]
        format: ExportFormat,

        /// Compress output (gzip)
        #[arg(short, long)]
        compress: bool,

        #[command(flatten)]
        query: LogQueryArgs,
    },

    /// Delete audit partitions past the retention period
    Prune {
        /// Days to keep (default: log_retention_days from config)
        #[arg(long)]
        keep_days: Option<u32>,
    },
}

#[derive(Args, Clone, Debug, Default)]
pub struct LogQueryArgs {
    /// Entry type: access, operation or status-change
    #[arg(long = "type")]
    pub log_type: Option<LogType>,

    /// First day to include (YYYY-MM-DD)
    #[arg(long)]
    pub start: Option<String>,

    /// Last day to include (YYYY-MM-DD)
    #[arg(long)]
    pub end: Option<String>,

    #[arg(long, default_value = "0")]
    pub skip: usize,

    #[arg(long, default_value = "100")]
    pub take: usize,
}

#[derive(Subcommand)]
pub enum ConfigCommands {
    /// Show current configuration
    Show,

    /// Validate configuration file
    Validate,

    /// Generate default configuration
    Init {
        /// Force overwrite existing config
        #[arg(long)]
        force: bool,
    },
}

#[derive(clap::ValueEnum, Clone, Debug)]
pub enum ExportFormat {
    /// Pretty-printed JSON
    Json,
    /// Newline-delimited JSON (JSONL)
    Jsonl,
    /// CSV format
    Csv,
}

#[derive(clap::ValueEnum, Clone, Debug)]
pub enum OutputFormat {
    /// Human-readable output
    Human,
    /// JSON output
    Json,
}

impl Cli {
    pub fn parse_args() -> Self {
        Cli::parse()
    }
}
