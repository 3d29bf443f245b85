//! Implementations behind the CLI subcommands other than `run`.

pub mod config;
pub mod export;
pub mod logs;
pub mod services;
pub mod status;
