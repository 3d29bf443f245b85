use anyhow::{Context, Result};
use time::macros::format_description;

use crate::audit::{parse_date, AuditLog, LogFilter};
use crate::cli::{LogQueryArgs, OutputFormat};
use crate::config::Config;
use crate::event::LogEntry;

/// Turn CLI query flags into an audit filter.
pub fn build_filter(args: &LogQueryArgs) -> Result<LogFilter> {
    let start_date = args
        .start
        .as_deref()
        .map(parse_date)
        .transpose()
        .context("Invalid --start date. Use YYYY-MM-DD")?;
    let end_date = args
        .end
        .as_deref()
        .map(parse_date)
        .transpose()
        .context("Invalid --end date. Use YYYY-MM-DD")?;

    if let (Some(start), Some(end)) = (start_date, end_date) {
        if start > end {
            anyhow::bail!("--start ({start}) is after --end ({end})");
        }
    }

    Ok(LogFilter {
        log_type: args.log_type,
        start_date,
        end_date,
    })
}

pub(crate) async fn open_audit(config: &Config) -> Result<AuditLog> {
    AuditLog::open(config.log_dir(), config.monitor.max_logs_per_file)
        .await
        .with_context(|| format!("Failed to open audit log in {}", config.log_dir().display()))
}

pub fn run_query(config: &Config, args: LogQueryArgs, format: OutputFormat) -> Result<()> {
    let filter = build_filter(&args)?;
    let rt = tokio::runtime::Runtime::new().context("Failed to create Tokio runtime")?;

    let (entries, total) = rt.block_on(async {
        let audit = open_audit(config).await?;
        let entries = audit.query(&filter, args.skip, args.take).await;
        let total = audit.count(&filter).await;
        Ok::<_, anyhow::Error>((entries, total))
    })?;

    match format {
        OutputFormat::Human => print_human_logs(&entries, args.skip, total),
        OutputFormat::Json => {
            let json = serde_json::to_string_pretty(&entries)?;
            println!("{}", json);
        }
    }
    Ok(())
}

pub fn run_prune(config: &Config, keep_days: Option<u32>) -> Result<()> {
    let keep_days = keep_days.unwrap_or(config.monitor.log_retention_days);
    let rt = tokio::runtime::Runtime::new().context("Failed to create Tokio runtime")?;

    let removed = rt.block_on(async {
        let audit = open_audit(config).await?;
        Ok::<_, anyhow::Error>(audit.prune_older_than(keep_days).await)
    })?;

    println!("✓ Removed {} audit file(s) older than {} days", removed, keep_days);
    Ok(())
}

fn print_human_logs(entries: &[LogEntry], skip: usize, total: usize) {
    if entries.is_empty() {
        println!("No log entries found");
        return;
    }

    println!("{:<19}  {:<12}  {:<24}  {:<12}  MESSAGE", "TIME (UTC)", "TYPE", "SERVICE", "USER");
    for entry in entries {
        println!(
            "{:<19}  {:<12}  {:<24}  {:<12}  {}",
            format_timestamp(entry),
            entry.log_type,
            entry.service_name.as_deref().unwrap_or("-"),
            entry.user_name.as_deref().unwrap_or("-"),
            entry.message
        );
    }
    println!();
    println!(
        "Showing {}-{} of {} entries",
        skip + 1,
        skip + entries.len(),
        total
    );
}

fn format_timestamp(entry: &LogEntry) -> String {
    entry
        .timestamp
        .to_offset(time::UtcOffset::UTC)
        .format(format_description!("[year]-[month]-[day] [hour]:[minute]:[second]"))
        .unwrap_or_default()
}
