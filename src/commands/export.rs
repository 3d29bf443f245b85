use anyhow::{Context, Result};
use flate2::write::GzEncoder;
use flate2::Compression;
use std::fs::File;
use std::io::{self, Write};
use time::format_description::well_known::Rfc3339;

use crate::cli::{ExportFormat, LogQueryArgs};
use crate::config::Config;
use crate::event::LogEntry;

use super::logs::{build_filter, open_audit};

pub fn run_export(
    config: &Config,
    output: Option<String>,
    format: ExportFormat,
    compress: bool,
    query: LogQueryArgs,
) -> Result<()> {
    let filter = build_filter(&query)?;
    let rt = tokio::runtime::Runtime::new().context("Failed to create Tokio runtime")?;

    let entries = rt.block_on(async {
        let audit = open_audit(config).await?;
        Ok::<_, anyhow::Error>(audit.query(&filter, query.skip, query.take).await)
    })?;

    eprintln!("Found {} log entries", entries.len());

    // Create output writer
    let writer: Box<dyn Write> = if let Some(path) = output {
        if compress && !path.ends_with(".gz") {
            eprintln!("Warning: compress flag set but output doesn't end with .gz");
        }
        Box::new(File::create(&path).with_context(|| format!("Failed to create {}", path))?)
    } else {
        if compress {
            eprintln!("Warning: compress flag ignored when writing to stdout");
        }
        Box::new(io::stdout())
    };

    let mut writer: Box<dyn Write> = if compress {
        Box::new(GzEncoder::new(writer, Compression::default()))
    } else {
        writer
    };

    write_entries(&entries, &format, &mut writer)?;

    // Dropping the encoder writes the gzip trailer
    writer.flush()?;
    drop(writer);

    eprintln!("Export complete");
    Ok(())
}

pub fn write_entries(entries: &[LogEntry], format: &ExportFormat, writer: &mut dyn Write) -> Result<()> {
    match format {
        ExportFormat::Json => export_json(entries, writer),
        ExportFormat::Jsonl => export_jsonl(entries, writer),
        ExportFormat::Csv => export_csv(entries, writer),
    }
}

fn export_json(entries: &[LogEntry], writer: &mut dyn Write) -> Result<()> {
    let json = serde_json::to_string_pretty(entries)
        .context("Failed to serialize log entries to JSON")?;
    writer.write_all(json.as_bytes())?;
    writer.write_all(b"\n")?;
    Ok(())
}

fn export_jsonl(entries: &[LogEntry], writer: &mut dyn Write) -> Result<()> {
    for entry in entries {
        let json = serde_json::to_string(entry)
            .context("Failed to serialize log entry to JSON")?;
        writer.write_all(json.as_bytes())?;
        writer.write_all(b"\n")?;
    }
    Ok(())
}

fn export_csv(entries: &[LogEntry], writer: &mut dyn Write) -> Result<()> {
    writeln!(writer, "timestamp,type,service,user,ip,result,message")?;

    for entry in entries {
        let timestamp = entry.timestamp.format(&Rfc3339).unwrap_or_default();
        let result = match (&entry.result, entry.status_code) {
            (Some(result), _) => result.clone(),
            (None, Some(code)) => code.to_string(),
            (None, None) => match (&entry.old_status, &entry.new_status) {
                (Some(old), Some(new)) => format!("{} -> {}", old, new),
                _ => String::new(),
            },
        };
        writeln!(
            writer,
            "{},{},{},{},{},{},{}",
            timestamp,
            entry.log_type,
            csv_field(entry.service_name.as_deref().unwrap_or_default()),
            csv_field(entry.user_name.as_deref().unwrap_or_default()),
            csv_field(entry.ip_address.as_deref().unwrap_or_default()),
            csv_field(&result),
            csv_field(&entry.message)
        )?;
    }

    Ok(())
}

fn csv_field(value: &str) -> String {
    format!("\"{}\"", value.replace('"', "\"\""))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audit::AuditLog;
    use crate::model::ServiceStatus;
    use flate2::read::GzDecoder;
    use std::io::Read;
    use tempfile::TempDir;

    fn sample_entries() -> Vec<LogEntry> {
        vec![
            LogEntry::operation("nginx", "Started 'nginx' (Stopped -> Running)", true)
                .by(Some("alice"), Some("10.0.0.5")),
            LogEntry::status_change("nginx", ServiceStatus::Running, ServiceStatus::Stopped),
        ]
    }

    #[test]
    fn test_export_csv_escapes_quotes() {
        let mut out = Vec::new();
        write_entries(&sample_entries(), &ExportFormat::Csv, &mut out).unwrap();
        let text = String::from_utf8(out).unwrap();
        let lines: Vec<&str> = text.lines().collect();

        assert_eq!(lines.len(), 3);
        assert_eq!(lines[0], "timestamp,type,service,user,ip,result,message");
        assert!(lines[1].contains(",Operation,\"nginx\",\"alice\",\"10.0.0.5\",\"Success\","));
        assert!(lines[1].ends_with("\"Started 'nginx' (Stopped -> Running)\""));
        assert!(lines[2].contains("\"Running -> Stopped\""));

        assert_eq!(csv_field("say \"hi\""), "\"say \"\"hi\"\"\"");
    }

    #[test]
    fn test_export_jsonl_one_entry_per_line() {
        let mut out = Vec::new();
        write_entries(&sample_entries(), &ExportFormat::Jsonl, &mut out).unwrap();
        let text = String::from_utf8(out).unwrap();

        let parsed: Vec<LogEntry> = text
            .lines()
            .map(|line| serde_json::from_str(line).unwrap())
            .collect();
        assert_eq!(parsed.len(), 2);
        assert_eq!(parsed[0].user_name.as_deref(), Some("alice"));
        assert_eq!(parsed[1].log_type, crate::event::LogType::StatusChange);
        assert_eq!(parsed[1].new_status.as_deref(), Some("Stopped"));
    }

    #[test]
    fn test_run_export_gzip_file() {
        let dir = TempDir::new().unwrap();
        let config = Config::test_config(dir.path());

        let seed = tokio::runtime::Runtime::new().unwrap();
        seed.block_on(async {
            let audit = AuditLog::open(config.log_dir(), 100).await.unwrap();
            for entry in sample_entries() {
                audit.append(entry).await.unwrap();
            }
        });
        drop(seed);

        let output = dir.path().join("audit.json.gz");
        run_export(
            &config,
            Some(output.display().to_string()),
            ExportFormat::Json,
            true,
            LogQueryArgs {
                take: 100,
                ..Default::default()
            },
        )
        .unwrap();

        let mut json = String::new();
        GzDecoder::new(File::open(&output).unwrap())
            .read_to_string(&mut json)
            .unwrap();
        let exported: Vec<LogEntry> = serde_json::from_str(&json).unwrap();
        assert_eq!(exported.len(), 2);
    }
}
