use anyhow::{Context, Result};
use reqwest::blocking::Client;
use serde::Serialize;
use std::time::Duration;

use crate::cli::OutputFormat;
use crate::model::{ServiceInfo, ServiceStatus};
use crate::webui::health::HealthResponse;

#[derive(Serialize)]
struct RemoteStatus {
    health: HealthResponse,
    services: Vec<ServiceInfo>,
}

pub fn run_status(url: String, format: OutputFormat) -> Result<()> {
    let client = Client::builder()
        .timeout(Duration::from_secs(5))
        .build()?;
    let base = url.trim_end_matches('/');

    let response = client
        .get(format!("{}/health", base))
        .send()
        .context("Failed to connect to svcwatch server")?;
    if !response.status().is_success() {
        anyhow::bail!("Server returned status: {}", response.status());
    }
    let health: HealthResponse = response
        .json()
        .context("Failed to parse health response")?;

    let response = client
        .get(format!("{}/api/services", base))
        .send()
        .context("Failed to fetch monitored services")?;
    if !response.status().is_success() {
        anyhow::bail!("Server returned status: {}", response.status());
    }
    let services: Vec<ServiceInfo> = response
        .json()
        .context("Failed to parse service list")?;

    let status = RemoteStatus { health, services };
    match format {
        OutputFormat::Human => print_human_status(&status),
        OutputFormat::Json => {
            let json = serde_json::to_string_pretty(&status)?;
            println!("{}", json);
        }
    }

    Ok(())
}

fn print_human_status(status: &RemoteStatus) {
    let health = &status.health;
    println!("svcwatch Status");
    println!("===============");
    println!();
    println!("Uptime:       {}", format_duration(health.uptime_seconds));
    println!("Services:     {}", health.monitored_services);
    println!("Pending ops:  {}", health.pending_expectations);
    println!("Subscribers:  {}", health.subscribers);
    println!("Last Update:  {}", health.timestamp);
    println!();

    if !status.services.is_empty() {
        print_service_table(&status.services);
        println!();
    }

    let down: Vec<&str> = status
        .services
        .iter()
        .filter(|s| s.is_critical && s.status != ServiceStatus::Running)
        .map(|s| s.name.as_str())
        .collect();
    if down.is_empty() {
        println!("✓ All critical services running");
    } else {
        println!("⚠ Critical services not running: {}", down.join(", "));
    }
}

/// Shared by `status` and the local `services` listing.
pub fn print_service_table(services: &[ServiceInfo]) {
    println!(
        "{:<28}  {:<10}  {:<20}  {:>8}  {:>12}  {:>9}",
        "NAME", "STATUS", "STARTUP", "PID", "UPTIME", "MEMORY"
    );
    for service in services {
        let marker = if service.is_critical { "*" } else { "" };
        let pid = if service.process_id > 0 {
            service.process_id.to_string()
        } else {
            "-".to_string()
        };
        let uptime = if service.uptime_secs > 0 {
            format_duration(service.uptime_secs)
        } else {
            "-".to_string()
        };
        println!(
            "{:<28}  {:<10}  {:<20}  {:>8}  {:>12}  {:>7.1}MB",
            format!("{}{}", service.name, marker),
            service.status,
            service.startup_type,
            pid,
            uptime,
            service.memory_usage_mb
        );
    }
}

pub fn format_duration(seconds: u64) -> String {
    let days = seconds / 86400;
    let hours = (seconds % 86400) / 3600;
    let minutes = (seconds % 3600) / 60;
    let secs = seconds % 60;

    if days > 0 {
        format!("{}d {}h {}m", days, hours, minutes)
    } else if hours > 0 {
        format!("{}h {}m {}s", hours, minutes, secs)
    } else if minutes > 0 {
        format!("{}m {}s", minutes, secs)
    } else {
        format!("{}s", secs)
    }
}
