use anyhow::{Context, Result};
use std::fs;
use std::path::Path;

use crate::config::Config;

pub fn show_config(path: &Path) -> Result<()> {
    let config = Config::load(path)?;
    let toml_content = toml::to_string_pretty(&config)
        .context("Failed to serialize config")?;

    println!("Current Configuration ({})", path.display());
    println!("=====================");
    println!();
    println!("{}", toml_content);

    Ok(())
}

pub fn validate_config(path: &Path) -> Result<()> {
    println!("Validating {}...", path.display());

    if !path.exists() {
        anyhow::bail!(
            "Config file not found at {}. Run `svcwatch config init` to create one.",
            path.display()
        );
    }

    let content = fs::read_to_string(path)
        .with_context(|| format!("Failed to read {}", path.display()))?;
    let config: Config = match toml::from_str(&content) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("✗ Configuration is invalid:");
            eprintln!("  {}", e);
            anyhow::bail!("invalid configuration");
        }
    };

    let problems = config.validate();
    if !problems.is_empty() {
        eprintln!("✗ Configuration is invalid:");
        for problem in &problems {
            eprintln!("  {}", problem);
        }
        anyhow::bail!("{} problem(s) found", problems.len());
    }

    println!("✓ Configuration is valid");
    println!();
    println!("Server:");
    println!("  Listen: {}:{}", config.server.bind, config.server.port);
    println!("  Data directory: {}", config.server.data_dir);
    println!();
    println!("Monitor:");
    println!("  Polling interval: {}s", config.monitor.polling_interval_secs);
    println!("  Auto refresh: {}", config.monitor.auto_refresh);
    println!("  Operation timeout: {}s", config.monitor.operation_timeout_secs);
    println!("  Require root for control: {}", config.monitor.require_admin_for_control);
    println!("  Log retention: {} days", config.monitor.log_retention_days);
    println!("  Max entries per log file: {}", config.monitor.max_logs_per_file);
    println!();
    if config.monitor.services.is_empty() {
        println!("Configured services: none");
    } else {
        println!("Configured services:");
        for service in &config.monitor.services {
            let critical = if service.critical { " [critical]" } else { "" };
            println!("  {}{}", service.name, critical);
        }
    }

    Ok(())
}

pub fn init_config(path: &Path, force: bool) -> Result<()> {
    if path.exists() && !force {
        anyhow::bail!(
            "Config file already exists at {}. Use --force to overwrite.",
            path.display()
        );
    }

    println!("Generating default configuration...");
    Config::default().write(path)?;

    println!("✓ Default configuration written to {}", path.display());
    println!();
    println!("Add the services this host may control under [[monitor.services]], e.g.:");
    println!();
    println!("  [[monitor.services]]");
    println!("  name = \"nginx\"");
    println!("  display_name = \"Nginx\"");
    println!("  critical = true");

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_init_refuses_to_overwrite() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("config.toml");

        init_config(&path, false).unwrap();
        assert!(path.exists());
        assert!(init_config(&path, false).is_err());
        assert!(init_config(&path, true).is_ok());
    }

    #[test]
    fn test_validate_reports_problems() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("config.toml");

        assert!(validate_config(&path).is_err());

        fs::write(
            &path,
            "[monitor]\nmax_logs_per_file = 0\n\n[[monitor.services]]\nname = \"nginx\"\n",
        )
        .unwrap();
        assert!(validate_config(&path).is_err());

        fs::write(&path, "[[monitor.services]]\nname = \"nginx\"\ncritical = true\n").unwrap();
        assert!(validate_config(&path).is_ok());
    }
}
