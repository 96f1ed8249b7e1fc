//! Configuration layering: defaults, then the TOML file, then arguments

use anyhow::{Context, Result};
use camrelay_core::config::{sample_config, ConfigFile, MonitorConfig, RelayMode};

use crate::Cli;

/// Print a sample configuration to stdout
pub fn print_config() -> Result<()> {
    print!("{}", sample_config());
    Ok(())
}

/// Build the monitor configuration for the invocation
pub fn load_config(cli: &Cli) -> Result<MonitorConfig> {
    let file = match &cli.config {
        Some(path) => ConfigFile::load_from(path)
            .with_context(|| format!("Failed to load {}", path.display()))?,
        None => ConfigFile::load().context("Failed to load config file")?,
    };

    let device = cli
        .device
        .clone()
        .context("A loopback device path is required")?;

    let mut config = file.to_monitor_config(device)?;

    if let Some(width) = cli.width {
        config.width = width;
    }
    if let Some(height) = cli.height {
        config.height = height;
    }

    if let Some(mode) = &cli.mode {
        let mode: RelayMode = mode.parse().map_err(|e: String| anyhow::anyhow!(e))?;
        config = config.with_mode(mode);
    }

    if cli.no_events {
        config = config.with_events(false);
    }

    if !cli.pipeline.is_empty() {
        config = config.with_command(cli.pipeline.iter().cloned());
    }

    config
        .validate_strict()
        .map_err(|e| anyhow::anyhow!("Invalid configuration: {}", e))?;

    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::Parser;

    fn parse(args: &[&str]) -> Cli {
        let mut argv = vec!["camera-relay-monitor", "--config", "/nonexistent/monitor.toml"];
        argv.extend_from_slice(args);
        Cli::parse_from(argv)
    }

    #[test]
    fn test_positional_arguments() {
        let config = load_config(&parse(&["/dev/video10", "1280", "720"])).unwrap();
        assert_eq!(config.device.to_str(), Some("/dev/video10"));
        assert_eq!((config.width, config.height), (1280, 720));
        assert_eq!(config.mode, RelayMode::Relay);
        assert!(config.command.is_none());
    }

    #[test]
    fn test_default_resolution() {
        let config = load_config(&parse(&["/dev/video10"])).unwrap();
        assert_eq!((config.width, config.height), (1920, 1080));
    }

    #[test]
    fn test_trailing_pipeline_command() {
        let cli = parse(&["--mode", "yield", "/dev/video3", "640", "480", "--", "cam", "-o", "{sink}"]);
        let config = load_config(&cli).unwrap();
        assert_eq!(config.mode, RelayMode::Yield);
        assert_eq!(
            config.command,
            Some(vec!["cam".to_string(), "-o".to_string(), "{sink}".to_string()])
        );
    }

    #[test]
    fn test_no_events_flag() {
        let config = load_config(&parse(&["--no-events", "/dev/video10"])).unwrap();
        assert!(!config.use_events);
    }

    #[test]
    fn test_invalid_width_rejected() {
        assert!(load_config(&parse(&["/dev/video10", "1281", "720"])).is_err());
        assert!(load_config(&parse(&["--mode", "teleport", "/dev/video10"])).is_err());
    }
}
