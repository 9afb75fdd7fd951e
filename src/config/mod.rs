mod types;

pub use types::*;

use anyhow::{Context, Result};
use std::path::Path;
use transq_common::job::{parse_resolution, MAX_QUALITY};

/// Load configuration from a TOML file
pub fn load_config(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {:?}", path))?;

    let config: Config = toml::from_str(&content)
        .with_context(|| format!("Failed to parse config file: {:?}", path))?;

    validate_config(&config)?;

    Ok(config)
}

/// Load config from default locations or return default config
pub fn load_config_or_default(custom_path: Option<&Path>) -> Result<Config> {
    if let Some(path) = custom_path {
        return load_config(path);
    }

    let default_paths = [
        "./transq.toml",
        "~/.config/transq/config.toml",
        "/etc/transq/config.toml",
    ];

    for path_str in default_paths {
        let path = shellexpand::tilde(path_str);
        let path = Path::new(path.as_ref());
        if path.exists() {
            tracing::debug!("Using config file {:?}", path);
            return load_config(path);
        }
    }

    Ok(Config::default())
}

/// Validate configuration
pub fn validate_config(config: &Config) -> Result<()> {
    let resources = &config.resources;
    for (name, value) in [
        ("cpu_limit_percent", resources.cpu_limit_percent),
        ("memory_limit_percent", resources.memory_limit_percent),
        ("high_cpu_percent", resources.high_cpu_percent),
        ("medium_cpu_percent", resources.medium_cpu_percent),
    ] {
        if !(value > 0.0 && value <= 100.0) {
            anyhow::bail!("resources.{name} must be in (0, 100], got {value}");
        }
    }
    if resources.medium_cpu_percent > resources.high_cpu_percent {
        anyhow::bail!("resources.medium_cpu_percent cannot exceed resources.high_cpu_percent");
    }
    if resources.min_memory_gb < 0.0 || resources.min_disk_gb < 0.0 {
        anyhow::bail!("resources minimums cannot be negative");
    }
    if !(1..=20).contains(&resources.max_concurrent_jobs) {
        anyhow::bail!(
            "resources.max_concurrent_jobs must be between 1 and 20, got {}",
            resources.max_concurrent_jobs
        );
    }

    if config.converter.timeout_secs == 0 {
        anyhow::bail!("converter.timeout_secs cannot be 0");
    }
    if config.converter.binary.as_os_str().is_empty() {
        anyhow::bail!("converter.binary cannot be empty");
    }

    let scheduler = &config.scheduler;
    if scheduler.workers == Some(0) {
        anyhow::bail!("scheduler.workers cannot be 0");
    }
    if scheduler.poll_interval_ms == 0 {
        anyhow::bail!("scheduler.poll_interval_ms cannot be 0");
    }
    if scheduler.history_limit == 0 {
        anyhow::bail!("scheduler.history_limit cannot be 0");
    }
    if scheduler.retry_backoff == BackoffKind::Exponential && scheduler.backoff_factor < 1.0 {
        anyhow::bail!("scheduler.backoff_factor must be at least 1.0");
    }

    let defaults = &config.defaults;
    if defaults.quality > MAX_QUALITY {
        anyhow::bail!("defaults.quality must be between 0 and {MAX_QUALITY}");
    }
    if parse_resolution(&defaults.resolution).is_none() {
        anyhow::bail!(
            "defaults.resolution must look like 1280x720, got {:?}",
            defaults.resolution
        );
    }

    if !config.storage.output_dir.exists() {
        tracing::warn!(
            "Output directory does not exist yet: {:?}",
            config.storage.output_dir
        );
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use std::time::Duration;

    #[test]
    fn defaults_match_documented_values() {
        let config = Config::default();
        assert_eq!(config.resources.cpu_limit_percent, 80.0);
        assert_eq!(config.resources.memory_limit_percent, 80.0);
        assert_eq!(config.resources.min_memory_gb, 2.0);
        assert_eq!(config.resources.min_disk_gb, 5.0);
        assert_eq!(config.resources.max_concurrent_jobs, 2);
        assert_eq!(config.converter.timeout_secs, 3600);
        assert_eq!(config.defaults.quality, 23);
        assert_eq!(config.defaults.max_retries, 3);

        let scheduler = config.scheduler.to_scheduler_config();
        assert_eq!(scheduler.poll_interval, Duration::from_secs(1));
        assert_eq!(scheduler.admission_pause, Duration::from_secs(5));
        assert_eq!(scheduler.retry.delay_for(1), Duration::from_secs(30));
        assert_eq!(scheduler.history_limit, 1000);
        assert!(!scheduler.kill_on_cancel);
        assert!(validate_config(&config).is_ok());
    }

    #[test]
    fn parses_partial_file() {
        let config: Config = toml::from_str(
            r#"
            [storage]
            database_path = "/var/lib/transq/jobs.db"

            [resources]
            max_concurrent_jobs = 4
            cpu_limit_percent = 90

            [scheduler]
            retry_backoff = "exponential"
            retry_cooldown_secs = 10
            max_cooldown_secs = 40

            [defaults]
            resolution = "1280x720"
            "#,
        )
        .unwrap();

        assert_eq!(
            config.storage.database_path,
            std::path::PathBuf::from("/var/lib/transq/jobs.db")
        );
        assert!(config.storage.resume_interrupted);
        assert_eq!(config.resources.max_concurrent_jobs, 4);
        assert_eq!(config.resources.cpu_limit_percent, 90.0);
        assert_eq!(config.resources.memory_limit_percent, 80.0);
        assert_eq!(config.defaults.resolution, "1280x720");
        assert_eq!(config.defaults.quality, 23);

        let retry = config.scheduler.retry_policy();
        assert_eq!(retry.delay_for(1), Duration::from_secs(10));
        assert_eq!(retry.delay_for(2), Duration::from_secs(20));
        assert_eq!(retry.delay_for(5), Duration::from_secs(40));
    }

    #[test]
    fn rejects_bad_values() {
        let mut config = Config::default();
        config.resources.max_concurrent_jobs = 0;
        assert!(validate_config(&config).is_err());

        let mut config = Config::default();
        config.resources.cpu_limit_percent = 150.0;
        assert!(validate_config(&config).is_err());

        let mut config = Config::default();
        config.converter.timeout_secs = 0;
        assert!(validate_config(&config).is_err());

        let mut config = Config::default();
        config.defaults.resolution = "large".into();
        assert!(validate_config(&config).is_err());

        let mut config = Config::default();
        config.resources.medium_cpu_percent = 90.0;
        assert!(validate_config(&config).is_err());
    }

    #[test]
    fn load_config_reads_and_validates_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "[converter]\ntimeout_secs = 120").unwrap();
        let config = load_config(file.path()).unwrap();
        assert_eq!(config.converter.timeout_secs, 120);

        let mut bad = tempfile::NamedTempFile::new().unwrap();
        writeln!(bad, "[converter]\ntimeout_secs = 0").unwrap();
        assert!(load_config(bad.path()).is_err());
    }

    #[test]
    fn explicit_missing_path_is_an_error() {
        let missing = Path::new("/nonexistent/transq.toml");
        assert!(load_config_or_default(Some(missing)).is_err());
    }
}
