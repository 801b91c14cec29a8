use serde::Deserialize;
use std::path::Path;

use crate::executor::Fallback;
use crate::schedule::Schedule;

#[derive(Debug, Deserialize, Clone, Default)]
pub struct Config {
    #[serde(default)]
    pub executor: ExecutorConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
    #[serde(default)]
    pub archive: ArchiveConfig,
}

#[derive(Debug, Deserialize, Clone, Default)]
pub struct ExecutorConfig {
    /// Negative: manual, zero: immediate, positive: deferred by that many seconds
    #[serde(default)]
    pub delay_secs: i64,
    /// "report" or "log_only"
    #[serde(default)]
    pub fallback: Fallback,
}

#[derive(Debug, Deserialize, Clone)]
pub struct LoggingConfig {
    /// EnvFilter directive, used when RUST_LOG is unset
    #[serde(default = "default_log_filter")]
    pub filter: String,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ArchiveConfig {
    #[serde(default = "default_max_bytes")]
    pub max_bytes: u64,
}

fn default_log_filter() -> String {
    "guarded_exec=info".to_string()
}

fn default_max_bytes() -> u64 {
    1024 * 1024
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            filter: default_log_filter(),
        }
    }
}

impl Default for ArchiveConfig {
    fn default() -> Self {
        Self {
            max_bytes: default_max_bytes(),
        }
    }
}

impl ExecutorConfig {
    pub fn schedule(&self) -> Schedule {
        Schedule::from_delay_secs(self.delay_secs)
    }

    /// Human-readable description of the schedule
    pub fn schedule_description(&self) -> String {
        match self.schedule() {
            Schedule::Immediate => "immediate".to_string(),
            Schedule::Deferred(d) => format!("deferred ({}s)", d.as_secs()),
            Schedule::Manual => "manual".to_string(),
        }
    }
}

impl Config {
    pub fn load(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::parse(&content)
    }

    pub fn parse(content: &str) -> anyhow::Result<Self> {
        // Expand environment variables like ${GUARD_DELAY}
        let expanded = shellexpand::env(content)?;
        let config: Config = toml::from_str(&expanded)?;
        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_empty_config_uses_defaults() {
        let config = Config::parse("").unwrap();
        assert_eq!(config.executor.delay_secs, 0);
        assert_eq!(config.executor.fallback, Fallback::Report);
        assert_eq!(config.logging.filter, "guarded_exec=info");
        assert_eq!(config.archive.max_bytes, 1024 * 1024);
    }

    #[test]
    fn test_full_config() {
        let config = Config::parse(
            r#"
            [executor]
            delay_secs = -1
            fallback = "log_only"

            [logging]
            filter = "guarded_exec=debug"

            [archive]
            max_bytes = 2048
            "#,
        )
        .unwrap();
        assert_eq!(config.executor.schedule(), Schedule::Manual);
        assert_eq!(config.executor.fallback, Fallback::LogOnly);
        assert_eq!(config.logging.filter, "guarded_exec=debug");
        assert_eq!(config.archive.max_bytes, 2048);
    }

    #[test]
    fn test_unknown_fallback_rejected() {
        let result = Config::parse("[executor]\nfallback = \"ignore\"\n");
        assert!(result.is_err());
    }

    #[test]
    fn test_env_var_expansion() {
        // Tests run in parallel: this variable is set and read only here
        std::env::set_var("GUARDED_EXEC_CONFIG_TEST_ENV_EXPANSION_DELAY", "4");
        let config = Config::parse(
            "[executor]\ndelay_secs = ${GUARDED_EXEC_CONFIG_TEST_ENV_EXPANSION_DELAY}\n",
        )
        .unwrap();
        assert_eq!(
            config.executor.schedule(),
            Schedule::Deferred(Duration::from_secs(4))
        );
    }

    #[test]
    fn test_missing_env_var_is_error() {
        let result = Config::parse("[logging]\nfilter = \"${GUARDED_EXEC_TEST_UNSET_VAR}\"\n");
        assert!(result.is_err());
    }

    #[test]
    fn test_load_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("guarded-exec.toml");
        std::fs::write(&path, "[archive]\nmax_bytes = 10\n").unwrap();

        let config = Config::load(&path).unwrap();
        assert_eq!(config.archive.max_bytes, 10);
    }

    #[test]
    fn test_load_missing_file_is_error() {
        assert!(Config::load("/nonexistent/guarded-exec.toml").is_err());
    }

    // ── schedule_description tests ──────────────────────

    #[test]
    fn test_schedule_description() {
        let mut executor = ExecutorConfig::default();
        assert_eq!(executor.schedule_description(), "immediate");
        executor.delay_secs = 3;
        assert_eq!(executor.schedule_description(), "deferred (3s)");
        executor.delay_secs = -5;
        assert_eq!(executor.schedule_description(), "manual");
    }
}
