//! Configuration types for the reporting agent

use std::time::Duration;

const DEFAULT_REPORT_INTERVAL: Duration = Duration::from_secs(10);

/// Agent configuration
#[derive(Debug, Clone, Default)]
pub struct Config {
    /// Seconds between reports (None = library default, 10s)
    pub report_interval_secs: Option<u64>,
}

impl Config {
    /// How often the reporter drains the buffer into the sender.
    pub fn report_interval(&self) -> Duration {
        self.report_interval_secs
            .map(Duration::from_secs)
            .unwrap_or(DEFAULT_REPORT_INTERVAL)
    }

    /// Validate configuration
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.report_interval_secs == Some(0) {
            anyhow::bail!("Report interval must be greater than 0");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_report_interval() {
        let config = Config::default();
        assert_eq!(config.report_interval(), Duration::from_secs(10));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_custom_report_interval() {
        let config = Config {
            report_interval_secs: Some(2),
        };
        assert_eq!(config.report_interval(), Duration::from_secs(2));
    }

    #[test]
    fn test_validation_zero_interval() {
        let config = Config {
            report_interval_secs: Some(0),
        };
        assert!(config.validate().is_err());
    }
}
