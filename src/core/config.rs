use super::calendar::CalendarSettings;
use super::dividends::DividendSettings;
use super::dollar::DollarSettings;
use super::evolution::EvolutionSettings;
use super::governor::DEFAULT_MAX_BACKOFF_HOURS;
use super::position::Position;
use super::refresher::RefreshSettings;
use super::scheduler::SchedulerSettings;
use anyhow::{Context, Result};
use directories::ProjectDirs;
use serde::{Deserialize, Serialize};
use std::{fs, path::PathBuf};
use tracing::debug;

/// An owner and the positions they currently hold.
#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct OwnerConfig {
    pub id: String,
    #[serde(default)]
    pub positions: Vec<Position>,
}

fn default_timeout_secs() -> u64 {
    15
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct YahooProviderConfig {
    pub base_url: String,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct ProvidersConfig {
    pub yahoo: Option<YahooProviderConfig>,
}

impl Default for ProvidersConfig {
    fn default() -> Self {
        ProvidersConfig {
            yahoo: Some(YahooProviderConfig {
                base_url: "https://query1.finance.yahoo.com".to_string(),
                timeout_secs: default_timeout_secs(),
            }),
        }
    }
}

#[derive(Debug, Deserialize, Serialize, Clone, PartialEq)]
#[serde(default)]
pub struct GovernorConfig {
    /// Ceiling for the doubling pause, in hours.
    pub max_backoff_hours: u32,
}

impl Default for GovernorConfig {
    fn default() -> Self {
        Self {
            max_backoff_hours: DEFAULT_MAX_BACKOFF_HOURS,
        }
    }
}

#[derive(Debug, Deserialize, Serialize, Clone, Default)]
pub struct AppConfig {
    #[serde(default)]
    pub owners: Vec<OwnerConfig>,
    #[serde(default)]
    pub providers: ProvidersConfig,
    #[serde(default)]
    pub dollar: DollarSettings,
    #[serde(default)]
    pub governor: GovernorConfig,
    #[serde(default)]
    pub refresh: RefreshSettings,
    #[serde(default)]
    pub evolution: EvolutionSettings,
    #[serde(default)]
    pub dividends: DividendSettings,
    #[serde(default)]
    pub calendar: CalendarSettings,
    #[serde(default)]
    pub scheduler: SchedulerSettings,
    pub data_path: Option<String>,
}

impl AppConfig {
    pub fn load() -> Result<Self> {
        debug!("Loading default config");
        let config_path = Self::default_config_path()?;
        Self::load_from_path(&config_path)
    }

    pub fn default_config_path() -> Result<PathBuf> {
        let proj_dirs = ProjectDirs::from("dev", "marketcache", "marketcache")
            .context("Could not determine project directories")?;
        Ok(proj_dirs.config_dir().join("config.yaml"))
    }

    pub fn default_data_path(&self) -> Result<PathBuf> {
        if let Some(custom_path) = &self.data_path {
            return Ok(PathBuf::from(custom_path));
        }
        let proj_dirs = ProjectDirs::from("dev", "marketcache", "marketcache")
            .context("Could not determine project directories")?;
        Ok(proj_dirs.data_dir().to_path_buf())
    }

    pub fn yahoo_base_url(&self) -> &str {
        self.providers
            .yahoo
            .as_ref()
            .map_or("https://query1.finance.yahoo.com", |p| &p.base_url)
    }

    pub fn yahoo_timeout_secs(&self) -> u64 {
        self.providers
            .yahoo
            .as_ref()
            .map_or(default_timeout_secs(), |p| p.timeout_secs)
    }

    pub fn load_from_path<P: AsRef<std::path::Path>>(path: P) -> Result<Self> {
        let config_str = fs::read_to_string(path.as_ref())
            .with_context(|| format!("Failed to read config file: {}", path.as_ref().display()))?;

        let config: Self = serde_yaml::from_str(&config_str)
            .with_context(|| format!("Failed to parse config file: {}", path.as_ref().display()))?;
        debug!(owners = config.owners.len(), "Successfully loaded config");
        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{NaiveDate, NaiveTime};
    use rust_decimal_macros::dec;
    use std::io::Write;

    #[test]
    fn test_config_deserialization() {
        let yaml_str = r#"
owners:
  - id: alice
    positions:
      - ticker: PETR4
        average_cost: 20.5
        quantity: 100
      - ticker: AAPL
        average_cost: "150.25"
        quantity: 10
  - id: bob
"#;

        let config: AppConfig = serde_yaml::from_str(yaml_str).expect("Failed to deserialize");
        assert_eq!(config.owners.len(), 2);
        assert_eq!(config.owners[0].id, "alice");
        assert_eq!(config.owners[0].positions.len(), 2);
        assert_eq!(config.owners[0].positions[0].average_cost, dec!(20.5));
        assert_eq!(config.owners[0].positions[1].average_cost, dec!(150.25));
        assert!(config.owners[1].positions.is_empty());

        assert_eq!(config.yahoo_base_url(), "https://query1.finance.yahoo.com");
        assert_eq!(config.dollar, DollarSettings::default());
        assert_eq!(config.governor.max_backoff_hours, 24);
        assert_eq!(config.refresh.min_interval_secs, 1500);
        assert_eq!(config.calendar, CalendarSettings::default());
        assert!(config.data_path.is_none());
    }

    #[test]
    fn test_partial_sections_keep_defaults() {
        let yaml_str = r#"
providers:
  yahoo:
    base_url: "http://example.com/yahoo"
dollar:
  default_rate: 5.1
refresh:
  probe_symbol: MSFT
dividends:
  since: 2024-01-01
scheduler:
  dividends_at: "09:45:00"
governor:
  max_backoff_hours: 6
data_path: /tmp/marketcache
"#;
        let config: AppConfig = serde_yaml::from_str(yaml_str).unwrap();
        assert_eq!(config.yahoo_base_url(), "http://example.com/yahoo");
        assert_eq!(config.yahoo_timeout_secs(), 15);
        assert_eq!(config.dollar.default_rate, dec!(5.1));
        assert_eq!(config.dollar.pair, "USDBRL=X");
        assert_eq!(config.refresh.probe_symbol, "MSFT");
        assert_eq!(config.refresh.window_days, 30);
        assert_eq!(
            config.dividends.since,
            NaiveDate::from_ymd_opt(2024, 1, 1).unwrap()
        );
        assert_eq!(
            config.scheduler.dividends_at,
            NaiveTime::from_hms_opt(9, 45, 0).unwrap()
        );
        assert_eq!(config.scheduler.refresh_interval_secs, 1800);
        assert_eq!(config.governor.max_backoff_hours, 6);
        assert_eq!(
            config.default_data_path().unwrap(),
            PathBuf::from("/tmp/marketcache")
        );
    }

    #[test]
    fn test_load_from_path() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "owners:\n  - id: carol\n    positions: []").unwrap();
        let config = AppConfig::load_from_path(file.path()).unwrap();
        assert_eq!(config.owners[0].id, "carol");

        let missing = AppConfig::load_from_path("/nonexistent/marketcache.yaml");
        assert!(missing.is_err());
    }
}
