use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Context as _;
use serde::{Deserialize, Serialize};

use crate::discover::{DiscoveryOptions, DiscoveryStrategy, ProbeTemplate};
use crate::extract::TocRule;
use crate::fetch::DEFAULT_USER_AGENT;
use crate::retry::RetryPolicy;

const ENV_PREFIX: &str = "BOOKHARVEST_";

/// Job settings: defaults, then an optional YAML file, then `BOOKHARVEST_*`
/// environment variables, then command-line flags.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Settings {
    pub data_dir: PathBuf,
    /// Pause after every chapter attempt that touched the network.
    pub delay_ms: u64,
    pub timeout_ms: u64,
    /// Timeout for the root page fetched during discovery.
    pub navigation_timeout_ms: u64,
    pub max_attempts: u32,
    pub backoff_base: f64,
    pub user_agent: String,
    pub expected_chapters: Option<usize>,
    pub probe_template: String,
    pub probe_max: u32,
}

impl Default for Settings {
    fn default() -> Self {
        let probe = ProbeTemplate::default();
        Self {
            data_dir: PathBuf::from("data"),
            delay_ms: 1000,
            timeout_ms: 30_000,
            navigation_timeout_ms: 30_000,
            max_attempts: 3,
            backoff_base: 2.0,
            user_agent: DEFAULT_USER_AGENT.to_string(),
            expected_chapters: None,
            probe_template: probe.pattern,
            probe_max: probe.max,
        }
    }
}

impl Settings {
    /// Defaults overlaid with `path` (if any) and the process environment.
    pub fn load(path: Option<&Path>) -> anyhow::Result<Self> {
        let mut settings = match path {
            Some(path) => Self::from_yaml_file(path)?,
            None => Self::default(),
        };
        settings.apply_env(|key| std::env::var(key).ok())?;
        Ok(settings)
    }

    pub fn from_yaml_file(path: &Path) -> anyhow::Result<Self> {
        let yaml = std::fs::read_to_string(path)
            .with_context(|| format!("read config: {}", path.display()))?;
        Self::from_yaml(&yaml).with_context(|| format!("parse config: {}", path.display()))
    }

    pub fn from_yaml(yaml: &str) -> anyhow::Result<Self> {
        if yaml.trim().is_empty() {
            return Ok(Self::default());
        }
        let settings: Self = serde_yaml::from_str(yaml).context("parse yaml settings")?;
        Ok(settings)
    }

    /// Applies `BOOKHARVEST_<FIELD>` overrides found through `lookup`.
    pub fn apply_env(&mut self, lookup: impl Fn(&str) -> Option<String>) -> anyhow::Result<()> {
        let var = |name: &str| {
            lookup(&format!("{ENV_PREFIX}{name}"))
                .map(|value| value.trim().to_string())
                .filter(|value| !value.is_empty())
        };

        if let Some(value) = var("DATA_DIR") {
            self.data_dir = PathBuf::from(value);
        }
        if let Some(value) = var("DELAY_MS") {
            self.delay_ms = parse_env("DELAY_MS", &value)?;
        }
        if let Some(value) = var("TIMEOUT_MS") {
            self.timeout_ms = parse_env("TIMEOUT_MS", &value)?;
        }
        if let Some(value) = var("NAVIGATION_TIMEOUT_MS") {
            self.navigation_timeout_ms = parse_env("NAVIGATION_TIMEOUT_MS", &value)?;
        }
        if let Some(value) = var("MAX_ATTEMPTS") {
            self.max_attempts = parse_env("MAX_ATTEMPTS", &value)?;
        }
        if let Some(value) = var("BACKOFF_BASE") {
            self.backoff_base = parse_env("BACKOFF_BASE", &value)?;
        }
        if let Some(value) = var("USER_AGENT") {
            self.user_agent = value;
        }
        Ok(())
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if self.max_attempts == 0 {
            anyhow::bail!("max_attempts must be at least 1");
        }
        if !self.backoff_base.is_finite() || self.backoff_base < 1.0 {
            anyhow::bail!("backoff_base must be >= 1.0 (got {})", self.backoff_base);
        }
        if self.timeout_ms == 0 || self.navigation_timeout_ms == 0 {
            anyhow::bail!("timeouts must be greater than zero");
        }
        if !self.probe_template.contains("{n}") {
            anyhow::bail!(
                "probe_template must contain {{n}} (got {:?})",
                self.probe_template
            );
        }
        Ok(())
    }

    pub fn cache_dir(&self) -> PathBuf {
        self.data_dir.join("cache")
    }

    pub fn checkpoint_dir(&self) -> PathBuf {
        self.data_dir.join("checkpoints")
    }

    pub fn output_dir(&self) -> PathBuf {
        self.data_dir.join("output")
    }

    pub fn manifest_path(&self) -> PathBuf {
        self.data_dir.join("manifest.json")
    }

    pub fn delay(&self) -> Duration {
        Duration::from_millis(self.delay_ms)
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::new(self.max_attempts, self.backoff_base)
    }

    pub fn discovery_options(&self) -> DiscoveryOptions {
        let probe = ProbeTemplate {
            pattern: self.probe_template.clone(),
            max: self.probe_max,
            ..ProbeTemplate::default()
        };
        DiscoveryOptions {
            strategies: vec![
                DiscoveryStrategy::TableOfContents {
                    rules: TocRule::DEFAULT_ORDER.to_vec(),
                },
                DiscoveryStrategy::SequentialProbe(probe),
            ],
            expected_chapters: self.expected_chapters,
            timeout: Duration::from_millis(self.navigation_timeout_ms),
        }
    }
}

fn parse_env<T>(name: &str, value: &str) -> anyhow::Result<T>
where
    T: std::str::FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    value
        .parse()
        .with_context(|| format!("invalid {ENV_PREFIX}{name}: {value:?}"))
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    #[test]
    fn defaults_match_one_request_per_second() {
        let settings = Settings::default();
        assert_eq!(settings.delay(), Duration::from_secs(1));
        assert_eq!(settings.timeout(), Duration::from_secs(30));
        assert_eq!(settings.max_attempts, 3);
        assert_eq!(settings.manifest_path(), PathBuf::from("data/manifest.json"));
        settings.validate().unwrap();
    }

    #[test]
    fn yaml_overrides_only_given_fields() {
        let settings = Settings::from_yaml("data_dir: /tmp/books\nmax_attempts: 5\n").unwrap();
        assert_eq!(settings.data_dir, PathBuf::from("/tmp/books"));
        assert_eq!(settings.max_attempts, 5);
        assert_eq!(settings.delay_ms, 1000);
    }

    #[test]
    fn yaml_rejects_unknown_fields() {
        assert!(Settings::from_yaml("delay: 3\n").is_err());
    }

    #[test]
    fn env_overrides_yaml() {
        let env = HashMap::from([
            ("BOOKHARVEST_DELAY_MS".to_string(), "250".to_string()),
            ("BOOKHARVEST_USER_AGENT".to_string(), "agent/1.0".to_string()),
            ("BOOKHARVEST_MAX_ATTEMPTS".to_string(), " ".to_string()),
        ]);
        let mut settings = Settings::from_yaml("delay_ms: 5000\nmax_attempts: 4\n").unwrap();
        settings.apply_env(|key| env.get(key).cloned()).unwrap();

        assert_eq!(settings.delay_ms, 250);
        assert_eq!(settings.user_agent, "agent/1.0");
        assert_eq!(settings.max_attempts, 4);
    }

    #[test]
    fn malformed_env_value_is_an_error() {
        let mut settings = Settings::default();
        let err = settings
            .apply_env(|key| (key == "BOOKHARVEST_BACKOFF_BASE").then(|| "fast".to_string()))
            .unwrap_err();
        assert!(err.to_string().contains("BOOKHARVEST_BACKOFF_BASE"));
    }

    #[test]
    fn validate_rejects_zero_attempts() {
        let settings = Settings {
            max_attempts: 0,
            ..Settings::default()
        };
        assert!(settings.validate().is_err());
    }
}
