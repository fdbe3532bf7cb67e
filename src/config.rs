use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    pub repo: RepoConfig,
    pub db: DbConfig,
    #[serde(default)]
    pub cache: CacheConfig,
    #[serde(default)]
    pub widgets: WidgetsConfig,
    #[serde(default)]
    pub notifications: NotificationsConfig,
    #[serde(default)]
    pub worker: WorkerConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct RepoConfig {
    /// Working copy root. Pages live under `<path>/pages`, attachments
    /// under `<path>/attachments`.
    pub path: PathBuf,
    /// Branch to push/pull. Empty means the repository default.
    #[serde(default)]
    pub branch: String,
    /// Remote URL to clone from / push to. Empty means local-only.
    #[serde(default)]
    pub remote_url: String,
    /// Public base URL of the wiki, used to build absolute page links in
    /// notifications. Empty disables link resolution.
    #[serde(default)]
    pub site_url: String,
}

#[derive(Debug, Deserialize, Clone)]
pub struct DbConfig {
    pub path: PathBuf,
}

#[derive(Debug, Deserialize, Clone)]
pub struct CacheConfig {
    #[serde(default = "default_cache_backend")]
    pub backend: String,
    #[serde(default = "default_cache_ttl")]
    pub ttl_secs: u64,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            backend: default_cache_backend(),
            ttl_secs: default_cache_ttl(),
        }
    }
}

fn default_cache_backend() -> String {
    "memory".to_string()
}
fn default_cache_ttl() -> u64 {
    1800
}

#[derive(Debug, Deserialize, Clone)]
pub struct WidgetsConfig {
    #[serde(default = "default_widget_limit")]
    pub limit: usize,
    #[serde(default = "default_stale_min_days")]
    pub stale_min_days: i64,
    #[serde(default = "default_stale_max_days")]
    pub stale_max_days: i64,
}

impl Default for WidgetsConfig {
    fn default() -> Self {
        Self {
            limit: default_widget_limit(),
            stale_min_days: default_stale_min_days(),
            stale_max_days: default_stale_max_days(),
        }
    }
}

fn default_widget_limit() -> usize {
    8
}
fn default_stale_min_days() -> i64 {
    270
}
fn default_stale_max_days() -> i64 {
    365
}

#[derive(Debug, Deserialize, Clone, Default)]
pub struct NotificationsConfig {
    /// Incoming-webhook URL. Empty disables notification dispatch.
    #[serde(default)]
    pub webhook_url: String,
    #[serde(default = "default_webhook_timeout")]
    pub timeout_secs: u64,
}

fn default_webhook_timeout() -> u64 {
    10
}

#[derive(Debug, Deserialize, Clone)]
pub struct WorkerConfig {
    #[serde(default = "default_worker_count")]
    pub count: usize,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            count: default_worker_count(),
        }
    }
}

fn default_worker_count() -> usize {
    2
}

impl NotificationsConfig {
    pub fn is_enabled(&self) -> bool {
        !self.webhook_url.trim().is_empty()
    }

    pub fn webhook_url(&self) -> Option<&str> {
        let url = self.webhook_url.trim();
        if url.is_empty() {
            None
        } else {
            Some(url)
        }
    }
}

pub fn load_config(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    let config: Config = toml::from_str(&content).with_context(|| "Failed to parse config file")?;
    validate(&config)?;
    Ok(config)
}

fn validate(config: &Config) -> Result<()> {
    match config.cache.backend.as_str() {
        "memory" | "sqlite" => {}
        other => anyhow::bail!("Unknown cache backend: '{}'. Must be memory or sqlite.", other),
    }

    if config.cache.ttl_secs == 0 {
        anyhow::bail!("cache.ttl_secs must be > 0");
    }

    if config.worker.count == 0 {
        anyhow::bail!("worker.count must be >= 1");
    }

    if config.widgets.stale_min_days >= config.widgets.stale_max_days {
        anyhow::bail!("widgets.stale_min_days must be < widgets.stale_max_days");
    }

    let site_url = config.repo.site_url.trim();
    if !site_url.is_empty() && !site_url.starts_with("http://") && !site_url.starts_with("https://")
    {
        anyhow::bail!("repo.site_url must start with http:// or https://, got: {}", site_url);
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(toml_str: &str) -> Result<Config> {
        let config: Config = toml::from_str(toml_str)?;
        validate(&config)?;
        Ok(config)
    }

    const MINIMAL: &str = r#"
[repo]
path = "/tmp/wiki"

[db]
path = "/tmp/wiki.sqlite"
"#;

    #[test]
    fn minimal_config_uses_defaults() {
        let config = parse(MINIMAL).unwrap();
        assert_eq!(config.cache.backend, "memory");
        assert_eq!(config.cache.ttl_secs, 1800);
        assert_eq!(config.widgets.limit, 8);
        assert_eq!(config.widgets.stale_min_days, 270);
        assert_eq!(config.widgets.stale_max_days, 365);
        assert_eq!(config.worker.count, 2);
        assert!(!config.notifications.is_enabled());
    }

    #[test]
    fn rejects_unknown_cache_backend() {
        let toml_str = format!("{}\n[cache]\nbackend = \"redis\"\n", MINIMAL);
        assert!(parse(&toml_str).is_err());
    }

    #[test]
    fn rejects_inverted_stale_window() {
        let toml_str = format!(
            "{}\n[widgets]\nstale_min_days = 400\nstale_max_days = 365\n",
            MINIMAL
        );
        assert!(parse(&toml_str).is_err());
    }

    #[test]
    fn rejects_site_url_without_scheme() {
        let toml_str = MINIMAL.replace(
            "path = \"/tmp/wiki\"",
            "path = \"/tmp/wiki\"\nsite_url = \"wiki.example.com\"",
        );
        assert!(parse(&toml_str).is_err());
    }

    #[test]
    fn webhook_url_trims_whitespace() {
        let toml_str = format!(
            "{}\n[notifications]\nwebhook_url = \"  https://hooks.example.com/abc  \"\n",
            MINIMAL
        );
        let config = parse(&toml_str).unwrap();
        assert!(config.notifications.is_enabled());
        assert_eq!(
            config.notifications.webhook_url(),
            Some("https://hooks.example.com/abc")
        );
    }
}
