use std::env;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::{auth, dispatch, pipeline, storage};

const DEFAULT_ENV_PREFIX: &str = "REDLURK";

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct Config {
    #[serde(default)]
    pub reddit: RedditConfig,
    #[serde(default)]
    pub http: HttpConfig,
    #[serde(default)]
    pub storage: StorageConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RedditConfig {
    #[serde(default)]
    pub client_id: String,
    #[serde(default)]
    pub client_secret: String,
    #[serde(default = "default_user_agent")]
    pub user_agent: String,
    #[serde(default = "default_scopes")]
    pub scopes: Vec<String>,
    #[serde(default = "default_redirect_uri")]
    pub redirect_uri: String,
    /// Fixed device id for the anonymous grant. A random one is generated
    /// and persisted with the credential when unset.
    #[serde(default)]
    pub device_id: Option<String>,
}

impl Default for RedditConfig {
    fn default() -> Self {
        Self {
            client_id: String::new(),
            client_secret: String::new(),
            user_agent: default_user_agent(),
            scopes: default_scopes(),
            redirect_uri: default_redirect_uri(),
            device_id: None,
        }
    }
}

fn default_user_agent() -> String {
    auth::Config::default().user_agent
}

fn default_scopes() -> Vec<String> {
    auth::Config::default().scope
}

fn default_redirect_uri() -> String {
    auth::Config::default().redirect_uri
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct HttpConfig {
    #[serde(default = "default_base_url")]
    pub base_url: String,
    #[serde(default = "default_authorize_url")]
    pub authorize_url: String,
    #[serde(default = "default_token_url")]
    pub token_url: String,
    #[serde(default = "default_revoke_url")]
    pub revoke_url: String,
    #[serde(default = "default_timeout", with = "humantime_serde")]
    pub timeout: Duration,
    #[serde(default = "default_refresh_skew", with = "humantime_serde")]
    pub refresh_skew: Duration,
    #[serde(default = "default_workers")]
    pub workers: usize,
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            base_url: default_base_url(),
            authorize_url: default_authorize_url(),
            token_url: default_token_url(),
            revoke_url: default_revoke_url(),
            timeout: default_timeout(),
            refresh_skew: default_refresh_skew(),
            workers: default_workers(),
        }
    }
}

fn default_base_url() -> String {
    pipeline::DEFAULT_BASE_URL.into()
}

fn default_authorize_url() -> String {
    auth::Config::default().auth_url
}

fn default_token_url() -> String {
    auth::Config::default().token_url
}

fn default_revoke_url() -> String {
    auth::Config::default().revoke_url
}

fn default_timeout() -> Duration {
    Duration::from_secs(20)
}

fn default_refresh_skew() -> Duration {
    Duration::from_secs(30)
}

fn default_workers() -> usize {
    dispatch::Config::default().workers
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct StorageConfig {
    /// Database holding the credential. `None` keeps it in memory only.
    #[serde(default = "default_storage_path")]
    pub path: Option<PathBuf>,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            path: default_storage_path(),
        }
    }
}

fn default_storage_path() -> Option<PathBuf> {
    storage::default_path()
}

impl Config {
    pub fn auth(&self) -> auth::Config {
        auth::Config {
            client_id: self.reddit.client_id.clone(),
            client_secret: self.reddit.client_secret.clone(),
            scope: self.reddit.scopes.clone(),
            user_agent: self.reddit.user_agent.clone(),
            auth_url: self.http.authorize_url.clone(),
            token_url: self.http.token_url.clone(),
            revoke_url: self.http.revoke_url.clone(),
            redirect_uri: self.reddit.redirect_uri.clone(),
            timeout: self.http.timeout,
            ..auth::Config::default()
        }
    }

    pub fn pipeline(&self) -> pipeline::PipelineConfig {
        pipeline::PipelineConfig {
            user_agent: self.reddit.user_agent.clone(),
            base_url: Some(self.http.base_url.clone()),
            timeout: self.http.timeout,
            refresh_skew: self.http.refresh_skew,
            http_client: None,
        }
    }

    pub fn dispatch(&self) -> dispatch::Config {
        dispatch::Config {
            workers: self.http.workers,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct LoadOptions {
    pub config_file: Option<PathBuf>,
    pub env_prefix: Option<String>,
}

pub fn load(options: LoadOptions) -> Result<Config> {
    let mut cfg = Config::default();

    let path = options.config_file.or_else(default_config_path);
    if let Some(path) = path {
        if path.exists() {
            let from_file = read_config_file(&path)?;
            cfg = merge_config(cfg, from_file);
        }
    }

    let prefix = options.env_prefix.as_deref().unwrap_or(DEFAULT_ENV_PREFIX);
    apply_env(&mut cfg, prefix);

    Ok(cfg)
}

fn read_config_file(path: &Path) -> Result<Config> {
    let data = fs::read_to_string(path)
        .with_context(|| format!("config: read {}", path.display()))?;
    let config: Config = serde_yaml::from_str(&data)
        .with_context(|| format!("config: parse {}", path.display()))?;
    Ok(config)
}

fn merge_config(mut base: Config, other: Config) -> Config {
    if !other.reddit.client_id.is_empty() {
        base.reddit.client_id = other.reddit.client_id;
    }
    if !other.reddit.client_secret.is_empty() {
        base.reddit.client_secret = other.reddit.client_secret;
    }
    if !other.reddit.user_agent.is_empty() {
        base.reddit.user_agent = other.reddit.user_agent;
    }
    if !other.reddit.scopes.is_empty() {
        base.reddit.scopes = other.reddit.scopes;
    }
    if !other.reddit.redirect_uri.is_empty() {
        base.reddit.redirect_uri = other.reddit.redirect_uri;
    }
    if other.reddit.device_id.is_some() {
        base.reddit.device_id = other.reddit.device_id;
    }

    if !other.http.base_url.is_empty() {
        base.http.base_url = other.http.base_url;
    }
    if !other.http.authorize_url.is_empty() {
        base.http.authorize_url = other.http.authorize_url;
    }
    if !other.http.token_url.is_empty() {
        base.http.token_url = other.http.token_url;
    }
    if !other.http.revoke_url.is_empty() {
        base.http.revoke_url = other.http.revoke_url;
    }
    if !other.http.timeout.is_zero() {
        base.http.timeout = other.http.timeout;
    }
    base.http.refresh_skew = other.http.refresh_skew;
    if other.http.workers != 0 {
        base.http.workers = other.http.workers;
    }

    base.storage.path = other.storage.path;

    base
}

fn apply_env(cfg: &mut Config, prefix: &str) {
    let upper_prefix = format!("{}_", prefix.to_uppercase());
    for (key, value) in env::vars() {
        if let Some(stripped) = key.strip_prefix(&upper_prefix) {
            let normalized = stripped.to_ascii_lowercase().replace("__", ".");
            apply_env_value(cfg, &normalized, value);
        }
    }
}

fn apply_env_value(cfg: &mut Config, key: &str, value: String) {
    match key {
        "reddit.client_id" => cfg.reddit.client_id = value,
        "reddit.client_secret" => cfg.reddit.client_secret = value,
        "reddit.user_agent" => cfg.reddit.user_agent = value,
        "reddit.redirect_uri" => cfg.reddit.redirect_uri = value,
        "reddit.device_id" => cfg.reddit.device_id = Some(value).filter(|v| !v.is_empty()),
        "reddit.scopes" => {
            cfg.reddit.scopes = value
                .split(',')
                .map(|s| s.trim().to_string())
                .filter(|s| !s.is_empty())
                .collect();
        }
        "http.base_url" => cfg.http.base_url = value,
        "http.authorize_url" => cfg.http.authorize_url = value,
        "http.token_url" => cfg.http.token_url = value,
        "http.revoke_url" => cfg.http.revoke_url = value,
        "http.timeout" => {
            if let Ok(duration) = humantime::parse_duration(&value) {
                cfg.http.timeout = duration;
            }
        }
        "http.refresh_skew" => {
            if let Ok(duration) = humantime::parse_duration(&value) {
                cfg.http.refresh_skew = duration;
            }
        }
        "http.workers" => {
            if let Ok(parsed) = value.parse::<usize>() {
                cfg.http.workers = parsed;
            }
        }
        "storage.path" => {
            cfg.storage.path = if value.is_empty() {
                None
            } else {
                Some(PathBuf::from(value))
            };
        }
        _ => {}
    }
}

pub fn default_path() -> Option<PathBuf> {
    default_config_path()
}

fn default_config_path() -> Option<PathBuf> {
    dirs::config_dir().map(|dir| dir.join("redlurk").join("config.yaml"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn isolated(dir: &tempfile::TempDir, prefix: &str) -> LoadOptions {
        LoadOptions {
            config_file: Some(dir.path().join("config.yaml")),
            env_prefix: Some(prefix.into()),
        }
    }

    #[test]
    fn load_defaults_without_files() {
        let dir = tempdir().unwrap();
        let cfg = load(isolated(&dir, "REDLURK_TEST_DEFAULTS")).unwrap();
        assert_eq!(cfg.http.timeout, Duration::from_secs(20));
        assert_eq!(cfg.http.refresh_skew, Duration::from_secs(30));
        assert_eq!(cfg.http.workers, 2);
        assert_eq!(cfg.http.base_url, pipeline::DEFAULT_BASE_URL);
        assert_eq!(cfg.reddit.redirect_uri, default_redirect_uri());
        assert!(cfg.reddit.scopes.iter().any(|s| s == "identity"));
    }

    #[test]
    fn file_values_override_defaults() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("config.yaml");
        fs::write(
            &path,
            "reddit:\n  client_id: abc\n  device_id: fixed-device\nhttp:\n  timeout: 5s\n  workers: 4\nstorage:\n  path: null\n",
        )
        .unwrap();

        let cfg = load(isolated(&dir, "REDLURK_TEST_FILE")).unwrap();
        assert_eq!(cfg.reddit.client_id, "abc");
        assert_eq!(cfg.reddit.device_id.as_deref(), Some("fixed-device"));
        assert_eq!(cfg.http.timeout, Duration::from_secs(5));
        assert_eq!(cfg.http.workers, 4);
        assert_eq!(cfg.http.refresh_skew, Duration::from_secs(30));
        assert!(cfg.storage.path.is_none());
        assert_eq!(cfg.reddit.user_agent, default_user_agent());
    }

    #[test]
    fn malformed_file_is_reported() {
        let dir = tempdir().unwrap();
        fs::write(dir.path().join("config.yaml"), "http: [not, a, map").unwrap();
        let err = load(isolated(&dir, "REDLURK_TEST_BROKEN")).unwrap_err();
        assert!(format!("{err:#}").contains("config: parse"));
    }

    #[test]
    fn env_overrides_file() {
        let dir = tempdir().unwrap();
        fs::write(
            dir.path().join("config.yaml"),
            "http:\n  timeout: 5s\n",
        )
        .unwrap();
        env::set_var("REDLURK_TEST_ENV_HTTP__TIMEOUT", "15s");
        env::set_var("REDLURK_TEST_ENV_REDDIT__SCOPES", "identity, read,,vote");
        env::set_var("REDLURK_TEST_ENV_STORAGE__PATH", "");
        let cfg = load(isolated(&dir, "REDLURK_TEST_ENV")).unwrap();
        env::remove_var("REDLURK_TEST_ENV_HTTP__TIMEOUT");
        env::remove_var("REDLURK_TEST_ENV_REDDIT__SCOPES");
        env::remove_var("REDLURK_TEST_ENV_STORAGE__PATH");

        assert_eq!(cfg.http.timeout, Duration::from_secs(15));
        assert_eq!(cfg.reddit.scopes, vec!["identity", "read", "vote"]);
        assert!(cfg.storage.path.is_none());
    }

    #[test]
    fn derived_configs_carry_shared_settings() {
        let mut cfg = Config::default();
        cfg.reddit.client_id = "client".into();
        cfg.http.timeout = Duration::from_secs(7);
        cfg.http.base_url = "http://127.0.0.1:9/".into();

        let auth = cfg.auth();
        assert_eq!(auth.client_id, "client");
        assert_eq!(auth.timeout, Duration::from_secs(7));
        assert_eq!(auth.user_agent, cfg.reddit.user_agent);

        let pipeline = cfg.pipeline();
        assert_eq!(pipeline.base_url.as_deref(), Some("http://127.0.0.1:9/"));
        assert_eq!(pipeline.timeout, Duration::from_secs(7));
        assert_eq!(cfg.dispatch().workers, 2);
    }
}
