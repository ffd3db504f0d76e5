use serde::Deserialize;
use std::{env, path::Path, path::PathBuf, time::Duration};
use thiserror::Error;

use crate::engine::ImportSettings;
use crate::ticketing::RetryPolicy;

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct Config {
    pub app: AppConfig,
    pub paths: PathsConfig,
    #[serde(default)]
    pub telemetry: TelemetryConfig,
    pub freshdesk: FreshdeskConfig,
    pub import: ImportConfig,
    #[serde(default)]
    pub retry: RetryConfig,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct AppConfig {
    #[serde(default = "default_service_name")]
    pub service_name: String,
    #[serde(default = "default_env")]
    pub env: String,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct PathsConfig {
    #[serde(default = "default_mbox_path")]
    pub mbox: PathBuf,
    #[serde(default = "default_database_path")]
    pub database: PathBuf,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct TelemetryConfig {
    pub otlp_endpoint: Option<String>,
    #[serde(default)]
    pub export_traces: bool,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct FreshdeskConfig {
    pub domain: String,
    pub api_key: String,
    /// Overrides `https://{domain}.freshdesk.com/api/v2`.
    pub api_base: Option<String>,
    #[serde(default = "default_ticket_status")]
    pub ticket_status: u8,
    #[serde(default = "default_ticket_priority")]
    pub ticket_priority: u8,
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct ImportConfig {
    #[serde(default = "default_original_date_field")]
    pub original_date_field: String,
    #[serde(default = "default_group_name")]
    pub group_name: String,
    #[serde(default = "default_tag")]
    pub tag: String,
    pub mailbox_owner: String,
    #[serde(default = "default_rate_delay_ms")]
    pub rate_delay_ms: u64,
    #[serde(default = "default_spam_labels")]
    pub spam_labels: Vec<String>,
    #[serde(default = "default_trash_labels")]
    pub trash_labels: Vec<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct RetryConfig {
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_base_delay_ms")]
    pub base_delay_ms: u64,
    #[serde(default = "default_multiplier")]
    pub multiplier: f64,
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            base_delay_ms: default_base_delay_ms(),
            multiplier: default_multiplier(),
            max_delay_ms: default_max_delay_ms(),
        }
    }
}

impl RetryConfig {
    pub fn policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_attempts: self.max_attempts,
            base_delay: Duration::from_millis(self.base_delay_ms),
            multiplier: self.multiplier,
            max_delay: Duration::from_millis(self.max_delay_ms),
            jitter: true,
        }
    }
}

impl ImportConfig {
    pub fn settings(&self) -> ImportSettings {
        ImportSettings {
            original_date_field: self.original_date_field.clone(),
            group_name: self.group_name.clone(),
            tag: self.tag.clone(),
            mailbox_owner: self.mailbox_owner.clone(),
            rate_delay: Duration::from_millis(self.rate_delay_ms),
        }
    }
}

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("failed to read configuration file: {0}")]
    ConfigBuild(config::ConfigError),
    #[error("failed to parse configuration: {0}")]
    Deserialize(config::ConfigError),
    #[error("missing required environment variable {0}")]
    MissingEnvVar(String),
    #[error("invalid IMPORT_RATE_DELAY_MS override: {0}")]
    InvalidRateDelay(std::num::ParseIntError),
    #[error("invalid configuration: {0}")]
    Invalid(String),
}

impl Config {
    /// Load configuration from the provided path, apply environment overrides, and
    /// resolve any `env:` indirections.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let raw = config::Config::builder()
            .add_source(config::File::from(path.as_ref()))
            .build()
            .map_err(ConfigError::ConfigBuild)?;

        let mut cfg: Config = raw.try_deserialize().map_err(ConfigError::Deserialize)?;
        cfg.apply_env_overrides()?;
        cfg.resolve_env_markers()?;
        cfg.expand_paths();
        cfg.validate()?;
        Ok(cfg)
    }

    fn apply_env_overrides(&mut self) -> Result<(), ConfigError> {
        if let Ok(domain) = env::var("FRESHDESK_DOMAIN") {
            self.freshdesk.domain = domain;
        }

        if let Ok(key) = env::var("FRESHDESK_API_KEY") {
            self.freshdesk.api_key = key;
        }

        if let Ok(path) = env::var("MBOX_PATH") {
            self.paths.mbox = PathBuf::from(path);
        }

        if let Ok(owner) = env::var("MAILBOX_OWNER_EMAIL") {
            self.import.mailbox_owner = owner;
        }

        if let Ok(delay) = env::var("IMPORT_RATE_DELAY_MS") {
            self.import.rate_delay_ms = delay.parse().map_err(ConfigError::InvalidRateDelay)?;
        }

        if let Ok(otlp) = env::var("OTLP_ENDPOINT") {
            self.telemetry.otlp_endpoint = Some(otlp);
        }

        Ok(())
    }

    fn resolve_env_markers(&mut self) -> Result<(), ConfigError> {
        apply_env_marker(&mut self.app.service_name)?;
        apply_env_marker(&mut self.app.env)?;
        apply_env_marker(&mut self.freshdesk.domain)?;
        apply_env_marker(&mut self.freshdesk.api_key)?;
        if let Some(base) = &mut self.freshdesk.api_base {
            apply_env_marker(base)?;
        }
        apply_env_marker(&mut self.import.mailbox_owner)?;
        apply_env_marker(&mut self.import.group_name)?;
        apply_env_marker_path(&mut self.paths.mbox)?;
        apply_env_marker_path(&mut self.paths.database)?;
        if let Some(endpoint) = &mut self.telemetry.otlp_endpoint {
            apply_env_marker(endpoint)?;
        }
        Ok(())
    }

    fn expand_paths(&mut self) {
        self.paths.mbox = expand_tilde(&self.paths.mbox);
        self.paths.database = expand_tilde(&self.paths.database);
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.freshdesk.domain.trim().is_empty() && self.freshdesk.api_base.is_none() {
            return Err(ConfigError::Invalid(
                "freshdesk.domain or freshdesk.api_base must be set".into(),
            ));
        }
        if self.freshdesk.api_key.trim().is_empty() {
            return Err(ConfigError::Invalid("freshdesk.api_key is empty".into()));
        }
        if !self.import.mailbox_owner.contains('@') {
            return Err(ConfigError::Invalid(format!(
                "import.mailbox_owner is not an email address: {:?}",
                self.import.mailbox_owner
            )));
        }
        if self.retry.max_attempts == 0 {
            return Err(ConfigError::Invalid("retry.max_attempts must be at least 1".into()));
        }
        if !self.retry.multiplier.is_finite() || self.retry.multiplier < 1.0 {
            return Err(ConfigError::Invalid(
                "retry.multiplier must be a finite number >= 1.0".into(),
            ));
        }
        Ok(())
    }
}

fn expand_tilde(path: &Path) -> PathBuf {
    let value = path.to_string_lossy().to_string();
    PathBuf::from(shellexpand::tilde(&value).as_ref())
}

fn apply_env_marker(value: &mut String) -> Result<(), ConfigError> {
    if let Some(rest) = value.strip_prefix("env:") {
        let resolved = env::var(rest).map_err(|_| ConfigError::MissingEnvVar(rest.to_string()))?;
        *value = resolved;
    }
    Ok(())
}

fn apply_env_marker_path(path: &mut PathBuf) -> Result<(), ConfigError> {
    let mut value = path.to_string_lossy().to_string();
    apply_env_marker(&mut value)?;
    *path = PathBuf::from(value);
    Ok(())
}

fn default_service_name() -> String {
    "mbox-desk".to_string()
}

fn default_env() -> String {
    "dev".to_string()
}

fn default_mbox_path() -> PathBuf {
    PathBuf::from("takeout.mbox")
}

fn default_database_path() -> PathBuf {
    PathBuf::from(".fd_progress.db")
}

fn default_ticket_status() -> u8 {
    5
}

fn default_ticket_priority() -> u8 {
    1
}

fn default_request_timeout_secs() -> u64 {
    30
}

fn default_original_date_field() -> String {
    "cf_original_date".to_string()
}

fn default_group_name() -> String {
    "imported".to_string()
}

fn default_tag() -> String {
    "imported".to_string()
}

fn default_rate_delay_ms() -> u64 {
    800
}

fn default_spam_labels() -> Vec<String> {
    vec!["spam".to_string()]
}

fn default_trash_labels() -> Vec<String> {
    vec!["trash".to_string()]
}

fn default_max_attempts() -> u32 {
    5
}

fn default_base_delay_ms() -> u64 {
    1_000
}

fn default_multiplier() -> f64 {
    2.0
}

fn default_max_delay_ms() -> u64 {
    60_000
}

#[cfg(test)]
mod tests {
    use super::*;
    use once_cell::sync::Lazy;
    use std::{fs, sync::Mutex};
    use tempfile::TempDir;

    static ENV_LOCK: Lazy<Mutex<()>> = Lazy::new(|| Mutex::new(()));

    const OVERRIDE_VARS: &[&str] = &[
        "FRESHDESK_DOMAIN",
        "FRESHDESK_API_KEY",
        "MBOX_PATH",
        "MAILBOX_OWNER_EMAIL",
        "IMPORT_RATE_DELAY_MS",
        "OTLP_ENDPOINT",
    ];

    fn write_config(contents: &str) -> (TempDir, std::path::PathBuf) {
        let dir = TempDir::new().expect("temp dir");
        let path = dir.path().join("mbox-desk.toml");
        fs::write(&path, contents).expect("write config");
        (dir, path)
    }

    fn with_env(vars: &[(&str, Option<&str>)], f: impl FnOnce()) {
        let _guard = ENV_LOCK.lock().expect("lock env");
        let mut all: Vec<(&str, Option<&str>)> = OVERRIDE_VARS
            .iter()
            .filter(|name| !vars.iter().any(|(k, _)| k == *name))
            .map(|name| (*name, None))
            .collect();
        all.extend_from_slice(vars);

        let saved: Vec<(String, Option<String>)> = all
            .iter()
            .map(|(k, _)| (k.to_string(), env::var(k).ok()))
            .collect();

        for (key, value) in &all {
            match value {
                Some(v) => unsafe { env::set_var(key, v) },
                None => unsafe { env::remove_var(key) },
            }
        }

        f();

        for (key, value) in saved {
            match value {
                Some(v) => unsafe { env::set_var(&key, v) },
                None => unsafe { env::remove_var(&key) },
            }
        }
    }

    fn minimal_body(api_key: &str, database: &str) -> String {
        format!(
            r#"
[app]
env = "prod"

[paths]
mbox = "/data/takeout.mbox"
database = "{database}"

[freshdesk]
domain = "acme"
api_key = "{api_key}"

[import]
mailbox_owner = "support@acme.test"
"#
        )
    }

    #[test]
    fn defaults_fill_optional_sections() {
        let (_dir, path) = write_config(&minimal_body("key", "/tmp/progress.db"));
        with_env(&[], || {
            let cfg = Config::load(&path).expect("config loads");
            assert_eq!(cfg.app.service_name, "mbox-desk");
            assert_eq!(cfg.import.original_date_field, "cf_original_date");
            assert_eq!(cfg.import.group_name, "imported");
            assert_eq!(cfg.import.tag, "imported");
            assert_eq!(cfg.import.rate_delay_ms, 800);
            assert_eq!(cfg.import.spam_labels, vec!["spam".to_string()]);
            assert_eq!(cfg.import.trash_labels, vec!["trash".to_string()]);
            assert_eq!(cfg.freshdesk.ticket_status, 5);
            assert_eq!(cfg.retry.max_attempts, 5);
            assert!(!cfg.telemetry.export_traces);

            let policy = cfg.retry.policy();
            assert_eq!(policy.base_delay, Duration::from_secs(1));
            assert_eq!(policy.max_delay, Duration::from_secs(60));

            let settings = cfg.import.settings();
            assert_eq!(settings.rate_delay, Duration::from_millis(800));
            assert_eq!(settings.mailbox_owner, "support@acme.test");
        });
    }

    #[test]
    fn load_config_expands_tilde_and_resolves_env_markers() {
        let (dir, path) = write_config(&minimal_body("env:FD_TEST_KEY", "env:FD_TEST_DB"));
        let home_dir = dir.path().join("home");
        fs::create_dir_all(&home_dir).expect("create home dir");
        let expected_db = home_dir.join("import/progress.db");

        with_env(
            &[
                ("HOME", Some(home_dir.to_str().expect("utf8 path"))),
                ("FD_TEST_DB", Some("~/import/progress.db")),
                ("FD_TEST_KEY", Some("secret-key")),
            ],
            || {
                let cfg = Config::load(&path).expect("config loads");
                assert_eq!(cfg.paths.database, expected_db);
                assert_eq!(cfg.freshdesk.api_key, "secret-key");
            },
        );
    }

    #[test]
    fn env_overrides_take_precedence() {
        let (_dir, path) = write_config(&minimal_body("file-key", "/tmp/progress.db"));
        with_env(
            &[
                ("FRESHDESK_DOMAIN", Some("other")),
                ("FRESHDESK_API_KEY", Some("env-key")),
                ("MBOX_PATH", Some("/elsewhere/all.mbox")),
                ("MAILBOX_OWNER_EMAIL", Some("help@other.test")),
                ("IMPORT_RATE_DELAY_MS", Some("0")),
            ],
            || {
                let cfg = Config::load(&path).expect("config loads");
                assert_eq!(cfg.freshdesk.domain, "other");
                assert_eq!(cfg.freshdesk.api_key, "env-key");
                assert_eq!(cfg.paths.mbox, PathBuf::from("/elsewhere/all.mbox"));
                assert_eq!(cfg.import.mailbox_owner, "help@other.test");
                assert_eq!(cfg.import.rate_delay_ms, 0);
            },
        );
    }

    #[test]
    fn env_marker_without_variable_errors() {
        let (_dir, path) = write_config(&minimal_body("env:FD_MISSING_KEY", "/tmp/p.db"));
        with_env(&[("FD_MISSING_KEY", None)], || {
            let err = Config::load(&path).expect_err("missing env var should error");
            match err {
                ConfigError::MissingEnvVar(name) => assert_eq!(name, "FD_MISSING_KEY"),
                other => panic!("unexpected error: {other}"),
            }
        });
    }

    #[test]
    fn invalid_rate_delay_override_is_reported() {
        let (_dir, path) = write_config(&minimal_body("key", "/tmp/p.db"));
        with_env(&[("IMPORT_RATE_DELAY_MS", Some("soon"))], || {
            let err = Config::load(&path).expect_err("invalid delay should error");
            assert!(matches!(err, ConfigError::InvalidRateDelay(_)));
        });
    }

    #[test]
    fn mailbox_owner_must_look_like_an_address() {
        let (_dir, path) = write_config(&minimal_body("key", "/tmp/p.db"));
        with_env(&[("MAILBOX_OWNER_EMAIL", Some("nobody"))], || {
            let err = Config::load(&path).expect_err("owner should be validated");
            assert!(matches!(err, ConfigError::Invalid(msg) if msg.contains("mailbox_owner")));
        });
    }

    fn body_with_retry(retry: &str) -> String {
        format!("{}\n[retry]\n{retry}\n", minimal_body("key", "/tmp/p.db"))
    }

    #[test]
    fn retry_multiplier_must_be_finite_and_at_least_one() {
        for multiplier in ["nan", "inf", "0.5"] {
            let (_dir, path) = write_config(&body_with_retry(&format!("multiplier = {multiplier}")));
            with_env(&[], || {
                let err = Config::load(&path).expect_err("multiplier should be rejected");
                assert!(
                    matches!(err, ConfigError::Invalid(ref msg) if msg.contains("retry.multiplier")),
                    "{multiplier}: {err}"
                );
            });
        }
    }

    #[test]
    fn retry_needs_at_least_one_attempt() {
        let (_dir, path) = write_config(&body_with_retry("max_attempts = 0"));
        with_env(&[], || {
            let err = Config::load(&path).expect_err("zero attempts should be rejected");
            assert!(matches!(err, ConfigError::Invalid(msg) if msg.contains("retry.max_attempts")));
        });
    }
}
