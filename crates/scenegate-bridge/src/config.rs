use std::collections::BTreeMap;
use std::fs;
use std::io;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use scenegate_kernel::KernelConfig;
use serde::Deserialize;

use crate::error::BridgeError;

pub const SETTINGS_FILE: &str = "metadata/settings.json";
pub const INBOX_DIR: &str = "airlock/inbox";
pub const OUTBOX_DIR: &str = "airlock/outbox";
pub const HEALTH_FILE: &str = "metadata/health.json";
pub const STATUS_FILE: &str = "metadata/status.json";

pub const ENV_HTTP_BIND: &str = "SCENEGATE_HTTP_BIND";
pub const ENV_HTTP_ENABLED: &str = "SCENEGATE_HTTP_ENABLED";
pub const ENV_TICK_BUDGET_MS: &str = "SCENEGATE_TICK_BUDGET_MS";

/// Socket channel settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HttpConfig {
    pub enabled: bool,
    pub bind: SocketAddr,
    /// Header carrying the session nonce.
    pub token_header: String,
    /// Optional header carrying the declared capability.
    pub capability_header: String,
    /// How long a connection waits for the worker before answering 504.
    pub response_timeout: Duration,
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            bind: SocketAddr::from(([127, 0, 0, 1], 8085)),
            token_header: "X-Scenegate-Token".into(),
            capability_header: "X-Scenegate-Capability".into(),
            response_timeout: Duration::from_secs(30),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct BridgeConfig {
    pub root: PathBuf,
    pub inbox: PathBuf,
    pub outbox: PathBuf,
    pub health_path: PathBuf,
    pub status_path: PathBuf,
    pub http: HttpConfig,
    /// Upper bound on work per tick before deferring the rest.
    pub tick_budget: Duration,
    pub heartbeat_interval: Duration,
    pub kernel: KernelConfig,
}

impl BridgeConfig {
    /// Default layout under `root`, without reading settings or environment.
    pub fn rooted(root: impl Into<PathBuf>) -> Self {
        let root = root.into();
        Self {
            inbox: root.join(INBOX_DIR),
            outbox: root.join(OUTBOX_DIR),
            health_path: root.join(HEALTH_FILE),
            status_path: root.join(STATUS_FILE),
            http: HttpConfig::default(),
            tick_budget: Duration::from_millis(5),
            heartbeat_interval: Duration::from_secs(1),
            kernel: KernelConfig::rooted(&root),
            root,
        }
    }

    /// Defaults, then `metadata/settings.json` if present, then process
    /// environment overrides.
    pub fn load(root: impl Into<PathBuf>) -> Result<Self, BridgeError> {
        let mut config = Self::rooted(root);
        let settings_path = config.root.join(SETTINGS_FILE);
        match fs::read_to_string(&settings_path) {
            Ok(text) => {
                let settings: Settings = serde_json::from_str(&text).map_err(|err| {
                    BridgeError::Config(format!("{}: {err}", settings_path.display()))
                })?;
                config.apply_settings(settings);
            }
            Err(err) if err.kind() == io::ErrorKind::NotFound => {}
            Err(source) => {
                return Err(BridgeError::Io {
                    path: settings_path,
                    source,
                });
            }
        }
        config.apply_env(|key| std::env::var(key).ok())?;
        Ok(config)
    }

    fn apply_settings(&mut self, settings: Settings) {
        if let Some(inbox) = settings.inbox {
            self.inbox = self.resolve(inbox);
        }
        if let Some(outbox) = settings.outbox {
            self.outbox = self.resolve(outbox);
        }
        if let Some(ms) = settings.tick_budget_ms {
            self.tick_budget = Duration::from_millis(ms);
        }
        if let Some(ms) = settings.heartbeat_interval_ms {
            self.heartbeat_interval = Duration::from_millis(ms);
        }
        for (key, cap) in settings.sanity {
            self.kernel.sanity = std::mem::take(&mut self.kernel.sanity).with_cap(&key, cap);
        }
        let http = settings.http;
        if let Some(enabled) = http.enabled {
            self.http.enabled = enabled;
        }
        if let Some(bind) = http.bind {
            self.http.bind = bind;
        }
        if let Some(header) = http.token_header {
            self.http.token_header = header;
        }
        if let Some(header) = http.capability_header {
            self.http.capability_header = header;
        }
        if let Some(ms) = http.response_timeout_ms {
            self.http.response_timeout = Duration::from_millis(ms);
        }
    }

    /// Applies `SCENEGATE_*` overrides read through `lookup`.
    pub fn apply_env(
        &mut self,
        lookup: impl Fn(&str) -> Option<String>,
    ) -> Result<(), BridgeError> {
        if let Some(raw) = lookup(ENV_HTTP_BIND) {
            self.http.bind = raw
                .trim()
                .parse()
                .map_err(|err| BridgeError::Config(format!("{ENV_HTTP_BIND}={raw}: {err}")))?;
        }
        if let Some(raw) = lookup(ENV_HTTP_ENABLED) {
            self.http.enabled = match raw.trim().to_ascii_lowercase().as_str() {
                "1" | "true" | "yes" | "on" => true,
                "0" | "false" | "no" | "off" => false,
                other => {
                    return Err(BridgeError::Config(format!(
                        "{ENV_HTTP_ENABLED}={other}: expected a boolean"
                    )));
                }
            };
        }
        if let Some(raw) = lookup(ENV_TICK_BUDGET_MS) {
            let ms: u64 = raw.trim().parse().map_err(|err| {
                BridgeError::Config(format!("{ENV_TICK_BUDGET_MS}={raw}: {err}"))
            })?;
            self.tick_budget = Duration::from_millis(ms);
        }
        Ok(())
    }

    fn resolve(&self, path: PathBuf) -> PathBuf {
        if path.is_absolute() {
            path
        } else {
            self.root.join(path)
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct Settings {
    inbox: Option<PathBuf>,
    outbox: Option<PathBuf>,
    tick_budget_ms: Option<u64>,
    heartbeat_interval_ms: Option<u64>,
    sanity: BTreeMap<String, f64>,
    http: HttpSettings,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct HttpSettings {
    enabled: Option<bool>,
    bind: Option<SocketAddr>,
    token_header: Option<String>,
    capability_header: Option<String>,
    response_timeout_ms: Option<u64>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use tempfile::TempDir;

    #[test]
    fn defaults_without_settings_file() {
        let tmp = TempDir::new().unwrap();
        let mut cfg = BridgeConfig::rooted(tmp.path());
        cfg.apply_env(|_| None).unwrap();
        assert_eq!(cfg.inbox, tmp.path().join("airlock/inbox"));
        assert_eq!(cfg.http.bind.port(), 8085);
        assert_eq!(cfg.tick_budget, Duration::from_millis(5));
        assert_eq!(
            cfg.kernel.registry_path.as_deref(),
            Some(tmp.path().join("metadata/registry.json").as_path())
        );
    }

    #[test]
    fn settings_file_overrides_defaults() {
        let tmp = TempDir::new().unwrap();
        fs::create_dir_all(tmp.path().join("metadata")).unwrap();
        fs::write(
            tmp.path().join(SETTINGS_FILE),
            r#"{
                "inbox": "queue/in",
                "tick_budget_ms": 12,
                "sanity": {"depth": 8},
                "http": {"enabled": false, "bind": "127.0.0.1:9100"},
                "unrelated": true
            }"#,
        )
        .unwrap();
        let cfg = BridgeConfig::load(tmp.path()).unwrap();
        assert_eq!(cfg.inbox, tmp.path().join("queue/in"));
        assert_eq!(cfg.tick_budget, Duration::from_millis(12));
        assert_eq!(cfg.kernel.sanity.cap("depth"), Some(8.0));
        assert_eq!(cfg.kernel.sanity.cap("intensity"), Some(10_000.0));
        assert_eq!(cfg.http.bind.port(), 9100);
    }

    #[test]
    fn malformed_settings_is_a_config_error() {
        let tmp = TempDir::new().unwrap();
        fs::create_dir_all(tmp.path().join("metadata")).unwrap();
        fs::write(tmp.path().join(SETTINGS_FILE), "{ nope").unwrap();
        assert!(matches!(
            BridgeConfig::load(tmp.path()),
            Err(BridgeError::Config(_))
        ));
    }

    #[test]
    fn env_overrides_apply_last() {
        let env: HashMap<&str, &str> = [
            (ENV_HTTP_BIND, "0.0.0.0:7000"),
            (ENV_HTTP_ENABLED, "off"),
            (ENV_TICK_BUDGET_MS, "20"),
        ]
        .into();
        let mut cfg = BridgeConfig::rooted("/proj");
        cfg.apply_env(|key| env.get(key).map(|v| v.to_string())).unwrap();
        assert_eq!(cfg.http.bind.port(), 7000);
        assert!(!cfg.http.enabled);
        assert_eq!(cfg.tick_budget, Duration::from_millis(20));

        let err = cfg
            .apply_env(|key| (key == ENV_HTTP_ENABLED).then(|| "maybe".to_string()))
            .unwrap_err();
        assert!(err.to_string().contains(ENV_HTTP_ENABLED));
    }
}
