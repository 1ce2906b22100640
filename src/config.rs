use std::net::SocketAddr;
use std::path::PathBuf;

/// Application-level constants
pub const APP_NAME: &str = "Carebook";
pub const APP_VERSION: &str = env!("CARGO_PKG_VERSION");

/// Default API bind address.
pub const DEFAULT_BIND: &str = "127.0.0.1:8080";

/// Gateway calls give up after this many seconds unless configured.
pub const DEFAULT_GATEWAY_TIMEOUT_SECS: u64 = 15;

/// Audit rows older than this are pruned on flush.
pub const AUDIT_RETENTION_DAYS: i64 = 90;

/// Log filter used when `RUST_LOG` is unset.
pub fn default_log_filter() -> String {
    "carebook=info,carebook_lib=info,tower_http=warn".to_string()
}

/// Get the application data directory
/// ~/Carebook/ on all platforms; falls back to the working directory.
pub fn app_data_dir() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(APP_NAME)
}

/// Default SQLite database location.
pub fn default_db_path() -> PathBuf {
    app_data_dir().join("carebook.db")
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("Invalid value for {key}: {value}")]
    Invalid { key: &'static str, value: String },
}

/// Runtime configuration, read from `CAREBOOK_*` environment variables.
#[derive(Debug, Clone)]
pub struct AppConfig {
    pub bind: SocketAddr,
    pub db_path: PathBuf,
    /// Provider base URL. `None` runs against the in-process sandbox.
    pub gateway_url: Option<String>,
    pub gateway_merchant_id: String,
    pub gateway_store_id: String,
    pub gateway_timeout_secs: u64,
    /// Shared secret for webhook signatures. Without it every webhook is rejected.
    pub webhook_secret: Option<String>,
}

impl AppConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build from any key lookup. Empty values count as unset.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        let bind_raw = get("CAREBOOK_BIND").unwrap_or_else(|| DEFAULT_BIND.to_string());
        let bind = bind_raw.parse().map_err(|_| ConfigError::Invalid {
            key: "CAREBOOK_BIND",
            value: bind_raw.clone(),
        })?;

        let gateway_timeout_secs = match get("CAREBOOK_GATEWAY_TIMEOUT_SECS") {
            None => DEFAULT_GATEWAY_TIMEOUT_SECS,
            Some(raw) => match raw.parse::<u64>() {
                Ok(secs) if secs > 0 => secs,
                _ => {
                    return Err(ConfigError::Invalid {
                        key: "CAREBOOK_GATEWAY_TIMEOUT_SECS",
                        value: raw,
                    })
                }
            },
        };

        Ok(Self {
            bind,
            db_path: get("CAREBOOK_DB_PATH")
                .map(PathBuf::from)
                .unwrap_or_else(default_db_path),
            gateway_url: get("CAREBOOK_GATEWAY_URL"),
            gateway_merchant_id: get("CAREBOOK_GATEWAY_MERCHANT_ID").unwrap_or_default(),
            gateway_store_id: get("CAREBOOK_GATEWAY_STORE_ID").unwrap_or_default(),
            gateway_timeout_secs,
            webhook_secret: get("CAREBOOK_WEBHOOK_SECRET"),
        })
    }

    /// Configuration for tests: sandbox gateway, explicit db path and secret.
    pub fn for_db(db_path: PathBuf) -> Self {
        Self {
            bind: ([127, 0, 0, 1], 0).into(),
            db_path,
            gateway_url: None,
            gateway_merchant_id: String::new(),
            gateway_store_id: String::new(),
            gateway_timeout_secs: DEFAULT_GATEWAY_TIMEOUT_SECS,
            webhook_secret: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn app_data_dir_named_after_app() {
        assert!(app_data_dir().ends_with("Carebook"));
        assert!(default_db_path().starts_with(app_data_dir()));
    }

    #[test]
    fn app_version_matches_cargo() {
        assert_eq!(APP_VERSION, env!("CARGO_PKG_VERSION"));
    }

    #[test]
    fn defaults_when_unset() {
        let cfg = AppConfig::from_lookup(lookup(&[])).unwrap();
        assert_eq!(cfg.bind.to_string(), DEFAULT_BIND);
        assert_eq!(cfg.db_path, default_db_path());
        assert!(cfg.gateway_url.is_none());
        assert!(cfg.webhook_secret.is_none());
        assert_eq!(cfg.gateway_timeout_secs, DEFAULT_GATEWAY_TIMEOUT_SECS);
    }

    #[test]
    fn reads_all_variables() {
        let cfg = AppConfig::from_lookup(lookup(&[
            ("CAREBOOK_BIND", "0.0.0.0:9000"),
            ("CAREBOOK_DB_PATH", "/tmp/cb.db"),
            ("CAREBOOK_GATEWAY_URL", "https://pay.example"),
            ("CAREBOOK_GATEWAY_MERCHANT_ID", "M1"),
            ("CAREBOOK_GATEWAY_STORE_ID", "S1"),
            ("CAREBOOK_GATEWAY_TIMEOUT_SECS", "5"),
            ("CAREBOOK_WEBHOOK_SECRET", "s3cret"),
        ]))
        .unwrap();
        assert_eq!(cfg.bind.port(), 9000);
        assert_eq!(cfg.db_path, PathBuf::from("/tmp/cb.db"));
        assert_eq!(cfg.gateway_url.as_deref(), Some("https://pay.example"));
        assert_eq!(cfg.gateway_merchant_id, "M1");
        assert_eq!(cfg.gateway_store_id, "S1");
        assert_eq!(cfg.gateway_timeout_secs, 5);
        assert_eq!(cfg.webhook_secret.as_deref(), Some("s3cret"));
    }

    #[test]
    fn empty_values_count_as_unset() {
        let cfg = AppConfig::from_lookup(lookup(&[("CAREBOOK_GATEWAY_URL", "  ")])).unwrap();
        assert!(cfg.gateway_url.is_none());
    }

    #[test]
    fn rejects_bad_values() {
        let err = AppConfig::from_lookup(lookup(&[("CAREBOOK_BIND", "nowhere")])).unwrap_err();
        assert!(matches!(err, ConfigError::Invalid { key: "CAREBOOK_BIND", .. }));
        let err = AppConfig::from_lookup(lookup(&[("CAREBOOK_GATEWAY_TIMEOUT_SECS", "0")])).unwrap_err();
        assert!(matches!(err, ConfigError::Invalid { key: "CAREBOOK_GATEWAY_TIMEOUT_SECS", .. }));
    }
}
