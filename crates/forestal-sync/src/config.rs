use std::fmt;
use std::time::Duration;

use chrono::NaiveDate;
use forestal_adapters::GisConfig;
use thiserror::Error;

pub const DEFAULT_WORK_ORDERS_API_URL: &str = "https://gis.fasa.ibc.ar/api/ordenes/listar";
pub const DEFAULT_ADMIN_API_URL: &str = "https://gis.fasa.ibc.ar/ordenes/json-tablas-adm";
pub const DEFAULT_EPOCH_DATE: &str = "2020-01-01";
pub const DEFAULT_SYNC_CRON: &str = "0 0 6 * * *";

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("{0} is required but not set")]
    Missing(&'static str),
    #[error("invalid {var}={value:?}: {reason}")]
    Invalid {
        var: &'static str,
        value: String,
        reason: String,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreBackend {
    Postgres,
    Memory,
}

#[derive(Clone)]
pub struct SyncConfig {
    pub store: StoreBackend,
    pub database_url: Option<String>,
    pub gis: GisConfig,
    /// Lower bound used for full resyncs and empty stores, `YYYY-MM-DD`.
    pub epoch_date: String,
    pub cron_secret: Option<String>,
    pub development: bool,
    pub scheduler_enabled: bool,
    pub sync_cron: String,
    pub lock_ttl: Duration,
    pub host: String,
    pub port: u16,
}

impl SyncConfig {
    /// Read configuration from the process environment after a best-effort `.env` load.
    pub fn from_env() -> Result<Self, ConfigError> {
        let _ = dotenvy::dotenv();
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());
        let or = |key: &str, default: &str| get(key).unwrap_or_else(|| default.to_string());

        let store = match or("FORESTAL_STORE", "postgres").to_ascii_lowercase().as_str() {
            "postgres" | "postgresql" => StoreBackend::Postgres,
            "memory" => StoreBackend::Memory,
            other => {
                return Err(ConfigError::Invalid {
                    var: "FORESTAL_STORE",
                    value: other.to_string(),
                    reason: "expected `postgres` or `memory`".into(),
                })
            }
        };
        let database_url = get("DATABASE_URL");
        if store == StoreBackend::Postgres && database_url.is_none() {
            return Err(ConfigError::Missing("DATABASE_URL"));
        }

        let epoch_date = or("WORK_ORDERS_FROM_DATE", DEFAULT_EPOCH_DATE);
        if NaiveDate::parse_from_str(&epoch_date, "%Y-%m-%d").is_err() {
            return Err(ConfigError::Invalid {
                var: "WORK_ORDERS_FROM_DATE",
                value: epoch_date,
                reason: "expected YYYY-MM-DD".into(),
            });
        }

        let gis = GisConfig {
            work_orders_url: or("WORK_ORDERS_API_URL", DEFAULT_WORK_ORDERS_API_URL),
            admin_url: or("ADMIN_API_URL", DEFAULT_ADMIN_API_URL),
            api_key: get("WORK_ORDERS_API_KEY").ok_or(ConfigError::Missing("WORK_ORDERS_API_KEY"))?,
            session_id: get("WORK_ORDERS_PHPSESSID").unwrap_or_default(),
            work_orders_timeout: Duration::from_secs(parse_num(&get, "WORK_ORDERS_TIMEOUT_SECS", 30)?),
            admin_timeout: Duration::from_secs(parse_num(&get, "ADMIN_TIMEOUT_SECS", 10)?),
            max_retries: parse_num(&get, "FORESTAL_HTTP_MAX_RETRIES", 2)?,
        };

        Ok(Self {
            store,
            database_url,
            gis,
            epoch_date,
            cron_secret: get("CRON_SECRET"),
            development: or("FORESTAL_ENV", "production").eq_ignore_ascii_case("development"),
            scheduler_enabled: get("FORESTAL_SCHEDULER_ENABLED")
                .map(|v| matches!(v.as_str(), "1" | "true" | "TRUE" | "True"))
                .unwrap_or(false),
            sync_cron: or("SYNC_CRON", DEFAULT_SYNC_CRON),
            lock_ttl: Duration::from_secs(parse_num(&get, "FORESTAL_LOCK_TTL_SECS", 900)?),
            host: or("HOST", "0.0.0.0"),
            port: parse_num(&get, "PORT", 3001)?,
        })
    }

    pub fn bind_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

fn parse_num<T>(
    get: &impl Fn(&str) -> Option<String>,
    var: &'static str,
    default: T,
) -> Result<T, ConfigError>
where
    T: std::str::FromStr,
    T::Err: fmt::Display,
{
    match get(var) {
        None => Ok(default),
        Some(raw) => match raw.trim().parse::<T>() {
            Ok(value) => Ok(value),
            Err(e) => Err(ConfigError::Invalid {
                var,
                reason: e.to_string(),
                value: raw,
            }),
        },
    }
}

/// Keep only the last four characters of a secret.
pub fn mask_secret(secret: &str) -> String {
    let chars: Vec<char> = secret.chars().collect();
    if chars.len() <= 4 {
        return "****".to_string();
    }
    let tail: String = chars[chars.len() - 4..].iter().collect();
    format!("****{tail}")
}

impl fmt::Debug for SyncConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SyncConfig")
            .field("store", &self.store)
            .field("database_url", &self.database_url.as_ref().map(|_| "<set>"))
            .field("work_orders_url", &self.gis.work_orders_url)
            .field("admin_url", &self.gis.admin_url)
            .field("api_key", &mask_secret(&self.gis.api_key))
            .field("session_id", &mask_secret(&self.gis.session_id))
            .field("epoch_date", &self.epoch_date)
            .field("cron_secret", &self.cron_secret.as_ref().map(|_| "<set>"))
            .field("development", &self.development)
            .field("scheduler_enabled", &self.scheduler_enabled)
            .field("sync_cron", &self.sync_cron)
            .field("lock_ttl", &self.lock_ttl)
            .field("bind_addr", &self.bind_addr())
            .finish()
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
    fn defaults_apply_when_only_required_vars_are_set() {
        let cfg = SyncConfig::from_lookup(lookup(&[
            ("DATABASE_URL", "postgres://localhost/forestal"),
            ("WORK_ORDERS_API_KEY", "abcdefgh1234"),
        ]))
        .expect("config");
        assert_eq!(cfg.store, StoreBackend::Postgres);
        assert_eq!(cfg.epoch_date, "2020-01-01");
        assert_eq!(cfg.gis.work_orders_url, DEFAULT_WORK_ORDERS_API_URL);
        assert_eq!(cfg.gis.work_orders_timeout, Duration::from_secs(30));
        assert_eq!(cfg.gis.admin_timeout, Duration::from_secs(10));
        assert_eq!(cfg.sync_cron, DEFAULT_SYNC_CRON);
        assert_eq!(cfg.lock_ttl, Duration::from_secs(900));
        assert_eq!(cfg.bind_addr(), "0.0.0.0:3001");
        assert!(!cfg.development);
        assert!(cfg.cron_secret.is_none());
    }

    #[test]
    fn api_key_is_required() {
        let err = SyncConfig::from_lookup(lookup(&[("FORESTAL_STORE", "memory")])).unwrap_err();
        assert_eq!(err, ConfigError::Missing("WORK_ORDERS_API_KEY"));
    }

    #[test]
    fn postgres_store_requires_database_url() {
        let err = SyncConfig::from_lookup(lookup(&[("WORK_ORDERS_API_KEY", "k")])).unwrap_err();
        assert_eq!(err, ConfigError::Missing("DATABASE_URL"));

        let cfg = SyncConfig::from_lookup(lookup(&[
            ("FORESTAL_STORE", "memory"),
            ("WORK_ORDERS_API_KEY", "k"),
        ]))
        .expect("memory config");
        assert_eq!(cfg.store, StoreBackend::Memory);
    }

    #[test]
    fn invalid_values_name_the_variable() {
        let err = SyncConfig::from_lookup(lookup(&[
            ("FORESTAL_STORE", "memory"),
            ("WORK_ORDERS_API_KEY", "k"),
            ("WORK_ORDERS_FROM_DATE", "01/02/2020"),
        ]))
        .unwrap_err();
        assert!(matches!(err, ConfigError::Invalid { var: "WORK_ORDERS_FROM_DATE", .. }));

        let err = SyncConfig::from_lookup(lookup(&[
            ("FORESTAL_STORE", "memory"),
            ("WORK_ORDERS_API_KEY", "k"),
            ("PORT", "http"),
        ]))
        .unwrap_err();
        assert!(matches!(err, ConfigError::Invalid { var: "PORT", .. }));
    }

    #[test]
    fn debug_output_masks_secrets() {
        let cfg = SyncConfig::from_lookup(lookup(&[
            ("FORESTAL_STORE", "memory"),
            ("WORK_ORDERS_API_KEY", "supersecretkey9876"),
            ("CRON_SECRET", "cron-secret"),
            ("FORESTAL_ENV", "development"),
        ]))
        .expect("config");
        let rendered = format!("{cfg:?}");
        assert!(rendered.contains("****9876"));
        assert!(!rendered.contains("supersecretkey"));
        assert!(!rendered.contains("cron-secret"));
        assert!(cfg.development);
    }

    #[test]
    fn short_secrets_are_fully_masked() {
        assert_eq!(mask_secret("abc"), "****");
        assert_eq!(mask_secret("abcdef"), "****cdef");
    }
}
