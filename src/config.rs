//! Process configuration loaded from `DATAPULL_*` environment variables.

use std::env;
use std::net::SocketAddr;
use std::path::PathBuf;

use chrono::FixedOffset;
use thiserror::Error;

use crate::remote::{default_utc_offset, RemoteConfig};

pub const DEFAULT_STORAGE_ROOT: &str = "storages";
pub const DEFAULT_SERVER_ADDR: &str = "127.0.0.1:8080";
pub const DEFAULT_HISTORY_INTERVAL_SECONDS: u32 = 1;
pub const DEFAULT_FETCH_WORKERS: usize = 1;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PipelineConfig {
    pub remote: RemoteConfig,
    pub storage_root: PathBuf,
    pub registry_path: PathBuf,
    /// Sampling interval requested from the history endpoint.
    pub history_interval_seconds: u32,
    pub fetch_workers: usize,
    pub server_addr: SocketAddr,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("missing required environment variable {0}")]
    Missing(&'static str),
    #[error("invalid value for {var}: '{value}' ({reason})")]
    Invalid {
        var: &'static str,
        value: String,
        reason: String,
    },
}

pub fn pipeline_config_from_env() -> Result<PipelineConfig, ConfigError> {
    let mut remote = RemoteConfig::new(
        required("DATAPULL_BASE_URL")?,
        required("DATAPULL_TOKEN")?,
        required("DATAPULL_KEY")?,
    );

    if let Some(raw) = optional("DATAPULL_UTC_OFFSET") {
        remote.utc_offset = parse_utc_offset(&raw).ok_or_else(|| ConfigError::Invalid {
            var: "DATAPULL_UTC_OFFSET",
            value: raw.clone(),
            reason: "expected hours such as 7 or an offset such as +07:00".to_string(),
        })?;
    }

    if let Some(raw) = optional("DATAPULL_ACCEPT_INVALID_CERTS") {
        remote.accept_invalid_certs = parse_bool(&raw).ok_or_else(|| ConfigError::Invalid {
            var: "DATAPULL_ACCEPT_INVALID_CERTS",
            value: raw.clone(),
            reason: "expected a boolean".to_string(),
        })?;
    }

    let storage_root = optional("DATAPULL_STORAGE_ROOT")
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from(DEFAULT_STORAGE_ROOT));
    let registry_path = optional("DATAPULL_REGISTRY_PATH")
        .map(PathBuf::from)
        .unwrap_or_else(|| storage_root.join("rtdb").join("data.db"));

    let history_interval_seconds = match optional("DATAPULL_HISTORY_INTERVAL_SECONDS") {
        Some(raw) => parse_positive("DATAPULL_HISTORY_INTERVAL_SECONDS", &raw)?,
        None => DEFAULT_HISTORY_INTERVAL_SECONDS,
    };
    let fetch_workers = match optional("DATAPULL_FETCH_WORKERS") {
        Some(raw) => parse_positive("DATAPULL_FETCH_WORKERS", &raw)?,
        None => DEFAULT_FETCH_WORKERS,
    };

    let server_addr_raw =
        optional("DATAPULL_SERVER_ADDR").unwrap_or_else(|| DEFAULT_SERVER_ADDR.to_string());
    let server_addr = server_addr_raw
        .parse::<SocketAddr>()
        .map_err(|err| ConfigError::Invalid {
            var: "DATAPULL_SERVER_ADDR",
            value: server_addr_raw.clone(),
            reason: err.to_string(),
        })?;

    Ok(PipelineConfig {
        remote,
        storage_root,
        registry_path,
        history_interval_seconds,
        fetch_workers,
        server_addr,
    })
}

fn required(var: &'static str) -> Result<String, ConfigError> {
    optional(var).ok_or(ConfigError::Missing(var))
}

fn optional(var: &str) -> Option<String> {
    env::var(var)
        .ok()
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}

fn parse_positive<T>(var: &'static str, raw: &str) -> Result<T, ConfigError>
where
    T: std::str::FromStr + PartialOrd + Default,
    T::Err: std::fmt::Display,
{
    let invalid = |reason: String| ConfigError::Invalid {
        var,
        value: raw.to_string(),
        reason,
    };
    let value = raw.parse::<T>().map_err(|err| invalid(err.to_string()))?;
    if value <= T::default() {
        return Err(invalid("must be greater than zero".to_string()));
    }
    Ok(value)
}

/// Accepts whole hours (`7`, `-3`) or `+HH:MM` / `-HH:MM`. Defaults live in [`default_utc_offset`].
pub fn parse_utc_offset(raw: &str) -> Option<FixedOffset> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return Some(default_utc_offset());
    }

    let seconds = if let Ok(hours) = trimmed.parse::<i32>() {
        hours.checked_mul(3_600)?
    } else {
        let (sign, rest) = match trimmed.as_bytes().first()? {
            b'+' => (1, &trimmed[1..]),
            b'-' => (-1, &trimmed[1..]),
            _ => (1, trimmed),
        };
        let (hours, minutes) = rest.split_once(':')?;
        let hours: i32 = hours.parse().ok()?;
        let minutes: i32 = minutes.parse().ok()?;
        if !(0..60).contains(&minutes) {
            return None;
        }
        sign * (hours * 3_600 + minutes * 60)
    };

    FixedOffset::east_opt(seconds)
}

pub(crate) fn parse_bool(raw: &str) -> Option<bool> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}

#[cfg(test)]
pub(crate) mod test_env {
    use std::env;
    use std::sync::{Mutex, OnceLock};

    fn env_lock() -> &'static Mutex<()> {
        static ENV_LOCK: OnceLock<Mutex<()>> = OnceLock::new();
        ENV_LOCK.get_or_init(|| Mutex::new(()))
    }

    pub(crate) fn with_env_vars<R>(vars: &[(&str, Option<&str>)], f: impl FnOnce() -> R) -> R {
        let _guard = env_lock()
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        let previous: Vec<(String, Option<String>)> = vars
            .iter()
            .map(|(key, _)| ((*key).to_string(), env::var(key).ok()))
            .collect();

        for (key, value) in vars {
            match value {
                Some(v) => env::set_var(key, v),
                None => env::remove_var(key),
            }
        }

        let output = f();

        for (key, value) in previous {
            match value {
                Some(v) => env::set_var(key, v),
                None => env::remove_var(key),
            }
        }

        output
    }
}

#[cfg(test)]
mod tests {
    use super::test_env::with_env_vars;
    use super::*;
    use crate::remote::RetryPolicy;

    const ALL_VARS: [&str; 10] = [
        "DATAPULL_BASE_URL",
        "DATAPULL_TOKEN",
        "DATAPULL_KEY",
        "DATAPULL_UTC_OFFSET",
        "DATAPULL_ACCEPT_INVALID_CERTS",
        "DATAPULL_STORAGE_ROOT",
        "DATAPULL_REGISTRY_PATH",
        "DATAPULL_HISTORY_INTERVAL_SECONDS",
        "DATAPULL_FETCH_WORKERS",
        "DATAPULL_SERVER_ADDR",
    ];

    fn vars<'a>(overrides: &[(&'a str, Option<&'a str>)]) -> Vec<(&'a str, Option<&'a str>)> {
        let mut out: Vec<(&str, Option<&str>)> = ALL_VARS.iter().map(|key| (*key, None)).collect();
        for (key, value) in overrides {
            if let Some(slot) = out.iter_mut().find(|(k, _)| k == key) {
                slot.1 = *value;
            }
        }
        out
    }

    fn credentials() -> Vec<(&'static str, Option<&'static str>)> {
        vec![
            ("DATAPULL_BASE_URL", Some("https://remote.test/api")),
            ("DATAPULL_TOKEN", Some("tok")),
            ("DATAPULL_KEY", Some("key")),
        ]
    }

    #[test]
    fn defaults_apply_when_only_credentials_are_set() {
        let cfg = with_env_vars(&vars(&credentials()), pipeline_config_from_env).unwrap();

        assert_eq!(cfg.remote.base_url, "https://remote.test/api");
        assert_eq!(cfg.remote.utc_offset, FixedOffset::east_opt(7 * 3_600).unwrap());
        assert!(!cfg.remote.accept_invalid_certs);
        assert_eq!(cfg.remote.history, RetryPolicy::history_default());
        assert_eq!(cfg.storage_root, PathBuf::from("storages"));
        assert_eq!(cfg.registry_path, PathBuf::from("storages/rtdb/data.db"));
        assert_eq!(cfg.history_interval_seconds, 1);
        assert_eq!(cfg.fetch_workers, 1);
        assert_eq!(cfg.server_addr, "127.0.0.1:8080".parse::<SocketAddr>().unwrap());
    }

    #[test]
    fn missing_credentials_are_reported_by_name() {
        let err = with_env_vars(
            &vars(&[("DATAPULL_BASE_URL", Some("https://remote.test"))]),
            pipeline_config_from_env,
        )
        .unwrap_err();
        assert_eq!(err, ConfigError::Missing("DATAPULL_TOKEN"));
    }

    #[test]
    fn overrides_are_parsed() {
        let mut overrides = credentials();
        overrides.extend([
            ("DATAPULL_UTC_OFFSET", Some("+05:30")),
            ("DATAPULL_ACCEPT_INVALID_CERTS", Some("yes")),
            ("DATAPULL_STORAGE_ROOT", Some("/data/pulls")),
            ("DATAPULL_HISTORY_INTERVAL_SECONDS", Some("60")),
            ("DATAPULL_FETCH_WORKERS", Some("4")),
            ("DATAPULL_SERVER_ADDR", Some("0.0.0.0:9000")),
        ]);
        let cfg = with_env_vars(&vars(&overrides), pipeline_config_from_env).unwrap();

        assert_eq!(cfg.remote.utc_offset.local_minus_utc(), 5 * 3_600 + 30 * 60);
        assert!(cfg.remote.accept_invalid_certs);
        assert_eq!(cfg.registry_path, PathBuf::from("/data/pulls/rtdb/data.db"));
        assert_eq!(cfg.history_interval_seconds, 60);
        assert_eq!(cfg.fetch_workers, 4);
        assert_eq!(cfg.server_addr.port(), 9000);
    }

    #[test]
    fn zero_workers_and_bad_offset_are_invalid() {
        let mut overrides = credentials();
        overrides.push(("DATAPULL_FETCH_WORKERS", Some("0")));
        let err = with_env_vars(&vars(&overrides), pipeline_config_from_env).unwrap_err();
        assert!(matches!(
            err,
            ConfigError::Invalid { var: "DATAPULL_FETCH_WORKERS", .. }
        ));

        let mut overrides = credentials();
        overrides.push(("DATAPULL_UTC_OFFSET", Some("UTC+7")));
        let err = with_env_vars(&vars(&overrides), pipeline_config_from_env).unwrap_err();
        assert!(matches!(
            err,
            ConfigError::Invalid { var: "DATAPULL_UTC_OFFSET", .. }
        ));
    }

    #[test]
    fn utc_offset_accepts_hours_and_clock_forms() {
        assert_eq!(parse_utc_offset("7").unwrap().local_minus_utc(), 7 * 3_600);
        assert_eq!(parse_utc_offset("-3").unwrap().local_minus_utc(), -3 * 3_600);
        assert_eq!(parse_utc_offset("+07:00").unwrap().local_minus_utc(), 7 * 3_600);
        assert_eq!(parse_utc_offset("-09:30").unwrap().local_minus_utc(), -(9 * 3_600 + 30 * 60));
        assert!(parse_utc_offset("+07:75").is_none());
        assert!(parse_utc_offset("48").is_none());
    }
}
