//! Process settings for the server binary.
//!
//! All settings come from environment variables. Everything the simulation
//! itself needs lives in the YAML file named by `FLEETSIM_CONFIG`.

use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use crate::error::ServerError;

/// Settings loaded from the environment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerSettings {
    /// Path of the simulator YAML configuration.
    pub config_path: PathBuf,
    /// Address the control surface binds to.
    pub host: String,
    /// Port the control surface listens on.
    pub port: u16,
    /// Timeout applied to each vehicle telemetry post.
    pub http_timeout: Duration,
}

impl ServerSettings {
    /// Load settings from environment variables.
    ///
    /// Optional variables:
    /// - `FLEETSIM_CONFIG` -- simulator YAML path (default `fleetsim.yaml`)
    /// - `FLEETSIM_HOST` -- bind address (default `0.0.0.0`)
    /// - `FLEETSIM_PORT` -- listen port (default 3000)
    /// - `FLEETSIM_HTTP_TIMEOUT_MS` -- vehicle post timeout in milliseconds
    ///   (default 10000)
    pub fn from_env() -> Result<Self, ServerError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Load settings through `lookup`, which returns the value of a
    /// variable if it is set.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ServerError> {
        let config_path = lookup("FLEETSIM_CONFIG").unwrap_or_else(|| "fleetsim.yaml".to_owned());
        let host = lookup("FLEETSIM_HOST").unwrap_or_else(|| "0.0.0.0".to_owned());
        let port = parse_var(&lookup, "FLEETSIM_PORT", 3000)?;
        let http_timeout_ms = parse_var(&lookup, "FLEETSIM_HTTP_TIMEOUT_MS", 10_000)?;

        Ok(Self {
            config_path: PathBuf::from(config_path),
            host,
            port,
            http_timeout: Duration::from_millis(http_timeout_ms),
        })
    }
}

fn parse_var<T>(
    lookup: &impl Fn(&str) -> Option<String>,
    key: &str,
    default: T,
) -> Result<T, ServerError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    lookup(key).map_or(Ok(default), |raw| {
        raw.trim()
            .parse()
            .map_err(|e| ServerError::Settings(format!("invalid {key}: {e}")))
    })
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use std::collections::BTreeMap;

    use super::*;

    fn settings(vars: &[(&str, &str)]) -> Result<ServerSettings, ServerError> {
        let vars: BTreeMap<String, String> = vars
            .iter()
            .map(|(k, v)| ((*k).to_owned(), (*v).to_owned()))
            .collect();
        ServerSettings::from_lookup(|key| vars.get(key).cloned())
    }

    #[test]
    fn defaults_apply_when_unset() {
        let s = settings(&[]).unwrap();
        assert_eq!(s.config_path, PathBuf::from("fleetsim.yaml"));
        assert_eq!(s.host, "0.0.0.0");
        assert_eq!(s.port, 3000);
        assert_eq!(s.http_timeout, Duration::from_secs(10));
    }

    #[test]
    fn variables_override_defaults() {
        let s = settings(&[
            ("FLEETSIM_CONFIG", "/etc/fleetsim/prod.yaml"),
            ("FLEETSIM_PORT", "8088"),
            ("FLEETSIM_HTTP_TIMEOUT_MS", "2500"),
        ])
        .unwrap();
        assert_eq!(s.config_path, PathBuf::from("/etc/fleetsim/prod.yaml"));
        assert_eq!(s.port, 8088);
        assert_eq!(s.http_timeout, Duration::from_millis(2500));
    }

    #[test]
    fn invalid_port_is_rejected() {
        let err = settings(&[("FLEETSIM_PORT", "http")]).unwrap_err();
        assert!(err.to_string().contains("FLEETSIM_PORT"));
    }
}
