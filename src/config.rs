use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

use crate::topology::{FacilitySpec, TopologyError};

/// Server settings, read from `PARKLINE_*` environment variables.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerConfig {
    pub port: u16,
    pub bind: String,
    pub password: String,
    pub max_connections: usize,
    /// JSON layout file; the built-in reference city when unset.
    pub topology_path: Option<PathBuf>,
    /// Rollback history bound per tenant; unbounded when unset.
    pub history_limit: Option<usize>,
    pub metrics_port: Option<u16>,
    pub tls_cert: Option<PathBuf>,
    pub tls_key: Option<PathBuf>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            port: 5433,
            bind: "0.0.0.0".into(),
            password: "parkline".into(),
            max_connections: 256,
            topology_path: None,
            history_limit: None,
            metrics_port: None,
            tls_cert: None,
            tls_key: None,
        }
    }
}

impl ServerConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build from an arbitrary key lookup. Unset keys keep their defaults;
    /// set but unparsable values are an error.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let defaults = Self::default();
        Ok(Self {
            port: parse_var(&lookup, "PARKLINE_PORT")?.unwrap_or(defaults.port),
            bind: lookup("PARKLINE_BIND").unwrap_or(defaults.bind),
            password: lookup("PARKLINE_PASSWORD").unwrap_or(defaults.password),
            max_connections: parse_var(&lookup, "PARKLINE_MAX_CONNECTIONS")?
                .unwrap_or(defaults.max_connections),
            topology_path: lookup("PARKLINE_TOPOLOGY").map(PathBuf::from),
            history_limit: parse_var(&lookup, "PARKLINE_HISTORY_LIMIT")?,
            metrics_port: parse_var(&lookup, "PARKLINE_METRICS_PORT")?,
            tls_cert: lookup("PARKLINE_TLS_CERT").map(PathBuf::from),
            tls_key: lookup("PARKLINE_TLS_KEY").map(PathBuf::from),
        })
    }

    pub fn addr(&self) -> String {
        format!("{}:{}", self.bind, self.port)
    }

    pub fn load_layout(&self) -> Result<FacilitySpec, ConfigError> {
        match &self.topology_path {
            Some(path) => FacilitySpec::load(path).map_err(ConfigError::Topology),
            None => Ok(FacilitySpec::reference_city()),
        }
    }
}

fn parse_var<T: FromStr>(
    lookup: &impl Fn(&str) -> Option<String>,
    key: &'static str,
) -> Result<Option<T>, ConfigError> {
    match lookup(key) {
        None => Ok(None),
        Some(raw) => raw
            .trim()
            .parse()
            .map(Some)
            .map_err(|_| ConfigError::Invalid { key, value: raw }),
    }
}

#[derive(Debug)]
pub enum ConfigError {
    Invalid { key: &'static str, value: String },
    Topology(TopologyError),
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConfigError::Invalid { key, value } => write!(f, "invalid value for {key}: {value:?}"),
            ConfigError::Topology(e) => write!(f, "{e}"),
        }
    }
}

impl std::error::Error for ConfigError {}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn defaults_when_unset() {
        let cfg = ServerConfig::from_lookup(lookup(&[])).unwrap();
        assert_eq!(cfg, ServerConfig::default());
        assert_eq!(cfg.addr(), "0.0.0.0:5433");
    }

    #[test]
    fn reads_overrides() {
        let cfg = ServerConfig::from_lookup(lookup(&[
            ("PARKLINE_PORT", "6000"),
            ("PARKLINE_BIND", "127.0.0.1"),
            ("PARKLINE_HISTORY_LIMIT", "500"),
            ("PARKLINE_METRICS_PORT", "9100"),
            ("PARKLINE_TOPOLOGY", "/etc/parkline/city.json"),
        ]))
        .unwrap();
        assert_eq!(cfg.addr(), "127.0.0.1:6000");
        assert_eq!(cfg.history_limit, Some(500));
        assert_eq!(cfg.metrics_port, Some(9100));
        assert_eq!(cfg.topology_path, Some(PathBuf::from("/etc/parkline/city.json")));
    }

    #[test]
    fn rejects_garbage() {
        let err = ServerConfig::from_lookup(lookup(&[("PARKLINE_MAX_CONNECTIONS", "lots")]))
            .unwrap_err();
        assert!(matches!(
            err,
            ConfigError::Invalid {
                key: "PARKLINE_MAX_CONNECTIONS",
                ..
            }
        ));
    }

    #[test]
    fn layout_defaults_to_reference_city() {
        let cfg = ServerConfig::default();
        assert_eq!(cfg.load_layout().unwrap(), FacilitySpec::reference_city());
    }

    #[test]
    fn missing_layout_file() {
        let cfg = ServerConfig {
            topology_path: Some(std::env::temp_dir().join("parkline_missing_layout.json")),
            ..Default::default()
        };
        assert!(matches!(
            cfg.load_layout(),
            Err(ConfigError::Topology(TopologyError::Io(_)))
        ));
    }
}
