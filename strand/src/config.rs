//! json configuration file and command line overrides.

use core::fmt;

use std::{collections::HashMap, fs, io, path::PathBuf};

use serde::Deserialize;

#[derive(Debug)]
pub enum ConfigError {
    Io(PathBuf, io::Error),
    Parse(PathBuf, serde_json::Error),
    /// a route references a backend missing from the address book.
    UnknownBackend(String),
    /// a route references a filter that is not registered.
    UnknownFilter(String),
    /// a secure listen entry without certificate material.
    IncompleteTls(String),
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match *self {
            Self::Io(ref path, ref e) => write!(f, "can't read config file {}: {e}", path.display()),
            Self::Parse(ref path, ref e) => write!(f, "can't parse config file {}: {e}", path.display()),
            Self::UnknownBackend(ref name) => write!(f, "route references unknown backend {name:?}"),
            Self::UnknownFilter(ref name) => write!(f, "route references unknown filter {name:?}"),
            Self::IncompleteTls(ref name) => {
                write!(f, "secure listen entry {name:?} is missing certificate or key file")
            }
        }
    }
}

impl std::error::Error for ConfigError {}

#[derive(Clone, Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    #[serde(default)]
    pub listen: Vec<ListenConfig>,
    #[serde(default)]
    pub log_level: Option<String>,
    #[serde(default)]
    pub access_log: Option<PathBuf>,
    #[serde(default)]
    pub pid_file: Option<PathBuf>,
    #[serde(default)]
    pub worker_threads: Option<usize>,
    #[serde(default)]
    pub drop_privileges: Option<DropPrivileges>,
    #[serde(default)]
    pub backends: HashMap<String, BackendConfig>,
    #[serde(default)]
    pub routes: Vec<RouteConfig>,
    /// free form per module options, matched by module name.
    #[serde(default)]
    pub modules: HashMap<String, serde_json::Value>,
    #[serde(default = "default_proxy_retry_count")]
    pub proxy_retry_count: usize,
}

fn default_proxy_retry_count() -> usize {
    3
}

#[derive(Clone, Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ListenConfig {
    #[serde(default = "default_listen_name")]
    pub name: String,
    pub address: String,
    #[serde(default)]
    pub backlog: Option<u32>,
    #[serde(default)]
    pub secure: bool,
    #[serde(default)]
    pub cert: Option<PathBuf>,
    #[serde(default)]
    pub key: Option<PathBuf>,
}

fn default_listen_name() -> String {
    "http".into()
}

#[derive(Clone, Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct DropPrivileges {
    pub user: String,
    #[serde(default)]
    pub group: Option<String>,
}

#[derive(Clone, Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct BackendConfig {
    pub address: String,
    #[serde(default)]
    pub max_connections: Option<usize>,
    #[serde(default)]
    pub connect_timeout_secs: Option<u64>,
    #[serde(default)]
    pub response_timeout_secs: Option<u64>,
}

#[derive(Clone, Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RouteConfig {
    #[serde(default = "default_prefix")]
    pub prefix: String,
    /// exact host match; absent matches every host.
    #[serde(default)]
    pub vhost: Option<String>,
    pub handler: String,
    /// document root of the file handler.
    #[serde(default)]
    pub dir: Option<PathBuf>,
    /// index file served for directory requests.
    #[serde(default)]
    pub index: Option<String>,
    /// backend name of the proxy handler.
    #[serde(default)]
    pub backend: Option<String>,
    /// uri prefix replacing the matched route prefix when forwarding.
    #[serde(default)]
    pub uri: Option<String>,
    /// forward the original host header instead of the backend authority.
    #[serde(default)]
    pub proxy_copy_host: bool,
    /// response filters, applied in listed order.
    #[serde(default)]
    pub filters: Vec<String>,
    /// file cache root of this route's `file_cache` filter.
    #[serde(default)]
    pub cache_dir: Option<PathBuf>,
    /// value of Access-Control-Allow-Origin set by the `cors` filter.
    #[serde(default)]
    pub cors_origin: Option<String>,
}

fn default_prefix() -> String {
    "/".into()
}

impl Config {
    pub fn load(path: &PathBuf) -> Result<Self, ConfigError> {
        let text = fs::read_to_string(path).map_err(|e| ConfigError::Io(path.clone(), e))?;
        let config: Config = serde_json::from_str(&text).map_err(|e| ConfigError::Parse(path.clone(), e))?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        for route in &self.routes {
            if let Some(ref backend) = route.backend {
                if !self.backends.contains_key(backend) {
                    return Err(ConfigError::UnknownBackend(backend.clone()));
                }
            }
            for filter in &route.filters {
                if !matches!(filter.as_str(), "file_cache" | "cors") {
                    return Err(ConfigError::UnknownFilter(filter.clone()));
                }
            }
        }
        for listen in &self.listen {
            if listen.secure && (listen.cert.is_none() || listen.key.is_none()) {
                return Err(ConfigError::IncompleteTls(listen.name.clone()));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn parse(json: &str) -> Result<Config, serde_json::Error> {
        serde_json::from_str(json)
    }

    #[test]
    fn minimal_config() {
        let config = parse(
            r#"{
                "listen": [{ "address": "127.0.0.1:8055" }],
                "routes": [{ "prefix": "/", "handler": "file", "dir": "/var/www" }]
            }"#,
        )
        .unwrap();

        assert_eq!(config.listen[0].address, "127.0.0.1:8055");
        assert_eq!(config.listen[0].name, "http");
        assert_eq!(config.proxy_retry_count, 3);
        assert_eq!(config.routes[0].prefix, "/");
    }

    #[test]
    fn proxy_route_with_backend_and_cache() {
        let config = parse(
            r#"{
                "backends": { "app": { "address": "127.0.0.1:8081" } },
                "routes": [{
                    "prefix": "/api",
                    "handler": "proxy",
                    "backend": "app",
                    "filters": ["file_cache"],
                    "cache_dir": "/var/cache/strand"
                }]
            }"#,
        )
        .unwrap();
        config.validate().unwrap();

        assert_eq!(config.backends["app"].address, "127.0.0.1:8081");
        assert_eq!(config.routes[0].filters, ["file_cache"]);
    }

    #[test]
    fn unknown_backend_is_rejected() {
        let config = parse(
            r#"{ "routes": [{ "prefix": "/", "handler": "proxy", "backend": "ghost" }] }"#,
        )
        .unwrap();
        assert!(matches!(config.validate(), Err(ConfigError::UnknownBackend(_))));
    }

    #[test]
    fn secure_listen_requires_cert_material() {
        let config = parse(
            r#"{ "listen": [{ "address": "0.0.0.0:443", "secure": true }] }"#,
        )
        .unwrap();
        assert!(matches!(config.validate(), Err(ConfigError::IncompleteTls(_))));
    }
}
