//! Semantic sanity checks over an already-deserialized config tree:
//! port/host conflicts, dangling file references, aligned CGI lists.

use std::collections::{HashMap, HashSet};

use thiserror::Error;

use super::AppConfig;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config YAML: {source}")]
    Parse {
        #[source]
        source: serde_yaml::Error,
    },

    #[error("no server blocks configured")]
    EmptyConfig,

    #[error("server block {index} ({server_name}) has invalid error_page code {code}")]
    InvalidErrorCode {
        index: usize,
        server_name: String,
        code: u16,
    },

    #[error("server block {index} ({server_name}) has unreadable document root {root:?}: {source}")]
    BadRoot {
        index: usize,
        server_name: String,
        root: String,
        #[source]
        source: std::io::Error,
    },

    #[error(
        "location {location_path:?} of server block {index} declares {cgi_ext_len} cgi_ext entries but {cgi_path_len} cgi_path entries; the lists must be aligned"
    )]
    MisalignedCgiLists {
        index: usize,
        location_path: String,
        cgi_ext_len: usize,
        cgi_path_len: usize,
    },

    #[error("port {port} is bound to both wildcard host 0.0.0.0 and specific host(s) {hosts:?}; this will fail to bind")]
    WildcardHostConflict { port: u16, hosts: Vec<String> },
}

pub fn validate(config: &AppConfig) -> Result<(), ConfigError> {
    if config.servers.is_empty() {
        return Err(ConfigError::EmptyConfig);
    }

    for (index, server) in config.servers.iter().enumerate() {
        for code in server.error_page.keys() {
            if !(100..=599).contains(code) {
                return Err(ConfigError::InvalidErrorCode {
                    index,
                    server_name: server_label(server),
                    code: *code,
                });
            }
        }

        if let Err(source) = std::fs::read_dir(&server.root) {
            return Err(ConfigError::BadRoot {
                index,
                server_name: server_label(server),
                root: server.root.clone(),
                source,
            });
        }

        for location in &server.locations {
            if location.cgi_ext.len() != location.cgi_path.len() {
                return Err(ConfigError::MisalignedCgiLists {
                    index,
                    location_path: location.path.clone(),
                    cgi_ext_len: location.cgi_ext.len(),
                    cgi_path_len: location.cgi_path.len(),
                });
            }
        }
    }

    let mut port_hosts: HashMap<u16, HashSet<String>> = HashMap::new();
    for server in &config.servers {
        port_hosts
            .entry(server.listen)
            .or_default()
            .insert(server.bind_host().to_string());
    }
    for (port, hosts) in &port_hosts {
        if hosts.contains("0.0.0.0") && hosts.len() > 1 {
            let mut hosts: Vec<String> = hosts.iter().cloned().collect();
            hosts.sort();
            return Err(ConfigError::WildcardHostConflict { port: *port, hosts });
        }
    }

    Ok(())
}

fn server_label(server: &super::ServerConfig) -> String {
    server
        .server_names
        .first()
        .cloned()
        .unwrap_or_else(|| "_".to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{AppConfig, ServerConfig};

    fn base_server() -> ServerConfig {
        ServerConfig {
            listen: 8080,
            host: None,
            server_names: vec!["localhost".into()],
            root: ".".into(),
            index: vec![],
            client_max_body_size: None,
            error_page: HashMap::new(),
            locations: vec![],
            default_server: false,
        }
    }

    #[test]
    fn empty_config_rejected() {
        let cfg = AppConfig { servers: vec![] };
        assert!(matches!(validate(&cfg), Err(ConfigError::EmptyConfig)));
    }

    #[test]
    fn valid_config_passes() {
        let cfg = AppConfig {
            servers: vec![base_server()],
        };
        assert!(validate(&cfg).is_ok());
    }

    #[test]
    fn invalid_error_code_rejected() {
        let mut server = base_server();
        server.error_page.insert(999, "x.html".into());
        let cfg = AppConfig {
            servers: vec![server],
        };
        assert!(matches!(
            validate(&cfg),
            Err(ConfigError::InvalidErrorCode { code: 999, .. })
        ));
    }

    #[test]
    fn wildcard_host_conflict_rejected() {
        let mut a = base_server();
        a.host = Some("0.0.0.0".into());
        let mut b = base_server();
        b.host = Some("127.0.0.1".into());
        b.server_names = vec!["other".into()];
        let cfg = AppConfig {
            servers: vec![a, b],
        };
        assert!(matches!(
            validate(&cfg),
            Err(ConfigError::WildcardHostConflict { .. })
        ));
    }
}
