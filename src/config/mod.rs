//! The configuration tree the core consumes. Building and validating a
//! config file is an external concern; this module just defines the
//! already-built tree's shape (`AppConfig` / `ServerConfig` /
//! `LocationConfig`) and loads it with `serde_yaml`.

mod display;
mod validate;

pub use validate::ConfigError;

use std::collections::HashMap;
use std::path::Path;

use serde::Deserialize;

pub const DEFAULT_CLIENT_MAX_BODY_SIZE: usize = 1024 * 1024;
pub const DEFAULT_BIND_HOST: &str = "0.0.0.0";
pub const STATIC_FILE_CAP: usize = 10 * 1024 * 1024;
pub const AUTOINDEX_ENTRY_CAP: usize = 1000;
pub const IDLE_TIMEOUT_SECS: u64 = 30;

fn default_autoindex() -> bool {
    false
}

/// A `return` directive: status code plus redirect target.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
pub struct ReturnDirective {
    pub code: u16,
    pub url: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct LocationConfig {
    /// URL prefix this location matches, e.g. `/`, `/api`, `/cgi/`.
    pub path: String,
    #[serde(default)]
    pub root: Option<String>,
    #[serde(default)]
    pub alias: Option<String>,
    #[serde(default)]
    pub index: Option<Vec<String>>,
    #[serde(default)]
    pub allow_methods: Option<Vec<String>>,
    #[serde(default)]
    pub client_max_body_size: Option<usize>,
    #[serde(default)]
    pub r#return: Option<ReturnDirective>,
    #[serde(default)]
    pub error_page: HashMap<u16, String>,
    #[serde(default = "default_autoindex")]
    pub autoindex: bool,
    #[serde(default)]
    pub upload_path: Option<String>,
    #[serde(default)]
    pub cgi_ext: Vec<String>,
    #[serde(default)]
    pub cgi_path: Vec<String>,
}

impl LocationConfig {
    /// Longest-prefix match: the pattern must match byte-exact against a
    /// prefix of the sanitized decoded path.
    pub fn matches(&self, decoded_path: &str) -> bool {
        decoded_path.starts_with(self.path.as_str())
    }

    pub fn cgi_interpreter_for(&self, ext: &str) -> Option<&str> {
        self.cgi_ext
            .iter()
            .position(|e| e == ext)
            .and_then(|i| self.cgi_path.get(i))
            .map(|s| s.as_str())
    }

    pub fn is_cgi_ext(&self, ext: &str) -> bool {
        self.cgi_ext.iter().any(|e| e == ext)
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    pub listen: u16,
    #[serde(default)]
    pub host: Option<String>,
    #[serde(default)]
    pub server_names: Vec<String>,
    pub root: String,
    #[serde(default)]
    pub index: Vec<String>,
    #[serde(default)]
    pub client_max_body_size: Option<usize>,
    #[serde(default)]
    pub error_page: HashMap<u16, String>,
    #[serde(default)]
    pub locations: Vec<LocationConfig>,
    /// Explicit tie-breaker among servers sharing a port when no
    /// `server_name` matches the request's `Host`. Absent this flag,
    /// selection falls back to the first server in the candidate list.
    #[serde(default)]
    pub default_server: bool,
}

impl ServerConfig {
    pub fn bind_host(&self) -> &str {
        self.host.as_deref().unwrap_or(DEFAULT_BIND_HOST)
    }

    pub fn effective_body_limit(&self) -> usize {
        self.client_max_body_size
            .unwrap_or(DEFAULT_CLIENT_MAX_BODY_SIZE)
    }

    /// Longest-prefix location match over this server's locations.
    pub fn select_location(&self, decoded_path: &str) -> Option<&LocationConfig> {
        self.locations
            .iter()
            .filter(|loc| loc.matches(decoded_path))
            .max_by_key(|loc| loc.path.len())
    }

    /// Server's error page for `code`, used when no location (or the
    /// matched location) has an entry of its own.
    pub fn error_page(&self, code: u16) -> Option<&str> {
        self.error_page.get(&code).map(|s| s.as_str())
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
    pub servers: Vec<ServerConfig>,
}

impl AppConfig {
    pub fn load(path: impl AsRef<Path>) -> Result<AppConfig, ConfigError> {
        let text = std::fs::read_to_string(path.as_ref()).map_err(|source| ConfigError::Read {
            path: path.as_ref().display().to_string(),
            source,
        })?;
        let config: AppConfig =
            serde_yaml::from_str(&text).map_err(|source| ConfigError::Parse { source })?;
        validate::validate(&config)?;
        Ok(config)
    }

    pub fn display_config(&self) {
        display::print_dashboard(self);
    }
}

/// The location's effective index-filename list, inheriting the
/// server's when the location does not set its own.
pub fn effective_index<'a>(server: &'a ServerConfig, location: Option<&'a LocationConfig>) -> &'a [String] {
    location
        .and_then(|l| l.index.as_deref())
        .unwrap_or(&server.index)
}

pub fn effective_allow_methods<'a>(location: Option<&'a LocationConfig>) -> Option<&'a [String]> {
    location.and_then(|l| l.allow_methods.as_deref())
}

pub fn effective_body_limit(server: &ServerConfig, location: Option<&LocationConfig>) -> usize {
    location
        .and_then(|l| l.client_max_body_size)
        .unwrap_or_else(|| server.effective_body_limit())
}

/// Location error-page map merged over the server map, location wins.
pub fn effective_error_page(
    server: &ServerConfig,
    location: Option<&LocationConfig>,
    code: u16,
) -> Option<(String, ErrorPageOwner)> {
    if let Some(loc) = location {
        if let Some(path) = loc.error_page.get(&code) {
            return Some((path.clone(), ErrorPageOwner::Location));
        }
    }
    server
        .error_page(code)
        .map(|p| (p.to_string(), ErrorPageOwner::Server))
}

/// Which config block an error page was resolved from — its document
/// root is what the page path resolves relative to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorPageOwner {
    Location,
    Server,
}
