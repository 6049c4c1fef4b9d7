//! Crate-wide error types.
//!
//! Only failures that are fatal to the whole reactor (listener setup,
//! poll registry failures) surface as `ServerError`. Everything that
//! happens in the course of handling one client — malformed requests,
//! missing files, CGI failures — is turned into an `HttpResponse` by the
//! request handler; no per-client error ever unwinds past the reactor.

use thiserror::Error;

use crate::config::ConfigError;

#[derive(Debug, Error)]
pub enum ServerError {
    #[error("failed to bind listener on {addr}: {source}")]
    Bind {
        addr: std::net::SocketAddr,
        #[source]
        source: std::io::Error,
    },

    #[error("poll registry error: {0}")]
    Poll(#[from] std::io::Error),

    #[error("no server blocks configured")]
    EmptyConfig,

    #[error("invalid listen address: {0}")]
    Addr(#[from] std::net::AddrParseError),

    #[error(transparent)]
    Config(#[from] ConfigError),
}

pub type Result<T> = std::result::Result<T, ServerError>;
