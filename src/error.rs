//! Error types for cluster state synchronization.

use std::path::PathBuf;
use thiserror::Error;

/// Errors that can occur while fetching, caching or publishing cluster state.
#[derive(Error, Debug)]
pub enum Error {
    /// The cluster endpoint stayed unreachable while the backoff sat at its
    /// ceiling. Transient: the fetcher keeps retrying unless told otherwise.
    #[error("cluster unreachable while watching {kind} after {attempts} attempts: {message}")]
    Connection {
        kind: String,
        attempts: u32,
        message: String,
    },

    /// The watch reported that our resource version is too old to resume from.
    #[error("resource version too old for {kind}, full resync required")]
    ResyncRequired { kind: String },

    #[error("kubernetes api error: {0}")]
    Api(#[from] kube::Error),

    #[error("failed to load kubeconfig: {0}")]
    Kubeconfig(#[from] kube::config::KubeconfigError),

    #[error("unknown resource kind '{0}'")]
    InvalidKind(String),

    #[error("invalid resource version '{0}'")]
    InvalidVersion(String),

    #[error("failed to decode {kind} object: {message}")]
    Decode { kind: String, message: String },

    #[error("failed to read config file {path:?}: {source}")]
    ReadConfig {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config file {path:?}: {source}")]
    ParseConfig {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },
}

impl Error {
    /// Returns true if the error is likely transient and the call can be retried.
    pub fn is_retryable(&self) -> bool {
        match self {
            Error::Connection { .. } => true,
            Error::Api(kube::Error::Api(response)) => {
                response.code == 429 || response.code >= 500
            }
            Error::Api(kube::Error::Auth(_)) => false,
            Error::Api(_) => true,
            _ => false,
        }
    }
}

/// Result type for synchronization operations.
pub type Result<T> = std::result::Result<T, Error>;
