//! Sync configuration, loaded from a TOML file.
//!
//! Every field has a default, so an empty file (or no file at all) yields a
//! working configuration. Out-of-range values are clamped rather than rejected.

use std::{path::Path, time::Duration};

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    /// Restrict namespaced watches to this namespace. `None` watches all.
    pub namespace: Option<String>,
    /// Kinds the `watch` command follows when none are given on the command line.
    pub kinds: Vec<String>,
    pub backoff: BackoffConfig,
    pub publisher: PublisherConfig,
    pub fetch: FetchConfig,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            namespace: None,
            kinds: vec!["Pod".to_string()],
            backoff: BackoffConfig::default(),
            publisher: PublisherConfig::default(),
            fetch: FetchConfig::default(),
        }
    }
}

/// What a fetcher does once it has sat at the backoff ceiling for
/// `ceiling_attempts` consecutive failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum RetryPolicy {
    /// Report the connection error and keep retrying.
    Forever,
    /// Report the connection error and end the stream.
    GiveUp,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BackoffConfig {
    pub base_ms: u64,
    pub cap_ms: u64,
    pub ceiling_attempts: u32,
    pub retry: RetryPolicy,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            base_ms: 1_000,
            cap_ms: 30_000,
            ceiling_attempts: 5,
            retry: RetryPolicy::Forever,
        }
    }
}

impl BackoffConfig {
    pub fn base(&self) -> Duration {
        Duration::from_millis(self.base_ms)
    }

    pub fn cap(&self) -> Duration {
        Duration::from_millis(self.cap_ms)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PublisherConfig {
    /// Events buffered per subscriber before it counts as overflowing.
    pub queue_capacity: usize,
    /// How long a full subscriber queue may hold up delivery before the
    /// subscriber is dropped.
    pub overflow_wait_ms: u64,
}

impl Default for PublisherConfig {
    fn default() -> Self {
        Self {
            queue_capacity: 256,
            overflow_wait_ms: 50,
        }
    }
}

impl PublisherConfig {
    pub fn overflow_wait(&self) -> Duration {
        Duration::from_millis(self.overflow_wait_ms)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FetchConfig {
    /// Objects requested per list page.
    pub list_page_size: u32,
    /// Server side timeout of a single watch request.
    pub watch_timeout_secs: u32,
}

impl Default for FetchConfig {
    fn default() -> Self {
        Self {
            list_page_size: 500,
            watch_timeout_secs: 290,
        }
    }
}

impl SyncConfig {
    /// Read and parse a TOML config file.
    pub fn load(path: &Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path).map_err(|source| Error::ReadConfig {
            path: path.to_path_buf(),
            source,
        })?;

        let config: SyncConfig = toml::from_str(&contents).map_err(|source| Error::ParseConfig {
            path: path.to_path_buf(),
            source,
        })?;

        Ok(config.normalized())
    }

    /// Clamp values into ranges the fetcher and publisher can work with.
    pub fn normalized(mut self) -> Self {
        self.backoff.base_ms = self.backoff.base_ms.max(1);
        self.backoff.cap_ms = self.backoff.cap_ms.max(self.backoff.base_ms);
        self.backoff.ceiling_attempts = self.backoff.ceiling_attempts.max(1);
        self.publisher.queue_capacity = self.publisher.queue_capacity.max(1);
        self.fetch.list_page_size = self.fetch.list_page_size.max(1);
        // kube refuses watch timeouts of 295s and above
        self.fetch.watch_timeout_secs = self.fetch.watch_timeout_secs.clamp(1, 290);
        self.namespace = self.namespace.filter(|namespace| !namespace.is_empty());
        self
    }
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use super::*;

    #[test]
    fn empty_file_yields_defaults() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(b"").unwrap();

        let config = SyncConfig::load(file.path()).unwrap();
        assert_eq!(config, SyncConfig::default());
        assert_eq!(config.backoff.base(), Duration::from_secs(1));
        assert_eq!(config.backoff.cap(), Duration::from_secs(30));
    }

    #[test]
    fn partial_file_overrides_and_clamps() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(
            indoc::indoc! {r#"
                namespace = "payments"
                kinds = ["Pod", "apps/v1/Deployment"]

                [backoff]
                base_ms = 5000
                cap_ms = 10
                retry = "give-up"

                [publisher]
                queue_capacity = 0
            "#}
            .as_bytes(),
        )
        .unwrap();

        let config = SyncConfig::load(file.path()).unwrap();
        assert_eq!(config.namespace.as_deref(), Some("payments"));
        assert_eq!(config.kinds, vec!["Pod", "apps/v1/Deployment"]);
        assert_eq!(config.backoff.retry, RetryPolicy::GiveUp);
        assert_eq!(config.backoff.cap_ms, 5_000);
        assert_eq!(config.backoff.ceiling_attempts, 5);
        assert_eq!(config.publisher.queue_capacity, 1);
        assert_eq!(config.publisher.overflow_wait(), Duration::from_millis(50));
    }

    #[test]
    fn malformed_file_reports_path() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(b"kinds = 12").unwrap();

        match SyncConfig::load(file.path()) {
            Err(Error::ParseConfig { path, .. }) => assert_eq!(path, file.path()),
            other => panic!("expected parse error, got {other:?}"),
        }
    }
}
