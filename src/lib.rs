//! Resource state synchronization for the Orchetrix desktop client.
//!
//! Per cluster, one [`session::ClusterSession`] lists and watches the
//! resource kinds the UI shows, keeps the latest state of every object in a
//! [`cache::ResourceCache`] and fans reconciled changes out to subscribers
//! through a [`publisher::StatePublisher`].

pub mod cache;
pub mod config;
pub mod error;
pub mod fetcher;
pub mod publisher;
pub mod reconciler;
pub mod resource;
pub mod session;
pub mod source;
pub mod view;

#[cfg(test)]
mod testing;

pub use error::{Error, Result};
pub use resource::{ChangeEvent, ChangeKind, ResourceKey, ResourceKind, ResourceRecord, ResourceVersion};
pub use session::{ClusterSession, ConnectionState};
