use std::{path::PathBuf, sync::Arc};

use clap::{Args, Parser, Subcommand};
use futures::StreamExt;
use kube::{config::KubeConfigOptions, Client};
use orchetrix_sync::{
    cache::ResourceCache,
    config::SyncConfig,
    fetcher::{RawEvent, ResourceFetcher},
    publisher::Disconnected,
    source::KubeSource,
    view::ResourceView,
    ClusterSession, Error, ResourceKind,
};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(author, version, about, long_about = None)]
struct Cli {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Args)]
struct ClusterArgs {
    /// TOML file with sync settings.
    #[arg(long)]
    config: Option<PathBuf>,

    /// Kubeconfig context to use instead of the current one.
    #[arg(long)]
    context: Option<String>,

    /// Only look at this namespace.
    #[arg(long, short)]
    namespace: Option<String>,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Follow resource kinds and log every change until interrupted.
    Watch {
        #[command(flatten)]
        cluster: ClusterArgs,

        /// Kinds to follow, e.g. `Pod` or `apps/v1/Deployment`.
        kinds: Vec<String>,
    },

    /// List a resource kind once and print it as a table.
    List {
        #[command(flatten)]
        cluster: ClusterArgs,

        kind: String,

        /// Only show rows matching every term.
        #[arg(long)]
        search: Option<String>,
    },
}

impl ClusterArgs {
    fn sync_config(&self) -> Result<SyncConfig, Error> {
        let mut config = match &self.config {
            Some(path) => SyncConfig::load(path)?,
            None => SyncConfig::default(),
        };
        if self.namespace.is_some() {
            config.namespace = self.namespace.clone();
        }
        Ok(config.normalized())
    }

    async fn client(&self) -> Result<Client, Error> {
        let options = KubeConfigOptions {
            context: self.context.clone(),
            ..KubeConfigOptions::default()
        };
        let config = kube::Config::from_kubeconfig(&options).await?;
        Ok(Client::try_from(config)?)
    }

    fn cluster_name(&self) -> String {
        self.context.clone().unwrap_or_else(|| "current-context".to_string())
    }
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<(), Error> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let cli = Cli::parse();

    match cli.command {
        Command::Watch { cluster, kinds } => watch(cluster, kinds).await,
        Command::List {
            cluster,
            kind,
            search,
        } => list(cluster, kind, search).await,
    }
}

async fn watch(cluster: ClusterArgs, kinds: Vec<String>) -> Result<(), Error> {
    let config = cluster.sync_config()?;
    let kinds = if kinds.is_empty() {
        config.kinds.clone()
    } else {
        kinds
    };
    let kinds = kinds
        .iter()
        .map(|kind| kind.parse())
        .collect::<Result<Vec<ResourceKind>, Error>>()?;

    let session = ClusterSession::connect(cluster.cluster_name(), cluster.client().await?, config);
    let mut subscription = session.subscribe();
    for kind in kinds {
        session.watch_kind(kind);
    }

    let shutdown = tokio::signal::ctrl_c();
    tokio::pin!(shutdown);

    loop {
        tokio::select! {
            _ = &mut shutdown => {
                info!("interrupted, shutting down");
                break;
            }
            next = subscription.next() => match next {
                Some(Ok(change)) => {
                    let version = change.record.as_ref().map(|record| record.resource_version);
                    info!(
                        change = %change.kind,
                        key = %change.key,
                        version = ?version,
                        state = %session.connection_state(),
                        "resource changed"
                    );
                }
                Some(Err(Disconnected)) => {
                    warn!(cached = session.cache().len(), "fell behind, subscribing again");
                    subscription = session.subscribe();
                }
                None => break,
            }
        }
    }

    session.disconnect().await;
    Ok(())
}

async fn list(cluster: ClusterArgs, kind: String, search: Option<String>) -> Result<(), Error> {
    let config = cluster.sync_config()?;
    let kind: ResourceKind = kind.parse()?;

    let source = KubeSource::new(cluster.client().await?, config.namespace.clone(), config.fetch.clone());
    let fetcher = ResourceFetcher::new(Arc::new(source), config.backoff.clone());

    let objects = match fetcher.subscribe(kind.clone()).next().await {
        Some(Ok(RawEvent::Listed(objects))) => objects,
        Some(Err(err)) => return Err(err),
        _ => Vec::new(),
    };

    let cache = ResourceCache::new();
    for object in objects {
        cache.put(object.into_record());
    }

    let namespace = config.namespace.as_deref().filter(|_| kind.namespaced);
    let records = cache.snapshot_in(&kind.to_string(), namespace);

    let view = ResourceView::for_kind(&kind);
    let records = match search {
        Some(query) => view.search(&records, &query),
        None => records,
    };

    println!("{}", view.render(&records));
    Ok(())
}
