use std::{
    path::Path,
    sync::{Arc, LazyLock},
};

use anyhow::Context;
use serde::Deserialize;
use sluice_common::{
    Signal,
    audit::{self, AuditConfig},
    internal, logging, tracing,
};
use sluice_dispatch::{Broker, ConnectionState, DispatchConfig, LoggingErrorHandler, RuleSet};
use sluice_store::{StorageId, StoreConfig};
use tokio::sync::broadcast;

use crate::sink::LogSink;

/// A destination to open at startup.
#[derive(Debug, Clone, Deserialize)]
pub struct DestinationConfig {
    pub name: StorageId,

    /// Connection state to report once the destination is open
    #[serde(default)]
    pub state: ConnectionState,
}

/// Top-level configuration, read from `sluice.config.ron`.
///
/// ```ron
/// Sluice (
///     store: (
///         backend: File((path: "/var/lib/sluice/store")),
///         max_cache_bytes: 67108864,
///     ),
///     dispatch: (batch_size: 64),
///     policy: (
///         rules: [
///             (state: Some(Alive), action: Send),
///             (state: Some(Polling), action: Queue, overrides: [(priority: "0-3", action: Destroy)]),
///             (state: Some(Dead), action: Queue),
///         ],
///     ),
///     destinations: [(name: "outbound")],
/// )
/// ```
#[derive(Debug, Deserialize)]
pub struct Sluice {
    #[serde(default)]
    store: StoreConfig,
    #[serde(default)]
    dispatch: DispatchConfig,
    #[serde(alias = "rules", default = "RuleSet::send_when_alive")]
    policy: RuleSet,
    #[serde(default)]
    audit: AuditConfig,
    #[serde(alias = "destination", default)]
    destinations: Vec<DestinationConfig>,
}

pub static SHUTDOWN_BROADCAST: LazyLock<broadcast::Sender<Signal>> = LazyLock::new(|| {
    let (sender, _receiver) = broadcast::channel(64);
    sender
});

#[tracing::instrument(level = "trace")]
async fn shutdown() -> anyhow::Result<()> {
    let mut terminate = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())?;
    let mut receiver = SHUTDOWN_BROADCAST.subscribe();

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            internal!("CTRL+C entered, shutting down");
        }
        _ = terminate.recv() => {
            internal!("Terminate Signal received, shutting down");
        }
        sig = receiver.recv() => {
            internal!("Received {sig:?}, shutting down");
        }
    };

    Ok(())
}

impl Sluice {
    /// Read and check a configuration file.
    ///
    /// The dispatch rules are validated here, so a bad rule set stops the
    /// process before anything is opened.
    ///
    /// # Errors
    ///
    /// This function will return an error if the file cannot be read, does
    /// not parse, or holds an invalid rule set.
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config from {}", path.display()))?;
        let sluice: Self = ron::from_str(&content)
            .with_context(|| format!("Failed to parse config in {}", path.display()))?;
        sluice
            .policy
            .validate()
            .with_context(|| format!("Invalid dispatch rules in {}", path.display()))?;
        Ok(sluice)
    }

    /// Build the broker and open every configured destination.
    ///
    /// Each destination gets a [`LogSink`] transport.
    ///
    /// # Errors
    ///
    /// This function will return an error if the dispatch rules are invalid
    /// or a destination's store cannot be opened.
    pub async fn start(self) -> anyhow::Result<Broker> {
        audit::init(self.audit);

        let broker = Broker::new(
            self.store,
            self.dispatch,
            self.policy,
            Arc::new(LoggingErrorHandler),
        )?;

        for destination in self.destinations {
            let sink = Arc::new(LogSink::new(destination.name.clone()));
            broker.open(destination.name.clone(), sink).await?;
            broker.on_connection_state_change(&destination.name, destination.state)?;
        }

        Ok(broker)
    }

    /// Run this controller, and everything it controls
    ///
    /// # Errors
    ///
    /// This function will return an error if startup fails or the signal
    /// handlers cannot be installed.
    #[tracing::instrument(level = "trace", skip_all, err)]
    pub async fn run(self) -> anyhow::Result<()> {
        logging::init();

        let broker = self.start().await?;
        internal!(
            level = INFO,
            "Controller running with {} destinations",
            broker.destinations().len()
        );

        let ret = shutdown().await;

        internal!("Shutting down...");
        broker.shutdown().await;
        // Nobody may be listening any more
        let _ = SHUTDOWN_BROADCAST.send(Signal::Finalised);

        ret
    }
}
