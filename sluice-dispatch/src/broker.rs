//! Registry of open destinations.
//!
//! The broker opens a destination's store, queue and dispatch worker the
//! first time it is asked for, and routes publishes and transport
//! callbacks to the right one.

use std::sync::Arc;

use dashmap::DashMap;
use sluice_common::{Signal, internal, tracing::error};
use sluice_store::{Entry, StorageId, StoreConfig};
use tokio::{
    sync::{Mutex, broadcast},
    task::JoinHandle,
};

use crate::{
    ConnectionState, DispatchConfig, DispatchError, DispatchManager, DispatchPolicy, RuleSet,
    error::Result,
    transport::{ErrorHandler, Transport},
};

#[derive(Debug)]
struct Destination {
    manager: Arc<DispatchManager>,
    worker: JoinHandle<Result<()>>,
    shutdown: broadcast::Sender<Signal>,
}

#[derive(Debug)]
pub struct Broker {
    store: StoreConfig,
    dispatch: DispatchConfig,
    policy: Arc<DispatchPolicy>,
    handler: Arc<dyn ErrorHandler>,
    destinations: DashMap<StorageId, Destination>,
    opening: Mutex<()>,
}

impl Broker {
    /// # Errors
    /// If `rules` fails validation
    pub fn new(
        store: StoreConfig,
        dispatch: DispatchConfig,
        rules: RuleSet,
        handler: Arc<dyn ErrorHandler>,
    ) -> Result<Self> {
        Ok(Self {
            store,
            dispatch,
            policy: Arc::new(DispatchPolicy::new(rules)?),
            handler,
            destinations: DashMap::new(),
            opening: Mutex::new(()),
        })
    }

    #[must_use]
    pub const fn policy(&self) -> &Arc<DispatchPolicy> {
        &self.policy
    }

    /// Open a destination and start its dispatch worker. Opening an already
    /// open destination returns the running manager.
    ///
    /// Persistent entries left by an earlier run are recovered into the
    /// queue before the worker starts.
    ///
    /// # Errors
    /// If the destination's store cannot be opened or recovered
    pub async fn open(
        &self,
        id: StorageId,
        transport: Arc<dyn Transport>,
    ) -> Result<Arc<DispatchManager>> {
        if let Some(manager) = self.destination(&id) {
            return Ok(manager);
        }

        let _opening = self.opening.lock().await;
        if let Some(manager) = self.destination(&id) {
            return Ok(manager);
        }

        let queue = Arc::new(self.store.open_queue(id.clone()).await?);
        let recovered = queue.len().await;
        let manager = Arc::new(DispatchManager::new(
            queue,
            Arc::clone(&self.policy),
            transport,
            Arc::clone(&self.handler),
            &self.dispatch,
        ));

        let (shutdown, receiver) = broadcast::channel(1);
        let worker = tokio::spawn({
            let manager = Arc::clone(&manager);
            async move { manager.serve(receiver).await }
        });

        internal!(level = INFO, "Opened destination {id} ({recovered} recovered entries)");
        self.destinations.insert(
            id,
            Destination {
                manager: Arc::clone(&manager),
                worker,
                shutdown,
            },
        );

        Ok(manager)
    }

    #[must_use]
    pub fn destination(&self, id: &StorageId) -> Option<Arc<DispatchManager>> {
        self.destinations
            .get(id)
            .map(|destination| Arc::clone(&destination.manager))
    }

    #[must_use]
    pub fn destinations(&self) -> Vec<StorageId> {
        let mut ids: Vec<_> = self
            .destinations
            .iter()
            .map(|destination| destination.key().clone())
            .collect();
        ids.sort_unstable();
        ids
    }

    fn require(&self, id: &StorageId) -> Result<Arc<DispatchManager>> {
        self.destination(id)
            .ok_or_else(|| DispatchError::UnknownDestination(id.to_string()))
    }

    /// Queue an entry for the destination it names.
    ///
    /// # Errors
    /// If the destination is not open, or its store rejects the entry
    pub async fn publish(&self, entry: Entry) -> Result<()> {
        self.require(entry.storage_id())?.publish(entry).await
    }

    /// Transport callback: the connection to `id` changed state.
    ///
    /// # Errors
    /// If the destination is not open
    pub fn on_connection_state_change(&self, id: &StorageId, state: ConnectionState) -> Result<()> {
        self.require(id)?.on_connection_state_change(state);
        Ok(())
    }

    /// Change the status token and re-evaluate every destination.
    pub fn set_status_token(&self, token: &str) {
        self.policy.set_status_token(token);
        self.wake_all();
    }

    /// Replace the dispatch rules and re-evaluate every destination.
    ///
    /// # Errors
    /// If `rules` fails validation; the previous rules stay in force
    pub fn reconfigure(&self, rules: RuleSet) -> Result<()> {
        self.policy.reconfigure(rules)?;
        self.wake_all();
        Ok(())
    }

    fn wake_all(&self) {
        for destination in &self.destinations {
            destination.manager.wake();
        }
    }

    /// Stop one destination's worker after its current batch.
    ///
    /// Persistent entries remain on disk for the next open. Non-persistent
    /// entries go with the memory tier and are reported to the error
    /// handler as lost.
    ///
    /// # Errors
    /// If the destination is not open or its worker panicked
    pub async fn shutdown_destination(&self, id: &StorageId) -> Result<()> {
        let Some((_, destination)) = self.destinations.remove(id) else {
            return Err(DispatchError::UnknownDestination(id.to_string()));
        };

        // The worker may already have exited, in which case there is no receiver
        let _ = destination.shutdown.send(Signal::Shutdown);
        destination
            .worker
            .await
            .map_err(|e| DispatchError::Shutdown(format!("{id}: {e}")))??;

        let manager = destination.manager;
        let queued = manager.queue().len().await;
        let lost = manager.close().await;
        internal!(
            level = INFO,
            "Destination {id} stopped ({queued} queued, {lost} non-persistent entries lost)"
        );

        Ok(())
    }

    /// Stop every destination.
    pub async fn shutdown(&self) {
        for id in self.destinations() {
            if let Err(e) = self.shutdown_destination(&id).await {
                error!("Failed to stop destination {id}: {e}");
            }
        }
    }
}
