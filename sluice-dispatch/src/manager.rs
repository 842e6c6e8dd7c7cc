//! Per-destination dispatch worker.
//!
//! A manager drains its destination's queue in passes. Each pass walks the
//! queue once in priority order, one batch at a time, and applies the
//! dispatch policy to every entry it checks out. Queued entries are put
//! straight back where they were. Sent and destroyed entries are settled,
//! which is when a persistent entry's durable record goes away. Between
//! passes the worker sleeps until something changes.

use std::{sync::Arc, time::Duration};

use parking_lot::{Mutex, RwLock};
use sluice_common::{
    Signal, audit, inbound, internal, outbound,
    tracing::{self, debug, error, info, warn},
};
use sluice_store::{Entry, MessageQueue, Position, StorageId, now_ms};
use tokio::sync::{
    Notify,
    broadcast::{self, error::TryRecvError},
};

use crate::{
    ConnectionState, DispatchAction, DispatchConfig, DispatchError, DispatchPolicy,
    error::Result,
    transport::{DestroyReason, ErrorHandler, Transport},
};

/// What one pass over the queue did.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DispatchPass {
    pub delivered: usize,
    pub queued: usize,
    pub destroyed: usize,
    pub expired: usize,
    /// Transport failures; the entries were put back
    pub failed: usize,
    /// Entries reported lost after a failed swap-out
    pub lost: usize,
    /// The pass stopped early for a shutdown
    pub interrupted: bool,
    cursor: Option<Position>,
    stalled: bool,
}

#[derive(Debug)]
pub struct DispatchManager {
    queue: Arc<MessageQueue>,
    policy: Arc<DispatchPolicy>,
    transport: Arc<dyn Transport>,
    handler: Arc<dyn ErrorHandler>,
    state: RwLock<ConnectionState>,
    wake: Arc<Notify>,
    batch_size: usize,
    idle_wake: Option<Duration>,
    /// Taken entries that could not be put back yet
    holdback: Mutex<Vec<Entry>>,
}

impl DispatchManager {
    #[must_use]
    pub fn new(
        queue: Arc<MessageQueue>,
        policy: Arc<DispatchPolicy>,
        transport: Arc<dyn Transport>,
        handler: Arc<dyn ErrorHandler>,
        config: &DispatchConfig,
    ) -> Self {
        let wake = queue.notifier();
        Self {
            queue,
            policy,
            transport,
            handler,
            state: RwLock::new(ConnectionState::default()),
            wake,
            batch_size: config.batch_size(),
            idle_wake: config.idle_wake(),
            holdback: Mutex::new(Vec::new()),
        }
    }

    #[must_use]
    pub fn destination(&self) -> &StorageId {
        self.queue.storage_id()
    }

    #[must_use]
    pub const fn queue(&self) -> &Arc<MessageQueue> {
        &self.queue
    }

    #[must_use]
    pub const fn policy(&self) -> &Arc<DispatchPolicy> {
        &self.policy
    }

    #[must_use]
    pub fn connection_state(&self) -> ConnectionState {
        *self.state.read()
    }

    /// Record the transport's new connection state and wake the worker.
    pub fn on_connection_state_change(&self, state: ConnectionState) {
        let previous = std::mem::replace(&mut *self.state.write(), state);
        if previous != state {
            info!(destination = %self.destination(), from = %previous, to = %state, "Connection state changed");
        }
        self.wake();
    }

    /// Ask the worker to run a pass.
    pub fn wake(&self) {
        self.wake.notify_one();
    }

    /// Queue a new entry for this destination.
    ///
    /// # Errors
    /// If the store cannot accept the entry. Persistent entries are only
    /// acknowledged once they are durable.
    pub async fn publish(&self, entry: Entry) -> Result<()> {
        let (id, priority, size, persistent) = (
            entry.id(),
            entry.priority(),
            entry.size_in_bytes(),
            entry.is_persistent(),
        );

        self.queue.enqueue(entry).await?;

        inbound!(level = DEBUG, "Accepted {id} for {}", self.destination());
        audit::log_entry_accepted(
            self.destination().as_str(),
            id.get(),
            priority.get(),
            size,
            persistent,
        );
        Ok(())
    }

    /// Hand over the held-back entries, leaving the list empty.
    #[must_use]
    pub fn drain_holdback(&self) -> Vec<Entry> {
        std::mem::take(&mut *self.holdback.lock())
    }

    /// Number of entries waiting to be put back.
    #[must_use]
    pub fn holdback_len(&self) -> usize {
        self.holdback.lock().len()
    }

    /// Try to put held-back entries into the queue again. Returns how many
    /// are still held back.
    pub async fn flush_holdback(&self) -> usize {
        let held = std::mem::take(&mut *self.holdback.lock());
        if held.is_empty() {
            return 0;
        }

        let mut remaining = Vec::new();
        for entry in held {
            if let Err(e) = self.queue.requeue(entry.clone()).await {
                warn!(destination = %self.destination(), id = %entry.id(), error = %e, "Entry still cannot be requeued");
                remaining.push(entry);
            }
        }

        let count = remaining.len();
        self.holdback.lock().extend(remaining);
        count
    }

    /// Run one pass over the whole queue.
    ///
    /// # Errors
    /// If the queue cannot be read. Nothing taken in the failing batch is
    /// lost.
    pub async fn dispatch_pass(&self) -> Result<DispatchPass> {
        self.run_pass(None).await
    }

    async fn run_pass(
        &self,
        mut shutdown: Option<&mut broadcast::Receiver<Signal>>,
    ) -> Result<DispatchPass> {
        self.flush_holdback().await;

        let mut pass = DispatchPass::default();
        let outcome = loop {
            match self.dispatch_batch(&mut pass).await {
                Ok(0) => break Ok(()),
                // The transport is failing, later sends would fail too
                Ok(_) if pass.stalled => break Ok(()),
                Ok(_) => {}
                Err(e) => break Err(e),
            }

            if shutdown.as_deref_mut().is_some_and(shutdown_requested) {
                pass.interrupted = true;
                break Ok(());
            }
        };

        pass.lost = self.report_lost().await;
        outcome.map(|()| pass)
    }

    /// Take and handle one batch. Returns how many entries were taken.
    async fn dispatch_batch(&self, pass: &mut DispatchPass) -> Result<usize> {
        let entries = self.queue.checkout_after(pass.cursor, self.batch_size).await?;
        let Some(last) = entries.last() else {
            return Ok(0);
        };
        pass.cursor = Some(Position::of(last));
        let taken = entries.len();

        let destination = self.destination().clone();
        let state = self.connection_state();
        let rules = self.policy.snapshot();
        let status = self.policy.status_token();
        let now = now_ms();

        let mut destroyed = Vec::new();
        let mut expired = Vec::new();
        let mut notices = Vec::new();

        for entry in entries {
            if entry.is_expired(now) {
                expired.push(entry);
                continue;
            }

            let decision = rules.decide(entry.priority(), state, &status);
            let mut action = decision.action;

            if action == DispatchAction::Send && !state.is_alive() {
                error!(
                    destination = %destination,
                    id = %entry.id(),
                    state = %state,
                    "Rules say send while the connection is not alive, queueing instead"
                );
                action = DispatchAction::Queue;
            }

            if action == DispatchAction::Send && pass.stalled {
                action = DispatchAction::Queue;
            }

            let notice = decision.notify_sender.then(|| entry.clone());

            let applied = match action {
                DispatchAction::Send => match self.transport.send(&entry).await {
                    Ok(()) => {
                        outbound!(level = DEBUG, "Delivered {} to {destination}", entry.id());
                        audit::log_entry_delivered(
                            destination.as_str(),
                            entry.id().get(),
                            entry.priority().get(),
                        );
                        pass.delivered += 1;
                        self.settle(&entry).await;
                        DispatchAction::Send
                    }
                    Err(e) => {
                        audit::log_delivery_failed(
                            destination.as_str(),
                            entry.id().get(),
                            &e.to_string(),
                        );
                        pass.failed += 1;
                        pass.stalled = true;

                        self.put_back(entry.clone()).await;
                        self.handler.handle_error(
                            &destination,
                            std::slice::from_ref(&entry),
                            &DispatchError::Transport(e),
                        );
                        DispatchAction::Queue
                    }
                },
                DispatchAction::Queue => {
                    self.put_back(entry).await;
                    pass.queued += 1;
                    DispatchAction::Queue
                }
                DispatchAction::Destroy => {
                    destroyed.push(entry);
                    DispatchAction::Destroy
                }
            };

            if let Some(entry) = notice {
                notices.push((applied, entry));
            }
        }

        pass.expired += self
            .destroy(&destination, &expired, DestroyReason::Expired)
            .await;
        pass.destroyed += self
            .destroy(&destination, &destroyed, DestroyReason::Policy)
            .await;

        for action in [
            DispatchAction::Send,
            DispatchAction::Queue,
            DispatchAction::Destroy,
        ] {
            let entries: Vec<Entry> = notices
                .iter()
                .filter(|(applied, _)| *applied == action)
                .map(|(_, entry)| entry.clone())
                .collect();
            if !entries.is_empty() {
                self.handler.handle_notice(&destination, &entries, action);
            }
        }

        Ok(taken)
    }

    async fn destroy(
        &self,
        destination: &StorageId,
        entries: &[Entry],
        reason: DestroyReason,
    ) -> usize {
        if entries.is_empty() {
            return 0;
        }

        for entry in entries {
            audit::log_entry_destroyed(
                destination.as_str(),
                entry.id().get(),
                entry.priority().get(),
                reason.as_str(),
            );
        }
        self.handler.handle_destroyed(destination, entries, reason);

        for entry in entries {
            self.settle(entry).await;
        }
        entries.len()
    }

    /// Drop the durable record of an entry that has left the queue for good.
    async fn settle(&self, entry: &Entry) {
        if let Err(e) = self.queue.settle(entry).await {
            error!(
                destination = %self.destination(),
                id = %entry.id(),
                error = %e,
                "Failed to remove durable record, entry will be recovered again"
            );
        }
    }

    async fn put_back(&self, entry: Entry) {
        if let Err(e) = self.queue.requeue(entry.clone()).await {
            error!(
                destination = %self.destination(),
                id = %entry.id(),
                error = %e,
                "Failed to requeue entry, holding it back"
            );
            self.holdback.lock().push(entry);
        }
    }

    async fn report_lost(&self) -> usize {
        let lost = self.queue.take_lost().await;
        self.report(&lost)
    }

    fn report(&self, lost: &[Entry]) -> usize {
        if lost.is_empty() {
            return 0;
        }

        for entry in lost {
            audit::log_entry_lost(self.destination().as_str(), entry.id().get());
        }
        error!(destination = %self.destination(), count = lost.len(), "Entries lost after a failed swap-out");
        self.handler
            .handle_error(self.destination(), lost, &DispatchError::Lost);
        lost.len()
    }

    /// Release the destination's memory after its worker has stopped.
    ///
    /// Held-back entries get one more chance to go back into the store.
    /// Persistent entries stay durable for the next open. Every
    /// non-persistent entry that does not survive, whether queued, held
    /// back or dropped by a failed swap-out, is reported lost. Returns how
    /// many were.
    pub async fn close(&self) -> usize {
        self.flush_holdback().await;

        let (kept, mut lost): (Vec<Entry>, Vec<Entry>) = self
            .drain_holdback()
            .into_iter()
            .partition(Entry::is_persistent);
        if !kept.is_empty() {
            warn!(
                destination = %self.destination(),
                count = kept.len(),
                "Persistent entries could not be requeued, leaving them for recovery"
            );
        }

        lost.extend(self.queue.take_lost().await);
        lost.extend(self.queue.store().clear_resident().await);
        self.report(&lost)
    }

    /// Run the worker until a shutdown signal arrives.
    ///
    /// A batch in flight when the signal arrives is finished first; whatever
    /// is still queued stays in the store.
    ///
    /// # Errors
    ///
    /// Currently infallible, failed passes are logged and retried on the
    /// next wake-up
    #[tracing::instrument(level = "trace", skip_all, fields(destination = %self.destination()))]
    pub async fn serve(&self, mut shutdown: broadcast::Receiver<Signal>) -> Result<()> {
        internal!("Dispatch worker for {} starting", self.destination());

        loop {
            match self.run_pass(Some(&mut shutdown)).await {
                Ok(pass) if pass.interrupted => {
                    internal!("Dispatch worker for {} interrupted by shutdown", self.destination());
                    break;
                }
                Ok(pass) => {
                    debug!(
                        delivered = pass.delivered,
                        queued = pass.queued,
                        destroyed = pass.destroyed,
                        expired = pass.expired,
                        failed = pass.failed,
                        "Dispatch pass complete"
                    );
                }
                Err(e) => {
                    error!("Error dispatching for {}: {e}", self.destination());
                }
            }

            tokio::select! {
                () = self.wake.notified() => {}
                () = idle(self.idle_wake) => {}
                sig = shutdown.recv() => {
                    match sig {
                        Ok(Signal::Shutdown | Signal::Finalised) => {
                            internal!("Dispatch worker for {} received shutdown signal", self.destination());
                        }
                        Err(e) => {
                            error!("Dispatch worker shutdown channel error: {e}");
                        }
                    }
                    break;
                }
            }
        }

        internal!("Dispatch worker for {} stopped", self.destination());
        Ok(())
    }
}

fn shutdown_requested(rx: &mut broadcast::Receiver<Signal>) -> bool {
    !matches!(rx.try_recv(), Err(TryRecvError::Empty))
}

async fn idle(period: Option<Duration>) {
    match period {
        Some(period) => tokio::time::sleep(period).await,
        None => std::future::pending().await,
    }
}
