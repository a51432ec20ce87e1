//! Watch this node's operation queue and hand new records to the processor.
//!
//! Notifications are a trigger, not a source of truth: every dispatch runs a
//! full [`OperationProcessor::process`] pass, and a periodic sweep covers
//! notifications that were dropped or never delivered.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use anyhow::Context;
use tokio::sync::{OwnedSemaphorePermit, Semaphore, watch};
use tokio::task::JoinHandle;
use tokio::time::{Interval, MissedTickBehavior};
use tracing::{debug, error, info, warn};

use crate::inventory::Reconciler;
use crate::processor::OperationProcessor;
use crate::store::{EventKind, Notification, Subscription, TreeStore, parent, schema};

#[derive(Debug, Clone)]
pub struct ListenerSettings {
    /// Upper bound on concurrent processing passes.
    pub workers: usize,
    pub sweep_interval: Duration,
    /// `None` disables periodic reconciliation.
    pub reconcile_interval: Option<Duration>,
}

impl Default for ListenerSettings {
    fn default() -> Self {
        Self {
            workers: 4,
            sweep_interval: Duration::from_secs(30),
            reconcile_interval: None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct OperationListener {
    node_id: String,
    store: Arc<dyn TreeStore>,
    processor: OperationProcessor,
    reconciler: Option<Reconciler>,
    settings: ListenerSettings,
}

/// Running listener. Dropping the handle stops the listener without waiting
/// for in-flight passes; [`ListenerHandle::shutdown`] waits for them.
#[derive(Debug)]
pub struct ListenerHandle {
    shutdown: watch::Sender<bool>,
    task: JoinHandle<()>,
}

impl ListenerHandle {
    /// Stop listening and wait for in-flight passes to finish.
    pub async fn shutdown(self) -> anyhow::Result<()> {
        let _ = self.shutdown.send(true);
        self.task.await.context("Listener task panicked")
    }

    /// Wait until the listener stops on its own (store gone or shutdown).
    pub async fn join(self) -> anyhow::Result<()> {
        self.task.await.context("Listener task panicked")
    }

    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }
}

impl OperationListener {
    pub fn new(
        node_id: impl Into<String>,
        store: Arc<dyn TreeStore>,
        processor: OperationProcessor,
        settings: ListenerSettings,
    ) -> Self {
        Self {
            node_id: node_id.into(),
            store,
            processor,
            reconciler: None,
            settings,
        }
    }

    pub fn with_reconciler(mut self, reconciler: Reconciler) -> Self {
        self.reconciler = Some(reconciler);
        self
    }

    /// Subscribe to the queue and start the listening task.
    ///
    /// Must be called from inside a tokio runtime.
    pub fn spawn(self) -> anyhow::Result<ListenerHandle> {
        let queue = schema::operations_path(&self.node_id);
        let subscription = self
            .store
            .subscribe(&queue)
            .with_context(|| format!("Failed to subscribe to {}", queue))?;
        let (shutdown, shutdown_rx) = watch::channel(false);
        info!(node = %self.node_id, queue = %queue, "Listening for operations");
        let task = tokio::spawn(self.run(subscription, shutdown_rx));
        Ok(ListenerHandle { shutdown, task })
    }

    async fn run(self, mut subscription: Subscription, mut shutdown: watch::Receiver<bool>) {
        let queue = subscription.prefix().to_string();
        let wakeups = Wakeups::new(self.settings.workers);

        // The first tick fires immediately and picks up the existing backlog.
        let mut sweep = tokio::time::interval(self.settings.sweep_interval);
        sweep.set_missed_tick_behavior(MissedTickBehavior::Skip);
        let mut reconcile = self.settings.reconcile_interval.map(|period| {
            let mut interval = tokio::time::interval(period);
            interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
            interval
        });
        let mut notifications_open = true;

        loop {
            tokio::select! {
                _ = shutdown.changed() => break,
                notification = subscription.recv(), if notifications_open => match notification {
                    Some(Notification::Event(event)) => {
                        if event.kind == EventKind::Created && parent(&event.path) == Some(queue.as_str()) {
                            debug!(path = %event.path, "New operation record");
                            self.dispatch(&wakeups);
                        }
                    }
                    Some(Notification::Lagged(missed)) => {
                        warn!(missed, "Listener fell behind on notifications, sweeping");
                        self.dispatch(&wakeups);
                    }
                    None => {
                        warn!(node = %self.node_id, "Store notifications closed, relying on periodic sweeps");
                        notifications_open = false;
                    }
                },
                _ = sweep.tick() => self.dispatch(&wakeups),
                _ = next_tick(&mut reconcile) => self.reconcile(),
            }
        }

        // Wait for in-flight passes before reporting the listener as stopped.
        wakeups.drain().await;
        info!(node = %self.node_id, "Listener stopped");
    }

    /// Start a processing pass if a worker is free. Otherwise a busy worker
    /// goes around once more.
    fn dispatch(&self, wakeups: &Wakeups) {
        let Some(permit) = wakeups.request() else {
            debug!(node = %self.node_id, "All workers busy, wake-up queued");
            return;
        };
        let processor = self.processor.clone();
        let wakeups = wakeups.clone();
        tokio::task::spawn_blocking(move || {
            let mut permit = permit;
            loop {
                loop {
                    wakeups.begin_pass();
                    match processor.process() {
                        Ok(summary) if summary.lost_claims > 0 => {
                            debug!(lost = summary.lost_claims, "Some claims went to other workers");
                        }
                        Ok(_) => {}
                        Err(err) => {
                            error!(node = %processor.node_id(), error = %err, "Operation pass failed");
                            break;
                        }
                    }
                    if !wakeups.has_pending() {
                        break;
                    }
                }
                match wakeups.release(permit) {
                    Some(next) => permit = next,
                    None => break,
                }
            }
        });
    }

    fn reconcile(&self) {
        let Some(reconciler) = self.reconciler.clone() else {
            return;
        };
        tokio::task::spawn_blocking(move || {
            if let Err(err) = reconciler.reconcile() {
                error!(error = %format!("{:#}", err), "Inventory reconciliation failed");
            }
        });
    }
}

/// Hand-off between wake-ups and processing workers.
///
/// A wake-up that finds every worker busy is remembered; whichever worker
/// releases its slot last sees it and takes the slot back for another pass.
#[derive(Debug, Clone)]
struct Wakeups {
    semaphore: Arc<Semaphore>,
    pending: Arc<AtomicBool>,
    workers: u32,
}

impl Wakeups {
    fn new(workers: usize) -> Self {
        let workers = u32::try_from(workers.max(1)).unwrap_or(u32::MAX);
        Self {
            semaphore: Arc::new(Semaphore::new(workers as usize)),
            pending: Arc::new(AtomicBool::new(false)),
            workers,
        }
    }

    /// Record a wake-up. Returns a worker slot if one is free.
    fn request(&self) -> Option<OwnedSemaphorePermit> {
        // Flag first: a worker releasing after a failed acquire must see it.
        self.pending.store(true, Ordering::SeqCst);
        self.semaphore.clone().try_acquire_owned().ok()
    }

    /// Consume pending wake-ups at the start of a pass.
    fn begin_pass(&self) {
        self.pending.store(false, Ordering::SeqCst);
    }

    fn has_pending(&self) -> bool {
        self.pending.load(Ordering::SeqCst)
    }

    /// Give a slot back. Returns a slot again when a wake-up arrived that no
    /// running worker is left to see.
    fn release(&self, permit: OwnedSemaphorePermit) -> Option<OwnedSemaphorePermit> {
        drop(permit);
        if !self.has_pending() {
            return None;
        }
        self.semaphore.clone().try_acquire_owned().ok()
    }

    /// Wait until every worker slot is free.
    async fn drain(&self) {
        let _ = self.semaphore.acquire_many(self.workers).await;
    }
}

async fn next_tick(interval: &mut Option<Interval>) {
    match interval {
        Some(interval) => {
            interval.tick().await;
        }
        None => std::future::pending::<()>().await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{Operation, OperationAction, OperationState};
    use crate::processor::{ProcessorSettings, RetryPolicy};
    use crate::runtime::LocalRuntime;
    use crate::store::{MemoryTreeStore, ModuleRepository};

    #[test]
    fn test_wakeup_while_every_worker_is_busy_is_picked_up_on_release() {
        let wakeups = Wakeups::new(1);
        let permit = wakeups.request().expect("slot should be free");
        wakeups.begin_pass();
        assert!(!wakeups.has_pending());

        // Arrives after the worker's last check but before it lets go.
        assert!(wakeups.request().is_none());

        let again = wakeups
            .release(permit)
            .expect("releasing worker should take the slot back");
        wakeups.begin_pass();
        assert!(wakeups.release(again).is_none());
        assert!(wakeups.request().is_some());
    }

    #[test]
    fn test_release_without_wakeups_frees_the_slot() {
        let wakeups = Wakeups::new(2);
        let first = wakeups.request().expect("slot should be free");
        let second = wakeups.request().expect("slot should be free");
        wakeups.begin_pass();

        assert!(wakeups.release(first).is_none());
        assert!(wakeups.release(second).is_none());
        assert_eq!(wakeups.semaphore.available_permits(), 2);
    }

    #[tokio::test]
    async fn test_new_records_are_processed_without_waiting_for_a_sweep() {
        let tmp = tempfile::TempDir::new().expect("tempdir should succeed");
        let store: Arc<dyn TreeStore> = Arc::new(MemoryTreeStore::new());
        let repository = ModuleRepository::new(store.clone());
        repository.register_node("n1").expect("register should succeed");
        let runtime = Arc::new(LocalRuntime::open(tmp.path()).expect("runtime should open"));
        let processor = OperationProcessor::new(
            "n1",
            repository.clone(),
            runtime,
            ProcessorSettings {
                retry: RetryPolicy::none(),
                ..ProcessorSettings::default()
            },
        );
        let handle = OperationListener::new(
            "n1",
            store,
            processor,
            ListenerSettings {
                workers: 2,
                sweep_interval: Duration::from_secs(3600),
                reconcile_interval: None,
            },
        )
        .spawn()
        .expect("listener should start");

        // Let the initial sweep run on an empty queue.
        tokio::time::sleep(Duration::from_millis(50)).await;
        repository
            .create_operation(
                &Operation::new(OperationAction::Stop, "ghost-1.0", "n1").with_name("op-1"),
            )
            .expect("create should succeed");

        let mut state = OperationState::Pending;
        for _ in 0..100 {
            tokio::time::sleep(Duration::from_millis(20)).await;
            state = repository
                .operation("n1", "op-1")
                .expect("read should succeed")
                .expect("record should exist")
                .state();
            if state.is_terminal() {
                break;
            }
        }
        assert_eq!(state, OperationState::Failed);

        handle.shutdown().await.expect("shutdown should succeed");
    }
}
