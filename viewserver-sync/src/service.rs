//! The view service: one explicit context object wiring every component.
//!
//! Built once at process start and shared as `Arc<ViewService>` with the
//! transport and ingestion tasks. Nothing here is global.

use dashmap::DashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::task::{AbortHandle, JoinHandle};
use viewserver_core::{Budget, GridRegistry, GridStats, GridView, SizeGovernor, ViewId};

use crate::error::ViewServerError;
use crate::fanout::{ApplyPolicy, DeltaFanout};
use crate::ingest::{IngestConfig, IngestionAdapter, ProcessingStats};
use crate::snapshot::{SnapshotConfig, SnapshotDelivery, SnapshotState};
use crate::subscription::{HandleId, SessionStats, SubscriberHandle, SubscriptionRegistry};

/// Initial contents of a view created on connect.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum SeedPolicy {
    #[default]
    Empty,
    /// Fill every cell with a deterministic mixed-type pattern.
    DemoPattern,
}

#[derive(Debug, Clone)]
pub struct ServiceConfig {
    pub default_rows: u32,
    pub default_columns: u32,
    pub max_views: usize,
    pub snapshot: SnapshotConfig,
    pub ingestion_budget: Budget,
    pub egress_budget: Budget,
    pub apply_policy: ApplyPolicy,
    pub seed_policy: SeedPolicy,
    pub slow_batch_threshold: Duration,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            default_rows: 10_000,
            default_columns: 100,
            max_views: 100,
            snapshot: SnapshotConfig::default(),
            ingestion_budget: Budget::INGESTION,
            egress_budget: Budget::EGRESS,
            apply_policy: ApplyPolicy::Always,
            seed_policy: SeedPolicy::Empty,
            slow_batch_threshold: Duration::from_millis(50),
        }
    }
}

impl ServiceConfig {
    /// Small views, small chunks, no throttle.
    pub fn for_testing() -> Self {
        Self {
            default_rows: 100,
            default_columns: 10,
            max_views: 10,
            snapshot: SnapshotConfig::for_testing(),
            ..Self::default()
        }
    }
}

/// Read-only statistics for health and debug surfaces.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ServiceStats {
    pub grids: GridStats,
    pub sessions: SessionStats,
    pub processing: ProcessingStats,
}

/// The snapshot currently streaming to one handle.
///
/// `turn` is held for the whole transfer so a replacement never starts
/// sending before the one it replaced has stopped.
#[derive(Default)]
struct SnapshotSlot {
    turn: Arc<Mutex<()>>,
    task: Option<AbortHandle>,
}

pub struct ViewService {
    config: ServiceConfig,
    grids: Arc<GridRegistry>,
    subscriptions: Arc<SubscriptionRegistry>,
    governor: Arc<SizeGovernor>,
    snapshots: Arc<SnapshotDelivery>,
    fanout: Arc<DeltaFanout>,
    ingestion: Arc<IngestionAdapter>,
    snapshot_tasks: DashMap<HandleId, SnapshotSlot>,
}

impl ViewService {
    pub fn new(config: ServiceConfig) -> Self {
        let grids = Arc::new(GridRegistry::new(config.max_views));
        let subscriptions = Arc::new(SubscriptionRegistry::new());
        let governor = Arc::new(SizeGovernor::new(
            config.ingestion_budget,
            config.egress_budget,
        ));
        let snapshots = Arc::new(SnapshotDelivery::new(grids.clone(), config.snapshot.clone()));
        let fanout = Arc::new(DeltaFanout::new(
            grids.clone(),
            subscriptions.clone(),
            governor.clone(),
            config.apply_policy,
        ));
        let ingestion = Arc::new(IngestionAdapter::new(
            grids.clone(),
            fanout.clone(),
            IngestConfig {
                default_rows: config.default_rows,
                default_columns: config.default_columns,
                slow_batch_threshold: config.slow_batch_threshold,
            },
        ));

        log::info!(
            "View service ready: max {} views, default {}×{}, chunk size {}, apply policy {:?}",
            config.max_views,
            config.default_rows,
            config.default_columns,
            config.snapshot.effective_chunk_size(),
            config.apply_policy
        );

        Self {
            config,
            grids,
            subscriptions,
            governor,
            snapshots,
            fanout,
            ingestion,
            snapshot_tasks: DashMap::new(),
        }
    }

    pub fn config(&self) -> &ServiceConfig {
        &self.config
    }

    pub fn grids(&self) -> &Arc<GridRegistry> {
        &self.grids
    }

    pub fn subscriptions(&self) -> &Arc<SubscriptionRegistry> {
        &self.subscriptions
    }

    pub fn governor(&self) -> &Arc<SizeGovernor> {
        &self.governor
    }

    pub fn fanout(&self) -> &Arc<DeltaFanout> {
        &self.fanout
    }

    pub fn ingestion(&self) -> &Arc<IngestionAdapter> {
        &self.ingestion
    }

    /// Register `handle` on `view_id`, creating the view if needed, and
    /// start streaming its snapshot.
    ///
    /// Returns once the subscription is in place; the snapshot runs on its
    /// own task. Fails with `CapacityExceeded` when the view would be new
    /// and the registry is full.
    pub fn connect(
        &self,
        handle: Arc<dyn SubscriberHandle>,
        view_id: &ViewId,
    ) -> Result<JoinHandle<()>, ViewServerError> {
        let seed = self.config.seed_policy;
        let view = self.grids.get_or_create_with(
            view_id,
            self.config.default_rows,
            self.config.default_columns,
            |fresh| {
                if seed == SeedPolicy::DemoPattern {
                    fresh.seed_demo_pattern();
                }
            },
        )?;
        self.subscriptions.subscribe(view_id, handle.clone());
        Ok(self.spawn_snapshot(view, handle))
    }

    /// Move `handle` to an existing view and stream that view's snapshot.
    ///
    /// A snapshot still streaming to `handle` is cancelled first.
    pub fn resubscribe(
        &self,
        handle: Arc<dyn SubscriberHandle>,
        view_id: &ViewId,
    ) -> Result<JoinHandle<()>, ViewServerError> {
        let view = self
            .grids
            .get(view_id)
            .ok_or_else(|| ViewServerError::NotFound(view_id.clone()))?;
        self.subscriptions.subscribe(view_id, handle.clone());
        Ok(self.spawn_snapshot(view, handle))
    }

    fn spawn_snapshot(
        &self,
        view: Arc<GridView>,
        handle: Arc<dyn SubscriberHandle>,
    ) -> JoinHandle<()> {
        let snapshots = self.snapshots.clone();
        let subscriptions = self.subscriptions.clone();
        let mut slot = self.snapshot_tasks.entry(handle.id()).or_default();
        if let Some(previous) = slot.task.take() {
            log::debug!("Cancelling previous snapshot to handle {}", handle.id());
            previous.abort();
        }
        let turn = slot.turn.clone();

        let task = tokio::spawn(async move {
            let _turn = turn.lock().await;
            let aborted = match snapshots.stream(&view, handle.as_ref()).await {
                Ok(report) => match report.state {
                    SnapshotState::Aborted(e) => {
                        log::warn!("Snapshot of view {} to handle {} aborted: {e}", view.id(), handle.id());
                        true
                    }
                    _ => false,
                },
                Err(e) => {
                    log::error!("Snapshot of view {} to handle {} failed: {e}", view.id(), handle.id());
                    true
                }
            };
            // The handle may have moved on while this transfer ran.
            if aborted {
                subscriptions.unsubscribe_from(&handle.id(), view.id());
            }
        });
        slot.task = Some(task.abort_handle());
        task
    }

    /// Drop whatever subscription `id` holds and stop its snapshot.
    pub fn disconnect(&self, id: &HandleId) -> Option<ViewId> {
        if let Some((_, slot)) = self.snapshot_tasks.remove(id) {
            if let Some(task) = slot.task {
                task.abort();
            }
        }
        self.subscriptions.unsubscribe(id)
    }

    /// Feed one raw upstream event through the ingestion path.
    pub fn process_event(&self, raw: &str) {
        self.ingestion.process(raw);
    }

    pub fn create_view(
        &self,
        view_id: &ViewId,
        rows: u32,
        columns: u32,
    ) -> Result<Arc<GridView>, ViewServerError> {
        Ok(self.grids.get_or_create(view_id, rows, columns)?)
    }

    pub fn get_view(&self, view_id: &ViewId) -> Option<Arc<GridView>> {
        self.grids.get(view_id)
    }

    /// Remove a view. Existing subscriptions stay until their handles go away.
    pub fn remove_view(&self, view_id: &ViewId) -> bool {
        self.grids.remove(view_id)
    }

    pub fn stats(&self) -> ServiceStats {
        ServiceStats {
            grids: self.grids.stats(),
            sessions: self.subscriptions.stats(),
            processing: self.ingestion.stats(),
        }
    }
}
