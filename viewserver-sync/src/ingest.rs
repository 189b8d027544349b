//! Ingestion adapter: upstream event stream → grid state.
//!
//! Every raw payload is handled in isolation. A malformed, oversized or
//! misaddressed batch is logged and dropped; the next one is processed
//! as usual.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use viewserver_core::{now_millis, CellChange, GridRegistry, ViewId};

use crate::error::ViewServerError;
use crate::fanout::{DeltaFanout, FanoutReport};
use crate::protocol::{EventKind, GridEvent};

/// Log an ingestion summary every this many messages.
const STATS_LOG_INTERVAL: u64 = 100;

#[derive(Debug, Clone)]
pub struct IngestConfig {
    /// Dimensions of views created by `GRID_CREATED`.
    pub default_rows: u32,
    pub default_columns: u32,
    /// Batches slower than this are logged as warnings.
    pub slow_batch_threshold: Duration,
}

impl Default for IngestConfig {
    fn default() -> Self {
        Self {
            default_rows: 10_000,
            default_columns: 100,
            slow_batch_threshold: Duration::from_millis(50),
        }
    }
}

/// What a successfully handled event did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IngestOutcome {
    Applied(FanoutReport),
    Created(ViewId),
    Deleted { view: ViewId, existed: bool },
    Cleared(ViewId),
    /// Unknown event type; carried for logging.
    Ignored(String),
}

/// Ingestion counters.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ProcessingStats {
    pub total_messages: u64,
    pub total_cells: u64,
    pub dropped: u64,
    /// Wall-clock time of the last processed message, ms since epoch.
    pub last_processed_ms: u64,
}

impl ProcessingStats {
    pub fn average_cells_per_message(&self) -> f64 {
        if self.total_messages == 0 {
            0.0
        } else {
            self.total_cells as f64 / self.total_messages as f64
        }
    }
}

pub struct IngestionAdapter {
    grids: Arc<GridRegistry>,
    fanout: Arc<DeltaFanout>,
    config: IngestConfig,
    total_messages: AtomicU64,
    total_cells: AtomicU64,
    dropped: AtomicU64,
    last_processed_ms: AtomicU64,
}

impl IngestionAdapter {
    pub fn new(grids: Arc<GridRegistry>, fanout: Arc<DeltaFanout>, config: IngestConfig) -> Self {
        Self {
            grids,
            fanout,
            config,
            total_messages: AtomicU64::new(0),
            total_cells: AtomicU64::new(0),
            dropped: AtomicU64::new(0),
            last_processed_ms: AtomicU64::new(now_millis()),
        }
    }

    /// Parse and dispatch one raw event.
    pub fn ingest(&self, raw: &str) -> Result<IngestOutcome, ViewServerError> {
        let event =
            GridEvent::decode(raw).map_err(|e| ViewServerError::malformed(e.to_string(), raw))?;
        let kind = event.kind();
        if let EventKind::Unknown(other) = &kind {
            return Ok(IngestOutcome::Ignored(other.clone()));
        }
        let view = event
            .view()
            .ok_or_else(|| ViewServerError::malformed("event missing view id", raw))?;

        match kind {
            EventKind::CellUpdate => {
                let raw_changes = event.changes.ok_or_else(|| {
                    ViewServerError::malformed(format!("event for view {view} missing changes"), raw)
                })?;
                let changes = raw_changes
                    .into_iter()
                    .map(|c| c.into_change())
                    .collect::<Result<Vec<CellChange>, _>>()
                    .map_err(|e| ViewServerError::malformed(e.to_string(), raw))?;
                if changes.is_empty() {
                    log::debug!("Empty change list for view {view}");
                }
                let report = self.fanout.apply(&view, &changes)?;
                Ok(IngestOutcome::Applied(report))
            }
            EventKind::GridCreated => {
                self.grids.get_or_create(
                    &view,
                    self.config.default_rows,
                    self.config.default_columns,
                )?;
                Ok(IngestOutcome::Created(view))
            }
            EventKind::GridDeleted => {
                let existed = self.grids.remove(&view);
                if !existed {
                    log::warn!("View {view} was not found for deletion");
                }
                Ok(IngestOutcome::Deleted { view, existed })
            }
            EventKind::GridCleared => {
                let target = self
                    .grids
                    .get(&view)
                    .ok_or_else(|| ViewServerError::NotFound(view.clone()))?;
                target.clear();
                log::info!("View {view} cleared");
                Ok(IngestOutcome::Cleared(view))
            }
            EventKind::Unknown(other) => Ok(IngestOutcome::Ignored(other)),
        }
    }

    /// Handle one raw event, logging instead of returning failures.
    pub fn process(&self, raw: &str) {
        let started = Instant::now();
        let result = self.ingest(raw);
        let elapsed = started.elapsed();

        let total = self.total_messages.fetch_add(1, Ordering::Relaxed) + 1;
        self.last_processed_ms.store(now_millis(), Ordering::Relaxed);

        match result {
            Ok(IngestOutcome::Applied(report)) => {
                self.total_cells
                    .fetch_add(report.applied as u64, Ordering::Relaxed);
                log::debug!(
                    "Processed batch: {} applied, {} frames in {}ms",
                    report.applied,
                    report.frames,
                    elapsed.as_millis()
                );
            }
            Ok(IngestOutcome::Ignored(kind)) => {
                log::warn!("Unknown event type: {kind}");
            }
            Ok(outcome) => log::debug!("Processed admin event: {outcome:?}"),
            Err(e) => {
                self.dropped.fetch_add(1, Ordering::Relaxed);
                match &e {
                    ViewServerError::MalformedInput { reason, raw } => {
                        log::warn!("Dropping malformed event: {reason}");
                        log::debug!("Malformed payload: {raw}");
                    }
                    ViewServerError::Validation { .. }
                    | ViewServerError::NotFound(_)
                    | ViewServerError::CapacityExceeded { .. } => {
                        log::warn!("Dropping event: {e}");
                    }
                    _ => log::error!("Error processing event: {e}"),
                }
            }
        }

        if elapsed > self.config.slow_batch_threshold {
            log::warn!(
                "Slow event processing: {}ms (threshold {}ms)",
                elapsed.as_millis(),
                self.config.slow_batch_threshold.as_millis()
            );
        }
        if total % STATS_LOG_INTERVAL == 0 {
            let stats = self.stats();
            log::info!(
                "Ingestion stats: {} messages, {} cells, {} dropped, {:.1} cells/message",
                stats.total_messages,
                stats.total_cells,
                stats.dropped,
                stats.average_cells_per_message()
            );
        }
    }

    /// Consume raw events until the sender side closes.
    pub async fn run(self: Arc<Self>, mut rx: mpsc::Receiver<String>) {
        log::info!("Ingestion started");
        while let Some(raw) = rx.recv().await {
            self.process(&raw);
        }
        log::info!("Event stream closed, ingestion stopped");
    }

    pub fn stats(&self) -> ProcessingStats {
        ProcessingStats {
            total_messages: self.total_messages.load(Ordering::Relaxed),
            total_cells: self.total_cells.load(Ordering::Relaxed),
            dropped: self.dropped.load(Ordering::Relaxed),
            last_processed_ms: self.last_processed_ms.load(Ordering::Relaxed),
        }
    }

    pub fn reset_stats(&self) {
        self.total_messages.store(0, Ordering::Relaxed);
        self.total_cells.store(0, Ordering::Relaxed);
        self.dropped.store(0, Ordering::Relaxed);
        self.last_processed_ms.store(now_millis(), Ordering::Relaxed);
        log::info!("Ingestion stats reset");
    }
}
