//! Delta fan-out: apply a change batch to a view and broadcast it.
//!
//! ```text
//! batch ─► validate(ingestion) ─► lookup view ─► apply in order
//!                                                     │
//!            subscribers ◄─ broadcast ◄─ encode ◄─ split(egress)
//! ```
//!
//! One ingestion batch may expand into several egress frames; every
//! subscriber receives them in order.

use std::sync::Arc;
use viewserver_core::{CellChange, GridRegistry, SizeGovernor, ViewId};

use crate::error::ViewServerError;
use crate::protocol::{DeltaUpdate, OutboundMessage};
use crate::subscription::SubscriptionRegistry;

/// Whether a batch is written to the store when nobody is watching.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum ApplyPolicy {
    /// Always apply; skip only the broadcast when unobserved.
    #[default]
    Always,
    /// Skip the batch entirely when the view has no subscribers.
    OnlyWhenObserved,
}

/// What one batch did.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FanoutReport {
    /// Changes written to the store.
    pub applied: usize,
    /// Changes skipped as out of bounds.
    pub rejected: usize,
    /// Egress frames broadcast.
    pub frames: usize,
    /// Successful per-handle sends across all frames.
    pub sent: usize,
    /// Failed per-handle sends across all frames.
    pub failed: usize,
}

pub struct DeltaFanout {
    grids: Arc<GridRegistry>,
    subscriptions: Arc<SubscriptionRegistry>,
    governor: Arc<SizeGovernor>,
    policy: ApplyPolicy,
}

impl DeltaFanout {
    pub fn new(
        grids: Arc<GridRegistry>,
        subscriptions: Arc<SubscriptionRegistry>,
        governor: Arc<SizeGovernor>,
        policy: ApplyPolicy,
    ) -> Self {
        Self {
            grids,
            subscriptions,
            governor,
            policy,
        }
    }

    pub fn policy(&self) -> ApplyPolicy {
        self.policy
    }

    /// Validate, apply and broadcast one batch for `view_id`.
    ///
    /// A batch over the ingestion budget or for an unknown view is refused
    /// before any cell is touched.
    pub fn apply(
        &self,
        view_id: &ViewId,
        changes: &[CellChange],
    ) -> Result<FanoutReport, ViewServerError> {
        self.governor
            .check(changes, self.governor.ingestion())
            .map_err(|violation| ViewServerError::Validation {
                view: view_id.clone(),
                violation,
            })?;
        self.governor.log_batch_stats(changes, view_id.as_str());

        let view = self
            .grids
            .get(view_id)
            .ok_or_else(|| ViewServerError::NotFound(view_id.clone()))?;

        if self.policy == ApplyPolicy::OnlyWhenObserved
            && self.subscriptions.subscriber_count(view_id) == 0
        {
            log::debug!("No subscribers for view {view_id}, skipping {} changes", changes.len());
            return Ok(FanoutReport::default());
        }

        let mut report = FanoutReport::default();
        let mut applied = Vec::with_capacity(changes.len());
        for change in changes {
            match view.set_cell(change.row, change.column, change.value.clone()) {
                Ok(()) => applied.push(change.clone()),
                Err(e) => {
                    log::warn!("Skipping change for view {view_id}: {e}");
                    report.rejected += 1;
                }
            }
        }
        report.applied = applied.len();
        if !view.is_within_memory_limits() {
            log::warn!(
                "View {view_id} exceeds its memory ceiling: ~{} bytes in {} cells",
                view.estimate_memory(),
                view.cell_count()
            );
        }

        // Counted after the writes: a handle that subscribed while they ran
        // may have copied its snapshot before them and needs the deltas.
        if applied.is_empty() || self.subscriptions.subscriber_count(view_id) == 0 {
            log::trace!("Applied {} changes to unobserved view {view_id}", report.applied);
            return Ok(report);
        }

        for frame in self.governor.split_for_egress(&applied) {
            let payload = OutboundMessage::CellUpdate(DeltaUpdate {
                grid_id: view_id,
                updates: &frame,
            })
            .encode()?;
            let outcome = self.subscriptions.broadcast(view_id, &payload);
            report.frames += 1;
            report.sent += outcome.sent;
            report.failed += outcome.failed;
        }

        log::debug!(
            "Fan-out for view {view_id}: {} applied in {} frames, {} sent, {} failed",
            report.applied,
            report.frames,
            report.sent,
            report.failed
        );
        Ok(report)
    }
}
