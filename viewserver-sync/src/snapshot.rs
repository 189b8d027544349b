//! Chunked snapshot transfer to a single subscriber.
//!
//! ```text
//!  Start ──► Streaming(0) ──► Streaming(1) ──► … ──► Done
//!    │            │                 │
//!    └────────────┴─────────────────┴──────────────► Aborted
//! ```
//!
//! One `INITIAL_LOAD_START`, then ⌈N/C⌉ `INITIAL_LOAD_CHUNK` frames (at
//! least one, even for an empty view). The last chunk carries
//! `isLast = true`; there is no separate completion frame. A failed send
//! ends the transfer; chunks already sent stay sent.

use std::sync::Arc;
use std::time::Duration;
use viewserver_core::{GridRegistry, GridView, ViewId};

use crate::error::{TransportError, ViewServerError};
use crate::protocol::{LoadChunk, LoadStart, OutboundMessage};
use crate::subscription::SubscriberHandle;

#[derive(Debug, Clone)]
pub struct SnapshotConfig {
    /// Cells per chunk. Zero is treated as one.
    pub chunk_size: usize,
    /// Fixed pause between consecutive chunk sends.
    pub chunk_pause: Option<Duration>,
}

impl Default for SnapshotConfig {
    fn default() -> Self {
        Self {
            chunk_size: 1000,
            chunk_pause: Some(Duration::from_millis(5)),
        }
    }
}

impl SnapshotConfig {
    /// Small chunks, no throttle.
    pub fn for_testing() -> Self {
        Self {
            chunk_size: 5,
            chunk_pause: None,
        }
    }

    pub fn effective_chunk_size(&self) -> usize {
        self.chunk_size.max(1)
    }
}

/// Progress of one transfer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SnapshotState {
    Start,
    Streaming { next_chunk: usize },
    Done,
    Aborted(TransportError),
}

impl SnapshotState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Done | Self::Aborted(_))
    }
}

/// Outcome of a finished transfer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SnapshotReport {
    pub view: ViewId,
    pub total_cells: usize,
    pub total_chunks: usize,
    pub chunks_sent: usize,
    pub state: SnapshotState,
}

impl SnapshotReport {
    pub fn is_complete(&self) -> bool {
        self.state == SnapshotState::Done
    }
}

pub struct SnapshotDelivery {
    registry: Arc<GridRegistry>,
    config: SnapshotConfig,
}

impl SnapshotDelivery {
    pub fn new(registry: Arc<GridRegistry>, config: SnapshotConfig) -> Self {
        Self { registry, config }
    }

    pub fn config(&self) -> &SnapshotConfig {
        &self.config
    }

    /// Stream the current contents of `view_id` to `handle`.
    ///
    /// The view must already exist. Transport failures end the transfer
    /// in [`SnapshotState::Aborted`] and are reported, not returned.
    pub async fn deliver(
        &self,
        view_id: &ViewId,
        handle: &dyn SubscriberHandle,
    ) -> Result<SnapshotReport, ViewServerError> {
        let view = self
            .registry
            .get(view_id)
            .ok_or_else(|| ViewServerError::NotFound(view_id.clone()))?;
        self.stream(&view, handle).await
    }

    /// Stream an already resolved view.
    pub async fn stream(
        &self,
        view: &GridView,
        handle: &dyn SubscriberHandle,
    ) -> Result<SnapshotReport, ViewServerError> {
        let chunk_size = self.config.effective_chunk_size();
        let cells = view.all_cells();
        // Always at least one chunk so the receiver sees isLast.
        let total_chunks = cells.len().div_ceil(chunk_size).max(1);

        let mut report = SnapshotReport {
            view: view.id().clone(),
            total_cells: cells.len(),
            total_chunks,
            chunks_sent: 0,
            state: SnapshotState::Start,
        };

        log::info!(
            "Starting snapshot of view {} to handle {}: {} cells in {} chunks",
            view.id(),
            handle.id(),
            cells.len(),
            total_chunks
        );

        let start = OutboundMessage::InitialLoadStart(LoadStart {
            grid_id: view.id(),
            rows: view.rows(),
            columns: view.columns(),
            total_cells: cells.len(),
            chunk_size,
        })
        .encode()?;
        if let Err(e) = handle.send(start) {
            return Ok(Self::abort(report, e));
        }
        report.state = SnapshotState::Streaming { next_chunk: 0 };

        let mut chunks = cells.chunks(chunk_size);
        for chunk_index in 0..total_chunks {
            let slice = chunks.next().unwrap_or(&[]);
            let payload = OutboundMessage::InitialLoadChunk(LoadChunk {
                grid_id: view.id(),
                chunk_index,
                is_last: chunk_index + 1 == total_chunks,
                cells: slice,
            })
            .encode()?;

            if let Err(e) = handle.send(payload) {
                return Ok(Self::abort(report, e));
            }
            report.chunks_sent += 1;
            report.state = SnapshotState::Streaming {
                next_chunk: chunk_index + 1,
            };
            log::trace!(
                "Sent chunk {}/{} ({} cells) of view {}",
                chunk_index + 1,
                total_chunks,
                slice.len(),
                view.id()
            );

            if chunk_index + 1 < total_chunks {
                match self.config.chunk_pause {
                    Some(pause) => tokio::time::sleep(pause).await,
                    // Lets a cancelled transfer stop between chunks.
                    None => tokio::task::yield_now().await,
                }
            }
        }

        report.state = SnapshotState::Done;
        log::info!(
            "Completed snapshot of view {} to handle {}",
            view.id(),
            handle.id()
        );
        Ok(report)
    }

    fn abort(mut report: SnapshotReport, error: TransportError) -> SnapshotReport {
        log::info!(
            "Snapshot of view {} aborted after {}/{} chunks: {error}",
            report.view,
            report.chunks_sent,
            report.total_chunks
        );
        report.state = SnapshotState::Aborted(error);
        report
    }
}
