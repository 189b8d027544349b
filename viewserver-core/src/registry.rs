//! Bounded registry of live views.
//!
//! Views are created lazily on first use and only disappear on explicit
//! removal. The count is tracked separately from the map so the capacity
//! check never has to lock every shard while holding one of them.

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use crate::error::GridError;
use crate::view::{GridView, ViewId};

/// Aggregate statistics across every registered view.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct GridStats {
    pub view_count: usize,
    pub total_cells: usize,
    pub total_memory: u64,
}

/// Owns every [`GridView`] in the process.
pub struct GridRegistry {
    views: DashMap<ViewId, Arc<GridView>>,
    /// Views present plus in-flight creations.
    reserved: AtomicUsize,
    max_views: usize,
}

impl GridRegistry {
    pub fn new(max_views: usize) -> Self {
        Self {
            views: DashMap::new(),
            reserved: AtomicUsize::new(0),
            max_views,
        }
    }

    pub fn max_views(&self) -> usize {
        self.max_views
    }

    /// Return the view for `id`, creating an empty one if absent.
    ///
    /// Fails with [`GridError::CapacityExceeded`] when a new view would
    /// exceed the configured maximum. Existing views are always returned.
    pub fn get_or_create(
        &self,
        id: &ViewId,
        rows: u32,
        columns: u32,
    ) -> Result<Arc<GridView>, GridError> {
        self.get_or_create_with(id, rows, columns, |_| {})
    }

    /// Like [`get_or_create`](Self::get_or_create), running `init` once on a
    /// freshly created view before it becomes visible.
    pub fn get_or_create_with(
        &self,
        id: &ViewId,
        rows: u32,
        columns: u32,
        init: impl FnOnce(&GridView),
    ) -> Result<Arc<GridView>, GridError> {
        // Fast path: read-only shard lock
        if let Some(view) = self.views.get(id) {
            return Ok(view.clone());
        }

        let view = GridView::new(id.clone(), rows, columns)?;

        if self
            .reserved
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| {
                (n < self.max_views).then_some(n + 1)
            })
            .is_err()
        {
            // Another thread may have created it meanwhile.
            if let Some(view) = self.views.get(id) {
                return Ok(view.clone());
            }
            log::warn!(
                "Maximum view limit ({}) reached, cannot create view {id}",
                self.max_views
            );
            return Err(GridError::CapacityExceeded { max: self.max_views });
        }

        match self.views.entry(id.clone()) {
            Entry::Occupied(existing) => {
                self.reserved.fetch_sub(1, Ordering::AcqRel);
                Ok(existing.get().clone())
            }
            Entry::Vacant(slot) => {
                init(&view);
                let view = Arc::new(view);
                slot.insert(view.clone());
                log::info!(
                    "Created view {id} with {} rows × {} columns",
                    view.rows(),
                    view.columns()
                );
                Ok(view)
            }
        }
    }

    pub fn get(&self, id: &ViewId) -> Option<Arc<GridView>> {
        self.views.get(id).map(|v| v.clone())
    }

    /// Remove a view. Returns `false` if it was not registered.
    pub fn remove(&self, id: &ViewId) -> bool {
        if self.views.remove(id).is_some() {
            self.reserved.fetch_sub(1, Ordering::AcqRel);
            log::info!("Removed view {id}");
            true
        } else {
            false
        }
    }

    pub fn contains(&self, id: &ViewId) -> bool {
        self.views.contains_key(id)
    }

    pub fn len(&self) -> usize {
        self.views.len()
    }

    pub fn is_empty(&self) -> bool {
        self.views.is_empty()
    }

    pub fn view_ids(&self) -> Vec<ViewId> {
        self.views.iter().map(|e| e.key().clone()).collect()
    }

    pub fn stats(&self) -> GridStats {
        let views: Vec<Arc<GridView>> = self.views.iter().map(|e| e.value().clone()).collect();
        GridStats {
            view_count: views.len(),
            total_cells: views.iter().map(|v| v.cell_count()).sum(),
            total_memory: views.iter().map(|v| v.estimate_memory()).sum(),
        }
    }
}
