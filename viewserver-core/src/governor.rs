//! Size governance for change batches.
//!
//! Two independent budgets apply: one to batches arriving from the event
//! stream (ingestion) and one to frames sent to subscribers (egress). An
//! ingestion batch may legally be larger than any single egress frame, so
//! one incoming batch can expand into several outgoing frames.
//!
//! Sizes are estimated, never measured: a fixed overhead plus a fixed cost
//! per change.
//!
//! ```text
//! ingest batch (≤ 500)          egress frames (≤ 50 each)
//! ┌──────────────────┐  split   ┌────┐┌────┐┌────┐
//! │ c0 c1 … c119     │ ───────► │ 50 ││ 50 ││ 20 │
//! └──────────────────┘          └────┘└────┘└────┘
//! ```

use std::fmt;

/// Fixed envelope cost of any batch (JSON structure, metadata).
pub const BASE_OVERHEAD_BYTES: usize = 200;
/// Estimated serialized size of one change.
pub const PER_CHANGE_BYTES: usize = 100;
/// Batches at or below this many changes classify as [`SizeClass::Small`].
pub const SMALL_BATCH_MAX: usize = 10;

/// Count and byte limits for one side of the pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Budget {
    pub max_count: usize,
    /// Hard limit; an estimate must stay strictly below it.
    pub max_bytes: usize,
    /// Preferred ceiling; exceeding it is legal but classified as large.
    pub target_bytes: usize,
}

impl Budget {
    /// Upstream batches: 500 changes, < 100KB, 20KB preferred.
    pub const INGESTION: Budget = Budget {
        max_count: 500,
        max_bytes: 100_000,
        target_bytes: 20_000,
    };

    /// Subscriber frames: 50 changes, < 64KiB, ~5KB preferred.
    pub const EGRESS: Budget = Budget {
        max_count: 50,
        max_bytes: 64 * 1024,
        target_bytes: 5_400,
    };
}

/// Which limit a rejected batch violated.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BudgetViolation {
    TooManyChanges { count: usize, max_count: usize },
    TooManyBytes { estimated: usize, max_bytes: usize },
}

impl fmt::Display for BudgetViolation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::TooManyChanges { count, max_count } => {
                write!(f, "{count} changes exceeds max {max_count}")
            }
            Self::TooManyBytes { estimated, max_bytes } => {
                write!(f, "~{estimated} bytes exceeds limit {max_bytes}")
            }
        }
    }
}

/// Monitoring classification of a batch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SizeClass {
    Empty,
    Small,
    Normal,
    Medium,
    Large,
    Oversized,
}

impl SizeClass {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Empty => "EMPTY",
            Self::Small => "SMALL",
            Self::Normal => "NORMAL",
            Self::Medium => "MEDIUM",
            Self::Large => "LARGE",
            Self::Oversized => "OVERSIZED",
        }
    }
}

impl fmt::Display for SizeClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Validates, classifies and splits batches against the two budgets.
#[derive(Debug, Clone)]
pub struct SizeGovernor {
    ingestion: Budget,
    egress: Budget,
}

impl Default for SizeGovernor {
    fn default() -> Self {
        Self::new(Budget::INGESTION, Budget::EGRESS)
    }
}

impl SizeGovernor {
    pub fn new(ingestion: Budget, egress: Budget) -> Self {
        Self { ingestion, egress }
    }

    pub fn ingestion(&self) -> &Budget {
        &self.ingestion
    }

    pub fn egress(&self) -> &Budget {
        &self.egress
    }

    /// `BASE_OVERHEAD_BYTES + PER_CHANGE_BYTES × count`.
    pub fn estimate_bytes<T>(&self, changes: &[T]) -> usize {
        BASE_OVERHEAD_BYTES + PER_CHANGE_BYTES * changes.len()
    }

    /// Check a batch against `budget`, reporting the first violated limit.
    pub fn check<T>(&self, changes: &[T], budget: &Budget) -> Result<(), BudgetViolation> {
        if changes.len() > budget.max_count {
            return Err(BudgetViolation::TooManyChanges {
                count: changes.len(),
                max_count: budget.max_count,
            });
        }
        let estimated = self.estimate_bytes(changes);
        if estimated >= budget.max_bytes {
            return Err(BudgetViolation::TooManyBytes {
                estimated,
                max_bytes: budget.max_bytes,
            });
        }
        Ok(())
    }

    /// `count ≤ max_count` and `estimated bytes < max_bytes`.
    pub fn validate<T>(&self, changes: &[T], budget: &Budget) -> bool {
        self.check(changes, budget).is_ok()
    }

    pub fn is_within_target<T>(&self, changes: &[T], budget: &Budget) -> bool {
        changes.is_empty() || self.estimate_bytes(changes) <= budget.target_bytes
    }

    /// Classify a batch for monitoring.
    ///
    /// Byte thresholds come from the ingestion budget; the medium threshold
    /// is the egress frame count, i.e. a batch that will need splitting.
    pub fn classify<T>(&self, changes: &[T]) -> SizeClass {
        if changes.is_empty() {
            return SizeClass::Empty;
        }
        let size = self.estimate_bytes(changes);
        let count = changes.len();
        if size > self.ingestion.max_bytes {
            SizeClass::Oversized
        } else if size > self.ingestion.target_bytes {
            SizeClass::Large
        } else if count > self.egress.max_count {
            SizeClass::Medium
        } else if count <= SMALL_BATCH_MAX {
            SizeClass::Small
        } else {
            SizeClass::Normal
        }
    }

    /// Split into ordered sub-batches of at most `max_count` changes.
    ///
    /// Concatenating the result reproduces the input in order. An empty
    /// input yields no sub-batches; a `max_count` of zero is treated as one.
    pub fn split<T: Clone>(&self, changes: &[T], max_count: usize) -> Vec<Vec<T>> {
        changes
            .chunks(max_count.max(1))
            .map(<[T]>::to_vec)
            .collect()
    }

    /// Split for subscriber delivery using the egress budget.
    pub fn split_for_egress<T: Clone>(&self, changes: &[T]) -> Vec<Vec<T>> {
        self.split(changes, self.egress.max_count)
    }

    /// Log size and classification of a batch seen at `source`.
    pub fn log_batch_stats<T>(&self, changes: &[T], source: &str) {
        let size = self.estimate_bytes(changes);
        let class = self.classify(changes);
        log::debug!(
            "Batch from {source}: {} changes, ~{size} bytes, classification: {class}",
            changes.len()
        );
        match class {
            SizeClass::Oversized => {
                log::error!("OVERSIZED batch from {source}: {} changes, ~{size} bytes", changes.len());
            }
            SizeClass::Large => {
                log::warn!("Large batch from {source}: {} changes, ~{size} bytes", changes.len());
            }
            _ => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn batch(n: usize) -> Vec<usize> {
        (0..n).collect()
    }

    #[test]
    fn test_estimate_bytes() {
        let g = SizeGovernor::default();
        assert_eq!(g.estimate_bytes::<u8>(&[]), 200);
        assert_eq!(g.estimate_bytes(&batch(500)), 50_200);
    }

    #[test]
    fn test_validate_count_limit() {
        let g = SizeGovernor::default();
        assert!(g.validate(&batch(500), g.ingestion()));
        assert!(!g.validate(&batch(501), g.ingestion()));
        assert!(g.validate(&batch(50), g.egress()));
        assert!(!g.validate(&batch(51), g.egress()));
    }

    #[test]
    fn test_validate_byte_limit_is_strict() {
        // 200 + 100 × 8 = 1000: equal to the hard limit is rejected.
        let budget = Budget { max_count: 100, max_bytes: 1000, target_bytes: 500 };
        let g = SizeGovernor::default();
        assert!(g.validate(&batch(7), &budget));
        assert_eq!(
            g.check(&batch(8), &budget),
            Err(BudgetViolation::TooManyBytes { estimated: 1000, max_bytes: 1000 })
        );
    }

    #[test]
    fn test_check_reports_count_first() {
        let g = SizeGovernor::default();
        assert_eq!(
            g.check(&batch(2000), g.ingestion()),
            Err(BudgetViolation::TooManyChanges { count: 2000, max_count: 500 })
        );
    }

    #[test]
    fn test_classify_thresholds() {
        let g = SizeGovernor::default();
        assert_eq!(g.classify::<u8>(&[]), SizeClass::Empty);
        assert_eq!(g.classify(&batch(1)), SizeClass::Small);
        assert_eq!(g.classify(&batch(10)), SizeClass::Small);
        assert_eq!(g.classify(&batch(11)), SizeClass::Normal);
        assert_eq!(g.classify(&batch(50)), SizeClass::Normal);
        assert_eq!(g.classify(&batch(51)), SizeClass::Medium);
        assert_eq!(g.classify(&batch(198)), SizeClass::Medium);
        // 200 + 100 × 199 = 20_100 > 20_000 target
        assert_eq!(g.classify(&batch(199)), SizeClass::Large);
        // 200 + 100 × 999 = 100_100 > 100_000 limit
        assert_eq!(g.classify(&batch(999)), SizeClass::Oversized);
    }

    #[test]
    fn test_split_preserves_order() {
        let g = SizeGovernor::default();
        let input = batch(120);
        let parts = g.split(&input, 50);
        let sizes: Vec<usize> = parts.iter().map(Vec::len).collect();
        assert_eq!(sizes, vec![50, 50, 20]);
        let rejoined: Vec<usize> = parts.concat();
        assert_eq!(rejoined, input);
    }

    #[test]
    fn test_split_roundtrip_various_sizes() {
        let g = SizeGovernor::default();
        for m in [0usize, 1, 7, 49, 50, 51, 100, 333] {
            for k in [1usize, 3, 50] {
                let input = batch(m);
                let parts = g.split(&input, k);
                assert_eq!(parts.len(), m.div_ceil(k));
                assert!(parts.iter().all(|p| !p.is_empty() && p.len() <= k));
                assert_eq!(parts.concat(), input);
            }
        }
    }

    #[test]
    fn test_split_is_idempotent() {
        let g = SizeGovernor::default();
        let input = batch(75);
        assert_eq!(g.split(&input, 25), g.split(&input, 25));
        // Re-splitting a sub-batch is a no-op.
        let first = g.split(&input, 25).remove(0);
        assert_eq!(g.split(&first, 25), vec![first.clone()]);
    }

    #[test]
    fn test_split_zero_max_count() {
        let g = SizeGovernor::default();
        assert_eq!(g.split(&batch(3), 0).len(), 3);
    }

    #[test]
    fn test_within_target() {
        let g = SizeGovernor::default();
        assert!(g.is_within_target(&batch(198), g.ingestion()));
        assert!(!g.is_within_target(&batch(199), g.ingestion()));
    }
}
