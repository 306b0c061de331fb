use parking_lot::Mutex;
use std::sync::Arc;

/// Mutations performed by a single rule pass
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct RulePassSummary {
    /// New (destination, source) relationships, written as filter + shape
    pub created: usize,
    /// Same source identity, new characteristics: shape only
    pub updated: usize,
    /// Source identity changed: moved to the adjacent slot
    pub replaced: usize,
    /// Stale keys removed from the store
    pub collected: usize,
}

impl RulePassSummary {
    pub fn mutations(&self) -> usize {
        self.created + self.updated + self.replaced + self.collected
    }

    pub fn is_noop(&self) -> bool {
        self.mutations() == 0
    }
}

#[derive(Clone, Debug)]
pub struct RuleStatsTracker {
    inner: Arc<Mutex<RuleStatsInner>>,
}

#[derive(Debug, Default)]
struct RuleStatsInner {
    passes: usize,
    totals: RulePassSummary,
    flow_rate_updates: usize,
    transactions: u64,
    last_transaction_id: Option<u64>,
}

impl Default for RuleStatsTracker {
    fn default() -> Self {
        Self::new()
    }
}

impl RuleStatsTracker {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Mutex::new(RuleStatsInner::default())),
        }
    }

    pub fn track_pass(&self, summary: &RulePassSummary) {
        let mut inner = self.inner.lock();
        inner.passes += 1;
        inner.totals.created += summary.created;
        inner.totals.updated += summary.updated;
        inner.totals.replaced += summary.replaced;
        inner.totals.collected += summary.collected;
    }

    pub fn track_flow_rate_update(&self) {
        self.inner.lock().flow_rate_updates += 1;
    }

    pub fn track_transaction(&self, id: u64) {
        let mut inner = self.inner.lock();
        inner.transactions += 1;
        inner.last_transaction_id = Some(id);
    }

    pub fn snapshot(&self) -> RuleStats {
        let inner = self.inner.lock();
        RuleStats {
            passes: inner.passes,
            totals: inner.totals,
            flow_rate_updates: inner.flow_rate_updates,
            transactions: inner.transactions,
            last_transaction_id: inner.last_transaction_id,
        }
    }
}

/// Totals accumulated across rule passes
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RuleStats {
    pub passes: usize,
    pub totals: RulePassSummary,
    pub flow_rate_updates: usize,
    pub transactions: u64,
    pub last_transaction_id: Option<u64>,
}
