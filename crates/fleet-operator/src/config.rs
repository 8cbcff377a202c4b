//! Operator tuning knobs.

use std::time::Duration;

use uuid::Uuid;

#[derive(Debug, Clone, PartialEq)]
pub struct OperatorConfig {
    /// Interval between full reconcile passes.
    pub reconcile_period: Duration,
    /// Handler tasks allowed to run at once.
    pub max_concurrent_handlers: usize,
    /// Pending requeued objects before `requeue` starts dropping.
    pub requeue_capacity: usize,
    /// Leader lease time-to-live.
    pub lease_ttl: Duration,
    /// Identity written into the leader lease.
    pub holder: String,
}

impl Default for OperatorConfig {
    fn default() -> Self {
        Self {
            reconcile_period: Duration::from_secs(30),
            max_concurrent_handlers: 16,
            requeue_capacity: 256,
            lease_ttl: Duration::from_secs(15),
            holder: Uuid::new_v4().to_string(),
        }
    }
}

impl OperatorConfig {
    pub fn with_reconcile_period(mut self, period: Duration) -> Self {
        self.reconcile_period = period;
        self
    }

    pub fn with_max_concurrent_handlers(mut self, max: usize) -> Self {
        self.max_concurrent_handlers = max.max(1);
        self
    }

    pub fn with_requeue_capacity(mut self, capacity: usize) -> Self {
        self.requeue_capacity = capacity.max(1);
        self
    }

    pub fn with_lease_ttl(mut self, ttl: Duration) -> Self {
        self.lease_ttl = ttl;
        self
    }

    pub fn with_holder(mut self, holder: impl Into<String>) -> Self {
        self.holder = holder.into();
        self
    }
}
