//! Deferred-retry backoff and poison-pill policy.

use std::time::Duration;

use rand::Rng;

/// Retry schedule for deferred and preempted deployments.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Base delay of the capped exponential schedule.
    pub base: Duration,
    /// Upper bound on the schedule.
    pub cap: Duration,
    /// Fixed re-enqueue delay for freshly preempted deployments, so they
    /// do not immediately contend with the deployment that evicted them.
    pub preempt_requeue_delay: Duration,
    /// Deferral count after which a deployment is failed as unschedulable.
    pub max_attempts: i32,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            base: Duration::from_millis(5_000),
            cap: Duration::from_millis(60_000),
            preempt_requeue_delay: Duration::from_millis(2_000),
            max_attempts: 20,
        }
    }
}

impl RetryPolicy {
    /// Delay before retry number `attempt` (1-based):
    /// `min(base * 2^(attempt-1), cap)` plus up to 20% jitter.
    pub fn backoff_delay(&self, attempt: i32) -> Duration {
        let exponent = attempt.max(1).min(16) as u32 - 1;
        let base_ms = self.base.as_millis() as u64;
        let scheduled = base_ms
            .saturating_mul(1u64 << exponent)
            .min(self.cap.as_millis() as u64);
        let jitter = rand::thread_rng().gen_range(0..=scheduled / 5);
        Duration::from_millis(scheduled + jitter)
    }

    /// Whether a deferral at this attempt count is the poison-pill point.
    pub fn is_exhausted(&self, attempt: i32) -> bool {
        attempt >= self.max_attempts
    }
}
