use std::time::Duration;

use super::retry::RetryPolicy;

/// Tunables for the in-process runtime. `Default` matches production use;
/// tests shorten the intervals.
#[derive(Debug, Clone)]
pub struct RuntimeOptions {
    /// Sleep between polls of an empty provider queue.
    pub poll_idle_sleep: Duration,
    /// An instance with no inbound messages for this long releases its task.
    pub idle_dehydrate: Duration,
    /// Maximum completions folded into history before the next replay.
    pub completion_batch_limit: usize,
    /// Backoff for transient activity failures.
    pub activity_retry: RetryPolicy,
    /// Upper bound for a single activity attempt; exceeding it is a transient failure.
    pub activity_timeout: Duration,
    pub max_concurrent_activities: usize,
    /// Back-off after the history store rejected an append.
    pub store_retry_delay: Duration,
}

impl Default for RuntimeOptions {
    fn default() -> Self {
        Self {
            poll_idle_sleep: Duration::from_millis(10),
            idle_dehydrate: Duration::from_millis(1000),
            completion_batch_limit: 128,
            activity_retry: RetryPolicy::exponential(),
            activity_timeout: Duration::from_secs(30),
            max_concurrent_activities: 16,
            store_retry_delay: Duration::from_millis(200),
        }
    }
}
