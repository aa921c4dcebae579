use std::time::Duration;

/// Controller-wide tunables. Per-queue pacing lives in
/// [`QueueSettings`](crate::QueueSettings).
#[derive(Debug, Clone)]
pub struct AdmissionConfig {
    /// Validity window of a token, from enqueue and again from admission.
    pub entry_ttl: Duration,
    /// How often a subscription re-pushes status.
    pub push_interval: Duration,
    /// Absolute lifetime of a subscription.
    pub stream_timeout: Duration,
    /// Period of the background admission loop.
    pub tick_interval: Duration,
    /// How long an EXPIRED or LEFT entry stays queryable before the
    /// admission loop drops it.
    pub entry_retention: Duration,
}

impl Default for AdmissionConfig {
    fn default() -> Self {
        Self {
            entry_ttl: Duration::from_secs(600),
            push_interval: Duration::from_secs(3),
            stream_timeout: Duration::from_secs(300),
            tick_interval: Duration::from_secs(1),
            entry_retention: Duration::from_secs(300),
        }
    }
}
