//! Configuration types.

use std::time::Duration;

/// Scheduler configuration.
#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    /// Scheduler name, used in tracing output.
    pub name: String,
    /// Upper bound on how long a `ping()` waits for its pong. `None`
    /// waits until the job terminates.
    pub ping_timeout: Option<Duration>,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            name: "jobflow".to_string(),
            ping_timeout: None,
        }
    }
}
