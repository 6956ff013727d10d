//! Engine configuration
//!
//! Tunables for worker parallelism, file capture thresholds, heartbeats,
//! approvals and retry defaults. Values come from the embedding application;
//! the library never reads the process environment itself.

use std::path::PathBuf;
use std::time::Duration;

use crate::retry::{RetryPolicies, RetryPolicy};

/// Configuration for one engine instance.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Root under which run working directories live
    pub workdir_root: PathBuf,
    /// Max nodes executing concurrently per run (`W`)
    pub max_workers: usize,
    /// Files larger than this are never embedded
    pub file_capture_max_bytes: u64,
    /// At most this many bytes of a textual file are embedded
    pub file_embed_max_bytes: usize,
    /// How often a live supervisor stamps `last_heartbeat_at`
    pub heartbeat_interval: Duration,
    /// Missed intervals before the watchdog declares a run stalled
    pub missed_heartbeats_allowed: u32,
    /// How long an approval gate waits before failing the node
    pub approval_timeout: Duration,
    /// How long cancel waits for in-flight workers to wind down
    pub cancel_grace: Duration,
    /// Timeout applied to every external call (LLM, tool, code)
    pub call_timeout: Duration,
    /// Bounded queue length per broadcast subscriber
    pub subscriber_queue_capacity: usize,
    /// Interval between broadcast heartbeat frames
    pub broadcast_heartbeat_interval: Duration,
    /// Backoff used when persisting through a flaky store
    pub store_retry: RetryPolicy,
    /// Node retry policies by node type
    pub retries: RetryPolicies,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            workdir_root: std::env::temp_dir().join("agentflow"),
            max_workers: 2,
            file_capture_max_bytes: 1024 * 1024,
            file_embed_max_bytes: 5 * 1024,
            heartbeat_interval: Duration::from_secs(15),
            missed_heartbeats_allowed: 3,
            approval_timeout: Duration::from_secs(3600),
            cancel_grace: Duration::from_secs(5),
            call_timeout: Duration::from_secs(120),
            subscriber_queue_capacity: 256,
            broadcast_heartbeat_interval: Duration::from_secs(20),
            store_retry: RetryPolicy::new(3)
                .with_initial_backoff_ms(50)
                .with_max_backoff_ms(2_000),
            retries: RetryPolicies::new(RetryPolicy::default())
                .with_policy(crate::dag::NodeType::Approval, RetryPolicy::none())
                .with_policy(crate::dag::NodeType::Terminator, RetryPolicy::none())
                .with_policy(crate::dag::NodeType::Parallel, RetryPolicy::none()),
        }
    }
}

impl EngineConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_workdir_root(mut self, root: impl Into<PathBuf>) -> Self {
        self.workdir_root = root.into();
        self
    }

    pub fn with_max_workers(mut self, workers: usize) -> Self {
        self.max_workers = workers.max(1);
        self
    }

    pub fn with_heartbeat_interval(mut self, interval: Duration) -> Self {
        self.heartbeat_interval = interval;
        self
    }

    pub fn with_approval_timeout(mut self, timeout: Duration) -> Self {
        self.approval_timeout = timeout;
        self
    }

    pub fn with_cancel_grace(mut self, grace: Duration) -> Self {
        self.cancel_grace = grace;
        self
    }

    pub fn with_call_timeout(mut self, timeout: Duration) -> Self {
        self.call_timeout = timeout;
        self
    }

    pub fn with_retries(mut self, retries: RetryPolicies) -> Self {
        self.retries = retries;
        self
    }

    pub fn with_file_limits(mut self, capture_max_bytes: u64, embed_max_bytes: usize) -> Self {
        self.file_capture_max_bytes = capture_max_bytes;
        self.file_embed_max_bytes = embed_max_bytes;
        self
    }

    /// Working directory for one run.
    pub fn run_workdir(&self, run_id: &str) -> PathBuf {
        self.workdir_root.join(run_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dag::NodeType;

    #[test]
    fn defaults_are_sane() {
        let config = EngineConfig::default();
        assert_eq!(config.max_workers, 2);
        assert_eq!(config.file_capture_max_bytes, 1024 * 1024);
        assert_eq!(config.file_embed_max_bytes, 5 * 1024);
        assert_eq!(
            config.retries.for_node_type(NodeType::Approval).max_attempts,
            1
        );
    }

    #[test]
    fn builder_clamps_workers() {
        let config = EngineConfig::new().with_max_workers(0);
        assert_eq!(config.max_workers, 1);
    }

    #[test]
    fn run_workdir_nests_under_root() {
        let config = EngineConfig::new().with_workdir_root("/tmp/flows");
        assert_eq!(
            config.run_workdir("run-9"),
            PathBuf::from("/tmp/flows/run-9")
        );
    }
}
