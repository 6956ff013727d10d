//! Retry policies and error classification
//!
//! On node failure the scheduler classifies the error and consults a
//! per-node-type policy. Transient and rate-limited errors retry with
//! exponential backoff (capped, optionally jittered); logic errors get one
//! adaptive retry with the error folded into the prompt; fatal errors
//! short-circuit.

use std::collections::HashMap;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::dag::NodeType;
use crate::error::FlowError;

/// Classification of a failure for retry decisions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorClass {
    /// May succeed on retry (I/O, timeout, store hiccup)
    Transient,
    /// Provider throttling; retried with backoff like transient
    RateLimited,
    /// The agent produced unusable output; one adaptive retry
    Logic,
    /// Never retried
    Fatal,
}

/// Map an error to its retry class.
///
/// Structured variants classify directly; transient messages are sniffed for
/// rate-limit markers so provider throttling surfaces as `RateLimited` even
/// when reported as a generic transport failure.
pub fn classify(error: &FlowError) -> ErrorClass {
    match error {
        FlowError::RateLimited(_) => ErrorClass::RateLimited,
        FlowError::Transient(msg) | FlowError::StoreUnavailable(msg) => {
            let msg = msg.to_lowercase();
            if msg.contains("rate limit")
                || msg.contains("too many requests")
                || msg.contains("429")
            {
                ErrorClass::RateLimited
            } else {
                ErrorClass::Transient
            }
        }
        FlowError::Logic(_) => ErrorClass::Logic,
        _ => ErrorClass::Fatal,
    }
}

/// Backoff and attempt budget for one node type.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Total attempts including the first (1 = no retry)
    pub max_attempts: u32,
    /// Delay before the first retry, in milliseconds
    pub backoff_initial_ms: u64,
    /// Multiplier applied per retry (typically 2.0)
    pub backoff_multiplier: f64,
    /// Upper bound on any single delay, in milliseconds
    pub backoff_max_ms: u64,
    /// Add up to 25% random jitter to each delay
    pub jitter: bool,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            backoff_initial_ms: 500,
            backoff_multiplier: 2.0,
            backoff_max_ms: 30_000,
            jitter: true,
        }
    }
}

impl RetryPolicy {
    pub fn new(max_attempts: u32) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            ..Default::default()
        }
    }

    /// A policy that never retries.
    pub fn none() -> Self {
        Self::new(1)
    }

    pub fn with_initial_backoff_ms(mut self, ms: u64) -> Self {
        self.backoff_initial_ms = ms;
        self
    }

    pub fn with_multiplier(mut self, multiplier: f64) -> Self {
        self.backoff_multiplier = multiplier;
        self
    }

    pub fn with_max_backoff_ms(mut self, ms: u64) -> Self {
        self.backoff_max_ms = ms;
        self
    }

    pub fn with_jitter(mut self, jitter: bool) -> Self {
        self.jitter = jitter;
        self
    }

    /// Whether another attempt is allowed after `attempts_used` attempts.
    pub fn should_retry(&self, attempts_used: u32) -> bool {
        attempts_used < self.max_attempts
    }

    /// Delay before retry number `attempt` (1-based), exponential and capped.
    pub fn backoff_delay(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(31) as i32;
        let delay_ms =
            (self.backoff_initial_ms as f64 * self.backoff_multiplier.powi(exponent)) as u64;
        let delay_ms = delay_ms.min(self.backoff_max_ms);
        let delay_ms = if self.jitter {
            delay_ms + (delay_ms as f64 * 0.25 * rand::random::<f64>()) as u64
        } else {
            delay_ms
        };
        Duration::from_millis(delay_ms)
    }
}

/// Per-node-type policies with a fallback default.
#[derive(Debug, Clone, Default)]
pub struct RetryPolicies {
    default: RetryPolicy,
    by_type: HashMap<NodeType, RetryPolicy>,
}

impl RetryPolicies {
    pub fn new(default: RetryPolicy) -> Self {
        Self {
            default,
            by_type: HashMap::new(),
        }
    }

    pub fn with_policy(mut self, node_type: NodeType, policy: RetryPolicy) -> Self {
        self.by_type.insert(node_type, policy);
        self
    }

    pub fn for_node_type(&self, node_type: NodeType) -> &RetryPolicy {
        self.by_type.get(&node_type).unwrap_or(&self.default)
    }
}
