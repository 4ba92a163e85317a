use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;
use tracing::info;

use crate::gateway::GatewayError;

/// Remote store call counters, one set per `ActionGateway`.
#[derive(Debug, Default)]
pub struct GatewayMetrics {
    pub total_calls: AtomicU64,
    pub successes: AtomicU64,
    pub timeouts: AtomicU64,
    pub rejections: AtomicU64,
    pub network_failures: AtomicU64,
    pub not_found: AtomicU64,
    pub cancelled: AtomicU64,
    pub retries: AtomicU64,
}

impl GatewayMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_call(&self) {
        self.total_calls.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_retry(&self) {
        self.retries.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_outcome<T>(&self, outcome: &Result<T, GatewayError>) {
        let counter = match outcome {
            Ok(_) => &self.successes,
            Err(GatewayError::Timeout { .. }) => &self.timeouts,
            Err(GatewayError::Rejected { .. }) | Err(GatewayError::Misconfigured { .. }) => &self.rejections,
            Err(GatewayError::NetworkFailure { .. }) => &self.network_failures,
            Err(GatewayError::NotFound { .. }) => &self.not_found,
            Err(GatewayError::Cancelled) => &self.cancelled,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn get_stats(&self) -> GatewayStats {
        GatewayStats {
            total_calls: self.total_calls.load(Ordering::Relaxed),
            successes: self.successes.load(Ordering::Relaxed),
            timeouts: self.timeouts.load(Ordering::Relaxed),
            rejections: self.rejections.load(Ordering::Relaxed),
            network_failures: self.network_failures.load(Ordering::Relaxed),
            not_found: self.not_found.load(Ordering::Relaxed),
            cancelled: self.cancelled.load(Ordering::Relaxed),
            retries: self.retries.load(Ordering::Relaxed),
        }
    }

    pub fn log_stats(&self) {
        let stats = self.get_stats();
        info!(
            "Gateway metrics: calls={}, ok={}, timeouts={}, rejected={}, network={}, not_found={}, cancelled={}, retries={}",
            stats.total_calls,
            stats.successes,
            stats.timeouts,
            stats.rejections,
            stats.network_failures,
            stats.not_found,
            stats.cancelled,
            stats.retries
        );
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GatewayStats {
    pub total_calls: u64,
    pub successes: u64,
    pub timeouts: u64,
    pub rejections: u64,
    pub network_failures: u64,
    pub not_found: u64,
    pub cancelled: u64,
    pub retries: u64,
}

/// Time an operation and log its duration when finished
pub struct OperationTimer {
    operation: String,
    start: Instant,
}

impl OperationTimer {
    pub fn new(operation: &str) -> Self {
        Self {
            operation: operation.to_string(),
            start: Instant::now(),
        }
    }

    pub fn finish(self) -> u128 {
        let duration_ms = self.start.elapsed().as_millis();
        info!(
            operation = %self.operation,
            duration_ms = duration_ms,
            "Operation completed"
        );
        duration_ms
    }
}
