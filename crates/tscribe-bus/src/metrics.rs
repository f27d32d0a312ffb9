//! Bus metrics.
//!
//! - Publish attempts and failures by topic
//! - Retries and backoff delays
//! - Duplicate deliveries suppressed by the idempotency guard
//! - Handled deliveries by outcome

use metrics::{counter, histogram};

// =============================================================================
// Metric Names
// =============================================================================

pub mod names {
    /// Publish attempts by topic.
    pub const PUBLISH_ATTEMPTS_TOTAL: &str = "tscribe_publish_attempts_total";

    /// Publishes that gave up, by topic and reason.
    pub const PUBLISH_FAILURES_TOTAL: &str = "tscribe_publish_failures_total";

    /// Retried publish attempts by topic.
    pub const PUBLISH_RETRIES_TOTAL: &str = "tscribe_publish_retries_total";

    /// Backoff delay before a retry, in seconds.
    pub const PUBLISH_BACKOFF_SECONDS: &str = "tscribe_publish_backoff_seconds";

    /// Deliveries dropped as duplicates.
    pub const DUPLICATES_SUPPRESSED_TOTAL: &str = "tscribe_duplicates_suppressed_total";

    /// Handled deliveries by topic and outcome.
    pub const DELIVERIES_TOTAL: &str = "tscribe_deliveries_total";
}

// =============================================================================
// Recording Functions
// =============================================================================

pub fn record_publish_attempt(topic: &str) {
    counter!(names::PUBLISH_ATTEMPTS_TOTAL, "topic" => topic.to_string()).increment(1);
}

pub fn record_publish_failure(topic: &str, reason: &'static str) {
    counter!(
        names::PUBLISH_FAILURES_TOTAL,
        "topic" => topic.to_string(),
        "reason" => reason
    )
    .increment(1);
}

pub fn record_retry(topic: &str, delay_ms: u64) {
    counter!(names::PUBLISH_RETRIES_TOTAL, "topic" => topic.to_string()).increment(1);
    histogram!(names::PUBLISH_BACKOFF_SECONDS, "topic" => topic.to_string())
        .record(delay_ms as f64 / 1000.0);
}

pub fn record_duplicate() {
    counter!(names::DUPLICATES_SUPPRESSED_TOTAL).increment(1);
}

pub fn record_delivery(topic: &str, outcome: &'static str) {
    counter!(
        names::DELIVERIES_TOTAL,
        "topic" => topic.to_string(),
        "outcome" => outcome
    )
    .increment(1);
}
