//! Retry policy for failed job dispatches.
//!
//! Implements capped exponential backoff with upward jitter, and keeps
//! per-job attempt bookkeeping for diagnostics.

use super::models::{now_millis, Job, JobError, JobErrorType};
use crate::config::RetrySettings;
use rand::Rng;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

/// Aggregate view of the retry bookkeeping.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RetryStats {
    /// Jobs with at least one recorded failure and no success since
    pub tracked: usize,
    /// Tracked jobs that may still be retried
    pub retryable: usize,
    /// Tracked jobs that hit a terminal error or the attempt ceiling
    pub exhausted: usize,
    /// Every attempt recorded, failed or successful
    pub total_attempts: u64,
    pub successes: u64,
}

#[derive(Debug, Clone)]
struct AttemptRecord {
    attempts: u32,
    last_error_type: JobErrorType,
}

#[derive(Debug, Default)]
struct Bookkeeping {
    records: HashMap<String, AttemptRecord>,
    total_attempts: u64,
    successes: u64,
}

/// Retry policy implementing exponential backoff.
#[derive(Debug)]
pub struct RetryPolicy {
    /// Attempts allowed before a retryable failure becomes terminal.
    pub max_attempts: u32,
    /// Delay before the first retry.
    pub base_delay_ms: u64,
    /// Cap for the delay, jitter included.
    pub max_delay_ms: u64,
    /// Upper bound of the random extra delay, as a fraction of the exponential term.
    pub jitter_ratio: f64,
    bookkeeping: Mutex<Bookkeeping>,
}

impl RetryPolicy {
    /// Create a new RetryPolicy from configuration settings.
    pub fn new(config: &RetrySettings) -> Self {
        Self {
            max_attempts: config.max_attempts,
            base_delay_ms: config.base_delay_ms,
            max_delay_ms: config.max_delay_ms,
            jitter_ratio: config.jitter_ratio,
            bookkeeping: Mutex::new(Bookkeeping::default()),
        }
    }

    /// Check if a failed job should be retried.
    ///
    /// Returns true if:
    /// - The error class is retryable (transport or timeout)
    /// - The job has made fewer than `max_attempts` attempts
    pub fn should_retry(&self, job: &Job, error: &JobError) -> bool {
        error.is_retryable() && job.attempt_count < self.max_attempts
    }

    /// Exponential part of the delay: `base * 2^attempt_count`, capped.
    pub fn base_delay(&self, attempt_count: u32) -> Duration {
        let factor = 1u64.checked_shl(attempt_count).unwrap_or(u64::MAX);
        let exp = self.base_delay_ms.saturating_mul(factor);
        Duration::from_millis(exp.min(self.max_delay_ms))
    }

    /// Delay before the next attempt, jitter included.
    ///
    /// Never exceeds `max_delay_ms` and never decreases as `attempt_count`
    /// grows: the jitter is at most the exponential term itself, which the
    /// next attempt doubles.
    pub fn calculate_delay(&self, attempt_count: u32) -> Duration {
        let unit: f64 = rand::rng().random();
        self.delay_with_jitter(attempt_count, unit)
    }

    /// `calculate_delay` with an explicit jitter sample in `[0, 1]`.
    pub fn delay_with_jitter(&self, attempt_count: u32, unit: f64) -> Duration {
        let exp = self.base_delay(attempt_count).as_millis() as u64;
        let ratio = self.jitter_ratio.clamp(0.0, 1.0);
        let jitter = (exp as f64 * ratio * unit.clamp(0.0, 1.0)) as u64;
        Duration::from_millis(exp.saturating_add(jitter).min(self.max_delay_ms))
    }

    /// Calculate the next retry timestamp (Unix millis) for a job that has
    /// made `attempt_count` attempts.
    pub fn next_retry_at(&self, attempt_count: u32) -> i64 {
        // The first retry waits the base delay
        let exponent = attempt_count.saturating_sub(1);
        now_millis() + self.calculate_delay(exponent).as_millis() as i64
    }

    /// Record a failed attempt.
    pub fn record_attempt(&self, job_id: &str, error: &JobError) {
        let mut book = self.bookkeeping.lock().unwrap();
        book.total_attempts += 1;
        let record = book
            .records
            .entry(job_id.to_string())
            .or_insert(AttemptRecord {
                attempts: 0,
                last_error_type: error.error_type,
            });
        record.attempts += 1;
        record.last_error_type = error.error_type;
    }

    /// Record a successful attempt and stop tracking the job.
    pub fn record_success(&self, job_id: &str) {
        let mut book = self.bookkeeping.lock().unwrap();
        book.total_attempts += 1;
        book.successes += 1;
        book.records.remove(job_id);
    }

    /// Drop bookkeeping for a job that no longer exists.
    pub fn forget(&self, job_id: &str) {
        self.bookkeeping.lock().unwrap().records.remove(job_id);
    }

    pub fn get_stats(&self) -> RetryStats {
        let book = self.bookkeeping.lock().unwrap();
        let exhausted = book
            .records
            .values()
            .filter(|r| !r.last_error_type.is_retryable() || r.attempts >= self.max_attempts)
            .count();
        RetryStats {
            tracked: book.records.len(),
            retryable: book.records.len() - exhausted,
            exhausted,
            total_attempts: book.total_attempts,
            successes: book.successes,
        }
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new(&RetrySettings::default())
    }
}
