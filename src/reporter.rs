//! Progress reporting
//!
//! Reporting goes through a capability object handed to the scheduler,
//! never a process-wide singleton. The default implementation logs through
//! `tracing`.

use std::time::Duration;

use tracing::{debug, error, info, warn};

use crate::error::PageError;
use crate::task::TaskResult;

/// Receives per-attempt and per-run progress callbacks.
///
/// All methods have empty defaults so implementations can pick what they
/// care about.
pub trait Reporter: Send + Sync {
    /// An attempt of a task is starting. Attempts count from 1.
    fn attempt_started(&self, _location: &str, _attempt: u32, _max_attempts: u32) {}

    /// A task produced its output.
    fn task_succeeded(
        &self,
        _result: &TaskResult,
        _attempt: u32,
        _elapsed: Duration,
        _completed: usize,
        _total: usize,
    ) {
    }

    /// An attempt failed. `will_retry` is true when another attempt follows.
    fn task_failed(
        &self,
        _error: &PageError,
        _attempt: u32,
        _max_attempts: u32,
        _elapsed: Duration,
        _will_retry: bool,
    ) {
    }

    /// The run finished; `generated` of `total` requested outputs exist.
    fn run_finished(&self, _generated: usize, _total: usize, _elapsed: Duration) {}
}

/// Reporter that logs progress through `tracing`.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingReporter;

impl Reporter for TracingReporter {
    fn attempt_started(&self, location: &str, attempt: u32, max_attempts: u32) {
        if max_attempts > 1 {
            debug!("loading {} ({}/{} attempts)", location, attempt, max_attempts);
        } else {
            debug!("loading {}", location);
        }
    }

    fn task_succeeded(
        &self,
        result: &TaskResult,
        attempt: u32,
        elapsed: Duration,
        completed: usize,
        total: usize,
    ) {
        match &result.source {
            Some(source) => info!("▶ {} ← {}", result.resolved, source),
            None => info!("▶ {}", result.resolved),
        }
        if attempt > 1 {
            info!(
                "  └─ {} (+{}ms) ({}/{}) (attempt {})",
                result.output_pathname,
                elapsed.as_millis(),
                completed,
                total,
                attempt
            );
        } else {
            info!(
                "  └─ {} (+{}ms) ({}/{})",
                result.output_pathname,
                elapsed.as_millis(),
                completed,
                total
            );
        }
        if !result.output_pathname.ends_with(".pdf") {
            warn!("{} generated without .pdf extension", result.output_pathname);
        }
    }

    fn task_failed(
        &self,
        err: &PageError,
        attempt: u32,
        max_attempts: u32,
        elapsed: Duration,
        will_retry: bool,
    ) {
        let src = err
            .source
            .as_deref()
            .map(|s| format!(" ← {}", s))
            .unwrap_or_default();
        let attempts = if max_attempts > 1 {
            format!(" ({}/{} attempts)", attempt, max_attempts)
        } else {
            String::new()
        };
        if will_retry {
            warn!(
                "✖︎ {} ({}) (+{}ms){}{}",
                err.location,
                err.title,
                elapsed.as_millis(),
                src,
                attempts
            );
        } else {
            error!(
                "✖︎ {} ({}) (+{}ms){}{}",
                err.location,
                err.title,
                elapsed.as_millis(),
                src,
                attempts
            );
        }
    }

    fn run_finished(&self, generated: usize, total: usize, elapsed: Duration) {
        if generated < total {
            let missing = total - generated;
            error!(
                "failed to generate {} file{}",
                missing,
                if missing == 1 { "" } else { "s" }
            );
        }
        info!("✓ completed in {}ms", elapsed.as_millis());
    }
}

/// No-op reporter.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullReporter;

impl Reporter for NullReporter {}
