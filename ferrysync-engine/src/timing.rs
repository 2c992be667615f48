//! Per-run operation timings.
//!
//! Each named operation accumulates min/max/total duration and
//! complete/failed counts. Once an operation has been recorded `window`
//! times its statistics are logged and reset.

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use serde::Serialize;
use tracing::info;

#[derive(Debug, Default, Clone, Copy)]
struct OpStats {
    min: Option<Duration>,
    max: Duration,
    total: Duration,
    complete: u64,
    failed: u64,
}

impl OpStats {
    fn record(&mut self, elapsed: Duration, ok: bool) {
        self.min = Some(self.min.map_or(elapsed, |m| m.min(elapsed)));
        self.max = self.max.max(elapsed);
        self.total += elapsed;
        if ok {
            self.complete += 1;
        } else {
            self.failed += 1;
        }
    }

    fn count(&self) -> u64 {
        self.complete + self.failed
    }

    fn summary(&self) -> OpSummary {
        let count = self.count();
        OpSummary {
            complete: self.complete,
            failed: self.failed,
            min_ms: self.min.unwrap_or_default().as_secs_f64() * 1000.0,
            max_ms: self.max.as_secs_f64() * 1000.0,
            avg_ms: if count == 0 {
                0.0
            } else {
                self.total.as_secs_f64() * 1000.0 / count as f64
            },
        }
    }
}

/// Point-in-time view of one operation's statistics.
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct OpSummary {
    pub complete: u64,
    pub failed: u64,
    pub min_ms: f64,
    pub max_ms: f64,
    pub avg_ms: f64,
}

pub struct RunTimings {
    window: u64,
    ops: Mutex<HashMap<&'static str, OpStats>>,
}

impl RunTimings {
    /// `window == 0` disables the periodic dump; stats still accumulate.
    pub fn new(window: u64) -> Self {
        Self { window, ops: Mutex::new(HashMap::new()) }
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<&'static str, OpStats>> {
        self.ops.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn start(&self, operation: &'static str) -> OperationTimer<'_> {
        OperationTimer { timings: self, operation, started: Instant::now(), recorded: false }
    }

    fn record(&self, operation: &'static str, elapsed: Duration, ok: bool) {
        let mut ops = self.lock();
        let stats = ops.entry(operation).or_default();
        stats.record(elapsed, ok);
        if self.window > 0 && stats.count() >= self.window {
            let summary = stats.summary();
            *stats = OpStats::default();
            drop(ops);
            log_summary(operation, &summary);
        }
    }

    pub fn summary(&self, operation: &str) -> Option<OpSummary> {
        self.lock().get(operation).map(OpStats::summary)
    }

    /// Log and reset everything recorded since the last dump.
    pub fn dump(&self) {
        let drained: Vec<(&'static str, OpStats)> = self.lock().drain().collect();
        let mut drained: Vec<_> = drained
            .into_iter()
            .filter(|(_, stats)| stats.count() > 0)
            .collect();
        drained.sort_by_key(|(name, _)| *name);
        for (operation, stats) in drained {
            log_summary(operation, &stats.summary());
        }
    }
}

fn log_summary(operation: &str, s: &OpSummary) {
    info!(
        operation,
        complete = s.complete,
        failed = s.failed,
        min_ms = format_args!("{:.1}", s.min_ms),
        max_ms = format_args!("{:.1}", s.max_ms),
        avg_ms = format_args!("{:.1}", s.avg_ms),
        "Operation timings"
    );
}

/// A started operation. Consume it with [`complete`](Self::complete) or
/// [`fail`](Self::fail); dropping it unrecorded counts as a failure, so an
/// early `?` return is still accounted for.
#[must_use = "finish the timer with complete() or fail()"]
pub struct OperationTimer<'a> {
    timings: &'a RunTimings,
    operation: &'static str,
    started: Instant,
    recorded: bool,
}

impl OperationTimer<'_> {
    pub fn complete(mut self) {
        self.finish(true);
    }

    pub fn fail(mut self) {
        self.finish(false);
    }

    fn finish(&mut self, ok: bool) {
        if !self.recorded {
            self.recorded = true;
            self.timings.record(self.operation, self.started.elapsed(), ok);
        }
    }
}

impl Drop for OperationTimer<'_> {
    fn drop(&mut self) {
        self.finish(false);
    }
}
