//! Run statistics
//!
//! The tracker is folded once per probe. Every counter update is O(1); the
//! time-derived fields (elapsed, throughput, ETA) are recomputed from the
//! clock on demand.

use crate::proxy::models::{ProbeOutcome, ProxyKind, ProxyResult};
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::BTreeMap;
use std::time::{Duration, Instant};

/// Aggregate view of a run
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RunStatistics {
    pub total: usize,
    pub pending: usize,
    pub checking: usize,
    pub live: usize,
    pub dead: usize,
    pub errors: usize,
    /// Completed checks per resolved kind
    pub kind_counts: BTreeMap<ProxyKind, usize>,
    /// `live / completed * 100`
    pub success_rate: f64,
    /// Mean latency of live proxies in milliseconds
    pub average_latency_ms: f64,
    pub checks_per_second: f64,
    pub elapsed: Duration,
    pub estimated_remaining: Duration,
    pub thread_count: usize,
    pub started_at: DateTime<Utc>,
}

impl Default for RunStatistics {
    fn default() -> Self {
        Self {
            total: 0,
            pending: 0,
            checking: 0,
            live: 0,
            dead: 0,
            errors: 0,
            kind_counts: BTreeMap::new(),
            success_rate: 0.0,
            average_latency_ms: 0.0,
            checks_per_second: 0.0,
            elapsed: Duration::ZERO,
            estimated_remaining: Duration::ZERO,
            thread_count: 0,
            started_at: Utc::now(),
        }
    }
}

impl RunStatistics {
    pub fn completed(&self) -> usize {
        self.live + self.dead + self.errors
    }

    /// `pending + checking + live + dead + errors == total`
    pub fn is_consistent(&self) -> bool {
        self.pending + self.checking + self.completed() == self.total
    }

    /// Rebuild the counters from a result set.
    ///
    /// Time-derived fields are left at zero; compare with
    /// [`RunStatistics::same_counters`].
    pub fn recompute(results: &[ProxyResult], total: usize) -> Self {
        let mut stats = Self {
            total,
            ..Self::default()
        };
        let mut latency_sum = 0u64;

        for result in results {
            match result.outcome {
                ProbeOutcome::Pending => continue,
                ProbeOutcome::Checking => {
                    stats.checking += 1;
                    continue;
                }
                ProbeOutcome::Live => {
                    stats.live += 1;
                    latency_sum += result.latency_ms;
                }
                ProbeOutcome::Dead => stats.dead += 1,
                ProbeOutcome::Error => stats.errors += 1,
            }
            *stats.kind_counts.entry(result.kind).or_insert(0) += 1;
        }

        stats.pending = total.saturating_sub(stats.checking + stats.completed());
        stats.success_rate = success_rate(stats.live, stats.completed());
        stats.average_latency_ms = mean(latency_sum, stats.live as u64);
        stats
    }

    /// Equality of everything that does not depend on the clock
    pub fn same_counters(&self, other: &RunStatistics) -> bool {
        self.total == other.total
            && self.pending == other.pending
            && self.checking == other.checking
            && self.live == other.live
            && self.dead == other.dead
            && self.errors == other.errors
            && self.kind_counts == other.kind_counts
            && self.success_rate == other.success_rate
            && self.average_latency_ms == other.average_latency_ms
    }
}

fn success_rate(live: usize, completed: usize) -> f64 {
    if completed == 0 {
        0.0
    } else {
        live as f64 / completed as f64 * 100.0
    }
}

fn mean(sum: u64, count: u64) -> f64 {
    if count == 0 {
        0.0
    } else {
        sum as f64 / count as f64
    }
}

#[derive(Debug)]
struct TrackerState {
    stats: RunStatistics,
    started: Instant,
    frozen_at: Option<Instant>,
    latency_sum: u64,
}

impl TrackerState {
    fn new(total: usize, thread_count: usize) -> Self {
        Self {
            stats: RunStatistics {
                total,
                pending: total,
                thread_count,
                ..RunStatistics::default()
            },
            started: Instant::now(),
            frozen_at: None,
            latency_sum: 0,
        }
    }

    fn refresh_rates(&mut self) {
        let stats = &mut self.stats;
        stats.success_rate = success_rate(stats.live, stats.completed());
        stats.average_latency_ms = mean(self.latency_sum, stats.live as u64);
    }

    fn refresh_clock(&mut self) {
        let now = self.frozen_at.unwrap_or_else(Instant::now);
        let stats = &mut self.stats;
        stats.elapsed = now.saturating_duration_since(self.started);

        let secs = stats.elapsed.as_secs_f64();
        stats.checks_per_second = if secs > 0.0 {
            stats.completed() as f64 / secs
        } else {
            0.0
        };
        stats.estimated_remaining = if stats.checks_per_second > 0.0 && stats.pending > 0 {
            Duration::from_secs_f64(stats.pending as f64 / stats.checks_per_second)
        } else {
            Duration::ZERO
        };
    }
}

/// Thread-safe running aggregation of a run
#[derive(Debug)]
pub struct StatsTracker {
    state: Mutex<TrackerState>,
}

impl Default for StatsTracker {
    fn default() -> Self {
        Self::new()
    }
}

impl StatsTracker {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(TrackerState::new(0, 0)),
        }
    }

    /// Start over with `total` pending checks and restart the clock
    pub fn reset(&self, total: usize, thread_count: usize) {
        *self.state.lock() = TrackerState::new(total, thread_count);
    }

    /// Drop all counters. Checks still in flight are counted again when
    /// they finish.
    pub fn clear(&self) {
        let mut state = self.state.lock();
        let thread_count = state.stats.thread_count;
        *state = TrackerState::new(0, thread_count);
    }

    /// A worker picked up an endpoint
    pub fn begin_check(&self) {
        let mut state = self.state.lock();
        let stats = &mut state.stats;
        if stats.pending > 0 {
            stats.pending -= 1;
        } else {
            // endpoint arrived after the counters were cleared
            stats.total += 1;
        }
        stats.checking += 1;
    }

    /// A check ended without a result, it no longer counts toward the total
    pub fn abandon_check(&self) {
        let mut state = self.state.lock();
        let stats = &mut state.stats;
        // nothing to undo for a check that started before a clear
        if stats.checking > 0 {
            stats.checking -= 1;
            stats.total = stats.total.saturating_sub(1);
        }
        state.refresh_rates();
    }

    /// Fold one terminal result
    pub fn update(&self, result: &ProxyResult) {
        let mut state = self.state.lock();
        let stats = &mut state.stats;

        match result.outcome {
            ProbeOutcome::Live => stats.live += 1,
            ProbeOutcome::Dead => stats.dead += 1,
            ProbeOutcome::Error => stats.errors += 1,
            ProbeOutcome::Pending | ProbeOutcome::Checking => return,
        }

        if stats.checking > 0 {
            stats.checking -= 1;
        } else if stats.pending > 0 {
            stats.pending -= 1;
        } else {
            stats.total += 1;
        }
        *stats.kind_counts.entry(result.kind).or_insert(0) += 1;

        if result.is_live() {
            state.latency_sum += result.latency_ms;
        }
        state.refresh_rates();
        state.refresh_clock();
    }

    /// Count each aborted check as dead, including checks that started
    /// before a clear.
    pub fn mark_in_flight_as_dead(&self, aborted: &[ProxyResult]) {
        let mut state = self.state.lock();
        let stats = &mut state.stats;
        for result in aborted {
            stats.dead += 1;
            if stats.checking > 0 {
                stats.checking -= 1;
            } else {
                // started before the counters were cleared
                stats.total += 1;
            }
            *stats.kind_counts.entry(result.kind).or_insert(0) += 1;
        }
        state.refresh_rates();
    }

    /// Stop the clock at the current instant
    pub fn freeze(&self) {
        let mut state = self.state.lock();
        if state.frozen_at.is_none() {
            state.frozen_at = Some(Instant::now());
        }
        state.refresh_clock();
    }

    pub fn refresh_clock(&self) {
        self.state.lock().refresh_clock();
    }

    /// Owned copy with up-to-date time fields
    pub fn snapshot(&self) -> RunStatistics {
        let mut state = self.state.lock();
        state.refresh_clock();
        state.stats.clone()
    }
}

/// Human readable duration: `45s`, `3m 12s`, `2h 5m`
pub fn format_duration(duration: Duration) -> String {
    let secs = duration.as_secs_f64().round() as u64;
    if secs < 60 {
        format!("{}s", secs)
    } else if secs < 3600 {
        format!("{}m {}s", secs / 60, secs % 60)
    } else {
        format!("{}h {}m", secs / 3600, (secs % 3600) / 60)
    }
}
