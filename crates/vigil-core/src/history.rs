//! Rolling performance history and the health score derived from it
//!
//! The host decides how often to record a point (the CLI does it once per
//! `watch` tick). Only the last `HISTORY_POINTS` points are kept.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::VecDeque;
use std::time::Instant;
use vigil_cache::CacheStats;

pub const HISTORY_POINTS: usize = 60;

/// One sample of manager activity since the previous point
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct HistoryPoint {
    pub at: DateTime<Utc>,
    /// Cumulative cache hit rate, 0-100
    pub hit_rate: f64,
    pub cache_entries: usize,
    pub queries_per_minute: f64,
    /// Share of refreshes since the previous point that failed, 0-100
    pub failure_rate: f64,
}

pub(crate) struct History {
    points: VecDeque<HistoryPoint>,
    last_at: Instant,
    last_queries: u64,
    last_refreshes: u64,
    last_failures: u64,
}

impl History {
    pub fn new(now: Instant) -> Self {
        Self {
            points: VecDeque::with_capacity(HISTORY_POINTS),
            last_at: now,
            last_queries: 0,
            last_refreshes: 0,
            last_failures: 0,
        }
    }

    pub fn record(&mut self, now: Instant, at: DateTime<Utc>, queries: u64, cache: &CacheStats) -> HistoryPoint {
        let elapsed = now.saturating_duration_since(self.last_at).as_secs_f64();
        let queries_per_minute = if elapsed > 0.0 {
            queries.saturating_sub(self.last_queries) as f64 * 60.0 / elapsed
        } else {
            0.0
        };
        let refreshes = cache.refreshes.saturating_sub(self.last_refreshes);
        let failures = cache.failures.saturating_sub(self.last_failures);
        let failure_rate = if refreshes > 0 {
            failures as f64 / refreshes as f64 * 100.0
        } else {
            0.0
        };

        let point = HistoryPoint {
            at,
            hit_rate: cache.hit_rate * 100.0,
            cache_entries: cache.entries,
            queries_per_minute,
            failure_rate,
        };
        if self.points.len() == HISTORY_POINTS {
            self.points.pop_front();
        }
        self.points.push_back(point.clone());

        self.last_at = now;
        self.last_queries = queries;
        self.last_refreshes = cache.refreshes;
        self.last_failures = cache.failures;
        point
    }

    pub fn points(&self) -> Vec<HistoryPoint> {
        self.points.iter().cloned().collect()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Grade {
    Excellent,
    Good,
    Fair,
    NeedsAttention,
}

/// 0-100 score with the reasons points were taken off
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct HealthScore {
    pub score: f64,
    pub grade: Grade,
    pub issues: Vec<String>,
    pub recommendations: Vec<String>,
}

fn average(values: impl Iterator<Item = f64>) -> Option<f64> {
    let (sum, n) = values.fold((0.0, 0usize), |(sum, n), v| (sum + v, n + 1));
    (n > 0).then(|| sum / n as f64)
}

impl HealthScore {
    /// Score recorded history. No history scores 100.
    pub fn assess(points: &[HistoryPoint], max_entries: Option<usize>) -> Self {
        let mut score = 100.0;
        let mut issues = Vec::new();
        let mut recommendations = Vec::new();

        if let Some(hit_rate) = average(points.iter().map(|p| p.hit_rate)) {
            if hit_rate < 50.0 {
                score -= 20.0;
                issues.push(format!("Cache hit rate is low ({:.1}%)", hit_rate));
                recommendations.push("Raise probe TTLs or max_entries".to_string());
            } else if hit_rate > 90.0 {
                recommendations.push("Cache is performing well".to_string());
            }
        }

        if let (Some(max), Some(entries)) = (max_entries, average(points.iter().map(|p| p.cache_entries as f64))) {
            if entries / max as f64 > 0.9 {
                score -= 15.0;
                issues.push(format!("Cache is near capacity ({:.0} of {})", entries, max));
                recommendations.push("Raise max_entries".to_string());
            }
        }

        if let Some(failure_rate) = average(points.iter().map(|p| p.failure_rate)) {
            if failure_rate > 50.0 {
                score -= 25.0;
                issues.push(format!("Most probe refreshes fail ({:.1}%)", failure_rate));
                recommendations.push("Check or disable the failing probes".to_string());
            } else if failure_rate > 20.0 {
                score -= 10.0;
                issues.push(format!("Some probe refreshes fail ({:.1}%)", failure_rate));
            }
        }

        let grade = if score >= 90.0 {
            Grade::Excellent
        } else if score >= 70.0 {
            Grade::Good
        } else if score >= 50.0 {
            Grade::Fair
        } else {
            Grade::NeedsAttention
        };
        Self {
            score,
            grade,
            issues,
            recommendations,
        }
    }
}
