//! Self-state probe
//!
//! The agent's own condition: how long it has been up, how busy the last hour
//! was, and an energy level that decays with uptime and workload. The host
//! feeds activity in through a shared `ActivityLog`.

use async_trait::async_trait;
use serde::Serialize;
use serde_json::json;
use std::collections::VecDeque;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};
use vigil_core::{Clock, Probe, ProbeContext, ProbeOutput, SystemClock};

const HOUR: Duration = Duration::from_secs(3600);
const DAY: Duration = Duration::from_secs(86_400);

/// Energy lost per hour of uptime
const ENERGY_DECAY_PER_HOUR: f64 = 0.5;

#[derive(Default)]
struct Activity {
    messages: VecDeque<(Instant, u64)>,
    model_calls: VecDeque<(Instant, u64)>,
}

fn prune(history: &mut VecDeque<(Instant, u64)>, now: Instant) {
    while let Some(&(at, _)) = history.front() {
        if now.saturating_duration_since(at) > DAY {
            history.pop_front();
        } else {
            break;
        }
    }
}

fn count_within(history: &VecDeque<(Instant, u64)>, now: Instant, window: Duration) -> u64 {
    history
        .iter()
        .filter(|(at, _)| now.saturating_duration_since(*at) <= window)
        .map(|(_, n)| n)
        .sum()
}

/// Shared record of what the agent has been doing. Keeps one day of history.
#[derive(Clone)]
pub struct ActivityLog {
    started: Instant,
    clock: Arc<dyn Clock>,
    activity: Arc<Mutex<Activity>>,
}

impl Default for ActivityLog {
    fn default() -> Self {
        Self::with_clock(Arc::new(SystemClock))
    }
}

impl ActivityLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_clock(clock: Arc<dyn Clock>) -> Self {
        Self {
            started: clock.now(),
            clock,
            activity: Arc::new(Mutex::new(Activity::default())),
        }
    }

    pub fn record_messages(&self, count: u64) {
        let now = self.clock.now();
        let mut activity = self.activity.lock().unwrap_or_else(PoisonError::into_inner);
        activity.messages.push_back((now, count));
        prune(&mut activity.messages, now);
    }

    pub fn record_model_calls(&self, count: u64) {
        let now = self.clock.now();
        let mut activity = self.activity.lock().unwrap_or_else(PoisonError::into_inner);
        activity.model_calls.push_back((now, count));
        prune(&mut activity.model_calls, now);
    }

    pub fn uptime(&self) -> Duration {
        self.clock.now().saturating_duration_since(self.started)
    }

    pub fn snapshot(&self) -> SelfState {
        let now = self.clock.now();
        let activity = self.activity.lock().unwrap_or_else(PoisonError::into_inner);
        SelfState::compute(
            self.uptime(),
            ActivityCounts {
                messages_1h: count_within(&activity.messages, now, HOUR),
                messages_24h: count_within(&activity.messages, now, DAY),
                model_calls_1h: count_within(&activity.model_calls, now, HOUR),
                model_calls_24h: count_within(&activity.model_calls, now, DAY),
            },
        )
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ActivityCounts {
    pub messages_1h: u64,
    pub messages_24h: u64,
    pub model_calls_1h: u64,
    pub model_calls_24h: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Workload {
    Relaxed,
    Normal,
    Busy,
    Overloaded,
}

impl Workload {
    /// Level and its 0-1 load factor from last-hour activity
    pub fn assess(messages_1h: u64, model_calls_1h: u64) -> (Self, f64) {
        let score = messages_1h as f64 * 0.1 + model_calls_1h as f64 * 0.5;
        if score >= 50.0 {
            (Workload::Overloaded, 1.0)
        } else if score >= 20.0 {
            (Workload::Busy, 0.7)
        } else if score >= 5.0 {
            (Workload::Normal, 0.4)
        } else {
            (Workload::Relaxed, 0.1)
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum EnergyStatus {
    Energetic,
    Normal,
    Tired,
    Exhausted,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Condition {
    Excellent,
    Good,
    Normal,
    NeedsRest,
}

/// Energy level (0-100), fatigue factor (0-1) and the matching status
pub fn energy(uptime_hours: f64, workload_factor: f64) -> (f64, f64, EnergyStatus) {
    let fatigue = uptime_hours * 0.01 + workload_factor * 0.5;
    let level = (100.0 - uptime_hours * ENERGY_DECAY_PER_HOUR - fatigue * 50.0).max(0.0);
    let status = if level >= 80.0 {
        EnergyStatus::Energetic
    } else if level >= 50.0 {
        EnergyStatus::Normal
    } else if level >= 20.0 {
        EnergyStatus::Tired
    } else {
        EnergyStatus::Exhausted
    };
    (level, fatigue.min(1.0), status)
}

pub fn condition(energy_level: f64, workload: Workload, fatigue: f64) -> Condition {
    let slack = match workload {
        Workload::Relaxed => 0.3,
        Workload::Normal => 0.2,
        Workload::Busy => 0.1,
        Workload::Overloaded => 0.0,
    };
    let score = energy_level / 100.0 * 0.4 + slack - fatigue * 0.3;
    if score >= 0.8 {
        Condition::Excellent
    } else if score >= 0.6 {
        Condition::Good
    } else if score >= 0.4 {
        Condition::Normal
    } else {
        Condition::NeedsRest
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SelfState {
    pub uptime_secs: u64,
    #[serde(flatten)]
    pub activity: ActivityCounts,
    pub workload: Workload,
    pub energy_level: f64,
    pub energy_status: EnergyStatus,
    pub fatigue_factor: f64,
    pub condition: Condition,
}

impl SelfState {
    pub fn compute(uptime: Duration, activity: ActivityCounts) -> Self {
        let hours = uptime.as_secs_f64() / 3600.0;
        let (workload, load_factor) = Workload::assess(activity.messages_1h, activity.model_calls_1h);
        let (energy_level, fatigue_factor, energy_status) = energy(hours, load_factor);
        Self {
            uptime_secs: uptime.as_secs(),
            activity,
            workload,
            energy_level,
            energy_status,
            fatigue_factor,
            condition: condition(energy_level, workload, fatigue_factor),
        }
    }
}

pub struct SelfStateProbe {
    log: ActivityLog,
}

impl SelfStateProbe {
    pub fn new(log: ActivityLog) -> Self {
        Self { log }
    }
}

#[async_trait]
impl Probe for SelfStateProbe {
    async fn sample(&self, _ctx: &ProbeContext) -> anyhow::Result<ProbeOutput> {
        Ok(ProbeOutput::new("self_state", serde_json::to_value(self.log.snapshot())?))
    }

    fn describe(&self) -> &str {
        "agent uptime, workload and energy"
    }
}
