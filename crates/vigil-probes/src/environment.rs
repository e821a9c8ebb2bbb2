//! Time-of-day, season and calendar probe

use async_trait::async_trait;
use chrono::{Datelike, Local, NaiveDateTime, Timelike, Weekday};
use serde_json::{json, Value};
use std::collections::BTreeMap;
use vigil_core::{Probe, ProbeContext, ProbeOutput};

pub fn time_period(hour: u32) -> &'static str {
    match hour {
        4..=5 => "dawn",
        6..=11 => "morning",
        12 => "noon",
        13..=17 => "afternoon",
        18..=19 => "evening",
        20..=23 => "night",
        _ => "midnight",
    }
}

/// Meteorological seasons, northern hemisphere
pub fn season(month: u32) -> &'static str {
    match month {
        3..=5 => "spring",
        6..=8 => "summer",
        9..=11 => "autumn",
        _ => "winter",
    }
}

/// Fixed-date holidays keyed by (month, day)
pub fn default_holidays() -> BTreeMap<(u32, u32), String> {
    [
        ((1, 1), "New Year's Day"),
        ((2, 14), "Valentine's Day"),
        ((3, 8), "Women's Day"),
        ((5, 1), "Labour Day"),
        ((6, 1), "Children's Day"),
        ((10, 1), "National Day"),
        ((12, 25), "Christmas"),
    ]
    .into_iter()
    .map(|(date, name)| (date, name.to_string()))
    .collect()
}

pub struct EnvironmentProbe {
    holidays: BTreeMap<(u32, u32), String>,
}

impl Default for EnvironmentProbe {
    fn default() -> Self {
        Self::new(default_holidays())
    }
}

impl EnvironmentProbe {
    pub fn new(holidays: BTreeMap<(u32, u32), String>) -> Self {
        Self { holidays }
    }

    /// Describe a local moment
    pub fn describe_at(&self, now: NaiveDateTime) -> Value {
        let weekday = now.weekday();
        let is_weekend = matches!(weekday, Weekday::Sat | Weekday::Sun);
        let holiday = self.holidays.get(&(now.month(), now.day()));

        json!({
            "datetime": now.format("%Y-%m-%d %H:%M").to_string(),
            "hour": now.hour(),
            "minute": now.minute(),
            "weekday": weekday.num_days_from_monday(),
            "is_weekend": is_weekend,
            "is_workday": !is_weekend && holiday.is_none(),
            "time_period": time_period(now.hour()),
            "season": season(now.month()),
            "is_holiday": holiday.is_some(),
            "holiday_name": holiday,
        })
    }
}

#[async_trait]
impl Probe for EnvironmentProbe {
    async fn sample(&self, _ctx: &ProbeContext) -> anyhow::Result<ProbeOutput> {
        Ok(ProbeOutput::new("environment", self.describe_at(Local::now().naive_local())))
    }

    fn describe(&self) -> &str {
        "local time period, season and holidays"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;

    fn at(y: i32, m: u32, d: u32, h: u32) -> NaiveDateTime {
        NaiveDate::from_ymd_opt(y, m, d).unwrap().and_hms_opt(h, 30, 0).unwrap()
    }

    #[test]
    fn test_time_periods() {
        let periods: Vec<_> = [0, 3, 4, 5, 6, 11, 12, 13, 17, 18, 19, 20, 23].iter().map(|h| time_period(*h)).collect();
        assert_eq!(
            periods,
            vec![
                "midnight", "midnight", "dawn", "dawn", "morning", "morning", "noon", "afternoon", "afternoon",
                "evening", "evening", "night", "night",
            ]
        );
    }

    #[test]
    fn test_seasons() {
        assert_eq!(season(1), "winter");
        assert_eq!(season(4), "spring");
        assert_eq!(season(7), "summer");
        assert_eq!(season(10), "autumn");
        assert_eq!(season(12), "winter");
    }

    #[test]
    fn test_weekend_and_holiday() {
        let probe = EnvironmentProbe::default();

        // 2026-10-17 is a Saturday
        let saturday = probe.describe_at(at(2026, 10, 17, 9));
        assert_eq!(saturday["is_weekend"], true);
        assert_eq!(saturday["weekday"], 5);
        assert_eq!(saturday["time_period"], "morning");
        assert_eq!(saturday["is_holiday"], false);

        // 2026-12-25 is a Friday
        let christmas = probe.describe_at(at(2026, 12, 25, 19));
        assert_eq!(christmas["is_weekend"], false);
        assert_eq!(christmas["is_workday"], false);
        assert_eq!(christmas["holiday_name"], "Christmas");
        assert_eq!(christmas["season"], "winter");
        assert_eq!(christmas["time_period"], "evening");
    }

    #[tokio::test]
    async fn test_sample_kind() {
        let output = EnvironmentProbe::default()
            .sample(&ProbeContext::new("environment".into()))
            .await
            .unwrap();
        assert_eq!(output.kind, "environment");
        assert!(output.field("season").is_some());
    }
}
