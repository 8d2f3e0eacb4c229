//! Least-Cost-Routing collaborator contract (§4.11).
//!
//! The core depends only on `(dialed_number, trunks) -> selection`; rate
//! tables, trunk persistence, and provisioning live in the collaborator.
//! This module defines that contract plus the cost/time-window arithmetic
//! shared by any concrete implementation.

use async_trait::async_trait;
use chrono::{Datelike, NaiveTime, Timelike, Weekday};
use regex::Regex;

use crate::{Error, Result};

#[derive(Debug, Clone)]
pub struct DialPattern {
    pub pattern: Regex,
    pub trunk_id: String,
}

#[derive(Debug, Clone)]
pub struct TimeBasedRate {
    pub days: Vec<Weekday>,
    pub start: NaiveTime,
    pub end: NaiveTime,
    pub multiplier: f64,
}

impl TimeBasedRate {
    /// True if `now` falls within this rate's day-of-week + time-of-day
    /// window, including windows that cross midnight (`start > end`).
    pub fn applies_now(&self, weekday: Weekday, time_of_day: NaiveTime) -> bool {
        if !self.days.contains(&weekday) {
            return false;
        }
        if self.start <= self.end {
            time_of_day >= self.start && time_of_day < self.end
        } else {
            time_of_day >= self.start || time_of_day < self.end
        }
    }
}

#[derive(Debug, Clone)]
pub struct RateEntry {
    pub rate_per_minute: f64,
    pub connection_fee: f64,
    pub minimum_seconds: u32,
    pub billing_increment: u32,
    pub time_rates: Vec<TimeBasedRate>,
}

impl RateEntry {
    /// Applies the minimum-seconds floor, then rounds up to the billing
    /// increment.
    pub fn billable_seconds(&self, actual_seconds: u32) -> u32 {
        let floored = actual_seconds.max(self.minimum_seconds);
        let increment = self.billing_increment.max(1);
        floored.div_ceil(increment) * increment
    }

    fn multiplier_at(&self, weekday: Weekday, time_of_day: NaiveTime) -> f64 {
        self.time_rates
            .iter()
            .find(|r| r.applies_now(weekday, time_of_day))
            .map(|r| r.multiplier)
            .unwrap_or(1.0)
    }

    /// `minutes * rate_per_minute * time_multiplier + connection_fee`.
    pub fn calculate_cost(&self, actual_seconds: u32, weekday: Weekday, time_of_day: NaiveTime) -> f64 {
        let billable = self.billable_seconds(actual_seconds);
        let minutes = billable as f64 / 60.0;
        let multiplier = self.multiplier_at(weekday, time_of_day);
        minutes * self.rate_per_minute * multiplier + self.connection_fee
    }
}

#[derive(Debug, Clone)]
pub struct TrunkCandidate {
    pub trunk_id: String,
}

#[derive(Debug, Clone)]
pub struct LcrSelection {
    pub trunk_id: String,
    pub estimated_cost: f64,
}

/// The contract the dial-plan router consumes: given a dialed number and
/// the trunks currently available, pick the cheapest one (or `None` if no
/// pattern matches).
#[async_trait]
pub trait LeastCostRouter: Send + Sync {
    async fn select_trunk(
        &self,
        dialed_number: &str,
        available_trunks: &[TrunkCandidate],
    ) -> Result<Option<LcrSelection>>;
}

/// A simple in-memory LCR implementation: ordered dial patterns, each
/// backed by a rate entry, evaluated `match`-style (prefix-anchored)
/// against the dialed number.
pub struct StaticLeastCostRouter {
    patterns: Vec<(DialPattern, RateEntry)>,
    estimate_seconds: u32,
}

impl StaticLeastCostRouter {
    pub fn new(patterns: Vec<(DialPattern, RateEntry)>, estimate_seconds: u32) -> Self {
        Self {
            patterns,
            estimate_seconds,
        }
    }

    fn now_parts() -> (Weekday, NaiveTime) {
        let now = chrono::Local::now();
        (
            now.weekday(),
            NaiveTime::from_hms_opt(now.hour(), now.minute(), now.second()).unwrap(),
        )
    }
}

#[async_trait]
impl LeastCostRouter for StaticLeastCostRouter {
    async fn select_trunk(
        &self,
        dialed_number: &str,
        available_trunks: &[TrunkCandidate],
    ) -> Result<Option<LcrSelection>> {
        let (weekday, time_of_day) = Self::now_parts();

        let mut best: Option<LcrSelection> = None;
        for (dial_pattern, rate) in &self.patterns {
            if !dial_pattern.pattern.is_match(dialed_number) {
                continue;
            }
            if !available_trunks.iter().any(|t| t.trunk_id == dial_pattern.trunk_id) {
                continue;
            }
            let cost = rate.calculate_cost(self.estimate_seconds, weekday, time_of_day);
            if best.as_ref().map(|b| cost < b.estimated_cost).unwrap_or(true) {
                best = Some(LcrSelection {
                    trunk_id: dial_pattern.trunk_id.clone(),
                    estimated_cost: cost,
                });
            }
        }

        Ok(best)
    }
}

pub fn compile_dial_pattern(pattern: &str, trunk_id: impl Into<String>) -> Result<DialPattern> {
    Ok(DialPattern {
        pattern: Regex::new(pattern).map_err(|e| Error::parse(format!("LCR dial pattern: {e}")))?,
        trunk_id: trunk_id.into(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn flat_rate(rate_per_minute: f64, minimum_seconds: u32, billing_increment: u32) -> RateEntry {
        RateEntry {
            rate_per_minute,
            connection_fee: 0.0,
            minimum_seconds,
            billing_increment,
            time_rates: vec![],
        }
    }

    #[test]
    fn test_billable_seconds_applies_minimum_then_rounds_up() {
        let rate = flat_rate(0.10, 60, 60);
        assert_eq!(rate.billable_seconds(45), 60);
        assert_eq!(rate.billable_seconds(90), 120);
    }

    #[test]
    fn test_cost_calculation_matches_rate_times_minutes() {
        let rate = flat_rate(0.10, 60, 60);
        let cost = rate.calculate_cost(90, Weekday::Mon, NaiveTime::from_hms_opt(10, 0, 0).unwrap());
        assert!((cost - 0.20).abs() < 1e-9);
    }

    #[test]
    fn test_midnight_crossing_window_applies() {
        let night_rate = TimeBasedRate {
            days: vec![Weekday::Mon],
            start: NaiveTime::from_hms_opt(22, 0, 0).unwrap(),
            end: NaiveTime::from_hms_opt(6, 0, 0).unwrap(),
            multiplier: 0.5,
        };
        assert!(night_rate.applies_now(Weekday::Mon, NaiveTime::from_hms_opt(23, 30, 0).unwrap()));
        assert!(night_rate.applies_now(Weekday::Mon, NaiveTime::from_hms_opt(2, 0, 0).unwrap()));
        assert!(!night_rate.applies_now(Weekday::Mon, NaiveTime::from_hms_opt(12, 0, 0).unwrap()));
    }

    #[tokio::test]
    async fn test_static_router_picks_cheapest_matching_trunk() {
        let cheap = compile_dial_pattern(r"^1\d{9}$", "cheap-trunk").unwrap();
        let pricey = compile_dial_pattern(r"^1\d{9}$", "pricey-trunk").unwrap();
        let router = StaticLeastCostRouter::new(
            vec![
                (cheap, flat_rate(0.02, 6, 6)),
                (pricey, flat_rate(0.10, 6, 6)),
            ],
            60,
        );

        let trunks = vec![
            TrunkCandidate { trunk_id: "cheap-trunk".to_string() },
            TrunkCandidate { trunk_id: "pricey-trunk".to_string() },
        ];

        let selection = router.select_trunk("15551234567", &trunks).await.unwrap().unwrap();
        assert_eq!(selection.trunk_id, "cheap-trunk");
    }

    #[tokio::test]
    async fn test_no_matching_pattern_returns_none() {
        let pattern = compile_dial_pattern(r"^1\d{9}$", "trunk-a").unwrap();
        let router = StaticLeastCostRouter::new(vec![(pattern, flat_rate(0.05, 6, 6))], 60);
        let trunks = vec![TrunkCandidate { trunk_id: "trunk-a".to_string() }];
        let selection = router.select_trunk("911", &trunks).await.unwrap();
        assert!(selection.is_none());
    }
}
