use std::collections::BTreeSet;
use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::config::ConfigError;
use crate::selector::Selector;
use crate::solar::is_daylight;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TierName {
    Fast,
    Medium,
    Slow,
    Turtle,
    Night,
}

impl TierName {
    pub fn as_str(self) -> &'static str {
        match self {
            TierName::Fast => "fast",
            TierName::Medium => "medium",
            TierName::Slow => "slow",
            TierName::Turtle => "turtle",
            TierName::Night => "night",
        }
    }
}

impl fmt::Display for TierName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Tier {
    pub name: TierName,
    pub period: Duration,
    pub outputs: Vec<Selector>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Mode {
    Day,
    Night,
}

impl fmt::Display for Mode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Mode::Day => "day",
            Mode::Night => "night",
        })
    }
}

/// The day tiers and the single night tier they collapse onto.
#[derive(Debug, Clone)]
pub struct TierPlan {
    day: Vec<Tier>,
    night: Tier,
}

impl TierPlan {
    pub fn new(mut day: Vec<Tier>, mut night: Tier) -> Result<Self, ConfigError> {
        if day.is_empty() {
            return Err(ConfigError::Invalid("at least one day tier is required".into()));
        }
        let mut seen = BTreeSet::new();
        for tier in day.iter().chain(std::iter::once(&night)) {
            if tier.period.is_zero() {
                return Err(ConfigError::Invalid(format!(
                    "tier '{}' must have a period greater than zero",
                    tier.name
                )));
            }
            if !seen.insert(tier.name) {
                return Err(ConfigError::Invalid(format!("tier '{}' is defined twice", tier.name)));
            }
        }
        if night.name != TierName::Night {
            return Err(ConfigError::Invalid("the night tier must be named 'night'".into()));
        }

        if night.outputs.is_empty() {
            let mut union = Vec::new();
            for selector in day.iter().flat_map(|t| t.outputs.iter()) {
                if !union.contains(selector) {
                    union.push(selector.clone());
                }
            }
            night.outputs = union;
        }
        day.sort_by_key(|t| (t.period, t.name));

        Ok(Self { day, night })
    }

    pub fn active(&self, mode: Mode) -> Vec<&Tier> {
        match mode {
            Mode::Day => self.day.iter().collect(),
            Mode::Night => vec![&self.night],
        }
    }

    /// The tier whose ticks also refresh the device cache.
    pub fn polling_tier(&self, mode: Mode) -> TierName {
        match mode {
            Mode::Day => self.day[0].name,
            Mode::Night => TierName::Night,
        }
    }

    pub fn all(&self) -> impl Iterator<Item = &Tier> {
        self.day.iter().chain(std::iter::once(&self.night))
    }

    pub fn get(&self, name: TierName) -> Option<&Tier> {
        self.all().find(|t| t.name == name)
    }
}

/// Day/night mode with a pending transition that is applied at the next tier boundary.
#[derive(Debug, Clone)]
pub struct DaylightTracker {
    horizon_deg: f64,
    mode: Mode,
    pending: Option<Mode>,
}

impl DaylightTracker {
    pub fn new(horizon_deg: f64, elevation_deg: f64) -> Self {
        Self {
            horizon_deg,
            mode: Self::mode_for(elevation_deg, horizon_deg),
            pending: None,
        }
    }

    fn mode_for(elevation_deg: f64, horizon_deg: f64) -> Mode {
        if is_daylight(elevation_deg, horizon_deg) {
            Mode::Day
        } else {
            Mode::Night
        }
    }

    pub fn mode(&self) -> Mode {
        self.mode
    }

    pub fn pending(&self) -> Option<Mode> {
        self.pending
    }

    /// Records one elevation sample. Returns the target mode when this sample is the crossing.
    pub fn observe(&mut self, elevation_deg: f64) -> Option<Mode> {
        let observed = Self::mode_for(elevation_deg, self.horizon_deg);
        if observed == self.mode {
            self.pending = None;
            return None;
        }
        if self.pending == Some(observed) {
            return None;
        }
        self.pending = Some(observed);
        Some(observed)
    }

    /// Applies the pending transition, if any.
    pub fn take_pending(&mut self) -> Option<Mode> {
        let next = self.pending.take()?;
        self.mode = next;
        Some(next)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tier(name: TierName, secs: u64) -> Tier {
        Tier {
            name,
            period: Duration::from_secs(secs),
            outputs: vec!["ac_measurements/power".parse().expect("selector")],
        }
    }

    #[test]
    fn rising_sun_switches_to_day_exactly_once() {
        // Arrange
        let samples = [-2.0, -1.0, 0.5, 5.0];
        let mut tracker = DaylightTracker::new(0.0, samples[0]);
        let mut transitions = Vec::new();

        // Act
        for (idx, elevation) in samples.iter().enumerate() {
            if let Some(mode) = tracker.observe(*elevation) {
                transitions.push((idx, mode));
            }
        }

        // Assert
        assert_eq!(transitions, vec![(2, Mode::Day)]);
        assert_eq!(tracker.mode(), Mode::Night, "applied only at the next boundary");
        assert_eq!(tracker.take_pending(), Some(Mode::Day));
        assert_eq!(tracker.mode(), Mode::Day);
        assert_eq!(tracker.take_pending(), None);
    }

    #[test]
    fn reversal_before_boundary_cancels_the_transition() {
        let mut tracker = DaylightTracker::new(0.0, 3.0);

        assert_eq!(tracker.observe(-0.5), Some(Mode::Night));
        assert_eq!(tracker.observe(0.2), None);

        assert_eq!(tracker.pending(), None);
        assert_eq!(tracker.take_pending(), None);
        assert_eq!(tracker.mode(), Mode::Day);
    }

    #[test]
    fn zero_period_is_rejected() {
        let err = TierPlan::new(vec![tier(TierName::Fast, 0)], tier(TierName::Night, 900))
            .expect_err("zero period");
        assert!(err.to_string().contains("fast"));
    }

    #[test]
    fn night_inherits_day_outputs_and_fastest_tier_polls() {
        let mut slow = tier(TierName::Slow, 120);
        slow.outputs = vec!["sun/position".parse().expect("selector")];
        let night = Tier {
            name: TierName::Night,
            period: Duration::from_secs(900),
            outputs: Vec::new(),
        };

        let plan = TierPlan::new(vec![slow, tier(TierName::Fast, 30)], night).expect("valid plan");

        assert_eq!(plan.polling_tier(Mode::Day), TierName::Fast);
        assert_eq!(plan.polling_tier(Mode::Night), TierName::Night);
        assert_eq!(plan.active(Mode::Night).len(), 1);
        let night_topics: Vec<String> =
            plan.active(Mode::Night)[0].outputs.iter().map(|s| s.topic()).collect();
        assert_eq!(night_topics, vec!["sun/position", "ac_measurements/power"]);
    }
}
