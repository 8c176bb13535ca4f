//! Meter readings at the start of each production period.

use std::collections::BTreeMap;

use chrono::{DateTime, Datelike, Duration, NaiveDate, NaiveTime, TimeZone, Utc};
use chrono_tz::Tz;

use crate::device::HistoryPoint;
use crate::selector::Period;

/// Periods whose baseline is read from the logger; lifetime counts from zero.
pub const READ_PERIODS: [Period; 3] = [Period::Today, Period::Month, Period::Year];

/// Local midnight of `date` in `tz`, as UTC. When a DST gap swallows midnight the day starts at
/// the first valid local instant after it.
pub(crate) fn local_midnight(tz: Tz, date: NaiveDate) -> DateTime<Utc> {
    let naive = date.and_time(NaiveTime::MIN);
    (0..=3)
        .find_map(|hours| {
            tz.from_local_datetime(&(naive + Duration::hours(hours)))
                .earliest()
        })
        .map(|start| start.with_timezone(&Utc))
        .unwrap_or_else(|| naive.and_utc())
}

/// Start of the period containing `now`; lifetime has none.
pub fn period_start(period: Period, tz: Tz, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
    let today = now.with_timezone(&tz).date_naive();
    let date = match period {
        Period::Today => today,
        Period::Month => today.with_day(1)?,
        Period::Year => today.with_ordinal(1)?,
        Period::Lifetime => return None,
    };
    Some(local_midnight(tz, date))
}

pub fn next_midnight(tz: Tz, now: DateTime<Utc>) -> DateTime<Utc> {
    let today = now.with_timezone(&tz).date_naive();
    let tomorrow = today.succ_opt().unwrap_or(today);
    local_midnight(tz, tomorrow)
}

/// History window to request so that it brackets the start of `period`: from an hour before
/// the start to three hours after it, stretched to today's midnight for month and year.
pub fn history_window(
    period: Period,
    tz: Tz,
    now: DateTime<Utc>,
) -> Option<(DateTime<Utc>, DateTime<Utc>)> {
    let start = period_start(period, tz, now)?;
    let today = period_start(Period::Today, tz, now)?;
    let end = match period {
        Period::Today => start + Duration::hours(3),
        _ => today.max(start + Duration::hours(3)),
    };
    Some((start - Duration::hours(1), end))
}

/// The whole of yesterday in the site timezone, both midnights included.
pub fn yesterday_window(tz: Tz, now: DateTime<Utc>) -> Option<(DateTime<Utc>, DateTime<Utc>)> {
    let today = now.with_timezone(&tz).date_naive();
    let yesterday = today.pred_opt()?;
    Some((local_midnight(tz, yesterday), local_midnight(tz, today)))
}

/// First logged value at or after `start`, else the last one before it.
pub fn baseline_from_history(points: &[HistoryPoint], start: DateTime<Utc>) -> Option<f64> {
    let start = start.timestamp();
    points
        .iter()
        .filter(|p| p.t >= start)
        .min_by_key(|p| p.t)
        .and_then(|p| p.v)
        .or_else(|| {
            points
                .iter()
                .filter(|p| p.t < start && p.v.is_some())
                .max_by_key(|p| p.t)
                .and_then(|p| p.v)
        })
}

/// Total-Wh meter reading at the start of one period.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Baseline {
    pub start: DateTime<Utc>,
    pub wh: f64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct DeviceBaselines {
    pub today: Option<Baseline>,
    pub month: Option<Baseline>,
    pub year: Option<Baseline>,
}

impl DeviceBaselines {
    pub fn get(&self, period: Period) -> Option<Baseline> {
        match period {
            Period::Today => self.today,
            Period::Month => self.month,
            Period::Year => self.year,
            Period::Lifetime => None,
        }
    }

    pub fn set(&mut self, period: Period, value: Option<Baseline>) {
        match period {
            Period::Today => self.today = value,
            Period::Month => self.month = value,
            Period::Year => self.year = value,
            Period::Lifetime => {}
        }
    }
}

/// Per device, the meter reading at the start of each period.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Baselines {
    devices: BTreeMap<String, DeviceBaselines>,
}

impl Baselines {
    pub fn insert(&mut self, device: impl Into<String>, baselines: DeviceBaselines) {
        self.devices.insert(device.into(), baselines);
    }

    /// Reading to subtract for `period` at `at`. A value taken for an earlier period is ignored.
    pub fn get(&self, device: &str, period: Period, tz: Tz, at: DateTime<Utc>) -> Option<f64> {
        if period == Period::Lifetime {
            return Some(0.0);
        }
        let baseline = self.devices.get(device)?.get(period)?;
        (Some(baseline.start) == period_start(period, tz, at)).then_some(baseline.wh)
    }

    /// True when every device has a current baseline for each logged period.
    pub fn is_complete(&self, tz: Tz, at: DateTime<Utc>) -> bool {
        !self.devices.is_empty()
            && self.devices.keys().all(|device| {
                READ_PERIODS
                    .iter()
                    .all(|period| self.get(device, *period, tz, at).is_some())
            })
    }

    /// Folds a newer read in. Periods the read could not fill keep their previous value.
    pub fn merge(&mut self, newer: Baselines) {
        for (device, mut next) in newer.devices {
            if let Some(previous) = self.devices.get(&device) {
                for period in READ_PERIODS {
                    if next.get(period).is_none() {
                        next.set(period, previous.get(period));
                    }
                }
            }
            self.devices.insert(device, next);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn period_starts_follow_the_site_timezone() {
        let tz: Tz = "Europe/Berlin".parse().expect("timezone");
        // 23:30 UTC on May 14 is already May 15 in Berlin.
        let now = Utc.with_ymd_and_hms(2024, 5, 14, 23, 30, 0).single().expect("valid date");

        let today = period_start(Period::Today, tz, now).expect("today");
        let month = period_start(Period::Month, tz, now).expect("month");
        let year = period_start(Period::Year, tz, now).expect("year");

        assert_eq!(today, Utc.with_ymd_and_hms(2024, 5, 14, 22, 0, 0).single().expect("date"));
        assert_eq!(month, Utc.with_ymd_and_hms(2024, 4, 30, 22, 0, 0).single().expect("date"));
        assert_eq!(year, Utc.with_ymd_and_hms(2023, 12, 31, 23, 0, 0).single().expect("date"));
        assert_eq!(period_start(Period::Lifetime, tz, now), None);
        assert_eq!(
            next_midnight(tz, now),
            Utc.with_ymd_and_hms(2024, 5, 15, 22, 0, 0).single().expect("date")
        );
    }

    #[test]
    fn baseline_prefers_the_first_sample_at_the_period_start() {
        let start = Utc.with_ymd_and_hms(2024, 5, 1, 0, 0, 0).single().expect("valid date");
        let t0 = start.timestamp();
        let points = [
            HistoryPoint { t: t0 - 600, v: Some(990.0) },
            HistoryPoint { t: t0 + 300, v: Some(1010.0) },
            HistoryPoint { t: t0, v: Some(1000.0) },
        ];

        assert_eq!(baseline_from_history(&points, start), Some(1000.0));
        assert_eq!(baseline_from_history(&points[..1], start), Some(990.0));
        assert_eq!(baseline_from_history(&[], start), None);
    }

    fn utc(y: i32, m: u32, d: u32, h: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(y, m, d, h, 0, 0).single().expect("valid date")
    }

    #[test]
    fn lifetime_baseline_is_zero_for_any_device() {
        let tz: Tz = "UTC".parse().expect("timezone");
        let at = utc(2024, 5, 14, 12);
        let mut baselines = Baselines::default();
        baselines.insert(
            "a",
            DeviceBaselines {
                today: Some(Baseline { start: utc(2024, 5, 14, 0), wh: 5.0 }),
                ..Default::default()
            },
        );

        assert_eq!(baselines.get("a", Period::Today, tz, at), Some(5.0));
        assert_eq!(baselines.get("a", Period::Month, tz, at), None);
        assert_eq!(baselines.get("unknown", Period::Lifetime, tz, at), Some(0.0));
        assert_eq!(baselines.get("unknown", Period::Today, tz, at), None);
    }

    #[test]
    fn failed_periods_keep_their_previous_value_until_it_expires() {
        // Arrange
        let tz: Tz = "UTC".parse().expect("timezone");
        let mut baselines = Baselines::default();
        baselines.insert(
            "a",
            DeviceBaselines {
                today: Some(Baseline { start: utc(2024, 5, 14, 0), wh: 52_000.0 }),
                month: Some(Baseline { start: utc(2024, 5, 1, 0), wh: 40_000.0 }),
                year: Some(Baseline { start: utc(2024, 1, 1, 0), wh: 10_000.0 }),
            },
        );
        // Midnight read: today came back, month and year did not.
        let mut newer = Baselines::default();
        newer.insert(
            "a",
            DeviceBaselines {
                today: Some(Baseline { start: utc(2024, 5, 15, 0), wh: 58_000.0 }),
                ..Default::default()
            },
        );

        // Act
        baselines.merge(newer);

        // Assert
        let at = utc(2024, 5, 15, 9);
        assert_eq!(baselines.get("a", Period::Today, tz, at), Some(58_000.0));
        assert_eq!(baselines.get("a", Period::Month, tz, at), Some(40_000.0));
        assert_eq!(baselines.get("a", Period::Year, tz, at), Some(10_000.0));
        assert!(baselines.is_complete(tz, at));
        // The next day the kept today value no longer applies.
        let tomorrow = utc(2024, 5, 16, 9);
        assert_eq!(baselines.get("a", Period::Today, tz, tomorrow), None);
        assert!(!baselines.is_complete(tz, tomorrow));
    }

    #[test]
    fn midnight_lost_to_dst_starts_the_day_after_the_gap() {
        // Santiago springs forward from 00:00 to 01:00 on 2024-09-08.
        let tz: Tz = "America/Santiago".parse().expect("timezone");
        let now = utc(2024, 9, 8, 15);

        let today = period_start(Period::Today, tz, now).expect("today");

        assert_eq!(today, utc(2024, 9, 8, 4));
        assert_eq!(today.with_timezone(&tz).format("%H:%M").to_string(), "01:00");
    }

    #[test]
    fn yesterday_window_spans_both_midnights() {
        let tz: Tz = "Europe/Berlin".parse().expect("timezone");

        let (start, end) = yesterday_window(tz, utc(2024, 5, 15, 8)).expect("window");

        assert_eq!(start, utc(2024, 5, 13, 22));
        assert_eq!(end, utc(2024, 5, 14, 22));
    }
}
