use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::device::Readings;
use crate::keys::{self, condition};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Freshness {
    /// No successful read yet.
    Pending,
    Fresh,
    Stale,
}

/// Ordered by precedence: a fault anywhere outranks a warning, which outranks ok.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Status {
    Ok,
    Warning,
    Fault,
}

impl Status {
    pub fn as_str(self) -> &'static str {
        match self {
            Status::Ok => "ok",
            Status::Warning => "warning",
            Status::Fault => "fault",
        }
    }

    fn from_condition(tag: Option<u32>) -> Self {
        match tag {
            None | Some(condition::OK) | Some(condition::OFF) => Status::Ok,
            Some(condition::FAULT) => Status::Fault,
            Some(_) => Status::Warning,
        }
    }
}

impl std::fmt::Display for Status {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceSnapshot {
    pub device: String,
    pub readings: Readings,
    pub fetched_at: Option<DateTime<Utc>>,
    pub freshness: Freshness,
    pub status: Status,
    pub last_error: Option<String>,
}

impl DeviceSnapshot {
    pub fn pending(device: impl Into<String>) -> Self {
        Self {
            device: device.into(),
            readings: Readings::new(),
            fetched_at: None,
            freshness: Freshness::Pending,
            status: Status::Warning,
            last_error: None,
        }
    }

    pub fn fresh(device: impl Into<String>, readings: Readings, fetched_at: DateTime<Utc>) -> Self {
        let status = Status::from_condition(readings.get(keys::CONDITION).and_then(|r| r.tag()));
        Self {
            device: device.into(),
            readings,
            fetched_at: Some(fetched_at),
            freshness: Freshness::Fresh,
            status,
            last_error: None,
        }
    }

    /// Keeps the last readings, flags them stale.
    pub fn into_stale(mut self, reason: impl Into<String>) -> Self {
        self.freshness = Freshness::Stale;
        self.status = self.status.max(Status::Warning);
        self.last_error = Some(reason.into());
        self
    }

    pub fn is_fresh(&self) -> bool {
        self.freshness == Freshness::Fresh
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SiteTotal {
    pub value: f64,
    pub contributors: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SiteSnapshot {
    pub generation: u64,
    pub updated_at: Option<DateTime<Utc>>,
    pub devices: BTreeMap<String, DeviceSnapshot>,
    pub totals: BTreeMap<String, SiteTotal>,
    /// Devices whose values do not contribute to `totals`.
    pub excluded: Vec<String>,
    pub status: Status,
}

impl SiteSnapshot {
    /// Derives the aggregate from the given device snapshots alone.
    pub fn build(
        generation: u64,
        updated_at: Option<DateTime<Utc>>,
        devices: BTreeMap<String, DeviceSnapshot>,
    ) -> Self {
        let mut totals = BTreeMap::new();
        let mut excluded = Vec::new();

        for snapshot in devices.values() {
            if !snapshot.is_fresh() {
                excluded.push(snapshot.device.clone());
                continue;
            }
            for key in keys::AGGREGATE_KEYS {
                let Some(value) = snapshot.readings.get(key).and_then(|r| r.total()) else {
                    continue;
                };
                let entry = totals.entry(key.to_string()).or_insert(SiteTotal {
                    value: 0.0,
                    contributors: 0,
                });
                entry.value += value;
                entry.contributors += 1;
            }
        }

        let status = devices
            .values()
            .map(|d| d.status)
            .max()
            .unwrap_or(Status::Ok);

        Self {
            generation,
            updated_at,
            devices,
            totals,
            excluded,
            status,
        }
    }

    pub fn total(&self, key: &str) -> Option<f64> {
        self.totals.get(key).map(|t| t.value)
    }

    pub fn is_complete(&self) -> bool {
        self.excluded.is_empty()
    }

    pub fn stale_devices(&self) -> Vec<String> {
        self.devices
            .values()
            .filter(|d| d.freshness == Freshness::Stale)
            .map(|d| d.device.clone())
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::Reading;

    fn readings(ac: f64, condition: u32) -> Readings {
        let mut r = Readings::new();
        r.insert(keys::AC_POWER.to_string(), Reading::Number(ac));
        r.insert(keys::CONDITION.to_string(), Reading::Tag(condition));
        r
    }

    #[test]
    fn fault_outranks_warning_outranks_ok() {
        let now = Utc::now();
        let mut devices = BTreeMap::new();
        devices.insert("a".into(), DeviceSnapshot::fresh("a", readings(1.0, condition::OK), now));
        devices.insert(
            "b".into(),
            DeviceSnapshot::fresh("b", readings(1.0, condition::WARNING), now),
        );
        let site = SiteSnapshot::build(1, Some(now), devices.clone());
        assert_eq!(site.status, Status::Warning);

        devices.insert("c".into(), DeviceSnapshot::fresh("c", readings(1.0, condition::FAULT), now));
        let site = SiteSnapshot::build(2, Some(now), devices);
        assert_eq!(site.status, Status::Fault);
    }

    #[test]
    fn stale_devices_are_excluded_from_totals_but_kept() {
        let now = Utc::now();
        let mut devices = BTreeMap::new();
        devices.insert("a".into(), DeviceSnapshot::fresh("a", readings(100.0, condition::OK), now));
        devices.insert(
            "b".into(),
            DeviceSnapshot::fresh("b", readings(250.0, condition::OK), now).into_stale("timeout"),
        );

        let site = SiteSnapshot::build(3, Some(now), devices);

        assert_eq!(site.total(keys::AC_POWER), Some(100.0));
        assert_eq!(site.excluded, vec!["b".to_string()]);
        assert_eq!(site.devices["b"].readings.len(), 2);
        assert_eq!(site.status, Status::Warning);
        assert!(!site.is_complete());
    }

    #[test]
    fn dc_strings_sum_into_the_site_total() {
        let now = Utc::now();
        let strings: BTreeMap<String, f64> =
            [("a".to_string(), 1000.0), ("b".to_string(), 500.0)].into_iter().collect();
        let mut r = Readings::new();
        r.insert(keys::DC_POWER.to_string(), Reading::Strings(strings));
        let mut devices = BTreeMap::new();
        devices.insert("a".into(), DeviceSnapshot::fresh("a", r, now));

        let site = SiteSnapshot::build(1, Some(now), devices);

        assert_eq!(site.total(keys::DC_POWER), Some(1500.0));
    }
}
