use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::device::HistoryPoint;
use crate::dispatcher::SITE;
use crate::tier::TierName;

/// A value published for one contributor of a sensor.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum SensorValue {
    Integer(i64),
    Number(f64),
    /// Per-string values, or a compound value such as sun position.
    Map(BTreeMap<String, f64>),
    Text(String),
}

/// One selector's output: contributor (device name or `site`) to value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Sensor {
    pub topic: String,
    pub values: BTreeMap<String, SensorValue>,
    /// Devices whose value is carried over from an earlier successful read.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub stale: Vec<String>,
}

impl Sensor {
    pub fn new(topic: impl Into<String>) -> Self {
        Self {
            topic: topic.into(),
            values: BTreeMap::new(),
            stale: Vec::new(),
        }
    }

    pub fn with(mut self, contributor: impl Into<String>, value: SensorValue) -> Self {
        self.values.insert(contributor.into(), value);
        self
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutputBatch {
    pub tier: TierName,
    pub timestamp: DateTime<Utc>,
    /// Set on the single tick emitted at a day/night transition.
    pub boundary: bool,
    pub sensors: Vec<Sensor>,
}

impl OutputBatch {
    pub fn topics(&self) -> Vec<&str> {
        self.sensors.iter().map(|s| s.topic.as_str()).collect()
    }

    pub fn sensor(&self, topic: &str) -> Option<&Sensor> {
        self.sensors.iter().find(|s| s.topic == topic)
    }
}

/// Logged meter values per contributor, each point carrying its own timestamp.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HistoryBatch {
    pub topic: String,
    pub series: BTreeMap<String, Vec<HistoryPoint>>,
}

impl HistoryBatch {
    pub fn new(topic: impl Into<String>, series: BTreeMap<String, Vec<HistoryPoint>>) -> Self {
        Self {
            topic: topic.into(),
            series,
        }
    }

    /// Adds a `site` series summing the devices at every timestamp all of them logged.
    pub fn with_site_total(mut self) -> Self {
        let mut sums: BTreeMap<i64, (usize, f64)> = BTreeMap::new();
        for points in self.series.values() {
            for point in points {
                if let Some(v) = point.v {
                    let entry = sums.entry(point.t).or_insert((0, 0.0));
                    entry.0 += 1;
                    entry.1 += v;
                }
            }
        }
        let devices = self.series.len();
        let site = sums
            .into_iter()
            .filter(|(_, (count, _))| *count == devices)
            .map(|(t, (_, v))| HistoryPoint { t, v: Some(v) })
            .collect();
        self.series.insert(SITE.to_string(), site);
        self
    }
}
