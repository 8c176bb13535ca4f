use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use chrono_tz::Tz;
use futures::future::join_all;
use parking_lot::Mutex;
use tracing::{debug, warn};

use crate::baseline::Baselines;
use crate::batch::{HistoryBatch, OutputBatch, Sensor, SensorValue};
use crate::cache::SiteCache;
use crate::config::SiteSection;
use crate::device::Reading;
use crate::keys;
use crate::selector::{Period, Selector};
use crate::sink::Sink;
use crate::snapshot::{DeviceSnapshot, SiteSnapshot};
use crate::solar::{clearsky_irradiance, PanelProperties, SiteLocation, SolarModel};
use crate::tier::Tier;

/// Contributor name for site-wide values.
pub const SITE: &str = "site";

/// Static facts about the site the derived outputs need.
#[derive(Debug, Clone)]
pub struct SiteContext {
    pub timezone: Tz,
    pub location: SiteLocation,
    pub panels: Option<PanelProperties>,
    pub co2_kg_per_kwh: f64,
}

impl From<&SiteSection> for SiteContext {
    fn from(site: &SiteSection) -> Self {
        Self {
            timezone: site.timezone,
            location: site.location,
            panels: site.panels,
            co2_kg_per_kwh: site.co2_kg_per_kwh,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DispatchOutcome {
    pub delivered: usize,
    pub failed: usize,
}

pub struct Dispatcher {
    cache: Arc<SiteCache>,
    sinks: Vec<Arc<dyn Sink>>,
    solar: Arc<dyn SolarModel>,
    site: SiteContext,
    baselines: Mutex<Arc<Baselines>>,
}

fn round_to(value: f64, digits: i32) -> f64 {
    let factor = 10f64.powi(digits);
    (value * factor).round() / factor
}

fn reading_value(reading: &Reading) -> SensorValue {
    match reading {
        Reading::Number(v) => SensorValue::Number(*v),
        Reading::Strings(strings) => SensorValue::Map(strings.clone()),
        Reading::Tag(tag) => SensorValue::Integer(i64::from(*tag)),
    }
}

impl Dispatcher {
    pub fn new(
        cache: Arc<SiteCache>,
        sinks: Vec<Arc<dyn Sink>>,
        solar: Arc<dyn SolarModel>,
        site: SiteContext,
    ) -> Self {
        Self {
            cache,
            sinks,
            solar,
            site,
            baselines: Mutex::new(Arc::new(Baselines::default())),
        }
    }

    /// Folds a baseline read into the current set and returns whether every period is now
    /// covered for `at`.
    pub fn update_baselines(&self, newer: Baselines, at: DateTime<Utc>) -> bool {
        let mut current = self.baselines.lock();
        let mut merged = (**current).clone();
        merged.merge(newer);
        let complete = merged.is_complete(self.site.timezone, at);
        *current = Arc::new(merged);
        complete
    }

    pub fn baselines_complete(&self, at: DateTime<Utc>) -> bool {
        self.baselines.lock().is_complete(self.site.timezone, at)
    }

    pub fn sinks(&self) -> &[Arc<dyn Sink>] {
        &self.sinks
    }

    /// Reads the cache once and delivers the tier's batch to every sink.
    pub async fn dispatch(&self, tier: &Tier, at: DateTime<Utc>, boundary: bool) -> DispatchOutcome {
        let snapshot = self.cache.read();
        let batch = self.project(tier, at, boundary, &snapshot);

        let results = join_all(self.sinks.iter().map(|sink| {
            let batch = &batch;
            async move { (sink.name().to_string(), sink.deliver(batch).await) }
        }))
        .await;

        let mut outcome = DispatchOutcome::default();
        for (sink, result) in results {
            match result {
                Ok(()) => outcome.delivered += 1,
                Err(err) => {
                    outcome.failed += 1;
                    warn!(sink = %sink, tier = %tier.name, error = %err, "sink delivery failed");
                }
            }
        }
        debug!(
            tier = %tier.name,
            boundary,
            sensors = batch.sensors.len(),
            delivered = outcome.delivered,
            "dispatched"
        );
        outcome
    }

    /// Hands logged history to every sink, with the same per-sink isolation as `dispatch`.
    pub async fn dispatch_history(&self, history: &HistoryBatch) -> DispatchOutcome {
        let results = join_all(self.sinks.iter().map(|sink| async move {
            (sink.name().to_string(), sink.deliver_history(history).await)
        }))
        .await;

        let mut outcome = DispatchOutcome::default();
        for (sink, result) in results {
            match result {
                Ok(()) => outcome.delivered += 1,
                Err(err) => {
                    outcome.failed += 1;
                    warn!(sink = %sink, topic = %history.topic, error = %err, "history delivery failed");
                }
            }
        }
        outcome
    }

    /// Builds one sensor per selector of the tier, in selector order.
    pub fn project(
        &self,
        tier: &Tier,
        at: DateTime<Utc>,
        boundary: bool,
        snapshot: &SiteSnapshot,
    ) -> OutputBatch {
        let baselines = self.baselines.lock().clone();
        let sensors = tier
            .outputs
            .iter()
            .map(|selector| {
                let mut sensor = self.sensor(selector, at, snapshot, &baselines);
                if matches!(
                    selector,
                    Selector::Reading(_) | Selector::Production(_) | Selector::Co2Avoided(_) | Selector::Efficiency
                ) {
                    sensor.stale = snapshot.excluded.clone();
                }
                sensor
            })
            .collect();

        OutputBatch {
            tier: tier.name,
            timestamp: at,
            boundary,
            sensors,
        }
    }

    fn sensor(
        &self,
        selector: &Selector,
        at: DateTime<Utc>,
        snapshot: &SiteSnapshot,
        baselines: &Baselines,
    ) -> Sensor {
        let mut sensor = Sensor::new(selector.topic());
        match selector {
            Selector::Reading(key) => {
                for device in snapshot.devices.values() {
                    if let Some(reading) = device.readings.get(key) {
                        sensor.values.insert(device.device.clone(), reading_value(reading));
                    }
                }
                if keys::is_aggregate(key) {
                    if let Some(total) = snapshot.total(key) {
                        sensor.values.insert(SITE.into(), SensorValue::Number(total));
                    }
                }
            }
            Selector::Production(period) => {
                for (name, kwh) in self.production(*period, at, snapshot, baselines) {
                    sensor.values.insert(name, SensorValue::Number(round_to(kwh, 3)));
                }
            }
            Selector::Co2Avoided(period) => {
                for (name, kwh) in self.production(*period, at, snapshot, baselines) {
                    let kg = kwh * self.site.co2_kg_per_kwh;
                    sensor.values.insert(name, SensorValue::Number(round_to(kg, 2)));
                }
            }
            Selector::Efficiency => {
                for device in snapshot.devices.values() {
                    let ac = device_total(device, keys::AC_POWER);
                    let dc = device_total(device, keys::DC_POWER);
                    if let (Some(ac), Some(dc)) = (ac, dc) {
                        sensor.values.insert(device.device.clone(), SensorValue::Number(efficiency(ac, dc)));
                    }
                }
                if let (Some(ac), Some(dc)) =
                    (snapshot.total(keys::AC_POWER), snapshot.total(keys::DC_POWER))
                {
                    sensor.values.insert(SITE.into(), SensorValue::Number(efficiency(ac, dc)));
                }
            }
            Selector::SunPosition => {
                let position = self.solar.position(at);
                let value: BTreeMap<String, f64> = [
                    ("azimuth".to_string(), round_to(position.azimuth_deg, 1)),
                    ("elevation".to_string(), round_to(position.elevation_deg, 1)),
                ]
                .into_iter()
                .collect();
                sensor.values.insert(SITE.into(), SensorValue::Map(value));
            }
            Selector::Irradiance => {
                if let Some(panels) = &self.site.panels {
                    let irradiance = clearsky_irradiance(at, &self.site.location, panels);
                    sensor.values.insert(SITE.into(), SensorValue::Number(round_to(irradiance, 1)));
                }
            }
            Selector::SiteStatus => {
                for device in snapshot.devices.values() {
                    sensor.values.insert(
                        device.device.clone(),
                        SensorValue::Text(device.status.as_str().to_string()),
                    );
                }
                sensor.values.insert(SITE.into(), SensorValue::Text(snapshot.status.as_str().to_string()));
            }
        }
        sensor
    }

    /// Energy produced in `period`, kWh, per device with a baseline; the site sum covers fresh devices only.
    fn production(
        &self,
        period: Period,
        at: DateTime<Utc>,
        snapshot: &SiteSnapshot,
        baselines: &Baselines,
    ) -> Vec<(String, f64)> {
        let mut out = Vec::new();
        let mut site = None::<f64>;
        for device in snapshot.devices.values() {
            let Some(total_wh) = device_total(device, keys::TOTAL_WH) else {
                continue;
            };
            let Some(baseline) = baselines.get(&device.device, period, self.site.timezone, at) else {
                debug!(device = %device.device, period = period.as_str(), "no baseline yet");
                continue;
            };
            let kwh = (total_wh - baseline).max(0.0) / 1000.0;
            if device.is_fresh() {
                *site.get_or_insert(0.0) += kwh;
            }
            out.push((device.device.clone(), kwh));
        }
        if let Some(site) = site {
            out.push((SITE.to_string(), site));
        }
        out
    }
}

fn device_total(device: &DeviceSnapshot, key: &str) -> Option<f64> {
    device.readings.get(key).and_then(Reading::total)
}

fn efficiency(ac: f64, dc: f64) -> f64 {
    if dc == 0.0 {
        return 0.0;
    }
    round_to(ac / dc * 100.0, 2)
}

#[cfg(test)]
#[path = "dispatcher_tests.rs"]
mod tests;
