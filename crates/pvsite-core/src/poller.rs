use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use chrono_tz::Tz;
use futures::future::join_all;
use parking_lot::Mutex;
use tokio::time::timeout;
use tracing::{debug, info, warn};

use crate::baseline::{self, Baseline, Baselines, DeviceBaselines};
use crate::cache::SiteCache;
use crate::device::{DeviceClient, DeviceError, HistoryPoint, Readings};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PollSummary {
    pub succeeded: usize,
    pub failed: usize,
    /// Devices that crossed the failure threshold in this cycle.
    pub marked_stale: usize,
}

/// Fans a fetch out to every device and feeds the results into the [`SiteCache`].
pub struct Poller {
    devices: Vec<Arc<dyn DeviceClient>>,
    cache: Arc<SiteCache>,
    timeout: Duration,
    stale_after: u32,
    failures: Mutex<HashMap<String, u32>>,
    cycle: tokio::sync::Mutex<()>,
}

enum Outcome {
    Ok,
    Failed,
    MarkedStale,
}

impl Poller {
    pub fn new(
        devices: Vec<Arc<dyn DeviceClient>>,
        cache: Arc<SiteCache>,
        timeout: Duration,
        stale_after: u32,
    ) -> Self {
        Self {
            devices,
            cache,
            timeout,
            stale_after: stale_after.max(1),
            failures: Mutex::new(HashMap::new()),
            cycle: tokio::sync::Mutex::new(()),
        }
    }

    pub fn cache(&self) -> &Arc<SiteCache> {
        &self.cache
    }

    /// One poll cycle. Cycles never overlap; a caller arriving mid-cycle waits for it to finish.
    pub async fn poll_all(&self) -> PollSummary {
        let _cycle = self.cycle.lock().await;

        let outcomes = join_all(self.devices.iter().map(|device| async move {
            let result = self.fetch_one(device.as_ref()).await;
            self.record(device.name(), result, Utc::now())
        }))
        .await;

        let mut summary = PollSummary::default();
        for outcome in outcomes {
            match outcome {
                Outcome::Ok => summary.succeeded += 1,
                Outcome::Failed => summary.failed += 1,
                Outcome::MarkedStale => {
                    summary.failed += 1;
                    summary.marked_stale += 1;
                }
            }
        }
        debug!(
            succeeded = summary.succeeded,
            failed = summary.failed,
            "poll cycle complete"
        );
        summary
    }

    async fn fetch_one(&self, device: &dyn DeviceClient) -> Result<Readings, DeviceError> {
        match timeout(self.timeout, device.fetch()).await {
            Ok(result) => result,
            Err(_) => Err(DeviceError::Timeout),
        }
    }

    fn record(
        &self,
        device: &str,
        result: Result<Readings, DeviceError>,
        at: DateTime<Utc>,
    ) -> Outcome {
        match result {
            Ok(readings) => {
                let previous = self.failures.lock().insert(device.to_string(), 0).unwrap_or(0);
                if previous >= self.stale_after {
                    info!(device = %device, failures = previous, "device recovered");
                }
                self.cache.merge(device, readings, at);
                Outcome::Ok
            }
            Err(err) => {
                let count = {
                    let mut failures = self.failures.lock();
                    let count = failures.entry(device.to_string()).or_insert(0);
                    *count = count.saturating_add(1);
                    *count
                };
                if count == self.stale_after {
                    warn!(device = %device, failures = count, error = %err, "device marked stale");
                    self.cache.mark_stale(device, &err.to_string());
                    Outcome::MarkedStale
                } else {
                    debug!(device = %device, failures = count, error = %err, "device poll failed");
                    Outcome::Failed
                }
            }
        }
    }

    pub fn device_names(&self) -> impl Iterator<Item = &str> {
        self.devices.iter().map(|device| device.name())
    }

    /// Meter readings at the start of today, this month and this year, per device.
    /// Periods that could not be read are left empty.
    pub async fn read_baselines(&self, tz: Tz, now: DateTime<Utc>) -> Baselines {
        let per_device = join_all(self.devices.iter().map(|device| async move {
            let mut baselines = DeviceBaselines::default();
            for period in baseline::READ_PERIODS {
                let Some((start, end)) = baseline::history_window(period, tz, now) else {
                    continue;
                };
                let Some(period_start) = baseline::period_start(period, tz, now) else {
                    continue;
                };
                match self.history_one(device.as_ref(), start, end).await {
                    Ok(points) => {
                        let value = baseline::baseline_from_history(&points, period_start);
                        if value.is_none() {
                            debug!(device = %device.name(), period = period.as_str(), "no baseline in logger history");
                        }
                        baselines.set(period, value.map(|wh| Baseline { start: period_start, wh }));
                    }
                    Err(err) => {
                        debug!(device = %device.name(), period = period.as_str(), error = %err, "failed to read baseline");
                    }
                }
            }
            (device.name().to_string(), baselines)
        }))
        .await;

        let mut baselines = Baselines::default();
        for (device, b) in per_device {
            baselines.insert(device, b);
        }
        baselines
    }

    /// Logger history for `[start, end]` from every device. A device that fails is asked again
    /// after `retry_delay`, up to `attempts` rounds; devices still failing are left out.
    pub async fn read_history(
        &self,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
        attempts: u32,
        retry_delay: Duration,
    ) -> BTreeMap<String, Vec<HistoryPoint>> {
        let mut series = BTreeMap::new();
        for attempt in 1..=attempts.max(1) {
            let missing: Vec<&Arc<dyn DeviceClient>> = self
                .devices
                .iter()
                .filter(|device| !series.contains_key(device.name()))
                .collect();
            let results = join_all(missing.into_iter().map(|device| async move {
                (device.name(), self.history_one(device.as_ref(), start, end).await)
            }))
            .await;
            for (device, result) in results {
                match result {
                    Ok(points) => {
                        series.insert(device.to_string(), points);
                    }
                    Err(err) => {
                        debug!(device = %device, attempt, error = %err, "history read failed");
                    }
                }
            }
            if series.len() == self.devices.len() || attempt >= attempts {
                break;
            }
            tokio::time::sleep(retry_delay).await;
        }
        series
    }

    async fn history_one(
        &self,
        device: &dyn DeviceClient,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<HistoryPoint>, DeviceError> {
        match timeout(self.timeout, device.fetch_history(start, end)).await {
            Ok(result) => result,
            Err(_) => Err(DeviceError::Timeout),
        }
    }

    pub async fn close_all(&self) {
        let results = join_all(self.devices.iter().map(|device| async move {
            (device.name().to_string(), device.close().await)
        }))
        .await;
        for (device, result) in results {
            if let Err(err) = result {
                warn!(device = %device, error = %err, "failed to close device session");
            }
        }
    }
}

#[cfg(test)]
#[path = "poller_tests.rs"]
mod tests;
