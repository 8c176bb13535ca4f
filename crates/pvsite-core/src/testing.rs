//! Fakes shared by the unit tests.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;

use crate::batch::{HistoryBatch, OutputBatch};
use crate::device::{DeviceClient, DeviceError, HistoryPoint, Reading, Readings};
use crate::keys;
use crate::sink::{Sink, SinkError};
use crate::solar::{SolarModel, SolarPosition};

pub fn readings(ac_power: f64, total_wh: f64) -> Readings {
    let mut r = Readings::new();
    r.insert(keys::AC_POWER.to_string(), Reading::Number(ac_power));
    r.insert(keys::TOTAL_WH.to_string(), Reading::Number(total_wh));
    r
}

pub enum Step {
    Ok(Readings),
    Fail,
    Hang,
}

/// Device answering from a script; the last step repeats once the script runs out.
pub struct FakeDevice {
    name: String,
    script: Mutex<VecDeque<Step>>,
    last: Mutex<Option<Readings>>,
    history: Vec<HistoryPoint>,
    history_failures: AtomicUsize,
    pub fetches: AtomicUsize,
    pub history_reads: AtomicUsize,
    pub closes: AtomicUsize,
}

impl FakeDevice {
    pub fn new(name: &str, script: Vec<Step>) -> Self {
        Self {
            name: name.to_string(),
            script: Mutex::new(script.into()),
            last: Mutex::new(None),
            history: Vec::new(),
            history_failures: AtomicUsize::new(0),
            fetches: AtomicUsize::new(0),
            history_reads: AtomicUsize::new(0),
            closes: AtomicUsize::new(0),
        }
    }

    pub fn healthy(name: &str, readings: Readings) -> Self {
        Self::new(name, vec![Step::Ok(readings)])
    }

    pub fn with_history(mut self, history: Vec<HistoryPoint>) -> Self {
        self.history = history;
        self
    }

    /// The first `reads` history requests fail.
    pub fn with_failing_history(self, reads: usize) -> Self {
        self.history_failures.store(reads, Ordering::SeqCst);
        self
    }
}

#[async_trait]
impl DeviceClient for FakeDevice {
    fn name(&self) -> &str {
        &self.name
    }

    async fn fetch(&self) -> Result<Readings, DeviceError> {
        self.fetches.fetch_add(1, Ordering::SeqCst);
        let step = {
            let mut script = self.script.lock();
            if script.len() > 1 {
                script.pop_front()
            } else {
                script.front().map(|s| match s {
                    Step::Ok(r) => Step::Ok(r.clone()),
                    Step::Fail => Step::Fail,
                    Step::Hang => Step::Hang,
                })
            }
        };
        match step {
            Some(Step::Ok(r)) => {
                *self.last.lock() = Some(r.clone());
                Ok(r)
            }
            Some(Step::Fail) => Err(DeviceError::Unreachable("connection refused".into())),
            Some(Step::Hang) => {
                tokio::time::sleep(Duration::from_secs(3600)).await;
                Err(DeviceError::Timeout)
            }
            None => Ok(self.last.lock().clone().unwrap_or_default()),
        }
    }

    async fn fetch_history(
        &self,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<HistoryPoint>, DeviceError> {
        self.history_reads.fetch_add(1, Ordering::SeqCst);
        let failing = self
            .history_failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if failing {
            return Err(DeviceError::Unreachable("logger asleep".into()));
        }
        let (start, end) = (start.timestamp(), end.timestamp());
        Ok(self
            .history
            .iter()
            .copied()
            .filter(|p| p.t >= start && p.t <= end)
            .collect())
    }

    async fn close(&self) -> Result<(), DeviceError> {
        self.closes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

/// Sink that keeps every batch, optionally taking `delay` per delivery.
pub struct RecordingSink {
    name: String,
    delay: Duration,
    fail: bool,
    pub batches: Mutex<Vec<OutputBatch>>,
    pub histories: Mutex<Vec<HistoryBatch>>,
    pub in_flight: AtomicUsize,
    pub max_in_flight: AtomicUsize,
    pub calls: AtomicUsize,
}

impl RecordingSink {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            delay: Duration::ZERO,
            fail: false,
            batches: Mutex::new(Vec::new()),
            histories: Mutex::new(Vec::new()),
            in_flight: AtomicUsize::new(0),
            max_in_flight: AtomicUsize::new(0),
            calls: AtomicUsize::new(0),
        }
    }

    pub fn slow(name: &str, delay: Duration) -> Self {
        Self {
            delay,
            ..Self::new(name)
        }
    }

    pub fn failing(name: &str) -> Self {
        Self {
            fail: true,
            ..Self::new(name)
        }
    }

    pub fn batches(&self) -> Vec<OutputBatch> {
        self.batches.lock().clone()
    }
}

#[async_trait]
impl Sink for RecordingSink {
    fn name(&self) -> &str {
        &self.name
    }

    async fn deliver(&self, batch: &OutputBatch) -> Result<(), SinkError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(now, Ordering::SeqCst);
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        self.in_flight.fetch_sub(1, Ordering::SeqCst);
        if self.fail {
            return Err(SinkError::Publish("broker unavailable".into()));
        }
        self.batches.lock().push(batch.clone());
        Ok(())
    }

    async fn deliver_history(&self, history: &HistoryBatch) -> Result<(), SinkError> {
        if self.fail {
            return Err(SinkError::Write("bucket not found".into()));
        }
        self.histories.lock().push(history.clone());
        Ok(())
    }
}

/// Returns elevations from a list, one per call, repeating the last.
pub struct ScriptedSun {
    elevations: Vec<f64>,
    calls: AtomicUsize,
}

impl ScriptedSun {
    pub fn new(elevations: Vec<f64>) -> Self {
        Self {
            elevations,
            calls: AtomicUsize::new(0),
        }
    }
}

impl SolarModel for ScriptedSun {
    fn position(&self, _at: DateTime<Utc>) -> SolarPosition {
        let idx = self.calls.fetch_add(1, Ordering::SeqCst);
        let elevation = self
            .elevations
            .get(idx)
            .or(self.elevations.last())
            .copied()
            .unwrap_or(0.0);
        SolarPosition {
            azimuth_deg: 180.0,
            elevation_deg: elevation,
        }
    }
}
