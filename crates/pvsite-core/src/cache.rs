use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use tokio::sync::watch;
use tracing::warn;

use crate::device::Readings;
use crate::snapshot::{DeviceSnapshot, SiteSnapshot};

struct CacheState {
    devices: BTreeMap<String, DeviceSnapshot>,
    generation: u64,
}

/// Site-level view of every configured device.
///
/// Writers rebuild the whole [`SiteSnapshot`] under the state lock and publish it with a single
/// pointer swap; readers only ever clone the published `Arc`.
pub struct SiteCache {
    state: Mutex<CacheState>,
    published: watch::Sender<Arc<SiteSnapshot>>,
}

impl SiteCache {
    pub fn new<I, S>(devices: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let devices: BTreeMap<String, DeviceSnapshot> = devices
            .into_iter()
            .map(Into::into)
            .map(|name: String| (name.clone(), DeviceSnapshot::pending(name)))
            .collect();
        let initial = SiteSnapshot::build(0, None, devices.clone());
        let (published, _) = watch::channel(Arc::new(initial));

        Self {
            state: Mutex::new(CacheState {
                devices,
                generation: 0,
            }),
            published,
        }
    }

    pub fn merge(&self, device: &str, readings: Readings, fetched_at: DateTime<Utc>) {
        self.update(device, |_| DeviceSnapshot::fresh(device, readings, fetched_at));
    }

    /// Flags a device stale while keeping its last readings.
    pub fn mark_stale(&self, device: &str, reason: &str) {
        self.update(device, |previous| previous.into_stale(reason));
    }

    pub fn read(&self) -> Arc<SiteSnapshot> {
        self.published.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<Arc<SiteSnapshot>> {
        self.published.subscribe()
    }

    fn update(&self, device: &str, apply: impl FnOnce(DeviceSnapshot) -> DeviceSnapshot) {
        let mut state = self.state.lock();
        let Some(previous) = state.devices.get(device).cloned() else {
            warn!(device = %device, "ignoring update for unconfigured device");
            return;
        };
        state.devices.insert(device.to_string(), apply(previous));
        state.generation += 1;

        let snapshot =
            SiteSnapshot::build(state.generation, Some(Utc::now()), state.devices.clone());
        self.published.send_replace(Arc::new(snapshot));
    }
}

#[cfg(test)]
#[path = "cache_tests.rs"]
mod tests;
