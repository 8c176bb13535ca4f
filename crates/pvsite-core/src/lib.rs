pub mod baseline;
pub mod batch;
pub mod cache;
pub mod config;
pub mod device;
pub mod dispatcher;
pub mod influx;
pub mod keys;
pub mod mqtt;
pub mod poller;
pub mod scheduler;
pub mod selector;
pub mod sink;
pub mod sma;
pub mod snapshot;
pub mod solar;
pub mod tier;

#[cfg(test)]
mod testing;

pub use batch::{HistoryBatch, OutputBatch, Sensor, SensorValue};
pub use cache::SiteCache;
pub use config::{ConfigError, SiteConfig};
pub use device::{DeviceClient, DeviceError, HistoryPoint, Reading, Readings};
pub use dispatcher::{DispatchOutcome, Dispatcher, SiteContext};
pub use poller::{PollSummary, Poller};
pub use scheduler::{SchedulerReport, SchedulerSettings, TierScheduler};
pub use selector::{Period, Selector};
pub use sink::{Sink, SinkError};
pub use snapshot::{DeviceSnapshot, Freshness, SiteSnapshot, Status};
pub use solar::{Astronomical, SolarModel, SolarPosition};
pub use tier::{Mode, Tier, TierName, TierPlan};
