use std::collections::BTreeMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// One sensor value as reported by an inverter.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Reading {
    Number(f64),
    /// One value per DC string, keyed `a`, `b`, `c`.
    Strings(BTreeMap<String, f64>),
    /// Enumerated status tag.
    Tag(u32),
}

impl Reading {
    /// Numeric total of the reading; string readings are summed, tags have no total.
    pub fn total(&self) -> Option<f64> {
        match self {
            Reading::Number(v) => Some(*v),
            Reading::Strings(strings) => Some(strings.values().sum()),
            Reading::Tag(_) => None,
        }
    }

    pub fn tag(&self) -> Option<u32> {
        match self {
            Reading::Tag(tag) => Some(*tag),
            _ => None,
        }
    }
}

/// Sensor key (SMA object id) to reading.
pub type Readings = BTreeMap<String, Reading>;

/// One point of the production logger: unix seconds and meter value in Wh.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct HistoryPoint {
    pub t: i64,
    pub v: Option<f64>,
}

#[derive(Debug, Error)]
pub enum DeviceError {
    #[error("device unreachable: {0}")]
    Unreachable(String),
    #[error("authentication failed: {0}")]
    AuthFailed(String),
    #[error("timeout")]
    Timeout,
    #[error("malformed response: {0}")]
    Malformed(String),
}

/// Access to one physical inverter.
#[async_trait]
pub trait DeviceClient: Send + Sync {
    fn name(&self) -> &str;
    async fn fetch(&self) -> Result<Readings, DeviceError>;
    async fn fetch_history(
        &self,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<HistoryPoint>, DeviceError>;
    async fn close(&self) -> Result<(), DeviceError>;
}
