//! SMA WebConnect JSON client.

use std::collections::{BTreeMap, HashMap};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::{Client, StatusCode};
use serde_json::{json, Value};
use tokio::sync::{Mutex, OnceCell};
use tracing::{debug, info, warn};

use crate::config::{InverterConfig, UserGroup};
use crate::device::{DeviceClient, DeviceError, HistoryPoint, Reading, Readings};

/// Logger channel holding the daily total-yield samples.
const PRODUCTION_LOGGER_KEY: u32 = 28704;

const STRING_IDS: [&str; 6] = ["a", "b", "c", "d", "e", "f"];

pub struct SmaClient {
    name: String,
    base_url: String,
    group: UserGroup,
    password: String,
    http: Client,
    sid: Mutex<Option<String>>,
    scales: OnceCell<HashMap<String, f64>>,
}

impl SmaClient {
    pub fn new(config: &InverterConfig) -> Result<Self, DeviceError> {
        // WebConnect ships self-signed certificates.
        let http = Client::builder()
            .timeout(Duration::from_secs(10))
            .danger_accept_invalid_certs(true)
            .build()
            .map_err(|e| DeviceError::Unreachable(format!("failed to build HTTP client: {e}")))?;

        Ok(Self {
            name: config.name.clone(),
            base_url: config.url.trim_end_matches('/').to_string(),
            group: config.group,
            password: config.password.clone(),
            http,
            sid: Mutex::new(None),
            scales: OnceCell::new(),
        })
    }

    async fn session(&self) -> Result<String, DeviceError> {
        let mut sid = self.sid.lock().await;
        if let Some(existing) = sid.as_ref() {
            return Ok(existing.clone());
        }

        let right = match self.group {
            UserGroup::User => "usr",
            UserGroup::Installer => "istl",
        };
        let body = self
            .post("/dyn/login.json", None, json!({ "right": right, "pass": self.password }))
            .await?;
        let new_sid = parse_sid(&body)?;
        info!(device = %self.name, "logged in");
        *sid = Some(new_sid.clone());
        Ok(new_sid)
    }

    async fn scales(&self) -> Result<&HashMap<String, f64>, DeviceError> {
        self.scales
            .get_or_try_init(|| async {
                let url = format!("{}/data/ObjectMetadata_Istl.json", self.base_url);
                let resp = self.http.get(&url).send().await.map_err(transport_error)?;
                if !resp.status().is_success() {
                    return Err(DeviceError::Unreachable(format!(
                        "metadata request returned {}",
                        resp.status()
                    )));
                }
                let body: Value = resp
                    .json()
                    .await
                    .map_err(|e| DeviceError::Malformed(e.to_string()))?;
                Ok(parse_scales(&body))
            })
            .await
    }

    /// Runs one authenticated request; a rejected session is dropped so the next call logs in again.
    async fn with_session(&self, path: &str, body: Value) -> Result<Value, DeviceError> {
        let sid = self.session().await?;
        match self.post(path, Some(&sid), body).await {
            Err(DeviceError::AuthFailed(reason)) => {
                let mut current = self.sid.lock().await;
                if current.as_deref() == Some(sid.as_str()) {
                    *current = None;
                }
                debug!(device = %self.name, %reason, "session dropped");
                Err(DeviceError::AuthFailed(reason))
            }
            other => other,
        }
    }

    async fn post(&self, path: &str, sid: Option<&str>, body: Value) -> Result<Value, DeviceError> {
        let mut url = format!("{}{}", self.base_url, path);
        if let Some(sid) = sid {
            url.push_str("?sid=");
            url.push_str(sid);
        }

        let resp = self
            .http
            .post(&url)
            .json(&body)
            .send()
            .await
            .map_err(transport_error)?;

        match resp.status() {
            StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => {
                return Err(DeviceError::AuthFailed(format!("HTTP {}", resp.status())));
            }
            status if !status.is_success() => {
                return Err(DeviceError::Unreachable(format!("HTTP {status}")));
            }
            _ => {}
        }

        let value: Value = resp
            .json()
            .await
            .map_err(|e| DeviceError::Malformed(e.to_string()))?;
        check_err(&value)?;
        Ok(value)
    }
}

#[async_trait]
impl DeviceClient for SmaClient {
    fn name(&self) -> &str {
        &self.name
    }

    async fn fetch(&self) -> Result<Readings, DeviceError> {
        let scales = self.scales().await?;
        let body = self
            .with_session("/dyn/getAllOnlValues.json", json!({ "destDev": [] }))
            .await?;
        parse_values(&body, scales)
    }

    async fn fetch_history(
        &self,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<HistoryPoint>, DeviceError> {
        let body = self
            .with_session(
                "/dyn/getLogger.json",
                json!({
                    "destDev": [],
                    "key": PRODUCTION_LOGGER_KEY,
                    "tStart": start.timestamp(),
                    "tEnd": end.timestamp(),
                }),
            )
            .await?;
        parse_history(&body)
    }

    async fn close(&self) -> Result<(), DeviceError> {
        let Some(sid) = self.sid.lock().await.take() else {
            return Ok(());
        };
        self.post("/dyn/logout.json", Some(&sid), json!({})).await?;
        info!(device = %self.name, "logged out");
        Ok(())
    }
}

fn transport_error(e: reqwest::Error) -> DeviceError {
    if e.is_timeout() {
        DeviceError::Timeout
    } else {
        DeviceError::Unreachable(e.to_string())
    }
}

/// Maps the `err` field WebConnect returns with HTTP 200.
pub fn check_err(body: &Value) -> Result<(), DeviceError> {
    match body.get("err").and_then(Value::as_i64) {
        None => Ok(()),
        Some(401) => Err(DeviceError::AuthFailed("session rejected".into())),
        Some(503) => Err(DeviceError::AuthFailed("no free session slot".into())),
        Some(code) => Err(DeviceError::Malformed(format!("device error {code}"))),
    }
}

pub fn parse_sid(body: &Value) -> Result<String, DeviceError> {
    body.pointer("/result/sid")
        .and_then(Value::as_str)
        .filter(|sid| !sid.is_empty())
        .map(str::to_string)
        .ok_or_else(|| DeviceError::AuthFailed("login returned no session id".into()))
}

/// Key to scale factor from `ObjectMetadata_Istl.json`; keys without a scale are omitted.
pub fn parse_scales(body: &Value) -> HashMap<String, f64> {
    let Some(objects) = body.as_object() else {
        return HashMap::new();
    };
    objects
        .iter()
        .filter_map(|(key, meta)| {
            let scale = meta.get("Scale")?.as_f64()?;
            Some((key.clone(), scale))
        })
        .collect()
}

/// The payload of the single device (`result.<uid>`) in a WebConnect response.
fn device_result(body: &Value) -> Result<&Value, DeviceError> {
    body.get("result")
        .and_then(Value::as_object)
        .and_then(|devices| devices.values().next())
        .ok_or_else(|| DeviceError::Malformed("response has no result".into()))
}

pub fn parse_values(body: &Value, scales: &HashMap<String, f64>) -> Result<Readings, DeviceError> {
    let values = device_result(body)?
        .as_object()
        .ok_or_else(|| DeviceError::Malformed("values are not an object".into()))?;

    let mut readings = Readings::new();
    for (key, channels) in values {
        let Some(entries) = channels
            .get("1")
            .or_else(|| channels.as_object().and_then(|c| c.values().next()))
            .and_then(Value::as_array)
        else {
            continue;
        };
        let scale = scales.get(key).copied().unwrap_or(1.0);
        match parse_entries(entries, scale) {
            Some(reading) => {
                readings.insert(key.clone(), reading);
            }
            None => debug!(key = %key, "skipping unsupported value"),
        }
    }
    Ok(readings)
}

fn parse_entries(entries: &[Value], scale: f64) -> Option<Reading> {
    let first = entries.first()?;
    if let Some(tags) = first.get("val").and_then(Value::as_array) {
        let tag = tags.first()?.get("tag")?.as_u64()?;
        return u32::try_from(tag).ok().map(Reading::Tag);
    }

    let mut numbers = Vec::with_capacity(entries.len());
    for entry in entries {
        let value = match entry.get("val") {
            None | Some(Value::Null) => 0.0,
            Some(v) => v.as_f64()?,
        };
        numbers.push(if scale != 1.0 { value * scale } else { value });
    }

    if numbers.len() == 1 {
        return Some(Reading::Number(numbers[0]));
    }
    let strings: BTreeMap<String, f64> = STRING_IDS
        .iter()
        .zip(numbers)
        .map(|(id, v)| (id.to_string(), v))
        .collect();
    Some(Reading::Strings(strings))
}

pub fn parse_history(body: &Value) -> Result<Vec<HistoryPoint>, DeviceError> {
    let points = device_result(body)?
        .as_array()
        .ok_or_else(|| DeviceError::Malformed("logger result is not a list".into()))?;

    let history = points
        .iter()
        .filter_map(|p| {
            let t = p.get("t")?.as_i64()?;
            Some(HistoryPoint {
                t,
                v: p.get("v").and_then(Value::as_f64),
            })
        })
        .collect::<Vec<_>>();

    if history.len() < points.len() {
        warn!(dropped = points.len() - history.len(), "logger points without a timestamp");
    }
    Ok(history)
}

#[cfg(test)]
#[path = "sma_tests.rs"]
mod tests;
