//! InfluxDB v2 line-protocol writer.

use std::time::{Duration, Instant};

use async_trait::async_trait;
use chrono::{DateTime, Days, SecondsFormat, Utc};
use chrono_tz::Tz;
use parking_lot::Mutex;
use reqwest::Client;
use serde_json::json;
use tracing::{debug, info, warn};

use crate::baseline;
use crate::batch::{HistoryBatch, OutputBatch, Sensor, SensorValue};
use crate::config::{InfluxConfig, PruneRule};
use crate::selector::{Period, Selector};
use crate::sink::{Sink, SinkError};

const PRUNE_EVERY: Duration = Duration::from_secs(24 * 3600);

/// Topic to (measurement, field).
const LP_MAPPING: [(&str, &str, &str); 28] = [
    ("ac_measurements/power", "ac_measurements", "power"),
    ("ac_measurements/frequency", "ac_measurements", "frequency"),
    ("ac_measurements/efficiency", "ac_measurements", "efficiency"),
    ("ac_measurements/excitation_type", "ac_measurements", "excitation_type"),
    ("ac_measurements/voltage/phase_l1", "ac_measurements", "voltage_l1"),
    ("ac_measurements/voltage/phase_l2", "ac_measurements", "voltage_l2"),
    ("ac_measurements/voltage/phase_l1_l2", "ac_measurements", "voltage_l1_l2"),
    ("dc_measurements/power", "dc_measurements", "power"),
    ("dc_measurements/voltage", "dc_measurements", "voltage"),
    ("dc_measurements/current", "dc_measurements", "current"),
    ("status/reason_for_derating", "status", "derating"),
    ("status/general_operating_status", "status", "operating_status"),
    ("status/grid_relay", "status", "grid_relay"),
    ("status/condition", "status", "condition"),
    ("site/status", "status", "site"),
    ("production/current", "production", "current"),
    ("production/total_wh", "production", "total_wh"),
    ("production/midnight", "production", "midnight"),
    ("production/today", "production", "today"),
    ("production/month", "production", "month"),
    ("production/year", "production", "year"),
    ("production/lifetime", "production", "lifetime"),
    ("co2avoided/today", "co2avoided", "today"),
    ("co2avoided/month", "co2avoided", "month"),
    ("co2avoided/year", "co2avoided", "year"),
    ("co2avoided/lifetime", "co2avoided", "lifetime"),
    ("sun/position", "sun", "position"),
    ("sun/irradiance", "sun", "irradiance"),
];

fn lookup(topic: &str) -> Option<(&'static str, &'static str)> {
    LP_MAPPING
        .iter()
        .find(|(t, _, _)| *t == topic)
        .map(|(_, measurement, field)| (*measurement, *field))
}

/// Escapes commas, spaces and equals signs in tag values.
fn escape_tag(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    for c in value.chars() {
        if matches!(c, ',' | ' ' | '=') {
            out.push('\\');
        }
        out.push(c);
    }
    out
}

fn escape_string(value: &str) -> String {
    value.replace('\\', "\\\\").replace('"', "\\\"")
}

/// Field set for one value; `None` when nothing in it can be written.
fn field_set(field: &str, value: &SensorValue) -> Option<String> {
    match value {
        SensorValue::Integer(v) => Some(format!("{field}={v}i")),
        SensorValue::Number(v) => v.is_finite().then(|| format!("{field}={v}")),
        SensorValue::Text(v) => Some(format!("{field}=\"{}\"", escape_string(v))),
        SensorValue::Map(values) => {
            let fields: Vec<String> = values
                .iter()
                .filter(|(_, v)| v.is_finite())
                .map(|(k, v)| format!("{}={v}", escape_tag(k)))
                .collect();
            (!fields.is_empty()).then(|| fields.join(","))
        }
    }
}

/// Point time for a sensor: production and CO2 totals are stamped at the start of their period.
fn point_time(sensor: &Sensor, batch_time: DateTime<Utc>, tz: Tz) -> i64 {
    let period = match sensor.topic.parse::<Selector>() {
        Ok(Selector::Production(period)) | Ok(Selector::Co2Avoided(period)) => period,
        _ => return batch_time.timestamp(),
    };
    if period == Period::Lifetime {
        return batch_time.timestamp();
    }
    baseline::period_start(period, tz, batch_time)
        .unwrap_or(batch_time)
        .timestamp()
}

/// Line-protocol lines for a batch. Unmapped topics and stale contributors are skipped.
pub fn encode_batch(batch: &OutputBatch, tz: Tz) -> Vec<String> {
    let mut lines = Vec::new();
    for sensor in &batch.sensors {
        let Some((measurement, field)) = lookup(&sensor.topic) else {
            debug!(topic = %sensor.topic, "no line-protocol mapping, skipping");
            continue;
        };
        let ts = point_time(sensor, batch.timestamp, tz);
        for (contributor, value) in &sensor.values {
            if sensor.stale.contains(contributor) {
                continue;
            }
            let Some(fields) = field_set(field, value) else {
                continue;
            };
            lines.push(format!(
                "{measurement},inverter={} {fields} {ts}",
                escape_tag(contributor)
            ));
        }
    }
    lines
}

/// Line-protocol lines for logged history; each point keeps its logger timestamp.
pub fn encode_history(history: &HistoryBatch) -> Vec<String> {
    let Some((measurement, field)) = lookup(&history.topic) else {
        debug!(topic = %history.topic, "no line-protocol mapping, skipping");
        return Vec::new();
    };
    let mut lines = Vec::new();
    for (contributor, points) in &history.series {
        for point in points {
            let Some(v) = point.v.filter(|v| v.is_finite()) else {
                continue;
            };
            lines.push(format!(
                "{measurement},inverter={} {field}={}i {}",
                escape_tag(contributor),
                v.round() as i64,
                point.t
            ));
        }
    }
    lines
}

/// Delete request bodies for the rules due at `now`: everything from the epoch up to local
/// midnight `keep_last` days ago.
pub fn prune_requests(
    rules: &[PruneRule],
    tz: Tz,
    now: DateTime<Utc>,
) -> Vec<(&PruneRule, serde_json::Value)> {
    let today = now.with_timezone(&tz).date_naive();
    rules
        .iter()
        .filter_map(|rule| {
            let cutoff = today.checked_sub_days(Days::new(u64::from(rule.keep_last)))?;
            let stop = baseline::local_midnight(tz, cutoff);
            let body = json!({
                "start": "1970-01-01T00:00:00Z",
                "stop": stop.to_rfc3339_opts(SecondsFormat::Secs, true),
                "predicate": rule.predicate,
            });
            Some((rule, body))
        })
        .collect()
}

pub struct InfluxSink {
    write_url: String,
    delete_url: String,
    token: String,
    timezone: Tz,
    pruning: Vec<PruneRule>,
    last_prune: Mutex<Option<Instant>>,
    http: Client,
}

impl InfluxSink {
    pub fn new(config: &InfluxConfig, timezone: Tz) -> Result<Self, SinkError> {
        let http = Client::builder()
            .timeout(Duration::from_secs(10))
            .build()
            .map_err(|e| SinkError::Write(format!("failed to build HTTP client: {e}")))?;
        let base = config.url.trim_end_matches('/');
        let endpoint = |path: &str, params: &[(&str, &str)]| {
            reqwest::Url::parse_with_params(&format!("{base}{path}"), params)
                .map(|url| url.to_string())
                .map_err(|e| SinkError::Write(format!("invalid InfluxDB url: {e}")))
        };
        let write_url = endpoint(
            "/api/v2/write",
            &[
                ("org", config.org.as_str()),
                ("bucket", config.bucket.as_str()),
                ("precision", "s"),
            ],
        )?;
        let delete_url = endpoint(
            "/api/v2/delete",
            &[("org", config.org.as_str()), ("bucket", config.bucket.as_str())],
        )?;

        Ok(Self {
            write_url,
            delete_url,
            token: config.token.clone(),
            timezone,
            pruning: config.pruning.clone(),
            last_prune: Mutex::new(None),
            http,
        })
    }

    async fn write(&self, lines: &[String]) -> Result<(), SinkError> {
        let resp = self
            .http
            .post(&self.write_url)
            .header("Authorization", format!("Token {}", self.token))
            .header("Content-Type", "text/plain; charset=utf-8")
            .body(lines.join("\n"))
            .send()
            .await
            .map_err(|e| SinkError::Write(e.to_string()))?;

        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(SinkError::Write(format!("HTTP {status}: {body}")));
        }
        Ok(())
    }

    /// Runs every pruning rule once. Returns the number of delete requests issued.
    pub async fn prune(&self, now: DateTime<Utc>) -> Result<usize, SinkError> {
        let requests = prune_requests(&self.pruning, self.timezone, now);
        for (rule, body) in &requests {
            let resp = self
                .http
                .post(&self.delete_url)
                .header("Authorization", format!("Token {}", self.token))
                .json(body)
                .send()
                .await
                .map_err(|e| SinkError::Write(e.to_string()))?;
            let status = resp.status();
            if !status.is_success() {
                let text = resp.text().await.unwrap_or_default();
                return Err(SinkError::Write(format!("prune '{}': HTTP {status}: {text}", rule.name)));
            }
            info!(rule = %rule.name, keep_last = rule.keep_last, "pruned InfluxDB bucket");
        }
        Ok(requests.len())
    }

    fn prune_due(&self) -> bool {
        if self.pruning.is_empty() {
            return false;
        }
        let mut last = self.last_prune.lock();
        if last.map_or(true, |at| at.elapsed() >= PRUNE_EVERY) {
            *last = Some(Instant::now());
            return true;
        }
        false
    }
}

#[async_trait]
impl Sink for InfluxSink {
    fn name(&self) -> &str {
        "influxdb2"
    }

    async fn deliver(&self, batch: &OutputBatch) -> Result<(), SinkError> {
        let lines = encode_batch(batch, self.timezone);
        if !lines.is_empty() {
            self.write(&lines).await?;
            debug!(points = lines.len(), tier = %batch.tier, "wrote points");
        }

        if self.prune_due() {
            if let Err(err) = self.prune(Utc::now()).await {
                warn!(error = %err, "InfluxDB pruning failed");
            }
        }
        Ok(())
    }

    async fn deliver_history(&self, history: &HistoryBatch) -> Result<(), SinkError> {
        let lines = encode_history(history);
        if lines.is_empty() {
            return Ok(());
        }
        self.write(&lines).await?;
        debug!(points = lines.len(), topic = %history.topic, "wrote history points");
        Ok(())
    }
}
