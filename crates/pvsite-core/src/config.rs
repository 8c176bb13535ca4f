use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};
use std::time::Duration;

use chrono_tz::Tz;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::selector::Selector;
use crate::solar::{PanelProperties, SiteLocation};
use crate::tier::{Tier, TierName, TierPlan};

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to parse config: {0}")]
    Yaml(#[from] serde_yaml::Error),
    #[error("environment placeholder: {0}")]
    Env(String),
    #[error("invalid config: {0}")]
    Invalid(String),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SiteConfig {
    pub site: SiteSection,
    pub inverters: Vec<InverterConfig>,
    #[serde(default)]
    pub sampling: SamplingConfig,
    pub mqtt: Option<MqttConfig>,
    pub influxdb2: Option<InfluxConfig>,
    pub archive: Option<ArchiveConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SiteSection {
    pub name: String,
    pub timezone: Tz,
    pub location: SiteLocation,
    /// Sun elevation separating day from night; civil twilight by default.
    #[serde(default = "default_horizon")]
    pub horizon_deg: f64,
    #[serde(default = "default_co2")]
    pub co2_kg_per_kwh: f64,
    pub panels: Option<PanelProperties>,
}

fn default_horizon() -> f64 {
    -6.0
}

fn default_co2() -> f64 {
    0.4
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum UserGroup {
    #[default]
    User,
    Installer,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InverterConfig {
    pub name: String,
    pub url: String,
    #[serde(default)]
    pub group: UserGroup,
    pub password: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SamplingConfig {
    #[serde(default = "default_poll_timeout_ms")]
    pub poll_timeout_ms: u64,
    /// Consecutive failed polls before a device is marked stale.
    #[serde(default = "default_stale_after")]
    pub stale_after_failures: u32,
    #[serde(default = "default_solar_check_secs")]
    pub solar_check_secs: u64,
    #[serde(default = "default_grace_ms")]
    pub shutdown_grace_ms: u64,
    #[serde(default = "default_tiers")]
    pub tiers: BTreeMap<TierName, TierConfig>,
}

fn default_poll_timeout_ms() -> u64 {
    5000
}

fn default_stale_after() -> u32 {
    3
}

fn default_solar_check_secs() -> u64 {
    60
}

fn default_grace_ms() -> u64 {
    5000
}

impl Default for SamplingConfig {
    fn default() -> Self {
        Self {
            poll_timeout_ms: default_poll_timeout_ms(),
            stale_after_failures: default_stale_after(),
            solar_check_secs: default_solar_check_secs(),
            shutdown_grace_ms: default_grace_ms(),
            tiers: default_tiers(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TierConfig {
    pub period_secs: u64,
    #[serde(default)]
    pub outputs: Vec<Selector>,
}

fn tier_config(period_secs: u64, outputs: &[&str]) -> TierConfig {
    TierConfig {
        period_secs,
        outputs: outputs
            .iter()
            .filter_map(|topic| topic.parse().ok())
            .collect(),
    }
}

fn default_tiers() -> BTreeMap<TierName, TierConfig> {
    let mut tiers = BTreeMap::new();
    tiers.insert(
        TierName::Fast,
        tier_config(
            30,
            &[
                "ac_measurements/power",
                "dc_measurements/power",
                "dc_measurements/voltage",
                "dc_measurements/current",
                "status/reason_for_derating",
                "status/general_operating_status",
                "status/grid_relay",
                "status/condition",
                "site/status",
            ],
        ),
    );
    tiers.insert(
        TierName::Medium,
        tier_config(
            60,
            &[
                "production/total_wh",
                "production/today",
                "production/month",
                "production/year",
            ],
        ),
    );
    tiers.insert(
        TierName::Slow,
        tier_config(
            120,
            &[
                "ac_measurements/efficiency",
                "co2avoided/today",
                "co2avoided/month",
                "co2avoided/year",
                "sun/position",
            ],
        ),
    );
    tiers.insert(
        TierName::Turtle,
        tier_config(300, &["production/lifetime", "co2avoided/lifetime"]),
    );
    tiers.insert(TierName::Night, tier_config(900, &[]));
    tiers
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MqttConfig {
    #[serde(default = "default_enable")]
    pub enable: bool,
    pub host: String,
    #[serde(default = "default_mqtt_port")]
    pub port: u16,
    /// Client name, also the root of every published topic.
    #[serde(default = "default_mqtt_client")]
    pub client: String,
    pub username: Option<String>,
    pub password: Option<String>,
    pub keep_alive_secs: Option<u64>,
}

fn default_enable() -> bool {
    true
}

fn default_mqtt_port() -> u16 {
    1883
}

fn default_mqtt_client() -> String {
    "pvsite".into()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InfluxConfig {
    #[serde(default = "default_enable")]
    pub enable: bool,
    pub url: String,
    pub token: String,
    pub org: String,
    pub bucket: String,
    /// Deletions run once a day, each removing points older than `keep_last` days.
    #[serde(default)]
    pub pruning: Vec<PruneRule>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PruneRule {
    pub name: String,
    /// InfluxDB delete predicate, e.g. `_measurement="status"`.
    pub predicate: String,
    #[serde(default = "default_keep_last")]
    pub keep_last: u32,
}

fn default_keep_last() -> u32 {
    30
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ArchiveConfig {
    pub dir: PathBuf,
    #[serde(default = "default_retention_days")]
    pub retention_days: u64,
}

fn default_retention_days() -> u64 {
    90
}

impl SiteConfig {
    /// Load YAML from disk, substitute $(VAR)/${VAR} with env vars, parse and validate.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path)?;
        Self::from_yaml(&raw)
    }

    pub fn from_yaml(raw: &str) -> Result<Self, ConfigError> {
        let expanded = expand_env_placeholders(raw)?;
        let cfg: Self = serde_yaml::from_str(&expanded)?;
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.inverters.is_empty() {
            return Err(ConfigError::Invalid("at least one inverter is required".into()));
        }
        let mut names = BTreeSet::new();
        for inverter in &self.inverters {
            if inverter.name.trim().is_empty() {
                return Err(ConfigError::Invalid("inverter name must not be empty".into()));
            }
            if !names.insert(inverter.name.as_str()) {
                return Err(ConfigError::Invalid(format!(
                    "inverter '{}' is defined twice",
                    inverter.name
                )));
            }
        }
        if names.contains("site") {
            return Err(ConfigError::Invalid("'site' is reserved and cannot name an inverter".into()));
        }

        let sampling = &self.sampling;
        if sampling.poll_timeout_ms == 0 {
            return Err(ConfigError::Invalid("sampling.poll_timeout_ms must be positive".into()));
        }
        if sampling.stale_after_failures == 0 {
            return Err(ConfigError::Invalid(
                "sampling.stale_after_failures must be at least 1".into(),
            ));
        }
        if sampling.solar_check_secs == 0 {
            return Err(ConfigError::Invalid("sampling.solar_check_secs must be positive".into()));
        }

        if let Some(influx) = &self.influxdb2 {
            for rule in &influx.pruning {
                if rule.name.trim().is_empty() || rule.predicate.trim().is_empty() {
                    return Err(ConfigError::Invalid(
                        "influxdb2.pruning rules need a name and a predicate".into(),
                    ));
                }
                if rule.keep_last == 0 {
                    return Err(ConfigError::Invalid(format!(
                        "influxdb2.pruning '{}' must keep at least one day",
                        rule.name
                    )));
                }
            }
        }

        let plan = self.tier_plan()?;
        let wants_irradiance = plan
            .all()
            .flat_map(|t| t.outputs.iter())
            .any(|s| *s == Selector::Irradiance);
        if wants_irradiance && self.site.panels.is_none() {
            return Err(ConfigError::Invalid(
                "'sun/irradiance' output requires site.panels".into(),
            ));
        }

        Ok(())
    }

    pub fn tier_plan(&self) -> Result<TierPlan, ConfigError> {
        let mut day = Vec::new();
        let mut night = None;
        for (name, cfg) in &self.sampling.tiers {
            let tier = Tier {
                name: *name,
                period: Duration::from_secs(cfg.period_secs),
                outputs: cfg.outputs.clone(),
            };
            if *name == TierName::Night {
                night = Some(tier);
            } else {
                day.push(tier);
            }
        }
        let night = night.unwrap_or_else(|| Tier {
            name: TierName::Night,
            period: Duration::from_secs(900),
            outputs: Vec::new(),
        });
        TierPlan::new(day, night)
    }

    pub fn poll_timeout(&self) -> Duration {
        Duration::from_millis(self.sampling.poll_timeout_ms)
    }

    pub fn solar_check(&self) -> Duration {
        Duration::from_secs(self.sampling.solar_check_secs)
    }

    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_millis(self.sampling.shutdown_grace_ms)
    }
}

/// Expand $(VAR) and ${VAR} placeholders using environment variables; "$$" is a literal "$".
fn expand_env_placeholders(input: &str) -> Result<String, ConfigError> {
    let mut out = String::with_capacity(input.len());
    let mut it = input.chars().peekable();

    while let Some(c) = it.next() {
        if c != '$' {
            out.push(c);
            continue;
        }
        let close = match it.peek().copied() {
            Some('$') => {
                it.next();
                out.push('$');
                continue;
            }
            Some('(') => ')',
            Some('{') => '}',
            _ => {
                out.push('$');
                continue;
            }
        };
        it.next();
        let var = read_until(&mut it, close)
            .ok_or_else(|| ConfigError::Env(format!("unterminated placeholder, missing '{close}'")))?;
        let val = std::env::var(&var)
            .map_err(|_| ConfigError::Env(format!("missing environment variable: {var}")))?;
        out.push_str(&val);
    }

    Ok(out)
}

fn read_until<I>(it: &mut std::iter::Peekable<I>, end: char) -> Option<String>
where
    I: Iterator<Item = char>,
{
    let mut buf = String::new();
    for ch in it.by_ref() {
        if ch == end {
            return Some(buf);
        }
        buf.push(ch);
    }
    None
}

#[cfg(test)]
#[path = "config_tests.rs"]
mod tests;
