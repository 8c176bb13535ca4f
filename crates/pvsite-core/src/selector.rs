use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::keys;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Period {
    Today,
    Month,
    Year,
    Lifetime,
}

impl Period {
    pub const ALL: [Period; 4] = [Period::Today, Period::Month, Period::Year, Period::Lifetime];

    pub fn as_str(self) -> &'static str {
        match self {
            Period::Today => "today",
            Period::Month => "month",
            Period::Year => "year",
            Period::Lifetime => "lifetime",
        }
    }
}

impl FromStr for Period {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Period::ALL
            .into_iter()
            .find(|p| p.as_str() == s)
            .ok_or_else(|| format!("unknown period '{s}'"))
    }
}

/// One named output a tier publishes. The string form is the topic it publishes under.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum Selector {
    /// A raw inverter reading, by SMA key.
    Reading(String),
    Production(Period),
    Co2Avoided(Period),
    Efficiency,
    SunPosition,
    Irradiance,
    SiteStatus,
}

impl Selector {
    pub fn topic(&self) -> String {
        match self {
            Selector::Reading(key) => keys::topic_for_key(key).to_string(),
            Selector::Production(period) => format!("production/{}", period.as_str()),
            Selector::Co2Avoided(period) => format!("co2avoided/{}", period.as_str()),
            Selector::Efficiency => "ac_measurements/efficiency".to_string(),
            Selector::SunPosition => "sun/position".to_string(),
            Selector::Irradiance => "sun/irradiance".to_string(),
            Selector::SiteStatus => "site/status".to_string(),
        }
    }
}

impl FromStr for Selector {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "ac_measurements/efficiency" => return Ok(Selector::Efficiency),
            "sun/position" => return Ok(Selector::SunPosition),
            "sun/irradiance" => return Ok(Selector::Irradiance),
            "site/status" => return Ok(Selector::SiteStatus),
            _ => {}
        }
        if let Some(key) = keys::key_for_topic(s) {
            return Ok(Selector::Reading(key.to_string()));
        }
        if let Some(period) = s.strip_prefix("production/") {
            return period.parse().map(Selector::Production);
        }
        if let Some(period) = s.strip_prefix("co2avoided/") {
            return period.parse().map(Selector::Co2Avoided);
        }
        if keys::looks_like_key(s) {
            return Ok(Selector::Reading(s.to_string()));
        }
        Err(format!("unknown output selector '{s}'"))
    }
}

impl TryFrom<String> for Selector {
    type Error = String;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<Selector> for String {
    fn from(value: Selector) -> Self {
        value.topic()
    }
}

impl fmt::Display for Selector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.topic())
    }
}
