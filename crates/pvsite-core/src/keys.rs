//! SMA object ids used by the site view and the topics they publish under.

pub const AC_POWER: &str = "6100_40263F00";
pub const PV_POWER: &str = "6100_0046C200";
pub const TOTAL_WH: &str = "6400_0046C300";
pub const DC_POWER: &str = "6380_40251E00";
pub const DC_VOLTAGE: &str = "6380_40451F00";
pub const DC_CURRENT: &str = "6380_40452100";
pub const CONDITION: &str = "6180_08414C00";

/// Keys summed into a site total across fresh devices.
pub const AGGREGATE_KEYS: [&str; 4] = [AC_POWER, PV_POWER, TOTAL_WH, DC_POWER];

const TOPICS: [(&str, &str); 16] = [
    (PV_POWER, "production/current"),
    (TOTAL_WH, "production/total_wh"),
    (AC_POWER, "ac_measurements/power"),
    ("6100_00465700", "ac_measurements/frequency"),
    ("6180_08465A00", "ac_measurements/excitation_type"),
    ("6100_00464800", "ac_measurements/voltage/phase_l1"),
    ("6100_00464900", "ac_measurements/voltage/phase_l2"),
    ("6100_00464B00", "ac_measurements/voltage/phase_l1_l2"),
    (DC_POWER, "dc_measurements/power"),
    (DC_VOLTAGE, "dc_measurements/voltage"),
    (DC_CURRENT, "dc_measurements/current"),
    ("6180_08416500", "status/reason_for_derating"),
    ("6180_08412800", "status/general_operating_status"),
    ("6180_08416400", "status/grid_relay"),
    (CONDITION, "status/condition"),
    ("6400_00260100", "production/totalwh2"),
];

pub fn is_aggregate(key: &str) -> bool {
    AGGREGATE_KEYS.contains(&key)
}

/// Topic for a key; unlisted keys publish under the key itself.
pub fn topic_for_key(key: &str) -> &str {
    TOPICS
        .iter()
        .find(|(k, _)| *k == key)
        .map(|(_, topic)| *topic)
        .unwrap_or(key)
}

pub fn key_for_topic(topic: &str) -> Option<&'static str> {
    TOPICS.iter().find(|(_, t)| *t == topic).map(|(k, _)| *k)
}

/// `NNNN_NNNNNNNN` with hex digits.
pub fn looks_like_key(s: &str) -> bool {
    let Some((class, id)) = s.split_once('_') else {
        return false;
    };
    class.len() == 4
        && id.len() == 8
        && class.chars().chain(id.chars()).all(|c| c.is_ascii_hexdigit())
}

/// SMA condition tags.
pub mod condition {
    pub const FAULT: u32 = 35;
    pub const OFF: u32 = 303;
    pub const OK: u32 = 307;
    pub const WARNING: u32 = 455;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unlisted_keys_publish_under_their_own_name() {
        assert_eq!(topic_for_key(AC_POWER), "ac_measurements/power");
        assert_eq!(topic_for_key("6100_00000000"), "6100_00000000");
        assert_eq!(key_for_topic("status/condition"), Some(CONDITION));
    }

    #[test]
    fn key_shape_is_checked() {
        assert!(looks_like_key("6380_40251E00"));
        assert!(!looks_like_key("sun/position"));
        assert!(!looks_like_key("638_40251E00"));
    }
}
