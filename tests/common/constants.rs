#![allow(dead_code)]

pub const CARDIFF_CENTRAL: &str = "Cardiff-Central";
pub const SWANSEA_WEST: &str = "Swansea-West";
pub const COUNTRY_GB: &str = "GB";

/// Counter interval used by every test engine.
pub const COUNT_INTERVAL_SECS: i64 = 60;
