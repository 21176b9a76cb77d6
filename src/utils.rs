//! Utility functions for identifiers and timestamps

use bech32::Bech32m;
use chrono::Utc;
use uuid7::uuid7;

/// Construct a unique ID then encode using bech32, e.g. `agent_1q...`
pub fn new_uuid_to_bech32(hrp: &str) -> anyhow::Result<String> {
    let hrp = bech32::Hrp::parse(hrp)?;
    let encode = bech32::encode::<Bech32m>(hrp, uuid7().as_bytes())?;
    Ok(encode)
}

/// Plain uuid7 string, used where the ID travels on the wire unprefixed
/// (event ids, vote ids).
pub fn new_uuid() -> String {
    uuid7().to_string()
}

/// Current UTC time as `YYYY-MM-DDTHH:MM:SSZ`.
pub fn utc_now() -> String {
    Utc::now().format("%Y-%m-%dT%H:%M:%SZ").to_string()
}

/// Current UTC time as unix seconds, for retention arithmetic.
pub fn unix_now() -> i64 {
    Utc::now().timestamp()
}

/// UTC timestamp `hours` from now, ISO formatted. Used for response
/// deadlines on activation requests.
pub fn utc_deadline(hours: i64) -> String {
    (Utc::now() + chrono::Duration::hours(hours))
        .format("%Y-%m-%dT%H:%M:%SZ")
        .to_string()
}
