use chrono::{TimeZone, Utc};

/// Milliseconds since the unix epoch.
pub fn create_timestamp() -> u64 {
    Utc::now().timestamp_millis().max(0) as u64
}

/// Seconds since the unix epoch, as carried in XRouter headers.
pub fn unix_seconds() -> u32 {
    Utc::now().timestamp().max(0) as u32
}

pub fn format_timestamp(timestamp: u64) -> String {
    match Utc.timestamp_millis_opt(timestamp as i64).single() {
        Some(datetime) => datetime.format("%Y-%m-%d %H:%M:%S").to_string(),
        None => String::from("-"),
    }
}
