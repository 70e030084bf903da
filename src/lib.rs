//! Hero rotation engine: picks, enriches and caches the featured items shown
//! at the top of a media catalog.

pub mod config;
pub mod config_persistence;
pub mod db_manager;
pub mod enrichment;
pub mod hero;
pub mod policy;
pub mod protocol;
pub mod storage;

use std::time::{SystemTime, UNIX_EPOCH};

/// Wall-clock milliseconds since the Unix epoch.
pub fn now_unix_ms() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|elapsed| elapsed.as_millis() as i64)
        .unwrap_or(0)
}
