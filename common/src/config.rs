use crate::errors::*;
use serde::de::DeserializeOwned;
use std::fs;
use std::path::Path;

/// Seconds a slave is told to sleep the first time no build is pending.
pub const SLEEP_INITIAL: u64 = 10;
/// Upper bound for the sleep backoff.
pub const SLEEP_MAX: u64 = 300;
/// Re-poll delay while dispatch is paused. A paused poll does not grow the
/// backoff.
pub const PAUSED_POLL: u64 = 5;
/// Delay between two mid-build heartbeats sent by a slave.
pub const BUSY_INTERVAL: u64 = 30;
/// Fixed payload size for file transfer chunks.
pub const CHUNK_SIZE: u32 = 64 * 1024;
/// How often a transfer is restarted after a hash mismatch before the build
/// is declared failed.
pub const TRANSFER_RETRIES: u32 = 3;
/// Reconnect delay after a slave hits a network or protocol error.
pub const SLAVE_ERROR_DELAY: u64 = 30;

pub fn load<T: DeserializeOwned + Default>(path: Option<&Path>, default_path: &str) -> Result<T> {
    let path = path.unwrap_or_else(|| Path::new(default_path));
    if path.exists() {
        let buf = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {:?}", path))?;
        let conf = toml::from_str(&buf)
            .with_context(|| format!("Failed to parse config file: {:?}", path))?;
        Ok(conf)
    } else {
        Ok(T::default())
    }
}
