use std::fs::File;
use std::path::Path;

use serde::Deserialize;
use tracing::info;

use crate::everlink::common::{Error, Result};

/// Settings for one connection (or one port-forward handler). There is no
/// global config object; construct one (or load it from YAML) and pass it to
/// the pieces that need it.
#[derive(Clone, Debug, Deserialize)]
pub struct Settings {
    /// replay_buffer_bytes bounds how much already-sent ciphertext each writer
    /// retains for replay after a reconnect. A peer that falls further behind
    /// than this is unrecoverable.
    #[serde(default = "default_replay_buffer_bytes")]
    pub replay_buffer_bytes: usize,
    /// backup_chunk_bytes is the target size of one chunk in the replay buffer
    #[serde(default = "default_backup_chunk_bytes")]
    pub backup_chunk_bytes: usize,
    /// reconnect_interval_ms is how long the client reconnect task sleeps
    /// between dial attempts
    #[serde(default = "default_reconnect_interval_ms")]
    pub reconnect_interval_ms: u64,
    /// dead_socket_retry_ms is how long a read on a broken socket sleeps
    /// before returning 0 bytes to the caller
    #[serde(default = "default_dead_socket_retry_ms")]
    pub dead_socket_retry_ms: u64,
    /// max_frame_bytes caps the length prefix of any wire frame. A peer
    /// announcing a larger frame is treated as a protocol violation.
    #[serde(default = "default_max_frame_bytes")]
    pub max_frame_bytes: usize,
    /// forward_chunk_bytes is how much each port-forward handler reads from
    /// one tunneled socket per polling tick
    #[serde(default = "default_forward_chunk_bytes")]
    pub forward_chunk_bytes: usize,
}

const fn default_replay_buffer_bytes() -> usize { 64 * 1024 * 1024 }
const fn default_backup_chunk_bytes() -> usize { 64 * 1024 }
const fn default_reconnect_interval_ms() -> u64 { 1000 }
const fn default_dead_socket_retry_ms() -> u64 { 100 }
const fn default_max_frame_bytes() -> usize { 16 * 1024 * 1024 }
const fn default_forward_chunk_bytes() -> usize { 1024 }

impl Default for Settings {
    fn default() -> Self {
        Settings {
            replay_buffer_bytes: default_replay_buffer_bytes(),
            backup_chunk_bytes: default_backup_chunk_bytes(),
            reconnect_interval_ms: default_reconnect_interval_ms(),
            dead_socket_retry_ms: default_dead_socket_retry_ms(),
            max_frame_bytes: default_max_frame_bytes(),
            forward_chunk_bytes: default_forward_chunk_bytes(),
        }
    }
}

impl Settings {
    pub fn load(path: &Path) -> Result<Settings> {
        info!(path = %path.to_string_lossy(), "loading config file");
        let file = File::open(path).map_err(Error::from)?;
        let settings: Settings = serde_yaml::from_reader(file)?;
        settings.validate()?;
        Ok(settings)
    }

    pub fn validate(&self) -> Result<()> {
        if self.backup_chunk_bytes == 0 {
            return Err(Error::new("backup_chunk_bytes cannot be 0"));
        }
        if self.replay_buffer_bytes < self.backup_chunk_bytes {
            return Err(Error::new(
                "replay_buffer_bytes must be at least backup_chunk_bytes",
            ));
        }
        if self.max_frame_bytes == 0 {
            return Err(Error::new("max_frame_bytes cannot be 0"));
        }
        if self.forward_chunk_bytes == 0 {
            return Err(Error::new("forward_chunk_bytes cannot be 0"));
        }
        Ok(())
    }
}
