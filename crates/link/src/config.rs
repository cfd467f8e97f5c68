use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::frame::MAX_FRAME_SIZE;

/// Tuning knobs shared by every connection.
///
/// Lives under `[link]` in `taskline.toml`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LinkConfig {
    /// Period between outgoing heartbeats, advertised to the peer.
    #[serde(default = "default_heartbeat_ms")]
    pub heartbeat_ms: u64,

    /// Transport read timeout; bounds how late the idle check can run.
    #[serde(default = "default_read_timeout_ms")]
    pub read_timeout_ms: u64,

    /// Largest frame payload sent or accepted.
    #[serde(default = "default_max_frame_size")]
    pub max_frame_size: usize,

    /// Largest message body a [`MessageChannel`](crate::MessageChannel) accepts.
    #[serde(default = "default_max_message_size")]
    pub max_message_size: usize,

    /// Frames queued towards the writer before channel writers wait.
    #[serde(default = "default_outbound_queue")]
    pub outbound_queue: usize,

    /// How long `disconnect` waits for each connection loop to stop.
    #[serde(default = "default_join_timeout_ms")]
    pub join_timeout_ms: u64,

    /// How long an accepted TCP client may take to finish the TLS handshake.
    #[serde(default = "default_handshake_timeout_ms")]
    pub handshake_timeout_ms: u64,
}

fn default_heartbeat_ms() -> u64 {
    60_000
}

fn default_read_timeout_ms() -> u64 {
    1_000
}

fn default_max_frame_size() -> usize {
    MAX_FRAME_SIZE
}

fn default_max_message_size() -> usize {
    64 * 1024 * 1024
}

fn default_outbound_queue() -> usize {
    64
}

fn default_join_timeout_ms() -> u64 {
    1_000
}

fn default_handshake_timeout_ms() -> u64 {
    10_000
}

impl Default for LinkConfig {
    fn default() -> Self {
        Self {
            heartbeat_ms: default_heartbeat_ms(),
            read_timeout_ms: default_read_timeout_ms(),
            max_frame_size: default_max_frame_size(),
            max_message_size: default_max_message_size(),
            outbound_queue: default_outbound_queue(),
            join_timeout_ms: default_join_timeout_ms(),
            handshake_timeout_ms: default_handshake_timeout_ms(),
        }
    }
}

impl LinkConfig {
    /// Set the heartbeat period.
    pub fn with_heartbeat(mut self, period: Duration) -> Self {
        self.heartbeat_ms = period.as_millis() as u64;
        self
    }

    /// Set the transport read timeout.
    pub fn with_read_timeout(mut self, timeout: Duration) -> Self {
        self.read_timeout_ms = timeout.as_millis() as u64;
        self
    }

    /// Set the maximum frame payload size.
    pub fn with_max_frame_size(mut self, size: usize) -> Self {
        self.max_frame_size = size;
        self
    }

    pub fn heartbeat(&self) -> Duration {
        Duration::from_millis(self.heartbeat_ms.max(1))
    }

    pub fn read_timeout(&self) -> Duration {
        Duration::from_millis(self.read_timeout_ms.max(1))
    }

    pub fn join_timeout(&self) -> Duration {
        Duration::from_millis(self.join_timeout_ms)
    }

    pub fn with_handshake_timeout(mut self, timeout: Duration) -> Self {
        self.handshake_timeout_ms = timeout.as_millis() as u64;
        self
    }

    pub fn handshake_timeout(&self) -> Duration {
        Duration::from_millis(self.handshake_timeout_ms.max(1))
    }

    /// Check the values a connection cannot work with.
    pub fn validate(&self) -> Result<(), String> {
        if self.heartbeat_ms == 0 {
            return Err("link.heartbeat_ms must be greater than zero".into());
        }
        if self.max_frame_size == 0 || self.max_frame_size > i32::MAX as usize {
            return Err(format!(
                "link.max_frame_size must be within 1..={}, got {}",
                i32::MAX,
                self.max_frame_size
            ));
        }
        if self.outbound_queue == 0 {
            return Err("link.outbound_queue must be greater than zero".into());
        }
        if self.handshake_timeout_ms == 0 {
            return Err("link.handshake_timeout_ms must be greater than zero".into());
        }
        Ok(())
    }
}
