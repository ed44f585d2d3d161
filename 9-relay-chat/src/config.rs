//! Runtime settings for the server and the client.
//!
//! Defaults carry the protocol's timing constants; the CLI can override the
//! timings, mostly so tests don't have to wait ten seconds for an eviction.

use std::{
    net::{SocketAddr, SocketAddrV4},
    time::Duration,
};

use crate::error::{Error, Result};

/// How long a session may go without a complete frame before eviction.
pub const IDLE_TIMEOUT: Duration = Duration::from_secs(10);
/// Pending-connection queue length passed to `listen`.
pub const LISTEN_BACKLOG: u32 = 100;
/// How long a connect attempt may stay unresolved before it counts as failed.
pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(3);
/// Fixed delay between a failed or lost connection and the next attempt.
pub const RECONNECT_BACKOFF: Duration = Duration::from_secs(5);

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub port: u16,
    pub idle_timeout: Duration,
    pub backlog: u32,
}

impl ServerConfig {
    pub fn new(port: u16) -> Self {
        Self {
            port,
            idle_timeout: IDLE_TIMEOUT,
            backlog: LISTEN_BACKLOG,
        }
    }

    pub fn with_idle_timeout(mut self, idle_timeout: Duration) -> Self {
        self.idle_timeout = idle_timeout;
        self
    }

    /// Every server listens on all IPv4 interfaces.
    pub fn listen_addr(&self) -> SocketAddr {
        SocketAddr::from(([0, 0, 0, 0], self.port))
    }
}

#[derive(Debug, Clone)]
pub struct ClientConfig {
    pub server: SocketAddr,
    pub name: String,
    pub connect_timeout: Duration,
    pub reconnect_backoff: Duration,
}

impl ClientConfig {
    pub fn new(server: SocketAddrV4, name: impl Into<String>) -> Result<Self> {
        let name = name.into();
        if name.is_empty() {
            return Err(Error::InvalidName("name cannot be empty".into()));
        }
        if name.as_bytes().contains(&crate::frame::DELIMITER) {
            return Err(Error::InvalidName(format!("{name:?} contains a NUL byte")));
        }

        Ok(Self {
            server: SocketAddr::V4(server),
            name,
            connect_timeout: CONNECT_TIMEOUT,
            reconnect_backoff: RECONNECT_BACKOFF,
        })
    }

    pub fn with_timings(mut self, connect_timeout: Duration, reconnect_backoff: Duration) -> Self {
        self.connect_timeout = connect_timeout;
        self.reconnect_backoff = reconnect_backoff;
        self
    }
}
