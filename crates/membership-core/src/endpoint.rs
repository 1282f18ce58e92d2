//! HostEndpoint: identity of one running agent host process.
//!
//! An endpoint is the bind address and port of a host plus an incarnation
//! number. Restarting a process on the same address produces a new endpoint
//! with a strictly higher incarnation, so the two are never confused.

use serde::{Deserialize, Serialize};
use std::fmt::{self, Display, Formatter};
use std::net::{IpAddr, SocketAddr};
use std::sync::atomic::{AtomicU64, Ordering};
use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum EndpointError {
    #[error("Invalid endpoint key: {0}")]
    InvalidKey(String),
    #[error("Invalid address: {0}")]
    InvalidAddress(String),
}

/// A node in the cluster: `address:port` at a given incarnation.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct HostEndpoint {
    pub address: String,
    pub port: u16,
    pub incarnation: u64,
}

impl HostEndpoint {
    pub fn new(address: impl Into<String>, port: u16, incarnation: u64) -> Self {
        Self {
            address: address.into(),
            port,
            incarnation,
        }
    }

    /// Key used for this endpoint in the replicated membership map.
    pub fn key(&self) -> String {
        format!("{}#{}", self.host_port(), self.incarnation)
    }

    /// Parse a key produced by [`HostEndpoint::key`].
    pub fn parse_key(key: &str) -> Result<Self, EndpointError> {
        let invalid = || EndpointError::InvalidKey(key.to_string());

        let (host_port, incarnation) = key.rsplit_once('#').ok_or_else(invalid)?;
        let incarnation: u64 = incarnation.parse().map_err(|_| invalid())?;
        let (address, port) = host_port.rsplit_once(':').ok_or_else(invalid)?;
        let port: u16 = port.parse().map_err(|_| invalid())?;
        let address = address.trim_start_matches('[').trim_end_matches(']');
        if address.is_empty() {
            return Err(invalid());
        }

        Ok(Self::new(address, port, incarnation))
    }

    /// `address:port` without the incarnation (IPv6 addresses are bracketed).
    pub fn host_port(&self) -> String {
        if self.address.contains(':') {
            format!("[{}]:{}", self.address, self.port)
        } else {
            format!("{}:{}", self.address, self.port)
        }
    }

    /// Parse the address into a dialable socket address.
    pub fn socket_addr(&self) -> Result<SocketAddr, EndpointError> {
        let ip: IpAddr = self
            .address
            .parse()
            .map_err(|_| EndpointError::InvalidAddress(self.address.clone()))?;
        Ok(SocketAddr::new(ip, self.port))
    }

    /// Same address and port, regardless of incarnation.
    pub fn same_host(&self, other: &HostEndpoint) -> bool {
        self.port == other.port && self.address == other.address
    }

    /// True if `self` is a later incarnation of the same host as `other`.
    pub fn supersedes(&self, other: &HostEndpoint) -> bool {
        self.same_host(other) && self.incarnation > other.incarnation
    }

    /// Copy of this endpoint at a different incarnation.
    pub fn with_incarnation(&self, incarnation: u64) -> Self {
        Self::new(self.address.clone(), self.port, incarnation)
    }
}

impl Display for HostEndpoint {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{}#{}", self.host_port(), self.incarnation)
    }
}

static LAST_INCARNATION: AtomicU64 = AtomicU64::new(0);

/// Pick a fresh incarnation number.
///
/// Based on wall-clock milliseconds so a restarted process outranks its
/// previous life, and strictly increasing within this process.
pub fn next_incarnation(at_least: u64) -> u64 {
    let wall = web_time::SystemTime::now()
        .duration_since(web_time::UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0);
    let floor = wall.max(at_least);

    let mut last = LAST_INCARNATION.load(Ordering::Relaxed);
    loop {
        let candidate = floor.max(last.saturating_add(1));
        match LAST_INCARNATION.compare_exchange_weak(
            last,
            candidate,
            Ordering::Relaxed,
            Ordering::Relaxed,
        ) {
            Ok(_) => return candidate,
            Err(actual) => last = actual,
        }
    }
}
