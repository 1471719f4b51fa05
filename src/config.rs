//! Startup configuration for the reflector

use anyhow::{anyhow, bail, Context, Result};
use std::fmt;
use std::net::{IpAddr, Ipv6Addr, SocketAddr};
use std::path::PathBuf;
use std::time::Duration;

/// One `host:port` entry of the `--listen` list.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ListenSpec {
    pub host: String,
    pub port: u16,
}

impl ListenSpec {
    /// Split an entry the way Go's `net.SplitHostPort` does: `host:port`,
    /// `[v6]:port`, or `:port` for every interface.
    pub fn parse(entry: &str) -> Result<Self> {
        let (host, port) = if let Some(rest) = entry.strip_prefix('[') {
            let end = rest.find(']').ok_or_else(|| anyhow!("{}: missing ']' in address", entry))?;
            let port = rest[end + 1..]
                .strip_prefix(':')
                .ok_or_else(|| anyhow!("{}: missing port in address", entry))?;
            (&rest[..end], port)
        } else {
            let idx = entry.rfind(':').ok_or_else(|| anyhow!("{}: missing port in address", entry))?;
            let host = &entry[..idx];
            if host.contains(':') { bail!("{}: too many colons in address", entry); }
            (host, &entry[idx + 1..])
        };

        if host.contains('[') || host.contains(']') || port.contains('[') || port.contains(']') {
            bail!("{}: unexpected bracket in address", entry);
        }
        let port = port.parse::<u16>().with_context(|| format!("{}: invalid port", entry))?;
        Ok(Self { host: host.to_string(), port })
    }

    /// Parse the whole comma-separated list. The first bad entry fails the lot.
    pub fn parse_list(list: &str) -> Result<Vec<Self>> {
        list.split(',').map(Self::parse).collect()
    }

    /// Resolve to a bindable address. An empty host means every interface (dual-stack).
    /// Host names go through the runtime's resolver so startup never blocks a worker.
    pub async fn resolve(&self) -> Result<SocketAddr> {
        if self.host.is_empty() {
            return Ok(SocketAddr::new(IpAddr::V6(Ipv6Addr::UNSPECIFIED), self.port));
        }
        if let Ok(ip) = self.host.parse::<IpAddr>() {
            return Ok(SocketAddr::new(ip, self.port));
        }
        tokio::net::lookup_host((self.host.as_str(), self.port))
            .await
            .with_context(|| format!("Failed to resolve listen host '{}'", self.host))?
            .next()
            .ok_or_else(|| anyhow!("Listen host '{}' has no addresses", self.host))
    }
}

impl fmt::Display for ListenSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.host.contains(':') {
            write!(f, "[{}]:{}", self.host, self.port)
        } else {
            write!(f, "{}:{}", self.host, self.port)
        }
    }
}

/// Immutable settings, built once in `main` and shared read-only afterwards.
#[derive(Debug, Clone)]
pub struct Config {
    pub compress: bool,
    pub reuse_port: usize,
    pub cpu: usize,
    pub listen: Vec<ListenSpec>,
    pub socket: PathBuf,
    pub control_root: PathBuf,
    pub shutdown_grace: Duration,
    pub metrics: Option<String>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            compress: false,
            reuse_port: 0,
            cpu: 0,
            listen: vec![ListenSpec { host: "::".to_string(), port: 53 }],
            socket: PathBuf::from("/dns.sock"),
            control_root: PathBuf::from("/"),
            shutdown_grace: Duration::from_secs(5),
            metrics: None,
        }
    }
}
