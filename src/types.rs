//! Basic types for the reflector

use hickory_proto::rr::{Name, RecordType};
use std::fmt;
use std::net::{IpAddr, SocketAddr};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Transport { Udp, Tcp }

impl Transport {
    pub fn as_str(&self) -> &'static str {
        match self {
            Transport::Udp => "udp",
            Transport::Tcp => "tcp",
        }
    }
}

impl fmt::Display for Transport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Family { V4, V6 }

impl Family {
    /// Prometheus label value, same numbering as CoreDNS ("1" = IPv4, "2" = IPv6).
    pub fn label(&self) -> &'static str {
        match self {
            Family::V4 => "1",
            Family::V6 => "2",
        }
    }
}

/// Everything observed about a single query: where it came from and what it asked.
#[derive(Debug, Clone)]
pub struct QueryContext {
    pub remote: SocketAddr,
    pub transport: Transport,
    pub name: Name,
    pub query_type: RecordType,
}

impl QueryContext {
    /// Remote IP with IPv4-mapped IPv6 addresses folded back to IPv4.
    /// Dual-stack listeners report v4 clients as `::ffff:a.b.c.d`.
    pub fn remote_ip(&self) -> IpAddr {
        self.remote.ip().to_canonical()
    }

    pub fn family(&self) -> Family {
        match self.remote_ip() {
            IpAddr::V4(_) => Family::V4,
            IpAddr::V6(_) => Family::V6,
        }
    }

    /// `ip:port@transport`, e.g. `10.0.0.5:4321@udp` or `[2001:db8::1]:53@tcp`.
    pub fn endpoint(&self) -> String {
        let addr = SocketAddr::new(self.remote_ip(), self.remote.port());
        format!("{}@{}", addr, self.transport)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ctx(remote: &str, transport: Transport) -> QueryContext {
        QueryContext {
            remote: remote.parse().unwrap(),
            transport,
            name: Name::root(),
            query_type: RecordType::A,
        }
    }

    #[test]
    fn mapped_v4_is_reported_as_v4() {
        let q = ctx("[::ffff:10.0.0.5]:4321", Transport::Udp);
        assert_eq!(q.family(), Family::V4);
        assert_eq!(q.endpoint(), "10.0.0.5:4321@udp");
    }

    #[test]
    fn v6_endpoint_keeps_brackets() {
        let q = ctx("[2001:db8::1]:53", Transport::Tcp);
        assert_eq!(q.family(), Family::V6);
        assert_eq!(q.endpoint(), "[2001:db8::1]:53@tcp");
    }
}
