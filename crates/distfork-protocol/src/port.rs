//! Port forwarding specs (`LISTEN:HOST:PORT`)

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::TaskSpecError;

/// A single forwarding rule: listen on one node, forward to `target_host:target_port`
/// as reached from the other node.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PortSpec {
    /// Port the listener binds to (0 picks an ephemeral port)
    pub listen_port: u16,
    /// Host the forwarded connection is opened to
    pub target_host: String,
    /// Port the forwarded connection is opened to
    pub target_port: u16,
}

impl PortSpec {
    /// Create a new port spec
    pub fn new(listen_port: u16, target_host: impl Into<String>, target_port: u16) -> Self {
        Self {
            listen_port,
            target_host: target_host.into(),
            target_port,
        }
    }
}

impl fmt::Display for PortSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}:{}", self.listen_port, self.target_host, self.target_port)
    }
}

impl FromStr for PortSpec {
    type Err = TaskSpecError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = |reason: &str| TaskSpecError::InvalidPortSpec {
            spec: s.to_string(),
            reason: reason.to_string(),
        };

        // host may itself contain ':' (bare IPv6), so split listen port off the
        // front and target port off the back
        let (listen, rest) = s.split_once(':').ok_or_else(|| invalid("expected LISTEN:HOST:PORT"))?;
        let (host, target) = rest.rsplit_once(':').ok_or_else(|| invalid("expected LISTEN:HOST:PORT"))?;

        let listen_port = listen
            .parse::<u16>()
            .map_err(|_| invalid("listen port is not a number in 0..=65535"))?;
        let target_port = target
            .parse::<u16>()
            .map_err(|_| invalid("target port is not a number in 0..=65535"))?;

        let host = host.trim_start_matches('[').trim_end_matches(']');
        if host.is_empty() {
            return Err(invalid("target host is empty"));
        }

        Ok(Self::new(listen_port, host, target_port))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_port_spec() {
        let spec: PortSpec = "9000:example.org:80".parse().unwrap();
        assert_eq!(spec, PortSpec::new(9000, "example.org", 80));
        assert_eq!(spec.to_string(), "9000:example.org:80");
    }

    #[test]
    fn test_parse_ipv6_host() {
        let spec: PortSpec = "8080:[::1]:443".parse().unwrap();
        assert_eq!(spec.target_host, "::1");
        assert_eq!(spec.target_port, 443);
    }

    #[test]
    fn test_reject_malformed_specs() {
        for bad in ["9000", "9000:host", "x:host:80", "9000:host:99999", "9000::80"] {
            let err = bad.parse::<PortSpec>().unwrap_err();
            assert!(
                matches!(err, TaskSpecError::InvalidPortSpec { .. }),
                "{} should be rejected",
                bad
            );
        }
    }
}
