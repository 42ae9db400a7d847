//! Ports forwarded from the host to a pod.

use std::fmt;
use std::str::FromStr;

use podnet_common::PodnetError;
use serde::{Deserialize, Serialize};

/// Protocol for port forwarding.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Protocol {
    /// TCP protocol.
    Tcp,
    /// UDP protocol.
    Udp,
}

impl Protocol {
    /// Get the protocol string for iptables.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Tcp => "tcp",
            Self::Udp => "udp",
        }
    }
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Protocol {
    type Err = PodnetError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "tcp" => Ok(Self::Tcp),
            "udp" => Ok(Self::Udp),
            other => Err(PodnetError::Unsupported {
                feature: format!("port forwarding protocol {other:?}"),
            }),
        }
    }
}

/// A port forwarded from the host to the pod's default address.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ForwardedPort {
    /// Protocol.
    pub protocol: Protocol,
    /// Port on the host.
    #[serde(rename = "hostPort")]
    pub host_port: u16,
    /// Port inside the pod.
    #[serde(rename = "podPort")]
    pub pod_port: u16,
}

impl ForwardedPort {
    /// Create a TCP forward.
    #[must_use]
    pub const fn tcp(host_port: u16, pod_port: u16) -> Self {
        Self {
            protocol: Protocol::Tcp,
            host_port,
            pod_port,
        }
    }

    /// Create a UDP forward.
    #[must_use]
    pub const fn udp(host_port: u16, pod_port: u16) -> Self {
        Self {
            protocol: Protocol::Udp,
            host_port,
            pod_port,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn forwarded_port_tcp() {
        let port = ForwardedPort::tcp(8080, 80);
        assert_eq!(port.host_port, 8080);
        assert_eq!(port.pod_port, 80);
        assert_eq!(port.protocol, Protocol::Tcp);
    }

    #[test]
    fn protocol_display() {
        assert_eq!(format!("{}", Protocol::Tcp), "tcp");
        assert_eq!(format!("{}", Protocol::Udp), "udp");
        assert_eq!("udp".parse::<Protocol>().unwrap(), Protocol::Udp);
        assert!("sctp".parse::<Protocol>().is_err());
    }

    #[test]
    fn forwarded_port_json() {
        let port: ForwardedPort =
            serde_json::from_str(r#"{"protocol":"udp","hostPort":5353,"podPort":53}"#).unwrap();
        assert_eq!(port, ForwardedPort::udp(5353, 53));
    }
}
