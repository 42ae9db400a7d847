//! Flannel subnet lease file.
//!
//! The flannel daemon writes the lease it holds for this host as
//! `KEY=VALUE` lines:
//!
//! ```text
//! FLANNEL_NETWORK=10.1.0.0/16
//! FLANNEL_SUBNET=10.1.17.1/24
//! FLANNEL_MTU=1472
//! FLANNEL_IPMASQ=true
//! ```

use std::path::Path;

use ipnet::Ipv4Net;
use podnet_common::{PodnetError, PodnetResult};

/// Parsed lease.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SubnetLease {
    /// Whole overlay network.
    pub network: Option<Ipv4Net>,
    /// Subnet leased to this host.
    pub subnet: Option<Ipv4Net>,
    /// MTU of the overlay.
    pub mtu: Option<u32>,
    /// Whether flannel itself masquerades.
    pub ip_masq: bool,
}

impl SubnetLease {
    /// Parse lease text. Unknown keys are ignored.
    ///
    /// # Errors
    ///
    /// Returns a configuration error for malformed CIDR or MTU values.
    pub fn parse(text: &str) -> PodnetResult<Self> {
        let mut lease = Self::default();

        for line in text.lines() {
            let (key, value) = line.split_once('=').unwrap_or((line, ""));
            let value = value.trim();
            match key.trim() {
                "FLANNEL_NETWORK" => lease.network = Some(parse_cidr(key, value)?),
                "FLANNEL_SUBNET" => lease.subnet = Some(parse_cidr(key, value)?),
                "FLANNEL_MTU" => {
                    let mtu = value.parse::<u32>().map_err(|e| {
                        PodnetError::config(format!("invalid FLANNEL_MTU {value:?}: {e}"))
                    })?;
                    lease.mtu = Some(mtu);
                }
                "FLANNEL_IPMASQ" => lease.ip_masq = value == "true",
                _ => {}
            }
        }

        Ok(lease)
    }

    /// Read and parse a lease file.
    ///
    /// # Errors
    ///
    /// Returns a configuration error if the file cannot be read or is malformed.
    pub async fn load(path: &Path) -> PodnetResult<Self> {
        tracing::debug!(path = %path.display(), "Loading flannel subnet lease");
        let text = tokio::fs::read_to_string(path).await.map_err(|e| {
            PodnetError::config(format!("cannot read lease file {}: {e}", path.display()))
        })?;
        Self::parse(&text)
    }

    /// Overlay network, required by the delegate route.
    ///
    /// # Errors
    ///
    /// Returns a configuration error if the lease has no `FLANNEL_NETWORK`.
    pub fn require_network(&self) -> PodnetResult<Ipv4Net> {
        self.network
            .ok_or_else(|| PodnetError::config("lease file has no FLANNEL_NETWORK"))
    }

    /// Host subnet, required by the delegate allocator.
    ///
    /// # Errors
    ///
    /// Returns a configuration error if the lease has no `FLANNEL_SUBNET`.
    pub fn require_subnet(&self) -> PodnetResult<Ipv4Net> {
        self.subnet
            .ok_or_else(|| PodnetError::config("lease file has no FLANNEL_SUBNET"))
    }
}

// The lease carries the host's gateway address in FLANNEL_SUBNET; only the
// network part is kept.
fn parse_cidr(key: &str, value: &str) -> PodnetResult<Ipv4Net> {
    value
        .parse::<Ipv4Net>()
        .map(|net| net.trunc())
        .map_err(|e| PodnetError::config(format!("invalid {key} {value:?}: {e}")))
}
