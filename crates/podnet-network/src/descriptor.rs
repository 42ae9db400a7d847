//! Per-network descriptors and their runtime state.

use std::net::Ipv4Addr;

use ipnet::Ipv4Net;
use podnet_common::PodnetResult;
use serde::{Deserialize, Serialize};

use crate::conf::{NetConf, NetKind};

/// A route handed out by an allocator.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Route {
    /// Destination network.
    pub dst: Ipv4Net,
    /// Next hop, when not the network gateway.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub gw: Option<Ipv4Addr>,
}

/// IPv4 block returned by an allocator.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Ipv4Config {
    /// Pod address with its prefix length.
    pub ip: Ipv4Net,
    /// Gateway on the host side.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub gateway: Option<Ipv4Addr>,
    /// Routes to install in the pod.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub routes: Vec<Route>,
}

/// State produced while provisioning a network.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct NetRuntime {
    /// Host interface created for the network.
    #[serde(default, rename = "ifName", skip_serializing_if = "Option::is_none")]
    pub if_name: Option<String>,
    /// Allocated IPv4 block, always with a gateway once set.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ip4: Option<Ipv4Config>,
}

/// One declared network of a pod.
#[derive(Debug, Clone, PartialEq)]
pub struct NetworkDescriptor {
    conf_bytes: Vec<u8>,
    conf: NetConf,
    /// Runtime state, written by the provisioning steps.
    pub runtime: NetRuntime,
}

impl NetworkDescriptor {
    /// Create a descriptor with empty runtime state from raw JSON.
    ///
    /// # Errors
    ///
    /// Returns a configuration error if the JSON is not a valid declaration.
    pub fn from_bytes(conf_bytes: Vec<u8>) -> PodnetResult<Self> {
        let conf = NetConf::from_bytes(&conf_bytes)?;
        Ok(Self {
            conf_bytes,
            conf,
            runtime: NetRuntime::default(),
        })
    }

    /// Network name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.conf.name
    }

    /// Raw declaration, as handed to plugins.
    #[must_use]
    pub fn conf_bytes(&self) -> &[u8] {
        &self.conf_bytes
    }

    /// Parsed declaration.
    #[must_use]
    pub const fn conf(&self) -> &NetConf {
        &self.conf
    }

    /// Type specific settings.
    #[must_use]
    pub const fn kind(&self) -> &NetKind {
        &self.conf.kind
    }

    /// Host interface name, once created.
    #[must_use]
    pub fn if_name(&self) -> Option<&str> {
        self.runtime.if_name.as_deref()
    }

    /// Pod address.
    #[must_use]
    pub fn ip(&self) -> Option<Ipv4Addr> {
        self.runtime.ip4.as_ref().map(|ip4| ip4.ip.addr())
    }

    /// Pod netmask.
    #[must_use]
    pub fn mask(&self) -> Option<Ipv4Addr> {
        self.runtime.ip4.as_ref().map(|ip4| ip4.ip.netmask())
    }

    /// Host side gateway address.
    #[must_use]
    pub fn host_ip(&self) -> Option<Ipv4Addr> {
        self.runtime.ip4.as_ref().and_then(|ip4| ip4.gateway)
    }

    /// Pod address with its prefix.
    #[must_use]
    pub fn ip_net(&self) -> Option<Ipv4Net> {
        self.runtime.ip4.as_ref().map(|ip4| ip4.ip)
    }

    /// Gateway address with the pod prefix, as assigned on host devices.
    #[must_use]
    pub fn gateway_net(&self) -> Option<Ipv4Net> {
        let ip4 = self.runtime.ip4.as_ref()?;
        let gateway = ip4.gateway?;
        Ipv4Net::new(gateway, ip4.ip.prefix_len()).ok()
    }
}
