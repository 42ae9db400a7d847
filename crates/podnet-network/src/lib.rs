//! # podnet-network
//!
//! Host side networking for VM-isolated pods.
//!
//! This crate provides:
//! - Host interfaces per network type (ptp, bridge, macvlan)
//! - Address allocation through allocator plugins
//! - The flannel overlay transform
//! - Masquerade and port forwarding rules
//! - Best-effort teardown with a structured report

#![warn(missing_docs)]

pub mod conf;
pub mod config;
pub mod descriptor;
pub mod firewall;
pub mod flannel;
pub mod ipam;
pub mod lease;
pub mod link;
pub mod loader;
pub mod netinfo;
pub mod netlist;
pub mod networking;
pub mod plugin;
pub mod portmap;
pub mod tap;
pub mod teardown;
pub mod topology;

#[cfg(test)]
mod testing;

pub use conf::{MacvlanMode, NetConf, NetKind};
pub use config::NetworkingConfig;
pub use descriptor::{NetRuntime, NetworkDescriptor};
pub use firewall::{Firewall, Iptables, chain_name};
pub use link::{IpRoute2, LinkInfo, LinkManager};
pub use netlist::NetList;
pub use networking::{Backend, Networking, PodEnv, setup_pod};
pub use plugin::{ExecPluginRunner, PluginCommand, PluginRequest, PluginRunner};
pub use portmap::{ForwardedPort, Protocol};
pub use teardown::{TeardownAction, TeardownReport, TeardownStep};
