//! Host link, address and route programming.
//!
//! [`LinkManager`] is the seam between the provisioning logic and the
//! kernel. [`IpRoute2`] implements it with the `ip` tool (JSON output for
//! queries) and the tun driver for persistent taps.

use std::net::Ipv4Addr;
use std::process::Output;

use async_trait::async_trait;
use ipnet::Ipv4Net;
use podnet_common::{PodnetError, PodnetResult};
use serde::Deserialize;
use tokio::process::Command;

use crate::conf::MacvlanMode;
use crate::tap;

/// Sysctl toggled to let the host route pod traffic.
pub const IP_FORWARD_SYSCTL: &str = "/proc/sys/net/ipv4/ip_forward";

/// A host link.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LinkInfo {
    /// Interface index.
    pub index: u32,
    /// Interface name.
    pub name: String,
    /// Link kind (`bridge`, `tun`, `macvtap`, ...), absent for plain devices.
    pub kind: Option<String>,
    /// Link MTU.
    pub mtu: u32,
}

impl LinkInfo {
    /// Whether the link is a bridge.
    #[must_use]
    pub fn is_bridge(&self) -> bool {
        self.kind.as_deref() == Some("bridge")
    }
}

/// Kernel operations used while provisioning and tearing down.
#[async_trait]
pub trait LinkManager: Send + Sync {
    /// Create a persistent tap from a `%d` name template.
    async fn create_tap(&self, template: &str) -> PodnetResult<String>;

    /// Remove a persistent tap.
    async fn remove_tap(&self, name: &str) -> PodnetResult<()>;

    /// Look up a link, `None` if it does not exist.
    async fn link_by_name(&self, name: &str) -> PodnetResult<Option<LinkInfo>>;

    /// Create a bridge.
    async fn add_bridge(&self, name: &str, mtu: u32) -> PodnetResult<()>;

    /// Create a macvtap on `master`.
    async fn add_macvtap(
        &self,
        name: &str,
        master: &LinkInfo,
        mode: MacvlanMode,
        mtu: u32,
    ) -> PodnetResult<()>;

    /// Delete a link.
    async fn delete_link(&self, name: &str) -> PodnetResult<()>;

    /// Bring a link up.
    async fn set_up(&self, name: &str) -> PodnetResult<()>;

    /// Attach a link to a bridge.
    async fn set_master(&self, name: &str, master: &str) -> PodnetResult<()>;

    /// IPv4 addresses on a link.
    async fn addresses_v4(&self, name: &str) -> PodnetResult<Vec<Ipv4Net>>;

    /// Add an IPv4 address to a link.
    async fn add_address(&self, name: &str, addr: Ipv4Net) -> PodnetResult<()>;

    /// Destinations of the IPv4 routes through a link.
    async fn routes_v4(&self, name: &str) -> PodnetResult<Vec<String>>;

    /// Delete the IPv4 route to `dst` through a link.
    async fn delete_route(&self, name: &str, dst: &str) -> PodnetResult<()>;

    /// Add a link-scope /32 route to `ip` through a link.
    async fn add_host_route(&self, name: &str, ip: Ipv4Addr) -> PodnetResult<()>;

    /// Enable IPv4 forwarding on the host.
    async fn enable_ip4_forward(&self) -> PodnetResult<()>;
}

/// [`LinkManager`] backed by iproute2.
#[derive(Debug, Clone, Default)]
pub struct IpRoute2;

#[derive(Debug, Deserialize)]
struct IpLink {
    ifindex: u32,
    ifname: String,
    #[serde(default)]
    mtu: u32,
    #[serde(default)]
    linkinfo: Option<IpLinkInfo>,
}

#[derive(Debug, Deserialize)]
struct IpLinkInfo {
    #[serde(default)]
    info_kind: Option<String>,
}

#[derive(Debug, Deserialize)]
struct IpAddrLink {
    #[serde(default)]
    addr_info: Vec<IpAddrInfo>,
}

#[derive(Debug, Deserialize)]
struct IpAddrInfo {
    #[serde(default)]
    family: Option<String>,
    local: Option<Ipv4Addr>,
    prefixlen: u8,
}

#[derive(Debug, Deserialize)]
struct IpRoute {
    dst: String,
}

impl IpRoute2 {
    /// Create a new iproute2 link manager.
    #[must_use]
    pub const fn new() -> Self {
        Self
    }

    async fn output(args: &[&str]) -> PodnetResult<Output> {
        Command::new("ip")
            .args(args)
            .output()
            .await
            .map_err(|e| PodnetError::kernel(args.join(" "), format!("failed to run ip: {e}")))
    }

    async fn run(args: &[&str]) -> PodnetResult<Vec<u8>> {
        tracing::debug!(args = ?args, "Running ip");
        let output = Self::output(args).await?;
        if !output.status.success() {
            return Err(PodnetError::kernel(
                args.join(" "),
                String::from_utf8_lossy(&output.stderr).trim().to_string(),
            ));
        }
        Ok(output.stdout)
    }

    fn parse<T: for<'de> Deserialize<'de>>(args: &[&str], stdout: &[u8]) -> PodnetResult<T> {
        // `ip -j` prints nothing at all for an empty result on some versions.
        let stdout = if stdout.iter().all(u8::is_ascii_whitespace) {
            b"[]".as_slice()
        } else {
            stdout
        };
        serde_json::from_slice(stdout).map_err(|e| {
            PodnetError::kernel(args.join(" "), format!("unexpected ip output: {e}"))
        })
    }
}

#[async_trait]
impl LinkManager for IpRoute2 {
    async fn create_tap(&self, template: &str) -> PodnetResult<String> {
        tap::create_persistent(template)
    }

    async fn remove_tap(&self, name: &str) -> PodnetResult<()> {
        tap::remove_persistent(name)
    }

    async fn link_by_name(&self, name: &str) -> PodnetResult<Option<LinkInfo>> {
        let args = ["-j", "-d", "link", "show", "dev", name];
        let output = Self::output(&args).await?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            if stderr.contains("does not exist") {
                return Ok(None);
            }
            return Err(PodnetError::kernel(args.join(" "), stderr.trim().to_string()));
        }

        let links: Vec<IpLink> = Self::parse(&args, &output.stdout)?;
        Ok(links.into_iter().next().map(|link| LinkInfo {
            index: link.ifindex,
            name: link.ifname,
            kind: link.linkinfo.and_then(|info| info.info_kind),
            mtu: link.mtu,
        }))
    }

    async fn add_bridge(&self, name: &str, mtu: u32) -> PodnetResult<()> {
        let mtu = mtu.to_string();
        Self::run(&["link", "add", "name", name, "mtu", &mtu, "type", "bridge"]).await?;
        tracing::info!(name, "Bridge created");
        Ok(())
    }

    async fn add_macvtap(
        &self,
        name: &str,
        master: &LinkInfo,
        mode: MacvlanMode,
        mtu: u32,
    ) -> PodnetResult<()> {
        let mtu = mtu.to_string();
        Self::run(&[
            "link",
            "add",
            "link",
            &master.name,
            "name",
            name,
            "mtu",
            &mtu,
            "type",
            "macvtap",
            "mode",
            mode.as_str(),
        ])
        .await?;
        tracing::info!(name, master = %master.name, mode = mode.as_str(), "Macvtap created");
        Ok(())
    }

    async fn delete_link(&self, name: &str) -> PodnetResult<()> {
        Self::run(&["link", "delete", "dev", name]).await?;
        Ok(())
    }

    async fn set_up(&self, name: &str) -> PodnetResult<()> {
        Self::run(&["link", "set", "dev", name, "up"]).await?;
        Ok(())
    }

    async fn set_master(&self, name: &str, master: &str) -> PodnetResult<()> {
        Self::run(&["link", "set", "dev", name, "master", master]).await?;
        Ok(())
    }

    async fn addresses_v4(&self, name: &str) -> PodnetResult<Vec<Ipv4Net>> {
        let args = ["-j", "-4", "addr", "show", "dev", name];
        let stdout = Self::run(&args).await?;
        let links: Vec<IpAddrLink> = Self::parse(&args, &stdout)?;

        Ok(links
            .into_iter()
            .flat_map(|link| link.addr_info)
            .filter(|info| info.family.as_deref().is_none_or(|f| f == "inet"))
            .filter_map(|info| {
                info.local
                    .and_then(|addr| Ipv4Net::new(addr, info.prefixlen).ok())
            })
            .collect())
    }

    async fn add_address(&self, name: &str, addr: Ipv4Net) -> PodnetResult<()> {
        let addr = addr.to_string();
        Self::run(&["addr", "add", &addr, "dev", name]).await?;
        Ok(())
    }

    async fn routes_v4(&self, name: &str) -> PodnetResult<Vec<String>> {
        let args = ["-j", "-4", "route", "show", "dev", name];
        let stdout = Self::run(&args).await?;
        let routes: Vec<IpRoute> = Self::parse(&args, &stdout)?;
        Ok(routes.into_iter().map(|route| route.dst).collect())
    }

    async fn delete_route(&self, name: &str, dst: &str) -> PodnetResult<()> {
        Self::run(&["-4", "route", "del", dst, "dev", name]).await?;
        Ok(())
    }

    async fn add_host_route(&self, name: &str, ip: Ipv4Addr) -> PodnetResult<()> {
        let dst = format!("{ip}/32");
        Self::run(&["-4", "route", "add", &dst, "dev", name, "scope", "link"]).await?;
        Ok(())
    }

    async fn enable_ip4_forward(&self) -> PodnetResult<()> {
        tokio::fs::write(IP_FORWARD_SYSCTL, "1")
            .await
            .map_err(|e| PodnetError::kernel("enable ip forwarding", e.to_string()))?;
        tracing::debug!("IP forwarding enabled");
        Ok(())
    }
}
