//! Host side interfaces for each network type.
//!
//! Every network gets one host interface the VM attaches to: a plain tap
//! for `ptp`, a tap enslaved to a bridge for `bridge`, and a macvtap on a
//! physical device for `macvlan`.

use ipnet::Ipv4Net;
use podnet_common::{PodId, PodnetError, PodnetResult};

use crate::conf::{BridgeConf, DEFAULT_MTU, MacvlanConf, NetKind};
use crate::descriptor::NetworkDescriptor;
use crate::ipam;
use crate::link::{LinkInfo, LinkManager};
use crate::plugin::PluginRunner;

/// Prefix of every host interface created for a pod.
pub const IF_PREFIX: &str = "kvm";

/// Tap name template; the kernel replaces `%d` with a free number.
///
/// Interface names are limited to 15 characters, so only a fragment of the
/// pod ID fits.
#[must_use]
pub fn tap_template(pod_id: &PodId) -> String {
    format!("{IF_PREFIX}-{}-tap%d", pod_id.fragment())
}

/// Macvtap name for the network at `index` in the pod's declaration order.
#[must_use]
pub fn macvtap_name(pod_id: &PodId, index: usize) -> String {
    format!("{IF_PREFIX}-{}-vtap{index}", pod_id.fragment())
}

/// Create a bridge unless it exists, and bring it up.
///
/// An existing bridge is reused as is, so repeated calls yield the same
/// device.
///
/// # Errors
///
/// Returns [`PodnetError::Conflict`] if a link of that name exists and is
/// not a bridge, or a kernel error.
pub async fn ensure_bridge(
    links: &dyn LinkManager,
    name: &str,
    mtu: u32,
) -> PodnetResult<LinkInfo> {
    let bridge = match links.link_by_name(name).await? {
        Some(link) => link,
        None => match links.add_bridge(name, mtu).await {
            Ok(()) => links.link_by_name(name).await?.ok_or_else(|| {
                PodnetError::kernel("link add", format!("bridge {name:?} vanished after creation"))
            })?,
            // Another pod may have created it in between.
            Err(err) => links.link_by_name(name).await?.ok_or(err)?,
        },
    };

    if !bridge.is_bridge() {
        return Err(PodnetError::Conflict {
            message: format!("{name:?} already exists but is not a bridge"),
        });
    }

    links.set_up(name).await?;
    tracing::debug!(bridge = name, index = bridge.index, "Bridge is up");
    Ok(bridge)
}

/// Make sure `addr` is the IPv4 address of a link.
///
/// A link without addresses gets `addr`; one already carrying `addr` is
/// left alone.
///
/// # Errors
///
/// Returns [`PodnetError::Conflict`] if the link has a different address.
pub async fn ensure_has_addr(
    links: &dyn LinkManager,
    name: &str,
    addr: Ipv4Net,
) -> PodnetResult<()> {
    let existing = links.addresses_v4(name).await?;
    if existing.contains(&addr) {
        return Ok(());
    }
    if !existing.is_empty() {
        return Err(PodnetError::Conflict {
            message: format!("{name:?} already has an IP address different from {addr}"),
        });
    }

    links.add_address(name, addr).await?;
    tracing::debug!(ifname = name, addr = %addr, "Address added");
    Ok(())
}

/// Create a persistent tap for the pod and bring it up.
///
/// # Errors
///
/// Returns a kernel error; a tap that cannot be brought up is removed.
pub async fn setup_tap(links: &dyn LinkManager, pod_id: &PodId) -> PodnetResult<String> {
    let name = links.create_tap(&tap_template(pod_id)).await?;
    if let Err(err) = links.set_up(&name).await {
        if let Err(remove_err) = links.remove_tap(&name).await {
            tracing::warn!(ifname = %name, error = %remove_err, "Could not clean up tap");
        }
        return Err(err);
    }
    tracing::debug!(ifname = %name, "Tap is up");
    Ok(name)
}

/// Create the macvtap for the network at `index` and bring it up.
///
/// # Errors
///
/// Returns [`PodnetError::Unsupported`] for an unknown mode before any link
/// is created, or a kernel error. A macvtap that cannot be brought up is
/// deleted.
pub async fn setup_macvtap(
    links: &dyn LinkManager,
    pod_id: &PodId,
    conf: &MacvlanConf,
    mtu: Option<u32>,
    index: usize,
) -> PodnetResult<String> {
    let mode = conf.mode()?;
    let master = links.link_by_name(&conf.master).await?.ok_or_else(|| {
        PodnetError::kernel(
            "link show",
            format!("cannot find master device {:?}", conf.master),
        )
    })?;
    let mtu = mtu.unwrap_or(master.mtu);
    let name = macvtap_name(pod_id, index);

    links.add_macvtap(&name, &master, mode, mtu).await?;
    if let Err(err) = links.set_up(&name).await {
        if let Err(delete_err) = links.delete_link(&name).await {
            tracing::warn!(ifname = %name, error = %delete_err, "Could not delete macvtap");
        }
        return Err(err);
    }
    Ok(name)
}

/// Route only the pod address through its tap.
async fn route_pod_address(links: &dyn LinkManager, desc: &NetworkDescriptor) -> PodnetResult<()> {
    let (Some(if_name), Some(ip)) = (desc.if_name(), desc.ip()) else {
        return Ok(());
    };

    for dst in links.routes_v4(if_name).await? {
        links
            .delete_route(if_name, &dst)
            .await
            .map_err(|e| e.in_network(desc.name(), format!("cannot remove route on {if_name:?}")))?;
    }
    links
        .add_host_route(if_name, ip)
        .await
        .map_err(|e| e.in_network(desc.name(), "cannot add host route to pod"))
}

/// Create the host interface of a network and allocate its address.
///
/// `index` is the network's position in the pod. The interface name is
/// recorded in the descriptor as soon as it exists, so a later failure
/// still leaves teardown something to remove.
///
/// # Errors
///
/// Returns the first failing step, tagged with the network name. Nothing
/// created for other networks is touched.
pub async fn provision(
    links: &dyn LinkManager,
    plugins: &dyn PluginRunner,
    pod_id: &PodId,
    index: usize,
    desc: &mut NetworkDescriptor,
) -> PodnetResult<()> {
    let name = desc.name().to_string();
    tracing::debug!(network = %name, kind = desc.kind().type_name(), index, "Provisioning network");

    match desc.kind().clone() {
        NetKind::Ptp => {
            let if_name = setup_tap(links, pod_id)
                .await
                .map_err(|e| e.in_network(&name, "cannot set up tap device"))?;
            desc.runtime.if_name = Some(if_name.clone());

            ipam::setup_addressing(links, plugins, pod_id, desc, &if_name).await?;
            if let Some(gateway) = desc.gateway_net() {
                ensure_has_addr(links, &if_name, gateway).await.map_err(|e| {
                    e.in_network(&name, format!("cannot add address to host tap device {if_name:?}"))
                })?;
            }
            route_pod_address(links, desc).await?;
        }
        NetKind::Bridge(conf) => {
            provision_bridge(links, plugins, pod_id, desc, &conf).await?;
            route_pod_address(links, desc).await?;
        }
        NetKind::Macvlan(conf) => {
            let if_name = setup_macvtap(links, pod_id, &conf, desc.conf().mtu, index)
                .await
                .map_err(|e| e.in_network(&name, "cannot set up macvtap device"))?;
            desc.runtime.if_name = Some(if_name.clone());

            ipam::setup_addressing(links, plugins, pod_id, desc, &if_name).await?;
        }
        NetKind::Flannel(_) => {
            return Err(PodnetError::config("flannel network was not transformed")
                .in_network(&name, "provision"));
        }
        NetKind::Other(net_type) => {
            return Err(PodnetError::Unsupported {
                feature: format!("network type {net_type:?}"),
            }
            .in_network(&name, "provision"));
        }
    }

    tracing::info!(
        network = %name,
        ifname = desc.if_name().unwrap_or_default(),
        ip = ?desc.ip(),
        "Network provisioned"
    );
    Ok(())
}

async fn provision_bridge(
    links: &dyn LinkManager,
    plugins: &dyn PluginRunner,
    pod_id: &PodId,
    desc: &mut NetworkDescriptor,
    conf: &BridgeConf,
) -> PodnetResult<()> {
    let name = desc.name().to_string();
    let mtu = desc.conf().mtu.unwrap_or(DEFAULT_MTU);

    ensure_bridge(links, &conf.bridge, mtu)
        .await
        .map_err(|e| e.in_network(&name, "error in time of bridge setup"))?;
    let if_name = setup_tap(links, pod_id)
        .await
        .map_err(|e| e.in_network(&name, "cannot set up tap device"))?;

    if let Err(err) = links.set_master(&if_name, &conf.bridge).await {
        if let Err(remove_err) = links.remove_tap(&if_name).await {
            tracing::warn!(ifname = %if_name, error = %remove_err, "Could not clean up tap");
        }
        return Err(err.in_network(&name, "cannot add tap interface to bridge"));
    }
    desc.runtime.if_name = Some(if_name.clone());

    ipam::setup_addressing(links, plugins, pod_id, desc, &if_name).await?;
    if !conf.is_gateway {
        return Ok(());
    }
    if let Some(gateway) = desc.gateway_net() {
        ensure_has_addr(links, &conf.bridge, gateway).await.map_err(|e| {
            e.in_network(
                &name,
                format!("cannot add address to host bridge device {:?}", conf.bridge),
            )
        })?;
    }
    Ok(())
}
