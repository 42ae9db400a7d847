//! Address allocation through allocator plugins.
//!
//! The allocator named in a network's `ipam` block is invoked directly
//! with the network's raw declaration. Interfaces are created by this
//! crate, so the network's own plugin is never run.

use podnet_common::{PodId, PodnetError, PodnetResult};

use crate::descriptor::NetworkDescriptor;
use crate::link::LinkManager;
use crate::plugin::{PluginCommand, PluginRequest, PluginResult, PluginRunner};

/// Build the request for the network's allocator plugin.
///
/// # Errors
///
/// Returns a configuration error if the network has no allocator.
pub fn ipam_plugin_request(
    desc: &NetworkDescriptor,
    pod_id: &PodId,
    command: PluginCommand,
    if_name: &str,
) -> PodnetResult<PluginRequest> {
    Ok(PluginRequest {
        plugin: desc.conf().ipam_plugin()?.to_string(),
        command,
        pod_id: pod_id.clone(),
        if_name: if_name.to_string(),
        conf_bytes: desc.conf_bytes().to_vec(),
    })
}

/// Invoke the network's allocator plugin.
///
/// # Errors
///
/// Returns a configuration error without an allocator, otherwise the
/// plugin error unchanged.
pub async fn exec_ipam_plugin(
    plugins: &dyn PluginRunner,
    desc: &NetworkDescriptor,
    pod_id: &PodId,
    command: PluginCommand,
    if_name: &str,
) -> PodnetResult<Vec<u8>> {
    let request = ipam_plugin_request(desc, pod_id, command, if_name)?;
    plugins.run(&request).await
}

/// Allocate an address for the interface `if_name` and record it.
///
/// The runtime IPv4 block is only written once the allocator has returned
/// a complete one, so a failure leaves the descriptor's addressing empty.
///
/// # Errors
///
/// Fails if forwarding cannot be enabled, the allocator fails, or its
/// result has no IPv4 block or gateway.
pub async fn setup_addressing(
    links: &dyn LinkManager,
    plugins: &dyn PluginRunner,
    pod_id: &PodId,
    desc: &mut NetworkDescriptor,
    if_name: &str,
) -> PodnetResult<()> {
    links
        .enable_ip4_forward()
        .await
        .map_err(|e| e.in_network(desc.name(), "failed to enable forwarding"))?;

    let request = ipam_plugin_request(desc, pod_id, PluginCommand::Add, if_name)?;
    let output = plugins.run(&request).await.map_err(|e| {
        e.in_network(
            desc.name(),
            format!("problem executing network plugin {:?} ({if_name:?})", request.plugin),
        )
    })?;

    let result = PluginResult::parse(&request.plugin, &output)
        .map_err(|e| e.in_network(desc.name(), "failed to parse allocator result"))?;
    let ip4 = result.ip4.ok_or_else(|| {
        PodnetError::Plugin {
            plugin: request.plugin.clone(),
            message: "net-plugin returned no IPv4 configuration".to_string(),
        }
        .in_network(desc.name(), "incomplete allocator result")
    })?;
    if ip4.gateway.is_none() {
        return Err(PodnetError::Plugin {
            plugin: request.plugin,
            message: "net-plugin returned no IPv4 gateway".to_string(),
        }
        .in_network(desc.name(), "incomplete allocator result"));
    }

    tracing::info!(
        network = %desc.name(),
        ifname = if_name,
        ip = %ip4.ip,
        "Address allocated"
    );
    desc.runtime.ip4 = Some(ip4);
    Ok(())
}

/// Release the address held for `if_name`.
///
/// # Errors
///
/// Returns the allocator error.
pub async fn release_addressing(
    plugins: &dyn PluginRunner,
    pod_id: &PodId,
    desc: &NetworkDescriptor,
    if_name: &str,
) -> PodnetResult<()> {
    exec_ipam_plugin(plugins, desc, pod_id, PluginCommand::Del, if_name).await?;
    tracing::debug!(network = %desc.name(), ifname = if_name, "Address released");
    Ok(())
}
