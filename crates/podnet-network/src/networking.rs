//! Pod networking lifecycle.
//!
//! [`Networking`] owns a pod's network descriptors. Networks are set up
//! one at a time in declaration order; the first failure stops setup and
//! nothing is rolled back. Whatever was created is recorded in the
//! descriptors, and [`Networking::teardown`] removes it.

use std::net::Ipv4Addr;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use podnet_common::{PodId, PodnetError, PodnetResult};

use crate::conf::NetKind;
use crate::config::NetworkingConfig;
use crate::descriptor::NetworkDescriptor;
use crate::firewall::{Firewall, Iptables, chain_name, forward_chain_name};
use crate::link::{IpRoute2, LinkManager};
use crate::netlist::NetList;
use crate::plugin::{ExecPluginRunner, PluginRunner};
use crate::portmap::ForwardedPort;
use crate::teardown::{TeardownAction, TeardownReport};
use crate::{flannel, ipam, loader, netinfo, topology};

/// Host facilities used to provision networks.
#[derive(Clone)]
pub struct Backend {
    /// Kernel links, addresses and routes.
    pub links: Arc<dyn LinkManager>,
    /// Network and allocator plugins.
    pub plugins: Arc<dyn PluginRunner>,
    /// NAT rules.
    pub firewall: Arc<dyn Firewall>,
}

impl Backend {
    /// Bundle custom implementations.
    pub fn new(
        links: Arc<dyn LinkManager>,
        plugins: Arc<dyn PluginRunner>,
        firewall: Arc<dyn Firewall>,
    ) -> Self {
        Self {
            links,
            plugins,
            firewall,
        }
    }

    /// The host's own tools: iproute2, plugin executables and iptables.
    #[must_use]
    pub fn system(config: &NetworkingConfig) -> Self {
        Self::new(
            Arc::new(IpRoute2::new()),
            Arc::new(ExecPluginRunner::new(config.paths.plugin_dirs())),
            Arc::new(Iptables::new()),
        )
    }
}

impl std::fmt::Debug for Backend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Backend").finish_non_exhaustive()
    }
}

/// What a pod asks of the network.
#[derive(Debug, Clone)]
pub struct PodEnv {
    /// Pod directory, where the net info is saved.
    pub pod_root: PathBuf,
    /// Pod ID.
    pub pod_id: PodId,
    /// Networks to join.
    pub net_list: NetList,
    /// Ports forwarded to the pod's default address.
    pub ports: Vec<ForwardedPort>,
}

impl PodEnv {
    /// A pod joining every configured network, without forwarded ports.
    pub fn new(pod_root: impl Into<PathBuf>, pod_id: PodId) -> Self {
        Self {
            pod_root: pod_root.into(),
            pod_id,
            net_list: NetList::everything(),
            ports: Vec::new(),
        }
    }

    /// Set the networks to join.
    #[must_use]
    pub fn with_net_list(mut self, net_list: NetList) -> Self {
        self.net_list = net_list;
        self
    }

    /// Set the forwarded ports.
    #[must_use]
    pub fn with_ports(mut self, ports: Vec<ForwardedPort>) -> Self {
        self.ports = ports;
        self
    }
}

/// A pod's networks.
#[derive(Debug)]
pub struct Networking {
    env: PodEnv,
    config: NetworkingConfig,
    backend: Backend,
    nets: Vec<NetworkDescriptor>,
}

impl Networking {
    /// Load the networks selected by the pod from the local configuration.
    ///
    /// # Errors
    ///
    /// Returns a configuration error from [`loader::load_nets`].
    pub async fn load(
        env: PodEnv,
        config: NetworkingConfig,
        backend: Backend,
    ) -> PodnetResult<Self> {
        let nets = loader::load_nets(&config.paths.net_d(), &env.net_list)
            .await
            .map_err(|e| PodnetError::config(format!("error loading network definitions: {e}")))?;
        Ok(Self::from_nets(env, config, backend, nets))
    }

    /// Use already parsed descriptors.
    #[must_use]
    pub const fn from_nets(
        env: PodEnv,
        config: NetworkingConfig,
        backend: Backend,
        nets: Vec<NetworkDescriptor>,
    ) -> Self {
        Self {
            env,
            config,
            backend,
            nets,
        }
    }

    /// Reload the descriptors saved by a previous setup of this pod.
    ///
    /// # Errors
    ///
    /// Returns an error if the saved net info cannot be read.
    pub async fn restore(
        env: PodEnv,
        config: NetworkingConfig,
        backend: Backend,
    ) -> PodnetResult<Self> {
        let nets = netinfo::load(&env.pod_root).await?;
        tracing::debug!(pod_id = %env.pod_id, count = nets.len(), "Restored networks");
        Ok(Self::from_nets(env, config, backend, nets))
    }

    /// Descriptors in declaration order.
    #[must_use]
    pub fn nets(&self) -> &[NetworkDescriptor] {
        &self.nets
    }

    /// Pod ID.
    #[must_use]
    pub const fn pod_id(&self) -> &PodId {
        &self.env.pod_id
    }

    /// Pod directory.
    #[must_use]
    pub fn pod_root(&self) -> &Path {
        &self.env.pod_root
    }

    /// Address of the pod on its first network.
    #[must_use]
    pub fn default_ip(&self) -> Option<Ipv4Addr> {
        self.nets.first().and_then(NetworkDescriptor::ip)
    }

    /// Provision every network, then forward the pod's ports.
    ///
    /// The descriptors are saved to the pod root whether or not setup
    /// succeeds, so a later [`Networking::restore`] can tear down what
    /// was created.
    ///
    /// # Errors
    ///
    /// Returns the first failure, tagged with the network it belongs to.
    /// Networks set up before it are left in place.
    pub async fn setup(&mut self) -> PodnetResult<()> {
        let result = self.setup_nets().await;

        if let Err(e) = netinfo::save(&self.env.pod_root, &self.nets).await {
            if result.is_ok() {
                return Err(e);
            }
            tracing::warn!(pod_id = %self.env.pod_id, error = %e, "Could not save net info");
        }
        result
    }

    async fn setup_nets(&mut self) -> PodnetResult<()> {
        let Self {
            env,
            config,
            backend,
            nets,
        } = self;

        for (index, desc) in nets.iter_mut().enumerate() {
            if matches!(desc.kind(), NetKind::Flannel(_)) {
                let name = desc.name().to_string();
                flannel::transform(desc, &config.subnet_file)
                    .await
                    .map_err(|e| {
                        e.in_network(&name, "cannot transform flannel network into basic network")
                    })?;
            }

            topology::provision(
                backend.links.as_ref(),
                backend.plugins.as_ref(),
                &env.pod_id,
                index,
                desc,
            )
            .await?;

            if desc.conf().ip_masq {
                let chain = chain_name(&env.pod_id, desc.name());
                let net = desc.ip_net().ok_or_else(|| {
                    PodnetError::config("no address to masquerade")
                        .in_network(desc.name(), "setup masquerading")
                })?;
                backend
                    .firewall
                    .setup_masquerade(net, &chain, &config.masq_comment)
                    .await
                    .map_err(|e| e.in_network(desc.name(), "setup masquerading"))?;
            }
        }

        if !env.ports.is_empty() {
            let target = nets.first().and_then(NetworkDescriptor::ip).ok_or_else(|| {
                PodnetError::config("ports are forwarded but the pod has no address")
            })?;
            backend
                .firewall
                .forward_ports(&forward_chain_name(&env.pod_id), &env.ports, target)
                .await?;
        }

        tracing::info!(pod_id = %env.pod_id, count = nets.len(), "Pod networking set up");
        Ok(())
    }

    /// Remove everything setup may have created.
    ///
    /// Every step is attempted regardless of earlier failures; failures are
    /// logged and recorded in the report, never returned. The descriptors
    /// are consumed, so a second call only repeats the pod-wide steps.
    pub async fn teardown(&mut self) -> TeardownReport {
        let mut report = TeardownReport::new();
        let Self {
            env,
            config,
            backend,
            nets,
        } = self;

        report.record(
            None,
            TeardownAction::UnforwardPorts,
            backend
                .firewall
                .unforward_ports(&forward_chain_name(&env.pod_id))
                .await,
        );

        for desc in std::mem::take(nets) {
            teardown_net(backend, env, config, &desc, &mut report).await;
        }

        report.record(
            None,
            TeardownAction::RemoveNetInfo,
            netinfo::remove(&env.pod_root).await,
        );

        tracing::info!(
            pod_id = %env.pod_id,
            failures = report.failures().count(),
            "Pod networking torn down"
        );
        report
    }
}

async fn teardown_net(
    backend: &Backend,
    env: &PodEnv,
    config: &NetworkingConfig,
    desc: &NetworkDescriptor,
    report: &mut TeardownReport,
) {
    let network = Some(desc.name());
    let if_name = desc.if_name().unwrap_or_default();

    match desc.kind() {
        NetKind::Ptp | NetKind::Bridge(_) => {
            // No interface name means the tap was never created.
            if !if_name.is_empty() {
                report.record(
                    network,
                    TeardownAction::RemoveTap(if_name.to_string()),
                    backend.links.remove_tap(if_name).await,
                );
            }
        }
        NetKind::Macvlan(_) => {
            let lookup = match backend.links.link_by_name(if_name).await {
                Ok(Some(_)) => Ok(()),
                Ok(None) => Err(PodnetError::kernel(
                    "link show",
                    format!("cannot find link {if_name:?}"),
                )),
                Err(e) => Err(e),
            };
            if !report.record(network, TeardownAction::LookupLink(if_name.to_string()), lookup) {
                return;
            }
            let deleted = backend.links.delete_link(if_name).await;
            if !report.record(network, TeardownAction::DeleteLink(if_name.to_string()), deleted) {
                return;
            }
        }
        NetKind::Flannel(_) | NetKind::Other(_) => {
            let kind = desc.kind().type_name().to_string();
            report.record(
                network,
                TeardownAction::Unsupported(kind.clone()),
                Err(PodnetError::Unsupported {
                    feature: format!("network type {kind:?}"),
                }),
            );
            return;
        }
    }

    report.record(
        network,
        TeardownAction::ReleaseAddress,
        ipam::release_addressing(backend.plugins.as_ref(), &env.pod_id, desc, if_name).await,
    );

    if desc.conf().ip_masq {
        let chain = chain_name(&env.pod_id, desc.name());
        let result = backend
            .firewall
            .teardown_masquerade(desc.ip_net(), &chain, &config.masq_comment)
            .await;
        report.record(network, TeardownAction::RemoveMasquerade(chain), result);
    }
}

/// Load and set up a pod's networks.
///
/// On failure nothing is rolled back: the created resources are recorded
/// in the pod's net info, and the caller is expected to run
/// [`Networking::restore`] followed by [`Networking::teardown`].
///
/// # Errors
///
/// Returns the loading or setup error.
pub async fn setup_pod(
    env: PodEnv,
    config: NetworkingConfig,
    backend: Backend,
) -> PodnetResult<Networking> {
    let mut networking = Networking::load(env, config, backend).await?;
    networking.setup().await?;
    Ok(networking)
}
