//! Masquerade and port forwarding rules.
//!
//! Chain names are derived from the pod ID and network name only, so the
//! same rules can be found again at teardown without any saved state.

use std::net::Ipv4Addr;

use async_trait::async_trait;
use ipnet::Ipv4Net;
use podnet_common::{PodId, PodnetError, PodnetResult};
use tokio::process::Command;

use crate::portmap::ForwardedPort;

/// Comment attached to masquerade rules.
pub const MASQ_COMMENT: &str = "podnet-kvm masquerading";

/// Multicast traffic is never masqueraded.
const MULTICAST_NET: &str = "224.0.0.0/4";

/// Longest chain name iptables accepts.
pub const MAX_CHAIN_LEN: usize = 28;

/// Masquerade chain for one network of a pod.
#[must_use]
pub fn chain_name(pod_id: &PodId, network: &str) -> String {
    format!("CNI-{network}-{}", pod_id.hash_suffix())
}

/// Longest network name whose masquerade chain still fits.
#[must_use]
pub const fn max_network_name_len() -> usize {
    MAX_CHAIN_LEN - "CNI--".len() - PodId::HASH_BYTES * 2
}

/// Port forwarding chain of a pod.
#[must_use]
pub fn forward_chain_name(pod_id: &PodId) -> String {
    format!("PFWD-{}", pod_id.hash_suffix())
}

/// NAT rule management.
#[async_trait]
pub trait Firewall: Send + Sync {
    /// Masquerade traffic from `net` leaving its subnet, under `chain`.
    async fn setup_masquerade(&self, net: Ipv4Net, chain: &str, comment: &str)
    -> PodnetResult<()>;

    /// Remove the rules added by [`Firewall::setup_masquerade`].
    ///
    /// Without `net` the jump rule cannot be matched; the chain itself is
    /// still flushed and deleted.
    async fn teardown_masquerade(
        &self,
        net: Option<Ipv4Net>,
        chain: &str,
        comment: &str,
    ) -> PodnetResult<()>;

    /// DNAT each port to `target` through `chain`.
    async fn forward_ports(
        &self,
        chain: &str,
        ports: &[ForwardedPort],
        target: Ipv4Addr,
    ) -> PodnetResult<()>;

    /// Remove `chain` and the jumps to it.
    async fn unforward_ports(&self, chain: &str) -> PodnetResult<()>;
}

/// [`Firewall`] backed by `iptables -t nat`.
#[derive(Debug, Clone, Default)]
pub struct Iptables;

impl Iptables {
    /// Create a new iptables firewall.
    #[must_use]
    pub const fn new() -> Self {
        Self
    }

    async fn run(args: &[&str]) -> PodnetResult<()> {
        tracing::debug!(args = ?args, "Running iptables");
        let output = Command::new("iptables")
            .args(["-w", "-t", "nat"])
            .args(args)
            .output()
            .await
            .map_err(|e| PodnetError::kernel("iptables", format!("failed to execute: {e}")))?;

        if !output.status.success() {
            return Err(PodnetError::kernel(
                format!("iptables {}", args.join(" ")),
                String::from_utf8_lossy(&output.stderr).trim().to_string(),
            ));
        }
        Ok(())
    }

    async fn succeeds(args: &[&str]) -> bool {
        Command::new("iptables")
            .args(["-w", "-t", "nat"])
            .args(args)
            .output()
            .await
            .is_ok_and(|o| o.status.success())
    }

    async fn chain_exists(chain: &str) -> bool {
        Self::succeeds(&["-n", "-L", chain]).await
    }

    async fn ensure_chain(chain: &str) -> PodnetResult<()> {
        if Self::chain_exists(chain).await {
            return Ok(());
        }
        Self::run(&["-N", chain]).await
    }

    async fn append_unique(chain: &str, rule: &[&str]) -> PodnetResult<()> {
        let mut check = vec!["-C", chain];
        check.extend_from_slice(rule);
        if Self::succeeds(&check).await {
            return Ok(());
        }
        let mut append = vec!["-A", chain];
        append.extend_from_slice(rule);
        Self::run(&append).await
    }

    async fn delete_if_present(chain: &str, rule: &[&str]) -> PodnetResult<()> {
        let mut check = vec!["-C", chain];
        check.extend_from_slice(rule);
        if !Self::succeeds(&check).await {
            return Ok(());
        }
        let mut delete = vec!["-D", chain];
        delete.extend_from_slice(rule);
        Self::run(&delete).await
    }

    async fn remove_chain(chain: &str) -> PodnetResult<()> {
        if !Self::chain_exists(chain).await {
            return Ok(());
        }
        Self::run(&["-F", chain]).await?;
        Self::run(&["-X", chain]).await
    }
}

#[async_trait]
impl Firewall for Iptables {
    async fn setup_masquerade(
        &self,
        net: Ipv4Net,
        chain: &str,
        comment: &str,
    ) -> PodnetResult<()> {
        let subnet = net.trunc().to_string();
        let source = net.addr().to_string();

        Self::ensure_chain(chain).await?;
        Self::append_unique(
            chain,
            &["-d", &subnet, "-j", "ACCEPT", "-m", "comment", "--comment", comment],
        )
        .await?;
        Self::append_unique(
            chain,
            &[
                "!", "-d", MULTICAST_NET, "-j", "MASQUERADE", "-m", "comment", "--comment",
                comment,
            ],
        )
        .await?;
        Self::append_unique(
            "POSTROUTING",
            &["-s", &source, "-j", chain, "-m", "comment", "--comment", comment],
        )
        .await?;

        tracing::info!(chain, subnet = %subnet, "Masquerading configured");
        Ok(())
    }

    async fn teardown_masquerade(
        &self,
        net: Option<Ipv4Net>,
        chain: &str,
        comment: &str,
    ) -> PodnetResult<()> {
        let jump_result = match net {
            Some(net) => {
                let source = net.addr().to_string();
                Self::delete_if_present(
                    "POSTROUTING",
                    &["-s", &source, "-j", chain, "-m", "comment", "--comment", comment],
                )
                .await
            }
            None => Ok(()),
        };
        let chain_result = Self::remove_chain(chain).await;

        tracing::debug!(chain, "Masquerading removed");
        jump_result.and(chain_result)
    }

    async fn forward_ports(
        &self,
        chain: &str,
        ports: &[ForwardedPort],
        target: Ipv4Addr,
    ) -> PodnetResult<()> {
        if ports.is_empty() {
            return Ok(());
        }

        Self::ensure_chain(chain).await?;
        for port in ports {
            let host_port = port.host_port.to_string();
            let destination = format!("{target}:{}", port.pod_port);
            Self::append_unique(
                chain,
                &[
                    "-p",
                    port.protocol.as_str(),
                    "--dport",
                    &host_port,
                    "-j",
                    "DNAT",
                    "--to-destination",
                    &destination,
                ],
            )
            .await?;
            tracing::debug!(
                protocol = %port.protocol,
                host_port = port.host_port,
                destination = %destination,
                "Port forwarded"
            );
        }

        for hook in ["PREROUTING", "OUTPUT"] {
            Self::append_unique(hook, &["-m", "addrtype", "--dst-type", "LOCAL", "-j", chain])
                .await?;
        }

        tracing::info!(chain, count = ports.len(), "Port forwarding configured");
        Ok(())
    }

    async fn unforward_ports(&self, chain: &str) -> PodnetResult<()> {
        if !Self::chain_exists(chain).await {
            return Ok(());
        }

        let mut first_err = None;
        for hook in ["PREROUTING", "OUTPUT"] {
            if let Err(e) = Self::delete_if_present(
                hook,
                &["-m", "addrtype", "--dst-type", "LOCAL", "-j", chain],
            )
            .await
            {
                first_err.get_or_insert(e);
            }
        }
        if let Err(e) = Self::remove_chain(chain).await {
            first_err.get_or_insert(e);
        }

        first_err.map_or(Ok(()), Err)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    const ID: &str = "6c9bd5e8-4b0c-4e3b-8b1e-0f3a9c2d7e41";

    #[test]
    fn chain_name_shape() {
        let pod = PodId::new(ID).unwrap();
        let chain = chain_name(&pod, "default");
        assert!(chain.starts_with("CNI-default-"));
        assert_eq!(chain.len(), "CNI-default-".len() + 16);
        assert_eq!(chain, format!("CNI-default-{}", pod.hash_suffix()));
    }

    #[test]
    fn longest_network_name_fits() {
        let pod = PodId::new(ID).unwrap();
        assert_eq!(max_network_name_len(), 7);
        let name = "n".repeat(max_network_name_len());
        assert_eq!(chain_name(&pod, &name).len(), MAX_CHAIN_LEN);
    }

    #[test]
    fn chain_names_known_values() {
        let pod = PodId::new(ID).unwrap();
        assert_eq!(chain_name(&pod, "default"), "CNI-default-f23245d7f7896017");
        assert_eq!(forward_chain_name(&pod), "PFWD-f23245d7f7896017");
    }

    #[test]
    fn chain_name_differs_per_network_and_pod() {
        let a = PodId::new(ID).unwrap();
        let b = PodId::generate();
        assert_ne!(chain_name(&a, "n1"), chain_name(&a, "n2"));
        assert_ne!(chain_name(&a, "n1"), chain_name(&b, "n1"));
        assert_ne!(forward_chain_name(&a), forward_chain_name(&b));
    }

    proptest! {
        #[test]
        fn chain_name_is_recomputable(
            id in "[0-9a-f]{8}-[0-9a-f]{4}-[0-9a-f]{4}-[0-9a-f]{4}-[0-9a-f]{12}",
            network in "[a-z][a-z0-9-]{0,14}",
        ) {
            let setup = PodId::new(&id).unwrap();
            let teardown = PodId::new(&id).unwrap();
            prop_assert_eq!(chain_name(&setup, &network), chain_name(&teardown, &network));
        }
    }
}
