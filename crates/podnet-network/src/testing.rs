//! In-memory fakes of the kernel, plugin and firewall seams.

use std::collections::{BTreeMap, HashSet};
use std::net::Ipv4Addr;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use ipnet::Ipv4Net;
use podnet_common::{PodId, PodnetError, PodnetResult};
use serde_json::Value;

use crate::conf::MacvlanMode;
use crate::firewall::Firewall;
use crate::link::{LinkInfo, LinkManager};
use crate::networking::Backend;
use crate::plugin::{PluginCommand, PluginRequest, PluginRunner};
use crate::portmap::ForwardedPort;

pub const POD_ID: &str = "6c9bd5e8-4b0c-4e3b-8b1e-0f3a9c2d7e41";

pub fn pod_id() -> PodId {
    PodId::new(POD_ID).unwrap()
}

#[derive(Debug, Clone)]
pub struct FakeLink {
    pub info: LinkInfo,
    pub up: bool,
    pub master: Option<String>,
    pub persistent_tap: bool,
    pub addrs: Vec<Ipv4Net>,
    pub routes: Vec<String>,
}

#[derive(Debug, Default)]
struct LinkState {
    links: BTreeMap<String, FakeLink>,
    next_index: u32,
    forwarding: bool,
    fail_forward: bool,
    fail_up: HashSet<String>,
    fail_remove: HashSet<String>,
}

#[derive(Debug, Default)]
pub struct FakeLinks {
    state: Mutex<LinkState>,
}

impl FakeLinks {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(LinkState {
                next_index: 10,
                ..LinkState::default()
            }),
        }
    }

    pub fn with_link(self, name: &str, kind: Option<&str>, mtu: u32) -> Self {
        self.insert(name, kind.map(str::to_string), mtu, false);
        self
    }

    pub fn failing_forward(self) -> Self {
        self.state.lock().unwrap().fail_forward = true;
        self
    }

    pub fn failing_up(self, name: &str) -> Self {
        self.state.lock().unwrap().fail_up.insert(name.to_string());
        self
    }

    pub fn failing_remove(self, name: &str) -> Self {
        self.state.lock().unwrap().fail_remove.insert(name.to_string());
        self
    }

    pub fn forwarding_enabled(&self) -> bool {
        self.state.lock().unwrap().forwarding
    }

    pub fn link(&self, name: &str) -> Option<FakeLink> {
        self.state.lock().unwrap().links.get(name).cloned()
    }

    pub fn names(&self) -> Vec<String> {
        self.state.lock().unwrap().links.keys().cloned().collect()
    }

    fn insert(&self, name: &str, kind: Option<String>, mtu: u32, persistent_tap: bool) {
        let mut state = self.state.lock().unwrap();
        state.next_index += 1;
        let index = state.next_index;
        state.links.insert(
            name.to_string(),
            FakeLink {
                info: LinkInfo {
                    index,
                    name: name.to_string(),
                    kind,
                    mtu,
                },
                up: false,
                master: None,
                persistent_tap,
                addrs: Vec::new(),
                routes: Vec::new(),
            },
        );
    }

    fn with_existing<T>(
        &self,
        name: &str,
        op: &str,
        f: impl FnOnce(&mut FakeLink) -> PodnetResult<T>,
    ) -> PodnetResult<T> {
        let mut state = self.state.lock().unwrap();
        let link = state
            .links
            .get_mut(name)
            .ok_or_else(|| PodnetError::kernel(op, format!("Cannot find device \"{name}\"")))?;
        f(link)
    }
}

#[async_trait]
impl LinkManager for FakeLinks {
    async fn create_tap(&self, template: &str) -> PodnetResult<String> {
        let mut n = 0;
        let name = loop {
            let candidate = template.replace("%d", &n.to_string());
            if self.link(&candidate).is_none() {
                break candidate;
            }
            n += 1;
        };
        self.insert(&name, Some("tun".to_string()), 1500, true);
        Ok(name)
    }

    async fn remove_tap(&self, name: &str) -> PodnetResult<()> {
        let mut state = self.state.lock().unwrap();
        if state.fail_remove.contains(name) {
            return Err(PodnetError::kernel("TUNSETPERSIST", "device busy"));
        }
        match state.links.get(name) {
            Some(link) if link.persistent_tap => {
                state.links.remove(name);
                Ok(())
            }
            _ => Err(PodnetError::kernel("TUNSETIFF", format!("no tap {name:?}"))),
        }
    }

    async fn link_by_name(&self, name: &str) -> PodnetResult<Option<LinkInfo>> {
        Ok(self.link(name).map(|link| link.info))
    }

    async fn add_bridge(&self, name: &str, mtu: u32) -> PodnetResult<()> {
        if self.link(name).is_some() {
            return Err(PodnetError::kernel("link add", "File exists"));
        }
        self.insert(name, Some("bridge".to_string()), mtu, false);
        Ok(())
    }

    async fn add_macvtap(
        &self,
        name: &str,
        master: &LinkInfo,
        _mode: MacvlanMode,
        mtu: u32,
    ) -> PodnetResult<()> {
        if self.link(name).is_some() {
            return Err(PodnetError::kernel("link add", "File exists"));
        }
        if self.link(&master.name).is_none() {
            return Err(PodnetError::kernel("link add", "master not found"));
        }
        self.insert(name, Some("macvtap".to_string()), mtu, false);
        Ok(())
    }

    async fn delete_link(&self, name: &str) -> PodnetResult<()> {
        let mut state = self.state.lock().unwrap();
        if state.fail_remove.contains(name) {
            return Err(PodnetError::kernel("link delete", "device busy"));
        }
        state
            .links
            .remove(name)
            .map(|_| ())
            .ok_or_else(|| PodnetError::kernel("link delete", "Cannot find device"))
    }

    async fn set_up(&self, name: &str) -> PodnetResult<()> {
        let fail = self.state.lock().unwrap().fail_up.contains(name);
        self.with_existing(name, "link set up", |link| {
            if fail {
                return Err(PodnetError::kernel("link set up", "Operation not permitted"));
            }
            link.up = true;
            Ok(())
        })
    }

    async fn set_master(&self, name: &str, master: &str) -> PodnetResult<()> {
        if self.link(master).is_none() {
            return Err(PodnetError::kernel("link set master", "no master"));
        }
        self.with_existing(name, "link set master", |link| {
            link.master = Some(master.to_string());
            Ok(())
        })
    }

    async fn addresses_v4(&self, name: &str) -> PodnetResult<Vec<Ipv4Net>> {
        self.with_existing(name, "addr show", |link| Ok(link.addrs.clone()))
    }

    async fn add_address(&self, name: &str, addr: Ipv4Net) -> PodnetResult<()> {
        self.with_existing(name, "addr add", |link| {
            link.addrs.push(addr);
            // The kernel adds the connected route along with the address.
            link.routes.push(addr.trunc().to_string());
            Ok(())
        })
    }

    async fn routes_v4(&self, name: &str) -> PodnetResult<Vec<String>> {
        self.with_existing(name, "route show", |link| Ok(link.routes.clone()))
    }

    async fn delete_route(&self, name: &str, dst: &str) -> PodnetResult<()> {
        self.with_existing(name, "route del", |link| {
            let before = link.routes.len();
            link.routes.retain(|r| r != dst);
            if link.routes.len() == before {
                return Err(PodnetError::kernel("route del", "No such process"));
            }
            Ok(())
        })
    }

    async fn add_host_route(&self, name: &str, ip: Ipv4Addr) -> PodnetResult<()> {
        self.with_existing(name, "route add", |link| {
            link.routes.push(format!("{ip}"));
            Ok(())
        })
    }

    async fn enable_ip4_forward(&self) -> PodnetResult<()> {
        let mut state = self.state.lock().unwrap();
        if state.fail_forward {
            return Err(PodnetError::kernel("enable ip forwarding", "read-only file system"));
        }
        state.forwarding = true;
        Ok(())
    }
}

#[derive(Debug, Default)]
struct PluginState {
    requests: Vec<PluginRequest>,
    allocated: u32,
    no_ip4: bool,
    failing: HashSet<String>,
}

#[derive(Debug, Default)]
pub struct FakePlugins {
    state: Mutex<PluginState>,
}

impl FakePlugins {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn without_ip4(self) -> Self {
        self.state.lock().unwrap().no_ip4 = true;
        self
    }

    pub fn failing(self, plugin: &str) -> Self {
        self.state.lock().unwrap().failing.insert(plugin.to_string());
        self
    }

    pub fn requests(&self) -> Vec<PluginRequest> {
        self.state.lock().unwrap().requests.clone()
    }
}

#[async_trait]
impl PluginRunner for FakePlugins {
    async fn run(&self, request: &PluginRequest) -> PodnetResult<Vec<u8>> {
        let mut state = self.state.lock().unwrap();
        state.requests.push(request.clone());

        if state.failing.contains(&request.plugin) {
            return Err(PodnetError::Plugin {
                plugin: request.plugin.clone(),
                message: "exited with exit status: 1".to_string(),
            });
        }
        if request.command == PluginCommand::Del {
            return Ok(Vec::new());
        }
        if state.no_ip4 {
            return Ok(br#"{"dns":{}}"#.to_vec());
        }

        // Hand out addresses from the declared subnet, gateway first.
        let conf: Value = serde_json::from_slice(&request.conf_bytes).unwrap();
        let subnet: Ipv4Net = conf["ipam"]["subnet"]
            .as_str()
            .unwrap_or("10.88.0.0/24")
            .parse()
            .unwrap();
        let base = u32::from(subnet.network());
        let gateway = Ipv4Addr::from(base + 1);
        let ip = Ipv4Addr::from(base + 2 + state.allocated);
        state.allocated += 1;

        Ok(format!(
            r#"{{"ip4":{{"ip":"{ip}/{}","gateway":"{gateway}"}}}}"#,
            subnet.prefix_len()
        )
        .into_bytes())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FirewallCall {
    SetupMasq { net: Ipv4Net, chain: String },
    TeardownMasq { net: Option<Ipv4Net>, chain: String },
    Forward { chain: String, ports: Vec<ForwardedPort>, target: Ipv4Addr },
    Unforward { chain: String },
}

#[derive(Debug, Default)]
pub struct FakeFirewall {
    calls: Mutex<Vec<FirewallCall>>,
    failing: Mutex<HashSet<String>>,
}

impl FakeFirewall {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn failing(self, chain: &str) -> Self {
        self.failing.lock().unwrap().insert(chain.to_string());
        self
    }

    pub fn calls(&self) -> Vec<FirewallCall> {
        self.calls.lock().unwrap().clone()
    }

    fn record(&self, chain: &str, call: FirewallCall) -> PodnetResult<()> {
        self.calls.lock().unwrap().push(call);
        if self.failing.lock().unwrap().contains(chain) {
            return Err(PodnetError::kernel("iptables", format!("chain {chain} failed")));
        }
        Ok(())
    }
}

#[async_trait]
impl Firewall for FakeFirewall {
    async fn setup_masquerade(
        &self,
        net: Ipv4Net,
        chain: &str,
        _comment: &str,
    ) -> PodnetResult<()> {
        self.record(
            chain,
            FirewallCall::SetupMasq {
                net,
                chain: chain.to_string(),
            },
        )
    }

    async fn teardown_masquerade(
        &self,
        net: Option<Ipv4Net>,
        chain: &str,
        _comment: &str,
    ) -> PodnetResult<()> {
        self.record(
            chain,
            FirewallCall::TeardownMasq {
                net,
                chain: chain.to_string(),
            },
        )
    }

    async fn forward_ports(
        &self,
        chain: &str,
        ports: &[ForwardedPort],
        target: Ipv4Addr,
    ) -> PodnetResult<()> {
        self.record(
            chain,
            FirewallCall::Forward {
                chain: chain.to_string(),
                ports: ports.to_vec(),
                target,
            },
        )
    }

    async fn unforward_ports(&self, chain: &str) -> PodnetResult<()> {
        self.record(
            chain,
            FirewallCall::Unforward {
                chain: chain.to_string(),
            },
        )
    }
}

/// Fakes wired into a [`Backend`], with handles kept for assertions.
pub struct Harness {
    pub links: Arc<FakeLinks>,
    pub plugins: Arc<FakePlugins>,
    pub firewall: Arc<FakeFirewall>,
}

impl Harness {
    pub fn new(links: FakeLinks, plugins: FakePlugins, firewall: FakeFirewall) -> Self {
        Self {
            links: Arc::new(links),
            plugins: Arc::new(plugins),
            firewall: Arc::new(firewall),
        }
    }

    pub fn backend(&self) -> Backend {
        Backend::new(
            self.links.clone(),
            self.plugins.clone(),
            self.firewall.clone(),
        )
    }
}
