//! Network declarations.
//!
//! A declaration is a JSON object with the common fields
//! `{name, type, mtu, ipMasq, ipam}` plus fields specific to its type.
//! The common fields are read first, then the type selects which
//! specific fields are parsed into a [`NetKind`].

use std::path::PathBuf;

use podnet_common::{PodnetError, PodnetResult};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Bridge created when a bridge network does not name one.
pub const DEFAULT_BRIDGE: &str = "kvm-cni0";

/// MTU used for a new bridge when the declaration has none.
pub const DEFAULT_MTU: u32 = 1500;

/// Allocator sub-plugin declaration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IpamConf {
    /// Allocator plugin executable name.
    #[serde(rename = "type")]
    pub plugin: String,
    /// Allocator specific settings, handed to the plugin untouched.
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// Fields shared by every declaration.
#[derive(Debug, Deserialize)]
struct CommonConf {
    name: String,
    #[serde(rename = "type")]
    net_type: String,
    #[serde(default)]
    mtu: Option<u32>,
    #[serde(default, rename = "ipMasq")]
    ip_masq: bool,
    #[serde(default)]
    ipam: Option<IpamConf>,
}

/// Bridge specific fields.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct BridgeConf {
    /// Bridge device name.
    #[serde(default = "default_bridge")]
    pub bridge: String,
    /// Whether the bridge carries the gateway address.
    #[serde(default, rename = "isGateway")]
    pub is_gateway: bool,
}

fn default_bridge() -> String {
    DEFAULT_BRIDGE.to_string()
}

/// Macvlan specific fields.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct MacvlanConf {
    /// Parent device.
    pub master: String,
    /// Requested mode, validated when the link is created.
    #[serde(default)]
    pub mode: Option<String>,
}

impl MacvlanConf {
    /// Resolve the declared mode.
    ///
    /// # Errors
    ///
    /// Returns [`PodnetError::Unsupported`] for anything outside the known modes.
    pub fn mode(&self) -> PodnetResult<MacvlanMode> {
        MacvlanMode::parse(self.mode.as_deref())
    }
}

/// Flannel overlay specific fields.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct FlannelConf {
    /// Lease file override.
    #[serde(default, rename = "subnetFile")]
    pub subnet_file: Option<PathBuf>,
    /// User supplied delegate settings, validated by the transform.
    #[serde(default)]
    pub delegate: Option<Map<String, Value>>,
}

/// Network type with only the fields relevant to it.
#[derive(Debug, Clone, PartialEq)]
pub enum NetKind {
    /// Point-to-point tap device.
    Ptp,
    /// Tap device attached to a host bridge.
    Bridge(BridgeConf),
    /// Macvtap device on a host interface.
    Macvlan(MacvlanConf),
    /// Overlay network, rewritten into a delegate before provisioning.
    Flannel(FlannelConf),
    /// Any other declared type.
    Other(String),
}

impl NetKind {
    /// The declared `type` string.
    #[must_use]
    pub fn type_name(&self) -> &str {
        match self {
            Self::Ptp => "ptp",
            Self::Bridge(_) => "bridge",
            Self::Macvlan(_) => "macvlan",
            Self::Flannel(_) => "flannel",
            Self::Other(t) => t,
        }
    }
}

/// A parsed network declaration.
#[derive(Debug, Clone, PartialEq)]
pub struct NetConf {
    /// Network name.
    pub name: String,
    /// MTU override.
    pub mtu: Option<u32>,
    /// Whether traffic from the pod is masqueraded.
    pub ip_masq: bool,
    /// Allocator sub-plugin.
    pub ipam: Option<IpamConf>,
    /// Type specific settings.
    pub kind: NetKind,
}

impl NetConf {
    /// Parse a declaration from its raw JSON bytes.
    ///
    /// # Errors
    ///
    /// Returns a configuration error if the JSON is malformed or a
    /// type specific field is missing.
    pub fn from_bytes(bytes: &[u8]) -> PodnetResult<Self> {
        let common: CommonConf = serde_json::from_slice(bytes)
            .map_err(|e| PodnetError::config(format!("failed to load netconf: {e}")))?;

        let kind = match common.net_type.as_str() {
            "ptp" => NetKind::Ptp,
            "bridge" => NetKind::Bridge(parse_kind(bytes, &common.name)?),
            "macvlan" => NetKind::Macvlan(parse_kind(bytes, &common.name)?),
            "flannel" => NetKind::Flannel(parse_kind(bytes, &common.name)?),
            _ => NetKind::Other(common.net_type),
        };

        Ok(Self {
            name: common.name,
            mtu: common.mtu,
            ip_masq: common.ip_masq,
            ipam: common.ipam,
            kind,
        })
    }

    /// Allocator plugin name.
    ///
    /// # Errors
    ///
    /// Returns a configuration error if the declaration has no `ipam` block.
    pub fn ipam_plugin(&self) -> PodnetResult<&str> {
        self.ipam
            .as_ref()
            .map(|ipam| ipam.plugin.as_str())
            .ok_or_else(|| {
                PodnetError::config(format!("network {:?} has no ipam configuration", self.name))
            })
    }
}

fn parse_kind<T: for<'de> Deserialize<'de>>(bytes: &[u8], name: &str) -> PodnetResult<T> {
    serde_json::from_slice(bytes)
        .map_err(|e| PodnetError::config(format!("error parsing {name:?} config: {e}")))
}

/// Macvlan mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum MacvlanMode {
    /// Bridge mode (pods on the same master can talk).
    #[default]
    Bridge,
    /// Private mode (isolated from each other).
    Private,
    /// VEPA mode (requires external switch).
    Vepa,
    /// Passthrough mode (single pod per master).
    Passthru,
}

impl MacvlanMode {
    /// Mode keyword understood by `ip link`.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Bridge => "bridge",
            Self::Private => "private",
            Self::Vepa => "vepa",
            Self::Passthru => "passthru",
        }
    }

    /// Parse a declared mode; an absent or empty mode means bridge.
    ///
    /// # Errors
    ///
    /// Returns [`PodnetError::Unsupported`] for unknown modes.
    pub fn parse(mode: Option<&str>) -> PodnetResult<Self> {
        match mode.unwrap_or_default() {
            "" | "bridge" => Ok(Self::Bridge),
            "private" => Ok(Self::Private),
            "vepa" => Ok(Self::Vepa),
            "passthru" => Ok(Self::Passthru),
            other => Err(PodnetError::Unsupported {
                feature: format!("macvtap mode {other:?}"),
            }),
        }
    }
}
