//! Flannel overlay transform.
//!
//! A flannel declaration is never provisioned as such. Its lease and the
//! user's `delegate` object are combined into a concrete delegate
//! declaration (a bridge by default) whose allocator is pinned to the
//! host's leased subnet, and the descriptor is replaced by it.

use std::path::Path;

use ipnet::Ipv4Net;
use podnet_common::{PodnetError, PodnetResult};
use serde::Serialize;
use serde_json::{Map, Value};

use crate::conf::NetKind;
use crate::descriptor::{NetworkDescriptor, Route};
use crate::lease::SubnetLease;

/// Allocator forced onto every delegate.
pub const DELEGATE_IPAM: &str = "host-local";

/// Delegate type used when the user does not pick one.
pub const DEFAULT_DELEGATE_TYPE: &str = "bridge";

/// Settings the user may put in the `delegate` object.
///
/// `name` and `ipam` belong to the transform and are rejected while
/// building this value, so they cannot appear here.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DelegateOverrides {
    /// Delegate type.
    pub net_type: Option<String>,
    /// Delegate masquerade flag.
    pub ip_masq: Option<bool>,
    /// Delegate MTU.
    pub mtu: Option<u32>,
    /// Bridge gateway flag.
    pub is_gateway: Option<bool>,
    /// Remaining keys, copied into the delegate verbatim.
    pub extra: Map<String, Value>,
}

impl DelegateOverrides {
    /// Validate a user `delegate` object.
    ///
    /// # Errors
    ///
    /// Returns a configuration error if `name` or `ipam` is present, or
    /// if a known key has the wrong JSON type.
    pub fn from_map(mut map: Map<String, Value>) -> PodnetResult<Self> {
        if map.contains_key("name") {
            return Err(PodnetError::config(
                "'delegate' dictionary must not have 'name' field, it'll be set by flannel",
            ));
        }
        if map.contains_key("ipam") {
            return Err(PodnetError::config(
                "'delegate' dictionary must not have 'ipam' field, it'll be set by flannel",
            ));
        }

        let net_type = match map.remove("type") {
            None => None,
            Some(Value::String(t)) => Some(t),
            Some(_) => {
                return Err(PodnetError::config(
                    "'delegate' dictionary, if present, must have (string) 'type' field",
                ));
            }
        };
        let ip_masq = take_typed(&mut map, "ipMasq", Value::as_bool)?;
        let mtu = take_typed(&mut map, "mtu", |v| {
            v.as_u64().and_then(|mtu| u32::try_from(mtu).ok())
        })?;
        let is_gateway = take_typed(&mut map, "isGateway", Value::as_bool)?;

        Ok(Self {
            net_type,
            ip_masq,
            mtu,
            is_gateway,
            extra: map,
        })
    }
}

fn take_typed<T>(
    map: &mut Map<String, Value>,
    key: &str,
    cast: impl Fn(&Value) -> Option<T>,
) -> PodnetResult<Option<T>> {
    match map.remove(key) {
        None => Ok(None),
        Some(value) => cast(&value)
            .map(Some)
            .ok_or_else(|| PodnetError::config(format!("'delegate' field {key:?} has wrong type"))),
    }
}

/// Allocator block of a delegate.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct HostLocalIpam {
    /// Always [`DELEGATE_IPAM`].
    #[serde(rename = "type")]
    pub plugin: String,
    /// Leased host subnet.
    pub subnet: Ipv4Net,
    /// Single route towards the whole overlay.
    pub routes: Vec<Route>,
}

/// Synthesized delegate declaration.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DelegateConf {
    /// Copied from the overlay network.
    pub name: String,
    /// Delegate type.
    #[serde(rename = "type")]
    pub net_type: String,
    /// Masquerade flag.
    #[serde(rename = "ipMasq")]
    pub ip_masq: bool,
    /// MTU, from the user or the lease.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub mtu: Option<u32>,
    /// Bridge gateway flag.
    #[serde(rename = "isGateway", skip_serializing_if = "Option::is_none")]
    pub is_gateway: Option<bool>,
    /// Allocator pinned to the lease.
    pub ipam: HostLocalIpam,
    /// Pass-through user keys.
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl DelegateConf {
    /// Build the delegate for overlay network `name`.
    ///
    /// Exactly one layer masquerades unless the user overrides the
    /// delegate flag: the delegate does when flannel does not.
    ///
    /// # Errors
    ///
    /// Returns a configuration error if the lease lacks the network or subnet.
    pub fn synthesize(
        name: &str,
        overrides: DelegateOverrides,
        lease: &SubnetLease,
    ) -> PodnetResult<Self> {
        let net_type = overrides
            .net_type
            .unwrap_or_else(|| DEFAULT_DELEGATE_TYPE.to_string());
        let is_gateway = if net_type == "bridge" {
            Some(overrides.is_gateway.unwrap_or(true))
        } else {
            overrides.is_gateway
        };

        Ok(Self {
            name: name.to_string(),
            ip_masq: overrides.ip_masq.unwrap_or(!lease.ip_masq),
            mtu: overrides.mtu.or(lease.mtu),
            is_gateway,
            ipam: HostLocalIpam {
                plugin: DELEGATE_IPAM.to_string(),
                subnet: lease.require_subnet()?,
                routes: vec![Route {
                    dst: lease.require_network()?,
                    gw: None,
                }],
            },
            net_type,
            extra: overrides.extra,
        })
    }
}

/// Replace a flannel descriptor with its delegate.
///
/// The lease is read from the declaration's `subnetFile`, or
/// `default_subnet_file` when it has none. Non-flannel descriptors are
/// left untouched.
///
/// # Errors
///
/// Returns a configuration error for an invalid delegate object or lease.
pub async fn transform(
    desc: &mut NetworkDescriptor,
    default_subnet_file: &Path,
) -> PodnetResult<()> {
    let NetKind::Flannel(flannel) = desc.kind() else {
        return Ok(());
    };

    let overrides = match &flannel.delegate {
        Some(map) => DelegateOverrides::from_map(map.clone())?,
        None => DelegateOverrides::default(),
    };
    let subnet_file = flannel
        .subnet_file
        .as_deref()
        .unwrap_or(default_subnet_file);
    let lease = SubnetLease::load(subnet_file).await?;

    let delegate = DelegateConf::synthesize(desc.name(), overrides, &lease)?;
    let bytes = serde_json::to_vec(&delegate).map_err(|e| {
        PodnetError::config(format!("error in marshaling generated network settings: {e}"))
    })?;

    tracing::debug!(
        network = %delegate.name,
        delegate = %delegate.net_type,
        subnet = %delegate.ipam.subnet,
        "Transformed flannel network"
    );
    *desc = NetworkDescriptor::from_bytes(bytes)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::conf::NetKind;
    use serde_json::json;

    fn lease(ip_masq: bool) -> SubnetLease {
        SubnetLease {
            network: Some("10.1.0.0/16".parse().unwrap()),
            subnet: Some("10.1.17.0/24".parse().unwrap()),
            mtu: Some(1472),
            ip_masq,
        }
    }

    fn overrides(value: Value) -> PodnetResult<DelegateOverrides> {
        match value {
            Value::Object(map) => DelegateOverrides::from_map(map),
            other => panic!("not an object: {other}"),
        }
    }

    #[test]
    fn defaults_from_lease() {
        let delegate =
            DelegateConf::synthesize("flnet", DelegateOverrides::default(), &lease(true))
                .unwrap();
        let value = serde_json::to_value(&delegate).unwrap();
        assert_eq!(
            value,
            json!({
                "name": "flnet",
                "type": "bridge",
                "ipMasq": false,
                "mtu": 1472,
                "isGateway": true,
                "ipam": {
                    "type": "host-local",
                    "subnet": "10.1.17.0/24",
                    "routes": [{"dst": "10.1.0.0/16"}]
                }
            })
        );
    }

    #[test]
    fn exactly_one_layer_masquerades() {
        let d = DelegateConf::synthesize("n", DelegateOverrides::default(), &lease(false)).unwrap();
        assert!(d.ip_masq);
        let d = DelegateConf::synthesize("n", DelegateOverrides::default(), &lease(true)).unwrap();
        assert!(!d.ip_masq);
    }

    #[test]
    fn user_overrides_win() {
        let o = overrides(json!({
            "type": "ptp",
            "ipMasq": true,
            "mtu": 1400,
            "bridge": "ignored-by-ptp"
        }))
        .unwrap();
        let d = DelegateConf::synthesize("n", o, &lease(true)).unwrap();
        assert_eq!(d.net_type, "ptp");
        assert!(d.ip_masq);
        assert_eq!(d.mtu, Some(1400));
        assert_eq!(d.is_gateway, None);
        assert_eq!(d.extra["bridge"], "ignored-by-ptp");
    }

    #[test]
    fn bridge_gateway_can_be_disabled() {
        let o = overrides(json!({"isGateway": false})).unwrap();
        let d = DelegateConf::synthesize("n", o, &lease(true)).unwrap();
        assert_eq!(d.is_gateway, Some(false));
    }

    #[test]
    fn reserved_keys_rejected() {
        assert!(matches!(
            overrides(json!({"name": "x"})),
            Err(PodnetError::Config { .. })
        ));
        assert!(matches!(
            overrides(json!({"ipam": {"type": "dhcp"}})),
            Err(PodnetError::Config { .. })
        ));
        assert!(matches!(
            overrides(json!({"type": 7})),
            Err(PodnetError::Config { .. })
        ));
        assert!(matches!(
            overrides(json!({"mtu": "big"})),
            Err(PodnetError::Config { .. })
        ));
    }

    #[test]
    fn lease_without_subnet_rejected() {
        let mut l = lease(false);
        l.subnet = None;
        assert!(DelegateConf::synthesize("n", DelegateOverrides::default(), &l).is_err());
    }

    #[tokio::test]
    async fn transform_replaces_descriptor() {
        let dir = tempfile::tempdir().unwrap();
        let lease_path = dir.path().join("subnet.env");
        std::fs::write(
            &lease_path,
            "FLANNEL_NETWORK=10.1.0.0/16\nFLANNEL_SUBNET=10.1.17.1/24\nFLANNEL_MTU=1472\nFLANNEL_IPMASQ=true\n",
        )
        .unwrap();

        let mut desc =
            NetworkDescriptor::from_bytes(br#"{"name":"flnet","type":"flannel"}"#.to_vec())
                .unwrap();
        transform(&mut desc, &lease_path).await.unwrap();

        assert_eq!(desc.name(), "flnet");
        assert!(matches!(desc.kind(), NetKind::Bridge(b) if b.is_gateway));
        assert!(!desc.conf().ip_masq);
        assert_eq!(desc.conf().mtu, Some(1472));
        assert_eq!(desc.conf().ipam_plugin().unwrap(), "host-local");
        let raw: Value = serde_json::from_slice(desc.conf_bytes()).unwrap();
        assert_eq!(raw["ipam"]["subnet"], "10.1.17.0/24");
        assert_eq!(raw["ipam"]["routes"][0]["dst"], "10.1.0.0/16");
    }

    #[tokio::test]
    async fn transform_ignores_other_types() {
        let mut desc =
            NetworkDescriptor::from_bytes(br#"{"name":"p","type":"ptp"}"#.to_vec()).unwrap();
        let before = desc.clone();
        transform(&mut desc, Path::new("/nonexistent")).await.unwrap();
        assert_eq!(desc, before);
    }
}
