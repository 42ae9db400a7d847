//! Loading network declarations from the local configuration directory.

use std::collections::HashSet;
use std::path::{Path, PathBuf};

use podnet_common::{PodnetError, PodnetResult};

use crate::descriptor::NetworkDescriptor;
use crate::firewall::max_network_name_len;
use crate::netlist::NetList;

/// Name of the built-in network.
pub const DEFAULT_NET_NAME: &str = "default";

/// Declaration of the built-in network, used when none named `default` is
/// configured.
pub const DEFAULT_NET_CONF: &str = r#"{
    "name": "default",
    "type": "ptp",
    "ipMasq": true,
    "ipam": {
        "type": "host-local",
        "subnet": "172.16.28.0/24",
        "routes": [
            { "dst": "0.0.0.0/0" }
        ]
    }
}"#;

/// `*.conf` files in `dir`, sorted by file name. A missing directory has none.
async fn conf_files(dir: &Path) -> PodnetResult<Vec<PathBuf>> {
    let mut entries = match tokio::fs::read_dir(dir).await {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(e.into()),
    };

    let mut files = Vec::new();
    while let Some(entry) = entries.next_entry().await? {
        let path = entry.path();
        if path.extension().is_some_and(|ext| ext == "conf") && entry.file_type().await?.is_file()
        {
            files.push(path);
        }
    }
    files.sort();
    Ok(files)
}

/// Load the declarations selected by `list`, in file name order.
///
/// The built-in `default` network is appended when everything or
/// `default` is selected and no declaration already uses that name.
///
/// # Errors
///
/// Returns a configuration error for an unreadable or malformed file, a
/// name too long for its masquerade chain, two declarations sharing a
/// name, or a selected name that matches nothing.
pub async fn load_nets(net_d: &Path, list: &NetList) -> PodnetResult<Vec<NetworkDescriptor>> {
    if !list.any() {
        return Ok(Vec::new());
    }

    let mut nets: Vec<NetworkDescriptor> = Vec::new();
    let mut seen = HashSet::new();
    for path in conf_files(net_d).await? {
        let bytes = tokio::fs::read(&path).await.map_err(|e| {
            PodnetError::config(format!("error reading {}: {e}", path.display()))
        })?;
        let desc = NetworkDescriptor::from_bytes(bytes).map_err(|e| {
            PodnetError::config(format!("error loading {}: {e}", path.display()))
        })?;

        if desc.name().len() > max_network_name_len() {
            return Err(PodnetError::config(format!(
                "network name {:?} is longer than {} characters ({})",
                desc.name(),
                max_network_name_len(),
                path.display()
            )));
        }
        if !seen.insert(desc.name().to_string()) {
            return Err(PodnetError::config(format!(
                "network {:?} is declared more than once ({})",
                desc.name(),
                path.display()
            )));
        }
        if list.specific(desc.name()) {
            tracing::debug!(network = %desc.name(), path = %path.display(), "Loaded network");
            nets.push(desc);
        }
    }

    let wants_default = list.all() || list.names().any(|name| name == DEFAULT_NET_NAME);
    if wants_default && !seen.contains(DEFAULT_NET_NAME) {
        nets.push(NetworkDescriptor::from_bytes(DEFAULT_NET_CONF.as_bytes().to_vec())?);
        seen.insert(DEFAULT_NET_NAME.to_string());
    }

    let missing: Vec<&str> = list.names().filter(|name| !seen.contains(*name)).collect();
    if !missing.is_empty() {
        return Err(PodnetError::config(format!(
            "networks not found: {}",
            missing.join(", ")
        )));
    }

    Ok(nets)
}
