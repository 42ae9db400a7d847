//! Provisioned network state saved in the pod root.
//!
//! Setup and teardown usually run in different processes, so the
//! descriptors, including their runtime state, are written next to the
//! pod once setup succeeds.

use std::path::Path;

use podnet_common::{NetPaths, PodnetError, PodnetResult};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::descriptor::{NetRuntime, NetworkDescriptor};

/// Saved form of one descriptor.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NetInfo {
    /// Declaration as handed to plugins.
    pub conf: Value,
    /// Runtime state.
    #[serde(default)]
    pub runtime: NetRuntime,
}

impl NetInfo {
    /// Capture a descriptor.
    ///
    /// # Errors
    ///
    /// Returns a serialization error if the raw declaration is not JSON.
    pub fn from_descriptor(desc: &NetworkDescriptor) -> PodnetResult<Self> {
        Ok(Self {
            conf: serde_json::from_slice(desc.conf_bytes())?,
            runtime: desc.runtime.clone(),
        })
    }

    /// Rebuild the descriptor.
    ///
    /// # Errors
    ///
    /// Returns a configuration error if the saved declaration is invalid.
    pub fn into_descriptor(self) -> PodnetResult<NetworkDescriptor> {
        let mut desc = NetworkDescriptor::from_bytes(serde_json::to_vec(&self.conf)?)?;
        desc.runtime = self.runtime;
        Ok(desc)
    }
}

/// Write the descriptors to `<pod_root>/net-info.json`.
///
/// # Errors
///
/// Returns an I/O or serialization error.
pub async fn save(pod_root: &Path, nets: &[NetworkDescriptor]) -> PodnetResult<()> {
    let infos = nets
        .iter()
        .map(NetInfo::from_descriptor)
        .collect::<PodnetResult<Vec<_>>>()?;
    let path = NetPaths::net_info(pod_root);
    tokio::fs::write(&path, serde_json::to_vec_pretty(&infos)?).await?;

    tracing::debug!(path = %path.display(), count = infos.len(), "Saved net info");
    Ok(())
}

/// Read the descriptors saved for a pod. A missing file yields none.
///
/// # Errors
///
/// Returns an I/O error or a configuration error for an unreadable file.
pub async fn load(pod_root: &Path) -> PodnetResult<Vec<NetworkDescriptor>> {
    let path = NetPaths::net_info(pod_root);
    let bytes = match tokio::fs::read(&path).await {
        Ok(bytes) => bytes,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(e.into()),
    };

    let infos: Vec<NetInfo> = serde_json::from_slice(&bytes).map_err(|e| {
        PodnetError::config(format!("invalid net info {}: {e}", path.display()))
    })?;
    infos.into_iter().map(NetInfo::into_descriptor).collect()
}

/// Delete the saved descriptors, if any.
///
/// # Errors
///
/// Returns an I/O error other than the file being absent.
pub async fn remove(pod_root: &Path) -> PodnetResult<()> {
    match tokio::fs::remove_file(NetPaths::net_info(pod_root)).await {
        Err(e) if e.kind() != std::io::ErrorKind::NotFound => Err(e.into()),
        _ => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::descriptor::Ipv4Config;
    use std::net::Ipv4Addr;

    #[tokio::test]
    async fn saved_runtime_survives() {
        let dir = tempfile::tempdir().unwrap();
        let mut desc = NetworkDescriptor::from_bytes(
            br#"{"name":"default","type":"ptp","ipMasq":true,"ipam":{"type":"host-local"}}"#
                .to_vec(),
        )
        .unwrap();
        desc.runtime.if_name = Some("kvm-6c9b-tap0".to_string());
        desc.runtime.ip4 = Some(Ipv4Config {
            ip: "172.16.28.2/24".parse().unwrap(),
            gateway: Some(Ipv4Addr::new(172, 16, 28, 1)),
            routes: Vec::new(),
        });

        save(dir.path(), std::slice::from_ref(&desc)).await.unwrap();
        let loaded = load(dir.path()).await.unwrap();

        assert_eq!(loaded.len(), 1);
        assert_eq!(loaded[0].conf(), desc.conf());
        assert_eq!(loaded[0].runtime, desc.runtime);
    }

    #[tokio::test]
    async fn missing_file_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        assert!(load(dir.path()).await.unwrap().is_empty());
        remove(dir.path()).await.unwrap();
    }

    #[tokio::test]
    async fn corrupt_file_is_config_error() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(NetPaths::net_info(dir.path()), "[{").unwrap();
        let err = load(dir.path()).await.unwrap_err();
        assert!(matches!(err, PodnetError::Config { .. }));
    }
}
