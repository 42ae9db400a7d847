//! Standard host paths for pod networking.

use std::path::{Path, PathBuf};

use once_cell::sync::Lazy;

/// Default local configuration directory.
pub static PODNET_LOCAL_CONFIG: Lazy<PathBuf> = Lazy::new(|| {
    std::env::var("PODNET_LOCAL_CONFIG")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from("/etc/podnet"))
});

/// Default directory holding the bundled network plugins.
pub static PODNET_PLUGIN_DIR: Lazy<PathBuf> = Lazy::new(|| {
    std::env::var("PODNET_PLUGIN_DIR")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from("/usr/lib/podnet/plugins/net"))
});

/// Lease file written by the flannel daemon.
pub const DEFAULT_SUBNET_FILE: &str = "/run/flannel/subnet.env";

/// File, relative to the pod root, holding the provisioned network state.
pub const NET_INFO_FILE: &str = "net-info.json";

/// Standard paths used for pod networking.
#[derive(Debug, Clone)]
pub struct NetPaths {
    /// Local configuration directory (default: /etc/podnet).
    pub local_config: PathBuf,
    /// Bundled plugin directory (default: /usr/lib/podnet/plugins/net).
    pub plugin_dir: PathBuf,
}

impl NetPaths {
    /// Create paths with default locations.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Create paths with a custom local configuration directory.
    #[must_use]
    pub fn with_local_config(local_config: impl Into<PathBuf>) -> Self {
        Self {
            local_config: local_config.into(),
            plugin_dir: PODNET_PLUGIN_DIR.clone(),
        }
    }

    /// Directory holding `*.conf` network declarations.
    #[must_use]
    pub fn net_d(&self) -> PathBuf {
        self.local_config.join("net.d")
    }

    /// Directory for user supplied plugins, searched before the bundled ones.
    #[must_use]
    pub fn user_plugins(&self) -> PathBuf {
        self.net_d().join("plugins")
    }

    /// Plugin search path, in lookup order.
    #[must_use]
    pub fn plugin_dirs(&self) -> Vec<PathBuf> {
        vec![self.user_plugins(), self.plugin_dir.clone()]
    }

    /// Net info file for a pod.
    #[must_use]
    pub fn net_info(pod_root: &Path) -> PathBuf {
        pod_root.join(NET_INFO_FILE)
    }
}

impl Default for NetPaths {
    fn default() -> Self {
        Self {
            local_config: PODNET_LOCAL_CONFIG.clone(),
            plugin_dir: PODNET_PLUGIN_DIR.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn custom_local_config() {
        let paths = NetPaths::with_local_config("/tmp/podnet-test");
        assert_eq!(paths.net_d(), PathBuf::from("/tmp/podnet-test/net.d"));
        assert_eq!(
            paths.user_plugins(),
            PathBuf::from("/tmp/podnet-test/net.d/plugins")
        );
    }

    #[test]
    fn user_plugins_searched_first() {
        let paths = NetPaths::with_local_config("/tmp/podnet-test");
        let dirs = paths.plugin_dirs();
        assert_eq!(dirs.len(), 2);
        assert_eq!(dirs[0], paths.user_plugins());
        assert_eq!(dirs[1], paths.plugin_dir);
    }

    #[test]
    fn net_info_path() {
        assert_eq!(
            NetPaths::net_info(Path::new("/var/lib/pods/abc")),
            PathBuf::from("/var/lib/pods/abc/net-info.json")
        );
    }
}
