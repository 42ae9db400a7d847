//! Networking configuration.

use std::path::PathBuf;

use podnet_common::NetPaths;
use podnet_common::paths::DEFAULT_SUBNET_FILE;

use crate::firewall::MASQ_COMMENT;

/// Host-wide settings for pod networking.
#[derive(Debug, Clone)]
pub struct NetworkingConfig {
    /// Configuration and plugin paths.
    pub paths: NetPaths,
    /// Flannel lease file used when a declaration has no `subnetFile`.
    pub subnet_file: PathBuf,
    /// Comment attached to masquerade rules.
    pub masq_comment: String,
}

impl Default for NetworkingConfig {
    fn default() -> Self {
        Self {
            paths: NetPaths::new(),
            subnet_file: PathBuf::from(DEFAULT_SUBNET_FILE),
            masq_comment: MASQ_COMMENT.to_string(),
        }
    }
}

impl NetworkingConfig {
    /// Set the local configuration directory.
    #[must_use]
    pub fn with_local_config(mut self, local_config: impl Into<PathBuf>) -> Self {
        self.paths.local_config = local_config.into();
        self
    }

    /// Set the bundled plugin directory.
    #[must_use]
    pub fn with_plugin_dir(mut self, plugin_dir: impl Into<PathBuf>) -> Self {
        self.paths.plugin_dir = plugin_dir.into();
        self
    }

    /// Set the default flannel lease file.
    #[must_use]
    pub fn with_subnet_file(mut self, subnet_file: impl Into<PathBuf>) -> Self {
        self.subnet_file = subnet_file.into();
        self
    }

    /// Set the masquerade rule comment.
    #[must_use]
    pub fn with_masq_comment(mut self, comment: impl Into<String>) -> Self {
        self.masq_comment = comment.into();
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config() {
        let config = NetworkingConfig::default();
        assert_eq!(config.subnet_file, PathBuf::from("/run/flannel/subnet.env"));
        assert_eq!(config.masq_comment, MASQ_COMMENT);
    }

    #[test]
    fn builder_pattern() {
        let config = NetworkingConfig::default()
            .with_local_config("/custom/podnet")
            .with_plugin_dir("/custom/plugins")
            .with_subnet_file("/custom/subnet.env")
            .with_masq_comment("test masq");

        assert_eq!(config.paths.net_d(), PathBuf::from("/custom/podnet/net.d"));
        assert_eq!(config.paths.plugin_dir, PathBuf::from("/custom/plugins"));
        assert_eq!(config.subnet_file, PathBuf::from("/custom/subnet.env"));
        assert_eq!(config.masq_comment, "test masq");
    }
}
