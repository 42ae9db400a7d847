//! Network plugin invocation.
//!
//! Plugins are executables named after a network (or allocator) type.
//! They receive the command and target interface in `CNI_*` environment
//! variables and the raw declaration on stdin. On `ADD` they answer with
//! a JSON result on stdout.

use std::fmt;
use std::path::PathBuf;
use std::process::Stdio;

use async_trait::async_trait;
use podnet_common::{PodId, PodnetError, PodnetResult};
use serde::Deserialize;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;

use crate::descriptor::Ipv4Config;

/// Plugin command.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PluginCommand {
    /// Attach and allocate.
    Add,
    /// Detach and release.
    Del,
}

impl PluginCommand {
    /// Value of `CNI_COMMAND`.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Add => "ADD",
            Self::Del => "DEL",
        }
    }
}

impl fmt::Display for PluginCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One plugin invocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PluginRequest {
    /// Plugin executable name.
    pub plugin: String,
    /// Command to run.
    pub command: PluginCommand,
    /// Pod the attachment belongs to.
    pub pod_id: PodId,
    /// Host interface the attachment concerns.
    pub if_name: String,
    /// Raw network declaration.
    pub conf_bytes: Vec<u8>,
}

/// Runs plugin requests.
#[async_trait]
pub trait PluginRunner: Send + Sync {
    /// Execute `request` and return the plugin's stdout.
    async fn run(&self, request: &PluginRequest) -> PodnetResult<Vec<u8>>;
}

/// Result of an `ADD`.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct PluginResult {
    /// IPv4 block.
    #[serde(default)]
    pub ip4: Option<Ipv4Config>,
}

impl PluginResult {
    /// Parse plugin stdout.
    ///
    /// # Errors
    ///
    /// Returns a plugin error if the output is not a JSON result.
    pub fn parse(plugin: &str, output: &[u8]) -> PodnetResult<Self> {
        serde_json::from_slice(output).map_err(|e| PodnetError::Plugin {
            plugin: plugin.to_string(),
            message: format!("error parsing result: {e}"),
        })
    }
}

/// Error object a failing plugin prints on stdout.
#[derive(Debug, Deserialize)]
struct PluginErrorReply {
    #[serde(default)]
    code: Option<u32>,
    msg: String,
    #[serde(default)]
    details: Option<String>,
}

/// Runs plugins as child processes found in a list of directories.
#[derive(Debug, Clone)]
pub struct ExecPluginRunner {
    dirs: Vec<PathBuf>,
}

impl ExecPluginRunner {
    /// Create a runner searching `dirs` in order.
    #[must_use]
    pub const fn new(dirs: Vec<PathBuf>) -> Self {
        Self { dirs }
    }

    /// Locate a plugin executable.
    ///
    /// # Errors
    ///
    /// Returns a plugin error if no directory holds the plugin, or a
    /// configuration error if the name is not a bare file name.
    pub fn find(&self, plugin: &str) -> PodnetResult<PathBuf> {
        if plugin.is_empty() || plugin.contains('/') || plugin == "." || plugin == ".." {
            return Err(PodnetError::config(format!(
                "invalid plugin name {plugin:?}"
            )));
        }

        self.dirs
            .iter()
            .map(|dir| dir.join(plugin))
            .find(|path| path.is_file())
            .ok_or_else(|| PodnetError::Plugin {
                plugin: plugin.to_string(),
                message: format!("not found in {}", self.search_path()),
            })
    }

    fn search_path(&self) -> String {
        self.dirs
            .iter()
            .map(|dir| dir.display().to_string())
            .collect::<Vec<_>>()
            .join(":")
    }
}

#[async_trait]
impl PluginRunner for ExecPluginRunner {
    async fn run(&self, request: &PluginRequest) -> PodnetResult<Vec<u8>> {
        let path = self.find(&request.plugin)?;
        tracing::debug!(
            plugin = %request.plugin,
            command = %request.command,
            ifname = %request.if_name,
            "Executing network plugin"
        );

        let plugin_err = |message: String| PodnetError::Plugin {
            plugin: request.plugin.clone(),
            message,
        };

        // No network namespace is passed: the pod's side of the link lives
        // inside the VM.
        let mut child = Command::new(&path)
            .env("CNI_VERSION", "0.1.0")
            .env("CNI_COMMAND", request.command.as_str())
            .env("CNI_CONTAINERID", request.pod_id.as_str())
            .env("CNI_NETNS", "")
            .env("CNI_IFNAME", &request.if_name)
            .env("CNI_ARGS", "")
            .env("CNI_PATH", self.search_path())
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| plugin_err(format!("failed to execute {}: {e}", path.display())))?;

        if let Some(mut stdin) = child.stdin.take() {
            stdin
                .write_all(&request.conf_bytes)
                .await
                .map_err(|e| plugin_err(format!("failed to write config: {e}")))?;
        }

        let output = child
            .wait_with_output()
            .await
            .map_err(|e| plugin_err(format!("failed to wait: {e}")))?;

        if !output.status.success() {
            let message = match serde_json::from_slice::<PluginErrorReply>(&output.stdout) {
                Ok(reply) => format!(
                    "{} (code {}){}",
                    reply.msg,
                    reply.code.unwrap_or_default(),
                    reply.details.map(|d| format!(": {d}")).unwrap_or_default()
                ),
                Err(_) => format!(
                    "exited with {}: {}",
                    output.status,
                    String::from_utf8_lossy(&output.stderr).trim()
                ),
            };
            return Err(plugin_err(message));
        }

        Ok(output.stdout)
    }
}
