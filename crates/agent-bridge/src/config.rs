//! Bridge configuration: TOML file + CLI overrides.

use crate::adapters::EndpointKind;
use agent_bridge_core::{RetryPolicy, MAX_MESSAGE_SIZE};
use anyhow::{bail, Context, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{info, warn};

/// Top-level config file structure.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ConfigFile {
    #[serde(default)]
    pub bridge: BridgeSection,
    #[serde(default)]
    pub endpoints: EndpointsSection,
    #[serde(default)]
    pub dial: DialSection,
}

/// `[bridge]` section of the config TOML.
#[derive(Debug, Clone, Deserialize)]
pub struct BridgeSection {
    /// Endpoints to listen on, or `["all"]`.
    #[serde(default = "default_from")]
    pub from: Vec<String>,
    /// Endpoint of the upstream agent.
    #[serde(default = "default_to")]
    pub to: String,
    #[serde(default = "default_max_message_size")]
    pub max_message_size: usize,
}

impl Default for BridgeSection {
    fn default() -> Self {
        Self {
            from: default_from(),
            to: default_to(),
            max_message_size: default_max_message_size(),
        }
    }
}

/// `[endpoints]` section: where each adapter lives.
#[derive(Debug, Clone, Deserialize)]
pub struct EndpointsSection {
    #[serde(default = "default_unix_socket")]
    pub unix_socket: Option<String>,
    #[serde(default)]
    pub socket_file: Option<String>,
    #[serde(default = "default_pipe")]
    pub pipe: Option<String>,
}

impl Default for EndpointsSection {
    fn default() -> Self {
        Self {
            unix_socket: default_unix_socket(),
            socket_file: None,
            pipe: default_pipe(),
        }
    }
}

/// `[dial]` section: upstream connection behaviour.
#[derive(Debug, Clone, Deserialize)]
pub struct DialSection {
    #[serde(default = "default_retry_attempts")]
    pub retry_attempts: u32,
    #[serde(default = "default_retry_delay_ms")]
    pub retry_delay_ms: u64,
    #[serde(default = "default_handshake_timeout_ms")]
    pub handshake_timeout_ms: u64,
}

impl Default for DialSection {
    fn default() -> Self {
        Self {
            retry_attempts: default_retry_attempts(),
            retry_delay_ms: default_retry_delay_ms(),
            handshake_timeout_ms: default_handshake_timeout_ms(),
        }
    }
}

fn default_from() -> Vec<String> {
    vec!["all".to_string()]
}
fn default_to() -> String {
    EndpointKind::UnixSocket.name().to_string()
}
fn default_max_message_size() -> usize {
    MAX_MESSAGE_SIZE
}
fn default_unix_socket() -> Option<String> {
    std::env::var("SSH_AUTH_SOCK").ok().filter(|s| !s.is_empty())
}
fn default_pipe() -> Option<String> {
    Some(r"\\.\pipe\openssh-ssh-agent".to_string())
}
fn default_retry_attempts() -> u32 {
    2
}
fn default_retry_delay_ms() -> u64 {
    1000
}
fn default_handshake_timeout_ms() -> u64 {
    5000
}

/// Values given on the command line; each one wins over the file.
#[derive(Debug, Clone, Default)]
pub struct ConfigOverrides {
    pub from: Option<Vec<String>>,
    pub to: Option<String>,
    pub unix_socket: Option<String>,
    pub socket_file: Option<String>,
    pub pipe: Option<String>,
}

/// Resolved bridge configuration.
#[derive(Debug, Clone)]
pub struct BridgeConfig {
    pub from: Vec<EndpointKind>,
    pub to: EndpointKind,
    pub max_message_size: usize,
    pub unix_socket: Option<PathBuf>,
    pub socket_file: Option<PathBuf>,
    pub pipe: Option<String>,
    pub retry: RetryPolicy,
    pub handshake_timeout: Duration,
}

impl BridgeConfig {
    /// Load config from TOML file, then apply CLI overrides.
    pub fn load(config_path: Option<&Path>, overrides: &ConfigOverrides) -> Result<Self> {
        let file_config = match config_path {
            Some(path) => {
                let expanded = expand_tilde(path);
                if expanded.exists() {
                    info!(path = %expanded.display(), "loading config file");
                    let content = std::fs::read_to_string(&expanded)
                        .with_context(|| format!("cannot read {}", expanded.display()))?;
                    toml::from_str::<ConfigFile>(&content)
                        .with_context(|| format!("config parse error in {}", expanded.display()))?
                } else {
                    info!(path = %expanded.display(), "config file not found, using defaults");
                    ConfigFile::default()
                }
            }
            None => ConfigFile::default(),
        };

        Self::resolve(file_config, overrides)
    }

    /// Merge `file` with `overrides` and validate the endpoint selection.
    pub fn resolve(file: ConfigFile, overrides: &ConfigOverrides) -> Result<Self> {
        let to_name = overrides.to.clone().unwrap_or(file.bridge.to);
        let to: EndpointKind = to_name.parse()?;
        if !to.is_supported() {
            bail!("--to {to} is not supported on this platform");
        }

        if file.bridge.max_message_size < 5 {
            bail!(
                "max_message_size must be at least 5, got {}",
                file.bridge.max_message_size
            );
        }

        let mut config = Self {
            from: Vec::new(),
            to,
            max_message_size: file.bridge.max_message_size,
            unix_socket: overrides
                .unix_socket
                .clone()
                .or(file.endpoints.unix_socket)
                .map(|s| expand_tilde_str(&s)),
            socket_file: overrides
                .socket_file
                .clone()
                .or(file.endpoints.socket_file)
                .map(|s| expand_tilde_str(&s)),
            pipe: overrides.pipe.clone().or(file.endpoints.pipe),
            retry: RetryPolicy {
                retries: file.dial.retry_attempts,
                delay: Duration::from_millis(file.dial.retry_delay_ms),
            },
            handshake_timeout: Duration::from_millis(file.dial.handshake_timeout_ms),
        };

        if !config.has_endpoint(to) {
            bail!("no endpoint configured for upstream agent {to}");
        }

        let from_names = overrides.from.clone().unwrap_or(file.bridge.from);
        config.from = config.resolve_from(&from_names)?;

        Ok(config)
    }

    /// Expand `all` and validate explicit names.
    ///
    /// `all` means every adapter this platform supports except the upstream
    /// one; adapters without a configured endpoint are skipped. Explicitly
    /// named adapters must have an endpoint.
    fn resolve_from(&self, names: &[String]) -> Result<Vec<EndpointKind>> {
        let mut kinds = Vec::new();

        for name in names.iter().map(|n| n.trim()).filter(|n| !n.is_empty()) {
            if name == "all" {
                for kind in EndpointKind::ALL {
                    if kind == self.to || !kind.is_supported() {
                        continue;
                    }
                    if !self.has_endpoint(kind) {
                        warn!(endpoint = %kind, "no path configured, not listening");
                        continue;
                    }
                    if !kinds.contains(&kind) {
                        kinds.push(kind);
                    }
                }
                continue;
            }

            let kind: EndpointKind = name.parse()?;
            if !kind.is_supported() {
                bail!("--from {kind} is not supported on this platform");
            }
            if !self.has_endpoint(kind) {
                bail!("no endpoint configured for {kind}");
            }
            if kind == self.to {
                bail!("{kind} can't both listen and be the upstream agent");
            }
            if !kinds.contains(&kind) {
                kinds.push(kind);
            }
        }

        if kinds.is_empty() {
            bail!("nothing to listen on");
        }
        Ok(kinds)
    }

    pub fn has_endpoint(&self, kind: EndpointKind) -> bool {
        self.endpoint_label(kind).is_some()
    }

    /// Human-readable endpoint location, for logs.
    pub fn endpoint_label(&self, kind: EndpointKind) -> Option<String> {
        match kind {
            EndpointKind::UnixSocket => self.unix_socket.as_ref().map(|p| p.display().to_string()),
            EndpointKind::SocketFile => self.socket_file.as_ref().map(|p| p.display().to_string()),
            EndpointKind::Pipe => self.pipe.clone(),
        }
    }
}

/// Expand `~` to the user's home directory.
fn expand_tilde(path: &Path) -> PathBuf {
    let s = path.to_string_lossy();
    expand_tilde_str(&s)
}

fn expand_tilde_str(s: &str) -> PathBuf {
    if let Some(rest) = s.strip_prefix("~/") {
        if let Some(home) = dirs::home_dir() {
            return home.join(rest);
        }
    }
    PathBuf::from(s)
}

#[cfg(test)]
mod tests {
    use super::*;

    /// The endpoint clients on this platform use natively.
    fn native() -> EndpointKind {
        if cfg!(windows) {
            EndpointKind::Pipe
        } else {
            EndpointKind::UnixSocket
        }
    }

    /// Upstream on the socket file, which every platform supports.
    fn file_with_sockets() -> ConfigFile {
        let mut file = ConfigFile::default();
        file.bridge.to = "socket-file".into();
        file.endpoints.unix_socket = Some("/tmp/agent.sock".into());
        file.endpoints.socket_file = Some("/tmp/cygwin-agent.sock".into());
        file.endpoints.pipe = Some(r"\\.\pipe\openssh-ssh-agent".into());
        file
    }

    #[test]
    fn parse_toml_config() {
        let toml_str = r#"
[bridge]
from = ["all"]
to = "socket-file"
max_message_size = 65536

[endpoints]
unix_socket = "/run/user/1000/agent.sock"
socket_file = "/tmp/msys-agent"
pipe = '\\.\pipe\openssh-ssh-agent'

[dial]
retry_attempts = 5
retry_delay_ms = 250
"#;
        let file: ConfigFile = toml::from_str(toml_str).unwrap();
        let config = BridgeConfig::resolve(file, &ConfigOverrides::default()).unwrap();
        assert_eq!(config.from, vec![native()]);
        assert_eq!(config.to, EndpointKind::SocketFile);
        assert_eq!(config.max_message_size, 65536);
        assert_eq!(config.retry.retries, 5);
        assert_eq!(config.retry.delay, Duration::from_millis(250));
        assert_eq!(config.handshake_timeout, Duration::from_millis(5000));
        assert_eq!(
            config.unix_socket,
            Some(PathBuf::from("/run/user/1000/agent.sock"))
        );
        assert_eq!(config.socket_file, Some(PathBuf::from("/tmp/msys-agent")));
    }

    #[test]
    fn partial_toml_uses_defaults() {
        let file: ConfigFile = toml::from_str("[dial]\nretry_attempts = 0\n").unwrap();
        assert_eq!(file.bridge.from, vec!["all".to_string()]);
        assert_eq!(file.bridge.to, "unix-socket");
        assert_eq!(file.bridge.max_message_size, MAX_MESSAGE_SIZE);
        assert_eq!(file.dial.retry_delay_ms, 1000);
    }

    #[test]
    fn all_excludes_upstream() {
        let config = BridgeConfig::resolve(file_with_sockets(), &ConfigOverrides::default()).unwrap();
        assert_eq!(config.from, vec![native()]);
        assert!(!config.from.contains(&EndpointKind::SocketFile));
    }

    #[cfg(unix)]
    #[test]
    fn all_listens_on_socket_file_when_upstream_is_unix() {
        let mut file = file_with_sockets();
        file.bridge.to = "unix-socket".into();
        let config = BridgeConfig::resolve(file, &ConfigOverrides::default()).unwrap();
        assert_eq!(config.from, vec![EndpointKind::SocketFile]);
    }

    #[test]
    fn cli_overrides_win() {
        let overrides = ConfigOverrides {
            from: Some(vec!["socket-file".into()]),
            socket_file: Some("/tmp/upstream".into()),
            ..Default::default()
        };
        let err = BridgeConfig::resolve(file_with_sockets(), &overrides).unwrap_err();
        assert!(err.to_string().contains("both listen"));

        let overrides = ConfigOverrides {
            socket_file: Some("/tmp/other".into()),
            ..Default::default()
        };
        let config = BridgeConfig::resolve(file_with_sockets(), &overrides).unwrap();
        assert_eq!(config.socket_file, Some(PathBuf::from("/tmp/other")));
    }

    #[test]
    fn unknown_adapter_is_rejected() {
        let overrides = ConfigOverrides {
            from: Some(vec!["carrier-pigeon".into()]),
            ..Default::default()
        };
        let err = BridgeConfig::resolve(file_with_sockets(), &overrides).unwrap_err();
        assert!(err.to_string().contains("carrier-pigeon"));
    }

    #[test]
    fn explicit_adapter_without_path_is_rejected() {
        let mut file = file_with_sockets();
        file.endpoints.unix_socket = None;
        file.endpoints.pipe = None;
        let overrides = ConfigOverrides {
            from: Some(vec![native().name().into()]),
            ..Default::default()
        };
        let err = BridgeConfig::resolve(file, &overrides).unwrap_err();
        assert!(err.to_string().contains("no endpoint configured"));
    }

    #[test]
    fn upstream_without_path_is_rejected() {
        let mut file = file_with_sockets();
        file.endpoints.socket_file = None;
        let err = BridgeConfig::resolve(file, &ConfigOverrides::default()).unwrap_err();
        assert!(err.to_string().contains("upstream"));
    }

    #[test]
    fn empty_listen_set_is_rejected() {
        let mut file = file_with_sockets();
        file.endpoints.unix_socket = None;
        file.endpoints.pipe = None;
        let err = BridgeConfig::resolve(file, &ConfigOverrides::default()).unwrap_err();
        assert!(err.to_string().contains("nothing to listen on"));
    }

    #[test]
    fn tiny_message_size_is_rejected() {
        let mut file = file_with_sockets();
        file.bridge.max_message_size = 4;
        let err = BridgeConfig::resolve(file, &ConfigOverrides::default()).unwrap_err();
        assert!(err.to_string().contains("max_message_size"));
    }

    #[test]
    fn tilde_is_expanded() {
        if let Some(home) = dirs::home_dir() {
            assert_eq!(expand_tilde_str("~/agent.sock"), home.join("agent.sock"));
        }
        assert_eq!(expand_tilde_str("/abs/agent.sock"), PathBuf::from("/abs/agent.sock"));
    }
}
