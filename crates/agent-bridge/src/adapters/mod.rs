//! Transport adapters for the endpoints agent clients and agents use.
//!
//! | Adapter       | Listen | Dial | Platform |
//! |---------------|--------|------|----------|
//! | `unix-socket` | yes    | yes  | unix     |
//! | `socket-file` | yes    | yes  | any      |
//! | `pipe`        | yes    | yes  | windows  |

#[cfg(windows)]
pub mod named_pipe;
pub mod socket_file;
#[cfg(unix)]
pub mod unix_socket;

use crate::config::BridgeConfig;
use agent_bridge_core::{BridgeError, BridgeResult, Dial, Listen};
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EndpointKind {
    UnixSocket,
    SocketFile,
    Pipe,
}

impl EndpointKind {
    pub const ALL: [EndpointKind; 3] = [
        EndpointKind::Pipe,
        EndpointKind::UnixSocket,
        EndpointKind::SocketFile,
    ];

    pub fn name(self) -> &'static str {
        match self {
            EndpointKind::UnixSocket => "unix-socket",
            EndpointKind::SocketFile => "socket-file",
            EndpointKind::Pipe => "pipe",
        }
    }

    /// Whether this build can open the endpoint at all.
    pub fn is_supported(self) -> bool {
        match self {
            EndpointKind::UnixSocket => cfg!(unix),
            EndpointKind::SocketFile => true,
            EndpointKind::Pipe => cfg!(windows),
        }
    }
}

impl fmt::Display for EndpointKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for EndpointKind {
    type Err = BridgeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        EndpointKind::ALL
            .into_iter()
            .find(|kind| kind.name() == s)
            .ok_or_else(|| {
                let names: Vec<&str> = EndpointKind::ALL
                    .into_iter()
                    .filter(|k| k.is_supported())
                    .map(EndpointKind::name)
                    .collect();
                BridgeError::Config(format!(
                    "unknown endpoint {s:?}, available: {}",
                    names.join(", ")
                ))
            })
    }
}

fn missing(kind: EndpointKind) -> BridgeError {
    BridgeError::Config(format!("no endpoint configured for {kind}"))
}

fn unsupported(kind: EndpointKind) -> BridgeError {
    BridgeError::Config(format!("{kind} is not supported on this platform"))
}

/// Build the listening side of `kind` from `config`.
pub fn listener(kind: EndpointKind, config: &BridgeConfig) -> BridgeResult<Arc<dyn Listen>> {
    match kind {
        #[cfg(unix)]
        EndpointKind::UnixSocket => {
            let path = config.unix_socket.clone().ok_or_else(|| missing(kind))?;
            Ok(Arc::new(unix_socket::UnixSocketListen::new(path)))
        }
        EndpointKind::SocketFile => {
            let path = config.socket_file.clone().ok_or_else(|| missing(kind))?;
            Ok(Arc::new(socket_file::SocketFileListen::new(
                path,
                config.handshake_timeout,
            )))
        }
        #[cfg(windows)]
        EndpointKind::Pipe => {
            let name = config.pipe.clone().ok_or_else(|| missing(kind))?;
            Ok(Arc::new(named_pipe::PipeListen::new(name)))
        }
        _ => Err(unsupported(kind)),
    }
}

/// Build the dialing side of `kind` from `config`.
pub fn dialer(kind: EndpointKind, config: &BridgeConfig) -> BridgeResult<Arc<dyn Dial>> {
    match kind {
        #[cfg(unix)]
        EndpointKind::UnixSocket => {
            let path = config.unix_socket.clone().ok_or_else(|| missing(kind))?;
            Ok(Arc::new(unix_socket::UnixSocketDial::new(path, config.retry)))
        }
        EndpointKind::SocketFile => {
            let path = config.socket_file.clone().ok_or_else(|| missing(kind))?;
            Ok(Arc::new(socket_file::SocketFileDial::new(
                path,
                config.retry,
                config.handshake_timeout,
            )))
        }
        #[cfg(windows)]
        EndpointKind::Pipe => {
            let name = config.pipe.clone().ok_or_else(|| missing(kind))?;
            Ok(Arc::new(named_pipe::PipeDial::new(name, config.retry)))
        }
        _ => Err(unsupported(kind)),
    }
}
