//! Unix domain socket adapter (OpenSSH's `SSH_AUTH_SOCK`, WSL sockets).

use agent_bridge_core::{
    dial_with_retry, Accept, BoxConnection, BoxFuture, BridgeError, BridgeResult, Dial, Listen,
    RetryPolicy,
};
use std::io::ErrorKind;
use std::os::unix::fs::FileTypeExt;
use std::path::{Path, PathBuf};
use tokio::net::{UnixListener, UnixStream};
use tracing::{debug, warn};

const NAME: &str = "unix-socket";

pub struct UnixSocketListen {
    path: PathBuf,
}

impl UnixSocketListen {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

impl Listen for UnixSocketListen {
    fn name(&self) -> &str {
        NAME
    }

    fn listen(&self) -> BoxFuture<'_, BridgeResult<Box<dyn Accept>>> {
        Box::pin(async move {
            clear_stale_socket(&self.path).await?;
            let listener = UnixListener::bind(&self.path)?;
            debug!(path = %self.path.display(), "bound unix socket");
            Ok(Box::new(UnixSocketAcceptor {
                listener,
                path: self.path.clone(),
            }) as Box<dyn Accept>)
        })
    }
}

/// Make room for a new socket at `path`.
///
/// A leftover socket nobody answers on is removed. A live socket, or
/// anything that is not a socket, is left alone and reported.
async fn clear_stale_socket(path: &Path) -> BridgeResult<()> {
    let meta = match tokio::fs::symlink_metadata(path).await {
        Ok(meta) => meta,
        Err(e) if e.kind() == ErrorKind::NotFound => return Ok(()),
        Err(e) => return Err(e.into()),
    };

    if !meta.file_type().is_socket() {
        return Err(BridgeError::Config(format!(
            "{} exists and is not a socket, won't overwrite it",
            path.display()
        )));
    }

    if UnixStream::connect(path).await.is_ok() {
        return Err(BridgeError::Config(format!(
            "{} is already in use by another agent",
            path.display()
        )));
    }

    tokio::fs::remove_file(path).await?;
    debug!(path = %path.display(), "removed stale socket");
    Ok(())
}

struct UnixSocketAcceptor {
    listener: UnixListener,
    path: PathBuf,
}

impl Accept for UnixSocketAcceptor {
    fn accept(&mut self) -> BoxFuture<'_, BridgeResult<BoxConnection>> {
        Box::pin(async move {
            let (stream, _) = self.listener.accept().await?;
            Ok(Box::new(stream) as BoxConnection)
        })
    }
}

impl Drop for UnixSocketAcceptor {
    fn drop(&mut self) {
        if let Err(e) = std::fs::remove_file(&self.path) {
            if e.kind() != ErrorKind::NotFound {
                warn!(path = %self.path.display(), error = %e, "failed to remove socket");
            }
        }
    }
}

pub struct UnixSocketDial {
    path: PathBuf,
    retry: RetryPolicy,
}

impl UnixSocketDial {
    pub fn new(path: impl Into<PathBuf>, retry: RetryPolicy) -> Self {
        Self {
            path: path.into(),
            retry,
        }
    }

    async fn connect_once(&self) -> BridgeResult<BoxConnection> {
        match UnixStream::connect(&self.path).await {
            Ok(stream) => Ok(Box::new(stream)),
            Err(e) if matches!(e.kind(), ErrorKind::NotFound | ErrorKind::ConnectionRefused) => {
                Err(BridgeError::Transient(format!(
                    "{}: {e}",
                    self.path.display()
                )))
            }
            Err(e) => Err(e.into()),
        }
    }
}

impl Dial for UnixSocketDial {
    fn name(&self) -> &str {
        NAME
    }

    fn dial(&self) -> BoxFuture<'_, BridgeResult<BoxConnection>> {
        Box::pin(dial_with_retry(NAME, self.retry, move || self.connect_once()))
    }
}
