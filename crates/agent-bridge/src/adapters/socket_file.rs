//! Cygwin/MSYS emulated unix socket.
//!
//! Cygwin has no AF_UNIX on Windows. A "socket" is a small read-only file
//! naming a loopback TCP port and a 16-byte cookie:
//!
//! ```text
//! !<socket >PORT s XXXXXXXX-XXXXXXXX-XXXXXXXX-XXXXXXXX\0
//! ```
//!
//! Each group is four cookie bytes, byte-reversed, in uppercase hex. A peer
//! proves it read the file by sending the cookie first; both sides then
//! trade 12 bytes of credentials (pid, uid, gid, little-endian u32s).

use agent_bridge_core::{
    dial_with_retry, Accept, BoxConnection, BoxFuture, BridgeError, BridgeResult, Dial, Listen,
    RetryPolicy,
};
use rand::RngCore;
use std::io::{ErrorKind, Write};
use std::net::{Ipv4Addr, SocketAddr};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tracing::{debug, warn};

const NAME: &str = "socket-file";
const MAGIC: &str = "!<socket >";
const COOKIE_LEN: usize = 16;
const CREDENTIALS_LEN: usize = 12;

pub type Cookie = [u8; COOKIE_LEN];

/// Render the socket file contents for `port` and `cookie`.
pub fn format_socket_file(port: u16, cookie: &Cookie) -> String {
    format!("{MAGIC}{port} s {}\0", format_guid(cookie))
}

fn format_guid(cookie: &Cookie) -> String {
    cookie
        .chunks(4)
        .map(|group| {
            let mut group = group.to_vec();
            group.reverse();
            hex::encode_upper(group)
        })
        .collect::<Vec<_>>()
        .join("-")
}

/// Parse socket file contents into port and cookie. The `s ` marker is
/// optional; files written by older MSYS builds omit it.
pub fn parse_socket_file(data: &str) -> BridgeResult<(u16, Cookie)> {
    let bad = || BridgeError::Other(format!("bad socket file data {data:?}"));

    let rest = data.strip_prefix(MAGIC).ok_or_else(bad)?;
    let (port, rest) = rest.split_once(' ').ok_or_else(bad)?;
    let port: u16 = port.parse().map_err(|_| bad())?;
    let rest = rest.strip_prefix("s ").unwrap_or(rest);
    let guid = rest.trim_end_matches('\0').trim();
    let cookie = parse_guid(guid).ok_or_else(bad)?;

    Ok((port, cookie))
}

fn parse_guid(guid: &str) -> Option<Cookie> {
    let mut cookie = [0u8; COOKIE_LEN];
    let mut groups = 0;
    for (i, group) in guid.split('-').enumerate() {
        if i >= 4 || group.len() != 8 {
            return None;
        }
        let mut bytes = hex::decode(group).ok()?;
        bytes.reverse();
        cookie[i * 4..i * 4 + 4].copy_from_slice(&bytes);
        groups += 1;
    }
    (groups == 4).then_some(cookie)
}

fn credentials() -> [u8; CREDENTIALS_LEN] {
    let mut creds = [0u8; CREDENTIALS_LEN];
    creds[..4].copy_from_slice(&std::process::id().to_le_bytes());
    // uid and gid stay 0.
    creds
}

/// Server side of the cookie exchange.
pub async fn server_handshake<S>(stream: &mut S, cookie: &Cookie) -> BridgeResult<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut received = [0u8; COOKIE_LEN];
    stream.read_exact(&mut received).await?;
    if &received != cookie {
        return Err(BridgeError::Handshake(format!(
            "invalid cookie, received {}, expected {}",
            hex::encode(received),
            hex::encode(cookie)
        )));
    }
    stream.write_all(&received).await?;

    let mut peer = [0u8; CREDENTIALS_LEN];
    stream.read_exact(&mut peer).await?;
    stream.write_all(&credentials()).await?;
    stream.flush().await?;
    Ok(())
}

/// Client side of the cookie exchange.
pub async fn client_handshake<S>(stream: &mut S, cookie: &Cookie) -> BridgeResult<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    stream.write_all(cookie).await?;
    stream.flush().await?;

    let mut echoed = [0u8; COOKIE_LEN];
    stream.read_exact(&mut echoed).await?;
    if &echoed != cookie {
        return Err(BridgeError::Handshake("server echoed a different cookie".into()));
    }

    stream.write_all(&credentials()).await?;
    stream.flush().await?;
    let mut peer = [0u8; CREDENTIALS_LEN];
    stream.read_exact(&mut peer).await?;
    Ok(())
}

fn loopback(port: u16) -> SocketAddr {
    SocketAddr::from((Ipv4Addr::LOCALHOST, port))
}

fn remove_socket_file(path: &Path) -> std::io::Result<()> {
    #[cfg(windows)]
    {
        let mut perms = std::fs::metadata(path)?.permissions();
        #[allow(clippy::permissions_set_readonly_false)]
        perms.set_readonly(false);
        std::fs::set_permissions(path, perms)?;
    }
    std::fs::remove_file(path)
}

fn write_socket_file(path: &Path, contents: &str) -> std::io::Result<()> {
    let mut options = std::fs::OpenOptions::new();
    options.write(true).create_new(true);
    #[cfg(unix)]
    {
        use std::os::unix::fs::OpenOptionsExt;
        options.mode(0o400);
    }
    #[cfg(windows)]
    {
        use std::os::windows::fs::OpenOptionsExt;
        // FILE_ATTRIBUTE_READONLY | FILE_ATTRIBUTE_SYSTEM, which Cygwin
        // requires to recognise the file as a socket.
        options.attributes(0x1 | 0x4);
    }
    let mut file = options.open(path)?;
    file.write_all(contents.as_bytes())
}

/// Make room for a new socket file at `path`.
///
/// A well-formed file whose port no longer answers is removed. A live
/// socket file, or any other file, is left alone and reported.
async fn clear_stale_socket_file(path: &Path) -> BridgeResult<()> {
    let meta = match tokio::fs::symlink_metadata(path).await {
        Ok(meta) => meta,
        Err(e) if e.kind() == ErrorKind::NotFound => return Ok(()),
        Err(e) => return Err(e.into()),
    };

    if !meta.is_file() {
        return Err(BridgeError::Config(format!(
            "{} is not a regular file, won't overwrite it",
            path.display()
        )));
    }

    let data = tokio::fs::read(path).await?;
    let (port, _) = parse_socket_file(&String::from_utf8_lossy(&data)).map_err(|_| {
        BridgeError::Config(format!(
            "{} is not a socket file, won't overwrite it",
            path.display()
        ))
    })?;

    if TcpStream::connect(loopback(port)).await.is_ok() {
        return Err(BridgeError::Config(format!(
            "{} is already in use by another agent",
            path.display()
        )));
    }

    remove_socket_file(path)?;
    debug!(path = %path.display(), "removed stale socket file");
    Ok(())
}

pub struct SocketFileListen {
    path: PathBuf,
    handshake_timeout: Duration,
}

impl SocketFileListen {
    pub fn new(path: impl Into<PathBuf>, handshake_timeout: Duration) -> Self {
        Self {
            path: path.into(),
            handshake_timeout,
        }
    }
}

impl Listen for SocketFileListen {
    fn name(&self) -> &str {
        NAME
    }

    fn listen(&self) -> BoxFuture<'_, BridgeResult<Box<dyn Accept>>> {
        Box::pin(async move {
            clear_stale_socket_file(&self.path).await?;

            let listener = TcpListener::bind(loopback(0)).await?;
            let port = listener.local_addr()?.port();

            let mut cookie = [0u8; COOKIE_LEN];
            rand::thread_rng().fill_bytes(&mut cookie);

            write_socket_file(&self.path, &format_socket_file(port, &cookie))?;
            debug!(path = %self.path.display(), port, "wrote socket file");

            Ok(Box::new(SocketFileAcceptor {
                listener,
                cookie,
                path: self.path.clone(),
                handshake_timeout: self.handshake_timeout,
            }) as Box<dyn Accept>)
        })
    }
}

struct SocketFileAcceptor {
    listener: TcpListener,
    cookie: Cookie,
    path: PathBuf,
    handshake_timeout: Duration,
}

impl Accept for SocketFileAcceptor {
    /// Next client that completes the handshake. Clients that fail it are
    /// logged and dropped.
    fn accept(&mut self) -> BoxFuture<'_, BridgeResult<BoxConnection>> {
        Box::pin(async move {
            loop {
                let (mut stream, peer) = self.listener.accept().await?;
                let handshake = server_handshake(&mut stream, &self.cookie);
                match tokio::time::timeout(self.handshake_timeout, handshake).await {
                    Ok(Ok(())) => return Ok(Box::new(stream) as BoxConnection),
                    Ok(Err(e)) => warn!(%peer, error = %e, "handshake failed"),
                    Err(_) => warn!(%peer, "handshake timed out"),
                }
            }
        })
    }
}

impl Drop for SocketFileAcceptor {
    fn drop(&mut self) {
        if let Err(e) = remove_socket_file(&self.path) {
            if e.kind() != ErrorKind::NotFound {
                warn!(path = %self.path.display(), error = %e, "failed to remove socket file");
            }
        }
    }
}

pub struct SocketFileDial {
    path: PathBuf,
    retry: RetryPolicy,
    handshake_timeout: Duration,
}

impl SocketFileDial {
    pub fn new(path: impl Into<PathBuf>, retry: RetryPolicy, handshake_timeout: Duration) -> Self {
        Self {
            path: path.into(),
            retry,
            handshake_timeout,
        }
    }

    async fn connect_once(&self) -> BridgeResult<BoxConnection> {
        let data = match tokio::fs::read(&self.path).await {
            Ok(data) => data,
            Err(e) if e.kind() == ErrorKind::NotFound => {
                return Err(BridgeError::Transient(format!(
                    "{}: {e}",
                    self.path.display()
                )))
            }
            Err(e) => return Err(e.into()),
        };
        let (port, cookie) = parse_socket_file(&String::from_utf8_lossy(&data))?;

        let mut stream = match TcpStream::connect(loopback(port)).await {
            Ok(stream) => stream,
            Err(e) if e.kind() == ErrorKind::ConnectionRefused => {
                return Err(BridgeError::Transient(format!("port {port}: {e}")))
            }
            Err(e) => return Err(e.into()),
        };

        tokio::time::timeout(
            self.handshake_timeout,
            client_handshake(&mut stream, &cookie),
        )
        .await??;

        Ok(Box::new(stream))
    }
}

impl Dial for SocketFileDial {
    fn name(&self) -> &str {
        NAME
    }

    fn dial(&self) -> BoxFuture<'_, BridgeResult<BoxConnection>> {
        Box::pin(dial_with_retry(NAME, self.retry, move || self.connect_once()))
    }
}
