//! In-process transport: one endpoint that can be both listened on and
//! dialed, backed by `tokio::io::duplex` pipes.

use crate::codec::MAX_MESSAGE_SIZE;
use crate::error::{BridgeError, BridgeResult};
use crate::transport::{Accept, BoxConnection, BoxFuture, Dial, Listen};
use std::sync::{Mutex, PoisonError};
use tokio::io::DuplexStream;
use tokio::sync::mpsc;

const BACKLOG: usize = 16;

/// An in-memory endpoint. Clients obtained from [`connect`](Self::connect)
/// or [`Dial::dial`] are handed to whoever accepts on it.
pub struct MemoryEndpoint {
    name: String,
    connect_tx: mpsc::Sender<DuplexStream>,
    accept_rx: Mutex<Option<mpsc::Receiver<DuplexStream>>>,
}

impl MemoryEndpoint {
    pub fn new(name: impl Into<String>) -> Self {
        let (connect_tx, accept_rx) = mpsc::channel(BACKLOG);
        Self {
            name: name.into(),
            connect_tx,
            accept_rx: Mutex::new(Some(accept_rx)),
        }
    }

    /// Open a client connection to this endpoint.
    pub async fn connect(&self) -> BridgeResult<DuplexStream> {
        let (client, server) = tokio::io::duplex(MAX_MESSAGE_SIZE);
        self.connect_tx
            .send(server)
            .await
            .map_err(|_| BridgeError::Transient(format!("{}: nobody listening", self.name)))?;
        Ok(client)
    }
}

impl Listen for MemoryEndpoint {
    fn name(&self) -> &str {
        &self.name
    }

    fn listen(&self) -> BoxFuture<'_, BridgeResult<Box<dyn Accept>>> {
        Box::pin(async move {
            let rx = self
                .accept_rx
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .take()
                .ok_or_else(|| BridgeError::Other(format!("{}: already listening", self.name)))?;
            Ok(Box::new(MemoryAcceptor { rx }) as Box<dyn Accept>)
        })
    }
}

impl Dial for MemoryEndpoint {
    fn name(&self) -> &str {
        &self.name
    }

    fn dial(&self) -> BoxFuture<'_, BridgeResult<BoxConnection>> {
        Box::pin(async move {
            let conn = self.connect().await?;
            Ok(Box::new(conn) as BoxConnection)
        })
    }
}

struct MemoryAcceptor {
    rx: mpsc::Receiver<DuplexStream>,
}

impl Accept for MemoryAcceptor {
    fn accept(&mut self) -> BoxFuture<'_, BridgeResult<BoxConnection>> {
        Box::pin(async move {
            match self.rx.recv().await {
                Some(conn) => Ok(Box::new(conn) as BoxConnection),
                None => Err(BridgeError::Disconnected),
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    #[tokio::test]
    async fn connect_reaches_acceptor() {
        let endpoint = MemoryEndpoint::new("mem");
        let mut acceptor = endpoint.listen().await.unwrap();

        let mut client = endpoint.connect().await.unwrap();
        let mut server = acceptor.accept().await.unwrap();

        client.write_all(b"ping").await.unwrap();
        let mut buf = [0u8; 4];
        server.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"ping");
    }

    #[tokio::test]
    async fn second_listen_fails() {
        let endpoint = MemoryEndpoint::new("mem");
        let _acceptor = endpoint.listen().await.unwrap();
        assert!(endpoint.listen().await.is_err());
    }

    #[tokio::test]
    async fn dial_after_acceptor_dropped_is_transient() {
        let endpoint = MemoryEndpoint::new("mem");
        drop(endpoint.listen().await.unwrap());
        match endpoint.dial().await {
            Err(e) => assert!(e.is_transient()),
            Ok(_) => panic!("dial should fail"),
        }
    }
}
