//! Windows named pipe adapter (Win32-OpenSSH's `\\.\pipe\openssh-ssh-agent`).

use agent_bridge_core::{
    dial_with_retry, Accept, BoxConnection, BoxFuture, BridgeError, BridgeResult, Dial, Listen,
    RetryPolicy,
};
use std::io::ErrorKind;
use tokio::net::windows::named_pipe::{ClientOptions, NamedPipeServer, ServerOptions};
use tracing::debug;

const NAME: &str = "pipe";
const ERROR_PIPE_BUSY: i32 = 231;

pub struct PipeListen {
    name: String,
}

impl PipeListen {
    pub fn new(name: impl Into<String>) -> Self {
        Self { name: name.into() }
    }
}

impl Listen for PipeListen {
    fn name(&self) -> &str {
        NAME
    }

    fn listen(&self) -> BoxFuture<'_, BridgeResult<Box<dyn Accept>>> {
        Box::pin(async move {
            // Fails if another agent already owns the pipe name.
            let server = ServerOptions::new()
                .first_pipe_instance(true)
                .create(&self.name)
                .map_err(|e| {
                    BridgeError::Config(format!("can't create pipe {}: {e}", self.name))
                })?;
            debug!(pipe = %self.name, "created named pipe");
            Ok(Box::new(PipeAcceptor {
                name: self.name.clone(),
                server,
            }) as Box<dyn Accept>)
        })
    }
}

struct PipeAcceptor {
    name: String,
    server: NamedPipeServer,
}

impl Accept for PipeAcceptor {
    fn accept(&mut self) -> BoxFuture<'_, BridgeResult<BoxConnection>> {
        Box::pin(async move {
            self.server.connect().await?;
            // Put the next instance in place before handing this one out so
            // clients never see the pipe missing.
            let next = ServerOptions::new().create(&self.name)?;
            let connected = std::mem::replace(&mut self.server, next);
            Ok(Box::new(connected) as BoxConnection)
        })
    }
}

pub struct PipeDial {
    name: String,
    retry: RetryPolicy,
}

impl PipeDial {
    pub fn new(name: impl Into<String>, retry: RetryPolicy) -> Self {
        Self {
            name: name.into(),
            retry,
        }
    }

    async fn connect_once(&self) -> BridgeResult<BoxConnection> {
        match ClientOptions::new().open(&self.name) {
            Ok(client) => Ok(Box::new(client)),
            Err(e)
                if e.kind() == ErrorKind::NotFound
                    || e.raw_os_error() == Some(ERROR_PIPE_BUSY) =>
            {
                Err(BridgeError::Transient(format!("{}: {e}", self.name)))
            }
            Err(e) => Err(e.into()),
        }
    }
}

impl Dial for PipeDial {
    fn name(&self) -> &str {
        NAME
    }

    fn dial(&self) -> BoxFuture<'_, BridgeResult<BoxConnection>> {
        Box::pin(dial_with_retry(NAME, self.retry, move || self.connect_once()))
    }
}
