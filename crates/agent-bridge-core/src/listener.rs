//! Generic accept loop shared by every stream-based downstream endpoint.

use crate::context::BridgeContext;
use crate::pump::spawn_connection;
use crate::transport::Listen;
use std::sync::Arc;
use tracing::{debug, error, info};

/// Run [`run_listener`] as a worker of `ctx`.
pub fn spawn_listener(ctx: &BridgeContext, listen: Arc<dyn Listen>) {
    ctx.spawn(run_listener(ctx.clone(), listen));
}

/// Bind `listen` and attach a connection pump to every accepted client
/// until the bridge stops.
///
/// A failed bind or accept is logged and ends this listener only; a broken
/// endpoint is not retried.
pub async fn run_listener(ctx: BridgeContext, listen: Arc<dyn Listen>) {
    let name = listen.name().to_string();

    let mut acceptor = match listen.listen().await {
        Ok(acceptor) => acceptor,
        Err(e) => {
            error!(endpoint = %name, error = %e, "listen error");
            return;
        }
    };

    info!(endpoint = %name, "listening for agent requests");

    loop {
        let result = tokio::select! {
            _ = ctx.cancelled() => break,
            result = acceptor.accept() => result,
        };

        match result {
            Ok(conn) => spawn_connection(&ctx, &name, conn),
            Err(e) if e.is_disconnect() => break,
            Err(e) => {
                error!(endpoint = %name, error = %e, "accept error");
                break;
            }
        }
    }

    drop(acceptor);
    debug!(endpoint = %name, "listener closed");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::{encode_frame, read_message};
    use crate::error::{BridgeError, BridgeResult};
    use crate::memory::MemoryEndpoint;
    use crate::messages::AgentReply;
    use crate::transport::{Accept, BoxConnection, BoxFuture};
    use std::time::Duration;
    use tokio::io::AsyncWriteExt;

    struct BrokenListen;

    impl Listen for BrokenListen {
        fn name(&self) -> &str {
            "broken"
        }

        fn listen(&self) -> BoxFuture<'_, BridgeResult<Box<dyn Accept>>> {
            Box::pin(async { Err(BridgeError::Config("socket path in use".into())) })
        }
    }

    struct FailingAccept;

    impl Accept for FailingAccept {
        fn accept(&mut self) -> BoxFuture<'_, BridgeResult<BoxConnection>> {
            Box::pin(async {
                Err(BridgeError::Io(std::io::Error::other("descriptor table full")))
            })
        }
    }

    struct FailingListen;

    impl Listen for FailingListen {
        fn name(&self) -> &str {
            "failing"
        }

        fn listen(&self) -> BoxFuture<'_, BridgeResult<Box<dyn Accept>>> {
            Box::pin(async { Ok(Box::new(FailingAccept) as Box<dyn Accept>) })
        }
    }

    #[tokio::test]
    async fn accepted_connections_reach_the_bus() {
        let ctx = BridgeContext::new();
        let endpoint = Arc::new(MemoryEndpoint::new("mem"));
        spawn_listener(&ctx, endpoint.clone());

        let responder = {
            let ctx = ctx.clone();
            tokio::spawn(async move {
                while let Some(query) = ctx.next_query().await {
                    query.reply(AgentReply::new(encode_frame(&[0x06])));
                }
            })
        };

        for _ in 0..3 {
            let mut client = endpoint.connect().await.unwrap();
            client.write_all(&encode_frame(&[0x0B])).await.unwrap();
            let mut buf = [0u8; 16];
            let n = read_message(&mut client, &mut buf).await.unwrap();
            assert_eq!(&buf[..n], &[0, 0, 0, 1, 0x06]);
        }

        ctx.request_stop();
        tokio::time::timeout(Duration::from_secs(5), ctx.wait())
            .await
            .unwrap();
        responder.await.unwrap();
    }

    #[tokio::test]
    async fn listen_failure_ends_listener() {
        let ctx = BridgeContext::new();
        tokio::time::timeout(
            Duration::from_secs(1),
            run_listener(ctx.clone(), Arc::new(BrokenListen)),
        )
        .await
        .expect("listener should give up");
        assert!(!ctx.is_stopping());
    }

    #[tokio::test]
    async fn accept_failure_ends_listener() {
        let ctx = BridgeContext::new();
        tokio::time::timeout(
            Duration::from_secs(1),
            run_listener(ctx.clone(), Arc::new(FailingListen)),
        )
        .await
        .expect("listener should give up");
    }

    #[tokio::test]
    async fn stop_closes_listener() {
        let ctx = BridgeContext::new();
        let endpoint = Arc::new(MemoryEndpoint::new("mem"));
        spawn_listener(&ctx, endpoint.clone());
        tokio::task::yield_now().await;

        ctx.request_stop();
        tokio::time::timeout(Duration::from_secs(5), ctx.wait())
            .await
            .unwrap();
        assert!(endpoint.connect().await.is_err());
    }
}
