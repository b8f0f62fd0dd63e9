//! Connection pump: moves frames between one client connection and the bus.
//!
//! Each accepted connection gets two workers:
//!
//! - **inbound** decodes frames and submits one [`AgentQuery`] per frame;
//! - **outbound** writes replies back, strictly in request order.
//!
//! The inbound side hands each query's reply receiver to the outbound side
//! through a small queue, so replies can never overtake each other. A clean
//! end of stream from the client lets already-submitted queries still be
//! answered; any other failure closes the connection at once. When the
//! bridge stops, replies already owed (normally the failure reply) are still
//! written before the connection closes.

use crate::codec::read_message;
use crate::context::BridgeContext;
use crate::messages::{AgentQuery, ReplyReceiver};
use crate::transport::BoxConnection;
use std::time::Duration;
use tokio::io::{AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Replies a connection may have outstanding before its reader stalls.
const PENDING_REPLIES: usize = 16;

/// How long a stopping connection keeps writing replies it already owes.
const STOP_GRACE: Duration = Duration::from_millis(500);

/// Attach a pump to `conn`. Both halves run as workers of `ctx`.
pub fn spawn_connection(ctx: &BridgeContext, endpoint: &str, conn: BoxConnection) {
    let (reader, writer) = tokio::io::split(conn);
    let (pending_tx, pending_rx) = mpsc::channel(PENDING_REPLIES);
    let token = ctx.child_token();

    debug!(endpoint = %endpoint, "client connected");

    ctx.spawn(inbound(
        ctx.clone(),
        endpoint.to_string(),
        reader,
        pending_tx,
        token.clone(),
    ));
    ctx.spawn(outbound(
        ctx.clone(),
        endpoint.to_string(),
        writer,
        pending_rx,
        token,
    ));
}

async fn inbound(
    ctx: BridgeContext,
    endpoint: String,
    mut reader: ReadHalf<BoxConnection>,
    pending: mpsc::Sender<ReplyReceiver>,
    token: CancellationToken,
) {
    let mut buf = vec![0u8; ctx.max_message_size()];

    loop {
        let result = tokio::select! {
            _ = token.cancelled() => break,
            result = read_message(&mut reader, &mut buf) => result,
        };

        let n = match result {
            Ok(n) => n,
            Err(e) if e.is_disconnect() => break,
            Err(e) => {
                warn!(endpoint = %endpoint, error = %e, "read error");
                token.cancel();
                break;
            }
        };

        debug!(endpoint = %endpoint, len = n, "read query");

        let (query, reply_rx) = AgentQuery::new(buf[..n].to_vec());
        if pending.send(reply_rx).await.is_err() {
            break;
        }
        if let Err(e) = ctx.submit(query).await {
            debug!(endpoint = %endpoint, error = %e, "query not submitted");
            break;
        }
    }

    debug!(endpoint = %endpoint, "client disconnected");
}

async fn outbound(
    ctx: BridgeContext,
    endpoint: String,
    mut writer: WriteHalf<BoxConnection>,
    mut pending: mpsc::Receiver<ReplyReceiver>,
    token: CancellationToken,
) {
    loop {
        let mut reply_rx = tokio::select! {
            _ = token.cancelled() => {
                if ctx.is_stopping() {
                    drain_on_stop(&endpoint, &mut writer, None, &mut pending).await;
                }
                break;
            }
            next = pending.recv() => match next {
                Some(rx) => rx,
                None => break,
            },
        };

        let reply = tokio::select! {
            _ = token.cancelled() => {
                if ctx.is_stopping() {
                    drain_on_stop(&endpoint, &mut writer, Some(reply_rx), &mut pending).await;
                }
                break;
            }
            reply = &mut reply_rx => match reply {
                Ok(reply) => reply,
                Err(_) => {
                    debug!(endpoint = %endpoint, "query dropped without a reply");
                    break;
                }
            },
        };

        debug!(endpoint = %endpoint, len = reply.data.len(), "write reply");

        let written = tokio::select! {
            _ = token.cancelled() => break,
            result = writer.write_all(&reply.data) => result,
        };
        if let Err(e) = written {
            warn!(endpoint = %endpoint, error = %e, "write error");
            break;
        }
    }

    token.cancel();
    let _ = writer.shutdown().await;
}

/// Write the replies still owed to the client after the bridge started
/// stopping. Forwarders answer outstanding queries at once during a stop,
/// so this waits at most [`STOP_GRACE`].
async fn drain_on_stop(
    endpoint: &str,
    writer: &mut WriteHalf<BoxConnection>,
    first: Option<ReplyReceiver>,
    pending: &mut mpsc::Receiver<ReplyReceiver>,
) {
    let drain = async {
        let mut next = first;
        loop {
            let reply_rx = match next.take() {
                Some(rx) => rx,
                None => match pending.recv().await {
                    Some(rx) => rx,
                    None => break,
                },
            };
            let Ok(reply) = reply_rx.await else {
                break;
            };
            debug!(endpoint = %endpoint, len = reply.data.len(), "write reply after stop");
            if writer.write_all(&reply.data).await.is_err() {
                break;
            }
        }
    };

    if tokio::time::timeout(STOP_GRACE, drain).await.is_err() {
        debug!(endpoint = %endpoint, "replies still pending at stop dropped");
    }
}
