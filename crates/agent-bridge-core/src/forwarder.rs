//! Generic upstream forwarder: drains the bus, one fresh upstream connection
//! per query.
//!
//! Each query is handled as dial → write frame → read one frame → close.
//! No upstream connection is reused, so replies from unrelated clients can
//! never be mixed up or reordered, and a query is never retried or requeued.
//! Every failure turns into the synthetic failure reply.

use crate::codec::read_message;
use crate::context::BridgeContext;
use crate::error::BridgeResult;
use crate::messages::AgentReply;
use crate::transport::Dial;
use std::sync::Arc;
use tokio::io::AsyncWriteExt;
use tracing::{debug, info, warn};

/// Run [`run_forwarder`] as a worker of `ctx`.
pub fn spawn_forwarder(ctx: &BridgeContext, dial: Arc<dyn Dial>) {
    ctx.spawn(run_forwarder(ctx.clone(), dial));
}

/// Answer queries from the bus until it is closed.
///
/// Once the bridge is stopping, queries still in flight or still queued get
/// the failure reply immediately instead of waiting on upstream.
pub async fn run_forwarder(ctx: BridgeContext, dial: Arc<dyn Dial>) {
    let name = dial.name().to_string();
    info!(endpoint = %name, "forwarding agent queries");

    let mut buf = vec![0u8; ctx.max_message_size()];

    while let Some(query) = ctx.next_query().await {
        if query.is_abandoned() {
            debug!(endpoint = %name, "skipping query from closed client");
            continue;
        }

        let reply = tokio::select! {
            _ = ctx.cancelled() => {
                debug!(endpoint = %name, "bridge stopping, failing query");
                AgentReply::failure()
            }
            result = forward_once(dial.as_ref(), &query.data, &mut buf) => match result {
                Ok(reply) => reply,
                Err(e) => {
                    warn!(endpoint = %name, error = %e, "can't handle query");
                    AgentReply::failure()
                }
            },
        };

        if !query.reply(reply) {
            debug!(endpoint = %name, "client gone before reply");
        }
    }

    debug!(endpoint = %name, "forwarder stopped");
}

/// Perform one upstream exchange: dial, write `frame`, read one reply frame
/// into `buf`. The upstream connection is closed on return.
pub async fn forward_once(
    dial: &dyn Dial,
    frame: &[u8],
    buf: &mut [u8],
) -> BridgeResult<AgentReply> {
    let mut conn = dial.dial().await?;
    conn.write_all(frame).await?;
    conn.flush().await?;
    let n = read_message(&mut conn, buf).await?;
    Ok(AgentReply::new(buf[..n].to_vec()))
}
