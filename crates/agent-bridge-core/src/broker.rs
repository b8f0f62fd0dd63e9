//! Direct bus consumer for message-based upstream agents.
//!
//! Some agents are not reachable over a byte stream but through a blocking
//! request/response call (a window message pointing at shared memory, for
//! example). Such an adapter implements [`AgentBroker`]; the loop here pulls
//! queries off the bus, performs the exchange on the blocking pool, and
//! delivers exactly one reply per query.

use crate::codec::validate_frame;
use crate::context::BridgeContext;
use crate::error::{BridgeError, BridgeResult};
use crate::messages::AgentReply;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// A synchronous request/response channel to an external agent process.
pub trait AgentBroker: Send + Sync + 'static {
    /// Adapter name used in logs.
    fn name(&self) -> &str;

    /// Whether the broker process can currently be reached.
    fn is_available(&self) -> bool {
        true
    }

    /// Send one full frame and return the broker's full reply frame.
    /// Called from the blocking pool; may block.
    fn query(&self, frame: &[u8]) -> BridgeResult<Vec<u8>>;
}

/// Run [`run_broker_forwarder`] as a worker of `ctx`.
pub fn spawn_broker_forwarder(ctx: &BridgeContext, broker: Arc<dyn AgentBroker>) {
    ctx.spawn(run_broker_forwarder(ctx.clone(), broker));
}

/// Answer queries from the bus through `broker` until the bus is closed.
pub async fn run_broker_forwarder(ctx: BridgeContext, broker: Arc<dyn AgentBroker>) {
    let name = broker.name().to_string();
    info!(endpoint = %name, "forwarding agent queries");

    let max = ctx.max_message_size();

    while let Some(mut query) = ctx.next_query().await {
        if query.is_abandoned() {
            debug!(endpoint = %name, "skipping query from closed client");
            continue;
        }

        let frame = std::mem::take(&mut query.data);
        let reply = tokio::select! {
            _ = ctx.cancelled() => AgentReply::failure(),
            result = exchange(&ctx, &broker, frame, max) => match result {
                Ok(reply) => reply,
                Err(e) => {
                    warn!(endpoint = %name, error = %e, "query error");
                    AgentReply::failure()
                }
            },
        };

        query.reply(reply);
    }

    debug!(endpoint = %name, "broker forwarder stopped");
}

/// One broker call. The blocking part is a registered worker of `ctx`: if
/// the bridge stops meanwhile the query is answered with the failure reply
/// at once, but [`BridgeContext::wait`] still waits for the call to return.
async fn exchange(
    ctx: &BridgeContext,
    broker: &Arc<dyn AgentBroker>,
    frame: Vec<u8>,
    max: usize,
) -> BridgeResult<AgentReply> {
    validate_frame(&frame, max)?;

    let broker = Arc::clone(broker);
    let data = ctx
        .spawn_blocking(move || broker.query(&frame))
        .await
        .map_err(|e| BridgeError::Broker(e.to_string()))??;

    validate_frame(&data, max)
        .map_err(|e| BridgeError::Broker(format!("bad response: {e}")))?;
    Ok(AgentReply::new(data))
}
