//! Process lifecycle: wire listeners and one upstream to a context.

use crate::broker::{spawn_broker_forwarder, AgentBroker};
use crate::context::BridgeContext;
use crate::error::{BridgeError, BridgeResult};
use crate::forwarder::spawn_forwarder;
use crate::listener::spawn_listener;
use crate::transport::{Dial, Listen};
use std::sync::Arc;
use tracing::info;

/// Where queries from every listener end up.
#[derive(Clone)]
pub enum Upstream {
    /// A stream endpoint dialed once per query.
    Stream(Arc<dyn Dial>),
    /// A message-based broker driven by its own loop.
    Broker(Arc<dyn AgentBroker>),
}

impl Upstream {
    pub fn name(&self) -> &str {
        match self {
            Upstream::Stream(dial) => dial.name(),
            Upstream::Broker(broker) => broker.name(),
        }
    }
}

/// A running bridge.
pub struct Bridge {
    ctx: BridgeContext,
}

impl Bridge {
    /// Start one listener per entry in `listeners` and the upstream forwarder.
    ///
    /// # Errors
    ///
    /// [`BridgeError::Config`] if the upstream broker cannot be reached; in
    /// that case nothing is started.
    pub fn start(
        ctx: BridgeContext,
        listeners: Vec<Arc<dyn Listen>>,
        upstream: Upstream,
    ) -> BridgeResult<Self> {
        if let Upstream::Broker(broker) = &upstream {
            if !broker.is_available() {
                return Err(BridgeError::Config(format!(
                    "{} is not available, run it first or queries will fail",
                    broker.name()
                )));
            }
        }

        info!(
            listeners = listeners.len(),
            upstream = %upstream.name(),
            "starting bridge"
        );
        for listen in listeners {
            spawn_listener(&ctx, listen);
        }

        match upstream {
            Upstream::Stream(dial) => spawn_forwarder(&ctx, dial),
            Upstream::Broker(broker) => spawn_broker_forwarder(&ctx, broker),
        }

        Ok(Self { ctx })
    }

    pub fn context(&self) -> &BridgeContext {
        &self.ctx
    }

    /// Begin shutdown. Idempotent.
    pub fn request_stop(&self) -> bool {
        self.ctx.request_stop()
    }

    /// Wait for every worker to exit.
    pub async fn wait_stopped(&self) {
        self.ctx.wait().await;
    }
}
