//! agent-bridge-core: the bridging engine behind agent-bridge.
//!
//! Many downstream endpoints (named pipes, unix sockets, emulated sockets)
//! share one upstream SSH agent. Every endpoint feeds a single request bus;
//! a forwarder drains it and answers each query from the upstream agent, or
//! with a synthetic `SSH_AGENT_FAILURE` when the agent cannot be reached.
//! Messages are opaque length-prefixed frames and are never interpreted.

pub mod bridge;
pub mod broker;
pub mod codec;
pub mod context;
pub mod error;
pub mod forwarder;
pub mod listener;
#[cfg(test)]
mod memory;
pub mod messages;
pub mod pump;
pub mod transport;

// Re-export commonly used items at crate root.
pub use bridge::{Bridge, Upstream};
pub use broker::AgentBroker;
pub use codec::{encode_frame, read_message, MAX_MESSAGE_SIZE};
pub use context::{BridgeContext, ContextState};
pub use error::{BridgeError, BridgeResult};
pub use messages::{AgentQuery, AgentReply, FAILURE_FRAME};
pub use transport::{dial_with_retry, Accept, BoxConnection, BoxFuture, Dial, Listen, RetryPolicy};
