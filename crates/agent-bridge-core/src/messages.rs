//! Request and reply envelopes carried by the bus.

use tokio::sync::oneshot;

/// Status byte of a generic agent failure response.
pub const SSH_AGENT_FAILURE: u8 = 5;

/// Frame sent to a client when no genuine upstream reply is obtainable.
pub const FAILURE_FRAME: [u8; 5] = [0, 0, 0, 1, SSH_AGENT_FAILURE];

/// Receiving half of a query's single-use reply handoff.
pub type ReplyReceiver = oneshot::Receiver<AgentReply>;

/// One framed agent request plus the handoff its reply must go through.
///
/// Replying consumes the query, so a query can be answered at most once.
#[derive(Debug)]
pub struct AgentQuery {
    /// Full wire frame, length prefix included.
    pub data: Vec<u8>,
    reply: oneshot::Sender<AgentReply>,
}

impl AgentQuery {
    /// Wrap a frame, returning the query and the receiver its reply arrives on.
    pub fn new(data: Vec<u8>) -> (Self, ReplyReceiver) {
        let (reply, rx) = oneshot::channel();
        (Self { data, reply }, rx)
    }

    /// Deliver the reply. Returns `false` if the requester went away, in
    /// which case the reply is dropped.
    pub fn reply(self, reply: AgentReply) -> bool {
        self.reply.send(reply).is_ok()
    }

    /// Deliver the synthetic failure reply.
    pub fn fail(self) -> bool {
        self.reply(AgentReply::failure())
    }

    /// Whether the requester still waits for a reply.
    pub fn is_abandoned(&self) -> bool {
        self.reply.is_closed()
    }
}

/// One framed agent reply.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AgentReply {
    pub data: Vec<u8>,
}

impl AgentReply {
    pub fn new(data: Vec<u8>) -> Self {
        Self { data }
    }

    /// `SSH_AGENT_FAILURE` wrapped in a frame.
    pub fn failure() -> Self {
        Self {
            data: FAILURE_FRAME.to_vec(),
        }
    }

    pub fn is_failure(&self) -> bool {
        self.data == FAILURE_FRAME
    }
}
