//! Transport adapter contract.
//!
//! Stream-based adapters implement [`Listen`] (downstream endpoints clients
//! connect to) and/or [`Dial`] (the upstream agent). Both hand back
//! [`BoxConnection`]s, ordered full-duplex byte streams; dropping one closes it.

use crate::error::BridgeResult;
use std::future::Future;
use std::pin::Pin;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tracing::{debug, info};

pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// An ordered, full-duplex byte stream.
pub trait Connection: AsyncRead + AsyncWrite + Send + Unpin {}

impl<T> Connection for T where T: AsyncRead + AsyncWrite + Send + Unpin {}

pub type BoxConnection = Box<dyn Connection>;

/// Capability to open a fresh connection to the upstream agent.
pub trait Dial: Send + Sync {
    /// Adapter name used in logs.
    fn name(&self) -> &str;

    /// Open one connection. Retrying transient absence, if any, happens
    /// in here; the caller sees a single success or failure.
    fn dial(&self) -> BoxFuture<'_, BridgeResult<BoxConnection>>;
}

/// Capability to expose an endpoint clients connect to.
pub trait Listen: Send + Sync {
    /// Adapter name used in logs.
    fn name(&self) -> &str;

    /// Bind the endpoint.
    fn listen(&self) -> BoxFuture<'_, BridgeResult<Box<dyn Accept>>>;
}

/// A bound endpoint. Dropping it closes the endpoint.
pub trait Accept: Send {
    /// Wait for the next client. A [`BridgeError::Disconnected`] error means
    /// the endpoint was closed.
    ///
    /// [`BridgeError::Disconnected`]: crate::error::BridgeError::Disconnected
    fn accept(&mut self) -> BoxFuture<'_, BridgeResult<BoxConnection>>;
}

/// How often a dial retries an endpoint that is not there yet.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Retries after the first attempt.
    pub retries: u32,
    pub delay: Duration,
}

impl RetryPolicy {
    pub const NONE: RetryPolicy = RetryPolicy {
        retries: 0,
        delay: Duration::ZERO,
    };
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            retries: 2,
            delay: Duration::from_secs(1),
        }
    }
}

/// Run `connect` until it succeeds, fails with a non-transient error, or
/// `policy` is exhausted.
pub async fn dial_with_retry<T, F, Fut>(
    name: &str,
    policy: RetryPolicy,
    mut connect: F,
) -> BridgeResult<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = BridgeResult<T>>,
{
    let mut attempt = 0;
    loop {
        match connect().await {
            Err(e) if e.is_transient() && attempt < policy.retries => {
                if attempt == 0 {
                    info!(
                        endpoint = %name,
                        error = %e,
                        "failed to connect, retrying (successive failures won't be logged)"
                    );
                } else {
                    debug!(endpoint = %name, attempt, "still unavailable");
                }
                attempt += 1;
                tokio::time::sleep(policy.delay).await;
            }
            other => return other,
        }
    }
}
