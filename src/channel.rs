pub mod udp;

use std::sync::Arc;
use std::time::Duration;

#[cfg(test)]
use mockall::automock;
use thiserror::Error;

use crate::packet::{EndpointAddr, Packet};

/// Everything that can go wrong at the channel seam. The protocol core maps these to its own
///  behavior: [ChannelError::Transient] triggers a fixed backoff and a retry of the enclosing
///  step, [ChannelError::Timeout] feeds a retry budget, and [ChannelError::Closed] is
///  end-of-stream.
#[derive(Debug, Error)]
pub enum ChannelError {
    #[error("transient channel failure: {0}")]
    Transient(#[from] std::io::Error),
    #[error("timed out waiting for a packet")]
    Timeout,
    #[error("channel closed")]
    Closed,
}

/// The unreliable datagram network underneath the protocol. Implementations may drop, corrupt,
///  duplicate or reorder packets at will - the protocol core assumes nothing beyond "a sent
///  packet *may* arrive, once, eventually".
///
/// This trait decouples the protocol core from the actual network so that tests can run
///  several simulated endpoints in a single process (see [crate::test_util]).
#[cfg_attr(test, automock)]
#[async_trait::async_trait]
pub trait Channel: Send + Sync {
    /// Best-effort transmission of a single packet. `Ok` does *not* mean the packet arrived,
    ///  only that it was handed to the network.
    async fn send(&self, packet: &Packet) -> Result<(), ChannelError>;

    /// The next inbound packet addressed to this endpoint. `timeout == None` blocks
    ///  indefinitely.
    async fn recv(&self, timeout: Option<Duration>) -> Result<Packet, ChannelError>;
}

/// Factory for [Channel]s bound to a local endpoint. A connection binds its own channel at
///  creation, and a listener binds a fresh one for each child connection it spawns on an
///  ephemeral port.
#[async_trait::async_trait]
pub trait ChannelProvider: Send + Sync {
    async fn bind(&self, local: EndpointAddr) -> anyhow::Result<Arc<dyn Channel>>;
}
