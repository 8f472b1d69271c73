use std::time::Duration;

use tokio::time::Instant;
use tracing::{debug, warn};

use crate::channel::{Channel, ChannelError};
use crate::packet::Packet;

/// Send `packet` and wait for a reply that `accept` approves of, retransmitting the same
///  packet every time a full receive window passes without one. This one loop carries all
///  three phases of the protocol: handshake packets, data packets and teardown packets are
///  retransmitted identically.
///
/// Replies that `accept` rejects are discarded without consuming the retry budget, only an
///  elapsed window does. Returns `Ok(None)` when the budget is exhausted without an accepted
///  reply; deciding whether that is an error is the caller's business.
pub(crate) async fn send_await_reply(
    channel: &dyn Channel,
    packet: &Packet,
    retries: u32,
    recv_timeout: Duration,
    transient_backoff: Duration,
    mut accept: impl FnMut(&Packet) -> bool + Send,
) -> Result<Option<Packet>, ChannelError> {
    for attempt in 0..retries {
        if attempt > 0 {
            debug!("no accepted reply for {:?}, retransmitting (attempt {})", packet, attempt + 1);
        }

        match channel.send(packet).await {
            Ok(()) => {}
            Err(ChannelError::Transient(e)) => {
                warn!("transient failure sending {:?}: {} - backing off", packet, e);
                tokio::time::sleep(transient_backoff).await;
                continue;
            }
            Err(ChannelError::Closed) => {
                warn!("channel closed while sending {:?}", packet);
                return Ok(None);
            }
            Err(e) => return Err(e),
        }

        let window_ends = Instant::now() + recv_timeout;
        loop {
            let remaining = window_ends.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                break;
            }
            match channel.recv(Some(remaining)).await {
                Ok(reply) if accept(&reply) => return Ok(Some(reply)),
                Ok(reply) => {
                    debug!("discarding reply {:?}", reply);
                }
                Err(ChannelError::Timeout) => break,
                Err(ChannelError::Closed) => {
                    warn!("channel closed while awaiting a reply to {:?}", packet);
                    return Ok(None);
                }
                Err(ChannelError::Transient(e)) => {
                    warn!("transient failure receiving: {} - backing off", e);
                    tokio::time::sleep(transient_backoff).await;
                }
            }
        }
    }
    Ok(None)
}
