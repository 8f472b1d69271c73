use std::time::Duration;

use anyhow::bail;

use crate::validation::ValidationPolicy;

/// Timing and policy knobs for a connection. The defaults are the protocol's canonical values;
///  tests shrink the timeouts to keep simulated loss scenarios fast.
#[derive(Debug, Clone)]
pub struct TransportConfig {
    /// How long a single blocking wait for an inbound packet may take before it counts as one
    ///  failed attempt.
    pub recv_timeout: Duration,
    /// Retry budget for every send-and-await-reply step: handshake packets, data packets and
    ///  teardown packets alike.
    pub send_retries: u32,
    /// How many consecutive invalid or timed-out inbound packets `receive` tolerates before
    ///  giving up on the current wait.
    pub receive_retries: u32,
    /// Fixed pause after a transient channel failure before the step is retried.
    pub transient_backoff: Duration,
    /// Lowest port considered when a listener allocates a dedicated port for a child
    ///  connection.
    pub ephemeral_port_base: u16,
    /// The inbound-packet correctness gate, see [ValidationPolicy].
    pub validation: ValidationPolicy,
    /// If true, exhausting `send_retries` without an ack surfaces as an error to the caller.
    ///  If false, the packet is silently abandoned in the original protocol's manner.
    pub raise_on_send_exhaustion: bool,
    /// Optional hard upper bound on any single blocking operation, timeouts and retries
    ///  included. `None` means operations are bounded only by their retry budgets.
    pub operation_deadline: Option<Duration>,
}

impl Default for TransportConfig {
    fn default() -> Self {
        TransportConfig {
            recv_timeout: Duration::from_millis(500),
            send_retries: 10,
            receive_retries: 10,
            transient_backoff: Duration::from_millis(100),
            ephemeral_port_base: 4000,
            validation: ValidationPolicy::default(),
            raise_on_send_exhaustion: true,
            operation_deadline: None,
        }
    }
}

impl TransportConfig {
    /// Sanity checks against configurations that would make the protocol spin or hang.
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.send_retries == 0 {
            bail!("send_retries must be at least 1");
        }
        if self.receive_retries == 0 {
            bail!("receive_retries must be at least 1");
        }
        if self.recv_timeout.is_zero() {
            bail!("recv_timeout must be non-zero");
        }
        if let Some(deadline) = self.operation_deadline {
            if deadline < self.recv_timeout {
                bail!("operation_deadline must be at least recv_timeout");
            }
        }
        Ok(())
    }
}
