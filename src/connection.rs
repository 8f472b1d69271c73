use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard};

use bytes::Bytes;
use rand::Rng;
use thiserror::Error;
use tokio::time::sleep;
use tracing::{debug, info, warn};

use crate::channel::{Channel, ChannelError, ChannelProvider};
use crate::config::TransportConfig;
use crate::packet::{EndpointAddr, Packet, PacketFlag};
use crate::port_registry::PortRegistry;
use crate::retransmit::send_await_reply;

/// Lifecycle states of a [Connection]. `Closed` is both initial and terminal, and it is
///  reentrant: a closed connection can be connected again.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum ConnectionState {
    Closed,
    Listen,
    SynSent,
    SynRcvd,
    Established,
    FinWait1,
    FinWait2,
    CloseWait,
    LastAck,
    TimeWait,
}

/// The application-facing error contract. Per-packet anomalies (corruption, stale acks,
///  sequence gaps) never show up here, they are handled inside the state machine; what does
///  cross this boundary is exhausted retry budgets, illegal call sequencing, end-of-stream
///  and deadline expiry.
#[derive(Debug, Error)]
pub enum ConnectionError {
    #[error("operation requires state {expected:?} but connection is {actual:?}")]
    IllegalState { expected: ConnectionState, actual: ConnectionState },
    #[error("connection is not established")]
    NotConnected,
    #[error("no acknowledgment after {attempts} attempts")]
    NoAck { attempts: u32 },
    #[error("handshake failed: {0}")]
    HandshakeFailed(String),
    #[error("peer closed the connection")]
    EndOfStream,
    #[error("operation deadline exceeded")]
    DeadlineExceeded,
    #[error("channel failure: {0}")]
    Channel(#[from] ChannelError),
}

/// Mutable per-connection protocol state. Owned exclusively by its [Connection] behind a
///  sync mutex; the guard is never held across an await point.
struct Inner {
    state: ConnectionState,
    remote: Option<EndpointAddr>,
    next_sequence_no: u32,
    /// The most recently accepted inbound packet: cumulative-ack reference and sequence
    ///  continuity baseline.
    last_valid_packet_received: Option<Packet>,
    last_data_packet_sent: Option<Packet>,
    /// The most recent acknowledgment this endpoint sent. Re-acknowledging a duplicate
    ///  resends this exact packet, keeping the retransmission invariant that a resend never
    ///  changes sequence numbers.
    last_ack_sent: Option<Packet>,
    /// Set when a peer-initiated FIN was observed, turning the next close into a passive one.
    disconnect_request: bool,
}

impl Inner {
    /// Consume the next sequence number. Every packet this endpoint sends draws from this
    ///  counter, acknowledgments included.
    fn take_seq(&mut self) -> u32 {
        let seq = self.next_sequence_no;
        self.next_sequence_no = self.next_sequence_no.wrapping_add(1);
        seq
    }
}

/// What the receive loop decided to do with one inbound packet. Decided under the state
///  lock, executed after releasing it.
enum RecvAction {
    /// New in-order data: acknowledge with this packet and hand the payload to the caller.
    Deliver(Packet, String),
    /// Duplicate of something already accepted: resend the previous acknowledgment.
    ReAck(Option<Packet>),
    /// Peer wants to tear down: acknowledge and report end-of-stream.
    Disconnect(Packet),
    Ignore,
}

/// One endpoint of a reliable session over an unreliable datagram channel.
///
/// A connection is created bound to a local endpoint and starts out `Closed`. From there it
///  either dials a peer ([Connection::connect]) or acts as a listener
///  ([Connection::accept], which hands each established session off to a fresh connection on
///  an ephemeral port so the listener keeps listening). Once `Established`, [Connection::send]
///  and [Connection::receive] move one packet at a time with stop-and-wait reliability, and
///  [Connection::close] runs the FIN handshake back to `Closed`.
///
/// All methods take `&self`; the connection is safe to share behind an `Arc`. Concurrent
///  sends are serialized by an internal gate so only one packet is ever in flight.
pub struct Connection {
    local: EndpointAddr,
    channel: Arc<dyn Channel>,
    provider: Arc<dyn ChannelProvider>,
    ports: Arc<PortRegistry>,
    config: TransportConfig,
    inner: Mutex<Inner>,
    /// Serializes send cycles so there is exactly one outstanding data packet per connection.
    send_gate: tokio::sync::Mutex<()>,
}

impl Connection {
    /// Create a connection in `Closed` state, bound to `local`: the port is reserved in the
    ///  registry and a channel is bound before any packet can flow.
    pub async fn bind(
        local: EndpointAddr,
        provider: Arc<dyn ChannelProvider>,
        ports: Arc<PortRegistry>,
        config: TransportConfig,
    ) -> anyhow::Result<Connection> {
        config.validate()?;
        ports.reserve(local.port);
        let channel = provider.bind(local).await?;

        let initial_sequence_no = rand::rng().random_range(1..10_000);
        debug!("{:?}: bound, initial sequence number {}", local, initial_sequence_no);

        Ok(Connection {
            local,
            channel,
            provider,
            ports,
            config,
            inner: Mutex::new(Inner {
                state: ConnectionState::Closed,
                remote: None,
                next_sequence_no: initial_sequence_no,
                last_valid_packet_received: None,
                last_data_packet_sent: None,
                last_ack_sent: None,
                disconnect_request: false,
            }),
            send_gate: tokio::sync::Mutex::new(()),
        })
    }

    pub fn local_addr(&self) -> EndpointAddr {
        self.local
    }

    pub fn remote_addr(&self) -> Option<EndpointAddr> {
        self.locked().remote
    }

    pub fn state(&self) -> ConnectionState {
        self.locked().state
    }

    fn locked(&self) -> MutexGuard<Inner> {
        self.inner.lock().expect("connection state mutex poisoned")
    }

    /// Apply the configured operation deadline to one blocking public operation.
    async fn with_deadline<T>(
        &self,
        fut: impl Future<Output = Result<T, ConnectionError>>,
    ) -> Result<T, ConnectionError> {
        match self.config.operation_deadline {
            Some(deadline) => tokio::time::timeout(deadline, fut)
                .await
                .unwrap_or(Err(ConnectionError::DeadlineExceeded)),
            None => fut.await,
        }
    }

    /// One transient-tolerant transmission: retries with a fixed backoff for as long as the
    ///  channel reports transient failures, bounded only by the caller's deadline.
    async fn send_packet(&self, packet: &Packet) -> Result<(), ConnectionError> {
        loop {
            match self.channel.send(packet).await {
                Ok(()) => return Ok(()),
                Err(ChannelError::Transient(e)) => {
                    warn!("{:?}: transient failure sending {:?}: {}", self.local, packet, e);
                    sleep(self.config.transient_backoff).await;
                }
                Err(e) => return Err(e.into()),
            }
        }
    }

    /// Actively establish a session with `remote`. Blocks until the three-way handshake
    ///  completes or the retry budget for the SYN is exhausted.
    pub async fn connect(&self, remote: EndpointAddr) -> Result<(), ConnectionError> {
        let result = self.with_deadline(self.do_connect(remote)).await;
        if result.is_err() {
            let mut inner = self.locked();
            if inner.state == ConnectionState::SynSent {
                inner.state = ConnectionState::Closed;
                inner.remote = None;
            }
        }
        result
    }

    async fn do_connect(&self, remote: EndpointAddr) -> Result<(), ConnectionError> {
        let syn = {
            let mut inner = self.locked();
            if inner.state != ConnectionState::Closed {
                return Err(ConnectionError::IllegalState {
                    expected: ConnectionState::Closed,
                    actual: inner.state,
                });
            }
            // reentrant use after a previous teardown released the port
            self.ports.reserve(self.local.port);
            inner.remote = Some(remote);
            inner.last_valid_packet_received = None;
            inner.disconnect_request = false;
            inner.state = ConnectionState::SynSent;
            let seq = inner.take_seq();
            Packet::syn(self.local, remote, seq)
        };
        info!("{:?}: connecting to {:?}", self.local, remote);

        let reply = send_await_reply(
            self.channel.as_ref(),
            &syn,
            self.config.send_retries,
            self.config.recv_timeout,
            self.config.transient_backoff,
            |p| {
                let inner = self.locked();
                self.config.validation.is_valid(
                    inner.state,
                    inner.next_sequence_no,
                    inner.last_valid_packet_received.as_ref(),
                    p,
                )
            },
        )
        .await?;

        let Some(syn_ack) = reply else {
            return Err(ConnectionError::HandshakeFailed(format!(
                "no valid SYN_ACK from {:?} after {} attempts",
                remote, self.config.send_retries
            )));
        };

        let ack = {
            let mut inner = self.locked();
            // the peer may have handed the session off to an ephemeral port
            inner.remote = Some(syn_ack.src());
            inner.last_valid_packet_received = Some(syn_ack.clone());
            let seq = inner.take_seq();
            Packet::ack(self.local, syn_ack.src(), seq, syn_ack.seq_nr())
        };
        self.send_packet(&ack).await?;
        {
            let mut inner = self.locked();
            inner.last_ack_sent = Some(ack);
            inner.state = ConnectionState::Established;
        }
        info!("{:?}: established to {:?}", self.local, syn_ack.src());
        Ok(())
    }

    /// Wait for one peer to dial in, and hand the established session off to a new
    ///  connection on a freshly allocated ephemeral port. The listener itself returns to
    ///  `Closed`, ready to accept again.
    pub async fn accept(&self) -> Result<Connection, ConnectionError> {
        let result = self.with_deadline(self.do_accept()).await;
        if result.is_err() {
            let mut inner = self.locked();
            if inner.state == ConnectionState::Listen {
                inner.state = ConnectionState::Closed;
            }
        }
        result
    }

    async fn do_accept(&self) -> Result<Connection, ConnectionError> {
        {
            let mut inner = self.locked();
            if inner.state != ConnectionState::Closed {
                return Err(ConnectionError::IllegalState {
                    expected: ConnectionState::Closed,
                    actual: inner.state,
                });
            }
            inner.state = ConnectionState::Listen;
            // each accepted session starts a fresh sequence baseline, unrelated to whatever
            //  peer was accepted before
            inner.last_valid_packet_received = None;
            inner.disconnect_request = false;
        }
        info!("{:?}: listening", self.local);

        let syn = loop {
            let packet = match self.channel.recv(None).await {
                Ok(packet) => packet,
                Err(ChannelError::Transient(e)) => {
                    warn!("{:?}: transient failure while listening: {}", self.local, e);
                    sleep(self.config.transient_backoff).await;
                    continue;
                }
                Err(e) => return Err(e.into()),
            };
            let acceptable = {
                let inner = self.locked();
                self.config.validation.is_valid(inner.state, inner.next_sequence_no, None, &packet)
            };
            if acceptable {
                break packet;
            }
            debug!("{:?}: listener discarding {:?}", self.local, packet);
        };
        info!("{:?}: connection attempt from {:?}", self.local, syn.src());

        let child_port = self.ports.allocate_ephemeral(self.config.ephemeral_port_base);
        let child_local = EndpointAddr::new(self.local.ip, child_port);
        let child = match Connection::bind(
            child_local,
            self.provider.clone(),
            self.ports.clone(),
            self.config.clone(),
        )
        .await
        {
            Ok(child) => child,
            Err(e) => {
                self.ports.release(child_port);
                self.locked().state = ConnectionState::Closed;
                return Err(ConnectionError::HandshakeFailed(format!(
                    "binding session endpoint {:?} failed: {}",
                    child_local, e
                )));
            }
        };

        let result = child.complete_handshake(&syn).await;
        self.locked().state = ConnectionState::Closed;
        match result {
            Ok(()) => Ok(child),
            // dropping the child releases its ephemeral port
            Err(e) => Err(e),
        }
    }

    /// Server side of the handshake, run on the freshly spawned session connection. The
    ///  channel is already bound at this point, so a fast final ACK can never race setup.
    async fn complete_handshake(&self, syn: &Packet) -> Result<(), ConnectionError> {
        let syn_ack = {
            let mut inner = self.locked();
            inner.remote = Some(syn.src());
            inner.last_valid_packet_received = Some(syn.clone());
            inner.state = ConnectionState::SynRcvd;
            let seq = inner.take_seq();
            Packet::syn_ack(self.local, syn.src(), seq, syn.seq_nr())
        };

        let reply = send_await_reply(
            self.channel.as_ref(),
            &syn_ack,
            self.config.send_retries,
            self.config.recv_timeout,
            self.config.transient_backoff,
            |p| {
                let inner = self.locked();
                self.config.validation.is_valid(
                    inner.state,
                    inner.next_sequence_no,
                    inner.last_valid_packet_received.as_ref(),
                    p,
                )
            },
        )
        .await?;

        match reply {
            Some(ack) => {
                let mut inner = self.locked();
                inner.last_valid_packet_received = Some(ack);
                inner.state = ConnectionState::Established;
                info!("{:?}: established to {:?}", self.local, syn.src());
                Ok(())
            }
            None => {
                self.locked().state = ConnectionState::Closed;
                Err(ConnectionError::HandshakeFailed(format!(
                    "no valid handshake ACK from {:?} after {} attempts",
                    syn.src(),
                    self.config.send_retries
                )))
            }
        }
    }

    /// Reliably transmit one message: stop-and-wait with retransmission until the peer
    ///  acknowledges it or the retry budget runs out.
    pub async fn send(&self, message: &str) -> Result<(), ConnectionError> {
        self.with_deadline(self.do_send(message)).await
    }

    async fn do_send(&self, message: &str) -> Result<(), ConnectionError> {
        let _gate = self.send_gate.lock().await;

        let packet = {
            let mut inner = self.locked();
            if inner.state != ConnectionState::Established {
                return Err(ConnectionError::NotConnected);
            }
            let remote = inner.remote.ok_or(ConnectionError::NotConnected)?;
            let seq = inner.take_seq();
            Packet::data(self.local, remote, seq, Bytes::copy_from_slice(message.as_bytes()))
        };
        debug!("{:?}: sending {:?}", self.local, packet);

        let reply = send_await_reply(
            self.channel.as_ref(),
            &packet,
            self.config.send_retries,
            self.config.recv_timeout,
            self.config.transient_backoff,
            |p| {
                let mut inner = self.locked();
                if p.flag() == PacketFlag::Fin && p.is_checksum_valid() {
                    // peer teardown crossing our send; noted here, handled by the next
                    //  receive or close
                    inner.disconnect_request = true;
                    return false;
                }
                p.flag() == PacketFlag::Ack
                    && self.config.validation.is_valid(
                        inner.state,
                        inner.next_sequence_no,
                        inner.last_valid_packet_received.as_ref(),
                        p,
                    )
            },
        )
        .await?;

        match reply {
            Some(ack) => {
                let mut inner = self.locked();
                let advances = inner
                    .last_valid_packet_received
                    .as_ref()
                    .map(|lv| ack.seq_nr() > lv.seq_nr())
                    .unwrap_or(true);
                if advances {
                    inner.last_valid_packet_received = Some(ack);
                }
                inner.last_data_packet_sent = Some(packet);
                Ok(())
            }
            None if self.config.raise_on_send_exhaustion => {
                Err(ConnectionError::NoAck { attempts: self.config.send_retries })
            }
            None => {
                warn!(
                    "{:?}: abandoning {:?} after {} attempts without acknowledgment",
                    self.local, packet, self.config.send_retries
                );
                self.locked().last_data_packet_sent = Some(packet);
                Ok(())
            }
        }
    }

    /// Block until the next in-order message from the peer. Duplicates are re-acknowledged
    ///  and never delivered twice; a peer-initiated FIN surfaces as
    ///  [ConnectionError::EndOfStream] after being acknowledged.
    pub async fn receive(&self) -> Result<String, ConnectionError> {
        self.with_deadline(self.do_receive()).await
    }

    async fn do_receive(&self) -> Result<String, ConnectionError> {
        if self.locked().state != ConnectionState::Established {
            return Err(ConnectionError::NotConnected);
        }

        loop {
            for _ in 0..self.config.receive_retries {
                let packet = match self.channel.recv(Some(self.config.recv_timeout)).await {
                    Ok(packet) => packet,
                    Err(ChannelError::Timeout) => continue,
                    Err(ChannelError::Transient(e)) => {
                        warn!("{:?}: transient failure receiving: {}", self.local, e);
                        sleep(self.config.transient_backoff).await;
                        continue;
                    }
                    Err(ChannelError::Closed) => {
                        let (disconnected, re_ack) = {
                            let inner = self.locked();
                            (inner.disconnect_request, inner.last_ack_sent.clone())
                        };
                        if disconnected {
                            self.locked().state = ConnectionState::CloseWait;
                            return Err(ConnectionError::EndOfStream);
                        }
                        // no disconnect observed: treat as transient, remind the peer of
                        //  where we stand
                        if let Some(re_ack) = re_ack {
                            let _ = self.channel.send(&re_ack).await;
                        }
                        sleep(self.config.transient_backoff).await;
                        continue;
                    }
                };

                let action = {
                    let mut inner = self.locked();
                    self.classify(&mut inner, packet)
                };
                match action {
                    RecvAction::Deliver(ack, payload) => {
                        self.send_packet(&ack).await?;
                        self.locked().last_ack_sent = Some(ack);
                        return Ok(payload);
                    }
                    RecvAction::Disconnect(ack) => {
                        self.send_packet(&ack).await?;
                        let mut inner = self.locked();
                        inner.last_ack_sent = Some(ack);
                        inner.state = ConnectionState::CloseWait;
                        return Err(ConnectionError::EndOfStream);
                    }
                    RecvAction::ReAck(Some(previous_ack)) => {
                        debug!("{:?}: re-acknowledging with {:?}", self.local, previous_ack);
                        let _ = self.channel.send(&previous_ack).await;
                    }
                    RecvAction::ReAck(None) | RecvAction::Ignore => {}
                }
            }
            debug!("{:?}: no data within the attempt budget, retrying receive", self.local);
        }
    }

    /// Decide what to do with one inbound packet while waiting for data. Runs under the
    ///  state lock; must not block.
    fn classify(&self, inner: &mut Inner, packet: Packet) -> RecvAction {
        let is_duplicate = |inner: &Inner, packet: &Packet| {
            packet.is_checksum_valid()
                && inner
                    .last_valid_packet_received
                    .as_ref()
                    .map(|lv| packet.seq_nr() <= lv.seq_nr())
                    .unwrap_or(false)
        };

        if packet.flag() == PacketFlag::Fin {
            if self.config.validation.is_valid(
                inner.state,
                inner.next_sequence_no,
                inner.last_valid_packet_received.as_ref(),
                &packet,
            ) {
                inner.disconnect_request = true;
                let seq = inner.take_seq();
                let ack = Packet::ack(self.local, packet.src(), seq, packet.seq_nr());
                inner.last_valid_packet_received = Some(packet);
                return RecvAction::Disconnect(ack);
            }
            if is_duplicate(inner, &packet) {
                return RecvAction::ReAck(inner.last_ack_sent.clone());
            }
            debug!("{:?}: discarding {:?}", self.local, packet);
            return RecvAction::Ignore;
        }

        if packet.flag() == PacketFlag::None && is_duplicate(inner, &packet) {
            debug!("{:?}: duplicate {:?}", self.local, packet);
            return RecvAction::ReAck(inner.last_ack_sent.clone());
        }

        if packet.flag() == PacketFlag::None
            && self.config.validation.is_valid(
                inner.state,
                inner.next_sequence_no,
                inner.last_valid_packet_received.as_ref(),
                &packet,
            )
        {
            let payload = String::from_utf8_lossy(packet.payload()).into_owned();
            let seq = inner.take_seq();
            let ack = Packet::ack(self.local, packet.src(), seq, packet.seq_nr());
            inner.last_valid_packet_received = Some(packet);
            return RecvAction::Deliver(ack, payload);
        }

        debug!("{:?}: discarding {:?}", self.local, packet);
        RecvAction::Ignore
    }

    /// Tear the connection down. Best effort: teardown handshake failures are logged, never
    ///  raised, and the connection always ends `Closed` with its port released, so shutdown
    ///  is never blocked by a misbehaving peer.
    pub async fn close(&self) {
        let (state, remote) = {
            let inner = self.locked();
            (inner.state, inner.remote)
        };

        if state != ConnectionState::Closed {
            if let Some(remote) = remote {
                if let Err(e) = self.teardown(remote).await {
                    warn!("{:?}: teardown failed ({}), forcing close", self.local, e);
                }
            }
        }

        {
            let mut inner = self.locked();
            inner.state = ConnectionState::Closed;
            inner.remote = None;
            inner.last_valid_packet_received = None;
            inner.last_data_packet_sent = None;
            inner.last_ack_sent = None;
            inner.disconnect_request = false;
        }
        self.ports.release(self.local.port);
        info!("{:?}: closed", self.local);
    }

    /// The FIN handshake. Active close walks `FinWait1 -> FinWait2 -> TimeWait`; passive
    ///  close (a peer FIN was already observed) walks `LastAck` and is done once its FIN is
    ///  acknowledged. Every wait is bounded so close always terminates.
    async fn teardown(&self, remote: EndpointAddr) -> Result<(), ConnectionError> {
        let (fin, passive) = {
            let mut inner = self.locked();
            let passive = inner.disconnect_request;
            inner.state =
                if passive { ConnectionState::LastAck } else { ConnectionState::FinWait1 };
            let seq = inner.take_seq();
            (Packet::fin(self.local, remote, seq), passive)
        };
        debug!("{:?}: closing ({})", self.local, if passive { "passive" } else { "active" });

        let reply = send_await_reply(
            self.channel.as_ref(),
            &fin,
            self.config.send_retries,
            self.config.recv_timeout,
            self.config.transient_backoff,
            |p| {
                let inner = self.locked();
                self.config.validation.is_valid(
                    inner.state,
                    inner.next_sequence_no,
                    inner.last_valid_packet_received.as_ref(),
                    p,
                )
            },
        )
        .await?;
        let Some(ack) = reply else {
            return Err(ConnectionError::NoAck { attempts: self.config.send_retries });
        };
        {
            let mut inner = self.locked();
            let advances = inner
                .last_valid_packet_received
                .as_ref()
                .map(|lv| ack.seq_nr() > lv.seq_nr())
                .unwrap_or(true);
            if advances {
                inner.last_valid_packet_received = Some(ack);
            }
        }

        if passive {
            return Ok(());
        }

        self.locked().state = ConnectionState::FinWait2;
        for _ in 0..self.config.send_retries {
            let packet = match self.channel.recv(Some(self.config.recv_timeout)).await {
                Ok(packet) => packet,
                Err(ChannelError::Timeout) => continue,
                Err(ChannelError::Transient(e)) => {
                    warn!("{:?}: transient failure awaiting FIN: {}", self.local, e);
                    sleep(self.config.transient_backoff).await;
                    continue;
                }
                Err(e) => return Err(e.into()),
            };
            let valid = {
                let inner = self.locked();
                self.config.validation.is_valid(
                    inner.state,
                    inner.next_sequence_no,
                    inner.last_valid_packet_received.as_ref(),
                    &packet,
                )
            };
            if !valid {
                debug!("{:?}: discarding {:?}", self.local, packet);
                continue;
            }

            let ack = {
                let mut inner = self.locked();
                inner.last_valid_packet_received = Some(packet.clone());
                inner.state = ConnectionState::TimeWait;
                let seq = inner.take_seq();
                Packet::ack(self.local, packet.src(), seq, packet.seq_nr())
            };
            self.send_packet(&ack).await?;
            return Ok(());
        }
        Err(ConnectionError::Channel(ChannelError::Timeout))
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        self.ports.release(self.local.port);
    }
}

#[cfg(test)]
mod test {
    use std::sync::Mutex;
    use std::time::Duration;

    use rustc_hash::FxHashSet;

    use crate::test_util::{FaultAction, TestNetwork};

    use super::*;

    fn addr(port: u16) -> EndpointAddr {
        EndpointAddr::new("127.0.0.1".parse().unwrap(), port)
    }

    fn test_config() -> TransportConfig {
        TransportConfig {
            recv_timeout: Duration::from_millis(100),
            send_retries: 3,
            receive_retries: 3,
            transient_backoff: Duration::from_millis(10),
            ..TransportConfig::default()
        }
    }

    async fn bound(
        network: &TestNetwork,
        ports: &Arc<PortRegistry>,
        port: u16,
        config: TransportConfig,
    ) -> Connection {
        Connection::bind(addr(port), Arc::new(network.clone()), ports.clone(), config)
            .await
            .unwrap()
    }

    /// Dials 5000 -> 4999 and returns (client, session, listener).
    async fn established_pair(
        network: &TestNetwork,
        ports: &Arc<PortRegistry>,
        config: TransportConfig,
    ) -> (Connection, Connection, Connection) {
        let client = bound(network, ports, 5000, config.clone()).await;
        let listener = bound(network, ports, 4999, config).await;

        let (connected, accepted) = tokio::join!(client.connect(addr(4999)), listener.accept());
        connected.unwrap();
        let session = accepted.unwrap();

        assert_eq!(client.state(), ConnectionState::Established);
        assert_eq!(session.state(), ConnectionState::Established);
        (client, session, listener)
    }

    #[tokio::test(start_paused = true)]
    async fn test_happy_path() {
        let network = TestNetwork::new();
        let ports = Arc::new(PortRegistry::new());
        let (client, session, listener) =
            established_pair(&network, &ports, test_config()).await;

        // handshake symmetry: both ends point at each other
        assert_eq!(client.remote_addr(), Some(session.local_addr()));
        assert_eq!(session.remote_addr(), Some(client.local_addr()));
        assert_eq!(listener.state(), ConnectionState::Closed);

        client.send("hello").await.unwrap();
        assert_eq!(session.receive().await.unwrap(), "hello");

        tokio::join!(client.close(), async {
            match session.receive().await {
                Err(ConnectionError::EndOfStream) => {}
                other => panic!("expected end of stream, got {:?}", other),
            }
            assert_eq!(session.state(), ConnectionState::CloseWait);
            session.close().await;
        });

        assert_eq!(client.state(), ConnectionState::Closed);
        assert_eq!(session.state(), ConnectionState::Closed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_corrupted_syn_ack_fails_handshake() {
        let network = TestNetwork::new();
        let ports = Arc::new(PortRegistry::new());
        let client = bound(&network, &ports, 5000, test_config()).await;
        let listener = bound(&network, &ports, 4999, test_config()).await;

        network.set_fault_hook(|p| {
            if p.flag() == PacketFlag::SynAck { FaultAction::Corrupt } else { FaultAction::Deliver }
        });

        let (connected, accepted) = tokio::join!(client.connect(addr(4999)), listener.accept());
        match connected {
            Err(ConnectionError::HandshakeFailed(_)) => {}
            other => panic!("expected handshake failure, got {:?}", other),
        }
        assert!(accepted.is_err());
        assert_eq!(client.state(), ConnectionState::Closed);
        assert_eq!(listener.state(), ConnectionState::Closed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_duplicate_data_is_not_delivered_twice() {
        let network = TestNetwork::new();
        let ports = Arc::new(PortRegistry::new());
        let (client, session, _listener) =
            established_pair(&network, &ports, test_config()).await;

        // every data packet arrives twice; the second copy must only provoke a re-ack
        network.set_fault_hook(|p| {
            if p.flag() == PacketFlag::None { FaultAction::Duplicate } else { FaultAction::Deliver }
        });

        let (sent, received) = tokio::join!(
            async {
                client.send("hello").await?;
                client.send("world").await
            },
            async {
                let first = session.receive().await?;
                let second = session.receive().await?;
                Ok::<_, ConnectionError>((first, second))
            }
        );
        sent.unwrap();
        let (first, second) = received.unwrap();
        assert_eq!(first, "hello");
        assert_eq!(second, "world");
    }

    #[tokio::test(start_paused = true)]
    async fn test_concurrent_sends_do_not_interleave() {
        let network = TestNetwork::new();
        let ports = Arc::new(PortRegistry::new());
        let (client, session, _listener) =
            established_pair(&network, &ports, test_config()).await;
        let client = Arc::new(client);

        // drop the first transmission of every data packet to force a retransmission, and
        //  record the sequence numbers of data packets as they cross the wire
        let observed: Arc<Mutex<(Vec<u32>, FxHashSet<u64>)>> = Arc::new(Mutex::new(Default::default()));
        let hook_observed = observed.clone();
        network.set_fault_hook(move |p| {
            if p.flag() != PacketFlag::None {
                return FaultAction::Deliver;
            }
            let mut guard = hook_observed.lock().unwrap();
            guard.0.push(p.seq_nr());
            if guard.1.insert(p.checksum().0) { FaultAction::Drop } else { FaultAction::Deliver }
        });

        let (c1, c2) = (client.clone(), client.clone());
        let (first, second, received) = tokio::join!(c1.send("first"), c2.send("second"), async {
            session.receive().await?;
            session.receive().await
        });
        first.unwrap();
        second.unwrap();
        received.unwrap();

        let order = observed.lock().unwrap().0.clone();
        // one packet in flight at a time: all transmissions of one sequence number complete
        //  before the next one appears
        assert!(order.windows(2).all(|w| w[0] <= w[1]), "interleaved sends: {:?}", order);
        let distinct: FxHashSet<u32> = order.iter().copied().collect();
        assert_eq!(distinct.len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_send_exhaustion_raises_by_default() {
        let network = TestNetwork::new();
        let ports = Arc::new(PortRegistry::new());
        let (client, _session, _listener) =
            established_pair(&network, &ports, test_config()).await;

        network.set_fault_hook(|p| {
            if p.flag() == PacketFlag::None { FaultAction::Drop } else { FaultAction::Deliver }
        });

        match client.send("lost").await {
            Err(ConnectionError::NoAck { attempts: 3 }) => {}
            other => panic!("expected NoAck, got {:?}", other),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_send_exhaustion_abandons_silently_when_configured() {
        let network = TestNetwork::new();
        let ports = Arc::new(PortRegistry::new());
        let config = TransportConfig { raise_on_send_exhaustion: false, ..test_config() };
        let (client, _session, _listener) = established_pair(&network, &ports, config).await;

        network.set_fault_hook(|p| {
            if p.flag() == PacketFlag::None { FaultAction::Drop } else { FaultAction::Deliver }
        });

        client.send("lost").await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_port_lifecycle() {
        let network = TestNetwork::new();
        let ports = Arc::new(PortRegistry::new());
        let (client, session, _listener) =
            established_pair(&network, &ports, test_config()).await;

        let session_port = session.local_addr().port;
        assert!(ports.is_reserved(5000));
        assert!(ports.is_reserved(4999));
        assert!(ports.is_reserved(session_port));
        // the session port was allocated from the ephemeral range, distinct from the listener
        assert!(session_port >= 4000 && session_port != 4999);

        tokio::join!(client.close(), async {
            let _ = session.receive().await;
            session.close().await;
        });

        assert!(!ports.is_reserved(5000));
        assert!(!ports.is_reserved(session_port));
        assert!(ports.is_reserved(4999)); // the listener is still bound
    }

    #[tokio::test(start_paused = true)]
    async fn test_illegal_call_sequencing() {
        let network = TestNetwork::new();
        let ports = Arc::new(PortRegistry::new());
        let fresh = bound(&network, &ports, 5100, test_config()).await;

        match fresh.send("too early").await {
            Err(ConnectionError::NotConnected) => {}
            other => panic!("expected NotConnected, got {:?}", other),
        }
        match fresh.receive().await {
            Err(ConnectionError::NotConnected) => {}
            other => panic!("expected NotConnected, got {:?}", other),
        }

        let (client, _session, _listener) =
            established_pair(&network, &ports, test_config()).await;
        match client.connect(addr(4999)).await {
            Err(ConnectionError::IllegalState {
                expected: ConnectionState::Closed,
                actual: ConnectionState::Established,
            }) => {}
            other => panic!("expected IllegalState, got {:?}", other),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_listener_accepts_repeatedly() {
        let network = TestNetwork::new();
        let ports = Arc::new(PortRegistry::new());
        let listener = bound(&network, &ports, 4999, test_config()).await;

        for port in [5000, 5001] {
            let client = bound(&network, &ports, port, test_config()).await;
            let (connected, accepted) = tokio::join!(client.connect(addr(4999)), listener.accept());
            connected.unwrap();
            let session = accepted.unwrap();
            assert_eq!(session.remote_addr(), Some(addr(port)));

            tokio::join!(client.close(), async {
                let _ = session.receive().await;
                session.close().await;
            });
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_operation_deadline() {
        let network = TestNetwork::new();
        let ports = Arc::new(PortRegistry::new());
        let config = TransportConfig {
            operation_deadline: Some(Duration::from_millis(150)),
            ..test_config()
        };
        let listener = bound(&network, &ports, 4999, config).await;

        // nobody ever dials in
        match listener.accept().await {
            Err(ConnectionError::DeadlineExceeded) => {}
            other => panic!("expected DeadlineExceeded, got {:?}", other.map(|_| ())),
        }
        assert_eq!(listener.state(), ConnectionState::Closed);
    }
}
