//! An in-process packet network for tests: several simulated endpoints exchange packets
//!  through in-memory queues, with a fault hook deciding per packet whether it is delivered,
//!  dropped, corrupted or duplicated. This is what makes loss and corruption scenarios
//!  deterministic and fast; the real [crate::channel::udp::UdpChannel] is exercised separately.
//!
//! This module is part of the public API so that downstream code can script the same fault
//!  scenarios against its own protocol usage.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use rustc_hash::FxHashMap;
use tokio::sync::mpsc;
use tracing::debug;

use crate::channel::{Channel, ChannelError, ChannelProvider};
use crate::packet::{Checksum, EndpointAddr, Packet};

/// A copy of `packet` whose stored checksum no longer matches its contents, as if a bit had
///  flipped in transit.
pub fn corrupt(packet: &Packet) -> Packet {
    Packet::from_wire_parts(
        packet.flag(),
        packet.seq_nr(),
        packet.ack_nr(),
        packet.src(),
        packet.dst(),
        packet.payload().clone(),
        Checksum(packet.checksum().0 ^ 1),
    )
}

/// What the simulated network does with one particular packet in flight.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum FaultAction {
    Deliver,
    Drop,
    Corrupt,
    Duplicate,
}

type FaultHook = Box<dyn Fn(&Packet) -> FaultAction + Send + Sync>;

struct NetworkState {
    endpoints: Mutex<FxHashMap<EndpointAddr, mpsc::UnboundedSender<Packet>>>,
    fault_hook: Mutex<Option<FaultHook>>,
}

/// The simulated network. Cloning is cheap and refers to the same network; endpoints join by
///  binding a channel through the [ChannelProvider] impl.
#[derive(Clone)]
pub struct TestNetwork {
    state: Arc<NetworkState>,
}

impl Default for TestNetwork {
    fn default() -> Self {
        Self::new()
    }
}

impl TestNetwork {
    pub fn new() -> TestNetwork {
        TestNetwork {
            state: Arc::new(NetworkState {
                endpoints: Mutex::new(FxHashMap::default()),
                fault_hook: Mutex::new(None),
            }),
        }
    }

    /// Install the per-packet fault decision. The hook sees every packet any endpoint sends,
    ///  in send order, so it doubles as a wire-level observer.
    pub fn set_fault_hook(&self, hook: impl Fn(&Packet) -> FaultAction + Send + Sync + 'static) {
        *self.state.fault_hook.lock().expect("fault hook mutex poisoned") = Some(Box::new(hook));
    }

    pub fn clear_fault_hook(&self) {
        *self.state.fault_hook.lock().expect("fault hook mutex poisoned") = None;
    }

    /// Abruptly remove an endpoint: its pending inbound packets drain, after which its channel
    ///  reports [ChannelError::Closed].
    pub fn disconnect(&self, endpoint: EndpointAddr) {
        self.state
            .endpoints
            .lock()
            .expect("endpoint table mutex poisoned")
            .remove(&endpoint);
    }

    fn dispatch(&self, packet: Packet) {
        let action = match &*self.state.fault_hook.lock().expect("fault hook mutex poisoned") {
            Some(hook) => hook(&packet),
            None => FaultAction::Deliver,
        };

        match action {
            FaultAction::Deliver => self.deliver(packet),
            FaultAction::Drop => {
                debug!("network dropping {:?}", packet);
            }
            FaultAction::Corrupt => self.deliver(corrupt(&packet)),
            FaultAction::Duplicate => {
                self.deliver(packet.clone());
                self.deliver(packet);
            }
        }
    }

    fn deliver(&self, packet: Packet) {
        let endpoints = self.state.endpoints.lock().expect("endpoint table mutex poisoned");
        match endpoints.get(&packet.dst()) {
            Some(sender) => {
                // a failed send means the receiving side is gone, which on a datagram
                //  network is indistinguishable from loss
                let _ = sender.send(packet);
            }
            None => {
                debug!("no endpoint at {:?}, dropping {:?}", packet.dst(), packet);
            }
        }
    }
}

pub struct TestChannel {
    network: TestNetwork,
    inbound: tokio::sync::Mutex<mpsc::UnboundedReceiver<Packet>>,
}

impl TestChannel {
    async fn recv_one(&self) -> Result<Packet, ChannelError> {
        self.inbound
            .lock()
            .await
            .recv()
            .await
            .ok_or(ChannelError::Closed)
    }
}

#[async_trait]
impl Channel for TestChannel {
    async fn send(&self, packet: &Packet) -> Result<(), ChannelError> {
        self.network.dispatch(packet.clone());
        Ok(())
    }

    async fn recv(&self, timeout: Option<Duration>) -> Result<Packet, ChannelError> {
        match timeout {
            Some(timeout) => tokio::time::timeout(timeout, self.recv_one())
                .await
                .unwrap_or(Err(ChannelError::Timeout)),
            None => self.recv_one().await,
        }
    }
}

#[async_trait]
impl ChannelProvider for TestNetwork {
    async fn bind(&self, local: EndpointAddr) -> anyhow::Result<Arc<dyn Channel>> {
        let (sender, receiver) = mpsc::unbounded_channel();
        self.state
            .endpoints
            .lock()
            .expect("endpoint table mutex poisoned")
            .insert(local, sender);
        Ok(Arc::new(TestChannel {
            network: self.clone(),
            inbound: tokio::sync::Mutex::new(receiver),
        }))
    }
}
