//! A connection-oriented, reliable-delivery transport protocol layered on an unreliable
//!  datagram network: three-way handshake, stop-and-wait data transfer with sequence and
//!  acknowledgment tracking, retransmission on timeout, and a FIN-based teardown handshake.
//!
//! The protocol moves one packet at a time per connection. The network underneath is only
//!  required to *maybe* deliver a packet; loss, corruption, duplication and reordering are
//!  all handled by the state machine in [connection], using nothing but local state and
//!  timeouts.
//!
//! The network seam is the [channel::Channel] trait: [channel::udp] runs the protocol over
//!  real UDP sockets, while [test_util] provides an in-process fabric with programmable
//!  fault injection for deterministic testing.

pub mod channel;
pub mod config;
pub mod connection;
pub mod packet;
pub mod port_registry;
mod retransmit;
pub mod test_util;
pub mod validation;
