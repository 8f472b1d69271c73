use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::BytesMut;
use tokio::net::UdpSocket;
use tracing::{debug, info, warn};

use crate::channel::{Channel, ChannelError, ChannelProvider};
use crate::packet::{EndpointAddr, Packet};

const MAX_DATAGRAM: usize = 65_535;

/// A [Channel] over a real UDP socket, one socket per connection. The protocol port is used
///  as the UDP port, so the datagram's addressing and the packet's addressing coincide.
pub struct UdpChannel {
    local: EndpointAddr,
    socket: UdpSocket,
}

impl UdpChannel {
    pub async fn bind(local: EndpointAddr) -> anyhow::Result<UdpChannel> {
        let socket = UdpSocket::bind(local.socket_addr()).await?;
        info!("bound UDP channel to {:?}", local);
        Ok(UdpChannel { local, socket })
    }

    async fn recv_one(&self) -> Result<Packet, ChannelError> {
        let mut buf = vec![0u8; MAX_DATAGRAM];
        loop {
            let (len, from) = self.socket.recv_from(&mut buf).await?;

            let packet = match Packet::try_deser(&mut &buf[..len]) {
                Ok(packet) => packet,
                Err(_) => {
                    warn!("received unparseable datagram from {:?} - dropping", from);
                    continue;
                }
            };
            if packet.dst().port != self.local.port {
                debug!(
                    "received packet addressed to {:?}, myself is {:?} - dropping",
                    packet.dst(),
                    self.local
                );
                continue;
            }
            return Ok(packet);
        }
    }
}

#[async_trait]
impl Channel for UdpChannel {
    async fn send(&self, packet: &Packet) -> Result<(), ChannelError> {
        let mut buf = BytesMut::new();
        packet.ser(&mut buf);
        self.socket.send_to(&buf, packet.dst().socket_addr()).await?;
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

/// Binds [UdpChannel]s. This is the production [ChannelProvider]; tests inject
///  [crate::test_util::TestNetwork] instead.
pub struct UdpChannelProvider;

#[async_trait]
impl ChannelProvider for UdpChannelProvider {
    async fn bind(&self, local: EndpointAddr) -> anyhow::Result<Arc<dyn Channel>> {
        Ok(Arc::new(UdpChannel::bind(local).await?))
    }
}
