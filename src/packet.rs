use std::fmt::{Debug, Formatter};
use std::net::{IpAddr, SocketAddr};

use anyhow::anyhow;
use bytes::{Buf, BufMut, Bytes, BytesMut};
use bytes_varint::try_get_fixed::TryGetFixedSupport;
use crc::Crc;
use num_enum::{IntoPrimitive, TryFromPrimitive};

/// Address of one protocol endpoint: an IP address plus a *protocol* port. For the UDP channel
///  the protocol port doubles as the UDP port, but the core never assumes that.
#[derive(Clone, Copy, Eq, PartialEq, Hash, Ord, PartialOrd)]
pub struct EndpointAddr {
    pub ip: IpAddr,
    pub port: u16,
}
impl Debug for EndpointAddr {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "[{}:{}]", self.ip, self.port)
    }
}
impl EndpointAddr {
    pub fn new(ip: IpAddr, port: u16) -> EndpointAddr {
        EndpointAddr { ip, port }
    }

    pub fn socket_addr(&self) -> SocketAddr {
        SocketAddr::new(self.ip, self.port)
    }

    pub fn ser(&self, buf: &mut impl BufMut) {
        match self.ip {
            IpAddr::V4(ip) => {
                buf.put_u8(4);
                buf.put_u32(ip.to_bits());
            }
            IpAddr::V6(ip) => {
                buf.put_u8(6);
                buf.put_u128(ip.to_bits());
            }
        }
        buf.put_u16(self.port);
    }

    pub fn try_deser(buf: &mut impl Buf) -> anyhow::Result<EndpointAddr> {
        let ip = match buf.try_get_u8()? {
            4 => IpAddr::from(buf.try_get_u32()?.to_be_bytes()),
            6 => IpAddr::from(buf.try_get_u128()?.to_be_bytes()),
            n => return Err(anyhow!("invalid address discriminator: {}", n)),
        };
        let port = buf.try_get_u16()?;
        Ok(EndpointAddr { ip, port })
    }
}
impl From<SocketAddr> for EndpointAddr {
    fn from(addr: SocketAddr) -> Self {
        EndpointAddr { ip: addr.ip(), port: addr.port() }
    }
}

/// Control flag of a packet - exactly one per packet, [PacketFlag::None] marking application
///  data. Serialized as a single byte.
#[derive(Debug, Clone, Copy, Eq, PartialEq, IntoPrimitive, TryFromPrimitive)]
#[repr(u8)]
pub enum PacketFlag {
    None = 0,
    Syn = 1,
    SynAck = 2,
    Ack = 3,
    Fin = 4,
}

#[derive(Clone, Copy, Eq, PartialEq)]
pub struct Checksum(pub u64);
impl Debug for Checksum {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:016x?}", self.0)
    }
}
impl Checksum {
    /// Digest over all logical packet fields. This is the 'packet container' side of the
    ///  contract: the protocol core never computes a checksum on its own, it only compares
    ///  a packet's stored checksum against this recomputation.
    pub fn new(
        flag: PacketFlag,
        seq_nr: u32,
        ack_nr: Option<u32>,
        src: EndpointAddr,
        dst: EndpointAddr,
        payload: &[u8],
    ) -> Checksum {
        let hasher = Crc::<u64>::new(&crc::CRC_64_REDIS);
        let mut digest = hasher.digest();

        digest.update(&[flag.into()]);
        digest.update(&seq_nr.to_le_bytes());
        match ack_nr {
            Some(ack_nr) => {
                digest.update(&[1]);
                digest.update(&ack_nr.to_le_bytes());
            }
            None => digest.update(&[0]),
        }
        for addr in [src, dst] {
            match addr.ip {
                IpAddr::V4(ip) => digest.update(&ip.octets()),
                IpAddr::V6(ip) => digest.update(&ip.octets()),
            }
            digest.update(&addr.port.to_le_bytes());
        }
        digest.update(payload);

        Checksum(digest.finalize())
    }
}

/// A single wire-level message. Packets are immutable once constructed: the checksum is stamped
///  by the constructor, and after that there are only read accessors. What goes on the wire is
///  what validation sees on the other side.
///
/// Wire layout (all integers big-endian):
///
/// ```ascii
/// 0:  stored checksum (u64) - covers everything after this field
/// 8:  flag (u8)
/// 9:  ack present (u8: 0 or 1)
/// 10: seq_nr (u32)
/// 14: ack_nr (u32, zero when not present)
/// 18: src address (1 byte discriminator + 4 or 16 bytes IP + u16 port)
/// *:  dst address (same encoding)
/// *:  payload length (u32), payload bytes
/// ```
#[derive(Clone, Eq, PartialEq)]
pub struct Packet {
    flag: PacketFlag,
    seq_nr: u32,
    ack_nr: Option<u32>,
    src: EndpointAddr,
    dst: EndpointAddr,
    payload: Bytes,
    checksum: Checksum,
}
impl Debug for Packet {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "Packet{{{:?} seq={} ack={:?} {:?}->{:?} payload={}b}}",
            self.flag,
            self.seq_nr,
            self.ack_nr,
            self.src,
            self.dst,
            self.payload.len()
        )
    }
}

impl Packet {
    fn new(
        flag: PacketFlag,
        seq_nr: u32,
        ack_nr: Option<u32>,
        src: EndpointAddr,
        dst: EndpointAddr,
        payload: Bytes,
    ) -> Packet {
        let checksum = Checksum::new(flag, seq_nr, ack_nr, src, dst, &payload);
        Packet { flag, seq_nr, ack_nr, src, dst, payload, checksum }
    }

    pub fn syn(src: EndpointAddr, dst: EndpointAddr, seq_nr: u32) -> Packet {
        Self::new(PacketFlag::Syn, seq_nr, None, src, dst, Bytes::new())
    }

    pub fn syn_ack(src: EndpointAddr, dst: EndpointAddr, seq_nr: u32, ack_nr: u32) -> Packet {
        Self::new(PacketFlag::SynAck, seq_nr, Some(ack_nr), src, dst, Bytes::new())
    }

    pub fn ack(src: EndpointAddr, dst: EndpointAddr, seq_nr: u32, ack_nr: u32) -> Packet {
        Self::new(PacketFlag::Ack, seq_nr, Some(ack_nr), src, dst, Bytes::new())
    }

    pub fn fin(src: EndpointAddr, dst: EndpointAddr, seq_nr: u32) -> Packet {
        Self::new(PacketFlag::Fin, seq_nr, None, src, dst, Bytes::new())
    }

    pub fn data(src: EndpointAddr, dst: EndpointAddr, seq_nr: u32, payload: Bytes) -> Packet {
        Self::new(PacketFlag::None, seq_nr, None, src, dst, payload)
    }

    /// Reassemble a packet from its wire-level parts, keeping the checksum that arrived on the
    ///  wire rather than recomputing it. In-transit corruption stays visible to
    ///  [Packet::is_checksum_valid].
    pub(crate) fn from_wire_parts(
        flag: PacketFlag,
        seq_nr: u32,
        ack_nr: Option<u32>,
        src: EndpointAddr,
        dst: EndpointAddr,
        payload: Bytes,
        stored_checksum: Checksum,
    ) -> Packet {
        Packet { flag, seq_nr, ack_nr, src, dst, payload, checksum: stored_checksum }
    }

    pub fn flag(&self) -> PacketFlag {
        self.flag
    }

    pub fn seq_nr(&self) -> u32 {
        self.seq_nr
    }

    pub fn ack_nr(&self) -> Option<u32> {
        self.ack_nr
    }

    pub fn src(&self) -> EndpointAddr {
        self.src
    }

    pub fn dst(&self) -> EndpointAddr {
        self.dst
    }

    pub fn payload(&self) -> &Bytes {
        &self.payload
    }

    pub fn checksum(&self) -> Checksum {
        self.checksum
    }

    /// Compare the stored checksum against a recomputation over the same fields.
    pub fn is_checksum_valid(&self) -> bool {
        self.checksum
            == Checksum::new(self.flag, self.seq_nr, self.ack_nr, self.src, self.dst, &self.payload)
    }

    pub fn ser(&self, buf: &mut BytesMut) {
        buf.put_u64(self.checksum.0);
        buf.put_u8(self.flag.into());
        match self.ack_nr {
            Some(ack_nr) => {
                buf.put_u8(1);
                buf.put_u32(self.seq_nr);
                buf.put_u32(ack_nr);
            }
            None => {
                buf.put_u8(0);
                buf.put_u32(self.seq_nr);
                buf.put_u32(0);
            }
        }
        self.src.ser(buf);
        self.dst.ser(buf);
        buf.put_u32(self.payload.len() as u32);
        buf.put_slice(&self.payload);
    }

    pub fn try_deser(buf: &mut impl Buf) -> anyhow::Result<Packet> {
        let stored_checksum = Checksum(buf.try_get_u64()?);
        let flag = PacketFlag::try_from(buf.try_get_u8()?)
            .map_err(|e| anyhow!("invalid packet flag: {}", e))?;
        let has_ack = match buf.try_get_u8()? {
            0 => false,
            1 => true,
            n => return Err(anyhow!("invalid ack presence marker: {}", n)),
        };
        let seq_nr = buf.try_get_u32()?;
        let raw_ack = buf.try_get_u32()?;
        let ack_nr = has_ack.then_some(raw_ack);

        let src = EndpointAddr::try_deser(buf)?;
        let dst = EndpointAddr::try_deser(buf)?;

        let payload_len = buf.try_get_u32()? as usize;
        if buf.remaining() < payload_len {
            return Err(anyhow!(
                "payload length field {} exceeds remaining buffer {}",
                payload_len,
                buf.remaining()
            ));
        }
        let payload = buf.copy_to_bytes(payload_len);

        Ok(Packet::from_wire_parts(flag, seq_nr, ack_nr, src, dst, payload, stored_checksum))
    }
}
