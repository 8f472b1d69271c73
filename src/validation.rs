use tracing::debug;

use crate::connection::ConnectionState;
use crate::packet::{Packet, PacketFlag};

/// How strictly an acknowledgment number must match the most recently sent sequence number.
///  The observed protocol versions disagree on this, so both variants are first-class (see
///  DESIGN.md).
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum AckMatch {
    /// `ack_nr == next_sequence_no - 1`: the ack refers to exactly the most recently sent
    ///  packet.
    Exact,
    /// `ack_nr >= next_sequence_no - 1`: anything at or beyond the last sent packet is
    ///  accepted.
    AtLeastLastSent,
}

/// The correctness gate for inbound packets, evaluated against the connection's current state.
///
/// The observed protocol versions implement two different gates; rather than baking one of
///  them in, the gate is a sum type and the canonical [ValidationPolicy::Full] variant is the
///  default. [ValidationPolicy::ChecksumOnly] reproduces the early draft that only checked
///  for in-transit corruption.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum ValidationPolicy {
    /// Flag-for-state gate, checksum, ack-number rule, sequence continuity.
    Full { ack_match: AckMatch },
    /// Checksum comparison only.
    ChecksumOnly,
}

impl Default for ValidationPolicy {
    fn default() -> Self {
        ValidationPolicy::Full { ack_match: AckMatch::Exact }
    }
}

impl ValidationPolicy {
    /// Is `packet` acceptable right now? A `false` verdict is never escalated: the packet is
    ///  discarded and the state machine keeps waiting or retries.
    pub(crate) fn is_valid(
        &self,
        state: ConnectionState,
        next_sequence_no: u32,
        last_valid: Option<&Packet>,
        packet: &Packet,
    ) -> bool {
        let ack_match = match self {
            ValidationPolicy::Full { ack_match } => *ack_match,
            ValidationPolicy::ChecksumOnly => {
                if !packet.is_checksum_valid() {
                    debug!("checksum mismatch on {:?} - invalid", packet);
                    return false;
                }
                return true;
            }
        };

        if !Self::flag_allowed_in_state(state, packet.flag()) {
            debug!("flag {:?} not acceptable in state {:?} - invalid", packet.flag(), state);
            return false;
        }

        if !packet.is_checksum_valid() {
            debug!("checksum mismatch on {:?} - invalid", packet);
            return false;
        }

        if packet.flag() == PacketFlag::Ack {
            let last_sent = next_sequence_no.wrapping_sub(1);
            let acceptable = match (packet.ack_nr(), ack_match) {
                (Some(ack_nr), AckMatch::Exact) => ack_nr == last_sent,
                (Some(ack_nr), AckMatch::AtLeastLastSent) => ack_nr >= last_sent,
                (None, _) => false,
            };
            if !acceptable {
                debug!(
                    "ack number {:?} does not acknowledge last sent seq {} - invalid",
                    packet.ack_nr(),
                    last_sent
                );
                return false;
            }
        }

        if let Some(last_valid) = last_valid {
            if packet.seq_nr() != last_valid.seq_nr() + 1 {
                debug!(
                    "sequence discontinuity: expected {}, received {} - invalid",
                    last_valid.seq_nr() + 1,
                    packet.seq_nr()
                );
                return false;
            }
        }

        true
    }

    /// The flag each state expects - the state machine awaits at most one kind of reply at a
    ///  time, everything else is protocol noise.
    fn flag_allowed_in_state(state: ConnectionState, flag: PacketFlag) -> bool {
        match state {
            ConnectionState::SynSent => flag == PacketFlag::SynAck,
            ConnectionState::SynRcvd => flag == PacketFlag::Ack,
            ConnectionState::Listen => flag == PacketFlag::Syn,
            ConnectionState::FinWait1 => flag == PacketFlag::Ack,
            ConnectionState::FinWait2 => flag == PacketFlag::Fin,
            ConnectionState::LastAck => flag == PacketFlag::Ack,
            ConnectionState::Established => {
                flag != PacketFlag::Syn && flag != PacketFlag::SynAck
            }
            ConnectionState::Closed
            | ConnectionState::CloseWait
            | ConnectionState::TimeWait => true,
        }
    }
}

#[cfg(test)]
mod test {
    use bytes::Bytes;
    use rstest::rstest;

    use crate::packet::EndpointAddr;

    use super::*;

    fn addr(port: u16) -> EndpointAddr {
        EndpointAddr::new("127.0.0.1".parse().unwrap(), port)
    }

    fn packet(flag: PacketFlag, seq_nr: u32, ack_nr: Option<u32>) -> Packet {
        match (flag, ack_nr) {
            (PacketFlag::Syn, None) => Packet::syn(addr(1), addr(2), seq_nr),
            (PacketFlag::SynAck, Some(ack)) => Packet::syn_ack(addr(1), addr(2), seq_nr, ack),
            (PacketFlag::Ack, Some(ack)) => Packet::ack(addr(1), addr(2), seq_nr, ack),
            (PacketFlag::Fin, None) => Packet::fin(addr(1), addr(2), seq_nr),
            (PacketFlag::None, None) => {
                Packet::data(addr(1), addr(2), seq_nr, Bytes::from_static(b"x"))
            }
            _ => panic!("inconsistent flag/ack combination in test setup"),
        }
    }

    fn full() -> ValidationPolicy {
        ValidationPolicy::Full { ack_match: AckMatch::Exact }
    }

    #[rstest]
    #[case::syn_sent_wants_syn_ack(ConnectionState::SynSent, PacketFlag::SynAck, true)]
    #[case::syn_sent_rejects_ack(ConnectionState::SynSent, PacketFlag::Ack, false)]
    #[case::syn_sent_rejects_data(ConnectionState::SynSent, PacketFlag::None, false)]
    #[case::syn_rcvd_wants_ack(ConnectionState::SynRcvd, PacketFlag::Ack, true)]
    #[case::syn_rcvd_rejects_syn(ConnectionState::SynRcvd, PacketFlag::Syn, false)]
    #[case::listen_wants_syn(ConnectionState::Listen, PacketFlag::Syn, true)]
    #[case::listen_rejects_data(ConnectionState::Listen, PacketFlag::None, false)]
    #[case::fin_wait_1_wants_ack(ConnectionState::FinWait1, PacketFlag::Ack, true)]
    #[case::fin_wait_1_rejects_fin(ConnectionState::FinWait1, PacketFlag::Fin, false)]
    #[case::fin_wait_2_wants_fin(ConnectionState::FinWait2, PacketFlag::Fin, true)]
    #[case::fin_wait_2_rejects_ack(ConnectionState::FinWait2, PacketFlag::Ack, false)]
    #[case::last_ack_wants_ack(ConnectionState::LastAck, PacketFlag::Ack, true)]
    #[case::last_ack_rejects_fin(ConnectionState::LastAck, PacketFlag::Fin, false)]
    #[case::established_rejects_syn(ConnectionState::Established, PacketFlag::Syn, false)]
    #[case::established_rejects_syn_ack(ConnectionState::Established, PacketFlag::SynAck, false)]
    #[case::established_accepts_data(ConnectionState::Established, PacketFlag::None, true)]
    #[case::established_accepts_ack(ConnectionState::Established, PacketFlag::Ack, true)]
    #[case::established_accepts_fin(ConnectionState::Established, PacketFlag::Fin, true)]
    fn test_flag_gate(
        #[case] state: ConnectionState,
        #[case] flag: PacketFlag,
        #[case] expected: bool,
    ) {
        // ack numbers chosen to satisfy the Exact rule so only the flag gate is under test
        let ack_nr = matches!(flag, PacketFlag::Ack | PacketFlag::SynAck).then_some(9);
        let p = packet(flag, 100, ack_nr);
        assert_eq!(full().is_valid(state, 10, None, &p), expected);
    }

    #[rstest]
    #[case::syn_sent(ConnectionState::SynSent)]
    #[case::listen(ConnectionState::Listen)]
    #[case::established(ConnectionState::Established)]
    #[case::fin_wait_2(ConnectionState::FinWait2)]
    fn test_checksum_rejection_in_any_state(#[case] state: ConnectionState) {
        let expected_flag = match state {
            ConnectionState::SynSent => PacketFlag::SynAck,
            ConnectionState::Listen => PacketFlag::Syn,
            ConnectionState::FinWait2 => PacketFlag::Fin,
            _ => PacketFlag::None,
        };
        let ack_nr = (expected_flag == PacketFlag::SynAck).then_some(9);
        let p = packet(expected_flag, 100, ack_nr);
        let corrupted = crate::test_util::corrupt(&p);

        assert!(full().is_valid(state, 10, None, &p));
        assert!(!full().is_valid(state, 10, None, &corrupted));
    }

    #[rstest]
    #[case::exact_match(AckMatch::Exact, 9, true)]
    #[case::exact_stale(AckMatch::Exact, 8, false)]
    #[case::exact_future(AckMatch::Exact, 10, false)]
    #[case::tolerant_match(AckMatch::AtLeastLastSent, 9, true)]
    #[case::tolerant_stale(AckMatch::AtLeastLastSent, 8, false)]
    #[case::tolerant_future(AckMatch::AtLeastLastSent, 10, true)]
    fn test_ack_number_rule(#[case] ack_match: AckMatch, #[case] ack_nr: u32, #[case] expected: bool) {
        let policy = ValidationPolicy::Full { ack_match };
        let p = packet(PacketFlag::Ack, 100, Some(ack_nr));
        assert_eq!(policy.is_valid(ConnectionState::Established, 10, None, &p), expected);
    }

    #[rstest]
    #[case::successor(101, true)]
    #[case::duplicate(100, false)]
    #[case::gap(103, false)]
    #[case::stale(99, false)]
    fn test_sequence_continuity(#[case] seq_nr: u32, #[case] expected: bool) {
        let baseline = packet(PacketFlag::None, 100, None);
        let p = packet(PacketFlag::None, seq_nr, None);
        assert_eq!(
            full().is_valid(ConnectionState::Established, 10, Some(&baseline), &p),
            expected
        );
    }

    #[test]
    fn test_no_baseline_accepts_any_sequence_number() {
        let p = packet(PacketFlag::None, 7777, None);
        assert!(full().is_valid(ConnectionState::Established, 10, None, &p));
    }

    /// The two observed protocol versions genuinely diverge here: the early draft's
    ///  checksum-only gate accepts packets the full gate rejects.
    #[rstest]
    #[case::syn_while_established(packet(PacketFlag::Syn, 101, None))]
    #[case::stale_ack(packet(PacketFlag::Ack, 101, Some(3)))]
    #[case::sequence_gap(packet(PacketFlag::None, 105, None))]
    fn test_checksum_only_policy_accepts_what_full_gate_rejects(#[case] p: Packet) {
        let baseline = packet(PacketFlag::None, 100, None);
        assert!(!full().is_valid(ConnectionState::Established, 10, Some(&baseline), &p));
        assert!(ValidationPolicy::ChecksumOnly.is_valid(
            ConnectionState::Established,
            10,
            Some(&baseline),
            &p
        ));
    }
}
