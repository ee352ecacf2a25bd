//! Core protocol types used across the wire.
//!
//! Port spaces, queue-pair types, event kinds and the payloads copied out of
//! collaborator callbacks into queued events.

use std::net::SocketAddr;

use serde::{Deserialize, Serialize};

/// Maximum private data carried by a connected-mode event.
pub const CONN_PRIVATE_DATA_MAX: usize = 56;

/// Maximum private data carried by a datagram-mode event.
pub const UD_PRIVATE_DATA_MAX: usize = 136;

/// Consumer-defined reject reason.
pub const REJECT_CONSUMER_DEFINED: u32 = 28;

/// Vendor-option-not-supported reject reason.
pub const REJECT_VENDOR_OPTION_NOT_SUPPORTED: u32 = 31;

/// Highest valid queue-pair state (`Error`).
pub const QP_STATE_MAX: u8 = 6;

/// Path record flags.
pub mod path_flags {
    pub const GMP: u32 = 1 << 0;
    pub const PRIMARY: u32 = 1 << 1;
    pub const ALTERNATE: u32 = 1 << 2;
    pub const OUTBOUND: u32 = 1 << 3;
    pub const INBOUND: u32 = 1 << 4;
    pub const INBOUND_REVERSE: u32 = 1 << 5;
    pub const BIDIRECTIONAL: u32 = OUTBOUND | INBOUND_REVERSE;
}

/// `set_option` levels and option names.
pub mod option {
    pub const LEVEL_ID: u32 = 0;
    pub const LEVEL_IB: u32 = 1;

    pub const ID_TOS: u32 = 0;
    pub const ID_REUSEADDR: u32 = 1;
    pub const ID_AFONLY: u32 = 2;
    pub const ID_ACK_TIMEOUT: u32 = 3;

    pub const IB_PATH: u32 = 1;

    /// Largest option value a client may pass.
    pub const OPTVAL_MAX: usize = 4096;
}

/// Port space an endpoint is created in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PortSpace {
    Ipoib,
    Ib,
    Tcp,
    Udp,
}

impl PortSpace {
    /// Decodes the raw port-space number used by clients.
    pub fn from_raw(raw: u16) -> Option<Self> {
        match raw {
            0x0002 => Some(Self::Ipoib),
            0x013f => Some(Self::Ib),
            0x0106 => Some(Self::Tcp),
            0x0111 => Some(Self::Udp),
            _ => None,
        }
    }

    pub fn raw(self) -> u16 {
        match self {
            Self::Ipoib => 0x0002,
            Self::Ib => 0x013f,
            Self::Tcp => 0x0106,
            Self::Udp => 0x0111,
        }
    }

    /// Resolves the queue-pair type implied by this port space.
    ///
    /// Only the IB port space honours the client's requested type.
    pub fn qp_type(self, requested: QpType) -> QpType {
        match self {
            Self::Tcp => QpType::Rc,
            Self::Udp | Self::Ipoib => QpType::Ud,
            Self::Ib => requested,
        }
    }
}

/// Queue-pair transport type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QpType {
    #[default]
    Rc,
    Uc,
    Ud,
    RawPacket,
    XrcIni,
    XrcTgt,
}

impl QpType {
    pub fn from_raw(raw: u8) -> Option<Self> {
        match raw {
            2 => Some(Self::Rc),
            3 => Some(Self::Uc),
            4 => Some(Self::Ud),
            8 => Some(Self::RawPacket),
            9 => Some(Self::XrcIni),
            10 => Some(Self::XrcTgt),
            _ => None,
        }
    }

    /// Returns true for datagram transports, whose events carry [`UdParam`].
    pub fn is_datagram(self) -> bool {
        matches!(self, Self::Ud)
    }
}

/// Parameters the broker passes when asking the collaborator for an endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct EndpointParams {
    pub port_space: PortSpace,
    pub qp_type: QpType,
}

/// Asynchronous lifecycle notification kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    AddrResolved,
    AddrError,
    RouteResolved,
    RouteError,
    ConnectRequest,
    ConnectResponse,
    ConnectError,
    Unreachable,
    Rejected,
    Established,
    Disconnected,
    DeviceRemoval,
    MulticastJoin,
    MulticastError,
    AddrChange,
    TimewaitExit,
}

impl EventKind {
    /// Numeric event code as reported to clients.
    pub fn code(self) -> u32 {
        match self {
            Self::AddrResolved => 0,
            Self::AddrError => 1,
            Self::RouteResolved => 2,
            Self::RouteError => 3,
            Self::ConnectRequest => 4,
            Self::ConnectResponse => 5,
            Self::ConnectError => 6,
            Self::Unreachable => 7,
            Self::Rejected => 8,
            Self::Established => 9,
            Self::Disconnected => 10,
            Self::DeviceRemoval => 11,
            Self::MulticastJoin => 12,
            Self::MulticastError => 13,
            Self::AddrChange => 14,
            Self::TimewaitExit => 15,
        }
    }

    /// Returns true for group notifications, which are attributed to a membership.
    pub fn is_multicast(self) -> bool {
        matches!(self, Self::MulticastJoin | Self::MulticastError)
    }
}

/// Enhanced connection establishment options.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Ece {
    pub vendor_id: u32,
    pub attr_mod: u32,
}

/// Connected-mode parameters, both as sent by clients and as reported in events.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ConnParam {
    pub private_data: Vec<u8>,
    pub responder_resources: u8,
    pub initiator_depth: u8,
    pub flow_control: u8,
    pub retry_count: u8,
    pub rnr_retry_count: u8,
    pub srq: u8,
    pub qp_num: u32,
    pub qkey: u32,
    /// Clients must set this for the parameters to be honoured.
    pub valid: bool,
}

/// Datagram-mode parameters reported in events.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct UdParam {
    pub private_data: Vec<u8>,
    pub qp_num: u32,
    pub qkey: u32,
}

/// Event payload copied from the collaborator callback.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum EventParam {
    Conn(ConnParam),
    Ud(UdParam),
}

impl Default for EventParam {
    fn default() -> Self {
        Self::Conn(ConnParam::default())
    }
}

impl EventParam {
    /// Clamps private data to what the fixed-size event record can carry.
    pub fn truncated(mut self) -> Self {
        match &mut self {
            Self::Conn(p) => p.private_data.truncate(CONN_PRIVATE_DATA_MAX),
            Self::Ud(p) => p.private_data.truncate(UD_PRIVATE_DATA_MAX),
        }
        self
    }
}

/// An event as handed to a client by `get_event`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventRecord {
    /// Correlation tag of the context (or membership) the event belongs to.
    pub uid: u64,
    /// Context id, membership id for group notifications, or the id of the
    /// freshly created context for a connect request.
    pub id: u32,
    pub event: EventKind,
    pub status: i32,
    pub param: EventParam,
    #[serde(default)]
    pub ece: Ece,
}

/// Membership flavour requested by `join_multicast`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JoinFlags {
    #[default]
    FullMember,
    SendOnlyFullMember,
}

impl JoinFlags {
    /// Join-state bit mask passed to the collaborator.
    pub fn join_state(self) -> u8 {
        match self {
            Self::FullMember => 1 << 0,
            Self::SendOnlyFullMember => 1 << 3,
        }
    }
}

/// Selector for the generic `query` command.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QueryOption {
    Addr,
    Path,
    Gid,
}

/// One resolved path.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct PathRecord {
    pub flags: u32,
    pub dgid: u128,
    pub sgid: u128,
    pub pkey: u16,
    pub mtu: u8,
    pub rate: u8,
    pub packet_life_time: u8,
}

impl PathRecord {
    /// Encoded size of one record.
    pub const SIZE: usize = 72;

    /// Decodes one record: flags (LE) at 0, then big-endian DGID at 8,
    /// SGID at 24, P_Key at 40, followed by MTU, rate and packet lifetime.
    pub fn from_bytes(buf: &[u8]) -> Option<Self> {
        if buf.len() < Self::SIZE {
            return None;
        }
        let u128_at = |off: usize| {
            let mut b = [0u8; 16];
            b.copy_from_slice(&buf[off..off + 16]);
            u128::from_be_bytes(b)
        };
        Some(Self {
            flags: u32::from_le_bytes([buf[0], buf[1], buf[2], buf[3]]),
            dgid: u128_at(8),
            sgid: u128_at(24),
            pkey: u16::from_be_bytes([buf[40], buf[41]]),
            mtu: buf[42],
            rate: buf[43],
            packet_life_time: buf[44],
        })
    }

    pub fn to_bytes(&self) -> [u8; Self::SIZE] {
        let mut buf = [0u8; Self::SIZE];
        buf[0..4].copy_from_slice(&self.flags.to_le_bytes());
        buf[8..24].copy_from_slice(&self.dgid.to_be_bytes());
        buf[24..40].copy_from_slice(&self.sgid.to_be_bytes());
        buf[40..42].copy_from_slice(&self.pkey.to_be_bytes());
        buf[42] = self.mtu;
        buf[43] = self.rate;
        buf[44] = self.packet_life_time;
        buf
    }

    /// True for the primary, bidirectional record of a GMP path set.
    /// The flags must match exactly.
    pub fn is_primary_bidirectional(&self) -> bool {
        self.flags == path_flags::GMP | path_flags::PRIMARY | path_flags::BIDIRECTIONAL
    }
}

/// Addressing and device information for an endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct AddrInfo {
    pub src: Option<SocketAddr>,
    pub dst: Option<SocketAddr>,
    pub node_guid: u64,
    pub device_index: u32,
    pub port_num: u8,
    pub pkey: u16,
}

/// Legacy route query result: addresses plus up to two paths.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct RouteInfo {
    pub addr: AddrInfo,
    pub paths: Vec<PathRecord>,
}

/// Result of `init_qp_attr`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct QpAttributes {
    pub qp_state: u8,
    pub attr_mask: u32,
    pub qp_access_flags: u32,
    pub pkey_index: u16,
    pub port_num: u8,
    pub qkey: u32,
    pub rq_psn: u32,
    pub sq_psn: u32,
    pub dest_qp_num: u32,
    pub path_mtu: u8,
    pub max_rd_atomic: u8,
    pub max_dest_rd_atomic: u8,
    pub min_rnr_timer: u8,
    pub timeout: u8,
    pub retry_cnt: u8,
    pub rnr_retry: u8,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn port_space_maps_to_qp_type() {
        assert_eq!(PortSpace::Tcp.qp_type(QpType::Ud), QpType::Rc);
        assert_eq!(PortSpace::Udp.qp_type(QpType::Rc), QpType::Ud);
        assert_eq!(PortSpace::Ipoib.qp_type(QpType::Rc), QpType::Ud);
        assert_eq!(PortSpace::Ib.qp_type(QpType::Uc), QpType::Uc);
    }

    #[test]
    fn port_space_raw_values_round_trip() {
        for ps in [PortSpace::Ipoib, PortSpace::Ib, PortSpace::Tcp, PortSpace::Udp] {
            assert_eq!(PortSpace::from_raw(ps.raw()), Some(ps));
        }
        assert_eq!(PortSpace::from_raw(0x9999), None);
    }

    #[test]
    fn join_flags_select_distinct_state_bits() {
        assert_eq!(JoinFlags::FullMember.join_state(), 0b0001);
        assert_eq!(JoinFlags::SendOnlyFullMember.join_state(), 0b1000);
    }

    #[test]
    fn event_param_truncates_private_data() {
        let param = EventParam::Conn(ConnParam {
            private_data: vec![7; 100],
            ..Default::default()
        })
        .truncated();
        match param {
            EventParam::Conn(p) => assert_eq!(p.private_data.len(), CONN_PRIVATE_DATA_MAX),
            EventParam::Ud(_) => panic!("Expected connected-mode param"),
        }
    }

    #[test]
    fn path_record_layout_places_gids_big_endian() {
        let rec = PathRecord {
            flags: path_flags::GMP | path_flags::PRIMARY | path_flags::BIDIRECTIONAL,
            dgid: 0xfe80 << 112 | 1,
            sgid: 2,
            pkey: 0xffff,
            mtu: 4,
            rate: 3,
            packet_life_time: 18,
        };
        let bytes = rec.to_bytes();
        assert_eq!(bytes[0], 0b10_1011);
        assert_eq!(&bytes[8..10], &[0xfe, 0x80]);
        assert_eq!(bytes[23], 1);
        assert_eq!(bytes[39], 2);
        assert_eq!(PathRecord::from_bytes(&bytes), Some(rec));
        assert!(rec.is_primary_bidirectional());
    }

    #[test]
    fn path_record_rejects_short_buffers() {
        assert_eq!(PathRecord::from_bytes(&[0; 71]), None);
        let outbound_only = PathRecord {
            flags: path_flags::GMP | path_flags::PRIMARY | path_flags::OUTBOUND,
            ..Default::default()
        };
        assert!(!outbound_only.is_primary_bidirectional());
    }

    #[test]
    fn event_codes_follow_reporting_order() {
        assert_eq!(EventKind::ConnectRequest.code(), 4);
        assert_eq!(EventKind::DeviceRemoval.code(), 11);
        assert!(EventKind::MulticastError.is_multicast());
        assert!(!EventKind::Established.is_multicast());
    }
}
