//! Command surface: opcodes, request structs and responses.
//!
//! Each opcode maps to exactly one request struct. Responses carry the
//! fixed size a client must reserve for them; the broker rejects a command
//! whose output buffer is smaller before running it.

use std::net::SocketAddr;

use serde::{Deserialize, Serialize};

use crate::ids::{ContextId, MembershipId, SessionId};
use crate::types::{
    AddrInfo, ConnParam, Ece, EventRecord, JoinFlags, PathRecord, QpAttributes, QueryOption, RouteInfo,
};

/// Response sizes in bytes, as laid out by the client ABI.
pub mod sizes {
    pub const CREATE_ID: usize = 4;
    pub const DESTROY_ID: usize = 4;
    pub const MIGRATE: usize = 4;
    pub const QUERY_ROUTE: usize = 208;
    /// Older clients stop before the device index.
    pub const QUERY_ROUTE_MIN: usize = 200;
    pub const INIT_QP_ATTR: usize = 144;
    pub const EVENT: usize = 216;
    /// Older clients omit the trailing reserved word and ECE block.
    pub const EVENT_MIN: usize = EVENT - 4 - 8;
    pub const QUERY_ADDR: usize = 280;
    pub const QUERY_ADDR_MIN: usize = 272;
    pub const QUERY_PATH_HEADER: usize = 8;
    pub const PATH_RECORD: usize = 72;
}

/// Command opcodes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Opcode {
    CreateId,
    DestroyId,
    BindIp,
    ResolveIp,
    ResolveRoute,
    QueryRoute,
    Connect,
    Listen,
    Accept,
    Reject,
    Disconnect,
    InitQpAttr,
    GetEvent,
    GetOption,
    SetOption,
    Notify,
    JoinIpMcast,
    LeaveMcast,
    MigrateId,
    Query,
    Bind,
    ResolveAddr,
    JoinMcast,
}

impl Opcode {
    const ALL: [Opcode; 23] = [
        Self::CreateId,
        Self::DestroyId,
        Self::BindIp,
        Self::ResolveIp,
        Self::ResolveRoute,
        Self::QueryRoute,
        Self::Connect,
        Self::Listen,
        Self::Accept,
        Self::Reject,
        Self::Disconnect,
        Self::InitQpAttr,
        Self::GetEvent,
        Self::GetOption,
        Self::SetOption,
        Self::Notify,
        Self::JoinIpMcast,
        Self::LeaveMcast,
        Self::MigrateId,
        Self::Query,
        Self::Bind,
        Self::ResolveAddr,
        Self::JoinMcast,
    ];

    /// Decodes a numeric opcode.
    pub fn from_raw(raw: u32) -> Option<Self> {
        Self::ALL.get(raw as usize).copied()
    }

    pub fn raw(self) -> u32 {
        Self::ALL
            .iter()
            .position(|op| *op == self)
            .map(|i| i as u32)
            .unwrap_or(u32::MAX)
    }

    /// Minimum output buffer size this opcode needs.
    ///
    /// `Query` depends on the selected option and is checked by its handler.
    pub fn min_output(self) -> usize {
        match self {
            Self::CreateId | Self::JoinIpMcast | Self::JoinMcast => sizes::CREATE_ID,
            Self::DestroyId | Self::LeaveMcast => sizes::DESTROY_ID,
            Self::MigrateId => sizes::MIGRATE,
            Self::QueryRoute => sizes::QUERY_ROUTE_MIN,
            Self::InitQpAttr => sizes::INIT_QP_ATTR,
            Self::GetEvent => sizes::EVENT_MIN,
            _ => 0,
        }
    }
}

/// A context-addressed command with no further arguments.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContextRequest {
    pub id: ContextId,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CreateIdRequest {
    pub uid: u64,
    /// Raw port space.
    pub ps: u16,
    /// Raw queue-pair type, only consulted for the IB port space.
    #[serde(default)]
    pub qp_type: u8,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BindRequest {
    pub id: ContextId,
    pub addr: SocketAddr,
    #[serde(default)]
    pub reserved: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResolveAddrRequest {
    pub id: ContextId,
    #[serde(default)]
    pub src: Option<SocketAddr>,
    pub dst: SocketAddr,
    pub timeout_ms: u32,
    #[serde(default)]
    pub reserved: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResolveRouteRequest {
    pub id: ContextId,
    pub timeout_ms: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectRequest {
    pub id: ContextId,
    pub conn_param: ConnParam,
    #[serde(default)]
    pub ece: Option<Ece>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ListenRequest {
    pub id: ContextId,
    /// Non-positive values select the configured maximum.
    pub backlog: i32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AcceptRequest {
    pub id: ContextId,
    pub uid: u64,
    #[serde(default)]
    pub conn_param: ConnParam,
    #[serde(default)]
    pub ece: Option<Ece>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RejectRequest {
    pub id: ContextId,
    #[serde(default)]
    pub reason: u32,
    #[serde(default)]
    pub private_data: Vec<u8>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct InitQpAttrRequest {
    pub id: ContextId,
    pub qp_state: u8,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct GetEventRequest {
    /// Return `EAGAIN` instead of waiting on an empty queue.
    #[serde(default)]
    pub nonblock: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SetOptionRequest {
    pub id: ContextId,
    pub level: u32,
    pub optname: u32,
    pub optval: Vec<u8>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct NotifyRequest {
    pub id: ContextId,
    pub event: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct JoinIpMcastRequest {
    pub id: ContextId,
    pub uid: u64,
    pub addr: SocketAddr,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct JoinMcastRequest {
    pub id: ContextId,
    pub uid: u64,
    pub addr: SocketAddr,
    #[serde(default)]
    pub join_flags: JoinFlags,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct LeaveMcastRequest {
    pub id: MembershipId,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct MigrateRequest {
    pub id: ContextId,
    /// Session currently owning the context.
    pub session: SessionId,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueryRequest {
    pub id: ContextId,
    /// Raw query option (0 = addr, 1 = path, 2 = gid).
    pub option: u32,
}

/// Result of a successfully executed command.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Response {
    Empty,
    Created { id: ContextId },
    Joined { id: MembershipId },
    EventsReported { events_reported: u32 },
    Event(EventRecord),
    Route(RouteInfo),
    Addr(AddrInfo),
    Paths { paths: Vec<PathRecord> },
    QpAttr(QpAttributes),
}

impl Response {
    /// Full ABI size of this response.
    pub fn wire_size(&self) -> usize {
        match self {
            Self::Empty => 0,
            Self::Created { .. } | Self::Joined { .. } => sizes::CREATE_ID,
            Self::EventsReported { .. } => sizes::DESTROY_ID,
            Self::Event(_) => sizes::EVENT,
            Self::Route(_) => sizes::QUERY_ROUTE,
            Self::Addr(_) => sizes::QUERY_ADDR,
            Self::Paths { paths } => sizes::QUERY_PATH_HEADER + paths.len() * sizes::PATH_RECORD,
            Self::QpAttr(_) => sizes::INIT_QP_ATTR,
        }
    }
}

impl QueryOption {
    pub fn from_raw(raw: u32) -> Option<Self> {
        match raw {
            0 => Some(Self::Addr),
            1 => Some(Self::Path),
            2 => Some(Self::Gid),
            _ => None,
        }
    }

    /// Minimum output buffer size for this option.
    pub fn min_output(self) -> usize {
        match self {
            Self::Addr | Self::Gid => sizes::QUERY_ADDR_MIN,
            Self::Path => sizes::QUERY_PATH_HEADER,
        }
    }
}
