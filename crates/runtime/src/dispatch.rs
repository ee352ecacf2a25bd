//! Opcode dispatch.
//!
//! A [`Command`] is checked in a fixed order before anything runs: the
//! opcode must be known, the output buffer must fit the response, and the
//! input must decode into the opcode's request struct.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::trace;
use ucm_protocol::{
	AcceptRequest, BindRequest, ConnectRequest, ContextRequest, CreateIdRequest, GetEventRequest,
	InitQpAttrRequest, JoinFlags, JoinIpMcastRequest, JoinMcastRequest, LeaveMcastRequest, ListenRequest,
	MigrateRequest, NotifyRequest, Opcode, PortSpace, QpType, QueryOption, QueryRequest, RejectRequest,
	ResolveAddrRequest, ResolveRouteRequest, Response, SetOptionRequest, sizes,
};

use crate::error::{Error, Result};
use crate::session::Session;

/// One client command: raw opcode, JSON input and the output buffer size
/// the client reserved.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Command {
	pub opcode: u32,
	#[serde(default)]
	pub input: Value,
	pub out_len: usize,
}

impl Command {
	pub fn new(opcode: Opcode, input: Value, out_len: usize) -> Self {
		Self {
			opcode: opcode.raw(),
			input,
			out_len,
		}
	}
}

fn decode<T: DeserializeOwned>(input: Value) -> Result<T> {
	serde_json::from_value(input).map_err(|e| Error::InvalidArgument(e.to_string()))
}

fn no_reserved(reserved: u32) -> Result<()> {
	if reserved != 0 {
		return Err(Error::InvalidArgument("reserved field must be zero".into()));
	}
	Ok(())
}

impl Session {
	/// Executes one command against this session.
	pub async fn execute(&self, command: Command) -> Result<Response> {
		let Command { opcode: raw, input, out_len } = command;
		let opcode = Opcode::from_raw(raw)
			.filter(|op| *op != Opcode::GetOption)
			.ok_or_else(|| Error::Unsupported(format!("opcode {raw}")))?;
		let needed = opcode.min_output();
		if out_len < needed {
			return Err(Error::InsufficientSpace {
				needed,
				available: out_len,
			});
		}
		trace!(target = "ucm.session", session = %self.id(), ?opcode, "execute");

		match opcode {
			Opcode::CreateId => {
				let req: CreateIdRequest = decode(input)?;
				let port_space = PortSpace::from_raw(req.ps)
					.ok_or_else(|| Error::InvalidArgument(format!("port space {:#x}", req.ps)))?;
				let qp_type = match QpType::from_raw(req.qp_type) {
					Some(qp_type) => qp_type,
					None if port_space != PortSpace::Ib => QpType::default(),
					None => return Err(Error::InvalidArgument(format!("qp type {}", req.qp_type))),
				};
				let id = self.create_id(req.uid, port_space, qp_type)?;
				Ok(Response::Created { id })
			}
			Opcode::DestroyId => {
				let req: ContextRequest = decode(input)?;
				let events_reported = self.destroy_id(req.id).await?;
				Ok(Response::EventsReported { events_reported })
			}
			Opcode::BindIp | Opcode::Bind => {
				let req: BindRequest = decode(input)?;
				if opcode == Opcode::Bind {
					no_reserved(req.reserved)?;
				}
				self.bind(req.id, req.addr)?;
				Ok(Response::Empty)
			}
			Opcode::ResolveIp | Opcode::ResolveAddr => {
				let req: ResolveAddrRequest = decode(input)?;
				if opcode == Opcode::ResolveAddr {
					no_reserved(req.reserved)?;
				}
				self.resolve_addr(req.id, req.src, req.dst, req.timeout_ms)?;
				Ok(Response::Empty)
			}
			Opcode::ResolveRoute => {
				let req: ResolveRouteRequest = decode(input)?;
				self.resolve_route(req.id, req.timeout_ms)?;
				Ok(Response::Empty)
			}
			Opcode::QueryRoute => {
				let req: ContextRequest = decode(input)?;
				Ok(Response::Route(self.query_route(req.id)?))
			}
			Opcode::Connect => {
				let req: ConnectRequest = decode(input)?;
				self.connect(req.id, &req.conn_param, req.ece)?;
				Ok(Response::Empty)
			}
			Opcode::Listen => {
				let req: ListenRequest = decode(input)?;
				self.listen(req.id, req.backlog)?;
				Ok(Response::Empty)
			}
			Opcode::Accept => {
				let req: AcceptRequest = decode(input)?;
				self.accept(req.id, req.uid, &req.conn_param, req.ece)?;
				Ok(Response::Empty)
			}
			Opcode::Reject => {
				let req: RejectRequest = decode(input)?;
				self.reject(req.id, req.reason, &req.private_data)?;
				Ok(Response::Empty)
			}
			Opcode::Disconnect => {
				let req: ContextRequest = decode(input)?;
				self.disconnect(req.id)?;
				Ok(Response::Empty)
			}
			Opcode::InitQpAttr => {
				let req: InitQpAttrRequest = decode(input)?;
				Ok(Response::QpAttr(self.init_qp_attr(req.id, req.qp_state)?))
			}
			Opcode::GetEvent => {
				let req: GetEventRequest = if input.is_null() {
					GetEventRequest::default()
				} else {
					decode(input)?
				};
				Ok(Response::Event(self.next_event(!req.nonblock).await?))
			}
			Opcode::SetOption => {
				let req: SetOptionRequest = decode(input)?;
				self.set_option(req.id, req.level, req.optname, &req.optval)?;
				Ok(Response::Empty)
			}
			Opcode::Notify => {
				let req: NotifyRequest = decode(input)?;
				self.notify(req.id, req.event)?;
				Ok(Response::Empty)
			}
			Opcode::JoinIpMcast => {
				let req: JoinIpMcastRequest = decode(input)?;
				let id = self.join_multicast(req.id, req.uid, req.addr, JoinFlags::FullMember)?;
				Ok(Response::Joined { id })
			}
			Opcode::JoinMcast => {
				let req: JoinMcastRequest = decode(input)?;
				let id = self.join_multicast(req.id, req.uid, req.addr, req.join_flags)?;
				Ok(Response::Joined { id })
			}
			Opcode::LeaveMcast => {
				let req: LeaveMcastRequest = decode(input)?;
				let events_reported = self.leave_multicast(req.id)?;
				Ok(Response::EventsReported { events_reported })
			}
			Opcode::MigrateId => {
				let req: MigrateRequest = decode(input)?;
				let events_reported = self.migrate_from(req.session, req.id)?;
				Ok(Response::EventsReported { events_reported })
			}
			Opcode::Query => {
				let req: QueryRequest = decode(input)?;
				let option = QueryOption::from_raw(req.option)
					.ok_or_else(|| Error::Unsupported(format!("query option {}", req.option)))?;
				let needed = option.min_output();
				if out_len < needed {
					return Err(Error::InsufficientSpace {
						needed,
						available: out_len,
					});
				}
				match option {
					QueryOption::Addr => Ok(Response::Addr(self.query_addr(req.id)?)),
					QueryOption::Gid => Ok(Response::Addr(self.query_gid(req.id)?)),
					QueryOption::Path => {
						let mut paths = self.query_path(req.id)?;
						paths.truncate((out_len - sizes::QUERY_PATH_HEADER) / sizes::PATH_RECORD);
						Ok(Response::Paths { paths })
					}
				}
			}
			Opcode::GetOption => Err(Error::Unsupported("get_option".into())),
		}
	}
}
