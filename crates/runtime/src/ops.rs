//! Passthrough operations.
//!
//! Every operation acquires the context by id, drives the endpoint under
//! the context's lock and releases the reference on every path. No call
//! into the connection manager happens under the handle table lock.

use std::net::SocketAddr;
use std::sync::{Arc, Weak};

use tracing::debug;
use ucm_protocol::{
	AddrInfo, CONN_PRIVATE_DATA_MAX, ConnParam, ContextId, Ece, EndpointParams, EventKind, PathRecord,
	PortSpace, QP_STATE_MAX, QpAttributes, QpType, REJECT_CONSUMER_DEFINED,
	REJECT_VENDOR_OPTION_NOT_SUPPORTED, RouteInfo, option,
};

use crate::context::Context;
use crate::error::{Error, Result};
use crate::manager::{CmEvent, EventSink, IdOption, Route};
use crate::session::Session;

impl Session {
	/// Creates a context with correlation tag `uid`.
	///
	/// The endpoint is created first; if no id can be allocated for it, it
	/// is destroyed before the error is returned.
	pub fn create_id(&self, uid: u64, port_space: PortSpace, qp_type: QpType) -> Result<ContextId> {
		let shared = &self.shared;
		shared.ensure_open()?;
		let broker = &shared.broker;

		let route = Route::new(Weak::new());
		let sink = EventSink::new(Arc::downgrade(broker), Arc::clone(&route));
		let params = EndpointParams {
			port_space,
			qp_type: port_space.qp_type(qp_type),
		};
		let endpoint = broker.manager.create_endpoint(params, sink)?;

		let id = match broker.contexts.reserve() {
			Ok(id) => id,
			Err(e) => {
				endpoint.destroy();
				return Err(e);
			}
		};
		let ctx = Arc::new(Context::new(ContextId(id), shared, endpoint, Arc::clone(&route), Some(uid)));
		route.retarget(&ctx);

		let mut state = shared.state.lock();
		if state.closed {
			drop(state);
			broker.contexts.erase(id);
			route.detach();
			if let Some(endpoint) = ctx.take_endpoint() {
				endpoint.destroy();
			}
			return Err(Error::SessionClosed);
		}
		state.contexts.push(Arc::clone(&ctx));
		broker.contexts.publish(id, ctx);
		drop(state);

		debug!(target = "ucm.session", session = %shared.id, id, ?port_space, "created context");
		Ok(ContextId(id))
	}

	pub fn bind(&self, id: ContextId, addr: SocketAddr) -> Result<()> {
		let ctx = self.shared.acquire(id)?;
		ctx.with_endpoint(|ep| ep.bind(addr))
	}

	pub fn resolve_addr(&self, id: ContextId, src: Option<SocketAddr>, dst: SocketAddr, timeout_ms: u32) -> Result<()> {
		let ctx = self.shared.acquire(id)?;
		ctx.with_endpoint(|ep| ep.resolve_addr(src, dst, timeout_ms))
	}

	pub fn resolve_route(&self, id: ContextId, timeout_ms: u32) -> Result<()> {
		let ctx = self.shared.acquire(id)?;
		ctx.with_device(|ep| ep.resolve_route(timeout_ms))
	}

	/// Legacy route query: addresses plus the resolved paths.
	pub fn query_route(&self, id: ContextId) -> Result<RouteInfo> {
		let ctx = self.shared.acquire(id)?;
		ctx.with_endpoint(|ep| Ok(ep.query_route()))
	}

	pub fn query_addr(&self, id: ContextId) -> Result<AddrInfo> {
		let ctx = self.shared.acquire(id)?;
		ctx.with_endpoint(|ep| Ok(ep.query_addr()))
	}

	pub fn query_path(&self, id: ContextId) -> Result<Vec<PathRecord>> {
		let ctx = self.shared.acquire(id)?;
		ctx.with_endpoint(|ep| Ok(ep.query_path()))
	}

	pub fn query_gid(&self, id: ContextId) -> Result<AddrInfo> {
		let ctx = self.shared.acquire(id)?;
		ctx.with_endpoint(|ep| Ok(ep.query_gid()))
	}

	pub fn connect(&self, id: ContextId, param: &ConnParam, ece: Option<Ece>) -> Result<()> {
		if !param.valid {
			return Err(Error::InvalidArgument("connection parameters not marked valid".into()));
		}
		let param = client_param(param)?;
		let ctx = self.shared.acquire(id)?;
		ctx.with_device(|ep| ep.connect(&param, ece.unwrap_or_default()))
	}

	/// Starts listening. `backlog` is clamped to the broker's ceiling; zero
	/// or negative selects the ceiling.
	pub fn listen(&self, id: ContextId, backlog: i32) -> Result<()> {
		let ctx = self.shared.acquire(id)?;
		let max = self.shared.broker.max_backlog();
		let effective = match u32::try_from(backlog) {
			Ok(b) if b > 0 && b < max => b,
			_ => max,
		};
		ctx.set_backlog(i32::try_from(effective).unwrap_or(i32::MAX));
		debug!(target = "ucm.session", %id, backlog = effective, "listen");
		ctx.with_endpoint(|ep| ep.listen(effective))
	}

	/// Accepts an inbound connection.
	///
	/// With valid parameters the correlation tag `uid` is committed once
	/// the endpoint accepted, under the session lock so event delivery sees
	/// either the old state or the committed tag.
	pub fn accept(&self, id: ContextId, uid: u64, param: &ConnParam, ece: Option<Ece>) -> Result<()> {
		let ctx = self.shared.acquire(id)?;
		let ece = ece.unwrap_or_default();
		if !param.valid {
			return ctx.with_device(|ep| ep.accept(None, ece));
		}
		let param = client_param(param)?;
		let _state = self.shared.state.lock();
		ctx.with_device(|ep| ep.accept(Some(&param), ece))?;
		ctx.set_uid(uid);
		Ok(())
	}

	/// Rejects an inbound connection. A zero `reason` means consumer-defined.
	pub fn reject(&self, id: ContextId, reason: u32, private_data: &[u8]) -> Result<()> {
		let reason = if reason == 0 { REJECT_CONSUMER_DEFINED } else { reason };
		if reason != REJECT_CONSUMER_DEFINED && reason != REJECT_VENDOR_OPTION_NOT_SUPPORTED {
			return Err(Error::InvalidArgument(format!("reject reason {reason}")));
		}
		let ctx = self.shared.acquire(id)?;
		ctx.with_device(|ep| ep.reject(private_data, reason))
	}

	pub fn disconnect(&self, id: ContextId) -> Result<()> {
		let ctx = self.shared.acquire(id)?;
		ctx.with_device(|ep| ep.disconnect())
	}

	pub fn init_qp_attr(&self, id: ContextId, qp_state: u8) -> Result<QpAttributes> {
		if qp_state > QP_STATE_MAX {
			return Err(Error::InvalidArgument(format!("qp state {qp_state}")));
		}
		let ctx = self.shared.acquire(id)?;
		ctx.with_device(|ep| ep.init_qp_attr(qp_state))
	}

	pub fn notify(&self, id: ContextId, event: u32) -> Result<()> {
		let ctx = self.shared.acquire(id)?;
		ctx.with_device(|ep| ep.notify(event))
	}

	/// Sets an option on the context's endpoint.
	///
	/// A successful path override reports `RouteResolved` through the
	/// regular delivery path.
	pub fn set_option(&self, id: ContextId, level: u32, optname: u32, optval: &[u8]) -> Result<()> {
		if optval.len() > option::OPTVAL_MAX {
			return Err(Error::InvalidArgument(format!("option value of {} bytes", optval.len())));
		}
		let ctx = self.shared.acquire(id)?;
		match level {
			option::LEVEL_ID => {
				let opt = id_option(optname, optval)?;
				ctx.with_endpoint(|ep| ep.set_option(opt))
			}
			option::LEVEL_IB if optname == option::IB_PATH => {
				let path = primary_path(optval)?;
				ctx.with_device(|ep| ep.set_ib_path(&path))?;
				EventSink::new(Arc::downgrade(&self.shared.broker), Arc::clone(ctx.route()))
					.deliver(CmEvent::new(EventKind::RouteResolved));
				Ok(())
			}
			option::LEVEL_IB => Err(Error::Unsupported(format!("ib option {optname}"))),
			_ => Err(Error::Unsupported(format!("option level {level}"))),
		}
	}
}

/// Validates client connection parameters and masks the queue-pair number
/// to 24 bits.
fn client_param(param: &ConnParam) -> Result<ConnParam> {
	if param.private_data.len() > CONN_PRIVATE_DATA_MAX {
		return Err(Error::InvalidArgument(format!(
			"{} bytes of private data, at most {CONN_PRIVATE_DATA_MAX}",
			param.private_data.len()
		)));
	}
	let mut param = param.clone();
	param.qp_num &= 0x00FF_FFFF;
	Ok(param)
}

fn id_option(optname: u32, optval: &[u8]) -> Result<IdOption> {
	let bad_len = || Error::InvalidArgument(format!("option {optname}: {} byte value", optval.len()));
	let byte = || match optval {
		&[b] => Ok(b),
		_ => Err(bad_len()),
	};
	let flag = || {
		<[u8; 4]>::try_from(optval)
			.map(|raw| i32::from_ne_bytes(raw) != 0)
			.map_err(|_| bad_len())
	};
	match optname {
		option::ID_TOS => Ok(IdOption::Tos(byte()?)),
		option::ID_REUSEADDR => Ok(IdOption::ReuseAddr(flag()?)),
		option::ID_AFONLY => Ok(IdOption::AfOnly(flag()?)),
		option::ID_ACK_TIMEOUT => Ok(IdOption::AckTimeout(byte()?)),
		_ => Err(Error::Unsupported(format!("id option {optname}"))),
	}
}

/// Picks the primary bidirectional record out of a packed path list.
fn primary_path(optval: &[u8]) -> Result<PathRecord> {
	if optval.len() % PathRecord::SIZE != 0 {
		return Err(Error::InvalidArgument(format!(
			"path list of {} bytes is not a multiple of {}",
			optval.len(),
			PathRecord::SIZE
		)));
	}
	optval
		.chunks_exact(PathRecord::SIZE)
		.filter_map(PathRecord::from_bytes)
		.find(PathRecord::is_primary_bidirectional)
		.ok_or_else(|| Error::InvalidArgument("no primary bidirectional path".into()))
}

#[cfg(test)]
mod tests {
	use super::*;
	use ucm_protocol::path_flags;

	#[test]
	fn test_client_param_masks_qp_num() {
		let param = ConnParam {
			qp_num: 0xAB12_3456,
			valid: true,
			..Default::default()
		};
		assert_eq!(client_param(&param).unwrap().qp_num, 0x12_3456);
	}

	#[test]
	fn test_client_param_rejects_long_private_data() {
		let param = ConnParam {
			private_data: vec![0; CONN_PRIVATE_DATA_MAX + 1],
			valid: true,
			..Default::default()
		};
		assert!(matches!(client_param(&param), Err(Error::InvalidArgument(_))));
	}

	#[test]
	fn test_id_option_lengths_are_exact() {
		assert_eq!(id_option(option::ID_TOS, &[5]).unwrap(), IdOption::Tos(5));
		assert!(id_option(option::ID_TOS, &[5, 0]).is_err());
		assert_eq!(
			id_option(option::ID_REUSEADDR, &1i32.to_ne_bytes()).unwrap(),
			IdOption::ReuseAddr(true)
		);
		assert!(id_option(option::ID_AFONLY, &[1]).is_err());
		assert!(matches!(id_option(42, &[0]), Err(Error::Unsupported(_))));
	}

	#[test]
	fn test_primary_path_requires_exact_flags() {
		let alternate = PathRecord {
			flags: path_flags::GMP | path_flags::ALTERNATE,
			..Default::default()
		};
		let primary = PathRecord {
			flags: path_flags::GMP | path_flags::PRIMARY | path_flags::BIDIRECTIONAL,
			pkey: 0xffff,
			..Default::default()
		};
		let mut packed = alternate.to_bytes().to_vec();
		packed.extend_from_slice(&primary.to_bytes());
		assert_eq!(primary_path(&packed).unwrap(), primary);

		assert!(primary_path(&alternate.to_bytes()).is_err());
		assert!(primary_path(&packed[..100]).is_err());
	}
}
