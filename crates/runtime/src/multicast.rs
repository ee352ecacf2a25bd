//! Multicast memberships.
//!
//! A membership lives both in the broker's membership table and in its
//! context's membership list, or in neither. Joining reserves the id
//! first and publishes it only once the connection manager accepted the
//! join; a failed join is rolled back from both places together with any
//! events already queued for it.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Weak};

use tracing::debug;
use ucm_protocol::{ContextId, JoinFlags, MembershipId};

use crate::context::{Context, ContextRef};
use crate::error::{Error, Result};
use crate::session::Session;
use crate::table::HandleTable;

pub(crate) struct Membership {
	pub(crate) id: MembershipId,
	pub(crate) context: Weak<Context>,
	pub(crate) addr: SocketAddr,
	pub(crate) uid: u64,
	pub(crate) join_state: u8,
	events_reported: AtomicU32,
}

impl Membership {
	pub(crate) fn events_reported(&self) -> u32 {
		self.events_reported.load(Ordering::Acquire)
	}

	pub(crate) fn note_reported(&self) {
		self.events_reported.fetch_add(1, Ordering::AcqRel);
	}
}

impl Session {
	/// Joins `addr` on behalf of context `id`.
	///
	/// Group notifications for the membership carry `uid` and the returned
	/// membership id.
	pub fn join_multicast(&self, id: ContextId, uid: u64, addr: SocketAddr, flags: JoinFlags) -> Result<MembershipId> {
		let shared = &self.shared;
		let broker = &shared.broker;
		let ctx = shared.acquire(id)?;
		ctx.with_device(|_| Ok(()))?;

		let mut state = shared.state.lock();
		let mc_id = MembershipId(broker.memberships.reserve()?);
		let membership = Arc::new(Membership {
			id: mc_id,
			context: Arc::downgrade(&*ctx),
			addr,
			uid,
			join_state: flags.join_state(),
			events_reported: AtomicU32::new(0),
		});
		ctx.memberships.lock().push(Arc::clone(&membership));

		let joined = ctx.with_endpoint(|endpoint| endpoint.join_multicast(addr, membership.join_state, mc_id));
		if let Err(e) = joined {
			broker.memberships.erase(mc_id.0);
			ctx.memberships.lock().retain(|m| !Arc::ptr_eq(m, &membership));
			state
				.events
				.retain(|ev| !(ev.membership == Some(mc_id) && ev.belongs_to(&ctx)));
			debug!(target = "ucm.multicast", id = %ctx.id, %mc_id, error = %e, "join rolled back");
			return Err(e);
		}

		broker.memberships.publish(mc_id.0, membership);
		debug!(target = "ucm.multicast", id = %ctx.id, %mc_id, %addr, "joined");
		Ok(mc_id)
	}

	/// Leaves a group and returns how many of its notifications were
	/// consumed.
	pub fn leave_multicast(&self, id: MembershipId) -> Result<u32> {
		let shared = &self.shared;
		shared.ensure_open()?;
		let broker = &shared.broker;

		let (membership, ctx) = broker.memberships.with_entry(id.0, |entry| {
			let not_found = || Error::NotFound {
				kind: "membership",
				id: id.0 as u64,
			};
			let membership = entry.clone().ok_or_else(not_found)?;
			let ctx = membership.context.upgrade().ok_or_else(not_found)?;
			if ctx.owner_id() != shared.id {
				return Err(Error::PermissionDenied {
					kind: "membership",
					id: id.0 as u64,
				});
			}
			if !ctx.add_ref_if_live() {
				return Err(Error::Unavailable(ctx.id));
			}
			*entry = None;
			Ok((membership, ContextRef::adopt(ctx)))
		})?;

		if let Err(e) = ctx.with_endpoint(|endpoint| {
			endpoint.leave_multicast(membership.addr);
			Ok(())
		}) {
			debug!(target = "ucm.multicast", %id, error = %e, "endpoint gone before leave");
		}

		let owner = ctx.owner_session().unwrap_or_else(|| Arc::clone(shared));
		{
			let mut state = owner.state.lock();
			state
				.events
				.retain(|ev| !(ev.membership == Some(id) && ev.belongs_to(&ctx)));
			ctx.memberships.lock().retain(|m| !Arc::ptr_eq(m, &membership));
		}
		drop(ctx);

		let reported = membership.events_reported();
		debug!(target = "ucm.multicast", %id, reported, "left");
		Ok(reported)
	}
}

/// Drops every membership of a context that is being freed.
pub(crate) fn cleanup_memberships(ctx: &Context, table: &HandleTable<Membership>) {
	let memberships: Vec<_> = ctx.memberships.lock().drain(..).collect();
	for membership in memberships {
		table.erase(membership.id.0);
	}
}
