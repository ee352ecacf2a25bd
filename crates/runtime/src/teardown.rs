//! Two-phase teardown of contexts and sessions.
//!
//! Phase one makes a context unreachable: it is erased from the handle
//! table and marked Closing, so no new acquisition can succeed. Phase two
//! waits for outstanding holders to release, destroys the endpoint and
//! frees the context's queued events and memberships.
//!
//! Exactly one path owns phase two for a given context: whichever of an
//! explicit destroy or a session close flips `destroy_requested` first,
//! under the owning session's lock.

use std::sync::Arc;
use std::sync::atomic::Ordering;

use tracing::{debug, info};
use ucm_protocol::ContextId;

use crate::broker::BrokerShared;
use crate::context::Context;
use crate::error::{Error, Result};
use crate::manager::Endpoint;
use crate::multicast::cleanup_memberships;
use crate::session::{Session, SessionShared};

impl Session {
	/// Destroys a context owned by this session.
	///
	/// Waits until every in-flight operation on the context has finished
	/// and returns how many of its events were consumed. If a session
	/// close already owns the context, waits for that close to free it and
	/// then fails with [`Error::SessionClosed`].
	pub async fn destroy_id(&self, id: ContextId) -> Result<u32> {
		let shared = &self.shared;
		let broker = &shared.broker;

		let closing = {
			let state = shared.state.lock();
			state
				.closed
				.then(|| state.contexts.iter().find(|c| c.id == id).cloned())
		};
		if let Some(pending) = closing {
			// The session close owns every context it listed.
			if let Some(ctx) = pending {
				ctx.freed().await;
			}
			return Err(Error::SessionClosed);
		}

		let ctx = broker.contexts.with_entry(id.0, |entry| {
			let ctx = entry.clone().ok_or_else(|| Error::context_not_found(id))?;
			if ctx.owner_id() != shared.id {
				return Err(Error::context_denied(id));
			}
			*entry = None;
			ctx.mark_closing();
			Ok(ctx)
		})?;

		let close_owns = {
			let _state = shared.state.lock();
			ctx.destroy_requested.swap(true, Ordering::AcqRel)
		};
		if close_owns {
			ctx.freed().await;
			return Err(Error::SessionClosed);
		}

		shared.worker.flush().await;
		if !ctx.close_scheduled.load(Ordering::Acquire) {
			ctx.drain_and_destroy().await;
		}
		let reported = free_context(broker, &ctx);
		debug!(target = "ucm.teardown", session = %shared.id, %id, reported, "destroyed");
		Ok(reported)
	}
}

impl SessionShared {
	/// Closes the session: tears down every owned context, then drops any
	/// inbound endpoints still waiting in the queue. Idempotent.
	pub(crate) async fn close(self: &Arc<Self>) {
		let taken: Vec<Arc<Context>> = {
			let mut state = self.state.lock();
			if state.closed {
				return;
			}
			state.closed = true;
			state
				.contexts
				.iter()
				.filter(|ctx| !ctx.destroy_requested.swap(true, Ordering::AcqRel))
				.cloned()
				.collect()
		};
		self.wake();

		for ctx in &taken {
			self.broker.contexts.erase_if_same(ctx.id.0, ctx);
			ctx.mark_closing();
		}
		self.worker.flush().await;

		for ctx in &taken {
			if !ctx.close_scheduled.load(Ordering::Acquire) {
				ctx.drain_and_destroy().await;
			}
			free_context(&self.broker, ctx);
		}

		let leftovers: Vec<Box<dyn Endpoint>> = {
			let mut state = self.state.lock();
			state
				.events
				.drain(..)
				.filter_map(|mut ev| {
					ev.route.detach();
					ev.detached.take()
				})
				.collect()
		};
		for endpoint in leftovers {
			endpoint.destroy();
		}

		self.broker.sessions.remove(&self.id);
		info!(target = "ucm.session", session = %self.id, contexts = taken.len(), "session closed");
	}
}

/// Removes a drained context from its session and returns its consumed
/// event count.
///
/// Queued events attributed to the context go with it, including connect
/// requests whose inbound endpoints were never claimed; those endpoints
/// are destroyed after the session lock is released.
pub(crate) fn free_context(broker: &BrokerShared, ctx: &Arc<Context>) -> u32 {
	cleanup_memberships(ctx, &broker.memberships);

	let mut detached = Vec::new();
	match ctx.owner_session() {
		Some(owner) => {
			let mut state = owner.state.lock();
			state.events.retain_mut(|ev| {
				if !ev.belongs_to(ctx) {
					return true;
				}
				if let Some(endpoint) = ev.detached.take() {
					ev.route.detach();
					detached.push(endpoint);
				}
				false
			});
			state.contexts.retain(|c| !Arc::ptr_eq(c, ctx));
			ctx.mark_freed();
		}
		None => ctx.mark_freed(),
	}

	for endpoint in detached {
		endpoint.destroy();
	}
	ctx.events_reported()
}
