//! Event delivery from the connection manager into session queues.
//!
//! Runs in the manager's execution context. Delivery only takes the owning
//! session's lock (and the handle table beneath it) and never blocks on
//! the manager or on a client.

use std::sync::Arc;

use tracing::{debug, trace, warn};
use ucm_protocol::{EventKind, EventRecord};

use crate::context::Context;
use crate::manager::{CmEvent, Endpoint, EventSink, Rejected, Route};
use crate::session::{CloseJob, QueuedEvent, SessionShared, SessionState};

impl EventSink {
	/// Reports an event for this sink's endpoint.
	///
	/// Events for an endpoint no client has claimed yet, or for a context
	/// whose correlation tag is not committed, are dropped. A device removal
	/// is still acted on in both cases.
	pub fn deliver(&self, event: CmEvent) {
		if event.kind == EventKind::ConnectRequest {
			warn!(target = "ucm.event", key = self.route.key.0, "connect request without an endpoint dropped");
			return;
		}
		let route = &self.route;
		let handled = self.with_target(|session, state, ctx| {
			let own_endpoint = route.key == ctx.endpoint_key();
			let Some(ctx_uid) = ctx.uid().filter(|_| own_endpoint) else {
				if event.kind == EventKind::DeviceRemoval {
					on_device_removal(session, state, ctx, route);
				}
				debug!(target = "ucm.event", id = %ctx.id, kind = ?event.kind, "dropped event for unclaimed endpoint");
				return;
			};

			let (uid, id) = match event.membership.filter(|_| event.kind.is_multicast()) {
				Some(mc) => {
					let memberships = ctx.memberships.lock();
					match memberships.iter().find(|m| m.id == mc) {
						Some(membership) => (membership.uid, mc.0),
						None => {
							debug!(target = "ucm.event", id = %ctx.id, %mc, "dropped event for unknown membership");
							return;
						}
					}
				}
				None => (ctx_uid, ctx.id.0),
			};

			let kind = event.kind;
			session.push_event(
				state,
				QueuedEvent {
					context: Arc::downgrade(ctx),
					membership: event.membership.filter(|_| kind.is_multicast()),
					route: Arc::clone(route),
					record: EventRecord {
						uid,
						id,
						event: kind,
						status: event.status,
						param: event.param.truncated(),
						ece: event.ece,
					},
					detached: None,
				},
			);
			trace!(target = "ucm.event", session = %session.id, id, ?kind, "queued");

			if kind == EventKind::DeviceRemoval {
				on_device_removal(session, state, ctx, route);
			}
		});
		if handled.is_none() {
			trace!(target = "ucm.event", key = self.route.key.0, kind = ?event.kind, "no consumer, event dropped");
		}
	}

	/// Reports an inbound connect request carrying its new endpoint.
	///
	/// Must be called on the sink minted for that endpoint by
	/// [`EventSink::inbound`]. The request is queued only if the listener's
	/// backlog has room; otherwise the endpoint is handed back.
	pub fn deliver_connect_request(&self, endpoint: Box<dyn Endpoint>, event: CmEvent) -> Result<(), Rejected> {
		let mut slot = Some(endpoint);
		let route = &self.route;
		self.with_target(|session, state, listener| {
			if state.closed {
				return;
			}
			if !listener.take_backlog_slot() {
				debug!(target = "ucm.event", id = %listener.id, "backlog exhausted, connect request dropped");
				return;
			}
			let record = EventRecord {
				uid: listener.uid().unwrap_or_default(),
				id: listener.id.0,
				event: EventKind::ConnectRequest,
				status: event.status,
				param: event.param.truncated(),
				ece: event.ece,
			};
			session.push_event(
				state,
				QueuedEvent {
					context: Arc::downgrade(listener),
					membership: None,
					route: Arc::clone(route),
					record,
					detached: slot.take(),
				},
			);
			trace!(target = "ucm.event", session = %session.id, id = %listener.id, "connect request queued");
		});
		match slot {
			Some(endpoint) => Err(Rejected { endpoint }),
			None => Ok(()),
		}
	}

	/// Locks the session owning this route's context and runs `f`.
	///
	/// Returns `None` without calling `f` when nothing consumes the route:
	/// no context, context already freed, or its session gone.
	fn with_target<R>(&self, f: impl FnOnce(&Arc<SessionShared>, &mut SessionState, &Arc<Context>) -> R) -> Option<R> {
		loop {
			let ctx = self.route.target()?;
			let session = ctx.owner_session()?;
			let mut state = session.state.lock();
			// Migration or a claim may have moved the target while we waited.
			if ctx.owner_id() != session.id {
				continue;
			}
			if !self.route.target().is_some_and(|t| Arc::ptr_eq(&t, &ctx)) {
				continue;
			}
			if ctx.is_freed() {
				return None;
			}
			return Some(f(&session, &mut state, &ctx));
		}
	}
}

/// Reacts to a device removal reported through `route`.
///
/// For the context's own endpoint: mark it Closing and schedule the
/// deferred close, unless an explicit destroy already erased it. For an
/// unclaimed inbound endpoint: withdraw its queued connect request and
/// destroy the endpoint on the close worker.
fn on_device_removal(session: &SessionShared, state: &mut SessionState, ctx: &Arc<Context>, route: &Arc<Route>) {
	if ctx.destroy_requested.load(std::sync::atomic::Ordering::Acquire) {
		return;
	}

	if route.key == ctx.endpoint_key() {
		let erased = !session.broker.contexts.with_entry(ctx.id.0, |entry| match entry {
			Some(current) if Arc::ptr_eq(current, ctx) => {
				ctx.mark_closing();
				true
			}
			_ => false,
		});
		if erased {
			return;
		}
		if !ctx.close_scheduled.swap(true, std::sync::atomic::Ordering::AcqRel) {
			debug!(target = "ucm.teardown", id = %ctx.id, "device removed, close scheduled");
			session.worker.submit(CloseJob::Context(Arc::clone(ctx)));
		}
		return;
	}

	let pending = state.events.iter().position(|ev| {
		ev.route.key == route.key && ev.record.event == EventKind::ConnectRequest && ev.detached.is_some()
	});
	match pending.and_then(|pos| state.events.remove(pos)) {
		Some(mut withdrawn) => {
			route.detach();
			ctx.return_backlog_slot();
			if let Some(endpoint) = withdrawn.detached.take() {
				session.worker.submit(CloseJob::Endpoint(endpoint));
			}
			debug!(target = "ucm.teardown", id = %ctx.id, "withdrew connect request for removed device");
		}
		None => warn!(target = "ucm.teardown", id = %ctx.id, "connect request for removed endpoint not found"),
	}
}
