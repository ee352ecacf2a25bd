//! Client sessions and their event queues.
//!
//! A [`Session`] owns a list of contexts and one FIFO event queue guarded
//! by a single lock. Events are consumed strictly in arrival order;
//! consuming a connect request claims its detached endpoint into a new
//! context owned by the session.

mod worker;

use std::collections::VecDeque;
use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use tokio::sync::Notify;
use tracing::{debug, trace};
use ucm_protocol::{ContextId, EventKind, EventRecord, MembershipId, SessionId};

use crate::broker::BrokerShared;
use crate::context::{Context, ContextRef, ContextStatus};
use crate::error::{Error, Result};
use crate::manager::{Endpoint, Route};

pub(crate) use worker::{CloseJob, CloseWorker};

/// An event waiting in a session queue.
pub(crate) struct QueuedEvent {
	/// The context the event is attributed to. For connect requests this
	/// is the listener.
	pub(crate) context: Weak<Context>,
	pub(crate) membership: Option<MembershipId>,
	/// Route of the endpoint that reported the event.
	pub(crate) route: Arc<Route>,
	pub(crate) record: EventRecord,
	/// Inbound endpoint carried by an unclaimed connect request.
	pub(crate) detached: Option<Box<dyn Endpoint>>,
}

impl QueuedEvent {
	pub(crate) fn belongs_to(&self, ctx: &Arc<Context>) -> bool {
		std::ptr::eq(self.context.as_ptr(), Arc::as_ptr(ctx))
	}
}

#[derive(Default)]
pub(crate) struct SessionState {
	pub(crate) contexts: Vec<Arc<Context>>,
	pub(crate) events: VecDeque<QueuedEvent>,
	pub(crate) closed: bool,
}

pub(crate) struct SessionShared {
	pub(crate) id: SessionId,
	pub(crate) broker: Arc<BrokerShared>,
	pub(crate) state: Mutex<SessionState>,
	ready: Notify,
	pub(crate) worker: CloseWorker,
}

impl SessionShared {
	pub(crate) fn new(id: SessionId, broker: Arc<BrokerShared>) -> Self {
		Self {
			id,
			broker,
			state: Mutex::new(SessionState::default()),
			ready: Notify::new(),
			worker: CloseWorker::spawn(id),
		}
	}

	pub(crate) fn ensure_open(&self) -> Result<()> {
		if self.state.lock().closed {
			return Err(Error::SessionClosed);
		}
		Ok(())
	}

	pub(crate) fn acquire(&self, id: ContextId) -> Result<ContextRef> {
		self.ensure_open()?;
		self.broker.acquire(id, self.id)
	}

	/// Appends under the caller's hold of the session lock and wakes waiters.
	pub(crate) fn push_event(&self, state: &mut SessionState, event: QueuedEvent) {
		state.events.push_back(event);
		self.wake();
	}

	/// Wakes every reader waiting for events or for the session to close.
	pub(crate) fn wake(&self) {
		self.ready.notify_waiters();
	}

	/// Pops the head event, claiming it into a new context first if it is a
	/// connect request. On claim failure the event stays queued.
	fn pop_event(self: &Arc<Self>) -> Result<Option<EventRecord>> {
		let mut state = self.state.lock();
		if state.closed {
			return Err(Error::SessionClosed);
		}

		let claimed = match state.events.front_mut() {
			None => return Ok(None),
			Some(front) if front.record.event == EventKind::ConnectRequest => {
				self.claim_connect_request(front)?
			}
			Some(_) => None,
		};
		if let Some(ctx) = claimed {
			state.contexts.push(ctx);
		}

		let Some(event) = state.events.pop_front() else {
			return Ok(None);
		};
		if let Some(ctx) = event.context.upgrade() {
			ctx.note_reported();
			if let Some(mc) = event.membership {
				if let Some(membership) = ctx.memberships.lock().iter().find(|m| m.id == mc) {
					membership.note_reported();
				}
			}
		}
		trace!(
			target = "ucm.session",
			session = %self.id,
			id = event.record.id,
			kind = ?event.record.event,
			"event consumed"
		);
		Ok(Some(event.record))
	}

	fn claim_connect_request(self: &Arc<Self>, front: &mut QueuedEvent) -> Result<Option<Arc<Context>>> {
		let Some(endpoint) = front.detached.take() else {
			return Ok(None);
		};
		let id = match self.broker.contexts.reserve() {
			Ok(id) => id,
			Err(e) => {
				front.detached = Some(endpoint);
				return Err(e);
			}
		};
		let ctx = Arc::new(Context::new(
			ContextId(id),
			self,
			endpoint,
			Arc::clone(&front.route),
			None,
		));
		self.broker.contexts.publish(id, Arc::clone(&ctx));
		front.route.retarget(&ctx);
		if let Some(listener) = front.context.upgrade() {
			listener.return_backlog_slot();
		}
		front.record.id = id;
		debug!(
			target = "ucm.session",
			session = %self.id,
			id = %ctx.id,
			listener_uid = front.record.uid,
			"claimed inbound endpoint"
		);
		Ok(Some(ctx))
	}
}

/// A client session.
///
/// Dropping a session without calling [`Session::close`] schedules the
/// close on the current tokio runtime.
pub struct Session {
	pub(crate) shared: Arc<SessionShared>,
}

impl Session {
	pub(crate) fn from_shared(shared: Arc<SessionShared>) -> Self {
		Self { shared }
	}

	pub fn id(&self) -> SessionId {
		self.shared.id
	}

	/// Dequeues the next event in arrival order.
	///
	/// With `block == false` an empty queue fails with [`Error::WouldBlock`].
	/// Otherwise waits until an event arrives or the session closes.
	pub async fn next_event(&self, block: bool) -> Result<EventRecord> {
		loop {
			let notified = self.shared.ready.notified();
			tokio::pin!(notified);
			notified.as_mut().enable();

			if let Some(event) = self.shared.pop_event()? {
				return Ok(event);
			}
			if !block {
				return Err(Error::WouldBlock);
			}
			notified.await;
		}
	}

	/// Non-blocking dequeue; `None` when the queue is empty.
	pub fn try_next_event(&self) -> Result<Option<EventRecord>> {
		self.shared.pop_event()
	}

	/// Level-triggered readiness: true while events are pending.
	pub fn has_events(&self) -> bool {
		!self.shared.state.lock().events.is_empty()
	}

	/// Waits until at least one event is pending or the session closes.
	///
	/// Readiness only: a closed session reads as ready and the following
	/// dequeue reports the closure.
	pub async fn readable(&self) {
		loop {
			let notified = self.shared.ready.notified();
			tokio::pin!(notified);
			notified.as_mut().enable();
			{
				let state = self.shared.state.lock();
				if state.closed || !state.events.is_empty() {
					return;
				}
			}
			notified.await;
		}
	}

	pub fn pending_events(&self) -> usize {
		self.shared.state.lock().events.len()
	}

	/// Ids of owned contexts, in creation order.
	pub fn contexts(&self) -> Vec<ContextId> {
		self.shared.state.lock().contexts.iter().map(|c| c.id).collect()
	}

	/// Status of an owned context, including ones already closing.
	pub fn context_status(&self, id: ContextId) -> Option<ContextStatus> {
		let state = self.shared.state.lock();
		state
			.contexts
			.iter()
			.find(|c| c.id == id)
			.map(|c| c.status())
	}

	pub fn is_closed(&self) -> bool {
		self.shared.state.lock().closed
	}

	/// Tears down every owned context and releases the session.
	pub async fn close(&self) {
		self.shared.close().await;
	}
}

impl Drop for Session {
	fn drop(&mut self) {
		if self.shared.state.lock().closed {
			return;
		}
		let shared = Arc::clone(&self.shared);
		if let Ok(handle) = tokio::runtime::Handle::try_current() {
			handle.spawn(async move {
				shared.close().await;
				debug!(target = "ucm.session", session = %shared.id, "closed dropped session");
			});
		}
	}
}

impl std::fmt::Debug for Session {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		f.debug_struct("Session").field("id", &self.shared.id).finish()
	}
}
