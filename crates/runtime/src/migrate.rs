//! Cross-session migration.
//!
//! Moving a context takes both session locks, always in ascending
//! session-id order, then the context table. Under all three the context
//! must still be published under its id and Active. It then changes lists,
//! its queued events move to the destination queue in their original
//! relative order, and its owner link flips. A reader of either session
//! sees the context in exactly one of them.

use std::sync::Arc;
use std::sync::atomic::Ordering;

use parking_lot::MutexGuard;
use tracing::debug;
use ucm_protocol::{ContextId, SessionId};

use crate::context::ContextState;
use crate::error::{Error, Result};
use crate::session::{Session, SessionShared, SessionState};

impl Session {
	/// Moves context `id` from session `source` into this session.
	///
	/// Returns the context's consumed event count at the time of the move.
	pub fn migrate_from(&self, source: SessionId, id: ContextId) -> Result<u32> {
		let dest = &self.shared;
		dest.ensure_open()?;
		let broker = &dest.broker;
		let src = broker.session(source).ok_or(Error::NotFound {
			kind: "session",
			id: source.0,
		})?;
		let ctx = src.acquire(id)?;
		if Arc::ptr_eq(&src, dest) {
			return Ok(ctx.events_reported());
		}

		let (mut src_state, mut dest_state) = lock_pair(&src, dest);
		if src_state.closed || dest_state.closed {
			return Err(Error::SessionClosed);
		}
		if ctx.owner_id() != src.id {
			return Err(Error::context_denied(id));
		}
		if ctx.destroy_requested.load(Ordering::Acquire) || ctx.state() != ContextState::Active {
			return Err(Error::Unavailable(id));
		}

		let table = broker.contexts.freeze();
		// A destroy from the source erases the entry under the table lock
		// alone, so the checks above may already be stale.
		if !table.get(id.0).is_some_and(|current| Arc::ptr_eq(current, &ctx)) {
			return Err(Error::context_not_found(id));
		}
		if ctx.state() != ContextState::Active {
			return Err(Error::Unavailable(id));
		}
		if let Some(pos) = src_state.contexts.iter().position(|c| Arc::ptr_eq(c, &ctx)) {
			let moved = src_state.contexts.remove(pos);
			dest_state.contexts.push(moved);
		}

		let mut moved_events = 0usize;
		for ev in std::mem::take(&mut src_state.events) {
			if ev.belongs_to(&ctx) {
				dest_state.events.push_back(ev);
				moved_events += 1;
			} else {
				src_state.events.push_back(ev);
			}
		}
		ctx.set_owner(dest);
		let reported = ctx.events_reported();
		drop(table);
		drop(dest_state);
		drop(src_state);

		if moved_events > 0 {
			dest.wake();
		}
		debug!(
			target = "ucm.migrate",
			%id,
			from = %source,
			to = %dest.id,
			moved_events,
			reported,
			"migrated"
		);
		Ok(reported)
	}
}

/// Locks two distinct sessions in ascending id order. Returns the guards
/// as `(a, b)` regardless of which was taken first.
fn lock_pair<'a>(
	a: &'a SessionShared,
	b: &'a SessionShared,
) -> (MutexGuard<'a, SessionState>, MutexGuard<'a, SessionState>) {
	if a.id < b.id {
		let first = a.state.lock();
		let second = b.state.lock();
		(first, second)
	} else {
		let first = b.state.lock();
		let second = a.state.lock();
		(second, first)
	}
}
