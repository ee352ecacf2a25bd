//! Id-allocating handle table.
//!
//! One short, non-blocking critical section guards every operation. Closures
//! passed to [`HandleTable::with_entry`] run under that lock and must not
//! call into the connection manager or take any other broker lock except
//! the small per-object leaf locks.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::{Mutex, MutexGuard};
use tracing::trace;

use crate::error::{Error, Result};

enum Slot<T> {
	/// Id allocated, value not yet visible to lookups.
	Reserved,
	Occupied(Arc<T>),
}

struct Slots<T> {
	entries: HashMap<u32, Slot<T>>,
	cursor: u32,
	limit: u32,
}

impl<T> Slots<T> {
	/// Cyclic allocation: the next free id at or after the cursor.
	fn allocate(&mut self, kind: &'static str) -> Result<u32> {
		if self.entries.len() as u64 >= self.limit as u64 {
			return Err(Error::ResourceExhausted(format!("{kind} id space full")));
		}
		let mut id = self.cursor;
		while self.entries.contains_key(&id) {
			id = self.wrap(id);
		}
		self.cursor = self.wrap(id);
		Ok(id)
	}

	fn wrap(&self, id: u32) -> u32 {
		if id.saturating_add(1) >= self.limit {
			0
		} else {
			id + 1
		}
	}
}

/// Concurrent map from integer id to a shared object.
pub(crate) struct HandleTable<T> {
	kind: &'static str,
	slots: Mutex<Slots<T>>,
}

/// Exclusive hold on a table, used to make multi-object updates atomic
/// with respect to lookups.
pub(crate) struct TableGuard<'a, T> {
	slots: MutexGuard<'a, Slots<T>>,
}

impl<T> TableGuard<'_, T> {
	/// Lookup under the held lock. Reserved ids read as absent.
	pub(crate) fn get(&self, id: u32) -> Option<&Arc<T>> {
		match self.slots.entries.get(&id) {
			Some(Slot::Occupied(value)) => Some(value),
			_ => None,
		}
	}
}

impl<T> HandleTable<T> {
	pub(crate) fn new(kind: &'static str, limit: u32) -> Self {
		Self {
			kind,
			slots: Mutex::new(Slots {
				entries: HashMap::new(),
				cursor: 0,
				limit: limit.max(1),
			}),
		}
	}

	/// Allocates an id whose value is published later.
	pub(crate) fn reserve(&self) -> Result<u32> {
		let mut slots = self.slots.lock();
		let id = slots.allocate(self.kind)?;
		slots.entries.insert(id, Slot::Reserved);
		trace!(target = "ucm.table", kind = self.kind, id, "reserved");
		Ok(id)
	}

	/// Makes a reserved id visible. No-op if the reservation was dropped.
	pub(crate) fn publish(&self, id: u32, value: Arc<T>) {
		let mut slots = self.slots.lock();
		if let Some(slot) = slots.entries.get_mut(&id) {
			*slot = Slot::Occupied(value);
		}
	}

	/// Runs `f` on the entry for `id` while holding the table lock.
	pub(crate) fn with_entry<R>(&self, id: u32, f: impl FnOnce(&mut Option<Arc<T>>) -> R) -> R {
		let mut slots = self.slots.lock();
		let mut entry = match slots.entries.get(&id) {
			Some(Slot::Occupied(value)) => Some(Arc::clone(value)),
			_ => None,
		};
		let present = entry.is_some();
		let result = f(&mut entry);
		if present && entry.is_none() {
			slots.entries.remove(&id);
			trace!(target = "ucm.table", kind = self.kind, id, "erased");
		}
		result
	}

	pub(crate) fn get(&self, id: u32) -> Option<Arc<T>> {
		self.with_entry(id, |entry| entry.clone())
	}

	/// Removes the mapping for `id`, reserved or published. Idempotent.
	pub(crate) fn erase(&self, id: u32) -> Option<Arc<T>> {
		match self.slots.lock().entries.remove(&id) {
			Some(Slot::Occupied(value)) => Some(value),
			_ => None,
		}
	}

	/// Removes `id` only if it still maps to `value`.
	pub(crate) fn erase_if_same(&self, id: u32, value: &Arc<T>) -> bool {
		self.with_entry(id, |entry| {
			let same = entry.as_ref().is_some_and(|v| Arc::ptr_eq(v, value));
			if same {
				*entry = None;
			}
			same
		})
	}

	pub(crate) fn freeze(&self) -> TableGuard<'_, T> {
		TableGuard {
			slots: self.slots.lock(),
		}
	}

	/// Number of allocated ids, reserved ones included.
	pub(crate) fn len(&self) -> usize {
		self.slots.lock().entries.len()
	}
}
