//! Event list (component D): a FIFO list of wakers fired in order, with
//! removal by identity so a cancelled waiter can unsubscribe before the
//! event ever fires.

use std::cell::RefCell;
use std::task::Waker;

/// An opaque handle returned by [`EventList::add`], used to unsubscribe via
/// [`EventList::remove`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SubscriptionId(u64);

struct Entry {
	id: SubscriptionId,
	waker: Waker
}

/// A FIFO list of wakers. Used for done-events (join), the ping-event, and
/// the distributed lock's wake-event.
#[derive(Default)]
pub struct EventList {
	next_id: RefCell<u64>,
	entries: RefCell<Vec<Entry>>
}

impl EventList {
	#[must_use]
	pub fn new() -> Self {
		Self::default()
	}

	/// Registers `waker` to be woken on the next [`EventList::emit`].
	pub fn add(&self, waker: Waker) -> SubscriptionId {
		let mut next_id = self.next_id.borrow_mut();
		let id = SubscriptionId(*next_id);

		*next_id += 1;
		self.entries.borrow_mut().push(Entry { id, waker });

		id
	}

	/// Removes a subscription before it fires. No-op if it already fired or
	/// was never registered (idempotent, so a task can unsubscribe on
	/// cancellation without first checking whether it already woke).
	pub fn remove(&self, id: SubscriptionId) {
		self.entries.borrow_mut().retain(|entry| entry.id != id);
	}

	/// Returns `true` if there are no pending subscribers.
	#[must_use]
	pub fn is_empty(&self) -> bool {
		self.entries.borrow().is_empty()
	}

	/// Wakes every currently-registered subscriber, in FIFO order.
	/// Subscriptions added while `emit` is running are *not* woken by this
	/// call; they land after the snapshot taken at entry, matching the
	/// distilled spec's "new adds land after the currently-executing
	/// callback" rule.
	pub fn emit(&self) {
		let drained: Vec<Entry> = {
			let mut entries = self.entries.borrow_mut();

			std::mem::take(&mut *entries)
		};

		for entry in drained {
			entry.waker.wake();
		}
	}
}
