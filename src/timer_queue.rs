//! Timer queue (component C): an ordered multiset of `(deadline, waker)`
//! pairs, popped in deadline order with FIFO tie-breaking.

use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashSet};
use std::task::Waker;

use crate::clock::monotonic_usec;

/// Handle returned by [`TimerQueue::schedule`], used to [`TimerQueue::cancel`]
/// before the timer fires.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TimerId(u64);

struct Timer {
	deadline: u64,
	seq: u64,
	id: TimerId,
	waker: Waker
}

impl PartialEq for Timer {
	fn eq(&self, other: &Self) -> bool {
		(self.deadline, self.seq) == (other.deadline, other.seq)
	}
}

impl Eq for Timer {}

impl PartialOrd for Timer {
	fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
		Some(self.cmp(other))
	}
}

impl Ord for Timer {
	fn cmp(&self, other: &Self) -> std::cmp::Ordering {
		(self.deadline, self.seq).cmp(&(other.deadline, other.seq))
	}
}

/// A min-heap of pending timers. `cancel` uses a tombstone set rather than
/// a heap removal, since `BinaryHeap` has no O(log n) arbitrary-element
/// removal; a cancelled timer is simply skipped when popped. This is a
/// deliberate, idiomatic-Rust divergence from requiring the exact
/// `(deadline, callback-identity)` pair to still be present on cancel — the
/// externally observable behavior (a cancelled timer never fires) matches.
#[derive(Default)]
pub struct TimerQueue {
	heap: std::cell::RefCell<BinaryHeap<Reverse<Timer>>>,
	cancelled: std::cell::RefCell<HashSet<TimerId>>,
	next_seq: std::cell::Cell<u64>,
	next_id: std::cell::Cell<u64>
}

impl TimerQueue {
	#[must_use]
	pub fn new() -> Self {
		Self::default()
	}

	/// Schedules `waker` to be woken once `monotonic_usec() >= deadline`.
	pub fn schedule(&self, deadline: u64, waker: Waker) -> TimerId {
		let seq = self.next_seq.get();
		self.next_seq.set(seq + 1);

		let id = TimerId(self.next_id.get());
		self.next_id.set(id.0 + 1);

		self.heap.borrow_mut().push(Reverse(Timer {
			deadline,
			seq,
			id,
			waker
		}));

		id
	}

	/// Prevents `id`'s waker from firing. No-op if it already fired.
	pub fn cancel(&self, id: TimerId) {
		self.cancelled.borrow_mut().insert(id);
	}

	/// Pops and wakes every timer whose deadline has passed, skipping
	/// cancelled entries. Returns the deadline of the next pending timer,
	/// if any, so the reactor can size its next `wait` call.
	pub fn drain(&self) -> Option<u64> {
		let now = monotonic_usec();

		loop {
			let due = {
				let mut heap = self.heap.borrow_mut();

				match heap.peek() {
					Some(Reverse(timer)) if timer.deadline <= now => heap.pop(),
					_ => None
				}
			};

			let Some(Reverse(timer)) = due else {
				break;
			};

			if self.cancelled.borrow_mut().remove(&timer.id) {
				continue;
			}

			timer.waker.wake();
		}

		self.heap.borrow().peek().map(|Reverse(timer)| timer.deadline)
	}

	/// `true` if no timers (cancelled or not) remain queued.
	#[must_use]
	pub fn is_empty(&self) -> bool {
		self.heap.borrow().is_empty()
	}
}
