//! Event loop (component F): owns the selector, timer queue and ping pipe,
//! and drives every task registered with it to completion.

use std::cell::{Cell, RefCell};
use std::collections::{HashMap, HashSet, VecDeque};
use std::future::Future;
use std::os::fd::RawFd;
use std::ptr::NonNull;
use std::rc::Rc;
use std::sync::{Arc, Mutex};
use std::task::{RawWaker, RawWakerVTable, Waker};
use std::time::Duration;

use crate::error::Result;
use crate::event_list::EventList;
use crate::ping::PingPipe;
use crate::selector::{Direction, Selector};
use crate::task::{
	current_task_id, make_waker, new_task, with_current_task, JoinHandle, ReadyQueue, TaskErased,
	TaskId
};
use crate::timer_queue::{TimerId, TimerQueue};

const MAX_POLL_WAIT: Duration = Duration::from_secs(60);

/// The single-threaded executor and I/O reactor. One per OS thread that
/// calls [`crate::Runtime::block_on`]; talking to a `Reactor` from another
/// thread is only ever legal through [`crate::task::Cancel`] and
/// [`Reactor::pinger`].
pub struct Reactor {
	selector: Selector,
	timers: TimerQueue,
	ping: Arc<PingPipe>,
	ping_registered: Cell<bool>,
	ping_event: EventList,
	ready: ReadyQueue,
	queued: Rc<RefCell<HashSet<TaskId>>>,
	tasks: RefCell<HashMap<TaskId, Rc<dyn TaskErased>>>,
	next_id: Cell<u64>,
	active_count: Cell<usize>,
	pending_cancels: Arc<Mutex<Vec<TaskId>>>
}

impl Reactor {
	pub fn new() -> Result<Self> {
		Ok(Self {
			selector: Selector::new()?,
			timers: TimerQueue::new(),
			ping: Arc::new(PingPipe::new()?),
			ping_registered: Cell::new(false),
			ping_event: EventList::default(),
			ready: Rc::new(RefCell::new(VecDeque::new())),
			queued: Rc::new(RefCell::new(HashSet::new())),
			tasks: RefCell::new(HashMap::new()),
			next_id: Cell::new(0),
			active_count: Cell::new(0),
			pending_cancels: Arc::new(Mutex::new(Vec::new()))
		})
	}

	/// A cloneable, `Send + Sync` handle capable of waking this reactor's
	/// selector from any thread.
	#[must_use]
	pub(crate) fn pinger(&self) -> Arc<PingPipe> {
		Arc::clone(&self.ping)
	}

	#[must_use]
	pub(crate) fn pending_cancels(&self) -> Arc<Mutex<Vec<TaskId>>> {
		Arc::clone(&self.pending_cancels)
	}

	pub(crate) fn timers(&self) -> &TimerQueue {
		&self.timers
	}

	pub(crate) fn selector(&self) -> &Selector {
		&self.selector
	}

	/// The event list every `yield_now` call subscribes to; emitted once per
	/// `turn`, so waiting on it forces exactly one trip through the selector.
	pub(crate) fn ping_event(&self) -> &EventList {
		&self.ping_event
	}

	/// Pings this reactor's own pipe, guaranteeing the next `turn` doesn't
	/// block even if nothing else is ready. Used by `yield_now`.
	pub(crate) fn request_yield(&self) {
		self.ping.ping();
	}

	/// Registers `fd` for `direction`, waking the current task when ready.
	/// Thin pass-through kept here so leaf futures don't need to reach past
	/// the reactor into the selector directly.
	pub(crate) fn register_io(&self, fd: RawFd, direction: Direction, waker: Waker) -> Result<()> {
		self.selector.add(fd, direction, waker)
	}

	pub(crate) fn deregister_io(&self, fd: RawFd, direction: Direction) {
		self.selector.remove(fd, direction);
	}

	pub(crate) fn schedule_timer(&self, deadline: u64, waker: Waker) -> TimerId {
		self.timers.schedule(deadline, waker)
	}

	pub(crate) fn cancel_timer(&self, id: TimerId) {
		self.timers.cancel(id);
	}

	/// Spawns `future` as a new task, scheduling it to run on the next poll
	/// pass rather than inline, so the caller's own continuation always
	/// keeps priority over work it just created.
	pub(crate) fn spawn<T, F>(&self, future: F) -> JoinHandle<T>
	where
		F: Future<Output = Result<T>> + 'static,
		T: 'static
	{
		let id = TaskId(self.next_id.get());

		self.next_id.set(id.0 + 1);

		let task = new_task(id, future);

		self.tasks.borrow_mut().insert(id, task.clone());
		self.active_count.set(self.active_count.get() + 1);
		self.enqueue(id);

		JoinHandle::new(task, Arc::clone(&self.pending_cancels), Arc::clone(&self.ping))
	}

	fn enqueue(&self, id: TaskId) {
		if self.queued.borrow_mut().insert(id) {
			self.ready.borrow_mut().push_back(id);
		}
	}

	fn waker_for(&self, id: TaskId) -> Waker {
		make_waker(id, Rc::clone(&self.ready), Rc::clone(&self.queued))
	}

	fn ensure_ping_registered(&self) {
		if self.ping_registered.replace(true) {
			return;
		}

		/* the ping waker never needs to do anything: its only job is to make
		 * `epoll_wait` return, after which we unconditionally drain and
		 * re-arm it below */
		if self
			.selector
			.add(self.ping.read_fd(), Direction::Read, noop_waker())
			.is_err()
		{
			self.ping_registered.set(false);
		}
	}

	/// Runs one iteration: fire due timers, wait for I/O (or the next
	/// deadline, whichever is sooner), dispatch readiness, then poll every
	/// task made ready by any of the above. Returns `false` once there is
	/// nothing left that could ever wake the loop again.
	pub(crate) fn turn(&self) -> Result<bool> {
		let next_deadline = self.timers.drain();

		if self.active_count.get() == 0 {
			return Ok(false);
		}

		self.ensure_ping_registered();

		let now = crate::clock::monotonic_usec();
		let timeout = next_deadline.map(|deadline| {
			let remaining = deadline.saturating_sub(now);

			Duration::from_micros(remaining).min(MAX_POLL_WAIT)
		});

		self.selector.wait(timeout.or(Some(MAX_POLL_WAIT)))?;
		self.ping.drain();
		self.ensure_ping_registered();
		self.ping_event.emit();
		self.drain_pending_cancels();
		self.poll_ready();

		Ok(true)
	}

	fn drain_pending_cancels(&self) {
		#[allow(clippy::unwrap_used)]
		let pending: Vec<TaskId> = std::mem::take(&mut self.pending_cancels.lock().unwrap());

		for id in pending {
			self.enqueue(id);
		}
	}

	fn poll_ready(&self) {
		let batch: Vec<TaskId> = std::mem::take(&mut *self.ready.borrow_mut());

		for id in batch {
			self.queued.borrow_mut().remove(&id);

			let Some(task) = self.tasks.borrow().get(&id).cloned() else {
				continue;
			};

			let atomics = Arc::clone(&task.header().atomics);
			let waker = self.waker_for(id);
			let finished = with_current_task(id, atomics, || task.clone().poll_once(&waker));

			if finished {
				self.tasks.borrow_mut().remove(&id);
				self.active_count.set(self.active_count.get().saturating_sub(1));
			}
		}
	}

	#[must_use]
	pub(crate) fn active_count(&self) -> usize {
		self.active_count.get()
	}

	/// Makes this reactor reachable from `with_current` for the lifetime of
	/// the returned guard. `Runtime::block_on` holds one guard for its
	/// entire call.
	pub(crate) fn enter(&self) -> EnterGuard {
		CURRENT.with(|cell| cell.borrow_mut().push(NonNull::from(self)));

		EnterGuard
	}
}

thread_local! {
	static CURRENT: RefCell<Vec<NonNull<Reactor>>> = const { RefCell::new(Vec::new()) };
}

pub(crate) struct EnterGuard;

impl Drop for EnterGuard {
	fn drop(&mut self) {
		CURRENT.with(|cell| {
			cell.borrow_mut().pop();
		});
	}
}

/// Runs `f` with a reference to the reactor currently driving this thread.
///
/// # Panics
/// Panics if called from outside a `Runtime::block_on` call, same as e.g.
/// calling a `tokio` op outside of a runtime context.
pub(crate) fn with_current<R>(f: impl FnOnce(&Reactor) -> R) -> R {
	CURRENT.with(|cell| {
		let stack = cell.borrow();
		let ptr = *stack
			.last()
			.expect("cone_rt operation used outside of a Runtime::block_on call");

		/* Safety: `ptr` was pushed by `Reactor::enter`, which is held by an
		 * `EnterGuard` for the entire duration of the `block_on` call that
		 * owns this reactor; the reactor itself outlives that call */
		f(unsafe { ptr.as_ref() })
	})
}

static NOOP_VTABLE: RawWakerVTable = RawWakerVTable::new(
	|_| RawWaker::new(std::ptr::null(), &NOOP_VTABLE),
	|_| {},
	|_| {},
	|_| {}
);

fn noop_waker() -> Waker {
	/* Safety: every function in NOOP_VTABLE is a correct no-op for a null
	 * data pointer */
	unsafe { Waker::from_raw(RawWaker::new(std::ptr::null(), &NOOP_VTABLE)) }
}

/// Returns the id of the task currently running on this thread's reactor,
/// if any. Re-exported at the crate root as the "current coroutine" query.
#[must_use]
pub fn current() -> Option<TaskId> {
	current_task_id()
}
