//! Task handle (component G) and the poll-loop primitive that stands in for
//! stack switching (component H).
//!
//! Every suspension point in this crate is a real `.await` on a leaf
//! future; a "coroutine" here is a boxed, pinned `Future` plus the
//! bookkeeping the specification asks for (flags, captured error, a
//! done-event list). "Switching to" a task is `Future::poll`; "yielding" is
//! a leaf future returning `Poll::Pending`.

use std::cell::{Cell, RefCell};
use std::collections::{HashSet, VecDeque};
use std::future::Future;
use std::pin::Pin;
use std::rc::Rc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll, RawWaker, RawWakerVTable, Waker};

use crate::error::{Error, Result};
use crate::event_list::EventList;
use crate::ping::PingPipe;

/// Identifies a task within one reactor. Never reused while the reactor is
/// alive.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TaskId(pub(crate) u64);

/// The queue of task ids that are ready to be polled again. Shared between
/// the reactor and every [`Waker`] handed out to tasks it owns.
pub(crate) type ReadyQueue = Rc<RefCell<VecDeque<TaskId>>>;

/// Cross-thread-safe state shared between a [`Task`]'s owning reactor and
/// any [`Cancel`] handle derived from it. This is the only part of a task
/// that may be touched from a thread other than the one driving its
/// reactor, exactly as the specification's concurrency model allows:
/// "only two operations are legal across loops: ping and cancel".
pub(crate) struct TaskAtomics {
	/// Latched by [`Cancel::cancel`], cleared the moment a suspension point
	/// inside the task observes it. One-shot by design: `cone_pause` in the
	/// original clears `CONE_FLAG_CANCELLED` before rethrowing so a task
	/// that catches the resulting error can keep running, and a later
	/// `cancel` call can latch a fresh cancellation.
	cancelled: AtomicBool,
	/// Sticky companion to `cancelled`: set at the same time but never
	/// cleared, so the task's unobserved-failure `Drop` check can still
	/// tell a cancelled task from a genuinely unobserved failure even after
	/// `cancelled` itself has been consumed.
	ever_cancelled: AtomicBool,
	finished: AtomicBool
}

/// A handle that can request cancellation of a task from any thread.
///
/// Obtained via [`crate::ops::JoinHandle::cancel_token`]. Calling
/// [`Cancel::cancel`] is edge-triggered: it latches the cancelled flag and
/// ensures the owning reactor wakes up to observe it, but does not itself
/// guarantee the task has stopped running by the time it returns.
#[derive(Clone)]
pub struct Cancel {
	task_id: TaskId,
	atomics: Arc<TaskAtomics>,
	pending: Arc<Mutex<Vec<TaskId>>>,
	pinger: Arc<PingPipe>
}

impl Cancel {
	pub(crate) fn new(
		task_id: TaskId, atomics: Arc<TaskAtomics>, pending: Arc<Mutex<Vec<TaskId>>>,
		pinger: Arc<PingPipe>
	) -> Self {
		Self {
			task_id,
			atomics,
			pending,
			pinger
		}
	}

	/// Requests cancellation of the associated task. No-op if the task has
	/// already finished.
	pub fn cancel(&self) {
		if self.atomics.finished.load(Ordering::Acquire) {
			return;
		}

		self.atomics.ever_cancelled.store(true, Ordering::Release);

		if !self.atomics.cancelled.swap(true, Ordering::AcqRel) {
			#[allow(clippy::unwrap_used)]
			self.pending.lock().unwrap().push(self.task_id);
		}

		self.pinger.ping();
	}

	/// Whether `cancel` has ever been called on this task. Unlike the
	/// internal latch a suspension point consumes when it observes
	/// cancellation, this never resets, so it stays accurate even after the
	/// task has swallowed one cancellation and kept running.
	#[must_use]
	pub fn is_cancelled(&self) -> bool {
		self.atomics.ever_cancelled.load(Ordering::Acquire)
	}
}

/// Non-generic part of a task, shared by [`TaskErased`] so the reactor can
/// manage any task without knowing its output type.
pub(crate) struct TaskHeader {
	pub(crate) id: TaskId,
	pub(crate) atomics: Arc<TaskAtomics>,
	pub(crate) done: EventList,
	pub(crate) failed: Cell<bool>,
	pub(crate) error_observed: Cell<bool>
}

impl TaskHeader {
	/// Whether `cancel` was ever called on this task. Sticky (see
	/// [`TaskAtomics::ever_cancelled`]) so it's still `true` by the time
	/// `Drop` checks it, even though the suspension point that turned the
	/// cancellation into an `Err(Cancelled)` already consumed the one-shot
	/// latch.
	#[must_use]
	pub(crate) fn is_cancelled(&self) -> bool {
		self.atomics.ever_cancelled.load(Ordering::Acquire)
	}

	pub(crate) fn mark_finished(&self) {
		self.atomics.finished.store(true, Ordering::Release);
	}
}

/// Type-erased interface the reactor uses to drive any task, regardless of
/// its output type.
pub(crate) trait TaskErased {
	fn header(&self) -> &TaskHeader;

	/// Polls the task's future once. Returns `true` if it has finished.
	fn poll_once(self: Rc<Self>, waker: &Waker) -> bool;
}

/// The concrete, typed task state. `T` is the `async fn`'s return type.
pub(crate) struct TaskImpl<T> {
	header: TaskHeader,
	future: RefCell<Option<Pin<Box<dyn Future<Output = Result<T>>>>>>,
	output: RefCell<Option<Result<T>>>
}

impl<T> TaskErased for TaskImpl<T> {
	fn header(&self) -> &TaskHeader {
		&self.header
	}

	fn poll_once(self: Rc<Self>, waker: &Waker) -> bool {
		let mut slot = self.future.borrow_mut();

		let Some(future) = slot.as_mut() else {
			return true;
		};

		let mut cx = Context::from_waker(waker);

		match future.as_mut().poll(&mut cx) {
			Poll::Pending => false,
			Poll::Ready(result) => {
				*slot = None;
				self.header.failed.set(result.is_err());
				self.header.mark_finished();
				*self.output.borrow_mut() = Some(result);
				drop(slot);
				self.header.done.emit();

				true
			}
		}
	}
}

impl<T> Drop for TaskImpl<T> {
	fn drop(&mut self) {
		if self.header.is_cancelled() || self.header.error_observed.get() {
			return;
		}

		if let Some(Err(err)) = self.output.get_mut() {
			tracing::error!(task = self.header.id.0, error = %err, "coroutine dropped without observing its error");
		}
	}
}

/// A handle to a spawned task's eventual result, returned by
/// [`crate::ops::spawn`]. Awaiting it is the "join" operation (component I).
pub struct JoinHandle<T> {
	inner: Rc<TaskImpl<T>>,
	subscribed: Cell<Option<crate::event_list::SubscriptionId>>,
	pending: Arc<Mutex<Vec<TaskId>>>,
	pinger: Arc<PingPipe>
}

impl<T> JoinHandle<T> {
	pub(crate) fn new(
		inner: Rc<TaskImpl<T>>, pending: Arc<Mutex<Vec<TaskId>>>, pinger: Arc<PingPipe>
	) -> Self {
		Self {
			inner,
			subscribed: Cell::new(None),
			pending,
			pinger
		}
	}

	/// Returns a cloneable, `Send + Sync` handle that can cancel this task
	/// from any thread.
	#[must_use]
	pub fn cancel_token(&self) -> Cancel {
		Cancel::new(
			self.inner.header.id,
			Arc::clone(&self.inner.header.atomics),
			Arc::clone(&self.pending),
			Arc::clone(&self.pinger)
		)
	}

	#[must_use]
	pub(crate) fn id(&self) -> TaskId {
		self.inner.header.id
	}

	#[must_use]
	pub(crate) fn is_finished(&self) -> bool {
		self.inner.header.atomics.finished.load(Ordering::Acquire)
	}

	/// Takes the task's output without going through `Future::poll`. Used
	/// by `Runtime::block_on` to retrieve the root future's result once its
	/// wrapper task has finished.
	pub(crate) fn take_output(&self) -> Option<Result<T>> {
		self.inner.output.borrow_mut().take()
	}
}

impl<T> Future for JoinHandle<T> {
	type Output = Result<T>;

	fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
		if let Some(result) = self.inner.output.borrow_mut().take() {
			self.inner.header.error_observed.set(true);

			if let Some(id) = self.subscribed.take() {
				self.inner.header.done.remove(id);
			}

			return Poll::Ready(result);
		}

		if crate::task::take_current_task_cancelled() {
			if let Some(id) = self.subscribed.take() {
				self.inner.header.done.remove(id);
			}

			return Poll::Ready(Err(Error::Cancelled));
		}

		if self.subscribed.get().is_none() {
			let id = self.inner.header.done.add(cx.waker().clone());

			self.subscribed.set(Some(id));
		}

		Poll::Pending
	}
}

/// Constructs a boxed [`TaskImpl`] from a future, ready to be registered
/// with a reactor.
pub(crate) fn new_task<T, F>(id: TaskId, future: F) -> Rc<TaskImpl<T>>
where
	F: Future<Output = Result<T>> + 'static,
	T: 'static
{
	Rc::new(TaskImpl {
		header: TaskHeader {
			id,
			atomics: Arc::new(TaskAtomics {
				cancelled: AtomicBool::new(false),
				ever_cancelled: AtomicBool::new(false),
				finished: AtomicBool::new(false)
			}),
			done: EventList::new(),
			failed: Cell::new(false),
			error_observed: Cell::new(false)
		},
		future: RefCell::new(Some(Box::pin(future))),
		output: RefCell::new(None)
	})
}

struct WakeData {
	ready: ReadyQueue,
	queued: Rc<RefCell<HashSet<TaskId>>>,
	id: TaskId
}

/// # Safety
/// The functions in this vtable assume `wake`/`wake_by_ref` are only ever
/// invoked on the thread that owns `ready`/`queued` (an `Rc<RefCell<_>>>`
/// pair, neither of which is `Sync`). Every caller in this crate upholds
/// that invariant: the only cross-thread wakeup path is [`Cancel`], which
/// goes through a separate `Arc<Mutex<_>>` queue and the self-pipe instead
/// of through this `Waker`.
static VTABLE: RawWakerVTable = RawWakerVTable::new(clone_waker, wake, wake_by_ref, drop_waker);

fn clone_waker(data: *const ()) -> RawWaker {
	/* Safety: `data` always originates from `Rc::into_raw` in `make_waker` */
	unsafe {
		Rc::increment_strong_count(data.cast::<WakeData>());
	}

	RawWaker::new(data, &VTABLE)
}

fn wake(data: *const ()) {
	wake_by_ref(data);
	drop_waker(data);
}

fn wake_by_ref(data: *const ()) {
	/* Safety: `data` always originates from `Rc::into_raw` in `make_waker` */
	let wake_data = unsafe { &*data.cast::<WakeData>() };
	let mut queued = wake_data.queued.borrow_mut();

	if queued.insert(wake_data.id) {
		wake_data.ready.borrow_mut().push_back(wake_data.id);
	}
}

fn drop_waker(data: *const ()) {
	/* Safety: `data` always originates from `Rc::into_raw` in `make_waker` */
	unsafe {
		drop(Rc::from_raw(data.cast::<WakeData>()));
	}
}

/// Builds a [`Waker`] for `id` that, when woken, pushes `id` onto `ready`
/// (deduplicated via `queued`).
pub(crate) fn make_waker(id: TaskId, ready: ReadyQueue, queued: Rc<RefCell<HashSet<TaskId>>>) -> Waker {
	let data = Rc::into_raw(Rc::new(WakeData { ready, queued, id })).cast::<()>();

	/* Safety: `VTABLE`'s functions all correctly manage the `Rc<WakeData>`
	 * refcount and only access it from the owning thread */
	unsafe { Waker::from_raw(RawWaker::new(data, &VTABLE)) }
}

thread_local! {
	static CURRENT_TASK: Cell<Option<TaskId>> = const { Cell::new(None) };
	static CURRENT_CANCEL: RefCell<Option<Arc<TaskAtomics>>> = const { RefCell::new(None) };
}

/// Marks `id` as the task currently being polled on this thread, for the
/// duration of `f`. Used by the reactor's poll loop around every
/// `TaskErased::poll_once` call.
pub(crate) fn with_current_task<R>(id: TaskId, atomics: Arc<TaskAtomics>, f: impl FnOnce() -> R) -> R {
	let previous_id = CURRENT_TASK.with(|cell| cell.replace(Some(id)));
	let previous_cancel = CURRENT_CANCEL.with(|cell| cell.borrow_mut().replace(atomics));

	let result = f();

	CURRENT_TASK.with(|cell| cell.set(previous_id));
	*CURRENT_CANCEL.with(|cell| cell.borrow_mut()) = previous_cancel;

	result
}

/// Returns the id of the task currently being polled on this thread, if
/// any.
#[must_use]
pub fn current_task_id() -> Option<TaskId> {
	CURRENT_TASK.with(Cell::get)
}

/// Checks whether the task currently being polled on this thread has been
/// cancelled, consuming the latch if so. One-shot: matches `cone_pause`
/// clearing `CONE_FLAG_CANCELLED` before rethrowing, so a task that catches
/// the resulting `Error::Cancelled` and keeps running only sees it once per
/// `cancel` call instead of forever.
#[must_use]
pub(crate) fn take_current_task_cancelled() -> bool {
	CURRENT_CANCEL.with(|cell| {
		cell.borrow()
			.as_ref()
			.is_some_and(|atomics| atomics.cancelled.swap(false, Ordering::AcqRel))
	})
}
