//! Coroutine operations (component I): spawn, sleep, iowait, wait, cancel
//! and yield, expressed as ordinary `async fn`s and leaf [`Future`]s over the
//! reactor primitives in [`crate::reactor`], [`crate::timer_queue`] and
//! [`crate::event_list`].
//!
//! None of these hold a borrowed reference across an `.await`: each poll
//! re-enters the current reactor through [`crate::reactor::with_current`],
//! the same pattern the reactor itself uses for its thread-local stack.

use std::future::Future;
use std::os::fd::RawFd;
use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::Duration;

use crate::clock::{duration_to_usec, monotonic_usec};
use crate::error::{Error, Result};
use crate::event_list::SubscriptionId;
use crate::reactor::with_current;
use crate::selector::Direction;
use crate::task::{take_current_task_cancelled, JoinHandle};
use crate::timer_queue::TimerId;

pub use crate::event_list::EventList;
pub use crate::task::{Cancel, TaskId};

/// Spawns `future` as a new coroutine on the current thread's reactor. The
/// returned handle is the "join" operation: `.await` it to wait for the
/// task's result, or call [`JoinHandle::cancel_token`] to request it stop.
pub fn spawn<F, T>(future: F) -> JoinHandle<T>
where
	F: Future<Output = Result<T>> + 'static,
	T: 'static
{
	with_current(|reactor| reactor.spawn(future))
}

/// Requests cancellation of `handle`'s task.
///
/// Fails with [`Error::Cancelled`] without affecting the target if called
/// from the task's own body (a coroutine can't cancel itself this way — it
/// would need to simply return).
pub fn cancel<T>(handle: &JoinHandle<T>) -> Result<()> {
	if Some(handle.id()) == crate::task::current_task_id() {
		return Err(Error::Cancelled);
	}

	handle.cancel_token().cancel();

	Ok(())
}

/// Suspends the calling coroutine until `monotonic_usec() >= deadline`,
/// where `deadline` is `duration` from now.
pub async fn sleep(duration: Duration) -> Result<()> {
	let deadline = monotonic_usec().saturating_add(duration_to_usec(duration));

	Sleep {
		deadline,
		timer_id: None
	}
	.await
}

struct Sleep {
	deadline: u64,
	timer_id: Option<TimerId>
}

impl Future for Sleep {
	type Output = Result<()>;

	fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
		if self.timer_id.is_none() {
			let id = with_current(|r| r.schedule_timer(self.deadline, cx.waker().clone()));

			self.timer_id = Some(id);

			return Poll::Pending;
		}

		if take_current_task_cancelled() {
			if let Some(id) = self.timer_id.take() {
				with_current(|r| r.cancel_timer(id));
			}

			return Poll::Ready(Err(Error::Cancelled));
		}

		Poll::Ready(Ok(()))
	}
}

/// Suspends the calling coroutine until `fd` becomes ready for `direction`.
/// Registration is one-shot: a second call re-registers from scratch, and a
/// cancelled wait unregisters rather than leaving a stale entry behind.
pub async fn iowait(fd: RawFd, direction: Direction) -> Result<()> {
	IoWait {
		fd,
		direction,
		registered: false
	}
	.await
}

struct IoWait {
	fd: RawFd,
	direction: Direction,
	registered: bool
}

impl Future for IoWait {
	type Output = Result<()>;

	fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
		if !self.registered {
			let result = with_current(|r| r.register_io(self.fd, self.direction, cx.waker().clone()));

			if let Err(err) = result {
				return Poll::Ready(Err(err));
			}

			self.registered = true;

			return Poll::Pending;
		}

		if take_current_task_cancelled() {
			with_current(|r| r.deregister_io(self.fd, self.direction));

			return Poll::Ready(Err(Error::Cancelled));
		}

		Poll::Ready(Ok(()))
	}
}

/// Suspends the calling coroutine until `event` is next emitted.
///
/// The owner of `event` (a join's done-list, an RPC channel's pending call,
/// the distributed lock's wake-event) must outlive this future, which is
/// always true when `event` is reached through an `Rc` the caller already
/// holds across the `.await`.
pub(crate) async fn wait(event: &EventList) -> Result<()> {
	WaitEvent { event, sub: None }.await
}

struct WaitEvent<'a> {
	event: &'a EventList,
	sub: Option<SubscriptionId>
}

impl Future for WaitEvent<'_> {
	type Output = Result<()>;

	fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
		if take_current_task_cancelled() {
			if let Some(id) = self.sub.take() {
				self.event.remove(id);
			}

			return Poll::Ready(Err(Error::Cancelled));
		}

		if self.sub.is_none() {
			let id = self.event.add(cx.waker().clone());

			self.sub = Some(id);

			return Poll::Pending;
		}

		Poll::Ready(Ok(()))
	}
}

/// Yields once: forces exactly one trip through the selector before
/// resuming, giving every other ready coroutine a turn. Implemented by
/// pinging the reactor's own pipe and waiting on its ping-event, the same
/// mechanism a cross-thread [`Cancel`] uses to wake the loop.
pub async fn yield_now() -> Result<()> {
	YieldNow { sub: None }.await
}

struct YieldNow {
	sub: Option<SubscriptionId>
}

impl Future for YieldNow {
	type Output = Result<()>;

	fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
		if self.sub.is_none() {
			let waker = cx.waker().clone();
			let id = with_current(|r| {
				r.request_yield();
				r.ping_event().add(waker)
			});

			self.sub = Some(id);

			return Poll::Pending;
		}

		if take_current_task_cancelled() {
			if let Some(id) = self.sub.take() {
				with_current(|r| r.ping_event().remove(id));
			}

			return Poll::Ready(Err(Error::Cancelled));
		}

		Poll::Ready(Ok(()))
	}
}
