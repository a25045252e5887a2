//! Top-level entry point: owns one [`Reactor`] and drives a root future to
//! completion on the current thread.

use std::future::Future;

use crate::error::Result;
use crate::reactor::Reactor;

/// A single-threaded coroutine runtime. Create one with [`Runtime::new`]
/// and drive a future to completion with [`Runtime::block_on`].
///
/// A `Runtime` is meant to be built once per thread (most programs built on
/// this crate spawn one OS thread per loop and run one `Runtime` on it for
/// that thread's lifetime); see `#[cone_rt::main]` for the common case of a
/// single-threaded program with one loop.
pub struct Runtime {
	reactor: Reactor
}

impl Runtime {
	pub fn new() -> Result<Self> {
		Ok(Self {
			reactor: Reactor::new()?
		})
	}

	/// Runs `future` to completion, servicing every coroutine it spawns
	/// along the way, and returns its output.
	///
	/// # Panics
	/// Panics if `future` itself panics, same as any other executor.
	pub fn block_on<F>(&self, future: F) -> F::Output
	where
		F: Future<Output = F::Output> + 'static,
		F::Output: 'static
	{
		let _guard = self.reactor.enter();
		let handle = self.reactor.spawn(async move { Ok(future.await) });

		loop {
			if handle.is_finished() {
				break;
			}

			if let Err(err) = self.reactor.turn() {
				tracing::error!(error = %err, "reactor loop exited with an I/O error");

				break;
			}
		}

		match handle.take_output() {
			Some(Ok(output)) => output,
			Some(Err(_)) => unreachable!("block_on's wrapper future never fails"),
			None => panic!("reactor stopped (no pending work) before the root future completed")
		}
	}

	/// Returns the number of coroutines currently alive on this runtime's
	/// loop, including ones blocked on I/O or a timer.
	#[must_use]
	pub fn task_count(&self) -> usize {
		self.reactor.active_count()
	}
}
