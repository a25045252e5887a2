//! Readiness selector (component B): a thin, edge-triggered wrapper over
//! Linux epoll. Registration is one waker per `(fd, direction)`; each
//! readiness event is one-shot — the registration is consumed (and must be
//! re-added) the moment its waker fires, matching the distilled spec's
//! "iowait always unsubscribes on resume" rule.

use std::collections::HashMap;
use std::os::fd::RawFd;
use std::task::Waker;
use std::time::Duration;

use crate::error::{Error, Result};

/// Which half of a full-duplex fd a registration is interested in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Direction {
	Read,
	Write
}

#[derive(Default)]
struct Registration {
	read: Option<Waker>,
	write: Option<Waker>
}

impl Registration {
	fn is_empty(&self) -> bool {
		self.read.is_none() && self.write.is_none()
	}

	fn interest_mask(&self) -> u32 {
		#[allow(clippy::cast_sign_loss)]
		let mut mask = (libc::EPOLLRDHUP | libc::EPOLLHUP | libc::EPOLLERR) as u32;

		if self.read.is_some() {
			#[allow(clippy::cast_sign_loss)]
			{
				mask |= libc::EPOLLIN as u32;
			}
		}

		if self.write.is_some() {
			#[allow(clippy::cast_sign_loss)]
			{
				mask |= libc::EPOLLOUT as u32;
			}
		}

		mask
	}
}

/// An epoll instance plus the bookkeeping needed to dispatch readiness back
/// to the waker that's waiting on it.
pub struct Selector {
	epoll_fd: RawFd,
	registrations: std::cell::RefCell<HashMap<RawFd, Registration>>
}

impl Selector {
	pub fn new() -> Result<Self> {
		/* Safety: epoll_create1 has no preconditions beyond a valid flags
		 * argument, and 0 always is one */
		let epoll_fd = unsafe { libc::epoll_create1(0) };

		if epoll_fd < 0 {
			return Err(Error::Os(std::io::Error::last_os_error()));
		}

		Ok(Self {
			epoll_fd,
			registrations: std::cell::RefCell::new(HashMap::new())
		})
	}

	/// Registers `waker` to be woken the next time `fd` is ready for
	/// `direction`. Fails with [`Error::Duplicate`] if that direction
	/// already has a registered waker.
	pub fn add(&self, fd: RawFd, direction: Direction, waker: Waker) -> Result<()> {
		let mut registrations = self.registrations.borrow_mut();
		let existed = registrations.contains_key(&fd);
		let registration = registrations.entry(fd).or_default();

		let slot = match direction {
			Direction::Read => &mut registration.read,
			Direction::Write => &mut registration.write
		};

		if slot.is_some() {
			return Err(Error::Duplicate);
		}

		*slot = Some(waker);

		let op = if existed {
			libc::EPOLL_CTL_MOD
		} else {
			libc::EPOLL_CTL_ADD
		};

		let mut event = libc::epoll_event {
			events: registration.interest_mask() | u32::try_from(libc::EPOLLET).unwrap_or(0),
			u64: u64::try_from(fd).unwrap_or(0)
		};

		/* Safety: `epoll_fd` is our own valid instance, `fd` is caller-owned
		 * and must remain open until removed, `event` is a valid pointer */
		let result = unsafe { libc::epoll_ctl(self.epoll_fd, op, fd, &raw mut event) };

		if result < 0 {
			let slot = match direction {
				Direction::Read => &mut registration.read,
				Direction::Write => &mut registration.write
			};

			*slot = None;

			return Err(Error::Os(std::io::Error::last_os_error()));
		}

		Ok(())
	}

	/// Removes a previously registered waker for `(fd, direction)` without
	/// waking it. Used when a task cancels an `iowait` before it fires.
	pub fn remove(&self, fd: RawFd, direction: Direction) {
		let mut registrations = self.registrations.borrow_mut();
		let Some(registration) = registrations.get_mut(&fd) else {
			return;
		};

		match direction {
			Direction::Read => registration.read = None,
			Direction::Write => registration.write = None
		}

		if registration.is_empty() {
			registrations.remove(&fd);

			/* Safety: `epoll_fd` is valid; the kernel ignores a NULL event
			 * pointer on EPOLL_CTL_DEL */
			unsafe {
				libc::epoll_ctl(self.epoll_fd, libc::EPOLL_CTL_DEL, fd, std::ptr::null_mut());
			}
		} else {
			let mut event = libc::epoll_event {
				events: registration.interest_mask() | u32::try_from(libc::EPOLLET).unwrap_or(0),
				u64: u64::try_from(fd).unwrap_or(0)
			};

			/* Safety: fd is still registered, event is a valid pointer */
			unsafe {
				libc::epoll_ctl(self.epoll_fd, libc::EPOLL_CTL_MOD, fd, &raw mut event);
			}
		}
	}

	/// Waits up to `timeout` for readiness, then wakes every waker whose
	/// direction became ready. `EPOLLHUP`/`EPOLLERR`/`EPOLLRDHUP` wake
	/// *both* directions so each side independently observes the peer
	/// closing or erroring.
	pub fn wait(&self, timeout: Option<Duration>) -> Result<()> {
		let timeout_ms = match timeout {
			None => -1,
			#[allow(clippy::cast_possible_truncation)]
			Some(duration) => duration.as_millis().min(i64::from(i32::MAX) as u128) as i32
		};

		let mut events: [libc::epoll_event; 256] = [libc::epoll_event { events: 0, u64: 0 }; 256];

		/* Safety: `events` is a valid buffer of the given capacity */
		let ready = unsafe {
			libc::epoll_wait(
				self.epoll_fd,
				events.as_mut_ptr(),
				events.len() as i32,
				timeout_ms
			)
		};

		if ready < 0 {
			let err = std::io::Error::last_os_error();

			if err.kind() == std::io::ErrorKind::Interrupted {
				return Ok(());
			}

			return Err(Error::Os(err));
		}

		#[allow(clippy::cast_sign_loss)]
		for event in &events[..ready as usize] {
			#[allow(clippy::cast_possible_truncation)]
			let fd = event.u64 as RawFd;
			let hup = (event.events
				& u32::try_from(libc::EPOLLHUP | libc::EPOLLERR | libc::EPOLLRDHUP).unwrap_or(0))
				!= 0;
			let readable = hup || (event.events & u32::try_from(libc::EPOLLIN).unwrap_or(0)) != 0;
			let writable = hup || (event.events & u32::try_from(libc::EPOLLOUT).unwrap_or(0)) != 0;

			let mut registrations = self.registrations.borrow_mut();
			let Some(registration) = registrations.get_mut(&fd) else {
				continue;
			};

			let read_waker = if readable { registration.read.take() } else { None };
			let write_waker = if writable {
				registration.write.take()
			} else {
				None
			};

			/* Leave the (possibly now-empty) entry in the map: the fd is
			 * still registered with epoll (readiness here only consumed our
			 * bookkeeping of a one-shot waker, never issued EPOLL_CTL_DEL),
			 * so the next `add` for this fd must see it as `existed` and
			 * issue EPOLL_CTL_MOD rather than an EPOLL_CTL_ADD that the
			 * kernel would reject with EEXIST. Only `remove` tears the
			 * kernel registration down and drops the map entry together. */
			drop(registrations);

			if let Some(waker) = read_waker {
				waker.wake();
			}

			if let Some(waker) = write_waker {
				waker.wake();
			}
		}

		Ok(())
	}
}

impl Drop for Selector {
	fn drop(&mut self) {
		/* Safety: epoll_fd is a valid fd owned by this struct */
		unsafe {
			libc::close(self.epoll_fd);
		}
	}
}
