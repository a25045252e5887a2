//! Ping pipe (component E): a self-pipe used to unblock the selector from
//! another thread (or a signal handler, though this crate has no signal
//! handling of its own).

use std::os::fd::RawFd;
use std::sync::atomic::{AtomicBool, Ordering};

use crate::error::{Error, Result};

/// The read/write ends of an anonymous pipe, plus a flag so repeated pings
/// before the reactor wakes coalesce into a single byte.
pub struct PingPipe {
	read_fd: RawFd,
	write_fd: RawFd,
	pinged: AtomicBool
}

impl PingPipe {
	pub fn new() -> Result<Self> {
		let mut fds = [0; 2];

		/* Safety: `fds` is a valid 2-element out-array */
		let result = unsafe { libc::pipe2(fds.as_mut_ptr(), libc::O_NONBLOCK | libc::O_CLOEXEC) };

		if result < 0 {
			return Err(Error::Os(std::io::Error::last_os_error()));
		}

		Ok(Self {
			read_fd: fds[0],
			write_fd: fds[1],
			pinged: AtomicBool::new(false)
		})
	}

	#[must_use]
	pub fn read_fd(&self) -> RawFd {
		self.read_fd
	}

	/// Writes a single wakeup token, unless one is already in flight.
	/// Thread-safe; this is the only operation on [`PingPipe`] meant to be
	/// called from a thread other than the one running the reactor.
	pub fn ping(&self) {
		if self.pinged.swap(true, Ordering::AcqRel) {
			return;
		}

		let byte = [0u8; 1];

		loop {
			/* Safety: `byte` is a valid 1-byte buffer, `write_fd` is our own
			 * open fd */
			let result = unsafe { libc::write(self.write_fd, byte.as_ptr().cast(), 1) };

			if result >= 0 {
				break;
			}

			let err = std::io::Error::last_os_error();

			if err.kind() != std::io::ErrorKind::Interrupted {
				break;
			}
		}
	}

	/// Drains every pending byte and clears the pinged flag. Called from the
	/// selector's read-waker for `read_fd`; a short read is expected and
	/// harmless since the bytes are wakeup tokens, not data.
	pub fn drain(&self) {
		let mut buf = [0u8; 64];

		loop {
			/* Safety: `buf` is a valid buffer of the given length */
			let result = unsafe { libc::read(self.read_fd, buf.as_mut_ptr().cast(), buf.len()) };

			if result <= 0 {
				break;
			}
		}

		self.pinged.store(false, Ordering::Release);
	}
}

impl Drop for PingPipe {
	fn drop(&mut self) {
		/* Safety: both fds are owned by this struct and open */
		unsafe {
			libc::close(self.read_fd);
			libc::close(self.write_fd);
		}
	}
}
