//! Minimal async I/O building blocks: reading and writing a raw,
//! non-blocking file descriptor via [`crate::ops::iowait`], plus the pipe
//! and socket-pair constructors the RPC channel (and its tests) need.
//!
//! This is deliberately not a general async filesystem or networking API —
//! see the specification's Non-goals.

use std::io;
use std::os::fd::{AsRawFd, BorrowedFd, FromRawFd, OwnedFd, RawFd};

use crate::error::{Error, Result};
use crate::ops::iowait;
use crate::selector::Direction;

pub(crate) fn set_nonblocking(fd: RawFd) -> Result<()> {
	/* Safety: fd is a valid, open descriptor for the duration of this call */
	let flags = unsafe { libc::fcntl(fd, libc::F_GETFL, 0) };

	if flags < 0 {
		return Err(Error::Os(io::Error::last_os_error()));
	}

	/* Safety: fd is a valid, open descriptor for the duration of this call */
	let result = unsafe { libc::fcntl(fd, libc::F_SETFL, flags | libc::O_NONBLOCK) };

	if result < 0 {
		return Err(Error::Os(io::Error::last_os_error()));
	}

	Ok(())
}

/// Creates an anonymous pipe `(read, write)`, both non-blocking.
pub fn pipe() -> Result<(OwnedFd, OwnedFd)> {
	let mut fds = [0; 2];

	/* Safety: `fds` is a valid 2-element out-array */
	let result = unsafe { libc::pipe2(fds.as_mut_ptr(), libc::O_NONBLOCK | libc::O_CLOEXEC) };

	if result < 0 {
		return Err(Error::Os(io::Error::last_os_error()));
	}

	/* Safety: pipe2 initialized both fds on success */
	Ok(unsafe { (OwnedFd::from_raw_fd(fds[0]), OwnedFd::from_raw_fd(fds[1])) })
}

/// Creates a connected, non-blocking Unix-domain socket pair — the duplex
/// fd an [`crate::rpc::Channel`] expects.
pub fn socketpair() -> Result<(OwnedFd, OwnedFd)> {
	let mut fds = [0; 2];

	/* Safety: `fds` is a valid 2-element out-array */
	let result = unsafe {
		libc::socketpair(
			libc::AF_UNIX,
			libc::SOCK_STREAM | libc::SOCK_NONBLOCK | libc::SOCK_CLOEXEC,
			0,
			fds.as_mut_ptr()
		)
	};

	if result < 0 {
		return Err(Error::Os(io::Error::last_os_error()));
	}

	/* Safety: socketpair initialized both fds on success */
	Ok(unsafe { (OwnedFd::from_raw_fd(fds[0]), OwnedFd::from_raw_fd(fds[1])) })
}

/// Reads at least one byte into `buf`, waiting for readability as needed.
/// Returns `0` on EOF, matching `read(2)`.
pub async fn read(fd: BorrowedFd<'_>, buf: &mut [u8]) -> Result<usize> {
	loop {
		let raw = fd.as_raw_fd();

		/* Safety: `raw` is open for the duration of this call, `buf` is a
		 * valid buffer of its stated length */
		let result = unsafe { libc::read(raw, buf.as_mut_ptr().cast(), buf.len()) };

		if result >= 0 {
			#[allow(clippy::cast_sign_loss)]
			return Ok(result as usize);
		}

		let err = io::Error::last_os_error();

		match err.kind() {
			io::ErrorKind::WouldBlock => iowait(raw, Direction::Read).await?,
			io::ErrorKind::Interrupted => continue,
			_ => return Err(Error::Os(err))
		}
	}
}

/// Writes at least one byte from `buf`, waiting for writability as needed.
pub async fn write(fd: BorrowedFd<'_>, buf: &[u8]) -> Result<usize> {
	loop {
		let raw = fd.as_raw_fd();

		/* Safety: `raw` is open for the duration of this call, `buf` is a
		 * valid buffer of its stated length */
		let result = unsafe { libc::write(raw, buf.as_ptr().cast(), buf.len()) };

		if result >= 0 {
			#[allow(clippy::cast_sign_loss)]
			return Ok(result as usize);
		}

		let err = io::Error::last_os_error();

		match err.kind() {
			io::ErrorKind::WouldBlock => iowait(raw, Direction::Write).await?,
			io::ErrorKind::Interrupted => continue,
			_ => return Err(Error::Os(err))
		}
	}
}

/// Writes the whole of `buf`, looping over short writes.
pub async fn write_all(fd: BorrowedFd<'_>, mut buf: &[u8]) -> Result<()> {
	while !buf.is_empty() {
		let n = write(fd, buf).await?;

		buf = &buf[n..];
	}

	Ok(())
}
