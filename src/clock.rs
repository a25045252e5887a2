//! Monotonic clock (component A).
//!
//! Every timed wakeup in this crate is expressed in microseconds since an
//! arbitrary epoch, taken from `CLOCK_MONOTONIC`. Microsecond resolution
//! matches the original `mun_usec_now` and is plenty for the reactor's
//! timer queue.

use std::time::Duration;

/// Returns the current monotonic time in microseconds.
///
/// # Panics
/// If `clock_gettime` fails, which only happens if the kernel doesn't
/// support `CLOCK_MONOTONIC` at all.
#[must_use]
pub fn monotonic_usec() -> u64 {
	let mut ts = libc::timespec {
		tv_sec: 0,
		tv_nsec: 0
	};

	/* Safety: `ts` is a valid out-pointer for `clock_gettime` */
	let result = unsafe { libc::clock_gettime(libc::CLOCK_MONOTONIC, &raw mut ts) };

	assert!(result == 0, "CLOCK_MONOTONIC is not supported on this system");

	#[allow(clippy::cast_sign_loss)]
	let secs = ts.tv_sec as u64;
	#[allow(clippy::cast_sign_loss)]
	let nanos = ts.tv_nsec as u64;

	secs.saturating_mul(1_000_000).saturating_add(nanos / 1_000)
}

/// Converts a [`Duration`] to a microsecond count, saturating rather than
/// panicking on overflow (unlike the distilled spec's `sleep`, which panics
/// past ~585 years of nanoseconds).
#[must_use]
pub fn duration_to_usec(duration: Duration) -> u64 {
	u64::try_from(duration.as_micros()).unwrap_or(u64::MAX)
}
