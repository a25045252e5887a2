//! S3 (pipe read/write byte-exact round trip) and S4 (two coroutines
//! concurrently `iowait`ing on opposite directions of the same fd) from the
//! specification's testable-properties scenarios.

use std::cell::RefCell;
use std::os::fd::AsFd;
use std::rc::Rc;

use cone_rt::{iowait, pipe, read, socketpair, spawn, write_all, Direction, Error};

const PATTERN_LEN: usize = 55;
/// Scaled down from the specification's 100,000 so the suite runs quickly;
/// the property under test (byte-exact concatenation across many writes
/// smaller than the pipe's buffer) doesn't depend on the exact count.
const COPIES: usize = 2_000;

fn pattern() -> [u8; PATTERN_LEN] {
	let mut buf = [0u8; PATTERN_LEN];

	for (i, byte) in buf.iter_mut().enumerate() {
		*byte = b'!' + u8::try_from(i).expect("PATTERN_LEN fits in a u8 offset");
	}

	buf
}

#[cone_rt::test]
async fn pipe_roundtrip_is_byte_exact() -> cone_rt::Result<()> {
	let (read_end, write_end) = pipe()?;
	let pattern = pattern();

	let writer = spawn(async move {
		for _ in 0..COPIES {
			write_all(write_end.as_fd(), &pattern).await?;
		}

		// dropping write_end here (the future's capture goes out of scope)
		// closes the write half, which is what lets the reader observe EOF
		Ok::<_, Error>(())
	});

	let mut received = Vec::with_capacity(PATTERN_LEN * COPIES);
	let mut chunk = [0u8; 4096];

	loop {
		let n = read(read_end.as_fd(), &mut chunk).await?;

		if n == 0 {
			break;
		}

		received.extend_from_slice(&chunk[..n]);
	}

	writer.await?;

	let mut expected = Vec::with_capacity(PATTERN_LEN * COPIES);

	for _ in 0..COPIES {
		expected.extend_from_slice(&pattern);
	}

	assert_eq!(received, expected);

	Ok(())
}

/// S4: A waits for readability, B waits for writability, both on the same
/// socketpair endpoint. B must complete first (the send buffer starts out
/// writable); only after a byte lands on the peer end does A complete.
#[cone_rt::test]
async fn concurrent_iowait_on_one_fd_resolves_independently() -> cone_rt::Result<()> {
	use std::os::fd::AsRawFd;

	let (x, y) = socketpair()?;
	let fd = x.as_raw_fd();
	let order = Rc::new(RefCell::new(Vec::new()));

	let order_a = Rc::clone(&order);
	let a = spawn(async move {
		iowait(fd, Direction::Read).await?;
		order_a.borrow_mut().push("read");

		Ok::<_, Error>(())
	});

	let order_b = Rc::clone(&order);
	let b = spawn(async move {
		iowait(fd, Direction::Write).await?;
		order_b.borrow_mut().push("write");

		Ok::<_, Error>(())
	});

	b.await?;

	assert_eq!(*order.borrow(), vec!["write"], "writability should resolve without any peer I/O");

	write_all(y.as_fd(), b"!").await?;
	a.await?;

	assert_eq!(*order.borrow(), vec!["write", "read"]);

	Ok(())
}
