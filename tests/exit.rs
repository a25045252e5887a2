//! Error-handling design's "print on drop unless observed" rule: a failed
//! coroutine that is joined transfers its error to the joiner; one that's
//! dropped without ever being joined logs it via `tracing` instead of
//! silently discarding it.

use std::sync::{Arc, Mutex};

use cone_rt::{spawn, Error, Runtime};
use tracing_subscriber::fmt::MakeWriter;

#[derive(Clone)]
struct CapturedWriter(Arc<Mutex<Vec<u8>>>);

impl std::io::Write for CapturedWriter {
	fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
		#[allow(clippy::unwrap_used)]
		self.0.lock().unwrap().extend_from_slice(buf);

		Ok(buf.len())
	}

	fn flush(&mut self) -> std::io::Result<()> {
		Ok(())
	}
}

impl<'a> MakeWriter<'a> for CapturedWriter {
	type Writer = Self;

	fn make_writer(&'a self) -> Self::Writer {
		self.clone()
	}
}

#[test]
fn joined_failure_is_returned_to_the_joiner() {
	let runtime = Runtime::new().unwrap();

	runtime.block_on(async {
		let task = spawn(async { Err::<(), _>(Error::Assert("deliberate test failure".into())) });
		let result = task.await;

		assert!(matches!(result, Err(Error::Assert(_))));
	});
}

#[test]
fn dropped_unobserved_failure_is_logged_not_panicked() {
	let log = Arc::new(Mutex::new(Vec::new()));
	let writer = CapturedWriter(Arc::clone(&log));
	let subscriber = tracing_subscriber::fmt().with_writer(writer).finish();

	tracing::subscriber::with_default(subscriber, || {
		let runtime = Runtime::new().unwrap();

		runtime.block_on(async {
			// dropped immediately: nothing ever awaits this task's result
			drop(spawn(async { Err::<(), _>(Error::Assert("nobody is watching".into())) }));

			// give the reactor a turn to actually poll the task to completion
			cone_rt::yield_now().await.unwrap();
			cone_rt::yield_now().await.unwrap();
		});
	});

	#[allow(clippy::unwrap_used)]
	let output = String::from_utf8(log.lock().unwrap().clone()).unwrap();

	assert!(
		output.contains("nobody is watching"),
		"expected the dropped task's error to be logged, got: {output}"
	);
}
