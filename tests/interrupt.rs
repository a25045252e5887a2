//! Testable property 4: `cancel` is edge-triggered and is only observed at
//! the next suspension point within the target, never earlier and never
//! spuriously.

use std::cell::RefCell;
use std::rc::Rc;
use std::time::Duration;

use cone_rt::{cancel, sleep, spawn, yield_now, Error};

#[cone_rt::test]
async fn cancel_wakes_a_sleeping_task_with_an_error() -> cone_rt::Result<()> {
	let task = spawn(async {
		sleep(Duration::from_secs(5)).await?;

		Ok::<_, Error>(())
	});

	// give the task a chance to register its sleep before we cancel it
	yield_now().await?;
	yield_now().await?;

	cancel(&task).expect("cancelling a running task from the outside must succeed");

	let result = task.await;

	assert!(matches!(result, Err(Error::Cancelled)));

	Ok(())
}

#[cone_rt::test]
async fn cancelling_an_already_finished_task_is_a_no_op() -> cone_rt::Result<()> {
	let task = spawn(async { Ok::<_, Error>(7) });

	// a synchronous body finishes the first time the reactor polls it; one
	// yield is enough to guarantee that turn has happened
	yield_now().await?;

	// cancel() after completion must be harmless, not an error
	cancel(&task).unwrap();

	let result = task.await?;

	assert_eq!(result, 7);

	Ok(())
}

/// A task cannot cancel itself through the `JoinHandle` API (it would need
/// its own handle and there would be no task left to observe the result);
/// the call fails immediately instead of touching any state.
#[cone_rt::test]
async fn self_cancel_is_rejected() -> cone_rt::Result<()> {
	let handle_cell: Rc<RefCell<Option<cone_rt::JoinHandle<()>>>> = Rc::new(RefCell::new(None));
	let observed = Rc::new(RefCell::new(false));

	let cell = Rc::clone(&handle_cell);
	let observed_inner = Rc::clone(&observed);

	let task = spawn(async move {
		loop {
			if let Some(handle) = cell.borrow().as_ref() {
				let err = cancel(handle).unwrap_err();

				assert!(matches!(err, Error::Cancelled));
				*observed_inner.borrow_mut() = true;

				break;
			}

			yield_now().await?;
		}

		Ok(())
	});

	*handle_cell.borrow_mut() = Some(task);

	#[allow(clippy::unwrap_used)]
	handle_cell.borrow_mut().take().unwrap().await?;

	assert!(*observed.borrow());

	Ok(())
}

/// Cancelling from another coroutine doesn't take effect mid-statement: the
/// target keeps running until its next suspension point.
#[cone_rt::test]
async fn cancel_does_not_preempt_mid_run() -> cone_rt::Result<()> {
	let steps = Rc::new(RefCell::new(0u32));
	let steps_inner = Rc::clone(&steps);

	let task = spawn(async move {
		for _ in 0..3 {
			*steps_inner.borrow_mut() += 1;
			yield_now().await?;
		}

		sleep(Duration::from_secs(5)).await?;

		Ok::<_, Error>(())
	});

	cancel(&task).unwrap();

	let result = task.await;

	assert!(matches!(result, Err(Error::Cancelled)));
	// the loop body ran at least once before cancellation was observed
	assert!(*steps.borrow() >= 1);

	Ok(())
}

/// A coroutine may catch the `Cancelled` a suspension point raises and keep
/// running: the latch is one-shot, so the next suspension point only
/// observes it again if `cancel` fires a second time. The handle's
/// `is_cancelled` stays `true` throughout, since it reports "was this task
/// ever cancelled", not "is there a pending cancellation to observe".
#[cone_rt::test]
async fn swallowing_cancellation_lets_the_task_keep_running() -> cone_rt::Result<()> {
	let cancel_cell: Rc<RefCell<Option<cone_rt::Cancel>>> = Rc::new(RefCell::new(None));
	let cell = Rc::clone(&cancel_cell);

	let task = spawn(async move {
		loop {
			if cell.borrow().is_some() {
				break;
			}

			yield_now().await?;
		}

		// first suspension point after `cancel` fires: observe and swallow it
		let first = yield_now().await;

		assert!(matches!(first, Err(Error::Cancelled)));

		// the latch was consumed; this suspension point runs clean
		yield_now().await?;

		Ok::<_, Error>(42)
	});

	*cancel_cell.borrow_mut() = Some(task.cancel_token());

	// give the task a chance to observe the cancel token and block on yield_now
	yield_now().await?;
	yield_now().await?;

	let token = cancel_cell.borrow().clone().unwrap();

	token.cancel();

	let result = task.await?;

	assert_eq!(result, 42);
	assert!(token.is_cancelled());

	Ok(())
}
