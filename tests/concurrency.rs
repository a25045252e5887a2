//! Scheduling/join scenarios: S1 (sleep concurrency) and S2 (yield fairness)
//! from the specification's testable-properties section, plus plain
//! spawn/join plumbing for bodies that complete synchronously vs. ones that
//! suspend first.

use std::cell::RefCell;
use std::rc::Rc;
use std::time::{Duration, Instant};

use cone_rt::{sleep, spawn, yield_now};

async fn sync_complete() -> cone_rt::Result<i32> {
	Ok(23)
}

async fn async_complete() -> cone_rt::Result<i32> {
	sleep(Duration::from_millis(20)).await?;

	Ok(23)
}

#[cone_rt::test]
async fn join_sync_and_async_bodies() -> cone_rt::Result<()> {
	let a = spawn(sync_complete()).await?;
	let b = spawn(async_complete()).await?;

	assert_eq!(a, 23);
	assert_eq!(b, 23);

	Ok(())
}

#[cone_rt::test]
async fn sleep_concurrency() -> cone_rt::Result<()> {
	let order = Rc::new(RefCell::new(Vec::new()));
	let start = Instant::now();

	let order_a = Rc::clone(&order);
	let a = spawn(async move {
		sleep(Duration::from_millis(500)).await?;
		order_a.borrow_mut().push("short");

		Ok::<_, cone_rt::Error>(())
	});

	let order_b = Rc::clone(&order);
	let b = spawn(async move {
		sleep(Duration::from_millis(1000)).await?;
		order_b.borrow_mut().push("long");

		Ok::<_, cone_rt::Error>(())
	});

	a.await?;
	b.await?;

	let elapsed = start.elapsed();

	assert!(elapsed >= Duration::from_millis(1000));
	assert!(elapsed < Duration::from_millis(1400), "elapsed = {elapsed:?}");
	assert_eq!(*order.borrow(), vec!["short", "long"]);

	Ok(())
}

/// S2, scaled down from the specification's 1,000,000 so the suite stays
/// fast: every `yield_now` must complete without error and hand control back
/// to a concurrently spawned task often enough that both make progress.
#[cone_rt::test]
async fn yield_fairness() -> cone_rt::Result<()> {
	let counter = Rc::new(RefCell::new(0u32));

	let counter_b = Rc::clone(&counter);
	let b = spawn(async move {
		for _ in 0..5_000 {
			*counter_b.borrow_mut() += 1;
			yield_now().await?;
		}

		Ok::<_, cone_rt::Error>(())
	});

	for _ in 0..5_000 {
		yield_now().await?;
	}

	let seen_before_b_finished = *counter.borrow();

	b.await?;

	assert!(
		seen_before_b_finished > 0,
		"yielding gave the other task no chance to run"
	);
	assert_eq!(*counter.borrow(), 5_000);

	Ok(())
}

/// A task that's dropped without ever being joined still runs to completion
/// (the reactor, not the `JoinHandle`, is what keeps it alive).
#[cone_rt::test]
async fn fire_and_forget_still_runs() -> cone_rt::Result<()> {
	let ran = Rc::new(RefCell::new(false));
	let ran2 = Rc::clone(&ran);

	drop(spawn(async move {
		sleep(Duration::from_millis(20)).await?;
		*ran2.borrow_mut() = true;

		Ok::<_, cone_rt::Error>(())
	}));

	sleep(Duration::from_millis(60)).await?;

	assert!(*ran.borrow());

	Ok(())
}
