//! Testable property 3: timers scheduled at non-decreasing deadlines fire in
//! that order, modulo simultaneity.

use std::cell::RefCell;
use std::rc::Rc;
use std::time::Duration;

use cone_rt::{sleep, spawn};

#[cone_rt::test]
async fn timers_fire_in_deadline_order() -> cone_rt::Result<()> {
	let order = Rc::new(RefCell::new(Vec::new()));
	let mut handles = Vec::new();

	for (i, millis) in [80u64, 20, 60, 40, 100, 0].into_iter().enumerate() {
		let order = Rc::clone(&order);

		handles.push(spawn(async move {
			sleep(Duration::from_millis(millis)).await?;
			order.borrow_mut().push(i);

			Ok::<_, cone_rt::Error>(())
		}));
	}

	for handle in handles {
		handle.await?;
	}

	// schedule indices sorted by deadline: 0ms(idx5), 20ms(idx1), 40ms(idx3),
	// 60ms(idx2), 80ms(idx0), 100ms(idx4)
	assert_eq!(*order.borrow(), vec![5, 1, 3, 2, 0, 4]);

	Ok(())
}

/// A chain of `sleep`s across multiple spawned tasks takes at least as long
/// as their sum along the slowest path, and `Runtime::block_on` doesn't spin
/// — it waits on the selector between due deadlines.
#[cone_rt::test]
async fn sleep_is_additive_along_a_dependency_chain() -> cone_rt::Result<()> {
	let start = std::time::Instant::now();

	let first = spawn(async {
		sleep(Duration::from_millis(50)).await?;

		Ok::<_, cone_rt::Error>(10)
	});

	let a = first.await?;
	let second = spawn(async move {
		sleep(Duration::from_millis(50)).await?;

		Ok::<_, cone_rt::Error>(a + 1)
	});

	let result = second.await?;

	assert_eq!(result, 11);
	assert!(start.elapsed() >= Duration::from_millis(100));

	Ok(())
}
