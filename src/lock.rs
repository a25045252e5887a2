//! Distributed mutual exclusion (component L): a Ricart–Agrawala-style,
//! Lamport-clocked lock shared by a fixed set of peers reachable through RPC
//! [`Channel`]s.
//!
//! Every participant runs its own [`Lock`], `add`ing one peer channel per
//! other participant. `acquire`/`release` broadcast a `request`/`release`
//! call to every peer and only consider the lock held once this
//! participant's queue entry — ordered by `(Lamport time, pid)` — sits at
//! the front of every participant's queue, itself included.

use std::cell::{Cell, RefCell};
use std::rc::Rc;

use crate::error::{Error, Result};
use crate::event_list::EventList;
use crate::ops::{spawn, wait, JoinHandle};
use crate::rpc::Channel;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
struct QueueEntry {
	time: u32,
	pid: u32
}

#[derive(Debug, Clone, Copy, Default)]
struct LockFlags {
	/// We've broadcast a request and are waiting on every peer's ack.
	requested: bool,
	/// Every peer has acked our current request.
	acked: bool,
	/// `fini` was called; no further acquire may succeed.
	cancelled: bool,
	/// Nested `acquire` calls held by this participant.
	recursion: u32
}

struct Peer {
	channel: Rc<Channel>,
	/// Learned the first time this peer's `request` or `release` method is
	/// invoked on us; `None` until then.
	remote_pid: Cell<Option<u32>>,
	request_name: String,
	release_name: String
}

/// One participant's view of the distributed lock.
///
/// Cheap to construct; the real cost is in [`Lock::add`]ing peers and the
/// broadcasts `acquire`/`release` perform over them.
pub struct Lock {
	pid: u32,
	time: Cell<u32>,
	state: Cell<LockFlags>,
	wake: EventList,
	peers: RefCell<Vec<Rc<Peer>>>,
	queue: RefCell<Vec<QueueEntry>>
}

impl Lock {
	/// Creates a lock for participant `pid`. Every participant in the group
	/// must use a distinct `pid`.
	#[must_use]
	pub fn new(pid: u32) -> Rc<Self> {
		Rc::new(Self {
			pid,
			time: Cell::new(0),
			state: Cell::new(LockFlags::default()),
			wake: EventList::new(),
			peers: RefCell::new(Vec::new()),
			queue: RefCell::new(Vec::new())
		})
	}

	#[must_use]
	pub fn pid(&self) -> u32 {
		self.pid
	}

	/// Whether this participant currently holds the lock (`acquire` has
	/// returned at least once more than `release`).
	#[must_use]
	pub fn is_held(&self) -> bool {
		self.state.get().recursion > 0
	}

	/// Registers a peer reachable through `channel`, exporting the
	/// `request_name`/`release_name` methods it will call on us. Calling
	/// this after `acquire`/`release` calls are already in flight is
	/// supported but not required by any scenario this lock is built for.
	pub fn add(
		self: &Rc<Self>, channel: Rc<Channel>, request_name: impl Into<String>,
		release_name: impl Into<String>
	) {
		let request_name = request_name.into();
		let release_name = release_name.into();

		let peer = Rc::new(Peer {
			channel: Rc::clone(&channel),
			remote_pid: Cell::new(None),
			request_name: request_name.clone(),
			release_name: release_name.clone()
		});

		self.peers.borrow_mut().push(Rc::clone(&peer));

		let lock = Rc::clone(self);
		let on_request = Rc::clone(&peer);

		channel.export::<(u32, u32), u32, _, _>(request_name, "u4 u4", "u4", move |(remote_pid, remote_time)| {
			let lock = Rc::clone(&lock);
			let peer = Rc::clone(&on_request);

			async move { Ok(lock.on_remote_request(&peer, remote_pid, remote_time)) }
		});

		let lock = Rc::clone(self);
		let on_release = Rc::clone(&peer);

		channel.export::<(u32, u32), u32, _, _>(release_name, "u4 u4", "u4", move |(remote_pid, remote_time)| {
			let lock = Rc::clone(&lock);
			let peer = Rc::clone(&on_release);

			async move { Ok(lock.on_remote_release(&peer, remote_pid, remote_time)) }
		});
	}

	/// Unregisters a previously [`Lock::add`]ed peer. If that peer's queue
	/// entry was at the front, other participants (and this one) may now be
	/// able to proceed, so waiters are woken.
	pub fn del(self: &Rc<Self>, channel: &Rc<Channel>) {
		let removed = {
			let mut peers = self.peers.borrow_mut();
			let idx = peers.iter().position(|peer| Rc::ptr_eq(&peer.channel, channel));

			idx.map(|idx| peers.remove(idx))
		};

		let Some(peer) = removed else {
			return;
		};

		peer.channel.unexport(&peer.request_name);
		peer.channel.unexport(&peer.release_name);

		if let Some(remote_pid) = peer.remote_pid.get() {
			let was_head = self.queue.borrow().first().is_some_and(|entry| entry.pid == remote_pid);

			self.remove_queue(remote_pid);

			if was_head {
				self.try_wake();
			}
		}
	}

	/// Finalizes the lock: no further `acquire` can succeed, every exported
	/// method is unregistered from every peer, and anything blocked in
	/// `acquire` wakes up to observe [`Error::Cancelled`].
	pub fn fini(self: &Rc<Self>) {
		let mut flags = self.state.get();

		flags.cancelled = true;
		self.state.set(flags);

		for peer in self.peers.borrow_mut().drain(..) {
			peer.channel.unexport(&peer.request_name);
			peer.channel.unexport(&peer.release_name);
		}

		self.wake.emit();
	}

	fn is_locally_acquired(&self) -> bool {
		let flags = self.state.get();

		flags.acked && self.queue.borrow().first().is_some_and(|entry| entry.pid == self.pid)
	}

	fn try_wake(&self) {
		if self.is_locally_acquired() {
			self.wake.emit();
		}
	}

	fn insert_queue(&self, time: u32, pid: u32) {
		let mut queue = self.queue.borrow_mut();
		let entry = QueueEntry { time, pid };
		let idx = queue.binary_search(&entry).unwrap_or_else(|idx| idx);

		queue.insert(idx, entry);
	}

	fn remove_queue(&self, pid: u32) {
		self.queue.borrow_mut().retain(|entry| entry.pid != pid);
	}

	fn on_remote_request(&self, peer: &Peer, remote_pid: u32, remote_time: u32) -> u32 {
		peer.remote_pid.set(Some(remote_pid));

		let time = self.time.get().max(remote_time) + 1;

		self.time.set(time);
		self.insert_queue(remote_time, remote_pid);

		time
	}

	fn on_remote_release(&self, peer: &Peer, remote_pid: u32, remote_time: u32) -> u32 {
		peer.remote_pid.set(Some(remote_pid));

		let time = self.time.get().max(remote_time) + 1;

		self.time.set(time);

		let was_head = self.queue.borrow().first().is_some_and(|entry| entry.pid == remote_pid);

		self.remove_queue(remote_pid);

		if was_head {
			self.try_wake();
		}

		time
	}

	/// Acquires the lock, recursively if already held by this participant.
	/// Broadcasts a request to every peer the first time a non-recursive
	/// acquire is attempted; suspends until this participant's queue entry
	/// reaches the front everywhere.
	///
	/// # Errors
	/// [`Error::Cancelled`] if `fini` was called, or if the broadcast to any
	/// peer fails (in which case the partial request is unconditionally
	/// retracted via a compensating release broadcast before returning).
	pub async fn acquire(self: &Rc<Self>) -> Result<()> {
		loop {
			if self.is_locally_acquired() {
				let mut flags = self.state.get();

				flags.recursion += 1;
				self.state.set(flags);

				return Ok(());
			}

			let flags = self.state.get();

			if flags.cancelled {
				return Err(Error::Cancelled);
			}

			if flags.requested {
				wait(&self.wake).await?;

				continue;
			}

			let mut flags = flags;

			flags.requested = true;
			self.state.set(flags);

			let time = self.time.get() + 1;

			self.time.set(time);
			self.insert_queue(time, self.pid);

			if let Err(err) = self.broadcast_request(time).await {
				let undo_time = self.time.get() + 1;

				self.time.set(undo_time);
				self.remove_queue(self.pid);

				let mut flags = self.state.get();

				flags.requested = false;
				self.state.set(flags);
				self.wake.emit();

				let _ = self.broadcast_release(undo_time).await;

				return Err(err);
			}

			let mut flags = self.state.get();

			flags.acked = true;

			if self.queue.borrow().first().is_some_and(|entry| entry.pid == self.pid) {
				flags.requested = false;
				self.state.set(flags);
				self.wake.emit();
			} else {
				self.state.set(flags);
			}
		}
	}

	/// Releases one level of recursion. Once the recursion count reaches
	/// zero, broadcasts a release to every peer so the next-in-line
	/// participant can proceed.
	///
	/// # Errors
	/// [`Error::Assert`] if called without a matching `acquire`.
	pub async fn release(self: &Rc<Self>) -> Result<()> {
		let mut flags = self.state.get();

		if flags.recursion == 0 {
			return Err(Error::assert("release called without a matching acquire"));
		}

		flags.recursion -= 1;

		if flags.recursion > 0 {
			self.state.set(flags);

			return Ok(());
		}

		let time = self.time.get() + 1;

		self.time.set(time);
		self.remove_queue(self.pid);

		flags.acked = false;
		self.state.set(flags);

		self.broadcast_release(time).await
	}

	async fn broadcast_request(self: &Rc<Self>, time: u32) -> Result<()> {
		self.broadcast(time, |peer| peer.request_name.clone()).await
	}

	async fn broadcast_release(self: &Rc<Self>, time: u32) -> Result<()> {
		self.broadcast(time, |peer| peer.release_name.clone()).await
	}

	/// Calls `method(peer)` on every peer concurrently, each task folding its
	/// own reply into `self.time` as soon as it lands rather than waiting
	/// for a join barrier, so a fast peer's clock advance is visible to
	/// later-completing peers' own folds.
	async fn broadcast(self: &Rc<Self>, time: u32, method: impl Fn(&Peer) -> String) -> Result<()> {
		let peers: Vec<Rc<Peer>> = self.peers.borrow().clone();
		let pid = self.pid;

		let handles: Vec<JoinHandle<Result<()>>> = peers
			.into_iter()
			.map(|peer| {
				let lock = Rc::clone(self);
				let name = method(&peer);

				spawn(async move {
					let new_time: u32 = peer.channel.call(&name, "u4 u4", "u4", (pid, time)).await?;
					let folded = lock.time.get().max(new_time) + 1;

					lock.time.set(folded);

					Ok(())
				})
			})
			.collect();

		let mut first_err = None;

		for handle in handles {
			if let Err(err) = handle.await {
				first_err.get_or_insert(err);
			}
		}

		match first_err {
			Some(err) => Err(err),
			None => Ok(())
		}
	}
}

#[cfg(test)]
mod tests {
	use std::rc::Rc;
	use std::time::Duration;

	use super::*;
	use crate::io::socketpair;
	use crate::ops::{sleep, spawn};
	use crate::runtime::Runtime;

	fn wire(a: &Rc<Lock>, b: &Rc<Lock>) {
		let (fd_a, fd_b) = socketpair().unwrap();
		let channel_a = Channel::new(fd_a);
		let channel_b = Channel::new(fd_b);

		let _reader_a = channel_a.spawn_reader();
		let _reader_b = channel_b.spawn_reader();

		a.add(channel_a, "request", "release");
		b.add(channel_b, "request", "release");
	}

	#[test]
	fn two_peers_never_hold_simultaneously() {
		let runtime = Runtime::new().unwrap();

		runtime.block_on(async {
			let a = Lock::new(1);
			let b = Lock::new(2);

			wire(&a, &b);

			let shared = Rc::new(Cell::new(0i32));

			let mut handles = Vec::new();

			for (lock, delta) in [(Rc::clone(&a), 1), (Rc::clone(&b), -1)] {
				let shared = Rc::clone(&shared);

				handles.push(spawn(async move {
					for _ in 0..200 {
						lock.acquire().await?;

						let before = shared.get();

						shared.set(before + delta);
						sleep(Duration::from_micros(1)).await?;
						assert_eq!(shared.get(), before + delta, "mutual exclusion violated");
						shared.set(before);

						lock.release().await?;
					}

					Ok(())
				}));
			}

			for handle in handles {
				handle.await.unwrap();
			}

			assert_eq!(shared.get(), 0);
		});
	}

	#[test]
	fn recursive_acquire_requires_matching_releases() {
		let runtime = Runtime::new().unwrap();

		runtime.block_on(async {
			let lock = Lock::new(1);

			lock.acquire().await.unwrap();
			lock.acquire().await.unwrap();
			assert!(lock.is_held());

			lock.release().await.unwrap();
			assert!(lock.is_held());

			lock.release().await.unwrap();
			assert!(!lock.is_held());

			assert!(matches!(lock.release().await, Err(Error::Assert(_))));
		});
	}

	#[test]
	fn three_peers_serialize_and_recurse() {
		let runtime = Runtime::new().unwrap();

		runtime.block_on(async {
			let a = Lock::new(1);
			let b = Lock::new(2);
			let c = Lock::new(3);

			wire(&a, &b);
			wire(&a, &c);
			wire(&b, &c);

			let order = Rc::new(RefCell::new(Vec::new()));
			let mut handles = Vec::new();

			for (lock, id) in [(Rc::clone(&a), 1), (Rc::clone(&b), 2), (Rc::clone(&c), 3)] {
				let order = Rc::clone(&order);

				handles.push(spawn(async move {
					lock.acquire().await?;
					lock.acquire().await?;
					order.borrow_mut().push(id);
					lock.release().await?;
					order.borrow_mut().push(-id);
					lock.release().await?;

					Ok(())
				}));
			}

			for handle in handles {
				handle.await.unwrap();
			}

			let order = order.borrow();
			let mut depth = 0i32;

			for &entry in order.iter() {
				depth += if entry > 0 { 1 } else { -1 };
				assert!((0..=1).contains(&depth), "overlapping critical sections: {order:?}");
			}

			assert_eq!(depth, 0);
		});
	}

	#[test]
	fn fini_cancels_a_blocked_waiter() {
		let runtime = Runtime::new().unwrap();

		runtime.block_on(async {
			let lock = Lock::new(1);

			lock.acquire().await.unwrap();

			let other = Rc::clone(&lock);
			let waiter = spawn(async move { other.acquire().await });

			sleep(Duration::from_millis(10)).await.unwrap();
			lock.fini();

			assert!(matches!(waiter.await, Err(Error::Cancelled)));
		});
	}
}
