//! RPC channel (component J): a framed, one-to-one request/response
//! multiplexer over a duplex, non-blocking file descriptor.
//!
//! A [`Channel`] wraps one fd. Outbound requests are multiplexed by a
//! per-call id onto a single write buffer drained by a lazily spawned
//! writer task; inbound bytes are parsed into frames by [`Channel::run`],
//! which dispatches each one either to a registered [exported
//! method](Channel::export) or to the waiting [`PendingCall`] it answers.

use std::cell::{Cell, RefCell};
use std::future::Future;
use std::os::fd::{AsFd, OwnedFd};
use std::pin::Pin;
use std::rc::Rc;

use crate::codec::{self, DecodeTuple, EncodeTuple};
use crate::error::{Error, Result};
use crate::event_list::EventList;
use crate::io;
use crate::ops::{spawn, wait, JoinHandle};

/// The channel size limit negotiated by `nero`/`romp`-style peers absent any
/// other agreement.
pub const DEFAULT_MAX_FRAME_SIZE: u32 = 65535;

/// Writer chunk size: large enough to amortize syscalls, small enough to sit
/// comfortably on the stack across the `write(2)` await point while
/// `write_buf` keeps growing underneath it.
const WRITE_CHUNK: usize = 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FrameKind {
	Request,
	Response,
	ResponseError
}

impl FrameKind {
	const fn to_u8(self) -> u8 {
		match self {
			Self::Request => 0,
			Self::Response => 1,
			Self::ResponseError => 2
		}
	}

	fn from_u8(byte: u8) -> Result<Self> {
		match byte {
			0 => Ok(Self::Request),
			1 => Ok(Self::Response),
			2 => Ok(Self::ResponseError),
			other => Err(Error::protocol(format!("unknown frame type {other}")))
		}
	}
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CallState {
	Unset,
	Ok,
	Error,
	Cancel
}

struct PendingCall {
	id: u32,
	state: Cell<CallState>,
	response: RefCell<Vec<u8>>,
	wake: EventList
}

/// The boxed, non-`Send` future an exported method handler returns.
type HandlerFuture = Pin<Box<dyn Future<Output = Result<Vec<u8>>>>>;

/// A type-erased exported method: already-encoded bytes in, already-encoded
/// bytes (or an error) out. [`Channel::export`] is the typed façade over
/// this that most callers use.
type HandlerFn = Rc<dyn Fn(Vec<u8>) -> HandlerFuture>;

struct ExportedMethod {
	name: String,
	handler: HandlerFn
}

/// A framed request/response multiplexer over one duplex fd.
///
/// Constructed with [`Channel::new`]; the inbound half only runs once
/// [`Channel::run`] (or [`Channel::spawn_reader`]) is spawned onto the
/// current reactor. The outbound writer task is spawned lazily, the first
/// time a frame needs to go out.
pub struct Channel {
	fd: OwnedFd,
	last_id: Cell<u32>,
	writer: RefCell<Option<JoinHandle<Result<()>>>>,
	read_buf: RefCell<Vec<u8>>,
	write_buf: RefCell<Vec<u8>>,
	pending: RefCell<Vec<Rc<PendingCall>>>,
	exported: RefCell<Vec<ExportedMethod>>,
	max_frame_size: u32,
	finalized: Cell<bool>
}

impl Channel {
	/// Builds a channel over `fd` with [`DEFAULT_MAX_FRAME_SIZE`].
	#[must_use]
	pub fn new(fd: OwnedFd) -> Rc<Self> {
		Self::with_max_frame_size(fd, DEFAULT_MAX_FRAME_SIZE)
	}

	/// Builds a channel over `fd` with a caller-chosen frame size cap. Both
	/// peers must agree on this value; a frame declaring a size larger than
	/// what the *receiver* configured here terminates the channel with
	/// [`Error::Protocol`].
	#[must_use]
	pub fn with_max_frame_size(fd: OwnedFd, max_frame_size: u32) -> Rc<Self> {
		Rc::new(Self {
			fd,
			last_id: Cell::new(0),
			writer: RefCell::new(None),
			read_buf: RefCell::new(Vec::new()),
			write_buf: RefCell::new(Vec::new()),
			pending: RefCell::new(Vec::new()),
			exported: RefCell::new(Vec::new()),
			max_frame_size,
			finalized: Cell::new(false)
		})
	}

	/// Registers `name` as an invocable method. `handler` is called with the
	/// decoded arguments for every inbound request naming it; its result is
	/// encoded under `out_sig` and sent back as a `Response`, or as a
	/// `ResponseError` if either the handler or the encode step fails.
	pub fn export<A, R, F, Fut>(
		&self, name: impl Into<String>, in_sig: impl Into<String>, out_sig: impl Into<String>,
		handler: F
	) where
		A: DecodeTuple + 'static,
		R: EncodeTuple + 'static,
		F: Fn(A) -> Fut + 'static,
		Fut: Future<Output = Result<R>> + 'static
	{
		let in_sig = in_sig.into();
		let out_sig = out_sig.into();
		let handler = Rc::new(handler);

		let erased: HandlerFn = Rc::new(move |input: Vec<u8>| {
			let handler = Rc::clone(&handler);
			let in_sig = in_sig.clone();
			let out_sig = out_sig.clone();

			Box::pin(async move {
				let args: A = codec::decode(&in_sig, &input)?;
				let result = handler(args).await?;

				codec::encode(&out_sig, &result)
			})
		});

		self.exported.borrow_mut().push(ExportedMethod {
			name: name.into(),
			handler: erased
		});
	}

	/// Removes a previously [`Channel::export`]ed method. No-op if `name`
	/// isn't registered.
	pub fn unexport(&self, name: &str) {
		self.exported.borrow_mut().retain(|method| method.name != name);
	}

	/// Issues a request for `name`, encoding `args` under `in_sig` and
	/// decoding the reply under `out_sig`. Suspends the caller until a
	/// matching `Response`/`ResponseError` frame arrives, the channel is
	/// finalized, or the wait is cancelled.
	///
	/// # Errors
	/// [`Error::Remote`] if the peer's handler failed; [`Error::Cancelled`]
	/// if this call (or the channel) was cancelled first; a codec error if
	/// `args`/the reply don't match their signatures.
	pub async fn call<A, R>(self: &Rc<Self>, name: &str, in_sig: &str, out_sig: &str, args: A) -> Result<R>
	where
		A: EncodeTuple,
		R: DecodeTuple
	{
		let payload = codec::encode(in_sig, &args)?;
		let raw = self.call_raw(name, payload).await?;

		codec::decode(out_sig, &raw)
	}

	async fn call_raw(self: &Rc<Self>, name: &str, payload: Vec<u8>) -> Result<Vec<u8>> {
		let id = self.last_id.get().wrapping_add(1);

		self.last_id.set(id);

		let call = Rc::new(PendingCall {
			id,
			state: Cell::new(CallState::Unset),
			response: RefCell::new(Vec::new()),
			wake: EventList::new()
		});

		self.pending.borrow_mut().push(Rc::clone(&call));

		let mut frame = Vec::with_capacity(name.len() + 1 + payload.len());

		frame.extend_from_slice(name.as_bytes());
		frame.push(0);
		frame.extend_from_slice(&payload);

		if let Err(err) = self.enqueue_frame(FrameKind::Request, id, &frame) {
			self.pending.borrow_mut().retain(|pending| pending.id != id);

			return Err(err);
		}

		let result = match wait(&call.wake).await {
			Err(err) => Err(err),
			Ok(()) => match call.state.get() {
				CallState::Ok => Ok(call.response.borrow().clone()),
				CallState::Error => Err(decode_remote_error(&call.response.borrow())?),
				CallState::Unset | CallState::Cancel => Err(Error::Cancelled)
			}
		};

		self.pending.borrow_mut().retain(|pending| pending.id != id);

		result
	}

	fn complete_pending(&self, id: u32, state: CallState, payload: Vec<u8>) {
		let pending = self.pending.borrow();

		let Some(call) = pending.iter().find(|call| call.id == id) else {
			/* late response for an id we've already given up on; discard */
			return;
		};

		*call.response.borrow_mut() = payload;
		call.state.set(state);
		call.wake.emit();
	}

	/// Drives the inbound half: parses frames off `fd` and dispatches each
	/// one until the peer closes the connection (`Ok(())`) or a protocol
	/// violation occurs (`Err`).
	///
	/// Typically spawned once per channel via [`Channel::spawn_reader`].
	pub async fn run(self: Rc<Self>) -> Result<()> {
		loop {
			let Some(frame) = self.read_frame().await? else {
				return Ok(());
			};

			match frame.kind {
				FrameKind::Request => self.handle_request(frame.id, frame.payload).await?,
				FrameKind::Response => self.complete_pending(frame.id, CallState::Ok, frame.payload),
				FrameKind::ResponseError => {
					self.complete_pending(frame.id, CallState::Error, frame.payload);
				}
			}
		}
	}

	/// Convenience over `spawn(channel.clone().run())`.
	pub fn spawn_reader(self: &Rc<Self>) -> JoinHandle<Result<()>> {
		spawn(Rc::clone(self).run())
	}

	async fn handle_request(self: &Rc<Self>, id: u32, payload: Vec<u8>) -> Result<()> {
		let Some(nul) = payload.iter().position(|&byte| byte == 0) else {
			return Err(Error::protocol("request frame missing NUL-terminated method name"));
		};

		let name = String::from_utf8_lossy(&payload[..nul]).into_owned();
		let args = payload[nul + 1..].to_vec();

		let handler = self
			.exported
			.borrow()
			.iter()
			.find(|method| method.name == name)
			.map(|method| Rc::clone(&method.handler));

		let Some(handler) = handler else {
			return self.send_error(id, &Error::NotExported(name));
		};

		match handler(args).await {
			Ok(output) => {
				if let Err(err) = self.send_response(id, &output) {
					self.send_error(id, &err)?;
				}

				Ok(())
			}
			Err(err) => self.send_error(id, &err)
		}
	}

	fn send_response(self: &Rc<Self>, id: u32, payload: &[u8]) -> Result<()> {
		self.enqueue_frame(FrameKind::Response, id, payload)
	}

	fn send_error(self: &Rc<Self>, id: u32, err: &Error) -> Result<()> {
		let text = err.to_string();
		let name = err.wire_name();
		let mut payload = Vec::with_capacity(4 + name.len() + 1 + text.len() + 1);

		payload.extend_from_slice(&err.wire_code().to_be_bytes());
		payload.extend_from_slice(name.as_bytes());
		payload.push(0);
		payload.extend_from_slice(text.as_bytes());
		payload.push(0);

		self.enqueue_frame(FrameKind::ResponseError, id, &payload)
	}

	fn enqueue_frame(self: &Rc<Self>, kind: FrameKind, id: u32, payload: &[u8]) -> Result<()> {
		let size = u32::try_from(payload.len()).map_err(|_| Error::Overflow)?;

		if size > self.max_frame_size {
			return Err(Error::Overflow);
		}

		let mut frame = Vec::with_capacity(8 + payload.len());
		let size_be = size.to_be_bytes();

		frame.push(kind.to_u8());
		frame.extend_from_slice(&size_be[1..]);
		frame.extend_from_slice(&id.to_be_bytes());
		frame.extend_from_slice(payload);

		self.write_buf.borrow_mut().extend_from_slice(&frame);
		self.ensure_writer();

		Ok(())
	}

	fn ensure_writer(self: &Rc<Self>) {
		let mut writer = self.writer.borrow_mut();
		let needs_spawn = match writer.as_ref() {
			Some(handle) => handle.is_finished(),
			None => true
		};

		if needs_spawn {
			let channel = Rc::clone(self);

			*writer = Some(spawn(async move { channel.run_writer().await }));
		}
	}

	async fn run_writer(self: Rc<Self>) -> Result<()> {
		loop {
			let mut chunk = [0u8; WRITE_CHUNK];
			let n = {
				let buf = self.write_buf.borrow();
				let n = buf.len().min(chunk.len());

				chunk[..n].copy_from_slice(&buf[..n]);
				n
			};

			if n == 0 {
				return Ok(());
			}

			io::write_all(self.fd.as_fd(), &chunk[..n]).await?;
			self.write_buf.borrow_mut().drain(..n);
		}
	}

	fn try_parse_frame(&self) -> Result<Option<RawFrame>> {
		let mut buf = self.read_buf.borrow_mut();

		if buf.len() < 8 {
			return Ok(None);
		}

		let kind = FrameKind::from_u8(buf[0])?;
		let size = (u32::from(buf[1]) << 16) | (u32::from(buf[2]) << 8) | u32::from(buf[3]);

		if size > self.max_frame_size {
			return Err(Error::protocol(format!(
				"received frame of size {size} exceeds the configured maximum of {}",
				self.max_frame_size
			)));
		}

		let id = u32::from_be_bytes([buf[4], buf[5], buf[6], buf[7]]);
		let total = 8 + size as usize;

		if buf.len() < total {
			return Ok(None);
		}

		let payload = buf[8..total].to_vec();

		buf.drain(..total);

		Ok(Some(RawFrame { kind, id, payload }))
	}

	async fn read_frame(&self) -> Result<Option<RawFrame>> {
		loop {
			if let Some(frame) = self.try_parse_frame()? {
				return Ok(Some(frame));
			}

			let mut chunk = [0u8; 4096];
			let n = io::read(self.fd.as_fd(), &mut chunk).await?;

			if n == 0 {
				return Ok(None);
			}

			self.read_buf.borrow_mut().extend_from_slice(&chunk[..n]);
		}
	}

	/// Finalizes the channel: every pending call is forced into
	/// [`Error::Cancelled`] and woken, exported methods are dropped, and the
	/// writer task is cancelled. Idempotent. The fd itself closes once the
	/// last `Rc<Channel>` (this one plus the reader/writer tasks') drops.
	pub fn fini(&self) {
		if self.finalized.replace(true) {
			return;
		}

		self.exported.borrow_mut().clear();

		for call in self.pending.borrow().iter() {
			call.state.set(CallState::Cancel);
			call.wake.emit();
		}

		if let Some(writer) = self.writer.borrow_mut().take() {
			let _ = crate::ops::cancel(&writer);
		}
	}
}

struct RawFrame {
	kind: FrameKind,
	id: u32,
	payload: Vec<u8>
}

fn decode_remote_error(bytes: &[u8]) -> Result<Error> {
	if bytes.len() < 4 {
		return Err(Error::protocol("response-error frame shorter than its code field"));
	}

	let code = u32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]);
	let rest = &bytes[4..];
	let name_end = rest
		.iter()
		.position(|&byte| byte == 0)
		.ok_or_else(|| Error::protocol("response-error frame missing name terminator"))?;
	let name = String::from_utf8_lossy(&rest[..name_end]).into_owned();
	let text_bytes = &rest[name_end + 1..];
	let text_end = text_bytes.iter().position(|&byte| byte == 0).unwrap_or(text_bytes.len());
	let text = String::from_utf8_lossy(&text_bytes[..text_end]).into_owned();

	Ok(Error::Remote { code, name, text })
}

#[cfg(test)]
mod tests {
	use std::cell::Cell as StdCell;
	use std::rc::Rc;
	use std::time::Duration;

	use super::*;
	use crate::io::socketpair;
	use crate::ops::{sleep, spawn};
	use crate::runtime::Runtime;

	#[test]
	fn add_roundtrips_four_thousand_concurrent_calls() {
		let runtime = Runtime::new().unwrap();

		runtime.block_on(async {
			let (a, b) = socketpair().unwrap();
			let server = Channel::new(a);
			let client = Channel::new(b);

			let total = Rc::new(StdCell::new(0i32));
			let totals = Rc::clone(&total);

			server.export::<(i32,), i32, _, _>("add", "i4", "i4", move |(delta,)| {
				let totals = Rc::clone(&totals);

				async move {
					let sum = totals.get() + delta;

					totals.set(sum);

					Ok(sum)
				}
			});

			let _server_reader = server.spawn_reader();
			let _client_reader = client.spawn_reader();

			let mut handles = Vec::new();

			for _ in 0..4096 {
				let client = Rc::clone(&client);

				handles.push(spawn(async move {
					client.call::<(i32,), i32>("add", "i4", "i4", (1,)).await
				}));
			}

			let mut seen = std::collections::HashSet::new();

			for handle in handles {
				let value = handle.await.unwrap();

				assert!((1..=4096).contains(&value));
				assert!(seen.insert(value), "duplicate observed sum {value}");
			}

			assert_eq!(total.get(), 4096);
		});
	}

	#[test]
	fn unknown_method_becomes_remote_not_exported() {
		let runtime = Runtime::new().unwrap();

		runtime.block_on(async {
			let (a, b) = socketpair().unwrap();
			let server = Channel::new(a);
			let client = Channel::new(b);

			let _server_reader = server.spawn_reader();
			let _client_reader = client.spawn_reader();

			let err = client.call::<(i32,), i32>("missing", "i4", "i4", (1,)).await.unwrap_err();

			assert!(matches!(err, Error::Remote { name, .. } if name == "NOT_EXPORTED"));
		});
	}

	#[test]
	fn bad_argument_signature_surfaces_as_remote_error() {
		let runtime = Runtime::new().unwrap();

		runtime.block_on(async {
			let (a, b) = socketpair().unwrap();
			let server = Channel::new(a);
			let client = Channel::new(b);

			server.export::<(i32,), i32, _, _>("add", "i4", "i4", |(delta,)| async move { Ok(delta) });

			let _server_reader = server.spawn_reader();
			let _client_reader = client.spawn_reader();

			/* empty signature: server expects one i4 argument and gets none */
			let err = client.call::<(), i32>("add", "", "i4", ()).await.unwrap_err();

			assert!(matches!(err, Error::Remote { .. }));
		});
	}

	#[test]
	fn peer_close_ends_run_cleanly() {
		let runtime = Runtime::new().unwrap();

		runtime.block_on(async {
			let (a, b) = socketpair().unwrap();
			let server = Channel::new(a);
			let client = Channel::new(b);

			let reader = server.spawn_reader();

			drop(client);
			sleep(Duration::from_millis(50)).await.unwrap();

			reader.await.unwrap();
		});
	}
}
