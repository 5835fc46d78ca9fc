//! Shared-memory mailbox between the coordinating process and its helper.
//!
//! The region is an anonymous `MAP_SHARED` mapping created before the helper
//! is forked, so both processes see the same cells. It holds one state cell,
//! one exit-status cell and a byte buffer for the pending command.
//!
//! ```text
//!         coordinator                      helper
//!  Ack ── put_command + signal(Call) ──▶ Call
//!                                          │ run command, store status
//!  Ack ◀── acknowledge ── read status ◀── Done
//!  Ack ── write(Exit) ─────────────────▶ Exit (terminal)
//! ```
//!
//! Only the helper moves the cell away from `Call`, and only the coordinator
//! moves it away from `Done`, so each wait has exactly one writer to observe.
//! Waits are busy polls with a fixed backoff; plain futexes or condition
//! variables are not relied upon across the fork boundary.

use std::ffi::c_void;
use std::num::NonZeroUsize;
use std::ptr::NonNull;
use std::sync::atomic::{AtomicI32, AtomicU32, AtomicUsize, Ordering};
use std::time::Duration;

use nix::sys::mman::{MapFlags, ProtFlags, mmap_anonymous, munmap};
use tracing::trace;

use crate::error::{JitError, Result};

/// Mailbox cell states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum Mailbox {
	/// Idle; the previous command, if any, has been acknowledged.
	Ack = u32::MAX,
	/// A command is waiting in the buffer.
	Call = 0x3243_F6A8,
	/// The helper finished the command; the status cell is valid.
	Done = 0x6A09_E667,
	/// Shutdown requested.
	Exit = 0x9E37_79B9,
}

impl Mailbox {
	/// Decodes a raw cell value; `None` for values outside the protocol.
	pub fn from_raw(raw: u32) -> Option<Self> {
		match raw {
			x if x == Mailbox::Ack as u32 => Some(Mailbox::Ack),
			x if x == Mailbox::Call as u32 => Some(Mailbox::Call),
			x if x == Mailbox::Done as u32 => Some(Mailbox::Done),
			x if x == Mailbox::Exit as u32 => Some(Mailbox::Exit),
			_ => None,
		}
	}
}

#[repr(C)]
struct Header {
	state: AtomicU32,
	status: AtomicI32,
	len: AtomicUsize,
}

/// Mailbox plus command buffer living in shared memory.
pub struct Rendezvous {
	base: NonNull<c_void>,
	map_len: usize,
	capacity: usize,
	interval: Duration,
}

// All cross-party access goes through the atomics in `Header`; the command
// bytes are published by the `Call` store and consumed after observing it.
unsafe impl Send for Rendezvous {}
unsafe impl Sync for Rendezvous {}

impl Rendezvous {
	/// Maps a fresh channel with `capacity` command bytes, initialised to `Ack`.
	pub fn new(capacity: usize, interval: Duration) -> Result<Self> {
		let map_len = std::mem::size_of::<Header>() + capacity.max(1);
		let length = NonZeroUsize::new(map_len).ok_or_else(|| JitError::Channel("empty mapping".into()))?;
		let base = unsafe {
			mmap_anonymous(
				None,
				length,
				ProtFlags::PROT_READ | ProtFlags::PROT_WRITE,
				MapFlags::MAP_SHARED,
			)
		}
		.map_err(|errno| JitError::Channel(format!("mmap failed: {errno}")))?;

		let channel = Self {
			base,
			map_len,
			capacity: capacity.max(1),
			interval,
		};
		channel.write(Mailbox::Ack);
		Ok(channel)
	}

	fn header(&self) -> &Header {
		// Page-aligned mapping, zero-initialised by the kernel.
		unsafe { self.base.cast::<Header>().as_ref() }
	}

	fn buffer(&self) -> *mut u8 {
		unsafe { self.base.cast::<u8>().as_ptr().add(std::mem::size_of::<Header>()) }
	}

	/// Usable command buffer size in bytes, terminator included.
	pub fn capacity(&self) -> usize {
		self.capacity
	}

	/// Backoff between polls of the mailbox cell.
	pub fn interval(&self) -> Duration {
		self.interval
	}

	/// Raw cell value.
	pub fn raw(&self) -> u32 {
		self.header().state.load(Ordering::Acquire)
	}

	/// Current state, or a protocol error for values outside the protocol.
	pub fn read(&self) -> Result<Mailbox> {
		let raw = self.raw();
		Mailbox::from_raw(raw).ok_or_else(|| JitError::Protocol(format!("unexpected mailbox value {raw:#010x}")))
	}

	/// Stores `value` without waiting.
	pub fn write(&self, value: Mailbox) {
		trace!(state = ?value, "Mailbox write");
		self.store(value);
	}

	// Helper-side path: no logging after fork, a subscriber lock may be held.
	fn store(&self, value: Mailbox) {
		self.header().state.store(value as u32, Ordering::Release);
	}

	pub fn acknowledge(&self) {
		self.write(Mailbox::Ack);
	}

	/// Stores `value` and blocks until the counterpart moves the cell away from it.
	///
	/// `on_tick` runs once per backoff interval; returning an error aborts the wait.
	pub fn signal(&self, value: Mailbox, on_tick: impl FnMut() -> Result<()>) -> Result<Mailbox> {
		self.write(value);
		self.wait_until(|state| state != value, on_tick)
	}

	/// Blocks until a new request (`Call` or `Exit`) is pending.
	pub fn await_request(&self, on_tick: impl FnMut() -> Result<()>) -> Result<Mailbox> {
		self.wait_until(|state| matches!(state, Mailbox::Call | Mailbox::Exit), on_tick)
	}

	/// Blocks until the cell returns to `Ack`.
	pub fn await_ack(&self, on_tick: impl FnMut() -> Result<()>) -> Result<Mailbox> {
		self.wait_until(|state| state == Mailbox::Ack, on_tick)
	}

	fn wait_until(&self, done: impl Fn(Mailbox) -> bool, mut on_tick: impl FnMut() -> Result<()>) -> Result<Mailbox> {
		loop {
			let state = self.read()?;
			if done(state) {
				return Ok(state);
			}
			on_tick()?;
			std::thread::sleep(self.interval);
		}
	}

	/// Copies an encoded command into the buffer. Call before `signal(Call)`.
	pub fn put_command(&self, bytes: &[u8]) -> Result<()> {
		if bytes.len() + 1 > self.capacity {
			return Err(JitError::CommandTooLong {
				len: bytes.len() + 1,
				capacity: self.capacity,
			});
		}
		unsafe {
			std::ptr::copy_nonoverlapping(bytes.as_ptr(), self.buffer(), bytes.len());
			*self.buffer().add(bytes.len()) = 0;
		}
		self.header().len.store(bytes.len(), Ordering::Release);
		Ok(())
	}

	/// Copies the pending command out of the buffer.
	pub fn take_command(&self) -> Vec<u8> {
		let len = self.header().len.load(Ordering::Acquire).min(self.capacity - 1);
		let mut bytes = vec![0; len];
		unsafe { std::ptr::copy_nonoverlapping(self.buffer(), bytes.as_mut_ptr(), len) };
		bytes
	}

	/// Publishes a command's exit status and moves the cell to `Done`.
	///
	/// Called from the forked helper, so it never logs.
	pub fn complete(&self, status: i32) {
		self.header().status.store(status, Ordering::Release);
		self.store(Mailbox::Done);
	}

	/// Exit status published by the last [`complete`](Self::complete).
	pub fn status(&self) -> i32 {
		self.header().status.load(Ordering::Acquire)
	}
}

impl Drop for Rendezvous {
	fn drop(&mut self) {
		if let Err(errno) = unsafe { munmap(self.base, self.map_len) } {
			tracing::error!(error = %errno, "Failed to release rendezvous mapping");
		}
	}
}

#[cfg(test)]
mod tests {
	use std::sync::Arc;

	use super::*;

	fn channel(capacity: usize) -> Rendezvous {
		Rendezvous::new(capacity, Duration::from_millis(1)).unwrap()
	}

	#[test]
	fn starts_idle() {
		let rv = channel(64);
		assert_eq!(rv.read().unwrap(), Mailbox::Ack);
	}

	#[test]
	fn rejects_commands_that_do_not_fit() {
		let rv = channel(8);
		assert!(rv.put_command(b"1234567").is_ok());
		assert!(matches!(
			rv.put_command(b"12345678"),
			Err(JitError::CommandTooLong { len: 9, capacity: 8 })
		));
	}

	#[test]
	fn corrupt_cell_is_a_protocol_error() {
		let rv = channel(8);
		rv.header().state.store(7, Ordering::Release);
		assert!(matches!(rv.read(), Err(JitError::Protocol(_))));
		assert!(matches!(rv.await_ack(|| Ok(())), Err(JitError::Protocol(_))));
	}

	#[test]
	fn call_cycle_between_threads() {
		let rv = Arc::new(channel(64));
		let helper = {
			let rv = Arc::clone(&rv);
			std::thread::spawn(move || {
				let mut seen = Vec::new();
				loop {
					match rv.await_request(|| Ok(())).unwrap() {
						Mailbox::Call => {
							let command = rv.take_command();
							seen.push(String::from_utf8(command).unwrap());
							rv.complete(seen.len() as i32);
						}
						Mailbox::Exit => return seen,
						other => panic!("unexpected {other:?}"),
					}
				}
			})
		};

		for command in ["first", "second"] {
			rv.put_command(command.as_bytes()).unwrap();
			assert_eq!(rv.signal(Mailbox::Call, || Ok(())).unwrap(), Mailbox::Done);
			let status = rv.status();
			rv.acknowledge();
			assert!(status > 0);
		}
		rv.write(Mailbox::Exit);

		assert_eq!(helper.join().unwrap(), vec!["first".to_owned(), "second".to_owned()]);
	}

	#[test]
	fn complete_publishes_status_before_done() {
		let rv = channel(8);
		rv.write(Mailbox::Call);
		rv.complete(-3);
		assert_eq!(rv.read().unwrap(), Mailbox::Done);
		assert_eq!(rv.status(), -3);
		assert_eq!(rv.raw(), Mailbox::Done as u32);
	}

	#[test]
	fn tick_error_aborts_wait() {
		let rv = channel(8);
		let mut ticks = 0;
		let result = rv.signal(Mailbox::Call, || {
			ticks += 1;
			if ticks == 3 { Err(JitError::HelperExited("gone".into())) } else { Ok(()) }
		});
		assert!(matches!(result, Err(JitError::HelperExited(_))));
		assert_eq!(ticks, 3);
	}
}
