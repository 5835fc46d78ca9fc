//! Coordinator/helper process layout.
//!
//! Without a distributed job, build commands run in-process. Otherwise the
//! coordinating rank forks one long-lived helper at startup that executes
//! commands on its behalf through the [`Rendezvous`] mailbox, and installs
//! signal handlers that kill and reap the helper before exiting.

use std::os::unix::process::ExitStatusExt;
use std::panic::{self, AssertUnwindSafe};
use std::process::ExitStatus;
use std::sync::atomic::{AtomicI32, Ordering};
use std::time::Duration;

use nix::sys::signal::{SaFlags, SigAction, SigHandler, SigSet, Signal, kill, sigaction};
use nix::sys::wait::{WaitPidFlag, WaitStatus, waitpid};
use nix::unistd::{ForkResult, Pid, fork, getpid, getppid};
use tracing::{debug, info, warn};

use crate::config::JitConfig;
use crate::error::{JitError, Result};
use crate::orchestrator::CommandRunner;
use crate::rendezvous::{Mailbox, Rendezvous};
use crate::toolchain::BuildCommand;

/// Pid of the forked helper, read by the signal handler. `0` when none, `-1`
/// while a fork is in progress.
static HELPER_PID: AtomicI32 = AtomicI32::new(0);

const TEARDOWN_SIGNALS: [Signal; 5] = [
	Signal::SIGINT,
	Signal::SIGQUIT,
	Signal::SIGTERM,
	Signal::SIGABRT,
	Signal::SIGFPE,
];

/// Exit status used when a command cannot be started.
pub const EXIT_SPAWN: i32 = 127;
const EXIT_PROTOCOL: i32 = 70;
const EXIT_ORPHANED: i32 = 71;
const EXIT_PANIC: i32 = 101;

/// How build commands reach the operating system.
pub enum Topology {
	/// Single process: commands run directly.
	Inline,
	/// Distributed coordinator: commands run in the forked helper.
	Helper(HelperProcess),
}

impl Topology {
	/// Picks the layout for this rank and starts the helper if one is needed.
	///
	/// # Errors
	///
	/// Returns [`JitError::HelperLaunch`] or [`JitError::Channel`] if the helper
	/// cannot be started; both are fatal at startup.
	pub fn establish(distributed: bool, capacity: usize, interval: Duration) -> Result<Self> {
		if !distributed {
			debug!("No distributed job, build commands run in-process");
			return Ok(Topology::Inline);
		}
		HelperProcess::spawn(capacity, interval).map(Topology::Helper)
	}

	/// Keeps a preforked helper when this rank needs one and dismisses it
	/// otherwise.
	pub fn adopt(prefork: Prefork, needs_helper: bool) -> Result<Self> {
		if needs_helper {
			return Ok(Topology::Helper(prefork.helper));
		}
		debug!(pid = prefork.pid(), "Rank needs no helper, dismissing the preforked one");
		prefork.dismiss().map(|()| Topology::Inline)
	}

	pub fn helper_pid(&self) -> Option<i32> {
		match self {
			Topology::Inline => None,
			Topology::Helper(helper) => Some(helper.pid.as_raw()),
		}
	}

	/// Stops the helper, if any, and checks how it finished.
	pub fn shutdown(self) -> Result<()> {
		match self {
			Topology::Inline => Ok(()),
			Topology::Helper(helper) => helper.finalize(),
		}
	}
}

impl CommandRunner for Topology {
	fn run(&mut self, command: &BuildCommand) -> Result<i32> {
		info!(command = %command, "Running build command");
		match self {
			Topology::Inline => Ok(run_inline(command)),
			Topology::Helper(helper) => helper.call(command),
		}
	}
}

/// A helper forked before the job's communication layer is up.
///
/// Runtimes that forbid `fork` once started need this: spawn it first thing
/// in every process of the job, before ranks are known, then hand it to
/// [`Jit::initialize_with`](crate::Jit::initialize_with). Only the
/// coordinator keeps its helper; every other rank sends it `Exit`.
pub struct Prefork {
	helper: HelperProcess,
}

impl Prefork {
	/// Forks the helper with the channel settings from `config`.
	///
	/// # Errors
	///
	/// Same as helper startup in [`Topology::establish`].
	pub fn spawn(config: &JitConfig) -> Result<Self> {
		HelperProcess::spawn(config.command_capacity, config.poll_interval()).map(|helper| Self { helper })
	}

	pub fn pid(&self) -> i32 {
		self.helper.pid.as_raw()
	}

	/// Tells the helper to exit and reaps it.
	pub fn dismiss(self) -> Result<()> {
		self.helper.finalize()
	}
}

/// The forked helper as seen from the coordinator.
pub struct HelperProcess {
	pid: Pid,
	channel: Rendezvous,
	saved_actions: Vec<(Signal, SigAction)>,
	exited: Option<String>,
	finished: bool,
}

impl HelperProcess {
	fn spawn(capacity: usize, interval: Duration) -> Result<Self> {
		if HELPER_PID.compare_exchange(0, -1, Ordering::SeqCst, Ordering::SeqCst).is_err() {
			return Err(JitError::HelperLaunch("a helper process is already running".into()));
		}

		let channel = match Rendezvous::new(capacity, interval) {
			Ok(channel) => channel,
			Err(e) => {
				HELPER_PID.store(0, Ordering::SeqCst);
				return Err(e);
			}
		};
		let parent = getpid();

		match unsafe { fork() } {
			Err(errno) => {
				HELPER_PID.store(0, Ordering::SeqCst);
				Err(JitError::HelperLaunch(errno.to_string()))
			}
			Ok(ForkResult::Child) => {
				let code = panic::catch_unwind(AssertUnwindSafe(|| helper_main(&channel, parent))).unwrap_or(EXIT_PANIC);
				unsafe { libc::_exit(code) }
			}
			Ok(ForkResult::Parent { child }) => {
				HELPER_PID.store(child.as_raw(), Ordering::SeqCst);
				let saved_actions = match install_handlers() {
					Ok(saved) => saved,
					Err(e) => {
						let _ = kill(child, Signal::SIGKILL);
						let _ = waitpid(child, None);
						HELPER_PID.store(0, Ordering::SeqCst);
						return Err(e);
					}
				};
				info!(pid = child.as_raw(), "Helper process started");
				Ok(Self {
					pid: child,
					channel,
					saved_actions,
					exited: None,
					finished: false,
				})
			}
		}
	}

	/// Hands `command` to the helper and blocks until it has run.
	fn call(&mut self, command: &BuildCommand) -> Result<i32> {
		if let Some(reason) = &self.exited {
			return Err(JitError::HelperExited(reason.clone()));
		}
		self.channel.put_command(&command.encode())?;

		let pid = self.pid;
		match self.channel.signal(Mailbox::Call, || check_alive(pid)) {
			Ok(Mailbox::Done) => {
				let status = self.channel.status();
				self.channel.acknowledge();
				Ok(status)
			}
			Ok(other) => Err(JitError::Protocol(format!("helper answered {other:?} instead of Done"))),
			Err(JitError::HelperExited(reason)) => {
				self.exited = Some(reason.clone());
				self.finished = true;
				self.release();
				Err(JitError::HelperExited(reason))
			}
			Err(e) => Err(e),
		}
	}

	fn finalize(mut self) -> Result<()> {
		if let Some(reason) = self.exited.take() {
			return Err(JitError::HelperExited(reason));
		}
		if let Err(e) = self.channel.read().and_then(|state| match state {
			Mailbox::Ack => Ok(()),
			other => Err(JitError::Protocol(format!("finalize while mailbox is {other:?}"))),
		}) {
			self.terminate();
			return Err(e);
		}

		self.channel.write(Mailbox::Exit);
		let status = waitpid(self.pid, None);
		self.finished = true;
		self.release();

		match status.map_err(|errno| JitError::HelperExited(errno.to_string()))? {
			WaitStatus::Exited(_, 0) => {
				info!(pid = self.pid.as_raw(), "Helper process finished");
				Ok(())
			}
			WaitStatus::Exited(_, code) => Err(JitError::HelperFailed(code)),
			WaitStatus::Signaled(_, signal, _) => Err(JitError::HelperFailed(128 + signal as i32)),
			other => Err(JitError::HelperExited(format!("{other:?}"))),
		}
	}

	fn terminate(&mut self) {
		if self.finished {
			return;
		}
		let _ = kill(self.pid, Signal::SIGKILL);
		let _ = waitpid(self.pid, None);
		self.finished = true;
		self.release();
	}

	fn release(&mut self) {
		for (signal, action) in self.saved_actions.drain(..) {
			let _ = unsafe { sigaction(signal, &action) };
		}
		let _ = HELPER_PID.compare_exchange(self.pid.as_raw(), 0, Ordering::SeqCst, Ordering::SeqCst);
	}
}

impl Drop for HelperProcess {
	fn drop(&mut self) {
		if !self.finished {
			warn!(pid = self.pid.as_raw(), "Helper process dropped without finalize, killing it");
			self.terminate();
		}
	}
}

fn check_alive(pid: Pid) -> Result<()> {
	match waitpid(pid, Some(WaitPidFlag::WNOHANG)) {
		Ok(WaitStatus::StillAlive) => Ok(()),
		Ok(status) => Err(JitError::HelperExited(format!("{status:?}"))),
		Err(errno) => Err(JitError::HelperExited(errno.to_string())),
	}
}

fn install_handlers() -> Result<Vec<(Signal, SigAction)>> {
	let action = SigAction::new(SigHandler::Handler(teardown), SaFlags::empty(), SigSet::empty());
	let mut saved = Vec::with_capacity(TEARDOWN_SIGNALS.len());
	for signal in TEARDOWN_SIGNALS {
		match unsafe { sigaction(signal, &action) } {
			Ok(old) => saved.push((signal, old)),
			Err(errno) => {
				for (signal, old) in saved {
					let _ = unsafe { sigaction(signal, &old) };
				}
				return Err(JitError::HelperLaunch(format!("cannot install {signal} handler: {errno}")));
			}
		}
	}
	Ok(saved)
}

/// Kills and reaps the helper, then exits with failure. Async-signal-safe.
extern "C" fn teardown(_signum: libc::c_int) {
	let raw = HELPER_PID.load(Ordering::SeqCst);
	if raw > 0 {
		let pid = Pid::from_raw(raw);
		let _ = kill(pid, Signal::SIGKILL);
		let _ = waitpid(pid, None);
	}
	unsafe { libc::_exit(1) }
}

/// Command loop run by the forked helper; the return value is its exit status.
fn helper_main(channel: &Rendezvous, parent: Pid) -> i32 {
	let orphan_check = || {
		if getppid() == parent {
			Ok(())
		} else {
			Err(JitError::HelperExited("coordinator went away".into()))
		}
	};

	loop {
		match channel.await_request(orphan_check) {
			Ok(Mailbox::Exit) => return 0,
			Ok(Mailbox::Call) => {
				let status = match BuildCommand::decode(&channel.take_command()) {
					Some(command) => run_watched(&command, parent, channel.interval()),
					None => return EXIT_PROTOCOL,
				};
				channel.complete(status);
			}
			Ok(_) | Err(JitError::Protocol(_)) => return EXIT_PROTOCOL,
			Err(_) => return EXIT_ORPHANED,
		}
	}
}

/// Runs `command`, killing it if the coordinator disappears meanwhile.
fn run_watched(command: &BuildCommand, parent: Pid, interval: Duration) -> i32 {
	let mut child = match command.to_command().spawn() {
		Ok(child) => child,
		Err(_) => return EXIT_SPAWN,
	};
	let tick = interval.min(Duration::from_millis(50));
	loop {
		match child.try_wait() {
			Ok(Some(status)) => return exit_code(status),
			Ok(None) => {}
			Err(_) => return EXIT_SPAWN,
		}
		if getppid() != parent {
			let _ = child.kill();
			let _ = child.wait();
			return EXIT_ORPHANED;
		}
		std::thread::sleep(tick);
	}
}

fn run_inline(command: &BuildCommand) -> i32 {
	match command.to_command().status() {
		Ok(status) => exit_code(status),
		Err(e) => {
			warn!(program = %command.program, error = %e, "Failed to start build command");
			EXIT_SPAWN
		}
	}
}

fn exit_code(status: ExitStatus) -> i32 {
	status.code().unwrap_or_else(|| 128 + status.signal().unwrap_or(0))
}
