//! Helper process lifecycle for a coordinating rank of a distributed job.
//!
//! These tests fork, and only one helper may exist per process, so they run
//! serially.

#![allow(unused_crate_dependencies)]

use std::path::Path;

use kiln_jit::{Collective, Jit, JitConfig, JitError, Prefork, Toolchain};
use nix::sys::signal::{SaFlags, SigAction, SigHandler, SigSet, Signal, kill, raise, sigaction};
use nix::sys::wait::{WaitStatus, waitpid};
use nix::unistd::{ForkResult, Pid, fork};
use serial_test::serial;

/// Coordinator of a two-rank job whose peer never shows up; reductions only
/// see the local contribution.
struct Coordinator;

impl Collective for Coordinator {
	fn rank(&self) -> usize {
		0
	}

	fn size(&self) -> usize {
		2
	}

	fn any_failed(&self, failed: bool) -> bool {
		failed
	}
}

/// Second rank of the same job.
struct Peer;

impl Collective for Peer {
	fn rank(&self) -> usize {
		1
	}

	fn size(&self) -> usize {
		2
	}

	fn any_failed(&self, failed: bool) -> bool {
		failed
	}
}

fn config(dir: &Path) -> JitConfig {
	let mut config = JitConfig::with_cache_dir(dir);
	config.cxx = Some("c++".to_owned());
	config.poll_interval_ms = 2;
	config
}

fn toolchain_config(dir: &Path) -> Option<JitConfig> {
	let mut config = config(dir);
	config.cxx = None;
	let usable = Toolchain::from_config(&config).is_ok()
		&& which::which(&config.archiver).is_ok()
		&& which::which(&config.installer).is_ok();
	if !usable {
		eprintln!("skipping: no C++ toolchain on PATH");
		return None;
	}
	Some(config)
}

fn is_running(pid: i32) -> bool {
	kill(Pid::from_raw(pid), None).is_ok()
}

/// Current disposition of `signal`, read by swapping it out and back.
fn disposition(signal: Signal) -> SigHandler {
	let ignore = SigAction::new(SigHandler::SigIgn, SaFlags::empty(), SigSet::empty());
	let old = unsafe { sigaction(signal, &ignore) }.unwrap();
	unsafe { sigaction(signal, &old) }.unwrap();
	old.handler()
}

#[test]
#[serial]
fn finalize_without_builds_reaps_helper() {
	let dir = tempfile::tempdir().unwrap();
	let jit = Jit::initialize(config(dir.path()), Coordinator).unwrap();
	let pid = jit.helper_pid().expect("distributed coordinator forks a helper");
	assert!(is_running(pid));

	jit.finalize().unwrap();

	assert!(!is_running(pid));
}

#[test]
#[serial]
fn only_one_helper_per_process() {
	let dir = tempfile::tempdir().unwrap();
	let first = Jit::initialize(config(dir.path()), Coordinator).unwrap();

	let second = Jit::initialize(config(dir.path()), Coordinator);
	assert!(matches!(second, Err(JitError::HelperLaunch(_))));

	first.finalize().unwrap();
	let third = Jit::initialize(config(dir.path()), Coordinator).unwrap();
	third.finalize().unwrap();
}

#[test]
#[serial]
fn drop_without_finalize_kills_helper() {
	let dir = tempfile::tempdir().unwrap();
	let jit = Jit::initialize(config(dir.path()), Coordinator).unwrap();
	let pid = jit.helper_pid().unwrap();

	drop(jit);

	assert!(!is_running(pid));
	Jit::initialize(config(dir.path()), Coordinator).unwrap().finalize().unwrap();
}

#[test]
#[serial]
fn dead_helper_fails_the_build() {
	let dir = tempfile::tempdir().unwrap();
	let mut jit = Jit::initialize(config(dir.path()), Coordinator).unwrap();
	let pid = jit.helper_pid().unwrap();
	kill(Pid::from_raw(pid), Signal::SIGKILL).unwrap();

	let err = jit.resolve(0x5, "int x;", "k5").unwrap_err();
	assert!(matches!(err, JitError::HelperExited(_)), "{err}");
	assert!(jit.helper_pid().is_some());

	assert!(matches!(jit.finalize(), Err(JitError::HelperExited(_))));
	Jit::initialize(config(dir.path()), Coordinator).unwrap().finalize().unwrap();
}

#[test]
#[serial]
fn builds_run_through_the_helper() {
	let dir = tempfile::tempdir().unwrap();
	let Some(config) = toolchain_config(dir.path()) else {
		return;
	};
	let mut jit = Jit::initialize(config, Coordinator).unwrap();

	let kernel = jit.resolve(0x7, r#"extern "C" long k7() { return 7; }"#, "k7").unwrap();
	let k7: extern "C" fn() -> i64 = unsafe { kernel.as_fn() };
	assert_eq!(k7(), 7);

	let err = jit.resolve(0x8, "not C++ at all", "k8").unwrap_err();
	assert!(matches!(err, JitError::BuildFailed { step: "compile", .. }), "{err}");

	jit.finalize().unwrap();
}

#[test]
#[serial]
fn termination_signal_kills_helper_and_fails() {
	let dir = tempfile::tempdir().unwrap();
	let pid_file = dir.path().join("helper.pid");
	let config = config(dir.path());

	match unsafe { fork() }.unwrap() {
		ForkResult::Child => {
			let code = match Jit::initialize(config, Coordinator) {
				Ok(jit) => {
					let pid = jit.helper_pid().unwrap_or(0);
					if std::fs::write(&pid_file, pid.to_string()).is_ok() {
						let _ = raise(Signal::SIGTERM);
					}
					std::mem::forget(jit);
					3
				}
				Err(_) => 2,
			};
			unsafe { libc::_exit(code) }
		}
		ForkResult::Parent { child } => {
			assert_eq!(waitpid(child, None).unwrap(), WaitStatus::Exited(child, 1));
			let helper: i32 = std::fs::read_to_string(&pid_file).unwrap().parse().unwrap();
			assert!(helper > 0);
			assert!(!is_running(helper));
		}
	}
}

#[test]
#[serial]
fn finalize_restores_previous_signal_handlers() {
	let dir = tempfile::tempdir().unwrap();
	let before = disposition(Signal::SIGQUIT);

	let jit = Jit::initialize(config(dir.path()), Coordinator).unwrap();
	assert!(matches!(disposition(Signal::SIGQUIT), SigHandler::Handler(_)));
	assert!(matches!(disposition(Signal::SIGTERM), SigHandler::Handler(_)));

	jit.finalize().unwrap();
	assert_eq!(disposition(Signal::SIGQUIT), before);
}

#[test]
#[serial]
fn preforked_helper_is_adopted_by_the_coordinator() {
	let dir = tempfile::tempdir().unwrap();
	let config = config(dir.path());
	let prefork = Prefork::spawn(&config).unwrap();
	let pid = prefork.pid();

	let jit = Jit::initialize_with(config, Coordinator, prefork).unwrap();

	assert_eq!(jit.helper_pid(), Some(pid));
	jit.finalize().unwrap();
	assert!(!is_running(pid));
}

#[test]
#[serial]
fn preforked_helper_is_dismissed_off_the_coordinator() {
	let dir = tempfile::tempdir().unwrap();
	let config = config(dir.path());
	let prefork = Prefork::spawn(&config).unwrap();
	let pid = prefork.pid();

	let jit = Jit::initialize_with(config.clone(), Peer, prefork).unwrap();

	assert_eq!(jit.helper_pid(), None);
	assert!(!is_running(pid));
	jit.finalize().unwrap();
	Jit::initialize(config, Coordinator).unwrap().finalize().unwrap();
}
