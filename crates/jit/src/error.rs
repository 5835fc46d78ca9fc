//! Error types for the compilation broker.

use std::path::PathBuf;

use thiserror::Error;

/// Errors raised while brokering kernel compilation.
#[derive(Debug, Error)]
pub enum JitError {
	/// Shared memory for the rendezvous channel could not be mapped or released.
	#[error("rendezvous channel error: {0}")]
	Channel(String),

	/// The helper process could not be started.
	#[error("failed to launch helper process: {0}")]
	HelperLaunch(String),

	/// The helper process went away while a command was in flight.
	#[error("helper process exited unexpectedly ({0})")]
	HelperExited(String),

	/// The helper process finished with a non-zero status at shutdown.
	#[error("helper process finished with status {0}")]
	HelperFailed(i32),

	/// The mailbox cell held a value outside the protocol.
	#[error("rendezvous protocol violation: {0}")]
	Protocol(String),

	/// An encoded command does not fit the shared command buffer.
	#[error("command of {len} bytes exceeds the {capacity} byte command buffer")]
	CommandTooLong {
		/// Encoded command length including the terminator.
		len: usize,
		/// Configured buffer capacity.
		capacity: usize,
	},

	/// An external build step returned a non-zero status.
	#[error("{step} step failed with status {status}")]
	BuildFailed {
		/// Build step that failed.
		step: &'static str,
		/// Exit status reported for the step.
		status: i32,
	},

	/// The coordinating rank reported a build failure to this rank.
	#[error("build failed on the coordinating rank")]
	PeerBuildFailed,

	/// A shared library could not be opened.
	#[error("failed to load {path}: {error}")]
	Load {
		/// Library that failed to load.
		path: PathBuf,
		/// Loader error.
		error: libloading::Error,
	},

	/// A requested symbol is not a C identifier.
	#[error("invalid kernel symbol {0:?}")]
	InvalidSymbol(String),

	/// A symbol is still missing after a fresh, successful build.
	#[error("symbol {0} is missing after a successful build")]
	Unresolved(String),

	/// No usable compiler driver was found.
	#[error("no C++ compiler found; install clang++/g++ or set CXX")]
	ToolchainUnavailable,

	/// Configuration file could not be parsed.
	#[error("invalid configuration: {0}")]
	Config(#[from] toml::de::Error),

	/// Configuration file could not be read.
	#[error("I/O error reading {path}: {error}")]
	ConfigRead {
		/// Path to the file that failed to read.
		path: PathBuf,
		/// The underlying I/O error.
		error: std::io::Error,
	},

	/// The accumulation archive is not a valid `ar` archive.
	#[error("malformed archive: {0}")]
	ArchiveFormat(String),

	/// Artifact paths must be valid UTF-8 to be passed through the command buffer.
	#[error("path is not valid UTF-8: {0}")]
	NonUtf8Path(PathBuf),

	/// Any other filesystem failure.
	#[error("IO error: {0}")]
	Io(#[from] std::io::Error),
}

/// Result type for broker operations.
pub type Result<T> = std::result::Result<T, JitError>;
