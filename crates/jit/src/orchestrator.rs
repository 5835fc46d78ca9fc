//! Build steps from kernel source to an installed shared library.
//!
//! Runs only on the coordinating rank. Each step is one external command
//! handed to a [`CommandRunner`]; a non-zero status aborts the remaining steps.

use std::fs;
use std::path::Path;

use tracing::{error, info};

use crate::config::CachePaths;
use crate::error::{JitError, Result};
use crate::kernel::KernelId;
use crate::toolchain::{BuildCommand, Toolchain};

/// Executes one external command and reports its exit status.
pub trait CommandRunner {
	fn run(&mut self, command: &BuildCommand) -> Result<i32>;
}

/// Composes and issues the compile/archive/link/install sequence.
#[derive(Debug, Clone)]
pub struct Orchestrator {
	toolchain: Toolchain,
	paths: CachePaths,
}

impl Orchestrator {
	pub fn new(toolchain: Toolchain, paths: CachePaths) -> Self {
		Self { toolchain, paths }
	}

	pub fn toolchain(&self) -> &Toolchain {
		&self.toolchain
	}

	/// Compiles `source`, appends it to the archive and relinks the library.
	///
	/// Leaves the freshly linked per-symbol library at
	/// [`CachePaths::fresh_library`] for the caller to load, and a copy
	/// installed over the canonical library. The `.cc` and `.co` temporaries
	/// are always removed, and so is the per-symbol library when linking or
	/// installing fails.
	///
	/// # Errors
	///
	/// Returns [`JitError::BuildFailed`] naming the first step that failed.
	pub fn build(&self, runner: &mut dyn CommandRunner, id: &KernelId, source: &str) -> Result<()> {
		fs::create_dir_all(&self.paths.dir)?;
		let cc = self.paths.temporary(&id.source_file());
		let co = self.paths.temporary(&id.object_file());
		let fresh = self.paths.fresh_library(id.symbol());

		info!(kernel = %id, "Compiling kernel");
		fs::write(&cc, source)?;
		let compiled = self
			.toolchain
			.compile(&cc, &co)
			.and_then(|cmd| self.step(runner, "compile", &cmd));
		remove_temporary(&cc);
		if let Err(e) = compiled {
			remove_temporary(&co);
			return Err(e);
		}

		let archived = self
			.toolchain
			.archive(&self.paths.archive, &co)
			.and_then(|cmd| self.step(runner, "archive", &cmd));
		remove_temporary(&co);
		archived?;

		let installed = self
			.toolchain
			.link(&self.paths.archive, &fresh)
			.and_then(|cmd| self.step(runner, "link", &cmd))
			.and_then(|()| self.install(runner, &fresh));
		if installed.is_err() {
			remove_temporary(&fresh);
		}
		installed
	}

	/// Relinks the canonical library from the archive alone.
	pub fn relink(&self, runner: &mut dyn CommandRunner) -> Result<()> {
		info!(archive = %self.paths.archive.display(), "Relinking shared library from archive");
		let staging = self.paths.staging_library();
		let linked = self
			.toolchain
			.link(&self.paths.archive, &staging)
			.and_then(|cmd| self.step(runner, "link", &cmd));
		if let Err(e) = linked {
			remove_temporary(&staging);
			return Err(e);
		}
		fs::rename(&staging, &self.paths.library)?;
		Ok(())
	}

	/// Copies `fresh` next to the canonical library and renames it into place.
	fn install(&self, runner: &mut dyn CommandRunner, fresh: &Path) -> Result<()> {
		let staging = self.paths.staging_library();
		let installed = self
			.toolchain
			.install(fresh, &staging)
			.and_then(|cmd| self.step(runner, "install", &cmd));
		if let Err(e) = installed {
			remove_temporary(&staging);
			return Err(e);
		}
		fs::rename(&staging, &self.paths.library)?;
		Ok(())
	}

	fn step(&self, runner: &mut dyn CommandRunner, step: &'static str, command: &BuildCommand) -> Result<()> {
		match runner.run(command)? {
			0 => Ok(()),
			status => {
				error!(step, status, command = %command, "Build step failed");
				Err(JitError::BuildFailed { step, status })
			}
		}
	}
}

fn remove_temporary(path: &Path) {
	match fs::remove_file(path) {
		Ok(()) => {}
		Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
		Err(e) => tracing::warn!(path = %path.display(), error = %e, "Failed to remove build temporary"),
	}
}
