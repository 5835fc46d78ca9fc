//! Compilation cache and symbol resolver.
//!
//! The durable state is two files in the cache directory: an append-only
//! archive holding every kernel object ever built, and a shared library
//! relinked from the whole archive. Lookups go against the library; a miss
//! makes the coordinating rank extend the archive and relink while every other
//! rank waits at a status barrier.

use std::ffi::c_void;
use std::path::Path;
use std::ptr::NonNull;
use std::sync::Arc;

use libloading::Library;
use tracing::{debug, error, info, warn};

use crate::collective::Collective;
use crate::config::{CachePaths, JitConfig};
use crate::error::{JitError, Result};
use crate::kernel::{Kernel, KernelId, is_valid_symbol};
use crate::orchestrator::Orchestrator;
use crate::toolchain::Toolchain;
use crate::topology::{Prefork, Topology};

/// Counters describing what the broker has done so far.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct JitStats {
	/// Shared libraries opened.
	pub loads: usize,
	/// Library relinks from an existing archive. Always zero off the
	/// coordinator.
	pub relinks: usize,
	/// Kernel compilations run by this rank. Always zero off the coordinator.
	pub builds: usize,
	/// Lookups answered by an already built library.
	pub hits: usize,
	/// Lookups that required a build.
	pub misses: usize,
}

/// State only the coordinating rank owns.
struct Coordinator {
	orchestrator: Orchestrator,
	topology: Topology,
}

/// One broker instance: owns the helper topology and the loaded library.
pub struct Jit<C: Collective> {
	collective: C,
	paths: CachePaths,
	coordinator: Option<Coordinator>,
	library: Option<Arc<Library>>,
	opened: bool,
	stats: JitStats,
}

impl<C: Collective> Jit<C> {
	/// Sets up the broker for this rank.
	///
	/// The coordinating rank resolves the toolchain and, when
	/// [`Collective::needs_helper`] says so, forks its helper here. Other
	/// ranks only ever load libraries. Use [`initialize_with`](Self::initialize_with)
	/// when the helper has to exist before the communication layer starts.
	///
	/// # Errors
	///
	/// Returns [`JitError::ToolchainUnavailable`] when the coordinator has no
	/// compiler, or a helper/channel error when the helper cannot start.
	pub fn initialize(config: JitConfig, collective: C) -> Result<Self> {
		Self::setup(config, collective, None)
	}

	/// Like [`initialize`](Self::initialize), but with a helper forked earlier
	/// by [`Prefork::spawn`]. The coordinator adopts it; every other rank
	/// dismisses it.
	pub fn initialize_with(config: JitConfig, collective: C, prefork: Prefork) -> Result<Self> {
		Self::setup(config, collective, Some(prefork))
	}

	fn setup(config: JitConfig, collective: C, prefork: Option<Prefork>) -> Result<Self> {
		let paths = config.paths();
		let coordinator = if collective.is_coordinator() {
			let toolchain = Toolchain::from_config(&config)?;
			std::fs::create_dir_all(&paths.dir)?;
			let topology = match prefork {
				Some(prefork) => Topology::adopt(prefork, collective.needs_helper())?,
				None => Topology::establish(
					collective.needs_helper(),
					config.command_capacity,
					config.poll_interval(),
				)?,
			};
			Some(Coordinator {
				orchestrator: Orchestrator::new(toolchain, paths.clone()),
				topology,
			})
		} else {
			if let Some(prefork) = prefork {
				prefork.dismiss()?;
			}
			None
		};

		info!(
			rank = collective.rank(),
			size = collective.size(),
			cache_dir = %paths.dir.display(),
			"Compilation broker initialized"
		);
		Ok(Self {
			collective,
			paths,
			coordinator,
			library: None,
			opened: false,
			stats: JitStats::default(),
		})
	}

	pub fn stats(&self) -> JitStats {
		self.stats
	}

	pub fn paths(&self) -> &CachePaths {
		&self.paths
	}

	pub fn collective(&self) -> &C {
		&self.collective
	}

	/// Pid of the forked helper when this rank runs one.
	pub fn helper_pid(&self) -> Option<i32> {
		self.coordinator.as_ref().and_then(|c| c.topology.helper_pid())
	}

	/// Returns the native entry point for `symbol`, compiling `source` on a miss.
	///
	/// Every rank of the job must call this with the same arguments in the same
	/// order; build status is agreed on collectively, so a failed build fails
	/// on every rank.
	///
	/// # Errors
	///
	/// * [`JitError::BuildFailed`] on the coordinator and
	///   [`JitError::PeerBuildFailed`] elsewhere when the build fails.
	/// * [`JitError::Unresolved`] when the symbol is still missing after a
	///   fresh build. This is not retried.
	/// * [`JitError::InvalidSymbol`] when `symbol` is not a C identifier.
	pub fn resolve(&mut self, hash: u64, source: &str, symbol: &str) -> Result<Kernel> {
		// Same arguments on every rank, so every rank rejects together.
		if !is_valid_symbol(symbol) {
			return Err(JitError::InvalidSymbol(symbol.to_owned()));
		}
		let id = KernelId::new(hash, symbol);

		if !self.opened {
			self.library = self.open_cache()?;
			self.opened = true;
		}
		let found = self.library.as_ref().and_then(|lib| lookup(lib, symbol));
		// One rank missing pulls every rank into the build, so no rank can run
		// ahead while the coordinator rewrites the cache.
		let miss = self.collective.any_failed(found.is_none());
		if let Some(kernel) = found
			&& !miss
		{
			debug!(kernel = %id, "Kernel cache hit");
			self.stats.hits += 1;
			return Ok(kernel);
		}

		debug!(kernel = %id, "Kernel cache miss");
		self.stats.misses += 1;
		let library = self.compile(&id, source)?;
		let kernel = lookup(&library, symbol).ok_or_else(|| {
			error!(kernel = %id, "Symbol missing after a successful build");
			JitError::Unresolved(symbol.to_owned())
		})?;
		self.library = Some(library);
		Ok(kernel)
	}

	/// [`resolve`](Self::resolve) keyed by the content hash of `source`.
	pub fn resolve_source(&mut self, source: &str, symbol: &str) -> Result<Kernel> {
		let hash = KernelId::from_source(source).hash();
		self.resolve(hash, source, symbol)
	}

	/// Stops the helper and releases the broker.
	///
	/// # Errors
	///
	/// Returns [`JitError::HelperFailed`] or [`JitError::HelperExited`] when the
	/// helper did not finish cleanly.
	pub fn finalize(mut self) -> Result<()> {
		let result = match self.coordinator.take() {
			Some(coordinator) => coordinator.topology.shutdown(),
			None => Ok(()),
		};
		info!(rank = self.collective.rank(), stats = ?self.stats, "Compilation broker finalized");
		result
	}

	/// Opens the canonical library, relinking it from the archive if only the
	/// archive exists. `None` when there is no usable cache yet.
	fn open_cache(&mut self) -> Result<Option<Arc<Library>>> {
		let canonical = self.paths.library.clone();
		let stale = !canonical.exists() && self.paths.archive.exists();
		if self.collective.any_failed(stale) {
			let outcome = match &mut self.coordinator {
				Some(coordinator) => coordinator.orchestrator.relink(&mut coordinator.topology),
				None => Ok(()),
			};
			self.agree(outcome)?;
			if self.coordinator.is_some() {
				self.stats.relinks += 1;
			}
		}
		if !canonical.exists() {
			return Ok(None);
		}
		match self.load(&canonical) {
			Ok(library) => Ok(Some(library)),
			Err(e) => {
				// Treated as an empty cache; the next lookup misses and rebuilds.
				warn!(error = %e, "Cached library unusable");
				Ok(None)
			}
		}
	}

	/// Builds `id` on the coordinator and loads the result on every rank.
	fn compile(&mut self, id: &KernelId, source: &str) -> Result<Arc<Library>> {
		let outcome = match &mut self.coordinator {
			Some(coordinator) => coordinator.orchestrator.build(&mut coordinator.topology, id, source),
			None => Ok(()),
		};
		self.agree(outcome)?;
		if self.coordinator.is_some() {
			self.stats.builds += 1;
		}

		// Load the per-symbol artifact: the canonical path may already be open
		// in this process and would hand back the stale mapping.
		let fresh = self.paths.fresh_library(id.symbol());
		let loaded = self.load(&fresh);
		let failed = self.collective.any_failed(loaded.is_err());
		if self.collective.is_coordinator() {
			remove_fresh(&fresh);
		}
		match (loaded, failed) {
			(Ok(library), false) => Ok(library),
			(Err(e), _) => Err(e),
			(Ok(_), true) => Err(JitError::PeerBuildFailed),
		}
	}

	/// Status barrier: every rank learns whether the coordinator's step failed.
	fn agree(&self, outcome: Result<()>) -> Result<()> {
		if let Err(e) = &outcome {
			error!(rank = self.collective.rank(), error = %e, "Build failed");
		}
		let failed = self.collective.any_failed(outcome.is_err());
		match outcome {
			Err(e) => Err(e),
			Ok(()) if failed => Err(JitError::PeerBuildFailed),
			Ok(()) => Ok(()),
		}
	}

	fn load(&mut self, path: &Path) -> Result<Arc<Library>> {
		debug!(path = %path.display(), "Loading shared library");
		let library = unsafe { Library::new(path) }.map_err(|error| JitError::Load {
			path: path.to_path_buf(),
			error,
		})?;
		self.stats.loads += 1;
		Ok(Arc::new(library))
	}
}

impl<C: Collective> Drop for Jit<C> {
	fn drop(&mut self) {
		if self.coordinator.as_ref().is_some_and(|c| c.topology.helper_pid().is_some()) {
			warn!("Compilation broker dropped without finalize");
		}
	}
}

fn lookup(library: &Arc<Library>, symbol: &str) -> Option<Kernel> {
	let address = unsafe { library.get::<*mut c_void>(symbol.as_bytes()) }.ok()?;
	NonNull::new(*address).map(|address| Kernel::new(symbol, address, Arc::clone(library)))
}

fn remove_fresh(path: &Path) {
	if let Err(e) = std::fs::remove_file(path)
		&& e.kind() != std::io::ErrorKind::NotFound
	{
		warn!(path = %path.display(), error = %e, "Failed to remove per-symbol library");
	}
}
