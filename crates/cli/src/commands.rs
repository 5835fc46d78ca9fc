//! Subcommand implementations.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::Context;
use kiln_jit::{CachePaths, Jit, JitConfig, KernelId, Solo, archive};
use tracing::{debug, info};

/// Loads the configuration file, then applies environment overrides.
///
/// An explicit `path` must exist; the default location is optional.
pub fn load_config(path: Option<&Path>) -> anyhow::Result<JitConfig> {
	let mut config = match path {
		Some(path) => JitConfig::load(path)?,
		None => match default_config_path().filter(|p| p.exists()) {
			Some(path) => {
				debug!(path = %path.display(), "Using default config file");
				JitConfig::load(&path)?
			}
			None => JitConfig::default(),
		},
	};
	config.apply_env();
	Ok(config)
}

fn default_config_path() -> Option<PathBuf> {
	dirs::config_dir().map(|dir| dir.join("kiln").join("config.toml"))
}

pub fn build(config: JitConfig, source: &Path, symbol: &str, invoke: bool) -> anyhow::Result<()> {
	let text = fs::read_to_string(source).with_context(|| format!("reading {}", source.display()))?;
	let id = KernelId::from_source(&text);

	let mut jit = Jit::initialize(config, Solo)?;
	let kernel = jit.resolve(id.hash(), &text, symbol)?;
	println!("{symbol} {:016x} {:p}", id.hash(), kernel.address());

	if invoke {
		let entry: extern "C" fn() -> i64 = unsafe { kernel.as_fn() };
		println!("{}", entry());
	}

	let stats = jit.stats();
	info!(builds = stats.builds, hits = stats.hits, relinks = stats.relinks, "Kernel resolved");
	drop(kernel);
	jit.finalize()?;
	Ok(())
}

pub fn list(config: &JitConfig) -> anyhow::Result<()> {
	let paths = config.paths();
	for member in archive::members(&paths.archive)? {
		println!("{member}");
	}
	Ok(())
}

pub fn clean(config: &JitConfig) -> anyhow::Result<()> {
	let removed = remove_cache_files(&config.paths())?;
	info!(removed, "Cache cleaned");
	Ok(())
}

/// Removes the archive, the library and leftover build files. Returns how
/// many files were deleted.
pub fn remove_cache_files(paths: &CachePaths) -> anyhow::Result<usize> {
	let mut doomed = vec![paths.archive.clone(), paths.library.clone()];
	match fs::read_dir(&paths.dir) {
		Ok(entries) => {
			for entry in entries {
				let path = entry?.path();
				if is_build_leftover(&path, paths) {
					doomed.push(path);
				}
			}
		}
		Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(0),
		Err(e) => return Err(e).with_context(|| format!("reading {}", paths.dir.display())),
	}

	let mut removed = 0;
	for path in doomed {
		match fs::remove_file(&path) {
			Ok(()) => {
				debug!(path = %path.display(), "Removed");
				removed += 1;
			}
			Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
			Err(e) => return Err(e).with_context(|| format!("removing {}", path.display())),
		}
	}
	Ok(removed)
}

/// Kernel sources and objects, per-symbol libraries, and staging copies.
fn is_build_leftover(path: &Path, paths: &CachePaths) -> bool {
	let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
		return false;
	};
	let library_name = paths.library.file_name().and_then(|n| n.to_str()).unwrap_or_default();
	let extension = kiln_jit::config::library_extension();

	let temporary = name.starts_with('k') && (name.ends_with(".cc") || name.ends_with(".co"));
	let fresh = name.ends_with(&format!(".fresh.{extension}"));
	let staging = name.starts_with(&format!("{library_name}.")) && name.ends_with(".tmp");
	temporary || fresh || staging
}
