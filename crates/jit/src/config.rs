//! Broker configuration.
//!
//! Settings are read from an optional TOML file and then overridden from the
//! environment:
//!
//! ```toml
//! cache_dir = "/scratch/kiln"
//! cxx = "clang++"
//! flags = ["-O3", "-std=c++17", "-march=native"]
//! device = false
//! poll_interval_ms = 200
//! ```
//!
//! | variable | field |
//! |---|---|
//! | `KILN_CACHE_DIR` | `cache_dir` |
//! | `KILN_CXX`, then `CXX` | `cxx` |
//! | `KILN_FLAGS` | `flags` (whitespace separated) |
//! | `KILN_DEVICE` | `device` (`1`/`true`) |
//! | `KILN_POLL_MS` | `poll_interval_ms` |

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;

use crate::error::{JitError, Result};
use crate::toolchain::ArchiveStyle;

/// Configuration for a [`Jit`](crate::Jit) broker.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct JitConfig {
	/// Directory holding the archive, the shared library and build temporaries.
	pub cache_dir: PathBuf,
	/// Accumulation archive file name inside `cache_dir`.
	pub archive_name: String,
	/// Shared library file name inside `cache_dir`.
	pub library_name: String,
	/// Compiler driver; resolved from `$CXX` or by probing when unset.
	pub cxx: Option<String>,
	/// Flags passed to every compilation.
	pub flags: Vec<String>,
	pub archiver: String,
	pub installer: String,
	/// Compose commands with device-offload option prefixes.
	pub device: bool,
	/// Whole-archive wrapping; the platform convention when unset.
	pub archive_style: Option<ArchiveStyle>,
	/// Rendezvous busy-poll backoff in milliseconds.
	pub poll_interval_ms: u64,
	/// Bytes reserved for the shared command buffer.
	pub command_capacity: usize,
}

impl Default for JitConfig {
	fn default() -> Self {
		Self {
			cache_dir: default_cache_dir(),
			archive_name: "libkiln.a".to_owned(),
			library_name: format!("libkiln.{}", library_extension()),
			cxx: None,
			flags: vec!["-O3".to_owned(), "-std=c++17".to_owned()],
			archiver: "ar".to_owned(),
			installer: "install".to_owned(),
			device: false,
			archive_style: None,
			poll_interval_ms: 200,
			command_capacity: 64 * 1024,
		}
	}
}

impl JitConfig {
	/// Default configuration rooted at `cache_dir`.
	pub fn with_cache_dir(cache_dir: impl Into<PathBuf>) -> Self {
		Self {
			cache_dir: cache_dir.into(),
			..Self::default()
		}
	}

	/// Reads a TOML configuration file. Missing fields take their defaults.
	pub fn load(path: &Path) -> Result<Self> {
		let text = std::fs::read_to_string(path).map_err(|error| JitError::ConfigRead {
			path: path.to_path_buf(),
			error,
		})?;
		Self::parse(&text)
	}

	pub fn parse(text: &str) -> Result<Self> {
		Ok(toml::from_str(text)?)
	}

	/// Applies `KILN_*` environment overrides.
	pub fn apply_env(&mut self) {
		self.apply_overrides(|key| std::env::var(key).ok());
	}

	/// Applies overrides from an arbitrary variable lookup.
	pub fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
		if let Some(dir) = lookup("KILN_CACHE_DIR") {
			self.cache_dir = PathBuf::from(dir);
		}
		if let Some(cxx) = lookup("KILN_CXX").or_else(|| lookup("CXX")) {
			self.cxx = Some(cxx);
		}
		if let Some(flags) = lookup("KILN_FLAGS") {
			self.flags = flags.split_whitespace().map(str::to_owned).collect();
		}
		if let Some(device) = lookup("KILN_DEVICE") {
			self.device = matches!(device.trim(), "1" | "true" | "yes" | "on");
		}
		if let Some(ms) = lookup("KILN_POLL_MS").and_then(|ms| ms.trim().parse().ok()) {
			self.poll_interval_ms = ms;
		}
	}

	pub fn poll_interval(&self) -> Duration {
		Duration::from_millis(self.poll_interval_ms.max(1))
	}

	pub fn paths(&self) -> CachePaths {
		CachePaths {
			dir: self.cache_dir.clone(),
			archive: self.cache_dir.join(&self.archive_name),
			library: self.cache_dir.join(&self.library_name),
		}
	}
}

/// Resolved locations of the durable cache artifacts.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CachePaths {
	pub dir: PathBuf,
	pub archive: PathBuf,
	pub library: PathBuf,
}

impl CachePaths {
	/// Per-symbol library produced by a fresh link, removed once every rank
	/// has loaded it. The `.fresh` infix keeps it apart from the canonical
	/// library whatever the symbol is called.
	pub fn fresh_library(&self, symbol: &str) -> PathBuf {
		self.dir.join(format!("{symbol}.fresh.{}", library_extension()))
	}

	/// Sibling of the canonical library that is renamed over it.
	pub fn staging_library(&self) -> PathBuf {
		let mut name = self.library.as_os_str().to_owned();
		name.push(format!(".{}.tmp", std::process::id()));
		PathBuf::from(name)
	}

	pub fn temporary(&self, file_name: &str) -> PathBuf {
		self.dir.join(file_name)
	}
}

#[cfg(target_os = "macos")]
pub fn library_extension() -> &'static str {
	"dylib"
}

#[cfg(not(target_os = "macos"))]
pub fn library_extension() -> &'static str {
	"so"
}

fn default_cache_dir() -> PathBuf {
	dirs::cache_dir().map_or_else(|| PathBuf::from(".kiln"), |dir| dir.join("kiln"))
}
