//! Compiler, archiver and linker command composition.
//!
//! The platform and offload variations are a plain strategy table picked once
//! when the broker starts: [`Offload`] decides the option prefixes and
//! [`ArchiveStyle`] decides how the whole archive is forced into a link.

use std::fmt;
use std::path::{Path, PathBuf};

use serde::Deserialize;
use tracing::debug;

use crate::config::JitConfig;
use crate::error::{JitError, Result};

/// One external program invocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BuildCommand {
	/// Executable, looked up on `PATH` when not a path.
	pub program: String,
	/// Arguments passed verbatim, no shell involved.
	pub args: Vec<String>,
}

impl BuildCommand {
	pub fn new(program: impl Into<String>) -> Self {
		Self {
			program: program.into(),
			args: Vec::new(),
		}
	}

	/// Appends an argument; empty strings are skipped so optional flags compose.
	pub fn arg(mut self, arg: impl Into<String>) -> Self {
		let arg = arg.into();
		if !arg.is_empty() {
			self.args.push(arg);
		}
		self
	}

	pub fn args<I, S>(mut self, args: I) -> Self
	where
		I: IntoIterator<Item = S>,
		S: Into<String>,
	{
		for arg in args {
			self = self.arg(arg);
		}
		self
	}

	/// Path argument; artifact paths travel through the command buffer as UTF-8.
	pub fn path(self, path: &Path) -> Result<Self> {
		let arg = path.to_str().ok_or_else(|| JitError::NonUtf8Path(path.to_path_buf()))?;
		Ok(self.arg(arg))
	}

	/// NUL-separated argv, program first.
	pub fn encode(&self) -> Vec<u8> {
		let mut bytes = Vec::with_capacity(self.program.len() + self.args.iter().map(|a| a.len() + 1).sum::<usize>());
		bytes.extend_from_slice(self.program.as_bytes());
		for arg in &self.args {
			bytes.push(0);
			bytes.extend_from_slice(arg.as_bytes());
		}
		bytes
	}

	/// Inverse of [`encode`](Self::encode).
	pub fn decode(bytes: &[u8]) -> Option<Self> {
		let mut parts = bytes.split(|b| *b == 0).map(|part| std::str::from_utf8(part).map(str::to_owned));
		let program = parts.next()?.ok()?;
		if program.is_empty() {
			return None;
		}
		let args = parts.collect::<std::result::Result<Vec<_>, _>>().ok()?;
		Some(Self { program, args })
	}

	pub fn to_command(&self) -> std::process::Command {
		let mut cmd = std::process::Command::new(&self.program);
		cmd.args(&self.args).stdin(std::process::Stdio::null());
		cmd
	}
}

impl fmt::Display for BuildCommand {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str(&self.program)?;
		for arg in &self.args {
			write!(f, " {arg}")?;
		}
		Ok(())
	}
}

/// Host builds pass options straight through; device builds wrap them for the
/// offload compiler driver.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Offload {
	Host,
	Device,
}

impl Offload {
	/// Extra flag that makes the driver emit relocatable device code.
	pub fn device_flag(self) -> &'static str {
		match self {
			Offload::Host => "",
			Offload::Device => "--device-c",
		}
	}

	/// Prefix for options forwarded to the host compiler.
	pub fn compiler_prefix(self) -> &'static str {
		match self {
			Offload::Host => "",
			Offload::Device => "-Xcompiler=",
		}
	}

	/// Prefix for options forwarded to the linker.
	pub fn linker_prefix(self) -> &'static str {
		match self {
			Offload::Host => "-Wl,",
			Offload::Device => "-Xlinker=",
		}
	}
}

/// How a link is told to pull in every archive member.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ArchiveStyle {
	/// ELF toolchains: `--whole-archive` / `--no-whole-archive`.
	Gnu,
	/// Mach-O toolchains: `-all_load`.
	Apple,
}

impl ArchiveStyle {
	pub fn for_platform() -> Self {
		if cfg!(target_os = "macos") { ArchiveStyle::Apple } else { ArchiveStyle::Gnu }
	}

	pub fn prefix(self, offload: Offload) -> String {
		match self {
			ArchiveStyle::Gnu => format!("{}--whole-archive", offload.linker_prefix()),
			ArchiveStyle::Apple => "-all_load".to_owned(),
		}
	}

	pub fn postfix(self, offload: Offload) -> String {
		match self {
			ArchiveStyle::Gnu => format!("{}--no-whole-archive", offload.linker_prefix()),
			ArchiveStyle::Apple => String::new(),
		}
	}

	/// Flag that stops `install` from leaving backup copies behind.
	pub fn install_backup(self) -> &'static str {
		match self {
			ArchiveStyle::Gnu => "--backup=none",
			ArchiveStyle::Apple => "",
		}
	}
}

/// Resolved programs and the strategy table used to compose build commands.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Toolchain {
	pub cxx: String,
	pub flags: Vec<String>,
	pub archiver: String,
	pub installer: String,
	pub offload: Offload,
	pub archive_style: ArchiveStyle,
}

impl Toolchain {
	/// Builds the toolchain for `config`, resolving the compiler driver.
	///
	/// # Errors
	///
	/// Returns [`JitError::ToolchainUnavailable`] if no compiler is configured
	/// and none of the usual drivers is on `PATH`.
	pub fn from_config(config: &JitConfig) -> Result<Self> {
		let cxx = match &config.cxx {
			Some(cxx) => cxx.clone(),
			None => resolve_compiler().ok_or(JitError::ToolchainUnavailable)?,
		};
		let toolchain = Self {
			cxx,
			flags: config.flags.clone(),
			archiver: config.archiver.clone(),
			installer: config.installer.clone(),
			offload: if config.device { Offload::Device } else { Offload::Host },
			archive_style: config.archive_style.unwrap_or_else(ArchiveStyle::for_platform),
		};
		debug!(cxx = %toolchain.cxx, offload = ?toolchain.offload, archive_style = ?toolchain.archive_style, "Toolchain selected");
		Ok(toolchain)
	}

	/// `source` → `object`.
	pub fn compile(&self, source: &Path, object: &Path) -> Result<BuildCommand> {
		let xcompiler = self.offload.compiler_prefix();
		BuildCommand::new(&self.cxx)
			.args(self.flags.iter().cloned())
			.arg(self.offload.device_flag())
			.arg(format!("{xcompiler}-fPIC"))
			.arg(format!("{xcompiler}-pipe"))
			.arg(format!("{xcompiler}-Wno-unused-variable"))
			.args(["-c", "-o"])
			.path(object)?
			.path(source)
	}

	/// Appends (or replaces) `object` in `archive`.
	pub fn archive(&self, archive: &Path, object: &Path) -> Result<BuildCommand> {
		BuildCommand::new(&self.archiver).arg("-rv").path(archive)?.path(object)
	}

	/// Links every member of `archive` into the shared library `output`.
	pub fn link(&self, archive: &Path, output: &Path) -> Result<BuildCommand> {
		Ok(BuildCommand::new(&self.cxx)
			.arg("-shared")
			.arg("-o")
			.path(output)?
			.arg(self.archive_style.prefix(self.offload))
			.path(archive)?
			.arg(self.archive_style.postfix(self.offload)))
	}

	/// Copies `from` to `to` with executable permissions.
	pub fn install(&self, from: &Path, to: &Path) -> Result<BuildCommand> {
		BuildCommand::new(&self.installer)
			.args(["-m", "0755"])
			.arg(self.archive_style.install_backup())
			.path(from)?
			.path(to)
	}
}

/// Returns `$CXX` when it is runnable, otherwise the first driver found on `PATH`.
pub fn resolve_compiler() -> Option<String> {
	#[cfg(target_os = "macos")]
	const CANDIDATES: &[&str] = &["clang++", "c++", "g++"];
	#[cfg(not(target_os = "macos"))]
	const CANDIDATES: &[&str] = &["c++", "g++", "clang++"];

	if let Ok(cxx) = std::env::var("CXX")
		&& which::which(&cxx).is_ok()
	{
		return Some(cxx);
	}
	CANDIDATES
		.iter()
		.find_map(|name| which::which(name).ok())
		.map(|path: PathBuf| path.to_string_lossy().into_owned())
}

#[cfg(test)]
mod tests {
	use pretty_assertions::assert_eq;

	use super::*;

	fn toolchain(offload: Offload, archive_style: ArchiveStyle) -> Toolchain {
		Toolchain {
			cxx: "c++".to_owned(),
			flags: vec!["-O3".to_owned()],
			archiver: "ar".to_owned(),
			installer: "install".to_owned(),
			offload,
			archive_style,
		}
	}

	#[test]
	fn host_compile_command() {
		let cmd = toolchain(Offload::Host, ArchiveStyle::Gnu)
			.compile(Path::new("/c/k1.cc"), Path::new("/c/k1.co"))
			.unwrap();
		assert_eq!(
			cmd.to_string(),
			"c++ -O3 -fPIC -pipe -Wno-unused-variable -c -o /c/k1.co /c/k1.cc"
		);
	}

	#[test]
	fn device_compile_wraps_host_options() {
		let cmd = toolchain(Offload::Device, ArchiveStyle::Gnu)
			.compile(Path::new("k.cc"), Path::new("k.co"))
			.unwrap();
		assert_eq!(
			cmd.to_string(),
			"c++ -O3 --device-c -Xcompiler=-fPIC -Xcompiler=-pipe -Xcompiler=-Wno-unused-variable -c -o k.co k.cc"
		);
	}

	#[test]
	fn gnu_link_wraps_whole_archive() {
		let cmd = toolchain(Offload::Host, ArchiveStyle::Gnu)
			.link(Path::new("lib.a"), Path::new("k1.so"))
			.unwrap();
		assert_eq!(cmd.to_string(), "c++ -shared -o k1.so -Wl,--whole-archive lib.a -Wl,--no-whole-archive");

		let device = toolchain(Offload::Device, ArchiveStyle::Gnu)
			.link(Path::new("lib.a"), Path::new("k1.so"))
			.unwrap();
		assert_eq!(
			device.to_string(),
			"c++ -shared -o k1.so -Xlinker=--whole-archive lib.a -Xlinker=--no-whole-archive"
		);
	}

	#[test]
	fn apple_link_uses_all_load() {
		let cmd = toolchain(Offload::Host, ArchiveStyle::Apple)
			.link(Path::new("lib.a"), Path::new("k1.dylib"))
			.unwrap();
		assert_eq!(cmd.args, vec!["-shared", "-o", "k1.dylib", "-all_load", "lib.a"]);
	}

	#[test]
	fn install_backup_flag_depends_on_style() {
		let gnu = toolchain(Offload::Host, ArchiveStyle::Gnu)
			.install(Path::new("a"), Path::new("b"))
			.unwrap();
		assert_eq!(gnu.to_string(), "install -m 0755 --backup=none a b");
		let apple = toolchain(Offload::Host, ArchiveStyle::Apple)
			.install(Path::new("a"), Path::new("b"))
			.unwrap();
		assert_eq!(apple.to_string(), "install -m 0755 a b");
	}

	#[test]
	fn archive_command() {
		let cmd = toolchain(Offload::Host, ArchiveStyle::Gnu)
			.archive(Path::new("lib.a"), Path::new("k.co"))
			.unwrap();
		assert_eq!(cmd.to_string(), "ar -rv lib.a k.co");
	}

	#[test]
	fn encoded_commands_decode_to_the_same_argv() {
		let cmd = BuildCommand::new("c++").args(["-o", "out file.so", "-DX=\"1 2\""]);
		assert_eq!(BuildCommand::decode(&cmd.encode()), Some(cmd));
		assert_eq!(BuildCommand::decode(b""), None);
		assert_eq!(BuildCommand::decode(b"ar\0\xff"), None);
	}

	#[test]
	fn configured_compiler_skips_probing() {
		let mut config = JitConfig::with_cache_dir("/c");
		config.cxx = Some("my-c++".to_owned());
		config.device = true;
		config.archive_style = Some(ArchiveStyle::Apple);
		let toolchain = Toolchain::from_config(&config).unwrap();
		assert_eq!(toolchain.cxx, "my-c++");
		assert_eq!(toolchain.offload, Offload::Device);
		assert_eq!(toolchain.archive_style, ArchiveStyle::Apple);
	}
}
