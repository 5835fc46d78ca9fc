//! CLI schema for the kiln binary.

use std::path::PathBuf;

use clap::{Parser, Subcommand};

#[derive(Parser, Debug)]
#[command(name = "kiln")]
#[command(about = "Compile, cache and load native kernels")]
#[command(version)]
/// Command-line arguments.
pub struct Cli {
	/// Configuration file (defaults to the user config directory)
	#[arg(long, short = 'c', global = true, value_name = "PATH")]
	pub config: Option<PathBuf>,

	/// Verbose logging
	#[arg(long, short = 'v', global = true)]
	pub verbose: bool,

	/// Subcommand to execute.
	#[command(subcommand)]
	pub command: Command,
}

/// Available subcommands.
#[derive(Subcommand, Debug, PartialEq, Eq)]
pub enum Command {
	/// Resolve a kernel, building it on a cache miss
	Build {
		/// C++ source file defining the kernel
		source: PathBuf,

		/// Exported symbol to resolve
		#[arg(long, short = 's')]
		symbol: String,

		/// Call the kernel as `extern "C" fn() -> i64` and print the result
		#[arg(long)]
		invoke: bool,
	},
	/// List the objects stored in the kernel archive
	List,
	/// Remove the cache files
	Clean,
}
