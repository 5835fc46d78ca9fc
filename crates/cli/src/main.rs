//! Kiln command line.
//!
//! Resolves kernels through the on-disk cache from a shell, and inspects or
//! clears that cache.

mod cli;
mod commands;

use std::path::PathBuf;

use clap::Parser;
use cli::{Cli, Command};

fn main() -> anyhow::Result<()> {
	let cli = Cli::parse();
	setup_tracing(cli.verbose);

	let config = commands::load_config(cli.config.as_deref())?;
	tracing::debug!(cache_dir = %config.cache_dir.display(), "Configuration loaded");

	match cli.command {
		Command::Build { source, symbol, invoke } => commands::build(config, &source, &symbol, invoke),
		Command::List => commands::list(&config),
		Command::Clean => commands::clean(&config),
	}
}

fn setup_tracing(verbose: bool) {
	use std::fs::OpenOptions;

	use tracing_subscriber::EnvFilter;
	use tracing_subscriber::fmt::format::FmtSpan;
	use tracing_subscriber::prelude::*;

	let filter = || {
		EnvFilter::try_from_env("KILN_LOG")
			.or_else(|_| EnvFilter::try_from_default_env())
			.unwrap_or_else(|_| {
				if verbose {
					EnvFilter::new("kiln_jit=debug,kiln=debug,info")
				} else {
					EnvFilter::new("info")
				}
			})
	};

	// KILN_LOG_DIR keeps a per-process log next to batch job output
	if let Some(log_dir) = std::env::var("KILN_LOG_DIR").ok().map(PathBuf::from)
		&& std::fs::create_dir_all(&log_dir).is_ok()
	{
		let log_path = log_dir.join(format!("kiln.{}.log", std::process::id()));

		if let Ok(file) = OpenOptions::new().create(true).append(true).open(&log_path) {
			let file_layer = tracing_subscriber::fmt::layer()
				.with_writer(file)
				.with_ansi(false)
				.with_span_events(FmtSpan::CLOSE)
				.with_target(true);

			tracing_subscriber::registry().with(filter()).with(file_layer).init();

			tracing::info!(path = ?log_path, "Kiln tracing initialized");
			return;
		}
	}

	tracing_subscriber::fmt()
		.with_env_filter(filter())
		.with_writer(std::io::stderr)
		.init();
}
