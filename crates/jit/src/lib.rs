//! Just-in-time kernel compilation broker.
//!
//! Kernels arrive as C++ source with a content hash. The broker resolves them
//! against a shared library in an on-disk cache; on a miss the coordinating
//! rank compiles the kernel, appends the object to an accumulation archive and
//! relinks the library, while the remaining ranks wait and then load it.
//!
//! Inside a distributed job the build tools never run in the coordinator
//! itself: a helper forked at [`Jit::initialize`], or earlier with
//! [`Prefork::spawn`], executes them, reached through a shared-memory
//! [`rendezvous::Rendezvous`] mailbox.

pub mod archive;
mod cache;
pub mod collective;
pub mod config;
pub mod error;
pub mod kernel;
pub mod orchestrator;
pub mod rendezvous;
pub mod toolchain;
pub mod topology;

pub use cache::{Jit, JitStats};
pub use collective::{Collective, LocalGroup, Solo};
pub use config::{CachePaths, JitConfig};
pub use error::{JitError, Result};
pub use kernel::{Kernel, KernelId, canonical_symbol, is_valid_symbol};
pub use toolchain::{ArchiveStyle, BuildCommand, Offload, Toolchain};
pub use topology::Prefork;
