//! The two primitives the broker needs from a distributed job.
//!
//! A real job plugs its collective-communication layer in through
//! [`Collective`]. [`Solo`] covers plain single-process runs and
//! [`LocalGroup`] runs several ranks as threads of one process.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Barrier};

/// Membership in a distributed job.
pub trait Collective: Send + Sync {
	/// This process's rank, `0..size()`.
	fn rank(&self) -> usize;

	/// Number of ranks in the job.
	fn size(&self) -> usize;

	/// Whether more than one process takes part.
	fn is_distributed(&self) -> bool {
		self.size() > 1
	}

	/// The one rank allowed to run build tools.
	fn is_coordinator(&self) -> bool {
		self.rank() == 0
	}

	/// Whether the coordinator runs build tools from a forked helper.
	///
	/// [`Jit::initialize`](crate::Jit::initialize) forks that helper on the
	/// spot. Runtimes that forbid `fork` once they are up need it forked
	/// beforehand with [`Prefork`](crate::topology::Prefork) instead.
	fn needs_helper(&self) -> bool {
		self.is_distributed()
	}

	/// Logical-OR all-reduce of `failed` across every rank.
	///
	/// This is the status barrier: no rank returns before every rank has
	/// contributed, and every rank returns the same value.
	fn any_failed(&self, failed: bool) -> bool;

	/// Plain barrier.
	fn barrier(&self) {
		self.any_failed(false);
	}
}

/// No distributed job: one rank, reductions are the identity.
#[derive(Debug, Clone, Copy, Default)]
pub struct Solo;

impl Collective for Solo {
	fn rank(&self) -> usize {
		0
	}

	fn size(&self) -> usize {
		1
	}

	fn any_failed(&self, failed: bool) -> bool {
		failed
	}
}

struct GroupState {
	barrier: Barrier,
	// Three slots so a slot can be cleared while neighbours are in use.
	slots: [AtomicBool; 3],
}

/// Ranks of one in-process group, one handle per participating thread.
pub struct LocalGroup {
	rank: usize,
	size: usize,
	epoch: AtomicU64,
	state: Arc<GroupState>,
}

impl LocalGroup {
	/// Creates `size` rank handles; hand one to each participating thread.
	pub fn new(size: usize) -> Vec<LocalGroup> {
		assert!(size > 0, "group size must be > 0");
		let state = Arc::new(GroupState {
			barrier: Barrier::new(size),
			slots: [AtomicBool::new(false), AtomicBool::new(false), AtomicBool::new(false)],
		});
		(0..size)
			.map(|rank| LocalGroup {
				rank,
				size,
				epoch: AtomicU64::new(0),
				state: Arc::clone(&state),
			})
			.collect()
	}
}

impl Collective for LocalGroup {
	fn rank(&self) -> usize {
		self.rank
	}

	fn size(&self) -> usize {
		self.size
	}

	/// Ranks are threads of this process, which has no fork restriction.
	fn needs_helper(&self) -> bool {
		false
	}

	fn any_failed(&self, failed: bool) -> bool {
		let epoch = self.epoch.fetch_add(1, Ordering::Relaxed);
		let slot = (epoch % 3) as usize;
		if failed {
			self.state.slots[slot].store(true, Ordering::SeqCst);
		}
		let leader = self.state.barrier.wait().is_leader();
		let result = self.state.slots[slot].load(Ordering::SeqCst);
		if leader {
			// Last used two reductions ago; every rank has read it.
			self.state.slots[((epoch + 2) % 3) as usize].store(false, Ordering::SeqCst);
		}
		result
	}
}
