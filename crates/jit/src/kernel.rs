//! Kernel identity and resolved kernel handles.

use std::ffi::c_void;
use std::fmt;
use std::ptr::NonNull;
use std::sync::Arc;

use libloading::Library;
use xxhash_rust::xxh3::xxh3_64;

/// Content hash of a kernel's rendered source paired with its symbol name.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct KernelId {
	hash: u64,
	symbol: String,
}

impl KernelId {
	/// Pairs a caller-supplied hash with a caller-supplied symbol.
	pub fn new(hash: u64, symbol: impl Into<String>) -> Self {
		Self {
			hash,
			symbol: symbol.into(),
		}
	}

	/// Derives the hash from `source` and the canonical symbol from the hash.
	///
	/// Identical source text always yields the same identity.
	pub fn from_source(source: &str) -> Self {
		let hash = xxh3_64(source.as_bytes());
		Self::new(hash, canonical_symbol(hash))
	}

	pub fn hash(&self) -> u64 {
		self.hash
	}

	pub fn symbol(&self) -> &str {
		&self.symbol
	}

	/// File stem shared by this kernel's temporaries: `k` plus 16 hex digits.
	pub fn file_stem(&self) -> String {
		canonical_symbol(self.hash)
	}

	/// Name of the ephemeral source input file.
	pub fn source_file(&self) -> String {
		format!("{}.cc", self.file_stem())
	}

	/// Name of the ephemeral object file.
	pub fn object_file(&self) -> String {
		format!("{}.co", self.file_stem())
	}
}

impl fmt::Display for KernelId {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		write!(f, "{}#{:016x}", self.symbol, self.hash)
	}
}

/// Whether `symbol` is a C identifier, the only names a kernel may export.
pub fn is_valid_symbol(symbol: &str) -> bool {
	let mut chars = symbol.chars();
	chars.next().is_some_and(|c| c == '_' || c.is_ascii_alphabetic())
		&& chars.all(|c| c == '_' || c.is_ascii_alphanumeric())
}

/// Symbol name generated for a content hash.
pub fn canonical_symbol(hash: u64) -> String {
	format!("k{hash:016x}")
}

/// A resolved kernel entry point.
///
/// Holds the library it was resolved from, so the address stays mapped for as
/// long as the handle (or a clone) is alive.
#[derive(Clone)]
pub struct Kernel {
	symbol: String,
	address: NonNull<c_void>,
	_library: Arc<Library>,
}

// The address is immutable code in a mapped library that outlives the handle.
unsafe impl Send for Kernel {}
unsafe impl Sync for Kernel {}

impl Kernel {
	pub(crate) fn new(symbol: &str, address: NonNull<c_void>, library: Arc<Library>) -> Self {
		Self {
			symbol: symbol.to_owned(),
			address,
			_library: library,
		}
	}

	pub fn symbol(&self) -> &str {
		&self.symbol
	}

	/// Raw native address of the kernel.
	pub fn address(&self) -> *const c_void {
		self.address.as_ptr()
	}

	/// Reinterprets the address as a concrete function pointer type.
	///
	/// # Safety
	///
	/// `F` must be an `extern "C" fn` type matching the signature the kernel
	/// source actually defines. The returned pointer must not be called after
	/// every clone of this handle has been dropped.
	pub unsafe fn as_fn<F: Copy>(&self) -> F {
		assert_eq!(
			std::mem::size_of::<F>(),
			std::mem::size_of::<*const c_void>(),
			"kernel signature must be a plain function pointer"
		);
		unsafe { std::mem::transmute_copy(&self.address) }
	}
}

impl fmt::Debug for Kernel {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.debug_struct("Kernel")
			.field("symbol", &self.symbol)
			.field("address", &self.address)
			.finish_non_exhaustive()
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn identical_source_yields_identical_identity() {
		let a = KernelId::from_source("return 42;");
		let b = KernelId::from_source("return 42;");
		assert_eq!(a, b);
		assert_ne!(a, KernelId::from_source("return 43;"));
	}

	#[test]
	fn temporaries_are_named_after_the_hash() {
		let id = KernelId::new(0x1, "k1");
		assert_eq!(id.file_stem(), "k0000000000000001");
		assert_eq!(id.source_file(), "k0000000000000001.cc");
		assert_eq!(id.object_file(), "k0000000000000001.co");
		assert_eq!(id.symbol(), "k1");
	}

	#[test]
	fn symbols_must_be_c_identifiers() {
		for ok in ["k1", "_k", "libkiln", "k0123456789abcdef"] {
			assert!(is_valid_symbol(ok), "{ok}");
		}
		for bad in ["", "1k", "../k1", "k/1", "k.1", "k-1", "k 1"] {
			assert!(!is_valid_symbol(bad), "{bad}");
		}
	}

	#[test]
	fn canonical_symbol_matches_file_stem() {
		let id = KernelId::from_source("int x;");
		assert_eq!(id.symbol(), id.file_stem());
		assert_eq!(id.symbol().len(), 17);
	}
}
