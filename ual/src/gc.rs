use std::alloc::{alloc_zeroed, Layout};
use std::cell::Cell;

use bitflags::bitflags;

bitflags! {
	/// Flags accompanying an allocation request. `CONTAINS_REFS` tells the
	/// collector the object's slots need per-slot reference tracking (an
	/// array of references, or a string's backing buffer being opaque
	/// bytes would clear it).
	#[derive(Copy, Clone, Eq, PartialEq, Debug)]
	pub struct AllocFlags: u32 {
		const CONTAINS_REFS = 0b0001;
	}
}

/// The external collaborator managing managed-object lifetime. Kept to
/// exactly the operations the code generator's write-barrier discipline
/// needs: allocate, and mark/unmark a slot as holding a live reference.
pub trait GarbageCollector {
	/// Allocates `size` bytes. `obj_count > 0` marks the allocation as an
	/// array of `obj_count` references (each machine-word sized), setting
	/// `AllocFlags::CONTAINS_REFS` for the collector's own bookkeeping.
	fn allocate(&self, size: usize, obj_count: u32) -> *mut u8;

	/// Marks the word at `slot_addr` as holding a live reference. `is_root`
	/// distinguishes GC roots (locals, constant-pool slots) from object
	/// fields (unused here since field access is out of scope).
	fn mark(&self, slot_addr: *mut u8, is_root: bool);

	/// Unmarks the word at `slot_addr`, called before a new mark on
	/// reassignment.
	fn unmark(&self, slot_addr: *mut u8, is_root: bool);
}

/// Single-threaded bump allocator. Never collects: a full mark-sweep-compact
/// collector is out of scope, so this only has to uphold the allocate and
/// mark/unmark contract, not actually reclaim memory.
#[derive(Default)]
pub struct BumpGc {
	live_roots: Cell<u32>,
}

impl BumpGc {
	pub fn new() -> Self {
		Self::default()
	}

	/// Number of slots currently marked as roots. Exposed for tests that
	/// want to observe the write-barrier discipline without a real
	/// collector underneath.
	pub fn live_root_count(&self) -> u32 {
		self.live_roots.get()
	}
}

impl GarbageCollector for BumpGc {
	fn allocate(&self, size: usize, _obj_count: u32) -> *mut u8 {
		let layout = Layout::from_size_align(size.max(1), 8).expect("allocation size overflow");
		unsafe { alloc_zeroed(layout) }
	}

	fn mark(&self, _slot_addr: *mut u8, is_root: bool) {
		if is_root {
			self.live_roots.set(self.live_roots.get() + 1);
		}
	}

	fn unmark(&self, _slot_addr: *mut u8, is_root: bool) {
		if is_root {
			self.live_roots.set(self.live_roots.get().saturating_sub(1));
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn mark_unmark_is_balanced() {
		let gc = BumpGc::new();
		let ptr = gc.allocate(8, 0);
		gc.mark(ptr, true);
		gc.mark(ptr, true);
		assert_eq!(gc.live_root_count(), 2);
		gc.unmark(ptr, true);
		assert_eq!(gc.live_root_count(), 1);
	}

	#[test]
	fn allocate_zeroes_memory() {
		let gc = BumpGc::new();
		let ptr = gc.allocate(8, 0);
		let bytes = unsafe { std::slice::from_raw_parts(ptr, 8) };
		assert_eq!(bytes, &[0u8; 8]);
	}
}
