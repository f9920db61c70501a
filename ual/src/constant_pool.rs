use std::cell::RefCell;
use std::rc::Rc;

use fxhash::FxHashMap;

use crate::gc::GarbageCollector;
use crate::object_model::StringHeader;

/// Per-method interned string table. Strings are deduplicated by value and
/// rooted with the GC for as long as the method (and this pool) is alive;
/// dropping the pool unroots every entry, mirroring the scoped cleanup the
/// source runs in a method's destructor.
///
/// Emitted code is meant to address an entry through `pool -> array ->
/// array[index]` rather than caching the raw string pointer, so growing
/// `entries` never invalidates already-emitted loads: every read goes back
/// through this pool.
pub struct ConstantPool {
	gc: Rc<dyn GarbageCollector>,
	entries: RefCell<Vec<*mut StringHeader>>,
	by_value: RefCell<FxHashMap<String, usize>>,
}

impl ConstantPool {
	pub fn new(gc: Rc<dyn GarbageCollector>) -> Self {
		Self { gc, entries: RefCell::new(Vec::new()), by_value: RefCell::new(FxHashMap::default()) }
	}

	/// Interns `text`, returning its pool index. Re-interning the same
	/// value returns the same index without allocating again.
	pub fn intern(&self, text: &str) -> usize {
		if let Some(index) = self.by_value.borrow().get(text) {
			return *index;
		}
		let ptr = StringHeader::allocate(self.gc.as_ref(), text);
		self.gc.mark(ptr as *mut u8, true);
		let mut entries = self.entries.borrow_mut();
		let index = entries.len();
		entries.push(ptr);
		self.by_value.borrow_mut().insert(text.to_string(), index);
		index
	}

	pub fn len(&self) -> usize {
		self.entries.borrow().len()
	}

	pub fn is_empty(&self) -> bool {
		self.len() == 0
	}

	/// Resolves the current pointer stored at `index`.
	pub fn get(&self, index: usize) -> *mut StringHeader {
		self.entries.borrow()[index]
	}
}

impl Drop for ConstantPool {
	fn drop(&mut self) {
		for ptr in self.entries.borrow().iter() {
			self.gc.unmark(*ptr as *mut u8, true);
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::gc::BumpGc;
	use std::rc::Rc;

	#[test]
	fn interning_the_same_value_twice_dedups() {
		let gc: Rc<dyn crate::gc::GarbageCollector> = Rc::new(BumpGc::new());
		let pool = ConstantPool::new(gc);
		let a = pool.intern("x");
		let b = pool.intern("x");
		assert_eq!(a, b);
		assert_eq!(pool.len(), 1);
	}

	#[test]
	fn distinct_values_get_distinct_indices() {
		let gc: Rc<dyn crate::gc::GarbageCollector> = Rc::new(BumpGc::new());
		let pool = ConstantPool::new(gc);
		let a = pool.intern("x");
		let b = pool.intern("y");
		assert_ne!(a, b);
		assert_eq!(unsafe { StringHeader::as_str(pool.get(a)) }, "x");
		assert_eq!(unsafe { StringHeader::as_str(pool.get(b)) }, "y");
	}

	#[test]
	fn drop_unmarks_every_root() {
		let gc = Rc::new(BumpGc::new());
		{
			let pool = ConstantPool::new(gc.clone());
			pool.intern("a");
			pool.intern("b");
			assert_eq!(gc.live_root_count(), 2);
		}
		assert_eq!(gc.live_root_count(), 0);
	}
}
