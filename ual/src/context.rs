use std::pin::Pin;
use std::rc::Rc;

use bumpalo::Bump;
use derivative::Derivative;

use crate::abi::AbiRegistry;
use crate::gc::{BumpGc, GarbageCollector};
use crate::types::TypeTable;

/// Process-wide state shared across module load, verification, and code
/// generation: the type table, and the ABI registry. Populated once before
/// the first module is loaded; read-only from the moment emission begins
/// (`codegen::generate` never mutates it).
///
/// `bump` backs `types`: it is boxed and pinned so its address is stable,
/// and `'l` is recovered from it with a single unsafe transmute at
/// construction time, letting arena-allocated `&'l Type<'l>` handles
/// outlive the function that created the arena.
#[derive(Derivative)]
#[derivative(Debug)]
pub struct Runtime<'l> {
	#[derivative(Debug = "ignore")]
	bump: Pin<Box<Bump>>,
	pub types: TypeTable<'l>,
	#[derivative(Debug = "ignore")]
	pub abi: AbiRegistry,
	#[derivative(Debug = "ignore")]
	pub gc: Rc<dyn GarbageCollector>,
}

impl<'l> Runtime<'l> {
	/// A runtime with the built-in ABI registrations and a bump-allocating
	/// reference GC, suitable for the CLI and for tests.
	pub fn new() -> Self {
		Self::with_gc(Rc::new(BumpGc::new()))
	}

	pub fn with_gc(gc: Rc<dyn GarbageCollector>) -> Self {
		let bump = Box::pin(Bump::new());
		// SAFETY: `bump` is heap-allocated and pinned, so this reference
		// stays valid for as long as `Self` does; nothing below this point
		// moves `bump` out of the box.
		let bump_ref: &'l Bump = unsafe { std::mem::transmute::<&Bump, &'l Bump>(&bump) };
		Self { bump, types: TypeTable::new(bump_ref), abi: AbiRegistry::with_builtins(), gc }
	}
}

impl Default for Runtime<'_> {
	fn default() -> Self {
		Self::new()
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn builtin_types_and_abi_are_preregistered() {
		let runtime = Runtime::new();
		assert!(runtime.types.get("System.Int32").is_some());
		assert!(runtime.abi.get("ConsoleOut").is_some());
	}
}
