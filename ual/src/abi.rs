use std::io::Write;

use fxhash::FxHashMap;

use crate::object_model::StringHeader;

/// Signature every ABI-registered host function must have: positional
/// pointer-sized arguments in, a single pointer-sized result out (0 for
/// void). Mirrors the pointer-sized argument/return convention the Invoker
/// uses for managed calls, so external and managed callees are
/// interchangeable from the call site's point of view.
pub type AbiFn = fn(&[i64]) -> i64;

/// Process-wide `name -> function pointer` map, populated once at startup
/// before any module is loaded and read-only from then on.
#[derive(Default)]
pub struct AbiRegistry {
	functions: FxHashMap<String, AbiFn>,
}

impl AbiRegistry {
	/// A registry pre-seeded with the runtime's three built-in host calls.
	pub fn with_builtins() -> Self {
		let mut registry = Self::default();
		registry.register("ConsoleOut", console_out);
		registry.register("PrintInt", print_int);
		registry.register("PrintDouble", print_double);
		registry
	}

	pub fn register(&mut self, name: &str, function: AbiFn) {
		self.functions.insert(name.to_string(), function);
	}

	pub fn get(&self, name: &str) -> Option<AbiFn> {
		self.functions.get(name).copied()
	}
}

fn console_out(args: &[i64]) -> i64 {
	let ptr = args[0] as *const StringHeader;
	let text = unsafe { StringHeader::as_str(ptr) };
	print!("{text}");
	let _ = std::io::stdout().flush();
	0
}

fn print_int(args: &[i64]) -> i64 {
	print!("{}", args[0] as i32);
	let _ = std::io::stdout().flush();
	0
}

fn print_double(args: &[i64]) -> i64 {
	print!("{}", f64::from_bits(args[0] as u64));
	let _ = std::io::stdout().flush();
	0
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn builtins_are_registered() {
		let registry = AbiRegistry::with_builtins();
		assert!(registry.get("ConsoleOut").is_some());
		assert!(registry.get("PrintInt").is_some());
		assert!(registry.get("PrintDouble").is_some());
		assert!(registry.get("NoSuchMethod").is_none());
	}

	#[test]
	fn custom_registration_is_found() {
		let mut registry = AbiRegistry::default();
		fn identity(args: &[i64]) -> i64 {
			args[0]
		}
		registry.register("Identity", identity);
		assert_eq!((registry.get("Identity").unwrap())(&[42]), 42);
	}
}
