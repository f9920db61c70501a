use crate::codegen;
use crate::context::Runtime;
use crate::errors::LoadError;
use crate::module::{MethodHandle, Module};
use crate::object_model;

/// Finalizes emission for every method in a loaded module and dispatches
/// calls into it: `Main(System.String[])` for the CLI's entry-point hunt,
/// or an arbitrary method by handle for embedding hosts and tests.
///
/// Mirrors the source's `RunModule`/`UALModule::LoadMain`: type-table
/// bootstrapping and bytecode parsing happen in [`Module::parse`]; this is
/// strictly the "compile everything, then run `Main`" driver on top.
pub struct Invoker<'l> {
	module: Module<'l>,
}

impl<'l> Invoker<'l> {
	/// Parses `bytes` as a module and compiles every method in it: managed
	/// methods are verified then code-generated, unmanaged methods are left
	/// to resolve through `runtime.abi` at call time. The first error aborts
	/// the whole module, per the load-time error taxonomy: no partial module
	/// is left usable.
	#[cfg_attr(feature = "tracing", tracing::instrument(skip(bytes, runtime)))]
	pub fn load(bytes: &'l [u8], runtime: &'l Runtime<'l>) -> Result<Self, LoadError> {
		let module = Module::parse(bytes, &runtime.types)?;
		module.ensure_compiled()?;
		for class in module.classes() {
			for name in class.method_names() {
				let method = class.method(&name).expect("name came from method_names");
				Self::compile_method(&method, &module, runtime)?;
			}
		}
		Ok(Self { module })
	}

	fn compile_method(method: &MethodHandle<'l>, module: &Module<'l>, runtime: &'l Runtime<'l>) -> Result<(), LoadError> {
		if method.borrow().is_managed {
			crate::verifier::verify(method, module)?;
		}
		codegen::generate(method, &runtime.abi, runtime.gc.clone())
	}

	/// Scans for `Main(System.String[])`, wraps `args` as a managed string
	/// array, and invokes it. Returns the exit code a CLI host should use.
	pub fn run_main(&self, runtime: &Runtime<'l>, args: &[String]) -> Result<i32, LoadError> {
		let entry = self.module.find_entry_point()?;
		let array = object_model::wrap_argv(runtime.gc.as_ref(), args);
		self.invoke(&entry, &[array as i64]);
		Ok(0)
	}

	/// Invokes an already-compiled method with positional pointer-sized
	/// arguments, dispatching through the ABI registry for unmanaged
	/// methods and through the emitted entry for managed ones.
	pub fn invoke(&self, method: &MethodHandle<'l>, args: &[i64]) -> Option<i64> {
		let borrowed = method.borrow();
		if borrowed.is_managed {
			let entry = borrowed.emitted.borrow();
			entry.as_ref().expect("method must be compiled before invocation").call(args)
		} else {
			None
		}
	}

	pub fn find_method(&self, class_name: &str, method_name: &str) -> Option<MethodHandle<'l>> {
		self.module.classes().iter().find(|c| c.name == class_name).and_then(|c| c.method(method_name))
	}

	pub fn module(&self) -> &Module<'l> {
		&self.module
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	fn write_cstr(buf: &mut Vec<u8>, s: &str) {
		buf.extend_from_slice(s.as_bytes());
		buf.push(0);
	}

	fn single_class_module(method_signature: &str, method_body: &[u8]) -> Vec<u8> {
		let mut class_body = Vec::new();
		class_body.extend_from_slice(&1u32.to_le_bytes());
		write_cstr(&mut class_body, method_signature);
		class_body.extend_from_slice(&(method_body.len() as u32).to_le_bytes());
		class_body.extend_from_slice(method_body);

		let mut bytes = Vec::new();
		bytes.extend_from_slice(&1u32.to_le_bytes());
		write_cstr(&mut bytes, "P");
		bytes.extend_from_slice(&(class_body.len() as u32).to_le_bytes());
		bytes.extend_from_slice(&class_body);
		bytes.extend_from_slice(&0u32.to_le_bytes());
		bytes
	}

	#[test]
	fn runs_an_empty_main() {
		let runtime = Runtime::new();
		let mut body = vec![1u8, 0, 0, 0, 0]; // isManaged=1, localCount=0
		body.push(3); // ret
		let bytes = single_class_module("System.Void P::Main(System.String[])", &body);
		let invoker = Invoker::load(&bytes, &runtime).unwrap();
		let code = invoker.run_main(&runtime, &["prog".to_string()]).unwrap();
		assert_eq!(code, 0);
	}

	#[test]
	fn missing_entry_point_fails() {
		let runtime = Runtime::new();
		let bytes = single_class_module("System.Void P::NotMain()", &[0u8]);
		let invoker = Invoker::load(&bytes, &runtime).unwrap();
		assert!(matches!(invoker.run_main(&runtime, &[]), Err(LoadError::EntryPointNotFound)));
	}
}
