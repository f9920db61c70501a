use std::process::ExitCode;

use ual::context::Runtime;
use ual::invoker::Invoker;

/// Owns the module's bytes for the process lifetime. Memory-mapped when the
/// `memmap2` feature is enabled (the format the spec describes), a plain
/// in-memory buffer otherwise.
enum ModuleBytes {
	#[cfg(feature = "memmap2")]
	Mapped(memmap2::Mmap),
	Owned(Vec<u8>),
}

impl ModuleBytes {
	#[cfg(feature = "memmap2")]
	fn load(path: &str) -> std::io::Result<Self> {
		let file = std::fs::File::open(path)?;
		let mmap = unsafe { memmap2::Mmap::map(&file)? };
		Ok(Self::Mapped(mmap))
	}

	#[cfg(not(feature = "memmap2"))]
	fn load(path: &str) -> std::io::Result<Self> {
		Ok(Self::Owned(std::fs::read(path)?))
	}

	fn as_slice(&self) -> &[u8] {
		match self {
			#[cfg(feature = "memmap2")]
			Self::Mapped(mmap) => mmap.as_ref(),
			Self::Owned(bytes) => bytes.as_slice(),
		}
	}
}

fn main() -> ExitCode {
	let mut args = std::env::args();
	let executable = args.next().unwrap_or_else(|| "ual".to_string());
	let Some(module_path) = args.next() else {
		eprintln!("usage: {executable} <module-file> [<program-args>...]");
		return ExitCode::FAILURE;
	};
	let program_args: Vec<String> = std::iter::once(module_path.clone()).chain(args).collect();

	let bytes = match ModuleBytes::load(&module_path) {
		Ok(bytes) => bytes,
		Err(err) => {
			eprintln!("ual: unable to read `{module_path}`: {err}");
			return ExitCode::FAILURE;
		}
	};

	let runtime = Runtime::new();
	match run(bytes.as_slice(), &runtime, &program_args) {
		Ok(code) => ExitCode::from(code as u8),
		Err(err) => {
			eprintln!("ual: {err}");
			ExitCode::FAILURE
		}
	}
}

fn run<'l>(bytes: &'l [u8], runtime: &'l Runtime<'l>, args: &[String]) -> Result<i32, ual::errors::LoadError> {
	let invoker = Invoker::load(bytes, runtime)?;
	invoker.run_main(runtime, args)
}
