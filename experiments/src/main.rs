use std::fs::File;
use std::io::BufWriter;
use std::time::SystemTime;

use memory_stats::memory_stats;
use tracing_flame::FlameLayer;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::Registry;

use ual::context::Runtime;
use ual::invoker::Invoker;

fn setup_global_subscriber() -> impl Drop {
	let file = File::create("./trace.folded").unwrap();
	let flame_layer = FlameLayer::new(BufWriter::new(file)).with_file_and_line(false);
	let guard = flame_layer.flush_on_drop();

	let subscriber = Registry::default().with(flame_layer);

	tracing::subscriber::set_global_default(subscriber).expect("Could not set global default");
	guard
}

fn main() {
	let _guard = setup_global_subscriber();

	let module_path = std::env::args().nth(1).expect("usage: ual-profiling <module-file> [<program-args>...]");
	let program_args: Vec<String> = std::iter::once(module_path.clone()).chain(std::env::args().skip(2)).collect();

	let mut start = SystemTime::now();
	let runtime = Runtime::new();

	println! {
		"Runtime creation time: {:?}, RAM: {}MB",
		start.elapsed().unwrap(),
		memory_stats().unwrap().virtual_mem as f32 / 1000000.0,
	}

	start = SystemTime::now();
	let bytes = std::fs::read(&module_path).unwrap();
	let invoker = Invoker::load(&bytes, &runtime).expect("module failed to load/verify/emit");

	println! {
		"Load+verify+codegen time: {:?}, RAM: {}MB",
		start.elapsed().unwrap(),
		memory_stats().unwrap().virtual_mem as f32 / 1000000.0,
	}

	println!("Loaded classes: {}", invoker.module().classes().len());

	start = SystemTime::now();
	let exit_code = invoker.run_main(&runtime, &program_args).expect("Main failed to run");

	println! {
		"Main() invocation time: {:?}, RAM: {}MB",
		start.elapsed().unwrap(),
		memory_stats().unwrap().virtual_mem as f32 / 1000000.0,
	}

	std::process::exit(exit_code);
}
