//! Drives `Invoker` end to end over hand-built module byte streams, one per
//! scenario: a managed method is loaded, verified, code-generated and
//! invoked, with no step of the pipeline mocked out.

use std::cell::RefCell;

use ual::context::Runtime;
use ual::errors::{LoadError, MalformedKind};
use ual::invoker::Invoker;
use ual::object_model::StringHeader;

fn write_cstr(buf: &mut Vec<u8>, s: &str) {
	buf.extend_from_slice(s.as_bytes());
	buf.push(0);
}

fn op(code: u8, operand: u32) -> Vec<u8> {
	let mut bytes = vec![code];
	bytes.extend_from_slice(&operand.to_le_bytes());
	bytes
}

fn ldarg(i: u32) -> Vec<u8> {
	op(0, i)
}
fn ldloc(i: u32) -> Vec<u8> {
	op(7, i)
}
fn stloc(i: u32) -> Vec<u8> {
	op(5, i)
}
fn ldc_i4(v: u32) -> Vec<u8> {
	op(4, v)
}
fn ldstr(s: &str) -> Vec<u8> {
	let mut bytes = vec![2u8];
	write_cstr(&mut bytes, s);
	bytes
}
fn call(handle: u32) -> Vec<u8> {
	op(1, handle)
}
fn ble(target: u32) -> Vec<u8> {
	op(9, target)
}
fn add() -> Vec<u8> {
	vec![8]
}
fn mul() -> Vec<u8> {
	vec![16]
}
fn ret() -> Vec<u8> {
	vec![3]
}

fn concat(parts: &[Vec<u8>]) -> Vec<u8> {
	parts.iter().flat_map(|p| p.iter().copied()).collect()
}

struct MethodDef {
	signature: String,
	body: Vec<u8>,
}

fn managed(locals: &[&str], opcodes: Vec<u8>) -> Vec<u8> {
	let mut body = vec![1u8];
	body.extend_from_slice(&(locals.len() as u32).to_le_bytes());
	for local in locals {
		write_cstr(&mut body, local);
	}
	body.extend_from_slice(&opcodes);
	body
}

fn unmanaged() -> Vec<u8> {
	vec![0u8]
}

fn build_module(classes: &[(&str, Vec<MethodDef>)], imports: &[(u32, &str)]) -> Vec<u8> {
	let mut bytes = Vec::new();
	bytes.extend_from_slice(&(classes.len() as u32).to_le_bytes());
	for (name, methods) in classes {
		write_cstr(&mut bytes, name);
		let mut class_body = Vec::new();
		class_body.extend_from_slice(&(methods.len() as u32).to_le_bytes());
		for method in methods {
			write_cstr(&mut class_body, &method.signature);
			class_body.extend_from_slice(&(method.body.len() as u32).to_le_bytes());
			class_body.extend_from_slice(&method.body);
		}
		bytes.extend_from_slice(&(class_body.len() as u32).to_le_bytes());
		bytes.extend_from_slice(&class_body);
	}
	bytes.extend_from_slice(&(imports.len() as u32).to_le_bytes());
	for (handle, signature) in imports {
		bytes.extend_from_slice(&handle.to_le_bytes());
		write_cstr(&mut bytes, signature);
	}
	bytes
}

thread_local! {
	static CAPTURED: RefCell<Vec<String>> = RefCell::new(Vec::new());
}

fn capture_console_out(args: &[i64]) -> i64 {
	let ptr = args[0] as *const StringHeader;
	let text = unsafe { StringHeader::as_str(ptr) };
	CAPTURED.with(|c| c.borrow_mut().push(text.to_string()));
	0
}

#[test]
fn hello_world_prints_via_console_out() {
	CAPTURED.with(|c| c.borrow_mut().clear());
	let mut runtime = Runtime::new();
	runtime.abi.register("ConsoleOut", capture_console_out);

	let console_out_sig = "System.Void P::ConsoleOut(System.String)";
	let main_opcodes = concat(&[ldstr("hi"), call(0), ret()]);
	let classes = vec![(
		"P",
		vec![
			MethodDef { signature: "System.Void P::Main(System.String[])".into(), body: managed(&[], main_opcodes) },
			MethodDef { signature: console_out_sig.into(), body: unmanaged() },
		],
	)];
	let bytes = build_module(&classes, &[(0, console_out_sig)]);

	let invoker = Invoker::load(&bytes, &runtime).unwrap();
	let code = invoker.run_main(&runtime, &["prog".to_string()]).unwrap();
	assert_eq!(code, 0);
	CAPTURED.with(|c| assert_eq!(*c.borrow(), vec!["hi".to_string()]));
}

#[test]
fn integer_addition() {
	let runtime = Runtime::new();
	let opcodes = concat(&[ldarg(0), ldarg(1), add(), ret()]);
	let classes = vec![(
		"P",
		vec![MethodDef { signature: "System.Int32 P::F(System.Int32,System.Int32)".into(), body: managed(&[], opcodes) }],
	)];
	let bytes = build_module(&classes, &[]);

	let invoker = Invoker::load(&bytes, &runtime).unwrap();
	let method = invoker.find_method("P", "F").unwrap();
	assert_eq!(invoker.invoke(&method, &[5, 7]), Some(12));
}

#[test]
fn double_multiplication() {
	let runtime = Runtime::new();
	let opcodes = concat(&[ldarg(0), ldarg(1), mul(), ret()]);
	let classes = vec![(
		"P",
		vec![MethodDef { signature: "System.Double P::F(System.Double,System.Double)".into(), body: managed(&[], opcodes) }],
	)];
	let bytes = build_module(&classes, &[]);

	let invoker = Invoker::load(&bytes, &runtime).unwrap();
	let method = invoker.find_method("P", "F").unwrap();
	let result = invoker.invoke(&method, &[2.5f64.to_bits() as i64, 4.0f64.to_bits() as i64]).unwrap();
	assert_eq!(f64::from_bits(result as u64), 10.0);
}

#[test]
fn loop_sums_zero_to_n() {
	let runtime = Runtime::new();

	let mut opcodes = concat(&[ldc_i4(0), stloc(0), ldc_i4(0), stloc(1)]);
	let loop_start = opcodes.len() as u32;
	opcodes.extend(concat(&[
		ldloc(0),
		ldloc(1),
		add(),
		stloc(0),
		ldloc(1),
		ldc_i4(1),
		add(),
		stloc(1),
		ldloc(1),
		ldarg(0),
		ble(loop_start),
		ldloc(0),
		ret(),
	]));

	let classes = vec![(
		"P",
		vec![MethodDef {
			signature: "System.Int32 P::Sum(System.Int32)".into(),
			body: managed(&["System.Int32", "System.Int32"], opcodes),
		}],
	)];
	let bytes = build_module(&classes, &[]);

	let invoker = Invoker::load(&bytes, &runtime).unwrap();
	let method = invoker.find_method("P", "Sum").unwrap();
	assert_eq!(invoker.invoke(&method, &[5]), Some(15));
	assert_eq!(invoker.invoke(&method, &[0]), Some(0));
}

#[test]
fn string_constant_dedup_prints_twice() {
	CAPTURED.with(|c| c.borrow_mut().clear());
	let mut runtime = Runtime::new();
	runtime.abi.register("ConsoleOut", capture_console_out);

	let console_out_sig = "System.Void P::ConsoleOut(System.String)";
	let main_opcodes = concat(&[ldstr("x"), call(0), ldstr("x"), call(0), ret()]);
	let classes = vec![(
		"P",
		vec![
			MethodDef { signature: "System.Void P::Main(System.String[])".into(), body: managed(&[], main_opcodes) },
			MethodDef { signature: console_out_sig.into(), body: unmanaged() },
		],
	)];
	let bytes = build_module(&classes, &[(0, console_out_sig)]);

	let invoker = Invoker::load(&bytes, &runtime).unwrap();
	invoker.run_main(&runtime, &["prog".to_string()]).unwrap();
	CAPTURED.with(|c| assert_eq!(c.borrow().join(""), "xx"));
}

#[test]
fn verifier_rejects_a_value_left_on_the_stack_for_a_void_return() {
	let runtime = Runtime::new();
	let opcodes = concat(&[ldc_i4(1), ret()]);
	let classes = vec![("P", vec![MethodDef { signature: "System.Void P::F()".into(), body: managed(&[], opcodes) }])];
	let bytes = build_module(&classes, &[]);

	let err = Invoker::load(&bytes, &runtime).unwrap_err();
	assert!(matches!(err, LoadError::MalformedUAL { kind: MalformedKind::BadReturn, .. }));
}
