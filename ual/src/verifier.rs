use crate::errors::{ErrorSite, LoadError, MalformedKind};
use crate::ir::{BinOp, BranchCond, IrGraph, IrNodeKind};
use crate::module::{MethodHandle, Module};
use crate::opcode::{Decoded, Instruction};
use crate::raw::reader::BinaryReader;

/// Abstractly interprets a managed method's opcode stream into an
/// [`IrGraph`], storing the result on the method itself. A single forward
/// pass: a typed evaluation stack, one node per instruction, every node
/// registered under its first byte's offset for branch resolution.
#[cfg_attr(feature = "tracing", tracing::instrument(skip(module), fields(method = %method.borrow().signature.full_text)))]
pub fn verify<'l>(method: &MethodHandle<'l>, module: &Module<'l>) -> Result<(), LoadError> {
	let types = module.types();
	let (body, arg_types, local_types, return_type, class_name, method_name) = {
		let m = method.borrow();
		(m.body, m.arg_types.clone(), m.local_types.clone(), m.return_type, m.owner_class.clone(), m.signature.method_name.clone())
	};

	let site_at = |offset: u32| ErrorSite::at(class_name.clone(), method_name.clone(), offset);

	let mut graph = IrGraph::new();
	let mut stack = Vec::new();
	let mut reader = BinaryReader::new(body);

	loop {
		let offset_before = reader.offset();
		let decoded = Instruction::decode(&mut reader).map_err(|e| e.with_site(site_at(offset_before)))?;
		let (offset, instruction) = match decoded {
			Decoded::End => break,
			Decoded::Instruction { offset, instruction } => (offset, instruction),
		};
		let site = site_at(offset);

		macro_rules! pop {
			() => {
				stack.pop().ok_or_else(|| LoadError::MalformedUAL { kind: MalformedKind::TooFewOperands, site: site.clone() })?
			};
		}
		macro_rules! bad_index {
			($what:expr, $index:expr) => {
				LoadError::MalformedUAL {
					kind: MalformedKind::TypeMismatch { expected: format!("a valid {} index", $what), found: format!("index {}", $index) },
					site: site.clone(),
				}
			};
		}

		let node_id = match instruction {
			Instruction::LdArg(index) => {
				let ty = *arg_types.get(index as usize).ok_or_else(|| bad_index!("argument", index))?;
				let id = graph.push_value(IrNodeKind::LdArg { index }, ty, offset);
				stack.push(id);
				id
			}
			Instruction::LdLoc(index) => {
				let ty = *local_types.get(index as usize).ok_or_else(|| bad_index!("local", index))?;
				let id = graph.push_value(IrNodeKind::LdLoc { index }, ty, offset);
				stack.push(id);
				id
			}
			Instruction::StLoc(index) => {
				let expr = pop!();
				let ty = *local_types.get(index as usize).ok_or_else(|| bad_index!("local", index))?;
				if graph.get(expr).result_type != Some(ty) {
					return Err(LoadError::MalformedUAL {
						kind: MalformedKind::TypeMismatch { expected: ty.name.to_string(), found: describe(&graph, expr) },
						site,
					});
				}
				graph.append_statement(IrNodeKind::StLoc { index, expr }, offset)
			}
			Instruction::LdcI4(value) => {
				let id = graph.push_value(IrNodeKind::ConstInt { value }, types.resolve("System.Int32")?, offset);
				stack.push(id);
				id
			}
			Instruction::LdcR8(value) => {
				let id = graph.push_value(IrNodeKind::ConstDouble { value }, types.resolve("System.Double")?, offset);
				stack.push(id);
				id
			}
			Instruction::LdStr(text) => {
				let id = graph.push_value(IrNodeKind::ConstString { text }, types.resolve("System.String")?, offset);
				stack.push(id);
				id
			}
			Instruction::Call(handle) => {
				let callee = module.resolve_import(handle).map_err(|e| e.with_site(site.clone()))?;
				let (arg_types, return_type, is_void) = {
					let callee_ref = callee.borrow();
					(callee_ref.arg_types.clone(), callee_ref.return_type, callee_ref.return_type.is_void())
				};
				let mut args = Vec::with_capacity(arg_types.len());
				for _ in 0..arg_types.len() {
					args.push(pop!());
				}
				args.reverse();
				for (i, (&arg, &expected)) in args.iter().zip(arg_types.iter()).enumerate() {
					let found = graph.get(arg).result_type;
					if found != Some(expected) {
						return Err(LoadError::MalformedUAL {
							kind: MalformedKind::ArgTypeMismatch { index: i, expected: expected.name.to_string(), found: describe(&graph, arg) },
							site,
						});
					}
				}
				let kind = IrNodeKind::Call { callee: callee.clone(), args };
				if is_void {
					graph.append_statement(kind, offset)
				} else {
					graph.push_value(kind, return_type, offset)
				}
			}
			Instruction::Ret => {
				if return_type.is_void() {
					if !stack.is_empty() {
						return Err(LoadError::MalformedUAL { kind: MalformedKind::BadReturn, site });
					}
					graph.append_statement(IrNodeKind::Ret { expr: None }, offset)
				} else {
					let expr = pop!();
					if graph.get(expr).result_type != Some(return_type) {
						return Err(LoadError::MalformedUAL { kind: MalformedKind::BadReturn, site });
					}
					graph.append_statement(IrNodeKind::Ret { expr: Some(expr) }, offset)
				}
			}
			Instruction::Nop => graph.append_statement(IrNodeKind::Nop, offset),
			Instruction::Br(target) => {
				graph.append_statement(IrNodeKind::Branch { target_offset: target, cond: BranchCond::Always, left: None, right: None }, offset)
			}
			Instruction::Ble(target) => append_conditional_branch(&mut graph, &mut stack, BranchCond::Le, target, offset, &site)?,
			Instruction::Beq(target) => append_conditional_branch(&mut graph, &mut stack, BranchCond::Eq, target, offset, &site)?,
			Instruction::Bne(target) => append_conditional_branch(&mut graph, &mut stack, BranchCond::Ne, target, offset, &site)?,
			Instruction::Bgt(target) => append_conditional_branch(&mut graph, &mut stack, BranchCond::Gt, target, offset, &site)?,
			Instruction::Bge(target) => append_conditional_branch(&mut graph, &mut stack, BranchCond::Ge, target, offset, &site)?,
			Instruction::Add => binary_numeric(&mut graph, &mut stack, BinOp::Add, offset, &site)?,
			Instruction::Sub => binary_numeric(&mut graph, &mut stack, BinOp::Sub, offset, &site)?,
			Instruction::Mul => binary_numeric(&mut graph, &mut stack, BinOp::Mul, offset, &site)?,
			Instruction::Div => binary_numeric(&mut graph, &mut stack, BinOp::Div, offset, &site)?,
			Instruction::Rem => binary_integer(&mut graph, &mut stack, BinOp::Rem, offset, &site)?,
			Instruction::Shl => binary_integer(&mut graph, &mut stack, BinOp::Shl, offset, &site)?,
			Instruction::Shr => binary_integer(&mut graph, &mut stack, BinOp::Shr, offset, &site)?,
			Instruction::And => binary_integer(&mut graph, &mut stack, BinOp::And, offset, &site)?,
			Instruction::Or => binary_integer(&mut graph, &mut stack, BinOp::Or, offset, &site)?,
			Instruction::Xor => binary_integer(&mut graph, &mut stack, BinOp::Xor, offset, &site)?,
			Instruction::Not => {
				let operand = pop!();
				let ty = graph.get(operand).result_type;
				if !ty.map(|t| t.is_int32()).unwrap_or(false) {
					return Err(LoadError::MalformedUAL {
						kind: MalformedKind::TypeMismatch { expected: "System.Int32".into(), found: describe(&graph, operand) },
						site,
					});
				}
				let id = graph.push_value(IrNodeKind::BinExpr { op: BinOp::Not, left: operand, right: None }, ty.unwrap(), offset);
				stack.push(id);
				id
			}
		};

		if !graph.register_offset(offset, node_id) {
			return Err(LoadError::MalformedUAL { kind: MalformedKind::DuplicateNodeOffset(offset), site });
		}
	}

	if !stack.is_empty() {
		let site = site_at(reader.offset());
		return Err(LoadError::MalformedUAL { kind: MalformedKind::BadReturn, site });
	}

	*method.borrow().ir.borrow_mut() = Some(graph);
	Ok(())
}

fn describe(graph: &IrGraph, id: crate::ir::NodeId) -> String {
	graph.get(id).result_type.map(|t| t.name.to_string()).unwrap_or_else(|| "<void>".to_string())
}

fn append_conditional_branch<'l>(
	graph: &mut IrGraph<'l>,
	stack: &mut Vec<crate::ir::NodeId>,
	cond: BranchCond,
	target: u32,
	offset: u32,
	site: &ErrorSite,
) -> Result<crate::ir::NodeId, LoadError> {
	let right = stack.pop().ok_or_else(|| LoadError::MalformedUAL { kind: MalformedKind::TooFewOperands, site: site.clone() })?;
	let left = stack.pop().ok_or_else(|| LoadError::MalformedUAL { kind: MalformedKind::TooFewOperands, site: site.clone() })?;
	if graph.get(left).result_type != graph.get(right).result_type {
		return Err(LoadError::MalformedUAL {
			kind: MalformedKind::TypeMismatch { expected: describe(graph, left), found: describe(graph, right) },
			site: site.clone(),
		});
	}
	Ok(graph.append_statement(IrNodeKind::Branch { target_offset: target, cond, left: Some(left), right: Some(right) }, offset))
}

fn binary_numeric<'l>(
	graph: &mut IrGraph<'l>,
	stack: &mut Vec<crate::ir::NodeId>,
	op: BinOp,
	offset: u32,
	site: &ErrorSite,
) -> Result<crate::ir::NodeId, LoadError> {
	binary_op(graph, stack, op, offset, site, |ty| ty.is_numeric())
}

fn binary_integer<'l>(
	graph: &mut IrGraph<'l>,
	stack: &mut Vec<crate::ir::NodeId>,
	op: BinOp,
	offset: u32,
	site: &ErrorSite,
) -> Result<crate::ir::NodeId, LoadError> {
	binary_op(graph, stack, op, offset, site, |ty| ty.is_int32())
}

fn binary_op<'l>(
	graph: &mut IrGraph<'l>,
	stack: &mut Vec<crate::ir::NodeId>,
	op: BinOp,
	offset: u32,
	site: &ErrorSite,
	accepts: impl Fn(&crate::types::Type) -> bool,
) -> Result<crate::ir::NodeId, LoadError> {
	let right = stack.pop().ok_or_else(|| LoadError::MalformedUAL { kind: MalformedKind::TooFewOperands, site: site.clone() })?;
	let left = stack.pop().ok_or_else(|| LoadError::MalformedUAL { kind: MalformedKind::TooFewOperands, site: site.clone() })?;
	let (left_ty, right_ty) = (graph.get(left).result_type, graph.get(right).result_type);
	if left_ty != right_ty || !left_ty.map(&accepts).unwrap_or(false) {
		return Err(LoadError::MalformedUAL {
			kind: MalformedKind::TypeMismatch { expected: describe(graph, left), found: describe(graph, right) },
			site: site.clone(),
		});
	}
	let id = graph.push_value(IrNodeKind::BinExpr { op, left, right: Some(right) }, left_ty.unwrap(), offset);
	stack.push(id);
	Ok(id)
}

#[cfg(test)]
mod tests {
	use super::*;
	use bumpalo::Bump;

	use crate::module::Module;
	use crate::types::TypeTable;

	fn write_cstr(buf: &mut Vec<u8>, s: &str) {
		buf.extend_from_slice(s.as_bytes());
		buf.push(0);
	}

	fn build_module<'l>(types: &'l TypeTable<'l>, signature: &str, locals: &[&str], opcodes: &[u8]) -> Vec<u8> {
		let mut body = vec![1u8];
		body.extend_from_slice(&(locals.len() as u32).to_le_bytes());
		for local in locals {
			write_cstr(&mut body, local);
		}
		body.extend_from_slice(opcodes);

		let mut class_body = Vec::new();
		class_body.extend_from_slice(&1u32.to_le_bytes());
		write_cstr(&mut class_body, signature);
		class_body.extend_from_slice(&(body.len() as u32).to_le_bytes());
		class_body.extend_from_slice(&body);

		let mut bytes = Vec::new();
		bytes.extend_from_slice(&1u32.to_le_bytes());
		write_cstr(&mut bytes, "P");
		bytes.extend_from_slice(&(class_body.len() as u32).to_le_bytes());
		bytes.extend_from_slice(&class_body);
		bytes.extend_from_slice(&0u32.to_le_bytes());
		let _ = types;
		bytes
	}

	#[test]
	fn integer_addition_builds_a_bin_expr() {
		let bump = Bump::new();
		let types = TypeTable::new(&bump);
		let opcodes = [0u8, 0, 0, 0, 0, 0, 1, 0, 0, 0, 8, 3];
		let bytes = build_module(&types, "System.Int32 P::F(System.Int32,System.Int32)", &[], &opcodes);
		let module = Module::parse(&bytes, &types).unwrap();
		module.ensure_compiled().unwrap();
		let method = module.classes()[0].method("F").unwrap();
		verify(&method, &module).unwrap();
		assert!(method.borrow().ir.borrow().is_some());
	}

	#[test]
	fn bad_return_is_rejected() {
		let bump = Bump::new();
		let types = TypeTable::new(&bump);
		let opcodes = [4u8, 1, 0, 0, 0, 3];
		let bytes = build_module(&types, "System.Void P::F()", &[], &opcodes);
		let module = Module::parse(&bytes, &types).unwrap();
		module.ensure_compiled().unwrap();
		let method = module.classes()[0].method("F").unwrap();
		let err = verify(&method, &module).unwrap_err();
		assert!(matches!(err, LoadError::MalformedUAL { kind: MalformedKind::BadReturn, .. }));
	}

	#[test]
	fn too_few_operands_is_rejected() {
		let bump = Bump::new();
		let types = TypeTable::new(&bump);
		let opcodes = [8u8, 3];
		let bytes = build_module(&types, "System.Int32 P::F()", &[], &opcodes);
		let module = Module::parse(&bytes, &types).unwrap();
		module.ensure_compiled().unwrap();
		let method = module.classes()[0].method("F").unwrap();
		let err = verify(&method, &module).unwrap_err();
		assert!(matches!(err, LoadError::MalformedUAL { kind: MalformedKind::TooFewOperands, .. }));
	}
}
