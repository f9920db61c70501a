use std::rc::Rc;

use fxhash::FxHashMap;

use crate::abi::AbiRegistry;
use crate::constant_pool::ConstantPool;
use crate::emitter::{AluOp, CallTarget, Cond, Emitter, Label, Reg, TreeEmitter};
use crate::errors::{ErrorSite, LoadError};
use crate::gc::GarbageCollector;
use crate::ir::{BinOp, BranchCond, IrGraph, IrNodeKind, NodeId};
use crate::module::MethodHandle;
use crate::types::Type;
use crate::utilities::round_to_multiple_of;

/// Lowers a verified method's IR into a callable entry, driving an
/// [`Emitter`] backend through frame layout, constant-pool wiring, and one
/// emission rule per [`IrNodeKind`] variant. The result lands in
/// `method.emitted`; a no-op for unmanaged methods, which are dispatched
/// through the ABI registry instead.
#[cfg_attr(feature = "tracing", tracing::instrument(skip(abi, gc), fields(method = %method.borrow().signature.full_text)))]
pub fn generate<'l>(method: &MethodHandle<'l>, abi: &AbiRegistry, gc: Rc<dyn GarbageCollector>) -> Result<(), LoadError> {
	let (arg_types, local_types, return_type, class_name, method_name, is_managed) = {
		let m = method.borrow();
		(m.arg_types.clone(), m.local_types.clone(), m.return_type, m.owner_class.clone(), m.signature.method_name.clone(), m.is_managed)
	};
	if !is_managed {
		return Ok(());
	}
	let site = ErrorSite::method(class_name, method_name);

	let pool = Rc::new(ConstantPool::new(gc.clone()));
	let mut emitter = TreeEmitter::new(gc);

	let local_offsets: Vec<u32> =
		local_types.iter().map(|ty| emitter.alloc_frame_region(round_to_multiple_of::<8>(ty.size.max(1) as usize) as u32)).collect();
	let scratch_a = emitter.alloc_frame_region(8);
	let scratch_b = emitter.alloc_frame_region(8);
	let arg_regs = emitter.begin_function(arg_types.len(), !return_type.is_void());

	{
		let method_ref = method.borrow();
		let graph_ref = method_ref.ir.borrow();
		let graph = graph_ref.as_ref().expect("codegen requires a verified method");

		let mut ctx = Ctx {
			emitter: &mut emitter,
			abi,
			pool: pool.clone(),
			local_types: &local_types,
			local_offsets: &local_offsets,
			arg_regs: &arg_regs,
			scratch_a,
			scratch_b,
			site: site.clone(),
		};
		emit_body(&mut ctx, graph, return_type)?;
	}

	let compiled = emitter.finalize();
	*method.borrow().emitted.borrow_mut() = Some(compiled);
	Ok(())
}

struct Ctx<'l, 'e> {
	emitter: &'e mut TreeEmitter<'l>,
	abi: &'e AbiRegistry,
	pool: Rc<ConstantPool>,
	local_types: &'e [&'l Type<'l>],
	local_offsets: &'e [u32],
	arg_regs: &'e [Reg],
	scratch_a: u32,
	scratch_b: u32,
	site: ErrorSite,
}

fn emit_body<'l>(ctx: &mut Ctx<'l, '_>, graph: &IrGraph<'l>, return_type: &'l Type<'l>) -> Result<(), LoadError> {
	// A branch target offset names the instruction that *starts* there, but
	// that instruction is frequently a stack-op (e.g. the `ldloc` heading a
	// loop) that never becomes a statement of its own: it is emitted inline
	// as a subtree of whatever statement consumes it. So a target doesn't
	// resolve to a node to bind a label to directly; it resolves to the
	// first statement whose own UAL offset is at or after it, since that is
	// where emission actually lands once the stack-op's value has been
	// folded into its consumer.
	let statements: Vec<(u32, NodeId)> = graph.iter_statements().map(|id| (graph.get(id).offset_in_ual, id)).collect();
	let labels = bind_labels_to_statements(ctx, graph, &statements)?;

	for stmt in graph.iter_statements() {
		if let Some(label) = labels.get(&stmt) {
			ctx.emitter.bind_label(*label);
		}
		match &graph.get(stmt).kind {
			IrNodeKind::StLoc { index, expr } => emit_stloc(ctx, graph, *index, *expr)?,
			IrNodeKind::Call { callee, args } => {
				emit_call(ctx, graph, callee, args)?;
			}
			IrNodeKind::Ret { expr } => emit_ret(ctx, graph, *expr, return_type)?,
			IrNodeKind::Branch { target_offset, cond, left, right } => {
				let landing = resolve_target(graph, &statements, *target_offset, &ctx.site)?;
				let label = *labels.get(&landing).ok_or_else(|| LoadError::BadBranchTarget { target: *target_offset, site: ctx.site.clone() })?;
				emit_branch(ctx, graph, *cond, *left, *right, label)?;
			}
			IrNodeKind::Nop => {}
			other => unreachable!("{other:?} cannot appear as a statement"),
		}
	}
	Ok(())
}

/// Assigns every `Branch` target its landing statement's backend label,
/// creating one the first time a given landing statement is referenced.
fn bind_labels_to_statements<'l>(
	ctx: &mut Ctx<'l, '_>,
	graph: &IrGraph<'l>,
	statements: &[(u32, NodeId)],
) -> Result<FxHashMap<NodeId, Label>, LoadError> {
	let mut labels = FxHashMap::default();
	for stmt in graph.iter_statements() {
		if let IrNodeKind::Branch { target_offset, .. } = &graph.get(stmt).kind {
			let landing = resolve_target(graph, statements, *target_offset, &ctx.site)?;
			labels.entry(landing).or_insert_with(|| ctx.emitter.create_label());
		}
	}
	Ok(labels)
}

/// Validates `target_offset` names a real instruction boundary, then finds
/// the statement that emission will actually reach when the branch is taken:
/// the first statement at or after that offset.
fn resolve_target(graph: &IrGraph, statements: &[(u32, NodeId)], target_offset: u32, site: &ErrorSite) -> Result<NodeId, LoadError> {
	if !graph.offset_map.contains_key(&target_offset) {
		return Err(LoadError::BadBranchTarget { target: target_offset, site: site.clone() });
	}
	statements
		.iter()
		.find(|(offset, _)| *offset >= target_offset)
		.map(|(_, id)| *id)
		.ok_or_else(|| LoadError::BadBranchTarget { target: target_offset, site: site.clone() })
}

fn emit_stloc<'l>(ctx: &mut Ctx<'l, '_>, graph: &IrGraph<'l>, index: u32, expr: NodeId) -> Result<(), LoadError> {
	let ty = ctx.local_types[index as usize];
	let slot = ctx.emitter.frame_slot_addr(ctx.local_offsets[index as usize]);
	let is_reference = !ty.is_struct;
	if is_reference {
		ctx.emitter.gc_unmark(slot, true);
	}
	if ty.is_double() {
		emit_fpu(ctx, graph, expr)?;
		ctx.emitter.fstp(slot);
	} else {
		let value = emit_value(ctx, graph, expr)?;
		ctx.emitter.store(slot, value);
	}
	if is_reference {
		ctx.emitter.gc_mark(slot, true);
	}
	Ok(())
}

fn emit_ret<'l>(ctx: &mut Ctx<'l, '_>, graph: &IrGraph<'l>, expr: Option<NodeId>, return_type: &'l Type<'l>) -> Result<(), LoadError> {
	match expr {
		None => ctx.emitter.ret(None),
		Some(expr) if return_type.is_double() => {
			emit_fpu(ctx, graph, expr)?;
			let slot = ctx.emitter.frame_slot_addr(ctx.scratch_a);
			ctx.emitter.fstp(slot);
			let reg = ctx.emitter.new_reg();
			ctx.emitter.load(reg, slot);
			ctx.emitter.ret(Some(reg));
		}
		Some(expr) => {
			let value = emit_value(ctx, graph, expr)?;
			ctx.emitter.ret(Some(value));
		}
	}
	Ok(())
}

fn emit_branch<'l>(
	ctx: &mut Ctx<'l, '_>,
	graph: &IrGraph<'l>,
	cond: BranchCond,
	left: Option<NodeId>,
	right: Option<NodeId>,
	label: Label,
) -> Result<(), LoadError> {
	if cond == BranchCond::Always {
		ctx.emitter.jump(label);
		return Ok(());
	}
	// Comparisons run on the raw word (integer value or double bit pattern
	// as loaded into a register); exact for equality, only approximate for
	// ordered comparisons between doubles since the backend exposes no
	// dedicated FPU compare.
	let lhs = emit_value(ctx, graph, left.expect("conditional branch always carries both operands"))?;
	let rhs = emit_value(ctx, graph, right.expect("conditional branch always carries both operands"))?;
	let cmp = match cond {
		BranchCond::Always => unreachable!(),
		BranchCond::Le => Cond::Le,
		BranchCond::Lt => Cond::Lt,
		BranchCond::Gt => Cond::Gt,
		BranchCond::Ge => Cond::Ge,
		BranchCond::Eq => Cond::Eq,
		BranchCond::Ne => Cond::Ne,
	};
	ctx.emitter.cmp_jump(cmp, lhs, rhs, label);
	Ok(())
}

fn emit_call<'l>(ctx: &mut Ctx<'l, '_>, graph: &IrGraph<'l>, callee: &MethodHandle<'l>, args: &[NodeId]) -> Result<Option<Reg>, LoadError> {
	let mut arg_regs = Vec::with_capacity(args.len());
	for &arg in args {
		arg_regs.push(emit_value(ctx, graph, arg)?);
	}
	let (is_managed, has_return, name) = {
		let callee_ref = callee.borrow();
		(callee_ref.is_managed, !callee_ref.return_type.is_void(), callee_ref.signature.method_name.clone())
	};
	let target = if is_managed {
		CallTarget::Managed(callee.clone())
	} else {
		let function = ctx.abi.get(&name).ok_or_else(|| LoadError::UnresolvedExtern { name: name.clone(), site: ctx.site.clone() })?;
		CallTarget::Unmanaged(function)
	};
	Ok(ctx.emitter.call(target, &arg_regs, has_return))
}

/// Emits `id`'s value into a fresh register. Doubles travel as their raw
/// bit pattern; a value only touches the FPU stack inside [`emit_fpu`] and
/// [`emit_binexpr`]'s double path.
fn emit_value<'l>(ctx: &mut Ctx<'l, '_>, graph: &IrGraph<'l>, id: NodeId) -> Result<Reg, LoadError> {
	let node = graph.get(id);
	match &node.kind {
		IrNodeKind::LdArg { index } => Ok(ctx.arg_regs[*index as usize]),
		IrNodeKind::LdLoc { index } => {
			let slot = ctx.emitter.frame_slot_addr(ctx.local_offsets[*index as usize]);
			let reg = ctx.emitter.new_reg();
			ctx.emitter.load(reg, slot);
			Ok(reg)
		}
		IrNodeKind::ConstInt { value } => {
			let reg = ctx.emitter.new_reg();
			ctx.emitter.mov_imm32(reg, *value as i32);
			Ok(reg)
		}
		IrNodeKind::ConstDouble { value } => {
			let reg = ctx.emitter.new_reg();
			ctx.emitter.mov_imm64(reg, value.to_bits() as i64);
			Ok(reg)
		}
		IrNodeKind::ConstString { text } => {
			let index = ctx.pool.intern(text);
			let reg = ctx.emitter.new_reg();
			ctx.emitter.load_const_string(reg, ctx.pool.clone(), index);
			Ok(reg)
		}
		IrNodeKind::Call { callee, args } => {
			let result = emit_call(ctx, graph, callee, args)?;
			Ok(result.expect("verifier only pushes non-void call results"))
		}
		IrNodeKind::BinExpr { op, left, right } => emit_binexpr(ctx, graph, *op, *left, *right, node.result_type.expect("value nodes are typed")),
		other => unreachable!("{other:?} cannot appear as a value"),
	}
}

fn emit_binexpr<'l>(
	ctx: &mut Ctx<'l, '_>,
	graph: &IrGraph<'l>,
	op: BinOp,
	left: NodeId,
	right: Option<NodeId>,
	result_type: &'l Type<'l>,
) -> Result<Reg, LoadError> {
	if op == BinOp::Not {
		let operand = emit_value(ctx, graph, left)?;
		let dst = ctx.emitter.new_reg();
		ctx.emitter.not(dst, operand);
		return Ok(dst);
	}
	let right = right.expect("binary operators other than Not always carry a right operand");

	if result_type.is_double() {
		emit_fpu(ctx, graph, left)?;
		emit_fpu(ctx, graph, right)?;
		ctx.emitter.fbinop(double_op(op));
		let slot = ctx.emitter.frame_slot_addr(ctx.scratch_a);
		ctx.emitter.fstp(slot);
		let dst = ctx.emitter.new_reg();
		ctx.emitter.load(dst, slot);
		return Ok(dst);
	}

	let lhs = emit_value(ctx, graph, left)?;
	let rhs = emit_value(ctx, graph, right)?;
	match op {
		BinOp::Div | BinOp::Rem => {
			let quotient = ctx.emitter.new_reg();
			let remainder = ctx.emitter.new_reg();
			ctx.emitter.idiv(quotient, remainder, lhs, rhs);
			Ok(if op == BinOp::Div { quotient } else { remainder })
		}
		_ => {
			let dst = ctx.emitter.new_reg();
			ctx.emitter.alu(int_op(op), dst, lhs, rhs);
			Ok(dst)
		}
	}
}

/// Ensures `id`'s value sits on top of the FPU stack, for use as an operand
/// of [`Emitter::fbinop`].
fn emit_fpu<'l>(ctx: &mut Ctx<'l, '_>, graph: &IrGraph<'l>, id: NodeId) -> Result<(), LoadError> {
	if let IrNodeKind::LdLoc { index } = &graph.get(id).kind {
		let slot = ctx.emitter.frame_slot_addr(ctx.local_offsets[*index as usize]);
		ctx.emitter.fld(slot);
		return Ok(());
	}
	let reg = emit_value(ctx, graph, id)?;
	let slot = ctx.emitter.frame_slot_addr(ctx.scratch_b);
	ctx.emitter.store(slot, reg);
	ctx.emitter.fld(slot);
	Ok(())
}

fn double_op(op: BinOp) -> AluOp {
	match op {
		BinOp::Add => AluOp::Add,
		BinOp::Sub => AluOp::Sub,
		BinOp::Mul => AluOp::Mul,
		BinOp::Div => AluOp::Div,
		other => unreachable!("{other:?} is not a double-typed operator"),
	}
}

fn int_op(op: BinOp) -> AluOp {
	match op {
		BinOp::Add => AluOp::Add,
		BinOp::Sub => AluOp::Sub,
		BinOp::Mul => AluOp::Mul,
		BinOp::Shl => AluOp::Shl,
		BinOp::Shr => AluOp::Shr,
		BinOp::And => AluOp::And,
		BinOp::Or => AluOp::Or,
		BinOp::Xor => AluOp::Xor,
		other => unreachable!("{other:?} has its own emission path"),
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use bumpalo::Bump;

	use crate::gc::BumpGc;
	use crate::module::Module;
	use crate::types::TypeTable;
	use crate::verifier::verify;

	fn write_cstr(buf: &mut Vec<u8>, s: &str) {
		buf.extend_from_slice(s.as_bytes());
		buf.push(0);
	}

	fn build_module(signature: &str, locals: &[&str], opcodes: &[u8]) -> Vec<u8> {
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
		bytes
	}

	#[test]
	fn adds_two_arguments() {
		let bump = Bump::new();
		let types = TypeTable::new(&bump);
		// ldarg 0; ldarg 1; add; ret
		let opcodes = [0u8, 0, 0, 0, 0, 0, 1, 0, 0, 0, 8, 3];
		let bytes = build_module("System.Int32 P::F(System.Int32,System.Int32)", &[], &opcodes);
		let module = Module::parse(&bytes, &types).unwrap();
		module.ensure_compiled().unwrap();
		let method = module.classes()[0].method("F").unwrap();
		verify(&method, &module).unwrap();
		let gc: Rc<dyn GarbageCollector> = Rc::new(BumpGc::new());
		let abi = AbiRegistry::with_builtins();
		generate(&method, &abi, gc).unwrap();
		let compiled = method.borrow();
		let entry = compiled.emitted.borrow();
		assert_eq!(entry.as_ref().unwrap().call(&[2, 40]), Some(42));
	}

	#[test]
	fn void_method_returns_none() {
		let bump = Bump::new();
		let types = TypeTable::new(&bump);
		let opcodes = [3u8]; // ret
		let bytes = build_module("System.Void P::F()", &[], &opcodes);
		let module = Module::parse(&bytes, &types).unwrap();
		module.ensure_compiled().unwrap();
		let method = module.classes()[0].method("F").unwrap();
		verify(&method, &module).unwrap();
		let gc: Rc<dyn GarbageCollector> = Rc::new(BumpGc::new());
		let abi = AbiRegistry::with_builtins();
		generate(&method, &abi, gc).unwrap();
		let compiled = method.borrow();
		let entry = compiled.emitted.borrow();
		assert_eq!(entry.as_ref().unwrap().call(&[]), None);
	}

	#[test]
	fn loop_sums_zero_to_n_via_local_and_branch() {
		let bump = Bump::new();
		let types = TypeTable::new(&bump);
		// locals: sum(Int32), i(Int32)
		// ldc.i4 0; stloc 0          (sum = 0)         offsets 0..9
		// ldc.i4 0; stloc 1          (i = 0)           offsets 9..18
		// loop:                                         offset 18
		// ldloc 0; ldloc 1; add; stloc 0 (sum += i)     18..28
		// ldloc 1; ldc.i4 1; add; stloc 1 (i += 1)      28..41
		// ldloc 1; ldarg 0; ble loop                     41..52
		// ldloc 0; ret
		let mut opcodes = Vec::new();
		opcodes.extend_from_slice(&[4u8, 0, 0, 0, 0]); // ldc.i4 0
		opcodes.extend_from_slice(&[5u8, 0, 0, 0, 0]); // stloc 0
		opcodes.extend_from_slice(&[4u8, 0, 0, 0, 0]); // ldc.i4 0
		opcodes.extend_from_slice(&[5u8, 1, 0, 0, 0]); // stloc 1
		let loop_start = opcodes.len() as u32;
		opcodes.extend_from_slice(&[7u8, 0, 0, 0, 0]); // ldloc 0
		opcodes.extend_from_slice(&[7u8, 1, 0, 0, 0]); // ldloc 1
		opcodes.push(8); // add
		opcodes.extend_from_slice(&[5u8, 0, 0, 0, 0]); // stloc 0
		opcodes.extend_from_slice(&[7u8, 1, 0, 0, 0]); // ldloc 1
		opcodes.extend_from_slice(&[4u8, 1, 0, 0, 0]); // ldc.i4 1
		opcodes.push(8); // add
		opcodes.extend_from_slice(&[5u8, 1, 0, 0, 0]); // stloc 1
		opcodes.extend_from_slice(&[7u8, 1, 0, 0, 0]); // ldloc 1
		opcodes.extend_from_slice(&[0u8, 0, 0, 0, 0]); // ldarg 0
		let mut branch = vec![9u8]; // ble
		branch.extend_from_slice(&loop_start.to_le_bytes());
		opcodes.extend_from_slice(&branch);
		opcodes.extend_from_slice(&[7u8, 0, 0, 0, 0]); // ldloc 0
		opcodes.push(3); // ret

		let bytes = build_module("System.Int32 P::F(System.Int32)", &["System.Int32", "System.Int32"], &opcodes);
		let module = Module::parse(&bytes, &types).unwrap();
		module.ensure_compiled().unwrap();
		let method = module.classes()[0].method("F").unwrap();
		verify(&method, &module).unwrap();
		let gc: Rc<dyn GarbageCollector> = Rc::new(BumpGc::new());
		let abi = AbiRegistry::with_builtins();
		generate(&method, &abi, gc).unwrap();
		let compiled = method.borrow();
		let entry = compiled.emitted.borrow();
		assert_eq!(entry.as_ref().unwrap().call(&[5]), Some(15));
	}
}
