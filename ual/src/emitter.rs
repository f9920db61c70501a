use std::rc::Rc;

use fxhash::FxHashMap;

use crate::abi::AbiFn;
use crate::constant_pool::ConstantPool;
use crate::gc::GarbageCollector;
use crate::module::MethodHandle;

/// An infinite general-purpose virtual register. The backend owns physical
/// allocation; the code generator never reuses or retires one.
#[derive(Copy, Clone, Eq, PartialEq, Hash, Debug)]
#[repr(transparent)]
pub struct Reg(pub u32);

/// A backend label. May be referenced by a branch before it is bound.
#[derive(Copy, Clone, Eq, PartialEq, Hash, Debug)]
#[repr(transparent)]
pub struct Label(pub u32);

#[derive(Copy, Clone, Eq, PartialEq, Debug)]
pub enum Cond {
	Eq,
	Ne,
	Lt,
	Le,
	Gt,
	Ge,
}

#[derive(Copy, Clone, Eq, PartialEq, Debug)]
pub enum AluOp {
	Add,
	Sub,
	Mul,
	/// Only meaningful to [`Emitter::fbinop`] (FDIVP); integer division goes
	/// through [`Emitter::idiv`]'s two-output form instead.
	Div,
	And,
	Or,
	Xor,
	Shl,
	Shr,
}

/// Either a managed method (called by its emitted entry) or a host extern
/// resolved through the ABI registry.
#[derive(Clone)]
pub enum CallTarget<'l> {
	Managed(MethodHandle<'l>),
	Unmanaged(AbiFn),
}

/// The code generator's contract with its backend: integer virtual
/// registers, stack-frame slots, labels, moves/LEA, ALU ops, compares with
/// conditional branches, a function builder with call nodes, and direct
/// FPU-stack operations. Any backend implementing this vocabulary is an
/// acceptable target for `CodeGen`; this crate ships one reference backend
/// (`TreeEmitter`) that interprets rather than assembles native code, since
/// native code emission is an external concern this runtime only consumes.
pub trait Emitter<'l> {
	/// Declares a function taking `arg_count` pointer-sized arguments and,
	/// if `has_return`, a pointer-sized result. Returns the registers
	/// holding the incoming arguments, in order.
	fn begin_function(&mut self, arg_count: usize, has_return: bool) -> Vec<Reg>;

	fn create_label(&mut self) -> Label;
	/// Binds `label` to the next emitted instruction. Calling this twice
	/// for the same label is a backend bug.
	fn bind_label(&mut self, label: Label);

	fn new_reg(&mut self) -> Reg;
	/// Returns a register holding the address of frame-relative
	/// `byte_offset` (a local's storage or a scratch slot).
	fn frame_slot_addr(&mut self, byte_offset: u32) -> Reg;
	/// Reserves `size` bytes of frame storage, returning its base offset.
	fn alloc_frame_region(&mut self, size: u32) -> u32;

	fn mov_imm32(&mut self, dst: Reg, value: i32);
	fn mov_imm64(&mut self, dst: Reg, value: i64);
	fn mov(&mut self, dst: Reg, src: Reg);
	fn load(&mut self, dst: Reg, addr: Reg);
	fn store(&mut self, addr: Reg, src: Reg);

	fn alu(&mut self, op: AluOp, dst: Reg, lhs: Reg, rhs: Reg);
	/// Integer divide: `quotient` receives `lhs / rhs`, `remainder`
	/// receives `lhs % rhs`, mirroring the two-output divide instruction
	/// the source targets.
	fn idiv(&mut self, quotient: Reg, remainder: Reg, lhs: Reg, rhs: Reg);
	fn not(&mut self, dst: Reg, src: Reg);

	/// Emits `CMP(lhs, rhs)` followed by the condition-appropriate
	/// conditional jump to `target`.
	fn cmp_jump(&mut self, cond: Cond, lhs: Reg, rhs: Reg, target: Label);
	fn jump(&mut self, target: Label);
	fn ret(&mut self, value: Option<Reg>);

	/// Loads the double at `addr` onto the top of the FPU stack.
	fn fld(&mut self, addr: Reg);
	/// Pops the FPU stack top into `addr`.
	fn fstp(&mut self, addr: Reg);
	/// Pops the top two FPU stack entries, applies `op`, pushes the result.
	/// Only `Add`/`Sub`/`Mul` plus a distinguished `Div` are meaningful;
	/// `idiv`-style remainder has no FPU counterpart.
	fn fbinop(&mut self, op: AluOp);

	/// Builds a call node targeting `target` with `args` bound positionally;
	/// returns the register holding the result, if any.
	fn call(&mut self, target: CallTarget<'l>, args: &[Reg], has_return: bool) -> Option<Reg>;

	fn gc_mark(&mut self, addr: Reg, is_root: bool);
	fn gc_unmark(&mut self, addr: Reg, is_root: bool);

	/// Resolves a method's constant pool entry `index` into a register
	/// holding the current string pointer, re-reading through the pool on
	/// every call so a realloc of its backing storage never stales an
	/// already-emitted load.
	fn load_const_string(&mut self, dst: Reg, pool: Rc<ConstantPool>, index: usize);
}

#[derive(Clone)]
enum Op<'l> {
	MovImm32(Reg, i32),
	MovImm64(Reg, i64),
	Mov(Reg, Reg),
	Load(Reg, Reg),
	Store(Reg, Reg),
	Alu(AluOp, Reg, Reg, Reg),
	IDiv(Reg, Reg, Reg, Reg),
	Not(Reg, Reg),
	CmpJump(Cond, Reg, Reg, Label),
	Jump(Label),
	Ret(Option<Reg>),
	Fld(Reg),
	Fstp(Reg),
	FBinOp(AluOp),
	Call { target: CallTarget<'l>, args: Vec<Reg>, out: Option<Reg> },
	GcMark(Reg, bool),
	GcUnmark(Reg, bool),
	LoadConstString(Reg, Rc<ConstantPool>, usize),
	LabelMark(Label),
}

/// Reference `Emitter` implementation: builds a linear op list per method
/// and runs it with a tiny register-machine interpreter at call time. Frame
/// storage is a byte buffer sized by `CodeGen`'s frame layout; registers are
/// raw 64-bit words (doubles travel as bit patterns unless on the FPU
/// stack).
pub struct TreeEmitter<'l> {
	gc: Rc<dyn GarbageCollector>,
	ops: Vec<Op<'l>>,
	next_reg: u32,
	next_label: u32,
	frame_size: u32,
}

impl<'l> TreeEmitter<'l> {
	pub fn new(gc: Rc<dyn GarbageCollector>) -> Self {
		Self { gc, ops: Vec::new(), next_reg: 0, next_label: 0, frame_size: 0 }
	}

	pub fn finalize(self) -> CompiledMethod<'l> {
		let mut labels = FxHashMap::default();
		for (pc, op) in self.ops.iter().enumerate() {
			if let Op::LabelMark(label) = op {
				labels.insert(*label, pc);
			}
		}
		CompiledMethod { gc: self.gc, ops: self.ops, labels, num_regs: self.next_reg, frame_size: self.frame_size }
	}
}

impl<'l> Emitter<'l> for TreeEmitter<'l> {
	fn begin_function(&mut self, arg_count: usize, _has_return: bool) -> Vec<Reg> {
		(0..arg_count).map(|_| self.new_reg()).collect()
	}

	fn create_label(&mut self) -> Label {
		let label = Label(self.next_label);
		self.next_label += 1;
		label
	}

	fn bind_label(&mut self, label: Label) {
		self.ops.push(Op::LabelMark(label));
	}

	fn new_reg(&mut self) -> Reg {
		let reg = Reg(self.next_reg);
		self.next_reg += 1;
		reg
	}

	fn frame_slot_addr(&mut self, byte_offset: u32) -> Reg {
		let dst = self.new_reg();
		self.ops.push(Op::MovImm64(dst, byte_offset as i64));
		dst
	}

	fn alloc_frame_region(&mut self, size: u32) -> u32 {
		let base = self.frame_size;
		self.frame_size += size;
		base
	}

	fn mov_imm32(&mut self, dst: Reg, value: i32) {
		self.ops.push(Op::MovImm32(dst, value));
	}

	fn mov_imm64(&mut self, dst: Reg, value: i64) {
		self.ops.push(Op::MovImm64(dst, value));
	}

	fn mov(&mut self, dst: Reg, src: Reg) {
		self.ops.push(Op::Mov(dst, src));
	}

	fn load(&mut self, dst: Reg, addr: Reg) {
		self.ops.push(Op::Load(dst, addr));
	}

	fn store(&mut self, addr: Reg, src: Reg) {
		self.ops.push(Op::Store(addr, src));
	}

	fn alu(&mut self, op: AluOp, dst: Reg, lhs: Reg, rhs: Reg) {
		self.ops.push(Op::Alu(op, dst, lhs, rhs));
	}

	fn idiv(&mut self, quotient: Reg, remainder: Reg, lhs: Reg, rhs: Reg) {
		self.ops.push(Op::IDiv(quotient, remainder, lhs, rhs));
	}

	fn not(&mut self, dst: Reg, src: Reg) {
		self.ops.push(Op::Not(dst, src));
	}

	fn cmp_jump(&mut self, cond: Cond, lhs: Reg, rhs: Reg, target: Label) {
		self.ops.push(Op::CmpJump(cond, lhs, rhs, target));
	}

	fn jump(&mut self, target: Label) {
		self.ops.push(Op::Jump(target));
	}

	fn ret(&mut self, value: Option<Reg>) {
		self.ops.push(Op::Ret(value));
	}

	fn fld(&mut self, addr: Reg) {
		self.ops.push(Op::Fld(addr));
	}

	fn fstp(&mut self, addr: Reg) {
		self.ops.push(Op::Fstp(addr));
	}

	fn fbinop(&mut self, op: AluOp) {
		self.ops.push(Op::FBinOp(op));
	}

	fn call(&mut self, target: CallTarget<'l>, args: &[Reg], has_return: bool) -> Option<Reg> {
		let out = has_return.then(|| self.new_reg());
		self.ops.push(Op::Call { target, args: args.to_vec(), out });
		out
	}

	fn gc_mark(&mut self, addr: Reg, is_root: bool) {
		self.ops.push(Op::GcMark(addr, is_root));
	}

	fn gc_unmark(&mut self, addr: Reg, is_root: bool) {
		self.ops.push(Op::GcUnmark(addr, is_root));
	}

	fn load_const_string(&mut self, dst: Reg, pool: Rc<ConstantPool>, index: usize) {
		self.ops.push(Op::LoadConstString(dst, pool, index));
	}
}

/// A finalized method, ready to be called with pointer-sized arguments.
pub struct CompiledMethod<'l> {
	gc: Rc<dyn GarbageCollector>,
	ops: Vec<Op<'l>>,
	labels: FxHashMap<Label, usize>,
	num_regs: u32,
	frame_size: u32,
}

impl<'l> CompiledMethod<'l> {
	#[cfg_attr(feature = "tracing", tracing::instrument(skip(self, args)))]
	pub fn call(&self, args: &[i64]) -> Option<i64> {
		let mut regs = vec![0i64; self.num_regs.max(1) as usize];
		for (i, arg) in args.iter().enumerate() {
			regs[i] = *arg;
		}
		let mut frame = vec![0u8; self.frame_size.max(1) as usize];
		let frame_base = frame.as_mut_ptr() as i64;
		let mut fpu: Vec<f64> = Vec::new();
		let mut pc = 0usize;

		loop {
			match &self.ops[pc] {
				Op::LabelMark(_) => {}
				Op::MovImm32(dst, value) => regs[dst.0 as usize] = *value as i64,
				Op::MovImm64(dst, value) => regs[dst.0 as usize] = *value,
				Op::Mov(dst, src) => regs[dst.0 as usize] = regs[src.0 as usize],
				Op::Load(dst, addr) => {
					let ptr = (frame_base + regs[addr.0 as usize]) as *const i64;
					regs[dst.0 as usize] = unsafe { ptr.read_unaligned() };
				}
				Op::Store(addr, src) => {
					let ptr = (frame_base + regs[addr.0 as usize]) as *mut i64;
					unsafe { ptr.write_unaligned(regs[src.0 as usize]) };
				}
				Op::Alu(op, dst, lhs, rhs) => {
					let (l, r) = (regs[lhs.0 as usize], regs[rhs.0 as usize]);
					regs[dst.0 as usize] = match op {
						AluOp::Add => l.wrapping_add(r),
						AluOp::Sub => l.wrapping_sub(r),
						AluOp::Mul => l.wrapping_mul(r),
						AluOp::And => l & r,
						AluOp::Or => l | r,
						AluOp::Xor => l ^ r,
						AluOp::Shl => l.wrapping_shl(r as u32),
						AluOp::Shr => l.wrapping_shr(r as u32),
					};
				}
				Op::IDiv(quotient, remainder, lhs, rhs) => {
					let (l, r) = (regs[lhs.0 as usize] as i32, regs[rhs.0 as usize] as i32);
					regs[quotient.0 as usize] = (l / r) as i64;
					regs[remainder.0 as usize] = (l % r) as i64;
				}
				Op::Not(dst, src) => regs[dst.0 as usize] = !regs[src.0 as usize],
				Op::CmpJump(cond, lhs, rhs, target) => {
					let (l, r) = (regs[lhs.0 as usize], regs[rhs.0 as usize]);
					let taken = match cond {
						Cond::Eq => l == r,
						Cond::Ne => l != r,
						Cond::Lt => l < r,
						Cond::Le => l <= r,
						Cond::Gt => l > r,
						Cond::Ge => l >= r,
					};
					if taken {
						pc = self.labels[target];
						continue;
					}
				}
				Op::Jump(target) => {
					pc = self.labels[target];
					continue;
				}
				Op::Ret(value) => return value.map(|reg| regs[reg.0 as usize]),
				Op::Fld(addr) => {
					let ptr = (frame_base + regs[addr.0 as usize]) as *const f64;
					fpu.push(unsafe { ptr.read_unaligned() });
				}
				Op::Fstp(addr) => {
					let value = fpu.pop().expect("FPU stack underflow");
					let ptr = (frame_base + regs[addr.0 as usize]) as *mut f64;
					unsafe { ptr.write_unaligned(value) };
				}
				Op::FBinOp(op) => {
					let rhs = fpu.pop().expect("FPU stack underflow");
					let lhs = fpu.pop().expect("FPU stack underflow");
					let result = match op {
						AluOp::Add => lhs + rhs,
						AluOp::Sub => lhs - rhs,
						AluOp::Mul => lhs * rhs,
						AluOp::Div => lhs / rhs,
						_ => unreachable!("unsupported FPU op"),
					};
					fpu.push(result);
				}
				Op::Call { target, args, out } => {
					let call_args: Vec<i64> = args.iter().map(|r| regs[r.0 as usize]).collect();
					let result = match target {
						CallTarget::Managed(method) => {
							let method = method.borrow();
							let entry = method.emitted.borrow();
							entry.as_ref().expect("callee not yet compiled").call(&call_args).unwrap_or(0)
						}
						CallTarget::Unmanaged(function) => function(&call_args),
					};
					if let Some(out) = out {
						regs[out.0 as usize] = result;
					}
				}
				Op::GcMark(addr, is_root) => {
					let ptr = (frame_base + regs[addr.0 as usize]) as *mut u8;
					self.gc.mark(ptr, *is_root);
				}
				Op::GcUnmark(addr, is_root) => {
					let ptr = (frame_base + regs[addr.0 as usize]) as *mut u8;
					self.gc.unmark(ptr, *is_root);
				}
				Op::LoadConstString(dst, pool, index) => {
					regs[dst.0 as usize] = pool.get(*index) as i64;
				}
			}
			pc += 1;
		}
	}
}
