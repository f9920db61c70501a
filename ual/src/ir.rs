use std::cell::Cell;
use std::collections::HashMap;

use nohash_hasher::BuildNoHashHasher;

use crate::module::MethodHandle;
use crate::types::Type;

/// Index into a method's IR arena. Replaces the source's raw prev/next
/// pointers: detaching a node from the statement list is index rewiring,
/// and every node in the arena is freed together when the Method is.
#[derive(Copy, Clone, Eq, PartialEq, Hash, Debug)]
#[repr(transparent)]
pub struct NodeId(pub u32);

#[derive(Copy, Clone, Eq, PartialEq, Debug)]
pub enum BinOp {
	Add,
	Sub,
	Mul,
	Div,
	Rem,
	Shl,
	Shr,
	And,
	Or,
	Xor,
	Not,
}

#[derive(Copy, Clone, Eq, PartialEq, Debug)]
pub enum BranchCond {
	Always,
	Le,
	Lt,
	Gt,
	Ge,
	Eq,
	Ne,
}

#[derive(Debug)]
pub enum IrNodeKind<'l> {
	LdArg { index: u32 },
	LdLoc { index: u32 },
	StLoc { index: u32, expr: NodeId },
	ConstInt { value: u32 },
	ConstDouble { value: f64 },
	ConstString { text: &'l str },
	BinExpr { op: BinOp, left: NodeId, right: Option<NodeId> },
	Call { callee: MethodHandle<'l>, args: Vec<NodeId> },
	Ret { expr: Option<NodeId> },
	Branch { target_offset: u32, cond: BranchCond, left: Option<NodeId>, right: Option<NodeId> },
	Nop,
}

/// One IR node. Fields shared by every variant sit in the header, mirroring
/// the source's common base class; `kind` carries the variant-specific data.
#[derive(Debug)]
pub struct IrNode<'l> {
	pub kind: IrNodeKind<'l>,
	pub result_type: Option<&'l Type<'l>>,
	pub offset_in_ual: u32,
	pub fp_emit: Cell<bool>,
	pub label: Cell<Option<LabelId>>,
	pub bound: Cell<bool>,
	pub prev: Cell<Option<NodeId>>,
	pub next: Cell<Option<NodeId>>,
}

/// Opaque handle to a backend label, assigned by the code generator.
#[derive(Copy, Clone, Eq, PartialEq, Debug)]
#[repr(transparent)]
pub struct LabelId(pub u32);

/// Per-method arena of IR nodes plus the doubly-linked statement list and
/// the UAL-offset -> node map the verifier builds as it goes.
#[derive(Debug, Default)]
pub struct IrGraph<'l> {
	nodes: Vec<IrNode<'l>>,
	pub head: Option<NodeId>,
	pub tail: Option<NodeId>,
	/// Maps the UAL byte offset of an instruction's first byte to the node
	/// it produced, for branch-target resolution. Injective by construction:
	/// the verifier decodes the opcode stream in one forward pass. Keyed by
	/// a raw `u32` offset, so a no-op identity hasher (the same
	/// `BuildNoHashHasher` the teacher uses for its `u32`-keyed generic-param
	/// memo tables) avoids hashing an integer that is already well spread.
	pub offset_map: HashMap<u32, NodeId, BuildNoHashHasher<u32>>,
}

impl<'l> IrGraph<'l> {
	pub fn new() -> Self {
		Self { nodes: Vec::new(), head: None, tail: None, offset_map: HashMap::default() }
	}

	fn alloc(&mut self, kind: IrNodeKind<'l>, result_type: Option<&'l Type<'l>>, offset_in_ual: u32) -> NodeId {
		let id = NodeId(self.nodes.len() as u32);
		self.nodes.push(IrNode {
			kind,
			result_type,
			offset_in_ual,
			fp_emit: Cell::new(false),
			label: Cell::new(None),
			bound: Cell::new(false),
			prev: Cell::new(None),
			next: Cell::new(None),
		});
		id
	}

	/// Allocates a stack-op node (pushed onto the evaluation stack). It is
	/// not linked into the statement list until a consumer detaches it into
	/// a subtree, or it never is if it's consumed as an expression.
	pub fn push_value(&mut self, kind: IrNodeKind<'l>, result_type: &'l Type<'l>, offset_in_ual: u32) -> NodeId {
		self.alloc(kind, Some(result_type), offset_in_ual)
	}

	/// Allocates a statement node and appends it to the instruction list.
	pub fn append_statement(&mut self, kind: IrNodeKind<'l>, offset_in_ual: u32) -> NodeId {
		let id = self.alloc(kind, None, offset_in_ual);
		match self.tail {
			Some(tail) => {
				self[tail].next.set(Some(id));
				self[id].prev.set(Some(tail));
			}
			None => self.head = Some(id),
		}
		self.tail = Some(id);
		id
	}

	pub fn get(&self, id: NodeId) -> &IrNode<'l> {
		&self.nodes[id.0 as usize]
	}

	/// Registers `id` as the node produced at `offset`. Returns `false` if
	/// `offset` already has a registration (should be unreachable: a single
	/// forward decode pass visits each offset once).
	pub fn register_offset(&mut self, offset: u32, id: NodeId) -> bool {
		self.offset_map.insert(offset, id).is_none()
	}

	pub fn iter_statements(&self) -> impl Iterator<Item = NodeId> + '_ {
		let mut current = self.head;
		std::iter::from_fn(move || {
			let id = current?;
			current = self[id].next.get();
			Some(id)
		})
	}
}

impl<'l> std::ops::Index<NodeId> for IrGraph<'l> {
	type Output = IrNode<'l>;
	fn index(&self, id: NodeId) -> &Self::Output {
		&self.nodes[id.0 as usize]
	}
}
