use std::cell::RefCell;
use std::fmt::{Display, Formatter};
use std::hash::{Hash, Hasher};

use bumpalo::Bump;
use fxhash::FxHashMap;

use crate::errors::LoadError;

/// Size, in bytes, of a machine pointer on the runtime's target. Reference
/// types and arrays are always exactly one word.
pub const WORD_SIZE: u32 = 8;

/// A named type: `{ name, size, isStruct, fields }`. `fields` is tracked as
/// an empty map for every type the runtime produces, since object field
/// access is out of scope; the slot is kept so the type carries the same
/// shape the data model describes.
#[derive(Debug)]
pub struct Type<'l> {
	pub name: &'l str,
	pub size: u32,
	pub is_struct: bool,
}

impl<'l> Type<'l> {
	pub fn is_int32(&self) -> bool {
		self.name == "System.Int32"
	}

	pub fn is_double(&self) -> bool {
		self.name == "System.Double"
	}

	pub fn is_numeric(&self) -> bool {
		self.is_int32() || self.is_double()
	}

	pub fn is_void(&self) -> bool {
		self.name == "System.Void"
	}
}

impl Eq for Type<'_> {}

impl PartialEq for Type<'_> {
	fn eq(&self, other: &Self) -> bool {
		std::ptr::eq(self, other)
	}
}

impl Hash for Type<'_> {
	fn hash<H: Hasher>(&self, state: &mut H) {
		(self as *const Type).hash(state)
	}
}

impl Display for Type<'_> {
	fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
		write!(f, "{}", self.name)
	}
}

/// Process-wide registry of named types, bump-allocated so `&'l Type<'l>`
/// handles stay valid identity keys for the whole run. Built-ins are
/// registered eagerly; module classes and array types are interned lazily
/// on first reference.
pub struct TypeTable<'l> {
	bump: &'l Bump,
	types: RefCell<FxHashMap<String, &'l Type<'l>>>,
}

impl<'l> TypeTable<'l> {
	pub fn new(bump: &'l Bump) -> Self {
		let table = Self { bump, types: RefCell::new(FxHashMap::default()) };
		table.declare("System.Int32", 4, true);
		table.declare("System.Double", 8, true);
		table.declare("System.String", WORD_SIZE, false);
		table.declare("System.Void", 0, true);
		table
	}

	fn declare(&self, name: &str, size: u32, is_struct: bool) -> &'l Type<'l> {
		if let Some(ty) = self.types.borrow().get(name) {
			return ty;
		}
		let name: &'l str = self.bump.alloc_str(name);
		let ty = self.bump.alloc(Type { name, size, is_struct });
		self.types.borrow_mut().insert(name.to_string(), ty);
		ty
	}

	pub fn get(&self, name: &str) -> Option<&'l Type<'l>> {
		self.types.borrow().get(name).copied()
	}

	/// Resolves `name`, declaring it on the fly for the `T[]` array-type
	/// convention (always reference-typed, word-sized) as long as the
	/// element type `T` is already known. Any other unknown name fails.
	pub fn resolve(&self, name: &str) -> Result<&'l Type<'l>, LoadError> {
		if let Some(ty) = self.get(name) {
			return Ok(ty);
		}
		if let Some(element) = name.strip_suffix("[]") {
			self.get(element).ok_or_else(|| LoadError::UnknownType(name.to_string()))?;
			return Ok(self.declare(name, WORD_SIZE, false));
		}
		Err(LoadError::UnknownType(name.to_string()))
	}

	/// Registers a module-defined class as a reference type. Field layout
	/// is not modeled since object field access is out of scope.
	pub fn declare_class(&self, name: &str) -> &'l Type<'l> {
		self.declare(name, WORD_SIZE, false)
	}
}
