use std::cell::{Cell, RefCell};
use std::rc::Rc;

use fxhash::FxHashMap;

use crate::emitter::CompiledMethod;
use crate::errors::{ErrorSite, LoadError};
use crate::ir::IrGraph;
use crate::raw::module::{RawMethod, RawModule};
use crate::raw::reader::BinaryReader;
use crate::raw::signature::MethodSignature;
use crate::types::{Type, TypeTable};

/// Shared handle to a parsed method. `Rc<RefCell<_>>` rather than a plain
/// reference because the IR's `Call` nodes and the module-wide signature
/// cache both need to reach the same method, and its `ir`/`emitted` slots
/// are filled in after the method itself is constructed.
pub type MethodHandle<'l> = Rc<RefCell<Method<'l>>>;

/// `{ signature, isManaged, localTypes, body, ownerModule, irRoot,
/// emittedEntry }`. Unmanaged methods carry an empty body and select a
/// host-registered ABI function by `signature.method_name` at invoke time.
pub struct Method<'l> {
	pub signature: MethodSignature,
	pub return_type: &'l Type<'l>,
	pub arg_types: Vec<&'l Type<'l>>,
	pub is_managed: bool,
	pub local_types: Vec<&'l Type<'l>>,
	pub body: &'l [u8],
	pub owner_class: String,
	pub ir: RefCell<Option<IrGraph<'l>>>,
	pub emitted: RefCell<Option<CompiledMethod<'l>>>,
}

impl Method<'_> {
	pub fn is_entry_point_candidate(&self) -> bool {
		self.signature.method_name == "Main" && self.signature.args.len() == 1 && self.signature.args[0] == "System.String[]"
	}
}

/// One class: a name plus its lazily-compiled method table.
pub struct Class<'l> {
	pub name: String,
	raw_methods: Vec<RawMethod<'l>>,
	methods: RefCell<Option<FxHashMap<String, MethodHandle<'l>>>>,
}

impl<'l> Class<'l> {
	/// Parses this class's method table, constructing `Method` objects and
	/// registering each under its full signature in `module_cache`.
	/// Idempotent once compiled.
	fn compile(&self, types: &TypeTable<'l>, module_cache: &RefCell<FxHashMap<String, MethodHandle<'l>>>) -> Result<(), LoadError> {
		if self.methods.borrow().is_some() {
			return Ok(());
		}

		let mut local_methods = FxHashMap::default();
		for raw in &self.raw_methods {
			let signature = MethodSignature::parse(raw.signature)?;
			let return_type = types.resolve(&signature.return_type)?;
			let arg_types = signature.args.iter().map(|arg| types.resolve(arg)).collect::<Result<Vec<_>, _>>()?;

			let mut reader = BinaryReader::new(raw.body);
			let is_managed = reader.read_u8()? == 1;
			let mut local_types = Vec::new();
			let mut body: &[u8] = &[];
			if is_managed {
				let local_count = reader.read_u32()?;
				for _ in 0..local_count {
					local_types.push(types.resolve(reader.read_cstr()?)?);
				}
				body = reader.advance(reader.remaining())?;
			}

			let method: MethodHandle<'l> = Rc::new(RefCell::new(Method {
				signature: signature.clone(),
				return_type,
				arg_types,
				is_managed,
				local_types,
				body,
				owner_class: self.name.clone(),
				ir: RefCell::new(None),
				emitted: RefCell::new(None),
			}));

			if module_cache.borrow().contains_key(&signature.full_text) {
				return Err(LoadError::DuplicateSignature { signature: signature.full_text });
			}
			module_cache.borrow_mut().insert(signature.full_text.clone(), method.clone());
			local_methods.insert(signature.method_name.clone(), method);
		}

		*self.methods.borrow_mut() = Some(local_methods);
		Ok(())
	}

	pub fn method(&self, name: &str) -> Option<MethodHandle<'l>> {
		self.methods.borrow().as_ref()?.get(name).cloned()
	}

	pub fn method_names(&self) -> Vec<String> {
		self.methods.borrow().as_ref().map(|m| m.keys().cloned().collect()).unwrap_or_default()
	}
}

/// `{ classes, methodImports }`. Parsing the header is eager; each class's
/// method table is parsed lazily, on `ensure_compiled`.
pub struct Module<'l> {
	types: &'l TypeTable<'l>,
	classes: Vec<Class<'l>>,
	method_imports: FxHashMap<u32, String>,
	signature_cache: RefCell<FxHashMap<String, MethodHandle<'l>>>,
	compiled: Cell<bool>,
}

impl<'l> Module<'l> {
	pub fn parse(bytes: &'l [u8], types: &'l TypeTable<'l>) -> Result<Self, LoadError> {
		let raw = RawModule::parse(bytes)?;
		let mut classes = Vec::with_capacity(raw.classes.len());
		for raw_class in &raw.classes {
			types.declare_class(raw_class.name);
			classes.push(Class { name: raw_class.name.to_string(), raw_methods: raw_class.parse_methods()?, methods: RefCell::new(None) });
		}
		let method_imports = raw.method_imports.into_iter().map(|(handle, sig)| (handle, sig.to_string())).collect();
		Ok(Self { types, classes, method_imports, signature_cache: RefCell::new(FxHashMap::default()), compiled: Cell::new(false) })
	}

	/// Compiles every class's method table, if this hasn't happened yet.
	#[cfg_attr(feature = "tracing", tracing::instrument(skip(self)))]
	pub fn ensure_compiled(&self) -> Result<(), LoadError> {
		if self.compiled.get() {
			return Ok(());
		}
		for class in &self.classes {
			class.compile(self.types, &self.signature_cache)?;
		}
		self.compiled.set(true);
		Ok(())
	}

	pub fn classes(&self) -> &[Class<'l>] {
		&self.classes
	}

	pub fn types(&self) -> &'l TypeTable<'l> {
		self.types
	}

	/// Resolves a `CALL` opcode's numeric import handle to the callee's
	/// `Method`, through the module's import table and signature cache.
	pub fn resolve_import(&self, handle: u32) -> Result<MethodHandle<'l>, LoadError> {
		let signature = self
			.method_imports
			.get(&handle)
			.ok_or_else(|| LoadError::UnresolvedExtern { name: format!("import handle {handle}"), site: ErrorSite::none() })?;
		self.signature_cache
			.borrow()
			.get(signature)
			.cloned()
			.ok_or_else(|| LoadError::UnresolvedExtern { name: signature.clone(), site: ErrorSite::none() })
	}

	/// Scans every class for a method named `Main` taking one
	/// `System.String[]` argument.
	pub fn find_entry_point(&self) -> Result<MethodHandle<'l>, LoadError> {
		self.ensure_compiled()?;
		for class in &self.classes {
			for name in class.method_names() {
				if let Some(method) = class.method(&name) {
					if method.borrow().is_entry_point_candidate() {
						return Ok(method);
					}
				}
			}
		}
		Err(LoadError::EntryPointNotFound)
	}
}
