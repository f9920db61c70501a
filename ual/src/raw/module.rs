use crate::errors::LoadError;
use crate::raw::reader::BinaryReader;

/// A class's raw byte span, not yet parsed into methods. Parsing is
/// deferred to the structured layer so a module's method tables are built
/// lazily, at first invocation, rather than eagerly for every class.
pub struct RawClass<'l> {
	pub name: &'l str,
	body: &'l [u8],
}

impl<'l> RawClass<'l> {
	/// Parses this class's method table: `u32 methodCount` followed by
	/// `methodCount` entries of `(cstr signature, u32 bodyLength, body)`.
	pub fn parse_methods(&self) -> Result<Vec<RawMethod<'l>>, LoadError> {
		let mut reader = BinaryReader::new(self.body);
		let method_count = reader.read_u32()?;
		let mut methods = Vec::with_capacity(method_count as usize);
		for _ in 0..method_count {
			let signature = reader.read_cstr()?;
			let body_length = reader.read_u32()? as usize;
			let body = reader.advance(body_length)?;
			methods.push(RawMethod { signature, body });
		}
		Ok(methods)
	}
}

/// One method's raw signature text and body bytes, before the body has
/// been interpreted as managed-or-not.
pub struct RawMethod<'l> {
	pub signature: &'l str,
	pub body: &'l [u8],
}

/// The module header: every class's name and byte span, plus the
/// numeric-handle -> signature-text import table. Little-endian, as laid
/// out in full by the binary module format.
pub struct RawModule<'l> {
	pub classes: Vec<RawClass<'l>>,
	pub method_imports: Vec<(u32, &'l str)>,
}

impl<'l> RawModule<'l> {
	pub fn parse(bytes: &'l [u8]) -> Result<Self, LoadError> {
		let mut reader = BinaryReader::new(bytes);

		let class_count = reader.read_u32()?;
		let mut classes = Vec::with_capacity(class_count as usize);
		for _ in 0..class_count {
			let name = reader.read_cstr()?;
			let class_byte_length = reader.read_u32()? as usize;
			let body = reader.advance(class_byte_length)?;
			classes.push(RawClass { name, body });
		}

		let import_count = reader.read_u32()?;
		let mut method_imports = Vec::with_capacity(import_count as usize);
		for _ in 0..import_count {
			let handle = reader.read_u32()?;
			let signature = reader.read_cstr()?;
			method_imports.push((handle, signature));
		}

		Ok(Self { classes, method_imports })
	}
}
