use std::io::{Cursor, ErrorKind};

use crate::errors::LoadError;
use crate::utilities::{read_bytes_slice_from_stream, read_cstr_from_stream, FromByteStream};

/// Bounds-checked streaming decoder over a `(ptr, remaining)` view into a
/// module's bytes. Strings and spans borrow straight out of the input buffer
/// and remain valid for the module's whole lifetime; nothing here allocates.
#[derive(Clone)]
pub struct BinaryReader<'l> {
	cursor: Cursor<&'l [u8]>,
}

impl<'l> BinaryReader<'l> {
	pub fn new(bytes: &'l [u8]) -> Self {
		Self { cursor: Cursor::new(bytes) }
	}

	#[inline]
	pub fn offset(&self) -> u32 {
		self.cursor.position() as u32
	}

	#[inline]
	pub fn remaining(&self) -> usize {
		let buf = *self.cursor.get_ref();
		buf.len().saturating_sub(self.cursor.position() as usize)
	}

	#[inline]
	pub fn is_empty(&self) -> bool {
		self.remaining() == 0
	}

	/// Reads a fixed-size value, advancing past it.
	pub fn read_fixed<T: FromByteStream<Deps = ()>>(&mut self) -> Result<T, LoadError> {
		T::read(&mut self.cursor, &()).map_err(|_| LoadError::ShortRead)
	}

	pub fn read_u8(&mut self) -> Result<u8, LoadError> {
		self.read_fixed()
	}

	pub fn read_u32(&mut self) -> Result<u32, LoadError> {
		self.read_fixed()
	}

	pub fn read_f64(&mut self) -> Result<f64, LoadError> {
		self.read_fixed()
	}

	/// Reads a NUL-terminated string, returning a borrow into the source
	/// buffer and advancing past the terminator. A terminator found past the
	/// end of the buffer (or missing entirely) is a `ShortRead`; a
	/// terminator found but the bytes before it not valid UTF-8 is reported
	/// distinctly as `InvalidUtf8`.
	pub fn read_cstr(&mut self) -> Result<&'l str, LoadError> {
		read_cstr_from_stream(&mut self.cursor).map_err(|e| {
			if e.kind() == ErrorKind::InvalidData {
				LoadError::InvalidUtf8
			} else {
				LoadError::ShortRead
			}
		})
	}

	/// Returns a borrowed span of `len` bytes and advances past it.
	pub fn advance(&mut self, len: usize) -> Result<&'l [u8], LoadError> {
		read_bytes_slice_from_stream(&mut self.cursor, len).map_err(|_| LoadError::ShortRead)
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn reads_fixed_integers_little_endian() {
		let bytes = [0x01, 0x00, 0x00, 0x00, 0x02, 0x00, 0x00, 0x00];
		let mut reader = BinaryReader::new(&bytes);
		assert_eq!(reader.read_u32().unwrap(), 1);
		assert_eq!(reader.read_u32().unwrap(), 2);
		assert!(reader.is_empty());
	}

	#[test]
	fn short_read_on_truncated_integer() {
		let bytes = [0x01, 0x00];
		let mut reader = BinaryReader::new(&bytes);
		assert!(matches!(reader.read_u32(), Err(LoadError::ShortRead)));
	}

	#[test]
	fn reads_nul_terminated_strings() {
		let bytes = b"Main\0Other\0";
		let mut reader = BinaryReader::new(bytes);
		assert_eq!(reader.read_cstr().unwrap(), "Main");
		assert_eq!(reader.read_cstr().unwrap(), "Other");
	}

	#[test]
	fn invalid_utf8_string_is_reported_distinctly() {
		let bytes = [0xFFu8, 0x00];
		let mut reader = BinaryReader::new(&bytes);
		assert!(matches!(reader.read_cstr(), Err(LoadError::InvalidUtf8)));
	}

	#[test]
	fn advance_returns_borrowed_span() {
		let bytes = [1, 2, 3, 4, 5];
		let mut reader = BinaryReader::new(&bytes);
		let span = reader.advance(3).unwrap();
		assert_eq!(span, &[1, 2, 3]);
		assert_eq!(reader.remaining(), 2);
	}

	#[test]
	fn advance_past_end_is_short_read() {
		let bytes = [1, 2, 3];
		let mut reader = BinaryReader::new(&bytes);
		assert!(matches!(reader.advance(10), Err(LoadError::ShortRead)));
	}
}
