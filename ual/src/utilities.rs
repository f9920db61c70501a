use std::io::{Cursor, Error, ErrorKind, Read};
use std::mem::{size_of, MaybeUninit};
use std::slice::from_raw_parts_mut;

#[inline]
pub(crate) unsafe fn read_pod_from_stream<T: Copy>(stream: &mut impl Read) -> std::io::Result<T> {
	let mut value = MaybeUninit::<T>::uninit();
	stream.read_exact(from_raw_parts_mut(value.as_mut_ptr() as *mut u8, size_of::<T>()))?;
	Ok(value.assume_init())
}

#[inline]
pub(crate) fn read_bytes_slice_from_stream<'l>(stream: &mut Cursor<&'l [u8]>, count: usize) -> std::io::Result<&'l [u8]> {
	let start = stream.position() as usize;
	let buf = *stream.get_ref();
	if buf.len() < start || buf.len() - start < count {
		return Err(Error::from(ErrorKind::UnexpectedEof));
	}
	stream.set_position((start + count) as u64);
	Ok(&buf[start..start + count])
}

/// Reads a NUL-terminated string directly out of the source buffer, without copying.
#[inline]
pub(crate) fn read_cstr_from_stream<'l>(stream: &mut Cursor<&'l [u8]>) -> std::io::Result<&'l str> {
	let start = stream.position() as usize;
	let buf = *stream.get_ref();
	if start > buf.len() {
		return Err(Error::from(ErrorKind::UnexpectedEof));
	}
	let rest = &buf[start..];
	let Some(nul) = rest.iter().position(|b| *b == 0) else {
		return Err(Error::from(ErrorKind::UnexpectedEof));
	};
	let str = std::str::from_utf8(&rest[..nul]).map_err(|_| Error::from(ErrorKind::InvalidData))?;
	stream.set_position((start + nul + 1) as u64);
	Ok(str)
}

/// Byte-exact decoding of a fixed-size value from a `Cursor<&[u8]>`.
pub trait FromByteStream
where
	Self: Sized,
{
	type Deps;
	fn read(stream: &mut Cursor<&[u8]>, deps: &Self::Deps) -> std::io::Result<Self>;
}

// TODO handle big endian architectures
macro_rules! impl_from_byte_stream {
	($ty: ty) => {
		impl crate::utilities::FromByteStream for $ty {
			type Deps = ();
			#[inline]
			fn read(stream: &mut std::io::Cursor<&[u8]>, _: &Self::Deps) -> std::io::Result<Self> {
				unsafe { crate::utilities::read_pod_from_stream(stream) }
			}
		}
	};
}

pub(crate) use impl_from_byte_stream;

macro_rules! impl_from_le_byte_stream {
	($($ty: ty),*) => {$(
		impl crate::utilities::FromByteStream for $ty {
			type Deps = ();
			#[inline]
			fn read(stream: &mut std::io::Cursor<&[u8]>, _: &Self::Deps) -> std::io::Result<Self> {
				let mut bytes = [0u8; size_of::<Self>()];
				stream.read_exact(&mut bytes)?;
				Ok(Self::from_le_bytes(bytes))
			}
		}
	)*};
}

impl FromByteStream for u8 {
	type Deps = ();
	#[inline]
	fn read(stream: &mut Cursor<&[u8]>, _: &Self::Deps) -> std::io::Result<Self> {
		let mut byte = 0u8;
		stream.read_exact(std::slice::from_mut(&mut byte))?;
		Ok(byte)
	}
}

impl_from_le_byte_stream!(u16, u32, u64, i32, i64);

impl FromByteStream for f32 {
	type Deps = ();
	#[inline]
	fn read(stream: &mut Cursor<&[u8]>, _: &Self::Deps) -> std::io::Result<Self> {
		Ok(f32::from_bits(u32::read(stream, &())?))
	}
}

impl FromByteStream for f64 {
	type Deps = ();
	#[inline]
	fn read(stream: &mut Cursor<&[u8]>, _: &Self::Deps) -> std::io::Result<Self> {
		Ok(f64::from_bits(u64::read(stream, &())?))
	}
}

/// Rounds `value` up to the nearest multiple of `MULTIPLE`. Used by the frame
/// layout to align struct-local slots to 8 bytes.
#[inline]
pub(crate) const fn round_to_multiple_of<const MULTIPLE: usize>(value: usize) -> usize {
	((value + (MULTIPLE - 1)) / MULTIPLE) * MULTIPLE
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn reads_cstr_without_copying() {
		let buf = b"hello\0world";
		let mut cursor = Cursor::new(&buf[..]);
		let s = read_cstr_from_stream(&mut cursor).unwrap();
		assert_eq!(s, "hello");
		assert_eq!(cursor.position(), 6);
	}

	#[test]
	fn short_read_on_missing_nul() {
		let buf = b"no terminator";
		let mut cursor = Cursor::new(&buf[..]);
		assert!(read_cstr_from_stream(&mut cursor).is_err());
	}

	#[test]
	fn rounds_up_to_multiple_of_eight() {
		assert_eq!(round_to_multiple_of::<8>(0), 0);
		assert_eq!(round_to_multiple_of::<8>(1), 8);
		assert_eq!(round_to_multiple_of::<8>(8), 8);
		assert_eq!(round_to_multiple_of::<8>(9), 16);
	}
}
