/// Header of a managed string: a length-prefixed, GC-owned UTF-8 buffer.
/// The runtime never mutates a string's contents once allocated.
#[repr(C)]
pub struct StringHeader {
	pub length: u32,
	pub data: [u8; 0],
}

impl StringHeader {
	/// Allocates a managed string through `gc`, copying `text`'s bytes.
	pub fn allocate(gc: &dyn crate::gc::GarbageCollector, text: &str) -> *mut StringHeader {
		let size = std::mem::size_of::<u32>() + text.len();
		let ptr = gc.allocate(size, 0) as *mut StringHeader;
		unsafe {
			(*ptr).length = text.len() as u32;
			let data = (ptr as *mut u8).add(std::mem::size_of::<u32>());
			std::ptr::copy_nonoverlapping(text.as_ptr(), data, text.len());
		}
		ptr
	}

	/// # Safety
	/// `ptr` must point at a `StringHeader` produced by [`Self::allocate`].
	pub unsafe fn as_str<'a>(ptr: *const StringHeader) -> &'a str {
		let length = (*ptr).length as usize;
		let data = (ptr as *const u8).add(std::mem::size_of::<u32>());
		let bytes = std::slice::from_raw_parts(data, length);
		std::str::from_utf8_unchecked(bytes)
	}
}

/// Header of a managed array: element count followed by `length` machine
/// words. Used for the `Main(System.String[])` argument array; per-slot
/// reference tracking for arbitrary element arrays is a GC-side concern.
#[repr(C)]
pub struct ArrayHeader {
	pub length: u32,
	pub elements: [i64; 0],
}

impl ArrayHeader {
	/// Allocates an array of `elements.len()` machine words through `gc`,
	/// marking each slot as a live (non-root) reference.
	pub fn allocate(gc: &dyn crate::gc::GarbageCollector, elements: &[i64]) -> *mut ArrayHeader {
		let size = std::mem::size_of::<u32>() + elements.len() * std::mem::size_of::<i64>();
		let ptr = gc.allocate(size, elements.len() as u32) as *mut ArrayHeader;
		unsafe {
			(*ptr).length = elements.len() as u32;
			let base = (ptr as *mut u8).add(std::mem::size_of::<u32>()) as *mut i64;
			for (i, value) in elements.iter().enumerate() {
				let slot = base.add(i);
				*slot = *value;
				gc.mark(slot as *mut u8, false);
			}
		}
		ptr
	}

	/// # Safety
	/// `ptr` must point at an `ArrayHeader` produced by [`Self::allocate`].
	pub unsafe fn as_slice<'a>(ptr: *const ArrayHeader) -> &'a [i64] {
		let length = (*ptr).length as usize;
		let base = (ptr as *const u8).add(std::mem::size_of::<u32>()) as *const i64;
		std::slice::from_raw_parts(base, length)
	}
}

/// Wraps process argv as a managed `System.String[]` for the `Main` entry
/// point, allocating each element string then the array itself.
pub fn wrap_argv(gc: &dyn crate::gc::GarbageCollector, args: &[String]) -> *mut ArrayHeader {
	let elements: Vec<i64> = args.iter().map(|arg| StringHeader::allocate(gc, arg) as i64).collect();
	ArrayHeader::allocate(gc, &elements)
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::gc::BumpGc;

	#[test]
	fn round_trips_a_string() {
		let gc = BumpGc::new();
		let ptr = StringHeader::allocate(&gc, "hi");
		assert_eq!(unsafe { StringHeader::as_str(ptr) }, "hi");
	}

	#[test]
	fn round_trips_an_array() {
		let gc = BumpGc::new();
		let ptr = ArrayHeader::allocate(&gc, &[1, 2, 3]);
		assert_eq!(unsafe { ArrayHeader::as_slice(ptr) }, &[1, 2, 3]);
	}

	#[test]
	fn wraps_argv_as_string_array() {
		let gc = BumpGc::new();
		let args = vec!["a".to_string(), "bee".to_string()];
		let array = wrap_argv(&gc, &args);
		let elements = unsafe { ArrayHeader::as_slice(array) };
		assert_eq!(elements.len(), 2);
		let first = unsafe { StringHeader::as_str(elements[0] as *const StringHeader) };
		assert_eq!(first, "a");
	}
}
