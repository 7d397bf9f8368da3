//! Binary formats written into images and read back from them.
//!
//! Fixed-size headers are `#[repr(C)]` structs made only of byte arrays and
//! byte-aligned endian fields, so they have no padding. They are written with
//! [`object::pod::bytes_of`] and read in place with [`read_pod`].

use object::endian::{BigEndian, LittleEndian, U16Bytes, U32Bytes, U64Bytes};
use object::pod::{self, Pod};

/// Marks header structs as plain old data.
macro_rules! impl_pod {
    ($($ty:ty),* $(,)?) => {
        $(
            // SAFETY: `#[repr(C)]` with only `u8`-aligned fields, so there is
            // no padding and every bit pattern is a valid value.
            unsafe impl object::pod::Pod for $ty {}
        )*
    };
}
pub(crate) use impl_pod;

pub mod cbfs;
pub mod fdtmap;
pub mod fmap;
pub mod image_header;

pub(crate) type Le16 = U16Bytes<LittleEndian>;
pub(crate) type Le32 = U32Bytes<LittleEndian>;
pub(crate) type Le64 = U64Bytes<LittleEndian>;
pub(crate) type Be32 = U32Bytes<BigEndian>;

pub(crate) fn le16(value: u16) -> Le16 {
    U16Bytes::new(LittleEndian, value)
}

pub(crate) fn le32(value: u32) -> Le32 {
    U32Bytes::new(LittleEndian, value)
}

pub(crate) fn le64(value: u64) -> Le64 {
    U64Bytes::new(LittleEndian, value)
}

pub(crate) fn be32(value: u32) -> Be32 {
    U32Bytes::new(BigEndian, value)
}

/// Reads a `T` stored at `pos`, if `data` holds all of it.
pub(crate) fn read_pod<T: Pod>(data: &[u8], pos: usize) -> Option<&T> {
    pod::from_bytes(data.get(pos..)?).ok().map(|(value, _)| value)
}

/// Finds the first occurrence of `needle` in `data` at or after `from`.
pub(crate) fn find_bytes(data: &[u8], needle: &[u8], from: usize) -> Option<usize> {
    if needle.is_empty() || data.len() < needle.len() {
        return None;
    }
    (from..=data.len() - needle.len()).find(|&pos| &data[pos..pos + needle.len()] == needle)
}
