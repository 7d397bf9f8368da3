//! Image header: a small pointer to the fdtmap.
//!
//! Eight bytes at the very start or very end of the image: the magic `BinM`
//! followed by the little-endian image position of the fdtmap.

use std::mem::size_of;

use object::endian::LittleEndian;
use object::pod::bytes_of;

use super::{le32, read_pod, Le32};

pub const IMAGE_HEADER_MAGIC: &[u8; 4] = b"BinM";
pub const IMAGE_HEADER_LEN: u64 = size_of::<RawHeader>() as u64;

/// Pointer value written while the fdtmap position is still unknown.
pub const UNKNOWN_POS: u32 = 0xffff_ffff;

#[derive(Clone, Copy)]
#[repr(C)]
struct RawHeader {
    magic: [u8; 4],
    fdtmap_pos: Le32,
}

impl_pod!(RawHeader);

pub fn encode_header(fdtmap_pos: u32) -> Vec<u8> {
    let header = RawHeader {
        magic: *IMAGE_HEADER_MAGIC,
        fdtmap_pos: le32(fdtmap_pos),
    };
    bytes_of(&header).to_vec()
}

/// Returns the fdtmap position recorded by a header at the start or end of `image`.
pub fn locate_header(image: &[u8]) -> Option<u32> {
    let end = image.len().checked_sub(IMAGE_HEADER_LEN as usize)?;
    [0, end]
        .into_iter()
        .filter_map(|pos| read_pod::<RawHeader>(image, pos))
        .find(|header| header.magic == *IMAGE_HEADER_MAGIC)
        .map(|header| header.fdtmap_pos.get(LittleEndian))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn header_at_start_is_found_first() {
        let mut image = encode_header(0x40);
        image.resize(0x80, 0);
        image[0x78..].copy_from_slice(&encode_header(0x50));
        assert_eq!(locate_header(&image), Some(0x40));
    }

    #[test]
    fn header_at_end() {
        let mut image = vec![0u8; 0x20];
        image[0x18..].copy_from_slice(&encode_header(0x10));
        assert_eq!(locate_header(&image), Some(0x10));
        assert_eq!(locate_header(&[0u8; 0x20]), None);
        assert_eq!(locate_header(b"BinM"), None);
    }
}
