//! Position map (fdtmap): the image layout stored inside the image.
//!
//! A 16-byte header (`_FDTMAP_` and eight zero bytes) followed by a device
//! tree that mirrors the entry tree. Every node carries `offset`, `size` and
//! `image-pos`; images that allow repacking also record the requested
//! `orig-offset` and `orig-size`. The root node records the name of the
//! node the map was generated from in `image-node`.

use std::mem::size_of;

use object::endian::BigEndian;
use object::pod::bytes_of;

use super::{read_pod, Be32};
use crate::entry::EntryView;
use crate::error::{FormatError, Result};
use crate::fdt::{DeviceTree, FdtNode, FDT_MAGIC};
use crate::node::Value;

pub const FDTMAP_MAGIC: &[u8; 8] = b"_FDTMAP_";
pub const FDTMAP_HDR_LEN: usize = size_of::<RawHeader>();

#[derive(Clone, Copy)]
#[repr(C)]
struct RawHeader {
    magic: [u8; 8],
    reserved: [u8; 8],
}

impl_pod!(RawHeader);

/// Writes a 32-bit cell, or a 64-bit one if the value needs it.
fn set_cell(node: &mut FdtNode, name: &str, value: u64) {
    match u32::try_from(value) {
        Ok(v) => node.set_u32(name, v),
        Err(_) => node.set_bytes(name, value.to_be_bytes().to_vec()),
    }
}

/// Copies the description of `view` and its calculated positions into `node`.
///
/// Unknown positions are written as zero so that the encoded size does not
/// change once they are resolved.
pub fn write_positions(node: &mut FdtNode, view: &EntryView, repack: bool) {
    for (name, value) in &view.props {
        if *value == Value::Bool(false) {
            continue;
        }
        node.set_bytes(name, value.to_fdt_bytes());
    }
    set_cell(node, "offset", view.offset.unwrap_or(0));
    set_cell(node, "size", view.size.unwrap_or(0));
    set_cell(node, "image-pos", view.image_pos.unwrap_or(0));
    if repack {
        if let Some(orig) = view.orig_offset {
            set_cell(node, "orig-offset", orig);
        }
        if let Some(orig) = view.orig_size {
            set_cell(node, "orig-size", orig);
        }
    }
    if !view.compress.is_none() {
        set_cell(node, "uncomp-size", view.uncomp_size.unwrap_or(0));
    }
    if let Some((algo, value)) = &view.hash {
        let hash = node.subnode_mut("hash");
        hash.set_string("algo", algo.name());
        let value = value.clone().unwrap_or_else(|| vec![0; algo.output_len()]);
        hash.set_bytes("value", value);
    }
    for child in &view.children {
        write_positions(node.subnode_mut(child.node_name()), child, repack);
    }
}

/// Builds the fdtmap for `section`.
pub fn build_fdtmap(section: &EntryView, repack: bool) -> Vec<u8> {
    let mut tree = DeviceTree::new();
    tree.root.set_string("image-node", section.node_name());
    write_positions(&mut tree.root, section, repack);
    let header = RawHeader {
        magic: *FDTMAP_MAGIC,
        reserved: [0; 8],
    };
    let mut out = bytes_of(&header).to_vec();
    out.extend_from_slice(&tree.to_bytes());
    out
}

/// Writes the positions of `image` into the node of `tree` that described it.
pub fn annotate_fdt(tree: &mut DeviceTree, image: &EntryView) {
    write_positions(tree.node_mut(&image.path), image, false);
}

/// Finds an fdtmap in `image` by scanning for its header.
pub fn locate_fdtmap(image: &[u8]) -> Option<usize> {
    let mut from = 0;
    while let Some(pos) = super::find_bytes(image, FDTMAP_MAGIC, from) {
        if is_fdtmap_at(image, pos) {
            return Some(pos);
        }
        from = pos + 1;
    }
    None
}

/// Checks for a complete header followed by a device tree at `pos`.
pub fn is_fdtmap_at(image: &[u8], pos: usize) -> bool {
    read_pod::<RawHeader>(image, pos).is_some_and(|header| header.magic == *FDTMAP_MAGIC)
        && read_pod::<Be32>(image, pos + FDTMAP_HDR_LEN).is_some_and(|magic| magic.get(BigEndian) == FDT_MAGIC)
}

/// Decodes the fdtmap starting at the beginning of `data`.
pub fn decode_fdtmap(data: &[u8]) -> Result<DeviceTree> {
    if !is_fdtmap_at(data, 0) {
        return Err(FormatError::Malformed {
            what: "fdtmap",
            message: "missing header".to_string(),
        }
        .into());
    }
    DeviceTree::from_bytes(&data[FDTMAP_HDR_LEN..])
}
