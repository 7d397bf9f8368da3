//! Flattened device tree encoding and decoding.
//!
//! Only the parts needed for position maps and annotated device trees are
//! supported: a version 17 blob with an empty memory reservation map, a
//! structure block and a strings block. Property names are de-duplicated in
//! the strings block in order of first use, so the output is deterministic.

use std::mem::size_of;

use indexmap::IndexMap;
use object::endian::BigEndian;
use object::pod::bytes_of;

use crate::error::{FormatError, Result};
use crate::format::{be32, impl_pod, read_pod, Be32};
use crate::node::{Node, Value};
use crate::utils::align_up;

pub const FDT_MAGIC: u32 = 0xd00d_feed;
const FDT_VERSION: u32 = 17;
const FDT_LAST_COMP_VERSION: u32 = 16;
const HEADER_LEN: usize = size_of::<RawHeader>();
const RSVMAP_LEN: usize = 16;

const FDT_BEGIN_NODE: u32 = 0x1;
const FDT_END_NODE: u32 = 0x2;
const FDT_PROP: u32 = 0x3;
const FDT_NOP: u32 = 0x4;
const FDT_END: u32 = 0x9;

#[derive(Clone, Copy)]
#[repr(C)]
struct RawHeader {
    magic: Be32,
    totalsize: Be32,
    off_dt_struct: Be32,
    off_dt_strings: Be32,
    off_mem_rsvmap: Be32,
    version: Be32,
    last_comp_version: Be32,
    boot_cpuid_phys: Be32,
    size_dt_strings: Be32,
    size_dt_struct: Be32,
}

/// Follows an `FDT_PROP` token.
#[derive(Clone, Copy)]
#[repr(C)]
struct RawProp {
    len: Be32,
    nameoff: Be32,
}

impl_pod!(RawHeader, RawProp);

/// One node of a device tree.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FdtNode {
    pub name: String,
    pub props: IndexMap<String, Vec<u8>>,
    pub children: Vec<FdtNode>,
}

impl FdtNode {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            ..Default::default()
        }
    }

    pub fn set_u32(&mut self, name: &str, value: u32) {
        self.props.insert(name.to_string(), value.to_be_bytes().to_vec());
    }

    pub fn set_string(&mut self, name: &str, value: &str) {
        let mut body = value.as_bytes().to_vec();
        body.push(0);
        self.props.insert(name.to_string(), body);
    }

    pub fn set_bytes(&mut self, name: &str, value: Vec<u8>) {
        self.props.insert(name.to_string(), value);
    }

    pub fn prop(&self, name: &str) -> Option<&[u8]> {
        self.props.get(name).map(Vec::as_slice)
    }

    pub fn get_u32(&self, name: &str) -> Option<u32> {
        let body = self.prop(name)?;
        let cell: [u8; 4] = body.try_into().ok()?;
        Some(u32::from_be_bytes(cell))
    }

    pub fn subnode(&self, name: &str) -> Option<&FdtNode> {
        self.children.iter().find(|c| c.name == name)
    }

    /// Returns the named child, creating it if needed.
    pub fn subnode_mut(&mut self, name: &str) -> &mut FdtNode {
        let idx = match self.children.iter().position(|c| c.name == name) {
            Some(idx) => idx,
            None => {
                self.children.push(FdtNode::new(name));
                self.children.len() - 1
            }
        };
        &mut self.children[idx]
    }

    /// Converts this subtree into a description node rooted at `path`.
    pub fn to_node(&self, path: &str) -> Node {
        let mut node = Node::new(&self.name, path);
        for (name, body) in &self.props {
            node.set(name, Value::Bytes(body.clone()));
        }
        for child in &self.children {
            let child_path = node.child_path(&child.name);
            node.children.push(child.to_node(&child_path));
        }
        node
    }
}

/// A whole device tree.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DeviceTree {
    pub root: FdtNode,
    pub boot_cpuid: u32,
}

impl DeviceTree {
    pub fn new() -> Self {
        Self::default()
    }

    /// Looks up a node by absolute path (`/binman/u-boot`).
    pub fn node(&self, path: &str) -> Option<&FdtNode> {
        let mut node = &self.root;
        for part in path.split('/').filter(|p| !p.is_empty()) {
            node = node.subnode(part)?;
        }
        Some(node)
    }

    /// Looks up a node by absolute path, creating missing nodes on the way.
    pub fn node_mut(&mut self, path: &str) -> &mut FdtNode {
        let mut node = &mut self.root;
        for part in path.split('/').filter(|p| !p.is_empty()) {
            node = node.subnode_mut(part);
        }
        node
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut strings = StringTable::default();
        let mut structure = Vec::new();
        emit_node(&self.root, &mut structure, &mut strings);
        structure.extend_from_slice(&FDT_END.to_be_bytes());

        let off_rsvmap = HEADER_LEN;
        let off_struct = off_rsvmap + RSVMAP_LEN;
        let off_strings = off_struct + structure.len();
        let total = off_strings + strings.data.len();

        let header = RawHeader {
            magic: be32(FDT_MAGIC),
            totalsize: be32(total as u32),
            off_dt_struct: be32(off_struct as u32),
            off_dt_strings: be32(off_strings as u32),
            off_mem_rsvmap: be32(off_rsvmap as u32),
            version: be32(FDT_VERSION),
            last_comp_version: be32(FDT_LAST_COMP_VERSION),
            boot_cpuid_phys: be32(self.boot_cpuid),
            size_dt_strings: be32(strings.data.len() as u32),
            size_dt_struct: be32(structure.len() as u32),
        };
        let mut out = Vec::with_capacity(total);
        out.extend_from_slice(bytes_of(&header));
        out.extend_from_slice(&[0u8; RSVMAP_LEN]);
        out.extend_from_slice(&structure);
        out.extend_from_slice(&strings.data);
        out
    }

    /// Parses a blob. Trailing bytes after `totalsize` are ignored.
    pub fn from_bytes(data: &[u8]) -> Result<DeviceTree> {
        let header = read_pod::<RawHeader>(data, 0).ok_or_else(|| malformed("truncated header"))?;
        if header.magic.get(BigEndian) != FDT_MAGIC {
            return Err(malformed("bad magic"));
        }
        let total = header.totalsize.get(BigEndian) as usize;
        if total > data.len() {
            return Err(malformed(format!(
                "total size {total:#x} exceeds the {:#x} bytes available",
                data.len()
            )));
        }
        let data = &data[..total];
        let off_struct = header.off_dt_struct.get(BigEndian) as usize;
        let off_strings = header.off_dt_strings.get(BigEndian) as usize;
        let boot_cpuid = header.boot_cpuid_phys.get(BigEndian);
        let strings = data
            .get(off_strings..)
            .ok_or_else(|| malformed("strings block out of range"))?;

        let mut pos = off_struct;
        let mut stack: Vec<FdtNode> = Vec::new();
        let mut root = None;
        loop {
            let token = read_u32(data, pos)?;
            pos += 4;
            match token {
                FDT_BEGIN_NODE => {
                    let name = read_cstr(data, pos)?;
                    pos = align_up((pos + name.len() + 1) as u64, 4) as usize;
                    stack.push(FdtNode::new(&name));
                }
                FDT_END_NODE => {
                    let node = stack.pop().ok_or_else(|| malformed("unbalanced end of node"))?;
                    match stack.last_mut() {
                        Some(parent) => parent.children.push(node),
                        None => root = Some(node),
                    }
                }
                FDT_PROP => {
                    let prop = read_pod::<RawProp>(data, pos)
                        .ok_or_else(|| malformed(format!("truncated property at {pos:#x}")))?;
                    let len = prop.len.get(BigEndian) as usize;
                    let name_off = prop.nameoff.get(BigEndian) as usize;
                    pos += size_of::<RawProp>();
                    let body = data
                        .get(pos..pos + len)
                        .ok_or_else(|| malformed("property runs past the end"))?
                        .to_vec();
                    pos = align_up((pos + len) as u64, 4) as usize;
                    let name = read_cstr(strings, name_off)?;
                    let node = stack.last_mut().ok_or_else(|| malformed("property outside a node"))?;
                    node.props.insert(name, body);
                }
                FDT_NOP => {}
                FDT_END => break,
                other => return Err(malformed(format!("unknown token {other:#x}"))),
            }
        }
        let root = root.ok_or_else(|| malformed("no root node"))?;
        Ok(DeviceTree { root, boot_cpuid })
    }
}

#[derive(Default)]
struct StringTable {
    data: Vec<u8>,
    offsets: IndexMap<String, u32>,
}

impl StringTable {
    fn offset(&mut self, name: &str) -> u32 {
        if let Some(off) = self.offsets.get(name) {
            return *off;
        }
        let off = self.data.len() as u32;
        self.data.extend_from_slice(name.as_bytes());
        self.data.push(0);
        self.offsets.insert(name.to_string(), off);
        off
    }
}

fn pad4(out: &mut Vec<u8>) {
    out.resize(align_up(out.len() as u64, 4) as usize, 0);
}

fn emit_node(node: &FdtNode, out: &mut Vec<u8>, strings: &mut StringTable) {
    out.extend_from_slice(&FDT_BEGIN_NODE.to_be_bytes());
    out.extend_from_slice(node.name.as_bytes());
    out.push(0);
    pad4(out);
    for (name, body) in &node.props {
        out.extend_from_slice(&FDT_PROP.to_be_bytes());
        out.extend_from_slice(&(body.len() as u32).to_be_bytes());
        out.extend_from_slice(&strings.offset(name).to_be_bytes());
        out.extend_from_slice(body);
        pad4(out);
    }
    for child in &node.children {
        emit_node(child, out, strings);
    }
    out.extend_from_slice(&FDT_END_NODE.to_be_bytes());
}

fn malformed(message: impl Into<String>) -> crate::error::Error {
    FormatError::Malformed {
        what: "device tree",
        message: message.into(),
    }
    .into()
}

fn read_u32(data: &[u8], pos: usize) -> Result<u32> {
    read_pod::<Be32>(data, pos)
        .map(|word| word.get(BigEndian))
        .ok_or_else(|| malformed(format!("truncated at {pos:#x}")))
}

fn read_cstr(data: &[u8], pos: usize) -> Result<String> {
    let tail = data
        .get(pos..)
        .ok_or_else(|| malformed(format!("string offset {pos:#x} out of range")))?;
    let end = tail
        .iter()
        .position(|&b| b == 0)
        .ok_or_else(|| malformed("unterminated string"))?;
    Ok(String::from_utf8_lossy(&tail[..end]).into_owned())
}
