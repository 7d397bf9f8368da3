//! Sections: entries that contain other entries.

use crate::entry::{Entry, EntryType};
use crate::error::{ConfigError, Result};
use crate::node::Node;
use crate::state::BuildContext;
use crate::utils::base_name;

/// The top of the 32-bit address space, used by `end-at-4gb` sections.
pub const FOUR_GB: u64 = 1 << 32;

/// Subnodes that annotate an entry rather than describe a child entry.
const ANNOTATION_NODES: &[&str] = &["hash"];

#[derive(Debug, Default)]
pub struct Section {
    /// Children in packing order.
    pub entries: Vec<Entry>,
    /// Byte used for gaps between children.
    pub pad_byte: u8,
    pub sort_by_offset: bool,
    /// Offsets below this value are not part of the section's contents.
    pub skip_at_start: u64,
    pub end_at_4gb: bool,
    pub name_prefix: String,
}

fn invalid(node: &Node, message: &str) -> crate::error::Error {
    ConfigError::Invalid {
        path: node.path.clone(),
        message: message.to_string(),
    }
    .into()
}

impl EntryType for Section {
    fn read_node(&mut self, node: &Node, ctx: &BuildContext) -> Result<()> {
        if let Some(pad) = node.get_int("pad-byte")? {
            self.pad_byte = u8::try_from(pad).map_err(|_| invalid(node, "pad-byte must fit in one byte"))?;
        }
        self.sort_by_offset = node.get_bool("sort-by-offset");
        self.end_at_4gb = node.get_bool("end-at-4gb");
        let skip = node.get_int("skip-at-start")?;
        if self.end_at_4gb {
            let size = node
                .get_int("size")?
                .ok_or_else(|| invalid(node, "Section size must be provided when using end-at-4gb"))?;
            if skip.is_some() {
                return Err(invalid(node, "Provide either 'end-at-4gb' or 'skip-at-start'"));
            }
            if size > FOUR_GB {
                return Err(invalid(node, "Section size must not exceed 4GB when using end-at-4gb"));
            }
            self.skip_at_start = FOUR_GB - size;
        } else {
            self.skip_at_start = skip.unwrap_or(0);
        }
        self.name_prefix = node.get_str("name-prefix")?.unwrap_or_default();

        for child in &node.children {
            if ANNOTATION_NODES.contains(&base_name(&child.name)) {
                continue;
            }
            self.entries.push(Entry::create(child, &self.name_prefix, ctx)?);
        }
        Ok(())
    }

    fn children(&self) -> &[Entry] {
        &self.entries
    }

    fn children_mut(&mut self) -> &mut [Entry] {
        &mut self.entries
    }

    fn as_section(&self) -> Option<&Section> {
        Some(self)
    }

    fn as_section_mut(&mut self) -> Option<&mut Section> {
        Some(self)
    }
}

impl Section {
    /// Assembles the section contents from its placed children.
    ///
    /// Gaps between children take the pad byte; padding inside a child's
    /// region is zero.
    pub fn build_contents(&self, size: u64) -> Vec<u8> {
        let size = size as usize;
        let mut out = vec![self.pad_byte; size];
        for entry in &self.entries {
            let (Some(offset), Some(entry_size)) = (entry.offset, entry.size) else {
                continue;
            };
            let start = (offset.saturating_sub(self.skip_at_start) as usize).min(size);
            let end = (start + entry_size as usize).min(size);
            out[start..end].fill(0);
            let data_start = (start + entry.pad_before as usize).min(end);
            let n = entry.data.len().min(end - data_start);
            out[data_start..data_start + n].copy_from_slice(&entry.data[..n]);
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn section(text: &str) -> Result<Entry> {
        let root = Node::parse(text).unwrap();
        Entry::create(&root.children[0], "", &BuildContext::new())
    }

    #[test]
    fn end_at_4gb_needs_size() {
        let err = section("[binman.section]\nend-at-4gb = true\n").unwrap_err();
        assert_eq!(
            err.to_string(),
            "Node '/binman/section': Section size must be provided when using end-at-4gb"
        );
        let err = section("[binman.section]\nend-at-4gb = true\nsize = 0x100\nskip-at-start = 0x10\n").unwrap_err();
        assert!(err.to_string().contains("Provide either 'end-at-4gb' or 'skip-at-start'"));

        let entry = section("[binman.section]\nend-at-4gb = true\nsize = 0x100\n").unwrap();
        let section = entry.kind().as_section().unwrap();
        assert_eq!(section.skip_at_start, 0xffff_ff00);
    }

    #[test]
    fn name_prefix_and_hash_nodes() {
        let entry = section(
            r#"
            [binman.section]
            name-prefix = "ro-"
            [binman.section.u-boot]
            [binman.section.hash]
            algo = "sha256"
            "#,
        )
        .unwrap();
        let names: Vec<_> = entry.children().iter().map(|c| c.name.as_str()).collect();
        assert_eq!(names, ["ro-u-boot"]);
        assert_eq!(entry.children()[0].path, "/binman/section/u-boot");
        assert!(entry.hash.is_some());
    }
}
