//! `cbfs` entries: a Coreboot File System holding the child entries as files.
//!
//! Children are ordinary entries. Each one becomes a CBFS file whose name,
//! type, compression and placement come from its `cbfs-*` properties. The
//! CBFS has a fixed size; once it is built each child's offset and size
//! describe where its stored data landed.

use crate::compress::Compression;
use crate::elf::decode_elf;
use crate::entry::{power_of_two, Entry, EntryContext, EntryType};
use crate::error::{ConfigError, Result};
use crate::format::cbfs::{compression_code, Arch, CbfsFile, CbfsReader, CbfsWriter, FileType};
use crate::node::Node;
use crate::state::BuildContext;

/// How one child is stored.
#[derive(Debug, Clone)]
struct FileSettings {
    name: String,
    ftype: FileType,
    compress: Compression,
    offset: Option<u64>,
    align: Option<u64>,
    /// Stored bytes of a stage read back from an image.
    stored: Option<Vec<u8>>,
}

#[derive(Debug)]
pub struct Cbfs {
    pub entries: Vec<Entry>,
    settings: Vec<FileSettings>,
    size: u64,
    arch: Arch,
}

impl Default for Cbfs {
    fn default() -> Self {
        Cbfs {
            entries: Vec::new(),
            settings: Vec::new(),
            size: 0,
            arch: Arch::X86,
        }
    }
}

fn invalid(path: &str, message: String) -> crate::error::Error {
    ConfigError::Invalid {
        path: path.to_string(),
        message,
    }
    .into()
}

fn read_settings(entry: &Entry) -> Result<FileSettings> {
    let node = &entry.node;
    let name = node.get_str("cbfs-name")?.unwrap_or_else(|| entry.name.clone());
    let ftype = match node.get_str("cbfs-type")? {
        None => FileType::Raw,
        Some(t) => FileType::from_name(&t).ok_or_else(|| invalid(&node.path, format!("Unknown cbfs-type '{t}'")))?,
    };
    let compress = match node.get_str("cbfs-compress")? {
        None => Compression::None,
        Some(c) => Compression::from_name(&node.path, &c)
            .ok()
            .filter(|algo| compression_code(*algo).is_some())
            .ok_or_else(|| invalid(&node.path, format!("Invalid compression in '{name}': '{c}'")))?,
    };
    Ok(FileSettings {
        name,
        ftype,
        compress,
        offset: node.get_int("cbfs-offset")?,
        align: power_of_two(node, "cbfs-align", "CBFS alignment")?,
        stored: None,
    })
}

impl Cbfs {
    /// Builds the CBFS from the children's current contents and records
    /// where each child ended up.
    fn build(&mut self, path: &str) -> Result<Vec<u8>> {
        let mut writer = CbfsWriter::new(self.size, self.arch);
        for (entry, settings) in self.entries.iter().zip(&self.settings) {
            let mut file = match (settings.ftype, &settings.stored) {
                (FileType::Stage, Some(stored)) => CbfsFile::encoded_stage(&settings.name, stored.clone()),
                (FileType::Stage, None) => {
                    CbfsFile::stage(&settings.name, decode_elf(&entry.path, &entry.data)?, settings.compress)
                }
                _ => CbfsFile::raw(&settings.name, entry.data.clone(), settings.compress),
            };
            file.cbfs_offset = settings.offset;
            file.align = settings.align;
            writer.add_file(file);
        }
        let (data, placed) = writer.get_data(path)?;
        for (entry, file) in self.entries.iter_mut().zip(placed) {
            entry.offset = Some(file.data_offset);
            entry.size = Some(file.stored_len);
            if file.uncomp_len.is_some() {
                entry.uncomp_size = file.uncomp_len;
            }
        }
        Ok(data)
    }
}

impl EntryType for Cbfs {
    fn read_node(&mut self, node: &Node, ctx: &BuildContext) -> Result<()> {
        self.size = match node.get_int("size")? {
            Some(size) => size,
            None if ctx.reading_back => 0,
            None => return Err(invalid(&node.path, "'cbfs' entry must have a size property".to_string())),
        };
        if let Some(arch) = node.get_str("cbfs-arch")? {
            self.arch = Arch::from_name(&arch).ok_or_else(|| invalid(&node.path, format!("Invalid architecture '{arch}'")))?;
        }
        for child in &node.children {
            if child.name == "hash" {
                continue;
            }
            let entry = Entry::create(child, "", ctx)?;
            self.settings.push(read_settings(&entry)?);
            self.entries.push(entry);
        }
        Ok(())
    }

    fn obtain_contents(&mut self, cx: &EntryContext<'_>) -> Result<Option<Vec<u8>>> {
        self.build(cx.path()).map(Some)
    }

    fn process_contents(&mut self, cx: &EntryContext<'_>) -> Result<Option<Vec<u8>>> {
        self.build(cx.path()).map(Some)
    }

    fn children(&self) -> &[Entry] {
        &self.entries
    }

    fn children_mut(&mut self) -> &mut [Entry] {
        &mut self.entries
    }

    /// Replaces the children's stored bytes with the uncompressed file data.
    /// Stages keep their stored form so that they can be written back as-is.
    fn load_children(&mut self, path: &str, data: &[u8]) -> Result<()> {
        let reader = CbfsReader::read(path, data)?;
        for (entry, settings) in self.entries.iter_mut().zip(&mut self.settings) {
            let Some(file) = reader.files.get(&settings.name) else {
                continue;
            };
            if file.ftype == FileType::Stage {
                settings.stored = Some(file.stored.clone());
            } else {
                entry.data = file.data.clone();
                entry.contents_size = entry.data.len() as u64;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn create(text: &str) -> Result<Entry> {
        Entry::create(&Node::parse(text).unwrap().children[0], "", &BuildContext::new())
    }

    #[test]
    fn settings_are_checked() {
        let err = create("[binman.cbfs]\n").unwrap_err();
        assert_eq!(err.to_string(), "Node '/binman/cbfs': 'cbfs' entry must have a size property");

        let err = create("[binman.cbfs]\nsize = 0x100\ncbfs-arch = \"bad-arch\"\n").unwrap_err();
        assert!(err.to_string().contains("Invalid architecture 'bad-arch'"));

        let err = create("[binman.cbfs]\nsize = 0x100\n[binman.cbfs.u-boot]\ncbfs-type = \"badtype\"\n").unwrap_err();
        assert!(err.to_string().contains("Unknown cbfs-type 'badtype'"));

        let err = create("[binman.cbfs]\nsize = 0x100\n[binman.cbfs.u-boot]\ncbfs-compress = \"gzip\"\n").unwrap_err();
        assert!(err.to_string().contains("Invalid compression in 'u-boot': 'gzip'"));

        let err = create("[binman.cbfs]\nsize = 0x100\n[binman.cbfs.u-boot]\ncbfs-align = 3\n").unwrap_err();
        assert_eq!(
            err.to_string(),
            "Node '/binman/cbfs/u-boot': CBFS alignment 3 must be a power of two"
        );
    }
}
