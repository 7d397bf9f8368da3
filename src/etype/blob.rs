//! Entries read from files: plain blobs, firmware stages and device trees.

use std::collections::BTreeMap;

use crate::elf::{self, ElfSymbol};
use crate::entry::{get_entry_args_or_props, ArgType, EntryArg, EntryContext, EntryType};
use crate::error::{ConfigError, Error, Result};
use crate::fdt::DeviceTree;
use crate::format::fdtmap::annotate_fdt;
use crate::node::Node;
use crate::state::BuildContext;
use crate::symbol::write_entry_symbols;
use crate::utils::base_name;

/// A file copied into the image, optionally with symbols patched in from a
/// matching ELF file.
#[derive(Debug, Default)]
pub struct Blob {
    default_filename: Option<&'static str>,
    default_elf: Option<&'static str>,
    pub filename: Option<String>,
    elf_filename: Option<String>,
    raw: Vec<u8>,
    symbols: BTreeMap<String, ElfSymbol>,
}

impl Blob {
    pub fn new(default_filename: Option<&'static str>) -> Self {
        Blob {
            default_filename,
            ..Default::default()
        }
    }

    /// A stage whose ELF file supplies symbols to fill in.
    pub fn with_symbols(default_filename: &'static str, default_elf: &'static str) -> Self {
        Blob {
            default_filename: Some(default_filename),
            default_elf: Some(default_elf),
            ..Default::default()
        }
    }

    fn patched(&self, cx: &EntryContext<'_>) -> Result<Vec<u8>> {
        if self.symbols.is_empty() {
            return Ok(self.raw.clone());
        }
        write_entry_symbols(&self.symbols, &self.raw, cx)
    }
}

impl EntryType for Blob {
    fn read_node(&mut self, node: &Node, ctx: &BuildContext) -> Result<()> {
        let etype = node.etype()?;
        let arg = format!("{}-path", base_name(&etype));
        self.filename = match node.get_str("filename")? {
            Some(name) => Some(name),
            None => ctx
                .entry_arg(&arg)
                .map(str::to_string)
                .or_else(|| self.default_filename.map(str::to_string)),
        };
        if self.filename.is_none() && !ctx.reading_back {
            return Err(ConfigError::MissingRequired {
                path: node.path.clone(),
                names: vec!["filename".to_string()],
            }
            .into());
        }
        self.elf_filename = node
            .get_str("elf-filename")?
            .or_else(|| self.default_elf.map(str::to_string));
        Ok(())
    }

    fn obtain_contents(&mut self, cx: &EntryContext<'_>) -> Result<Option<Vec<u8>>> {
        let Some(filename) = &self.filename else {
            return Ok(Some(cx.data.to_vec()));
        };
        self.raw = cx.build.read_input(cx.path(), filename)?;
        if let Some(path) = self.elf_filename.as_deref().and_then(|f| cx.build.input_path(f)) {
            let data = std::fs::read(&path).map_err(|e| Error::io(&path, e))?;
            self.symbols = elf::read_symbols(cx.path(), &data)?;
        }
        self.patched(cx).map(Some)
    }

    fn process_contents(&mut self, cx: &EntryContext<'_>) -> Result<Option<Vec<u8>>> {
        if self.symbols.is_empty() {
            return Ok(None);
        }
        self.patched(cx).map(Some)
    }

    fn default_filename(&self) -> Option<&str> {
        self.filename.as_deref().or(self.default_filename)
    }
}

/// A device tree blob. When the build updates device trees it carries the
/// positions of every entry.
#[derive(Debug, Default)]
pub struct BlobDtb {
    key: Option<&'static str>,
    default_filename: Option<&'static str>,
    /// Name under which the tree is known to the build, e.g. `u-boot-dtb`.
    pub fdt_name: String,
    filename: Option<String>,
    tree: Option<DeviceTree>,
}

impl BlobDtb {
    pub fn new(key: Option<&'static str>, default_filename: Option<&'static str>) -> Self {
        BlobDtb {
            key,
            default_filename,
            ..Default::default()
        }
    }

    fn annotated(&mut self, cx: &EntryContext<'_>) -> Option<Vec<u8>> {
        let tree = self.tree.as_mut()?;
        if cx.build.update_fdt {
            annotate_fdt(tree, cx.image);
        }
        Some(tree.to_bytes())
    }
}

impl EntryType for BlobDtb {
    fn read_node(&mut self, node: &Node, ctx: &BuildContext) -> Result<()> {
        self.fdt_name = match self.key {
            Some(key) => key.to_string(),
            None => node.get_str("fdt-name")?.unwrap_or_else(|| node.name.clone()),
        };
        let values = get_entry_args_or_props(node, ctx, &[EntryArg::new("filename", ArgType::Str)], false)?;
        self.filename = values[0]
            .as_ref()
            .and_then(|v| v.as_str())
            .map(str::to_string)
            .or_else(|| self.default_filename.map(str::to_string));
        Ok(())
    }

    fn obtain_contents(&mut self, cx: &EntryContext<'_>) -> Result<Option<Vec<u8>>> {
        let tree = match cx.build.fdts.get(&self.fdt_name) {
            Some(tree) => tree.clone(),
            None => {
                let filename = self.filename.as_deref().ok_or_else(|| ConfigError::MissingRequired {
                    path: cx.path().to_string(),
                    names: vec!["filename".to_string()],
                })?;
                DeviceTree::from_bytes(&cx.build.read_input(cx.path(), filename)?)?
            }
        };
        self.tree = Some(tree);
        Ok(self.annotated(cx))
    }

    fn process_contents(&mut self, cx: &EntryContext<'_>) -> Result<Option<Vec<u8>>> {
        if !cx.build.update_fdt {
            return Ok(None);
        }
        Ok(self.annotated(cx))
    }

    fn process_fdt(&mut self, cx: &EntryContext<'_>, updated: &mut Vec<(String, DeviceTree)>) -> Result<bool> {
        if cx.build.update_fdt {
            if let Some(tree) = &self.tree {
                updated.push((self.fdt_name.clone(), tree.clone()));
            }
        }
        Ok(true)
    }

    fn default_filename(&self) -> Option<&str> {
        self.filename.as_deref()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entry::Entry;

    fn create(text: &str, ctx: &BuildContext) -> Result<Entry> {
        Entry::create(&Node::parse(text).unwrap().children[0], "", ctx)
    }

    #[test]
    fn filename_sources() {
        let entry = create("[binman.u-boot]\n", &BuildContext::new()).unwrap();
        assert_eq!(entry.default_filename(), Some("u-boot.bin"));

        let mut ctx = BuildContext::new();
        ctx.set_entry_args(&["u-boot-path=build/u-boot.bin"]).unwrap();
        let entry = create("[binman.u-boot]\n", &ctx).unwrap();
        assert_eq!(entry.default_filename(), Some("build/u-boot.bin"));

        let entry = create("[binman.u-boot]\nfilename = \"other.bin\"\n", &ctx).unwrap();
        assert_eq!(entry.default_filename(), Some("other.bin"));
    }

    #[test]
    fn plain_blob_needs_a_filename() {
        let err = create("[binman.blob]\n", &BuildContext::new()).unwrap_err();
        assert_eq!(
            err.to_string(),
            "Node '/binman/blob': Missing required properties/entry args: filename"
        );
        assert!(create("[binman.blob]\n", &BuildContext::for_read_back()).is_ok());
    }

    #[test]
    fn dtb_names() {
        let entry = create("[binman.u-boot-spl-dtb]\n", &BuildContext::new()).unwrap();
        assert_eq!(entry.default_filename(), Some("spl/u-boot-spl.dtb"));
        let entry = create("[binman.dtb]\ntype = \"blob-dtb\"\nfilename = \"a.dtb\"\n", &BuildContext::new()).unwrap();
        assert_eq!(entry.default_filename(), Some("a.dtb"));
    }
}
