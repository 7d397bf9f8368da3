//! `elf` entries: the loadable contents of an ELF file.

use std::collections::BTreeMap;

use crate::elf::{self, ElfSymbol};
use crate::entry::{EntryContext, EntryType};
use crate::error::{ConfigError, Result};
use crate::node::Node;
use crate::state::BuildContext;
use crate::symbol::write_entry_symbols;

#[derive(Debug, Default)]
pub struct ElfBlob {
    filename: Option<String>,
    raw: Vec<u8>,
    symbols: BTreeMap<String, ElfSymbol>,
}

impl EntryType for ElfBlob {
    fn read_node(&mut self, node: &Node, ctx: &BuildContext) -> Result<()> {
        self.filename = node.get_str("filename")?;
        if self.filename.is_none() && !ctx.reading_back {
            return Err(ConfigError::MissingRequired {
                path: node.path.clone(),
                names: vec!["filename".to_string()],
            }
            .into());
        }
        Ok(())
    }

    fn obtain_contents(&mut self, cx: &EntryContext<'_>) -> Result<Option<Vec<u8>>> {
        let Some(filename) = &self.filename else {
            return Ok(Some(cx.data.to_vec()));
        };
        let file = cx.build.read_input(cx.path(), filename)?;
        let info = elf::decode_elf(cx.path(), &file)?;
        tracing::debug!(
            "{}: load {:#x} entry {:#x}, {:#x} bytes",
            cx.path(),
            info.load,
            info.entry,
            info.data.len()
        );
        self.raw = info.data;
        self.symbols = elf::read_symbols(cx.path(), &file)?;
        write_entry_symbols(&self.symbols, &self.raw, cx).map(Some)
    }

    fn process_contents(&mut self, cx: &EntryContext<'_>) -> Result<Option<Vec<u8>>> {
        if self.symbols.is_empty() {
            return Ok(None);
        }
        write_entry_symbols(&self.symbols, &self.raw, cx).map(Some)
    }

    fn default_filename(&self) -> Option<&str> {
        self.filename.as_deref()
    }
}
