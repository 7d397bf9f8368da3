//! Symbol patching.
//!
//! Firmware stages find the other parts of the image through symbols named
//! `_binman_<entry>_prop_<property>`. Once the image is packed, the value of
//! each such symbol is written into the stage's payload at the symbol's
//! position relative to `__image_copy_start`, the first byte of the payload.
//!
//! Patches are collected against an immutable snapshot first and only then
//! written, so lookups never alias the bytes being modified.

use std::collections::BTreeMap;

use crate::elf::ElfSymbol;
use crate::entry::{EntryContext, EntryView};
use crate::error::{Result, SymbolError};
use crate::utils::symbol_to_entry_name;

/// Address of the first byte of the payload in the ELF file.
pub const ANCHOR_SYMBOL: &str = "__image_copy_start";

/// Prefix of symbols that are filled in with image positions.
pub const SYMBOL_PREFIX: &str = "_binman";

/// Resolves `_binman_*` symbol names to values.
pub trait SymbolLookup {
    /// Returns the value for `name`, or `None` if it cannot be known.
    ///
    /// A missing target is an error unless `weak` is set. `base_addr` is added
    /// to `image_pos` values.
    fn lookup_symbol(&self, name: &str, weak: bool, context: &str, base_addr: u64) -> Result<Option<u64>>;
}

/// Splits `_binman_u_boot_prop_offset` into (`u-boot`, `offset`).
pub fn parse_symbol_name(name: &str, context: &str) -> Result<(String, String)> {
    let invalid = || SymbolError::InvalidName {
        context: context.to_string(),
        name: name.to_string(),
    };
    let rest = name
        .strip_prefix(SYMBOL_PREFIX)
        .and_then(|r| r.strip_prefix('_'))
        .ok_or_else(invalid)?;
    let (entry, prop) = rest.rsplit_once("_prop_").ok_or_else(invalid)?;
    let is_word = |s: &str| !s.is_empty() && s.chars().all(|c| c.is_ascii_alphanumeric() || c == '_');
    if !is_word(entry) || !is_word(prop) {
        return Err(invalid().into());
    }
    Ok((symbol_to_entry_name(entry), prop.to_string()))
}

/// Symbol lookup over a snapshot: siblings in `section` first, then the whole image.
pub struct SectionSymbols<'a> {
    pub image: &'a EntryView,
    pub section: &'a EntryView,
}

impl SectionSymbols<'_> {
    fn find(&self, entry_name: &str) -> Option<&EntryView> {
        if let Some(root) = entry_name.strip_suffix("-any") {
            return self.section.children.iter().find(|c| {
                c.name
                    .strip_prefix(root)
                    .is_some_and(|rest| matches!(rest, "" | "-img" | "-nodtb"))
            });
        }
        self.section
            .child(entry_name)
            .or_else(|| self.image.find_name(entry_name))
    }
}

impl SymbolLookup for SectionSymbols<'_> {
    fn lookup_symbol(&self, name: &str, weak: bool, context: &str, base_addr: u64) -> Result<Option<u64>> {
        let (entry_name, prop) = parse_symbol_name(name, context)?;
        let Some(entry) = self.find(&entry_name) else {
            if weak {
                return Ok(None);
            }
            return Err(SymbolError::UnknownEntry {
                context: context.to_string(),
                entry: entry_name,
                available: self.section.children.iter().map(|c| c.name.clone()).collect(),
            }
            .into());
        };
        match prop.as_str() {
            "offset" => Ok(entry.offset),
            "size" => Ok(entry.size),
            "image_pos" => Ok(entry.image_pos.map(|pos| base_addr + pos)),
            _ => Err(SymbolError::UnknownProperty {
                context: context.to_string(),
                name: name.to_string(),
                prop,
            }
            .into()),
        }
    }
}

struct Patch {
    offset: usize,
    width: usize,
    value: Option<u64>,
}

/// Writes the value of every `_binman` symbol into `data`.
///
/// Unresolved values are written as all-ones. Returns the number of symbols
/// written.
pub fn lookup_and_write_symbols(
    symbols: &BTreeMap<String, ElfSymbol>,
    context: &str,
    data: &mut [u8],
    lookup: &dyn SymbolLookup,
) -> Result<usize> {
    let wanted: Vec<&ElfSymbol> = symbols
        .values()
        .filter(|s| s.name.starts_with(SYMBOL_PREFIX))
        .collect();
    if wanted.is_empty() {
        return Ok(0);
    }
    let anchor = symbols
        .get(ANCHOR_SYMBOL)
        .ok_or_else(|| SymbolError::MissingAnchorSymbol {
            context: context.to_string(),
            anchor: ANCHOR_SYMBOL.to_string(),
        })?;

    let mut patches = Vec::with_capacity(wanted.len());
    for sym in wanted {
        let width = match sym.size {
            4 | 8 => sym.size as usize,
            size => {
                return Err(SymbolError::BadSymbolSize {
                    context: context.to_string(),
                    name: sym.name.clone(),
                    size,
                }
                .into())
            }
        };
        let offset = sym.address.wrapping_sub(anchor.address);
        if sym.address < anchor.address || offset + width as u64 > data.len() as u64 {
            return Err(SymbolError::OutsideEntry {
                context: context.to_string(),
                name: sym.name.clone(),
                offset,
                size: width as u64,
                contents_size: data.len() as u64,
            }
            .into());
        }
        let value = lookup.lookup_symbol(&sym.name, sym.weak, context, anchor.address)?;
        tracing::debug!("{context}: writing {} = {value:?} at {offset:#x}", sym.name);
        patches.push(Patch {
            offset: offset as usize,
            width,
            value,
        });
    }

    for patch in &patches {
        let slot = &mut data[patch.offset..patch.offset + patch.width];
        match (patch.value, patch.width) {
            (None, _) => slot.fill(0xff),
            (Some(value), 4) => slot.copy_from_slice(&(value as u32).to_le_bytes()),
            (Some(value), _) => slot.copy_from_slice(&value.to_le_bytes()),
        }
    }
    Ok(patches.len())
}

/// Returns a copy of `raw` with the symbols of the entry in `cx` filled in.
pub fn write_entry_symbols(
    symbols: &BTreeMap<String, ElfSymbol>,
    raw: &[u8],
    cx: &EntryContext<'_>,
) -> Result<Vec<u8>> {
    let mut data = raw.to_vec();
    let lookup = SectionSymbols {
        image: cx.image,
        section: cx.parent.unwrap_or(cx.image),
    };
    lookup_and_write_symbols(symbols, cx.path(), &mut data, &lookup)?;
    Ok(data)
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Fixed(Option<u64>);

    impl SymbolLookup for Fixed {
        fn lookup_symbol(&self, name: &str, _weak: bool, context: &str, _base: u64) -> Result<Option<u64>> {
            parse_symbol_name(name, context)?;
            Ok(self.0)
        }
    }

    fn sym(name: &str, address: u64, size: u64, weak: bool) -> (String, ElfSymbol) {
        (
            name.to_string(),
            ElfSymbol {
                name: name.to_string(),
                address,
                size,
                weak,
                section: ".binman_sym_table".to_string(),
            },
        )
    }

    #[test]
    fn parses_names() {
        assert_eq!(
            parse_symbol_name("_binman_u_boot_spl_prop_image_pos", "t").unwrap(),
            ("u-boot-spl".to_string(), "image_pos".to_string())
        );
        let err = parse_symbol_name("_binman_u_boot_offset", "t").unwrap_err();
        assert_eq!(err.to_string(), "t: Symbol '_binman_u_boot_offset' has invalid format");
    }

    #[test]
    fn writes_little_endian_values() {
        let symbols: BTreeMap<_, _> = [
            sym(ANCHOR_SYMBOL, 0x100, 0, false),
            sym("_binman_u_boot_prop_offset", 0x104, 4, false),
            sym("_binman_u_boot_prop_size", 0x108, 8, false),
        ]
        .into_iter()
        .collect();
        let mut data = vec![0u8; 16];
        let n = lookup_and_write_symbols(&symbols, "test", &mut data, &Fixed(Some(0x1234))).unwrap();
        assert_eq!(n, 2);
        assert_eq!(&data[4..8], &[0x34, 0x12, 0, 0]);
        assert_eq!(&data[8..16], &[0x34, 0x12, 0, 0, 0, 0, 0, 0]);
    }

    #[test]
    fn unresolved_weak_symbols_get_all_ones() {
        let symbols: BTreeMap<_, _> = [
            sym(ANCHOR_SYMBOL, 0, 0, false),
            sym("_binman_u_boot_prop_offset", 0, 8, true),
            sym("_binman_u_boot_prop_image_pos", 8, 8, true),
        ]
        .into_iter()
        .collect();
        let mut data = vec![0u8; 16];
        lookup_and_write_symbols(&symbols, "test", &mut data, &Fixed(None)).unwrap();
        assert_eq!(data, vec![0xff; 16]);
    }

    #[test]
    fn bad_size_outside_and_missing_anchor() {
        let symbols: BTreeMap<_, _> = [
            sym(ANCHOR_SYMBOL, 0, 0, false),
            sym("_binman_u_boot_prop_offset", 0, 1, false),
        ]
        .into_iter()
        .collect();
        let err = lookup_and_write_symbols(&symbols, "test", &mut [0u8; 8], &Fixed(Some(0))).unwrap_err();
        assert!(err.to_string().ends_with("has size 1: only 4 and 8 are supported"));

        let symbols: BTreeMap<_, _> = [
            sym(ANCHOR_SYMBOL, 0, 0, false),
            sym("_binman_u_boot_prop_offset", 4, 8, false),
        ]
        .into_iter()
        .collect();
        let err = lookup_and_write_symbols(&symbols, "test", &mut [0u8; 10], &Fixed(Some(0))).unwrap_err();
        assert!(err.to_string().ends_with("has offset 0x4 (size 0x8) but the contents size is 0xa"));

        let symbols: BTreeMap<_, _> = [sym("_binman_u_boot_prop_offset", 0, 4, false)].into_iter().collect();
        let err = lookup_and_write_symbols(&symbols, "test", &mut [0u8; 4], &Fixed(Some(0))).unwrap_err();
        assert!(err.to_string().contains("Cannot locate anchor symbol '__image_copy_start'"));
    }

    #[test]
    fn no_binman_symbols_is_a_no_op() {
        let symbols: BTreeMap<_, _> = [sym("main", 0, 4, false)].into_iter().collect();
        let mut data = vec![7u8; 4];
        assert_eq!(lookup_and_write_symbols(&symbols, "test", &mut data, &Fixed(None)).unwrap(), 0);
        assert_eq!(data, vec![7u8; 4]);
    }
}
