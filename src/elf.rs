//! ELF access.
//!
//! Images embed some payloads that come with an ELF file: the ELF supplies
//! the symbol table used for symbol patching, and for `elf` entries also the
//! loadable contents. This module only reads ELF files; [`make_elf`] builds
//! small executables for tests and tools.

use std::collections::BTreeMap;

use object::endian::{U16, U32, U64};
use object::pod::bytes_of;
use object::read::{Object, ObjectSection, ObjectSegment, ObjectSymbol};
use object::Endianness;

use crate::error::{Result, SymbolError};
use crate::utils::align_up;

/// A defined symbol from an ELF file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ElfSymbol {
    pub name: String,
    pub address: u64,
    pub size: u64,
    pub weak: bool,
    /// Name of the section holding the symbol.
    pub section: String,
}

/// Loadable contents of an ELF file, flattened from the lowest load address.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ElfInfo {
    pub data: Vec<u8>,
    pub load: u64,
    pub entry: u64,
    pub memsize: u64,
}

fn parse<'a>(context: &str, data: &'a [u8]) -> Result<object::File<'a>> {
    object::File::parse(data).map_err(|e| {
        SymbolError::Elf {
            context: context.to_string(),
            message: e.to_string(),
        }
        .into()
    })
}

/// Reads all defined, named symbols from an ELF file.
pub fn read_symbols(context: &str, data: &[u8]) -> Result<BTreeMap<String, ElfSymbol>> {
    let obj = parse(context, data)?;
    let mut symbols = BTreeMap::new();
    for sym in obj.symbols() {
        if sym.is_undefined() {
            continue;
        }
        let Ok(name) = sym.name() else { continue };
        if name.is_empty() {
            continue;
        }
        let section = sym
            .section_index()
            .and_then(|idx| obj.section_by_index(idx).ok())
            .and_then(|s| s.name().ok().map(str::to_string))
            .unwrap_or_default();
        symbols.insert(
            name.to_string(),
            ElfSymbol {
                name: name.to_string(),
                address: sym.address(),
                size: sym.size(),
                weak: sym.is_weak(),
                section,
            },
        );
    }
    tracing::trace!("{context}: {} ELF symbols", symbols.len());
    Ok(symbols)
}

/// Flattens the loadable segments of an ELF file into one buffer.
///
/// Gaps between segments are zero-filled. Segments without file data only
/// count towards `memsize`.
pub fn decode_elf(context: &str, data: &[u8]) -> Result<ElfInfo> {
    let obj = parse(context, data)?;
    let mut segments = Vec::new();
    for seg in obj.segments() {
        let bytes = seg.data().map_err(|e| SymbolError::Elf {
            context: context.to_string(),
            message: e.to_string(),
        })?;
        segments.push((seg.address(), seg.size(), bytes));
    }
    let Some(load) = segments.iter().map(|(addr, _, _)| *addr).min() else {
        return Err(SymbolError::Elf {
            context: context.to_string(),
            message: "no loadable segments".to_string(),
        }
        .into());
    };
    let file_end = segments
        .iter()
        .map(|(addr, _, bytes)| addr + bytes.len() as u64)
        .max()
        .unwrap_or(load);
    let mem_end = segments
        .iter()
        .map(|(addr, size, _)| addr + size)
        .max()
        .unwrap_or(load);

    let mut out = vec![0u8; (file_end - load) as usize];
    for (addr, _, bytes) in &segments {
        let start = (addr - load) as usize;
        out[start..start + bytes.len()].copy_from_slice(bytes);
    }
    Ok(ElfInfo {
        data: out,
        load,
        entry: obj.entry(),
        memsize: mem_end - load,
    })
}

fn u16(v: u16) -> U16<Endianness> {
    U16::new(Endianness::Little, v)
}
fn u32(v: u32) -> U32<Endianness> {
    U32::new(Endianness::Little, v)
}
fn u64(v: u64) -> U64<Endianness> {
    U64::new(Endianness::Little, v)
}

const EHDR_SIZE: u64 = 64;
const PHDR_SIZE: u64 = 56;
const SHDR_SIZE: u64 = 64;
const SYM_SIZE: u64 = 24;
const TEXT_OFFSET: u64 = 0x100;

fn section_header(
    name: u32,
    sh_type: u32,
    flags: u32,
    addr: u64,
    offset: u64,
    size: u64,
    link: u32,
    info: u32,
    entsize: u64,
) -> object::elf::SectionHeader64<Endianness> {
    object::elf::SectionHeader64 {
        sh_name: u32(name),
        sh_type: u32(sh_type),
        sh_flags: u64(flags as u64),
        sh_addr: u64(addr),
        sh_offset: u64(offset),
        sh_size: u64(size),
        sh_link: u32(link),
        sh_info: u32(info),
        sh_addralign: u64(if sh_type == object::elf::SHT_NULL { 0 } else { 1 }),
        sh_entsize: u64(entsize),
    }
}

/// Builds a little-endian x86_64 executable with one loadable segment.
///
/// `text` is loaded at `load`, `data` directly after it (8-byte aligned). Each
/// symbol is placed in `.text` or `.data` according to its address.
pub fn make_elf(text: &[u8], data: &[u8], load: u64, symbols: &[ElfSymbol]) -> Vec<u8> {
    let data_offset = align_up(TEXT_OFFSET + text.len() as u64, 8);
    let data_addr = load + (data_offset - TEXT_OFFSET);
    let load_end = data_offset + data.len() as u64;

    let mut strtab = vec![0u8];
    let mut symtab = vec![0u8; SYM_SIZE as usize];
    for sym in symbols {
        let name = strtab.len() as u32;
        strtab.extend_from_slice(sym.name.as_bytes());
        strtab.push(0);
        let bind = if sym.weak { object::elf::STB_WEAK } else { object::elf::STB_GLOBAL };
        let shndx = if sym.address >= data_addr && !data.is_empty() { 2 } else { 1 };
        let entry = object::elf::Sym64::<Endianness> {
            st_name: u32(name),
            st_info: (bind << 4) | object::elf::STT_OBJECT,
            st_other: object::elf::STV_DEFAULT,
            st_shndx: u16(shndx),
            st_value: u64(sym.address),
            st_size: u64(sym.size),
        };
        symtab.extend_from_slice(bytes_of(&entry));
    }

    let mut shstrtab = vec![0u8];
    let mut names = Vec::new();
    for name in [".text", ".data", ".symtab", ".strtab", ".shstrtab"] {
        names.push(shstrtab.len() as u32);
        shstrtab.extend_from_slice(name.as_bytes());
        shstrtab.push(0);
    }

    let symtab_offset = align_up(load_end, 8);
    let strtab_offset = symtab_offset + symtab.len() as u64;
    let shstrtab_offset = strtab_offset + strtab.len() as u64;
    let shoff = align_up(shstrtab_offset + shstrtab.len() as u64, 8);

    let mut buffer = Vec::new();
    let file_header = object::elf::FileHeader64::<Endianness> {
        e_ident: object::elf::Ident {
            magic: object::elf::ELFMAG,
            class: object::elf::ELFCLASS64,
            data: object::elf::ELFDATA2LSB,
            version: object::elf::EV_CURRENT,
            os_abi: object::elf::ELFOSABI_SYSV,
            abi_version: 0,
            padding: [0; 7],
        },
        e_type: u16(object::elf::ET_EXEC),
        e_machine: u16(object::elf::EM_X86_64),
        e_version: u32(object::elf::EV_CURRENT as u32),
        e_entry: u64(load),
        e_phoff: u64(EHDR_SIZE),
        e_shoff: u64(shoff),
        e_flags: u32(0),
        e_ehsize: u16(EHDR_SIZE as u16),
        e_phentsize: u16(PHDR_SIZE as u16),
        e_phnum: u16(1),
        e_shentsize: u16(SHDR_SIZE as u16),
        e_shnum: u16(6),
        e_shstrndx: u16(5),
    };
    buffer.extend_from_slice(bytes_of(&file_header));

    let prog_header = object::elf::ProgramHeader64::<Endianness> {
        p_type: u32(object::elf::PT_LOAD),
        p_flags: u32(object::elf::PF_R | object::elf::PF_W | object::elf::PF_X),
        p_offset: u64(TEXT_OFFSET),
        p_vaddr: u64(load),
        p_paddr: u64(load),
        p_filesz: u64(load_end - TEXT_OFFSET),
        p_memsz: u64(load_end - TEXT_OFFSET),
        p_align: u64(4),
    };
    buffer.extend_from_slice(bytes_of(&prog_header));

    buffer.resize(TEXT_OFFSET as usize, 0);
    buffer.extend_from_slice(text);
    buffer.resize(data_offset as usize, 0);
    buffer.extend_from_slice(data);
    buffer.resize(symtab_offset as usize, 0);
    buffer.extend_from_slice(&symtab);
    buffer.extend_from_slice(&strtab);
    buffer.extend_from_slice(&shstrtab);
    buffer.resize(shoff as usize, 0);

    let alloc_exec = object::elf::SHF_ALLOC | object::elf::SHF_EXECINSTR;
    let alloc_write = object::elf::SHF_ALLOC | object::elf::SHF_WRITE;
    let headers = [
        section_header(0, object::elf::SHT_NULL, 0, 0, 0, 0, 0, 0, 0),
        section_header(
            names[0],
            object::elf::SHT_PROGBITS,
            alloc_exec,
            load,
            TEXT_OFFSET,
            text.len() as u64,
            0,
            0,
            0,
        ),
        section_header(
            names[1],
            object::elf::SHT_PROGBITS,
            alloc_write,
            data_addr,
            data_offset,
            data.len() as u64,
            0,
            0,
            0,
        ),
        section_header(
            names[2],
            object::elf::SHT_SYMTAB,
            0,
            0,
            symtab_offset,
            symtab.len() as u64,
            4,
            1,
            SYM_SIZE,
        ),
        section_header(
            names[3],
            object::elf::SHT_STRTAB,
            0,
            0,
            strtab_offset,
            strtab.len() as u64,
            0,
            0,
            0,
        ),
        section_header(
            names[4],
            object::elf::SHT_STRTAB,
            0,
            0,
            shstrtab_offset,
            shstrtab.len() as u64,
            0,
            0,
            0,
        ),
    ];
    for header in &headers {
        buffer.extend_from_slice(bytes_of(header));
    }
    buffer
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sym(name: &str, address: u64, size: u64, weak: bool) -> ElfSymbol {
        ElfSymbol {
            name: name.to_string(),
            address,
            size,
            weak,
            section: String::new(),
        }
    }

    #[test]
    fn symbols_round_trip_through_make_elf() {
        let elf = make_elf(
            &[0x90; 16],
            &[0u8; 8],
            0x1000,
            &[
                sym("__image_copy_start", 0x1000, 0, false),
                sym("_binman_u_boot_prop_offset", 0x1010, 8, true),
            ],
        );
        let symbols = read_symbols("test", &elf).unwrap();
        let anchor = &symbols["__image_copy_start"];
        assert_eq!(anchor.address, 0x1000);
        assert!(!anchor.weak);
        assert_eq!(anchor.section, ".text");
        let binman = &symbols["_binman_u_boot_prop_offset"];
        assert_eq!((binman.address, binman.size, binman.weak), (0x1010, 8, true));
        assert_eq!(binman.section, ".data");
    }

    #[test]
    fn decode_flattens_loadable_contents() {
        let elf = make_elf(b"code", b"data", 0x2000, &[]);
        let info = decode_elf("test", &elf).unwrap();
        assert_eq!(info.load, 0x2000);
        assert_eq!(info.entry, 0x2000);
        assert_eq!(info.data, b"code\0\0\0\0data");
        assert_eq!(info.memsize, 12);
    }

    #[test]
    fn garbage_is_reported() {
        let err = read_symbols("/binman/u-boot-spl", b"not an elf").unwrap_err();
        assert!(err.to_string().starts_with("/binman/u-boot-spl: Cannot read ELF file"));
    }
}
