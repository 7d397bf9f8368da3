//! Coreboot File System (CBFS) encoding.
//!
//! A CBFS is a fixed-size region holding a sequence of files. Every file
//! starts on an `align` boundary (64 bytes by default) with a big-endian
//! header:
//!
//! | field       | size |
//! |-------------|------|
//! | magic       | 8 (`LARCHIVE`) |
//! | len         | 4, length of the stored data |
//! | type        | 4 |
//! | attr offset | 4, 0 when there are no attributes |
//! | data offset | 4, from the start of the header |
//!
//! followed by the NUL-terminated name padded to 16 bytes, optional
//! attributes and the data. Unused space is covered by files of type
//! `empty` filled with `0xff`. The 32-byte master header sits just before the
//! last four bytes of the region, which hold its position as a signed
//! little-endian offset from the end of the region.

use std::mem::size_of;

use indexmap::IndexMap;
use object::endian::{BigEndian, LittleEndian};
use object::pod::bytes_of;

use super::{be32, le32, le64, read_pod, Be32, Le32, Le64};
use crate::compress::{self, Compression};
use crate::elf::ElfInfo;
use crate::error::{Error, FormatError, Result};
use crate::utils::{align_up, from_fixed_str};

pub const FILE_MAGIC: &[u8; 8] = b"LARCHIVE";
pub const FILE_HEADER_LEN: u64 = size_of::<RawFileHeader>() as u64;
pub const FILENAME_ALIGN: u64 = 16;

pub const HEADER_MAGIC: u32 = 0x4f52_4243;
pub const HEADER_VERSION: u32 = 0x3131_3132;
pub const HEADER_LEN: u64 = size_of::<RawMasterHeader>() as u64;
pub const POINTER_LEN: u64 = size_of::<Le32>() as u64;
pub const DEFAULT_ALIGN: u64 = 64;

pub const ATTR_TAG_COMPRESSION: u32 = 0x4243_5a4c;
pub const ATTR_COMPRESSION_LEN: u64 = size_of::<RawCompressionAttr>() as u64;

pub const COMPRESS_NONE: u32 = 0;
pub const COMPRESS_LZMA: u32 = 1;

/// Length of the header written in front of a stage payload.
pub const STAGE_HEADER_LEN: u64 = size_of::<RawStageHeader>() as u64;

#[derive(Clone, Copy)]
#[repr(C)]
struct RawFileHeader {
    magic: [u8; 8],
    len: Be32,
    file_type: Be32,
    attr_offset: Be32,
    data_offset: Be32,
}

#[derive(Clone, Copy)]
#[repr(C)]
struct RawMasterHeader {
    magic: Be32,
    version: Be32,
    romsize: Be32,
    bootblocksize: Be32,
    align: Be32,
    offset: Be32,
    architecture: Be32,
    pad: Be32,
}

#[derive(Clone, Copy)]
#[repr(C)]
struct RawCompressionAttr {
    tag: Be32,
    len: Be32,
    compression: Be32,
    decompressed_size: Be32,
}

/// Stage payloads are little-endian, unlike the rest of the CBFS.
#[derive(Clone, Copy)]
#[repr(C)]
struct RawStageHeader {
    compression: Le32,
    entry: Le64,
    load: Le64,
    len: Le32,
    memlen: Le32,
}

impl_pod!(RawFileHeader, RawMasterHeader, RawCompressionAttr, RawStageHeader);

const _: () = assert!(FILE_HEADER_LEN == 24 && HEADER_LEN == 32 && STAGE_HEADER_LEN == 28);

fn put(out: &mut [u8], pos: usize, bytes: &[u8]) {
    out[pos..pos + bytes.len()].copy_from_slice(bytes);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileType {
    Stage,
    Raw,
    Empty,
}

impl FileType {
    pub fn from_name(name: &str) -> Option<FileType> {
        match name {
            "stage" => Some(FileType::Stage),
            "raw" => Some(FileType::Raw),
            _ => None,
        }
    }

    pub fn code(&self) -> u32 {
        match self {
            FileType::Stage => 0x10,
            FileType::Raw => 0x50,
            FileType::Empty => 0xffff_ffff,
        }
    }

    fn from_code(code: u32) -> Option<FileType> {
        match code {
            0x10 => Some(FileType::Stage),
            0x50 => Some(FileType::Raw),
            0xffff_ffff => Some(FileType::Empty),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Arch {
    X86,
    Arm,
    Arm64,
    Mips,
    Riscv,
    Ppc64,
}

impl Arch {
    pub fn from_name(name: &str) -> Option<Arch> {
        match name {
            "x86" => Some(Arch::X86),
            "arm" => Some(Arch::Arm),
            "arm64" => Some(Arch::Arm64),
            "mips" => Some(Arch::Mips),
            "riscv" => Some(Arch::Riscv),
            "ppc64" => Some(Arch::Ppc64),
            _ => None,
        }
    }

    pub fn code(&self) -> u32 {
        match self {
            Arch::X86 => 0x0000_0001,
            Arch::Arm => 0x0000_0010,
            Arch::Arm64 => 0x0000_aa64,
            Arch::Mips => 0x0000_0100,
            Arch::Riscv => 0xc001_d0de,
            Arch::Ppc64 => 0x4075_70ff,
        }
    }
}

/// Maps an entry compression setting to a CBFS compression code.
pub fn compression_code(algo: Compression) -> Option<u32> {
    match algo {
        Compression::None => Some(COMPRESS_NONE),
        Compression::Lzma => Some(COMPRESS_LZMA),
        Compression::Gzip => None,
    }
}

fn algo_for_code(code: u32) -> Option<Compression> {
    match code {
        COMPRESS_NONE => Some(Compression::None),
        COMPRESS_LZMA => Some(Compression::Lzma),
        _ => None,
    }
}

/// Size of the name field for `name`, including at least one NUL.
fn name_field_len(name: &str) -> u64 {
    align_up(name.len() as u64 + 1, FILENAME_ALIGN)
}

/// A file to add to a CBFS.
#[derive(Debug, Clone)]
pub struct CbfsFile {
    pub name: String,
    pub ftype: FileType,
    /// Uncompressed data. Stage files hold the flattened ELF contents.
    pub data: Vec<u8>,
    pub compress: Compression,
    /// Required position of the data within the CBFS.
    pub cbfs_offset: Option<u64>,
    /// Alignment of the file header, overriding the CBFS alignment.
    pub align: Option<u64>,
    pub load: u64,
    pub entry: u64,
    pub memsize: u64,
    /// Bytes to store as-is, for files copied from an existing CBFS.
    pub encoded: Option<Vec<u8>>,
}

impl CbfsFile {
    pub fn raw(name: &str, data: Vec<u8>, compress: Compression) -> Self {
        CbfsFile {
            name: name.to_string(),
            ftype: FileType::Raw,
            data,
            compress,
            cbfs_offset: None,
            align: None,
            load: 0,
            entry: 0,
            memsize: 0,
            encoded: None,
        }
    }

    pub fn stage(name: &str, elf: ElfInfo, compress: Compression) -> Self {
        CbfsFile {
            name: name.to_string(),
            ftype: FileType::Stage,
            data: elf.data,
            compress,
            cbfs_offset: None,
            align: None,
            load: elf.load,
            entry: elf.entry,
            memsize: elf.memsize,
            encoded: None,
        }
    }

    /// A stage file read back from a CBFS, stored again unchanged.
    pub fn encoded_stage(name: &str, stored: Vec<u8>) -> Self {
        CbfsFile {
            ftype: FileType::Stage,
            encoded: Some(stored),
            ..CbfsFile::raw(name, Vec::new(), Compression::None)
        }
    }

    fn attr_len(&self) -> u64 {
        match (self.ftype, self.compress) {
            (FileType::Raw, c) if !c.is_none() => ATTR_COMPRESSION_LEN,
            _ => 0,
        }
    }

    /// Offset of the data from the start of the file header.
    fn data_offset(&self) -> u64 {
        FILE_HEADER_LEN + name_field_len(&self.name) + self.attr_len()
    }

    /// The bytes stored after the header.
    fn encode_data(&self, path: &str) -> Result<Vec<u8>> {
        if let Some(stored) = &self.encoded {
            return Ok(stored.clone());
        }
        let payload = compress::compress_raw(path, self.compress, &self.data)?;
        match self.ftype {
            FileType::Stage => {
                let header = RawStageHeader {
                    compression: le32(compression_code(self.compress).unwrap_or(COMPRESS_NONE)),
                    entry: le64(self.entry),
                    load: le64(self.load),
                    len: le32(payload.len() as u32),
                    memlen: le32(self.memsize as u32),
                };
                let mut out = bytes_of(&header).to_vec();
                out.extend_from_slice(&payload);
                Ok(out)
            }
            _ => Ok(payload),
        }
    }
}

/// Where a file ended up.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlacedFile {
    pub name: String,
    /// Offset of the stored data within the CBFS.
    pub data_offset: u64,
    /// Length of the stored data.
    pub stored_len: u64,
    /// Length before compression, for compressed files.
    pub uncomp_len: Option<u64>,
}

/// Writes a file header and its NUL-padded name at `pos`.
fn write_file_header(out: &mut [u8], pos: usize, name: &str, ftype: FileType, len: u64, attr: u64, data_offset: u64) {
    let attr_offset = if attr > 0 { FILE_HEADER_LEN + name_field_len(name) } else { 0 };
    let header = RawFileHeader {
        magic: *FILE_MAGIC,
        len: be32(len as u32),
        file_type: be32(ftype.code()),
        attr_offset: be32(attr_offset as u32),
        data_offset: be32(data_offset as u32),
    };
    put(out, pos, bytes_of(&header));
    let name_pos = pos + FILE_HEADER_LEN as usize;
    out[name_pos..name_pos + name_field_len(name) as usize].fill(0);
    put(out, name_pos, name.as_bytes());
}

/// Builds a CBFS image.
#[derive(Debug)]
pub struct CbfsWriter {
    size: u64,
    arch: Arch,
    align: u64,
    files: Vec<CbfsFile>,
}

impl CbfsWriter {
    pub fn new(size: u64, arch: Arch) -> Self {
        CbfsWriter {
            size,
            arch,
            align: DEFAULT_ALIGN,
            files: Vec::new(),
        }
    }

    pub fn add_file(&mut self, file: CbfsFile) {
        self.files.push(file);
    }

    /// Covers `start..end` with an empty file, or with `0xff` if it is too small.
    fn fill_empty(out: &mut [u8], start: u64, end: u64) {
        let empty_data = FILE_HEADER_LEN + name_field_len("");
        if end >= start + empty_data {
            write_file_header(out, start as usize, "", FileType::Empty, end - start - empty_data, 0, empty_data);
        }
    }

    /// Lays out all files and returns the CBFS contents with the position of each file.
    pub fn get_data(&self, path: &str) -> Result<(Vec<u8>, Vec<PlacedFile>)> {
        let no_space = |message: String| -> Error {
            FormatError::NoSpace {
                path: path.to_string(),
                message,
            }
            .into()
        };
        let header_pos = self
            .size
            .checked_sub(HEADER_LEN + POINTER_LEN)
            .ok_or_else(|| no_space(format!("CBFS size {:#x} is too small for the master header", self.size)))?;
        let mut out = vec![0xffu8; self.size as usize];
        let mut placed = Vec::with_capacity(self.files.len());
        let mut pos = 0u64;
        for file in &self.files {
            let data_offset = file.data_offset();
            let start = match file.cbfs_offset {
                Some(wanted) => {
                    let start = wanted.checked_sub(data_offset).filter(|s| *s >= pos).ok_or_else(|| {
                        no_space(format!(
                            "File '{}' cannot be placed with its data at {wanted:#x}: space is used up to {pos:#x}",
                            file.name
                        ))
                    })?;
                    Self::fill_empty(&mut out, pos, start);
                    start
                }
                None => align_up(pos, file.align.unwrap_or(self.align)),
            };
            let data = file.encode_data(path)?;
            let end = start + data_offset + data.len() as u64;
            if end > header_pos {
                return Err(no_space(format!(
                    "No space for file '{}' in CBFS: needs to end at {end:#x} but only {header_pos:#x} is available",
                    file.name
                )));
            }
            write_file_header(&mut out, start as usize, &file.name, file.ftype, data.len() as u64, file.attr_len(), data_offset);
            if file.attr_len() > 0 {
                let attr = RawCompressionAttr {
                    tag: be32(ATTR_TAG_COMPRESSION),
                    len: be32(ATTR_COMPRESSION_LEN as u32),
                    compression: be32(compression_code(file.compress).unwrap_or(COMPRESS_NONE)),
                    decompressed_size: be32(file.data.len() as u32),
                };
                let attr_pos = start + FILE_HEADER_LEN + name_field_len(&file.name);
                put(&mut out, attr_pos as usize, bytes_of(&attr));
            }
            let data_start = (start + data_offset) as usize;
            out[data_start..data_start + data.len()].copy_from_slice(&data);
            tracing::trace!("{path}: CBFS file '{}' data at {data_start:#x}, {:#x} bytes", file.name, data.len());
            placed.push(PlacedFile {
                name: file.name.clone(),
                data_offset: start + data_offset,
                stored_len: data.len() as u64,
                uncomp_len: (!file.compress.is_none()).then_some(file.data.len() as u64),
            });
            pos = end;
        }
        Self::fill_empty(&mut out, align_up(pos, self.align), header_pos);

        let master = RawMasterHeader {
            magic: be32(HEADER_MAGIC),
            version: be32(HEADER_VERSION),
            romsize: be32(self.size as u32),
            bootblocksize: be32(0),
            align: be32(self.align as u32),
            offset: be32(0),
            architecture: be32(self.arch.code()),
            pad: be32(0),
        };
        put(&mut out, header_pos as usize, bytes_of(&master));
        let pointer = (header_pos as i64 - self.size as i64) as i32;
        put(&mut out, (self.size - POINTER_LEN) as usize, bytes_of(&le32(pointer as u32)));
        Ok((out, placed))
    }
}

/// A file read back from a CBFS.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReadFile {
    pub name: String,
    pub ftype: FileType,
    /// Offset of the stored data within the CBFS.
    pub data_offset: u64,
    /// The stored bytes, exactly as in the CBFS.
    pub stored: Vec<u8>,
    /// Uncompressed data. For stage files this is the payload without its header.
    pub data: Vec<u8>,
    pub compress: Compression,
}

/// The master header and files of a CBFS.
#[derive(Debug)]
pub struct CbfsReader {
    pub size: u64,
    pub align: u64,
    pub arch: u32,
    pub files: IndexMap<String, ReadFile>,
}

fn malformed(message: String) -> Error {
    FormatError::Malformed { what: "CBFS", message }.into()
}

impl CbfsReader {
    pub fn read(path: &str, data: &[u8]) -> Result<CbfsReader> {
        let size = data.len() as u64;
        let pointer = size
            .checked_sub(POINTER_LEN)
            .and_then(|tail| read_pod::<Le32>(data, tail as usize))
            .ok_or_else(|| malformed("region too small".to_string()))?;
        let header_pos = size as i64 + i64::from(pointer.get(LittleEndian) as i32);
        let (header_pos, master) = usize::try_from(header_pos)
            .ok()
            .and_then(|pos| Some((pos as u64, read_pod::<RawMasterHeader>(data, pos)?)))
            .filter(|(_, master)| master.magic.get(BigEndian) == HEADER_MAGIC)
            .ok_or_else(|| malformed(format!("no master header at {header_pos:#x}")))?;
        let align = u64::from(master.align.get(BigEndian)).max(4);
        if !align.is_power_of_two() {
            return Err(malformed(format!("alignment {align:#x} is not a power of two")));
        }
        let mut reader = CbfsReader {
            size: u64::from(master.romsize.get(BigEndian)),
            align,
            arch: master.architecture.get(BigEndian),
            files: IndexMap::new(),
        };

        let mut pos = 0u64;
        while pos + FILE_HEADER_LEN <= header_pos {
            let start = pos as usize;
            let Some(header) = read_pod::<RawFileHeader>(data, start).filter(|h| h.magic == *FILE_MAGIC) else {
                pos = align_up(pos + 1, align);
                continue;
            };
            let len = u64::from(header.len.get(BigEndian));
            let code = header.file_type.get(BigEndian);
            let attr_offset = u64::from(header.attr_offset.get(BigEndian));
            let data_offset = u64::from(header.data_offset.get(BigEndian));
            if data_offset < FILE_HEADER_LEN {
                return Err(malformed(format!(
                    "file at {pos:#x} has data offset {data_offset:#x} inside its header"
                )));
            }
            let stored = data
                .get((pos + data_offset) as usize..(pos + data_offset + len) as usize)
                .ok_or_else(|| malformed(format!("file at {pos:#x} extends past the end")))?
                .to_vec();
            let name_end = if attr_offset == 0 { data_offset } else { attr_offset };
            let name = data
                .get(start + FILE_HEADER_LEN as usize..start + name_end as usize)
                .map(from_fixed_str)
                .ok_or_else(|| malformed(format!("bad name field in file at {pos:#x}")))?;
            let ftype = FileType::from_code(code)
                .ok_or_else(|| malformed(format!("unknown file type {code:#x} for '{name}'")))?;
            pos += data_offset + len;
            if ftype == FileType::Empty {
                continue;
            }

            let unknown = |code: u32| malformed(format!("unknown compression {code} for '{name}'"));
            let mut compress = Compression::None;
            if attr_offset != 0 {
                let attr = read_pod::<RawCompressionAttr>(data, start + attr_offset as usize)
                    .filter(|attr| attr.tag.get(BigEndian) == ATTR_TAG_COMPRESSION);
                if let Some(attr) = attr {
                    let code = attr.compression.get(BigEndian);
                    compress = algo_for_code(code).ok_or_else(|| unknown(code))?;
                }
            }
            let payload = match ftype {
                FileType::Stage => {
                    let stage = read_pod::<RawStageHeader>(&stored, 0)
                        .ok_or_else(|| malformed(format!("stage '{name}' is shorter than its header")))?;
                    let code = stage.compression.get(LittleEndian);
                    compress = algo_for_code(code).ok_or_else(|| unknown(code))?;
                    stored[STAGE_HEADER_LEN as usize..].to_vec()
                }
                _ => stored.clone(),
            };
            let uncompressed = compress::decompress_raw(path, compress, &payload)?;
            reader.files.insert(
                name.clone(),
                ReadFile {
                    name,
                    ftype,
                    data_offset: start as u64 + data_offset,
                    stored,
                    data: uncompressed,
                    compress,
                },
            );
        }
        Ok(reader)
    }
}
