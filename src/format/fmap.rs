//! Flash map (FMAP) encoding.
//!
//! An FMAP is a header followed by a flat list of named areas. All fields are
//! little-endian:
//!
//! | field     | type     |
//! |-----------|----------|
//! | signature | `[u8;8]` = `__FMAP__` |
//! | ver_major | `u8` = 1 |
//! | ver_minor | `u8` = 0 |
//! | base      | `u64` |
//! | size      | `u32` |
//! | name      | `[u8;32]` |
//! | nareas    | `u16` |
//!
//! followed by `nareas` records of `offset: u32, size: u32, name: [u8;32], flags: u16`.

use std::mem::size_of;

use object::pod::{bytes_of, slice_from_bytes};
use object::endian::LittleEndian;

use super::{le16, le32, le64, read_pod, Le16, Le32, Le64};
use crate::error::{FormatError, Result};
use crate::utils::{fixed_str, from_fixed_str};

pub const FMAP_SIGNATURE: &[u8; 8] = b"__FMAP__";
pub const FMAP_VER_MAJOR: u8 = 1;
pub const FMAP_VER_MINOR: u8 = 0;
pub const FMAP_STRLEN: usize = 32;
pub const FMAP_HEADER_LEN: usize = size_of::<RawHeader>();
pub const FMAP_AREA_LEN: usize = size_of::<RawArea>();

pub const FMAP_AREA_STATIC: u16 = 1 << 0;
pub const FMAP_AREA_COMPRESSED: u16 = 1 << 1;
pub const FMAP_AREA_RO: u16 = 1 << 2;

#[derive(Clone, Copy)]
#[repr(C)]
struct RawHeader {
    signature: [u8; 8],
    ver_major: u8,
    ver_minor: u8,
    base: Le64,
    size: Le32,
    name: [u8; FMAP_STRLEN],
    nareas: Le16,
}

#[derive(Clone, Copy)]
#[repr(C)]
struct RawArea {
    offset: Le32,
    size: Le32,
    name: [u8; FMAP_STRLEN],
    flags: Le16,
}

impl_pod!(RawHeader, RawArea);

const _: () = assert!(FMAP_HEADER_LEN == 56 && FMAP_AREA_LEN == 42);

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FmapHeader {
    pub ver_major: u8,
    pub ver_minor: u8,
    pub base: u64,
    pub image_size: u32,
    pub name: String,
    pub nareas: u16,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FmapArea {
    pub offset: u32,
    pub size: u32,
    pub name: String,
    pub flags: u16,
}

/// Converts an entry name to FMAP style: `ro-u-boot` becomes `RO_U_BOOT`.
pub fn name_to_fmap(name: &str) -> String {
    name.replace('-', "_").to_uppercase()
}

/// Size of an encoded FMAP with `nareas` areas.
pub fn encoded_len(nareas: usize) -> usize {
    FMAP_HEADER_LEN + nareas * FMAP_AREA_LEN
}

pub fn encode_fmap(base: u64, image_size: u32, name: &str, areas: &[FmapArea]) -> Vec<u8> {
    let header = RawHeader {
        signature: *FMAP_SIGNATURE,
        ver_major: FMAP_VER_MAJOR,
        ver_minor: FMAP_VER_MINOR,
        base: le64(base),
        size: le32(image_size),
        name: fixed_str(&name_to_fmap(name)),
        nareas: le16(areas.len() as u16),
    };
    let mut out = Vec::with_capacity(encoded_len(areas.len()));
    out.extend_from_slice(bytes_of(&header));
    for area in areas {
        let raw = RawArea {
            offset: le32(area.offset),
            size: le32(area.size),
            name: fixed_str(&name_to_fmap(&area.name)),
            flags: le16(area.flags),
        };
        out.extend_from_slice(bytes_of(&raw));
    }
    out
}

fn malformed(message: String) -> crate::error::Error {
    FormatError::Malformed { what: "FMAP", message }.into()
}

/// Decodes an FMAP starting at the beginning of `data`.
pub fn decode_fmap(data: &[u8]) -> Result<(FmapHeader, Vec<FmapArea>)> {
    let raw = read_pod::<RawHeader>(data, 0)
        .filter(|raw| raw.signature == *FMAP_SIGNATURE)
        .ok_or_else(|| malformed("missing signature".to_string()))?;
    let header = FmapHeader {
        ver_major: raw.ver_major,
        ver_minor: raw.ver_minor,
        base: raw.base.get(LittleEndian),
        image_size: raw.size.get(LittleEndian),
        name: from_fixed_str(&raw.name),
        nareas: raw.nareas.get(LittleEndian),
    };
    let (raw_areas, _) = slice_from_bytes::<RawArea>(&data[FMAP_HEADER_LEN..], header.nareas as usize)
        .map_err(|()| {
            malformed(format!(
                "{} areas need {:#x} bytes but only {:#x} are present",
                header.nareas,
                encoded_len(header.nareas as usize),
                data.len()
            ))
        })?;
    let areas = raw_areas
        .iter()
        .map(|raw| FmapArea {
            offset: raw.offset.get(LittleEndian),
            size: raw.size.get(LittleEndian),
            name: from_fixed_str(&raw.name),
            flags: raw.flags.get(LittleEndian),
        })
        .collect();
    Ok((header, areas))
}

/// Finds an FMAP in an image by its signature.
pub fn find_fmap(image: &[u8]) -> Option<usize> {
    let mut from = 0;
    while let Some(pos) = super::find_bytes(image, FMAP_SIGNATURE, from) {
        if decode_fmap(&image[pos..]).is_ok() {
            return Some(pos);
        }
        from = pos + 1;
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encode_then_decode() {
        let areas = vec![
            FmapArea {
                offset: 0,
                size: 4,
                name: "ro-u-boot".to_string(),
                flags: FMAP_AREA_RO,
            },
            FmapArea {
                offset: 4,
                size: 0x62,
                name: "fmap".to_string(),
                flags: 0,
            },
        ];
        let data = encode_fmap(0, 0x100, "FMAP", &areas);
        assert_eq!(data.len(), encoded_len(2));
        assert_eq!(data.len(), 140);

        let mut image = vec![0xffu8; 16];
        image.extend_from_slice(&data);
        let pos = find_fmap(&image).unwrap();
        assert_eq!(pos, 16);
        let (header, decoded) = decode_fmap(&image[pos..]).unwrap();
        assert_eq!((header.ver_major, header.ver_minor), (1, 0));
        assert_eq!(header.image_size, 0x100);
        assert_eq!(header.name, "FMAP");
        assert_eq!(header.nareas, 2);
        assert_eq!(decoded[0].name, "RO_U_BOOT");
        assert_eq!(decoded[0].flags, FMAP_AREA_RO);
        assert_eq!(decoded[1].name, "FMAP");
        assert_eq!((decoded[1].offset, decoded[1].size), (4, 0x62));

        let again = encode_fmap(header.base, header.image_size, &header.name, &decoded);
        assert_eq!(again, data);
    }

    #[test]
    fn truncated_area_list() {
        let data = encode_fmap(0, 0x100, "FMAP", &[]);
        let mut bad = data.clone();
        bad[54] = 3;
        assert!(decode_fmap(&bad).unwrap_err().to_string().contains("3 areas need"));
    }
}
