//! Entry variants.
//!
//! Each variant implements [`EntryType`]; [`create`] maps the type name used in
//! a description to a fresh instance.

use crate::entry::EntryType;

pub mod blob;
pub mod cbfs;
pub mod elf;
pub mod fdtmap;
pub mod fill;
pub mod fmap;
pub mod image_header;
pub mod section;
pub mod testing;
pub mod text;

/// Returns a new variant for `etype`, or `None` if the type is unknown.
pub fn create(etype: &str) -> Option<Box<dyn EntryType>> {
    let kind: Box<dyn EntryType> = match etype {
        "blob" => Box::new(blob::Blob::new(None)),
        "u-boot" => Box::new(blob::Blob::new(Some("u-boot.bin"))),
        "u-boot-spl" => Box::new(blob::Blob::with_symbols("spl/u-boot-spl.bin", "spl/u-boot-spl")),
        "u-boot-tpl" => Box::new(blob::Blob::with_symbols("tpl/u-boot-tpl.bin", "tpl/u-boot-tpl")),
        "blob-dtb" => Box::new(blob::BlobDtb::new(None, None)),
        "u-boot-dtb" => Box::new(blob::BlobDtb::new(Some("u-boot-dtb"), Some("u-boot.dtb"))),
        "u-boot-spl-dtb" => Box::new(blob::BlobDtb::new(Some("u-boot-spl-dtb"), Some("spl/u-boot-spl.dtb"))),
        "u-boot-tpl-dtb" => Box::new(blob::BlobDtb::new(Some("u-boot-tpl-dtb"), Some("tpl/u-boot-tpl.dtb"))),
        "elf" => Box::new(elf::ElfBlob::default()),
        "fill" => Box::new(fill::Fill::default()),
        "text" => Box::new(text::Text::default()),
        "section" => Box::new(section::Section::default()),
        "cbfs" => Box::new(cbfs::Cbfs::default()),
        "fmap" => Box::new(fmap::Fmap),
        "fdtmap" => Box::new(fdtmap::Fdtmap),
        "image-header" => Box::new(image_header::ImageHeader::default()),
        "_testing" => Box::new(testing::Testing::default()),
        _ => return None,
    };
    Some(kind)
}
