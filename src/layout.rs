//! Layout resolution.
//!
//! Assigns an offset and size to every entry of a section, children first so
//! that a nested section's size is known before it is placed:
//! 1. Pack nested sections.
//! 2. Optionally sort children by their requested offsets.
//! 3. Place each child after the previous one, honoring requested offsets,
//!    alignment and padding.
//! 4. Grow `expand-size` entries into the following gap.
//! 5. Check the extent against the section's requested size.
//!
//! Offsets inside a section are relative to the section start plus its
//! `skip-at-start`, so an `end-at-4gb` section uses real 32-bit addresses.

use crate::entry::Entry;
use crate::error::{LayoutError, Result};
use crate::etype::section::Section;
use crate::utils::align_up;

/// Packs a whole image and assigns absolute positions.
pub fn pack_image(root: &mut Entry) -> Result<()> {
    pack_children(root)?;
    let offset = root.fixed_offset.unwrap_or(0);
    place(root, offset)?;
    root.set_image_pos(0);
    tracing::debug!(
        "{}: packed, size {:#x}",
        root.path,
        root.size.unwrap_or_default()
    );
    Ok(())
}

/// Packs the children of a section entry and records the resulting extent as
/// the entry's contents size. Other entries are left alone.
fn pack_children(entry: &mut Entry) -> Result<()> {
    let path = entry.path.clone();
    let pads = entry.pad_before + entry.pad_after;
    let limit = entry.fixed_size.map(|size| size.saturating_sub(pads));
    let Some(section) = entry.kind_mut().as_section_mut() else {
        return Ok(());
    };
    let extent = pack_section(section, &path, limit)?;
    entry.contents_size = extent;
    Ok(())
}

/// Lays out the children of `section` and returns the extent of its contents.
///
/// `size` is the space available for contents when the section has a fixed size.
pub fn pack_section(section: &mut Section, path: &str, size: Option<u64>) -> Result<u64> {
    for child in &mut section.entries {
        pack_children(child)?;
    }
    if section.sort_by_offset {
        section
            .entries
            .sort_by_key(|e| e.fixed_offset.unwrap_or(u64::MAX));
    }

    let start = section.skip_at_start;
    let mut previous_end = start;
    let mut previous = String::new();
    for child in &mut section.entries {
        let requested = match child.fixed_offset {
            Some(offset) => Some(offset),
            None => child
                .kind()
                .default_offset(&child.path, size)?
                .map(|offset| offset + start),
        };
        let offset = match requested {
            Some(offset) => {
                if offset < start {
                    return Err(LayoutError::OutsideSection {
                        path: child.path.clone(),
                        offset,
                        section: path.to_string(),
                        start,
                    }
                    .into());
                }
                if let Some(align) = child.align {
                    if offset % align != 0 {
                        return Err(LayoutError::BadAlignment {
                            path: child.path.clone(),
                            what: "Offset",
                            value: offset,
                            align_name: "align",
                            align,
                        }
                        .into());
                    }
                }
                if offset < previous_end {
                    return Err(LayoutError::Overlap {
                        path: child.path.clone(),
                        offset,
                        previous,
                        previous_end,
                    }
                    .into());
                }
                offset
            }
            None => align_up(previous_end, child.align.unwrap_or(1)),
        };
        previous_end = place(child, offset)?;
        previous = child.path.clone();
        tracing::trace!(
            "{}: offset {offset:#x} size {:#x}",
            child.path,
            child.size.unwrap_or_default()
        );
    }

    expand_entries(section, size.map(|s| start + s));

    let extent = section
        .entries
        .iter()
        .filter_map(|e| Some(e.offset? + e.size?))
        .max()
        .unwrap_or(start)
        - start;
    if let Some(size) = size {
        if extent > size {
            return Err(LayoutError::SectionOverflow {
                path: path.to_string(),
                contents_size: extent,
                size,
            }
            .into());
        }
    }
    Ok(extent)
}

/// Sets the offset and size of one entry and returns its end.
fn place(entry: &mut Entry, offset: u64) -> Result<u64> {
    entry.offset = Some(offset);
    let needed = entry.contents_size + entry.pad_before + entry.pad_after;
    let mut size = match entry.fixed_size {
        Some(size) => {
            if let Some(align) = entry.align_size {
                if size % align != 0 {
                    return Err(LayoutError::BadAlignment {
                        path: entry.path.clone(),
                        what: "Size",
                        value: size,
                        align_name: "align-size",
                        align,
                    }
                    .into());
                }
            }
            size
        }
        None => align_up(needed, entry.align_size.unwrap_or(1)),
    };
    if let Some(align_end) = entry.align_end {
        size = align_up(offset + size, align_end) - offset;
    }
    if needed > size {
        return Err(LayoutError::EntryOverflow {
            path: entry.path.clone(),
            contents_size: entry.contents_size,
            size,
        }
        .into());
    }
    entry.size = Some(size);
    Ok(offset + size)
}

/// Grows `expand-size` entries up to the next sibling, or to `limit` for the last one.
fn expand_entries(section: &mut Section, limit: Option<u64>) {
    let next_offsets: Vec<Option<u64>> = (0..section.entries.len())
        .map(|i| match section.entries.get(i + 1) {
            Some(next) => next.offset,
            None => limit,
        })
        .collect();
    for (entry, next) in section.entries.iter_mut().zip(next_offsets) {
        if !entry.expand_size {
            continue;
        }
        let (Some(offset), Some(size), Some(next)) = (entry.offset, entry.size, next) else {
            continue;
        };
        if next > offset + size {
            tracing::debug!("{}: expanding to {:#x}", entry.path, next - offset);
            entry.size = Some(next - offset);
        }
    }
}
