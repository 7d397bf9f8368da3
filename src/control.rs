//! Top-level operations: building images from a description and working on
//! images that were already built.
//!
//! Post-build operations rebuild the entry tree from the fdtmap stored in the
//! image file. An update reads the whole file, changes the entries, regenerates
//! the contents that depend on them and writes the whole file back. The write
//! is not atomic: a crash part way through can leave a truncated image.

use std::fs::File;
use std::path::{Path, PathBuf};

use memmap2::Mmap;

use crate::entry::ListEntry;
use crate::error::{Error, Result};
use crate::image::{Image, DEFAULT_IMAGE_NAME};
use crate::node::Node;
use crate::state::BuildContext;
use crate::writer;

/// File name used for the contents of an entry that has subentries.
pub const COMPOSITE_FILENAME: &str = "__image.bin";

/// Creates the images described by `root`, limited to `select` if it is not
/// empty. A root with `multiple-images` describes one image per subnode.
pub fn prepare_images(root: &Node, ctx: &BuildContext, select: &[String]) -> Result<Vec<Image>> {
    let selected = |name: &str| select.is_empty() || select.iter().any(|s| s == name);
    if !root.get_bool("multiple-images") {
        return Ok(vec![Image::from_node(DEFAULT_IMAGE_NAME, root, ctx)?]);
    }
    let mut images = Vec::new();
    for node in &root.children {
        if selected(&node.name) {
            images.push(Image::from_node(&node.name, node, ctx)?);
        } else {
            tracing::debug!("Skipping image '{}'", node.name);
        }
    }
    if images.is_empty() {
        tracing::warn!("No images selected from {:?}", select);
    }
    Ok(images)
}

/// Builds every selected image and writes it to `out_dir`.
///
/// Each image goes to its `filename`; with `write_map` a map listing goes to
/// `<image>.map`. Device trees updated with entry positions are written as
/// `<name>.out.dtb`. If a build fails, the map is still written with the
/// positions resolved so far.
pub fn build_images(
    root: &Node,
    ctx: &mut BuildContext,
    select: &[String],
    out_dir: &Path,
    write_map: bool,
) -> Result<Vec<Image>> {
    let mut images = prepare_images(root, ctx, select)?;
    for image in &mut images {
        let map_path = out_dir.join(format!("{}.map", image.name));
        if let Err(err) = image.build(ctx) {
            if write_map {
                match writer::write_map(&map_path, image) {
                    Ok(()) => tracing::warn!("Build of '{}' failed; partial map written to {}", image.name, map_path.display()),
                    Err(map_err) => tracing::warn!("Cannot write map for '{}': {map_err}", image.name),
                }
            }
            return Err(err);
        }
        writer::write_image(&out_dir.join(&image.filename), image)?;
        if write_map {
            writer::write_map(&map_path, image)?;
        }
        for (name, tree) in &image.updated_fdts {
            writer::write_fdt(&out_dir.join(format!("{name}.out.dtb")), tree)?;
        }
    }
    Ok(images)
}

/// Reads an image file and rebuilds its entries from the fdtmap.
pub fn read_image(path: &Path) -> Result<Image> {
    let file = File::open(path).map_err(|e| Error::io(path, e))?;
    // SAFETY: the mapping is only read while the file is open here, and the
    // image copies out everything it keeps.
    let mmap = unsafe { Mmap::map(&file) }.map_err(|e| Error::io(path, e))?;
    Image::from_data(&mmap)
}

/// Lists the entries of an image file matching `patterns`.
pub fn list_entries(image_file: &Path, patterns: &[String]) -> Result<Vec<ListEntry>> {
    read_image(image_file)?.list_entries(patterns)
}

/// Formats list rows as a table, one line per entry, children indented.
pub fn format_listing(rows: &[ListEntry]) -> String {
    const HEADERS: [&str; 6] = ["Name", "Image-pos", "Size", "Entry-type", "Offset", "Uncomp-size"];
    let hex = |v: Option<u64>| v.map(|v| format!("{v:x}")).unwrap_or_default();
    let cells: Vec<[String; 6]> = rows
        .iter()
        .map(|row| {
            [
                format!("{}{}", "  ".repeat(row.indent), row.name),
                hex(row.image_pos),
                hex(row.size),
                row.etype.clone(),
                hex(row.offset),
                hex(row.uncomp_size),
            ]
        })
        .collect();
    let mut widths = HEADERS.map(str::len);
    for row in &cells {
        for (width, cell) in widths.iter_mut().zip(row) {
            *width = (*width).max(cell.len());
        }
    }
    let line = |row: [&str; 6]| {
        let text = row
            .iter()
            .enumerate()
            .map(|(i, cell)| match i {
                0 | 3 => format!("{cell:<w$}", w = widths[i]),
                _ => format!("{cell:>w$}", w = widths[i]),
            })
            .collect::<Vec<_>>()
            .join("  ");
        format!("{}\n", text.trim_end())
    };
    let mut out = line(HEADERS);
    out.push_str(&"-".repeat(widths.iter().sum::<usize>() + 2 * (widths.len() - 1)));
    out.push('\n');
    for row in &cells {
        out.push_str(&line(row.each_ref().map(String::as_str)));
    }
    out
}

/// Returns the contents of one entry of an image file.
pub fn extract_entry(image_file: &Path, path: &str, decompress: bool) -> Result<Vec<u8>> {
    read_image(image_file)?.find_entry(path)?.read_data(decompress)
}

/// Writes the entries matching `patterns` to files under `out_dir`.
///
/// Each entry is written to its path below `out_dir`. Entries with subentries
/// are written to `__image.bin` inside their directory, so the whole image
/// lands at `<out_dir>/__image.bin`. Returns the entries that were written.
pub fn extract_entries(
    image_file: &Path,
    patterns: &[String],
    out_dir: &Path,
    decompress: bool,
) -> Result<Vec<ListEntry>> {
    let image = read_image(image_file)?;
    let rows = image.list_entries(patterns)?;
    for row in &rows {
        let entry = image.find_entry(&row.path)?;
        let mut path = out_dir.join(&row.path);
        if !entry.children().is_empty() {
            path.push(COMPOSITE_FILENAME);
        }
        writer::write_file(&path, &entry.read_data(decompress)?)?;
        tracing::debug!("Extracted '{}' to {}", row.path, path.display());
    }
    Ok(rows)
}

/// Writes `image` back over `image_file`, and its map next to it if asked.
fn write_back(image_file: &Path, image: &Image, write_map: bool) -> Result<()> {
    writer::write_file(image_file, &image.data())?;
    if write_map {
        writer::write_map(&image_file.with_extension("map"), image)?;
    }
    Ok(())
}

/// Replaces the contents of one entry in an image file.
///
/// With `compress` set, `data` is compressed the way the entry is before it
/// is stored. A size change needs `allow_resize` and an image built with
/// `allow-repack`.
pub fn replace_entry(
    image_file: &Path,
    path: &str,
    data: Vec<u8>,
    compress: bool,
    allow_resize: bool,
    write_map: bool,
) -> Result<Image> {
    let mut image = read_image(image_file)?;
    let resized = image.replace_entry(path, data, compress, allow_resize)?;
    image.regenerate(resized)?;
    write_back(image_file, &image, write_map)?;
    Ok(image)
}

/// Replaces every entry matching `patterns` with the file at its path below
/// `in_dir`. Entries with subentries are skipped, as are entries without a
/// file.
pub fn replace_entries(
    image_file: &Path,
    in_dir: &Path,
    patterns: &[String],
    compress: bool,
    allow_resize: bool,
    write_map: bool,
) -> Result<Image> {
    let mut image = read_image(image_file)?;
    let mut resized = false;
    for row in image.list_entries(patterns)? {
        let entry = image.find_entry(&row.path)?;
        if row.path.is_empty() || !entry.children().is_empty() {
            continue;
        }
        let file: PathBuf = in_dir.join(&row.path);
        if !file.is_file() {
            tracing::warn!("Skipping entry '{}' from missing file", entry.path);
            continue;
        }
        let data = std::fs::read(&file).map_err(|e| Error::io(&file, e))?;
        resized |= image.replace_entry(&row.path, data, compress, allow_resize)?;
    }
    image.regenerate(resized)?;
    write_back(image_file, &image, write_map)?;
    Ok(image)
}
