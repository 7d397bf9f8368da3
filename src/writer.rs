//! Output file writer.
//!
//! This module writes the artifacts of a build or an update to disk: image
//! files, map listings and updated device trees.

use std::fs;
use std::path::Path;

use crate::error::{Error, Result};
use crate::fdt::DeviceTree;
use crate::image::Image;

/// Writes `data` to `path`, creating parent directories as needed.
pub fn write_file(path: &Path, data: &[u8]) -> Result<()> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent).map_err(|e| Error::io(parent, e))?;
    }
    fs::write(path, data).map_err(|e| Error::io(path, e))
}

/// Write the complete contents of an image.
pub fn write_image(path: &Path, image: &Image) -> Result<()> {
    let data = image.data();
    write_file(path, &data)?;
    tracing::info!("Wrote image '{}' to {} ({:#x} bytes)", image.name, path.display(), data.len());
    Ok(())
}

/// Write the map listing of an image. Unresolved positions show as `<none>`.
pub fn write_map(path: &Path, image: &Image) -> Result<()> {
    write_file(path, image.map().as_bytes())?;
    tracing::info!("Wrote map for '{}' to {}", image.name, path.display());
    Ok(())
}

pub fn write_fdt(path: &Path, tree: &DeviceTree) -> Result<()> {
    write_file(path, &tree.to_bytes())?;
    tracing::info!("Wrote device tree to {}", path.display());
    Ok(())
}
