//! Build context.
//!
//! Holds everything an image build needs besides the description itself:
//! entry arguments from the command line, where to look for input files, the
//! resize policy and the device trees that may be embedded and annotated.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use crate::error::{ConfigError, ContentError, Error, Result};
use crate::fdt::DeviceTree;

#[derive(Debug, Clone)]
pub struct BuildContext {
    /// `NAME=VALUE` arguments available to entries.
    pub entry_args: BTreeMap<String, String>,
    /// Directories searched for input files, in order.
    pub input_dirs: Vec<PathBuf>,
    /// Entries may grow once after packing.
    pub allow_expand: bool,
    /// Entries may shrink after packing.
    pub allow_contract: bool,
    /// Annotate embedded device trees with image positions.
    pub update_fdt: bool,
    /// Device trees available for embedding, by name (e.g. `u-boot-dtb`).
    pub fdts: BTreeMap<String, DeviceTree>,
    /// Set while reconstructing an image from its fdtmap.
    pub reading_back: bool,
    /// The last position map produced for each image.
    fdtmap_cache: BTreeMap<String, Vec<u8>>,
}

impl Default for BuildContext {
    fn default() -> Self {
        Self {
            entry_args: BTreeMap::new(),
            input_dirs: Vec::new(),
            allow_expand: true,
            allow_contract: false,
            update_fdt: false,
            fdts: BTreeMap::new(),
            reading_back: false,
            fdtmap_cache: BTreeMap::new(),
        }
    }
}

impl BuildContext {
    pub fn new() -> Self {
        Self::default()
    }

    /// Context used when an image is rebuilt from an existing file.
    pub fn for_read_back() -> Self {
        Self {
            reading_back: true,
            ..Self::default()
        }
    }

    /// Parses `NAME=VALUE` strings into entry arguments.
    pub fn set_entry_args<S: AsRef<str>>(&mut self, args: &[S]) -> Result<()> {
        for arg in args {
            let arg = arg.as_ref();
            let (name, value) = arg
                .split_once('=')
                .ok_or_else(|| ConfigError::BadArgSyntax(arg.to_string()))?;
            if name.is_empty() {
                return Err(ConfigError::BadArgSyntax(arg.to_string()).into());
            }
            self.entry_args.insert(name.to_string(), value.to_string());
        }
        Ok(())
    }

    pub fn entry_arg(&self, name: &str) -> Option<&str> {
        self.entry_args.get(name).map(String::as_str)
    }

    /// Loads a device tree blob and makes it available under `name`.
    pub fn add_fdt_file(&mut self, name: &str, path: &Path) -> Result<()> {
        let data = std::fs::read(path).map_err(|e| Error::io(path, e))?;
        self.fdts.insert(name.to_string(), DeviceTree::from_bytes(&data)?);
        Ok(())
    }

    /// Finds an input file in the search path. Absolute paths are used as-is.
    pub fn input_path(&self, filename: &str) -> Option<PathBuf> {
        let candidate = Path::new(filename);
        if candidate.is_absolute() {
            return candidate.exists().then(|| candidate.to_path_buf());
        }
        self.input_dirs
            .iter()
            .map(|dir| dir.join(filename))
            .chain(std::iter::once(candidate.to_path_buf()))
            .find(|p| p.exists())
    }

    /// Reads an input file for the entry at `entry_path`.
    pub fn read_input(&self, entry_path: &str, filename: &str) -> Result<Vec<u8>> {
        let path = self.input_path(filename).ok_or_else(|| ContentError::MissingFile {
            path: entry_path.to_string(),
            filename: filename.to_string(),
        })?;
        tracing::debug!("{entry_path}: reading {}", path.display());
        std::fs::read(&path).map_err(|e| Error::io(path, e))
    }

    pub fn cache_fdtmap(&mut self, image: &str, data: Vec<u8>) {
        self.fdtmap_cache.insert(image.to_string(), data);
    }

    pub fn cached_fdtmap(&self, image: &str) -> Option<&[u8]> {
        self.fdtmap_cache.get(image).map(Vec::as_slice)
    }
}
