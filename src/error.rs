//! Error types for image building and post-build operations.
//!
//! Every failure is reported through [`Error`], which groups the individual
//! conditions by category: configuration, layout, content, symbol and format
//! problems, plus plain I/O. Messages always name the node path involved and
//! print positions as `0x<hex> (<dec>)` so that they can be matched against a
//! map listing.

use std::io;
use std::path::PathBuf;

use thiserror::Error;

/// Convenience alias used throughout the crate.
pub type Result<T> = std::result::Result<T, Error>;

/// Formats a value the way all layout messages do: `0x10 (16)`.
pub(crate) fn hex_dec(value: &u64) -> String {
    format!("{value:#x} ({value})")
}

fn join(names: &[String]) -> String {
    names.join(", ")
}

/// The top-level error returned by every fallible operation in this crate.
#[derive(Error, Debug)]
pub enum Error {
    /// Invalid or missing properties in the description.
    #[error(transparent)]
    Config(#[from] ConfigError),

    /// Entries could not be placed.
    #[error(transparent)]
    Layout(#[from] LayoutError),

    /// Entry contents could not be produced or did not settle.
    #[error(transparent)]
    Content(#[from] ContentError),

    /// ELF symbols could not be resolved or written.
    #[error(transparent)]
    Symbol(#[from] SymbolError),

    /// A binary structure was malformed or could not be found.
    #[error(transparent)]
    Format(#[from] FormatError),

    /// Filesystem access failed.
    #[error("{}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

impl Error {
    pub(crate) fn io(path: impl Into<PathBuf>, source: io::Error) -> Self {
        Error::Io {
            path: path.into(),
            source,
        }
    }
}

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Unknown entry type '{etype}' in node '{path}'")]
    UnknownVariant { path: String, etype: String },

    #[error("Node '{path}': Missing required properties/entry args: {}", join(.names))]
    MissingRequired { path: String, names: Vec<String> },

    #[error("GetArg() internal error: Unknown data type '{datatype}' for entry arg '{name}'")]
    BadDatatype { name: String, datatype: String },

    #[error("Node '{path}': Cannot convert entry arg '{name}' (value '{value}') to integer")]
    BadEntryArg {
        path: String,
        name: String,
        value: String,
    },

    #[error("Invalid entry argument '{0}': expected NAME=VALUE")]
    BadArgSyntax(String),

    #[error("Node '{path}': {what} {value} must be a power of two")]
    NotPowerOfTwo {
        path: String,
        what: &'static str,
        value: u64,
    },

    #[error("Node '{path}': Property '{prop}' {message}")]
    BadProperty {
        path: String,
        prop: String,
        message: String,
    },

    #[error("Entry '{name}' not found in '{section}'")]
    EntryNotFound { name: String, section: String },

    #[error("Node '{path}': {message}")]
    Invalid { path: String, message: String },

    #[error("Invalid entry pattern '{pattern}': {message}")]
    BadPattern { pattern: String, message: String },
}

#[derive(Error, Debug)]
pub enum LayoutError {
    #[error(
        "Node '{path}': {what} {} does not match {align_name} {}",
        hex_dec(.value),
        hex_dec(.align)
    )]
    BadAlignment {
        path: String,
        what: &'static str,
        value: u64,
        align_name: &'static str,
        align: u64,
    },

    #[error(
        "Node '{path}': Offset {} overlaps with previous entry '{previous}' ending at {}",
        hex_dec(.offset),
        hex_dec(.previous_end)
    )]
    Overlap {
        path: String,
        offset: u64,
        previous: String,
        previous_end: u64,
    },

    #[error(
        "Node '{path}': Offset {} is outside the section '{section}' starting at {}",
        hex_dec(.offset),
        hex_dec(.start)
    )]
    OutsideSection {
        path: String,
        offset: u64,
        section: String,
        start: u64,
    },

    #[error(
        "Node '{path}': Entry contents size is {} but entry size is {}",
        hex_dec(.contents_size),
        hex_dec(.size)
    )]
    EntryOverflow {
        path: String,
        contents_size: u64,
        size: u64,
    },

    #[error(
        "Section '{path}': contents size {} exceeds section size {}",
        hex_dec(.contents_size),
        hex_dec(.size)
    )]
    SectionOverflow {
        path: String,
        contents_size: u64,
        size: u64,
    },
}

#[derive(Error, Debug)]
pub enum ContentError {
    #[error(
        "Section '{path}': Internal error: Could not complete processing of contents: remaining [{}]",
        join(.remaining)
    )]
    Unavailable { path: String, remaining: Vec<String> },

    #[error("Node '{path}': Cannot update entry size from {old} to {new}")]
    SizeMismatch { path: String, old: u64, new: u64 },

    #[error("Image '{image}': Entries changed size after packing: '{path}' grew again from {old} to {new}")]
    EntriesChangedSizeAfterPacking {
        image: String,
        path: String,
        old: u64,
        new: u64,
    },

    #[error(
        "Image '{image}': Contents did not settle after {passes} passes: remaining [{}]",
        join(.remaining)
    )]
    NotSettled {
        image: String,
        passes: usize,
        remaining: Vec<String>,
    },

    #[error(
        "Image '{image}': Could not complete processing of Fdt: remaining [{}]",
        join(.remaining)
    )]
    IncompleteFdtProcessing { image: String, remaining: Vec<String> },

    #[error("Node '{path}': Cannot find input file '{filename}'")]
    MissingFile { path: String, filename: String },

    #[error("Node '{path}': Compression '{algo}' failed: {message}")]
    Compression {
        path: String,
        algo: String,
        message: String,
    },
}

#[derive(Error, Debug)]
pub enum SymbolError {
    #[error("{context}: Symbol '{name}' has size {size}: only 4 and 8 are supported")]
    BadSymbolSize {
        context: String,
        name: String,
        size: u64,
    },

    #[error("{context}: Cannot locate anchor symbol '{anchor}' needed to position binman symbols")]
    MissingAnchorSymbol { context: String, anchor: String },

    #[error(
        "{context}: Symbol '{name}' has offset {offset:#x} (size {size:#x}) but the contents size is {contents_size:#x}"
    )]
    OutsideEntry {
        context: String,
        name: String,
        offset: u64,
        size: u64,
        contents_size: u64,
    },

    #[error("{context}: Symbol '{name}' has invalid format")]
    InvalidName { context: String, name: String },

    #[error("{context}: Entry '{entry}' not found in list ({})", join(.available))]
    UnknownEntry {
        context: String,
        entry: String,
        available: Vec<String>,
    },

    #[error("{context}: No such property '{prop}' in symbol '{name}'")]
    UnknownProperty {
        context: String,
        name: String,
        prop: String,
    },

    #[error("{context}: Cannot read ELF file: {message}")]
    Elf { context: String, message: String },
}

#[derive(Error, Debug)]
pub enum FormatError {
    #[error("Node '{path}': '{etype}' entry must have a '{sibling}' sibling")]
    MissingSibling {
        path: String,
        etype: String,
        sibling: String,
    },

    #[error("Cannot find {what} in image")]
    NotFound { what: &'static str },

    #[error("Invalid {what}: {message}")]
    Malformed { what: &'static str, message: String },

    #[error("Node '{path}': {message}")]
    NoSpace { path: String, message: String },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn layout_messages_use_hex_and_decimal() {
        let err: Error = LayoutError::Overlap {
            path: "/binman/b".into(),
            offset: 3,
            previous: "/binman/a".into(),
            previous_end: 4,
        }
        .into();
        assert_eq!(
            err.to_string(),
            "Node '/binman/b': Offset 0x3 (3) overlaps with previous entry '/binman/a' ending at 0x4 (4)"
        );
    }

    #[test]
    fn missing_required_lists_every_name() {
        let err = ConfigError::MissingRequired {
            path: "/binman/_testing".into(),
            names: vec!["test-str-arg".into(), "test-int-fdt".into()],
        };
        assert!(err
            .to_string()
            .ends_with("Missing required properties/entry args: test-str-arg, test-int-fdt"));
    }
}
