//! Firmware Image Packer Library.
//!
//! This library provides the core components for the `fwpack` tool.
//! It is organized into several modules:
//! - `config`: CLI configuration.
//! - `node`: image descriptions.
//! - `entry`, `etype`: the entry tree and its variants.
//! - `layout`: entry placement within sections.
//! - `image`: the content pipeline and read-back of built images.
//! - `symbol`, `elf`: ELF symbol patching.
//! - `format`: binary structures (FMAP, CBFS, fdtmap, image header).
//! - `control`: build, list, extract and replace operations.

pub mod compress;
pub mod config;
pub mod control;
pub mod elf;
pub mod entry;
pub mod error;
pub mod etype;
pub mod fdt;
pub mod format;
pub mod hash;
pub mod image;
pub mod layout;
pub mod node;
pub mod state;
pub mod symbol;
pub mod utils;
pub mod writer;

pub use error::{Error, Result};
