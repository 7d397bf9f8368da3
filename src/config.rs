//! Configuration module.
//!
//! This module defines the command-line interface (CLI) using `clap`: one
//! subcommand to build images from a description and three to inspect and
//! update images that were already built.

use clap::{Args, Parser, Subcommand};
use std::path::PathBuf;

use crate::error::{ConfigError, Result};
use crate::state::BuildContext;

/// A firmware image packer.
///
/// Images are described in TOML: a `[binman]` table whose subtables are the
/// entries to place, in order. Built images carry a map of their own layout so
/// that entries can later be listed, extracted and replaced.
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Config {
    #[command(subcommand)]
    pub command: Command,

    /// Log level (error, warn, info, debug, trace)
    #[arg(long, global = true, default_value = "info", help = "Set the logging level")]
    pub log_level: String,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Build images from a description
    Build(BuildArgs),
    /// List the entries in an image
    Ls(ListArgs),
    /// Extract entries from an image
    Extract(ExtractArgs),
    /// Replace entries in an image
    Replace(ReplaceArgs),
}

#[derive(Args, Debug)]
pub struct BuildArgs {
    /// Image description file
    #[arg(short, long)]
    pub description: PathBuf,

    /// Entry arguments, as NAME=VALUE
    #[arg(short = 'a', long = "entry-arg")]
    pub entry_args: Vec<String>,

    /// Directories to search for input files
    #[arg(short = 'I', long = "indir")]
    pub input_dirs: Vec<PathBuf>,

    /// Output directory
    #[arg(short = 'O', long = "outdir", default_value = ".")]
    pub out_dir: PathBuf,

    /// Only build the named images
    #[arg(short, long = "image")]
    pub images: Vec<String>,

    /// Write a map file for each image
    #[arg(short, long)]
    pub map: bool,

    /// Write entry positions into the device trees in the image
    #[arg(short, long)]
    pub update_fdt: bool,

    /// Device trees to use for dtb entries, as NAME=PATH
    #[arg(long = "fdt")]
    pub fdts: Vec<String>,

    /// Allow entries to shrink after packing
    #[arg(long)]
    pub allow_contract: bool,
}

impl BuildArgs {
    /// The build policy and inputs selected on the command line.
    pub fn build_context(&self) -> Result<BuildContext> {
        let mut ctx = BuildContext::new();
        ctx.set_entry_args(&self.entry_args)?;
        ctx.input_dirs = self.input_dirs.clone();
        ctx.update_fdt = self.update_fdt;
        ctx.allow_contract = self.allow_contract;
        for spec in &self.fdts {
            let (name, path) = spec.split_once('=').ok_or_else(|| ConfigError::BadArgSyntax(spec.clone()))?;
            ctx.add_fdt_file(name, &PathBuf::from(path))?;
        }
        Ok(ctx)
    }
}

#[derive(Args, Debug)]
pub struct ListArgs {
    /// Image file to list
    #[arg(short, long)]
    pub image: PathBuf,

    /// Entry paths to list (glob patterns)
    pub paths: Vec<String>,
}

#[derive(Args, Debug)]
pub struct ExtractArgs {
    /// Image file to extract from
    #[arg(short, long)]
    pub image: PathBuf,

    /// Write the single selected entry to this file
    #[arg(short, long)]
    pub filename: Option<PathBuf>,

    /// Write the selected entries below this directory
    #[arg(short = 'O', long = "outdir")]
    pub out_dir: Option<PathBuf>,

    /// Keep compressed entries compressed
    #[arg(short = 'U', long)]
    pub raw: bool,

    /// Entry paths to extract (glob patterns)
    pub paths: Vec<String>,
}

#[derive(Args, Debug)]
pub struct ReplaceArgs {
    /// Image file to update
    #[arg(short, long)]
    pub image: PathBuf,

    /// File holding the new contents of the single selected entry
    #[arg(short, long)]
    pub filename: Option<PathBuf>,

    /// Directory holding a file for each entry to replace
    #[arg(short = 'I', long = "indir")]
    pub in_dir: Option<PathBuf>,

    /// The new contents are already compressed
    #[arg(short = 'C', long)]
    pub compressed: bool,

    /// Fail rather than resize entries
    #[arg(short = 'F', long)]
    pub fix_size: bool,

    /// Write a map file next to the image
    #[arg(short, long)]
    pub map: bool,

    /// Entry paths to replace (glob patterns)
    pub paths: Vec<String>,
}
