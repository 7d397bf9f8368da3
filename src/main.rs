//! Entry point for the fwpack image packer.
//!
//! This file handles high-level application flow:
//! 1. Parse command-line arguments using `clap`.
//! 2. Install a `tracing` subscriber at the requested log level.
//! 3. Run the subcommand: build images, or list, extract or replace entries
//!    of an image that was already built.
//!
//! Error handling is done via `anyhow`.

use anyhow::{bail, Context, Result};
use clap::Parser;
use tracing_subscriber::EnvFilter;

use fwpack::config::{BuildArgs, Command, Config, ExtractArgs, ReplaceArgs};
use fwpack::control;
use fwpack::node::Node;

fn build(args: &BuildArgs) -> Result<()> {
    let root = Node::load(&args.description)
        .with_context(|| format!("failed to read description {}", args.description.display()))?;
    let mut ctx = args.build_context()?;
    let images = control::build_images(&root, &mut ctx, &args.images, &args.out_dir, args.map)?;
    for image in &images {
        println!("Built {} ({})", image.name, args.out_dir.join(&image.filename).display());
    }
    Ok(())
}

fn extract(args: &ExtractArgs) -> Result<()> {
    let decompress = !args.raw;
    if let Some(filename) = &args.filename {
        match args.paths.as_slice() {
            [] => bail!("Must specify an entry path to write with -f"),
            [path] => {
                let data = control::extract_entry(&args.image, path, decompress)?;
                std::fs::write(filename, data).with_context(|| format!("failed to write {}", filename.display()))?;
            }
            _ => bail!("Must specify exactly one entry path to write with -f"),
        }
        return Ok(());
    }
    let out_dir = args.out_dir.clone().unwrap_or_else(|| ".".into());
    let rows = control::extract_entries(&args.image, &args.paths, &out_dir, decompress)?;
    println!("Extracted {} entries to {}", rows.len(), out_dir.display());
    Ok(())
}

fn replace(args: &ReplaceArgs) -> Result<()> {
    let compress = !args.compressed;
    let allow_resize = !args.fix_size;
    if let Some(filename) = &args.filename {
        let path = match args.paths.as_slice() {
            [] => bail!("Must specify an entry path to read with -f"),
            [path] => path,
            _ => bail!("Must specify exactly one entry path to write with -f"),
        };
        let data = std::fs::read(filename).with_context(|| format!("failed to read {}", filename.display()))?;
        control::replace_entry(&args.image, path, data, compress, allow_resize, args.map)?;
        return Ok(());
    }
    let Some(in_dir) = &args.in_dir else {
        bail!("Must specify either -f or -I to provide the new contents");
    };
    control::replace_entries(&args.image, in_dir, &args.paths, compress, allow_resize, args.map)?;
    Ok(())
}

fn main() -> Result<()> {
    let config = Config::parse();

    let filter = EnvFilter::try_new(&config.log_level)
        .with_context(|| format!("invalid log level '{}'", config.log_level))?;
    tracing_subscriber::fmt().with_env_filter(filter).with_writer(std::io::stderr).init();

    match &config.command {
        Command::Build(args) => build(args)?,
        Command::Ls(args) => {
            let rows = control::list_entries(&args.image, &args.paths)?;
            print!("{}", control::format_listing(&rows));
        }
        Command::Extract(args) => extract(args)?,
        Command::Replace(args) => replace(args)?,
    }
    Ok(())
}
