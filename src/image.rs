//! Images and the content pipeline.
//!
//! An [`Image`] owns the root section of one output file and drives the build:
//! 1. Obtain: every entry produces its initial contents.
//! 2. Pack: the layout resolver places every entry.
//! 3. Process contents: entries regenerate position-dependent contents until
//!    nothing changes. Entries that grow or shrink trigger a repack.
//! 4. Process FDT: entries that embed device trees finish writing them.
//!
//! Images are also rebuilt from the fdtmap stored inside an existing file, so
//! that entries can be listed, extracted and replaced.

use std::collections::BTreeSet;

use crate::compress;
use crate::entry::{Entry, ListEntry, RoundOutcome};
use crate::error::{ConfigError, ContentError, FormatError, Result};
use crate::etype::section::Section;
use crate::fdt::DeviceTree;
use crate::format::fdtmap::{decode_fdtmap, is_fdtmap_at, locate_fdtmap};
use crate::format::image_header::locate_header;
use crate::layout;
use crate::node::{Node, ROOT_NAME};
use crate::state::BuildContext;
use crate::utils::from_fixed_str;

/// Name of the root entry of every image.
pub const ROOT_ENTRY_NAME: &str = "main-section";

/// Name used for the image of a single-image description.
pub const DEFAULT_IMAGE_NAME: &str = "image";

/// Passes allowed for entries to provide their initial contents.
const OBTAIN_PASSES: usize = 3;

/// Rounds allowed for contents to stop changing.
pub const MAX_PASSES: usize = 8;

#[derive(Debug)]
pub struct Image {
    pub name: String,
    /// Output file name, relative to the output directory.
    pub filename: String,
    /// Record the requested layout so that entries can later change size.
    pub allow_repack: bool,
    pub root: Entry,
    /// Device trees annotated during the build, by name.
    pub updated_fdts: Vec<(String, DeviceTree)>,
}

impl Image {
    /// Creates an image from its description node.
    pub fn from_node(name: &str, node: &Node, ctx: &BuildContext) -> Result<Image> {
        let root = Entry::with_kind(node, ROOT_ENTRY_NAME, "section", Box::new(Section::default()), ctx)?;
        Ok(Image {
            name: name.to_string(),
            filename: node.get_str("filename")?.unwrap_or_else(|| format!("{name}.bin")),
            allow_repack: node.get_bool("allow-repack"),
            root,
            updated_fdts: Vec::new(),
        })
    }

    /// Runs all four phases.
    pub fn build(&mut self, ctx: &mut BuildContext) -> Result<()> {
        tracing::debug!("{}: building", self.name);
        self.obtain_contents(ctx)?;
        self.pack()?;
        self.process_contents(ctx)?;
        self.process_fdt(ctx)?;
        if let Some(fdtmap) = self.fdtmap_data() {
            ctx.cache_fdtmap(&self.name, fdtmap);
        }
        Ok(())
    }

    /// Phase 1.
    pub fn obtain_contents(&mut self, ctx: &BuildContext) -> Result<()> {
        let mut remaining = Vec::new();
        for pass in 1..=OBTAIN_PASSES {
            let view = self.root.view();
            remaining.clear();
            self.root.obtain_contents(&view, ctx, &mut remaining)?;
            if remaining.is_empty() {
                return Ok(());
            }
            tracing::debug!("{}: pass {pass}: contents not ready for {remaining:?}", self.name);
        }
        Err(ContentError::Unavailable {
            path: self.root.path.clone(),
            remaining,
        }
        .into())
    }

    /// Phase 2.
    pub fn pack(&mut self) -> Result<()> {
        layout::pack_image(&mut self.root)
    }

    /// Phase 3.
    pub fn process_contents(&mut self, ctx: &BuildContext) -> Result<()> {
        let mut pending = Vec::new();
        for pass in 1..=MAX_PASSES {
            let view = self.root.view();
            let mut outcome = RoundOutcome::new(&self.name);
            self.root.process_contents(&view, ctx, &mut outcome)?;
            if !outcome.resized.is_empty() {
                tracing::debug!("{}: pass {pass}: repacking after {:?} changed size", self.name, outcome.resized);
                self.pack()?;
            } else if outcome.is_settled() {
                tracing::debug!("{}: contents settled after {pass} passes", self.name);
                return Ok(());
            }
            pending = outcome.resized;
            pending.extend(outcome.changed);
        }
        Err(ContentError::NotSettled {
            image: self.name.clone(),
            passes: MAX_PASSES,
            remaining: pending,
        }
        .into())
    }

    /// Phase 4.
    pub fn process_fdt(&mut self, ctx: &BuildContext) -> Result<()> {
        let mut pending = BTreeSet::new();
        self.root.paths(&mut pending);
        let mut updated = Vec::new();
        while !pending.is_empty() {
            let before = pending.len();
            let view = self.root.view();
            self.root.process_fdt(&view, ctx, &mut pending, &mut updated)?;
            if pending.len() == before {
                return Err(ContentError::IncompleteFdtProcessing {
                    image: self.name.clone(),
                    remaining: pending.into_iter().collect(),
                }
                .into());
            }
        }
        for (name, tree) in updated {
            self.updated_fdts.retain(|(existing, _)| *existing != name);
            self.updated_fdts.push((name, tree));
        }
        Ok(())
    }

    /// The complete image contents.
    pub fn data(&self) -> Vec<u8> {
        self.root.region_data()
    }

    /// Contents of the first fdtmap entry, if the image has one.
    fn fdtmap_data(&self) -> Option<Vec<u8>> {
        find_etype(&self.root, "fdtmap").map(|e| e.data.clone())
    }

    /// The map listing: one line per entry with image position, offset and size.
    pub fn map(&self) -> String {
        let mut out = String::from("ImagePos    Offset      Size  Name\n");
        self.root.write_map(&mut out, 0);
        out
    }

    /// Lists entries whose path matches one of `patterns`, with their
    /// descendants. No patterns lists everything.
    pub fn list_entries(&self, patterns: &[String]) -> Result<Vec<ListEntry>> {
        let patterns = patterns
            .iter()
            .map(|p| {
                glob::Pattern::new(p).map_err(|e| ConfigError::BadPattern {
                    pattern: p.clone(),
                    message: e.to_string(),
                })
            })
            .collect::<std::result::Result<Vec<_>, _>>()?;
        let mut rows = Vec::new();
        self.root.list("", 0, &mut rows);
        if patterns.is_empty() {
            return Ok(rows);
        }
        let matches = |path: &str| {
            let mut prefix = String::new();
            path.split('/').any(|part| {
                if !prefix.is_empty() {
                    prefix.push('/');
                }
                prefix.push_str(part);
                patterns.iter().any(|p| p.matches(&prefix))
            })
        };
        Ok(rows.into_iter().filter(|row| !row.path.is_empty() && matches(&row.path)).collect())
    }

    /// Finds an entry by its `/`-separated path below the image root.
    pub fn find_entry(&self, path: &str) -> Result<&Entry> {
        let mut entry = &self.root;
        let mut section = String::from("/");
        for part in path.split('/').filter(|p| !p.is_empty()) {
            entry = entry
                .children()
                .iter()
                .find(|c| c.name == part)
                .ok_or_else(|| ConfigError::EntryNotFound {
                    name: part.to_string(),
                    section: section.clone(),
                })?;
            if !section.ends_with('/') {
                section.push('/');
            }
            section.push_str(part);
        }
        Ok(entry)
    }

    pub fn find_entry_mut(&mut self, path: &str) -> Result<&mut Entry> {
        self.find_entry(path)?;
        let missing = ConfigError::EntryNotFound {
            name: path.to_string(),
            section: self.name.clone(),
        };
        Ok(self.root.find_mut(path).ok_or(missing)?)
    }

    /// Reconstructs an image from the fdtmap inside `data`.
    pub fn from_data(data: &[u8]) -> Result<Image> {
        let pos = match locate_header(data) {
            Some(pos) if is_fdtmap_at(data, pos as usize) => pos as usize,
            _ => locate_fdtmap(data).ok_or(FormatError::NotFound { what: "FDT map" })?,
        };
        let tree = decode_fdtmap(&data[pos..])?;
        let image_node = tree
            .root
            .prop("image-node")
            .map(from_fixed_str)
            .unwrap_or_else(|| ROOT_NAME.to_string());
        let (name, path) = if image_node == ROOT_NAME {
            (DEFAULT_IMAGE_NAME.to_string(), format!("/{ROOT_NAME}"))
        } else {
            (image_node.clone(), format!("/{ROOT_NAME}/{image_node}"))
        };
        let mut stored = tree.root.to_node(&path);
        stored.name = image_node;
        stored.props.shift_remove("image-node");

        let allow_repack = stored.get_bool("allow-repack");
        let mut node = stored.clone();
        if allow_repack {
            use_original_layout(&mut node);
        }
        let ctx = BuildContext::for_read_back();
        let mut root = Entry::with_kind(&node, ROOT_ENTRY_NAME, "section", Box::new(Section::default()), &ctx)?;
        restore_positions(&mut root, &stored)?;
        root.load_data(data)?;
        tracing::debug!("read back image '{name}' from fdtmap at {pos:#x}");
        Ok(Image {
            filename: format!("{name}.bin"),
            name,
            allow_repack,
            root,
            updated_fdts: Vec::new(),
        })
    }

    /// Replaces the contents of one entry. Returns whether its size changed.
    ///
    /// With `compress` set, `data` is compressed first if the entry is compressed.
    pub fn replace_entry(&mut self, path: &str, data: Vec<u8>, compress: bool, allow_resize: bool) -> Result<bool> {
        let allow_repack = self.allow_repack;
        let entry = self.find_entry_mut(path)?;
        let invalid = |entry: &Entry, message: &str| ConfigError::Invalid {
            path: entry.path.clone(),
            message: message.to_string(),
        };
        if !entry.children().is_empty() {
            return Err(invalid(entry, "Cannot replace the contents of an entry with subentries").into());
        }
        let (data, uncomp_size) = if compress && !entry.compress.is_none() {
            let len = data.len() as u64;
            (compress::compress(&entry.path, entry.compress, &data)?, Some(len))
        } else {
            (data, entry.uncomp_size)
        };
        let resized = data.len() as u64 != entry.contents_size;
        let refusal = match (resized, allow_repack, allow_resize) {
            (true, false, _) => Some("Entry data size does not match, but allow-repack is not present for this image"),
            (true, true, false) => Some("Entry data size does not match, but resize is disabled"),
            _ => None,
        };
        if let Some(message) = refusal {
            return Err(invalid(entry, message).into());
        }
        tracing::debug!("{}: replacing with {:#x} bytes", entry.path, data.len());
        entry.contents_size = data.len() as u64;
        entry.data = data;
        entry.uncomp_size = uncomp_size;
        Ok(resized)
    }

    /// Regenerates dependent contents (maps, headers, sections) after a replace.
    pub fn regenerate(&mut self, repack: bool) -> Result<()> {
        let ctx = BuildContext::for_read_back();
        if repack {
            self.pack()?;
        }
        self.process_contents(&ctx)
    }
}

/// Swaps the recorded layout for the one requested by the description, so
/// that a repack may move and resize entries.
fn use_original_layout(node: &mut Node) {
    for (prop, orig) in [("offset", "orig-offset"), ("size", "orig-size")] {
        match node.props.get(orig).cloned() {
            Some(value) => node.set(prop, value),
            None => {
                node.props.shift_remove(prop);
            }
        }
    }
    for child in &mut node.children {
        use_original_layout(child);
    }
}

/// Copies the positions recorded in an fdtmap onto the rebuilt entries.
fn restore_positions(entry: &mut Entry, node: &Node) -> Result<()> {
    entry.offset = node.get_int("offset")?;
    entry.size = node.get_int("size")?;
    entry.image_pos = node.get_int("image-pos")?;
    for child in entry.kind_mut().children_mut() {
        if let Some(child_node) = node.children.iter().find(|c| c.path == child.path) {
            restore_positions(child, child_node)?;
        }
    }
    Ok(())
}

fn find_etype<'a>(entry: &'a Entry, etype: &str) -> Option<&'a Entry> {
    if entry.etype == etype {
        return Some(entry);
    }
    entry.children().iter().find_map(|child| find_etype(child, etype))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn build(text: &str) -> Result<Image> {
        let node = Node::parse(text).unwrap();
        let mut ctx = BuildContext::new();
        let mut image = Image::from_node(DEFAULT_IMAGE_NAME, &node, &ctx)?;
        image.build(&mut ctx)?;
        Ok(image)
    }

    #[test]
    fn testing_entries_settle() {
        let image = build("[binman._testing]\n[binman.\"_testing@1\"]\nalign = 4\n").unwrap();
        assert_eq!(image.data(), b"aa\0\0aa");
        assert_eq!(
            image.map(),
            "ImagePos    Offset      Size  Name\n\
             00000000  00000000  00000006  main-section\n\
             00000000    00000000  00000002  _testing\n\
             00000004    00000004  00000002  _testing@1\n"
        );
    }

    #[test]
    fn unavailable_contents() {
        let err = build("[binman._testing]\nreturn-unknown-contents = true\n").unwrap_err();
        assert_eq!(
            err.to_string(),
            "Section '/binman': Internal error: Could not complete processing of contents: remaining [/binman/_testing]"
        );
    }

    #[test]
    fn growth_is_allowed_once() {
        let image = build("[binman._testing]\nbad-update-contents = true\n").unwrap();
        assert_eq!(image.data(), b"aaa");

        let err = build("[binman._testing]\nbad-update-contents = true\nbad-update-contents-twice = true\n").unwrap_err();
        assert_eq!(
            err.to_string(),
            "Image 'image': Entries changed size after packing: '/binman/_testing' grew again from 3 to 4"
        );
    }

    #[test]
    fn contents_that_never_settle() {
        let err = build("[binman._testing]\nnever-settle-contents = true\n").unwrap_err();
        let message = err.to_string();
        assert!(
            message.starts_with(&format!("Image 'image': Contents did not settle after {MAX_PASSES} passes")),
            "{message}"
        );
        assert!(message.contains("/binman/_testing"), "{message}");
    }

    #[test]
    fn growth_when_expansion_is_disabled() {
        let node = Node::parse("[binman._testing]\nbad-update-contents = true\n").unwrap();
        let mut ctx = BuildContext::new();
        ctx.allow_expand = false;
        let mut image = Image::from_node(DEFAULT_IMAGE_NAME, &node, &ctx).unwrap();
        let err = image.build(&mut ctx).unwrap_err();
        assert_eq!(err.to_string(), "Node '/binman/_testing': Cannot update entry size from 2 to 3");
    }

    #[test]
    fn shrinking_needs_contract() {
        let err = build("[binman._testing]\nbad-shrink-contents = true\n").unwrap_err();
        assert_eq!(err.to_string(), "Node '/binman/_testing': Cannot update entry size from 2 to 1");

        let node = Node::parse("[binman._testing]\nbad-shrink-contents = true\n").unwrap();
        let mut ctx = BuildContext::new();
        ctx.allow_contract = true;
        let mut image = Image::from_node(DEFAULT_IMAGE_NAME, &node, &ctx).unwrap();
        image.build(&mut ctx).unwrap();
        assert_eq!(image.data(), b"a");
    }

    #[test]
    fn fdt_processing_must_finish() {
        build("[binman._testing]\n").unwrap();
        let err = build("[binman._testing]\nnever-complete-process-fdt = true\n").unwrap_err();
        assert_eq!(
            err.to_string(),
            "Image 'image': Could not complete processing of Fdt: remaining [/binman/_testing]"
        );
    }

    #[test]
    fn hash_covers_final_contents() {
        let image = build("[binman._testing]\n[binman._testing.hash]\nalgo = \"sha256\"\n").unwrap();
        let entry = image.find_entry("_testing").unwrap();
        assert_eq!(entry.hash_value.as_deref(), Some(crate::hash::HashAlgo::Sha256.digest(b"aa").as_slice()));
    }

    #[test]
    fn list_patterns_include_descendants() {
        let image = build(
            r#"
            [binman.section._testing]
            [binman.section."_testing@1"]
            [binman.fill]
            size = 2
            "#,
        )
        .unwrap();
        let names = |patterns: &[&str]| -> Vec<String> {
            let patterns: Vec<String> = patterns.iter().map(|p| p.to_string()).collect();
            image.list_entries(&patterns).unwrap().into_iter().map(|r| r.name).collect()
        };
        assert_eq!(names(&[]), ["main-section", "section", "_testing", "_testing@1", "fill"]);
        assert_eq!(names(&["section"]), ["section", "_testing", "_testing@1"]);
        assert_eq!(names(&["*/_testing@*"]), ["_testing@1"]);
        assert_eq!(names(&["fi*"]), ["fill"]);
    }
}
