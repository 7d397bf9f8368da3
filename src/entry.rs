//! Entries: the placed regions of an image.
//!
//! An [`Entry`] holds everything common to all regions (position, size,
//! alignment, padding, contents) and delegates the variant-specific parts to a
//! boxed [`EntryType`]. Composite variants (sections, CBFS) own their children
//! through the same trait, so the build phases simply recurse through
//! [`EntryType::children_mut`].
//!
//! Entries that need to know about other entries (maps, headers, symbol
//! patching) never reach into the live tree. Each pass first takes an
//! immutable [`EntryView`] snapshot of the whole image and hands it to the
//! variants through an [`EntryContext`].

use std::collections::BTreeSet;
use std::fmt;

use indexmap::IndexMap;

use crate::compress::{self, Compression};
use crate::error::{ConfigError, ContentError, Result};
use crate::etype;
use crate::etype::section::Section;
use crate::fdt::DeviceTree;
use crate::hash::{self, HashAlgo};
use crate::node::{Node, Value};
use crate::state::BuildContext;

/// Behavior of one entry variant.
///
/// Every method has a default so that simple variants only implement what they
/// need.
pub trait EntryType: fmt::Debug {
    /// Reads variant-specific properties. Common properties are already handled.
    fn read_node(&mut self, _node: &Node, _ctx: &BuildContext) -> Result<()> {
        Ok(())
    }

    /// Produces the initial contents, or `None` if they are not available yet.
    fn obtain_contents(&mut self, _cx: &EntryContext<'_>) -> Result<Option<Vec<u8>>> {
        Ok(Some(Vec::new()))
    }

    /// Regenerates the contents once positions are known. `None` keeps the current contents.
    fn process_contents(&mut self, _cx: &EntryContext<'_>) -> Result<Option<Vec<u8>>> {
        Ok(None)
    }

    /// Writes final positions into device trees. Returns `false` to be asked again.
    fn process_fdt(&mut self, _cx: &EntryContext<'_>, _updated: &mut Vec<(String, DeviceTree)>) -> Result<bool> {
        Ok(true)
    }

    fn default_filename(&self) -> Option<&str> {
        None
    }

    /// Offset to use when none is given, once the parent section's size is known.
    fn default_offset(&self, _path: &str, _section_size: Option<u64>) -> Result<Option<u64>> {
        Ok(None)
    }

    fn children(&self) -> &[Entry] {
        &[]
    }

    fn children_mut(&mut self) -> &mut [Entry] {
        &mut []
    }

    fn as_section(&self) -> Option<&Section> {
        None
    }

    fn as_section_mut(&mut self) -> Option<&mut Section> {
        None
    }

    /// Restores child contents from this entry's bytes when reading an image back.
    fn load_children(&mut self, _path: &str, _data: &[u8]) -> Result<()> {
        Ok(())
    }
}

/// Data type requested from [`get_entry_args_or_props`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArgType {
    Str,
    Int,
    Bool,
    /// Anything else; only used to report unsupported requests.
    Other(&'static str),
}

/// A named argument an entry wants, looked up first as a property, then as an entry arg.
#[derive(Debug, Clone, Copy)]
pub struct EntryArg {
    pub name: &'static str,
    pub datatype: ArgType,
}

impl EntryArg {
    pub const fn new(name: &'static str, datatype: ArgType) -> Self {
        Self { name, datatype }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ArgValue {
    Str(String),
    Int(u64),
    Bool(bool),
}

impl ArgValue {
    pub fn as_str(&self) -> Option<&str> {
        match self {
            ArgValue::Str(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_int(&self) -> Option<u64> {
        match self {
            ArgValue::Int(v) => Some(*v),
            _ => None,
        }
    }
}

fn parse_int(text: &str) -> Option<u64> {
    let text = text.trim();
    match text.strip_prefix("0x").or_else(|| text.strip_prefix("0X")) {
        Some(hex) => u64::from_str_radix(hex, 16).ok(),
        None => text.parse().ok(),
    }
}

/// Looks up each requested argument in the node's properties, then in the entry args.
///
/// When `required` is set, every missing name is collected and reported at once.
pub fn get_entry_args_or_props(
    node: &Node,
    ctx: &BuildContext,
    args: &[EntryArg],
    required: bool,
) -> Result<Vec<Option<ArgValue>>> {
    let mut values = Vec::with_capacity(args.len());
    let mut missing = Vec::new();
    for arg in args {
        let value = match arg.datatype {
            ArgType::Other(datatype) => {
                return Err(ConfigError::BadDatatype {
                    name: arg.name.to_string(),
                    datatype: datatype.to_string(),
                }
                .into())
            }
            ArgType::Str => match node.get_str(arg.name)? {
                Some(s) => Some(ArgValue::Str(s)),
                None => ctx.entry_arg(arg.name).map(|s| ArgValue::Str(s.to_string())),
            },
            ArgType::Int => match node.get_int(arg.name)? {
                Some(v) => Some(ArgValue::Int(v)),
                None => match ctx.entry_arg(arg.name) {
                    Some(text) => Some(ArgValue::Int(parse_int(text).ok_or_else(|| {
                        ConfigError::BadEntryArg {
                            path: node.path.clone(),
                            name: arg.name.to_string(),
                            value: text.to_string(),
                        }
                    })?)),
                    None => None,
                },
            },
            ArgType::Bool => {
                if node.has(arg.name) {
                    Some(ArgValue::Bool(node.get_bool(arg.name)))
                } else {
                    ctx.entry_arg(arg.name)
                        .map(|s| ArgValue::Bool(!matches!(s, "" | "0" | "false")))
                }
            }
        };
        if value.is_none() {
            missing.push(arg.name.to_string());
        }
        values.push(value);
    }
    if required && !missing.is_empty() {
        return Err(ConfigError::MissingRequired {
            path: node.path.clone(),
            names: missing,
        }
        .into());
    }
    Ok(values)
}

/// Snapshot of an entry and its descendants, taken at the start of a pass.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EntryView {
    pub name: String,
    pub etype: String,
    pub path: String,
    /// Properties of the description node.
    pub props: IndexMap<String, Value>,
    pub offset: Option<u64>,
    pub size: Option<u64>,
    pub image_pos: Option<u64>,
    pub contents_size: u64,
    pub pad_before: u64,
    pub pad_after: u64,
    pub compress: Compression,
    pub uncomp_size: Option<u64>,
    pub orig_offset: Option<u64>,
    pub orig_size: Option<u64>,
    pub hash: Option<(HashAlgo, Option<Vec<u8>>)>,
    pub is_section: bool,
    pub skip_at_start: u64,
    pub children: Vec<EntryView>,
}

impl EntryView {
    /// Finds a view by absolute path.
    pub fn find_path(&self, path: &str) -> Option<&EntryView> {
        if self.path == path {
            return Some(self);
        }
        let rest = path.strip_prefix(self.path.as_str())?.strip_prefix('/')?;
        let name = rest.split('/').next()?;
        let child_path = format!("{}/{name}", self.path);
        self.children
            .iter()
            .find(|c| c.path == child_path)?
            .find_path(path)
    }

    /// Depth-first search by entry name.
    pub fn find_name(&self, name: &str) -> Option<&EntryView> {
        for child in &self.children {
            if child.name == name {
                return Some(child);
            }
            if let Some(found) = child.find_name(name) {
                return Some(found);
            }
        }
        None
    }

    pub fn child(&self, name: &str) -> Option<&EntryView> {
        self.children.iter().find(|c| c.name == name)
    }

    /// The last component of the node path, i.e. the node name.
    pub fn node_name(&self) -> &str {
        self.path.rsplit('/').next().unwrap_or(&self.path)
    }

    pub fn get_bool(&self, name: &str) -> bool {
        !matches!(self.props.get(name), None | Some(Value::Bool(false)))
    }
}

/// What a variant can see while it runs.
pub struct EntryContext<'a> {
    /// The whole image.
    pub image: &'a EntryView,
    /// The entry being processed.
    pub this: &'a EntryView,
    /// The composite entry containing it, if any.
    pub parent: Option<&'a EntryView>,
    /// Current contents of the entry.
    pub data: &'a [u8],
    pub build: &'a BuildContext,
}

impl<'a> EntryContext<'a> {
    fn new(image: &'a EntryView, path: &str, data: &'a [u8], build: &'a BuildContext) -> Option<Self> {
        let this = image.find_path(path)?;
        let parent = path
            .rsplit_once('/')
            .and_then(|(parent, _)| image.find_path(parent))
            .filter(|p| p.path != this.path);
        Some(Self {
            image,
            this,
            parent,
            data,
            build,
        })
    }

    pub fn path(&self) -> &str {
        &self.this.path
    }
}

/// Changes seen during one round of content processing.
#[derive(Debug, Default)]
pub(crate) struct RoundOutcome {
    pub image: String,
    /// Entries whose bytes changed but not their size.
    pub changed: Vec<String>,
    /// Entries whose size changed; the image must be packed again.
    pub resized: Vec<String>,
}

impl RoundOutcome {
    pub fn new(image: &str) -> Self {
        Self {
            image: image.to_string(),
            ..Default::default()
        }
    }

    pub fn is_settled(&self) -> bool {
        self.changed.is_empty() && self.resized.is_empty()
    }
}

/// One row of an entry listing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ListEntry {
    pub indent: usize,
    pub name: String,
    pub etype: String,
    pub size: Option<u64>,
    pub image_pos: Option<u64>,
    pub uncomp_size: Option<u64>,
    pub offset: Option<u64>,
    /// Path relative to the image root, `/`-separated.
    pub path: String,
}

/// A placed region of an image.
#[derive(Debug)]
pub struct Entry {
    pub name: String,
    pub etype: String,
    /// Path of the description node, e.g. `/binman/section/u-boot`.
    pub path: String,
    pub node: Node,
    pub offset: Option<u64>,
    pub size: Option<u64>,
    /// Offset requested by the description.
    pub fixed_offset: Option<u64>,
    /// Size requested by the description.
    pub fixed_size: Option<u64>,
    pub contents_size: u64,
    pub pad_before: u64,
    pub pad_after: u64,
    pub align: Option<u64>,
    pub align_size: Option<u64>,
    pub align_end: Option<u64>,
    /// Absolute position in the image, excluding any skipped region.
    pub image_pos: Option<u64>,
    /// Grow to fill the space up to the next entry.
    pub expand_size: bool,
    pub allow_expand: bool,
    pub allow_contract: bool,
    pub expanded_once: bool,
    pub compress: Compression,
    pub uncomp_size: Option<u64>,
    pub orig_offset: Option<u64>,
    pub orig_size: Option<u64>,
    pub hash: Option<HashAlgo>,
    pub hash_value: Option<Vec<u8>>,
    pub data: Vec<u8>,
    pub has_contents: bool,
    kind: Box<dyn EntryType>,
}

pub(crate) fn power_of_two(node: &Node, prop: &str, what: &'static str) -> Result<Option<u64>> {
    match node.get_int(prop)? {
        Some(value) if !value.is_power_of_two() => Err(ConfigError::NotPowerOfTwo {
            path: node.path.clone(),
            what,
            value,
        }
        .into()),
        other => Ok(other),
    }
}

impl Entry {
    /// Creates an entry for `node`, picking the variant from its type.
    pub fn create(node: &Node, name_prefix: &str, ctx: &BuildContext) -> Result<Entry> {
        let etype = node.etype()?;
        let kind = etype::create(&etype).ok_or_else(|| ConfigError::UnknownVariant {
            path: node.path.clone(),
            etype: etype.clone(),
        })?;
        Entry::with_kind(node, &format!("{name_prefix}{}", node.name), &etype, kind, ctx)
    }

    pub(crate) fn with_kind(
        node: &Node,
        name: &str,
        etype: &str,
        kind: Box<dyn EntryType>,
        ctx: &BuildContext,
    ) -> Result<Entry> {
        let mut entry = Entry {
            name: name.to_string(),
            etype: etype.to_string(),
            path: node.path.clone(),
            node: node.clone(),
            offset: None,
            size: None,
            fixed_offset: None,
            fixed_size: None,
            contents_size: 0,
            pad_before: 0,
            pad_after: 0,
            align: None,
            align_size: None,
            align_end: None,
            image_pos: None,
            expand_size: false,
            allow_expand: ctx.allow_expand,
            allow_contract: ctx.allow_contract,
            expanded_once: false,
            compress: Compression::None,
            uncomp_size: None,
            orig_offset: None,
            orig_size: None,
            hash: None,
            hash_value: None,
            data: Vec::new(),
            has_contents: false,
            kind,
        };
        entry.read_node(node, ctx)?;
        Ok(entry)
    }

    fn read_node(&mut self, node: &Node, ctx: &BuildContext) -> Result<()> {
        self.fixed_offset = node.get_int("offset")?;
        self.fixed_size = node.get_int("size")?;
        self.orig_offset = node.get_int("orig-offset")?;
        self.orig_size = node.get_int("orig-size")?;
        self.uncomp_size = node.get_int("uncomp-size")?;
        self.pad_before = node.get_int("pad-before")?.unwrap_or(0);
        self.pad_after = node.get_int("pad-after")?.unwrap_or(0);
        self.align = power_of_two(node, "align", "Alignment")?;
        self.align_size = power_of_two(node, "align-size", "Alignment size")?;
        self.align_end = power_of_two(node, "align-end", "Alignment end")?;
        self.expand_size = node.get_bool("expand-size");
        if let Some(algo) = node.get_str("compress")? {
            self.compress = Compression::from_name(&node.path, &algo)?;
        }
        self.hash = hash::read_hash_node(node)?;
        if let Some(Value::Bytes(value)) = node.subnode("hash").and_then(|h| h.props.get("value")) {
            self.hash_value = Some(value.clone());
        }
        self.kind.read_node(node, ctx)
    }

    pub fn kind(&self) -> &dyn EntryType {
        self.kind.as_ref()
    }

    pub fn kind_mut(&mut self) -> &mut dyn EntryType {
        self.kind.as_mut()
    }

    pub fn children(&self) -> &[Entry] {
        self.kind.children()
    }

    pub fn is_section(&self) -> bool {
        self.kind.as_section().is_some()
    }

    pub fn default_filename(&self) -> Option<&str> {
        self.kind.default_filename()
    }

    /// Bytes available for contents inside the placed region.
    pub fn inner_size(&self) -> u64 {
        self.size
            .unwrap_or(self.contents_size + self.pad_before + self.pad_after)
            .saturating_sub(self.pad_before + self.pad_after)
    }

    /// Stores freshly produced contents, compressing them if requested.
    pub fn set_contents(&mut self, raw: Vec<u8>) -> Result<()> {
        self.data = self.encode(raw)?;
        self.contents_size = self.data.len() as u64;
        Ok(())
    }

    fn encode(&mut self, raw: Vec<u8>) -> Result<Vec<u8>> {
        if self.compress.is_none() {
            return Ok(raw);
        }
        self.uncomp_size = Some(raw.len() as u64);
        compress::compress(&self.path, self.compress, &raw)
    }

    /// Takes a snapshot of this entry and its descendants.
    pub fn view(&self) -> EntryView {
        let section = self.kind.as_section();
        EntryView {
            name: self.name.clone(),
            etype: self.etype.clone(),
            path: self.path.clone(),
            props: self.node.props.clone(),
            offset: self.offset,
            size: self.size,
            image_pos: self.image_pos,
            contents_size: self.contents_size,
            pad_before: self.pad_before,
            pad_after: self.pad_after,
            compress: self.compress,
            uncomp_size: self.uncomp_size,
            orig_offset: self.orig_offset.or(self.fixed_offset),
            orig_size: self.orig_size.or(self.fixed_size),
            hash: self.hash.map(|algo| (algo, self.hash_value.clone())),
            is_section: section.is_some(),
            skip_at_start: section.map_or(0, |s| s.skip_at_start),
            children: self.kind.children().iter().map(Entry::view).collect(),
        }
    }

    /// Phase 1: obtains contents for this entry and its children.
    ///
    /// Entries that cannot provide contents yet are added to `remaining`.
    pub(crate) fn obtain_contents(
        &mut self,
        image: &EntryView,
        ctx: &BuildContext,
        remaining: &mut Vec<String>,
    ) -> Result<()> {
        let mut children_ready = true;
        for child in self.kind.children_mut() {
            child.obtain_contents(image, ctx, remaining)?;
            children_ready &= child.has_contents;
        }
        if self.has_contents || !children_ready {
            return Ok(());
        }
        let Some(cx) = EntryContext::new(image, &self.path, &self.data, ctx) else {
            remaining.push(self.path.clone());
            return Ok(());
        };
        match self.kind.obtain_contents(&cx)? {
            Some(raw) => {
                self.set_contents(raw)?;
                self.has_contents = true;
                tracing::trace!("{}: obtained {:#x} bytes", self.path, self.contents_size);
            }
            None => remaining.push(self.path.clone()),
        }
        Ok(())
    }

    /// Phase 3: regenerates contents now that positions are known.
    pub(crate) fn process_contents(
        &mut self,
        image: &EntryView,
        ctx: &BuildContext,
        outcome: &mut RoundOutcome,
    ) -> Result<()> {
        for child in self.kind.children_mut() {
            child.process_contents(image, ctx, outcome)?;
        }
        if let Some(section) = self.kind.as_section() {
            // Child positions are stale once something changed size.
            if outcome.resized.is_empty() {
                let data = section.build_contents(self.inner_size());
                if data != self.data {
                    outcome.changed.push(self.path.clone());
                    self.data = data;
                }
            }
        } else {
            let new = match EntryContext::new(image, &self.path, &self.data, ctx) {
                Some(cx) => self.kind.process_contents(&cx)?,
                None => None,
            };
            if let Some(raw) = new {
                self.update_contents(raw, outcome)?;
            }
        }
        self.update_hash(outcome);
        Ok(())
    }

    /// Applies the resize policy to contents produced after packing.
    pub(crate) fn update_contents(&mut self, raw: Vec<u8>, outcome: &mut RoundOutcome) -> Result<()> {
        let data = self.encode(raw)?;
        let old = self.contents_size;
        let new = data.len() as u64;
        if new == old {
            if data != self.data {
                outcome.changed.push(self.path.clone());
                self.data = data;
            }
            return Ok(());
        }
        if new > old {
            if !self.allow_expand {
                return Err(ContentError::SizeMismatch {
                    path: self.path.clone(),
                    old,
                    new,
                }
                .into());
            }
            if self.expanded_once {
                return Err(ContentError::EntriesChangedSizeAfterPacking {
                    image: outcome.image.clone(),
                    path: self.path.clone(),
                    old,
                    new,
                }
                .into());
            }
            self.expanded_once = true;
        } else if !self.allow_contract {
            return Err(ContentError::SizeMismatch {
                path: self.path.clone(),
                old,
                new,
            }
            .into());
        }
        tracing::debug!("{}: contents size changed from {old:#x} to {new:#x}", self.path);
        self.data = data;
        self.contents_size = new;
        outcome.resized.push(self.path.clone());
        Ok(())
    }

    fn update_hash(&mut self, outcome: &mut RoundOutcome) {
        let Some(algo) = self.hash else { return };
        let digest = algo.digest(&self.data);
        if self.hash_value.as_deref() != Some(digest.as_slice()) {
            tracing::trace!("{}: {} {}", self.path, algo.name(), hex::encode(&digest));
            self.hash_value = Some(digest);
            outcome.changed.push(self.path.clone());
        }
    }

    /// Phase 4: lets each pending entry write into device trees.
    pub(crate) fn process_fdt(
        &mut self,
        image: &EntryView,
        ctx: &BuildContext,
        pending: &mut BTreeSet<String>,
        updated: &mut Vec<(String, DeviceTree)>,
    ) -> Result<()> {
        for child in self.kind.children_mut() {
            child.process_fdt(image, ctx, pending, updated)?;
        }
        if !pending.contains(&self.path) {
            return Ok(());
        }
        let ready = match EntryContext::new(image, &self.path, &self.data, ctx) {
            Some(cx) => self.kind.process_fdt(&cx, updated)?,
            None => false,
        };
        if ready {
            pending.remove(&self.path);
        }
        Ok(())
    }

    /// Sets absolute positions for this entry and its descendants.
    pub fn set_image_pos(&mut self, image_pos: u64) {
        self.image_pos = Some(image_pos);
        let base = image_pos + self.pad_before;
        let skip = self.kind.as_section().map_or(0, |s| s.skip_at_start);
        for child in self.kind.children_mut() {
            if let Some(offset) = child.offset {
                child.set_image_pos(base + offset.saturating_sub(skip));
            }
        }
    }

    /// All bytes of the placed region: padding, contents and trailing fill.
    pub fn region_data(&self) -> Vec<u8> {
        let size = self
            .size
            .unwrap_or(self.pad_before + self.data.len() as u64 + self.pad_after) as usize;
        let mut out = vec![0u8; size];
        let start = (self.pad_before as usize).min(size);
        let n = self.data.len().min(size - start);
        out[start..start + n].copy_from_slice(&self.data[..n]);
        out
    }

    /// Paths of this entry and all descendants.
    pub fn paths(&self, out: &mut BTreeSet<String>) {
        out.insert(self.path.clone());
        for child in self.kind.children() {
            child.paths(out);
        }
    }

    /// Finds a descendant by `/`-separated path relative to this entry.
    pub fn find(&self, rel: &str) -> Option<&Entry> {
        let mut entry = self;
        for part in rel.split('/').filter(|p| !p.is_empty()) {
            entry = entry.kind.children().iter().find(|c| c.name == part)?;
        }
        Some(entry)
    }

    pub fn find_mut(&mut self, rel: &str) -> Option<&mut Entry> {
        let mut entry = self;
        for part in rel.split('/').filter(|p| !p.is_empty()) {
            entry = entry.kind.children_mut().iter_mut().find(|c| c.name == part)?;
        }
        Some(entry)
    }

    /// Appends map lines for this entry and its descendants.
    pub fn write_map(&self, out: &mut String, indent: usize) {
        out.push_str(&format!(
            "{:>8}  {}{:>8}  {:>8}  {}\n",
            to_hex(self.image_pos),
            " ".repeat(indent),
            to_hex(self.offset),
            to_hex(self.size),
            self.name
        ));
        for child in self.kind.children() {
            child.write_map(out, indent + 2);
        }
    }

    /// Appends list rows for this entry and its descendants.
    pub fn list(&self, rel_path: &str, indent: usize, out: &mut Vec<ListEntry>) {
        out.push(ListEntry {
            indent,
            name: self.name.clone(),
            etype: self.etype.clone(),
            size: self.size,
            image_pos: self.image_pos,
            uncomp_size: self.uncomp_size,
            offset: self.offset,
            path: rel_path.to_string(),
        });
        for child in self.kind.children() {
            let child_path = if rel_path.is_empty() {
                child.name.clone()
            } else {
                format!("{rel_path}/{}", child.name)
            };
            child.list(&child_path, indent + 1, out);
        }
    }

    /// Restores contents from an image file, for entries rebuilt from an fdtmap.
    pub(crate) fn load_data(&mut self, image: &[u8]) -> Result<()> {
        if let (Some(pos), Some(size)) = (self.image_pos, self.size) {
            let start = (pos + self.pad_before) as usize;
            let end = (pos + size).saturating_sub(self.pad_after) as usize;
            let region = image.get(start..end.max(start)).ok_or_else(|| ConfigError::Invalid {
                path: self.path.clone(),
                message: format!("Entry at {pos:#x} (size {size:#x}) lies outside the image"),
            })?;
            self.data = region.to_vec();
            self.contents_size = self.data.len() as u64;
        }
        for child in self.kind.children_mut() {
            child.load_data(image)?;
        }
        let data = self.data.clone();
        self.kind.load_children(&self.path, &data)?;
        self.has_contents = true;
        Ok(())
    }

    /// Returns the contents, decompressed if asked and if the entry is compressed.
    pub fn read_data(&self, decompress: bool) -> Result<Vec<u8>> {
        if decompress {
            compress::decompress(&self.path, self.compress, &self.data)
        } else {
            Ok(self.data.clone())
        }
    }
}

fn to_hex(value: Option<u64>) -> String {
    match value {
        Some(v) => format!("{v:08x}"),
        None => "<none>".to_string(),
    }
}
