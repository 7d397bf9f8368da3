//! `fmap` entries: a flash map describing every entry of the image.

use crate::entry::{EntryContext, EntryType, EntryView};
use crate::error::Result;
use crate::format::fmap::{encode_fmap, FmapArea, FMAP_AREA_COMPRESSED, FMAP_AREA_RO};

#[derive(Debug)]
pub struct Fmap;

fn area(view: &EntryView) -> FmapArea {
    let mut flags = 0;
    if view.get_bool("read-only") {
        flags |= FMAP_AREA_RO;
    }
    if !view.compress.is_none() {
        flags |= FMAP_AREA_COMPRESSED;
    }
    FmapArea {
        offset: view.image_pos.unwrap_or(0) as u32,
        size: view.size.unwrap_or(0) as u32,
        name: view.name.clone(),
        flags,
    }
}

/// Lists the leaf entries below `section`. Nested sections are flattened;
/// other composites such as a CBFS count as one area.
fn collect_areas(section: &EntryView, areas: &mut Vec<FmapArea>) {
    for child in &section.children {
        if child.is_section {
            collect_areas(child, areas);
        } else {
            areas.push(area(child));
        }
    }
}

impl Fmap {
    fn build(cx: &EntryContext<'_>) -> Vec<u8> {
        let mut areas = Vec::new();
        collect_areas(cx.image, &mut areas);
        encode_fmap(
            cx.image.skip_at_start,
            cx.image.size.unwrap_or(0) as u32,
            "FMAP",
            &areas,
        )
    }
}

impl EntryType for Fmap {
    fn obtain_contents(&mut self, cx: &EntryContext<'_>) -> Result<Option<Vec<u8>>> {
        Ok(Some(Self::build(cx)))
    }

    fn process_contents(&mut self, cx: &EntryContext<'_>) -> Result<Option<Vec<u8>>> {
        Ok(Some(Self::build(cx)))
    }
}
