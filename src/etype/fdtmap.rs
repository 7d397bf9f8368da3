//! `fdtmap` entries: the layout of the image, stored inside it so that the
//! image can be listed and modified later.

use crate::entry::{EntryContext, EntryType};
use crate::error::Result;
use crate::format::fdtmap::build_fdtmap;

#[derive(Debug)]
pub struct Fdtmap;

impl Fdtmap {
    fn build(cx: &EntryContext<'_>) -> Vec<u8> {
        let repack = cx.image.get_bool("allow-repack");
        build_fdtmap(cx.parent.unwrap_or(cx.image), repack)
    }
}

impl EntryType for Fdtmap {
    fn obtain_contents(&mut self, cx: &EntryContext<'_>) -> Result<Option<Vec<u8>>> {
        Ok(Some(Self::build(cx)))
    }

    fn process_contents(&mut self, cx: &EntryContext<'_>) -> Result<Option<Vec<u8>>> {
        Ok(Some(Self::build(cx)))
    }
}
