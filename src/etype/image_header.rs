//! `image-header` entries: a pointer to the fdtmap at a fixed place.

use crate::entry::{EntryContext, EntryType};
use crate::error::{ConfigError, FormatError, Result};
use crate::format::image_header::{encode_header, IMAGE_HEADER_LEN, UNKNOWN_POS};
use crate::node::Node;
use crate::state::BuildContext;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Location {
    Start,
    End,
}

#[derive(Debug, Default)]
pub struct ImageHeader {
    pub location: Option<Location>,
}

impl EntryType for ImageHeader {
    fn read_node(&mut self, node: &Node, _ctx: &BuildContext) -> Result<()> {
        self.location = match node.get_str("location")?.as_deref() {
            None => None,
            Some("start") => Some(Location::Start),
            Some("end") => Some(Location::End),
            Some(other) => {
                return Err(ConfigError::Invalid {
                    path: node.path.clone(),
                    message: format!("Invalid location '{other}', expected 'start' or 'end'"),
                }
                .into())
            }
        };
        Ok(())
    }

    fn obtain_contents(&mut self, cx: &EntryContext<'_>) -> Result<Option<Vec<u8>>> {
        let section = cx.parent.unwrap_or(cx.image);
        let fdtmap = section
            .children
            .iter()
            .find(|c| c.etype == "fdtmap")
            .ok_or_else(|| FormatError::MissingSibling {
                path: cx.path().to_string(),
                etype: "image-header".to_string(),
                sibling: "fdtmap".to_string(),
            })?;
        let pos = fdtmap
            .image_pos
            .and_then(|pos| u32::try_from(pos).ok())
            .unwrap_or(UNKNOWN_POS);
        Ok(Some(encode_header(pos)))
    }

    fn process_contents(&mut self, cx: &EntryContext<'_>) -> Result<Option<Vec<u8>>> {
        self.obtain_contents(cx)
    }

    fn default_offset(&self, path: &str, section_size: Option<u64>) -> Result<Option<u64>> {
        match self.location {
            None => Ok(None),
            Some(Location::Start) => Ok(Some(0)),
            Some(Location::End) => match section_size {
                Some(size) if size >= IMAGE_HEADER_LEN => Ok(Some(size - IMAGE_HEADER_LEN)),
                _ => Err(ConfigError::Invalid {
                    path: path.to_string(),
                    message: "Image size must be known to place the image header at the end".to_string(),
                }
                .into()),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use crate::entry::Entry;
    use crate::node::Node;
    use crate::state::BuildContext;

    #[test]
    fn bad_location() {
        let root = Node::parse("[binman.image-header]\nlocation = \"middle\"\n").unwrap();
        let err = Entry::create(&root.children[0], "", &BuildContext::new()).unwrap_err();
        assert_eq!(
            err.to_string(),
            "Node '/binman/image-header': Invalid location 'middle', expected 'start' or 'end'"
        );
    }
}
