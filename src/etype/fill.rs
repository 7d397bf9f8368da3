//! `fill` entries: a region of a single repeated byte.

use crate::entry::{EntryContext, EntryType};
use crate::error::{ConfigError, Result};
use crate::node::Node;
use crate::state::BuildContext;

#[derive(Debug, Default)]
pub struct Fill {
    size: u64,
    fill_byte: u8,
}

impl EntryType for Fill {
    fn read_node(&mut self, node: &Node, _ctx: &BuildContext) -> Result<()> {
        let invalid = |message: &str| ConfigError::Invalid {
            path: node.path.clone(),
            message: message.to_string(),
        };
        self.size = node
            .get_int("size")?
            .ok_or_else(|| invalid("'fill' entry must have a size property"))?;
        if let Some(byte) = node.get_int("fill-byte")? {
            self.fill_byte = u8::try_from(byte).map_err(|_| invalid("fill-byte must fit in one byte"))?;
        }
        Ok(())
    }

    fn obtain_contents(&mut self, _cx: &EntryContext<'_>) -> Result<Option<Vec<u8>>> {
        Ok(Some(vec![self.fill_byte; self.size as usize]))
    }
}
