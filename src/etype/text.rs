//! `text` entries: a string, given directly or through an entry argument.

use crate::entry::{EntryContext, EntryType};
use crate::error::{ConfigError, Result};
use crate::node::Node;
use crate::state::BuildContext;

#[derive(Debug, Default)]
pub struct Text {
    value: Vec<u8>,
}

impl EntryType for Text {
    fn read_node(&mut self, node: &Node, ctx: &BuildContext) -> Result<()> {
        let value = match node.get_str("text-label")? {
            Some(label) => match node.get_str(&label)? {
                Some(value) => Some(value),
                None => ctx.entry_arg(&label).map(str::to_string),
            }
            .ok_or_else(|| format!("No value provided for text label '{label}'")),
            None => node
                .get_str("text")?
                .ok_or_else(|| "No value provided for text label 'None'".to_string()),
        };
        match value {
            Ok(value) => self.value = value.into_bytes(),
            Err(_) if ctx.reading_back => {}
            Err(message) => {
                return Err(ConfigError::Invalid {
                    path: node.path.clone(),
                    message,
                }
                .into())
            }
        }
        Ok(())
    }

    fn obtain_contents(&mut self, _cx: &EntryContext<'_>) -> Result<Option<Vec<u8>>> {
        Ok(Some(self.value.clone()))
    }
}

#[cfg(test)]
mod tests {
    use crate::entry::Entry;
    use crate::node::Node;
    use crate::state::BuildContext;

    fn create(text: &str, ctx: &BuildContext) -> crate::error::Result<Entry> {
        Entry::create(&Node::parse(text).unwrap().children[0], "", ctx)
    }

    #[test]
    fn label_is_looked_up_in_props_then_args() {
        let mut ctx = BuildContext::new();
        ctx.set_entry_args(&["test-id=board-1"]).unwrap();
        assert!(create("[binman.text]\ntext-label = \"test-id\"\n", &ctx).is_ok());
        assert!(create("[binman.text]\ntext-label = \"msg\"\nmsg = \"hi\"\n", &ctx).is_ok());

        let err = create("[binman.text]\ntext-label = \"test-id2\"\n", &ctx).unwrap_err();
        assert_eq!(
            err.to_string(),
            "Node '/binman/text': No value provided for text label 'test-id2'"
        );
    }
}
