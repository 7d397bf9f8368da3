//! `_testing` entries: contents of `aa` with switches that provoke the
//! failure paths of a build. Not meant for real images.

use crate::entry::{get_entry_args_or_props, ArgType, ArgValue, EntryArg, EntryContext, EntryType};
use crate::error::Result;
use crate::fdt::DeviceTree;
use crate::node::Node;
use crate::state::BuildContext;

const TEST_ARGS: [EntryArg; 4] = [
    EntryArg::new("test-str-fdt", ArgType::Str),
    EntryArg::new("test-str-arg", ArgType::Str),
    EntryArg::new("test-int-fdt", ArgType::Int),
    EntryArg::new("test-int-arg", ArgType::Int),
];

#[derive(Debug, Default)]
pub struct Testing {
    return_unknown_contents: bool,
    return_contents_once: bool,
    bad_update_contents: bool,
    bad_update_contents_twice: bool,
    bad_shrink_contents: bool,
    never_settle_contents: bool,
    never_complete_process_fdt: bool,
    process_fdt_ready: bool,
    contents_returned: bool,
    rounds: u32,
    /// Values of the test arguments, in the order of `TEST_ARGS`.
    pub args: Vec<Option<ArgValue>>,
    data: Vec<u8>,
}

impl EntryType for Testing {
    fn read_node(&mut self, node: &Node, ctx: &BuildContext) -> Result<()> {
        self.return_unknown_contents = node.get_bool("return-unknown-contents");
        self.return_contents_once = node.get_bool("return-contents-once");
        self.bad_update_contents = node.get_bool("bad-update-contents");
        self.bad_update_contents_twice = node.get_bool("bad-update-contents-twice");
        self.bad_shrink_contents = node.get_bool("bad-shrink-contents");
        self.never_settle_contents = node.get_bool("never-settle-contents");
        self.never_complete_process_fdt = node.get_bool("never-complete-process-fdt");
        self.args = get_entry_args_or_props(node, ctx, &TEST_ARGS, node.get_bool("require-args"))?;
        if node.get_bool("force-bad-datatype") {
            get_entry_args_or_props(
                node,
                ctx,
                &[EntryArg::new("test-bad-datatype-arg", ArgType::Other("float"))],
                false,
            )?;
        }
        Ok(())
    }

    fn obtain_contents(&mut self, _cx: &EntryContext<'_>) -> Result<Option<Vec<u8>>> {
        if self.return_unknown_contents || (self.return_contents_once && self.contents_returned) {
            return Ok(None);
        }
        self.contents_returned = true;
        self.data = b"aa".to_vec();
        Ok(Some(self.data.clone()))
    }

    fn process_contents(&mut self, _cx: &EntryContext<'_>) -> Result<Option<Vec<u8>>> {
        if self.never_settle_contents {
            // Same size every round, different bytes.
            self.rounds += 1;
            let data: &[u8] = if self.rounds % 2 == 1 { b"ba" } else { b"ab" };
            return Ok(Some(data.to_vec()));
        }
        if self.bad_update_contents {
            self.data = if self.bad_update_contents_twice {
                let mut grown = self.data.clone();
                grown.push(b'a');
                grown
            } else {
                b"aaa".to_vec()
            };
            return Ok(Some(self.data.clone()));
        }
        if self.bad_shrink_contents {
            return Ok(Some(b"a".to_vec()));
        }
        Ok(None)
    }

    fn process_fdt(&mut self, _cx: &EntryContext<'_>, _updated: &mut Vec<(String, DeviceTree)>) -> Result<bool> {
        let ready = self.process_fdt_ready;
        if !self.never_complete_process_fdt {
            self.process_fdt_ready = true;
        }
        Ok(ready)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entry::Entry;

    fn create(text: &str, ctx: &BuildContext) -> Result<Entry> {
        Entry::create(&Node::parse(text).unwrap().children[0], "", ctx)
    }

    #[test]
    fn required_args_are_reported() {
        let mut ctx = BuildContext::new();
        ctx.set_entry_args(&["test-int-arg=1"]).unwrap();
        let err = create("[binman._testing]\nrequire-args = true\ntest-str-fdt = \"x\"\n", &ctx).unwrap_err();
        assert_eq!(
            err.to_string(),
            "Node '/binman/_testing': Missing required properties/entry args: test-str-arg, test-int-fdt"
        );
    }

    #[test]
    fn bad_datatype() {
        let err = create("[binman._testing]\nforce-bad-datatype = true\n", &BuildContext::new()).unwrap_err();
        assert!(err
            .to_string()
            .contains("Unknown data type 'float' for entry arg 'test-bad-datatype-arg'"));
    }
}
