//! The image description tree.
//!
//! A description is a tree of named nodes, each carrying an ordered set of
//! properties. It is read from TOML: tables become child nodes (keeping their
//! order), scalars become properties and integer arrays become byte strings.
//! The same structure is rebuilt from the device tree stored in an fdtmap, in
//! which case every property arrives as raw bytes; the typed getters below
//! accept both forms.

use std::path::Path;

use indexmap::IndexMap;

use crate::error::{ConfigError, Error, Result};
use crate::utils::base_name;

/// The name of the root table holding image descriptions.
pub const ROOT_NAME: &str = "binman";

/// A property value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Value {
    Int(u64),
    Str(String),
    Bool(bool),
    /// Raw bytes, as found in a device tree (big-endian cells, NUL-terminated strings).
    Bytes(Vec<u8>),
}

impl Value {
    /// Encodes the value as a device-tree property body.
    pub fn to_fdt_bytes(&self) -> Vec<u8> {
        match self {
            Value::Int(v) => match u32::try_from(*v) {
                Ok(v) => v.to_be_bytes().to_vec(),
                Err(_) => v.to_be_bytes().to_vec(),
            },
            Value::Str(s) => {
                let mut out = s.as_bytes().to_vec();
                out.push(0);
                out
            }
            Value::Bool(_) => Vec::new(),
            Value::Bytes(b) => b.clone(),
        }
    }
}

/// A node of the description tree.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Node {
    /// Node name, possibly with an `@unit` suffix.
    pub name: String,
    /// Absolute path such as `/binman/section/u-boot`.
    pub path: String,
    /// Properties in declaration order.
    pub props: IndexMap<String, Value>,
    /// Child nodes in declaration order.
    pub children: Vec<Node>,
}

impl Node {
    pub fn new(name: &str, path: &str) -> Self {
        Self {
            name: name.to_string(),
            path: path.to_string(),
            ..Default::default()
        }
    }

    /// Builds the path of a child called `name`.
    pub fn child_path(&self, name: &str) -> String {
        if self.path == "/" {
            format!("/{name}")
        } else {
            format!("{}/{name}", self.path)
        }
    }

    /// The variant tag of this node: its `type` property, else its name without unit suffix.
    pub fn etype(&self) -> Result<String> {
        match self.get_str("type")? {
            Some(t) => Ok(t),
            None => Ok(base_name(&self.name).to_string()),
        }
    }

    pub fn has(&self, name: &str) -> bool {
        self.props.contains_key(name)
    }

    pub fn set(&mut self, name: &str, value: Value) {
        self.props.insert(name.to_string(), value);
    }

    pub fn subnode(&self, name: &str) -> Option<&Node> {
        self.children.iter().find(|c| c.name == name)
    }

    fn bad(&self, prop: &str, message: impl Into<String>) -> Error {
        ConfigError::BadProperty {
            path: self.path.clone(),
            prop: prop.to_string(),
            message: message.into(),
        }
        .into()
    }

    /// Reads an integer property. Device-tree cells may be one or two 32-bit words.
    pub fn get_int(&self, name: &str) -> Result<Option<u64>> {
        match self.props.get(name) {
            None => Ok(None),
            Some(Value::Int(v)) => Ok(Some(*v)),
            Some(Value::Bool(b)) => Ok(Some(u64::from(*b))),
            Some(Value::Bytes(b)) => match b.len() {
                4 => Ok(Some(u64::from(u32::from_be_bytes([b[0], b[1], b[2], b[3]])))),
                8 => {
                    let mut cell = [0u8; 8];
                    cell.copy_from_slice(b);
                    Ok(Some(u64::from_be_bytes(cell)))
                }
                n => Err(self.bad(name, format!("has {n} bytes: expected an integer"))),
            },
            Some(Value::Str(s)) => Err(self.bad(name, format!("is the string '{s}': expected an integer"))),
        }
    }

    pub fn get_str(&self, name: &str) -> Result<Option<String>> {
        match self.props.get(name) {
            None => Ok(None),
            Some(Value::Str(s)) => Ok(Some(s.clone())),
            Some(Value::Bytes(b)) => {
                let body = b.strip_suffix(&[0]).unwrap_or(b);
                String::from_utf8(body.to_vec())
                    .map(Some)
                    .map_err(|_| self.bad(name, "is not a valid string"))
            }
            Some(_) => Err(self.bad(name, "must be a string")),
        }
    }

    /// A boolean property is true when present, unless explicitly set to `false`.
    pub fn get_bool(&self, name: &str) -> bool {
        !matches!(self.props.get(name), None | Some(Value::Bool(false)))
    }

    pub fn get_bytes(&self, name: &str) -> Option<Vec<u8>> {
        self.props.get(name).map(Value::to_fdt_bytes)
    }

    /// Builds a node from a TOML table.
    pub fn from_toml(name: &str, path: &str, table: &toml::Table) -> Result<Node> {
        let mut node = Node::new(name, path);
        for (key, value) in table {
            match value {
                toml::Value::Table(sub) => {
                    let child_path = node.child_path(key);
                    node.children.push(Node::from_toml(key, &child_path, sub)?);
                }
                other => {
                    let value = toml_to_value(&node, key, other)?;
                    node.props.insert(key.clone(), value);
                }
            }
        }
        Ok(node)
    }

    /// Parses a TOML description and returns its `binman` node.
    pub fn parse(text: &str) -> Result<Node> {
        let table: toml::Table = toml::from_str(text).map_err(|e| ConfigError::Invalid {
            path: "/".to_string(),
            message: format!("Cannot parse description: {e}"),
        })?;
        match table.get(ROOT_NAME) {
            Some(toml::Value::Table(root)) => Node::from_toml(ROOT_NAME, &format!("/{ROOT_NAME}"), root),
            _ => Err(ConfigError::Invalid {
                path: "/".to_string(),
                message: format!("Description must contain a '{ROOT_NAME}' table"),
            }
            .into()),
        }
    }

    /// Reads and parses a description file.
    pub fn load(path: &Path) -> Result<Node> {
        let text = std::fs::read_to_string(path).map_err(|e| Error::io(path, e))?;
        Node::parse(&text)
    }
}

fn toml_to_value(node: &Node, key: &str, value: &toml::Value) -> Result<Value> {
    match value {
        toml::Value::Integer(i) => u64::try_from(*i)
            .map(Value::Int)
            .map_err(|_| node.bad(key, "must not be negative")),
        toml::Value::String(s) => Ok(Value::Str(s.clone())),
        toml::Value::Boolean(b) => Ok(Value::Bool(*b)),
        toml::Value::Array(items) => {
            let mut bytes = Vec::with_capacity(items.len());
            for item in items {
                match item.as_integer().and_then(|i| u8::try_from(i).ok()) {
                    Some(b) => bytes.push(b),
                    None => return Err(node.bad(key, "must be an array of byte values")),
                }
            }
            Ok(Value::Bytes(bytes))
        }
        _ => Err(node.bad(key, "has an unsupported type")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_keeps_declaration_order() {
        let root = Node::parse(
            r#"
            [binman]
            size = 0x20
            [binman.u-boot]
            [binman.fill]
            size = 4
            fill-byte = 0xff
            [binman."blob@1"]
            type = "blob"
            filename = "x.bin"
            "#,
        )
        .unwrap();
        assert_eq!(root.path, "/binman");
        assert_eq!(root.get_int("size").unwrap(), Some(0x20));
        let names: Vec<_> = root.children.iter().map(|c| c.name.as_str()).collect();
        assert_eq!(names, ["u-boot", "fill", "blob@1"]);
        assert_eq!(root.children[1].path, "/binman/fill");
        assert_eq!(root.children[2].etype().unwrap(), "blob");
        assert_eq!(root.children[0].etype().unwrap(), "u-boot");
    }

    #[test]
    fn fdt_cells_read_as_integers_and_strings() {
        let mut node = Node::new("x", "/x");
        node.set("offset", Value::Bytes(vec![0, 0, 1, 0]));
        node.set("big", Value::Bytes(vec![0, 0, 0, 1, 0, 0, 0, 0]));
        node.set("type", Value::Bytes(b"fill\0".to_vec()));
        assert_eq!(node.get_int("offset").unwrap(), Some(0x100));
        assert_eq!(node.get_int("big").unwrap(), Some(1 << 32));
        assert_eq!(node.get_str("type").unwrap().as_deref(), Some("fill"));
        assert!(node.get_int("type").is_err());
    }

    #[test]
    fn missing_root_is_rejected() {
        let err = Node::parse("[other]\n").unwrap_err();
        assert!(err.to_string().contains("must contain a 'binman' table"));
    }

    #[test]
    fn negative_integers_are_rejected() {
        let err = Node::parse("[binman]\nsize = -1\n").unwrap_err();
        assert!(err.to_string().contains("must not be negative"));
    }
}
