//! Hash annotations.
//!
//! An entry with a `hash` subnode gets a digest of its final contents. The
//! digest is stored as the `value` property of that subnode in the fdtmap and
//! in updated device trees.

use sha2::{Digest, Sha256, Sha384, Sha512};

use crate::error::{ConfigError, Result};
use crate::node::Node;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HashAlgo {
    Sha256,
    Sha384,
    Sha512,
}

impl HashAlgo {
    pub fn name(&self) -> &'static str {
        match self {
            HashAlgo::Sha256 => "sha256",
            HashAlgo::Sha384 => "sha384",
            HashAlgo::Sha512 => "sha512",
        }
    }

    /// Length of a digest in bytes.
    pub fn output_len(&self) -> usize {
        match self {
            HashAlgo::Sha256 => 32,
            HashAlgo::Sha384 => 48,
            HashAlgo::Sha512 => 64,
        }
    }

    pub fn digest(&self, data: &[u8]) -> Vec<u8> {
        match self {
            HashAlgo::Sha256 => Sha256::digest(data).to_vec(),
            HashAlgo::Sha384 => Sha384::digest(data).to_vec(),
            HashAlgo::Sha512 => Sha512::digest(data).to_vec(),
        }
    }
}

/// Reads the `hash` subnode of an entry node, if any.
pub fn read_hash_node(node: &Node) -> Result<Option<HashAlgo>> {
    let Some(hash) = node.subnode("hash") else {
        return Ok(None);
    };
    let algo = match hash.get_str("algo")? {
        Some(algo) => algo,
        None => {
            return Err(ConfigError::Invalid {
                path: hash.path.clone(),
                message: "Missing 'algo' property for hash node".to_string(),
            }
            .into())
        }
    };
    match algo.as_str() {
        "sha256" => Ok(Some(HashAlgo::Sha256)),
        "sha384" => Ok(Some(HashAlgo::Sha384)),
        "sha512" => Ok(Some(HashAlgo::Sha512)),
        other => Err(ConfigError::Invalid {
            path: hash.path.clone(),
            message: format!("Unknown hash algorithm '{other}'"),
        }
        .into()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sha256_of_known_input() {
        assert_eq!(
            hex::encode(HashAlgo::Sha256.digest(b"abc")),
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
    }

    #[test]
    fn missing_and_unknown_algorithms() {
        let root = Node::parse("[binman.u-boot.hash]\n").unwrap();
        let err = read_hash_node(&root.children[0]).unwrap_err();
        assert!(err.to_string().contains("Missing 'algo' property for hash node"));

        let root = Node::parse("[binman.u-boot.hash]\nalgo = \"invalid\"\n").unwrap();
        let err = read_hash_node(&root.children[0]).unwrap_err();
        assert!(err.to_string().contains("Unknown hash algorithm 'invalid'"));
    }
}
