//! BIP340 tagged hashes, BIP341 output key tweaking and script tree
//! commitments.

use bitcoin::{
    consensus::encode::VarInt,
    hashes::{sha256, Hash, HashEngine},
};
use thiserror::Error;

use crate::{
    crypto::{Parity, SignatureVerifier},
    tx::serialize_into,
};

pub use bitcoin::taproot::{
    TAPROOT_ANNEX_PREFIX, TAPROOT_CONTROL_BASE_SIZE, TAPROOT_CONTROL_MAX_NODE_COUNT,
    TAPROOT_CONTROL_MAX_SIZE, TAPROOT_CONTROL_NODE_SIZE, TAPROOT_LEAF_MASK, TAPROOT_LEAF_TAPSCRIPT,
};

#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaprootError {
    #[error("control block of {0} bytes is not 33 + 32m with m <= 128")]
    ControlBlockSize(usize),
    #[error("key tweak failed")]
    Tweak,
    #[error("script tree has no leaf {0}")]
    LeafIndex(usize),
    #[error("leaf version {0:#04x} is odd or collides with the annex prefix")]
    InvalidLeafVersion(u8),
}

/// `SHA256(SHA256(tag) || SHA256(tag) || msg)`.
pub fn tagged_hash(tag: &str, msg: &[u8]) -> [u8; 32] {
    let mut engine = tagged_engine(tag);
    engine.input(msg);
    sha256::Hash::from_engine(engine).to_byte_array()
}

fn tagged_engine(tag: &str) -> sha256::HashEngine {
    let tag_hash = sha256::Hash::hash(tag.as_bytes());
    let mut engine = sha256::Hash::engine();
    engine.input(tag_hash.as_byte_array());
    engine.input(tag_hash.as_byte_array());
    engine
}

pub fn tapleaf_hash(leaf_version: u8, script: &[u8]) -> [u8; 32] {
    let mut engine = tagged_engine("TapLeaf");
    let mut prefix = Vec::with_capacity(10);
    prefix.push(leaf_version);
    serialize_into(&VarInt(script.len() as u64), &mut prefix);
    engine.input(&prefix);
    engine.input(script);
    sha256::Hash::from_engine(engine).to_byte_array()
}

/// Combines two child nodes, lexicographically smaller first.
pub fn tapbranch_hash(a: &[u8; 32], b: &[u8; 32]) -> [u8; 32] {
    let (first, second) = if a <= b { (a, b) } else { (b, a) };
    let mut engine = tagged_engine("TapBranch");
    engine.input(first);
    engine.input(second);
    sha256::Hash::from_engine(engine).to_byte_array()
}

pub fn tap_tweak_hash(internal_key: &[u8; 32], merkle_root: Option<&[u8; 32]>) -> [u8; 32] {
    let mut engine = tagged_engine("TapTweak");
    engine.input(internal_key);
    if let Some(root) = merkle_root {
        engine.input(root);
    }
    sha256::Hash::from_engine(engine).to_byte_array()
}

/// Output key `Q = P + H_TapTweak(P || root)·G` and its parity.
pub fn tweak(
    verifier: &dyn SignatureVerifier,
    internal_key: &[u8; 32],
    merkle_root: Option<&[u8; 32]>,
) -> Result<([u8; 32], Parity), TaprootError> {
    let tweak = tap_tweak_hash(internal_key, merkle_root);
    verifier
        .tweak_add_xonly(internal_key, &tweak)
        .map_err(|_| TaprootError::Tweak)
}

/// Whether `output_key` with `parity` commits to `internal_key` and `merkle_root`.
pub fn check_tweak(
    verifier: &dyn SignatureVerifier,
    internal_key: &[u8; 32],
    output_key: &[u8; 32],
    merkle_root: Option<&[u8; 32]>,
    parity: Parity,
) -> bool {
    matches!(
        tweak(verifier, internal_key, merkle_root),
        Ok((key, key_parity)) if key == *output_key && key_parity == parity
    )
}

/// Borrowed view of a script path control block.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ControlBlock<'a> {
    bytes: &'a [u8],
}

impl<'a> ControlBlock<'a> {
    pub fn parse(bytes: &'a [u8]) -> Result<Self, TaprootError> {
        if bytes.len() < TAPROOT_CONTROL_BASE_SIZE
            || bytes.len() > TAPROOT_CONTROL_MAX_SIZE
            || (bytes.len() - TAPROOT_CONTROL_BASE_SIZE) % TAPROOT_CONTROL_NODE_SIZE != 0
        {
            return Err(TaprootError::ControlBlockSize(bytes.len()));
        }
        Ok(Self { bytes })
    }

    pub fn leaf_version(&self) -> u8 {
        self.bytes[0] & TAPROOT_LEAF_MASK
    }

    pub fn output_key_parity(&self) -> Parity {
        Parity::from_bit(self.bytes[0])
    }

    pub fn internal_key(&self) -> [u8; 32] {
        let mut key = [0u8; 32];
        key.copy_from_slice(&self.bytes[1..TAPROOT_CONTROL_BASE_SIZE]);
        key
    }

    /// Merkle path nodes, from the leaf towards the root.
    pub fn path(&self) -> impl Iterator<Item = [u8; 32]> + 'a {
        self.bytes[TAPROOT_CONTROL_BASE_SIZE..]
            .chunks_exact(TAPROOT_CONTROL_NODE_SIZE)
            .map(|chunk| {
                let mut node = [0u8; 32];
                node.copy_from_slice(chunk);
                node
            })
    }

    pub fn path_len(&self) -> usize {
        (self.bytes.len() - TAPROOT_CONTROL_BASE_SIZE) / TAPROOT_CONTROL_NODE_SIZE
    }

    pub fn as_bytes(&self) -> &'a [u8] {
        self.bytes
    }
}

/// Folds the control block's path over `leaf_hash`.
pub fn merkle_root(control: &ControlBlock<'_>, leaf_hash: &[u8; 32]) -> [u8; 32] {
    control
        .path()
        .fold(*leaf_hash, |acc, node| tapbranch_hash(&acc, &node))
}

/// Full script path commitment check for a witness v1 program.
pub fn verify_commitment(
    verifier: &dyn SignatureVerifier,
    control: &ControlBlock<'_>,
    program: &[u8; 32],
    leaf_hash: &[u8; 32],
) -> bool {
    let root = merkle_root(control, leaf_hash);
    check_tweak(
        verifier,
        &control.internal_key(),
        program,
        Some(&root),
        control.output_key_parity(),
    )
}

/// A script tree to commit to in a taproot output.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum ScriptTree {
    Leaf { version: u8, script: Vec<u8> },
    Branch(Box<ScriptTree>, Box<ScriptTree>),
}

/// One leaf of a [`ScriptTree`] with the proof of its inclusion.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TreeLeaf {
    pub version: u8,
    pub script: Vec<u8>,
    pub leaf_hash: [u8; 32],
    /// Sibling hashes from the leaf towards the root.
    pub path: Vec<[u8; 32]>,
}

impl ScriptTree {
    /// A tapscript (0xc0) leaf.
    pub fn leaf(script: impl Into<Vec<u8>>) -> Self {
        ScriptTree::Leaf {
            version: TAPROOT_LEAF_TAPSCRIPT,
            script: script.into(),
        }
    }

    pub fn leaf_with_version(version: u8, script: impl Into<Vec<u8>>) -> Result<Self, TaprootError> {
        check_leaf_version(version)?;
        Ok(ScriptTree::Leaf {
            version,
            script: script.into(),
        })
    }

    pub fn branch(left: ScriptTree, right: ScriptTree) -> Self {
        ScriptTree::Branch(Box::new(left), Box::new(right))
    }

    pub fn node_hash(&self) -> [u8; 32] {
        match self {
            ScriptTree::Leaf { version, script } => tapleaf_hash(*version, script),
            ScriptTree::Branch(left, right) => tapbranch_hash(&left.node_hash(), &right.node_hash()),
        }
    }

    /// Leaves in left-to-right order.
    pub fn leaves(&self) -> Vec<TreeLeaf> {
        let mut leaves = Vec::new();
        self.collect_leaves(&mut leaves);
        leaves
    }

    fn collect_leaves(&self, out: &mut Vec<TreeLeaf>) -> [u8; 32] {
        match self {
            ScriptTree::Leaf { version, script } => {
                let leaf_hash = tapleaf_hash(*version, script);
                out.push(TreeLeaf {
                    version: *version,
                    script: script.clone(),
                    leaf_hash,
                    path: Vec::new(),
                });
                leaf_hash
            }
            ScriptTree::Branch(left, right) => {
                let start = out.len();
                let left_hash = left.collect_leaves(out);
                let middle = out.len();
                let right_hash = right.collect_leaves(out);
                for leaf in &mut out[start..middle] {
                    leaf.path.push(right_hash);
                }
                for leaf in &mut out[middle..] {
                    leaf.path.push(left_hash);
                }
                tapbranch_hash(&left_hash, &right_hash)
            }
        }
    }

    /// Index of the first leaf holding `script`.
    pub fn position(&self, script: &[u8]) -> Option<usize> {
        self.leaves().iter().position(|leaf| leaf.script == script)
    }

    /// Output key committing to `internal_key` and this tree.
    pub fn output_key(
        &self,
        verifier: &dyn SignatureVerifier,
        internal_key: &[u8; 32],
    ) -> Result<([u8; 32], Parity), TaprootError> {
        tweak(verifier, internal_key, Some(&self.node_hash()))
    }

    /// Serialized control block proving leaf `index` against the output key.
    pub fn control_block(
        &self,
        verifier: &dyn SignatureVerifier,
        internal_key: &[u8; 32],
        index: usize,
    ) -> Result<Vec<u8>, TaprootError> {
        let leaves = self.leaves();
        let leaf = leaves.get(index).ok_or(TaprootError::LeafIndex(index))?;
        check_leaf_version(leaf.version)?;
        let size = TAPROOT_CONTROL_BASE_SIZE + TAPROOT_CONTROL_NODE_SIZE * leaf.path.len();
        if leaf.path.len() > TAPROOT_CONTROL_MAX_NODE_COUNT {
            return Err(TaprootError::ControlBlockSize(size));
        }

        let (_, parity) = self.output_key(verifier, internal_key)?;
        let mut control = Vec::with_capacity(size);
        control.push(leaf.version | parity.to_bit());
        control.extend_from_slice(internal_key);
        for node in &leaf.path {
            control.extend_from_slice(node);
        }
        Ok(control)
    }
}

fn check_leaf_version(version: u8) -> Result<(), TaprootError> {
    if version & !TAPROOT_LEAF_MASK != 0 || version == TAPROOT_ANNEX_PREFIX {
        return Err(TaprootError::InvalidLeafVersion(version));
    }
    Ok(())
}
