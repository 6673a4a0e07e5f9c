//! Signature hashes for legacy (pre-segwit), BIP143 (witness v0) and
//! BIP341/BIP342 (taproot) spends.
//!
//! [`SighashCache`] mirrors Bitcoin Core's `PrecomputedTransactionData`: the
//! single SHA256 midstates over a transaction's prevouts, sequences and
//! outputs (and, for taproot, the spent amounts and scripts) are computed on
//! first use and shared by every input of the transaction.

use bitcoin::{
    consensus::encode::VarInt,
    hashes::{sha256, sha256d, Hash, HashEngine},
};
use thiserror::Error;

use crate::{
    script::remove_codeseparators,
    taproot::tagged_hash,
    tx::{serialize_into, serialize_var_bytes, Transaction, TxOut},
};

pub const SIGHASH_DEFAULT: u8 = 0x00;
pub const SIGHASH_ALL: u32 = 0x01;
pub const SIGHASH_NONE: u32 = 0x02;
pub const SIGHASH_SINGLE: u32 = 0x03;
pub const SIGHASH_ANYONECANPAY: u32 = 0x80;

/// Base type bits of a legacy or witness v0 hash type.
const SIGHASH_BASE_MASK: u32 = 0x1f;
/// Base type bits of a taproot hash type.
const TAPROOT_OUTPUT_MASK: u8 = 0x03;

#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum SighashError {
    #[error("input index {index} out of range for {inputs} inputs")]
    InputIndex { index: usize, inputs: usize },
    #[error("{prevouts} spent outputs supplied for {inputs} inputs")]
    PrevoutsCount { prevouts: usize, inputs: usize },
    #[error("invalid taproot sighash type {0:#04x}")]
    InvalidHashType(u8),
    #[error("SIGHASH_SINGLE for input {0} without a matching output")]
    SingleWithoutOutput(usize),
}

/// Script path data committed to by tapscript signatures.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TapscriptExt {
    pub leaf_hash: [u8; 32],
    pub key_version: u8,
    /// Opcode position of the last executed `OP_CODESEPARATOR`, `u32::MAX` if none.
    pub code_separator_pos: u32,
}

#[derive(Debug, Clone)]
pub struct SighashCache<'tx> {
    tx: &'tx Transaction,
    prevouts_single_hash: Option<[u8; 32]>,
    sequences_single_hash: Option<[u8; 32]>,
    outputs_single_hash: Option<[u8; 32]>,
    spent_amounts_single_hash: Option<[u8; 32]>,
    spent_scripts_single_hash: Option<[u8; 32]>,
}

impl<'tx> SighashCache<'tx> {
    pub fn new(tx: &'tx Transaction) -> Self {
        Self {
            tx,
            prevouts_single_hash: None,
            sequences_single_hash: None,
            outputs_single_hash: None,
            spent_amounts_single_hash: None,
            spent_scripts_single_hash: None,
        }
    }

    pub fn transaction(&self) -> &'tx Transaction {
        self.tx
    }

    fn ensure_input_index(&self, index: usize) -> Result<(), SighashError> {
        if index >= self.tx.input.len() {
            return Err(SighashError::InputIndex {
                index,
                inputs: self.tx.input.len(),
            });
        }
        Ok(())
    }

    fn prevouts_single(&mut self) -> [u8; 32] {
        let tx = self.tx;
        *self.prevouts_single_hash.get_or_insert_with(|| {
            hash_serialized(tx.input.iter(), |txin, out| {
                serialize_into(&txin.previous_output, out)
            })
        })
    }

    fn sequences_single(&mut self) -> [u8; 32] {
        let tx = self.tx;
        *self.sequences_single_hash.get_or_insert_with(|| {
            hash_serialized(tx.input.iter(), |txin, out| {
                out.extend_from_slice(&txin.sequence.to_le_bytes())
            })
        })
    }

    fn outputs_single(&mut self) -> [u8; 32] {
        let tx = self.tx;
        *self
            .outputs_single_hash
            .get_or_insert_with(|| hash_serialized(tx.output.iter(), serialize_into::<TxOut>))
    }

    fn spent_amounts_single(&mut self, prevouts: &[TxOut]) -> [u8; 32] {
        *self.spent_amounts_single_hash.get_or_insert_with(|| {
            hash_serialized(prevouts.iter(), |txout, out| {
                out.extend_from_slice(&txout.value.to_le_bytes())
            })
        })
    }

    fn spent_scripts_single(&mut self, prevouts: &[TxOut]) -> [u8; 32] {
        *self.spent_scripts_single_hash.get_or_insert_with(|| {
            hash_serialized(prevouts.iter(), |txout, out| {
                serialize_var_bytes(&txout.script_pubkey, out)
            })
        })
    }

    /// Pre-segwit digest. `script_code` is the executed script from the last
    /// code separator on, with signatures already removed; code separators
    /// are dropped here.
    pub fn legacy_signature_hash(
        &self,
        input_index: usize,
        script_code: &[u8],
        sighash_type: u32,
    ) -> Result<[u8; 32], SighashError> {
        self.ensure_input_index(input_index)?;
        let tx = self.tx;
        let base_type = sighash_type & SIGHASH_BASE_MASK;
        let anyone_can_pay = sighash_type & SIGHASH_ANYONECANPAY != 0;
        let hash_single = base_type == SIGHASH_SINGLE;
        let hash_none = base_type == SIGHASH_NONE;

        if hash_single && input_index >= tx.output.len() {
            // Consensus quirk: the digest of a SINGLE without output is the number one.
            let mut one = [0u8; 32];
            one[0] = 1;
            return Ok(one);
        }

        let mut preimage = Vec::with_capacity(128 + script_code.len() + 41 * tx.input.len());
        preimage.extend_from_slice(&tx.version.to_le_bytes());

        let signing_script = remove_codeseparators(script_code);
        let inputs = if anyone_can_pay {
            input_index..input_index + 1
        } else {
            0..tx.input.len()
        };
        serialize_into(&VarInt(inputs.len() as u64), &mut preimage);
        for index in inputs {
            let txin = &tx.input[index];
            serialize_into(&txin.previous_output, &mut preimage);
            if index == input_index {
                serialize_var_bytes(&signing_script, &mut preimage);
            } else {
                serialize_into(&VarInt(0), &mut preimage);
            }
            let sequence = if index != input_index && (hash_single || hash_none) {
                0
            } else {
                txin.sequence
            };
            preimage.extend_from_slice(&sequence.to_le_bytes());
        }

        let output_count = if hash_none {
            0
        } else if hash_single {
            input_index + 1
        } else {
            tx.output.len()
        };
        serialize_into(&VarInt(output_count as u64), &mut preimage);
        for (index, txout) in tx.output.iter().take(output_count).enumerate() {
            if hash_single && index != input_index {
                // A default `CTxOut`: value -1, empty script.
                preimage.extend_from_slice(&u64::MAX.to_le_bytes());
                serialize_into(&VarInt(0), &mut preimage);
            } else {
                serialize_into(txout, &mut preimage);
            }
        }

        preimage.extend_from_slice(&tx.lock_time.to_le_bytes());
        preimage.extend_from_slice(&sighash_type.to_le_bytes());
        Ok(sha256d::Hash::hash(&preimage).to_byte_array())
    }

    /// BIP143 digest. `script_code` is hashed as given, code separators included.
    pub fn segwit_v0_signature_hash(
        &mut self,
        input_index: usize,
        script_code: &[u8],
        amount: u64,
        sighash_type: u32,
    ) -> Result<[u8; 32], SighashError> {
        self.ensure_input_index(input_index)?;
        let tx = self.tx;
        let base_type = sighash_type & SIGHASH_BASE_MASK;
        let anyone_can_pay = sighash_type & SIGHASH_ANYONECANPAY != 0;
        let single_or_none = base_type == SIGHASH_SINGLE || base_type == SIGHASH_NONE;

        let hash_prevouts = if anyone_can_pay {
            [0u8; 32]
        } else {
            double_sha(self.prevouts_single())
        };
        let hash_sequence = if anyone_can_pay || single_or_none {
            [0u8; 32]
        } else {
            double_sha(self.sequences_single())
        };
        let hash_outputs = if !single_or_none {
            double_sha(self.outputs_single())
        } else if base_type == SIGHASH_SINGLE && input_index < tx.output.len() {
            sha256d::Hash::hash(&tx.output[input_index].serialize()).to_byte_array()
        } else {
            [0u8; 32]
        };

        let txin = &tx.input[input_index];
        let mut preimage = Vec::with_capacity(156 + script_code.len());
        preimage.extend_from_slice(&tx.version.to_le_bytes());
        preimage.extend_from_slice(&hash_prevouts);
        preimage.extend_from_slice(&hash_sequence);
        serialize_into(&txin.previous_output, &mut preimage);
        serialize_var_bytes(script_code, &mut preimage);
        preimage.extend_from_slice(&amount.to_le_bytes());
        preimage.extend_from_slice(&txin.sequence.to_le_bytes());
        preimage.extend_from_slice(&hash_outputs);
        preimage.extend_from_slice(&tx.lock_time.to_le_bytes());
        preimage.extend_from_slice(&sighash_type.to_le_bytes());
        Ok(sha256d::Hash::hash(&preimage).to_byte_array())
    }

    /// BIP341 digest, with the BIP342 extension when `leaf` is given.
    ///
    /// `prevouts` must list the spent output of every input, in input order,
    /// and must be the same slice for every call on this cache.
    pub fn taproot_signature_hash(
        &mut self,
        input_index: usize,
        prevouts: &[TxOut],
        annex: Option<&[u8]>,
        leaf: Option<TapscriptExt>,
        hash_type: u8,
    ) -> Result<[u8; 32], SighashError> {
        self.ensure_input_index(input_index)?;
        let tx = self.tx;
        if prevouts.len() != tx.input.len() {
            return Err(SighashError::PrevoutsCount {
                prevouts: prevouts.len(),
                inputs: tx.input.len(),
            });
        }
        if !matches!(hash_type, 0x00..=0x03 | 0x81..=0x83) {
            return Err(SighashError::InvalidHashType(hash_type));
        }

        let output_type = if hash_type == SIGHASH_DEFAULT {
            SIGHASH_ALL as u8
        } else {
            hash_type & TAPROOT_OUTPUT_MASK
        };
        let anyone_can_pay = u32::from(hash_type) & SIGHASH_ANYONECANPAY != 0;

        let mut msg = Vec::with_capacity(256);
        // Epoch.
        msg.push(0x00);
        msg.push(hash_type);
        msg.extend_from_slice(&tx.version.to_le_bytes());
        msg.extend_from_slice(&tx.lock_time.to_le_bytes());

        if !anyone_can_pay {
            msg.extend_from_slice(&self.prevouts_single());
            msg.extend_from_slice(&self.spent_amounts_single(prevouts));
            msg.extend_from_slice(&self.spent_scripts_single(prevouts));
            msg.extend_from_slice(&self.sequences_single());
        }
        if u32::from(output_type) == SIGHASH_ALL {
            msg.extend_from_slice(&self.outputs_single());
        }

        let ext_flag = u8::from(leaf.is_some());
        let spend_type = (ext_flag << 1) | u8::from(annex.is_some());
        msg.push(spend_type);

        if anyone_can_pay {
            let txin = &tx.input[input_index];
            let spent = &prevouts[input_index];
            serialize_into(&txin.previous_output, &mut msg);
            msg.extend_from_slice(&spent.value.to_le_bytes());
            serialize_var_bytes(&spent.script_pubkey, &mut msg);
            msg.extend_from_slice(&txin.sequence.to_le_bytes());
        } else {
            msg.extend_from_slice(&(input_index as u32).to_le_bytes());
        }

        if let Some(annex) = annex {
            let mut engine = sha256::Hash::engine();
            let mut prefixed = Vec::with_capacity(annex.len() + 9);
            serialize_var_bytes(annex, &mut prefixed);
            engine.input(&prefixed);
            msg.extend_from_slice(sha256::Hash::from_engine(engine).as_byte_array());
        }

        if u32::from(output_type) == SIGHASH_SINGLE {
            let txout = tx
                .output
                .get(input_index)
                .ok_or(SighashError::SingleWithoutOutput(input_index))?;
            msg.extend_from_slice(sha256::Hash::hash(&txout.serialize()).as_byte_array());
        }

        if let Some(ext) = leaf {
            msg.extend_from_slice(&ext.leaf_hash);
            msg.push(ext.key_version);
            msg.extend_from_slice(&ext.code_separator_pos.to_le_bytes());
        }

        Ok(tagged_hash("TapSighash", &msg))
    }
}

fn double_sha(single: [u8; 32]) -> [u8; 32] {
    sha256::Hash::hash(&single).to_byte_array()
}

fn hash_serialized<'a, T: 'a>(
    items: impl Iterator<Item = &'a T>,
    mut encode: impl FnMut(&T, &mut Vec<u8>),
) -> [u8; 32] {
    let mut engine = sha256::Hash::engine();
    let mut buf = Vec::with_capacity(64);
    for item in items {
        buf.clear();
        encode(item, &mut buf);
        engine.input(&buf);
    }
    sha256::Hash::from_engine(engine).to_byte_array()
}

#[cfg(test)]
mod tests {
    use super::*;
    use bitcoin::{
        absolute::LockTime,
        consensus,
        sighash::{self, Annex, EcdsaSighashType, Prevouts, TapSighashType},
        taproot::{LeafVersion, TapLeafHash},
        transaction::Version,
        Amount, ScriptBuf, Sequence, Txid,
    };

    fn reference_tx() -> bitcoin::Transaction {
        let input = |seed: u8, sequence: u32| bitcoin::TxIn {
            previous_output: bitcoin::OutPoint {
                txid: Txid::from_byte_array([seed; 32]),
                vout: u32::from(seed),
            },
            script_sig: ScriptBuf::from_bytes(vec![seed; 3]),
            sequence: Sequence(sequence),
            witness: bitcoin::Witness::new(),
        };
        bitcoin::Transaction {
            version: Version(2),
            lock_time: LockTime::from_consensus(123_456),
            input: vec![input(1, 0xffff_fffd), input(2, 7), input(3, 0xffff_ffff)],
            output: vec![
                bitcoin::TxOut {
                    value: Amount::from_sat(10_000),
                    script_pubkey: ScriptBuf::from_bytes(vec![0x51]),
                },
                bitcoin::TxOut {
                    value: Amount::from_sat(20_000),
                    script_pubkey: ScriptBuf::from_bytes(vec![0x00, 0x14, 0xaa]),
                },
            ],
        }
    }

    fn ours(reference: &bitcoin::Transaction) -> Transaction {
        Transaction::deserialize(&consensus::serialize(reference)).unwrap()
    }

    fn prevouts() -> Vec<bitcoin::TxOut> {
        (0..3u8)
            .map(|i| bitcoin::TxOut {
                value: Amount::from_sat(50_000 + u64::from(i)),
                script_pubkey: ScriptBuf::from_bytes(vec![0x51, 0x20, i]),
            })
            .collect()
    }

    fn our_prevouts() -> Vec<TxOut> {
        prevouts()
            .into_iter()
            .map(|txout| TxOut::new(txout.value.to_sat(), txout.script_pubkey.into_bytes()))
            .collect()
    }

    const LEGACY_TYPES: [u32; 7] = [0x00, 0x01, 0x02, 0x03, 0x81, 0x82, 0x83];

    #[test]
    fn legacy_matches_bitcoin() {
        let reference = reference_tx();
        let tx = ours(&reference);
        let cache = SighashCache::new(&tx);
        let oracle = sighash::SighashCache::new(&reference);
        let script_code = ScriptBuf::from_bytes(vec![0x76, 0xa9, 0x51, 0x87]);

        for input_index in 0..3 {
            for hash_type in LEGACY_TYPES {
                let expected = oracle
                    .legacy_signature_hash(input_index, &script_code, hash_type)
                    .unwrap();
                let actual = cache
                    .legacy_signature_hash(input_index, script_code.as_bytes(), hash_type)
                    .unwrap();
                assert_eq!(actual, expected.to_byte_array(), "input {input_index} type {hash_type:#x}");
            }
        }
    }

    #[test]
    fn legacy_single_without_output_is_one() {
        let tx = ours(&reference_tx());
        let digest = SighashCache::new(&tx)
            .legacy_signature_hash(2, &[0x51], SIGHASH_SINGLE)
            .unwrap();
        let mut one = [0u8; 32];
        one[0] = 1;
        assert_eq!(digest, one);
    }

    #[test]
    fn legacy_strips_codeseparators() {
        let tx = ours(&reference_tx());
        let cache = SighashCache::new(&tx);
        let with = cache.legacy_signature_hash(0, &[0xab, 0x51, 0xab], SIGHASH_ALL).unwrap();
        let without = cache.legacy_signature_hash(0, &[0x51], SIGHASH_ALL).unwrap();
        assert_eq!(with, without);
    }

    #[test]
    fn segwit_v0_matches_bitcoin() {
        let reference = reference_tx();
        let tx = ours(&reference);
        let mut cache = SighashCache::new(&tx);
        let mut oracle = sighash::SighashCache::new(&reference);
        let script_code = ScriptBuf::from_bytes(vec![0xab, 0x76, 0xa9, 0xac]);

        for input_index in 0..3 {
            for hash_type in LEGACY_TYPES.into_iter().filter(|t| *t != 0) {
                let expected = oracle
                    .p2wsh_signature_hash(
                        input_index,
                        &script_code,
                        Amount::from_sat(70_000),
                        EcdsaSighashType::from_consensus(hash_type),
                    )
                    .unwrap();
                let actual = cache
                    .segwit_v0_signature_hash(input_index, script_code.as_bytes(), 70_000, hash_type)
                    .unwrap();
                assert_eq!(actual, expected.to_byte_array(), "input {input_index} type {hash_type:#x}");
            }
        }
    }

    #[test]
    fn taproot_matches_bitcoin() {
        let reference = reference_tx();
        let tx = ours(&reference);
        let spent = prevouts();
        let our_spent = our_prevouts();
        let mut cache = SighashCache::new(&tx);
        let mut oracle = sighash::SighashCache::new(&reference);
        let leaf_script = ScriptBuf::from_bytes(vec![0x51]);
        let leaf_hash = TapLeafHash::from_script(&leaf_script, LeafVersion::TapScript);
        let annex_bytes = [0x50u8, 0x01, 0x02];

        for input_index in 0..2 {
            for hash_type in [0x00u8, 0x01, 0x02, 0x03, 0x81, 0x82, 0x83] {
                for with_annex in [false, true] {
                    for with_leaf in [false, true] {
                        let annex = with_annex.then(|| Annex::new(&annex_bytes).unwrap());
                        let expected = oracle
                            .taproot_signature_hash(
                                input_index,
                                &Prevouts::All(&spent),
                                annex,
                                with_leaf.then_some((leaf_hash, 0x0000_0005)),
                                TapSighashType::from_consensus_u8(hash_type).unwrap(),
                            )
                            .unwrap();
                        let ext = with_leaf.then_some(TapscriptExt {
                            leaf_hash: leaf_hash.to_byte_array(),
                            key_version: 0,
                            code_separator_pos: 5,
                        });
                        let actual = cache
                            .taproot_signature_hash(
                                input_index,
                                &our_spent,
                                with_annex.then_some(&annex_bytes[..]),
                                ext,
                                hash_type,
                            )
                            .unwrap();
                        assert_eq!(actual, expected.to_byte_array());
                    }
                }
            }
        }
    }

    #[test]
    fn taproot_rejects_bad_parameters() {
        let tx = ours(&reference_tx());
        let spent = our_prevouts();
        let mut cache = SighashCache::new(&tx);

        assert_eq!(
            cache.taproot_signature_hash(0, &spent, None, None, 0x04),
            Err(SighashError::InvalidHashType(0x04))
        );
        assert_eq!(
            cache.taproot_signature_hash(0, &spent[..2], None, None, 0x00),
            Err(SighashError::PrevoutsCount { prevouts: 2, inputs: 3 })
        );
        assert_eq!(
            cache.taproot_signature_hash(2, &spent, None, None, 0x03),
            Err(SighashError::SingleWithoutOutput(2))
        );
        assert_eq!(
            cache.taproot_signature_hash(3, &spent, None, None, 0x00),
            Err(SighashError::InputIndex { index: 3, inputs: 3 })
        );
    }

    #[test]
    fn cache_reuse_is_transparent() {
        let tx = ours(&reference_tx());
        let spent = our_prevouts();
        let mut shared = SighashCache::new(&tx);
        for input_index in 0..3 {
            let mut fresh = SighashCache::new(&tx);
            assert_eq!(
                shared.taproot_signature_hash(input_index, &spent, None, None, 0x00),
                fresh.taproot_signature_hash(input_index, &spent, None, None, 0x00)
            );
            assert_eq!(
                shared.segwit_v0_signature_hash(input_index, &[0x51], 1, SIGHASH_ALL),
                fresh.segwit_v0_signature_hash(input_index, &[0x51], 1, SIGHASH_ALL)
            );
        }
    }
}
