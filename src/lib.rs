//! Bitcoin script validation for legacy, segwit v0 and taproot/tapscript
//! spends.
//!
//! The entry points mirror `libbitcoinconsensus`: [`verify`] and
//! [`verify_with_flags`] take a serialized transaction, while
//! [`verify_input`] and [`verify_transaction`] work on the decoded
//! [`Transaction`] model and let callers share one [`SighashCache`] across
//! the inputs of a transaction.

pub mod crypto;
mod error;
pub mod flags;
pub mod interpreter;
pub mod num;
pub mod script;
pub mod sighash;
pub mod taproot;
pub mod tx;

pub use crate::{
    crypto::{Secp256k1Backend, SignatureVerifier, Signer},
    error::{Error, ScriptError},
    flags::*,
    interpreter::Interpreter,
    sighash::SighashCache,
    tx::{OutPoint, Transaction, TxIn, TxOut, Witness},
};

use tracing::{debug, trace};

/// Verifies a single spend (input) of a serialized transaction.
///
/// Enforces every soft fork up to segwit, plus taproot when `spent_outputs`
/// is given.
pub fn verify(
    spent_output: &[u8],
    amount: u64,
    spending_transaction: &[u8],
    spent_outputs: Option<&[TxOut]>,
    input_index: usize,
) -> Result<(), Error> {
    let flags = match spent_outputs {
        Some(_) => VERIFY_ALL_PRE_TAPROOT | VERIFY_TAPROOT,
        None => VERIFY_ALL_PRE_TAPROOT,
    };

    verify_with_flags(
        spent_output,
        amount,
        spending_transaction,
        spent_outputs,
        input_index,
        flags,
    )
}

/// Same as [`verify`] but with explicit script verification flags.
///
/// When `spent_outputs` is given it must list the output spent by every
/// input; the entry for `input_index` must carry `spent_output_script`, and
/// its value takes the place of `amount`.
pub fn verify_with_flags(
    spent_output_script: &[u8],
    amount: u64,
    spending_transaction: &[u8],
    spent_outputs: Option<&[TxOut]>,
    input_index: usize,
    flags: u32,
) -> Result<(), Error> {
    let flags = ScriptFlags::from_bits(flags)?;

    let (tx, consumed) = Transaction::deserialize_partial(spending_transaction)?;
    if consumed != spending_transaction.len() {
        return Err(Error::TxSizeMismatch);
    }
    ensure_input_index(&tx, input_index)?;

    let amount = match spent_outputs {
        Some(prevouts) => {
            ensure_prevouts(&tx, prevouts)?;
            let prevout = &prevouts[input_index];
            if prevout.script_pubkey != spent_output_script {
                return Err(Error::SpentOutputsMismatch);
            }
            prevout.value
        }
        None if flags.requires_spent_outputs() => return Err(Error::SpentOutputsRequired),
        None => amount,
    };

    let verifier = Secp256k1Backend::new();
    let mut cache = SighashCache::new(&tx);
    let spend = Spend {
        input_index,
        script_pubkey: spent_output_script,
        amount,
        prevouts: spent_outputs,
    };
    spend.verify(&mut cache, &verifier, flags)
}

/// Verifies input `input_index` of the cache's transaction against the
/// outputs it spends.
///
/// Reusing `cache` for every input of a transaction avoids recomputing the
/// transaction-wide hashes.
pub fn verify_input(
    cache: &mut SighashCache<'_>,
    verifier: &dyn SignatureVerifier,
    input_index: usize,
    prevouts: &[TxOut],
    flags: ScriptFlags,
) -> Result<(), Error> {
    let tx = cache.transaction();
    ensure_input_index(tx, input_index)?;
    ensure_prevouts(tx, prevouts)?;

    let prevout = &prevouts[input_index];
    let spend = Spend {
        input_index,
        script_pubkey: &prevout.script_pubkey,
        amount: prevout.value,
        prevouts: Some(prevouts),
    };
    spend.verify(cache, verifier, flags)
}

/// Verifies every input of `tx`, stopping at the first failure.
pub fn verify_transaction(
    tx: &Transaction,
    prevouts: &[TxOut],
    flags: ScriptFlags,
) -> Result<(), Error> {
    ensure_prevouts(tx, prevouts)?;

    let verifier = Secp256k1Backend::new();
    let mut cache = SighashCache::new(tx);
    for input_index in 0..tx.input.len() {
        verify_input(&mut cache, &verifier, input_index, prevouts, flags)?;
    }
    trace!(inputs = tx.input.len(), "transaction verified");
    Ok(())
}

/// One input together with the output it spends.
struct Spend<'a> {
    input_index: usize,
    script_pubkey: &'a [u8],
    amount: u64,
    prevouts: Option<&'a [TxOut]>,
}

impl<'a> Spend<'a> {
    fn verify(
        &self,
        cache: &mut SighashCache<'_>,
        verifier: &dyn SignatureVerifier,
        flags: ScriptFlags,
    ) -> Result<(), Error> {
        let txin = &cache.transaction().input[self.input_index];
        trace!(
            input = self.input_index,
            flags = flags.bits(),
            amount = self.amount,
            "verifying input"
        );

        let mut interpreter =
            Interpreter::new(cache, verifier, self.input_index, flags).with_amount(self.amount);
        if let Some(prevouts) = self.prevouts {
            interpreter = interpreter.with_prevouts(prevouts);
        }
        interpreter
            .verify_script(&txin.script_sig, self.script_pubkey, &txin.witness)
            .map_err(|err| {
                debug!(input = self.input_index, error = %err, "input rejected");
                Error::Script(err)
            })
    }
}

fn ensure_input_index(tx: &Transaction, input_index: usize) -> Result<(), Error> {
    if input_index >= tx.input.len() {
        return Err(Error::TxIndex {
            index: input_index,
            inputs: tx.input.len(),
        });
    }
    Ok(())
}

fn ensure_prevouts(tx: &Transaction, prevouts: &[TxOut]) -> Result<(), Error> {
    if prevouts.len() != tx.input.len() {
        return Err(Error::SpentOutputsMismatch);
    }
    Ok(())
}
