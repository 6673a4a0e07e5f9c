//! Error types returned by the verifier.

use thiserror::Error;

use crate::tx::DecodeError;

/// Interpreter failures, mirroring Bitcoin Core's `ScriptError_t`.
#[derive(Error, Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum ScriptError {
    #[error("unknown error")]
    Unknown,
    #[error("script evaluated without error but finished with a false/empty top stack element")]
    EvalFalse,
    #[error("OP_RETURN was encountered")]
    OpReturn,
    #[error("script is too big")]
    ScriptSize,
    #[error("push value size limit exceeded")]
    PushSize,
    #[error("operation limit exceeded")]
    OpCount,
    #[error("stack size limit exceeded")]
    StackSize,
    #[error("signature count negative or greater than pubkey count")]
    SigCount,
    #[error("pubkey count negative or limit exceeded")]
    PubkeyCount,
    #[error("script failed an OP_VERIFY operation")]
    Verify,
    #[error("script failed an OP_EQUALVERIFY operation")]
    EqualVerify,
    #[error("script failed an OP_CHECKSIGVERIFY operation")]
    CheckSigVerify,
    #[error("script failed an OP_CHECKMULTISIGVERIFY operation")]
    CheckMultiSigVerify,
    #[error("script failed an OP_NUMEQUALVERIFY operation")]
    NumEqualVerify,
    #[error("opcode missing or not understood")]
    BadOpcode,
    #[error("attempted to use a disabled opcode")]
    DisabledOpcode,
    #[error("operation not valid with the current stack size")]
    InvalidStackOperation,
    #[error("operation not valid with the current altstack size")]
    InvalidAltstackOperation,
    #[error("invalid OP_IF construction")]
    UnbalancedConditional,
    #[error("negative locktime")]
    NegativeLockTime,
    #[error("locktime requirement not satisfied")]
    UnsatisfiedLockTime,
    #[error("signature hash type missing or not understood")]
    SigHashType,
    #[error("non-canonical DER signature")]
    SigDer,
    #[error("data push larger than necessary")]
    MinimalData,
    #[error("only push operators allowed in signatures")]
    SigPushOnly,
    #[error("non-canonical signature: S value is unnecessarily high")]
    SigHighS,
    #[error("dummy CHECKMULTISIG argument must be zero")]
    SigNullDummy,
    #[error("public key is neither compressed nor uncompressed")]
    PubkeyType,
    #[error("stack size must be exactly one after execution")]
    CleanStack,
    #[error("OP_IF/NOTIF argument must be minimal")]
    MinimalIf,
    #[error("OP_IF/NOTIF argument must be minimal in tapscript")]
    TapscriptMinimalIf,
    #[error("signature must be zero for failed CHECK(MULTI)SIG operation")]
    NullFail,
    #[error("NOPx reserved for soft-fork upgrades")]
    DiscourageUpgradableNops,
    #[error("witness version reserved for soft-fork upgrades")]
    DiscourageUpgradableWitnessProgram,
    #[error("taproot version reserved for soft-fork upgrades")]
    DiscourageUpgradableTaprootVersion,
    #[error("OP_SUCCESSx reserved for soft-fork upgrades")]
    DiscourageOpSuccess,
    #[error("public key version reserved for soft-fork upgrades")]
    DiscourageUpgradablePubkeyType,
    #[error("witness program has incorrect length")]
    WitnessProgramWrongLength,
    #[error("witness program was passed an empty witness")]
    WitnessProgramWitnessEmpty,
    #[error("witness program hash mismatch")]
    WitnessProgramMismatch,
    #[error("witness requires empty scriptSig")]
    WitnessMalleated,
    #[error("witness requires only-redeemscript scriptSig")]
    WitnessMalleatedP2SH,
    #[error("witness provided for non-witness script")]
    WitnessUnexpected,
    #[error("using non-compressed keys in segwit")]
    WitnessPubkeyType,
    #[error("invalid Schnorr signature size")]
    SchnorrSigSize,
    #[error("invalid Schnorr signature hash type")]
    SchnorrSigHashType,
    #[error("invalid Schnorr signature")]
    SchnorrSig,
    #[error("invalid taproot control block size")]
    TaprootWrongControlSize,
    #[error("too much signature validation relative to witness weight")]
    TapscriptValidationWeight,
    #[error("OP_CHECKMULTISIG(VERIFY) is not available in tapscript")]
    TapscriptCheckMultiSig,
    #[error("script number operand exceeds the permitted width")]
    NumOverflow,
    #[error("script number operand is not minimally encoded")]
    NumNotMinimal,
}

/// Errors returned by the public verification API.
///
/// Everything except [`Error::Script`] describes a caller mistake (bad
/// transaction bytes, out of range index, inconsistent prevouts); `Script`
/// means the input was checked and rejected.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum Error {
    #[error("input index {index} out of range for transaction with {inputs} inputs")]
    TxIndex { index: usize, inputs: usize },
    #[error("transaction length did not match its serialized size")]
    TxSizeMismatch,
    #[error("failed to deserialize transaction: {0}")]
    TxDeserialize(#[from] DecodeError),
    #[error("script verification flags are invalid: {0:#x}")]
    InvalidFlags(u32),
    #[error("verifying taproot input requires previous outputs")]
    SpentOutputsRequired,
    #[error("spent outputs don't match the transaction")]
    SpentOutputsMismatch,
    #[error("script verification failed: {0}")]
    Script(#[from] ScriptError),
}

impl Error {
    /// Returns the interpreter error when the failure came from script evaluation.
    pub fn script_error(&self) -> Option<ScriptError> {
        match self {
            Error::Script(err) => Some(*err),
            _ => None,
        }
    }
}
