//! Script interpreter and per-input verification.
//!
//! [`Interpreter::execute`] runs one script over an [`ExecutionContext`];
//! [`Interpreter::verify_script`] drives the full BIP16/BIP141/BIP341 flow
//! for one input (scriptSig, scriptPubKey, P2SH redeem script, witness v0 and
//! taproot spends).

use bitcoin::hashes::{hash160, ripemd160, sha1, sha256, sha256d, Hash};
use tracing::{debug, trace};

use crate::{
    crypto::{is_low_s, SignatureVerifier},
    error::ScriptError,
    flags::*,
    num::{cast_to_bool, ScriptNum, DEFAULT_MAX_NUM_SIZE, LOCKTIME_MAX_NUM_SIZE},
    script::{
        contains_op_success, find_and_delete, is_p2sh, is_push_only, push_slice,
        witness_program, Dialect, Instructions, Opcode, Operation, MAX_PUBKEYS_PER_MULTISIG,
        MAX_SCRIPT_ELEMENT_SIZE, MAX_SCRIPT_SIZE,
    },
    sighash::{SighashCache, TapscriptExt, SIGHASH_ANYONECANPAY, SIGHASH_DEFAULT},
    taproot::{
        tapleaf_hash, verify_commitment, ControlBlock, TAPROOT_ANNEX_PREFIX,
        TAPROOT_LEAF_TAPSCRIPT,
    },
    tx::{
        TxIn, TxOut, Witness, LOCK_TIME_THRESHOLD, SEQUENCE_FINAL,
        SEQUENCE_LOCKTIME_DISABLE_FLAG, SEQUENCE_LOCKTIME_MASK, SEQUENCE_LOCKTIME_TYPE_FLAG,
    },
};

/// Combined depth limit of the data and alt stacks.
pub const MAX_STACK_SIZE: usize = 1000;
/// Non-push opcode limit for legacy and witness v0 scripts.
pub const MAX_OPS_PER_SCRIPT: usize = 201;
pub const VALIDATION_WEIGHT_PER_SIGOP_PASSED: i64 = 50;
pub const VALIDATION_WEIGHT_OFFSET: i64 = 50;
/// Key version committed to by tapscript signatures.
const TAPSCRIPT_KEY_VERSION: u8 = 0x00;

/// Data stack of one script run.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct Stack {
    items: Vec<Vec<u8>>,
}

impl Stack {
    pub fn new() -> Self {
        Self { items: Vec::new() }
    }

    pub fn from_items(items: Vec<Vec<u8>>) -> Self {
        Self { items }
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    /// Bottom to top.
    pub fn items(&self) -> &[Vec<u8>] {
        &self.items
    }

    pub fn into_items(self) -> Vec<Vec<u8>> {
        self.items
    }

    pub fn push(&mut self, data: Vec<u8>) -> Result<(), ScriptError> {
        if data.len() > MAX_SCRIPT_ELEMENT_SIZE {
            return Err(ScriptError::PushSize);
        }
        self.items.push(data);
        Ok(())
    }

    pub fn push_bool(&mut self, value: bool) -> Result<(), ScriptError> {
        if value {
            self.push(vec![1])
        } else {
            self.push(Vec::new())
        }
    }

    pub fn push_num(&mut self, value: ScriptNum) -> Result<(), ScriptError> {
        self.push(value.encode())
    }

    pub fn pop(&mut self) -> Result<Vec<u8>, ScriptError> {
        self.items.pop().ok_or(ScriptError::InvalidStackOperation)
    }

    /// Element `depth` positions below the top.
    pub fn top(&self, depth: usize) -> Result<&Vec<u8>, ScriptError> {
        self.index_of(depth).map(|index| &self.items[index])
    }

    pub fn require(&self, count: usize) -> Result<(), ScriptError> {
        if self.items.len() < count {
            return Err(ScriptError::InvalidStackOperation);
        }
        Ok(())
    }

    fn index_of(&self, depth: usize) -> Result<usize, ScriptError> {
        self.items
            .len()
            .checked_sub(depth + 1)
            .ok_or(ScriptError::InvalidStackOperation)
    }

    fn remove(&mut self, depth: usize) -> Result<Vec<u8>, ScriptError> {
        let index = self.index_of(depth)?;
        Ok(self.items.remove(index))
    }

    fn swap(&mut self, a: usize, b: usize) -> Result<(), ScriptError> {
        let (a, b) = (self.index_of(a)?, self.index_of(b)?);
        self.items.swap(a, b);
        Ok(())
    }

    /// Inserts `data` with `depth` elements above it.
    fn insert(&mut self, depth: usize, data: Vec<u8>) -> Result<(), ScriptError> {
        let index = self
            .items
            .len()
            .checked_sub(depth)
            .ok_or(ScriptError::InvalidStackOperation)?;
        self.items.insert(index, data);
        Ok(())
    }

    fn truncate_top(&mut self, count: usize) {
        let len = self.items.len().saturating_sub(count);
        self.items.truncate(len);
    }

    fn num(&self, depth: usize, require_minimal: bool) -> Result<ScriptNum, ScriptError> {
        ScriptNum::decode(self.top(depth)?, require_minimal, DEFAULT_MAX_NUM_SIZE)
    }
}

/// State of one open `IF`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Branch {
    Taken,
    NotTaken,
    /// Opened inside an inactive branch; `ELSE` does not activate it.
    Dormant,
}

/// Script path data available to tapscript signature checks.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TapscriptState {
    pub leaf_hash: [u8; 32],
    pub annex: Option<Vec<u8>>,
    pub validation_weight_left: i64,
    /// Opcode index of the last executed `OP_CODESEPARATOR`.
    pub code_separator_pos: u32,
}

impl TapscriptState {
    pub fn new(leaf_hash: [u8; 32], annex: Option<Vec<u8>>, validation_weight: i64) -> Self {
        Self {
            leaf_hash,
            annex,
            validation_weight_left: validation_weight,
            code_separator_pos: u32::MAX,
        }
    }
}

/// Mutable state of a single script run.
#[derive(Debug, Default, Clone)]
pub struct ExecutionContext {
    stack: Stack,
    altstack: Vec<Vec<u8>>,
    branches: Vec<Branch>,
    op_index: usize,
    op_count: usize,
    /// Byte offset the legacy and witness v0 script code starts at.
    code_separator: usize,
    tapscript: Option<TapscriptState>,
}

impl ExecutionContext {
    pub fn new(stack: Stack) -> Self {
        Self {
            stack,
            ..Self::default()
        }
    }

    pub fn for_tapscript(stack: Stack, state: TapscriptState) -> Self {
        Self {
            stack,
            tapscript: Some(state),
            ..Self::default()
        }
    }

    pub fn stack(&self) -> &Stack {
        &self.stack
    }

    pub fn into_stack(self) -> Stack {
        self.stack
    }

    pub fn tapscript(&self) -> Option<&TapscriptState> {
        self.tapscript.as_ref()
    }

    fn is_executing(&self) -> bool {
        self.branches.last().map_or(true, |branch| *branch == Branch::Taken)
    }
}

/// Verification context for one input of a transaction.
pub struct Interpreter<'a, 'tx> {
    cache: &'a mut SighashCache<'tx>,
    verifier: &'a dyn SignatureVerifier,
    input_index: usize,
    amount: u64,
    prevouts: Option<&'a [TxOut]>,
    flags: ScriptFlags,
}

impl<'a, 'tx> Interpreter<'a, 'tx> {
    pub fn new(
        cache: &'a mut SighashCache<'tx>,
        verifier: &'a dyn SignatureVerifier,
        input_index: usize,
        flags: ScriptFlags,
    ) -> Self {
        Self {
            cache,
            verifier,
            input_index,
            amount: 0,
            prevouts: None,
            flags,
        }
    }

    /// Value of the spent output, committed to by witness v0 signatures.
    pub fn with_amount(mut self, amount: u64) -> Self {
        self.amount = amount;
        self
    }

    /// Outputs spent by every input of the transaction, in input order.
    /// Taproot signature hashes cannot be computed without them.
    pub fn with_prevouts(mut self, prevouts: &'a [TxOut]) -> Self {
        self.prevouts = Some(prevouts);
        self
    }

    pub fn flags(&self) -> ScriptFlags {
        self.flags
    }

    fn has_flag(&self, flag: u32) -> bool {
        self.flags.contains(flag)
    }

    fn txin(&self) -> Result<&'tx TxIn, ScriptError> {
        self.cache
            .transaction()
            .input
            .get(self.input_index)
            .ok_or(ScriptError::Unknown)
    }

    /// Verifies that `script_sig` and `witness` satisfy `script_pubkey`.
    pub fn verify_script(
        &mut self,
        script_sig: &[u8],
        script_pubkey: &[u8],
        witness: &Witness,
    ) -> Result<(), ScriptError> {
        let result = self.verify_script_inner(script_sig, script_pubkey, witness);
        if let Err(err) = &result {
            debug!(input = self.input_index, error = %err, "script verification failed");
        }
        result
    }

    fn verify_script_inner(
        &mut self,
        script_sig: &[u8],
        script_pubkey: &[u8],
        witness: &Witness,
    ) -> Result<(), ScriptError> {
        if self.has_flag(VERIFY_SIGPUSHONLY) && !is_push_only(script_sig) {
            return Err(ScriptError::SigPushOnly);
        }

        let stack = self.eval_script(Stack::new(), script_sig, Dialect::Legacy)?;
        let p2sh_stack = self.has_flag(VERIFY_P2SH).then(|| stack.clone());
        let mut stack = self.eval_script(stack, script_pubkey, Dialect::Legacy)?;
        require_true(&stack)?;

        let mut had_witness = false;
        if self.has_flag(VERIFY_WITNESS) {
            if let Some((version, program)) = witness_program(script_pubkey) {
                had_witness = true;
                if !script_sig.is_empty() {
                    return Err(ScriptError::WitnessMalleated);
                }
                self.verify_witness_program(witness, version, program, false)?;
                stack.items.truncate(1);
            }
        }

        if self.has_flag(VERIFY_P2SH) && is_p2sh(script_pubkey) {
            if !is_push_only(script_sig) {
                return Err(ScriptError::SigPushOnly);
            }
            let mut redeem_stack = p2sh_stack.unwrap_or_default();
            let redeem_script = redeem_stack.pop()?;
            trace!(len = redeem_script.len(), "evaluating P2SH redeem script");
            redeem_stack = self.eval_script(redeem_stack, &redeem_script, Dialect::Legacy)?;
            require_true(&redeem_stack)?;

            if self.has_flag(VERIFY_WITNESS) {
                if let Some((version, program)) = witness_program(&redeem_script) {
                    had_witness = true;
                    if script_sig != push_slice(&redeem_script).as_slice() {
                        return Err(ScriptError::WitnessMalleatedP2SH);
                    }
                    self.verify_witness_program(witness, version, program, true)?;
                    redeem_stack.items.truncate(1);
                }
            }
            stack = redeem_stack;
        }

        if self.has_flag(VERIFY_CLEANSTACK) && stack.len() != 1 {
            return Err(ScriptError::CleanStack);
        }
        if self.has_flag(VERIFY_WITNESS) && !had_witness && !witness.is_empty() {
            return Err(ScriptError::WitnessUnexpected);
        }
        Ok(())
    }

    fn verify_witness_program(
        &mut self,
        witness: &Witness,
        version: u8,
        program: &[u8],
        is_p2sh: bool,
    ) -> Result<(), ScriptError> {
        trace!(version, len = program.len(), is_p2sh, "verifying witness program");
        let items = witness.items();
        match (version, program.len()) {
            (0, 32) => {
                let (script, stack) = items
                    .split_last()
                    .ok_or(ScriptError::WitnessProgramWitnessEmpty)?;
                if sha256::Hash::hash(script).as_byte_array()[..] != *program {
                    return Err(ScriptError::WitnessProgramMismatch);
                }
                self.execute_witness_script(stack.to_vec(), script, Dialect::WitnessV0, None)
            }
            (0, 20) => {
                if items.len() != 2 {
                    return Err(ScriptError::WitnessProgramMismatch);
                }
                let mut script = Vec::with_capacity(25);
                script.extend_from_slice(&[
                    Opcode::Dup.to_byte(),
                    Opcode::Hash160.to_byte(),
                    0x14,
                ]);
                script.extend_from_slice(program);
                script.extend_from_slice(&[
                    Opcode::EqualVerify.to_byte(),
                    Opcode::CheckSig.to_byte(),
                ]);
                self.execute_witness_script(items.to_vec(), &script, Dialect::WitnessV0, None)
            }
            (0, _) => Err(ScriptError::WitnessProgramWrongLength),
            (1, 32) if !is_p2sh => {
                if !self.has_flag(VERIFY_TAPROOT) {
                    return Ok(());
                }
                let mut output_key = [0u8; 32];
                output_key.copy_from_slice(program);
                self.verify_taproot(witness, &output_key)
            }
            _ if self.has_flag(VERIFY_DISCOURAGE_UPGRADABLE_WITNESS_PROGRAM) => {
                Err(ScriptError::DiscourageUpgradableWitnessProgram)
            }
            _ => Ok(()),
        }
    }

    fn verify_taproot(&mut self, witness: &Witness, output_key: &[u8; 32]) -> Result<(), ScriptError> {
        let mut items = witness.items();
        if items.is_empty() {
            return Err(ScriptError::WitnessProgramWitnessEmpty);
        }
        let mut annex = None;
        if let [rest @ .., last] = items {
            if !rest.is_empty() && last.first() == Some(&TAPROOT_ANNEX_PREFIX) {
                annex = Some(last.as_slice());
                items = rest;
            }
        }

        if let [signature] = items {
            trace!("taproot key path spend");
            return self.check_schnorr_signature(signature, output_key, annex, None);
        }

        let (control, rest) = items
            .split_last()
            .ok_or(ScriptError::WitnessProgramWitnessEmpty)?;
        let (script, stack) = rest
            .split_last()
            .ok_or(ScriptError::WitnessProgramWitnessEmpty)?;
        let control =
            ControlBlock::parse(control).map_err(|_| ScriptError::TaprootWrongControlSize)?;
        let leaf_hash = tapleaf_hash(control.leaf_version(), script);
        if !verify_commitment(self.verifier, &control, output_key, &leaf_hash) {
            return Err(ScriptError::WitnessProgramMismatch);
        }

        if control.leaf_version() != TAPROOT_LEAF_TAPSCRIPT {
            if self.has_flag(VERIFY_DISCOURAGE_UPGRADABLE_TAPROOT_VERSION) {
                return Err(ScriptError::DiscourageUpgradableTaprootVersion);
            }
            return Ok(());
        }

        trace!(depth = control.path_len(), "taproot script path spend");
        let weight = witness.serialized_size() as i64 + VALIDATION_WEIGHT_OFFSET;
        let state = TapscriptState::new(leaf_hash, annex.map(<[u8]>::to_vec), weight);
        self.execute_witness_script(stack.to_vec(), script, Dialect::Tapscript, Some(state))
    }

    fn execute_witness_script(
        &mut self,
        items: Vec<Vec<u8>>,
        script: &[u8],
        dialect: Dialect,
        tapscript: Option<TapscriptState>,
    ) -> Result<(), ScriptError> {
        if dialect == Dialect::Tapscript {
            match contains_op_success(script) {
                Err(_) => return Err(ScriptError::BadOpcode),
                Ok(true) if self.has_flag(VERIFY_DISCOURAGE_OP_SUCCESS) => {
                    return Err(ScriptError::DiscourageOpSuccess)
                }
                Ok(true) => return Ok(()),
                Ok(false) => {}
            }
            if items.len() > MAX_STACK_SIZE {
                return Err(ScriptError::StackSize);
            }
        }
        if items.iter().any(|item| item.len() > MAX_SCRIPT_ELEMENT_SIZE) {
            return Err(ScriptError::PushSize);
        }

        let mut ctx = ExecutionContext::new(Stack::from_items(items));
        ctx.tapscript = tapscript;
        self.execute(&mut ctx, script, dialect)?;

        let stack = ctx.into_stack();
        if stack.len() != 1 {
            return Err(ScriptError::CleanStack);
        }
        require_true(&stack)
    }

    /// Runs `script` on `stack` in a fresh context and returns the final stack.
    pub fn eval_script(
        &mut self,
        stack: Stack,
        script: &[u8],
        dialect: Dialect,
    ) -> Result<Stack, ScriptError> {
        let mut ctx = ExecutionContext::new(stack);
        self.execute(&mut ctx, script, dialect)?;
        Ok(ctx.into_stack())
    }

    /// Executes every operation of `script`. Success only means no operation
    /// failed and all branches were closed; the caller judges the final stack.
    pub fn execute(
        &mut self,
        ctx: &mut ExecutionContext,
        script: &[u8],
        dialect: Dialect,
    ) -> Result<(), ScriptError> {
        if dialect != Dialect::Tapscript && script.len() > MAX_SCRIPT_SIZE {
            return Err(ScriptError::ScriptSize);
        }

        let mut instructions = Instructions::new(script, dialect);
        while let Some(item) = instructions.next() {
            let (_, op) = item.map_err(|_| ScriptError::BadOpcode)?;
            self.step(ctx, script, dialect, op, instructions.position())?;
            if ctx.stack.len() + ctx.altstack.len() > MAX_STACK_SIZE {
                return Err(ScriptError::StackSize);
            }
            ctx.op_index += 1;
        }

        if !ctx.branches.is_empty() {
            return Err(ScriptError::UnbalancedConditional);
        }
        Ok(())
    }

    fn step(
        &mut self,
        ctx: &mut ExecutionContext,
        script: &[u8],
        dialect: Dialect,
        op: Operation,
        next: usize,
    ) -> Result<(), ScriptError> {
        if op.push_data().map_or(false, |data| data.len() > MAX_SCRIPT_ELEMENT_SIZE) {
            return Err(ScriptError::PushSize);
        }
        if dialect != Dialect::Tapscript && !op.is_push() {
            ctx.op_count += 1;
            if ctx.op_count > MAX_OPS_PER_SCRIPT {
                return Err(ScriptError::OpCount);
            }
        }
        if matches!(op, Operation::Op(opcode) if opcode.is_disabled()) {
            return Err(ScriptError::DisabledOpcode);
        }
        if !ctx.is_executing() && !matches!(op, Operation::Op(opcode) if opcode.is_conditional()) {
            return Ok(());
        }

        let minimal_push = op.is_minimal_push();
        match op {
            Operation::Zero => ctx.stack.push(Vec::new()),
            Operation::PushBytes(data)
            | Operation::PushData1(data)
            | Operation::PushData2(data)
            | Operation::PushData4(data) => {
                if self.has_flag(VERIFY_MINIMALDATA) && !minimal_push {
                    return Err(ScriptError::MinimalData);
                }
                ctx.stack.push(data)
            }
            Operation::NegateOne => ctx.stack.push_num(ScriptNum::new(-1)),
            Operation::Constant(n) => ctx.stack.push_num(ScriptNum::new(i64::from(n))),
            Operation::Op(opcode) => self.execute_opcode(ctx, script, dialect, opcode, next),
            Operation::Success(_) | Operation::Undefined(_) => Err(ScriptError::BadOpcode),
        }
    }

    fn execute_opcode(
        &mut self,
        ctx: &mut ExecutionContext,
        script: &[u8],
        dialect: Dialect,
        opcode: Opcode,
        next: usize,
    ) -> Result<(), ScriptError> {
        use Opcode::*;

        let require_minimal = self.has_flag(VERIFY_MINIMALDATA);
        let stack = &mut ctx.stack;

        match opcode {
            Reserved | Ver | VerIf | VerNotIf | Reserved1 | Reserved2 => {
                return Err(ScriptError::BadOpcode)
            }
            Cat | Substr | Left | Right | Invert | And | Or | Xor | TwoMul | TwoDiv | Mul | Div
            | Mod | LShift | RShift => return Err(ScriptError::DisabledOpcode),

            Nop => {}
            Nop1 | Nop4 | Nop5 | Nop6 | Nop7 | Nop8 | Nop9 | Nop10 => self.upgradable_nop()?,
            CheckLockTimeVerify => {
                // Unflagged it is a plain NOP2, never discouraged.
                if !self.has_flag(VERIFY_CHECKLOCKTIMEVERIFY) {
                    return Ok(());
                }
                stack.require(1)?;
                let lock_time =
                    ScriptNum::decode(stack.top(0)?, require_minimal, LOCKTIME_MAX_NUM_SIZE)?;
                if lock_time.value() < 0 {
                    return Err(ScriptError::NegativeLockTime);
                }
                self.check_lock_time(lock_time.value())?;
            }
            CheckSequenceVerify => {
                if !self.has_flag(VERIFY_CHECKSEQUENCEVERIFY) {
                    return Ok(());
                }
                stack.require(1)?;
                let sequence =
                    ScriptNum::decode(stack.top(0)?, require_minimal, LOCKTIME_MAX_NUM_SIZE)?;
                if sequence.value() < 0 {
                    return Err(ScriptError::NegativeLockTime);
                }
                if sequence.value() & i64::from(SEQUENCE_LOCKTIME_DISABLE_FLAG) == 0 {
                    self.check_sequence(sequence.value())?;
                }
            }

            If | NotIf => {
                let branch = if ctx.is_executing() {
                    let condition = ctx
                        .stack
                        .pop()
                        .map_err(|_| ScriptError::UnbalancedConditional)?;
                    let minimal_if = match dialect {
                        Dialect::Tapscript => Some(ScriptError::TapscriptMinimalIf),
                        Dialect::WitnessV0 if self.has_flag(VERIFY_MINIMALIF) => {
                            Some(ScriptError::MinimalIf)
                        }
                        _ => None,
                    };
                    if let Some(err) = minimal_if {
                        if !(condition.is_empty() || condition == [1]) {
                            return Err(err);
                        }
                    }
                    if cast_to_bool(&condition) == (opcode == If) {
                        Branch::Taken
                    } else {
                        Branch::NotTaken
                    }
                } else {
                    Branch::Dormant
                };
                ctx.branches.push(branch);
            }
            Else => {
                let branch = ctx
                    .branches
                    .last_mut()
                    .ok_or(ScriptError::UnbalancedConditional)?;
                *branch = match *branch {
                    Branch::Taken => Branch::NotTaken,
                    Branch::NotTaken => Branch::Taken,
                    Branch::Dormant => Branch::Dormant,
                };
            }
            EndIf => {
                ctx.branches
                    .pop()
                    .ok_or(ScriptError::UnbalancedConditional)?;
            }
            Verify => verify_top(stack, ScriptError::Verify)?,
            Return => return Err(ScriptError::OpReturn),

            ToAltStack => {
                let item = stack.pop()?;
                ctx.altstack.push(item);
            }
            FromAltStack => {
                let item = ctx
                    .altstack
                    .pop()
                    .ok_or(ScriptError::InvalidAltstackOperation)?;
                stack.push(item)?;
            }
            TwoDrop => {
                stack.require(2)?;
                stack.truncate_top(2);
            }
            TwoDup => {
                stack.require(2)?;
                let (a, b) = (stack.top(1)?.clone(), stack.top(0)?.clone());
                stack.push(a)?;
                stack.push(b)?;
            }
            ThreeDup => {
                stack.require(3)?;
                let (a, b, c) = (
                    stack.top(2)?.clone(),
                    stack.top(1)?.clone(),
                    stack.top(0)?.clone(),
                );
                stack.push(a)?;
                stack.push(b)?;
                stack.push(c)?;
            }
            TwoOver => {
                stack.require(4)?;
                let (a, b) = (stack.top(3)?.clone(), stack.top(2)?.clone());
                stack.push(a)?;
                stack.push(b)?;
            }
            TwoRot => {
                stack.require(6)?;
                let a = stack.remove(5)?;
                let b = stack.remove(4)?;
                stack.push(a)?;
                stack.push(b)?;
            }
            TwoSwap => {
                stack.require(4)?;
                stack.swap(3, 1)?;
                stack.swap(2, 0)?;
            }
            IfDup => {
                let top = stack.top(0)?;
                if cast_to_bool(top) {
                    let copy = top.clone();
                    stack.push(copy)?;
                }
            }
            Depth => {
                let depth = ScriptNum::new(stack.len() as i64);
                stack.push_num(depth)?;
            }
            Drop => {
                stack.pop()?;
            }
            Dup => {
                let top = stack.top(0)?.clone();
                stack.push(top)?;
            }
            Nip => {
                stack.require(2)?;
                stack.remove(1)?;
            }
            Over => {
                stack.require(2)?;
                let item = stack.top(1)?.clone();
                stack.push(item)?;
            }
            Pick | Roll => {
                stack.require(2)?;
                let depth = stack.num(0, require_minimal)?.value();
                stack.pop()?;
                if depth < 0 || depth >= stack.len() as i64 {
                    return Err(ScriptError::InvalidStackOperation);
                }
                let depth = depth as usize;
                let item = if opcode == Pick {
                    stack.top(depth)?.clone()
                } else {
                    stack.remove(depth)?
                };
                stack.push(item)?;
            }
            Rot => {
                stack.require(3)?;
                stack.swap(2, 1)?;
                stack.swap(1, 0)?;
            }
            Swap => {
                stack.require(2)?;
                stack.swap(1, 0)?;
            }
            Tuck => {
                stack.require(2)?;
                let top = stack.top(0)?.clone();
                stack.insert(2, top)?;
            }
            Size => {
                let size = ScriptNum::new(stack.top(0)?.len() as i64);
                stack.push_num(size)?;
            }

            Equal | EqualVerify => {
                stack.require(2)?;
                let equal = stack.top(1)? == stack.top(0)?;
                stack.truncate_top(2);
                stack.push_bool(equal)?;
                if opcode == EqualVerify {
                    verify_top(stack, ScriptError::EqualVerify)?;
                }
            }

            OneAdd | OneSub | Negate | Abs | Not | ZeroNotEqual => {
                stack.require(1)?;
                let n = stack.num(0, require_minimal)?;
                let result = match opcode {
                    OneAdd => n + ScriptNum::ONE,
                    OneSub => n - ScriptNum::ONE,
                    Negate => -n,
                    Abs if n.value() < 0 => -n,
                    Abs => n,
                    Not => ScriptNum::from(i64::from(n == ScriptNum::ZERO)),
                    _ => ScriptNum::from(i64::from(n != ScriptNum::ZERO)),
                };
                stack.pop()?;
                stack.push_num(result)?;
            }
            Add | Sub | BoolAnd | BoolOr | NumEqual | NumEqualVerify | NumNotEqual | LessThan
            | GreaterThan | LessThanOrEqual | GreaterThanOrEqual | Min | Max => {
                stack.require(2)?;
                let a = stack.num(1, require_minimal)?;
                let b = stack.num(0, require_minimal)?;
                let zero = ScriptNum::ZERO;
                let flag = |value: bool| ScriptNum::from(i64::from(value));
                let result = match opcode {
                    Add => a + b,
                    Sub => a - b,
                    BoolAnd => flag(a != zero && b != zero),
                    BoolOr => flag(a != zero || b != zero),
                    NumEqual | NumEqualVerify => flag(a == b),
                    NumNotEqual => flag(a != b),
                    LessThan => flag(a < b),
                    GreaterThan => flag(a > b),
                    LessThanOrEqual => flag(a <= b),
                    GreaterThanOrEqual => flag(a >= b),
                    Min => a.min(b),
                    _ => a.max(b),
                };
                stack.truncate_top(2);
                stack.push_num(result)?;
                if opcode == NumEqualVerify {
                    verify_top(stack, ScriptError::NumEqualVerify)?;
                }
            }
            Within => {
                stack.require(3)?;
                let x = stack.num(2, require_minimal)?;
                let min = stack.num(1, require_minimal)?;
                let max = stack.num(0, require_minimal)?;
                stack.truncate_top(3);
                stack.push_bool(min <= x && x < max)?;
            }

            Ripemd160 | Sha1 | Sha256 | Hash160 | Hash256 => {
                let data = stack.pop()?;
                let digest = match opcode {
                    Ripemd160 => ripemd160::Hash::hash(&data).to_byte_array().to_vec(),
                    Sha1 => sha1::Hash::hash(&data).to_byte_array().to_vec(),
                    Sha256 => sha256::Hash::hash(&data).to_byte_array().to_vec(),
                    Hash160 => hash160::Hash::hash(&data).to_byte_array().to_vec(),
                    _ => sha256d::Hash::hash(&data).to_byte_array().to_vec(),
                };
                stack.push(digest)?;
            }

            CodeSeparator => {
                ctx.code_separator = next;
                let op_index = ctx.op_index as u32;
                if let Some(state) = ctx.tapscript.as_mut() {
                    state.code_separator_pos = op_index;
                }
            }
            CheckSig | CheckSigVerify => {
                ctx.stack.require(2)?;
                let success = {
                    let sig = ctx.stack.top(1)?.clone();
                    let pubkey = ctx.stack.top(0)?.clone();
                    self.eval_checksig(ctx, script, dialect, &sig, &pubkey)?
                };
                ctx.stack.truncate_top(2);
                ctx.stack.push_bool(success)?;
                if opcode == CheckSigVerify {
                    verify_top(&mut ctx.stack, ScriptError::CheckSigVerify)?;
                }
            }
            CheckSigAdd => {
                if dialect != Dialect::Tapscript {
                    return Err(ScriptError::BadOpcode);
                }
                ctx.stack.require(3)?;
                let sig = ctx.stack.top(2)?.clone();
                let n = ctx.stack.num(1, require_minimal)?;
                let pubkey = ctx.stack.top(0)?.clone();
                let success = self.eval_checksig(ctx, script, dialect, &sig, &pubkey)?;
                ctx.stack.truncate_top(3);
                ctx.stack
                    .push_num(n + ScriptNum::from(i64::from(success)))?;
            }
            CheckMultiSig | CheckMultiSigVerify => {
                if dialect == Dialect::Tapscript {
                    return Err(ScriptError::TapscriptCheckMultiSig);
                }
                let success = self.eval_checkmultisig(ctx, script, dialect)?;
                ctx.stack.push_bool(success)?;
                if opcode == CheckMultiSigVerify {
                    verify_top(&mut ctx.stack, ScriptError::CheckMultiSigVerify)?;
                }
            }
        }
        Ok(())
    }

    fn upgradable_nop(&self) -> Result<(), ScriptError> {
        if self.has_flag(VERIFY_DISCOURAGE_UPGRADABLE_NOPS) {
            return Err(ScriptError::DiscourageUpgradableNops);
        }
        Ok(())
    }

    fn check_lock_time(&self, lock_time: i64) -> Result<(), ScriptError> {
        let tx_lock_time = self.cache.transaction().lock_time;
        let threshold = i64::from(LOCK_TIME_THRESHOLD);
        let same_type = (tx_lock_time < LOCK_TIME_THRESHOLD) == (lock_time < threshold);
        if !same_type || lock_time > i64::from(tx_lock_time) {
            return Err(ScriptError::UnsatisfiedLockTime);
        }
        if self.txin()?.sequence == SEQUENCE_FINAL {
            return Err(ScriptError::UnsatisfiedLockTime);
        }
        Ok(())
    }

    fn check_sequence(&self, sequence: i64) -> Result<(), ScriptError> {
        let tx_sequence = self.txin()?.sequence;
        if (self.cache.transaction().version as u32) < 2 {
            return Err(ScriptError::UnsatisfiedLockTime);
        }
        if tx_sequence & SEQUENCE_LOCKTIME_DISABLE_FLAG != 0 {
            return Err(ScriptError::UnsatisfiedLockTime);
        }

        let mask = i64::from(SEQUENCE_LOCKTIME_TYPE_FLAG | SEQUENCE_LOCKTIME_MASK);
        let type_flag = i64::from(SEQUENCE_LOCKTIME_TYPE_FLAG);
        let tx_masked = i64::from(tx_sequence) & mask;
        let masked = sequence & mask;
        if (tx_masked < type_flag) != (masked < type_flag) || masked > tx_masked {
            return Err(ScriptError::UnsatisfiedLockTime);
        }
        Ok(())
    }

    fn eval_checksig(
        &mut self,
        ctx: &mut ExecutionContext,
        script: &[u8],
        dialect: Dialect,
        sig: &[u8],
        pubkey: &[u8],
    ) -> Result<bool, ScriptError> {
        match dialect {
            Dialect::Tapscript => self.eval_checksig_tapscript(ctx, sig, pubkey),
            Dialect::Legacy | Dialect::WitnessV0 => {
                let mut script_code = script[ctx.code_separator.min(script.len())..].to_vec();
                if dialect == Dialect::Legacy {
                    script_code = find_and_delete(&script_code, &push_slice(sig));
                }
                self.check_signature_encoding(sig)?;
                self.check_pubkey_encoding(pubkey, dialect)?;
                let success = self.check_ecdsa_signature(sig, pubkey, &script_code, dialect)?;
                if !success && self.has_flag(VERIFY_NULLFAIL) && !sig.is_empty() {
                    return Err(ScriptError::NullFail);
                }
                Ok(success)
            }
        }
    }

    fn eval_checksig_tapscript(
        &mut self,
        ctx: &mut ExecutionContext,
        sig: &[u8],
        pubkey: &[u8],
    ) -> Result<bool, ScriptError> {
        let state = ctx.tapscript.as_mut().ok_or(ScriptError::Unknown)?;
        let success = !sig.is_empty();
        if success {
            state.validation_weight_left -= VALIDATION_WEIGHT_PER_SIGOP_PASSED;
            if state.validation_weight_left < 0 {
                return Err(ScriptError::TapscriptValidationWeight);
            }
        }

        match pubkey.len() {
            0 => return Err(ScriptError::PubkeyType),
            32 if success => {
                let mut key = [0u8; 32];
                key.copy_from_slice(pubkey);
                let ext = TapscriptExt {
                    leaf_hash: state.leaf_hash,
                    key_version: TAPSCRIPT_KEY_VERSION,
                    code_separator_pos: state.code_separator_pos,
                };
                let annex = state.annex.as_deref();
                self.check_schnorr_signature(sig, &key, annex, Some(ext))?;
            }
            32 => {}
            _ if self.has_flag(VERIFY_DISCOURAGE_UPGRADABLE_PUBKEYTYPE) => {
                return Err(ScriptError::DiscourageUpgradablePubkeyType)
            }
            _ => {}
        }
        Ok(success)
    }

    /// BIP340 check of a 64-byte signature, or 65 bytes with an explicit
    /// hash type, over the taproot signature hash.
    fn check_schnorr_signature(
        &mut self,
        sig: &[u8],
        pubkey: &[u8; 32],
        annex: Option<&[u8]>,
        leaf: Option<TapscriptExt>,
    ) -> Result<(), ScriptError> {
        let (sig, hash_type) = match sig.len() {
            64 => (sig, SIGHASH_DEFAULT),
            65 if sig[64] == SIGHASH_DEFAULT => return Err(ScriptError::SchnorrSigHashType),
            65 => (&sig[..64], sig[64]),
            _ => return Err(ScriptError::SchnorrSigSize),
        };
        let prevouts = self.prevouts.ok_or(ScriptError::Unknown)?;
        let digest = self
            .cache
            .taproot_signature_hash(self.input_index, prevouts, annex, leaf, hash_type)
            .map_err(|_| ScriptError::SchnorrSigHashType)?;

        // A 32-byte key that is not on the curve fails like a bad signature.
        if !self.verifier.is_valid_xonly(pubkey) {
            return Err(ScriptError::SchnorrSig);
        }
        let mut signature = [0u8; 64];
        signature.copy_from_slice(sig);
        if !self.verifier.verify_schnorr(&digest, &signature, pubkey) {
            return Err(ScriptError::SchnorrSig);
        }
        Ok(())
    }

    fn check_ecdsa_signature(
        &mut self,
        sig: &[u8],
        pubkey: &[u8],
        script_code: &[u8],
        dialect: Dialect,
    ) -> Result<bool, ScriptError> {
        let Some((&hash_type, der)) = sig.split_last() else {
            return Ok(false);
        };
        let hash_type = u32::from(hash_type);
        let digest = match dialect {
            Dialect::Legacy => {
                self.cache
                    .legacy_signature_hash(self.input_index, script_code, hash_type)
            }
            _ => self.cache.segwit_v0_signature_hash(
                self.input_index,
                script_code,
                self.amount,
                hash_type,
            ),
        }
        .map_err(|_| ScriptError::Unknown)?;
        Ok(self.verifier.verify_ecdsa(&digest, der, pubkey))
    }

    fn eval_checkmultisig(
        &mut self,
        ctx: &mut ExecutionContext,
        script: &[u8],
        dialect: Dialect,
    ) -> Result<bool, ScriptError> {
        let require_minimal = self.has_flag(VERIFY_MINIMALDATA);

        let mut i = 1usize;
        ctx.stack.require(i)?;
        let key_count = ctx.stack.num(0, require_minimal)?.to_i32();
        if key_count < 0 || key_count as usize > MAX_PUBKEYS_PER_MULTISIG {
            return Err(ScriptError::PubkeyCount);
        }
        let key_count = key_count as usize;
        ctx.op_count += key_count;
        if ctx.op_count > MAX_OPS_PER_SCRIPT {
            return Err(ScriptError::OpCount);
        }
        let first_key = i;
        i += key_count + 1;
        ctx.stack.require(i)?;

        let sig_count = ctx.stack.num(i - 1, require_minimal)?.to_i32();
        if sig_count < 0 || sig_count as usize > key_count {
            return Err(ScriptError::SigCount);
        }
        let sig_count = sig_count as usize;
        let first_sig = i;
        i += sig_count;
        // The signatures must be followed by the dummy element.
        ctx.stack.require(i + 1)?;

        // Depth 0 holds the key count; keys and signatures are consumed top first.
        let keys: Vec<Vec<u8>> = (first_key..first_key + key_count)
            .map(|depth| ctx.stack.top(depth).cloned())
            .collect::<Result<_, _>>()?;
        let sigs: Vec<Vec<u8>> = (first_sig..first_sig + sig_count)
            .map(|depth| ctx.stack.top(depth).cloned())
            .collect::<Result<_, _>>()?;

        let mut script_code = script[ctx.code_separator.min(script.len())..].to_vec();
        if dialect == Dialect::Legacy {
            for sig in &sigs {
                script_code = find_and_delete(&script_code, &push_slice(sig));
            }
        }

        let mut success = true;
        let (mut key_index, mut sig_index) = (0usize, 0usize);
        while success && sig_index < sigs.len() {
            let sig = &sigs[sig_index];
            let pubkey = &keys[key_index];
            self.check_signature_encoding(sig)?;
            self.check_pubkey_encoding(pubkey, dialect)?;
            if self.check_ecdsa_signature(sig, pubkey, &script_code, dialect)? {
                sig_index += 1;
            }
            key_index += 1;
            if sigs.len() - sig_index > keys.len() - key_index {
                success = false;
            }
        }

        if !success && self.has_flag(VERIFY_NULLFAIL) && sigs.iter().any(|sig| !sig.is_empty()) {
            return Err(ScriptError::NullFail);
        }
        ctx.stack.truncate_top(i);

        // Consensus quirk: one extra element is consumed.
        let dummy = ctx.stack.pop()?;
        if self.has_flag(VERIFY_NULLDUMMY) && !dummy.is_empty() {
            return Err(ScriptError::SigNullDummy);
        }
        Ok(success)
    }

    fn check_signature_encoding(&self, sig: &[u8]) -> Result<(), ScriptError> {
        if sig.is_empty() {
            return Ok(());
        }
        if self.flags.bits() & (VERIFY_DERSIG | VERIFY_LOW_S | VERIFY_STRICTENC) != 0
            && !is_valid_signature_encoding(sig)
        {
            return Err(ScriptError::SigDer);
        }
        if self.has_flag(VERIFY_LOW_S) && !is_low_s(&sig[..sig.len() - 1]) {
            return Err(ScriptError::SigHighS);
        }
        if self.has_flag(VERIFY_STRICTENC) && !is_defined_hashtype_signature(sig) {
            return Err(ScriptError::SigHashType);
        }
        Ok(())
    }

    fn check_pubkey_encoding(&self, pubkey: &[u8], dialect: Dialect) -> Result<(), ScriptError> {
        if self.has_flag(VERIFY_STRICTENC) && !is_compressed_or_uncompressed_pubkey(pubkey) {
            return Err(ScriptError::PubkeyType);
        }
        if self.has_flag(VERIFY_WITNESS_PUBKEYTYPE)
            && dialect == Dialect::WitnessV0
            && !is_compressed_pubkey(pubkey)
        {
            return Err(ScriptError::WitnessPubkeyType);
        }
        Ok(())
    }
}

fn require_true(stack: &Stack) -> Result<(), ScriptError> {
    match stack.top(0) {
        Ok(top) if cast_to_bool(top) => Ok(()),
        _ => Err(ScriptError::EvalFalse),
    }
}

/// Pops the top element, failing with `error` when it is false.
fn verify_top(stack: &mut Stack, error: ScriptError) -> Result<(), ScriptError> {
    if !cast_to_bool(stack.top(0)?) {
        return Err(error);
    }
    stack.pop()?;
    Ok(())
}

/// BIP66 strict DER, with the trailing hash type byte.
fn is_valid_signature_encoding(sig: &[u8]) -> bool {
    // 0x30 len 0x02 len_r r 0x02 len_s s hashtype
    if sig.len() < 9 || sig.len() > 73 {
        return false;
    }
    if sig[0] != 0x30 || usize::from(sig[1]) != sig.len() - 3 {
        return false;
    }

    let len_r = usize::from(sig[3]);
    if 5 + len_r >= sig.len() {
        return false;
    }
    let len_s = usize::from(sig[5 + len_r]);
    if len_r + len_s + 7 != sig.len() {
        return false;
    }

    if sig[2] != 0x02 || len_r == 0 || sig[4] & 0x80 != 0 {
        return false;
    }
    if len_r > 1 && sig[4] == 0x00 && sig[5] & 0x80 == 0 {
        return false;
    }

    if sig[len_r + 4] != 0x02 || len_s == 0 || sig[len_r + 6] & 0x80 != 0 {
        return false;
    }
    if len_s > 1 && sig[len_r + 6] == 0x00 && sig[len_r + 7] & 0x80 == 0 {
        return false;
    }
    true
}

fn is_defined_hashtype_signature(sig: &[u8]) -> bool {
    let Some(&last) = sig.last() else {
        return false;
    };
    let base = u32::from(last) & !SIGHASH_ANYONECANPAY;
    (1..=3).contains(&base)
}

fn is_compressed_or_uncompressed_pubkey(pubkey: &[u8]) -> bool {
    match pubkey.first() {
        Some(0x04) => pubkey.len() == 65,
        Some(0x02 | 0x03) => pubkey.len() == 33,
        _ => false,
    }
}

fn is_compressed_pubkey(pubkey: &[u8]) -> bool {
    pubkey.len() == 33 && matches!(pubkey[0], 0x02 | 0x03)
}
