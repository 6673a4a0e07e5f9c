//! Script codec: bytes to operations and back, asm rendering, and the
//! byte-level template checks the verifier needs (P2SH, witness programs,
//! output classification, FindAndDelete).

use core::fmt;

use bitcoin::hashes::{hash160, sha256, Hash};
use thiserror::Error;

/// Largest script the legacy and witness v0 interpreters accept.
pub const MAX_SCRIPT_SIZE: usize = 10_000;
/// Largest data push or stack element.
pub const MAX_SCRIPT_ELEMENT_SIZE: usize = 520;
pub const MAX_PUBKEYS_PER_MULTISIG: usize = 20;

/// Failures turning bytes into operations or operations into bytes.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CodecError {
    #[error("push at offset {offset} runs past the end of the script")]
    TruncatedPush { offset: usize },
    #[error("{len} bytes do not fit a {opcode} push")]
    PushSize { opcode: &'static str, len: usize },
    #[error("{0} is not encodable as OP_0..OP_16")]
    SmallInt(usize),
    #[error("{0:#04x} is not an OP_SUCCESSx opcode")]
    NotSuccess(u8),
    #[error("{0:#04x} is a defined opcode")]
    NotUndefined(u8),
}

/// Script dialect a buffer is decoded and executed under.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum Dialect {
    Legacy,
    WitnessV0,
    Tapscript,
}

macro_rules! opcodes {
    ($($variant:ident = $byte:literal => $name:literal,)*) => {
        /// Every named non-push opcode.
        #[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
        pub enum Opcode {
            $($variant = $byte,)*
        }

        impl Opcode {
            pub fn from_byte(byte: u8) -> Option<Self> {
                match byte {
                    $($byte => Some(Opcode::$variant),)*
                    _ => None,
                }
            }

            pub fn to_byte(self) -> u8 {
                self as u8
            }

            /// Keyword used in asm output.
            pub fn name(self) -> &'static str {
                match self {
                    $(Opcode::$variant => $name,)*
                }
            }
        }
    };
}

opcodes! {
    Reserved = 0x50 => "OP_RESERVED",
    Nop = 0x61 => "OP_NOP",
    Ver = 0x62 => "OP_VER",
    If = 0x63 => "OP_IF",
    NotIf = 0x64 => "OP_NOTIF",
    VerIf = 0x65 => "OP_VERIF",
    VerNotIf = 0x66 => "OP_VERNOTIF",
    Else = 0x67 => "OP_ELSE",
    EndIf = 0x68 => "OP_ENDIF",
    Verify = 0x69 => "OP_VERIFY",
    Return = 0x6a => "OP_RETURN",
    ToAltStack = 0x6b => "OP_TOALTSTACK",
    FromAltStack = 0x6c => "OP_FROMALTSTACK",
    TwoDrop = 0x6d => "OP_2DROP",
    TwoDup = 0x6e => "OP_2DUP",
    ThreeDup = 0x6f => "OP_3DUP",
    TwoOver = 0x70 => "OP_2OVER",
    TwoRot = 0x71 => "OP_2ROT",
    TwoSwap = 0x72 => "OP_2SWAP",
    IfDup = 0x73 => "OP_IFDUP",
    Depth = 0x74 => "OP_DEPTH",
    Drop = 0x75 => "OP_DROP",
    Dup = 0x76 => "OP_DUP",
    Nip = 0x77 => "OP_NIP",
    Over = 0x78 => "OP_OVER",
    Pick = 0x79 => "OP_PICK",
    Roll = 0x7a => "OP_ROLL",
    Rot = 0x7b => "OP_ROT",
    Swap = 0x7c => "OP_SWAP",
    Tuck = 0x7d => "OP_TUCK",
    Cat = 0x7e => "OP_CAT",
    Substr = 0x7f => "OP_SUBSTR",
    Left = 0x80 => "OP_LEFT",
    Right = 0x81 => "OP_RIGHT",
    Size = 0x82 => "OP_SIZE",
    Invert = 0x83 => "OP_INVERT",
    And = 0x84 => "OP_AND",
    Or = 0x85 => "OP_OR",
    Xor = 0x86 => "OP_XOR",
    Equal = 0x87 => "OP_EQUAL",
    EqualVerify = 0x88 => "OP_EQUALVERIFY",
    Reserved1 = 0x89 => "OP_RESERVED1",
    Reserved2 = 0x8a => "OP_RESERVED2",
    OneAdd = 0x8b => "OP_1ADD",
    OneSub = 0x8c => "OP_1SUB",
    TwoMul = 0x8d => "OP_2MUL",
    TwoDiv = 0x8e => "OP_2DIV",
    Negate = 0x8f => "OP_NEGATE",
    Abs = 0x90 => "OP_ABS",
    Not = 0x91 => "OP_NOT",
    ZeroNotEqual = 0x92 => "OP_0NOTEQUAL",
    Add = 0x93 => "OP_ADD",
    Sub = 0x94 => "OP_SUB",
    Mul = 0x95 => "OP_MUL",
    Div = 0x96 => "OP_DIV",
    Mod = 0x97 => "OP_MOD",
    LShift = 0x98 => "OP_LSHIFT",
    RShift = 0x99 => "OP_RSHIFT",
    BoolAnd = 0x9a => "OP_BOOLAND",
    BoolOr = 0x9b => "OP_BOOLOR",
    NumEqual = 0x9c => "OP_NUMEQUAL",
    NumEqualVerify = 0x9d => "OP_NUMEQUALVERIFY",
    NumNotEqual = 0x9e => "OP_NUMNOTEQUAL",
    LessThan = 0x9f => "OP_LESSTHAN",
    GreaterThan = 0xa0 => "OP_GREATERTHAN",
    LessThanOrEqual = 0xa1 => "OP_LESSTHANOREQUAL",
    GreaterThanOrEqual = 0xa2 => "OP_GREATERTHANOREQUAL",
    Min = 0xa3 => "OP_MIN",
    Max = 0xa4 => "OP_MAX",
    Within = 0xa5 => "OP_WITHIN",
    Ripemd160 = 0xa6 => "OP_RIPEMD160",
    Sha1 = 0xa7 => "OP_SHA1",
    Sha256 = 0xa8 => "OP_SHA256",
    Hash160 = 0xa9 => "OP_HASH160",
    Hash256 = 0xaa => "OP_HASH256",
    CodeSeparator = 0xab => "OP_CODESEPARATOR",
    CheckSig = 0xac => "OP_CHECKSIG",
    CheckSigVerify = 0xad => "OP_CHECKSIGVERIFY",
    CheckMultiSig = 0xae => "OP_CHECKMULTISIG",
    CheckMultiSigVerify = 0xaf => "OP_CHECKMULTISIGVERIFY",
    Nop1 = 0xb0 => "OP_NOP1",
    CheckLockTimeVerify = 0xb1 => "OP_CHECKLOCKTIMEVERIFY",
    CheckSequenceVerify = 0xb2 => "OP_CHECKSEQUENCEVERIFY",
    Nop4 = 0xb3 => "OP_NOP4",
    Nop5 = 0xb4 => "OP_NOP5",
    Nop6 = 0xb5 => "OP_NOP6",
    Nop7 = 0xb6 => "OP_NOP7",
    Nop8 = 0xb7 => "OP_NOP8",
    Nop9 = 0xb8 => "OP_NOP9",
    Nop10 = 0xb9 => "OP_NOP10",
    CheckSigAdd = 0xba => "OP_CHECKSIGADD",
}

impl Opcode {
    /// Opcodes that fail wherever they appear, executed or not.
    pub fn is_disabled(self) -> bool {
        use Opcode::*;

        matches!(
            self,
            Cat | Substr
                | Left
                | Right
                | Invert
                | And
                | Or
                | Xor
                | TwoMul
                | TwoDiv
                | Mul
                | Div
                | Mod
                | LShift
                | RShift
        )
    }

    pub fn is_conditional(self) -> bool {
        matches!(
            self,
            Opcode::If | Opcode::NotIf | Opcode::VerIf | Opcode::VerNotIf | Opcode::Else | Opcode::EndIf
        )
    }
}

const OP_0: u8 = 0x00;
const OP_PUSHDATA1: u8 = 0x4c;
const OP_PUSHDATA2: u8 = 0x4d;
const OP_PUSHDATA4: u8 = 0x4e;
const OP_1NEGATE: u8 = 0x4f;
const OP_1: u8 = 0x51;
const OP_16: u8 = 0x60;
const OP_INVALIDOPCODE: u8 = 0xff;

/// BIP342 OP_SUCCESSx bytes.
pub fn is_op_success(byte: u8) -> bool {
    matches!(
        byte,
        80 | 98 | 126..=129 | 131..=134 | 137..=138 | 141..=142 | 149..=153 | 187..=254
    )
}

/// One decoded script element.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Operation {
    /// `OP_0`, pushes the empty vector.
    Zero,
    /// Direct push of 1 to 75 bytes.
    PushBytes(Vec<u8>),
    PushData1(Vec<u8>),
    PushData2(Vec<u8>),
    PushData4(Vec<u8>),
    NegateOne,
    /// `OP_1` through `OP_16`.
    Constant(u8),
    Op(Opcode),
    /// Tapscript OP_SUCCESSx.
    Success(u8),
    Undefined(u8),
}

impl Operation {
    /// The push a serializer emits for `data`: `OP_0` for empty, otherwise the
    /// narrowest length prefix. Never folds small numbers into `OP_N`.
    pub fn push_slice(data: &[u8]) -> Self {
        match data.len() {
            0 => Operation::Zero,
            1..=0x4b => Operation::PushBytes(data.to_vec()),
            0x4c..=0xff => Operation::PushData1(data.to_vec()),
            0x100..=0xffff => Operation::PushData2(data.to_vec()),
            _ => Operation::PushData4(data.to_vec()),
        }
    }

    /// `OP_0` for zero, `OP_1`..`OP_16` otherwise.
    pub fn small_int(n: usize) -> Result<Self, CodecError> {
        match n {
            0 => Ok(Operation::Zero),
            1..=16 => Ok(Operation::Constant(n as u8)),
            _ => Err(CodecError::SmallInt(n)),
        }
    }

    /// Byte the operation serializes to, if the variant's contents fit it.
    pub fn opcode_byte(&self) -> Result<u8, CodecError> {
        let byte = match self {
            Operation::Zero => OP_0,
            Operation::PushBytes(data) => match data.len() {
                len @ 1..=0x4b => len as u8,
                len => return Err(CodecError::PushSize { opcode: "direct", len }),
            },
            Operation::PushData1(data) => {
                check_push_len(data, 0xff, "OP_PUSHDATA1")?;
                OP_PUSHDATA1
            }
            Operation::PushData2(data) => {
                check_push_len(data, 0xffff, "OP_PUSHDATA2")?;
                OP_PUSHDATA2
            }
            Operation::PushData4(data) => {
                check_push_len(data, u32::MAX as usize, "OP_PUSHDATA4")?;
                OP_PUSHDATA4
            }
            Operation::NegateOne => OP_1NEGATE,
            Operation::Constant(n @ 1..=16) => OP_1 + n - 1,
            Operation::Constant(n) => return Err(CodecError::SmallInt(usize::from(*n))),
            Operation::Op(op) => op.to_byte(),
            Operation::Success(byte) if is_op_success(*byte) => *byte,
            Operation::Success(byte) => return Err(CodecError::NotSuccess(*byte)),
            Operation::Undefined(byte) if *byte > OP_16 && Opcode::from_byte(*byte).is_none() => {
                *byte
            }
            Operation::Undefined(byte) => return Err(CodecError::NotUndefined(*byte)),
        };
        Ok(byte)
    }

    /// Payload of a data push (`OP_0` and `OP_PUSHDATA*` included).
    pub fn push_data(&self) -> Option<&[u8]> {
        match self {
            Operation::Zero => Some(&[]),
            Operation::PushBytes(data)
            | Operation::PushData1(data)
            | Operation::PushData2(data)
            | Operation::PushData4(data) => Some(data),
            _ => None,
        }
    }

    /// Whether the operation only pushes (anything up to and including `OP_16`).
    pub fn is_push(&self) -> bool {
        matches!(self.opcode_byte(), Ok(byte) if byte <= OP_16)
    }

    /// Whether a data push uses the smallest possible encoding for its payload.
    pub fn is_minimal_push(&self) -> bool {
        match self {
            Operation::PushBytes(data) => {
                !(data.len() == 1 && (matches!(data[0], 1..=16) || data[0] == 0x81))
            }
            Operation::PushData1(data) => data.len() > 0x4b,
            Operation::PushData2(data) => data.len() > 0xff,
            Operation::PushData4(data) => data.len() > 0xffff,
            _ => true,
        }
    }

    /// Serializes the operation, rejecting payloads its variant cannot carry.
    pub fn encode(&self) -> Result<Vec<u8>, CodecError> {
        let mut out = Vec::new();
        self.encode_to(&mut out)?;
        Ok(out)
    }

    pub fn encode_to(&self, out: &mut Vec<u8>) -> Result<(), CodecError> {
        out.push(self.opcode_byte()?);
        if let Some(data) = self.push_data() {
            // Widths are checked by `opcode_byte`.
            let len = data.len() as u32;
            match self {
                Operation::PushData1(_) => out.push(len as u8),
                Operation::PushData2(_) => out.extend_from_slice(&(len as u16).to_le_bytes()),
                Operation::PushData4(_) => out.extend_from_slice(&len.to_le_bytes()),
                _ => {}
            }
            out.extend_from_slice(data);
        }
        Ok(())
    }
}

fn check_push_len(data: &[u8], max: usize, opcode: &'static str) -> Result<(), CodecError> {
    if data.len() > max {
        return Err(CodecError::PushSize { opcode, len: data.len() });
    }
    Ok(())
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Operation::Zero => f.write_str("0"),
            Operation::PushBytes(data) => write_hex(f, data),
            Operation::PushData1(data) => {
                f.write_str("OP_PUSHDATA1 ")?;
                write_hex(f, data)
            }
            Operation::PushData2(data) => {
                f.write_str("OP_PUSHDATA2 ")?;
                write_hex(f, data)
            }
            Operation::PushData4(data) => {
                f.write_str("OP_PUSHDATA4 ")?;
                write_hex(f, data)
            }
            Operation::NegateOne => f.write_str("OP_1NEGATE"),
            Operation::Constant(n) => write!(f, "OP_{n}"),
            Operation::Op(op) => f.write_str(op.name()),
            Operation::Success(byte) => write!(f, "OP_SUCCESS{byte}"),
            Operation::Undefined(OP_INVALIDOPCODE) => f.write_str("OP_INVALIDOPCODE"),
            Operation::Undefined(_) => f.write_str("OP_UNKNOWN"),
        }
    }
}

fn write_hex(f: &mut fmt::Formatter<'_>, data: &[u8]) -> fmt::Result {
    for byte in data {
        write!(f, "{byte:02x}")?;
    }
    Ok(())
}

/// Lazily decodes operations from a byte buffer, yielding each with its
/// starting byte offset. Stops after the first error.
#[derive(Debug, Clone)]
pub struct Instructions<'a> {
    bytes: &'a [u8],
    pos: usize,
    dialect: Dialect,
    failed: bool,
}

impl<'a> Instructions<'a> {
    pub fn new(bytes: &'a [u8], dialect: Dialect) -> Self {
        Self {
            bytes,
            pos: 0,
            dialect,
            failed: false,
        }
    }

    /// Offset of the next undecoded byte.
    pub fn position(&self) -> usize {
        self.pos
    }

    fn read_payload(&mut self, start: usize, width: usize) -> Result<Vec<u8>, CodecError> {
        let truncated = CodecError::TruncatedPush { offset: start };
        let len = if width == 0 {
            usize::from(self.bytes[start])
        } else {
            let prefix = self
                .bytes
                .get(self.pos..self.pos + width)
                .ok_or(truncated.clone())?;
            self.pos += width;
            prefix
                .iter()
                .rev()
                .fold(0usize, |acc, byte| (acc << 8) | usize::from(*byte))
        };
        let end = self
            .pos
            .checked_add(len)
            .filter(|end| *end <= self.bytes.len())
            .ok_or(truncated)?;
        let data = self.bytes[self.pos..end].to_vec();
        self.pos = end;
        Ok(data)
    }

    fn decode_next(&mut self, start: usize) -> Result<Operation, CodecError> {
        let byte = self.bytes[start];
        self.pos = start + 1;
        let op = match byte {
            OP_0 => Operation::Zero,
            0x01..=0x4b => Operation::PushBytes(self.read_payload(start, 0)?),
            OP_PUSHDATA1 => Operation::PushData1(self.read_payload(start, 1)?),
            OP_PUSHDATA2 => Operation::PushData2(self.read_payload(start, 2)?),
            OP_PUSHDATA4 => Operation::PushData4(self.read_payload(start, 4)?),
            OP_1NEGATE => Operation::NegateOne,
            OP_1..=OP_16 => Operation::Constant(byte - OP_1 + 1),
            _ if self.dialect == Dialect::Tapscript && is_op_success(byte) => {
                Operation::Success(byte)
            }
            _ => match Opcode::from_byte(byte) {
                Some(opcode) => Operation::Op(opcode),
                None => Operation::Undefined(byte),
            },
        };
        Ok(op)
    }
}

impl<'a> Iterator for Instructions<'a> {
    type Item = Result<(usize, Operation), CodecError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.failed || self.pos >= self.bytes.len() {
            return None;
        }
        let start = self.pos;
        match self.decode_next(start) {
            Ok(op) => Some(Ok((start, op))),
            Err(err) => {
                self.failed = true;
                self.pos = self.bytes.len();
                Some(Err(err))
            }
        }
    }
}

/// A fully decoded script.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default)]
pub struct Script {
    ops: Vec<Operation>,
}

impl Script {
    /// Wraps `ops`, checking that each one serializes as the variant says.
    pub fn new(ops: Vec<Operation>) -> Result<Self, CodecError> {
        for op in &ops {
            op.opcode_byte()?;
        }
        Ok(Self { ops })
    }

    pub fn decode(bytes: &[u8], dialect: Dialect) -> Result<Self, CodecError> {
        let ops = Instructions::new(bytes, dialect)
            .map(|item| item.map(|(_, op)| op))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self { ops })
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::new();
        for op in &self.ops {
            // Every operation was checked on construction or came from the decoder.
            let _ = op.encode_to(&mut out);
        }
        out
    }

    pub fn operations(&self) -> &[Operation] {
        &self.ops
    }

    pub fn is_push_only(&self) -> bool {
        self.ops.iter().all(Operation::is_push)
    }

    /// Space separated asm, pushes as lowercase hex.
    pub fn to_asm(&self) -> String {
        self.ops
            .iter()
            .map(ToString::to_string)
            .collect::<Vec<_>>()
            .join(" ")
    }

    pub fn output_type(&self) -> OutputType {
        OutputType::classify(&self.encode())
    }
}

impl fmt::Display for Script {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_asm())
    }
}

/// Core's `<< vector` serialization of a single push. Payloads of 4 GiB or
/// more do not fit an `OP_PUSHDATA4` length and must not be passed.
pub fn push_slice(data: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(data.len() + 5);
    match data.len() {
        0 => out.push(OP_0),
        len @ 1..=0x4b => out.push(len as u8),
        len @ 0x4c..=0xff => out.extend_from_slice(&[OP_PUSHDATA1, len as u8]),
        len @ 0x100..=0xffff => {
            out.push(OP_PUSHDATA2);
            out.extend_from_slice(&(len as u16).to_le_bytes());
        }
        len => {
            out.push(OP_PUSHDATA4);
            out.extend_from_slice(&(len as u32).to_le_bytes());
        }
    }
    out.extend_from_slice(data);
    out
}

/// True when every operation pushes; a truncated push makes the script not push-only.
pub fn is_push_only(bytes: &[u8]) -> bool {
    Instructions::new(bytes, Dialect::Legacy).all(|item| matches!(item, Ok((_, op)) if op.is_push()))
}

/// `OP_HASH160 <20 bytes> OP_EQUAL`.
pub fn is_p2sh(bytes: &[u8]) -> bool {
    bytes.len() == 23 && bytes[0] == 0xa9 && bytes[1] == 0x14 && bytes[22] == 0x87
}

/// Version and program of a witness output: a version opcode (`OP_0`, or
/// `OP_1`..`OP_16`) followed by one direct push of 2 to 40 bytes.
pub fn witness_program(bytes: &[u8]) -> Option<(u8, &[u8])> {
    if bytes.len() < 4 || bytes.len() > 42 {
        return None;
    }
    let version = match bytes[0] {
        OP_0 => 0,
        OP_1..=OP_16 => bytes[0] - OP_1 + 1,
        _ => return None,
    };
    if usize::from(bytes[1]) + 2 != bytes.len() {
        return None;
    }
    Some((version, &bytes[2..]))
}

/// Standard output templates.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum OutputType {
    NonStandard,
    PubKey,
    PubKeyHash,
    ScriptHash,
    MultiSig,
    NullData,
    WitnessV0KeyHash,
    WitnessV0ScriptHash,
    WitnessV1Taproot,
    WitnessUnknown,
}

impl OutputType {
    pub fn classify(bytes: &[u8]) -> Self {
        if is_p2sh(bytes) {
            return OutputType::ScriptHash;
        }
        if let Some((version, program)) = witness_program(bytes) {
            return match (version, program.len()) {
                (0, 20) => OutputType::WitnessV0KeyHash,
                (0, 32) => OutputType::WitnessV0ScriptHash,
                (0, _) => OutputType::NonStandard,
                (1, 32) => OutputType::WitnessV1Taproot,
                _ => OutputType::WitnessUnknown,
            };
        }
        if bytes.first() == Some(&0x6a) && is_push_only(&bytes[1..]) {
            return OutputType::NullData;
        }
        if is_pay_to_pubkey(bytes) {
            return OutputType::PubKey;
        }
        if bytes.len() == 25
            && bytes[..3] == [0x76, 0xa9, 0x14]
            && bytes[23..] == [0x88, 0xac]
        {
            return OutputType::PubKeyHash;
        }
        if is_bare_multisig(bytes) {
            return OutputType::MultiSig;
        }
        OutputType::NonStandard
    }
}

/// `<pubkey> OP_CHECKSIG`.
pub fn p2pk(pubkey: &[u8]) -> Vec<u8> {
    let mut out = push_slice(pubkey);
    out.push(Opcode::CheckSig.to_byte());
    out
}

/// `OP_DUP OP_HASH160 <hash160(pubkey)> OP_EQUALVERIFY OP_CHECKSIG`. Also the
/// script code of a P2WPKH spend.
pub fn p2pkh(pubkey: &[u8]) -> Vec<u8> {
    let hash = hash160::Hash::hash(pubkey);
    let mut out = vec![Opcode::Dup.to_byte(), Opcode::Hash160.to_byte()];
    out.extend(push_slice(hash.as_byte_array()));
    out.extend([Opcode::EqualVerify.to_byte(), Opcode::CheckSig.to_byte()]);
    out
}

/// `<required> <pubkeys...> <n> OP_CHECKMULTISIG`.
pub fn multisig(required: usize, pubkeys: &[&[u8]]) -> Result<Vec<u8>, CodecError> {
    let mut ops = vec![Operation::small_int(required)?];
    ops.extend(pubkeys.iter().map(|key| Operation::push_slice(key)));
    ops.push(Operation::small_int(pubkeys.len())?);
    ops.push(Operation::Op(Opcode::CheckMultiSig));
    Ok(Script::new(ops)?.encode())
}

/// `OP_HASH160 <hash160(redeem_script)> OP_EQUAL`.
pub fn p2sh(redeem_script: &[u8]) -> Vec<u8> {
    let hash = hash160::Hash::hash(redeem_script);
    let mut out = vec![Opcode::Hash160.to_byte()];
    out.extend(push_slice(hash.as_byte_array()));
    out.push(Opcode::Equal.to_byte());
    out
}

pub fn p2wpkh(pubkey: &[u8]) -> Vec<u8> {
    witness_output(0, hash160::Hash::hash(pubkey).as_byte_array())
}

pub fn p2wsh(witness_script: &[u8]) -> Vec<u8> {
    witness_output(0, sha256::Hash::hash(witness_script).as_byte_array())
}

/// Witness v1 output paying to a tweaked x-only key.
pub fn p2tr(output_key: &[u8; 32]) -> Vec<u8> {
    witness_output(1, output_key)
}

/// `OP_RETURN <data>`.
pub fn null_data(data: &[u8]) -> Vec<u8> {
    let mut out = vec![Opcode::Return.to_byte()];
    out.extend(push_slice(data));
    out
}

fn witness_output(version: u8, program: &[u8]) -> Vec<u8> {
    let mut out = vec![if version == 0 { OP_0 } else { OP_1 + version - 1 }];
    out.extend(push_slice(program));
    out
}

fn is_pubkey_shaped(key: &[u8]) -> bool {
    match key.len() {
        33 => matches!(key[0], 0x02 | 0x03),
        65 => matches!(key[0], 0x04 | 0x06 | 0x07),
        _ => false,
    }
}

fn is_pay_to_pubkey(bytes: &[u8]) -> bool {
    match bytes.split_last() {
        Some((0xac, body)) => match body.split_first() {
            Some((&len, key)) => usize::from(len) == key.len() && is_pubkey_shaped(key),
            None => false,
        },
        _ => false,
    }
}

fn is_bare_multisig(bytes: &[u8]) -> bool {
    let Ok(script) = Script::decode(bytes, Dialect::Legacy) else {
        return false;
    };
    let ops = script.operations();
    let [Operation::Constant(required), keys @ .., Operation::Constant(total), Operation::Op(Opcode::CheckMultiSig)] =
        ops
    else {
        return false;
    };
    keys.len() == usize::from(*total)
        && required <= total
        && keys
            .iter()
            .all(|op| matches!(op, Operation::PushBytes(key) if is_pubkey_shaped(key)))
}

/// End offset of the operation starting at `pos`, or `None` if its push runs
/// past the end of the buffer.
fn op_end(bytes: &[u8], pos: usize) -> Option<usize> {
    let (width, base) = match bytes[pos] {
        len @ 0x01..=0x4b => return pos.checked_add(1 + usize::from(len)).filter(|end| *end <= bytes.len()),
        OP_PUSHDATA1 => (1, pos + 2),
        OP_PUSHDATA2 => (2, pos + 3),
        OP_PUSHDATA4 => (4, pos + 5),
        _ => return Some(pos + 1),
    };
    let prefix = bytes.get(pos + 1..pos + 1 + width)?;
    let len = prefix
        .iter()
        .rev()
        .fold(0usize, |acc, byte| (acc << 8) | usize::from(*byte));
    base.checked_add(len).filter(|end| *end <= bytes.len())
}

/// Removes every occurrence of `pattern` that starts on an operation
/// boundary. Bytes after an undecodable push are kept as they are.
pub fn find_and_delete(script: &[u8], pattern: &[u8]) -> Vec<u8> {
    if pattern.is_empty() {
        return script.to_vec();
    }

    let mut result = Vec::with_capacity(script.len());
    let mut found = false;
    let mut pc = 0usize;
    let mut copied_to = 0usize;
    loop {
        result.extend_from_slice(&script[copied_to..pc]);
        while script[pc..].starts_with(pattern) {
            pc += pattern.len();
            found = true;
        }
        copied_to = pc;
        if pc >= script.len() {
            break;
        }
        match op_end(script, pc) {
            Some(end) => pc = end,
            None => break,
        }
    }

    if !found {
        return script.to_vec();
    }
    result.extend_from_slice(&script[copied_to..]);
    result
}

/// Drops `OP_CODESEPARATOR` operations, as the legacy signature serializer
/// does. Bytes after an undecodable push are copied verbatim.
pub fn remove_codeseparators(script: &[u8]) -> Vec<u8> {
    let separator = Opcode::CodeSeparator.to_byte();
    let mut result = Vec::with_capacity(script.len());
    let mut pc = 0usize;
    while pc < script.len() {
        let Some(end) = op_end(script, pc) else {
            break;
        };
        if script[pc] != separator {
            result.extend_from_slice(&script[pc..end]);
        }
        pc = end;
    }
    result.extend_from_slice(&script[pc..]);
    result
}

/// Scans a tapscript for OP_SUCCESSx. A success opcode before the first
/// undecodable push wins over the decode error.
pub fn contains_op_success(bytes: &[u8]) -> Result<bool, CodecError> {
    for item in Instructions::new(bytes, Dialect::Tapscript) {
        if let (_, Operation::Success(_)) = item? {
            return Ok(true);
        }
    }
    Ok(false)
}
