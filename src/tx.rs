//! Transaction model and its consensus (de)serialization.
//!
//! Both the legacy layout and the BIP144 extended layout (marker `0x00`,
//! flag `0x01`, witnesses before the locktime) are understood. The model is
//! plain owned data encoded through `bitcoin::consensus`; signature hashing
//! serializes views of it without mutating it.

use bitcoin::{
    consensus::encode::{self, Decodable, Encodable, VarInt},
    hashes::{sha256d, Hash},
    io::{self, Read, Write},
};
use thiserror::Error;

pub use bitcoin::absolute::LOCK_TIME_THRESHOLD;

/// Sequence number that marks an input final.
pub const SEQUENCE_FINAL: u32 = bitcoin::Sequence::MAX.0;
/// BIP68: relative locktime is disabled when this bit is set.
pub const SEQUENCE_LOCKTIME_DISABLE_FLAG: u32 = 1 << 31;
/// BIP68: relative locktime counts 512-second units when this bit is set.
pub const SEQUENCE_LOCKTIME_TYPE_FLAG: u32 = 1 << 22;
/// BIP68: bits holding the relative locktime value.
pub const SEQUENCE_LOCKTIME_MASK: u32 = 0x0000_ffff;

/// Largest input, output or witness item count accepted (Core's `MAX_SIZE`).
pub const MAX_VECTOR_SIZE: u64 = 0x0200_0000;

const SUPERFLUOUS_WITNESS: &str = "superfluous witness record";

/// Failures while decoding transactions from bytes.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DecodeError {
    #[error("unexpected end of data")]
    UnexpectedEof,
    #[error("non-canonical compact size encoding")]
    NonMinimalCompactSize,
    #[error("declared length {0} exceeds the permitted size")]
    OversizedVector(usize),
    #[error("{0} trailing bytes after the encoded value")]
    TrailingBytes(usize),
    #[error("witness flag set but every witness is empty")]
    SuperfluousWitnessFlag,
    #[error("unknown optional data flag {0:#04x}")]
    UnknownFlag(u8),
    #[error("malformed encoding: {0}")]
    Malformed(String),
}

impl From<encode::Error> for DecodeError {
    fn from(err: encode::Error) -> Self {
        match err {
            encode::Error::Io(ref io_err) if io_err.kind() == io::ErrorKind::UnexpectedEof => {
                DecodeError::UnexpectedEof
            }
            encode::Error::NonMinimalVarInt => DecodeError::NonMinimalCompactSize,
            encode::Error::OversizedVectorAllocation { requested, .. } => {
                DecodeError::OversizedVector(requested)
            }
            encode::Error::UnsupportedSegwitFlag(flag) => DecodeError::UnknownFlag(flag),
            encode::Error::ParseFailed(SUPERFLUOUS_WITNESS) => DecodeError::SuperfluousWitnessFlag,
            other => DecodeError::Malformed(other.to_string()),
        }
    }
}

/// Appends the consensus encoding of `value`.
pub(crate) fn serialize_into<T: Encodable + ?Sized>(value: &T, out: &mut Vec<u8>) {
    out.extend_from_slice(&encode::serialize(value));
}

/// Appends a compact size length prefix followed by `data`.
pub(crate) fn serialize_var_bytes(data: &[u8], out: &mut Vec<u8>) {
    serialize_into(&VarInt(data.len() as u64), out);
    out.extend_from_slice(data);
}

fn encode_list<T: Encodable, W: Write + ?Sized>(items: &[T], w: &mut W) -> Result<usize, io::Error> {
    let mut len = VarInt(items.len() as u64).consensus_encode(w)?;
    for item in items {
        len += item.consensus_encode(w)?;
    }
    Ok(len)
}

fn decode_list<T: Decodable, R: Read + ?Sized>(r: &mut R) -> Result<Vec<T>, encode::Error> {
    let VarInt(count) = VarInt::consensus_decode_from_finite_reader(r)?;
    if count > MAX_VECTOR_SIZE {
        return Err(encode::Error::OversizedVectorAllocation {
            requested: count as usize,
            max: MAX_VECTOR_SIZE as usize,
        });
    }
    // Grows with the items actually present, not with the declared count.
    let mut items = Vec::new();
    for _ in 0..count {
        items.push(T::consensus_decode_from_finite_reader(r)?);
    }
    Ok(items)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct OutPoint {
    /// Previous transaction id in internal (little-endian) byte order.
    pub txid: [u8; 32],
    pub vout: u32,
}

impl OutPoint {
    pub fn new(txid: [u8; 32], vout: u32) -> Self {
        Self { txid, vout }
    }
}

impl Encodable for OutPoint {
    fn consensus_encode<W: Write + ?Sized>(&self, w: &mut W) -> Result<usize, io::Error> {
        Ok(self.txid.consensus_encode(w)? + self.vout.consensus_encode(w)?)
    }
}

impl Decodable for OutPoint {
    fn consensus_decode_from_finite_reader<R: Read + ?Sized>(
        r: &mut R,
    ) -> Result<Self, encode::Error> {
        Ok(Self {
            txid: Decodable::consensus_decode_from_finite_reader(r)?,
            vout: Decodable::consensus_decode_from_finite_reader(r)?,
        })
    }
}

/// Witness stack of one input.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default)]
pub struct Witness(Vec<Vec<u8>>);

impl Witness {
    pub fn new() -> Self {
        Self(Vec::new())
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn push(&mut self, item: impl Into<Vec<u8>>) {
        self.0.push(item.into());
    }

    pub fn items(&self) -> &[Vec<u8>] {
        &self.0
    }

    pub fn iter(&self) -> impl Iterator<Item = &[u8]> {
        self.0.iter().map(Vec::as_slice)
    }

    pub fn last(&self) -> Option<&[u8]> {
        self.0.last().map(Vec::as_slice)
    }

    /// Size of the witness stack when serialized, count prefix included.
    pub fn serialized_size(&self) -> usize {
        let items: usize = self
            .0
            .iter()
            .map(|item| VarInt(item.len() as u64).size() + item.len())
            .sum();
        VarInt(self.0.len() as u64).size() + items
    }
}

impl From<Vec<Vec<u8>>> for Witness {
    fn from(items: Vec<Vec<u8>>) -> Self {
        Self(items)
    }
}

impl Encodable for Witness {
    fn consensus_encode<W: Write + ?Sized>(&self, w: &mut W) -> Result<usize, io::Error> {
        encode_list(&self.0, w)
    }
}

impl Decodable for Witness {
    fn consensus_decode_from_finite_reader<R: Read + ?Sized>(
        r: &mut R,
    ) -> Result<Self, encode::Error> {
        Ok(Self(decode_list(r)?))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Default)]
pub struct TxIn {
    pub previous_output: OutPoint,
    pub script_sig: Vec<u8>,
    pub sequence: u32,
    pub witness: Witness,
}

/// Witnesses travel separately from the inputs they belong to.
impl Encodable for TxIn {
    fn consensus_encode<W: Write + ?Sized>(&self, w: &mut W) -> Result<usize, io::Error> {
        Ok(self.previous_output.consensus_encode(w)?
            + self.script_sig.consensus_encode(w)?
            + self.sequence.consensus_encode(w)?)
    }
}

impl Decodable for TxIn {
    fn consensus_decode_from_finite_reader<R: Read + ?Sized>(
        r: &mut R,
    ) -> Result<Self, encode::Error> {
        Ok(Self {
            previous_output: Decodable::consensus_decode_from_finite_reader(r)?,
            script_sig: Decodable::consensus_decode_from_finite_reader(r)?,
            sequence: Decodable::consensus_decode_from_finite_reader(r)?,
            witness: Witness::new(),
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Default)]
pub struct TxOut {
    /// Amount in satoshis.
    pub value: u64,
    pub script_pubkey: Vec<u8>,
}

impl TxOut {
    pub fn new(value: u64, script_pubkey: impl Into<Vec<u8>>) -> Self {
        Self {
            value,
            script_pubkey: script_pubkey.into(),
        }
    }

    pub fn serialize(&self) -> Vec<u8> {
        encode::serialize(self)
    }

    /// Decodes a single serialized output, rejecting trailing bytes.
    pub fn deserialize(bytes: &[u8]) -> Result<Self, DecodeError> {
        deserialize_exact(bytes)
    }
}

impl Encodable for TxOut {
    fn consensus_encode<W: Write + ?Sized>(&self, w: &mut W) -> Result<usize, io::Error> {
        Ok(self.value.consensus_encode(w)? + self.script_pubkey.consensus_encode(w)?)
    }
}

impl Decodable for TxOut {
    fn consensus_decode_from_finite_reader<R: Read + ?Sized>(
        r: &mut R,
    ) -> Result<Self, encode::Error> {
        Ok(Self {
            value: Decodable::consensus_decode_from_finite_reader(r)?,
            script_pubkey: Decodable::consensus_decode_from_finite_reader(r)?,
        })
    }
}

fn deserialize_exact<T: Decodable>(bytes: &[u8]) -> Result<T, DecodeError> {
    let (value, consumed) = encode::deserialize_partial::<T>(bytes)?;
    match bytes.len() - consumed {
        0 => Ok(value),
        trailing => Err(DecodeError::TrailingBytes(trailing)),
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Default)]
pub struct Transaction {
    pub version: i32,
    pub input: Vec<TxIn>,
    pub output: Vec<TxOut>,
    pub lock_time: u32,
}

impl Transaction {
    /// Decodes a transaction that must span all of `bytes`.
    pub fn deserialize(bytes: &[u8]) -> Result<Self, DecodeError> {
        deserialize_exact(bytes)
    }

    /// Decodes one transaction from the front of `bytes`, returning it with
    /// the number of bytes it occupied.
    pub fn deserialize_partial(bytes: &[u8]) -> Result<(Self, usize), DecodeError> {
        Ok(encode::deserialize_partial(bytes)?)
    }

    pub fn has_witness(&self) -> bool {
        self.input.iter().any(|txin| !txin.witness.is_empty())
    }

    /// Serializes with witnesses when any input carries one.
    pub fn serialize(&self) -> Vec<u8> {
        encode::serialize(self)
    }

    pub fn serialize_without_witness(&self) -> Vec<u8> {
        encode::serialize(&WithoutWitness(self))
    }

    fn encode_layout<W: Write + ?Sized>(
        &self,
        w: &mut W,
        include_witness: bool,
    ) -> Result<usize, io::Error> {
        let mut len = self.version.consensus_encode(w)?;
        if include_witness {
            w.write_all(&[0x00, 0x01])?;
            len += 2;
        }
        len += encode_list(&self.input, w)?;
        len += encode_list(&self.output, w)?;
        if include_witness {
            for txin in &self.input {
                len += txin.witness.consensus_encode(w)?;
            }
        }
        len += self.lock_time.consensus_encode(w)?;
        Ok(len)
    }

    /// Double SHA256 of the legacy serialization, in internal byte order.
    pub fn txid(&self) -> [u8; 32] {
        sha256d::Hash::hash(&self.serialize_without_witness()).to_byte_array()
    }
}

impl Encodable for Transaction {
    fn consensus_encode<W: Write + ?Sized>(&self, w: &mut W) -> Result<usize, io::Error> {
        self.encode_layout(w, self.has_witness())
    }
}

/// Legacy layout of a transaction regardless of its witnesses.
struct WithoutWitness<'a>(&'a Transaction);

impl Encodable for WithoutWitness<'_> {
    fn consensus_encode<W: Write + ?Sized>(&self, w: &mut W) -> Result<usize, io::Error> {
        self.0.encode_layout(w, false)
    }
}

impl Decodable for Transaction {
    fn consensus_decode_from_finite_reader<R: Read + ?Sized>(
        r: &mut R,
    ) -> Result<Self, encode::Error> {
        let version = i32::consensus_decode_from_finite_reader(r)?;
        let mut input: Vec<TxIn> = decode_list(r)?;
        let mut flags = 0u8;
        let output = if input.is_empty() {
            // Either a legacy transaction without inputs or the BIP144 marker.
            flags = u8::consensus_decode_from_finite_reader(r)?;
            if flags != 0 {
                input = decode_list(r)?;
                decode_list(r)?
            } else {
                Vec::new()
            }
        } else {
            decode_list(r)?
        };

        if flags & 1 != 0 {
            flags ^= 1;
            for txin in input.iter_mut() {
                txin.witness = Witness::consensus_decode_from_finite_reader(r)?;
            }
            if input.iter().all(|txin| txin.witness.is_empty()) {
                return Err(encode::Error::ParseFailed(SUPERFLUOUS_WITNESS));
            }
        }
        if flags != 0 {
            return Err(encode::Error::UnsupportedSegwitFlag(flags));
        }

        Ok(Self {
            version,
            input,
            output,
            lock_time: u32::consensus_decode_from_finite_reader(r)?,
        })
    }
}
