//! Script numbers: minimally encoded little-endian signed integers with the
//! sign in the top bit of the last byte.

use core::ops::{Add, Neg, Sub};

use crate::error::ScriptError;

/// Operand width for arithmetic opcodes.
pub const DEFAULT_MAX_NUM_SIZE: usize = 4;
/// Operand width for CHECKLOCKTIMEVERIFY and CHECKSEQUENCEVERIFY.
pub const LOCKTIME_MAX_NUM_SIZE: usize = 5;

#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct ScriptNum(i64);

impl ScriptNum {
    pub const ZERO: ScriptNum = ScriptNum(0);
    pub const ONE: ScriptNum = ScriptNum(1);

    pub fn new(value: i64) -> Self {
        Self(value)
    }

    pub fn value(self) -> i64 {
        self.0
    }

    /// Decodes a stack element, enforcing the width limit and optionally the
    /// minimal encoding rule.
    pub fn decode(bytes: &[u8], require_minimal: bool, max_len: usize) -> Result<Self, ScriptError> {
        if bytes.len() > max_len {
            return Err(ScriptError::NumOverflow);
        }
        if require_minimal && !is_minimally_encoded(bytes) {
            return Err(ScriptError::NumNotMinimal);
        }
        Ok(Self(decode_unchecked(bytes)))
    }

    /// Minimal encoding; zero is the empty vector.
    pub fn encode(self) -> Vec<u8> {
        let value = self.0;
        if value == 0 {
            return Vec::new();
        }

        let mut result = Vec::with_capacity(9);
        let mut abs_value = value.unsigned_abs();
        while abs_value > 0 {
            result.push((abs_value & 0xff) as u8);
            abs_value >>= 8;
        }

        // The loop ran at least once, so there is a last byte.
        let last = result.len() - 1;
        if result[last] & 0x80 != 0 {
            result.push(if value < 0 { 0x80 } else { 0x00 });
        } else if value < 0 {
            result[last] |= 0x80;
        }
        result
    }

    /// Clamps into `i32`, as Core's `CScriptNum::getint` does.
    pub fn to_i32(self) -> i32 {
        self.0.clamp(i64::from(i32::MIN), i64::from(i32::MAX)) as i32
    }
}

impl From<i64> for ScriptNum {
    fn from(value: i64) -> Self {
        Self(value)
    }
}

impl Add for ScriptNum {
    type Output = ScriptNum;

    fn add(self, rhs: Self) -> Self {
        Self(self.0 + rhs.0)
    }
}

impl Sub for ScriptNum {
    type Output = ScriptNum;

    fn sub(self, rhs: Self) -> Self {
        Self(self.0 - rhs.0)
    }
}

impl Neg for ScriptNum {
    type Output = ScriptNum;

    fn neg(self) -> Self {
        Self(-self.0)
    }
}

fn decode_unchecked(bytes: &[u8]) -> i64 {
    let Some(&last) = bytes.last() else {
        return 0;
    };

    let mut result: i64 = 0;
    for (i, &byte) in bytes.iter().enumerate() {
        result |= i64::from(byte) << (8 * i);
    }

    if last & 0x80 != 0 {
        let mask = !(0x80i64 << (8 * (bytes.len() - 1)));
        -(result & mask)
    } else {
        result
    }
}

/// True when `bytes` carries no superfluous trailing zero byte.
pub fn is_minimally_encoded(bytes: &[u8]) -> bool {
    let Some(&last) = bytes.last() else {
        return true;
    };
    if last & 0x7f == 0 {
        // A sign-only last byte is only needed when the byte before it uses its top bit.
        if bytes.len() == 1 || bytes[bytes.len() - 2] & 0x80 == 0 {
            return false;
        }
    }
    true
}

/// Truthiness of a stack element: any non-zero byte, except a lone sign bit
/// in the last position (negative zero).
pub fn cast_to_bool(data: &[u8]) -> bool {
    for (i, &byte) in data.iter().enumerate() {
        if byte != 0 {
            return !(i == data.len() - 1 && byte == 0x80);
        }
    }
    false
}
