//! Script verification flags.
//!
//! Bit values match Bitcoin Core's `SCRIPT_VERIFY_*` constants so flag sets
//! can be exchanged with Core's test vectors and `libbitcoinconsensus`.

use crate::error::Error;

/// Do not enable any verification.
pub const VERIFY_NONE: u32 = 0;
/// Evaluate P2SH (BIP16) subscripts.
pub const VERIFY_P2SH: u32 = 1 << 0;
/// Enforce strict signature and public key encodings.
pub const VERIFY_STRICTENC: u32 = 1 << 1;
/// Enforce strict DER (BIP66) compliance.
pub const VERIFY_DERSIG: u32 = 1 << 2;
/// Require signatures to use low-S form (BIP62).
pub const VERIFY_LOW_S: u32 = 1 << 3;
/// Require the CHECKMULTISIG dummy argument to be empty (BIP147).
pub const VERIFY_NULLDUMMY: u32 = 1 << 4;
/// Require scriptSig to be push only.
pub const VERIFY_SIGPUSHONLY: u32 = 1 << 5;
/// Require minimal pushes and minimally encoded numbers (BIP62).
pub const VERIFY_MINIMALDATA: u32 = 1 << 6;
/// Fail on NOP1 and NOP4..NOP10.
pub const VERIFY_DISCOURAGE_UPGRADABLE_NOPS: u32 = 1 << 7;
/// Require exactly one stack element after evaluation.
pub const VERIFY_CLEANSTACK: u32 = 1 << 8;
/// Enable CHECKLOCKTIMEVERIFY (BIP65).
pub const VERIFY_CHECKLOCKTIMEVERIFY: u32 = 1 << 9;
/// Enable CHECKSEQUENCEVERIFY (BIP112).
pub const VERIFY_CHECKSEQUENCEVERIFY: u32 = 1 << 10;
/// Enable segregated witness (BIP141, BIP143).
pub const VERIFY_WITNESS: u32 = 1 << 11;
/// Fail on witness versions without defined semantics.
pub const VERIFY_DISCOURAGE_UPGRADABLE_WITNESS_PROGRAM: u32 = 1 << 12;
/// Require IF/NOTIF arguments in witness v0 scripts to be empty or exactly `0x01`.
pub const VERIFY_MINIMALIF: u32 = 1 << 13;
/// Require failed signature checks to use an empty signature (BIP146).
pub const VERIFY_NULLFAIL: u32 = 1 << 14;
/// Require compressed public keys in witness v0 scripts.
pub const VERIFY_WITNESS_PUBKEYTYPE: u32 = 1 << 15;
/// Enable taproot and tapscript (BIP341, BIP342).
pub const VERIFY_TAPROOT: u32 = 1 << 17;
/// Fail on unknown tapleaf versions.
pub const VERIFY_DISCOURAGE_UPGRADABLE_TAPROOT_VERSION: u32 = 1 << 18;
/// Fail on OP_SUCCESSx in tapscript.
pub const VERIFY_DISCOURAGE_OP_SUCCESS: u32 = 1 << 19;
/// Fail on tapscript public keys of unknown type.
pub const VERIFY_DISCOURAGE_UPGRADABLE_PUBKEYTYPE: u32 = 1 << 20;

/// Every soft fork enforced by consensus before taproot.
pub const VERIFY_ALL_PRE_TAPROOT: u32 = VERIFY_P2SH
    | VERIFY_DERSIG
    | VERIFY_NULLDUMMY
    | VERIFY_CHECKLOCKTIMEVERIFY
    | VERIFY_CHECKSEQUENCEVERIFY
    | VERIFY_WITNESS;

const SUPPORTED_FLAGS: u32 = VERIFY_P2SH
    | VERIFY_STRICTENC
    | VERIFY_DERSIG
    | VERIFY_LOW_S
    | VERIFY_NULLDUMMY
    | VERIFY_SIGPUSHONLY
    | VERIFY_MINIMALDATA
    | VERIFY_DISCOURAGE_UPGRADABLE_NOPS
    | VERIFY_CLEANSTACK
    | VERIFY_CHECKLOCKTIMEVERIFY
    | VERIFY_CHECKSEQUENCEVERIFY
    | VERIFY_WITNESS
    | VERIFY_DISCOURAGE_UPGRADABLE_WITNESS_PROGRAM
    | VERIFY_MINIMALIF
    | VERIFY_NULLFAIL
    | VERIFY_WITNESS_PUBKEYTYPE
    | VERIFY_TAPROOT
    | VERIFY_DISCOURAGE_UPGRADABLE_TAPROOT_VERSION
    | VERIFY_DISCOURAGE_OP_SUCCESS
    | VERIFY_DISCOURAGE_UPGRADABLE_PUBKEYTYPE;

/// Computes flags for soft fork activation heights on the Bitcoin network.
pub fn height_to_flags(height: u32) -> u32 {
    let mut flag = VERIFY_NONE;

    if height >= 173_805 {
        flag |= VERIFY_P2SH;
    }
    if height >= 363_725 {
        flag |= VERIFY_DERSIG;
    }
    if height >= 388_381 {
        flag |= VERIFY_CHECKLOCKTIMEVERIFY;
    }
    if height >= 419_328 {
        flag |= VERIFY_CHECKSEQUENCEVERIFY;
    }
    if height >= 481_824 {
        flag |= VERIFY_NULLDUMMY | VERIFY_WITNESS;
    }
    if height >= 709_632 {
        flag |= VERIFY_TAPROOT;
    }

    flag
}

/// Validated set of verification flags.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ScriptFlags(u32);

impl ScriptFlags {
    /// Rejects unknown bits and adds the bits the given ones depend on:
    /// taproot and clean stack need witness, witness needs P2SH.
    pub fn from_bits(bits: u32) -> Result<Self, Error> {
        if bits & !SUPPORTED_FLAGS != 0 {
            return Err(Error::InvalidFlags(bits));
        }
        Ok(Self(Self::apply_implied_bits(bits)))
    }

    pub fn bits(self) -> u32 {
        self.0
    }

    pub fn contains(self, flag: u32) -> bool {
        self.0 & flag == flag
    }

    pub fn requires_spent_outputs(self) -> bool {
        self.contains(VERIFY_TAPROOT)
    }

    fn apply_implied_bits(mut bits: u32) -> u32 {
        if bits & (VERIFY_TAPROOT | VERIFY_CLEANSTACK) != 0 {
            bits |= VERIFY_WITNESS;
        }
        if bits & VERIFY_WITNESS != 0 {
            bits |= VERIFY_P2SH;
        }
        bits
    }
}

impl Default for ScriptFlags {
    fn default() -> Self {
        Self(VERIFY_ALL_PRE_TAPROOT)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn height_flag_schedule_matches_bitcoin_core() {
        assert_eq!(height_to_flags(0), VERIFY_NONE);
        assert_eq!(height_to_flags(173_804), VERIFY_NONE);
        assert!(height_to_flags(173_805) & VERIFY_P2SH != 0);
        assert!(height_to_flags(363_725) & VERIFY_DERSIG != 0);
        assert!(height_to_flags(388_381) & VERIFY_CHECKLOCKTIMEVERIFY != 0);
        assert!(height_to_flags(419_328) & VERIFY_CHECKSEQUENCEVERIFY != 0);
        assert!(height_to_flags(481_824) & VERIFY_WITNESS != 0);
        assert!(height_to_flags(709_631) & VERIFY_TAPROOT == 0);
        assert_eq!(
            height_to_flags(709_632),
            VERIFY_ALL_PRE_TAPROOT | VERIFY_TAPROOT
        );
    }

    #[test]
    fn rejects_unknown_flags() {
        let invalid_bit = 1 << 31;
        assert_eq!(
            ScriptFlags::from_bits(invalid_bit).unwrap_err(),
            Error::InvalidFlags(invalid_bit)
        );
        // Bit 16 is unassigned.
        assert!(ScriptFlags::from_bits(1 << 16).is_err());
    }

    #[test]
    fn flag_roundtrip_without_implied_bits_is_lossless() {
        let bits = VERIFY_P2SH | VERIFY_SIGPUSHONLY | VERIFY_DERSIG;
        let flags = ScriptFlags::from_bits(bits).unwrap();
        assert_eq!(flags.bits(), bits);
    }

    #[test]
    fn witness_flag_enables_p2sh() {
        let flags = ScriptFlags::from_bits(VERIFY_WITNESS).unwrap();
        assert_eq!(flags.bits(), VERIFY_WITNESS | VERIFY_P2SH);
    }

    #[test]
    fn taproot_and_cleanstack_imply_witness() {
        let flags = ScriptFlags::from_bits(VERIFY_TAPROOT).unwrap();
        assert_eq!(flags.bits(), VERIFY_TAPROOT | VERIFY_WITNESS | VERIFY_P2SH);
        assert!(flags.requires_spent_outputs());

        let flags = ScriptFlags::from_bits(VERIFY_CLEANSTACK).unwrap();
        assert_eq!(flags.bits(), VERIFY_CLEANSTACK | VERIFY_WITNESS | VERIFY_P2SH);
        assert!(!flags.requires_spent_outputs());
    }
}
