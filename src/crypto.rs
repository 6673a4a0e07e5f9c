//! Curve operations the verifier depends on, behind narrow traits so tests
//! can substitute deterministic fakes.

use std::sync::OnceLock;

use bitcoin::secp256k1::{
    self, ecdsa, rand, schnorr, All, Keypair, Message, PublicKey, Scalar, Secp256k1, SecretKey,
    XOnlyPublicKey,
};
use thiserror::Error;

#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum CryptoError {
    #[error("invalid secret key")]
    InvalidSecretKey,
    #[error("invalid public key")]
    InvalidPublicKey,
    #[error("tweak is out of range or produces the point at infinity")]
    InvalidTweak,
}

/// Y coordinate parity of a point whose x-only form is used.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Parity {
    Even,
    Odd,
}

impl Parity {
    pub fn from_bit(bit: u8) -> Self {
        if bit & 1 == 0 {
            Parity::Even
        } else {
            Parity::Odd
        }
    }

    pub fn to_bit(self) -> u8 {
        match self {
            Parity::Even => 0,
            Parity::Odd => 1,
        }
    }
}

impl From<secp256k1::Parity> for Parity {
    fn from(parity: secp256k1::Parity) -> Self {
        match parity {
            secp256k1::Parity::Even => Parity::Even,
            secp256k1::Parity::Odd => Parity::Odd,
        }
    }
}

/// Verification capability consumed by the interpreter.
pub trait SignatureVerifier {
    /// Checks a DER signature (hash type byte already removed) against a
    /// serialized public key. Encodings the curve library cannot parse are
    /// simply invalid.
    fn verify_ecdsa(&self, msg: &[u8; 32], sig: &[u8], pubkey: &[u8]) -> bool;

    /// BIP340 verification.
    fn verify_schnorr(&self, msg: &[u8; 32], sig: &[u8; 64], pubkey: &[u8; 32]) -> bool;

    fn is_valid_xonly(&self, pubkey: &[u8; 32]) -> bool;

    /// Computes `P + t·G` for the even-y lift of `pubkey`.
    fn tweak_add_xonly(
        &self,
        pubkey: &[u8; 32],
        tweak: &[u8; 32],
    ) -> Result<([u8; 32], Parity), CryptoError>;
}

/// Key generation and signing, used by tooling and tests.
pub trait Signer {
    fn generate_secret_key(&self) -> [u8; 32];

    /// Serialized public key, compressed (33 bytes) or uncompressed (65 bytes).
    fn public_key(&self, secret: &[u8; 32], compressed: bool) -> Result<Vec<u8>, CryptoError>;

    fn xonly_public_key(&self, secret: &[u8; 32]) -> Result<[u8; 32], CryptoError>;

    /// Low-S DER signature without a hash type byte.
    fn sign_ecdsa(&self, msg: &[u8; 32], secret: &[u8; 32]) -> Result<Vec<u8>, CryptoError>;

    fn sign_schnorr(
        &self,
        msg: &[u8; 32],
        secret: &[u8; 32],
        aux_rand: Option<&[u8; 32]>,
    ) -> Result<[u8; 64], CryptoError>;

    /// Secret key for the output key `P + t·G`, accounting for the parity of `P`.
    fn tweak_secret_key(&self, secret: &[u8; 32], tweak: &[u8; 32])
        -> Result<[u8; 32], CryptoError>;

    fn random_bytes(&self, len: usize) -> Vec<u8>;
}

static SECP256K1: OnceLock<Secp256k1<All>> = OnceLock::new();

fn with_context<R>(f: impl FnOnce(&Secp256k1<All>) -> R) -> R {
    f(SECP256K1.get_or_init(Secp256k1::new))
}

/// `libsecp256k1` through `bitcoin::secp256k1`.
#[derive(Debug, Default, Clone, Copy)]
pub struct Secp256k1Backend;

impl Secp256k1Backend {
    pub fn new() -> Self {
        Self
    }
}

impl SignatureVerifier for Secp256k1Backend {
    fn verify_ecdsa(&self, msg: &[u8; 32], sig: &[u8], pubkey: &[u8]) -> bool {
        let Ok(pubkey) = PublicKey::from_slice(pubkey) else {
            return false;
        };
        let Ok(mut signature) = ecdsa::Signature::from_der_lax(sig) else {
            return false;
        };
        // libsecp256k1 only accepts low-S; consensus accepts both.
        signature.normalize_s();
        let message = Message::from_digest(*msg);
        with_context(|secp| secp.verify_ecdsa(&message, &signature, &pubkey).is_ok())
    }

    fn verify_schnorr(&self, msg: &[u8; 32], sig: &[u8; 64], pubkey: &[u8; 32]) -> bool {
        let Ok(pubkey) = XOnlyPublicKey::from_slice(pubkey) else {
            return false;
        };
        let Ok(signature) = schnorr::Signature::from_slice(sig) else {
            return false;
        };
        let message = Message::from_digest(*msg);
        with_context(|secp| secp.verify_schnorr(&signature, &message, &pubkey).is_ok())
    }

    fn is_valid_xonly(&self, pubkey: &[u8; 32]) -> bool {
        XOnlyPublicKey::from_slice(pubkey).is_ok()
    }

    fn tweak_add_xonly(
        &self,
        pubkey: &[u8; 32],
        tweak: &[u8; 32],
    ) -> Result<([u8; 32], Parity), CryptoError> {
        let pubkey = XOnlyPublicKey::from_slice(pubkey).map_err(|_| CryptoError::InvalidPublicKey)?;
        let scalar = Scalar::from_be_bytes(*tweak).map_err(|_| CryptoError::InvalidTweak)?;
        let (tweaked, parity) = with_context(|secp| pubkey.add_tweak(secp, &scalar))
            .map_err(|_| CryptoError::InvalidTweak)?;
        Ok((tweaked.serialize(), parity.into()))
    }
}

impl Signer for Secp256k1Backend {
    fn generate_secret_key(&self) -> [u8; 32] {
        SecretKey::new(&mut rand::thread_rng()).secret_bytes()
    }

    fn public_key(&self, secret: &[u8; 32], compressed: bool) -> Result<Vec<u8>, CryptoError> {
        let secret = SecretKey::from_slice(secret).map_err(|_| CryptoError::InvalidSecretKey)?;
        let pubkey = with_context(|secp| PublicKey::from_secret_key(secp, &secret));
        Ok(if compressed {
            pubkey.serialize().to_vec()
        } else {
            pubkey.serialize_uncompressed().to_vec()
        })
    }

    fn xonly_public_key(&self, secret: &[u8; 32]) -> Result<[u8; 32], CryptoError> {
        let keypair = with_context(|secp| Keypair::from_seckey_slice(secp, secret))
            .map_err(|_| CryptoError::InvalidSecretKey)?;
        Ok(keypair.x_only_public_key().0.serialize())
    }

    fn sign_ecdsa(&self, msg: &[u8; 32], secret: &[u8; 32]) -> Result<Vec<u8>, CryptoError> {
        let secret = SecretKey::from_slice(secret).map_err(|_| CryptoError::InvalidSecretKey)?;
        let message = Message::from_digest(*msg);
        let signature = with_context(|secp| secp.sign_ecdsa(&message, &secret));
        Ok(signature.serialize_der().to_vec())
    }

    fn sign_schnorr(
        &self,
        msg: &[u8; 32],
        secret: &[u8; 32],
        aux_rand: Option<&[u8; 32]>,
    ) -> Result<[u8; 64], CryptoError> {
        let message = Message::from_digest(*msg);
        let signature = with_context(|secp| -> Result<schnorr::Signature, CryptoError> {
            let keypair = Keypair::from_seckey_slice(secp, secret)
                .map_err(|_| CryptoError::InvalidSecretKey)?;
            Ok(match aux_rand {
                Some(aux) => secp.sign_schnorr_with_aux_rand(&message, &keypair, aux),
                None => secp.sign_schnorr_no_aux_rand(&message, &keypair),
            })
        })?;
        Ok(signature.serialize())
    }

    fn tweak_secret_key(
        &self,
        secret: &[u8; 32],
        tweak: &[u8; 32],
    ) -> Result<[u8; 32], CryptoError> {
        let scalar = Scalar::from_be_bytes(*tweak).map_err(|_| CryptoError::InvalidTweak)?;
        with_context(|secp| -> Result<[u8; 32], CryptoError> {
            let keypair = Keypair::from_seckey_slice(secp, secret)
                .map_err(|_| CryptoError::InvalidSecretKey)?;
            let tweaked = keypair
                .add_xonly_tweak(secp, &scalar)
                .map_err(|_| CryptoError::InvalidTweak)?;
            Ok(tweaked.secret_bytes())
        })
    }

    fn random_bytes(&self, len: usize) -> Vec<u8> {
        use rand::RngCore;

        let mut out = vec![0u8; len];
        rand::thread_rng().fill_bytes(&mut out);
        out
    }
}

/// Whether a DER signature (hash type byte removed) already has a low S
/// value. Unparseable signatures are not low-S.
pub fn is_low_s(sig: &[u8]) -> bool {
    let Ok(signature) = ecdsa::Signature::from_der_lax(sig) else {
        return false;
    };
    let mut normalized = signature;
    normalized.normalize_s();
    normalized == signature
}

#[cfg(test)]
mod tests {
    use super::*;
    use bitcoin::hashes::{sha256, Hash};

    fn digest(tag: &[u8]) -> [u8; 32] {
        sha256::Hash::hash(tag).to_byte_array()
    }

    #[test]
    fn ecdsa_sign_verify_roundtrip() {
        let backend = Secp256k1Backend::new();
        let secret = [0x11u8; 32];
        let msg = digest(b"ecdsa");
        let sig = backend.sign_ecdsa(&msg, &secret).unwrap();

        for compressed in [true, false] {
            let pubkey = backend.public_key(&secret, compressed).unwrap();
            assert!(backend.verify_ecdsa(&msg, &sig, &pubkey));
            assert!(!backend.verify_ecdsa(&digest(b"other"), &sig, &pubkey));
        }
        assert!(is_low_s(&sig));
        assert!(!backend.verify_ecdsa(&msg, &sig, &[0x02; 33]));
        assert!(!backend.verify_ecdsa(&msg, &[], &backend.public_key(&secret, true).unwrap()));
    }

    #[test]
    fn high_s_signatures_verify_but_are_not_low_s() {
        let backend = Secp256k1Backend::new();
        let secret = [0x22u8; 32];
        let msg = digest(b"high-s");
        let low = ecdsa::Signature::from_der(&backend.sign_ecdsa(&msg, &secret).unwrap()).unwrap();

        // s' = n - s, serialized by hand from the compact form.
        let compact = low.serialize_compact();
        let order = secp256k1::constants::CURVE_ORDER;
        let mut high_s = [0u8; 32];
        let mut borrow = 0i16;
        for i in (0..32).rev() {
            let diff = i16::from(order[i]) - i16::from(compact[32 + i]) - borrow;
            high_s[i] = diff.rem_euclid(256) as u8;
            borrow = i16::from(diff < 0);
        }
        let mut high_compact = compact;
        high_compact[32..].copy_from_slice(&high_s);
        let high = ecdsa::Signature::from_compact(&high_compact).unwrap();
        let high_der = high.serialize_der().to_vec();

        assert!(!is_low_s(&high_der));
        let pubkey = backend.public_key(&secret, true).unwrap();
        assert!(backend.verify_ecdsa(&msg, &high_der, &pubkey));
    }

    #[test]
    fn schnorr_sign_verify_roundtrip() {
        let backend = Secp256k1Backend::new();
        let secret = [0x33u8; 32];
        let msg = digest(b"schnorr");
        let pubkey = backend.xonly_public_key(&secret).unwrap();

        let sig = backend.sign_schnorr(&msg, &secret, Some(&[7u8; 32])).unwrap();
        assert!(backend.verify_schnorr(&msg, &sig, &pubkey));
        let sig = backend.sign_schnorr(&msg, &secret, None).unwrap();
        assert!(backend.verify_schnorr(&msg, &sig, &pubkey));

        let mut tampered = sig;
        tampered[10] ^= 1;
        assert!(!backend.verify_schnorr(&msg, &tampered, &pubkey));
    }

    #[test]
    fn tweaked_secret_signs_for_tweaked_key() {
        let backend = Secp256k1Backend::new();
        let secret = backend.generate_secret_key();
        let internal = backend.xonly_public_key(&secret).unwrap();
        let tweak = digest(b"tweak");

        let (output_key, _parity) = backend.tweak_add_xonly(&internal, &tweak).unwrap();
        let tweaked_secret = backend.tweak_secret_key(&secret, &tweak).unwrap();
        assert_eq!(backend.xonly_public_key(&tweaked_secret).unwrap(), output_key);

        let msg = digest(b"spend");
        let sig = backend.sign_schnorr(&msg, &tweaked_secret, None).unwrap();
        assert!(backend.verify_schnorr(&msg, &sig, &output_key));
    }

    #[test]
    fn out_of_range_tweak_rejected() {
        let backend = Secp256k1Backend::new();
        let internal = backend.xonly_public_key(&[0x44u8; 32]).unwrap();
        assert_eq!(
            backend.tweak_add_xonly(&internal, &[0xff; 32]).unwrap_err(),
            CryptoError::InvalidTweak
        );
        assert!(!backend.is_valid_xonly(&[0xff; 32]));
        assert!(backend.is_valid_xonly(&internal));
    }

    #[test]
    fn random_bytes_have_requested_length() {
        let backend = Secp256k1Backend::new();
        assert_eq!(backend.random_bytes(0).len(), 0);
        assert_eq!(backend.random_bytes(48).len(), 48);
    }
}
