use hex_literal::hex;

use crate::{CryptoError, keccak::keccak_hash};

/// secp256k1 curve order N.
const SECP256K1_N: [u8; 32] =
    hex!("fffffffffffffffffffffffffffffffebaaedce6af48a03bbfd25e8cd0364141");
/// N / 2, the EIP-2 upper bound for S values.
const SECP256K1_N_HALF: [u8; 32] =
    hex!("7fffffffffffffffffffffffffffffff5d576e7357a4501ddfe92f46681b20a0");

/// Checks whether a signature's values are valid with the given chain rules.
/// `v` is the bare recovery id (0 or 1); post-Homestead signatures must carry
/// a low S value.
pub fn validate_signature_values(v: u8, r: &[u8; 32], s: &[u8; 32], homestead: bool) -> bool {
    if r.iter().all(|b| *b == 0) || s.iter().all(|b| *b == 0) {
        return false;
    }
    if homestead && s[..] > SECP256K1_N_HALF[..] {
        return false;
    }
    r[..] < SECP256K1_N[..] && s[..] < SECP256K1_N[..] && (v == 0 || v == 1)
}

/// Recovers the 20-byte signer address from a 32-byte signing hash and a
/// 65-byte `r || s || recovery_id` signature.
pub fn recover_address(sighash: &[u8; 32], sig: &[u8; 65]) -> Result<[u8; 20], CryptoError> {
    let recovery_id = secp256k1::ecdsa::RecoveryId::from_i32(sig[64] as i32)
        .map_err(|_| CryptoError::InvalidRecoveryId)?;
    let recoverable_sig =
        secp256k1::ecdsa::RecoverableSignature::from_compact(&sig[..64], recovery_id)
            .map_err(|_| CryptoError::InvalidSignature)?;
    let message = secp256k1::Message::from_digest(*sighash);

    let public_key = secp256k1::SECP256K1
        .recover_ecdsa(&message, &recoverable_sig)
        .map_err(|_| CryptoError::RecoveryFailed)?;

    let hash = keccak_hash(&public_key.serialize_uncompressed()[1..]);
    let mut address = [0u8; 20];
    address.copy_from_slice(&hash[12..]);
    Ok(address)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_zero_values() {
        assert!(!validate_signature_values(0, &[0; 32], &[1; 32], true));
        assert!(!validate_signature_values(0, &[1; 32], &[0; 32], true));
    }

    #[test]
    fn rejects_high_s_post_homestead() {
        let mut high_s = SECP256K1_N_HALF;
        high_s[31] += 1;
        assert!(!validate_signature_values(0, &[1; 32], &high_s, true));
        assert!(validate_signature_values(0, &[1; 32], &high_s, false));
    }

    #[test]
    fn rejects_bad_recovery_id() {
        assert!(!validate_signature_values(2, &[1; 32], &[1; 32], true));
    }

    #[test]
    fn recovers_known_signer() {
        let secret = secp256k1::SecretKey::from_slice(&[0x01; 32]).unwrap();
        let sighash = keccak_hash(b"stepex");
        let message = secp256k1::Message::from_digest(sighash);
        let sig = secp256k1::SECP256K1.sign_ecdsa_recoverable(&message, &secret);
        let (recid, compact) = sig.serialize_compact();

        let mut raw = [0u8; 65];
        raw[..64].copy_from_slice(&compact);
        raw[64] = recid.to_i32() as u8;

        let expected = {
            let pk = secret.public_key(secp256k1::SECP256K1);
            let hash = keccak_hash(&pk.serialize_uncompressed()[1..]);
            let mut a = [0u8; 20];
            a.copy_from_slice(&hash[12..]);
            a
        };
        assert_eq!(recover_address(&sighash, &raw).unwrap(), expected);
    }
}
