// =============================================================================
// FEDERATION NODE — signature.rs
// =============================================================================
//
// RSA-PSS / SHA-256 / MGF1(SHA-256) with maximum salt length, base64 encoded.
// Verification never fails loudly: every decode or crypto error is "no match".
// =============================================================================

use crate::error::{FederationError, FederationResult};
use crate::keystore::load_public_key;
use crate::node::Node;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use rsa::pss::{BlindedSigningKey, Signature, VerifyingKey};
use rsa::signature::{RandomizedSigner, SignatureEncoding, Verifier};
use rsa::traits::PublicKeyParts;
use rsa::{RsaPrivateKey, RsaPublicKey};
use sha2::Sha256;

const SHA256_LEN: usize = 32;

/// emLen - hLen - 2, where emLen = ceil((modBits - 1) / 8)
pub fn max_salt_len(key: &RsaPublicKey) -> usize {
    let em_bits = key.n().bits().saturating_sub(1);
    let em_len = (em_bits + 7) / 8;
    em_len.saturating_sub(SHA256_LEN + 2)
}

pub fn sign_payload(key: &RsaPrivateKey, payload: &[u8]) -> FederationResult<String> {
    let salt_len = max_salt_len(&key.to_public_key());
    let signing_key = BlindedSigningKey::<Sha256>::new_with_salt_len(key.clone(), salt_len);
    let signature = signing_key
        .try_sign_with_rng(&mut rand::thread_rng(), payload)
        .map_err(|e| FederationError::Internal(format!("signing failed: {}", e)))?;
    Ok(BASE64.encode(signature.to_vec()))
}

pub fn verify_with_key(key: &RsaPublicKey, payload: &[u8], signature_b64: &str) -> bool {
    let Ok(raw) = BASE64.decode(signature_b64.trim()) else {
        return false;
    };
    let Ok(signature) = Signature::try_from(raw.as_slice()) else {
        return false;
    };
    let verifying_key = VerifyingKey::<Sha256>::new_with_salt_len(key.clone(), max_salt_len(key));
    verifying_key.verify(payload, &signature).is_ok()
}

pub fn verify_with_pem(pem: &str, payload: &[u8], signature_b64: &str) -> bool {
    match load_public_key(pem.as_bytes()) {
        Ok(key) => verify_with_key(&key, payload, signature_b64),
        Err(e) => {
            log::debug!("signature check skipped: {}", e);
            false
        }
    }
}

/// First candidate whose stored public key validates the signature.
///
/// Candidates are tried in the order given; the registry orders them
/// UUID match, then MAC match, then public-key match.
pub fn verify(payload: &[u8], signature_b64: &str, candidates: &[Node]) -> Option<Node> {
    if signature_b64.trim().is_empty() {
        return None;
    }
    candidates
        .iter()
        .find(|node| {
            node.public_key
                .as_deref()
                .map(|pem| verify_with_pem(pem, payload, signature_b64))
                .unwrap_or(false)
        })
        .cloned()
}


#[cfg(test)]
mod tests {
    use super::test_keys::{key, public_pem};
    use super::*;
    use crate::node::{test_node, Relation};

    #[test]
    fn test_sign_then_verify() {
        let payload = br#"{"subject":"hello"}"#;
        let sig = sign_payload(&key(0), payload).unwrap();
        assert!(verify_with_key(&key(0).to_public_key(), payload, &sig));
        assert!(verify_with_pem(&public_pem(0), payload, &sig));
    }

    #[test]
    fn test_mutated_payload_rejected() {
        let sig = sign_payload(&key(0), b"payload").unwrap();
        assert!(!verify_with_key(&key(0).to_public_key(), b"payloae", &sig));
    }

    #[test]
    fn test_salt_len_for_1024_bit_key() {
        assert_eq!(max_salt_len(&key(0).to_public_key()), 128 - 32 - 2);
    }

    #[test]
    fn test_verify_picks_matching_candidate() {
        let mut a = test_node(1, "a", "aa:bb:cc:dd:ee:01", Relation::Peer);
        a.public_key = Some(public_pem(0));
        let mut b = test_node(2, "b", "aa:bb:cc:dd:ee:02", Relation::Peer);
        b.public_key = Some(public_pem(1));
        let keyless = test_node(3, "c", "aa:bb:cc:dd:ee:03", Relation::Peer);

        let sig = sign_payload(&key(1), b"body").unwrap();
        let found = verify(b"body", &sig, &[keyless, a.clone(), b.clone()]).unwrap();
        assert_eq!(found.uuid, b.uuid);

        assert!(verify(b"other", &sig, &[a.clone(), b]).is_none());
        assert!(verify(b"body", "%%% not base64", &[a.clone()]).is_none());
        assert!(verify(b"body", "", &[a]).is_none());
    }

    #[test]
    fn test_garbage_key_is_no_match() {
        let mut n = test_node(1, "a", "aa:bb:cc:dd:ee:01", Relation::Peer);
        n.public_key = Some("-----BEGIN PUBLIC KEY-----\nAAAA\n-----END PUBLIC KEY-----\n".into());
        let sig = sign_payload(&key(0), b"body").unwrap();
        assert!(verify(b"body", &sig, &[n]).is_none());
    }
}
