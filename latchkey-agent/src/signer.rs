//! Signature generation against stored identities.
//!
//! Signing goes through [`signature::Signer`] on the stored private key,
//! which picks the natural algorithm for the key type (Ed25519, ECDSA, or
//! rsa-sha2-512 for RSA).  The one deviation is the rsa-sha2-256 flag on a
//! sign request, which is honoured by signing through the `rsa` crate
//! directly.  SHA-1 `ssh-rsa` signatures are never produced.
//!
//! The protocol-1 challenge operation is also here: it decrypts a challenge
//! with a stored RSA key and hands back the plaintext, a distinct answer
//! from a signature.  Private key bytes never appear in any return value.

use rsa::Pkcs1v15Encrypt;
use rsa::pkcs1v15::SigningKey;
use sha2::Sha256;
use signature::{SignatureEncoding as _, Signer as _};
use ssh_encoding::Encode as _;
use ssh_key::private::{KeypairData, RsaKeypair};
use ssh_key::{Algorithm, HashAlg, Signature};
use tracing::debug;

use crate::keystore::Identity;
use crate::proto::SSH_AGENT_RSA_SHA2_256;

#[derive(Debug, thiserror::Error)]
pub enum SignError {
    #[error("no such identity")]
    NoSuchIdentity,
    #[error("signing was not confirmed")]
    NotConfirmed,
    #[error("signature generation failed: {0}")]
    Signature(#[from] signature::Error),
    #[error("key material unusable for this operation: {0}")]
    Key(#[from] ssh_key::Error),
    #[error("signature encoding failed: {0}")]
    Encoding(#[from] ssh_encoding::Error),
    #[error("challenge decryption failed")]
    Decrypt,
}

/// Sign `data` with the identity's private key, honouring the sign-request
/// flags, and return the encoded signature blob (algorithm name plus raw
/// signature, ready to embed in the answer frame).
pub fn sign(identity: &Identity, data: &[u8], flags: u32) -> Result<Vec<u8>, SignError> {
    let signature = match identity.private_key().key_data() {
        KeypairData::Rsa(pair) if flags & SSH_AGENT_RSA_SHA2_256 != 0 => {
            sign_rsa_sha256(pair, data)?
        }
        _ => identity.private_key().try_sign(data)?,
    };

    debug!(
        fingerprint = %identity.fingerprint(),
        algorithm = %signature.algorithm(),
        data_len = data.len(),
        "sign"
    );

    let mut blob = Vec::new();
    signature.encode(&mut blob)?;
    Ok(blob)
}

/// rsa-sha2-256 signature, requested via the sign-request flag bits.
///
/// `ssh-key` signs RSA with SHA-512; the 256 variant goes through the `rsa`
/// crate's PKCS#1 v1.5 signing and is re-wrapped as an SSH signature.
fn sign_rsa_sha256(pair: &RsaKeypair, data: &[u8]) -> Result<Signature, SignError> {
    let private = rsa::RsaPrivateKey::try_from(pair)?;
    let signing_key = SigningKey::<Sha256>::new(private);
    let raw = signing_key.try_sign(data)?;
    let signature = Signature::new(
        Algorithm::Rsa {
            hash: Some(HashAlg::Sha256),
        },
        raw.to_vec(),
    )?;
    Ok(signature)
}

/// Protocol-1 challenge: decrypt `challenge` with the identity's RSA key
/// and return the plaintext.  Non-RSA identities cannot answer and are
/// treated as absent.
pub fn decrypt_challenge(identity: &Identity, challenge: &[u8]) -> Result<Vec<u8>, SignError> {
    let KeypairData::Rsa(pair) = identity.private_key().key_data() else {
        return Err(SignError::NoSuchIdentity);
    };
    let private = rsa::RsaPrivateKey::try_from(pair)?;
    let plaintext = private
        .decrypt(Pkcs1v15Encrypt, challenge)
        .map_err(|_| SignError::Decrypt)?;

    debug!(
        fingerprint = %identity.fingerprint(),
        challenge_len = challenge.len(),
        "challenge decrypted"
    );

    Ok(plaintext)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::keystore::{Constraints, IdentityStore};
    use crate::proto::SSH_AGENT_RSA_SHA2_512;
    use signature::Verifier;
    use ssh_encoding::Decode as _;
    use std::time::Instant;

    fn decode_signature(blob: &[u8]) -> Signature {
        let mut reader = blob;
        Signature::decode(&mut reader).expect("decode signature blob")
    }

    fn stored_ed25519(store: &mut IdentityStore, now: Instant) -> String {
        let key = ssh_key::PrivateKey::random(&mut rand::rngs::OsRng, Algorithm::Ed25519)
            .expect("generate test key");
        store
            .add(key.key_data().clone(), "ed".into(), Constraints::default(), now)
            .unwrap()
    }

    fn stored_rsa(store: &mut IdentityStore, now: Instant) -> String {
        let pair = RsaKeypair::random(&mut rand::rngs::OsRng, 2048).expect("generate rsa key");
        store
            .add(KeypairData::Rsa(pair), "rsa".into(), Constraints::default(), now)
            .unwrap()
    }

    #[test]
    fn ed25519_signature_verifies_against_public_key() {
        let mut store = IdentityStore::new();
        let now = Instant::now();
        let fingerprint = stored_ed25519(&mut store, now);
        let identity = store.get(&fingerprint, now).unwrap();

        let blob = sign(identity, b"challenge bytes", 0).unwrap();
        let signature = decode_signature(&blob);
        let public = ssh_key::PublicKey::from_bytes(identity.public_blob()).unwrap();
        Verifier::verify(&public, b"challenge bytes", &signature).unwrap();
    }

    #[test]
    fn rsa_flags_select_the_digest() {
        let mut store = IdentityStore::new();
        let now = Instant::now();
        let fingerprint = stored_rsa(&mut store, now);
        let identity = store.get(&fingerprint, now).unwrap();

        let sha256 = sign(identity, b"data", SSH_AGENT_RSA_SHA2_256).unwrap();
        let sha512 = sign(identity, b"data", SSH_AGENT_RSA_SHA2_512).unwrap();

        let sig256 = decode_signature(&sha256);
        let sig512 = decode_signature(&sha512);
        assert_eq!(
            sig256.algorithm(),
            Algorithm::Rsa {
                hash: Some(HashAlg::Sha256)
            }
        );
        assert_eq!(
            sig512.algorithm(),
            Algorithm::Rsa {
                hash: Some(HashAlg::Sha512)
            }
        );

        let public = ssh_key::PublicKey::from_bytes(identity.public_blob()).unwrap();
        Verifier::verify(&public, b"data", &sig256).unwrap();
        Verifier::verify(&public, b"data", &sig512).unwrap();
    }

    #[test]
    fn challenge_roundtrip_against_rsa_identity() {
        let mut store = IdentityStore::new();
        let now = Instant::now();
        let fingerprint = stored_rsa(&mut store, now);
        let identity = store.get(&fingerprint, now).unwrap();

        // Encrypt to the public half the way a protocol-1 client would.
        let public = rsa::RsaPublicKey::try_from(
            match identity.private_key().key_data() {
                KeypairData::Rsa(pair) => &pair.public,
                _ => unreachable!(),
            },
        )
        .unwrap();
        let ciphertext = public
            .encrypt(&mut rand::rngs::OsRng, Pkcs1v15Encrypt, b"nonce-1234567890")
            .unwrap();

        let plaintext = decrypt_challenge(identity, &ciphertext).unwrap();
        assert_eq!(plaintext, b"nonce-1234567890");
    }

    #[test]
    fn challenge_against_non_rsa_identity_is_absent() {
        let mut store = IdentityStore::new();
        let now = Instant::now();
        let fingerprint = stored_ed25519(&mut store, now);
        let identity = store.get(&fingerprint, now).unwrap();

        assert!(matches!(
            decrypt_challenge(identity, b"whatever"),
            Err(SignError::NoSuchIdentity)
        ));
    }
}
