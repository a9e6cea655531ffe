//! In-memory identity store.
//!
//! The [`IdentityStore`] holds every key the agent has been handed over the
//! wire, keyed by the SHA-256 fingerprint of the public key.  Entries carry
//! the use constraints attached at add time: an optional lifetime, after
//! which the identity behaves as if it had never been added, and a confirm
//! flag that forces an interactive approval before each signature.
//!
//! Expiry is lazy.  Every accessor takes the caller's notion of "now" and
//! drops entries whose lifetime has passed before answering, so no timer
//! subsystem is needed and tests can fabricate clocks freely.
//!
//! Private key material lives only inside the stored [`ssh_key::PrivateKey`]
//! (zeroized on drop) and is never returned to callers of [`list`].

use std::collections::HashMap;
use std::time::{Duration, Instant};

use ssh_key::private::KeypairData;
use ssh_key::{HashAlg, PrivateKey};
use tracing::debug;

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("invalid key material")]
    InvalidKey,
}

/// Use restrictions attached to an identity when it is added.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Constraints {
    /// Drop the identity this long after it was added.
    pub lifetime: Option<Duration>,
    /// Require interactive confirmation before every signature.
    pub confirm: bool,
}

/// A single loaded identity.
pub struct Identity {
    fingerprint: String,
    private_key: PrivateKey,
    /// Wire-format public key blob, precomputed for listing.
    public_blob: Vec<u8>,
    constraints: Constraints,
    added_at: Instant,
}

impl Identity {
    pub fn fingerprint(&self) -> &str {
        &self.fingerprint
    }

    pub fn comment(&self) -> &str {
        self.private_key.comment()
    }

    pub fn public_blob(&self) -> &[u8] {
        &self.public_blob
    }

    pub fn constraints(&self) -> Constraints {
        self.constraints
    }

    pub(crate) fn private_key(&self) -> &PrivateKey {
        &self.private_key
    }

    /// The RSA modulus of this key, without the sign byte, if it is an RSA
    /// identity.  Used to match protocol-1 challenge requests, which address
    /// keys by their public components rather than a key blob.
    pub fn rsa_modulus(&self) -> Option<&[u8]> {
        match self.private_key.key_data() {
            KeypairData::Rsa(pair) => pair.public.n.as_positive_bytes(),
            _ => None,
        }
    }

    fn expired(&self, now: Instant) -> bool {
        match self.constraints.lifetime {
            Some(lifetime) => now.duration_since(self.added_at) >= lifetime,
            None => false,
        }
    }
}

impl std::fmt::Debug for Identity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Identity")
            .field("fingerprint", &self.fingerprint)
            .field("comment", &self.comment())
            .field("constraints", &self.constraints)
            .finish_non_exhaustive()
    }
}

/// Fingerprint-keyed table of loaded identities.
#[derive(Debug, Default)]
pub struct IdentityStore {
    entries: HashMap<String, Identity>,
}

impl IdentityStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add an identity from decoded keypair material.
    ///
    /// The fingerprint is derived from the public half; adding a key that is
    /// already present replaces the previous entry and its constraints
    /// (last writer wins).  Returns the fingerprint of the stored identity.
    pub fn add(
        &mut self,
        keypair: KeypairData,
        comment: String,
        constraints: Constraints,
        now: Instant,
    ) -> Result<String, StoreError> {
        let private_key = PrivateKey::new(keypair, comment).map_err(|_| StoreError::InvalidKey)?;
        let public_key = private_key.public_key();
        let public_blob = public_key.to_bytes().map_err(|_| StoreError::InvalidKey)?;
        let fingerprint = public_key.fingerprint(HashAlg::Sha256).to_string();

        debug!(
            fingerprint = %fingerprint,
            confirm = constraints.confirm,
            lifetime_secs = constraints.lifetime.map(|d| d.as_secs()),
            "identity added"
        );

        self.entries.insert(
            fingerprint.clone(),
            Identity {
                fingerprint: fingerprint.clone(),
                private_key,
                public_blob,
                constraints,
                added_at: now,
            },
        );
        Ok(fingerprint)
    }

    /// Remove an identity by fingerprint.  Removing something that is not
    /// present is not an error; there is simply nothing left to remove.
    pub fn remove(&mut self, fingerprint: &str) {
        if self.entries.remove(fingerprint).is_some() {
            debug!(fingerprint = %fingerprint, "identity removed");
        }
    }

    /// Drop every identity.
    pub fn remove_all(&mut self) {
        let count = self.entries.len();
        self.entries.clear();
        debug!(count, "all identities removed");
    }

    /// Look up a live identity by fingerprint.  An expired entry is purged
    /// on the spot and reported as absent, indistinguishable from a key
    /// that was never added.
    pub fn get(&mut self, fingerprint: &str, now: Instant) -> Option<&Identity> {
        if self
            .entries
            .get(fingerprint)
            .is_some_and(|entry| entry.expired(now))
        {
            debug!(fingerprint = %fingerprint, "identity lifetime expired");
            self.entries.remove(fingerprint);
        }
        self.entries.get(fingerprint)
    }

    /// Find the live RSA identity whose public modulus equals `modulus`.
    pub fn find_by_rsa_modulus(&mut self, modulus: &[u8], now: Instant) -> Option<&Identity> {
        self.purge_expired(now);
        let wanted = strip_leading_zeros(modulus);
        self.entries
            .values()
            .find(|entry| entry.rsa_modulus().is_some_and(|n| n == wanted))
    }

    /// Public key blob and comment for every live identity.  Private key
    /// material is deliberately absent from the return type.
    pub fn list(&mut self, now: Instant) -> Vec<(Vec<u8>, String)> {
        self.purge_expired(now);
        self.entries
            .values()
            .map(|entry| (entry.public_blob.clone(), entry.comment().to_string()))
            .collect()
    }

    /// Number of live identities.
    pub fn len(&mut self, now: Instant) -> usize {
        self.purge_expired(now);
        self.entries.len()
    }

    pub fn is_empty(&mut self, now: Instant) -> bool {
        self.len(now) == 0
    }

    fn purge_expired(&mut self, now: Instant) {
        self.entries.retain(|fingerprint, entry| {
            let keep = !entry.expired(now);
            if !keep {
                debug!(fingerprint = %fingerprint, "identity lifetime expired");
            }
            keep
        });
    }
}

fn strip_leading_zeros(bytes: &[u8]) -> &[u8] {
    let first = bytes.iter().position(|&b| b != 0).unwrap_or(bytes.len());
    &bytes[first..]
}

#[cfg(test)]
mod tests {
    use super::*;
    use ssh_key::Algorithm;

    fn test_keypair() -> KeypairData {
        let key = PrivateKey::random(&mut rand::rngs::OsRng, Algorithm::Ed25519)
            .expect("generate test key");
        key.key_data().clone()
    }

    fn now() -> Instant {
        Instant::now()
    }

    #[test]
    fn add_then_list_shows_comment_and_public_blob_only() {
        let mut store = IdentityStore::new();
        let t = now();
        store
            .add(test_keypair(), "laptop".into(), Constraints::default(), t)
            .unwrap();

        let listed = store.list(t);
        assert_eq!(listed.len(), 1);
        let (blob, comment) = &listed[0];
        assert_eq!(comment, "laptop");
        // The blob parses as a bare public key.
        assert!(ssh_key::PublicKey::from_bytes(blob).is_ok());
    }

    #[test]
    fn remove_is_idempotent() {
        let mut store = IdentityStore::new();
        let t = now();
        let fingerprint = store
            .add(test_keypair(), "k".into(), Constraints::default(), t)
            .unwrap();

        store.remove(&fingerprint);
        assert!(store.list(t).is_empty());
        // Removing again is a no-op, not an error.
        store.remove(&fingerprint);
    }

    #[test]
    fn readding_same_key_replaces_entry() {
        let mut store = IdentityStore::new();
        let t = now();
        let keypair = test_keypair();
        let f1 = store
            .add(keypair.clone(), "old".into(), Constraints::default(), t)
            .unwrap();
        let f2 = store
            .add(
                keypair,
                "new".into(),
                Constraints {
                    confirm: true,
                    ..Constraints::default()
                },
                t,
            )
            .unwrap();

        assert_eq!(f1, f2);
        assert_eq!(store.len(t), 1);
        let entry = store.get(&f1, t).unwrap();
        assert_eq!(entry.comment(), "new");
        assert!(entry.constraints().confirm);
    }

    #[test]
    fn expired_identity_is_invisible_and_purged() {
        let mut store = IdentityStore::new();
        let t = now();
        let fingerprint = store
            .add(
                test_keypair(),
                "short-lived".into(),
                Constraints {
                    lifetime: Some(Duration::from_secs(600)),
                    confirm: false,
                },
                t,
            )
            .unwrap();

        // Still visible one second before expiry.
        assert!(store.get(&fingerprint, t + Duration::from_secs(599)).is_some());
        // Gone at and after the deadline, same as a key never added.
        assert!(store.get(&fingerprint, t + Duration::from_secs(600)).is_none());
        assert!(store.list(t + Duration::from_secs(600)).is_empty());
    }

    #[test]
    fn expiry_does_not_touch_other_identities() {
        let mut store = IdentityStore::new();
        let t = now();
        store
            .add(
                test_keypair(),
                "ephemeral".into(),
                Constraints {
                    lifetime: Some(Duration::from_secs(1)),
                    confirm: false,
                },
                t,
            )
            .unwrap();
        let keeper = store
            .add(test_keypair(), "keeper".into(), Constraints::default(), t)
            .unwrap();

        let later = t + Duration::from_secs(5);
        assert_eq!(store.list(later).len(), 1);
        assert!(store.get(&keeper, later).is_some());
    }

    #[test]
    fn debug_never_shows_key_material() {
        let mut store = IdentityStore::new();
        let t = now();
        let fingerprint = store
            .add(test_keypair(), "k".into(), Constraints::default(), t)
            .unwrap();
        let debug = format!("{:?}", store.get(&fingerprint, t).unwrap());
        assert!(debug.contains("fingerprint"));
        assert!(!debug.to_lowercase().contains("private"));
    }
}
