//! Agent-wide lock gate.
//!
//! While locked, the dispatcher answers listing requests with an empty list
//! and everything else with a bare failure; only a correct unlock restores
//! normal operation.  The lock passphrase itself is never retained: locking
//! stores a random salt and an HMAC-SHA256 tag over the passphrase, and
//! unlock candidates are checked with the `hmac` crate's constant-time
//! verification so the comparison leaks no timing information.

use hmac::{Hmac, Mac as _};
use rand::RngCore as _;
use sha2::Sha256;
use zeroize::Zeroize as _;

type HmacSha256 = Hmac<Sha256>;

const SALT_LEN: usize = 32;
const TAG_LEN: usize = 32;

/// Salted passphrase digest remembered while the gate is locked.
struct SecretHash {
    salt: [u8; SALT_LEN],
    tag: [u8; TAG_LEN],
}

impl SecretHash {
    fn derive(secret: &[u8]) -> Self {
        let mut salt = [0u8; SALT_LEN];
        rand::rngs::OsRng.fill_bytes(&mut salt);
        let tag = compute_tag(&salt, secret);
        Self { salt, tag }
    }

    fn matches(&self, candidate: &[u8]) -> bool {
        let mut mac = HmacSha256::new_from_slice(&self.salt)
            .expect("HMAC key should be valid for any length");
        mac.update(candidate);
        mac.verify_slice(&self.tag).is_ok()
    }
}

fn compute_tag(salt: &[u8], secret: &[u8]) -> [u8; TAG_LEN] {
    let mut mac =
        HmacSha256::new_from_slice(salt).expect("HMAC key should be valid for any length");
    mac.update(secret);
    let mut tag = [0u8; TAG_LEN];
    tag.copy_from_slice(&mac.finalize().into_bytes());
    tag
}

impl Drop for SecretHash {
    fn drop(&mut self) {
        self.salt.zeroize();
        self.tag.zeroize();
    }
}

impl std::fmt::Debug for SecretHash {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("SecretHash([redacted])")
    }
}

/// Two-state guard: unlocked, or locked with a remembered passphrase hash.
#[derive(Debug, Default)]
pub struct LockGate {
    locked: Option<SecretHash>,
}

impl LockGate {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_locked(&self) -> bool {
        self.locked.is_some()
    }

    /// Lock the agent with `secret`.  Fails without a state change if the
    /// gate is already locked; at most one secret is ever remembered.
    pub fn lock(&mut self, secret: &[u8]) -> bool {
        if self.locked.is_some() {
            return false;
        }
        self.locked = Some(SecretHash::derive(secret));
        true
    }

    /// Unlock with a candidate passphrase.  Fails without a state change
    /// when the gate is not locked or the candidate does not match.
    pub fn unlock(&mut self, candidate: &[u8]) -> bool {
        match &self.locked {
            None => false,
            Some(hash) => {
                if hash.matches(candidate) {
                    self.locked = None;
                    true
                } else {
                    false
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unlock_before_any_lock_fails() {
        let mut gate = LockGate::new();
        assert!(!gate.unlock(b"anything"));
        assert!(!gate.is_locked());
    }

    #[test]
    fn second_lock_fails_and_first_secret_survives() {
        let mut gate = LockGate::new();
        assert!(gate.lock(b"first"));
        assert!(!gate.lock(b"second"));
        assert!(gate.is_locked());
        assert!(!gate.unlock(b"second"));
        assert!(gate.unlock(b"first"));
        assert!(!gate.is_locked());
    }

    #[test]
    fn wrong_candidate_leaves_gate_locked() {
        let mut gate = LockGate::new();
        assert!(gate.lock(b"correct horse"));
        assert!(!gate.unlock(b"battery staple"));
        assert!(gate.is_locked());
        assert!(gate.unlock(b"correct horse"));
    }

    #[test]
    fn relock_after_unlock_works() {
        let mut gate = LockGate::new();
        assert!(gate.lock(b"one"));
        assert!(gate.unlock(b"one"));
        assert!(gate.lock(b"two"));
        assert!(!gate.unlock(b"one"));
        assert!(gate.unlock(b"two"));
    }

    #[test]
    fn empty_passphrase_is_a_valid_secret() {
        let mut gate = LockGate::new();
        assert!(gate.lock(b""));
        assert!(!gate.unlock(b"x"));
        assert!(gate.unlock(b""));
    }

    #[test]
    fn debug_output_redacts_the_hash() {
        let mut gate = LockGate::new();
        gate.lock(b"hunter2");
        let debug = format!("{gate:?}");
        assert!(debug.contains("redacted"));
        assert!(!debug.contains("hunter2"));
    }
}
