//! SSH authentication agent core.
//!
//! Holds decrypted private keys in memory and brokers signing requests over
//! a local Unix socket speaking the standard OpenSSH agent protocol.  Keys
//! never leave the agent process; clients only ever see public key blobs
//! and signatures.
//!
//! # Architecture
//!
//! ```text
//! latchkeyd ── Agent::listen ── UnixListener
//!                                    │ accept
//!                            per-connection task
//!                                    │
//!                    ConnBuffer (frame reassembly)
//!                                    │ complete frames
//!                    dispatch ── AgentState (Mutex)
//!                        │          ├── IdentityStore
//!                        │          └── LockGate
//!                        └── Confirmer (external prompt, async)
//! ```
//!
//! Each connection is served by its own task over a shared [`AgentState`].
//! Handlers run under a single coarse mutex acquisition; the only suspension
//! point is awaiting the confirmation collaborator for keys added with the
//! confirm constraint, and the mutex is released across that await.

pub mod agent;
pub mod buffer;
pub mod confirm;
pub mod keystore;
pub mod lock;
pub mod proto;
pub mod session;
pub mod signer;

use std::sync::{Arc, Mutex};

pub use agent::Agent;
pub use confirm::{AskpassConfirmer, Confirmer};
pub use keystore::{Constraints, Identity, IdentityStore};
pub use lock::LockGate;

/// Process-wide agent state: the identity table and the lock gate.
///
/// Initialised empty and unlocked.  Shared across connection tasks behind a
/// single coarse mutex; signing and identity operations are rare relative to
/// raw socket I/O, so finer-grained locking buys nothing.
#[derive(Debug, Default)]
pub struct AgentState {
    pub store: IdentityStore,
    pub gate: LockGate,
}

/// Handle to the shared [`AgentState`].
pub type SharedState = Arc<Mutex<AgentState>>;

impl AgentState {
    /// Create an empty, unlocked agent state behind a shared handle.
    pub fn shared() -> SharedState {
        Arc::new(Mutex::new(Self::default()))
    }
}
