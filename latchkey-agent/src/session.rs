//! Per-connection dispatch.
//!
//! Each accepted connection runs [`serve_connection`] on its own task:
//! bytes are fed through the connection's [`ConnBuffer`], every completed
//! frame goes through [`dispatch`], and the answer frame is written back on
//! the same connection.  A protocol violation (oversized frame) drops the
//! connection without an answer; everything else is answered, if only with
//! the bare failure byte.
//!
//! Handlers run under a single acquisition of the shared state mutex, so
//! the lock-gate check and the handler observe the same state.  The one
//! exception is a sign request against a confirm-constrained key, which
//! releases the mutex while the external prompt is pending and re-checks
//! the world afterwards; during that wait the connection reads nothing
//! more, so later requests queue in the socket rather than being dropped.

use std::sync::MutexGuard;
use std::time::{Duration, Instant};

use ssh_encoding::Decode as _;
use ssh_key::private::KeypairData;
use ssh_key::{HashAlg, PublicKey};
use tokio::io::{AsyncReadExt as _, AsyncWriteExt as _};
use tokio::net::UnixStream;
use tracing::{debug, info, warn};
use zeroize::Zeroizing;

use crate::buffer::ConnBuffer;
use crate::confirm::{ConfirmRequest, Confirmation, Confirmer};
use crate::keystore::{Constraints, StoreError};
use crate::proto::{
    self, SSH2_AGENT_IDENTITIES_ANSWER, SSH2_AGENT_SIGN_RESPONSE, SSH2_AGENTC_ADD_ID_CONSTRAINED,
    SSH2_AGENTC_ADD_IDENTITY, SSH2_AGENTC_REMOVE_ALL_IDENTITIES, SSH2_AGENTC_REMOVE_IDENTITY,
    SSH2_AGENTC_REQUEST_IDENTITIES, SSH2_AGENTC_SIGN_REQUEST, SSH_AGENT_CONSTRAIN_CONFIRM,
    SSH_AGENT_CONSTRAIN_LIFETIME, SSH_AGENT_RSA_IDENTITIES_ANSWER, SSH_AGENT_RSA_RESPONSE,
    SSH_AGENTC_ADD_SMARTCARD_KEY, SSH_AGENTC_ADD_SMARTCARD_KEY_CONSTRAINED, SSH_AGENTC_LOCK,
    SSH_AGENTC_REMOVE_SMARTCARD_KEY, SSH_AGENTC_REQUEST_RSA_IDENTITIES, SSH_AGENTC_RSA_CHALLENGE,
    SSH_AGENTC_UNLOCK, put_string, put_u32,
};
use crate::signer::{self, SignError};
use crate::{AgentState, SharedState};

/// Connections that stay silent this long are closed.
const IDLE_TIMEOUT: Duration = Duration::from_secs(300);

const READ_CHUNK: usize = 8 * 1024;

/// Why a request could not be answered normally.  Every variant maps to the
/// same bare failure frame on the wire; the detail exists only for local
/// logging, so a peer learns nothing about the cause.
#[derive(Debug, thiserror::Error)]
enum HandlerError {
    #[error("malformed request payload")]
    Malformed,
    #[error("agent is locked")]
    Locked,
    #[error("agent state mutex poisoned")]
    StatePoisoned,
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Sign(#[from] SignError),
}

impl From<ssh_encoding::Error> for HandlerError {
    fn from(_: ssh_encoding::Error) -> Self {
        Self::Malformed
    }
}

impl From<ssh_key::Error> for HandlerError {
    fn from(_: ssh_key::Error) -> Self {
        Self::Malformed
    }
}

fn lock_state(state: &SharedState) -> Result<MutexGuard<'_, AgentState>, HandlerError> {
    state.lock().map_err(|_| HandlerError::StatePoisoned)
}

/// Serve one connection until the peer hangs up, goes idle, or violates
/// the protocol.
pub(crate) async fn serve_connection(
    mut stream: UnixStream,
    state: SharedState,
    confirmer: Option<std::sync::Arc<dyn Confirmer>>,
    conn: u64,
) {
    let mut buffer = ConnBuffer::new();
    let mut chunk = [0u8; READ_CHUNK];
    debug!(conn, "connection open");

    loop {
        let read = match tokio::time::timeout(IDLE_TIMEOUT, stream.read(&mut chunk)).await {
            Err(_) => {
                debug!(conn, "idle timeout, closing connection");
                return;
            }
            Ok(Err(e)) => {
                debug!(conn, error = %e, "read failed, closing connection");
                return;
            }
            Ok(Ok(0)) => {
                debug!(conn, "peer closed connection");
                return;
            }
            Ok(Ok(n)) => n,
        };

        buffer.extend(&chunk[..read]);

        loop {
            let payload = match buffer.next_frame() {
                Err(e) => {
                    // Protocol violation: drop the transport, answer nothing.
                    warn!(conn, error = %e, "dropping connection");
                    return;
                }
                Ok(None) => break,
                Ok(Some(payload)) => payload,
            };

            let answer = dispatch(&payload, &state, confirmer.as_deref()).await;
            if let Err(e) = stream.write_all(&answer).await {
                debug!(conn, error = %e, "write failed, closing connection");
                return;
            }
        }
    }
}

/// Decode one frame payload, apply the lock-gate policy, route to the
/// matching handler, and produce the answer frame.
pub async fn dispatch(
    payload: &[u8],
    state: &SharedState,
    confirmer: Option<&dyn Confirmer>,
) -> Vec<u8> {
    let Some((&command, body)) = payload.split_first() else {
        warn!("frame with empty payload");
        return proto::failure_frame();
    };

    // Signing may suspend on the confirmation prompt, so it manages the
    // state mutex itself; everything else completes under one acquisition.
    if command == SSH2_AGENTC_SIGN_REQUEST {
        return match handle_sign(body, state, confirmer).await {
            Ok(answer) => answer,
            Err(e) => {
                debug!(command, error = %e, "sign request denied");
                proto::failure_frame()
            }
        };
    }

    let result: Result<Vec<u8>, HandlerError> = (|| {
        let mut guard = lock_state(state)?;
        let agent = &mut *guard;

        if agent.gate.is_locked() && command != SSH_AGENTC_UNLOCK {
            // A locked agent reveals nothing: listings come back empty and
            // every other command is a bare failure.
            return Ok(match command {
                SSH_AGENTC_REQUEST_RSA_IDENTITIES => legacy_identities_answer(),
                SSH2_AGENTC_REQUEST_IDENTITIES => identities_answer(&[]),
                _ => proto::failure_frame(),
            });
        }

        match command {
            SSH_AGENTC_LOCK => handle_lock(body, agent),
            SSH_AGENTC_UNLOCK => handle_unlock(body, agent),
            SSH2_AGENTC_REQUEST_IDENTITIES => {
                let entries = agent.store.list(Instant::now());
                debug!(count = entries.len(), "identities listed");
                Ok(identities_answer(&entries))
            }
            // No protocol-1 identities are ever stored, so the legacy
            // listing is always empty.
            SSH_AGENTC_REQUEST_RSA_IDENTITIES => Ok(legacy_identities_answer()),
            SSH2_AGENTC_ADD_IDENTITY => handle_add(body, agent, false),
            SSH2_AGENTC_ADD_ID_CONSTRAINED => handle_add(body, agent, true),
            SSH2_AGENTC_REMOVE_IDENTITY => handle_remove(body, agent),
            SSH2_AGENTC_REMOVE_ALL_IDENTITIES => {
                agent.store.remove_all();
                Ok(proto::success_frame())
            }
            SSH_AGENTC_RSA_CHALLENGE => handle_challenge(body, agent),
            SSH_AGENTC_ADD_SMARTCARD_KEY
            | SSH_AGENTC_REMOVE_SMARTCARD_KEY
            | SSH_AGENTC_ADD_SMARTCARD_KEY_CONSTRAINED => {
                warn!(command, "hardware token keys are not supported");
                Ok(proto::failure_frame())
            }
            _ => {
                warn!(command, "unknown agent command");
                Ok(proto::failure_frame())
            }
        }
    })();

    match result {
        Ok(answer) => answer,
        Err(e) => {
            debug!(command, error = %e, "request denied");
            proto::failure_frame()
        }
    }
}

// ---------------------------------------------------------------------------
// Handlers
// ---------------------------------------------------------------------------

fn handle_lock(body: &[u8], agent: &mut AgentState) -> Result<Vec<u8>, HandlerError> {
    let mut reader = body;
    let passphrase = Zeroizing::new(Vec::<u8>::decode(&mut reader)?);
    if agent.gate.lock(&passphrase) {
        info!("agent locked");
        Ok(proto::success_frame())
    } else {
        Ok(proto::failure_frame())
    }
}

fn handle_unlock(body: &[u8], agent: &mut AgentState) -> Result<Vec<u8>, HandlerError> {
    let mut reader = body;
    let passphrase = Zeroizing::new(Vec::<u8>::decode(&mut reader)?);
    if agent.gate.unlock(&passphrase) {
        info!("agent unlocked");
        Ok(proto::success_frame())
    } else {
        debug!("unlock failed");
        Ok(proto::failure_frame())
    }
}

fn handle_add(
    body: &[u8],
    agent: &mut AgentState,
    constrained: bool,
) -> Result<Vec<u8>, HandlerError> {
    let mut reader = body;
    let keypair = KeypairData::decode(&mut reader)?;
    let comment = String::decode(&mut reader)?;

    let constraints = if constrained {
        parse_constraints(reader)?
    } else {
        if !reader.is_empty() {
            return Err(HandlerError::Malformed);
        }
        Constraints::default()
    };

    agent
        .store
        .add(keypair, comment, constraints, Instant::now())?;
    Ok(proto::success_frame())
}

fn handle_remove(body: &[u8], agent: &mut AgentState) -> Result<Vec<u8>, HandlerError> {
    let mut reader = body;
    let blob = Vec::<u8>::decode(&mut reader)?;
    let public = PublicKey::from_bytes(&blob)?;
    let fingerprint = public.fingerprint(HashAlg::Sha256).to_string();
    agent.store.remove(&fingerprint);
    // Nothing to remove is still success; the requested end state holds.
    Ok(proto::success_frame())
}

fn handle_challenge(body: &[u8], agent: &mut AgentState) -> Result<Vec<u8>, HandlerError> {
    let mut reader = body;
    let _public_exponent = Vec::<u8>::decode(&mut reader)?;
    let modulus = Vec::<u8>::decode(&mut reader)?;
    let challenge = Vec::<u8>::decode(&mut reader)?;

    let identity = agent
        .store
        .find_by_rsa_modulus(&modulus, Instant::now())
        .ok_or(SignError::NoSuchIdentity)?;
    let plaintext = signer::decrypt_challenge(identity, &challenge)?;

    let mut answer = Vec::new();
    put_string(&mut answer, &plaintext);
    Ok(proto::encode(SSH_AGENT_RSA_RESPONSE, &answer))
}

async fn handle_sign(
    body: &[u8],
    state: &SharedState,
    confirmer: Option<&dyn Confirmer>,
) -> Result<Vec<u8>, HandlerError> {
    let mut reader = body;
    let key_blob = Vec::<u8>::decode(&mut reader)?;
    let data = Vec::<u8>::decode(&mut reader)?;
    let flags = u32::decode(&mut reader)?;

    let public = PublicKey::from_bytes(&key_blob)?;
    let fingerprint = public.fingerprint(HashAlg::Sha256).to_string();

    let needs_confirm = {
        let mut guard = lock_state(state)?;
        if guard.gate.is_locked() {
            return Err(HandlerError::Locked);
        }
        let identity = guard
            .store
            .get(&fingerprint, Instant::now())
            .ok_or(SignError::NoSuchIdentity)?;
        identity
            .constraints()
            .confirm
            .then(|| identity.comment().to_string())
    };

    if let Some(comment) = needs_confirm {
        let Some(confirmer) = confirmer else {
            warn!(
                fingerprint = %fingerprint,
                "key requires confirmation but no prompt program is configured"
            );
            return Err(SignError::NotConfirmed.into());
        };
        let request = ConfirmRequest {
            fingerprint: fingerprint.clone(),
            comment,
        };
        if confirmer.confirm(&request).await == Confirmation::Denied {
            return Err(SignError::NotConfirmed.into());
        }
    }

    // Re-check everything after the prompt: the agent may have been locked
    // or the identity removed or expired while the user was deciding.
    let mut guard = lock_state(state)?;
    if guard.gate.is_locked() {
        return Err(HandlerError::Locked);
    }
    let identity = guard
        .store
        .get(&fingerprint, Instant::now())
        .ok_or(SignError::NoSuchIdentity)?;
    let signature_blob = signer::sign(identity, &data, flags)?;

    let mut answer = Vec::new();
    put_string(&mut answer, &signature_blob);
    Ok(proto::encode(SSH2_AGENT_SIGN_RESPONSE, &answer))
}

fn parse_constraints(mut reader: &[u8]) -> Result<Constraints, HandlerError> {
    let mut constraints = Constraints::default();
    while let Some((&kind, rest)) = reader.split_first() {
        reader = rest;
        match kind {
            SSH_AGENT_CONSTRAIN_LIFETIME => {
                let seconds = u32::decode(&mut reader)?;
                constraints.lifetime = Some(Duration::from_secs(seconds.into()));
            }
            SSH_AGENT_CONSTRAIN_CONFIRM => constraints.confirm = true,
            // An unknown constraint must refuse the whole add; silently
            // storing the key without the restriction would weaken it.
            _ => return Err(HandlerError::Malformed),
        }
    }
    Ok(constraints)
}

// ---------------------------------------------------------------------------
// Answer framing
// ---------------------------------------------------------------------------

fn identities_answer(entries: &[(Vec<u8>, String)]) -> Vec<u8> {
    let mut body = Vec::new();
    put_u32(&mut body, entries.len() as u32);
    for (blob, comment) in entries {
        put_string(&mut body, blob);
        put_string(&mut body, comment.as_bytes());
    }
    proto::encode(SSH2_AGENT_IDENTITIES_ANSWER, &body)
}

fn legacy_identities_answer() -> Vec<u8> {
    let mut body = Vec::new();
    put_u32(&mut body, 0);
    proto::encode(SSH_AGENT_RSA_IDENTITIES_ANSWER, &body)
}
