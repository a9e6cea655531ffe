//! Agent protocol wire format.
//!
//! Every message is a frame: a 4-byte big-endian length followed by that
//! many payload bytes, where the first payload byte is the command code.
//! Strings and buffers embedded in a payload use the same convention, a
//! `u32` big-endian length followed by the bytes.
//!
//! [`decode`] is pure and never partially consumes a frame: either a whole
//! frame is returned together with the number of bytes it occupied, or the
//! input is reported incomplete and left untouched by the caller.

/// Commands for the protocol-1 dialect, kept for compatibility.
pub const SSH_AGENTC_REQUEST_RSA_IDENTITIES: u8 = 1;
pub const SSH_AGENT_RSA_IDENTITIES_ANSWER: u8 = 2;
pub const SSH_AGENTC_RSA_CHALLENGE: u8 = 3;
pub const SSH_AGENT_RSA_RESPONSE: u8 = 4;

pub const SSH_AGENT_FAILURE: u8 = 5;
pub const SSH_AGENT_SUCCESS: u8 = 6;

/// Protocol-2 commands.
pub const SSH2_AGENTC_REQUEST_IDENTITIES: u8 = 11;
pub const SSH2_AGENT_IDENTITIES_ANSWER: u8 = 12;
pub const SSH2_AGENTC_SIGN_REQUEST: u8 = 13;
pub const SSH2_AGENT_SIGN_RESPONSE: u8 = 14;
pub const SSH2_AGENTC_ADD_IDENTITY: u8 = 17;
pub const SSH2_AGENTC_REMOVE_IDENTITY: u8 = 18;
pub const SSH2_AGENTC_REMOVE_ALL_IDENTITIES: u8 = 19;

/// Hardware token keys.
pub const SSH_AGENTC_ADD_SMARTCARD_KEY: u8 = 20;
pub const SSH_AGENTC_REMOVE_SMARTCARD_KEY: u8 = 21;
pub const SSH_AGENTC_ADD_SMARTCARD_KEY_CONSTRAINED: u8 = 26;

/// Lock / unlock the whole agent.
pub const SSH_AGENTC_LOCK: u8 = 22;
pub const SSH_AGENTC_UNLOCK: u8 = 23;

/// Add a key with use constraints attached.
pub const SSH2_AGENTC_ADD_ID_CONSTRAINED: u8 = 25;

/// Constraint type bytes carried by the constrained add commands.
pub const SSH_AGENT_CONSTRAIN_LIFETIME: u8 = 1;
pub const SSH_AGENT_CONSTRAIN_CONFIRM: u8 = 2;

/// Sign-request flag bits.
pub const SSH_AGENT_RSA_SHA2_256: u32 = 2;
pub const SSH_AGENT_RSA_SHA2_512: u32 = 4;

/// Frames above this size are rejected and the connection is dropped.
/// Protects against unbounded buffering from a broken or malicious peer.
pub const MAX_FRAME_LEN: usize = 256 * 1024;

/// Size of the big-endian length prefix.
pub const HEADER_LEN: usize = 4;

#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
    #[error("declared frame length {len} exceeds the {MAX_FRAME_LEN}-byte ceiling")]
    FrameTooLarge { len: usize },
}

/// Outcome of [`decode`] on a byte buffer.
#[derive(Debug, PartialEq, Eq)]
pub enum Decoded {
    /// A complete frame.  `consumed` covers the length prefix and payload;
    /// the caller removes exactly that many bytes from its buffer.
    Frame { payload: Vec<u8>, consumed: usize },
    /// Not enough bytes for a whole frame yet.
    Incomplete,
}

/// Encode a command and body as a single wire frame.
pub fn encode(command: u8, body: &[u8]) -> Vec<u8> {
    let len = 1 + body.len();
    let mut frame = Vec::with_capacity(HEADER_LEN + len);
    frame.extend_from_slice(&(len as u32).to_be_bytes());
    frame.push(command);
    frame.extend_from_slice(body);
    frame
}

/// Try to decode one frame from the front of `buf`.
///
/// The length ceiling is checked as soon as the prefix is readable, before
/// waiting for the declared payload, so an oversized frame is rejected even
/// if its body is never sent.
pub fn decode(buf: &[u8]) -> Result<Decoded, ProtocolError> {
    if buf.len() < HEADER_LEN {
        return Ok(Decoded::Incomplete);
    }
    let declared = u32::from_be_bytes([buf[0], buf[1], buf[2], buf[3]]) as usize;
    if declared > MAX_FRAME_LEN {
        return Err(ProtocolError::FrameTooLarge { len: declared });
    }
    if buf.len() < HEADER_LEN + declared {
        return Ok(Decoded::Incomplete);
    }
    Ok(Decoded::Frame {
        payload: buf[HEADER_LEN..HEADER_LEN + declared].to_vec(),
        consumed: HEADER_LEN + declared,
    })
}

/// The bare single-byte failure answer.
pub fn failure_frame() -> Vec<u8> {
    encode(SSH_AGENT_FAILURE, &[])
}

/// The bare single-byte success answer.
pub fn success_frame() -> Vec<u8> {
    encode(SSH_AGENT_SUCCESS, &[])
}

/// Append a `u32` in wire byte order.
pub(crate) fn put_u32(out: &mut Vec<u8>, value: u32) {
    out.extend_from_slice(&value.to_be_bytes());
}

/// Append a length-prefixed string / buffer.
pub(crate) fn put_string(out: &mut Vec<u8>, bytes: &[u8]) {
    put_u32(out, bytes.len() as u32);
    out.extend_from_slice(bytes);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encode_produces_prefixed_frame() {
        let frame = encode(SSH_AGENTC_LOCK, b"abc");
        assert_eq!(frame, [0, 0, 0, 4, SSH_AGENTC_LOCK, b'a', b'b', b'c']);
    }

    #[test]
    fn decode_roundtrip() {
        let frame = encode(SSH2_AGENTC_REQUEST_IDENTITIES, &[]);
        match decode(&frame).unwrap() {
            Decoded::Frame { payload, consumed } => {
                assert_eq!(payload, [SSH2_AGENTC_REQUEST_IDENTITIES]);
                assert_eq!(consumed, frame.len());
            }
            other => panic!("expected frame, got {other:?}"),
        }
    }

    #[test]
    fn decode_incomplete_header() {
        assert_eq!(decode(&[0, 0, 0]).unwrap(), Decoded::Incomplete);
    }

    #[test]
    fn decode_incomplete_payload() {
        let mut frame = encode(SSH_AGENTC_LOCK, b"secret");
        frame.truncate(frame.len() - 1);
        assert_eq!(decode(&frame).unwrap(), Decoded::Incomplete);
    }

    #[test]
    fn decode_never_consumes_partial_frames() {
        // A complete frame followed by half of another: the first decode
        // consumes exactly the first frame, the second reports incomplete.
        let mut bytes = encode(SSH_AGENT_SUCCESS, &[]);
        let first_len = bytes.len();
        bytes.extend_from_slice(&[0, 0, 0, 9, SSH_AGENTC_LOCK]);

        let Decoded::Frame { consumed, .. } = decode(&bytes).unwrap() else {
            panic!("first frame should decode");
        };
        assert_eq!(consumed, first_len);
        assert_eq!(decode(&bytes[consumed..]).unwrap(), Decoded::Incomplete);
    }

    #[test]
    fn oversized_declaration_rejected_before_payload_arrives() {
        // Only the prefix is present; the declared length alone must trip
        // the ceiling.
        let header = ((MAX_FRAME_LEN + 1) as u32).to_be_bytes();
        assert!(matches!(
            decode(&header),
            Err(ProtocolError::FrameTooLarge { .. })
        ));
    }

    #[test]
    fn frame_at_ceiling_is_accepted() {
        let body = vec![0u8; MAX_FRAME_LEN - 1];
        let frame = encode(SSH2_AGENTC_ADD_IDENTITY, &body);
        assert!(matches!(decode(&frame), Ok(Decoded::Frame { .. })));
    }

    #[test]
    fn put_string_prefixes_length() {
        let mut out = Vec::new();
        put_string(&mut out, b"hi");
        assert_eq!(out, [0, 0, 0, 2, b'h', b'i']);
    }
}
