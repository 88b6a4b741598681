//! Session identity: connection identity → negotiate token.
//!
//! token = base64(SHA-256(identity bytes of the connection)). The token
//! travels back to the client as the `authorization` field, so it must be
//! printable and must not reveal anything about the connection itself.

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use sha2::{Digest, Sha256};

/// Something with a runtime identity that stays fixed while it is open.
///
/// Two live streams must never report the same identity bytes.
pub trait StreamIdentity {
    fn identity_bytes(&self) -> Vec<u8>;
}

/// Derive the negotiate token for a stream.
pub fn session_token<S: StreamIdentity + ?Sized>(stream: &S) -> String {
    let digest = Sha256::digest(stream.identity_bytes());
    STANDARD.encode(digest)
}
