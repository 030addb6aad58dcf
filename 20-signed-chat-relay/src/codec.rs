//! Canonical encoding, stream/datagram framing and message authentication.
//!
//! The MAC input is the envelope without its `tag`, rendered as compact JSON
//! with object keys in sorted order, so both ends derive identical bytes
//! regardless of how a peer ordered fields on the wire.

use hmac::{Hmac, Mac};
use sha2::Sha256;

use crate::{config::SharedSecret, error::CodecError, message::Envelope};

/// Stream frames carry a 4-byte big-endian body length.
pub const LENGTH_PREFIX: usize = 4;

/// Largest frame body accepted or produced on the stream transport.
pub const MAX_FRAME_LEN: usize = 1024 * 1024;

type HmacSha256 = Hmac<Sha256>;

/// Wire codec keyed with the process-wide shared secret.
///
/// Built once at startup and never mutated; every sign and verify starts
/// from a clone of the keyed MAC state.
#[derive(Clone)]
pub struct Codec {
    keyed: HmacSha256,
}

impl Codec {
    pub fn new(secret: &SharedSecret) -> Self {
        Self {
            keyed: keyed_mac(secret.expose()),
        }
    }

    /// Deterministic wire encoding: `type`, body fields, `ts`, then `tag`.
    pub fn encode(&self, envelope: &Envelope) -> Result<Vec<u8>, CodecError> {
        Ok(serde_json::to_vec(envelope)?)
    }

    pub fn decode(&self, bytes: &[u8]) -> Result<Envelope, CodecError> {
        Ok(serde_json::from_slice(bytes)?)
    }

    /// Returns `envelope` with `tag` set to the MAC over every other field.
    pub fn sign(&self, envelope: &Envelope) -> Result<Envelope, CodecError> {
        let mut mac = self.keyed.clone();
        mac.update(&canonical(envelope)?);
        let mut signed = envelope.clone();
        signed.tag = Some(hex::encode(mac.finalize().into_bytes()));
        Ok(signed)
    }

    /// Recomputes the MAC and compares in constant time.
    pub fn verify(&self, envelope: &Envelope) -> bool {
        let Some(tag) = envelope.tag.as_deref() else {
            return false;
        };
        let Ok(expected) = hex::decode(tag) else {
            return false;
        };
        let Ok(bytes) = canonical(envelope) else {
            return false;
        };
        let mut mac = self.keyed.clone();
        mac.update(&bytes);
        mac.verify_slice(&expected).is_ok()
    }

    /// Signs and encodes an envelope as one length-prefixed stream frame.
    pub fn seal_frame(&self, envelope: &Envelope) -> Result<Vec<u8>, CodecError> {
        let signed = self.sign(envelope)?;
        frame(&self.encode(&signed)?)
    }

    /// Signs and encodes an envelope as one datagram payload.
    pub fn seal_datagram(&self, envelope: &Envelope) -> Result<Vec<u8>, CodecError> {
        let signed = self.sign(envelope)?;
        self.encode(&signed)
    }
}

/// Prepends the big-endian length prefix to an encoded body.
pub fn frame(body: &[u8]) -> Result<Vec<u8>, CodecError> {
    if body.len() > MAX_FRAME_LEN {
        return Err(CodecError::FrameTooLarge {
            len: body.len(),
            max: MAX_FRAME_LEN,
        });
    }
    let mut framed = Vec::with_capacity(LENGTH_PREFIX + body.len());
    // MAX_FRAME_LEN fits in u32.
    framed.extend_from_slice(&(body.len() as u32).to_be_bytes());
    framed.extend_from_slice(body);
    Ok(framed)
}

/// Sorted-key compact JSON of every field except `tag`.
fn canonical(envelope: &Envelope) -> Result<Vec<u8>, CodecError> {
    let mut untagged = serde_json::to_value(envelope)?;
    if let Some(object) = untagged.as_object_mut() {
        object.remove("tag");
    }
    // serde_json::Map is a BTreeMap here, so keys serialize sorted.
    Ok(serde_json::to_vec(&untagged)?)
}

fn keyed_mac(key: &[u8]) -> HmacSha256 {
    match HmacSha256::new_from_slice(key) {
        Ok(mac) => mac,
        // HMAC hashes over-long keys and pads short ones, so every length is valid.
        Err(_) => unreachable!("HMAC accepts keys of any length"),
    }
}
