//! Nostr event model, canonical hashing, and validation.

use secp256k1::{schnorr::Signature, Keypair, Message, Secp256k1, XOnlyPublicKey};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};
use thiserror::Error;

/// Wrapper for a Nostr tag expressed as an array of strings.
///
/// The first element names the tag and the following elements hold data. A
/// `["e", "<event id>", "wss://relay"]` tag from the protocol is represented
/// as `Tag(vec!["e".into(), "<event id>".into(), "wss://relay".into()])`.
/// Tags are stored verbatim so uncommon or custom tags survive a round trip.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Tag(pub Vec<String>);

impl Tag {
    /// Tag name (position 0).
    pub fn name(&self) -> Option<&str> {
        self.0.first().map(String::as_str)
    }

    /// First tag value (position 1), the only value filters look at.
    pub fn value(&self) -> Option<&str> {
        self.0.get(1).map(String::as_str)
    }
}

/// Signed Nostr event accepted by the relay and served to subscribers.
///
/// ```json
/// {
///   "id": "4376c65d2f232afbe9b882a35baa4f6fe8667c4e684749af565f981833ed6a65",
///   "pubkey": "6e468422dfb74a5738702a8823b9b28168abab8655faacb6853cd0ee15deee93",
///   "kind": 1,
///   "created_at": 1700000000,
///   "tags": [["e", "aa11..."], ["p", "6e46..."]],
///   "content": "hello",
///   "sig": "908a15e4..."
/// }
/// ```
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Event {
    /// Event identifier (hex of the SHA-256 canonical hash).
    pub id: String,
    /// Author x-only public key (hex).
    pub pubkey: String,
    /// Kind number, e.g. `1` for a text note. Opaque to the relay.
    pub kind: u32,
    /// Unix timestamp supplied by the author.
    pub created_at: u64,
    /// Ordered tag list; names may repeat.
    pub tags: Vec<Tag>,
    /// Event content body.
    pub content: String,
    /// BIP-340 Schnorr signature over the event hash.
    pub sig: String,
}

/// Structural problems with a published event payload.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum InvalidEvent {
    #[error("event must be a JSON object")]
    NotAnObject,
    #[error("malformed event: {0}")]
    Malformed(String),
    #[error("{field} must be {len} lowercase hex characters")]
    BadHex { field: &'static str, len: usize },
}

/// Reasons an event fails id or signature verification.
#[derive(Debug, Error)]
pub enum VerifyError {
    #[error("event id does not match its content")]
    IdMismatch,
    #[error("bad hex encoding: {0}")]
    Hex(#[from] hex::FromHexError),
    #[error("signature check failed: {0}")]
    Secp(#[from] secp256k1::Error),
    #[error("serializing event: {0}")]
    Serialize(#[from] serde_json::Error),
}

impl Event {
    /// Decode a published payload, checking required fields and their shapes.
    pub fn from_value(value: Value) -> Result<Self, InvalidEvent> {
        if !value.is_object() {
            return Err(InvalidEvent::NotAnObject);
        }
        let ev: Event =
            serde_json::from_value(value).map_err(|e| InvalidEvent::Malformed(e.to_string()))?;
        ensure_hex("id", &ev.id, 64)?;
        ensure_hex("pubkey", &ev.pubkey, 64)?;
        ensure_hex("sig", &ev.sig, 128)?;
        Ok(ev)
    }

    /// Recompute the NIP-01 hash `sha256([0, pubkey, created_at, kind, tags, content])`.
    pub fn canonical_hash(&self) -> Result<[u8; 32], VerifyError> {
        let arr = serde_json::json!([
            0,
            self.pubkey,
            self.created_at,
            self.kind,
            self.tags,
            self.content
        ]);
        let data = serde_json::to_vec(&arr)?;
        Ok(Sha256::digest(&data).into())
    }

    /// Verify the event's id and Schnorr signature against its own pubkey.
    pub fn verify(&self) -> Result<(), VerifyError> {
        let hash = self.canonical_hash()?;
        if hex::encode(hash) != self.id {
            return Err(VerifyError::IdMismatch);
        }
        let sig = Signature::from_slice(&hex::decode(&self.sig)?)?;
        let pk = XOnlyPublicKey::from_slice(&hex::decode(&self.pubkey)?)?;
        let secp = Secp256k1::verification_only();
        let msg = Message::from_digest_slice(&hash)?;
        secp.verify_schnorr(&sig, &msg, &pk)?;
        Ok(())
    }

    /// Build and sign an event with `keys`, filling in `id`, `pubkey`, and `sig`.
    pub fn signed(
        keys: &Keypair,
        kind: u32,
        created_at: u64,
        tags: Vec<Tag>,
        content: impl Into<String>,
    ) -> Result<Self, VerifyError> {
        let secp = Secp256k1::signing_only();
        let mut ev = Event {
            id: String::new(),
            pubkey: hex::encode(keys.x_only_public_key().0.serialize()),
            kind,
            created_at,
            tags,
            content: content.into(),
            sig: String::new(),
        };
        let hash = ev.canonical_hash()?;
        ev.id = hex::encode(hash);
        let msg = Message::from_digest_slice(&hash)?;
        let sig = secp.sign_schnorr_no_aux_rand(&msg, keys);
        ev.sig = hex::encode(sig.as_ref());
        Ok(ev)
    }
}

fn ensure_hex(field: &'static str, value: &str, len: usize) -> Result<(), InvalidEvent> {
    let ok = value.len() == len
        && value
            .bytes()
            .all(|b| b.is_ascii_digit() || (b'a'..=b'f').contains(&b));
    if ok {
        Ok(())
    } else {
        Err(InvalidEvent::BadHex { field, len })
    }
}
