//! Nostr event model, NIP-01 hashing, and builders for the kinds this client
//! publishes.

use std::time::{SystemTime, UNIX_EPOCH};

use secp256k1::{schnorr::Signature, Message, Secp256k1, XOnlyPublicKey};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};

use crate::error::{Error, Result};

/// Profile metadata (`content` is a JSON object with `name`, `about`, ...).
pub const KIND_METADATA: u32 = 0;
/// Short text note.
pub const KIND_NOTE: u32 = 1;
/// Contact list made of `p` tags.
pub const KIND_CONTACTS: u32 = 3;
/// Repost of another note (NIP-18).
pub const KIND_REPOST: u32 = 6;
/// Reaction to another event (NIP-25).
pub const KIND_REACTION: u32 = 7;

/// Wrapper for a Nostr tag expressed as an array of strings.
///
/// Tags appear as small arrays where the first element denotes the type and the
/// following elements hold data, e.g. `["p", <pubkey>]` or `["e", <event id>]`.
/// Each tag is kept verbatim so uncommon or custom tags survive a round trip.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub struct Tag(pub Vec<String>);

impl Tag {
    /// Build a two-element tag such as `["p", <hex>]`.
    pub fn pair(name: &str, value: &str) -> Self {
        Tag(vec![name.to_string(), value.to_string()])
    }

    /// Second element of the tag, which carries the referenced value.
    pub fn value(&self) -> Option<&str> {
        self.0.get(1).map(String::as_str)
    }
}

/// Signed Nostr event as received from or sent to relays.
///
/// ```json
/// {
///   "id": "aa11",
///   "pubkey": "79be...",
///   "kind": 1,
///   "created_at": 1700000000,
///   "tags": [["p", "79be..."]],
///   "content": "hello",
///   "sig": "deadbeef"
/// }
/// ```
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Event {
    /// Event identifier (hex of SHA-256 hash).
    pub id: String,
    /// Author public key (hex, x-only).
    pub pubkey: String,
    /// Kind number, e.g. `1` or `3`.
    pub kind: u32,
    /// Unix timestamp of creation.
    pub created_at: u64,
    pub tags: Vec<Tag>,
    pub content: String,
    /// Schnorr signature over the event hash.
    pub sig: String,
}

impl Event {
    /// Recompute the NIP-01 hash from the event fields.
    pub fn hash(&self) -> Result<[u8; 32]> {
        event_hash(
            &self.pubkey,
            self.created_at,
            self.kind,
            &self.tags,
            &self.content,
        )
    }

    /// Check that `id` matches the content and `sig` is valid for `pubkey`.
    pub fn verify(&self) -> Result<()> {
        let hash = self.hash()?;
        if hex::encode(hash) != self.id {
            return Err(Error::InvalidEvent(format!("id mismatch for {}", self.id)));
        }
        let sig_bytes =
            hex::decode(&self.sig).map_err(|e| Error::InvalidEvent(format!("sig: {e}")))?;
        let sig = Signature::from_slice(&sig_bytes)
            .map_err(|e| Error::InvalidEvent(format!("sig: {e}")))?;
        let pk_bytes = hex::decode(&self.pubkey)
            .map_err(|e| Error::InvalidKeyMaterial(format!("pubkey: {e}")))?;
        let pk = XOnlyPublicKey::from_slice(&pk_bytes)
            .map_err(|e| Error::InvalidKeyMaterial(format!("pubkey: {e}")))?;
        let msg =
            Message::from_digest_slice(&hash).map_err(|e| Error::InvalidEvent(e.to_string()))?;
        Secp256k1::verification_only()
            .verify_schnorr(&sig, &msg, &pk)
            .map_err(|e| Error::InvalidEvent(format!("signature: {e}")))
    }
}

/// Event fields before an author signs them.
#[derive(Debug, Clone, PartialEq)]
pub struct UnsignedEvent {
    pub kind: u32,
    pub created_at: u64,
    pub tags: Vec<Tag>,
    pub content: String,
}

impl UnsignedEvent {
    /// Stamp a new event with the current time.
    pub fn new(kind: u32, tags: Vec<Tag>, content: impl Into<String>) -> Self {
        Self {
            kind,
            created_at: unix_now(),
            tags,
            content: content.into(),
        }
    }

    /// Kind 0: the metadata object serialized as the content.
    pub fn metadata(metadata: &Value) -> Result<Self> {
        if !metadata.is_object() {
            return Err(Error::BadRequest("metadata must be a JSON object".into()));
        }
        Ok(Self::new(KIND_METADATA, vec![], serde_json::to_string(metadata)?))
    }

    pub fn note(content: impl Into<String>, tags: Vec<Tag>) -> Self {
        Self::new(KIND_NOTE, tags, content)
    }

    /// Kind 3: the full replacement contact list.
    pub fn contact_list(tags: Vec<Tag>) -> Self {
        Self::new(KIND_CONTACTS, tags, "")
    }

    /// Kind 6: the reposted event is embedded as JSON content.
    pub fn repost(original: &Event, relay_hint: Option<&str>) -> Result<Self> {
        let mut e_tag = vec!["e".to_string(), original.id.clone()];
        if let Some(hint) = relay_hint {
            e_tag.push(hint.to_string());
        }
        let tags = vec![Tag(e_tag), Tag::pair("p", &original.pubkey)];
        Ok(Self::new(KIND_REPOST, tags, serde_json::to_string(original)?))
    }

    /// Kind 7: `+` by default, or any emoji/text reaction.
    pub fn reaction(event_id: &str, author: &str, content: Option<&str>) -> Self {
        let tags = vec![Tag::pair("e", event_id), Tag::pair("p", author)];
        Self::new(KIND_REACTION, tags, content.unwrap_or("+"))
    }
}

/// NIP-01 hash: SHA-256 of `[0, pubkey, created_at, kind, tags, content]`.
pub(crate) fn event_hash(
    pubkey: &str,
    created_at: u64,
    kind: u32,
    tags: &[Tag],
    content: &str,
) -> Result<[u8; 32]> {
    let arr = serde_json::json!([0, pubkey, created_at, kind, tags, content]);
    let data = serde_json::to_vec(&arr)?;
    Ok(Sha256::digest(&data).into())
}

fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or_default()
}
