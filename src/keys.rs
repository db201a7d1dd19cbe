//! Key material: generation, NIP-19 `nsec`/`npub` encoding, and signing.

use bech32::{Bech32, Hrp};
use rand::RngCore;
use secp256k1::{Keypair, Message, Secp256k1, XOnlyPublicKey};

use crate::{
    error::{Error, Result},
    event::{event_hash, Event, UnsignedEvent},
};

const NSEC: &str = "nsec";
const NPUB: &str = "npub";

/// A secp256k1 keypair used to sign events.
#[derive(Clone)]
pub struct Keys {
    keypair: Keypair,
}

impl Keys {
    /// Generate a fresh random secret key.
    pub fn generate() -> Self {
        let secp = Secp256k1::new();
        let mut rng = rand::thread_rng();
        loop {
            let mut secret = [0u8; 32];
            rng.fill_bytes(&mut secret);
            // Out-of-range scalars are astronomically rare; draw again.
            if let Ok(keypair) = Keypair::from_seckey_slice(&secp, &secret) {
                return Self { keypair };
            }
        }
    }

    pub fn from_secret_bytes(secret: &[u8]) -> Result<Self> {
        let secp = Secp256k1::new();
        let keypair = Keypair::from_seckey_slice(&secp, secret)
            .map_err(|e| Error::InvalidKeyMaterial(format!("secret key: {e}")))?;
        Ok(Self { keypair })
    }

    /// Decode a bech32 `nsec1...` string.
    pub fn from_nsec(nsec: &str) -> Result<Self> {
        let secret = decode_bech32(nsec, NSEC)?;
        Self::from_secret_bytes(&secret)
    }

    /// X-only public key as lowercase hex, the form used inside events.
    pub fn public_key_hex(&self) -> String {
        hex::encode(self.keypair.x_only_public_key().0.serialize())
    }

    pub fn npub(&self) -> Result<String> {
        encode_bech32(NPUB, &self.keypair.x_only_public_key().0.serialize())
    }

    pub fn nsec(&self) -> Result<String> {
        encode_bech32(NSEC, &self.keypair.secret_bytes())
    }

    /// Compute the id and Schnorr signature for `unsigned`.
    pub fn sign(&self, unsigned: UnsignedEvent) -> Result<Event> {
        let pubkey = self.public_key_hex();
        let hash = event_hash(
            &pubkey,
            unsigned.created_at,
            unsigned.kind,
            &unsigned.tags,
            &unsigned.content,
        )?;
        let msg =
            Message::from_digest_slice(&hash).map_err(|e| Error::InvalidEvent(e.to_string()))?;
        let sig = Secp256k1::new().sign_schnorr_no_aux_rand(&msg, &self.keypair);
        Ok(Event {
            id: hex::encode(hash),
            pubkey,
            kind: unsigned.kind,
            created_at: unsigned.created_at,
            tags: unsigned.tags,
            content: unsigned.content,
            sig: hex::encode(sig.as_ref()),
        })
    }
}

impl std::fmt::Debug for Keys {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Keys")
            .field("pubkey", &self.public_key_hex())
            .finish_non_exhaustive()
    }
}

/// Decode an `npub1...` string into the hex public key used in filters and tags.
pub fn npub_to_hex(npub: &str) -> Result<String> {
    let data = decode_bech32(npub, NPUB)?;
    XOnlyPublicKey::from_slice(&data)
        .map_err(|e| Error::InvalidKeyMaterial(format!("public key: {e}")))?;
    Ok(hex::encode(data))
}

fn encode_bech32(prefix: &str, data: &[u8]) -> Result<String> {
    let hrp = Hrp::parse(prefix).map_err(|e| Error::InvalidKeyMaterial(e.to_string()))?;
    bech32::encode::<Bech32>(hrp, data).map_err(|e| Error::InvalidKeyMaterial(e.to_string()))
}

fn decode_bech32(text: &str, expected: &str) -> Result<Vec<u8>> {
    let (hrp, data) =
        bech32::decode(text.trim()).map_err(|e| Error::InvalidKeyMaterial(e.to_string()))?;
    let prefix = hrp.to_string().to_lowercase();
    if prefix != expected {
        return Err(Error::InvalidKeyMaterial(format!(
            "expected {expected}, got {prefix}"
        )));
    }
    if data.len() != 32 {
        return Err(Error::InvalidKeyMaterial(format!(
            "expected 32 bytes, got {}",
            data.len()
        )));
    }
    Ok(data)
}
