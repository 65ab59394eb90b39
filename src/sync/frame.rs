//! Authenticated wire framing for the peer protocol.
//!
//! Plaintext layout before encryption:
//!
//! ```text
//! <urn> <id_key> <msg_type> <flags> <json_payload>
//! ```
//!
//! zero-padded to a 16-byte boundary. On the wire a frame is
//! `[AEAD ciphertext][12-byte nonce][16-byte tag][4-byte sentinel]`.
//! The receiver buffers until both the minimum-length threshold and a
//! trailing-sentinel match are observed, then decrypts-and-authenticates
//! in one step; any AEAD failure aborts the connection with no partial
//! state applied.

use aes_gcm::aead::{AeadInPlace, KeyInit};
use aes_gcm::{Aes256Gcm, Key, Nonce, Tag};
use rand::RngCore;
use sha2::{Digest, Sha256};

use crate::error::{CepError, Result};

pub const SENTINEL: &[u8; 4] = b"\x17END";
pub const NONCE_LEN: usize = 12;
pub const TAG_LEN: usize = 16;
/// Smallest legal frame: one padded plaintext block plus trailer.
pub const MIN_FRAME_LEN: usize = 16 + NONCE_LEN + TAG_LEN + SENTINEL.len();

const PAD_BLOCK: usize = 16;

/// Flag bit 0: instructs the receiver to zero the sender's
/// `last_comms`/`last_attempt`, forcing its next cycle to resync.
pub const FLAG_FORCE_RESYNC: u8 = 0b0000_0001;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MsgType {
    Sync,
    Ping,
    Resync,
}

impl MsgType {
    pub fn as_str(&self) -> &'static str {
        match self {
            MsgType::Sync => "SYNC",
            MsgType::Ping => "PING",
            MsgType::Resync => "RESYNC",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "SYNC" => Some(MsgType::Sync),
            "PING" => Some(MsgType::Ping),
            "RESYNC" => Some(MsgType::Resync),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Frame {
    pub urn: String,
    pub id_key: String,
    pub msg_type: MsgType,
    pub flags: u8,
    pub payload: String,
}

impl Frame {
    pub fn new(urn: &str, id_key: &str, msg_type: MsgType, flags: u8, payload: String) -> Self {
        Self {
            urn: urn.to_string(),
            id_key: id_key.to_string(),
            msg_type,
            flags,
            payload,
        }
    }

    pub fn force_resync(&self) -> bool {
        self.flags & FLAG_FORCE_RESYNC != 0
    }
}

/// True once a receive buffer holds a complete frame candidate.
pub fn frame_complete(buf: &[u8]) -> bool {
    buf.len() >= MIN_FRAME_LEN && buf.ends_with(SENTINEL)
}

/// AES-256-GCM seal/open with a key derived from the shared secret.
pub struct FrameCipher {
    cipher: Aes256Gcm,
}

impl FrameCipher {
    /// Key = SHA-256 of the instance-shared secret string.
    pub fn from_secret(secret: &str) -> Self {
        let digest = Sha256::digest(secret.as_bytes());
        let key = Key::<Aes256Gcm>::from_slice(&digest);
        Self {
            cipher: Aes256Gcm::new(key),
        }
    }

    /// Key given directly as 64 hex chars.
    pub fn from_hex_key(hex_key: &str) -> Result<Self> {
        let bytes = hex::decode(hex_key)
            .map_err(|e| CepError::Configuration(format!("bad sync key hex: {}", e)))?;
        if bytes.len() != 32 {
            return Err(CepError::Configuration(format!(
                "sync key must be 32 bytes, got {}",
                bytes.len()
            )));
        }
        let key = Key::<Aes256Gcm>::from_slice(&bytes);
        Ok(Self {
            cipher: Aes256Gcm::new(key),
        })
    }

    pub fn seal(&self, frame: &Frame) -> Result<Vec<u8>> {
        let plain = format!(
            "{} {} {} {} {}",
            frame.urn,
            frame.id_key,
            frame.msg_type.as_str(),
            frame.flags,
            frame.payload
        );
        let mut buf = plain.into_bytes();
        let pad = (PAD_BLOCK - buf.len() % PAD_BLOCK) % PAD_BLOCK;
        buf.extend(std::iter::repeat(0u8).take(pad));

        let mut nonce = [0u8; NONCE_LEN];
        rand::thread_rng().fill_bytes(&mut nonce);
        let tag = self
            .cipher
            .encrypt_in_place_detached(Nonce::from_slice(&nonce), b"", &mut buf)
            .map_err(|_| CepError::Auth("AEAD seal failure".to_string()))?;

        buf.extend_from_slice(&nonce);
        buf.extend_from_slice(&tag);
        buf.extend_from_slice(SENTINEL);
        Ok(buf)
    }

    pub fn open(&self, wire: &[u8]) -> Result<Frame> {
        if !frame_complete(wire) {
            return Err(CepError::Auth("truncated frame".to_string()));
        }
        let body = &wire[..wire.len() - SENTINEL.len()];
        let (rest, tag) = body.split_at(body.len() - TAG_LEN);
        let (ct, nonce) = rest.split_at(rest.len() - NONCE_LEN);

        let mut buf = ct.to_vec();
        self.cipher
            .decrypt_in_place_detached(
                Nonce::from_slice(nonce),
                b"",
                &mut buf,
                Tag::from_slice(tag),
            )
            .map_err(|_| CepError::Auth("AEAD failure".to_string()))?;

        // Strip the zero padding.
        while buf.last() == Some(&0) {
            buf.pop();
        }
        let text = String::from_utf8(buf)
            .map_err(|_| CepError::Auth("frame is not UTF-8".to_string()))?;
        Self::parse_plain(&text)
    }

    fn parse_plain(text: &str) -> Result<Frame> {
        let mut parts = text.splitn(5, ' ');
        let urn = parts.next();
        let id_key = parts.next();
        let msg_type = parts.next().and_then(MsgType::parse);
        let flags = parts.next().and_then(|f| f.parse::<u8>().ok());
        let payload = parts.next();
        match (urn, id_key, msg_type, flags, payload) {
            (Some(urn), Some(id_key), Some(msg_type), Some(flags), Some(payload)) => Ok(Frame {
                urn: urn.to_string(),
                id_key: id_key.to_string(),
                msg_type,
                flags,
                payload: payload.to_string(),
            }),
            _ => Err(CepError::Auth("malformed frame".to_string())),
        }
    }
}
