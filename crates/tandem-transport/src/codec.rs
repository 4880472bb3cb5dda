//! # Payload Codec
//!
//! Encryption, key exchange and compression are collaborators supplied by
//! the embedding application. This module defines the seams and applies
//! them to payloads, recording what was done in the frame's
//! [`MessageFlags`].
//!
//! Reliable payloads are compressed first (when enabled and at least
//! `compression_threshold` bytes, and only if that makes them smaller), then
//! encrypted. Unreliable payloads have no flag byte on the wire, so they are
//! only ever encrypted, and only when the session negotiated encryption.

use bytes::Bytes;
use std::fmt;
use std::sync::Arc;

use crate::error::CodecError;
use crate::wire::MessageFlags;

// ─── Collaborator Traits ────────────────────────────────────────────────────

/// Symmetric cipher bound to one session's key. Dropping it must release
/// the key material.
pub trait Encryptor: Send + Sync {
    fn encrypt(&self, plain: &[u8]) -> Result<Vec<u8>, CodecError>;
    fn decrypt(&self, cipher: &[u8]) -> Result<Vec<u8>, CodecError>;
}

/// Produces one key pair per handshake.
pub trait KeyExchange: Send + Sync {
    /// Key size in bits, announced in the auth request.
    fn key_size(&self) -> u16;
    fn keypair(&self) -> Result<Box<dyn KeyPair>, CodecError>;
}

/// The local half of a key agreement.
pub trait KeyPair: Send {
    fn public_key(&self) -> Bytes;
    /// Combine with the remote public key into a session cipher.
    fn agree(self: Box<Self>, remote_public: &[u8]) -> Result<Box<dyn Encryptor>, CodecError>;
}

pub trait Compressor: Send + Sync {
    fn compress(&self, data: &[u8]) -> Result<Vec<u8>, CodecError>;
    fn decompress(&self, data: &[u8]) -> Result<Vec<u8>, CodecError>;
}

// ─── Payload Codec ──────────────────────────────────────────────────────────

/// Per-connection payload transforms.
#[derive(Default)]
pub struct PayloadCodec {
    encryptor: Option<Box<dyn Encryptor>>,
    compressor: Option<Arc<dyn Compressor>>,
    use_compress: bool,
    compression_threshold: usize,
}

impl fmt::Debug for PayloadCodec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PayloadCodec")
            .field("encrypt", &self.encryptor.is_some())
            .field("compress", &self.compresses())
            .field("compression_threshold", &self.compression_threshold)
            .finish()
    }
}

impl PayloadCodec {
    /// No encryption, no compression.
    pub fn plain() -> Self {
        Self::default()
    }

    pub fn set_encryptor(&mut self, encryptor: Option<Box<dyn Encryptor>>) {
        self.encryptor = encryptor;
    }

    pub fn set_compression(
        &mut self,
        compressor: Option<Arc<dyn Compressor>>,
        enabled: bool,
        threshold: usize,
    ) {
        self.compressor = compressor;
        self.use_compress = enabled;
        self.compression_threshold = threshold;
    }

    pub fn encrypts(&self) -> bool {
        self.encryptor.is_some()
    }

    pub fn compresses(&self) -> bool {
        self.use_compress && self.compressor.is_some()
    }

    /// Drop the session key and fall back to plain payloads.
    pub fn clear(&mut self) {
        self.encryptor = None;
    }

    /// Transform an outbound reliable payload.
    pub fn seal(&self, payload: Bytes) -> Result<(MessageFlags, Bytes), CodecError> {
        let mut flags = MessageFlags::empty();
        let mut body = payload;

        if let Some(compressor) = self.compressor.as_ref().filter(|_| self.use_compress) {
            if body.len() >= self.compression_threshold {
                let packed = compressor.compress(&body)?;
                if packed.len() < body.len() {
                    body = Bytes::from(packed);
                    flags |= MessageFlags::COMPRESSED;
                }
            }
        }
        if let Some(enc) = &self.encryptor {
            body = Bytes::from(enc.encrypt(&body)?);
            flags |= MessageFlags::ENCRYPTED;
        }
        Ok((flags, body))
    }

    /// Undo [`seal`](Self::seal) according to the received flags.
    pub fn open(&self, flags: MessageFlags, payload: Bytes) -> Result<Bytes, CodecError> {
        let mut body = payload;
        if flags.contains(MessageFlags::ENCRYPTED) {
            let enc = self.encryptor.as_ref().ok_or(CodecError::MissingKey)?;
            body = Bytes::from(enc.decrypt(&body)?);
        }
        if flags.contains(MessageFlags::COMPRESSED) {
            let compressor = self
                .compressor
                .as_ref()
                .ok_or_else(|| CodecError::Decompress("no compressor installed".into()))?;
            body = Bytes::from(compressor.decompress(&body)?);
        }
        Ok(body)
    }

    pub fn seal_datagram(&self, payload: Bytes) -> Result<Bytes, CodecError> {
        match &self.encryptor {
            Some(enc) => Ok(Bytes::from(enc.encrypt(&payload)?)),
            None => Ok(payload),
        }
    }

    pub fn open_datagram(&self, payload: Bytes) -> Result<Bytes, CodecError> {
        match &self.encryptor {
            Some(enc) => Ok(Bytes::from(enc.decrypt(&payload)?)),
            None => Ok(payload),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Xor(u8);

    impl Encryptor for Xor {
        fn encrypt(&self, plain: &[u8]) -> Result<Vec<u8>, CodecError> {
            Ok(plain.iter().map(|b| b ^ self.0).collect())
        }
        fn decrypt(&self, cipher: &[u8]) -> Result<Vec<u8>, CodecError> {
            self.encrypt(cipher)
        }
    }

    /// Collapses runs of one byte into (count, byte) pairs.
    struct Rle;

    impl Compressor for Rle {
        fn compress(&self, data: &[u8]) -> Result<Vec<u8>, CodecError> {
            let mut out = Vec::new();
            for chunk in data.chunk_by(|a, b| a == b) {
                for piece in chunk.chunks(255) {
                    out.push(piece.len() as u8);
                    out.push(piece[0]);
                }
            }
            Ok(out)
        }
        fn decompress(&self, data: &[u8]) -> Result<Vec<u8>, CodecError> {
            if data.len() % 2 != 0 {
                return Err(CodecError::Decompress("odd length".into()));
            }
            Ok(data
                .chunks(2)
                .flat_map(|p| std::iter::repeat(p[1]).take(p[0] as usize))
                .collect())
        }
    }

    #[test]
    fn plain_codec_is_identity() {
        let codec = PayloadCodec::plain();
        let (flags, body) = codec.seal(Bytes::from_static(b"hello")).unwrap();
        assert!(flags.is_empty());
        assert_eq!(codec.open(flags, body).unwrap(), Bytes::from_static(b"hello"));
    }

    #[test]
    fn compresses_only_above_threshold() {
        let mut codec = PayloadCodec::plain();
        codec.set_compression(Some(Arc::new(Rle)), true, 64);

        let (flags, _) = codec.seal(Bytes::from(vec![0u8; 32])).unwrap();
        assert!(!flags.contains(MessageFlags::COMPRESSED));

        let big = Bytes::from(vec![0u8; 1000]);
        let (flags, body) = codec.seal(big.clone()).unwrap();
        assert!(flags.contains(MessageFlags::COMPRESSED));
        assert!(body.len() < 20);
        assert_eq!(codec.open(flags, body).unwrap(), big);
    }

    #[test]
    fn incompressible_payload_is_sent_raw() {
        let mut codec = PayloadCodec::plain();
        codec.set_compression(Some(Arc::new(Rle)), true, 1);
        let data: Bytes = (0..200u8).collect::<Vec<_>>().into();
        let (flags, body) = codec.seal(data.clone()).unwrap();
        assert!(flags.is_empty());
        assert_eq!(body, data);
    }

    #[test]
    fn encrypts_after_compressing() {
        let mut codec = PayloadCodec::plain();
        codec.set_compression(Some(Arc::new(Rle)), true, 1);
        codec.set_encryptor(Some(Box::new(Xor(0x5A))));
        let data = Bytes::from(vec![7u8; 300]);
        let (flags, body) = codec.seal(data.clone()).unwrap();
        assert_eq!(flags, MessageFlags::COMPRESSED | MessageFlags::ENCRYPTED);
        assert_eq!(codec.open(flags, body).unwrap(), data);
    }

    #[test]
    fn encrypted_frame_without_key_fails() {
        let codec = PayloadCodec::plain();
        let err = codec
            .open(MessageFlags::ENCRYPTED, Bytes::from_static(b"x"))
            .unwrap_err();
        assert_eq!(err, CodecError::MissingKey);
    }

    #[test]
    fn datagrams_follow_encryption_policy() {
        let mut codec = PayloadCodec::plain();
        let raw = Bytes::from_static(b"pos");
        assert_eq!(codec.seal_datagram(raw.clone()).unwrap(), raw);
        codec.set_encryptor(Some(Box::new(Xor(1))));
        let sealed = codec.seal_datagram(raw.clone()).unwrap();
        assert_ne!(sealed, raw);
        assert_eq!(codec.open_datagram(sealed).unwrap(), raw);
        codec.clear();
        assert!(!codec.encrypts());
    }
}
