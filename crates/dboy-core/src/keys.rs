//! Per-run RSA key pair used to receive the session password.

use crate::handshake::HandshakeError;
use rand_core::OsRng;
use rsa::pkcs1::{DecodeRsaPublicKey, EncodeRsaPublicKey};
use rsa::{Oaep, RsaPrivateKey, RsaPublicKey};
use sha2::{Digest, Sha256};
use zeroize::Zeroizing;

/// Key pair owned by a running client. The private key is zeroed on drop.
pub struct SessionKeyPair {
    private_key: RsaPrivateKey,
    public_der: Vec<u8>,
}

impl SessionKeyPair {
    /// Generate a fresh key pair. CPU heavy; run it on the worker pool.
    pub fn generate(bits: usize) -> Result<Self, HandshakeError> {
        let private_key = RsaPrivateKey::new(&mut OsRng, bits)
            .map_err(|e| HandshakeError::Crypto(e.to_string()))?;
        let public_der = RsaPublicKey::from(&private_key)
            .to_pkcs1_der()
            .map_err(|e| HandshakeError::Crypto(e.to_string()))?
            .as_bytes()
            .to_vec();
        tracing::debug!("Generated {}-bit session key", bits);
        Ok(Self {
            private_key,
            public_der,
        })
    }

    /// PKCS#1 DER encoding of the public key, as sent on the wire.
    pub fn public_key_bytes(&self) -> &[u8] {
        &self.public_der
    }

    /// Short fingerprint for display (first 8 hex chars of SHA-256 of the key).
    pub fn fingerprint(&self) -> String {
        hex::encode(&Sha256::digest(&self.public_der)[..4])
    }

    pub fn decrypt(&self, sealed: &[u8]) -> Result<Zeroizing<Vec<u8>>, HandshakeError> {
        self.private_key
            .decrypt(Oaep::new::<Sha256>(), sealed)
            .map(Zeroizing::new)
            .map_err(|e| HandshakeError::Crypto(e.to_string()))
    }

    /// Encrypt `secret` for the holder of the DER-encoded public key.
    pub fn seal_for(public_der: &[u8], secret: &[u8]) -> Result<Vec<u8>, HandshakeError> {
        let public_key = RsaPublicKey::from_pkcs1_der(public_der)
            .map_err(|e| HandshakeError::Crypto(format!("bad public key: {e}")))?;
        public_key
            .encrypt(&mut OsRng, Oaep::new::<Sha256>(), secret)
            .map_err(|e| HandshakeError::Crypto(e.to_string()))
    }
}
