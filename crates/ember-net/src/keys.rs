//! RSA identity keys.
//!
//! Public keys travel as DER-encoded SubjectPublicKeyInfo; private keys are
//! stored as PKCS#8 DER. Encryption is RSA-OAEP with SHA-256.

use std::fmt;

use rsa::pkcs8::{DecodePrivateKey, DecodePublicKey, EncodePrivateKey, EncodePublicKey};
use rsa::traits::PublicKeyParts;
use rsa::{Oaep, RsaPrivateKey, RsaPublicKey};
use sha2::Sha256;

use crate::AuthError;

/// Bytes of OAEP-SHA256 overhead per ciphertext block.
const OAEP_SHA256_OVERHEAD: usize = 2 * 32 + 2;

/// The shareable half of an identity.
#[derive(Clone, PartialEq, Eq)]
pub struct PublicKey(RsaPublicKey);

impl PublicKey {
    /// Parse the public-data blob produced by [`to_der`](Self::to_der).
    pub fn from_der(der: &[u8]) -> Result<Self, AuthError> {
        RsaPublicKey::from_public_key_der(der)
            .map(PublicKey)
            .map_err(|e| AuthError::InvalidKey(e.to_string()))
    }

    pub fn to_der(&self) -> Result<Vec<u8>, AuthError> {
        self.0
            .to_public_key_der()
            .map(|doc| doc.as_bytes().to_vec())
            .map_err(|e| AuthError::InvalidKey(e.to_string()))
    }

    /// Encrypt `plaintext` so only the matching private key can read it.
    pub fn encrypt(&self, plaintext: &[u8]) -> Result<Vec<u8>, AuthError> {
        let mut rng = rand::thread_rng();
        self.0
            .encrypt(&mut rng, Oaep::new::<Sha256>(), plaintext)
            .map_err(|e| AuthError::Crypto(e.to_string()))
    }

    /// Largest plaintext [`encrypt`](Self::encrypt) accepts.
    pub fn max_plaintext_len(&self) -> usize {
        self.0.size().saturating_sub(OAEP_SHA256_OVERHEAD)
    }

    /// Short hex digest of the DER encoding, for logs.
    pub fn fingerprint(&self) -> String {
        match self.0.to_public_key_der() {
            Ok(doc) => blake3::hash(doc.as_bytes()).to_hex()[..16].to_string(),
            Err(_) => "<unencodable>".to_string(),
        }
    }
}

impl fmt::Debug for PublicKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PublicKey({})", self.fingerprint())
    }
}

/// A private key and its public half.
#[derive(Clone)]
pub struct KeyPair {
    private: RsaPrivateKey,
    public: PublicKey,
}

impl KeyPair {
    /// Generate a fresh key with a `bits`-bit modulus.
    pub fn generate(bits: usize) -> Result<Self, AuthError> {
        let mut rng = rand::thread_rng();
        let private =
            RsaPrivateKey::new(&mut rng, bits).map_err(|e| AuthError::Crypto(e.to_string()))?;
        Ok(Self::from_private(private))
    }

    fn from_private(private: RsaPrivateKey) -> Self {
        let public = PublicKey(RsaPublicKey::from(&private));
        Self { private, public }
    }

    pub fn public_key(&self) -> &PublicKey {
        &self.public
    }

    /// Decrypt a ciphertext produced by this pair's public key.
    pub fn decrypt(&self, ciphertext: &[u8]) -> Result<Vec<u8>, AuthError> {
        self.private
            .decrypt(Oaep::new::<Sha256>(), ciphertext)
            .map_err(|e| AuthError::Crypto(e.to_string()))
    }

    pub fn to_pkcs8_der(&self) -> Result<Vec<u8>, AuthError> {
        self.private
            .to_pkcs8_der()
            .map(|doc| doc.as_bytes().to_vec())
            .map_err(|e| AuthError::InvalidKey(e.to_string()))
    }

    pub fn from_pkcs8_der(der: &[u8]) -> Result<Self, AuthError> {
        RsaPrivateKey::from_pkcs8_der(der)
            .map(Self::from_private)
            .map_err(|e| AuthError::InvalidKey(e.to_string()))
    }
}

impl fmt::Debug for KeyPair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KeyPair")
            .field("public", &self.public)
            .finish_non_exhaustive()
    }
}
