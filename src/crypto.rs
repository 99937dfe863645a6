//! Encryption boundary.
//!
//! Key generation, key exchange and the actual cipher belong to an external
//! key-management collaborator; the engine only ever calls `encrypt` and
//! `decrypt` with a key that is already available, and the relay never calls
//! either. The trait is the seam where a real implementation plugs in.

/// Symmetric envelope encryption for content and cursor payloads.
pub trait EnvelopeCipher: Send + Sync {
    fn encrypt(&self, plaintext: &[u8]) -> Vec<u8>;
    fn decrypt(&self, ciphertext: &[u8]) -> Result<Vec<u8>, CipherError>;
}

/// Decryption failure. One bad envelope must not take the session down, so
/// callers log and drop.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CipherError(pub String);

impl std::fmt::Display for CipherError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "decryption failed: {}", self.0)
    }
}

impl std::error::Error for CipherError {}

/// Identity cipher for development and tests without key material.
#[derive(Debug, Clone, Copy, Default)]
pub struct PlainCipher;

impl EnvelopeCipher for PlainCipher {
    fn encrypt(&self, plaintext: &[u8]) -> Vec<u8> {
        plaintext.to_vec()
    }

    fn decrypt(&self, ciphertext: &[u8]) -> Result<Vec<u8>, CipherError> {
        Ok(ciphertext.to_vec())
    }
}

/// Keyed toy cipher for tests: XOR stream plus a marker byte so that
/// garbage and wrong-key input fail decryption instead of producing junk
/// plaintext. Not secure and not meant to be.
#[derive(Debug, Clone)]
pub struct XorCipher {
    key: Vec<u8>,
}

const MARKER: u8 = 0xC7;

impl XorCipher {
    pub fn new(key: impl Into<Vec<u8>>) -> Self {
        let key = key.into();
        assert!(!key.is_empty(), "XorCipher key must be non-empty");
        Self { key }
    }

    fn stream(&self, data: &[u8]) -> Vec<u8> {
        data.iter()
            .zip(self.key.iter().cycle())
            .map(|(b, k)| b ^ k)
            .collect()
    }
}

impl EnvelopeCipher for XorCipher {
    fn encrypt(&self, plaintext: &[u8]) -> Vec<u8> {
        let mut out = Vec::with_capacity(plaintext.len() + 1);
        out.push(MARKER ^ self.key[0]);
        out.extend(self.stream(plaintext));
        out
    }

    fn decrypt(&self, ciphertext: &[u8]) -> Result<Vec<u8>, CipherError> {
        match ciphertext.split_first() {
            Some((first, rest)) if first ^ self.key[0] == MARKER => Ok(self.stream(rest)),
            Some(_) => Err(CipherError("marker mismatch".to_string())),
            None => Err(CipherError("empty ciphertext".to_string())),
        }
    }
}
