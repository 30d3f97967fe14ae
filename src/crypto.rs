//! Cryptographic services: ML-KEM key encapsulation and the AES-256-CBC
//! session cipher.
//!
//! The KEM is reached through [`KemProvider`] so the session layer only sees
//! byte strings of fixed, algorithm-dependent size. The session cipher works
//! on a [`SessionKey`] and always prepends a fresh random IV to its output:
//!
//! ```text
//! IV (16 bytes) || AES-256-CBC(key, IV, PKCS#7(plaintext))
//! ```

use crate::QstpError;
use cbc::cipher::{block_padding::Pkcs7, BlockDecryptMut, BlockEncryptMut, KeyIvInit};
use pqcrypto_traits::kem::{Ciphertext as _, PublicKey as _, SecretKey as _, SharedSecret as _};
use rand::{rngs::OsRng, RngCore};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use zeroize::{Zeroize, ZeroizeOnDrop, Zeroizing};

/// Length of the symmetric session key (AES-256)
pub const SESSION_KEY_LEN: usize = 32;

/// Length of the CBC initialization vector prepended to every ciphertext
pub const IV_LEN: usize = 16;

const BLOCK_LEN: usize = 16;

type Aes256CbcEnc = cbc::Encryptor<aes::Aes256>;
type Aes256CbcDec = cbc::Decryptor<aes::Aes256>;

/// Shared secret of one connection. Wiped from memory on drop.
#[derive(Zeroize, ZeroizeOnDrop)]
pub struct SessionKey([u8; SESSION_KEY_LEN]);

impl SessionKey {
    pub fn from_slice(bytes: &[u8]) -> Result<Self, QstpError> {
        let key: [u8; SESSION_KEY_LEN] = bytes.try_into().map_err(|_| {
            QstpError::Handshake(format!(
                "shared secret is {} bytes, expected {}",
                bytes.len(),
                SESSION_KEY_LEN
            ))
        })?;
        Ok(Self(key))
    }

    pub fn as_bytes(&self) -> &[u8; SESSION_KEY_LEN] {
        &self.0
    }
}

impl fmt::Debug for SessionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("SessionKey(..)")
    }
}

/// Freshly generated KEM keypair; the secret half is wiped on drop.
pub struct KemKeypair {
    pub public_key: Vec<u8>,
    pub secret_key: Zeroizing<Vec<u8>>,
}

/// Key encapsulation mechanism used by the session handshake.
pub trait KemProvider: Send + Sync {
    /// Size of the public key the initiator sends
    fn public_key_len(&self) -> usize;

    /// Size of the ciphertext the responder sends back
    fn ciphertext_len(&self) -> usize;

    fn generate_keypair(&self) -> KemKeypair;

    /// Returns `(ciphertext, shared_secret)`
    fn encapsulate(&self, public_key: &[u8]) -> Result<(Vec<u8>, SessionKey), QstpError>;

    fn decapsulate(&self, ciphertext: &[u8], secret_key: &[u8]) -> Result<SessionKey, QstpError>;
}

/// ML-KEM parameter sets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum KemAlgorithm {
    /// NIST security level 1 (default)
    #[default]
    #[serde(rename = "ML-KEM-512")]
    MlKem512,
    #[serde(rename = "ML-KEM-768")]
    MlKem768,
    #[serde(rename = "ML-KEM-1024")]
    MlKem1024,
}

impl KemAlgorithm {
    pub fn as_str(&self) -> &'static str {
        match self {
            KemAlgorithm::MlKem512 => "ML-KEM-512",
            KemAlgorithm::MlKem768 => "ML-KEM-768",
            KemAlgorithm::MlKem1024 => "ML-KEM-1024",
        }
    }
}

impl fmt::Display for KemAlgorithm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for KemAlgorithm {
    type Err = QstpError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "ML-KEM-512" | "MLKEM512" => Ok(KemAlgorithm::MlKem512),
            "ML-KEM-768" | "MLKEM768" => Ok(KemAlgorithm::MlKem768),
            "ML-KEM-1024" | "MLKEM1024" => Ok(KemAlgorithm::MlKem1024),
            _ => Err(QstpError::InvalidConfig(format!("unknown KEM algorithm {:?}", s))),
        }
    }
}

// Expands `$body` once per parameter set with `$kem` bound to that set's module.
macro_rules! with_mlkem {
    ($alg:expr, $kem:ident => $body:expr) => {
        match $alg {
            KemAlgorithm::MlKem512 => {
                use pqcrypto_mlkem::mlkem512 as $kem;
                $body
            }
            KemAlgorithm::MlKem768 => {
                use pqcrypto_mlkem::mlkem768 as $kem;
                $body
            }
            KemAlgorithm::MlKem1024 => {
                use pqcrypto_mlkem::mlkem1024 as $kem;
                $body
            }
        }
    };
}

impl KemProvider for KemAlgorithm {
    fn public_key_len(&self) -> usize {
        match self {
            KemAlgorithm::MlKem512 => 800,
            KemAlgorithm::MlKem768 => 1184,
            KemAlgorithm::MlKem1024 => 1568,
        }
    }

    fn ciphertext_len(&self) -> usize {
        match self {
            KemAlgorithm::MlKem512 => 768,
            KemAlgorithm::MlKem768 => 1088,
            KemAlgorithm::MlKem1024 => 1568,
        }
    }

    fn generate_keypair(&self) -> KemKeypair {
        with_mlkem!(self, kem => {
            let (public, secret) = kem::keypair();
            KemKeypair {
                public_key: public.as_bytes().to_vec(),
                secret_key: Zeroizing::new(secret.as_bytes().to_vec()),
            }
        })
    }

    fn encapsulate(&self, public_key: &[u8]) -> Result<(Vec<u8>, SessionKey), QstpError> {
        with_mlkem!(self, kem => {
            let public_key = kem::PublicKey::from_bytes(public_key)
                .map_err(|_| QstpError::Handshake("invalid KEM public key".into()))?;
            let (shared, ciphertext) = kem::encapsulate(&public_key);
            Ok((ciphertext.as_bytes().to_vec(), SessionKey::from_slice(shared.as_bytes())?))
        })
    }

    fn decapsulate(&self, ciphertext: &[u8], secret_key: &[u8]) -> Result<SessionKey, QstpError> {
        with_mlkem!(self, kem => {
            let secret_key = kem::SecretKey::from_bytes(secret_key)
                .map_err(|_| QstpError::Handshake("invalid KEM secret key".into()))?;
            let ciphertext = kem::Ciphertext::from_bytes(ciphertext)
                .map_err(|_| QstpError::Handshake("invalid KEM ciphertext".into()))?;
            let shared = kem::decapsulate(&ciphertext, &secret_key);
            SessionKey::from_slice(shared.as_bytes())
        })
    }
}

/// Encrypt one message under `key` with a fresh random IV.
pub fn encrypt(key: &SessionKey, plaintext: &[u8]) -> Result<Vec<u8>, QstpError> {
    let mut iv = [0u8; IV_LEN];
    OsRng.fill_bytes(&mut iv);

    let cipher = Aes256CbcEnc::new_from_slices(key.as_bytes(), &iv)
        .map_err(|e| QstpError::Crypto(format!("cipher init: {}", e)))?;
    let ciphertext = cipher.encrypt_padded_vec_mut::<Pkcs7>(plaintext);

    let mut out = Vec::with_capacity(IV_LEN + ciphertext.len());
    out.extend_from_slice(&iv);
    out.extend_from_slice(&ciphertext);
    Ok(out)
}

/// Decrypt an `IV || ciphertext` message produced by [`encrypt`].
pub fn decrypt(key: &SessionKey, data: &[u8]) -> Result<Vec<u8>, QstpError> {
    if data.len() < IV_LEN + BLOCK_LEN || (data.len() - IV_LEN) % BLOCK_LEN != 0 {
        return Err(QstpError::Crypto(format!(
            "ciphertext length {} is not IV plus whole blocks",
            data.len()
        )));
    }

    let (iv, ciphertext) = data.split_at(IV_LEN);
    let cipher = Aes256CbcDec::new_from_slices(key.as_bytes(), iv)
        .map_err(|e| QstpError::Crypto(format!("cipher init: {}", e)))?;

    cipher
        .decrypt_padded_vec_mut::<Pkcs7>(ciphertext)
        .map_err(|_| QstpError::Crypto("bad padding".into()))
}
