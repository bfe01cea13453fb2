//! Chat encryption for the CLI: ChaCha20-Poly1305 with a key derived from
//! the session token.

use chacha20poly1305::aead::{Aead, KeyInit, Payload};
use chacha20poly1305::{ChaCha20Poly1305, Nonce};
use hkdf::Hkdf;
use parley_core::error::{CipherError, DecryptionError};
use parley_core::relay::Cipher;
use rand::RngCore;
use sha2::Sha256;

const HKDF_SALT: &[u8] = b"parley:chat";
const HKDF_INFO_AEAD: &[u8] = b"parley:chat:aead:v1";
const NONCE_LEN: usize = 12;

/// Output layout is `nonce || ciphertext`. The session token is bound as
/// associated data.
#[derive(Debug, Default)]
pub struct TokenCipher;

fn derive_key(session_token: &str) -> Result<[u8; 32], String> {
    let hkdf = Hkdf::<Sha256>::new(Some(HKDF_SALT), session_token.as_bytes());
    let mut key = [0u8; 32];
    hkdf.expand(HKDF_INFO_AEAD, &mut key)
        .map_err(|err| format!("hkdf expand failed: {err}"))?;
    Ok(key)
}

impl Cipher for TokenCipher {
    fn encrypt(&self, session_token: &str, plaintext: &[u8]) -> Result<Vec<u8>, CipherError> {
        let key = derive_key(session_token).map_err(CipherError)?;
        let cipher = ChaCha20Poly1305::new_from_slice(&key)
            .map_err(|err| CipherError(format!("invalid key: {err}")))?;
        let mut nonce_bytes = [0u8; NONCE_LEN];
        rand::rngs::OsRng.fill_bytes(&mut nonce_bytes);
        let sealed = cipher
            .encrypt(
                Nonce::from_slice(&nonce_bytes),
                Payload {
                    msg: plaintext,
                    aad: session_token.as_bytes(),
                },
            )
            .map_err(|err| CipherError(format!("encrypt failed: {err}")))?;
        let mut out = Vec::with_capacity(NONCE_LEN + sealed.len());
        out.extend_from_slice(&nonce_bytes);
        out.extend_from_slice(&sealed);
        Ok(out)
    }

    fn decrypt(&self, session_token: &str, ciphertext: &[u8]) -> Result<Vec<u8>, DecryptionError> {
        if ciphertext.len() < NONCE_LEN {
            return Err(DecryptionError("ciphertext too short".into()));
        }
        let (nonce, sealed) = ciphertext.split_at(NONCE_LEN);
        let key = derive_key(session_token).map_err(DecryptionError)?;
        let cipher = ChaCha20Poly1305::new_from_slice(&key)
            .map_err(|err| DecryptionError(format!("invalid key: {err}")))?;
        cipher
            .decrypt(
                Nonce::from_slice(nonce),
                Payload {
                    msg: sealed,
                    aad: session_token.as_bytes(),
                },
            )
            .map_err(|err| DecryptionError(format!("decrypt failed: {err}")))
    }
}
