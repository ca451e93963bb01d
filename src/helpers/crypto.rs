//! Envelope encryption for credential values.
//!
//! Every credential gets its own random AES-256-GCM data key. The data key is
//! wrapped by the externally supplied master key and stored next to the
//! ciphertext, so rotating the master key never requires touching plaintext.
//!
//! # Storage Format
//! `{scheme_version}:{nonce}:{ciphertext}` where
//! - `nonce` is the Base64 96-bit nonce used for the credential payload
//! - `ciphertext` is Base64 of `[wrap nonce (12)][wrapped data key (48)][payload ciphertext]`

use crate::constants::ENV_MASTER_KEY;
use crate::error::{Error, Result};
use aes_gcm::{
    Aes256Gcm, Key,
    aead::{Aead, AeadCore, KeyInit, Nonce, OsRng, Payload},
};
use base64::{Engine as _, engine::general_purpose::STANDARD as BASE64};

/// Current ciphertext scheme tag
pub const SCHEME_VERSION: &str = "v1";

const KEY_LEN: usize = 32;
const NONCE_LEN: usize = 12;
const TAG_LEN: usize = 16;
const WRAPPED_KEY_LEN: usize = KEY_LEN + TAG_LEN;

/// Master key used to wrap per-credential data keys.
///
/// Never printed: the `Debug` impl is redacted.
#[derive(Clone)]
pub struct MasterKey([u8; KEY_LEN]);

impl MasterKey {
    pub fn from_bytes(bytes: [u8; KEY_LEN]) -> Self {
        Self(bytes)
    }

    /// Generate a fresh random master key
    pub fn generate() -> Self {
        let key = Aes256Gcm::generate_key(OsRng);
        let mut bytes = [0u8; KEY_LEN];
        bytes.copy_from_slice(key.as_slice());
        Self(bytes)
    }

    /// Decode a Base64 encoded 32-byte key
    pub fn from_base64(encoded: &str) -> Result<Self> {
        let data = BASE64
            .decode(encoded.trim())
            .map_err(|e| Error::encryption(format!("master key is not valid Base64: {e}")))?;
        let bytes: [u8; KEY_LEN] = data.try_into().map_err(|data: Vec<u8>| {
            Error::encryption(format!(
                "master key must be {KEY_LEN} bytes, got {}",
                data.len()
            ))
        })?;
        Ok(Self(bytes))
    }

    /// Resolve a master-key reference.
    ///
    /// Supported forms:
    /// - `env:NAME` reads Base64 from environment variable `NAME`
    /// - `file:/path/to/key` reads Base64 from a file
    /// - `base64:<key>` inline key (tests and local development)
    ///
    /// An empty reference falls back to the `SUITE_MASTER_KEY` environment variable.
    pub fn resolve(reference: &str) -> Result<Self> {
        let reference = reference.trim();
        if reference.is_empty() {
            return Self::from_env(ENV_MASTER_KEY);
        }

        match reference.split_once(':') {
            Some(("env", name)) => Self::from_env(name),
            Some(("file", path)) => {
                let content = std::fs::read_to_string(path).map_err(|e| {
                    Error::encryption(format!("cannot read master key file {path}: {e}"))
                })?;
                Self::from_base64(&content)
            }
            Some(("base64", encoded)) => Self::from_base64(encoded),
            _ => Err(Error::encryption(
                "master key reference must start with env:, file: or base64:",
            )),
        }
    }

    fn from_env(name: &str) -> Result<Self> {
        let value = std::env::var(name)
            .map_err(|_| Error::encryption(format!("master key variable {name} is not set")))?;
        Self::from_base64(&value)
    }

    fn cipher(&self) -> Aes256Gcm {
        Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(&self.0))
    }
}

impl std::fmt::Debug for MasterKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("MasterKey(<redacted>)")
    }
}

/// Encrypts `plain_text` under a fresh data key wrapped by `master`.
///
/// `aad` binds the ciphertext to its slot (account and credential name); the
/// same `aad` must be supplied to [`open`].
pub fn seal(master: &MasterKey, plain_text: &str, aad: &[u8]) -> Result<String> {
    let data_key = Aes256Gcm::generate_key(OsRng);
    let data_cipher = Aes256Gcm::new(&data_key);

    let nonce = Aes256Gcm::generate_nonce(&mut OsRng);
    let ciphertext = data_cipher
        .encrypt(
            &nonce,
            Payload {
                msg: plain_text.as_bytes(),
                aad,
            },
        )
        .map_err(|e| Error::encryption(format!("encryption failed: {e}")))?;

    let wrap_nonce = Aes256Gcm::generate_nonce(&mut OsRng);
    let wrapped_key = master
        .cipher()
        .encrypt(&wrap_nonce, data_key.as_slice())
        .map_err(|e| Error::encryption(format!("key wrapping failed: {e}")))?;

    let mut combined = Vec::with_capacity(NONCE_LEN + WRAPPED_KEY_LEN + ciphertext.len());
    combined.extend_from_slice(&wrap_nonce);
    combined.extend_from_slice(&wrapped_key);
    combined.extend_from_slice(&ciphertext);

    Ok(format!(
        "{SCHEME_VERSION}:{}:{}",
        BASE64.encode(nonce),
        BASE64.encode(combined)
    ))
}

/// Decrypts a value produced by [`seal`].
pub fn open(master: &MasterKey, sealed: &str, aad: &[u8]) -> Result<String> {
    let mut parts = sealed.splitn(3, ':');
    let (Some(scheme), Some(nonce_b64), Some(body_b64)) = (parts.next(), parts.next(), parts.next())
    else {
        return Err(Error::encryption("malformed ciphertext"));
    };
    if scheme != SCHEME_VERSION {
        return Err(Error::encryption(format!(
            "unsupported ciphertext scheme: {scheme}"
        )));
    }

    let nonce_bytes = BASE64
        .decode(nonce_b64)
        .map_err(|e| Error::encryption(format!("Base64 decode failed: {e}")))?;
    let body = BASE64
        .decode(body_b64)
        .map_err(|e| Error::encryption(format!("Base64 decode failed: {e}")))?;

    if nonce_bytes.len() != NONCE_LEN || body.len() < NONCE_LEN + WRAPPED_KEY_LEN + TAG_LEN {
        return Err(Error::encryption("ciphertext too short"));
    }

    let (wrap_nonce, rest) = body.split_at(NONCE_LEN);
    let (wrapped_key, ciphertext) = rest.split_at(WRAPPED_KEY_LEN);

    let data_key = master
        .cipher()
        .decrypt(Nonce::<Aes256Gcm>::from_slice(wrap_nonce), wrapped_key)
        .map_err(|_| Error::encryption("data key unwrap failed (wrong master key?)"))?;
    if data_key.len() != KEY_LEN {
        return Err(Error::encryption("unwrapped data key has wrong length"));
    }

    let data_cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(&data_key));
    let plaintext = data_cipher
        .decrypt(
            Nonce::<Aes256Gcm>::from_slice(&nonce_bytes),
            Payload {
                msg: ciphertext,
                aad,
            },
        )
        .map_err(|_| Error::encryption("decryption failed"))?;

    String::from_utf8(plaintext)
        .map_err(|e| Error::encryption(format!("UTF-8 decode failed: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_seal_open() {
        let master = MasterKey::generate();
        let sealed = seal(&master, "abc123", b"acc:api_key").expect("seal");
        assert!(sealed.starts_with("v1:"));
        assert!(!sealed.contains("abc123"));
        let opened = open(&master, &sealed, b"acc:api_key").expect("open");
        assert_eq!(opened, "abc123");
    }

    #[test]
    fn test_seal_produces_different_ciphertext() {
        let master = MasterKey::generate();
        let a = seal(&master, "same", b"").expect("seal");
        let b = seal(&master, "same", b"").expect("seal");
        assert_ne!(a, b);
    }

    #[test]
    fn test_open_with_wrong_master_fails() {
        let sealed = seal(&MasterKey::generate(), "secret", b"").expect("seal");
        let err = open(&MasterKey::generate(), &sealed, b"").unwrap_err();
        assert!(matches!(err, Error::Encryption { .. }));
    }

    #[test]
    fn test_open_with_wrong_aad_fails() {
        let master = MasterKey::generate();
        let sealed = seal(&master, "secret", b"acc-1:token").expect("seal");
        assert!(open(&master, &sealed, b"acc-2:token").is_err());
    }

    #[test]
    fn test_open_malformed() {
        let master = MasterKey::generate();
        assert!(open(&master, "not-a-ciphertext", b"").is_err());
        assert!(open(&master, "v2:AAAA:AAAA", b"").is_err());
        assert!(open(&master, "v1:AQIDBA==:AQIDBA==", b"").is_err());
    }

    #[test]
    fn test_resolve_inline_and_debug_redacted() {
        let encoded = BASE64.encode([7u8; 32]);
        let key = MasterKey::resolve(&format!("base64:{encoded}")).expect("resolve");
        assert_eq!(format!("{key:?}"), "MasterKey(<redacted>)");
        assert!(MasterKey::resolve("base64:AQID").is_err());
        assert!(MasterKey::resolve("vault:whatever").is_err());
    }

    #[test]
    fn test_resolve_file() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("master.key");
        std::fs::write(&path, BASE64.encode([1u8; 32])).expect("write");
        let reference = format!("file:{}", path.display());
        assert!(MasterKey::resolve(&reference).is_ok());
    }
}
