use std::fs;
use std::path::{Path, PathBuf};

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use chacha20poly1305::aead::{Aead, KeyInit};
use chacha20poly1305::{ChaCha20Poly1305, Key, Nonce};
use rand::RngCore;
use tracing::warn;

use crate::error::{Error, Result};

const NONCE_SIZE: usize = 12;
const TAG_SIZE: usize = 16;
const KEY_SIZE: usize = 32;
const ENC_PREFIX: &str = "enc:";

pub type SecretKey = [u8; KEY_SIZE];

pub fn generate_key() -> SecretKey {
    let mut key = [0u8; KEY_SIZE];
    rand::thread_rng().fill_bytes(&mut key);
    key
}

/// Load the 32-byte key at `path`, generating and persisting a new one
/// (mode 0600) if it doesn't exist yet.
pub fn load_or_create_key(path: &Path) -> Result<SecretKey> {
    if path.exists() {
        let bytes = fs::read(path)?;
        if bytes.len() != KEY_SIZE {
            return Err(Error::CryptoError("Key file has invalid size".to_string()));
        }
        let mut key = [0u8; KEY_SIZE];
        key.copy_from_slice(&bytes);
        return Ok(key);
    }

    let key = generate_key();
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    fs::write(path, key)?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        fs::set_permissions(path, fs::Permissions::from_mode(0o600))?;
    }

    Ok(key)
}

pub fn is_prefixed_encrypted(value: &str) -> bool {
    value.starts_with(ENC_PREFIX)
}

/// Encrypt `plaintext` under `key`, returning a base64 blob of
/// `nonce || ciphertext || tag`.
pub fn encrypt_secret(key: &SecretKey, plaintext: &str) -> Result<String> {
    let cipher = ChaCha20Poly1305::new(Key::from_slice(key));
    let mut nonce_bytes = [0u8; NONCE_SIZE];
    rand::thread_rng().fill_bytes(&mut nonce_bytes);
    let nonce = Nonce::from_slice(&nonce_bytes);

    let ciphertext = cipher
        .encrypt(nonce, plaintext.as_bytes())
        .map_err(|_| Error::CryptoError("Encrypt failed".to_string()))?;

    let mut blob = Vec::with_capacity(NONCE_SIZE + ciphertext.len());
    blob.extend_from_slice(&nonce_bytes);
    blob.extend_from_slice(&ciphertext);

    Ok(BASE64.encode(blob))
}

/// Decrypt a base64 `nonce || ciphertext || tag` blob produced by
/// `encrypt_secret`.
pub fn decrypt_secret(key: &SecretKey, ciphertext: &str) -> Result<String> {
    let decoded = BASE64
        .decode(ciphertext)
        .map_err(|e| Error::CryptoError(format!("Invalid base64 input: {e}")))?;

    if decoded.len() < NONCE_SIZE + TAG_SIZE {
        return Err(Error::CryptoError("Ciphertext too short".to_string()));
    }

    let (nonce_bytes, payload) = decoded.split_at(NONCE_SIZE);
    let nonce = Nonce::from_slice(nonce_bytes);
    let cipher = ChaCha20Poly1305::new(Key::from_slice(key));

    let plaintext = cipher
        .decrypt(nonce, payload)
        .map_err(|_| Error::CryptoError("Decryption failed".to_string()))?;

    String::from_utf8(plaintext).map_err(|e| Error::CryptoError(format!("Invalid UTF-8: {e}")))
}

fn maybe_encrypt(value: &mut Option<String>, key: &SecretKey) {
    let Some(inner) = value.as_ref() else {
        return;
    };
    if inner.is_empty() || is_prefixed_encrypted(inner) {
        return;
    }
    match encrypt_secret(key, inner) {
        Ok(encrypted) => *value = Some(format!("{ENC_PREFIX}{encrypted}")),
        Err(e) => warn!(error = %e, "failed to encrypt config secret, leaving as-is"),
    }
}

fn maybe_decrypt(value: &mut Option<String>, key: &SecretKey) {
    let Some(inner) = value.as_ref() else {
        return;
    };
    if !is_prefixed_encrypted(inner) {
        return;
    }
    let payload = &inner[ENC_PREFIX.len()..];
    match decrypt_secret(key, payload) {
        Ok(decrypted) => *value = Some(decrypted),
        Err(e) => warn!(error = %e, "failed to decrypt config secret, leaving as-is"),
    }
}

fn maybe_encrypt_raw(value: &mut String, key: &SecretKey) {
    if value.is_empty() || is_prefixed_encrypted(value) {
        return;
    }
    match encrypt_secret(key, value) {
        Ok(encrypted) => *value = format!("{ENC_PREFIX}{encrypted}"),
        Err(e) => warn!(error = %e, "failed to encrypt config secret, leaving as-is"),
    }
}

fn maybe_decrypt_raw(value: &mut String, key: &SecretKey) {
    if !is_prefixed_encrypted(value) {
        return;
    }
    let payload = value[ENC_PREFIX.len()..].to_string();
    match decrypt_secret(key, &payload) {
        Ok(decrypted) => *value = decrypted,
        Err(e) => warn!(error = %e, "failed to decrypt config secret, leaving as-is"),
    }
}

/// Secret-bearing fields walked by `encrypt_config_secrets` /
/// `decrypt_config_secrets`. Mirrors the reference's field list exactly:
/// top-level api key, composio api key, and each channel's bearer
/// token/secret.
pub struct ConfigSecrets<'a> {
    pub api_key: &'a mut Option<String>,
    pub composio_api_key: &'a mut Option<String>,
    pub telegram_bot_token: Option<&'a mut String>,
    pub discord_bot_token: Option<&'a mut String>,
    pub slack_bot_token: Option<&'a mut String>,
    pub matrix_access_token: Option<&'a mut String>,
    pub whatsapp_access_token: Option<&'a mut String>,
    pub webhook_secret: Option<&'a mut String>,
}

pub fn encrypt_config_secrets(secrets: ConfigSecrets<'_>, key: &SecretKey) {
    maybe_encrypt(secrets.api_key, key);
    maybe_encrypt(secrets.composio_api_key, key);
    if let Some(v) = secrets.telegram_bot_token {
        maybe_encrypt_raw(v, key);
    }
    if let Some(v) = secrets.discord_bot_token {
        maybe_encrypt_raw(v, key);
    }
    if let Some(v) = secrets.slack_bot_token {
        maybe_encrypt_raw(v, key);
    }
    if let Some(v) = secrets.matrix_access_token {
        maybe_encrypt_raw(v, key);
    }
    if let Some(v) = secrets.whatsapp_access_token {
        maybe_encrypt_raw(v, key);
    }
    if let Some(v) = secrets.webhook_secret {
        maybe_encrypt_raw(v, key);
    }
}

pub fn decrypt_config_secrets(secrets: ConfigSecrets<'_>, key: &SecretKey) {
    maybe_decrypt(secrets.api_key, key);
    maybe_decrypt(secrets.composio_api_key, key);
    if let Some(v) = secrets.telegram_bot_token {
        maybe_decrypt_raw(v, key);
    }
    if let Some(v) = secrets.discord_bot_token {
        maybe_decrypt_raw(v, key);
    }
    if let Some(v) = secrets.slack_bot_token {
        maybe_decrypt_raw(v, key);
    }
    if let Some(v) = secrets.matrix_access_token {
        maybe_decrypt_raw(v, key);
    }
    if let Some(v) = secrets.whatsapp_access_token {
        maybe_decrypt_raw(v, key);
    }
    if let Some(v) = secrets.webhook_secret {
        maybe_decrypt_raw(v, key);
    }
}

pub fn default_key_path(config_dir: &Path) -> PathBuf {
    config_dir.join("secrets.key")
}
