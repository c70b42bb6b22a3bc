//! Credential sealing.
//!
//! Cluster kubeconfigs are encrypted at rest with AES-256-GCM. The sealed
//! blob layout is `key_id (1) || nonce (12) || ciphertext`; the key id
//! lets a future key rotation decrypt old rows while sealing new ones
//! with the fresh key.

use std::fs;
use std::path::{Path, PathBuf};

use aes_gcm::aead::{Aead, KeyInit, OsRng};
use aes_gcm::{AeadCore, Aes256Gcm, Key, Nonce};
use base64::engine::general_purpose::STANDARD as B64;
use base64::Engine;
use log::info;

use shepherd_definitions::Error as DomainError;

use crate::Result;

const NONCE_LEN: usize = 12;
const KEY_LEN: usize = 32;
const CURRENT_KEY_ID: u8 = 1;

/// A loaded sealing key.
#[derive(Clone)]
pub struct SecretBox {
    key: [u8; KEY_LEN],
}

impl SecretBox {
    /// From the configured base64 key, or load/generate the persisted one
    /// under the state dir.
    pub fn from_config(configured: Option<&str>, state_dir: &str) -> Result<SecretBox> {
        let material = match configured {
            Some(b64) => B64
                .decode(b64)
                .map_err(|_| DomainError::Validation("ENCRYPTION_KEY is not valid base64".into()))?,
            None => load_or_generate(&Path::new(state_dir).join("encryption.key"), KEY_LEN)?,
        };
        let key: [u8; KEY_LEN] = material.as_slice().try_into().map_err(|_| {
            DomainError::Validation(format!("ENCRYPTION_KEY must be {} bytes", KEY_LEN))
        })?;
        Ok(SecretBox { key })
    }

    pub fn seal(&self, plaintext: &[u8]) -> Result<Vec<u8>> {
        let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(&self.key));
        let nonce = Aes256Gcm::generate_nonce(&mut OsRng);
        let ciphertext = cipher
            .encrypt(&nonce, plaintext)
            .map_err(|_| DomainError::Internal("credential sealing failed".into()))?;
        let mut out = Vec::with_capacity(1 + NONCE_LEN + ciphertext.len());
        out.push(CURRENT_KEY_ID);
        out.extend_from_slice(&nonce);
        out.extend_from_slice(&ciphertext);
        Ok(out)
    }

    pub fn open(&self, sealed: &[u8]) -> Result<Vec<u8>> {
        if sealed.len() < 1 + NONCE_LEN {
            return Err(DomainError::Internal("sealed blob too short".into()).into());
        }
        let key_id = sealed[0];
        if key_id != CURRENT_KEY_ID {
            return Err(DomainError::Internal(format!(
                "sealed with unknown key id {}",
                key_id
            ))
            .into());
        }
        let nonce = Nonce::from_slice(&sealed[1..1 + NONCE_LEN]);
        let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(&self.key));
        cipher
            .decrypt(nonce, &sealed[1 + NONCE_LEN..])
            .map_err(|_| DomainError::Internal("credential unsealing failed".into()).into())
    }
}

/// Load a persisted secret or generate and persist a fresh one with owner
/// only file permissions.
pub fn load_or_generate(path: &PathBuf, len: usize) -> Result<Vec<u8>> {
    if path.exists() {
        let b64 = fs::read_to_string(path)
            .map_err(|e| DomainError::Internal(format!("cannot read {}: {}", path.display(), e)))?;
        return B64
            .decode(b64.trim())
            .map_err(|_| DomainError::Internal(format!("corrupt key file {}", path.display())).into());
    }
    use rand::RngCore;
    let mut material = vec![0u8; len];
    rand::rngs::OsRng.fill_bytes(&mut material);
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .map_err(|e| DomainError::Internal(format!("cannot create state dir: {}", e)))?;
    }
    fs::write(path, B64.encode(&material))
        .map_err(|e| DomainError::Internal(format!("cannot persist key: {}", e)))?;
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let _ = fs::set_permissions(path, fs::Permissions::from_mode(0o600));
    }
    info!("generated new secret at {}", path.display());
    Ok(material)
}

/// The JWT signing secret: configured value or persisted random bytes.
pub fn session_secret(configured: Option<&str>, state_dir: &str) -> Result<Vec<u8>> {
    match configured {
        Some(s) => Ok(s.as_bytes().to_vec()),
        None => load_or_generate(&Path::new(state_dir).join("session.secret"), 48),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_box() -> SecretBox {
        SecretBox { key: [7u8; KEY_LEN] }
    }

    #[test]
    fn seal_open_round_trip() {
        let sb = test_box();
        let sealed = sb.seal(b"apiVersion: v1\nkind: Config").unwrap();
        assert_ne!(&sealed[1 + NONCE_LEN..], b"apiVersion: v1\nkind: Config");
        let opened = sb.open(&sealed).unwrap();
        assert_eq!(opened, b"apiVersion: v1\nkind: Config");
    }

    #[test]
    fn tampered_blob_fails_closed() {
        let sb = test_box();
        let mut sealed = sb.seal(b"secret").unwrap();
        let last = sealed.len() - 1;
        sealed[last] ^= 0xff;
        assert!(sb.open(&sealed).is_err());
    }

    #[test]
    fn nonces_differ_between_seals() {
        let sb = test_box();
        let a = sb.seal(b"same").unwrap();
        let b = sb.seal(b"same").unwrap();
        assert_ne!(a, b);
    }
}
