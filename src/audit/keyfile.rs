// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (c) 2025-2026 JR Morton

//! Log-key lifecycle and the data-protection seam.
//!
//! The audit stream is encrypted under a 32-byte key persisted as
//! `log.key` in the logging directory, wrapped by a [`KeyProtector`].
//! The default [`MachineScopeProtector`] is the Unix rendition of a
//! per-user data-protection primitive: AES-256-GCM under a key derived
//! from the machine identity and the current UID. Platform-native
//! wrapping (e.g. DPAPI) is an external collaborator implementing the
//! same trait.
//!
//! A `log.key` that unwraps to something other than 32 bytes is used via
//! SHA-256 derivation, deterministically on both the writer and decoder
//! sides, so older writers' files stay readable. A `log.key` that fails
//! to unwrap is preserved under a dated `.bak` name before a fresh key is
//! persisted; nothing is silently overwritten.

use std::fs;
use std::path::{Path, PathBuf};

use aes_gcm::aead::{Aead, KeyInit};
use aes_gcm::{Aes256Gcm, Nonce};
use anyhow::{Context, Result};
use chrono::Utc;
use rand::RngCore;
use sha2::{Digest, Sha256};
use zeroize::Zeroizing;

/// Key length of the audit stream cipher (AES-256).
pub const KEY_LEN: usize = 32;

/// Name of the wrapped key file, co-located with the log files.
pub const KEY_FILE_NAME: &str = "log.key";

const GCM_NONCE_LEN: usize = 12;

/// Wraps and unwraps the log key under an identity-bound scope.
pub trait KeyProtector: Send + Sync {
    fn protect(&self, secret: &[u8]) -> Result<Vec<u8>>;
    fn unprotect(&self, blob: &[u8]) -> Result<Vec<u8>>;
}

/// Default protector: AES-256-GCM under SHA-256(machine-id ‖ uid), with a
/// random 12-byte nonce prefixed to the wrapped blob.
pub struct MachineScopeProtector;

impl MachineScopeProtector {
    fn scope_key() -> Zeroizing<[u8; KEY_LEN]> {
        let machine_id = fs::read_to_string("/etc/machine-id")
            .or_else(|_| fs::read_to_string("/var/lib/dbus/machine-id"))
            .map(|s| s.trim().to_string())
            .unwrap_or_else(|_| "tidewatch-local".to_string());
        let uid = unsafe { libc::getuid() };
        let mut hasher = Sha256::new();
        hasher.update(machine_id.as_bytes());
        hasher.update(uid.to_le_bytes());
        let mut key = [0u8; KEY_LEN];
        key.copy_from_slice(&hasher.finalize());
        Zeroizing::new(key)
    }
}

impl KeyProtector for MachineScopeProtector {
    fn protect(&self, secret: &[u8]) -> Result<Vec<u8>> {
        let scope = Self::scope_key();
        let cipher = Aes256Gcm::new_from_slice(scope.as_ref())
            .map_err(|e| anyhow::anyhow!("cipher init failed: {}", e))?;
        let mut nonce_bytes = [0u8; GCM_NONCE_LEN];
        rand::thread_rng().fill_bytes(&mut nonce_bytes);
        let nonce = Nonce::from_slice(&nonce_bytes);
        let ciphertext = cipher
            .encrypt(nonce, secret)
            .map_err(|e| anyhow::anyhow!("key wrap failed: {}", e))?;
        let mut blob = Vec::with_capacity(GCM_NONCE_LEN + ciphertext.len());
        blob.extend_from_slice(&nonce_bytes);
        blob.extend_from_slice(&ciphertext);
        Ok(blob)
    }

    fn unprotect(&self, blob: &[u8]) -> Result<Vec<u8>> {
        if blob.len() <= GCM_NONCE_LEN {
            anyhow::bail!("wrapped key blob too short ({} bytes)", blob.len());
        }
        let scope = Self::scope_key();
        let cipher = Aes256Gcm::new_from_slice(scope.as_ref())
            .map_err(|e| anyhow::anyhow!("cipher init failed: {}", e))?;
        let nonce = Nonce::from_slice(&blob[..GCM_NONCE_LEN]);
        cipher
            .decrypt(nonce, &blob[GCM_NONCE_LEN..])
            .map_err(|e| anyhow::anyhow!("key unwrap failed: {}", e))
    }
}

/// Coerce whatever the protector unwrapped into a usable cipher key:
/// exactly 32 bytes pass through, anything else derives via SHA-256.
pub fn normalize_key(buffer: &[u8]) -> Zeroizing<[u8; KEY_LEN]> {
    let mut key = [0u8; KEY_LEN];
    if buffer.len() == KEY_LEN {
        key.copy_from_slice(buffer);
    } else {
        key.copy_from_slice(&Sha256::digest(buffer));
    }
    Zeroizing::new(key)
}

fn fresh_key() -> Zeroizing<[u8; KEY_LEN]> {
    let mut key = [0u8; KEY_LEN];
    rand::thread_rng().fill_bytes(&mut key);
    Zeroizing::new(key)
}

/// Atomically persist a wrapped key: write a sibling temp file, rename it
/// into place, restrict it to the owning user.
fn persist_wrapped(path: &Path, wrapped: &[u8]) -> Result<()> {
    let tmp = path.with_extension("key.tmp");
    fs::write(&tmp, wrapped).with_context(|| format!("writing {}", tmp.display()))?;
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let _ = fs::set_permissions(&tmp, fs::Permissions::from_mode(0o600));
    }
    fs::rename(&tmp, path).with_context(|| format!("renaming into {}", path.display()))?;
    Ok(())
}

/// Move an unreadable key file aside without clobbering earlier backups.
fn preserve_unreadable(path: &Path) -> Option<PathBuf> {
    let stamp = Utc::now().format("%Y%m%d");
    for attempt in 0..10 {
        let candidate = if attempt == 0 {
            path.with_file_name(format!("{}.{}.bak", KEY_FILE_NAME, stamp))
        } else {
            path.with_file_name(format!("{}.{}.{}.bak", KEY_FILE_NAME, stamp, attempt))
        };
        if !candidate.exists() && fs::rename(path, &candidate).is_ok() {
            return Some(candidate);
        }
    }
    None
}

/// Run the full key lifecycle for the writer side. Always returns a usable
/// key; the only hard failure is an unwritable logging directory on first
/// creation.
pub fn load_or_create(log_dir: &Path, protector: &dyn KeyProtector) -> Result<Zeroizing<[u8; KEY_LEN]>> {
    let path = log_dir.join(KEY_FILE_NAME);

    if !path.exists() {
        let key = fresh_key();
        let wrapped = protector.protect(key.as_ref())?;
        persist_wrapped(&path, &wrapped)?;
        return Ok(key);
    }

    let blob = fs::read(&path).with_context(|| format!("reading {}", path.display()))?;
    match protector.unprotect(&blob) {
        Ok(buffer) => Ok(normalize_key(&buffer)),
        Err(e) => {
            // Unwrap refused under this identity. Keep the old file so its
            // logs stay recoverable, rotate to a fresh key, carry on with
            // the in-memory key even if persistence fails too.
            tracing::warn!("Audit key unwrap failed ({}); rotating to a fresh key", e);
            if let Some(backup) = preserve_unreadable(&path) {
                tracing::warn!("Previous key preserved at {}", backup.display());
            }
            let key = fresh_key();
            match protector.protect(key.as_ref()).and_then(|w| persist_wrapped(&path, &w)) {
                Ok(()) => {}
                Err(persist_err) => {
                    tracing::error!("Could not persist rotated audit key: {}", persist_err)
                }
            }
            Ok(key)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_protect_unprotect_round_trip() {
        let protector = MachineScopeProtector;
        let secret = [7u8; KEY_LEN];
        let wrapped = protector.protect(&secret).unwrap();
        assert_ne!(&wrapped[GCM_NONCE_LEN..], &secret[..]);
        let unwrapped = protector.unprotect(&wrapped).unwrap();
        assert_eq!(unwrapped, secret);
    }

    #[test]
    fn test_unprotect_rejects_tampered_blob() {
        let protector = MachineScopeProtector;
        let mut wrapped = protector.protect(&[9u8; KEY_LEN]).unwrap();
        let last = wrapped.len() - 1;
        wrapped[last] ^= 0xff;
        assert!(protector.unprotect(&wrapped).is_err());
    }

    #[test]
    fn test_normalize_key_passthrough() {
        let exact = [3u8; KEY_LEN];
        assert_eq!(normalize_key(&exact).as_ref(), &exact);
    }

    #[test]
    fn test_normalize_key_derives_odd_lengths() {
        let short = b"not thirty-two bytes";
        let derived = normalize_key(short);
        assert_eq!(derived.as_ref(), Sha256::digest(short).as_slice());
    }

    #[test]
    fn test_load_or_create_is_stable() {
        let dir = tempfile::tempdir().unwrap();
        let protector = MachineScopeProtector;
        let first = load_or_create(dir.path(), &protector).unwrap();
        let second = load_or_create(dir.path(), &protector).unwrap();
        assert_eq!(first.as_ref(), second.as_ref());
    }

    #[test]
    fn test_unreadable_key_is_preserved_not_overwritten() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(KEY_FILE_NAME);
        fs::write(&path, b"garbage that will not unwrap").unwrap();
        let protector = MachineScopeProtector;
        let key = load_or_create(dir.path(), &protector).unwrap();
        assert_eq!(key.len(), KEY_LEN);
        let backups: Vec<_> = fs::read_dir(dir.path())
            .unwrap()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_name().to_string_lossy().ends_with(".bak"))
            .collect();
        assert_eq!(backups.len(), 1);
        // and the rotated key is readable on the next start
        let again = load_or_create(dir.path(), &protector).unwrap();
        assert_eq!(key.as_ref(), again.as_ref());
    }
}
