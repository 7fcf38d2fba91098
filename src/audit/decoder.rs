// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (c) 2025-2026 JR Morton

//! Offline audit-log decoder.
//!
//! Reverses the writer's framing for a `log-*.bin` file using the
//! `log.key` found beside it. Deliberately independent of the writer:
//! it shares only the key-normalization helper, so files from any writer
//! version whose key derivation lands on the same 32 bytes decode.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use aes::cipher::{block_padding::Pkcs7, BlockDecryptMut, KeyIvInit};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use zeroize::Zeroizing;

use super::keyfile::{self, KeyProtector, KEY_FILE_NAME, KEY_LEN};
use super::IV_LEN;

type Aes256CbcDec = cbc::Decryptor<aes::Aes256>;

/// Why a decode run failed. Any of these maps to exit code 1 in the CLI.
#[derive(Debug)]
pub enum DecodeError {
    /// No `log.key` next to the log file.
    MissingKey(PathBuf),
    /// The OS-scope protector refused to unwrap the key under this user.
    UnprotectFailed(String),
    /// Bad base64, truncated IV, or a ciphertext that does not decrypt.
    FormatError(String),
    /// Underlying I/O failure.
    Io(io::Error),
}

impl std::fmt::Display for DecodeError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DecodeError::MissingKey(path) => {
                write!(f, "key file not found: {}", path.display())
            }
            DecodeError::UnprotectFailed(reason) => {
                write!(f, "cannot unwrap log key under the current user: {}", reason)
            }
            DecodeError::FormatError(reason) => write!(f, "malformed log entry: {}", reason),
            DecodeError::Io(e) => write!(f, "io error: {}", e),
        }
    }
}

impl std::error::Error for DecodeError {}

impl From<io::Error> for DecodeError {
    fn from(e: io::Error) -> Self {
        DecodeError::Io(e)
    }
}

/// Load and unwrap the key co-located with `log_path`.
fn load_key(log_path: &Path, protector: &dyn KeyProtector) -> Result<Zeroizing<[u8; KEY_LEN]>, DecodeError> {
    let dir = log_path.parent().unwrap_or_else(|| Path::new("."));
    let key_path = dir.join(KEY_FILE_NAME);
    if !key_path.exists() {
        return Err(DecodeError::MissingKey(key_path));
    }
    let blob = fs::read(&key_path)?;
    let buffer = protector
        .unprotect(&blob)
        .map_err(|e| DecodeError::UnprotectFailed(e.to_string()))?;
    Ok(keyfile::normalize_key(&buffer))
}

fn decrypt_line(key: &[u8; KEY_LEN], line_no: usize, line: &str) -> Result<String, DecodeError> {
    let raw = BASE64
        .decode(line.trim())
        .map_err(|e| DecodeError::FormatError(format!("line {}: {}", line_no, e)))?;
    if raw.len() <= IV_LEN {
        return Err(DecodeError::FormatError(format!(
            "line {}: {} bytes is too short for an IV and ciphertext",
            line_no,
            raw.len()
        )));
    }
    let (iv, ciphertext) = raw.split_at(IV_LEN);
    let cipher = Aes256CbcDec::new_from_slices(key, iv)
        .map_err(|e| DecodeError::FormatError(format!("line {}: {}", line_no, e)))?;
    let plaintext = cipher
        .decrypt_padded_vec_mut::<Pkcs7>(ciphertext)
        .map_err(|_| DecodeError::FormatError(format!("line {}: decryption failed", line_no)))?;
    String::from_utf8(plaintext)
        .map_err(|_| DecodeError::FormatError(format!("line {}: plaintext is not UTF-8", line_no)))
}

/// Decode every entry of `log_path` back to its JSON text, in file order.
/// Empty lines (including the trailing one) are skipped.
pub fn decode_file(log_path: &Path, protector: &dyn KeyProtector) -> Result<Vec<String>, DecodeError> {
    let key = load_key(log_path, protector)?;
    let content = fs::read_to_string(log_path)?;
    let mut entries = Vec::new();
    for (idx, line) in content.lines().enumerate() {
        if line.trim().is_empty() {
            continue;
        }
        entries.push(decrypt_line(&key, idx + 1, line)?);
    }
    Ok(entries)
}

/// The fixed schema of `runtimeLoad` entries, for the structured variant.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuntimeLoadRecord {
    pub timestamp: DateTime<Utc>,
    pub cpu_percent: f64,
    pub memory_percent: f64,
    pub process_count: u32,
}

#[derive(Deserialize)]
struct RuntimeLoadLine {
    timestamp: DateTime<Utc>,
    event_type: String,
    cpu_percent: f64,
    memory_percent: f64,
    process_count: u32,
}

/// Decode only the `runtimeLoad` entries of a file. Entries that decrypt
/// but do not match the schema are skipped silently; framing errors are
/// still hard failures. Used by the report-archive exporter collaborator.
#[allow(dead_code)]
pub fn decode_runtime_loads(
    log_path: &Path,
    protector: &dyn KeyProtector,
) -> Result<Vec<RuntimeLoadRecord>, DecodeError> {
    let mut records = Vec::new();
    for entry in decode_file(log_path, protector)? {
        let Ok(parsed) = serde_json::from_str::<RuntimeLoadLine>(&entry) else {
            continue;
        };
        if parsed.event_type != "runtimeLoad" {
            continue;
        }
        records.push(RuntimeLoadRecord {
            timestamp: parsed.timestamp,
            cpu_percent: parsed.cpu_percent,
            memory_percent: parsed.memory_percent,
            process_count: parsed.process_count,
        });
    }
    Ok(records)
}

/// The newest `log-*.bin` in `dir`. Date-stamped names sort lexically.
pub fn newest_log_file(dir: &Path) -> Option<PathBuf> {
    let mut names: Vec<String> = fs::read_dir(dir)
        .ok()?
        .filter_map(|e| e.ok())
        .filter_map(|e| e.file_name().into_string().ok())
        .filter(|n| n.starts_with("log-") && n.ends_with(".bin"))
        .collect();
    names.sort();
    names.pop().map(|n| dir.join(n))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audit::events::{AuditEvent, AuditKind};
    use crate::audit::keyfile::MachineScopeProtector;
    use crate::audit::AuditLog;
    use std::io::Write;

    #[test]
    fn test_missing_key_is_a_hard_error() {
        let dir = tempfile::tempdir().unwrap();
        let log_path = dir.path().join("log-20260101.bin");
        fs::write(&log_path, "").unwrap();
        match decode_file(&log_path, &MachineScopeProtector) {
            Err(DecodeError::MissingKey(path)) => {
                assert!(path.ends_with(KEY_FILE_NAME));
            }
            other => panic!("expected MissingKey, got {:?}", other.map(|v| v.len())),
        }
    }

    #[test]
    fn test_garbage_line_is_a_format_error() {
        let dir = tempfile::tempdir().unwrap();
        let protector = MachineScopeProtector;
        // materialize a valid key file first
        keyfile::load_or_create(dir.path(), &protector).unwrap();
        let log_path = dir.path().join("log-20260101.bin");
        let mut f = fs::File::create(&log_path).unwrap();
        writeln!(f, "!!! not base64 !!!").unwrap();
        assert!(matches!(
            decode_file(&log_path, &protector),
            Err(DecodeError::FormatError(_))
        ));
    }

    #[test]
    fn test_truncated_frame_is_a_format_error() {
        let dir = tempfile::tempdir().unwrap();
        let protector = MachineScopeProtector;
        keyfile::load_or_create(dir.path(), &protector).unwrap();
        let log_path = dir.path().join("log-20260101.bin");
        // valid base64 of fewer than 17 bytes
        fs::write(&log_path, format!("{}\n", BASE64.encode([0u8; 8]))).unwrap();
        assert!(matches!(
            decode_file(&log_path, &protector),
            Err(DecodeError::FormatError(_))
        ));
    }

    #[test]
    fn test_newest_log_file_picks_latest_date() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("log-20250101.bin"), "").unwrap();
        fs::write(dir.path().join("log-20260301.bin"), "").unwrap();
        fs::write(dir.path().join("unrelated.txt"), "").unwrap();
        let newest = newest_log_file(dir.path()).unwrap();
        assert!(newest.ends_with("log-20260301.bin"));
    }

    #[tokio::test]
    async fn test_runtime_load_filter_skips_other_events() {
        let dir = tempfile::tempdir().unwrap();
        let protector = MachineScopeProtector;
        let log = AuditLog::open(dir.path(), &protector).unwrap();
        log.log(AuditKind::RuntimeLoad {
            cpu_percent: 12.5,
            memory_percent: 40.0,
            process_count: 180,
        });
        log.log(AuditKind::UiCommand { command: "refresh".into() });
        log.log_event(AuditEvent::now(AuditKind::RuntimeLoad {
            cpu_percent: 15.0,
            memory_percent: 41.0,
            process_count: 183,
        }));
        log.dispose().await;

        let file = newest_log_file(dir.path()).unwrap();
        let records = decode_runtime_loads(&file, &protector).unwrap();
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].process_count, 180);
        assert_eq!(records[1].cpu_percent, 15.0);
    }
}
