// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (c) 2025-2026 JR Morton

//! Secure audit log: append-only, line-framed, encrypted event sink.
//!
//! Producers enqueue serialized events without blocking; a single writer
//! task drains the queue and appends one line per event to the UTC-dated
//! `log-YYYYMMDD.bin` file. Each line is `base64(IV ‖ ciphertext)` where
//! the ciphertext is AES-256-CBC/PKCS#7 of the UTF-8 JSON under the
//! persisted 32-byte key (see [`keyfile`]).
//!
//! Failure policy: writer-side I/O and crypto errors are retried once and
//! then swallowed; a bad entry never poisons the loop and nothing is ever
//! re-raised to producers. A crash can lose the queued tail; entries that
//! reach the file are in producer order.

pub mod decoder;
pub mod events;
pub mod keyfile;

use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::Duration;

use aes::cipher::{block_padding::Pkcs7, BlockEncryptMut, KeyIvInit};
use anyhow::{Context, Result};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use chrono::Utc;
use rand::RngCore;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use zeroize::Zeroizing;

use events::{AuditEvent, AuditKind};
use keyfile::{KeyProtector, KEY_LEN};

type Aes256CbcEnc = cbc::Encryptor<aes::Aes256>;

/// AES block/IV size for the line framing.
pub const IV_LEN: usize = 16;

/// Producer queue depth. A full queue drops the entry rather than block.
const QUEUE_DEPTH: usize = 1024;

/// Empty-queue poll interval; bounds shutdown latency.
const WRITER_POLL: Duration = Duration::from_millis(100);

/// Bound on the drain wait during [`AuditLog::dispose`].
const DISPOSE_TIMEOUT: Duration = Duration::from_secs(2);

/// Handle to the encrypted audit stream. Cheap to share via `Arc`; owns
/// the writer task, the key material, and the open file handle.
pub struct AuditLog {
    tx: mpsc::Sender<String>,
    shutdown: watch::Sender<bool>,
    writer: Mutex<Option<JoinHandle<()>>>,
}

impl AuditLog {
    /// Run the key lifecycle for `log_dir` and start the writer task.
    /// Must be called from within a tokio runtime.
    pub fn open(log_dir: impl Into<PathBuf>, protector: &dyn KeyProtector) -> Result<Self> {
        let log_dir = log_dir.into();
        fs::create_dir_all(&log_dir)
            .with_context(|| format!("creating log directory {}", log_dir.display()))?;
        let key = keyfile::load_or_create(&log_dir, protector)?;
        let (tx, rx) = mpsc::channel(QUEUE_DEPTH);
        let (shutdown, shutdown_rx) = watch::channel(false);
        let handle = tokio::spawn(writer_loop(log_dir, key, rx, shutdown_rx));
        Ok(Self { tx, shutdown, writer: Mutex::new(Some(handle)) })
    }

    /// Enqueue an event stamped with the current time. Never blocks; a
    /// full queue or stopped writer drops the entry silently.
    pub fn log(&self, kind: AuditKind) {
        self.log_event(AuditEvent::now(kind));
    }

    /// Enqueue a pre-stamped event.
    pub fn log_event(&self, event: AuditEvent) {
        if let Ok(line) = serde_json::to_string(&event) {
            let _ = self.tx.try_send(line);
        }
    }

    /// Request writer drain and wait for it, bounded by two seconds. The
    /// key material lives in the writer task and is wiped when it exits.
    pub async fn dispose(&self) {
        let _ = self.shutdown.send(true);
        let handle = self.writer.lock().unwrap().take();
        if let Some(handle) = handle {
            let _ = tokio::time::timeout(DISPOSE_TIMEOUT, handle).await;
        }
    }
}

/// Frame one plaintext line: fresh random IV, CBC/PKCS7 encrypt, base64.
fn encrypt_line(key: &[u8; KEY_LEN], plaintext: &str) -> Result<String> {
    let mut iv = [0u8; IV_LEN];
    rand::thread_rng().fill_bytes(&mut iv);
    let cipher = Aes256CbcEnc::new_from_slices(key, &iv)
        .map_err(|e| anyhow::anyhow!("cipher init failed: {}", e))?;
    let ciphertext = cipher.encrypt_padded_vec_mut::<Pkcs7>(plaintext.as_bytes());
    let mut framed = Vec::with_capacity(IV_LEN + ciphertext.len());
    framed.extend_from_slice(&iv);
    framed.extend_from_slice(&ciphertext);
    Ok(BASE64.encode(framed))
}

/// The dated log file name for "now" in UTC.
fn current_file_name() -> String {
    format!("log-{}.bin", Utc::now().format("%Y%m%d"))
}

struct OpenFile {
    name: String,
    file: fs::File,
}

fn append_once(
    dir: &Path,
    key: &[u8; KEY_LEN],
    current: &mut Option<OpenFile>,
    line: &str,
) -> Result<()> {
    let name = current_file_name();
    let needs_roll = current.as_ref().map(|f| f.name != name).unwrap_or(true);
    if needs_roll {
        let file = fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(dir.join(&name))?;
        *current = Some(OpenFile { name, file });
    }
    let encoded = encrypt_line(key, line)?;
    let open = current.as_mut().expect("file opened above");
    open.file.write_all(encoded.as_bytes())?;
    open.file.write_all(b"\n")?;
    Ok(())
}

/// One retry, then the entry is dropped. The open file handle is discarded
/// on failure so the retry reopens from scratch.
fn append_entry(dir: &Path, key: &[u8; KEY_LEN], current: &mut Option<OpenFile>, line: &str) {
    for _ in 0..2 {
        match append_once(dir, key, current, line) {
            Ok(()) => return,
            Err(_) => *current = None,
        }
    }
}

async fn writer_loop(
    dir: PathBuf,
    key: Zeroizing<[u8; KEY_LEN]>,
    mut rx: mpsc::Receiver<String>,
    shutdown: watch::Receiver<bool>,
) {
    let mut current: Option<OpenFile> = None;
    loop {
        if *shutdown.borrow() {
            // Drain one pending entry so a dispose right after a log call
            // does not lose it, then leave.
            if let Ok(line) = rx.try_recv() {
                append_entry(&dir, &key, &mut current, &line);
            }
            break;
        }
        match tokio::time::timeout(WRITER_POLL, rx.recv()).await {
            Ok(Some(line)) => append_entry(&dir, &key, &mut current, &line),
            Ok(None) => break,
            Err(_) => {} // empty-queue poll; loop re-checks shutdown
        }
    }
    if let Some(open) = current.as_mut() {
        let _ = open.file.flush();
    }
    // `key` drops here and zeroizes.
}
