// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (c) 2025-2026 JR Morton

//! File-integrity checker.
//!
//! Baselines SHA-256 digests of the configured protected files on the
//! first pass, then re-verifies every `integrity.verification_interval`.
//! A changed digest or a file that stops being readable raises an
//! `integrityViolation` audit event. The baseline then follows the new
//! state so one tampering event is reported once, not every cycle.

use std::collections::HashMap;
use std::fs;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use sha2::{Digest, Sha256};
use tokio::sync::watch;

use crate::audit::events::AuditKind;
use crate::audit::AuditLog;
use crate::config::IntegrityConfig;

/// Observed state of one protected file.
#[derive(Debug, Clone, PartialEq, Eq)]
enum FileState {
    Present(String), // hex digest
    Unreadable,
}

pub struct IntegrityChecker {
    config: IntegrityConfig,
    audit: Arc<AuditLog>,
    baseline: Mutex<HashMap<String, FileState>>,
}

impl IntegrityChecker {
    pub fn new(config: IntegrityConfig, audit: Arc<AuditLog>) -> Self {
        Self { config, audit, baseline: Mutex::new(HashMap::new()) }
    }

    pub async fn run(self: Arc<Self>, mut cancel: watch::Receiver<bool>) -> anyhow::Result<()> {
        let interval = Duration::from_secs(self.config.verification_interval);
        loop {
            if *cancel.borrow() {
                return Ok(());
            }
            self.verify_all();
            if super::idle(&mut cancel, interval).await {
                return Ok(());
            }
        }
    }

    fn observe(path: &str) -> FileState {
        match fs::read(path) {
            Ok(content) => FileState::Present(hex::encode(Sha256::digest(&content))),
            Err(_) => FileState::Unreadable,
        }
    }

    /// Verify every protected file against its baseline.
    pub fn verify_all(&self) {
        for path in &self.config.protected_files {
            let current = Self::observe(path);
            let previous = {
                let mut baseline = self.baseline.lock().unwrap();
                baseline.insert(path.clone(), current.clone())
            };
            match previous {
                None => {
                    if current == FileState::Unreadable {
                        self.audit.log(AuditKind::IntegrityViolation {
                            path: path.clone(),
                            message: "protected file missing or unreadable at baseline".into(),
                        });
                    }
                }
                Some(known) if known != current => {
                    let message = match (&known, &current) {
                        (_, FileState::Unreadable) => {
                            "protected file disappeared or became unreadable".to_string()
                        }
                        (FileState::Unreadable, FileState::Present(_)) => {
                            "protected file reappeared with new content".to_string()
                        }
                        (FileState::Present(_), FileState::Present(digest)) => {
                            format!("content digest changed to {}", &digest[..16])
                        }
                    };
                    self.audit.log(AuditKind::IntegrityViolation { path: path.clone(), message });
                }
                Some(_) => {}
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audit::decoder;
    use crate::audit::keyfile::MachineScopeProtector;

    async fn violations(dir: &tempfile::TempDir, audit: Arc<AuditLog>) -> Vec<String> {
        audit.dispose().await;
        let Some(file) = decoder::newest_log_file(dir.path()) else {
            return Vec::new();
        };
        decoder::decode_file(&file, &MachineScopeProtector)
            .unwrap()
            .into_iter()
            .filter_map(|line| {
                let v: serde_json::Value = serde_json::from_str(&line).ok()?;
                if v["event_type"] == "integrityViolation" {
                    Some(v["path"].as_str().unwrap_or_default().to_string())
                } else {
                    None
                }
            })
            .collect()
    }

    #[tokio::test]
    async fn test_unchanged_file_is_silent() {
        let dir = tempfile::tempdir().unwrap();
        let target = dir.path().join("watched.conf");
        fs::write(&target, "v1").unwrap();
        let audit = Arc::new(AuditLog::open(dir.path(), &MachineScopeProtector).unwrap());
        let checker = IntegrityChecker::new(
            IntegrityConfig {
                protected_files: vec![target.to_string_lossy().into_owned()],
                verification_interval: 300,
            },
            audit.clone(),
        );
        checker.verify_all();
        checker.verify_all();
        assert!(violations(&dir, audit).await.is_empty());
    }

    #[tokio::test]
    async fn test_modified_file_is_reported_once() {
        let dir = tempfile::tempdir().unwrap();
        let target = dir.path().join("watched.conf");
        fs::write(&target, "v1").unwrap();
        let audit = Arc::new(AuditLog::open(dir.path(), &MachineScopeProtector).unwrap());
        let checker = IntegrityChecker::new(
            IntegrityConfig {
                protected_files: vec![target.to_string_lossy().into_owned()],
                verification_interval: 300,
            },
            audit.clone(),
        );
        checker.verify_all();
        fs::write(&target, "tampered").unwrap();
        checker.verify_all();
        checker.verify_all(); // baseline followed the change
        let seen = violations(&dir, audit).await;
        assert_eq!(seen.len(), 1);
        assert!(seen[0].ends_with("watched.conf"));
    }

    #[tokio::test]
    async fn test_deleted_file_is_reported() {
        let dir = tempfile::tempdir().unwrap();
        let target = dir.path().join("watched.conf");
        fs::write(&target, "v1").unwrap();
        let audit = Arc::new(AuditLog::open(dir.path(), &MachineScopeProtector).unwrap());
        let checker = IntegrityChecker::new(
            IntegrityConfig {
                protected_files: vec![target.to_string_lossy().into_owned()],
                verification_interval: 300,
            },
            audit.clone(),
        );
        checker.verify_all();
        fs::remove_file(&target).unwrap();
        checker.verify_all();
        assert_eq!(violations(&dir, audit).await.len(), 1);
    }
}
