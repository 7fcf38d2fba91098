// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (c) 2025-2026 JR Morton

//! Configuration loading and validation.
//!
//! Defines the TOML configuration schema for TideWatch. The root
//! [`Config`] struct contains a section per subsystem (behavior, defense,
//! process monitoring, memory scanning, network, integrity).
//!
//! All sections implement `Default` and deserialize with
//! `#[serde(default)]` so a missing section or field falls back to its
//! documented default. A config *defect* (non-increasing thresholds, a
//! zero scan interval) fails [`Config::validate`] and the agent refuses to
//! start with a single diagnostic line.
//!
//! Durations are whole seconds throughout.

use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::behavior::Thresholds;
use crate::response::DefensePolicy;

/// Root configuration struct, deserialized from TOML.
#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct Config {
    #[serde(default = "default_logging_directory")]
    pub logging_directory: String,
    #[serde(default = "default_plugin_directory")]
    pub plugin_directory: String,
    #[serde(default)]
    pub behavior: BehaviorConfig,
    #[serde(default)]
    pub defense: DefenseConfig,
    #[serde(default)]
    pub process_monitoring: ProcessMonitoringConfig,
    #[serde(default)]
    pub memory_scanning: MemoryScanningConfig,
    #[serde(default)]
    pub network: NetworkConfig,
    #[serde(default)]
    pub integrity: IntegrityConfig,
}

fn default_logging_directory() -> String {
    "/var/log/tidewatch".to_string()
}

fn default_plugin_directory() -> String {
    "/etc/tidewatch/plugins".to_string()
}

impl Default for Config {
    fn default() -> Self {
        Self {
            logging_directory: default_logging_directory(),
            plugin_directory: default_plugin_directory(),
            behavior: BehaviorConfig::default(),
            defense: DefenseConfig::default(),
            process_monitoring: ProcessMonitoringConfig::default(),
            memory_scanning: MemoryScanningConfig::default(),
            network: NetworkConfig::default(),
            integrity: IntegrityConfig::default(),
        }
    }
}

/// Score thresholds for the three actionable tiers.
#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct BehaviorConfig {
    #[serde(default = "default_suspicious_threshold")]
    pub suspicious_threshold: u32,
    #[serde(default = "default_malicious_threshold")]
    pub malicious_threshold: u32,
    #[serde(default = "default_critical_threshold")]
    pub critical_threshold: u32,
}

fn default_suspicious_threshold() -> u32 { 10 }
fn default_malicious_threshold() -> u32 { 15 }
fn default_critical_threshold() -> u32 { 20 }

impl Default for BehaviorConfig {
    fn default() -> Self {
        Self {
            suspicious_threshold: default_suspicious_threshold(),
            malicious_threshold: default_malicious_threshold(),
            critical_threshold: default_critical_threshold(),
        }
    }
}

/// Graduated-response knobs for the action manager.
#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct DefenseConfig {
    /// Seconds a suspended process stays stopped before the scheduled resume.
    #[serde(default = "default_suspend_duration")]
    pub process_suspend_duration: u64,
    /// Seconds a network-block entry stays live.
    #[serde(default = "default_network_block_duration")]
    pub network_block_duration: u64,
    /// Minimum seconds between actions on the same PID (0 disables).
    #[serde(default = "default_action_cooldown")]
    pub action_cooldown: u64,
    /// Concurrent-termination cap; 0 disables termination entirely.
    #[serde(default = "default_max_concurrent_terminates")]
    pub max_concurrent_terminates: usize,
    /// Seconds before a failed kill is retried on the same PID.
    #[serde(default = "default_terminate_failure_backoff")]
    pub terminate_failure_backoff: u64,
}

fn default_suspend_duration() -> u64 { 30 }
fn default_network_block_duration() -> u64 { 300 }
fn default_action_cooldown() -> u64 { 60 }
fn default_max_concurrent_terminates() -> usize { 2 }
fn default_terminate_failure_backoff() -> u64 { 30 }

impl Default for DefenseConfig {
    fn default() -> Self {
        Self {
            process_suspend_duration: default_suspend_duration(),
            network_block_duration: default_network_block_duration(),
            action_cooldown: default_action_cooldown(),
            max_concurrent_terminates: default_max_concurrent_terminates(),
            terminate_failure_backoff: default_terminate_failure_backoff(),
        }
    }
}

/// Process probe cadence and scoring exclusions.
#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct ProcessMonitoringConfig {
    /// Seconds between full process-table sweeps.
    #[serde(default = "default_process_scan_interval")]
    pub scan_interval: u64,
    /// Process names (case-insensitive, extension ignored) that never score.
    #[serde(default = "default_allow_listed_processes")]
    pub allow_listed_processes: Vec<String>,
}

fn default_process_scan_interval() -> u64 { 10 }

fn default_allow_listed_processes() -> Vec<String> {
    ["systemd", "init", "kthreadd", "sshd", "bash", "cargo", "rustc", "gcc"]
        .iter()
        .map(|s| s.to_string())
        .collect()
}

impl Default for ProcessMonitoringConfig {
    fn default() -> Self {
        Self {
            scan_interval: default_process_scan_interval(),
            allow_listed_processes: default_allow_listed_processes(),
        }
    }
}

/// Memory probe controls.
#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct MemoryScanningConfig {
    /// Seconds between rescans of the same PID (also the cycle cadence).
    #[serde(default = "default_memory_scan_interval")]
    pub scan_interval: u64,
    /// How many selected processes one cycle may scan.
    #[serde(default = "default_max_concurrent_scans")]
    pub max_concurrent_scans: usize,
    /// Names always eligible for scanning, scored or not.
    #[serde(default = "default_target_processes")]
    pub target_processes: Vec<String>,
}

fn default_memory_scan_interval() -> u64 { 30 }
fn default_max_concurrent_scans() -> usize { 4 }

fn default_target_processes() -> Vec<String> {
    ["ssh-agent", "gpg-agent", "gnome-keyring-daemon"]
        .iter()
        .map(|s| s.to_string())
        .collect()
}

impl Default for MemoryScanningConfig {
    fn default() -> Self {
        Self {
            scan_interval: default_memory_scan_interval(),
            max_concurrent_scans: default_max_concurrent_scans(),
            target_processes: default_target_processes(),
        }
    }
}

/// Network probe controls.
#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct NetworkConfig {
    /// Seconds between TCP-table snapshots.
    #[serde(default = "default_network_scan_interval")]
    pub scan_interval: u64,
    /// Preferred interface name prefix for the startup selection tie-break.
    #[serde(default)]
    pub primary_interface_preference: String,
    /// Remote-address substrings that raise the high-risk-host indicator.
    #[serde(default = "default_high_risk_hosts")]
    pub high_risk_hosts: Vec<String>,
    /// Remote ports that raise the suspicious-port indicator.
    #[serde(default = "default_suspicious_ports")]
    pub suspicious_ports: Vec<u16>,
}

fn default_network_scan_interval() -> u64 { 15 }

fn default_high_risk_hosts() -> Vec<String> {
    ["pastebin", "transfer.sh", "anonfiles", "mega.nz", "filebin"]
        .iter()
        .map(|s| s.to_string())
        .collect()
}

fn default_suspicious_ports() -> Vec<u16> {
    vec![1337, 4444, 5552, 6667, 9001]
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            scan_interval: default_network_scan_interval(),
            primary_interface_preference: String::new(),
            high_risk_hosts: default_high_risk_hosts(),
            suspicious_ports: default_suspicious_ports(),
        }
    }
}

/// File-integrity checker controls.
#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct IntegrityConfig {
    /// Absolute paths whose digests are baselined and re-verified.
    #[serde(default)]
    pub protected_files: Vec<String>,
    /// Seconds between verification passes.
    #[serde(default = "default_verification_interval")]
    pub verification_interval: u64,
}

fn default_verification_interval() -> u64 { 300 }

impl Default for IntegrityConfig {
    fn default() -> Self {
        Self {
            protected_files: Vec::new(),
            verification_interval: default_verification_interval(),
        }
    }
}

impl Config {
    /// Load from `path`, falling back to full defaults when the file does
    /// not exist. Parse failures and config defects refuse the start.
    pub fn load(path: &Path) -> Result<Self> {
        let config = if path.exists() {
            let content = std::fs::read_to_string(path)
                .with_context(|| format!("reading {}", path.display()))?;
            toml::from_str(&content).with_context(|| format!("parsing {}", path.display()))?
        } else {
            tracing::warn!("Config {} not found, using defaults", path.display());
            Config::default()
        };
        config.validate()?;
        Ok(config)
    }

    /// Reject configuration defects up front, before any worker starts.
    pub fn validate(&self) -> Result<()> {
        self.thresholds()?;
        if self.process_monitoring.scan_interval == 0 {
            anyhow::bail!("process_monitoring.scan_interval must be at least 1 second");
        }
        if self.memory_scanning.scan_interval == 0 {
            anyhow::bail!("memory_scanning.scan_interval must be at least 1 second");
        }
        if self.memory_scanning.max_concurrent_scans == 0 {
            anyhow::bail!("memory_scanning.max_concurrent_scans must be at least 1");
        }
        if self.network.scan_interval == 0 {
            anyhow::bail!("network.scan_interval must be at least 1 second");
        }
        if self.integrity.verification_interval == 0 {
            anyhow::bail!("integrity.verification_interval must be at least 1 second");
        }
        Ok(())
    }

    /// The validated threshold triple.
    pub fn thresholds(&self) -> Result<Thresholds> {
        Thresholds::new(
            self.behavior.suspicious_threshold,
            self.behavior.malicious_threshold,
            self.behavior.critical_threshold,
        )
    }

    /// Lower the `[defense]` section into the action manager's policy.
    pub fn defense_policy(&self) -> DefensePolicy {
        DefensePolicy {
            process_suspend_duration: Duration::from_secs(self.defense.process_suspend_duration),
            network_block_duration: Duration::from_secs(self.defense.network_block_duration),
            action_cooldown: Duration::from_secs(self.defense.action_cooldown),
            max_concurrent_terminates: self.defense.max_concurrent_terminates,
            terminate_failure_backoff: Duration::from_secs(self.defense.terminate_failure_backoff),
        }
    }
}
