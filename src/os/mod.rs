// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (c) 2025-2026 JR Morton

//! OS contract traits for the probe and response layers.
//!
//! Everything platform-specific sits behind these traits: process
//! enumeration and metadata, suspend/resume/kill, virtual-memory region
//! walks, the owner-aware TCP table, interface state, and load sampling.
//! The core never calls a native API directly; it holds `Arc<dyn ...>`
//! handles and treats failures as observations to skip, never as crashes.
//!
//! [`unix`] provides the default `/proc`-based rendition. Other platforms
//! (or test fixtures) implement the same traits out of tree.

pub mod unix;

use std::io;

/// Result type for OS contract operations.
pub type OsResult<T> = Result<T, OsError>;

/// Errors surfaced by the OS contract. Callers downgrade these to skipped
/// observations or audited decisions; they never bubble out of a worker.
#[derive(Debug)]
pub enum OsError {
    /// The target process no longer exists.
    Vanished(u32),
    /// Access was denied to the target object.
    Denied(String),
    /// The platform rendition does not provide this capability.
    /// Raised by out-of-tree renditions; the `/proc` one never needs it.
    #[allow(dead_code)]
    Unsupported(&'static str),
    /// Underlying I/O error.
    Io(io::Error),
}

impl std::fmt::Display for OsError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            OsError::Vanished(pid) => write!(f, "process {} no longer exists", pid),
            OsError::Denied(what) => write!(f, "access denied: {}", what),
            OsError::Unsupported(what) => write!(f, "not supported on this platform: {}", what),
            OsError::Io(e) => write!(f, "io error: {}", e),
        }
    }
}

impl std::error::Error for OsError {}

impl From<io::Error> for OsError {
    fn from(e: io::Error) -> Self {
        OsError::Io(e)
    }
}

impl OsError {
    /// Whether this error means the subject process went away mid-observation.
    pub fn is_vanished(&self) -> bool {
        matches!(self, OsError::Vanished(_))
    }
}

// ── Process contract ────────────────────────────────────────────────────────

/// Raw process facts as the platform reports them, before the probe applies
/// its best-effort defaults. Missing sub-queries come back as empty strings.
#[derive(Debug, Clone, Default)]
pub struct RawProcess {
    pub pid: u32,
    pub parent_pid: u32,
    pub name: String,
    pub executable_path: String,
    pub command_line: String,
}

/// Process enumeration, metadata, and control primitives.
pub trait ProcessOps: Send + Sync {
    /// Enumerate all PIDs currently visible.
    fn list_pids(&self) -> OsResult<Vec<u32>>;

    /// Collect metadata for one PID. Sub-queries that fail individually
    /// yield empty fields; a fully vanished process yields `Vanished`.
    fn query(&self, pid: u32) -> OsResult<RawProcess>;

    /// Whether the process still exists.
    fn is_alive(&self, pid: u32) -> bool;

    /// Whether the executable at `path` carries a trusted signature (or the
    /// platform's nearest equivalent). Best effort; `false` when unknown.
    fn is_signed(&self, path: &str) -> bool;

    /// Suspend every thread of the target. Returns the number of threads
    /// suspended; zero means nothing was stopped.
    fn suspend(&self, pid: u32) -> OsResult<usize>;

    /// Resume a previously suspended process.
    fn resume(&self, pid: u32) -> OsResult<usize>;

    /// Kill the process and all of its descendants.
    fn kill_tree(&self, pid: u32) -> OsResult<()>;

    /// Subscribe to process-creation notifications, if the platform has
    /// them. `None` means the caller must rely on polling alone.
    fn spawn_events(&self) -> Option<tokio::sync::mpsc::UnboundedReceiver<u32>> {
        None
    }
}

// ── Memory contract ─────────────────────────────────────────────────────────

/// One virtual-memory region of a scanned process.
///
/// `perms` uses the `/proc/[pid]/maps` permission-string convention
/// (`rwxp` order); platforms with flag-based protection translate into it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MemoryRegion {
    pub base: u64,
    pub size: u64,
    pub perms: String,
}

impl MemoryRegion {
    /// Whether this region is executable.
    pub fn is_executable(&self) -> bool {
        self.perms.contains('x')
    }

    /// Whether this region is writable.
    pub fn is_writable(&self) -> bool {
        self.perms.contains('w')
    }

    /// Writable and executable at once: the injection signature the memory
    /// probe is after.
    pub fn is_writable_executable(&self) -> bool {
        self.is_writable() && self.is_executable()
    }
}

/// An open scan over one process's address space. Dropping the session
/// releases whatever handle the platform acquired.
pub trait MemoryScanSession: Send {
    /// The first region whose range is at or above `addr`, or `None` once
    /// the walk is past the last mapped region.
    fn query_region(&mut self, addr: u64) -> Option<MemoryRegion>;
}

/// Access to process virtual-memory layouts.
pub trait MemoryOps: Send + Sync {
    /// Open the target for region queries. Denied targets are skipped by
    /// the probe, not retried.
    fn open_scan(&self, pid: u32) -> OsResult<Box<dyn MemoryScanSession>>;
}

// ── Network contract ────────────────────────────────────────────────────────

/// One row of the owner-aware TCP table. Ports are already decoded from
/// their big-endian wire representation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TcpTableRow {
    pub pid: u32,
    pub local_addr: String,
    pub local_port: u16,
    pub remote_addr: String,
    pub remote_port: u16,
}

/// A network interface as the platform reports it.
#[derive(Debug, Clone)]
pub struct InterfaceInfo {
    pub name: String,
    /// Operationally up (carrier present, not just administratively up).
    pub up: bool,
    pub wireless: bool,
}

/// TCP table snapshots and interface enumeration.
pub trait NetOps: Send + Sync {
    fn tcp_table(&self) -> OsResult<Vec<TcpTableRow>>;
    fn interfaces(&self) -> OsResult<Vec<InterfaceInfo>>;
}

// ── System contract ─────────────────────────────────────────────────────────

/// A point-in-time host load sample for the runtime-load monitor.
#[derive(Debug, Clone, Copy)]
pub struct LoadSample {
    pub cpu_percent: f64,
    pub memory_percent: f64,
    pub process_count: u32,
}

/// Coarse host-level sampling.
pub trait SystemOps: Send + Sync {
    fn load_sample(&self) -> OsResult<LoadSample>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_region_rwx_detection() {
        let region = MemoryRegion { base: 0x7f0000000000, size: 4096, perms: "rwxp".into() };
        assert!(region.is_writable_executable());
    }

    #[test]
    fn test_region_text_segment_not_flagged() {
        let region = MemoryRegion { base: 0x400000, size: 8192, perms: "r-xp".into() };
        assert!(region.is_executable());
        assert!(!region.is_writable_executable());
    }

    #[test]
    fn test_region_heap_not_flagged() {
        let region = MemoryRegion { base: 0x1000, size: 4096, perms: "rw-p".into() };
        assert!(!region.is_writable_executable());
    }

    #[test]
    fn test_os_error_vanished_display() {
        let e = OsError::Vanished(4242);
        assert!(e.to_string().contains("4242"));
        assert!(e.is_vanished());
    }
}
