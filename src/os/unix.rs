// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (c) 2025-2026 JR Morton

//! Default Unix rendition of the OS contract, built on `/proc`, `/sys`,
//! and POSIX signals.
//!
//! Suspend/resume map to SIGSTOP/SIGCONT (which stop every thread of the
//! target), the TCP table comes from `/proc/net/tcp` with socket-inode
//! ownership resolution, and memory regions come from `/proc/[pid]/maps`.
//! There is no process-creation subscription here; the process probe falls
//! back to its polling loop and audits that once.

use std::collections::{HashMap, HashSet};
use std::fs;
use std::io;
use std::path::PathBuf;

use super::{
    InterfaceInfo, LoadSample, MemoryOps, MemoryRegion, MemoryScanSession, NetOps, OsError,
    OsResult, ProcessOps, RawProcess, SystemOps, TcpTableRow,
};

/// Executable prefixes treated as system-managed for the trust check.
const SYSTEM_EXEC_PREFIXES: &[&str] = &["/usr/", "/bin/", "/sbin/", "/lib/", "/opt/"];

/// The `/proc`-backed implementation of every OS contract trait.
#[derive(Debug, Default, Clone)]
pub struct UnixOs;

impl UnixOs {
    pub fn new() -> Self {
        UnixOs
    }
}

fn proc_dir(pid: u32) -> PathBuf {
    PathBuf::from(format!("/proc/{}", pid))
}

/// Map an errno from a failed `kill(2)` into the contract vocabulary.
fn signal_error(pid: u32) -> OsError {
    let errno = io::Error::last_os_error();
    match errno.raw_os_error() {
        Some(libc::ESRCH) => OsError::Vanished(pid),
        Some(libc::EPERM) => OsError::Denied(format!("signal to pid {}", pid)),
        _ => OsError::Io(errno),
    }
}

fn send_signal(pid: u32, signal: libc::c_int) -> OsResult<()> {
    let rc = unsafe { libc::kill(pid as libc::pid_t, signal) };
    if rc == 0 {
        Ok(())
    } else {
        Err(signal_error(pid))
    }
}

/// Read one `Key:\tvalue` field out of `/proc/[pid]/status`.
fn status_field(pid: u32, key: &str) -> Option<String> {
    let content = fs::read_to_string(proc_dir(pid).join("status")).ok()?;
    for line in content.lines() {
        if let Some(rest) = line.strip_prefix(key) {
            if let Some(value) = rest.strip_prefix(':') {
                return Some(value.trim().to_string());
            }
        }
    }
    None
}

impl ProcessOps for UnixOs {
    fn list_pids(&self) -> OsResult<Vec<u32>> {
        let mut pids = Vec::new();
        for entry in fs::read_dir("/proc")? {
            let entry = entry?;
            if let Ok(name) = entry.file_name().into_string() {
                if let Ok(pid) = name.parse::<u32>() {
                    pids.push(pid);
                }
            }
        }
        pids.sort_unstable();
        Ok(pids)
    }

    fn query(&self, pid: u32) -> OsResult<RawProcess> {
        if !proc_dir(pid).exists() {
            return Err(OsError::Vanished(pid));
        }
        let name = status_field(pid, "Name").unwrap_or_default();
        let parent_pid = status_field(pid, "PPid")
            .and_then(|v| v.parse().ok())
            .unwrap_or(0);
        let executable_path = fs::read_link(proc_dir(pid).join("exe"))
            .map(|p| p.to_string_lossy().into_owned())
            .unwrap_or_default();
        let command_line = fs::read(proc_dir(pid).join("cmdline"))
            .map(|raw| {
                raw.split(|b| *b == 0)
                    .filter(|part| !part.is_empty())
                    .map(|part| String::from_utf8_lossy(part).into_owned())
                    .collect::<Vec<_>>()
                    .join(" ")
            })
            .unwrap_or_default();
        Ok(RawProcess { pid, parent_pid, name, executable_path, command_line })
    }

    fn is_alive(&self, pid: u32) -> bool {
        proc_dir(pid).exists()
    }

    fn is_signed(&self, path: &str) -> bool {
        // Nearest Unix equivalent of a signature check: the binary lives in
        // a package-managed prefix, is root-owned, and nobody else can
        // write to it.
        use std::os::unix::fs::MetadataExt;
        if path.is_empty() || !SYSTEM_EXEC_PREFIXES.iter().any(|p| path.starts_with(p)) {
            return false;
        }
        match fs::metadata(path) {
            Ok(meta) => meta.uid() == 0 && meta.mode() & 0o022 == 0,
            Err(_) => false,
        }
    }

    fn suspend(&self, pid: u32) -> OsResult<usize> {
        let threads = fs::read_dir(proc_dir(pid).join("task"))
            .map(|entries| entries.count())
            .map_err(|_| OsError::Vanished(pid))?;
        send_signal(pid, libc::SIGSTOP)?;
        Ok(threads)
    }

    fn resume(&self, pid: u32) -> OsResult<usize> {
        let threads = fs::read_dir(proc_dir(pid).join("task"))
            .map(|entries| entries.count())
            .unwrap_or(0);
        send_signal(pid, libc::SIGCONT)?;
        Ok(threads)
    }

    fn kill_tree(&self, pid: u32) -> OsResult<()> {
        if !self.is_alive(pid) {
            return Err(OsError::Vanished(pid));
        }
        // Snapshot parent links once, then walk descendants depth-first.
        // A visited set guards against PPid links that loop after reuse.
        let mut children: HashMap<u32, Vec<u32>> = HashMap::new();
        if let Ok(pids) = self.list_pids() {
            for p in pids {
                if let Some(ppid) = status_field(p, "PPid").and_then(|v| v.parse().ok()) {
                    children.entry(ppid).or_default().push(p);
                }
            }
        }
        let mut order = Vec::new();
        let mut visited = HashSet::new();
        collect_descendants(pid, &children, &mut visited, &mut order);
        // Children first so nothing reparents mid-kill, root last.
        for child in order.iter().rev() {
            if *child != pid {
                let _ = send_signal(*child, libc::SIGKILL);
            }
        }
        send_signal(pid, libc::SIGKILL)
    }
}

fn collect_descendants(
    pid: u32,
    children: &HashMap<u32, Vec<u32>>,
    visited: &mut HashSet<u32>,
    order: &mut Vec<u32>,
) {
    if !visited.insert(pid) {
        return;
    }
    order.push(pid);
    if let Some(kids) = children.get(&pid) {
        for kid in kids {
            collect_descendants(*kid, children, visited, order);
        }
    }
}

// ── Memory ──────────────────────────────────────────────────────────────────

/// Scan session backed by a one-shot parse of `/proc/[pid]/maps`.
/// The file read is the handle; dropping the session releases nothing else.
struct ProcMapsSession {
    regions: Vec<MemoryRegion>,
}

impl MemoryScanSession for ProcMapsSession {
    fn query_region(&mut self, addr: u64) -> Option<MemoryRegion> {
        self.regions
            .iter()
            .find(|r| r.base + r.size > addr)
            .cloned()
    }
}

/// Parse one `/proc/[pid]/maps` line: `start-end perms offset dev inode path`.
fn parse_maps_line(line: &str) -> Option<MemoryRegion> {
    let mut parts = line.split_whitespace();
    let range = parts.next()?;
    let perms = parts.next()?;
    let (start, end) = range.split_once('-')?;
    let base = u64::from_str_radix(start, 16).ok()?;
    let end = u64::from_str_radix(end, 16).ok()?;
    if end <= base {
        return None;
    }
    Some(MemoryRegion { base, size: end - base, perms: perms.to_string() })
}

impl MemoryOps for UnixOs {
    fn open_scan(&self, pid: u32) -> OsResult<Box<dyn MemoryScanSession>> {
        let path = proc_dir(pid).join("maps");
        let content = match fs::read_to_string(&path) {
            Ok(c) => c,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Err(OsError::Vanished(pid)),
            Err(e) if e.kind() == io::ErrorKind::PermissionDenied => {
                return Err(OsError::Denied(format!("{}", path.display())))
            }
            Err(e) => return Err(OsError::Io(e)),
        };
        let mut regions: Vec<MemoryRegion> = content.lines().filter_map(parse_maps_line).collect();
        regions.sort_by_key(|r| r.base);
        Ok(Box::new(ProcMapsSession { regions }))
    }
}

// ── Network ─────────────────────────────────────────────────────────────────

/// Decode `/proc/net/tcp`'s `AABBCCDD:PPPP` address:port notation. The
/// address hex is the kernel's native-endian dump of the network-order
/// word; the port hex is already the big-endian 16-bit value decoded.
fn parse_proc_net_endpoint(field: &str) -> Option<(String, u16)> {
    let (addr_hex, port_hex) = field.split_once(':')?;
    if addr_hex.len() != 8 {
        return None;
    }
    let raw = u32::from_str_radix(addr_hex, 16).ok()?;
    let port = u16::from_str_radix(port_hex, 16).ok()?;
    let octets = raw.to_le_bytes();
    let addr = format!("{}.{}.{}.{}", octets[0], octets[1], octets[2], octets[3]);
    Some((addr, port))
}

/// Map socket inodes to owning PIDs by walking `/proc/[pid]/fd`.
fn socket_owners() -> HashMap<u64, u32> {
    let mut owners = HashMap::new();
    let Ok(entries) = fs::read_dir("/proc") else {
        return owners;
    };
    for entry in entries.flatten() {
        let Ok(name) = entry.file_name().into_string() else { continue };
        let Ok(pid) = name.parse::<u32>() else { continue };
        let Ok(fds) = fs::read_dir(entry.path().join("fd")) else { continue };
        for fd in fds.flatten() {
            if let Ok(target) = fs::read_link(fd.path()) {
                let target = target.to_string_lossy();
                if let Some(inode) = target
                    .strip_prefix("socket:[")
                    .and_then(|rest| rest.strip_suffix(']'))
                    .and_then(|num| num.parse::<u64>().ok())
                {
                    owners.entry(inode).or_insert(pid);
                }
            }
        }
    }
    owners
}

/// TCP state 01 is ESTABLISHED; only live outbound connections interest
/// the network probe.
const TCP_ESTABLISHED: &str = "01";

impl NetOps for UnixOs {
    fn tcp_table(&self) -> OsResult<Vec<TcpTableRow>> {
        let content = fs::read_to_string("/proc/net/tcp")?;
        let owners = socket_owners();
        let mut rows = Vec::new();
        for line in content.lines().skip(1) {
            let fields: Vec<&str> = line.split_whitespace().collect();
            if fields.len() < 10 || fields[3] != TCP_ESTABLISHED {
                continue;
            }
            let Some((local_addr, local_port)) = parse_proc_net_endpoint(fields[1]) else {
                continue;
            };
            let Some((remote_addr, remote_port)) = parse_proc_net_endpoint(fields[2]) else {
                continue;
            };
            let pid = fields[9]
                .parse::<u64>()
                .ok()
                .and_then(|inode| owners.get(&inode).copied())
                .unwrap_or(0);
            rows.push(TcpTableRow { pid, local_addr, local_port, remote_addr, remote_port });
        }
        Ok(rows)
    }

    fn interfaces(&self) -> OsResult<Vec<InterfaceInfo>> {
        let mut interfaces = Vec::new();
        for entry in fs::read_dir("/sys/class/net")? {
            let entry = entry?;
            let Ok(name) = entry.file_name().into_string() else { continue };
            let up = fs::read_to_string(entry.path().join("operstate"))
                .map(|s| s.trim() == "up")
                .unwrap_or(false);
            let wireless = entry.path().join("wireless").exists();
            interfaces.push(InterfaceInfo { name, up, wireless });
        }
        interfaces.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(interfaces)
    }
}

// ── System ──────────────────────────────────────────────────────────────────

impl SystemOps for UnixOs {
    fn load_sample(&self) -> OsResult<LoadSample> {
        let loadavg = fs::read_to_string("/proc/loadavg")?;
        let one_minute: f64 = loadavg
            .split_whitespace()
            .next()
            .and_then(|v| v.parse().ok())
            .unwrap_or(0.0);
        let cpus = unsafe { libc::sysconf(libc::_SC_NPROCESSORS_ONLN) }.max(1) as f64;
        let cpu_percent = (one_minute / cpus * 100.0).min(100.0);

        let meminfo = fs::read_to_string("/proc/meminfo")?;
        let kb = |key: &str| -> f64 {
            meminfo
                .lines()
                .find(|l| l.starts_with(key))
                .and_then(|l| l.split_whitespace().nth(1))
                .and_then(|v| v.parse().ok())
                .unwrap_or(0.0)
        };
        let total = kb("MemTotal");
        let available = kb("MemAvailable");
        let memory_percent = if total > 0.0 {
            ((total - available) / total * 100.0).clamp(0.0, 100.0)
        } else {
            0.0
        };

        let process_count = self.list_pids().map(|p| p.len() as u32).unwrap_or(0);
        Ok(LoadSample { cpu_percent, memory_percent, process_count })
    }
}
