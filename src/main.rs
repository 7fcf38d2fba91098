// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (c) 2025-2026 JR Morton

//! TideWatch — host-resident exfiltration defense agent.
//!
//! This is the main entry point. It handles CLI argument parsing and
//! orchestrates the async runtime that wires up the core:
//!
//! - **audit**: Encrypted append-only event stream plus the offline decoder
//! - **behavior**: Per-process additive risk scoring with tiered levels
//! - **response**: Graduated actions (monitor, suspend, terminate, block)
//! - **probes**: Process, memory, network, load, and integrity workers
//! - **host**: Supervisor owning the worker set and cancellation signal
//! - **os**: Platform contract traits with the `/proc`-based default
//!
//! The architecture is observation-driven:
//! probes → indicators → behavior engine → action manager → audit log

mod audit;
mod behavior;
mod config;
mod host;
mod os;
mod probes;
mod response;

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;

use audit::keyfile::MachineScopeProtector;
use audit::{decoder, AuditLog};
use behavior::plugin::AnalyzerRegistry;
use behavior::BehaviorEngine;
use config::Config;
use host::MonitoringHost;
use os::unix::UnixOs;
use probes::integrity::IntegrityChecker;
use probes::load::LoadMonitor;
use probes::memory::MemoryProbe;
use probes::network::NetworkProbe;
use probes::process::ProcessProbe;
use response::ActionManager;

const DEFAULT_CONFIG_PATH: &str = "/etc/tidewatch/config.toml";

fn print_help() {
    eprintln!(
        r#"🛡️  TideWatch — host-resident exfiltration defense agent

USAGE:
    tidewatch [COMMAND] [OPTIONS]

COMMANDS:
    run [CONFIG]         Start the agent (default command)
    --decode-log [PATH]  Decrypt an audit log file and print its events;
                         PATH defaults to the newest log in the configured
                         logging directory
    help                 Show this help message
    version              Show version info

EXAMPLES:
    tidewatch                          Start with /etc/tidewatch/config.toml
    tidewatch run /tmp/dev.toml        Start with an alternate config
    tidewatch --decode-log             Decode the newest audit log
    tidewatch --decode-log log-20260801.bin

CONFIG:
    Default config path: /etc/tidewatch/config.toml
"#
    );
}

fn print_version() {
    eprintln!("TideWatch v{}", env!("CARGO_PKG_VERSION"));
    eprintln!("Host-resident exfiltration defense agent");
}

fn main() -> Result<()> {
    let args: Vec<String> = std::env::args().collect();
    let subcommand = args.get(1).cloned().unwrap_or_else(|| "run".to_string());

    match subcommand.as_str() {
        "help" | "--help" | "-h" => {
            print_help();
            Ok(())
        }
        "version" | "--version" | "-V" => {
            print_version();
            Ok(())
        }
        "--decode-log" => {
            run_decode(args.get(2).map(PathBuf::from));
            Ok(())
        }
        _ => tokio::runtime::Runtime::new()?.block_on(run_agent(args)),
    }
}

/// Offline decoder entry: print every event of the chosen log file to
/// stdout, or exit 1 with a diagnostic on stderr. Nothing is printed
/// unless the whole file decodes.
fn run_decode(path: Option<PathBuf>) {
    let protector = MachineScopeProtector;
    let log_path = match path {
        Some(path) => path,
        None => {
            let config = match Config::load(std::path::Path::new(DEFAULT_CONFIG_PATH)) {
                Ok(config) => config,
                Err(e) => {
                    eprintln!("decode failed: {:#}", e);
                    std::process::exit(1);
                }
            };
            let dir = PathBuf::from(&config.logging_directory);
            match decoder::newest_log_file(&dir) {
                Some(path) => path,
                None => {
                    eprintln!("decode failed: no log-*.bin files in {}", dir.display());
                    std::process::exit(1);
                }
            }
        }
    };
    match decoder::decode_file(&log_path, &protector) {
        Ok(entries) => {
            for entry in entries {
                println!("{}", entry);
            }
        }
        Err(e) => {
            eprintln!("decode failed: {}", e);
            std::process::exit(1);
        }
    }
}

async fn run_agent(args: Vec<String>) -> Result<()> {
    // Operational logging for the library modules; RUST_LOG overrides.
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "tidewatch=info".into()),
        )
        .init();

    let config_path = args
        .iter()
        .skip(1)
        .filter(|a| a.as_str() != "run")
        .find(|a| !a.starts_with("--"))
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from(DEFAULT_CONFIG_PATH));

    // A config defect refuses the start with one diagnostic line.
    let config = match Config::load(&config_path) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("tidewatch: {:#}", e);
            std::process::exit(1);
        }
    };

    let audit = Arc::new(AuditLog::open(&config.logging_directory, &MachineScopeProtector)?);
    let os = Arc::new(UnixOs::new());
    let engine = Arc::new(BehaviorEngine::new(config.thresholds()?, audit.clone()));
    let actions = Arc::new(ActionManager::new(
        config.defense_policy(),
        std::process::id(),
        engine.clone(),
        audit.clone(),
        os.clone(),
    ));

    // Plugins arrive through the external loader collaborator; nothing is
    // discovered here. An empty registry just means no extra analyzers.
    let plugins = AnalyzerRegistry::new();
    eprintln!(
        "plugin directory {} ({} analyzers active)",
        config.plugin_directory,
        plugins.len()
    );

    let process_probe = Arc::new(ProcessProbe::new(
        config.process_monitoring.clone(),
        engine.clone(),
        actions.clone(),
        audit.clone(),
        os.clone(),
        plugins,
    ));
    let memory_probe = Arc::new(MemoryProbe::new(
        config.memory_scanning.clone(),
        engine.clone(),
        actions.clone(),
        audit.clone(),
        os.clone(),
        os.clone(),
    ));
    let network_probe = Arc::new(NetworkProbe::new(
        config.network.clone(),
        engine.clone(),
        actions.clone(),
        audit.clone(),
        os.clone(),
    ));
    let load_monitor = Arc::new(LoadMonitor::new(
        Duration::from_secs(config.process_monitoring.scan_interval),
        os.clone(),
        audit.clone(),
    ));

    let host = MonitoringHost::new(audit.clone());
    {
        let probe = process_probe.clone();
        host.register("processProbe", move |cancel| {
            let probe = probe.clone();
            Box::pin(probe.run(cancel))
        })
        .await;
    }
    {
        let probe = memory_probe.clone();
        host.register("memoryProbe", move |cancel| {
            let probe = probe.clone();
            Box::pin(probe.run(cancel))
        })
        .await;
    }
    {
        let probe = network_probe.clone();
        host.register("networkProbe", move |cancel| {
            let probe = probe.clone();
            Box::pin(probe.run(cancel))
        })
        .await;
    }
    {
        let monitor = load_monitor.clone();
        host.register("loadMonitor", move |cancel| {
            let monitor = monitor.clone();
            Box::pin(monitor.run(cancel))
        })
        .await;
    }
    if !config.integrity.protected_files.is_empty() {
        let checker = Arc::new(IntegrityChecker::new(config.integrity.clone(), audit.clone()));
        host.register("integrityChecker", move |cancel| {
            let checker = checker.clone();
            Box::pin(checker.run(cancel))
        })
        .await;
    }

    host.start().await;
    eprintln!(
        "tidewatch running: logs in {} (Ctrl+C or SIGTERM to stop)",
        config.logging_directory
    );

    wait_for_shutdown().await;
    eprintln!("shutting down...");
    host.stop_async().await;
    audit.dispose().await;
    Ok(())
}

/// Block until SIGINT or SIGTERM.
async fn wait_for_shutdown() {
    let mut sigterm = match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
    {
        Ok(sigterm) => sigterm,
        Err(e) => {
            eprintln!("cannot register SIGTERM handler: {}", e);
            let _ = tokio::signal::ctrl_c().await;
            return;
        }
    };
    tokio::select! {
        _ = tokio::signal::ctrl_c() => {}
        _ = sigterm.recv() => {}
    }
}
