// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (c) 2025-2026 JR Morton

//! Monitoring host: supervision of the worker set.
//!
//! Owns the registered workers, the single cancellation signal, and the
//! coarse `{Stopped, Running, Stopping}` state. Workers are factories
//! producing a future over a cancellation receiver; they must observe the
//! signal at least once per scan interval. A worker error is swallowed
//! and audited as `monitoringWorkerFailed`; the host keeps running.
//!
//! All state transitions happen under one lock. `start` on a running host
//! and `stop_async` on a stopped one are no-ops, and `restart_async` is
//! stop followed by start.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;

use crate::audit::events::AuditKind;
use crate::audit::AuditLog;

/// Coarse supervisor state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HostState {
    Stopped,
    Running,
    Stopping,
}

/// A worker body: runs until done or cancelled, reporting failure upward.
pub type WorkerFuture = Pin<Box<dyn Future<Output = anyhow::Result<()>> + Send>>;

type WorkerFactory = Box<dyn Fn(watch::Receiver<bool>) -> WorkerFuture + Send + Sync>;

struct Worker {
    name: String,
    factory: WorkerFactory,
}

struct Inner {
    state: HostState,
    workers: Vec<Worker>,
    cancel: Option<watch::Sender<bool>>,
    handles: Vec<(String, JoinHandle<()>)>,
}

pub struct MonitoringHost {
    audit: Arc<AuditLog>,
    stop_timeout: Duration,
    inner: Mutex<Inner>,
}

impl MonitoringHost {
    pub fn new(audit: Arc<AuditLog>) -> Self {
        Self {
            audit,
            stop_timeout: Duration::from_secs(5),
            inner: Mutex::new(Inner {
                state: HostState::Stopped,
                workers: Vec::new(),
                cancel: None,
                handles: Vec::new(),
            }),
        }
    }

    /// Bound the per-worker wait during shutdown.
    #[allow(dead_code)]
    pub fn with_stop_timeout(mut self, timeout: Duration) -> Self {
        self.stop_timeout = timeout;
        self
    }

    /// Register a named worker. Takes effect at the next `start`.
    pub async fn register<F>(&self, name: &str, factory: F)
    where
        F: Fn(watch::Receiver<bool>) -> WorkerFuture + Send + Sync + 'static,
    {
        let mut inner = self.inner.lock().await;
        inner.workers.push(Worker { name: name.to_string(), factory: Box::new(factory) });
    }

    #[allow(dead_code)]
    pub async fn state(&self) -> HostState {
        self.inner.lock().await.state
    }

    /// Spawn every registered worker under a fresh cancellation signal.
    /// No-op when already running.
    pub async fn start(&self) {
        let mut inner = self.inner.lock().await;
        if inner.state == HostState::Running {
            return;
        }
        let (cancel_tx, _) = watch::channel(false);
        let mut handles = Vec::with_capacity(inner.workers.len());
        for worker in &inner.workers {
            let fut = (worker.factory)(cancel_tx.subscribe());
            let audit = self.audit.clone();
            let name = worker.name.clone();
            let task_name = name.clone();
            handles.push((
                name,
                tokio::spawn(async move {
                    if let Err(e) = fut.await {
                        audit.log(AuditKind::MonitoringWorkerFailed {
                            worker: task_name,
                            error: e.to_string(),
                        });
                    }
                }),
            ));
        }
        inner.cancel = Some(cancel_tx);
        inner.handles = handles;
        inner.state = HostState::Running;
    }

    /// Signal cancellation, await every worker under the bounded timeout
    /// (stragglers are logged and aborted), release the cancellation
    /// object, and settle in Stopped. No-op when already stopped.
    pub async fn stop_async(&self) {
        let mut inner = self.inner.lock().await;
        if inner.state == HostState::Stopped {
            return;
        }
        inner.state = HostState::Stopping;
        let cancel = inner.cancel.take();
        if let Some(cancel) = &cancel {
            let _ = cancel.send(true);
        }
        let handles = std::mem::take(&mut inner.handles);
        for (name, mut handle) in handles {
            match tokio::time::timeout(self.stop_timeout, &mut handle).await {
                Ok(_) => {}
                Err(_) => {
                    tracing::warn!(
                        "worker '{}' did not stop within {:?}, aborting",
                        name,
                        self.stop_timeout
                    );
                    self.audit.log(AuditKind::MonitoringWorkerFailed {
                        worker: name.clone(),
                        error: format!(
                            "did not stop within {:?}, aborted",
                            self.stop_timeout
                        ),
                    });
                    handle.abort();
                }
            }
        }
        drop(cancel);
        inner.state = HostState::Stopped;
    }

    /// Stop, then start again with the current worker set. Reached from
    /// the management surface.
    #[allow(dead_code)]
    pub async fn restart_async(&self) {
        self.stop_async().await;
        self.start().await;
    }
}
