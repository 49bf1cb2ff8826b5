//! Debounced hot reload.
//!
//! File events feed a [`Debouncer`]; once events stop arriving for the
//! debounce window the coordinator reloads the engine. Events that arrive
//! while a reload is running re-arm the timer, so the final state of a burst
//! of edits is always picked up.

mod watcher;

pub use watcher::FsWatcher;

use crate::engine::MockEngine;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangeKind {
    Created,
    Modified,
    Removed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Idle,
    Pending { deadline: Instant },
    /// A reload is running; `rearmed` records events seen meanwhile
    Reloading { rearmed: bool },
}

/// Debounce state machine. Time is passed in, never read.
#[derive(Debug, Clone)]
pub struct Debouncer {
    window: Duration,
    phase: Phase,
}

impl Debouncer {
    pub fn new(window: Duration) -> Self {
        Self {
            window,
            phase: Phase::Idle,
        }
    }

    /// Record a change seen at `now`.
    pub fn on_event(&mut self, now: Instant) {
        self.phase = match self.phase {
            Phase::Idle | Phase::Pending { .. } => Phase::Pending {
                deadline: now + self.window,
            },
            Phase::Reloading { .. } => Phase::Reloading { rearmed: true },
        };
    }

    /// When the pending window closes, if one is open.
    pub fn deadline(&self) -> Option<Instant> {
        match self.phase {
            Phase::Pending { deadline } => Some(deadline),
            _ => None,
        }
    }

    /// Returns true when a reload should start now. The caller must report
    /// its end through [`Debouncer::finish_reload`].
    pub fn poll(&mut self, now: Instant) -> bool {
        match self.phase {
            Phase::Pending { deadline } if now >= deadline => {
                self.phase = Phase::Reloading { rearmed: false };
                true
            }
            _ => false,
        }
    }

    pub fn finish_reload(&mut self, now: Instant) {
        self.phase = match self.phase {
            Phase::Reloading { rearmed: true } => Phase::Pending {
                deadline: now + self.window,
            },
            _ => Phase::Idle,
        };
    }

    pub fn is_idle(&self) -> bool {
        self.phase == Phase::Idle
    }

    pub fn is_reloading(&self) -> bool {
        matches!(self.phase, Phase::Reloading { .. })
    }
}

/// Sender side handed to watchers.
#[derive(Debug, Clone)]
pub struct ReloadHandle {
    tx: mpsc::UnboundedSender<(PathBuf, ChangeKind)>,
}

impl ReloadHandle {
    pub fn on_change(&self, path: &Path, kind: ChangeKind) {
        if self.tx.send((path.to_path_buf(), kind)).is_err() {
            debug!("Reload coordinator stopped, dropping change to {}", path.display());
        }
    }
}

/// Owns the debounce loop for one engine.
pub struct ReloadCoordinator {
    task: JoinHandle<()>,
}

impl ReloadCoordinator {
    /// Spawn the coordinator loop. The loop ends when every handle is
    /// dropped.
    pub fn spawn(engine: Arc<MockEngine>, window: Duration) -> (Self, ReloadHandle) {
        let (tx, rx) = mpsc::unbounded_channel();
        let task = tokio::spawn(run(engine, Debouncer::new(window), rx));
        (Self { task }, ReloadHandle { tx })
    }
}

impl Drop for ReloadCoordinator {
    fn drop(&mut self) {
        self.task.abort();
    }
}

async fn run(
    engine: Arc<MockEngine>,
    mut debouncer: Debouncer,
    mut events: mpsc::UnboundedReceiver<(PathBuf, ChangeKind)>,
) {
    info!("Reload coordinator started");
    let mut reload: Option<JoinHandle<()>> = None;

    loop {
        let deadline = debouncer.deadline();
        tokio::select! {
            event = events.recv() => match event {
                Some((path, kind)) => {
                    debug!("Rule change {:?}: {}", kind, path.display());
                    debouncer.on_event(Instant::now());
                }
                None => break,
            },
            _ = sleep_until(deadline), if deadline.is_some() => {
                if debouncer.poll(Instant::now()) {
                    let engine = engine.clone();
                    reload = Some(tokio::task::spawn_blocking(move || {
                        engine.reload();
                    }));
                }
            },
            result = wait(&mut reload), if reload.is_some() => {
                reload = None;
                if let Err(e) = result {
                    warn!("Rule reload failed: {}", e);
                }
                debouncer.finish_reload(Instant::now());
            },
        }
    }

    if let Some(task) = reload {
        let _ = task.await;
    }
    info!("Reload coordinator stopped");
}

async fn sleep_until(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

async fn wait(task: &mut Option<JoinHandle<()>>) -> Result<(), tokio::task::JoinError> {
    match task {
        Some(task) => task.await,
        None => std::future::pending().await,
    }
}
