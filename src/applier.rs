//! Serialized adoption of cluster states on one node.
//!
//! A single task owns the last applied state. Received and locally published
//! states are submitted as [`ApplierCommand`]s and processed strictly one at
//! a time, so listeners never observe two states concurrently.

use crate::error::{Result, SyncError};
use crate::observability;
use crate::shutdown::ShutdownCoordinator;
use crate::state::{ClusterChangedEvent, ClusterState};
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, trace, warn};

/// Reacts to every adopted cluster state.
///
/// Called on the blocking pool; implementations may perform file I/O.
pub trait ClusterStateListener: Send + Sync {
    fn name(&self) -> &str {
        "listener"
    }

    fn cluster_changed(&self, event: &ClusterChangedEvent) -> Result<()>;
}

/// How a submitted state was handled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApplyOutcome {
    /// Listeners ran and the state became the last applied one.
    Applied,
    /// Older than the last applied state; acknowledged and ignored.
    Stale { applied_version: u64 },
    /// Same version from the same master was already applied.
    AlreadyApplied,
}

/// Command for the applier task.
pub enum ApplierCommand {
    /// Adopt a state.
    Apply {
        source: String,
        state: Arc<ClusterState>,
        response: oneshot::Sender<Result<ApplyOutcome>>,
    },
    /// Get the last applied state.
    CurrentState {
        response: oneshot::Sender<Option<Arc<ClusterState>>>,
    },
    /// Stop the task.
    Shutdown,
}

/// Handle to a node's applier task. Cheap to clone.
#[derive(Clone)]
pub struct ClusterStateApplier {
    command_tx: mpsc::Sender<ApplierCommand>,
}

struct ApplierTask {
    listeners: Vec<Arc<dyn ClusterStateListener>>,
    last_applied: Option<Arc<ClusterState>>,
}

impl ClusterStateApplier {
    /// Spawn the applier task on the current runtime.
    pub fn start(
        listeners: Vec<Arc<dyn ClusterStateListener>>,
        shutdown: ShutdownCoordinator,
    ) -> Self {
        let (command_tx, command_rx) = mpsc::channel(128);
        let task = ApplierTask {
            listeners,
            last_applied: None,
        };
        tokio::spawn(task.run(command_rx, shutdown));
        Self { command_tx }
    }

    /// Submit a state and wait until it has been handled.
    pub async fn apply(
        &self,
        source: impl Into<String>,
        state: Arc<ClusterState>,
    ) -> Result<ApplyOutcome> {
        let (response, rx) = oneshot::channel();
        self.command_tx
            .send(ApplierCommand::Apply {
                source: source.into(),
                state,
                response,
            })
            .await
            .map_err(|_| SyncError::ApplierClosed)?;
        rx.await.map_err(|_| SyncError::ApplierClosed)?
    }

    pub async fn current_state(&self) -> Result<Option<Arc<ClusterState>>> {
        let (response, rx) = oneshot::channel();
        self.command_tx
            .send(ApplierCommand::CurrentState { response })
            .await
            .map_err(|_| SyncError::ApplierClosed)?;
        rx.await.map_err(|_| SyncError::ApplierClosed)
    }

    pub async fn shutdown(&self) {
        let _ = self.command_tx.send(ApplierCommand::Shutdown).await;
    }
}

impl ApplierTask {
    async fn run(
        mut self,
        mut command_rx: mpsc::Receiver<ApplierCommand>,
        shutdown: ShutdownCoordinator,
    ) {
        loop {
            tokio::select! {
                cmd = command_rx.recv() => {
                    match cmd {
                        None | Some(ApplierCommand::Shutdown) => break,
                        Some(ApplierCommand::Apply { source, state, response }) => {
                            let result = self.handle_apply(source, state).await;
                            let _ = response.send(result);
                        }
                        Some(ApplierCommand::CurrentState { response }) => {
                            let _ = response.send(self.last_applied.clone());
                        }
                    }
                }
                _ = shutdown.wait_for_shutdown() => break,
            }
        }
        info!("Cluster state applier stopped");
    }

    async fn handle_apply(
        &mut self,
        source: String,
        state: Arc<ClusterState>,
    ) -> Result<ApplyOutcome> {
        if let Some(last) = &self.last_applied {
            if state.version < last.version {
                debug!(
                    received = state.version,
                    applied = last.version,
                    source = %source,
                    "Ignoring stale cluster state"
                );
                return Ok(ApplyOutcome::Stale {
                    applied_version: last.version,
                });
            }
            if state.version == last.version && state.nodes.master_id() == last.nodes.master_id() {
                trace!(version = state.version, "Cluster state already applied");
                return Ok(ApplyOutcome::AlreadyApplied);
            }
        }

        let event = ClusterChangedEvent::new(source, Arc::clone(&state), self.last_applied.clone());
        let listeners = self.listeners.clone();
        let result = tokio::task::spawn_blocking(move || {
            let mut first_error = None;
            for listener in &listeners {
                if let Err(e) = listener.cluster_changed(&event) {
                    warn!(
                        listener = listener.name(),
                        version = event.state.version,
                        error = %e,
                        "Failed to notify cluster state listener"
                    );
                    first_error.get_or_insert(e);
                }
            }
            first_error
        })
        .await
        .map_err(|e| SyncError::Internal(format!("listener task failed: {}", e)))?;

        if let Some(e) = result {
            return Err(e);
        }

        debug!(version = state.version, uuid = %state.state_uuid, "Applied cluster state");
        observability::update_applied_state_version(state.version);
        self.last_applied = Some(state);
        Ok(ApplyOutcome::Applied)
    }
}
