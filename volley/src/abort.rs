use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::sync::watch;

/// Lifecycle of a single run as seen by the abort machinery.
///
/// `Running` moves to exactly one of the two abort requests or straight to
/// `Finished`; an abort request only ever moves on to `Finished`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AbortState {
    Running,
    SoftAbortRequested,
    HardAbortRequested,
    Finished,
}

/// How a run was stopped early.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AbortKind {
    /// In-flight iterations were allowed to finish.
    Soft,
    /// In-flight iterations were cancelled.
    Hard,
}

/// Shared stop flag for every worker thread and task of one run.
///
/// Backed by a `watch` channel so that workers can both poll the state and
/// await a hard abort. Clones observe the same state.
#[derive(Clone, Debug)]
pub struct AbortSignal {
    state: Arc<watch::Sender<AbortState>>,
}

impl Default for AbortSignal {
    fn default() -> Self {
        Self::new()
    }
}

impl AbortSignal {
    pub fn new() -> Self {
        let (tx, _) = watch::channel(AbortState::Running);
        Self {
            state: Arc::new(tx),
        }
    }

    /// Ask the run to stop. Returns `true` if this call changed the state;
    /// any request after the first one is ignored.
    pub fn request(&self, soft: bool) -> bool {
        let target = if soft {
            AbortState::SoftAbortRequested
        } else {
            AbortState::HardAbortRequested
        };
        let changed = self.state.send_if_modified(|state| {
            if *state == AbortState::Running {
                *state = target;
                true
            } else {
                false
            }
        });
        if changed {
            tracing::info!(soft, "Abort requested");
        }
        changed
    }

    /// Mark the run as over. Later abort requests become no-ops.
    pub(crate) fn finish(&self) {
        self.state.send_replace(AbortState::Finished);
    }

    pub fn state(&self) -> AbortState {
        *self.state.borrow()
    }

    /// True once either kind of abort was requested; no new iterations should start.
    pub fn is_set(&self) -> bool {
        self.kind().is_some()
    }

    pub fn is_hard(&self) -> bool {
        self.kind() == Some(AbortKind::Hard)
    }

    pub fn kind(&self) -> Option<AbortKind> {
        match self.state() {
            AbortState::SoftAbortRequested => Some(AbortKind::Soft),
            AbortState::HardAbortRequested => Some(AbortKind::Hard),
            AbortState::Running | AbortState::Finished => None,
        }
    }

    /// Resolves once a hard abort has been requested.
    pub async fn hard_abort_requested(&self) {
        let mut rx = self.state.subscribe();
        // The sender lives as long as `self`, so this can't fail while we wait.
        let _ = rx
            .wait_for(|state| *state == AbortState::HardAbortRequested)
            .await;
    }
}
