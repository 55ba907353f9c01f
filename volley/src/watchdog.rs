//! Background killer for iterations that overrun their timeout.
//!
//! The pool registers every unit it starts together with its deadline. The
//! watchdog sleeps until the earliest deadline and, if that unit is still
//! running, aborts its task.
//!
//! Termination is best effort: aborting a tokio task only takes effect the next
//! time the task yields at an `.await`. A scenario stuck in blocking code keeps
//! its thread until it returns.

use std::{
    collections::VecDeque,
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
};

use tokio::{
    sync::mpsc,
    task::{AbortHandle, JoinHandle},
    time::Instant,
};

enum Watch {
    Track(Deadline),
    Stop,
}

struct Deadline {
    index: u64,
    at: Instant,
    handle: AbortHandle,
    expired: Arc<AtomicBool>,
}

/// Handle to a running watchdog task. Must be created inside a tokio runtime.
pub struct TimeoutWatchdog {
    tx: mpsc::UnboundedSender<Watch>,
    task: JoinHandle<usize>,
}

impl TimeoutWatchdog {
    pub fn spawn() -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        Self {
            tx,
            task: tokio::spawn(watch_deadlines(rx)),
        }
    }

    /// Abort `handle` if it is still running at `deadline`. `expired` is set
    /// before the abort, so the owner can tell a timeout from other
    /// cancellations.
    pub fn track(
        &self,
        index: u64,
        deadline: Instant,
        handle: AbortHandle,
        expired: Arc<AtomicBool>,
    ) {
        let _ = self.tx.send(Watch::Track(Deadline {
            index,
            at: deadline,
            handle,
            expired,
        }));
    }

    /// Shut the watchdog down and return how many units it terminated.
    ///
    /// Deadlines still pending are dropped without being enforced.
    pub async fn stop(self) -> usize {
        let _ = self.tx.send(Watch::Stop);
        self.task.await.unwrap_or_default()
    }
}

async fn watch_deadlines(mut rx: mpsc::UnboundedReceiver<Watch>) -> usize {
    let mut pending: VecDeque<Deadline> = VecDeque::new();
    let mut terminated = 0;

    loop {
        let message = match pending.front() {
            None => rx.recv().await,
            Some(next) => {
                let at = next.at;
                tokio::select! {
                    biased;
                    message = rx.recv() => message,
                    _ = tokio::time::sleep_until(at) => {
                        if let Some(due) = pending.pop_front() {
                            if !due.handle.is_finished() {
                                tracing::warn!("Iteration {} is timed out. Terminating.", due.index);
                                due.expired.store(true, Ordering::Release);
                                due.handle.abort();
                                terminated += 1;
                            }
                        }
                        continue;
                    }
                }
            }
        };

        match message {
            Some(Watch::Track(deadline)) => {
                let slot = pending.partition_point(|d| d.at <= deadline.at);
                pending.insert(slot, deadline);
            }
            Some(Watch::Stop) | None => break,
        }
    }

    terminated
}
