//! # Background Tasks
//!
//! Detached work started by a request but outside its completion contract:
//! duplicate-session cleanup, stale installation cleanup, verification
//! e-mails. A failed task is logged and reported on the outcome channel;
//! it never reaches the caller of the request that spawned it.

use std::future::Future;
use std::sync::Mutex;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::errors::EngineError;

/// Completion report of a detached task
#[derive(Debug, Clone)]
pub struct TaskOutcome {
    /// Task label, e.g. `destroy_duplicate_sessions`
    pub name: &'static str,
    /// `None` when the task succeeded
    pub error: Option<EngineError>,
}

impl TaskOutcome {
    pub fn is_success(&self) -> bool {
        self.error.is_none()
    }
}

/// Spawner for detached tasks with a completion channel
///
/// Outcomes are only queued once a listener has taken the receiver;
/// tasks spawned before that are logged and nothing more.
#[derive(Debug, Default)]
pub struct BackgroundTasks {
    sender: Mutex<Option<mpsc::UnboundedSender<TaskOutcome>>>,
}

impl BackgroundTasks {
    pub fn new() -> Self {
        Self {
            sender: Mutex::new(None),
        }
    }

    /// Open the outcome channel; only the first caller gets a receiver
    pub fn take_outcomes(&self) -> Option<mpsc::UnboundedReceiver<TaskOutcome>> {
        let mut slot = self.sender.lock().ok()?;
        if slot.is_some() {
            return None;
        }
        let (sender, receiver) = mpsc::unbounded_channel();
        *slot = Some(sender);
        Some(receiver)
    }

    /// Spawn a detached task
    pub fn spawn<F>(&self, name: &'static str, task: F) -> JoinHandle<()>
    where
        F: Future<Output = Result<(), EngineError>> + Send + 'static,
    {
        let sender = self.sender.lock().ok().and_then(|slot| slot.clone());
        tokio::spawn(async move {
            let result = task.await;
            match &result {
                Ok(()) => debug!(task = name, "background task finished"),
                Err(err) => warn!(task = name, error = %err, code = err.code(), "background task failed"),
            }
            if let Some(sender) = sender {
                // A dropped receiver closes the channel; the outcome is already logged.
                let _ = sender.send(TaskOutcome {
                    name,
                    error: result.err(),
                });
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_outcomes_are_reported() {
        let tasks = BackgroundTasks::new();
        let mut outcomes = tasks.take_outcomes().unwrap();

        tasks.spawn("ok", async { Ok(()) }).await.unwrap();
        tasks
            .spawn("fails", async { Err(EngineError::internal("boom")) })
            .await
            .unwrap();

        let first = outcomes.recv().await.unwrap();
        assert_eq!(first.name, "ok");
        assert!(first.is_success());

        let second = outcomes.recv().await.unwrap();
        assert_eq!(second.name, "fails");
        assert_eq!(second.error, Some(EngineError::internal("boom")));
    }

    #[tokio::test]
    async fn test_nothing_is_queued_without_a_listener() {
        let tasks = BackgroundTasks::new();
        for _ in 0..100 {
            tasks.spawn("unheard", async { Ok(()) }).await.unwrap();
        }

        let mut outcomes = tasks.take_outcomes().unwrap();
        assert!(outcomes.try_recv().is_err());

        tasks.spawn("heard", async { Ok(()) }).await.unwrap();
        assert_eq!(outcomes.recv().await.unwrap().name, "heard");
    }

    #[test]
    fn test_receiver_taken_once() {
        let tasks = BackgroundTasks::new();
        assert!(tasks.take_outcomes().is_some());
        assert!(tasks.take_outcomes().is_none());
    }
}
