//! Structured task supervision
//!
//! A [`Supervisor`] owns a group of named tasks. Cancellation is
//! cooperative through a shared [`CancellationToken`]; every task races its
//! future against the token, so a cancelled task exits at its next
//! suspension point and is not counted as failed.
//!
//! The first task that returns an error (or panics) cancels all of its
//! siblings and is surfaced once from [`Supervisor::gather`]. A partially
//! working group is never left running.

use std::collections::HashMap;
use std::future::Future;

use tokio::task::{Id, JoinSet};
use tokio_util::sync::CancellationToken;

use crate::{Error, Result};

/// Supervisor lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SupervisorState {
    /// Accepting new tasks
    Open,
    /// Cancellation issued, waiting for tasks to exit
    ShuttingDown,
    /// All tasks reached a terminal state
    Closed,
}

/// How a task left
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TaskExit {
    Completed,
    Cancelled,
}

/// Owner of a group of named tasks
#[derive(Debug)]
pub struct Supervisor {
    name: String,
    tasks: JoinSet<Result<TaskExit>>,
    names: HashMap<Id, String>,
    token: CancellationToken,
    state: SupervisorState,
}

impl Supervisor {
    /// Create a top-level supervisor
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self::with_token(name, CancellationToken::new())
    }

    /// Create a supervisor cancelled together with `token`
    ///
    /// Pass a child token of an outer supervisor to nest groups.
    #[must_use]
    pub fn with_token(name: impl Into<String>, token: CancellationToken) -> Self {
        Self {
            name: name.into(),
            tasks: JoinSet::new(),
            names: HashMap::new(),
            token,
            state: SupervisorState::Open,
        }
    }

    #[must_use]
    pub const fn state(&self) -> SupervisorState {
        self.state
    }

    /// Number of tasks not yet collected
    #[must_use]
    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    /// Token cancelling every task of this supervisor
    #[must_use]
    pub fn cancel_token(&self) -> CancellationToken {
        self.token.clone()
    }

    /// Token for a nested group, cancelled together with this one
    #[must_use]
    pub fn child_token(&self) -> CancellationToken {
        self.token.child_token()
    }

    /// Start a named task
    ///
    /// # Errors
    ///
    /// Returns [`Error::SupervisorClosed`] once shutdown has begun or the
    /// token was cancelled; no task is started then.
    pub fn spawn<F>(&mut self, name: impl Into<String>, future: F) -> Result<()>
    where
        F: Future<Output = Result<()>> + Send + 'static,
    {
        let name = name.into();
        if self.state != SupervisorState::Open || self.token.is_cancelled() {
            tracing::warn!(supervisor = %self.name, task = %name, "spawn rejected, supervisor closed");
            return Err(Error::SupervisorClosed(name));
        }

        let token = self.token.clone();
        let handle = self.tasks.spawn(async move {
            tokio::select! {
                biased;
                () = token.cancelled() => Ok(TaskExit::Cancelled),
                result = future => result.map(|()| TaskExit::Completed),
            }
        });

        tracing::debug!(supervisor = %self.name, task = %name, "spawned task");
        self.names.insert(handle.id(), name);
        Ok(())
    }

    /// Wait until every task has finished
    ///
    /// The first failure cancels all remaining tasks; once they have exited
    /// it is returned as [`Error::TaskFailed`] (or [`Error::TaskPanicked`]).
    /// The supervisor is closed afterwards.
    ///
    /// # Errors
    ///
    /// Returns the first escalated task failure
    pub async fn gather(&mut self) -> Result<()> {
        tracing::info!(supervisor = %self.name, tasks = self.tasks.len(), "awaiting tasks");

        let mut failure: Option<Error> = None;

        while let Some(joined) = self.tasks.join_next_with_id().await {
            match joined {
                Ok((id, Ok(TaskExit::Completed))) => {
                    let task = self.take_name(id);
                    tracing::debug!(supervisor = %self.name, %task, "task completed");
                }
                Ok((id, Ok(TaskExit::Cancelled))) => {
                    let task = self.take_name(id);
                    tracing::debug!(supervisor = %self.name, %task, "task cancelled");
                }
                Ok((id, Err(e))) => {
                    let task = self.take_name(id);
                    tracing::error!(supervisor = %self.name, %task, error = %e, "task failed");
                    if failure.is_none() {
                        self.begin_shutdown();
                        failure = Some(Error::TaskFailed {
                            task,
                            source: Box::new(e),
                        });
                    }
                }
                Err(join_error) => {
                    let task = self.take_name(join_error.id());
                    if join_error.is_cancelled() {
                        tracing::debug!(supervisor = %self.name, %task, "task aborted");
                    } else {
                        tracing::error!(supervisor = %self.name, %task, "task panicked");
                        if failure.is_none() {
                            self.begin_shutdown();
                            failure = Some(Error::TaskPanicked(task));
                        }
                    }
                }
            }
        }

        self.state = SupervisorState::Closed;
        failure.map_or(Ok(()), Err)
    }

    /// Cancel all tasks and wait for them to exit
    ///
    /// # Errors
    ///
    /// Returns a failure that was raised before cancellation took effect
    pub async fn shutdown(&mut self) -> Result<()> {
        self.begin_shutdown();
        self.gather().await
    }

    fn begin_shutdown(&mut self) {
        if self.state == SupervisorState::Open {
            tracing::info!(supervisor = %self.name, tasks = self.tasks.len(), "shutting down");
            self.state = SupervisorState::ShuttingDown;
        }
        self.token.cancel();
    }

    fn take_name(&mut self, id: Id) -> String {
        self.names
            .remove(&id)
            .unwrap_or_else(|| format!("task {id}"))
    }
}

impl Drop for Supervisor {
    fn drop(&mut self) {
        self.token.cancel();
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    use super::*;

    struct CountOnDrop(Arc<AtomicUsize>);

    impl Drop for CountOnDrop {
        fn drop(&mut self) {
            self.0.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[tokio::test]
    async fn completed_tasks_gather_ok() {
        let mut supervisor = Supervisor::new("test");
        for i in 0..3 {
            supervisor
                .spawn(format!("task {i}"), async { Ok(()) })
                .unwrap();
        }
        supervisor.gather().await.unwrap();
        assert_eq!(supervisor.state(), SupervisorState::Closed);
    }

    #[tokio::test]
    async fn failure_cancels_siblings_and_escalates_once() {
        let dropped = Arc::new(AtomicUsize::new(0));
        let mut supervisor = Supervisor::new("test");

        for i in 0..5 {
            let guard = CountOnDrop(Arc::clone(&dropped));
            supervisor
                .spawn(format!("task {i}"), async move {
                    let _guard = guard;
                    if i == 2 {
                        tokio::time::sleep(Duration::from_millis(10)).await;
                        return Err(Error::mesh("get_onoff", "timeout"));
                    }
                    std::future::pending::<()>().await;
                    Ok(())
                })
                .unwrap();
        }

        let err = supervisor.gather().await.unwrap_err();
        match err {
            Error::TaskFailed { task, source } => {
                assert_eq!(task, "task 2");
                assert!(matches!(*source, Error::MeshCallFailed { .. }));
            }
            other => panic!("unexpected error: {other}"),
        }
        assert_eq!(dropped.load(Ordering::SeqCst), 5);
        assert!(supervisor.is_empty());
    }

    #[tokio::test]
    async fn spawn_after_shutdown_is_rejected() {
        let mut supervisor = Supervisor::new("test");
        supervisor
            .spawn("idle", std::future::pending::<Result<()>>())
            .unwrap();
        supervisor.shutdown().await.unwrap();

        let err = supervisor.spawn("late", async { Ok(()) }).unwrap_err();
        assert!(matches!(err, Error::SupervisorClosed(name) if name == "late"));
        assert!(supervisor.is_empty());
    }

    #[tokio::test]
    async fn external_cancel_is_not_a_failure() {
        let mut supervisor = Supervisor::new("test");
        let token = supervisor.cancel_token();
        supervisor
            .spawn("idle", std::future::pending::<Result<()>>())
            .unwrap();

        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(5)).await;
            token.cancel();
        });

        supervisor.gather().await.unwrap();
        assert!(supervisor.spawn("late", async { Ok(()) }).is_err());
    }

    async fn explode() -> Result<()> {
        panic!("boom")
    }

    #[tokio::test]
    async fn panic_escalates() {
        let mut supervisor = Supervisor::new("test");
        supervisor.spawn("boom", explode()).unwrap();
        supervisor
            .spawn("idle", std::future::pending::<Result<()>>())
            .unwrap();

        let err = supervisor.gather().await.unwrap_err();
        assert!(matches!(err, Error::TaskPanicked(name) if name == "boom"));
    }

    #[tokio::test]
    async fn child_token_follows_parent() {
        let parent = Supervisor::new("parent");
        let mut child = Supervisor::with_token("child", parent.child_token());
        child
            .spawn("idle", std::future::pending::<Result<()>>())
            .unwrap();

        drop(parent);
        child.gather().await.unwrap();
    }
}
