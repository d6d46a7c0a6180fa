use std::collections::HashMap;
use std::future::Future;
use std::time::Duration;

use tokio::task::{Id, JoinError, JoinSet};
use tokio_util::sync::CancellationToken;

/// How the supervised tasks ended.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExitReport {
    pub finished: Vec<String>,
    pub failed: Vec<String>,
    /// Tasks still running when the grace period ran out.
    pub aborted: usize,
}

/// Owns every long-running task of the process.
///
/// Each task receives a child of the supervisor's cancellation token. Task
/// exits are logged as they happen; a failing task does not bring down the
/// others.
pub struct Supervisor {
    tasks: JoinSet<anyhow::Result<()>>,
    names: HashMap<Id, String>,
    cancel: CancellationToken,
    grace: Duration,
}

impl Supervisor {
    pub fn new() -> Self {
        Self {
            tasks: JoinSet::new(),
            names: HashMap::new(),
            cancel: CancellationToken::new(),
            grace: Duration::from_secs(10),
        }
    }

    /// How long [`run`](Self::run) waits for tasks after cancelling them.
    pub fn with_grace(mut self, grace: Duration) -> Self {
        self.grace = grace;
        self
    }

    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    pub fn spawn<F, Fut>(&mut self, name: impl Into<String>, task: F)
    where
        F: FnOnce(CancellationToken) -> Fut,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        let name = name.into();
        let handle = self.tasks.spawn(task(self.cancel.child_token()));
        tracing::info!(task = %name, "Task started");
        self.names.insert(handle.id(), name);
    }

    /// Wait for `shutdown` or for every task to exit, whichever comes first.
    /// On shutdown, cancel all tasks and wait up to the grace period for them.
    pub async fn run(mut self, shutdown: impl Future<Output = ()>) -> ExitReport {
        let mut report = ExitReport::default();
        tokio::pin!(shutdown);

        loop {
            tokio::select! {
                _ = &mut shutdown => {
                    tracing::info!(tasks = self.tasks.len(), "Shutdown requested, cancelling tasks");
                    break;
                }
                joined = self.tasks.join_next_with_id() => match joined {
                    Some(result) => self.record(result, &mut report),
                    None => {
                        tracing::info!("All tasks exited");
                        return report;
                    }
                }
            }
        }

        self.cancel.cancel();
        let grace = self.grace;
        let drained = tokio::time::timeout(grace, async {
            while let Some(result) = self.tasks.join_next_with_id().await {
                self.record(result, &mut report);
            }
        })
        .await;

        if drained.is_err() {
            report.aborted = self.tasks.len();
            tracing::warn!(
                remaining = report.aborted,
                grace_secs = grace.as_secs(),
                "Tasks did not stop in time, aborting"
            );
            self.tasks.abort_all();
            while self.tasks.join_next().await.is_some() {}
        }

        report
    }

    fn record(
        &mut self,
        result: Result<(Id, anyhow::Result<()>), JoinError>,
        report: &mut ExitReport,
    ) {
        match result {
            Ok((id, Ok(()))) => {
                let name = self.names.remove(&id).unwrap_or_default();
                tracing::info!(task = %name, "Task exited");
                report.finished.push(name);
            }
            Ok((id, Err(e))) => {
                let name = self.names.remove(&id).unwrap_or_default();
                tracing::error!(task = %name, error = %e, "Task failed");
                report.failed.push(name);
            }
            Err(e) => {
                let name = self.names.remove(&e.id()).unwrap_or_default();
                tracing::error!(task = %name, error = %e, "Task panicked or was aborted");
                report.failed.push(name);
            }
        }
    }
}

impl Default for Supervisor {
    fn default() -> Self {
        Self::new()
    }
}
