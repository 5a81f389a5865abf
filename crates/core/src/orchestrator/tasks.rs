use std::future::Future;
use std::time::Duration;
use tokio::task::JoinSet;

/// Every background task the session starts. Finished tasks are reaped lazily.
#[derive(Default)]
pub(crate) struct TaskSet {
    tasks: JoinSet<()>,
}

impl TaskSet {
    pub(crate) fn spawn<F>(&mut self, name: &'static str, task: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        tracing::trace!("spawning {} task", name);
        self.tasks.spawn(task);
    }

    pub(crate) fn reap(&mut self) {
        while let Some(result) = self.tasks.try_join_next() {
            log_join(result);
        }
    }

    pub(crate) fn len(&self) -> usize {
        self.tasks.len()
    }

    /// Waits for every task to finish, aborting whatever is left after `limit`.
    /// Returns how many tasks had to be aborted.
    pub(crate) async fn join_all(&mut self, limit: Duration) -> usize {
        let tasks = &mut self.tasks;
        let joined = tokio::time::timeout(limit, async {
            while let Some(result) = tasks.join_next().await {
                log_join(result);
            }
        })
        .await;
        if joined.is_ok() {
            return 0;
        }
        let stragglers = self.tasks.len();
        self.tasks.abort_all();
        while self.tasks.join_next().await.is_some() {}
        stragglers
    }
}

fn log_join(result: Result<(), tokio::task::JoinError>) {
    if let Err(e) = result {
        if e.is_panic() {
            tracing::error!("background task panicked: {}", e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_join_all_aborts_stragglers() {
        let mut tasks = TaskSet::default();
        tasks.spawn("quick", async {});
        tasks.spawn("stuck", std::future::pending());
        assert_eq!(tasks.join_all(Duration::from_millis(20)).await, 1);
        assert_eq!(tasks.len(), 0);
    }

    #[tokio::test]
    async fn test_reap_drops_finished() {
        let mut tasks = TaskSet::default();
        tasks.spawn("quick", async {});
        tokio::time::sleep(Duration::from_millis(10)).await;
        tasks.reap();
        assert_eq!(tasks.len(), 0);
    }
}
