//! Execution workers and the completion handles returned by component
//! transitions.
use std::{fmt, future::Future};

use futures::future;
use tokio::{runtime::Handle, task::JoinHandle};
use tracing::error;

use crate::error::ServiceError;

/// Where component transitions run.
#[derive(Clone)]
pub struct Worker {
    handle: Handle,
}

impl Worker {
    pub fn new(handle: Handle) -> Self {
        Self { handle }
    }

    /// The worker of the runtime the caller is running in, if any.
    pub fn current() -> Option<Self> {
        Handle::try_current().ok().map(Self::new)
    }

    /// Spawn a transition and hand back its completion.
    pub fn spawn<F>(&self, task: F) -> Completion
    where
        F: Future<Output = Result<(), ServiceError>> + Send + 'static,
    {
        Completion::pending(self.handle.spawn(task))
    }

    /// Spawn a long running loop that nobody joins.
    pub fn spawn_background<F>(&self, task: F) -> JoinHandle<()>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        self.handle.spawn(task)
    }
}

impl fmt::Debug for Worker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Worker")
            .field("runtime", &self.handle.runtime_flavor())
            .finish()
    }
}

/// Completion handle of an asynchronous start, stop, update or swap.
///
/// The transition is already running when the handle is returned; awaiting
/// [`Completion::wait`] only joins it. A failure inside the task surfaces here.
#[must_use = "a completion must be waited on to observe failures"]
pub enum Completion {
    Ready(Result<(), ServiceError>),
    Pending(JoinHandle<Result<(), ServiceError>>),
}

impl Completion {
    pub fn ready() -> Self {
        Completion::Ready(Ok(()))
    }

    pub fn failed(err: ServiceError) -> Self {
        Completion::Ready(Err(err))
    }

    pub fn pending(handle: JoinHandle<Result<(), ServiceError>>) -> Self {
        Completion::Pending(handle)
    }

    pub async fn wait(self) -> Result<(), ServiceError> {
        match self {
            Completion::Ready(result) => result,
            Completion::Pending(handle) => match handle.await {
                Ok(result) => result,
                Err(join_err) => Err(ServiceError::TaskPanicked(join_err.to_string())),
            },
        }
    }

    /// Let the transition run without joining it. Failures of spawned tasks
    /// are logged by the task itself.
    pub fn detach(self) {
        if let Completion::Ready(Err(err)) = self {
            error!("{err}");
        }
    }
}

impl fmt::Debug for Completion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Completion::Ready(result) => f.debug_tuple("Ready").field(result).finish(),
            Completion::Pending(handle) => f
                .debug_tuple("Pending")
                .field(&handle.is_finished())
                .finish(),
        }
    }
}

/// Join every completion, then report the first failure.
///
/// All handles are awaited even when an early one failed, so no transition is
/// left running unobserved.
pub async fn join_all(completions: Vec<Completion>) -> Result<(), ServiceError> {
    let results = future::join_all(completions.into_iter().map(Completion::wait)).await;
    let mut first = None;
    for result in results {
        if let Err(err) = result {
            error!("service task failed: {err}");
            first.get_or_insert(err);
        }
    }
    match first {
        Some(err) => Err(err),
        None => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn join_all_waits_for_every_task() {
        let worker = Worker::current().expect("runtime");
        let (tx, rx) = tokio::sync::oneshot::channel::<()>();
        let slow = worker.spawn(async move {
            tokio::time::sleep(std::time::Duration::from_millis(20)).await;
            let _ = tx.send(());
            Ok(())
        });
        let failing = Completion::failed(ServiceError::TaskPanicked("boom".into()));

        let result = join_all(vec![failing, slow]).await;
        assert_eq!(result, Err(ServiceError::TaskPanicked("boom".into())));
        assert!(rx.await.is_ok());
    }

    #[tokio::test]
    async fn panicking_task_is_reported() {
        let worker = Worker::current().expect("runtime");
        let completion = worker.spawn(async {
            let missing: Option<u8> = None;
            missing.expect("no luck");
            Ok(())
        });
        assert!(matches!(
            completion.wait().await,
            Err(ServiceError::TaskPanicked(_))
        ));
    }
}
