// ExecutionHandle - one in-flight inference
//
// Returned by Session::start_inference. The handle carries the run's ids and
// input snapshot, a cancellation token scoped to this run only, and a
// one-shot result slot. Any number of tasks may `wait()`; all see the same
// outcome.

use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

use crate::error::{InferenceError, Result};
use crate::turns::Turn;

pub struct ExecutionHandle {
    session_id: String,
    inference_id: String,
    input: Turn,
    cancel: CancellationToken,
    result: watch::Sender<Option<Result<Turn>>>,
}

impl ExecutionHandle {
    pub(crate) fn new(
        session_id: impl Into<String>,
        inference_id: impl Into<String>,
        input: Turn,
        cancel: CancellationToken,
    ) -> Self {
        let (result, _) = watch::channel(None);
        Self {
            session_id: session_id.into(),
            inference_id: inference_id.into(),
            input,
            cancel,
            result,
        }
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    pub fn inference_id(&self) -> &str {
        &self.inference_id
    }

    /// Turn as it was when the run started
    pub fn input(&self) -> &Turn {
        &self.input
    }

    /// Request cancellation of this run. Idempotent.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn is_cancel_requested(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// True until the result is available
    pub fn is_running(&self) -> bool {
        self.result.borrow().is_none()
    }

    /// Wait for the run to finish
    pub async fn wait(&self) -> Result<Turn> {
        let mut rx = self.result.subscribe();
        let outcome = rx
            .wait_for(Option::is_some)
            .await
            .map_err(|_| InferenceError::Join("execution result dropped".into()))?;
        match outcome.as_ref() {
            Some(result) => result.clone(),
            None => Err(InferenceError::Join("execution result missing".into())),
        }
    }

    /// Publish the outcome. Only the first call has an effect.
    pub(crate) fn set_result(&self, result: Result<Turn>) {
        self.result.send_if_modified(|slot| {
            if slot.is_some() {
                return false;
            }
            *slot = Some(result);
            true
        });
    }
}

impl std::fmt::Debug for ExecutionHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExecutionHandle")
            .field("session_id", &self.session_id)
            .field("inference_id", &self.inference_id)
            .field("running", &self.is_running())
            .field("cancel_requested", &self.is_cancel_requested())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::turns::Block;
    use std::sync::Arc;

    fn handle() -> Arc<ExecutionHandle> {
        Arc::new(ExecutionHandle::new("s1", "i1", Turn::new(), CancellationToken::new()))
    }

    #[tokio::test]
    async fn test_wait_sees_result_from_many_waiters() {
        let h = handle();
        let a = tokio::spawn({
            let h = h.clone();
            async move { h.wait().await }
        });
        let b = tokio::spawn({
            let h = h.clone();
            async move { h.wait().await }
        });

        assert!(h.is_running());
        h.set_result(Ok(Turn::with_blocks([Block::llm_text("done")])));

        let a = a.await.unwrap().unwrap();
        let b = b.await.unwrap().unwrap();
        assert_eq!(a.last_llm_text(), Some("done"));
        assert_eq!(a, b);
        assert!(!h.is_running());
    }

    #[tokio::test]
    async fn test_first_result_wins() {
        let h = handle();
        h.set_result(Err(InferenceError::Cancelled));
        h.set_result(Ok(Turn::new()));

        assert!(h.wait().await.unwrap_err().is_cancelled());
    }

    #[test]
    fn test_cancel_is_idempotent() {
        let h = handle();
        h.cancel();
        h.cancel();
        assert!(h.is_cancel_requested());
        assert_eq!(h.session_id(), "s1");
        assert_eq!(h.inference_id(), "i1");
    }
}
