use std::future::Future;

use tokio_util::sync::CancellationToken;

use crate::error::{PipelineError, Result};

/// Cancellation scope threaded through every store, collaborator and publish call.
///
/// A router creates one per delivery as a child of its abort token, which it
/// cancels when in-flight handlers outlive the shutdown grace period.
#[derive(Clone, Debug, Default)]
pub struct Ctx {
    cancel: CancellationToken,
}

impl Ctx {
    pub fn new(cancel: CancellationToken) -> Self {
        Self { cancel }
    }

    /// A context that is never cancelled unless `cancel` is called on it.
    pub fn background() -> Self {
        Self::default()
    }

    pub fn child(&self) -> Self {
        Self { cancel: self.cancel.child_token() }
    }

    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    pub fn token(&self) -> &CancellationToken {
        &self.cancel
    }

    /// Fail fast with `Cancelled` if the scope is already cancelled.
    pub fn check(&self) -> Result<()> {
        if self.is_cancelled() {
            Err(PipelineError::Cancelled)
        } else {
            Ok(())
        }
    }

    /// Drive `fut` to completion unless the scope is cancelled first.
    pub async fn run<T, F>(&self, fut: F) -> Result<T>
    where
        F: Future<Output = Result<T>>,
    {
        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => Err(PipelineError::Cancelled),
            res = fut => res,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn run_returns_inner_result_when_not_cancelled() {
        let ctx = Ctx::background();
        let value = ctx.run(async { Ok::<_, PipelineError>(7) }).await.unwrap();
        assert_eq!(value, 7);
    }

    #[tokio::test]
    async fn run_returns_cancelled_when_scope_cancelled_mid_flight() {
        let ctx = Ctx::background();
        let child = ctx.child();
        let handle = tokio::spawn(async move {
            child
                .run(async {
                    tokio::time::sleep(Duration::from_secs(30)).await;
                    Ok::<_, PipelineError>(())
                })
                .await
        });
        ctx.cancel();
        let res = handle.await.unwrap();
        assert!(matches!(res, Err(PipelineError::Cancelled)));
    }

    #[test]
    fn check_reports_cancellation() {
        let ctx = Ctx::background();
        assert!(ctx.check().is_ok());
        ctx.cancel();
        assert!(ctx.check().unwrap_err().is_cancelled());
    }
}
