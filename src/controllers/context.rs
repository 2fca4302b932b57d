//! Per-pass reconcile context

use crate::error::{Error, Result};
use std::future::Future;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::Span;

/// Handed to every `reconcile`/`finalize` call
#[derive(Debug, Clone)]
pub struct ReconcileContext {
    /// Monotonic id of this pass, also recorded on the span
    pub id: u64,
    cancel: CancellationToken,
    call_timeout: Duration,
    span: Span,
}

impl ReconcileContext {
    pub fn new(id: u64, cancel: CancellationToken, call_timeout: Duration, span: Span) -> Self {
        Self {
            id,
            cancel,
            call_timeout,
            span,
        }
    }

    /// Context with its own token and a 30s call timeout
    pub fn background() -> Self {
        Self::new(0, CancellationToken::new(), Duration::from_secs(30), Span::none())
    }

    /// Span of this pass
    pub fn span(&self) -> &Span {
        &self.span
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Run one external call, bounded by the call timeout and abandoned as
    /// soon as the engine is stopping
    pub async fn call<T, F>(&self, operation: &str, call: F) -> Result<T>
    where
        F: Future<Output = Result<T>>,
    {
        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => Err(Error::Cancelled {
                operation: operation.to_string(),
            }),
            result = tokio::time::timeout(self.call_timeout, call) => match result {
                Ok(result) => result,
                Err(_) => Err(Error::Timeout {
                    operation: operation.to_string(),
                    timeout: self.call_timeout,
                }),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_call_passes_result_through() {
        let ctx = ReconcileContext::background();
        let value = ctx.call("Describe", async { Ok(7) }).await.unwrap();
        assert_eq!(value, 7);
    }

    #[tokio::test]
    async fn test_cancelled_context_skips_call() {
        let cancel = CancellationToken::new();
        let ctx = ReconcileContext::new(1, cancel.clone(), Duration::from_secs(30), Span::none());
        cancel.cancel();

        let err = ctx
            .call("Describe", async { Ok::<_, Error>(()) })
            .await
            .unwrap_err();
        assert!(err.is_cancelled());
    }

    #[tokio::test(start_paused = true)]
    async fn test_slow_call_times_out() {
        let ctx = ReconcileContext::new(
            1,
            CancellationToken::new(),
            Duration::from_secs(2),
            Span::none(),
        );

        let err = ctx
            .call("Describe", async {
                tokio::time::sleep(Duration::from_secs(10)).await;
                Ok::<_, Error>(())
            })
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Timeout { .. }));
    }
}
