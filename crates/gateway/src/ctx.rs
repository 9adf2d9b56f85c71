//! Request-scoped cancellation.
//!
//! Every suspension point downstream of a client request takes a
//! [`Context`]; dropping the client connection cancels in-flight dispatch,
//! dials, remote calls and fan-out updates.

use std::future::Future;

use tokio::sync::watch;
use tracing::info;

use crate::error::{Error, Result};

#[derive(Clone)]
pub struct Context {
    cancelled: Option<watch::Receiver<bool>>,
}

pub struct CancelHandle {
    tx: watch::Sender<bool>,
}

impl CancelHandle {
    pub fn cancel(&self) {
        let _ = self.tx.send(true);
    }
}

/// Creates a cancellable context and its cancel handle.
pub fn context() -> (CancelHandle, Context) {
    let (tx, rx) = watch::channel(false);
    (
        CancelHandle { tx },
        Context {
            cancelled: Some(rx),
        },
    )
}

impl Context {
    /// A context that is never cancelled, for background work that manages
    /// its own lifetime.
    pub fn background() -> Self {
        Self { cancelled: None }
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.as_ref().is_some_and(|rx| *rx.borrow())
    }

    /// Resolves once the context is cancelled; pends forever for background
    /// contexts.
    pub async fn cancelled(&self) {
        match &self.cancelled {
            None => std::future::pending().await,
            Some(rx) => {
                let mut rx = rx.clone();
                if *rx.borrow() {
                    return;
                }
                while rx.changed().await.is_ok() {
                    if *rx.borrow() {
                        return;
                    }
                }
                // Sender dropped without cancelling; treat as never-cancelled.
                std::future::pending().await
            }
        }
    }

    pub fn err(&self) -> Error {
        Error::internal("context canceled")
    }
}

/// Runs `f` detached and races it against context cancellation. If the
/// context wins, the task's eventual result is discarded (logged when it is
/// an error) and the caller sees the cancellation.
pub async fn run_with_context<T, F>(ctx: &Context, f: F) -> Result<T>
where
    T: Send + 'static,
    F: Future<Output = Result<T>> + Send + 'static,
{
    let ctx2 = ctx.clone();
    let handle = tokio::spawn(async move {
        let res = f.await;
        if ctx2.is_cancelled() {
            if let Err(err) = &res {
                info!(%err, "error in canceled task");
            }
        }
        res
    });

    tokio::select! {
        res = handle => match res {
            Ok(res) => res,
            Err(err) => Err(Error::internal("task failed").with_cause(err)),
        },
        _ = ctx.cancelled() => Err(ctx.err()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn background_context_never_cancels() {
        let ctx = Context::background();
        assert!(!ctx.is_cancelled());
        let res = run_with_context(&ctx, async { Ok(42) }).await.expect("run");
        assert_eq!(res, 42);
    }

    #[tokio::test]
    async fn cancellation_wins_over_slow_work() {
        let (handle, ctx) = context();
        let fut = run_with_context(&ctx, async {
            tokio::time::sleep(Duration::from_secs(30)).await;
            Ok(42)
        });
        handle.cancel();
        let err = fut.await.expect_err("cancelled");
        assert!(err.to_string().contains("context canceled"));
    }

    #[tokio::test]
    async fn completed_work_beats_cancellation() {
        let (_handle, ctx) = context();
        let res = run_with_context(&ctx, async { Ok("done") }).await.expect("run");
        assert_eq!(res, "done");
    }
}
