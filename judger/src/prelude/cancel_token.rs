use std::{
    future::Future,
    pin::Pin,
    task::{Context, Poll},
};

pub use tokio_util::sync::CancellationToken as CancellationTokenHandle;

/// A future that resolves to `None` as soon as its cancellation future
/// completes, or `Some(output)` if the inner future finishes first.
///
/// Cancellation is checked before the inner future on every poll, so an
/// already-cancelled token never lets the inner future make progress.
pub struct WithCancel<F, C> {
    fut: Pin<Box<F>>,
    cancel: Pin<Box<C>>,
}

impl<F, C> Future for WithCancel<F, C>
where
    F: Future,
    C: Future<Output = ()>,
{
    type Output = Option<F::Output>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        if self.cancel.as_mut().poll(cx).is_ready() {
            return Poll::Ready(None);
        }
        self.fut.as_mut().poll(cx).map(Some)
    }
}

pub trait CancelFutureExt: Future + Sized {
    fn with_cancel<C>(self, cancel: C) -> WithCancel<Self, C>
    where
        C: Future<Output = ()>,
    {
        WithCancel {
            fut: Box::pin(self),
            cancel: Box::pin(cancel),
        }
    }
}

impl<F: Future> CancelFutureExt for F {}

#[cfg(test)]
mod test {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn test_finishes_before_cancel() {
        let handle = CancellationTokenHandle::new();
        let res = async { 42 }.with_cancel(handle.cancelled()).await;
        assert_eq!(res, Some(42));
    }

    #[tokio::test]
    async fn test_cancelled_sleep() {
        let handle = CancellationTokenHandle::new();
        let child = handle.child_token();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            handle.cancel();
        });
        let res = tokio::time::sleep(Duration::from_secs(30))
            .with_cancel(child.cancelled())
            .await;
        assert!(res.is_none());
    }
}
