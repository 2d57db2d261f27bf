use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};

use tokio::sync::{oneshot, Notify};

use crate::error::TransportError;

/// A single-shot completion-style asynchronous operation.
///
/// `OpHandle` is what `Stream::send`/`Stream::recv` return to the caller:
/// enqueuing is synchronous (the op is already sitting in its queue by the
/// time the handle is returned), and completion arrives later, either from
/// a QUIC task or from the stream being closed. The handle carries the
/// cancellation flag the queue owner checks so a caller can abort a pending
/// op without needing a back-pointer into the queue itself.
pub struct OpHandle<T> {
    receiver: oneshot::Receiver<Result<T, TransportError>>,
    canceled: Arc<AtomicBool>,
    cancel_notify: Arc<Notify>,
}

impl<T> OpHandle<T> {
    /// Request cancellation. Has no effect if the op already completed.
    pub fn cancel(&self) {
        self.canceled.store(true, Ordering::SeqCst);
        self.cancel_notify.notify_waiters();
    }

    /// Wait for the op to complete.
    pub async fn wait(self) -> Result<T, TransportError> {
        self.await
    }
}

impl<T> Future for OpHandle<T> {
    type Output = Result<T, TransportError>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        match Pin::new(&mut self.receiver).poll(cx) {
            Poll::Ready(Ok(result)) => Poll::Ready(result),
            // The sender was dropped without completing the op, which only
            // happens when the queue that owned it was torn down.
            Poll::Ready(Err(_)) => Poll::Ready(Err(TransportError::Closed)),
            Poll::Pending => Poll::Pending,
        }
    }
}

/// The queue-side half of an op: the completion channel and cancellation
/// flag the owning queue (`Stream`) checks before and during submission.
pub(crate) struct OpSlot<T> {
    completion: Option<oneshot::Sender<Result<T, TransportError>>>,
    canceled: Arc<AtomicBool>,
    cancel_notify: Arc<Notify>,
}

impl<T> OpSlot<T> {
    pub(crate) fn is_canceled(&self) -> bool {
        self.canceled.load(Ordering::SeqCst)
    }

    /// A cheaply-cloned signal the send pump can race against an in-flight
    /// QUIC write, so a cancellation requested mid-submission aborts the
    /// write instead of being discovered only after it already succeeded.
    pub(crate) fn cancel_signal(&self) -> CancelSignal {
        CancelSignal {
            canceled: self.canceled.clone(),
            notify: self.cancel_notify.clone(),
        }
    }

    /// Complete the op exactly once. A second call is a no-op: ops are
    /// single-shot, and further mutation after completion is forbidden.
    pub(crate) fn complete(mut self, result: Result<T, TransportError>) {
        if let Some(tx) = self.completion.take() {
            let _ = tx.send(result);
        }
    }
}

/// A handle to an op's cancellation flag, independent of the queue lock.
#[derive(Clone)]
pub(crate) struct CancelSignal {
    canceled: Arc<AtomicBool>,
    notify: Arc<Notify>,
}

impl CancelSignal {
    pub(crate) fn is_canceled(&self) -> bool {
        self.canceled.load(Ordering::SeqCst)
    }

    /// Resolves once `cancel()` has been called. Resolves immediately if it
    /// already had been by the time this is awaited.
    pub(crate) async fn wait(&self) {
        loop {
            let notified = self.notify.notified();
            if self.is_canceled() {
                return;
            }
            notified.await;
        }
    }
}

/// Create a new op: the `OpSlot` is appended to a queue, the `OpHandle` is
/// returned to the caller.
pub(crate) fn new_op<T>() -> (OpSlot<T>, OpHandle<T>) {
    let (tx, rx) = oneshot::channel();
    let canceled = Arc::new(AtomicBool::new(false));
    let cancel_notify = Arc::new(Notify::new());
    (
        OpSlot {
            completion: Some(tx),
            canceled: canceled.clone(),
            cancel_notify: cancel_notify.clone(),
        },
        OpHandle {
            receiver: rx,
            canceled,
            cancel_notify,
        },
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn cancel_signal_wakes_a_waiter_already_parked() {
        let (slot, handle) = new_op::<()>();
        let signal = slot.cancel_signal();

        let waiter = tokio::spawn(async move {
            signal.wait().await;
        });

        tokio::task::yield_now().await;
        handle.cancel();
        waiter.await.unwrap();
    }

    #[tokio::test]
    async fn cancel_signal_resolves_immediately_if_already_canceled() {
        let (slot, handle) = new_op::<()>();
        handle.cancel();
        let signal = slot.cancel_signal();
        signal.wait().await;
        assert!(signal.is_canceled());
    }
}
