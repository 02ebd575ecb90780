//! Publish options and the envelope that carries an event through a bus.

use std::time::Duration;

use tokio::sync::oneshot;

use crate::error::BusError;

/// Outcome reported to a publisher once the handler chain has run.
pub type DeliveryResult = Result<(), BusError>;

/// Called exactly once with the outcome of a publish, including one that
/// failed before the event was queued.
pub type AckCallback = Box<dyn FnOnce(DeliveryResult) + Send + 'static>;

/// Per-publish options.
///
/// ```ignore
/// let (tx, rx) = tokio::sync::oneshot::channel();
/// bus.publish(record, PublishOptions::new().with_ack_channel(tx)).await?;
/// rx.await??;
/// ```
#[derive(Default)]
pub struct PublishOptions {
    pub(crate) ack: Option<AckCallback>,
    pub(crate) wait: bool,
    pub(crate) deadline: Option<Duration>,
}

impl PublishOptions {
    pub fn new() -> Self {
        Self::default()
    }

    /// Receive the outcome through a callback, invoked asynchronously.
    pub fn with_ack<F>(mut self, callback: F) -> Self
    where
        F: FnOnce(DeliveryResult) + Send + 'static,
    {
        self.ack = Some(Box::new(callback));
        self
    }

    /// Receive the outcome through a oneshot channel.
    pub fn with_ack_channel(self, sender: oneshot::Sender<DeliveryResult>) -> Self {
        self.with_ack(move |outcome| {
            // The publisher may have stopped listening; nothing left to report to.
            let _ = sender.send(outcome);
        })
    }

    /// Make `publish` return only after the handler chain has run.
    ///
    /// Without an acknowledgment callback `publish` returns the handler
    /// outcome itself; with one, the callback receives it and `publish`
    /// returns `Ok` after the callback ran.
    pub fn with_wait(mut self) -> Self {
        self.wait = true;
        self
    }

    /// Bound the time `publish` may wait for room in a full queue.
    pub fn with_deadline(mut self, deadline: Duration) -> Self {
        self.deadline = Some(deadline);
        self
    }

    pub(crate) fn take_ack(&mut self) -> Option<AckCallback> {
        self.ack.take()
    }

    /// Fail a publish before any envelope exists.
    ///
    /// The callback, if any, receives the error too, so it runs exactly once
    /// on every path.
    pub fn reject(mut self, error: fn() -> BusError) -> BusError {
        if let Some(ack) = self.take_ack() {
            ack(Err(error()));
        }
        error()
    }

    /// Report `outcome` to the callback if there is one, otherwise hand it back.
    ///
    /// Publishers that complete synchronously end `publish` with this.
    pub fn settle(mut self, outcome: DeliveryResult) -> DeliveryResult {
        match self.take_ack() {
            Some(ack) => {
                ack(outcome);
                Ok(())
            }
            None => outcome,
        }
    }
}

impl core::fmt::Debug for PublishOptions {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("PublishOptions")
            .field("ack", &self.ack.is_some())
            .field("wait", &self.wait)
            .field("deadline", &self.deadline)
            .finish()
    }
}

/// An accepted event and its pending acknowledgment.
///
/// Dropping an envelope that was never acknowledged (runtime shutdown,
/// aborted dispatch) reports [`BusError::Cancelled`], so nobody waits forever.
pub(crate) struct Envelope<E> {
    pub(crate) event: E,
    ack: Option<AckCallback>,
}

impl<E> Envelope<E> {
    pub(crate) fn new(event: E, ack: Option<AckCallback>) -> Self {
        Self { event, ack }
    }

    pub(crate) fn acknowledge(mut self, outcome: DeliveryResult) {
        if let Some(ack) = self.ack.take() {
            ack(outcome);
        }
    }
}

impl<E> Drop for Envelope<E> {
    fn drop(&mut self) {
        if let Some(ack) = self.ack.take() {
            ack(Err(BusError::Cancelled));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};

    #[test]
    fn dropped_envelope_reports_cancellation() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        let envelope = Envelope::new(
            "evt",
            Some(Box::new(move |outcome: DeliveryResult| {
                sink.lock().unwrap().push(outcome.is_err());
            }) as AckCallback),
        );

        drop(envelope);

        assert_eq!(*seen.lock().unwrap(), vec![true]);
    }

    #[test]
    fn acknowledged_envelope_reports_once() {
        let seen = Arc::new(Mutex::new(0));
        let sink = seen.clone();
        let envelope = Envelope::new(
            "evt",
            Some(Box::new(move |outcome: DeliveryResult| {
                assert!(outcome.is_ok());
                *sink.lock().unwrap() += 1;
            }) as AckCallback),
        );

        envelope.acknowledge(Ok(()));

        assert_eq!(*seen.lock().unwrap(), 1);
    }

    #[tokio::test]
    async fn ack_channel_receives_outcome() {
        let (tx, rx) = oneshot::channel();
        let options = PublishOptions::new().with_ack_channel(tx);

        assert!(options.settle(Err(BusError::NotRunning)).is_ok());
        assert!(matches!(rx.await.unwrap(), Err(BusError::NotRunning)));
    }

    #[tokio::test]
    async fn rejected_publish_reaches_the_callback_and_the_caller() {
        let (tx, rx) = oneshot::channel();
        let options = PublishOptions::new().with_ack_channel(tx);

        assert!(matches!(options.reject(|| BusError::Cancelled), BusError::Cancelled));
        assert!(matches!(rx.await.unwrap(), Err(BusError::Cancelled)));
    }
}
