//! Event handlers and the panic-isolating invocation used by every bus.

use std::any::{Any, type_name};
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use futures::FutureExt;
use futures::future::BoxFuture;
use tracing::{error, warn};

use crate::bus::BusEvent;
use crate::error::BusError;
use crate::record::EventRecord;

/// A subscribed event handler.
///
/// Handlers receive their own clone of the event and report failure through
/// `anyhow`; the bus wraps it into [`BusError::Handler`].
pub type EventHandler<E> = Arc<dyn Fn(E) -> BoxFuture<'static, anyhow::Result<()>> + Send + Sync>;

/// Build a handler from an async closure.
pub fn handler_fn<E, F, Fut>(f: F) -> EventHandler<E>
where
    E: 'static,
    F: Fn(E) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
{
    Arc::new(move |event: E| f(event).boxed())
}

/// Build a handler that only accepts records carrying a `T` payload.
///
/// A record with any other payload type fails the handler with a
/// descriptive error instead of reaching `f`.
pub fn typed_handler<T, F, Fut>(f: F) -> EventHandler<EventRecord>
where
    T: Any + Clone + Send + Sync,
    F: Fn(EventRecord, T) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
{
    Arc::new(move |record: EventRecord| {
        let payload = record.data::<T>().cloned();
        match payload {
            Some(payload) => f(record, payload).boxed(),
            None => {
                let err = anyhow::anyhow!(
                    "event {}/{} does not carry a {}",
                    record.name(),
                    record.id(),
                    type_name::<T>()
                );
                async move { Err::<(), _>(err) }.boxed()
            }
        }
    })
}

/// Run one handler, turning both failures and panics into a [`BusError`].
pub(crate) async fn invoke<E: BusEvent>(handler: &EventHandler<E>, event: E) -> Result<(), BusError> {
    let name = event.event_name().to_string();
    let id = event.event_id();

    // The closure call itself may panic before producing a future.
    let outcome = AssertUnwindSafe(async { handler(event).await })
        .catch_unwind()
        .await;

    match outcome {
        Ok(Ok(())) => Ok(()),
        Ok(Err(source)) => {
            warn!(event = %name, id = %id, error = %source, "event handler failed");
            Err(BusError::Handler { event: name, source })
        }
        Err(panic) => {
            let message = panic_message(panic.as_ref());
            error!(event = %name, id = %id, panic = %message, "event handler panicked");
            Err(BusError::HandlerPanicked { event: name, message })
        }
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}
