//! Caller-supplied hooks and how they are invoked.
//!
//! # Design
//! Request-side hooks run through [`invoke_propagating`] /
//! [`run_propagating`]: a failure aborts the call and is classified like any
//! other error. Response-side hooks run through [`invoke_swallowing`] /
//! [`run_swallowing`]: a failure is logged at debug level and discarded, so a
//! misbehaving observer never turns a received response into a failure.
//!
//! Token-refresh coordination lives in a [`RefreshQueue`] owned by one driver
//! and handed to the error-interceptor factory; nothing is process-global.

use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use futures::future::BoxFuture;
use tokio::sync::oneshot;
use tracing::debug;

use crate::envelope::ResponseEnvelope;
use crate::error::DriverError;
use crate::fetch::FetchOptions;
use crate::wrapped::{RequestConfig, TransportReply, TransportResponse, WrappedTransport};

/// Synchronous request mutator; an error aborts the call.
pub type RequestTransform = Arc<dyn Fn(&mut RequestConfig) -> Result<(), DriverError> + Send + Sync>;

/// Synchronous response observer; errors are discarded.
pub type ResponseTransform = Arc<dyn Fn(&ResponseEnvelope) -> Result<(), DriverError> + Send + Sync>;

/// Asynchronous transform over `T`, awaited in registration order.
pub type AsyncTransform<T> =
    Arc<dyn for<'a> Fn(&'a mut T) -> BoxFuture<'a, Result<(), DriverError>> + Send + Sync>;

pub type AsyncRequestTransform = AsyncTransform<RequestConfig>;
pub type AsyncResponseTransform = AsyncTransform<TransportResponse>;

/// Handler for failed wrapped-client requests. May recover with a reply.
pub type ErrorHandler =
    Arc<dyn Fn(DriverError) -> BoxFuture<'static, Result<TransportReply, DriverError>> + Send + Sync>;

/// Builds the [`ErrorHandler`] once, when the wrapped client is constructed.
pub type ErrorInterceptorFactory = Arc<dyn Fn(InterceptorContext) -> ErrorHandler + Send + Sync>;

/// Rewrites URL and options right before a fetch call.
pub type FetchRequestTransform = Arc<dyn Fn(String, FetchOptions) -> (String, FetchOptions) + Send + Sync>;

/// Post-processes a fetch envelope before it is returned.
pub type FetchResponseTransform = Arc<dyn Fn(ResponseEnvelope) -> ResponseEnvelope + Send + Sync>;

/// Collects asynchronous transforms.
pub struct TransformRegistrar<T> {
    transforms: Vec<AsyncTransform<T>>,
}

impl<T> Default for TransformRegistrar<T> {
    fn default() -> Self {
        Self {
            transforms: Vec::new(),
        }
    }
}

impl<T> TransformRegistrar<T> {
    pub fn register<F>(&mut self, transform: F)
    where
        F: for<'a> Fn(&'a mut T) -> BoxFuture<'a, Result<(), DriverError>> + Send + Sync + 'static,
    {
        self.transforms.push(Arc::new(transform));
    }

    pub fn len(&self) -> usize {
        self.transforms.len()
    }

    pub fn is_empty(&self) -> bool {
        self.transforms.is_empty()
    }

    pub(crate) fn into_transforms(self) -> Vec<AsyncTransform<T>> {
        self.transforms
    }
}

pub fn invoke_propagating<T: ?Sized>(
    hook: &(dyn Fn(&mut T) -> Result<(), DriverError> + Send + Sync),
    target: &mut T,
) -> Result<(), DriverError> {
    hook(target)
}

pub fn invoke_swallowing<T: ?Sized>(
    hook: &(dyn Fn(&T) -> Result<(), DriverError> + Send + Sync),
    target: &T,
) {
    if let Err(e) = hook(target) {
        debug!(error = %e, "response hook failed, ignoring");
    }
}

pub async fn run_propagating<T>(transforms: &[AsyncTransform<T>], target: &mut T) -> Result<(), DriverError> {
    for transform in transforms {
        transform(target).await?;
    }
    Ok(())
}

/// Stops at the first failing transform and discards its error.
pub async fn run_swallowing<T>(transforms: &[AsyncTransform<T>], target: &mut T) {
    for transform in transforms {
        if let Err(e) = transform(target).await {
            debug!(error = %e, "async response hook failed, ignoring");
            return;
        }
    }
}

/// Outcome handed to requests parked while a refresh runs.
pub type RefreshOutcome = Result<Option<String>, String>;

/// Per-driver state for the token-refresh pattern: a refreshing flag and the
/// requests waiting for the refresh to finish.
#[derive(Debug, Default)]
pub struct RefreshQueue {
    refreshing: AtomicBool,
    waiting: Mutex<Vec<oneshot::Sender<RefreshOutcome>>>,
}

impl RefreshQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_refreshing(&self) -> bool {
        self.refreshing.load(Ordering::SeqCst)
    }

    /// Claim the refresh. Returns `false` if another caller already holds it.
    pub fn try_begin(&self) -> bool {
        self.refreshing
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
    }

    pub fn finish(&self) {
        self.refreshing.store(false, Ordering::SeqCst);
    }

    /// Park until the current refresh is processed.
    pub fn enqueue(&self) -> oneshot::Receiver<RefreshOutcome> {
        let (tx, rx) = oneshot::channel();
        self.waiting
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(tx);
        rx
    }

    pub fn pending(&self) -> usize {
        self.waiting.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    /// Settle every parked request with `outcome` and empty the queue.
    pub fn process(&self, outcome: RefreshOutcome) -> usize {
        let waiting = std::mem::take(&mut *self.waiting.lock().unwrap_or_else(PoisonError::into_inner));
        let count = waiting.len();
        for tx in waiting {
            let _ = tx.send(outcome.clone());
        }
        count
    }
}

/// What an error-interceptor factory receives.
#[derive(Clone)]
pub struct InterceptorContext {
    /// The raw transport, without interceptors, for replaying requests.
    pub transport: Arc<dyn WrappedTransport>,
    pub queue: Arc<RefreshQueue>,
}

impl InterceptorContext {
    /// Send `config` again straight to the raw transport.
    pub async fn replay(&self, config: RequestConfig) -> Result<TransportReply, DriverError> {
        self.transport.request(config).await
    }
}

/// Box an async closure into an [`ErrorHandler`].
pub fn error_handler<F, Fut>(handler: F) -> ErrorHandler
where
    F: Fn(DriverError) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<TransportReply, DriverError>> + Send + 'static,
{
    Arc::new(move |error: DriverError| -> BoxFuture<'static, Result<TransportReply, DriverError>> {
        Box::pin(handler(error))
    })
}

/// The default handler: reject with the original error.
pub fn rethrow_handler() -> ErrorHandler {
    error_handler(|error| async move { Err(error) })
}
