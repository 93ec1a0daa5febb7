//! Per-call request options and cancellation.
//!
//! # Design
//! Options are layered: a service may preset some (typically headers) and the
//! caller adds more per call. Call-level values win; headers merge key by
//! key. An abort signal may be given directly or through a nested
//! `AbortController`; the nested one is only used when no direct signal is
//! present.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::Notify;

use crate::http::ResponseType;

#[derive(Debug, Default)]
struct AbortState {
    aborted: AtomicBool,
    notify: Notify,
}

/// Owner side of a cancellation pair.
#[derive(Debug, Clone, Default)]
pub struct AbortController {
    state: Arc<AbortState>,
}

impl AbortController {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn signal(&self) -> AbortSignal {
        AbortSignal {
            state: Arc::clone(&self.state),
        }
    }

    /// Cancel every in-flight call observing this controller's signal.
    pub fn abort(&self) {
        self.state.aborted.store(true, Ordering::SeqCst);
        self.state.notify.notify_waiters();
    }
}

impl PartialEq for AbortController {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.state, &other.state)
    }
}

/// Observer side of a cancellation pair.
#[derive(Debug, Clone)]
pub struct AbortSignal {
    state: Arc<AbortState>,
}

impl AbortSignal {
    pub fn is_aborted(&self) -> bool {
        self.state.aborted.load(Ordering::SeqCst)
    }

    /// Resolves once the owning controller aborts.
    pub async fn aborted(&self) {
        loop {
            let notified = self.state.notify.notified();
            if self.is_aborted() {
                return;
            }
            notified.await;
        }
    }
}

impl PartialEq for AbortSignal {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.state, &other.state)
    }
}

/// Request options for one call.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RequestOptions {
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub headers: BTreeMap<String, String>,
    #[serde(skip)]
    pub signal: Option<AbortSignal>,
    #[serde(skip)]
    pub abort_controller: Option<AbortController>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub response_type: Option<ResponseType>,
    /// Per-call timeout in milliseconds.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_ms: Option<u64>,
}

impl RequestOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(name.into(), value.into());
        self
    }

    pub fn signal(mut self, signal: AbortSignal) -> Self {
        self.signal = Some(signal);
        self
    }

    pub fn abort_controller(mut self, controller: AbortController) -> Self {
        self.abort_controller = Some(controller);
        self
    }

    pub fn response_type(mut self, response_type: ResponseType) -> Self {
        self.response_type = Some(response_type);
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout_ms = Some(timeout.as_millis() as u64);
        self
    }

    pub fn timeout_duration(&self) -> Option<Duration> {
        self.timeout_ms.map(Duration::from_millis)
    }

    /// Layer `overrides` on top of `self`.
    pub fn merged_with(&self, overrides: &RequestOptions) -> RequestOptions {
        let mut headers = self.headers.clone();
        headers.extend(overrides.headers.iter().map(|(k, v)| (k.clone(), v.clone())));
        RequestOptions {
            headers,
            signal: overrides.signal.clone().or_else(|| self.signal.clone()),
            abort_controller: overrides
                .abort_controller
                .clone()
                .or_else(|| self.abort_controller.clone()),
            response_type: overrides.response_type.or(self.response_type),
            timeout_ms: overrides.timeout_ms.or(self.timeout_ms),
        }
    }

    /// Copy the nested controller's signal into `signal` when none is set.
    pub fn lift_abort_signal(&mut self) {
        if self.signal.is_none() {
            if let Some(controller) = &self.abort_controller {
                self.signal = Some(controller.signal());
            }
        }
    }
}
