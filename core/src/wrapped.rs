//! Wrapped-client backend: an interceptor pipeline around a pluggable
//! HTTP transport.
//!
//! # Design
//! A [`WrappedTransport`] performs one request described by a
//! [`RequestConfig`]. Method-named helpers (`get`, `post`, ...) build the
//! config, so a transport only has to implement [`WrappedTransport::request`].
//!
//! [`WrappedClient`] layers the driver's hooks on top of an inner transport:
//!
//! 1. request transforms mutate the outgoing config, sync first, then async
//!    in registration order; any failure aborts the call;
//! 2. the inner transport performs the request;
//! 3. on failure, the error handler may recover with a reply;
//! 4. on a response, observers run and their failures are discarded.

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;

use crate::envelope::{ResponseData, ResponseEnvelope};
use crate::error::DriverError;
use crate::hooks::{
    invoke_propagating, invoke_swallowing, rethrow_handler, run_propagating, run_swallowing,
    AsyncRequestTransform, AsyncResponseTransform, ErrorHandler, ErrorInterceptorFactory,
    InterceptorContext, RefreshQueue, RequestTransform, ResponseTransform,
};
use crate::http::{normalize_headers, HttpMethod};
use crate::options::RequestOptions;
use crate::payload::Payload;

/// One outgoing request on the wrapped-client path.
#[derive(Debug, Clone, PartialEq)]
pub struct RequestConfig {
    pub url: String,
    pub method: HttpMethod,
    /// Body for methods that carry one.
    pub data: Option<Payload>,
    pub options: RequestOptions,
}

impl RequestConfig {
    pub fn new(method: HttpMethod, url: impl Into<String>, data: Option<Payload>, options: RequestOptions) -> Self {
        Self {
            url: url.into(),
            method,
            data,
            options,
        }
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        crate::http::find_header(&self.options.headers, name)
    }
}

/// Response as reported by a wrapped transport.
#[derive(Debug, Clone, PartialEq)]
pub struct TransportResponse {
    pub status: u16,
    pub status_text: String,
    /// Loosely-shaped header source, normalized when enveloped.
    pub headers: Value,
    pub data: ResponseData,
}

impl TransportResponse {
    pub fn new(status: u16, data: ResponseData) -> Self {
        Self {
            status,
            status_text: String::new(),
            headers: Value::Object(Default::default()),
            data,
        }
    }

    pub fn into_envelope(self, duration: f64) -> ResponseEnvelope {
        ResponseEnvelope::from_response(
            self.status,
            self.data,
            normalize_headers(&self.headers),
            Some(self.status_text),
            duration,
        )
    }
}

/// What a wrapped transport resolves with.
#[derive(Debug, Clone, PartialEq)]
pub enum TransportReply {
    Response(TransportResponse),
    /// An interceptor already produced the final envelope.
    Normalized(ResponseEnvelope),
    /// Resolved with nothing at all.
    Empty,
}

/// A transport the wrapped client can drive.
#[async_trait]
pub trait WrappedTransport: Send + Sync {
    async fn request(&self, config: RequestConfig) -> Result<TransportReply, DriverError>;

    async fn get(&self, url: &str, options: &RequestOptions) -> Result<TransportReply, DriverError> {
        self.request(RequestConfig::new(HttpMethod::Get, url, None, options.clone()))
            .await
    }

    async fn delete(&self, url: &str, options: &RequestOptions) -> Result<TransportReply, DriverError> {
        self.request(RequestConfig::new(HttpMethod::Delete, url, None, options.clone()))
            .await
    }

    async fn head(&self, url: &str, options: &RequestOptions) -> Result<TransportReply, DriverError> {
        self.request(RequestConfig::new(HttpMethod::Head, url, None, options.clone()))
            .await
    }

    async fn post(&self, url: &str, data: Payload, options: &RequestOptions) -> Result<TransportReply, DriverError> {
        self.request(RequestConfig::new(HttpMethod::Post, url, Some(data), options.clone()))
            .await
    }

    async fn put(&self, url: &str, data: Payload, options: &RequestOptions) -> Result<TransportReply, DriverError> {
        self.request(RequestConfig::new(HttpMethod::Put, url, Some(data), options.clone()))
            .await
    }

    async fn patch(&self, url: &str, data: Payload, options: &RequestOptions) -> Result<TransportReply, DriverError> {
        self.request(RequestConfig::new(HttpMethod::Patch, url, Some(data), options.clone()))
            .await
    }

    async fn link(&self, url: &str, data: Payload, options: &RequestOptions) -> Result<TransportReply, DriverError> {
        self.request(RequestConfig::new(HttpMethod::Link, url, Some(data), options.clone()))
            .await
    }

    async fn unlink(&self, url: &str, data: Payload, options: &RequestOptions) -> Result<TransportReply, DriverError> {
        self.request(RequestConfig::new(HttpMethod::Unlink, url, Some(data), options.clone()))
            .await
    }
}

/// Invoke the method-named call matching `method`.
///
/// Read-only methods receive only the URL and options; the rest also get the
/// payload as their body.
pub async fn dispatch_method(
    transport: &dyn WrappedTransport,
    method: HttpMethod,
    url: &str,
    payload: Payload,
    options: &RequestOptions,
) -> Result<TransportReply, DriverError> {
    match method {
        HttpMethod::Get => transport.get(url, options).await,
        HttpMethod::Delete => transport.delete(url, options).await,
        HttpMethod::Head => transport.head(url, options).await,
        HttpMethod::Post => transport.post(url, payload, options).await,
        HttpMethod::Put => transport.put(url, payload, options).await,
        HttpMethod::Patch => transport.patch(url, payload, options).await,
        HttpMethod::Link => transport.link(url, payload, options).await,
        HttpMethod::Unlink => transport.unlink(url, payload, options).await,
    }
}

/// Hooks attached to a [`WrappedClient`].
#[derive(Default, Clone)]
pub struct Interceptors {
    pub request: Option<RequestTransform>,
    pub async_request: Vec<AsyncRequestTransform>,
    pub response: Option<ResponseTransform>,
    pub async_response: Vec<AsyncResponseTransform>,
    pub error: Option<ErrorInterceptorFactory>,
}

/// A transport with the driver's interceptors installed.
#[derive(Clone)]
pub struct WrappedClient {
    inner: Arc<dyn WrappedTransport>,
    request: Option<RequestTransform>,
    async_request: Vec<AsyncRequestTransform>,
    response: Option<ResponseTransform>,
    async_response: Vec<AsyncResponseTransform>,
    on_error: ErrorHandler,
    queue: Arc<RefreshQueue>,
}

impl WrappedClient {
    /// Install `interceptors` around `inner`. The error-interceptor factory,
    /// if any, is invoked here, once.
    pub fn new(inner: Arc<dyn WrappedTransport>, interceptors: Interceptors) -> Self {
        let queue = Arc::new(RefreshQueue::new());
        let on_error = match &interceptors.error {
            Some(factory) => factory(InterceptorContext {
                transport: Arc::clone(&inner),
                queue: Arc::clone(&queue),
            }),
            None => rethrow_handler(),
        };
        Self {
            inner,
            request: interceptors.request,
            async_request: interceptors.async_request,
            response: interceptors.response,
            async_response: interceptors.async_response,
            on_error,
            queue,
        }
    }

    /// The transport without interceptors.
    pub fn inner(&self) -> &Arc<dyn WrappedTransport> {
        &self.inner
    }

    pub fn refresh_queue(&self) -> &Arc<RefreshQueue> {
        &self.queue
    }

    async fn prepare(&self, config: &mut RequestConfig) -> Result<(), DriverError> {
        if let Some(hook) = &self.request {
            invoke_propagating(hook.as_ref(), config)?;
        }
        run_propagating(&self.async_request, config).await
    }

    async fn observe(&self, response: &mut TransportResponse) {
        if let Some(hook) = &self.response {
            let envelope = response.clone().into_envelope(0.0);
            invoke_swallowing(hook.as_ref(), &envelope);
        }
        run_swallowing(&self.async_response, response).await;
    }
}

#[async_trait]
impl WrappedTransport for WrappedClient {
    async fn request(&self, mut config: RequestConfig) -> Result<TransportReply, DriverError> {
        self.prepare(&mut config).await?;

        let RequestConfig {
            url,
            method,
            data,
            options,
        } = config;
        let result = dispatch_method(
            self.inner.as_ref(),
            method,
            &url,
            data.unwrap_or_else(Payload::empty),
            &options,
        )
        .await;

        match result {
            Ok(TransportReply::Response(mut response)) => {
                self.observe(&mut response).await;
                Ok(TransportReply::Response(response))
            }
            Ok(other) => Ok(other),
            Err(e) => (self.on_error)(e).await,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::TransportError;
    use crate::hooks::{error_handler, TransformRegistrar};
    use serde_json::json;
    use std::sync::Mutex;

    /// Records every config it sees and answers with a canned result.
    struct Recorder {
        seen: Mutex<Vec<RequestConfig>>,
        fail_first: Mutex<bool>,
    }

    impl Recorder {
        fn new(fail_first: bool) -> Arc<Self> {
            Arc::new(Self {
                seen: Mutex::new(Vec::new()),
                fail_first: Mutex::new(fail_first),
            })
        }
    }

    #[async_trait]
    impl WrappedTransport for Recorder {
        async fn request(&self, config: RequestConfig) -> Result<TransportReply, DriverError> {
            self.seen.lock().unwrap().push(config.clone());
            let mut fail = self.fail_first.lock().unwrap();
            if *fail {
                *fail = false;
                let response = TransportResponse::new(401, ResponseData::Null);
                return Err(TransportError::new("unauthorized")
                    .with_response(response)
                    .with_config(config)
                    .into());
            }
            Ok(TransportReply::Response(TransportResponse::new(
                200,
                ResponseData::Json(json!({"method": config.method.as_str()})),
            )))
        }
    }

    #[tokio::test]
    async fn read_only_methods_drop_payload() {
        let recorder = Recorder::new(false);
        let payload = Payload::object().with("x", 1i64);
        dispatch_method(recorder.as_ref(), HttpMethod::Delete, "/a", payload.clone(), &RequestOptions::new())
            .await
            .unwrap();
        dispatch_method(recorder.as_ref(), HttpMethod::Link, "/a", payload.clone(), &RequestOptions::new())
            .await
            .unwrap();
        let seen = recorder.seen.lock().unwrap();
        assert_eq!(seen[0].data, None);
        assert_eq!(seen[1].data, Some(payload));
        assert_eq!(seen[1].method, HttpMethod::Link);
    }

    #[tokio::test]
    async fn request_transforms_run_before_dispatch() {
        let recorder = Recorder::new(false);
        let sync_hook: RequestTransform = Arc::new(|config: &mut RequestConfig| -> Result<(), DriverError> {
            config.options.headers.insert("X-Sync".into(), "1".into());
            Ok(())
        });
        let mut registrar = TransformRegistrar::<RequestConfig>::default();
        registrar.register(|config: &mut RequestConfig| {
            Box::pin(async move {
                let seen_sync = config.header("x-sync").is_some();
                config.options.headers.insert("X-Async".into(), seen_sync.to_string());
                Ok(())
            })
        });
        let client = WrappedClient::new(
            recorder.clone(),
            Interceptors {
                request: Some(sync_hook),
                async_request: registrar.into_transforms(),
                ..Default::default()
            },
        );
        client.get("/users", &RequestOptions::new()).await.unwrap();
        let seen = recorder.seen.lock().unwrap();
        assert_eq!(seen[0].options.headers["X-Async"], "true");
    }

    #[tokio::test]
    async fn failing_request_transform_aborts_call() {
        let recorder = Recorder::new(false);
        let hook: RequestTransform =
            Arc::new(|_: &mut RequestConfig| -> Result<(), DriverError> { Err(DriverError::message("no token")) });
        let client = WrappedClient::new(
            recorder.clone(),
            Interceptors {
                request: Some(hook),
                ..Default::default()
            },
        );
        let err = client.get("/users", &RequestOptions::new()).await.unwrap_err();
        assert_eq!(err.to_string(), "no token");
        assert!(recorder.seen.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn failing_response_observer_is_ignored() {
        let recorder = Recorder::new(false);
        let hook: ResponseTransform =
            Arc::new(|_: &ResponseEnvelope| -> Result<(), DriverError> { Err(DriverError::message("observer")) });
        let client = WrappedClient::new(
            recorder,
            Interceptors {
                response: Some(hook),
                ..Default::default()
            },
        );
        let reply = client.get("/users", &RequestOptions::new()).await.unwrap();
        assert!(matches!(reply, TransportReply::Response(r) if r.status == 200));
    }

    #[tokio::test]
    async fn error_interceptor_can_replay() {
        let recorder = Recorder::new(true);
        let factory: ErrorInterceptorFactory = Arc::new(|ctx: InterceptorContext| {
            error_handler(move |error: DriverError| {
                let ctx = ctx.clone();
                async move {
                    match error {
                        DriverError::Transport(TransportError { config: Some(mut config), .. }) => {
                            config.options.headers.insert("Authorization".into(), "Bearer new".into());
                            ctx.replay(config).await
                        }
                        other => Err(other),
                    }
                }
            })
        });
        let client = WrappedClient::new(
            recorder.clone(),
            Interceptors {
                error: Some(factory),
                ..Default::default()
            },
        );
        let reply = client.get("/me", &RequestOptions::new()).await.unwrap();
        assert!(matches!(reply, TransportReply::Response(r) if r.status == 200));
        let seen = recorder.seen.lock().unwrap();
        assert_eq!(seen.len(), 2);
        assert_eq!(seen[1].header("authorization"), Some("Bearer new"));
    }

    #[tokio::test]
    async fn default_error_handler_rethrows() {
        let client = WrappedClient::new(Recorder::new(true), Interceptors::default());
        let err = client.get("/me", &RequestOptions::new()).await.unwrap_err();
        assert!(matches!(err, DriverError::Transport(t) if t.response.as_ref().map(|r| r.status) == Some(401)));
    }
}
