//! The driver facade and its builder.
//!
//! # Design
//! A built [`Driver`] is immutable: configuration, the intercepted wrapped
//! client and the fetch transport sit behind one `Arc`, so clones are cheap
//! and concurrent calls share nothing mutable except what the transports
//! themselves own.
//!
//! Both exec entry points follow the same shape: resolve the service,
//! compile URL and payload, dispatch, then normalize. Every runtime failure
//! ends up in the returned [`ResponseEnvelope`]; only [`DriverBuilder::build`]
//! can fail, with a [`ConfigError`].

use std::future::Future;
use std::sync::Arc;
use std::time::Instant;

use tracing::{debug, error, instrument, Span};

use crate::compile::{append_query, compile_body, compile_url, CompiledRequest, APPLICATION_JSON, MULTIPART_FORM_DATA};
use crate::envelope::{round_millis, ResponseEnvelope};
use crate::error::{ConfigError, DriverError, TransportError};
use crate::fetch::{decode_body, FetchOptions, FetchTransport};
use crate::hooks::{
    ErrorHandler, ErrorInterceptorFactory, FetchRequestTransform, FetchResponseTransform, InterceptorContext,
    TransformRegistrar,
};
use crate::http::{find_header, header_map_to_value, normalize_headers, HttpMethod};
use crate::normalize::{handle_error, normalize_transport_error};
use crate::options::{AbortSignal, RequestOptions};
use crate::payload::Payload;
use crate::query::stringify_query;
use crate::reqwest_transport::ReqwestTransport;
use crate::types::{compile_service, ApiVersion, CompiledService, ServiceDescriptor, ServiceRef, ServiceRegistry};
use crate::version::{build_url_with_version, VersionConfig, VersionPosition};
use crate::wrapped::{
    dispatch_method, Interceptors, RequestConfig, TransportReply, TransportResponse, WrappedClient, WrappedTransport,
};

/// Problem text when the wrapped transport resolves with nothing.
pub const NO_RESPONSE: &str = "No response from service call";

/// Frozen configuration of a built driver.
#[derive(Debug, Clone, PartialEq)]
pub struct DriverConfig {
    pub base_url: String,
    pub services: Vec<ServiceDescriptor>,
    pub versioning: Option<VersionConfig>,
}

impl DriverConfig {
    /// Absolute URL for a compiled service, version applied.
    pub fn full_url(&self, compiled: &CompiledService) -> Result<String, ConfigError> {
        let versioning = self.versioning.as_ref();
        let version = versioning.and_then(|cfg| cfg.effective_version(compiled.version.as_ref()));
        build_url_with_version(&self.base_url, &compiled.path, version, versioning)
    }
}

/// Result of [`Driver::resolve_url`].
#[derive(Debug, Clone, PartialEq)]
pub struct ResolvedUrl {
    pub full_url: String,
    /// Relative path, query included when a GET payload was folded.
    pub pathname: String,
    pub method: HttpMethod,
    /// `None` when the payload was folded into the query string.
    pub payload: Option<Payload>,
}

struct DriverInner {
    config: DriverConfig,
    client: WrappedClient,
    fetch: Arc<dyn FetchTransport>,
    fetch_request: Option<FetchRequestTransform>,
    fetch_response: Option<FetchResponseTransform>,
}

/// A configured service driver.
#[derive(Clone)]
pub struct Driver {
    inner: Arc<DriverInner>,
}

fn aborted() -> DriverError {
    TransportError::new("The operation was aborted")
        .with_code("ERR_CANCELED")
        .into()
}

/// Race `call` against `signal`. An abort drops the in-flight call.
async fn with_abort<T, F>(signal: Option<&AbortSignal>, call: F) -> Result<T, DriverError>
where
    F: Future<Output = Result<T, DriverError>>,
{
    let Some(signal) = signal else {
        return call.await;
    };
    if signal.is_aborted() {
        return Err(aborted());
    }
    tokio::select! {
        result = call => result,
        _ = signal.aborted() => Err(aborted()),
    }
}

impl Driver {
    pub fn builder() -> DriverBuilder {
        DriverBuilder::new()
    }

    pub fn config(&self) -> &DriverConfig {
        &self.inner.config
    }

    /// The intercepted wrapped client, for calls outside the registry.
    pub fn client(&self) -> &WrappedClient {
        &self.inner.client
    }

    fn prepare(
        &self,
        service: &ServiceRef,
        payload: Option<Payload>,
        options: Option<RequestOptions>,
    ) -> Result<CompiledRequest, ResponseEnvelope> {
        let Some(compiled) = compile_service(service, &self.inner.config.services) else {
            error!(service.id = %service.id, "Service {} in driver not found", service.id);
            return Err(ResponseEnvelope::service_not_found(&service.id));
        };
        let url = self
            .inner
            .config
            .full_url(&compiled)
            .map_err(|e| handle_error(e.into()))?;
        let options = match options {
            Some(call) => compiled.options.merged_with(&call),
            None => compiled.options,
        };
        let mut request = compile_url(&url, compiled.method, payload, Some(options));
        request.options.lift_abort_signal();
        Ok(request)
    }

    /// Dispatch through the wrapped client's method-named call.
    #[instrument(
        name = "exec_via_wrapped_client",
        skip(self, service, payload, options),
        fields(
            service.id = %service.id,
            http.method = tracing::field::Empty,
            http.url = tracing::field::Empty,
            http.status_code = tracing::field::Empty,
        )
    )]
    pub async fn exec_via_wrapped_client(
        &self,
        service: &ServiceRef,
        payload: Option<Payload>,
        options: Option<RequestOptions>,
    ) -> ResponseEnvelope {
        let request = match self.prepare(service, payload, options) {
            Ok(request) => request,
            Err(envelope) => return envelope,
        };
        let span = Span::current();
        span.record("http.method", request.method.as_str());
        span.record("http.url", request.url.as_str());

        let CompiledRequest {
            url,
            method,
            payload,
            options,
        } = request;
        let start = Instant::now();
        let result = with_abort(
            options.signal.as_ref(),
            dispatch_method(&self.inner.client, method, &url, payload, &options),
        )
        .await;
        let duration = round_millis(start.elapsed());

        let envelope = match result {
            Ok(TransportReply::Response(response)) => response.into_envelope(duration),
            Ok(TransportReply::Normalized(envelope)) => envelope,
            Ok(TransportReply::Empty) => ResponseEnvelope::failure(500, NO_RESPONSE, NO_RESPONSE).with_duration(duration),
            Err(DriverError::Transport(e)) => normalize_transport_error(&e, duration),
            Err(e) => handle_error(e),
        };
        span.record("http.status_code", envelope.status);
        envelope
    }

    /// Dispatch through the raw fetch transport.
    #[instrument(
        name = "exec_via_fetch",
        skip(self, service, payload, options),
        fields(
            service.id = %service.id,
            http.method = tracing::field::Empty,
            http.url = tracing::field::Empty,
            http.status_code = tracing::field::Empty,
        )
    )]
    pub async fn exec_via_fetch(
        &self,
        service: &ServiceRef,
        payload: Option<Payload>,
        options: Option<RequestOptions>,
    ) -> ResponseEnvelope {
        let request = match self.prepare(service, payload, options) {
            Ok(request) => request,
            Err(envelope) => return envelope,
        };
        let span = Span::current();
        span.record("http.method", request.method.as_str());
        span.record("http.url", request.url.as_str());

        let envelope = match self.fetch(request).await {
            Ok(envelope) => envelope,
            Err(e) => handle_error(e),
        };
        span.record("http.status_code", envelope.status);
        envelope
    }

    async fn fetch(&self, request: CompiledRequest) -> Result<ResponseEnvelope, DriverError> {
        let CompiledRequest {
            url,
            method,
            payload,
            options,
        } = request;

        let mut headers = options.headers.clone();
        if find_header(&headers, "Content-Type").is_none() {
            headers.insert("Content-Type".to_string(), APPLICATION_JSON.to_string());
        }
        let content_type = find_header(&headers, "Content-Type").map(str::to_ascii_lowercase);

        let mut fetch_options = FetchOptions {
            method: None,
            headers: Some(headers),
            body: None,
            signal: options.signal.clone(),
            timeout: options.timeout_duration(),
        };
        if method != HttpMethod::Get {
            fetch_options.method = Some(method);
            fetch_options.body = Some(compile_body(content_type.as_deref(), &payload));
            if content_type.as_deref() == Some(MULTIPART_FORM_DATA) {
                fetch_options.headers = None;
            }
        }

        let (url, fetch_options) = match &self.inner.fetch_request {
            Some(hook) => hook(url, fetch_options),
            None => (url, fetch_options),
        };

        let start = Instant::now();
        let signal = fetch_options.signal.clone();
        let response = with_abort(signal.as_ref(), self.inner.fetch.fetch(&url, fetch_options)).await?;
        let duration = round_millis(start.elapsed());

        let content_type = response.content_type();
        let (status, status_text, headers, body) = response.into_parts();
        let body = match with_abort(signal.as_ref(), body).await {
            Err(DriverError::Transport(e)) if e.is_canceled() || e.is_timeout() => return Err(e.into()),
            other => other,
        };
        let data = decode_body(body, &content_type, options.response_type)?;
        debug!(status, duration, "fetch response decoded");

        let envelope = ResponseEnvelope::from_response(
            status,
            data,
            normalize_headers(&header_map_to_value(&headers)),
            Some(status_text),
            duration,
        );
        Ok(match &self.inner.fetch_response {
            Some(hook) => hook(envelope),
            None => envelope,
        })
    }

    /// Resolve a service to its final URL without dispatching.
    ///
    /// Returns `None` for unknown services. GET payloads with at least one
    /// key are folded into the query string of both `full_url` and
    /// `pathname`, and the returned payload is `None`.
    pub fn resolve_url(&self, service: &ServiceRef, payload: Option<Payload>) -> Option<ResolvedUrl> {
        let compiled = compile_service(service, &self.inner.config.services)?;
        let full_url = self.inner.config.full_url(&compiled).ok()?;
        let payload = payload.unwrap_or_else(Payload::empty);

        if compiled.method == HttpMethod::Get && payload.has_keys() {
            let query = stringify_query(&payload);
            return Some(ResolvedUrl {
                full_url: append_query(&full_url, &query),
                pathname: append_query(&compiled.path, &query),
                method: compiled.method,
                payload: None,
            });
        }

        Some(ResolvedUrl {
            full_url,
            pathname: compiled.path,
            method: compiled.method,
            payload: Some(payload),
        })
    }
}

type Registration<T> = Box<dyn FnOnce(&mut TransformRegistrar<T>) + Send>;

/// Fluent configuration for a [`Driver`].
///
/// Every hook setter replaces any earlier registration of the same hook.
#[derive(Default)]
pub struct DriverBuilder {
    base_url: String,
    services: Vec<ServiceDescriptor>,
    versioning: Option<VersionConfig>,
    interceptors: Interceptors,
    async_request: Option<Registration<RequestConfig>>,
    async_response: Option<Registration<TransportResponse>>,
    fetch_request: Option<FetchRequestTransform>,
    fetch_response: Option<FetchResponseTransform>,
    wrapped_transport: Option<Arc<dyn WrappedTransport>>,
    fetch_transport: Option<Arc<dyn FetchTransport>>,
}

impl DriverBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into();
        self
    }

    pub fn with_services(mut self, services: Vec<ServiceDescriptor>) -> Self {
        self.services = services;
        self
    }

    pub fn with_registry(self, registry: ServiceRegistry) -> Self {
        self.with_services(registry.services)
    }

    pub fn with_version_config(mut self, config: VersionConfig) -> Self {
        self.versioning = Some(config);
        self
    }

    fn versioning(&mut self) -> &mut VersionConfig {
        self.versioning.get_or_insert_with(VersionConfig::default)
    }

    /// Default version for services that declare none. Does not enable
    /// versioning by itself.
    pub fn with_global_version(mut self, version: impl Into<ApiVersion>) -> Self {
        self.versioning().default_version = Some(version.into());
        self
    }

    /// Switch to a custom template and enable versioning.
    pub fn with_version_template(mut self, template: impl Into<String>) -> Self {
        let versioning = self.versioning();
        versioning.template = Some(template.into());
        versioning.position = VersionPosition::Custom;
        versioning.enabled = true;
        self
    }

    pub fn enable_versioning(mut self, enabled: bool) -> Self {
        self.versioning().enabled = enabled;
        self
    }

    /// Sync request mutator for the wrapped client. An error aborts the call.
    pub fn with_request_transform<F>(mut self, transform: F) -> Self
    where
        F: Fn(&mut RequestConfig) -> Result<(), DriverError> + Send + Sync + 'static,
    {
        self.interceptors.request = Some(Arc::new(transform));
        self
    }

    /// Registers async request transforms. `register` runs once, at build.
    pub fn with_async_request_transform<F>(mut self, register: F) -> Self
    where
        F: FnOnce(&mut TransformRegistrar<RequestConfig>) + Send + 'static,
    {
        self.async_request = Some(Box::new(register));
        self
    }

    /// Response observer for the wrapped client. Errors are ignored.
    pub fn with_response_transform<F>(mut self, transform: F) -> Self
    where
        F: Fn(&ResponseEnvelope) -> Result<(), DriverError> + Send + Sync + 'static,
    {
        self.interceptors.response = Some(Arc::new(transform));
        self
    }

    /// Registers async response transforms. `register` runs once, at build.
    pub fn with_async_response_transform<F>(mut self, register: F) -> Self
    where
        F: FnOnce(&mut TransformRegistrar<TransportResponse>) + Send + 'static,
    {
        self.async_response = Some(Box::new(register));
        self
    }

    pub fn with_error_interceptor<F>(mut self, factory: F) -> Self
    where
        F: Fn(InterceptorContext) -> ErrorHandler + Send + Sync + 'static,
    {
        let factory: ErrorInterceptorFactory = Arc::new(factory);
        self.interceptors.error = Some(factory);
        self
    }

    pub fn with_fetch_request_transform<F>(mut self, transform: F) -> Self
    where
        F: Fn(String, FetchOptions) -> (String, FetchOptions) + Send + Sync + 'static,
    {
        self.fetch_request = Some(Arc::new(transform));
        self
    }

    pub fn with_fetch_response_transform<F>(mut self, transform: F) -> Self
    where
        F: Fn(ResponseEnvelope) -> ResponseEnvelope + Send + Sync + 'static,
    {
        self.fetch_response = Some(Arc::new(transform));
        self
    }

    /// Replace the default reqwest transport on the wrapped-client path.
    pub fn with_wrapped_transport(mut self, transport: Arc<dyn WrappedTransport>) -> Self {
        self.wrapped_transport = Some(transport);
        self
    }

    /// Replace the default reqwest transport on the fetch path.
    pub fn with_fetch_transport(mut self, transport: Arc<dyn FetchTransport>) -> Self {
        self.fetch_transport = Some(transport);
        self
    }

    pub fn build(self) -> Result<Driver, ConfigError> {
        if self.base_url.is_empty() || self.services.is_empty() {
            return Err(ConfigError::MissingConfiguration);
        }
        if let Some(versioning) = &self.versioning {
            versioning.validate()?;
        }

        let mut interceptors = self.interceptors;
        if let Some(register) = self.async_request {
            let mut registrar = TransformRegistrar::default();
            register(&mut registrar);
            interceptors.async_request = registrar.into_transforms();
        }
        if let Some(register) = self.async_response {
            let mut registrar = TransformRegistrar::default();
            register(&mut registrar);
            interceptors.async_response = registrar.into_transforms();
        }

        let (wrapped, fetch) = match (self.wrapped_transport, self.fetch_transport) {
            (Some(wrapped), Some(fetch)) => (wrapped, fetch),
            (wrapped, fetch) => {
                let default = Arc::new(ReqwestTransport::new()?);
                let wrapped = wrapped.unwrap_or_else(|| Arc::clone(&default) as Arc<dyn WrappedTransport>);
                let fetch = fetch.unwrap_or_else(|| default as Arc<dyn FetchTransport>);
                (wrapped, fetch)
            }
        };

        Ok(Driver {
            inner: Arc::new(DriverInner {
                config: DriverConfig {
                    base_url: self.base_url,
                    services: self.services,
                    versioning: self.versioning,
                },
                client: WrappedClient::new(wrapped, interceptors),
                fetch,
                fetch_request: self.fetch_request,
                fetch_response: self.fetch_response,
            }),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::envelope::ResponseData;
    use crate::fetch::FetchResponse;
    use crate::hooks::error_handler;
    use crate::options::AbortController;
    use async_trait::async_trait;
    use reqwest::header::{HeaderMap, CONTENT_TYPE};
    use serde_json::json;
    use std::sync::Mutex;
    use std::time::Duration;
    use tracing_test::traced_test;

    /// Answers every request from a closure and records what it saw.
    struct Scripted {
        seen: Mutex<Vec<RequestConfig>>,
        reply: Box<dyn Fn(&RequestConfig) -> Result<TransportReply, DriverError> + Send + Sync>,
    }

    impl Scripted {
        fn new<F>(reply: F) -> Arc<Self>
        where
            F: Fn(&RequestConfig) -> Result<TransportReply, DriverError> + Send + Sync + 'static,
        {
            Arc::new(Self {
                seen: Mutex::new(Vec::new()),
                reply: Box::new(reply),
            })
        }

        fn ok() -> Arc<Self> {
            Self::new(|_| {
                Ok(TransportReply::Response(TransportResponse {
                    status: 200,
                    status_text: "OK".to_string(),
                    headers: json!({"Content-Type": "application/json"}),
                    data: ResponseData::Json(json!({"ok": true})),
                }))
            })
        }
    }

    #[async_trait]
    impl WrappedTransport for Scripted {
        async fn request(&self, config: RequestConfig) -> Result<TransportReply, DriverError> {
            self.seen.lock().unwrap().push(config.clone());
            (self.reply)(&config)
        }
    }

    /// Fetch transport that records its inputs and returns a fixed response.
    struct FixedFetch {
        seen: Mutex<Vec<(String, FetchOptions)>>,
        status: u16,
        content_type: &'static str,
        body: &'static str,
        delay: Option<Duration>,
    }

    impl FixedFetch {
        fn new(status: u16, content_type: &'static str, body: &'static str) -> Arc<Self> {
            Arc::new(Self {
                seen: Mutex::new(Vec::new()),
                status,
                content_type,
                body,
                delay: None,
            })
        }
    }

    #[async_trait]
    impl FetchTransport for FixedFetch {
        async fn fetch(&self, url: &str, options: FetchOptions) -> Result<FetchResponse, DriverError> {
            self.seen.lock().unwrap().push((url.to_string(), options));
            if let Some(delay) = self.delay {
                tokio::time::sleep(delay).await;
            }
            let mut headers = HeaderMap::new();
            if !self.content_type.is_empty() {
                headers.insert(CONTENT_TYPE, self.content_type.parse().unwrap());
            }
            headers.append("x-tag", "a".parse().unwrap());
            headers.append("x-tag", "b".parse().unwrap());
            Ok(FetchResponse::new(self.status, headers, self.body))
        }
    }

    fn services() -> Vec<ServiceDescriptor> {
        vec![
            ServiceDescriptor::new("user.get", "users/{id}", HttpMethod::Get),
            ServiceDescriptor::new("user.create", "users", HttpMethod::Post),
            ServiceDescriptor::new("user.remove", "users/{id}", HttpMethod::Delete),
            ServiceDescriptor::new("doc.upload", "docs", HttpMethod::Post)
                .with_options(RequestOptions::new().header("Content-Type", MULTIPART_FORM_DATA)),
            ServiceDescriptor::new("report.get", "reports/{id}", HttpMethod::Get).with_version(2),
        ]
    }

    fn driver_with(wrapped: Arc<Scripted>, fetch: Arc<FixedFetch>) -> Driver {
        Driver::builder()
            .with_base_url("https://api.test")
            .with_services(services())
            .with_wrapped_transport(wrapped)
            .with_fetch_transport(fetch)
            .build()
            .unwrap()
    }

    #[test]
    fn build_requires_base_url_and_services() {
        let err = Driver::builder().with_services(services()).build().err();
        assert_eq!(err, Some(ConfigError::MissingConfiguration));
        let err = Driver::builder().with_base_url("https://api.test").build().err();
        assert_eq!(err, Some(ConfigError::MissingConfiguration));
    }

    #[test]
    fn build_rejects_custom_position_without_template() {
        let err = Driver::builder()
            .with_base_url("https://api.test")
            .with_services(services())
            .with_version_config(VersionConfig::enabled().position(VersionPosition::Custom))
            .build()
            .err();
        assert_eq!(err, Some(ConfigError::MissingVersionTemplate));
    }

    #[test]
    fn resolve_url_folds_get_payload() {
        let driver = driver_with(Scripted::ok(), FixedFetch::new(200, "", "{}"));
        let resolved = driver
            .resolve_url(
                &ServiceRef::new("user.get").param("id", "7"),
                Some(Payload::object().with("page", 2i64)),
            )
            .unwrap();
        assert_eq!(resolved.full_url, "https://api.test/users/7?page=2");
        assert_eq!(resolved.pathname, "users/7?page=2");
        assert_eq!(resolved.method, HttpMethod::Get);
        assert_eq!(resolved.payload, None);
    }

    #[test]
    fn resolve_url_keeps_non_get_payload() {
        let driver = driver_with(Scripted::ok(), FixedFetch::new(200, "", "{}"));
        let payload = Payload::object().with("name", "ada");
        let resolved = driver
            .resolve_url(&ServiceRef::new("user.create"), Some(payload.clone()))
            .unwrap();
        assert_eq!(resolved.full_url, "https://api.test/users");
        assert_eq!(resolved.payload, Some(payload));
        assert!(driver.resolve_url(&ServiceRef::new("__nope__"), None).is_none());
    }

    #[test]
    fn resolve_url_is_idempotent() {
        let driver = driver_with(Scripted::ok(), FixedFetch::new(200, "", "{}"));
        let service = ServiceRef::new("user.get").param("id", 1);
        let payload = Payload::object().with("q", "x y");
        assert_eq!(
            driver.resolve_url(&service, Some(payload.clone())),
            driver.resolve_url(&service, Some(payload))
        );
    }

    #[test]
    fn builder_version_conveniences() {
        let driver = Driver::builder()
            .with_base_url("https://api.test")
            .with_services(services())
            .with_global_version(1)
            .enable_versioning(true)
            .build()
            .unwrap();
        let resolved = driver
            .resolve_url(&ServiceRef::new("report.get").param("id", 3), None)
            .unwrap();
        assert_eq!(resolved.full_url, "https://api.test/v2/reports/3");
        let resolved = driver
            .resolve_url(&ServiceRef::new("user.get").param("id", 3), None)
            .unwrap();
        assert_eq!(resolved.full_url, "https://api.test/v1/users/3");

        let driver = Driver::builder()
            .with_base_url("https://api.test")
            .with_services(services())
            .with_version_template("{baseURL}/api/{version}/{endpoint}")
            .build()
            .unwrap();
        let resolved = driver
            .resolve_url(&ServiceRef::new("report.get").param("id", 3), None)
            .unwrap();
        assert_eq!(resolved.full_url, "https://api.test/api/v2/reports/3");
    }

    #[test]
    fn global_version_alone_does_not_enable_versioning() {
        let driver = Driver::builder()
            .with_base_url("https://api.test")
            .with_services(services())
            .with_global_version(1)
            .build()
            .unwrap();
        let resolved = driver
            .resolve_url(&ServiceRef::new("report.get").param("id", 3), None)
            .unwrap();
        assert_eq!(resolved.full_url, "https://api.test/reports/3");
    }

    #[tokio::test]
    async fn unknown_service_skips_dispatch() {
        let wrapped = Scripted::ok();
        let fetch = FixedFetch::new(200, "", "{}");
        let driver = driver_with(wrapped.clone(), fetch.clone());
        for env in [
            driver.exec_via_wrapped_client(&ServiceRef::new("__nope__"), None, None).await,
            driver.exec_via_fetch(&ServiceRef::new("__nope__"), None, None).await,
        ] {
            assert!(!env.ok);
            assert_eq!(env.status, 500);
            assert_eq!(env.problem.as_deref(), Some("Service __nope__ in driver not found"));
            assert!(env.data.is_null());
            assert!(env.headers.is_empty());
        }
        assert!(wrapped.seen.lock().unwrap().is_empty());
        assert!(fetch.seen.lock().unwrap().is_empty());
    }

    #[tokio::test]
    #[traced_test]
    async fn unknown_service_is_logged() {
        let driver = driver_with(Scripted::ok(), FixedFetch::new(200, "", "{}"));
        driver.exec_via_fetch(&ServiceRef::new("ghost"), None, None).await;
        assert!(logs_contain("Service ghost in driver not found"));
    }

    /// Answers with headers at once, then times out while the body is read.
    struct TimedOutBody;

    #[async_trait]
    impl FetchTransport for TimedOutBody {
        async fn fetch(&self, _url: &str, _options: FetchOptions) -> Result<FetchResponse, DriverError> {
            let mut headers = HeaderMap::new();
            headers.insert(CONTENT_TYPE, "application/json".parse().unwrap());
            let body: futures::future::BoxFuture<'static, Result<bytes::Bytes, DriverError>> = Box::pin(async {
                Err(TransportError::new("timeout: reading body").with_code("ETIMEDOUT").into())
            });
            Ok(FetchResponse::deferred(200, headers, body))
        }
    }

    #[tokio::test]
    async fn body_read_timeout_is_a_timeout() {
        let driver = Driver::builder()
            .with_base_url("https://api.test")
            .with_services(services())
            .with_wrapped_transport(Scripted::ok())
            .with_fetch_transport(Arc::new(TimedOutBody))
            .build()
            .unwrap();
        let options = RequestOptions::new().timeout(Duration::from_millis(10));
        let env = driver
            .exec_via_fetch(&ServiceRef::new("user.get").param("id", 1), None, Some(options))
            .await;
        assert!(!env.ok);
        assert_eq!(env.status, 408);
        assert_eq!(env.problem.as_deref(), Some("timeout"));
    }

    #[tokio::test]
    async fn wrapped_get_folds_payload_and_merges_options() {
        let wrapped = Scripted::ok();
        let driver = driver_with(wrapped.clone(), FixedFetch::new(200, "", "{}"));
        let env = driver
            .exec_via_wrapped_client(
                &ServiceRef::new("user.get").param("id", 7),
                Some(Payload::object().with("page", 2i64)),
                Some(RequestOptions::new().header("X-Call", "1")),
            )
            .await;
        assert!(env.ok);
        assert_eq!(env.headers["content-type"], "application/json");
        let seen = wrapped.seen.lock().unwrap();
        assert_eq!(seen[0].url, "https://api.test/users/7?page=2");
        assert_eq!(seen[0].method, HttpMethod::Get);
        assert_eq!(seen[0].data, None);
        assert_eq!(seen[0].options.headers["X-Call"], "1");
    }

    #[tokio::test]
    async fn wrapped_post_forwards_payload() {
        let wrapped = Scripted::ok();
        let driver = driver_with(wrapped.clone(), FixedFetch::new(200, "", "{}"));
        let payload = Payload::object().with("name", "ada");
        driver
            .exec_via_wrapped_client(&ServiceRef::new("user.create"), Some(payload.clone()), None)
            .await;
        assert_eq!(wrapped.seen.lock().unwrap()[0].data, Some(payload));
    }

    #[tokio::test]
    async fn wrapped_normalized_reply_passes_through() {
        let canned = ResponseEnvelope::from_response(201, ResponseData::Text("mocked".into()), None, None, 9.0);
        let reply = canned.clone();
        let wrapped = Scripted::new(move |_| Ok(TransportReply::Normalized(reply.clone())));
        let driver = driver_with(wrapped, FixedFetch::new(200, "", "{}"));
        let env = driver
            .exec_via_wrapped_client(&ServiceRef::new("user.create"), None, None)
            .await;
        assert_eq!(env, canned);
    }

    #[tokio::test]
    async fn wrapped_empty_reply_is_failure() {
        let driver = driver_with(Scripted::new(|_| Ok(TransportReply::Empty)), FixedFetch::new(200, "", "{}"));
        let env = driver
            .exec_via_wrapped_client(&ServiceRef::new("user.create"), None, None)
            .await;
        assert!(!env.ok);
        assert_eq!(env.status, 500);
        assert_eq!(env.problem.as_deref(), Some(NO_RESPONSE));
    }

    #[tokio::test]
    async fn wrapped_transport_errors_use_problem_codes() {
        let wrapped = Scripted::new(|config| {
            let response = TransportResponse {
                status: 422,
                status_text: "Unprocessable Entity".to_string(),
                headers: json!({"X-Err": ["a", "b"]}),
                data: ResponseData::Json(json!({"field": "name"})),
            };
            Err(TransportError::new("Request failed with status code 422")
                .with_code("ERR_BAD_REQUEST")
                .with_response(response)
                .with_config(config.clone())
                .into())
        });
        let driver = driver_with(wrapped, FixedFetch::new(200, "", "{}"));
        let env = driver
            .exec_via_wrapped_client(&ServiceRef::new("user.create"), None, None)
            .await;
        assert_eq!(env.status, 422);
        assert_eq!(env.problem.as_deref(), Some("CLIENT_ERROR"));
        assert_eq!(env.headers["x-err"], "a, b");
        assert_eq!(env.data.as_json(), Some(&json!({"field": "name"})));
    }

    #[tokio::test]
    async fn wrapped_timeout_message_is_classified() {
        let wrapped = Scripted::new(|_| Err(DriverError::message("timeout of 100ms exceeded")));
        let driver = driver_with(wrapped, FixedFetch::new(200, "", "{}"));
        let env = driver
            .exec_via_wrapped_client(&ServiceRef::new("user.get").param("id", 1), None, None)
            .await;
        assert_eq!(env.status, 408);
        assert!(env.problem.unwrap().contains("timeout"));
    }

    #[tokio::test]
    async fn failing_request_hook_becomes_envelope() {
        let driver = Driver::builder()
            .with_base_url("https://api.test")
            .with_services(services())
            .with_wrapped_transport(Scripted::ok())
            .with_fetch_transport(FixedFetch::new(200, "", "{}"))
            .with_request_transform(|_| Err(DriverError::authentication()))
            .build()
            .unwrap();
        let env = driver
            .exec_via_wrapped_client(&ServiceRef::new("user.create"), None, None)
            .await;
        assert_eq!(env.status, 401);
        assert_eq!(env.problem.as_deref(), Some("Authentication failed"));
    }

    #[tokio::test]
    async fn async_request_transforms_apply_in_order() {
        let wrapped = Scripted::ok();
        let driver = Driver::builder()
            .with_base_url("https://api.test")
            .with_services(services())
            .with_wrapped_transport(wrapped.clone())
            .with_fetch_transport(FixedFetch::new(200, "", "{}"))
            .with_async_request_transform(|registrar| {
                registrar.register(|config: &mut RequestConfig| {
                    Box::pin(async move {
                        config.options.headers.insert("X-Order".into(), "first".into());
                        Ok(())
                    })
                });
                registrar.register(|config: &mut RequestConfig| {
                    Box::pin(async move {
                        let previous = config.options.headers.get("X-Order").cloned().unwrap_or_default();
                        config.options.headers.insert("X-Order".into(), format!("{previous},second"));
                        Ok(())
                    })
                });
            })
            .build()
            .unwrap();
        driver
            .exec_via_wrapped_client(&ServiceRef::new("user.create"), None, None)
            .await;
        assert_eq!(wrapped.seen.lock().unwrap()[0].options.headers["X-Order"], "first,second");
    }

    #[tokio::test]
    async fn error_interceptor_recovers() {
        let driver = Driver::builder()
            .with_base_url("https://api.test")
            .with_services(services())
            .with_wrapped_transport(Scripted::new(|_| Err(TransportError::new("expired").into())))
            .with_fetch_transport(FixedFetch::new(200, "", "{}"))
            .with_error_interceptor(|ctx| {
                assert!(!ctx.queue.is_refreshing());
                error_handler(|_| async {
                    Ok(TransportReply::Response(TransportResponse::new(
                        200,
                        ResponseData::Text("recovered".into()),
                    )))
                })
            })
            .build()
            .unwrap();
        let env = driver
            .exec_via_wrapped_client(&ServiceRef::new("user.create"), None, None)
            .await;
        assert!(env.ok);
        assert_eq!(env.data.as_text(), Some("recovered"));
    }

    #[tokio::test]
    async fn aborted_signal_is_timeout_on_both_paths() {
        let controller = AbortController::new();
        controller.abort();
        let wrapped = Scripted::ok();
        let fetch = FixedFetch::new(200, "", "{}");
        let driver = driver_with(wrapped.clone(), fetch.clone());
        let options = RequestOptions::new().abort_controller(controller);

        let env = driver
            .exec_via_wrapped_client(&ServiceRef::new("user.create"), None, Some(options.clone()))
            .await;
        assert_eq!(env.status, 408);
        let env = driver
            .exec_via_fetch(&ServiceRef::new("user.create"), None, Some(options))
            .await;
        assert_eq!(env.status, 408);
        assert!(wrapped.seen.lock().unwrap().is_empty());
        assert!(fetch.seen.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn abort_during_fetch_cancels_call() {
        let fetch = Arc::new(FixedFetch {
            seen: Mutex::new(Vec::new()),
            status: 200,
            content_type: "",
            body: "{}",
            delay: Some(Duration::from_secs(5)),
        });
        let driver = driver_with(Scripted::ok(), fetch);
        let controller = AbortController::new();
        let options = RequestOptions::new().signal(controller.signal());
        let aborter = controller.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            aborter.abort();
        });
        let env = driver
            .exec_via_fetch(&ServiceRef::new("user.get").param("id", 1), None, Some(options))
            .await;
        assert_eq!(env.status, 408);
        assert_eq!(env.problem.as_deref(), Some("timeout"));
    }

    #[tokio::test]
    async fn fetch_defaults_json_content_type_and_body() {
        let fetch = FixedFetch::new(201, "application/json", r#"{"id":1}"#);
        let driver = driver_with(Scripted::ok(), fetch.clone());
        let env = driver
            .exec_via_fetch(
                &ServiceRef::new("user.create"),
                Some(Payload::object().with("name", "ada")),
                None,
            )
            .await;
        assert!(env.ok);
        assert_eq!(env.status, 201);
        assert_eq!(env.data.as_json(), Some(&json!({"id": 1})));
        assert_eq!(env.headers["x-tag"], "a, b");

        let seen = fetch.seen.lock().unwrap();
        let (url, options) = &seen[0];
        assert_eq!(url, "https://api.test/users");
        assert_eq!(options.method, Some(HttpMethod::Post));
        assert_eq!(options.headers.as_ref().unwrap()["Content-Type"], APPLICATION_JSON);
        assert_eq!(
            options.body,
            Some(crate::compile::RequestBody::Json(r#"{"name":"ada"}"#.to_string()))
        );
    }

    #[tokio::test]
    async fn fetch_get_has_no_method_or_body() {
        let fetch = FixedFetch::new(200, "application/json", "[]");
        let driver = driver_with(Scripted::ok(), fetch.clone());
        driver
            .exec_via_fetch(
                &ServiceRef::new("user.get").param("id", 7),
                Some(Payload::object().with("page", 2i64)),
                None,
            )
            .await;
        let seen = fetch.seen.lock().unwrap();
        assert_eq!(seen[0].0, "https://api.test/users/7?page=2");
        assert_eq!(seen[0].1.method, None);
        assert_eq!(seen[0].1.body, None);
    }

    #[tokio::test]
    async fn fetch_multipart_drops_headers() {
        let fetch = FixedFetch::new(200, "application/json", "{}");
        let driver = driver_with(Scripted::ok(), fetch.clone());
        driver
            .exec_via_fetch(
                &ServiceRef::new("doc.upload"),
                Some(Payload::object().with("title", "a")),
                None,
            )
            .await;
        let seen = fetch.seen.lock().unwrap();
        assert!(seen[0].1.headers.is_none());
        assert!(matches!(seen[0].1.body, Some(crate::compile::RequestBody::Multipart(_))));
    }

    #[tokio::test]
    async fn fetch_error_status_keeps_status_text() {
        let driver = driver_with(Scripted::ok(), FixedFetch::new(404, "application/json", r#"{"e":1}"#));
        let env = driver
            .exec_via_fetch(&ServiceRef::new("user.get").param("id", 1), None, None)
            .await;
        assert!(!env.ok);
        assert_eq!(env.status, 404);
        assert_eq!(env.problem.as_deref(), Some("Not Found"));
        assert_eq!(env.original_error.as_deref(), Some("Not Found"));
    }

    #[tokio::test]
    async fn fetch_malformed_body() {
        let driver = driver_with(Scripted::ok(), FixedFetch::new(200, "application/json", "{nope"));
        let env = driver
            .exec_via_fetch(&ServiceRef::new("user.get").param("id", 1), None, None)
            .await;
        assert!(!env.ok);
        assert_eq!(env.status, 500);
        assert_eq!(env.problem.as_deref(), Some("Malformed response"));
        assert_eq!(env.duration, 0.0);
    }

    #[tokio::test]
    async fn fetch_hooks_rewrite_request_and_response() {
        let fetch = FixedFetch::new(200, "text/plain", "hello");
        let driver = Driver::builder()
            .with_base_url("https://api.test")
            .with_services(services())
            .with_wrapped_transport(Scripted::ok())
            .with_fetch_transport(fetch.clone())
            .with_fetch_request_transform(|url, mut options| {
                options
                    .headers
                    .get_or_insert_with(Default::default)
                    .insert("X-Signed".into(), "yes".into());
                (format!("{url}&sig=1"), options)
            })
            .with_fetch_response_transform(|mut envelope| {
                envelope.headers.insert("x-post".into(), "1".into());
                envelope
            })
            .build()
            .unwrap();
        let env = driver
            .exec_via_fetch(
                &ServiceRef::new("user.get").param("id", 1),
                Some(Payload::object().with("a", 1i64)),
                None,
            )
            .await;
        assert_eq!(env.data.as_text(), Some("hello"));
        assert_eq!(env.headers["x-post"], "1");
        let seen = fetch.seen.lock().unwrap();
        assert_eq!(seen[0].0, "https://api.test/users/1?a=1&sig=1");
        assert_eq!(seen[0].1.headers.as_ref().unwrap()["X-Signed"], "yes");
    }

    #[tokio::test]
    async fn fetch_transport_failure_is_classified() {
        struct Down;

        #[async_trait]
        impl FetchTransport for Down {
            async fn fetch(&self, _: &str, _: FetchOptions) -> Result<FetchResponse, DriverError> {
                Err(DriverError::message("network unreachable"))
            }
        }

        let driver = Driver::builder()
            .with_base_url("https://api.test")
            .with_services(services())
            .with_wrapped_transport(Scripted::ok())
            .with_fetch_transport(Arc::new(Down))
            .build()
            .unwrap();
        let env = driver
            .exec_via_fetch(&ServiceRef::new("user.get").param("id", 1), None, None)
            .await;
        assert_eq!(env.status, 503);
        assert_eq!(env.problem.as_deref(), Some("Network error occurred"));
    }
}
