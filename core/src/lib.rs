//! Configurable HTTP service-call driver.
//!
//! # Overview
//! Services are declared once as named descriptors (URL template, method,
//! optional version and preset options). A built [`Driver`] resolves a
//! service reference to a concrete request, dispatches it through one of two
//! backends and returns a uniform [`ResponseEnvelope`], whether the call
//! succeeded, the server answered with an error status, or the exchange
//! failed outright.
//!
//! # Design
//! - The request pipeline is pure: placeholder substitution
//!   ([`replace_params_in_url`]), version injection
//!   ([`build_url_with_version`]), GET query folding ([`compile_url`]) and
//!   body encoding ([`compile_body`]) are plain functions over owned data.
//! - Dispatch goes through traits. [`WrappedTransport`] is a method-named
//!   client with an interceptor pipeline ([`WrappedClient`]);
//!   [`FetchTransport`] is a single raw exchange. [`ReqwestTransport`]
//!   implements both and is the default.
//! - Failures are classified into a closed taxonomy ([`DriverError`]) and
//!   enveloped at the call boundary. Only configuration mistakes surface as
//!   errors, from [`DriverBuilder::build`].

pub mod compile;
pub mod driver;
pub mod envelope;
pub mod error;
pub mod fetch;
pub mod form;
pub mod hooks;
pub mod http;
pub mod normalize;
pub mod options;
pub mod payload;
pub mod query;
pub mod reqwest_transport;
pub mod types;
pub mod version;
pub mod wrapped;

pub use compile::{compile_body, compile_url, CompiledRequest, RequestBody};
pub use driver::{Driver, DriverBuilder, DriverConfig, ResolvedUrl};
pub use envelope::{ResponseData, ResponseEnvelope};
pub use error::{ConfigError, DriverError, TransportError};
pub use fetch::{FetchOptions, FetchResponse, FetchTransport};
pub use form::{to_form_data, FormData, FormValue};
pub use hooks::{error_handler, InterceptorContext, RefreshQueue, TransformRegistrar};
pub use http::{normalize_headers, Headers, HttpMethod, ResponseType};
pub use options::{AbortController, AbortSignal, RequestOptions};
pub use payload::{strip_nulls, FilePart, Payload};
pub use query::stringify_query;
pub use reqwest_transport::ReqwestTransport;
pub use types::{
    compile_service, find_service, replace_params_in_url, ApiVersion, ServiceDescriptor, ServiceRef,
    ServiceRegistry,
};
pub use version::{build_url_with_version, VersionConfig, VersionPosition};
pub use wrapped::{RequestConfig, TransportReply, TransportResponse, WrappedClient, WrappedTransport};
