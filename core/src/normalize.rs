//! Failure classification into response envelopes.
//!
//! # Design
//! Classification runs in a fixed order: explicit error kinds first, then
//! message sniffing, then the catch-all. Sniffing inspects the lower-cased
//! message for `timeout`, `network`, `aborted` and `canceled`; it is a
//! compatibility shim for transports that only report failures as text and
//! should give way to structured kinds as transports adopt them.
//!
//! The wrapped-client backend has an extra layer for [`TransportError`]s:
//! cancellation and timeout codes map to a timeout, and everything else is
//! reduced to one of four problem codes taken from the transport response.

use crate::envelope::{ResponseData, ResponseEnvelope};
use crate::error::{DriverError, TransportError};
use crate::http::normalize_headers;

pub const NETWORK_ERROR: &str = "NETWORK_ERROR";
pub const SERVER_ERROR: &str = "SERVER_ERROR";
pub const CLIENT_ERROR: &str = "CLIENT_ERROR";
pub const UNKNOWN_ERROR: &str = "UNKNOWN_ERROR";

/// Problem text for failures that are not errors at all.
pub const UNKNOWN_PROBLEM: &str = "An unknown error occurred";

/// Map a lower-cased message onto an explicit kind, if it names one.
fn sniff_message(message: &str) -> Option<DriverError> {
    let lower = message.to_lowercase();
    if lower.contains("timeout") || lower.contains("aborted") || lower.contains("canceled") {
        Some(DriverError::timeout())
    } else if lower.contains("network") {
        Some(DriverError::network())
    } else {
        None
    }
}

/// Resolve generic errors into explicit kinds where possible.
pub fn classify(error: DriverError) -> DriverError {
    let resolved = match &error {
        DriverError::Transport(transport) if transport.is_canceled() || transport.is_timeout() => {
            Some(DriverError::timeout())
        }
        DriverError::Transport(transport) => sniff_message(&transport.message),
        DriverError::Message(message) => sniff_message(message),
        _ => None,
    };
    resolved.unwrap_or(error)
}

/// Build the failure envelope for an already classified error.
pub fn normalize_error(error: &DriverError) -> ResponseEnvelope {
    match error {
        DriverError::Http { status, message, data } => {
            let data = data.clone().map(ResponseData::from).unwrap_or_default();
            ResponseEnvelope::failure(status.unwrap_or(500), message.clone(), message.clone()).with_data(data)
        }
        DriverError::Opaque(value) => ResponseEnvelope::failure(500, UNKNOWN_PROBLEM, value.clone()),
        other => {
            let message = other.to_string();
            let status = other.synthetic_status().unwrap_or(500);
            ResponseEnvelope::failure(status, message.clone(), message)
        }
    }
}

/// Classify and envelope a failure on the generic path.
pub fn handle_error(error: DriverError) -> ResponseEnvelope {
    normalize_error(&classify(error))
}

/// Problem code for a transport failure, from its response status.
pub fn transport_problem_code(error: &TransportError) -> &'static str {
    match &error.response {
        None => NETWORK_ERROR,
        Some(response) if response.status >= 500 => SERVER_ERROR,
        Some(response) if response.status >= 400 => CLIENT_ERROR,
        Some(_) => UNKNOWN_ERROR,
    }
}

/// Envelope a transport failure on the wrapped-client path.
pub fn normalize_transport_error(error: &TransportError, duration: f64) -> ResponseEnvelope {
    if error.is_canceled() || error.is_timeout() {
        return normalize_error(&DriverError::timeout());
    }
    let problem = transport_problem_code(error);
    match &error.response {
        None => ResponseEnvelope::failure(503, problem, error.message.clone()).with_duration(duration),
        Some(response) => ResponseEnvelope::failure(response.status, problem, error.message.clone())
            .with_data(response.data.clone())
            .with_headers(normalize_headers(&response.headers))
            .with_duration(duration),
    }
}
