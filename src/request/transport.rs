//! Transport seam used by the request executor and session derivation.
//!
//! The executor only speaks to an [`HttpTransport`]; the production
//! implementation lives in [`super::reqwest_transport`], tests inject stubs.

use std::fmt;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use http::header::{HeaderMap, SET_COOKIE};
use http::Method;
use thiserror::Error;
use url::Url;

use crate::modules::proxy::ProxyRef;

/// Machine-readable category of a failed transport call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TransportErrorKind {
    Dns,
    ConnectionRefused,
    ConnectionReset,
    Timeout,
    Tls,
    Generic,
}

impl TransportErrorKind {
    /// Kinds that are worth replaying through a different proxy.
    pub fn is_retryable(self) -> bool {
        matches!(
            self,
            TransportErrorKind::Dns
                | TransportErrorKind::ConnectionRefused
                | TransportErrorKind::ConnectionReset
                | TransportErrorKind::Timeout
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            TransportErrorKind::Dns => "dns",
            TransportErrorKind::ConnectionRefused => "connection_refused",
            TransportErrorKind::ConnectionReset => "connection_reset",
            TransportErrorKind::Timeout => "timeout",
            TransportErrorKind::Tls => "tls",
            TransportErrorKind::Generic => "generic",
        }
    }

    /// Best-effort classification of a flattened error chain.
    pub fn from_message(message: &str) -> Self {
        let lower = message.to_ascii_lowercase();
        if lower.contains("certificate")
            || lower.contains("tls")
            || lower.contains("ssl")
            || lower.contains("handshake")
        {
            TransportErrorKind::Tls
        } else if lower.contains("timed out") || lower.contains("timeout") {
            TransportErrorKind::Timeout
        } else if lower.contains("dns")
            || lower.contains("failed to lookup address")
            || lower.contains("name or service not known")
            || lower.contains("no such host")
        {
            TransportErrorKind::Dns
        } else if lower.contains("connection refused") {
            TransportErrorKind::ConnectionRefused
        } else if lower.contains("connection reset") || lower.contains("reset by peer") {
            TransportErrorKind::ConnectionReset
        } else {
            TransportErrorKind::Generic
        }
    }
}

impl fmt::Display for TransportErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Transport failure tagged with its kind.
#[derive(Debug, Clone, Error)]
#[error("{kind} error: {message}")]
pub struct TransportError {
    pub kind: TransportErrorKind,
    pub message: String,
}

impl TransportError {
    pub fn new(kind: TransportErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    /// Builds an error whose kind is inferred from the message text.
    pub fn classified(message: impl Into<String>) -> Self {
        let message = message.into();
        Self {
            kind: TransportErrorKind::from_message(&message),
            message,
        }
    }
}

/// Fully composed outbound call.
#[derive(Debug, Clone)]
pub struct TransportRequest {
    pub method: Method,
    pub url: Url,
    pub headers: HeaderMap,
    pub body: Option<Bytes>,
    pub proxy: Option<ProxyRef>,
    pub timeout: Duration,
}

/// Raw response handed back by the transport.
#[derive(Debug, Clone)]
pub struct TransportResponse {
    pub status: u16,
    pub headers: HeaderMap,
    pub body: Bytes,
}

impl TransportResponse {
    pub fn new(status: u16, headers: HeaderMap, body: impl Into<Bytes>) -> Self {
        Self {
            status,
            headers,
            body: body.into(),
        }
    }

    /// Iterates every `set-cookie` value.
    pub fn set_cookies(&self) -> impl Iterator<Item = &str> {
        self.headers
            .get_all(SET_COOKIE)
            .iter()
            .filter_map(|value| value.to_str().ok())
    }

    /// Value of the named cookie if any `set-cookie` header carries it.
    pub fn cookie(&self, name: &str) -> Option<String> {
        self.set_cookies().find_map(|raw| {
            let pair = raw.split(';').next()?.trim();
            let (key, value) = pair.split_once('=')?;
            (key.trim() == name && !value.trim().is_empty()).then(|| value.trim().to_string())
        })
    }
}

/// Contract for anything that can perform a single HTTP exchange.
///
/// Implementations must enforce `request.timeout` themselves and report an
/// expiry as [`TransportErrorKind::Timeout`].
#[async_trait]
pub trait HttpTransport: Send + Sync {
    async fn send(&self, request: TransportRequest) -> Result<TransportResponse, TransportError>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use http::HeaderValue;

    #[test]
    fn classifies_common_failure_messages() {
        assert_eq!(
            TransportErrorKind::from_message("error trying to connect: dns error: failed to lookup address"),
            TransportErrorKind::Dns
        );
        assert_eq!(
            TransportErrorKind::from_message("tcp connect error: Connection refused (os error 111)"),
            TransportErrorKind::ConnectionRefused
        );
        assert_eq!(
            TransportErrorKind::from_message("connection reset by peer"),
            TransportErrorKind::ConnectionReset
        );
        assert_eq!(
            TransportErrorKind::from_message("operation timed out"),
            TransportErrorKind::Timeout
        );
        assert_eq!(
            TransportErrorKind::from_message("invalid peer certificate: UnknownIssuer"),
            TransportErrorKind::Tls
        );
        assert_eq!(
            TransportErrorKind::from_message("something odd"),
            TransportErrorKind::Generic
        );
    }

    #[test]
    fn tls_is_not_retryable() {
        assert!(!TransportErrorKind::Tls.is_retryable());
        assert!(!TransportErrorKind::Generic.is_retryable());
        assert!(TransportErrorKind::Timeout.is_retryable());
        assert!(TransportErrorKind::Dns.is_retryable());
    }

    #[test]
    fn reads_cookie_from_multiple_set_cookie_headers() {
        let mut headers = HeaderMap::new();
        headers.append(SET_COOKIE, HeaderValue::from_static("guest_id=v1; Path=/"));
        headers.append(SET_COOKIE, HeaderValue::from_static("ct0=abc123; Path=/; Secure"));
        let response = TransportResponse::new(200, headers, Bytes::new());

        assert_eq!(response.cookie("ct0").as_deref(), Some("abc123"));
        assert_eq!(response.cookie("missing"), None);
    }
}
