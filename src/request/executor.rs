//! Request execution.
//!
//! Composes identity, anti-forgery token and proxy into one outbound call,
//! reports the outcome to the proxy pool, retries retryable transport
//! failures through a different proxy and normalizes the result into a
//! [`ResponseEnvelope`].

use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use chrono::Utc;
use http::header::{
    AUTHORIZATION, CONTENT_TYPE, COOKIE, HeaderMap, HeaderName, HeaderValue, ORIGIN, REFERER,
};
use http::Method;
use rand::Rng;
use rand::distributions::Alphanumeric;
use serde_json::Value;
use thiserror::Error;
use url::Url;

use super::transport::{
    HttpTransport, TransportError, TransportErrorKind, TransportRequest, TransportResponse,
};
use crate::config::ClientConfig;
use crate::modules::events::{
    EventDispatcher, PostResponseEvent, PreRequestEvent, RetryEvent, TokenFallbackEvent,
    TransportFailureEvent, WireEvent,
};
use crate::modules::proxy::{ProxyPool, ProxyRef};
use crate::session::{SessionStore, TokenLookup};

const TRANSACTION_ID_LEN: usize = 94;

#[derive(Debug, Error)]
pub enum ExecutionError {
    #[error("{method} {url} failed after {attempts} attempt(s): {source}")]
    Transport {
        method: Method,
        url: String,
        attempts: u32,
        #[source]
        source: TransportError,
    },
    #[error("invalid header '{0}'")]
    InvalidHeader(String),
    #[error("url parse error: {0}")]
    Url(#[from] url::ParseError),
}

impl ExecutionError {
    /// Transport kind of the last underlying failure, if any.
    pub fn kind(&self) -> Option<TransportErrorKind> {
        match self {
            ExecutionError::Transport { source, .. } => Some(source.kind),
            _ => None,
        }
    }
}

/// Parsed body: JSON when it parses, raw text otherwise.
#[derive(Debug, Clone, PartialEq)]
pub enum ResponseBody {
    Json(Value),
    Text(String),
}

/// Immutable result of [`RequestExecutor::execute`].
#[derive(Debug, Clone)]
pub struct ResponseEnvelope {
    ok: bool,
    status: u16,
    headers: HeaderMap,
    data: ResponseBody,
}

impl ResponseEnvelope {
    pub fn new(status: u16, headers: HeaderMap, data: ResponseBody) -> Self {
        Self {
            ok: (200..300).contains(&status),
            status,
            headers,
            data,
        }
    }

    fn from_transport(response: TransportResponse) -> Self {
        let data = match serde_json::from_slice::<Value>(&response.body) {
            Ok(value) => ResponseBody::Json(value),
            Err(_) => ResponseBody::Text(String::from_utf8_lossy(&response.body).into_owned()),
        };
        Self::new(response.status, response.headers, data)
    }

    pub fn ok(&self) -> bool {
        self.ok
    }

    pub fn status(&self) -> u16 {
        self.status
    }

    pub fn headers(&self) -> &HeaderMap {
        &self.headers
    }

    pub fn data(&self) -> &ResponseBody {
        &self.data
    }

    pub fn json(&self) -> Option<&Value> {
        match &self.data {
            ResponseBody::Json(value) => Some(value),
            ResponseBody::Text(_) => None,
        }
    }

    pub fn text(&self) -> Option<&str> {
        match &self.data {
            ResponseBody::Text(text) => Some(text),
            ResponseBody::Json(_) => None,
        }
    }
}

/// Per-call inputs.
#[derive(Clone)]
pub struct RequestOptions {
    pub identity: String,
    pub method: Method,
    pub headers: HeaderMap,
    pub body: Option<Bytes>,
}

impl RequestOptions {
    pub fn new(identity: impl Into<String>, method: Method) -> Self {
        Self {
            identity: identity.into(),
            method,
            headers: HeaderMap::new(),
            body: None,
        }
    }

    pub fn get(identity: impl Into<String>) -> Self {
        Self::new(identity, Method::GET)
    }

    pub fn post(identity: impl Into<String>) -> Self {
        Self::new(identity, Method::POST)
    }

    /// Caller overrides win over every generated header.
    pub fn with_headers(mut self, headers: HeaderMap) -> Self {
        self.headers = headers;
        self
    }

    pub fn with_body(mut self, body: impl Into<Bytes>) -> Self {
        self.body = Some(body.into());
        self
    }

    pub fn with_json(mut self, value: &Value) -> Self {
        self.headers
            .insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        self.body = Some(Bytes::from(value.to_string()));
        self
    }
}

impl fmt::Debug for RequestOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RequestOptions")
            .field("method", &self.method)
            .field("headers", &self.headers.len())
            .field("body", &self.body.as_ref().map(Bytes::len))
            .finish_non_exhaustive()
    }
}

/// Identity-aware request executor.
pub struct RequestExecutor {
    config: ClientConfig,
    static_headers: HeaderMap,
    transport: Arc<dyn HttpTransport>,
    sessions: Arc<SessionStore>,
    proxies: Arc<ProxyPool>,
    events: Arc<EventDispatcher>,
}

impl RequestExecutor {
    pub fn new(
        config: ClientConfig,
        transport: Arc<dyn HttpTransport>,
        sessions: Arc<SessionStore>,
        proxies: Arc<ProxyPool>,
    ) -> Result<Self, ExecutionError> {
        let static_headers = header_map(&config.static_headers)?;
        Ok(Self {
            config,
            static_headers,
            transport,
            sessions,
            proxies,
            events: Arc::new(EventDispatcher::new()),
        })
    }

    pub fn with_events(mut self, events: Arc<EventDispatcher>) -> Self {
        self.events = events;
        self
    }

    pub fn sessions(&self) -> &Arc<SessionStore> {
        &self.sessions
    }

    pub fn proxies(&self) -> &Arc<ProxyPool> {
        &self.proxies
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    /// Performs `options.method target` on behalf of `options.identity`.
    ///
    /// Platform-level errors come back as a normal envelope; only transport
    /// failures that survive the retry budget are returned as `Err`.
    pub async fn execute(
        &self,
        target: &str,
        options: RequestOptions,
    ) -> Result<ResponseEnvelope, ExecutionError> {
        let url = Url::parse(target)?;
        let identity = options.identity.as_str();

        if let TokenLookup::Fallback { reason, .. } = self.sessions.resolve(identity).await {
            self.events.dispatch(WireEvent::TokenFallback(TokenFallbackEvent {
                reason,
                timestamp: Utc::now(),
            }));
        }

        let mut proxy = self.proxies.select_proxy_for_identity(identity);
        self.sessions.record_proxy(identity, proxy.clone());
        let mut retries = 0u32;

        loop {
            let token = self.sessions.get_session_token(identity).await;
            let headers = self.build_headers(identity, &token, &url, &options.headers)?;

            self.events.dispatch(WireEvent::PreRequest(PreRequestEvent {
                url: url.clone(),
                method: options.method.clone(),
                proxy: proxy.as_ref().map(|p| p.key()),
                attempt: retries + 1,
                timestamp: Utc::now(),
            }));

            let request = TransportRequest {
                method: options.method.clone(),
                url: url.clone(),
                headers,
                body: options.body.clone(),
                proxy: proxy.clone(),
                timeout: self.config.request_timeout,
            };

            let started = Instant::now();
            match self.transport.send(request).await {
                Ok(response) => {
                    let latency = started.elapsed();
                    return Ok(self.complete(
                        identity,
                        &options.method,
                        &url,
                        proxy.as_ref(),
                        response,
                        latency,
                    ));
                }
                Err(err) => {
                    self.events.dispatch(WireEvent::TransportFailure(TransportFailureEvent {
                        url: url.clone(),
                        kind: err.kind,
                        message: err.message.clone(),
                        proxy: proxy.as_ref().map(|p| p.key()),
                        timestamp: Utc::now(),
                    }));

                    let next = match &proxy {
                        Some(failed) => {
                            self.proxies.report_failure(failed);
                            if err.kind.is_retryable() && retries < self.config.max_retries {
                                self.proxies.select_random_healthy_proxy_except(failed)
                            } else {
                                None
                            }
                        }
                        None => None,
                    };

                    let Some(next) = next else {
                        return Err(ExecutionError::Transport {
                            method: options.method.clone(),
                            url: url.to_string(),
                            attempts: retries + 1,
                            source: err,
                        });
                    };

                    retries += 1;
                    self.events.dispatch(WireEvent::Retry(RetryEvent {
                        url: url.clone(),
                        attempt: retries + 1,
                        reason: err.kind,
                        proxy: Some(next.key()),
                        timestamp: Utc::now(),
                    }));
                    self.sessions.record_proxy(identity, Some(next.clone()));
                    proxy = Some(next);
                }
            }
        }
    }

    fn complete(
        &self,
        identity: &str,
        method: &Method,
        url: &Url,
        proxy: Option<&ProxyRef>,
        response: TransportResponse,
        latency: Duration,
    ) -> ResponseEnvelope {
        if let Some(used) = proxy {
            self.proxies.report_success(used);
        }
        if let Some(fresh) = response.cookie(&self.config.csrf_cookie_name) {
            self.sessions.refresh(identity, &fresh);
        }

        self.events.dispatch(WireEvent::PostResponse(PostResponseEvent {
            url: url.clone(),
            method: method.clone(),
            status: response.status,
            latency,
            timestamp: Utc::now(),
        }));

        ResponseEnvelope::from_transport(response)
    }

    /// Static headers, then identity headers, then caller overrides.
    fn build_headers(
        &self,
        identity: &str,
        token: &str,
        url: &Url,
        overrides: &HeaderMap,
    ) -> Result<HeaderMap, ExecutionError> {
        let mut headers = self.static_headers.clone();

        let origin = self.config.origin.trim_end_matches('/');
        headers.insert(ORIGIN, header_value("origin", origin)?);
        headers.insert(REFERER, header_value("referer", &format!("{origin}{}", url.path()))?);

        if let Some(bearer) = &self.config.bearer_token {
            headers.insert(AUTHORIZATION, header_value("authorization", &format!("Bearer {bearer}"))?);
        }

        let cookie = format!(
            "{}={identity}; {}={token}",
            self.config.session_cookie_name, self.config.csrf_cookie_name
        );
        headers.insert(COOKIE, header_value("cookie", &cookie)?);
        headers.insert(
            header_name(&self.config.csrf_header_name)?,
            header_value(&self.config.csrf_header_name, token)?,
        );
        headers.insert(
            header_name(&self.config.transaction_header_name)?,
            header_value(&self.config.transaction_header_name, &transaction_id())?,
        );

        for (name, value) in overrides {
            headers.insert(name.clone(), value.clone());
        }
        Ok(headers)
    }
}

impl fmt::Debug for RequestExecutor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RequestExecutor")
            .field("sessions", &self.sessions)
            .field("proxies", &self.proxies)
            .finish_non_exhaustive()
    }
}

/// Fresh per-request identifier.
pub fn transaction_id() -> String {
    rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(TRANSACTION_ID_LEN)
        .map(char::from)
        .collect()
}

fn header_name(name: &str) -> Result<HeaderName, ExecutionError> {
    HeaderName::from_bytes(name.as_bytes()).map_err(|_| ExecutionError::InvalidHeader(name.to_string()))
}

fn header_value(name: &str, value: &str) -> Result<HeaderValue, ExecutionError> {
    HeaderValue::from_str(value).map_err(|_| ExecutionError::InvalidHeader(name.to_string()))
}

fn header_map(pairs: &[(String, String)]) -> Result<HeaderMap, ExecutionError> {
    let mut map = HeaderMap::new();
    for (name, value) in pairs {
        map.insert(header_name(name)?, header_value(name, value)?);
    }
    Ok(map)
}
