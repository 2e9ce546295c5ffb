//! Event system for the request layer.
//!
//! Provides hooks for metrics, logging, and custom reactions around request
//! execution. Events never carry identity credentials.

use chrono::{DateTime, Utc};
use http::Method;
use std::sync::Arc;
use std::time::Duration;
use url::Url;

use super::metrics::MetricsCollector;
use crate::request::transport::TransportErrorKind;

/// Structured pre-request event.
#[derive(Debug, Clone)]
pub struct PreRequestEvent {
    pub url: Url,
    pub method: Method,
    pub proxy: Option<String>,
    pub attempt: u32,
    pub timestamp: DateTime<Utc>,
}

/// Structured post-response event.
#[derive(Debug, Clone)]
pub struct PostResponseEvent {
    pub url: Url,
    pub method: Method,
    pub status: u16,
    pub latency: Duration,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct TransportFailureEvent {
    pub url: Url,
    pub kind: TransportErrorKind,
    pub message: String,
    pub proxy: Option<String>,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct RetryEvent {
    pub url: Url,
    pub attempt: u32,
    pub reason: TransportErrorKind,
    pub proxy: Option<String>,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct TokenFallbackEvent {
    pub reason: String,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct PoolFallbackEvent {
    pub pool_size: usize,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub enum WireEvent {
    PreRequest(PreRequestEvent),
    PostResponse(PostResponseEvent),
    TransportFailure(TransportFailureEvent),
    Retry(RetryEvent),
    TokenFallback(TokenFallbackEvent),
    PoolFallback(PoolFallbackEvent),
}

/// Trait implemented by event handlers.
pub trait EventHandler: Send + Sync {
    fn handle(&self, event: &WireEvent);
}

/// Dispatcher that broadcasts events to registered handlers.
#[derive(Default)]
pub struct EventDispatcher {
    handlers: Vec<Arc<dyn EventHandler>>,
}

impl EventDispatcher {
    pub fn new() -> Self {
        Self { handlers: Vec::new() }
    }

    pub fn register_handler(&mut self, handler: Arc<dyn EventHandler>) {
        self.handlers.push(handler);
    }

    pub fn dispatch(&self, event: WireEvent) {
        for handler in &self.handlers {
            handler.handle(&event);
        }
    }
}

/// Logs events using the `log` crate.
#[derive(Debug)]
pub struct LoggingHandler;

impl EventHandler for LoggingHandler {
    fn handle(&self, event: &WireEvent) {
        match event {
            WireEvent::PreRequest(pre) => {
                log::debug!(
                    "-> {} {} via {} (attempt {})",
                    pre.method,
                    pre.url,
                    pre.proxy.as_deref().unwrap_or("direct"),
                    pre.attempt
                );
            }
            WireEvent::PostResponse(post) => {
                log::debug!(
                    "<- {} {} -> {} ({:.2}s)",
                    post.method,
                    post.url,
                    post.status,
                    post.latency.as_secs_f64()
                );
            }
            WireEvent::TransportFailure(failure) => {
                log::warn!(
                    "{} failed via {}: {} ({})",
                    failure.url,
                    failure.proxy.as_deref().unwrap_or("direct"),
                    failure.kind,
                    failure.message
                );
            }
            WireEvent::Retry(retry) => {
                log::info!(
                    "retry {} attempt {} via {} after {}",
                    retry.url,
                    retry.attempt,
                    retry.proxy.as_deref().unwrap_or("direct"),
                    retry.reason
                );
            }
            WireEvent::TokenFallback(fallback) => {
                log::warn!("using locally generated csrf token: {}", fallback.reason);
            }
            WireEvent::PoolFallback(fallback) => {
                log::warn!("proxy pool exhausted, reusing all {} proxies", fallback.pool_size);
            }
        }
    }
}

/// Metrics handler that feeds the metrics collector.
#[derive(Clone, Debug)]
pub struct MetricsHandler {
    metrics: MetricsCollector,
}

impl MetricsHandler {
    pub fn new(metrics: MetricsCollector) -> Self {
        Self { metrics }
    }
}

impl EventHandler for MetricsHandler {
    fn handle(&self, event: &WireEvent) {
        match event {
            WireEvent::PreRequest(_) => self.metrics.record_attempt(),
            WireEvent::PostResponse(post) => self.metrics.record_response(post.status, post.latency),
            WireEvent::TransportFailure(failure) => self.metrics.record_transport_failure(failure.kind),
            WireEvent::Retry(_) => self.metrics.record_retry(),
            WireEvent::TokenFallback(_) => self.metrics.record_token_fallback(),
            WireEvent::PoolFallback(_) => self.metrics.record_pool_fallback(),
        }
    }
}
