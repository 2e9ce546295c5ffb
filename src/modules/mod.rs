//! Cross-cutting services module
//!
//! Proxy rotation plus the event and metrics plumbing shared by the session
//! store and request executor.

pub mod events;
pub mod metrics;
pub mod proxy;

// Re-export commonly used types
pub use events::{
    EventDispatcher, EventHandler, LoggingHandler, MetricsHandler, PoolFallbackEvent,
    PostResponseEvent, PreRequestEvent, RetryEvent, TokenFallbackEvent, TransportFailureEvent,
    WireEvent,
};
pub use metrics::{MetricsCollector, MetricsSnapshot};
pub use proxy::{
    ProxyEndpoint, ProxyHealth, ProxyHealthReport, ProxyParseError, ProxyPool, ProxyPoolConfig,
    ProxyRef, RotationStrategy,
};
