//! # sessionwire
//!
//! A session-aware HTTP request layer for cookie + CSRF authenticated APIs.
//!
//! ## Features
//!
//! - Per-identity anti-forgery token cache with derive-on-miss
//! - Proxy pool with failure streaks, cooldowns and sticky / round-robin /
//!   random rotation
//! - Retries of transient transport failures through a different proxy
//! - Pure classification of platform error payloads
//! - `log`-based events and counters for degraded operation
//!
//! ## Example
//!
//! ```no_run
//! use sessionwire::{RequestOptions, SessionWire};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let client = SessionWire::builder()
//!         .with_proxies(["user:pass:proxy.internal:8080"])
//!         .build()?;
//!     let envelope = client
//!         .execute("https://x.com/i/api/1.1/account/settings.json", RequestOptions::get("auth-token"))
//!         .await?;
//!     println!("{} {:?}", envelope.status(), client.classify(&envelope));
//!     Ok(())
//! }
//! ```

mod sessionwire;

pub mod classifier;
pub mod config;
pub mod request;
pub mod modules;
pub mod session;

pub use crate::sessionwire::{
    SessionWire,
    SessionWireBuilder,
    SessionWireError,
    SessionWireResult,
};

pub use crate::classifier::{
    Classification,
    PlatformCodes,
    PlatformError,
    classify,
    is_bot_detected,
    is_duplicate,
    is_rate_limited,
    is_suspended,
    platform_errors,
};

pub use crate::config::{ClientConfig, ConfigError};

pub use crate::request::{
    ExecutionError,
    HttpTransport,
    ReqwestTransport,
    RequestExecutor,
    RequestOptions,
    ResponseBody,
    ResponseEnvelope,
    TransportError,
    TransportErrorKind,
    TransportRequest,
    TransportResponse,
};

pub use crate::modules::{
    EventDispatcher,
    EventHandler,
    LoggingHandler,
    MetricsCollector,
    MetricsSnapshot,
    ProxyEndpoint,
    ProxyHealth,
    ProxyHealthReport,
    ProxyPool,
    ProxyPoolConfig,
    ProxyRef,
    RotationStrategy,
    WireEvent,
};

pub use crate::session::{
    DerivationError,
    SessionEntry,
    SessionStore,
    TokenDeriver,
    TokenLookup,
    TokenSource,
    TransportTokenDeriver,
};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
