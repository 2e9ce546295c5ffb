//! High level client.
//!
//! Wires the session store, proxy pool, request executor, events and metrics
//! together behind one handle with a fluent builder.

use std::path::Path;
use std::sync::Arc;

use thiserror::Error;
use url::Url;

use crate::classifier::{self, Classification};
use crate::config::{ClientConfig, ConfigError};
use crate::request::{
	ExecutionError, HttpTransport, ReqwestTransport, RequestExecutor, RequestOptions,
	ResponseEnvelope,
};
use crate::modules::events::{EventDispatcher, EventHandler, LoggingHandler, MetricsHandler};
use crate::modules::metrics::{MetricsCollector, MetricsSnapshot};
use crate::modules::proxy::{ProxyHealthReport, ProxyPool};
use crate::session::{SessionStore, TokenDeriver, TransportTokenDeriver};

/// Result alias used across the client layer.
pub type SessionWireResult<T> = Result<T, SessionWireError>;

#[derive(Debug, Error)]
pub enum SessionWireError {
	#[error("request failed: {0}")]
	Execution(#[from] ExecutionError),
	#[error("configuration error: {0}")]
	Config(#[from] ConfigError),
	#[error("url parse error: {0}")]
	Url(#[from] url::ParseError),
}

/// Fluent builder for [`SessionWire`].
pub struct SessionWireBuilder {
	config: ClientConfig,
	proxies: Vec<String>,
	transport: Option<Arc<dyn HttpTransport>>,
	deriver: Option<Arc<dyn TokenDeriver>>,
	handlers: Vec<Arc<dyn EventHandler>>,
}

impl SessionWireBuilder {
	pub fn new() -> Self {
		Self {
			config: ClientConfig::default(),
			proxies: Vec::new(),
			transport: None,
			deriver: None,
			handlers: Vec::new(),
		}
	}

	pub fn with_config(mut self, config: ClientConfig) -> Self {
		self.config = config;
		self
	}

	pub fn with_config_file(mut self, path: impl AsRef<Path>) -> SessionWireResult<Self> {
		self.config = ClientConfig::from_path(path)?;
		Ok(self)
	}

	pub fn with_bearer_token(mut self, token: impl Into<String>) -> Self {
		self.config.bearer_token = Some(token.into());
		self
	}

	pub fn with_proxies<I, S>(mut self, proxies: I) -> Self
	where
		I: IntoIterator<Item = S>,
		S: Into<String>,
	{
		self.proxies = proxies.into_iter().map(Into::into).collect();
		self
	}

	pub fn with_proxy_file(mut self, path: impl AsRef<Path>) -> SessionWireResult<Self> {
		self.proxies = crate::config::lists::load_lines(path)?;
		Ok(self)
	}

	pub fn with_transport(mut self, transport: Arc<dyn HttpTransport>) -> Self {
		self.transport = Some(transport);
		self
	}

	pub fn with_token_deriver(mut self, deriver: Arc<dyn TokenDeriver>) -> Self {
		self.deriver = Some(deriver);
		self
	}

	pub fn with_event_handler(mut self, handler: Arc<dyn EventHandler>) -> Self {
		self.handlers.push(handler);
		self
	}

	pub fn build(self) -> SessionWireResult<SessionWire> {
		let metrics = MetricsCollector::new();
		let mut events = EventDispatcher::new();
		events.register_handler(Arc::new(LoggingHandler));
		events.register_handler(Arc::new(MetricsHandler::new(metrics.clone())));
		for handler in self.handlers {
			events.register_handler(handler);
		}
		let events = Arc::new(events);

		let transport: Arc<dyn HttpTransport> = self
			.transport
			.unwrap_or_else(|| Arc::new(ReqwestTransport::new()));

		let deriver: Arc<dyn TokenDeriver> = match self.deriver {
			Some(deriver) => deriver,
			None => {
				let endpoint = Url::parse(&self.config.token_endpoint)?;
				Arc::new(
					TransportTokenDeriver::new(
						transport.clone(),
						endpoint,
						self.config.session_cookie_name.clone(),
						self.config.csrf_cookie_name.clone(),
					)
					.with_timeout(self.config.request_timeout),
				)
			}
		};

		let pool = ProxyPool::new(self.config.proxy.clone()).with_events(events.clone());
		pool.load_proxies(&self.proxies);

		let executor = RequestExecutor::new(
			self.config,
			transport,
			Arc::new(SessionStore::new(deriver)),
			Arc::new(pool),
		)?
		.with_events(events);

		Ok(SessionWire { executor, metrics })
	}
}

impl Default for SessionWireBuilder {
	fn default() -> Self {
		Self::new()
	}
}

/// Session-aware client handle.
#[derive(Debug)]
pub struct SessionWire {
	executor: RequestExecutor,
	metrics: MetricsCollector,
}

impl SessionWire {
	/// Client with default configuration and no proxies.
	pub fn new() -> SessionWireResult<Self> {
		SessionWireBuilder::new().build()
	}

	pub fn builder() -> SessionWireBuilder {
		SessionWireBuilder::new()
	}

	pub async fn execute(
		&self,
		target: &str,
		options: RequestOptions,
	) -> SessionWireResult<ResponseEnvelope> {
		Ok(self.executor.execute(target, options).await?)
	}

	pub async fn get(&self, identity: &str, target: &str) -> SessionWireResult<ResponseEnvelope> {
		self.execute(target, RequestOptions::get(identity)).await
	}

	pub fn classify(&self, envelope: &ResponseEnvelope) -> Classification {
		classifier::classify(envelope)
	}

	/// Replaces the proxy pool contents; returns how many records were kept.
	pub fn load_proxies<I, S>(&self, source: I) -> usize
	where
		I: IntoIterator<Item = S>,
		S: AsRef<str>,
	{
		self.executor.proxies().load_proxies(source)
	}

	pub async fn session_token(&self, identity: &str) -> String {
		self.executor.sessions().get_session_token(identity).await
	}

	pub fn executor(&self) -> &RequestExecutor {
		&self.executor
	}

	pub fn proxy_health(&self) -> ProxyHealthReport {
		self.executor.proxies().health_report()
	}

	pub fn metrics(&self) -> MetricsSnapshot {
		self.metrics.snapshot()
	}
}
