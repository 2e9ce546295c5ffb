//! Per-identity anti-forgery token cache.
//!
//! A miss performs one derivation call through a [`TokenDeriver`]; a failed
//! derivation degrades to a locally generated token of the same shape so the
//! caller never sees an error here. The remote side will reject such a token,
//! which surfaces later as an authentication failure on the real request.

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, PoisonError, RwLock};
use std::time::Duration;

use async_trait::async_trait;
use http::header::{COOKIE, HeaderMap, HeaderValue};
use http::Method;
use rand::Rng;
use thiserror::Error;
use url::Url;

use crate::request::transport::{HttpTransport, TransportError, TransportRequest};
use crate::modules::proxy::ProxyRef;

const HEX_DIGITS: &[u8; 16] = b"0123456789abcdef";
/// Length of a logged-in `ct0` value.
pub const TOKEN_LEN: usize = 160;

#[derive(Debug, Error)]
pub enum DerivationError {
    #[error(transparent)]
    Transport(#[from] TransportError),
    #[error("derivation returned status {0}")]
    Status(u16),
    #[error("response carried no '{0}' cookie")]
    MissingCookie(String),
    #[error("invalid identity header value")]
    InvalidIdentity,
}

/// Fetches a fresh anti-forgery token for an identity.
#[async_trait]
pub trait TokenDeriver: Send + Sync {
    async fn derive(&self, identity: &str) -> Result<String, DerivationError>;
}

/// Where the cached token came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TokenSource {
    Derived,
    Fallback,
    Refreshed,
}

#[derive(Debug, Clone)]
pub struct SessionEntry {
    pub anti_forgery_token: String,
    pub source: TokenSource,
    pub assigned_proxy: Option<ProxyRef>,
}

/// Outcome of a lookup; `Fallback` keeps the derivation error for diagnostics.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TokenLookup {
    Cached { token: String, source: TokenSource },
    Derived(String),
    Fallback { token: String, reason: String },
}

impl TokenLookup {
    pub fn token(&self) -> &str {
        match self {
            TokenLookup::Cached { token, .. } => token,
            TokenLookup::Derived(token) => token,
            TokenLookup::Fallback { token, .. } => token,
        }
    }

    pub fn is_fallback(&self) -> bool {
        matches!(self, TokenLookup::Fallback { .. })
    }
}

/// Session cache keyed by identity.
pub struct SessionStore {
    deriver: Arc<dyn TokenDeriver>,
    entries: RwLock<HashMap<String, SessionEntry>>,
}

impl SessionStore {
    pub fn new(deriver: Arc<dyn TokenDeriver>) -> Self {
        Self {
            deriver,
            entries: RwLock::new(HashMap::new()),
        }
    }

    pub async fn get_session_token(&self, identity: &str) -> String {
        self.resolve(identity).await.token().to_string()
    }

    /// Cache lookup with derive-on-miss.
    ///
    /// Concurrent misses for one identity each derive; the last writer wins.
    pub async fn resolve(&self, identity: &str) -> TokenLookup {
        if let Some(entry) = self.entry(identity) {
            return TokenLookup::Cached {
                token: entry.anti_forgery_token,
                source: entry.source,
            };
        }

        let lookup = match self.deriver.derive(identity).await {
            Ok(token) if !token.is_empty() => {
                log::info!("derived csrf token for identity {}", redact(identity));
                TokenLookup::Derived(token)
            }
            Ok(_) => TokenLookup::Fallback {
                token: fallback_token(),
                reason: "derivation returned an empty token".into(),
            },
            Err(err) => TokenLookup::Fallback {
                token: fallback_token(),
                reason: err.to_string(),
            },
        };

        if let TokenLookup::Fallback { reason, .. } = &lookup {
            log::warn!(
                "csrf derivation failed for identity {}, using local token: {reason}",
                redact(identity)
            );
        }

        let source = if lookup.is_fallback() {
            TokenSource::Fallback
        } else {
            TokenSource::Derived
        };
        let mut entries = self.entries.write().unwrap_or_else(PoisonError::into_inner);
        let entry = entries.entry(identity.to_string()).or_insert_with(|| SessionEntry {
            anti_forgery_token: String::new(),
            source,
            assigned_proxy: None,
        });
        entry.anti_forgery_token = lookup.token().to_string();
        entry.source = source;
        lookup
    }

    /// Records a token observed on a response for this identity.
    pub fn refresh(&self, identity: &str, token: &str) {
        let mut entries = self.entries.write().unwrap_or_else(PoisonError::into_inner);
        match entries.get_mut(identity) {
            Some(entry) if entry.anti_forgery_token == token => {}
            Some(entry) => {
                log::debug!("csrf token refreshed for identity {}", redact(identity));
                entry.anti_forgery_token = token.to_string();
                entry.source = TokenSource::Refreshed;
            }
            None => {
                entries.insert(
                    identity.to_string(),
                    SessionEntry {
                        anti_forgery_token: token.to_string(),
                        source: TokenSource::Refreshed,
                        assigned_proxy: None,
                    },
                );
            }
        }
    }

    pub fn record_proxy(&self, identity: &str, proxy: Option<ProxyRef>) {
        let mut entries = self.entries.write().unwrap_or_else(PoisonError::into_inner);
        if let Some(entry) = entries.get_mut(identity) {
            entry.assigned_proxy = proxy;
        }
    }

    pub fn entry(&self, identity: &str) -> Option<SessionEntry> {
        self.entries
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(identity)
            .cloned()
    }

    pub fn token_source(&self, identity: &str) -> Option<TokenSource> {
        self.entry(identity).map(|entry| entry.source)
    }

    pub fn len(&self) -> usize {
        self.entries.read().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl fmt::Debug for SessionStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionStore")
            .field("entries", &self.len())
            .finish_non_exhaustive()
    }
}

/// Random lowercase hex of [`TOKEN_LEN`] characters.
pub fn fallback_token() -> String {
    let mut rng = rand::thread_rng();
    (0..TOKEN_LEN)
        .map(|_| HEX_DIGITS[rng.gen_range(0..HEX_DIGITS.len())] as char)
        .collect()
}

/// Short, log-safe prefix of an identity.
pub(crate) fn redact(identity: &str) -> String {
    let prefix: String = identity.chars().take(6).collect();
    format!("{prefix}…")
}

/// Derives the token by fetching `endpoint` with the identity cookie and
/// reading the csrf cookie from `set-cookie`. Always connects directly.
pub struct TransportTokenDeriver {
    transport: Arc<dyn HttpTransport>,
    endpoint: Url,
    session_cookie_name: String,
    csrf_cookie_name: String,
    base_headers: HeaderMap,
    timeout: Duration,
}

impl TransportTokenDeriver {
    pub fn new(
        transport: Arc<dyn HttpTransport>,
        endpoint: Url,
        session_cookie_name: impl Into<String>,
        csrf_cookie_name: impl Into<String>,
    ) -> Self {
        Self {
            transport,
            endpoint,
            session_cookie_name: session_cookie_name.into(),
            csrf_cookie_name: csrf_cookie_name.into(),
            base_headers: HeaderMap::new(),
            timeout: Duration::from_secs(30),
        }
    }

    pub fn with_headers(mut self, headers: HeaderMap) -> Self {
        self.base_headers = headers;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }
}

#[async_trait]
impl TokenDeriver for TransportTokenDeriver {
    async fn derive(&self, identity: &str) -> Result<String, DerivationError> {
        let mut headers = self.base_headers.clone();
        let cookie = HeaderValue::from_str(&format!("{}={identity}", self.session_cookie_name))
            .map_err(|_| DerivationError::InvalidIdentity)?;
        headers.insert(COOKIE, cookie);

        let response = self
            .transport
            .send(TransportRequest {
                method: Method::GET,
                url: self.endpoint.clone(),
                headers,
                body: None,
                proxy: None,
                timeout: self.timeout,
            })
            .await?;

        if let Some(token) = response.cookie(&self.csrf_cookie_name) {
            return Ok(token);
        }
        if response.status >= 400 {
            return Err(DerivationError::Status(response.status));
        }
        Err(DerivationError::MissingCookie(self.csrf_cookie_name.clone()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::request::transport::{TransportErrorKind, TransportResponse};
    use bytes::Bytes;
    use http::header::SET_COOKIE;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct StubDeriver {
        calls: AtomicUsize,
        result: Result<&'static str, TransportErrorKind>,
    }

    impl StubDeriver {
        fn new(result: Result<&'static str, TransportErrorKind>) -> Arc<Self> {
            Arc::new(Self {
                calls: AtomicUsize::new(0),
                result,
            })
        }
    }

    #[async_trait]
    impl TokenDeriver for StubDeriver {
        async fn derive(&self, _identity: &str) -> Result<String, DerivationError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            match self.result {
                Ok(token) => Ok(token.to_string()),
                Err(kind) => Err(TransportError::new(kind, "boom").into()),
            }
        }
    }

    #[tokio::test]
    async fn miss_derives_once_then_hits_cache() {
        let deriver = StubDeriver::new(Ok("abc123"));
        let store = SessionStore::new(deriver.clone());

        assert_eq!(store.resolve("token-a").await, TokenLookup::Derived("abc123".into()));
        assert_eq!(store.get_session_token("token-a").await, "abc123");
        assert_eq!(deriver.calls.load(Ordering::SeqCst), 1);
        assert_eq!(store.token_source("token-a"), Some(TokenSource::Derived));
    }

    #[tokio::test]
    async fn derivation_failure_falls_back_to_local_token() {
        let deriver = StubDeriver::new(Err(TransportErrorKind::ConnectionRefused));
        let store = SessionStore::new(deriver.clone());

        let lookup = store.resolve("token-a").await;
        assert!(lookup.is_fallback());
        assert_eq!(lookup.token().len(), TOKEN_LEN);
        assert!(lookup.token().chars().all(|c| c.is_ascii_hexdigit()));
        assert_eq!(store.token_source("token-a"), Some(TokenSource::Fallback));

        let again = store.get_session_token("token-a").await;
        assert_eq!(again, lookup.token());
        assert_eq!(deriver.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn identities_do_not_share_entries() {
        let deriver = StubDeriver::new(Ok("shared"));
        let store = SessionStore::new(deriver.clone());
        store.get_session_token("token-a").await;
        store.refresh("token-a", "fresh");

        assert_eq!(store.get_session_token("token-a").await, "fresh");
        assert_eq!(store.get_session_token("token-b").await, "shared");
        assert_eq!(deriver.calls.load(Ordering::SeqCst), 2);
        assert_eq!(store.token_source("token-a"), Some(TokenSource::Refreshed));
    }

    #[test]
    fn fallback_tokens_differ() {
        assert_ne!(fallback_token(), fallback_token());
    }

    struct CookieTransport {
        seen: Mutex<Vec<TransportRequest>>,
        set_cookie: Option<&'static str>,
    }

    #[async_trait]
    impl HttpTransport for CookieTransport {
        async fn send(
            &self,
            request: TransportRequest,
        ) -> Result<TransportResponse, TransportError> {
            self.seen.lock().unwrap().push(request);
            let mut headers = HeaderMap::new();
            if let Some(value) = self.set_cookie {
                headers.append(SET_COOKIE, HeaderValue::from_static(value));
            }
            Ok(TransportResponse::new(200, headers, Bytes::new()))
        }
    }

    #[tokio::test]
    async fn transport_deriver_reads_csrf_cookie() {
        let transport = Arc::new(CookieTransport {
            seen: Mutex::new(Vec::new()),
            set_cookie: Some("ct0=deadbeef; Path=/; Secure"),
        });
        let deriver = TransportTokenDeriver::new(
            transport.clone(),
            Url::parse("https://api.test/").unwrap(),
            "auth_token",
            "ct0",
        );

        assert_eq!(deriver.derive("secret").await.unwrap(), "deadbeef");
        let seen = transport.seen.lock().unwrap();
        assert_eq!(seen[0].headers[COOKIE], "auth_token=secret");
        assert!(seen[0].proxy.is_none());
    }

    #[tokio::test]
    async fn transport_deriver_reports_missing_cookie() {
        let transport = Arc::new(CookieTransport {
            seen: Mutex::new(Vec::new()),
            set_cookie: None,
        });
        let deriver = TransportTokenDeriver::new(
            transport,
            Url::parse("https://api.test/").unwrap(),
            "auth_token",
            "ct0",
        );

        assert!(matches!(
            deriver.derive("secret").await,
            Err(DerivationError::MissingCookie(name)) if name == "ct0"
        ));
    }
}
