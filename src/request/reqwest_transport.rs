//! Reqwest-based implementation of the [`HttpTransport`] trait.
//!
//! Keeps one `reqwest::Client` per egress path. Direct connections may
//! negotiate HTTP/2; proxied connections are pinned to HTTP/1.1 because most
//! residential proxy providers do not tunnel h2 reliably.

use std::collections::HashMap;
use std::error::Error as StdError;
use std::sync::{Mutex, PoisonError};

use async_trait::async_trait;
use reqwest::{Client, redirect::Policy};

use super::transport::{
    HttpTransport, TransportError, TransportErrorKind, TransportRequest, TransportResponse,
};
use crate::modules::proxy::ProxyEndpoint;

/// Reqwest-backed transport with a client per proxy endpoint.
#[derive(Default)]
pub struct ReqwestTransport {
    clients: Mutex<HashMap<Option<String>, Client>>,
}

impl ReqwestTransport {
    pub fn new() -> Self {
        Self::default()
    }

    fn client(&self, proxy: Option<&ProxyEndpoint>) -> Result<Client, TransportError> {
        let key = proxy.map(ProxyEndpoint::key);
        let mut guard = self.clients.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(client) = guard.get(&key) {
            return Ok(client.clone());
        }

        let mut builder = Client::builder().redirect(Policy::none());
        builder = match proxy {
            Some(endpoint) => {
                let proxy = reqwest::Proxy::all(endpoint.url()).map_err(to_transport_error)?;
                builder.proxy(proxy).http1_only()
            }
            None => builder.no_proxy(),
        };

        let client = builder.build().map_err(to_transport_error)?;
        guard.insert(key, client.clone());
        Ok(client)
    }
}

#[async_trait]
impl HttpTransport for ReqwestTransport {
    async fn send(&self, request: TransportRequest) -> Result<TransportResponse, TransportError> {
        let client = self.client(request.proxy.as_deref())?;

        let mut builder = client
            .request(request.method, request.url)
            .headers(request.headers)
            .timeout(request.timeout);
        if let Some(body) = request.body {
            builder = builder.body(body);
        }

        let response = builder.send().await.map_err(to_transport_error)?;
        let status = response.status().as_u16();
        let headers = response.headers().clone();
        let body = response.bytes().await.map_err(to_transport_error)?;

        Ok(TransportResponse::new(status, headers, body))
    }
}

fn to_transport_error(err: reqwest::Error) -> TransportError {
    let message = error_chain(&err);
    if err.is_timeout() {
        return TransportError::new(TransportErrorKind::Timeout, message);
    }
    TransportError::classified(message)
}

/// Flattens the source chain; reqwest hides the io error kind several levels deep.
fn error_chain(err: &dyn StdError) -> String {
    let mut message = err.to_string();
    let mut source = err.source();
    while let Some(inner) = source {
        message.push_str(": ");
        message.push_str(&inner.to_string());
        source = inner.source();
    }
    message
}
