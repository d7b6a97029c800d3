//! Username/password (HTTP Basic) transport.

use std::sync::Arc;

use async_trait::async_trait;
use reqwest::{Proxy, Url};
use tracing::debug;

use super::tls::http_builder;
use super::traits::Transporter;
use super::{Credentials, HttpSender};
use crate::client::Client;
use crate::config::{DialSettings, Endpoint};
use crate::error::{Result, WinRmError};
use crate::soap::Envelope;

/// Picks the proxy for a request URL; `None` connects directly.
pub type ProxyResolver = Arc<dyn Fn(&Url) -> Option<Url> + Send + Sync>;

/// Basic authentication transport.
///
/// Sends the client's username and password in an `Authorization: Basic`
/// header. Certificate material on the endpoint is ignored apart from the
/// CA pool used to verify the server.
#[derive(Default)]
pub struct BasicAuthTransport {
    dial: Option<DialSettings>,
    proxy: Option<ProxyResolver>,
    sender: Option<HttpSender>,
}

impl BasicAuthTransport {
    /// Create a basic-auth transport with default dial settings.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a basic-auth transport that dials with `dial`.
    pub fn with_dial(dial: DialSettings) -> Self {
        Self {
            dial: Some(dial),
            ..Self::default()
        }
    }

    /// Route requests through the proxy `resolver` picks.
    pub fn with_proxy<F>(mut self, resolver: F) -> Self
    where
        F: Fn(&Url) -> Option<Url> + Send + Sync + 'static,
    {
        self.proxy = Some(Arc::new(resolver));
        self
    }
}

#[async_trait]
impl Transporter for BasicAuthTransport {
    fn configure(&mut self, endpoint: &Endpoint) -> Result<()> {
        let dial = self.dial.unwrap_or_default();
        let (mut builder, url) = http_builder(endpoint, &dial)?;

        if let Some(ref resolver) = self.proxy {
            let resolver = Arc::clone(resolver);
            builder = builder.proxy(Proxy::custom(move |url| resolver(url)));
        }

        let http = builder
            .build()
            .map_err(|e| WinRmError::Config(format!("unable to build HTTP client: {}", e)))?;
        debug!(url = %url, proxy = self.proxy.is_some(), "Configured basic-auth transport");
        self.sender = Some(HttpSender::new(http, url, endpoint.timeout));
        Ok(())
    }

    async fn post(&self, client: &Client, envelope: &Envelope) -> Result<String> {
        let sender = self
            .sender
            .as_ref()
            .ok_or_else(|| WinRmError::Config("transport used before configure".to_string()))?;
        sender
            .post(
                envelope,
                Credentials::Basic {
                    username: client.username(),
                    password: client.password(),
                },
            )
            .await
    }

    fn name(&self) -> &'static str {
        "basic"
    }
}
