//! Mutual-TLS (client certificate) transport.

use async_trait::async_trait;
use reqwest::tls::Version;
use tracing::debug;

use super::tls::{http_builder, load_identity};
use super::traits::Transporter;
use super::{Credentials, HttpSender};
use crate::client::Client;
use crate::config::{DialSettings, Endpoint};
use crate::error::{Result, WinRmError};
use crate::soap::Envelope;

/// Client certificate authentication transport.
///
/// The endpoint's certificate and key authenticate the TLS session; each
/// request names the HTTPS mutual-auth profile in its `Authorization`
/// header and carries no credential bytes. The negotiated version is capped
/// at TLS 1.2, where WinRM listeners request the client certificate during
/// the initial handshake. rustls never renegotiates, so listeners that only
/// ask for the certificate through renegotiation are not supported.
#[derive(Default)]
pub struct ClientCertTransport {
    dial: Option<DialSettings>,
    sender: Option<HttpSender>,
}

impl ClientCertTransport {
    /// Create a mutual-TLS transport with default dial settings.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a mutual-TLS transport that dials with `dial`.
    pub fn with_dial(dial: DialSettings) -> Self {
        Self {
            dial: Some(dial),
            sender: None,
        }
    }
}

#[async_trait]
impl Transporter for ClientCertTransport {
    fn configure(&mut self, endpoint: &Endpoint) -> Result<()> {
        let (cert, key) = match (&endpoint.cert, &endpoint.key) {
            (Some(cert), Some(key)) => (cert, key),
            _ => {
                return Err(WinRmError::Config(
                    "client certificate and key are required for mutual TLS".to_string(),
                ));
            }
        };
        let identity = load_identity(cert, key)?;

        let dial = self.dial.unwrap_or_default();
        let (builder, url) = http_builder(endpoint, &dial)?;
        let http = builder
            .identity(identity)
            .max_tls_version(Version::TLS_1_2)
            .build()
            .map_err(|e| WinRmError::Config(format!("unable to build HTTP client: {}", e)))?;

        debug!(url = %url, "Configured client certificate transport");
        self.sender = Some(HttpSender::new(http, url, endpoint.timeout));
        Ok(())
    }

    async fn post(&self, _client: &Client, envelope: &Envelope) -> Result<String> {
        let sender = self
            .sender
            .as_ref()
            .ok_or_else(|| WinRmError::Config("transport used before configure".to_string()))?;
        sender.post(envelope, Credentials::MutualProfile).await
    }

    fn name(&self) -> &'static str {
        "client_cert"
    }
}
