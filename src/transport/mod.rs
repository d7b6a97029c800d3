//! Transport strategies and the SOAP exchange they share.
//!
//! # Available Strategies
//!
//! - [`BasicAuthTransport`]: username/password in an HTTP Basic header
//! - [`ClientCertTransport`]: TLS client certificate (mutual TLS)
//!
//! Both issue exactly one POST per envelope and validate the response with
//! [`check_response`]: a body that is not `application/soap+xml` is rejected
//! whatever its status, a SOAP body behind a non-200 status becomes
//! [`WinRmError::Http`], and a 200 SOAP body is returned unmodified.
//!
//! # Example
//!
//! ```ignore
//! use winrm::{Client, Endpoint, Parameters};
//!
//! let endpoint = Endpoint::new("win01", 5986)
//!     .with_https(true)
//!     .with_client_cert(cert_pem, key_pem);
//! let params = Parameters::default().with_client_cert_auth();
//! let client = Client::with_parameters(&endpoint, "", "", params)?;
//! ```

mod basic;
mod client_cert;
pub mod tls;
mod traits;

use std::time::Duration;

use reqwest::header::{AUTHORIZATION, CONTENT_TYPE};
use tracing::trace;

use crate::error::{Result, WinRmError};
use crate::soap::{Action, Envelope};

pub use basic::{BasicAuthTransport, ProxyResolver};
pub use client_cert::ClientCertTransport;
pub use traits::{TransportFactory, Transporter};

/// Content type of every request and of every acceptable response.
pub const SOAP_CONTENT_TYPE: &str = "application/soap+xml;charset=UTF-8";

/// `Authorization` value naming the WS-Man HTTPS mutual-auth profile.
pub const MUTUAL_AUTH_PROFILE: &str =
    "http://schemas.dmtf.org/wbem/wsman/1/wsman/secprofile/https/mutual";

/// Validate a response and hand back its body.
pub fn check_response(status: u16, content_type: &str, body: String) -> Result<String> {
    if !content_type
        .to_ascii_lowercase()
        .contains("application/soap+xml")
    {
        return Err(WinRmError::UnexpectedContentType {
            status,
            content_type: content_type.to_string(),
        });
    }

    if status != 200 {
        return Err(WinRmError::Http { status, body });
    }

    Ok(body)
}

/// How a request proves who is calling.
pub(crate) enum Credentials<'a> {
    Basic { username: &'a str, password: &'a str },
    MutualProfile,
}

/// A configured HTTP client bound to one WS-Man URL.
pub(crate) struct HttpSender {
    http: reqwest::Client,
    url: String,
    timeout: Duration,
}

impl HttpSender {
    pub(crate) fn new(http: reqwest::Client, url: String, timeout: Duration) -> Self {
        Self { http, url, timeout }
    }

    pub(crate) fn url(&self) -> &str {
        &self.url
    }

    /// Bound on the wait for response headers to `action`.
    ///
    /// A Receive is held by the host for up to the OperationTimeout, and
    /// the receive loop bounds it with that plus its grace period. A zero
    /// endpoint timeout means no bound.
    fn header_timeout(&self, action: Action) -> Option<Duration> {
        if action == Action::Receive || self.timeout.is_zero() {
            return None;
        }
        Some(self.timeout)
    }

    /// POST one envelope, bounded by [`Self::header_timeout`].
    pub(crate) async fn post(
        &self,
        envelope: &Envelope,
        credentials: Credentials<'_>,
    ) -> Result<String> {
        let request = self
            .http
            .post(&self.url)
            .header(CONTENT_TYPE, SOAP_CONTENT_TYPE)
            .body(envelope.as_str().to_owned());
        let request = match credentials {
            Credentials::Basic { username, password } => {
                request.basic_auth(username, Some(password))
            }
            Credentials::MutualProfile => request.header(AUTHORIZATION, MUTUAL_AUTH_PROFILE),
        };

        trace!(
            action = %envelope.action(),
            message_id = %envelope.message_id(),
            envelope = %envelope.as_str(),
            "Posting envelope"
        );

        let response = match self.header_timeout(envelope.action()) {
            Some(limit) => tokio::time::timeout(limit, request.send())
                .await
                .map_err(|_| WinRmError::Timeout(limit))??,
            None => request.send().await?,
        };

        let status = response.status().as_u16();
        let content_type = response
            .headers()
            .get(CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .unwrap_or_default()
            .to_string();
        let body = response.text().await?;

        trace!(status, action = %envelope.action(), body = %body, "Received response");

        check_response(status, &content_type, body)
    }
}
