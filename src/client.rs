//! WinRM client handle.
//!
//! A [`Client`] binds an endpoint URL, credentials, operation
//! [`Parameters`] and one configured transport. It is cheap to clone and
//! stateless across shells: every shell and command created from it shares
//! the same transport.
//!
//! ## Construction
//!
//! 1. **Transport selection**: `Parameters::transport_decorator` when set,
//!    otherwise [`BasicAuthTransport`] (with `Parameters::dial` if given).
//!
//! 2. **Configuration**: the transport is configured against the endpoint
//!    immediately. Bad certificate, key or CA material fails here, and only
//!    here; later calls assume a working transport.

use std::fmt;
use std::sync::Arc;

use tracing::{debug, info};

use crate::config::{Endpoint, Parameters};
use crate::error::Result;
use crate::shell::Shell;
use crate::soap::{self, Envelope};
use crate::transport::{BasicAuthTransport, Transporter};

/// Reusable handle to one WinRM endpoint.
#[derive(Clone)]
pub struct Client {
    inner: Arc<ClientInner>,
}

struct ClientInner {
    url: String,
    https: bool,
    username: String,
    password: String,
    params: Parameters,
    transport: Box<dyn Transporter>,
}

impl Client {
    /// Create a client with default [`Parameters`].
    pub fn new(
        endpoint: &Endpoint,
        username: impl Into<String>,
        password: impl Into<String>,
    ) -> Result<Self> {
        Self::with_parameters(endpoint, username, password, Parameters::default())
    }

    /// Create a client and configure its transport.
    pub fn with_parameters(
        endpoint: &Endpoint,
        username: impl Into<String>,
        password: impl Into<String>,
        params: Parameters,
    ) -> Result<Self> {
        let mut transport: Box<dyn Transporter> = match params.transport_decorator {
            Some(ref factory) => factory(),
            None => match params.dial {
                Some(dial) => Box::new(BasicAuthTransport::with_dial(dial)),
                None => Box::new(BasicAuthTransport::new()),
            },
        };
        transport.configure(endpoint)?;

        let url = endpoint.url();
        debug!(url = %url, transport = transport.name(), "Created WinRM client");

        Ok(Self {
            inner: Arc::new(ClientInner {
                url,
                https: endpoint.https,
                username: username.into(),
                password: password.into(),
                params,
                transport,
            }),
        })
    }

    /// Open a new remote shell.
    pub async fn create_shell(&self) -> Result<Shell> {
        let envelope = soap::open_shell(self.url(), self.parameters());
        let response = self.exchange(&envelope).await?;
        let shell_id = soap::parse_shell_id(&response)?;

        info!(shell_id = %shell_id, url = %self.inner.url, "Opened WinRM shell");
        Ok(Shell::opened(self.clone(), shell_id))
    }

    /// Attach to an existing server-side shell.
    ///
    /// The shell is not deleted when the handle is dropped; call
    /// [`Shell::close`] to delete it.
    pub fn new_shell(&self, id: impl Into<String>) -> Shell {
        Shell::new(self.clone(), id.into())
    }

    /// Send one envelope through the transport.
    pub(crate) async fn exchange(&self, envelope: &Envelope) -> Result<String> {
        self.inner.transport.post(self, envelope).await
    }

    /// WS-Management URL of the endpoint.
    pub fn url(&self) -> &str {
        &self.inner.url
    }

    pub fn is_https(&self) -> bool {
        self.inner.https
    }

    pub fn username(&self) -> &str {
        &self.inner.username
    }

    pub fn password(&self) -> &str {
        &self.inner.password
    }

    pub fn parameters(&self) -> &Parameters {
        &self.inner.params
    }

    /// Name of the configured transport strategy.
    pub fn transport_name(&self) -> &'static str {
        self.inner.transport.name()
    }
}

impl fmt::Debug for Client {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Client")
            .field("url", &self.inner.url)
            .field("https", &self.inner.https)
            .field("username", &self.inner.username)
            .field("transport", &self.inner.transport.name())
            .field("params", &self.inner.params)
            .finish()
    }
}
