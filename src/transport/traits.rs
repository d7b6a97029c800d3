//! Transport strategy trait definition.
//!
//! A transport turns an [`Endpoint`] into an authenticated HTTP sender and
//! performs one SOAP POST per call.

use std::sync::Arc;

use async_trait::async_trait;

use crate::client::Client;
use crate::config::Endpoint;
use crate::error::Result;
use crate::soap::Envelope;

/// Trait for WinRM transport strategies.
///
/// Implementations must be thread-safe (`Send + Sync`): one configured
/// instance serves every shell and command created from a client, and
/// `post` may be called concurrently.
#[async_trait]
pub trait Transporter: Send + Sync {
    /// Build the HTTP sender for `endpoint`.
    ///
    /// Called once, before any `post`. Malformed certificate, key or CA
    /// material fails here with a configuration error.
    fn configure(&mut self, endpoint: &Endpoint) -> Result<()>;

    /// POST `envelope` and return the validated response body.
    ///
    /// `client` supplies the credentials for strategies that send them.
    async fn post(&self, client: &Client, envelope: &Envelope) -> Result<String>;

    /// Get the name of this transport strategy.
    ///
    /// Used for logging and debugging purposes.
    fn name(&self) -> &'static str;
}

/// Builds a fresh, unconfigured transport for a new client.
pub type TransportFactory = Arc<dyn Fn() -> Box<dyn Transporter> + Send + Sync>;
