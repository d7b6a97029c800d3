//! Endpoint and operation parameters for the WinRM client.
//!
//! Operation parameters are resolved with a three-tier priority system:
//!
//! 1. **Parameter** - Explicitly provided value (highest priority)
//! 2. **Environment Variable** - Value from environment variable
//! 3. **Default** - Built-in default value (lowest priority)
//!
//! # Environment Variables
//!
//! | Variable | Default | Description |
//! |----------|---------|-------------|
//! | `WINRM_OPERATION_TIMEOUT` | 60s | WS-Man OperationTimeout in seconds |
//! | `WINRM_LOCALE` | en-US | Locale and DataLocale headers |
//! | `WINRM_MAX_ENVELOPE_SIZE` | 153600 | MaxEnvelopeSize header in bytes |
//! | `WINRM_COMMAND_TIMEOUT` | unset | Overall bound on a command's receive loop, in seconds |
//! | `WINRM_TIMEOUT` | 60s | Response header timeout in seconds |
//!
//! [`Parameters::default`] never reads the environment; use
//! [`Parameters::from_env`] to opt in.

use std::env;
use std::fmt;
use std::net::IpAddr;
use std::time::Duration;

use crate::error::{Result, WinRmError};
use crate::transport::{ClientCertTransport, TransportFactory, Transporter};

/// Default WinRM HTTP port
pub const DEFAULT_HTTP_PORT: u16 = 5985;

/// Default WinRM HTTPS port
pub const DEFAULT_HTTPS_PORT: u16 = 5986;

/// Default WS-Man operation timeout in seconds
pub(crate) const DEFAULT_OPERATION_TIMEOUT_SECS: u64 = 60;

/// Default response header timeout in seconds
pub(crate) const DEFAULT_RESPONSE_TIMEOUT_SECS: u64 = 60;

/// Default locale sent in the Locale/DataLocale headers
pub(crate) const DEFAULT_LOCALE: &str = "en-US";

/// Default MaxEnvelopeSize in bytes
pub(crate) const DEFAULT_MAX_ENVELOPE_SIZE: usize = 153_600;

/// Default TCP connect timeout in seconds
pub(crate) const DEFAULT_CONNECT_TIMEOUT_SECS: u64 = 30;

/// Default TCP keep-alive interval in seconds
pub(crate) const DEFAULT_KEEP_ALIVE_SECS: u64 = 30;

/// Environment variable name for the operation timeout
pub(crate) const OPERATION_TIMEOUT_ENV_VAR: &str = "WINRM_OPERATION_TIMEOUT";

/// Environment variable name for the locale
pub(crate) const LOCALE_ENV_VAR: &str = "WINRM_LOCALE";

/// Environment variable name for the max envelope size
pub(crate) const MAX_ENVELOPE_SIZE_ENV_VAR: &str = "WINRM_MAX_ENVELOPE_SIZE";

/// Environment variable name for the overall command timeout
pub(crate) const COMMAND_TIMEOUT_ENV_VAR: &str = "WINRM_COMMAND_TIMEOUT";

/// Environment variable name for the response header timeout
pub(crate) const RESPONSE_TIMEOUT_ENV_VAR: &str = "WINRM_TIMEOUT";

/// Target of a WinRM client: where to connect and how to secure the link.
///
/// Immutable once handed to [`crate::Client::new`]; the client only reads it
/// while configuring its transport.
#[derive(Clone)]
pub struct Endpoint {
    pub host: String,
    pub port: u16,
    pub https: bool,
    /// Skip server certificate verification
    pub insecure: bool,
    /// PEM bundle of trusted CA certificates (replaces the built-in roots)
    pub ca_cert: Option<Vec<u8>>,
    /// PEM client certificate for mutual TLS
    pub cert: Option<Vec<u8>>,
    /// PEM private key matching `cert`
    pub key: Option<Vec<u8>>,
    /// Name to present and verify during the TLS handshake instead of `host`
    pub tls_server_name: Option<String>,
    /// How long to wait for response headers after a request is sent; zero
    /// waits forever. Receive polls are bounded by the receive loop instead.
    pub timeout: Duration,
}

impl Endpoint {
    /// Create a plain-HTTP endpoint with default timeouts.
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
            https: false,
            insecure: false,
            ca_cert: None,
            cert: None,
            key: None,
            tls_server_name: None,
            timeout: Duration::from_secs(DEFAULT_RESPONSE_TIMEOUT_SECS),
        }
    }

    pub fn with_https(mut self, https: bool) -> Self {
        self.https = https;
        self
    }

    pub fn with_insecure(mut self, insecure: bool) -> Self {
        self.insecure = insecure;
        self
    }

    pub fn with_ca_cert(mut self, pem: impl Into<Vec<u8>>) -> Self {
        self.ca_cert = Some(pem.into());
        self
    }

    /// Attach a client certificate and key for mutual TLS.
    pub fn with_client_cert(mut self, cert: impl Into<Vec<u8>>, key: impl Into<Vec<u8>>) -> Self {
        self.cert = Some(cert.into());
        self.key = Some(key.into());
        self
    }

    pub fn with_tls_server_name(mut self, name: impl Into<String>) -> Self {
        self.tls_server_name = Some(name.into());
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn scheme(&self) -> &'static str {
        if self.https { "https" } else { "http" }
    }

    /// WS-Management URL for this endpoint.
    ///
    /// IPv6 literals are bracketed.
    pub fn url(&self) -> String {
        self.url_for_host(&self.host)
    }

    pub(crate) fn url_for_host(&self, host: &str) -> String {
        let host = if host.contains(':') && !host.starts_with('[') {
            format!("[{}]", host)
        } else {
            host.to_string()
        };
        format!("{}://{}:{}/wsman", self.scheme(), host, self.port)
    }
}

impl fmt::Debug for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Endpoint")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("https", &self.https)
            .field("insecure", &self.insecure)
            .field("ca_cert", &self.ca_cert.as_ref().map(|c| c.len()))
            .field("cert", &self.cert.as_ref().map(|c| c.len()))
            .field("key", &self.key.as_ref().map(|_| "<redacted>"))
            .field("tls_server_name", &self.tls_server_name)
            .field("timeout", &self.timeout)
            .finish()
    }
}

/// TCP settings used when opening connections to the endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DialSettings {
    pub connect_timeout: Duration,
    pub keep_alive: Duration,
    /// Bind outgoing connections to this local address
    pub local_address: Option<IpAddr>,
}

impl Default for DialSettings {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(DEFAULT_CONNECT_TIMEOUT_SECS),
            keep_alive: Duration::from_secs(DEFAULT_KEEP_ALIVE_SECS),
            local_address: None,
        }
    }
}

/// Per-client operation parameters.
///
/// Copied into each [`crate::Client`] at construction.
#[derive(Clone)]
pub struct Parameters {
    pub operation_timeout: Duration,
    pub locale: String,
    pub envelope_size: usize,
    /// Upper bound on one command's whole receive loop; `None` is unbounded
    pub command_timeout: Option<Duration>,
    /// Dialer override for the default transport
    pub dial: Option<DialSettings>,
    /// Builds the transport instead of the default basic-auth one
    pub transport_decorator: Option<TransportFactory>,
}

impl Default for Parameters {
    fn default() -> Self {
        Self {
            operation_timeout: Duration::from_secs(DEFAULT_OPERATION_TIMEOUT_SECS),
            locale: DEFAULT_LOCALE.to_string(),
            envelope_size: DEFAULT_MAX_ENVELOPE_SIZE,
            command_timeout: None,
            dial: None,
            transport_decorator: None,
        }
    }
}

impl Parameters {
    /// Resolve every value from the environment, falling back to defaults.
    pub fn from_env() -> Self {
        Self {
            operation_timeout: Duration::from_secs(resolve_operation_timeout(None)),
            locale: resolve_locale(None),
            envelope_size: resolve_max_envelope_size(None),
            command_timeout: resolve_command_timeout(None).map(Duration::from_secs),
            ..Self::default()
        }
    }

    pub fn with_operation_timeout(mut self, timeout: Duration) -> Self {
        self.operation_timeout = timeout;
        self
    }

    pub fn with_locale(mut self, locale: impl Into<String>) -> Self {
        self.locale = locale.into();
        self
    }

    pub fn with_envelope_size(mut self, size: usize) -> Self {
        self.envelope_size = size;
        self
    }

    pub fn with_command_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.command_timeout = timeout;
        self
    }

    pub fn with_dial(mut self, dial: DialSettings) -> Self {
        self.dial = Some(dial);
        self
    }

    /// Use a custom transport factory.
    pub fn with_transport<F>(mut self, factory: F) -> Self
    where
        F: Fn() -> Box<dyn Transporter> + Send + Sync + 'static,
    {
        self.transport_decorator = Some(std::sync::Arc::new(factory));
        self
    }

    /// Authenticate with the endpoint's client certificate instead of
    /// username/password.
    pub fn with_client_cert_auth(self) -> Self {
        let dial = self.dial;
        self.with_transport(move || {
            let transport = match dial {
                Some(dial) => ClientCertTransport::with_dial(dial),
                None => ClientCertTransport::new(),
            };
            Box::new(transport)
        })
    }
}

impl fmt::Debug for Parameters {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Parameters")
            .field("operation_timeout", &self.operation_timeout)
            .field("locale", &self.locale)
            .field("envelope_size", &self.envelope_size)
            .field("command_timeout", &self.command_timeout)
            .field("dial", &self.dial)
            .field("transport_decorator", &self.transport_decorator.is_some())
            .finish()
    }
}

/// Format a duration as the ISO-8601 value WS-Man expects, e.g. `PT60.000S`.
pub fn format_duration(duration: Duration) -> String {
    format!("PT{:.3}S", duration.as_secs_f64())
}

/// Resolve the operation timeout with priority: parameter -> env var -> default
pub(crate) fn resolve_operation_timeout(timeout_param: Option<u64>) -> u64 {
    if let Some(timeout) = timeout_param {
        return timeout;
    }

    if let Ok(env_timeout) = env::var(OPERATION_TIMEOUT_ENV_VAR)
        && let Ok(timeout) = env_timeout.parse::<u64>()
    {
        return timeout;
    }

    DEFAULT_OPERATION_TIMEOUT_SECS
}

/// Resolve the locale with priority: parameter -> env var -> default
pub(crate) fn resolve_locale(locale_param: Option<String>) -> String {
    if let Some(locale) = locale_param {
        return locale;
    }

    if let Ok(env_locale) = env::var(LOCALE_ENV_VAR)
        && !env_locale.trim().is_empty()
    {
        return env_locale.trim().to_string();
    }

    DEFAULT_LOCALE.to_string()
}

/// Resolve the max envelope size with priority: parameter -> env var -> default
pub(crate) fn resolve_max_envelope_size(size_param: Option<usize>) -> usize {
    if let Some(size) = size_param {
        return size;
    }

    if let Ok(env_size) = env::var(MAX_ENVELOPE_SIZE_ENV_VAR)
        && let Ok(size) = env_size.parse::<usize>()
    {
        return size;
    }

    DEFAULT_MAX_ENVELOPE_SIZE
}

/// Resolve the overall command timeout: parameter -> env var -> none.
///
/// Zero means "no bound", same as unset.
pub(crate) fn resolve_command_timeout(timeout_param: Option<u64>) -> Option<u64> {
    let timeout = timeout_param.or_else(|| {
        env::var(COMMAND_TIMEOUT_ENV_VAR)
            .ok()
            .and_then(|v| v.parse::<u64>().ok())
    });
    timeout.filter(|secs| *secs > 0)
}

/// Resolve the response header timeout with priority: parameter -> env var -> default
pub(crate) fn resolve_response_timeout(timeout_param: Option<u64>) -> u64 {
    if let Some(timeout) = timeout_param {
        return timeout;
    }

    if let Ok(env_timeout) = env::var(RESPONSE_TIMEOUT_ENV_VAR)
        && let Ok(timeout) = env_timeout.parse::<u64>()
    {
        return timeout;
    }

    DEFAULT_RESPONSE_TIMEOUT_SECS
}

/// Build an endpoint from `WINRM_*` variables.
///
/// `WINRM_HOST` is required. Certificate variables name PEM files, which are
/// read here so that a bad path fails before any connection is attempted.
pub fn endpoint_from_env() -> Result<Endpoint> {
    let host = env::var("WINRM_HOST")
        .map_err(|_| WinRmError::Config("WINRM_HOST is not set".to_string()))?;
    let https = env_flag("WINRM_HTTPS");
    let default_port = if https {
        DEFAULT_HTTPS_PORT
    } else {
        DEFAULT_HTTP_PORT
    };
    let port = match env::var("WINRM_PORT") {
        Ok(port) => port
            .parse::<u16>()
            .map_err(|e| WinRmError::Config(format!("Invalid WINRM_PORT: {}", e)))?,
        Err(_) => default_port,
    };

    let mut endpoint = Endpoint::new(host, port)
        .with_https(https)
        .with_insecure(env_flag("WINRM_INSECURE"))
        .with_timeout(Duration::from_secs(resolve_response_timeout(None)));

    if let Some(ca) = read_pem_var("WINRM_CA_CERT")? {
        endpoint = endpoint.with_ca_cert(ca);
    }
    match (read_pem_var("WINRM_CERT")?, read_pem_var("WINRM_KEY")?) {
        (Some(cert), Some(key)) => endpoint = endpoint.with_client_cert(cert, key),
        (None, None) => {}
        _ => {
            return Err(WinRmError::Config(
                "WINRM_CERT and WINRM_KEY must be set together".to_string(),
            ));
        }
    }
    if let Ok(name) = env::var("WINRM_TLS_SERVER_NAME")
        && !name.is_empty()
    {
        endpoint = endpoint.with_tls_server_name(name);
    }

    Ok(endpoint)
}

fn env_flag(name: &str) -> bool {
    env::var(name)
        .map(|v| v.eq_ignore_ascii_case("true") || v == "1")
        .unwrap_or(false)
}

fn read_pem_var(name: &str) -> Result<Option<Vec<u8>>> {
    match env::var(name) {
        Ok(path) if !path.is_empty() => std::fs::read(&path)
            .map(Some)
            .map_err(|e| WinRmError::Config(format!("Failed to read {} ({}): {}", name, path, e))),
        _ => Ok(None),
    }
}
