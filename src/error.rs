//! Error taxonomy for the WinRM client.
//!
//! Every fallible operation in this crate returns [`WinRmError`]. The variants
//! follow the failure classes a caller needs to tell apart:
//!
//! 1. **Configuration** (`Config`, `Encoding`): bad certificate, key or CA
//!    material, or a command that cannot be encoded. Raised before any
//!    remote call and never worth repeating unchanged.
//!
//! 2. **Transport** (`Transport`, `Timeout`): connection refused, TLS
//!    handshake failure, a response that never arrived. Surfaced per call.
//!
//! 3. **Protocol** (`UnexpectedContentType`, `Http`, `Protocol`): the server
//!    answered, but not with something we can use: a non-SOAP body, a SOAP
//!    fault behind a non-200 status, or a response missing an expected field.
//!
//! 4. **Cancellation** (`Cancelled`): the governing cancellation token fired
//!    before the command reached its terminal state. Kept distinct from
//!    failures so callers can tell "canceled" from "failed".
//!
//! # Retry classification
//!
//! The client never retries on its own. [`WinRmError::is_retryable`] is an
//! advisory classification for callers that want to retry a whole run:
//!
//! ```rust,ignore
//! use winrm::WinRmError;
//!
//! assert!(WinRmError::Transport("connection refused".into()).is_retryable());
//! assert!(!WinRmError::Http { status: 401, body: String::new() }.is_retryable());
//! assert!(!WinRmError::Cancelled.is_retryable());
//! ```

use std::time::Duration;

use thiserror::Error;

use crate::command::FAILURE_EXIT_CODE;
use crate::types::RunOutput;

/// WS-Management fault code reported when a Receive found no output before
/// the OperationTimeout elapsed.
pub(crate) const OPERATION_TIMEOUT_FAULT_CODE: &str = "2150858793";

/// Transport failure patterns that indicate transient conditions.
const RETRYABLE_ERRORS: &[&str] = &[
    "connection refused",
    "connection reset",
    "connection closed",
    "timed out",
    "timeout",
    "network is unreachable",
    "no route to host",
    "host is down",
    "temporary failure",
    "broken pipe",
    "error sending request",
];

/// HTTP statuses that point at a busy or restarting listener rather than a
/// rejected request.
const RETRYABLE_STATUSES: &[u16] = &[502, 503, 504];

/// Errors produced by the WinRM client.
#[derive(Debug, Clone, Error)]
pub enum WinRmError {
    /// Certificate, key, CA bundle or endpoint settings could not be used.
    #[error("invalid configuration: {0}")]
    Config(String),

    /// The command could not be encoded for PowerShell.
    #[error("cannot encode the given command: {0}")]
    Encoding(String),

    /// The HTTP exchange itself failed (connect, TLS, I/O).
    #[error("transport error: {0}")]
    Transport(String),

    /// The response was not a SOAP document, whatever its status.
    #[error("http response error: {status} - unexpected content type {content_type:?}")]
    UnexpectedContentType { status: u16, content_type: String },

    /// The response was SOAP but the status was not 200.
    #[error("http error {status}: {body}")]
    Http { status: u16, body: String },

    /// A response lacked a field the protocol requires, or carried a
    /// malformed chunk.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// The cancellation token fired before the command finished.
    #[error("operation cancelled")]
    Cancelled,

    /// A bounded wait elapsed.
    #[error("timed out after {0:?}")]
    Timeout(Duration),

    /// The shell was closed before the operation could run.
    #[error("shell {0} is closed")]
    ShellClosed(String),

    /// A local stdin source or stdout/stderr sink failed.
    #[error("io error: {0}")]
    Io(String),
}

/// Result type for WinRM operations.
pub type Result<T> = std::result::Result<T, WinRmError>;

/// A buffered run that failed, with the output that arrived before the
/// failure.
#[derive(Debug, Clone, Error)]
#[error("{error}")]
pub struct RunError {
    /// Partial output; `exit_code` is [`FAILURE_EXIT_CODE`]
    pub output: RunOutput,
    pub error: WinRmError,
}

/// Result of a buffered run.
pub type RunResult = std::result::Result<RunOutput, RunError>;

impl From<WinRmError> for RunError {
    fn from(error: WinRmError) -> Self {
        RunError {
            output: RunOutput {
                stdout: String::new(),
                stderr: String::new(),
                exit_code: FAILURE_EXIT_CODE,
            },
            error,
        }
    }
}

impl From<RunError> for WinRmError {
    fn from(e: RunError) -> Self {
        e.error
    }
}

impl From<std::io::Error> for WinRmError {
    fn from(e: std::io::Error) -> Self {
        WinRmError::Io(e.to_string())
    }
}

impl From<reqwest::Error> for WinRmError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_timeout() {
            return WinRmError::Transport(format!("request timed out: {}", e));
        }
        WinRmError::Transport(describe_chain(&e))
    }
}

impl WinRmError {
    /// Whether this error reports a fired cancellation token.
    pub fn is_cancelled(&self) -> bool {
        matches!(self, WinRmError::Cancelled)
    }

    /// Whether this error was raised before any remote call could be made.
    pub fn is_configuration(&self) -> bool {
        matches!(self, WinRmError::Config(_) | WinRmError::Encoding(_))
    }

    /// Whether this is the WS-Man fault a Receive returns when the command
    /// produced nothing within the operation timeout.
    ///
    /// Such a fault means "poll again", not "the command failed".
    pub fn is_operation_timeout_fault(&self) -> bool {
        match self {
            WinRmError::Http { status, body } => {
                *status == 500
                    && (body.contains(OPERATION_TIMEOUT_FAULT_CODE)
                        || body.contains("OperationTimeout"))
            }
            _ => false,
        }
    }

    /// Determines if an error is transient and a caller may retry the run.
    ///
    /// # Classification Rules
    ///
    /// 1. Configuration, encoding, cancellation and closed-shell errors are
    ///    never retryable.
    /// 2. HTTP 401/403 are credential problems and not retryable; 502, 503
    ///    and 504 are.
    /// 3. Transport errors are retryable when their message matches a known
    ///    transient pattern (connection refused, reset, timeout...).
    /// 4. Timeouts are retryable.
    pub fn is_retryable(&self) -> bool {
        match self {
            WinRmError::Transport(message) => {
                let lower = message.to_lowercase();
                RETRYABLE_ERRORS.iter().any(|pattern| lower.contains(pattern))
            }
            WinRmError::Http { status, .. } => RETRYABLE_STATUSES.contains(status),
            WinRmError::Timeout(_) => true,
            _ => false,
        }
    }
}

/// Flatten an error and its sources into one message.
///
/// reqwest keeps the interesting part ("connection refused") in the source
/// chain, so the top-level `Display` alone is not enough to classify.
fn describe_chain(error: &dyn std::error::Error) -> String {
    let mut message = error.to_string();
    let mut source = error.source();
    while let Some(inner) = source {
        message.push_str(": ");
        message.push_str(&inner.to_string());
        source = inner.source();
    }
    message
}
