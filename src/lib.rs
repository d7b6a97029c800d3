//! WS-Management (WinRM) remote shell client.
//!
//! The crate is organized into the following modules:
//!
//! - `config`: Endpoint, operation parameters and environment resolution
//! - `error`: Error type and classification helpers
//! - `soap`: WS-Management envelope construction and response parsing
//! - `transport`: HTTP transports (basic auth, client certificate) and TLS
//! - `client`: Endpoint handle that opens and attaches shells
//! - `shell`: Remote shell lifecycle
//! - `command`: Running command with its receive loop and stream handles
//! - `powershell`: `-EncodedCommand` construction
//! - `types`: Status and output types
//!
//! The `run*` methods on [`Client`] wrap the whole shell lifecycle for a
//! single command.

#![deny(clippy::unwrap_used)]

pub mod client;
pub mod command;
pub mod config;
pub mod error;
pub mod powershell;
mod run;
pub mod shell;
pub mod soap;
pub mod transport;
pub mod types;

#[cfg(test)]
mod testing;

pub use client::Client;
pub use command::{Command, CommandInput, FAILURE_EXIT_CODE, OutputReader, RECEIVE_GRACE};
pub use config::{DialSettings, Endpoint, Parameters, endpoint_from_env};
pub use error::{Result, RunError, RunResult, WinRmError};
pub use shell::Shell;
pub use transport::{
    BasicAuthTransport, ClientCertTransport, ProxyResolver, TransportFactory, Transporter,
};
pub use types::{CommandStatus, RunOutput, ShellState};
