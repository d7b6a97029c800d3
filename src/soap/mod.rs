//! WS-Management SOAP envelopes for the remote shell resource.
//!
//! Envelopes are built as plain strings ([`builder`]) and responses are read
//! with a small prefix-tolerant scanner ([`parser`]); neither side holds any
//! state.

pub mod builder;
pub mod parser;

use std::fmt;

pub use builder::{
    EnvelopeBuilder, delete_shell, execute_command, open_shell, receive, send_input, signal,
};
pub use parser::{ReceiveResponse, fault_message, parse_command_id, parse_receive, parse_shell_id};

pub(crate) const SOAP_ENV_NS: &str = "http://www.w3.org/2003/05/soap-envelope";
pub(crate) const WSA_NS: &str = "http://schemas.xmlsoap.org/ws/2004/08/addressing";
pub(crate) const WSMAN_NS: &str = "http://schemas.dmtf.org/wbem/wsman/1/wsman.xsd";
pub(crate) const WSMAN_MS_NS: &str = "http://schemas.microsoft.com/wbem/wsman/1/wsman.xsd";
pub(crate) const SHELL_NS: &str = "http://schemas.microsoft.com/wbem/wsman/1/windows/shell";

/// Resource URI of the `cmd` shell.
pub const SHELL_RESOURCE_URI: &str = "http://schemas.microsoft.com/wbem/wsman/1/windows/shell/cmd";

pub(crate) const ANONYMOUS_ADDRESS: &str =
    "http://schemas.xmlsoap.org/ws/2004/08/addressing/role/anonymous";

/// Signal code that asks the remote process to terminate.
pub const SIGNAL_TERMINATE: &str =
    "http://schemas.microsoft.com/wbem/wsman/1/windows/shell/signal/terminate";

/// WS-Management action carried by an envelope.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Action {
    Create,
    Command,
    Receive,
    Send,
    Signal,
    Delete,
}

impl Action {
    pub fn uri(&self) -> &'static str {
        match self {
            Action::Create => "http://schemas.xmlsoap.org/ws/2004/09/transfer/Create",
            Action::Command => "http://schemas.microsoft.com/wbem/wsman/1/windows/shell/Command",
            Action::Receive => "http://schemas.microsoft.com/wbem/wsman/1/windows/shell/Receive",
            Action::Send => "http://schemas.microsoft.com/wbem/wsman/1/windows/shell/Send",
            Action::Signal => "http://schemas.microsoft.com/wbem/wsman/1/windows/shell/Signal",
            Action::Delete => "http://schemas.xmlsoap.org/ws/2004/09/transfer/Delete",
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Action::Create => "create",
            Action::Command => "command",
            Action::Receive => "receive",
            Action::Send => "send",
            Action::Signal => "signal",
            Action::Delete => "delete",
        }
    }
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.name())
    }
}

/// A serialized request envelope, ready to POST.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Envelope {
    action: Action,
    message_id: String,
    xml: String,
}

impl Envelope {
    pub(crate) fn new(action: Action, message_id: String, xml: String) -> Self {
        Self {
            action,
            message_id,
            xml,
        }
    }

    pub fn action(&self) -> Action {
        self.action
    }

    pub fn message_id(&self) -> &str {
        &self.message_id
    }

    pub fn as_str(&self) -> &str {
        &self.xml
    }

    pub fn into_string(self) -> String {
        self.xml
    }
}

/// Escape text for use inside an XML element or attribute.
pub(crate) fn xml_escape(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for c in s.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&apos;"),
            _ => out.push(c),
        }
    }
    out
}
