//! Builders for the remote shell request envelopes.
//!
//! Every request shares the same WS-Addressing/WS-Management header; the
//! free functions at the bottom of this module fill in the per-action parts.

use base64::{Engine, engine::general_purpose::STANDARD as BASE64_STANDARD};
use uuid::Uuid;

use super::{
    ANONYMOUS_ADDRESS, Action, Envelope, SHELL_NS, SHELL_RESOURCE_URI, SIGNAL_TERMINATE,
    SOAP_ENV_NS, WSA_NS, WSMAN_MS_NS, WSMAN_NS, xml_escape,
};
use crate::config::{Parameters, format_duration};

/// Fluent builder for one request envelope.
///
/// # Example
///
/// ```ignore
/// let envelope = EnvelopeBuilder::new(Action::Delete, url, &params)
///     .with_shell_id("11111111-2222-3333-4444-555555555555")
///     .build();
/// ```
pub struct EnvelopeBuilder<'a> {
    action: Action,
    to: &'a str,
    params: &'a Parameters,
    shell_id: Option<&'a str>,
    options: Vec<(&'static str, &'static str)>,
    body: Option<String>,
}

impl<'a> EnvelopeBuilder<'a> {
    pub fn new(action: Action, to: &'a str, params: &'a Parameters) -> Self {
        Self {
            action,
            to,
            params,
            shell_id: None,
            options: Vec::new(),
            body: None,
        }
    }

    /// Address the request at an existing shell.
    pub fn with_shell_id(mut self, shell_id: &'a str) -> Self {
        self.shell_id = Some(shell_id);
        self
    }

    /// Add a `w:Option` to the header OptionSet.
    pub fn with_option(mut self, name: &'static str, value: &'static str) -> Self {
        self.options.push((name, value));
        self
    }

    /// Set the `s:Body` content (already serialized XML).
    pub fn with_body(mut self, body: impl Into<String>) -> Self {
        self.body = Some(body.into());
        self
    }

    pub fn build(self) -> Envelope {
        let message_id = format!("uuid:{}", Uuid::new_v4());
        let locale = xml_escape(&self.params.locale);

        let mut xml = String::with_capacity(2048);
        xml.push_str(&format!(
            r#"<?xml version="1.0" encoding="UTF-8"?>
<s:Envelope xmlns:s="{SOAP_ENV_NS}" xmlns:a="{WSA_NS}" xmlns:w="{WSMAN_NS}" xmlns:p="{WSMAN_MS_NS}" xmlns:rsp="{SHELL_NS}">
<s:Header>
<a:To>{to}</a:To>
<a:ReplyTo><a:Address s:mustUnderstand="true">{ANONYMOUS_ADDRESS}</a:Address></a:ReplyTo>
<w:MaxEnvelopeSize s:mustUnderstand="true">{size}</w:MaxEnvelopeSize>
<a:MessageID>{message_id}</a:MessageID>
<w:Locale s:mustUnderstand="false" xml:lang="{locale}"/>
<p:DataLocale s:mustUnderstand="false" xml:lang="{locale}"/>
<w:OperationTimeout>{timeout}</w:OperationTimeout>
<w:ResourceURI s:mustUnderstand="true">{SHELL_RESOURCE_URI}</w:ResourceURI>
<a:Action s:mustUnderstand="true">{action}</a:Action>
"#,
            to = xml_escape(self.to),
            size = self.params.envelope_size,
            timeout = format_duration(self.params.operation_timeout),
            action = self.action.uri(),
        ));

        if let Some(shell_id) = self.shell_id {
            xml.push_str(&format!(
                "<w:SelectorSet><w:Selector Name=\"ShellId\">{}</w:Selector></w:SelectorSet>\n",
                xml_escape(shell_id)
            ));
        }

        if !self.options.is_empty() {
            xml.push_str("<w:OptionSet>");
            for (name, value) in &self.options {
                xml.push_str(&format!("<w:Option Name=\"{}\">{}</w:Option>", name, value));
            }
            xml.push_str("</w:OptionSet>\n");
        }

        xml.push_str("</s:Header>\n");
        match self.body {
            Some(body) => {
                xml.push_str("<s:Body>");
                xml.push_str(&body);
                xml.push_str("</s:Body>\n");
            }
            None => xml.push_str("<s:Body/>\n"),
        }
        xml.push_str("</s:Envelope>");

        Envelope::new(self.action, message_id, xml)
    }
}

/// Create a new `cmd` shell with stdin and stdout/stderr streams.
pub fn open_shell(to: &str, params: &Parameters) -> Envelope {
    EnvelopeBuilder::new(Action::Create, to, params)
        .with_option("WINRS_NOPROFILE", "FALSE")
        .with_option("WINRS_CODEPAGE", "65001")
        .with_body(
            "<rsp:Shell><rsp:InputStreams>stdin</rsp:InputStreams>\
             <rsp:OutputStreams>stdout stderr</rsp:OutputStreams></rsp:Shell>",
        )
        .build()
}

/// Start `command` inside the shell.
pub fn execute_command(to: &str, params: &Parameters, shell_id: &str, command: &str) -> Envelope {
    EnvelopeBuilder::new(Action::Command, to, params)
        .with_shell_id(shell_id)
        .with_option("WINRS_CONSOLEMODE_STDIN", "TRUE")
        .with_option("WINRS_SKIP_CMD_SHELL", "FALSE")
        .with_body(format!(
            "<rsp:CommandLine><rsp:Command>{}</rsp:Command></rsp:CommandLine>",
            xml_escape(command)
        ))
        .build()
}

/// Poll for stdout/stderr output and command state.
pub fn receive(to: &str, params: &Parameters, shell_id: &str, command_id: &str) -> Envelope {
    EnvelopeBuilder::new(Action::Receive, to, params)
        .with_shell_id(shell_id)
        .with_body(format!(
            "<rsp:Receive><rsp:DesiredStream CommandId=\"{}\">stdout stderr</rsp:DesiredStream></rsp:Receive>",
            xml_escape(command_id)
        ))
        .build()
}

/// Push one stdin chunk; `end` marks end-of-input.
pub fn send_input(
    to: &str,
    params: &Parameters,
    shell_id: &str,
    command_id: &str,
    data: &[u8],
    end: bool,
) -> Envelope {
    let end_attr = if end { " End=\"true\"" } else { "" };
    EnvelopeBuilder::new(Action::Send, to, params)
        .with_shell_id(shell_id)
        .with_body(format!(
            "<rsp:Send><rsp:Stream Name=\"stdin\" CommandId=\"{}\"{}>{}</rsp:Stream></rsp:Send>",
            xml_escape(command_id),
            end_attr,
            BASE64_STANDARD.encode(data)
        ))
        .build()
}

/// Ask the remote command to terminate.
pub fn signal(to: &str, params: &Parameters, shell_id: &str, command_id: &str) -> Envelope {
    EnvelopeBuilder::new(Action::Signal, to, params)
        .with_shell_id(shell_id)
        .with_body(format!(
            "<rsp:Signal CommandId=\"{}\"><rsp:Code>{}</rsp:Code></rsp:Signal>",
            xml_escape(command_id),
            SIGNAL_TERMINATE
        ))
        .build()
}

/// Delete the shell resource.
pub fn delete_shell(to: &str, params: &Parameters, shell_id: &str) -> Envelope {
    EnvelopeBuilder::new(Action::Delete, to, params)
        .with_shell_id(shell_id)
        .build()
}
