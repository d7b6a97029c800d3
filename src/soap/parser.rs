//! Field extraction from WS-Management responses.
//!
//! Hosts differ in which namespace prefixes they emit, so elements are
//! matched by local name only.

use base64::{Engine, engine::general_purpose::STANDARD as BASE64_STANDARD};

use crate::error::{Result, WinRmError};

/// One decoded Receive response.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReceiveResponse {
    /// Decoded stdout fragments, in wire order
    pub stdout: Vec<Vec<u8>>,
    /// Decoded stderr fragments, in wire order
    pub stderr: Vec<Vec<u8>>,
    /// The command reported its `Done` state
    pub done: bool,
    /// Exit code carried with the `Done` state
    pub exit_code: Option<i32>,
}

/// Extract the shell ID from a Create response.
pub fn parse_shell_id(body: &str) -> Result<String> {
    if let Some(id) = elements(body, "ShellId")
        .map(|e| e.text.trim())
        .find(|t| !t.is_empty())
    {
        return Ok(id.to_string());
    }

    elements(body, "Selector")
        .filter(|e| attribute(e.attrs, "Name") == Some("ShellId"))
        .map(|e| e.text.trim())
        .find(|t| !t.is_empty())
        .map(str::to_string)
        .ok_or_else(|| WinRmError::Protocol("response carries no ShellId".to_string()))
}

/// Extract the command ID from a Command response.
pub fn parse_command_id(body: &str) -> Result<String> {
    elements(body, "CommandId")
        .map(|e| e.text.trim())
        .find(|t| !t.is_empty())
        .map(str::to_string)
        .ok_or_else(|| WinRmError::Protocol("response carries no CommandId".to_string()))
}

/// Decode the output fragments and command state of a Receive response.
pub fn parse_receive(body: &str) -> Result<ReceiveResponse> {
    let mut response = ReceiveResponse::default();

    for stream in elements(body, "Stream") {
        let content = stream.text.trim();
        if content.is_empty() {
            continue;
        }
        let decoded = BASE64_STANDARD
            .decode(content)
            .map_err(|e| WinRmError::Protocol(format!("malformed stream chunk: {}", e)))?;
        match attribute(stream.attrs, "Name") {
            Some("stdout") => response.stdout.push(decoded),
            Some("stderr") => response.stderr.push(decoded),
            _ => {}
        }
    }

    if let Some(state) = elements(body, "CommandState").next() {
        response.done = attribute(state.attrs, "State").is_some_and(|s| s.ends_with("/Done"));
        if let Some(code) = elements(state.text, "ExitCode").next() {
            let code = code.text.trim();
            response.exit_code = Some(code.parse::<i32>().map_err(|_| {
                WinRmError::Protocol(format!("malformed exit code {:?}", code))
            })?);
        }
    }

    Ok(response)
}

/// Human-readable reason of a SOAP fault, if the body is one.
pub fn fault_message(body: &str) -> Option<String> {
    elements(body, "Fault").next()?;
    elements(body, "Message")
        .chain(elements(body, "Text"))
        .map(|e| e.text.trim())
        .find(|t| !t.is_empty())
        .map(str::to_string)
}

struct Element<'a> {
    attrs: &'a str,
    text: &'a str,
}

fn elements<'a>(xml: &'a str, local_name: &'a str) -> Elements<'a> {
    Elements {
        xml,
        pos: 0,
        local_name,
    }
}

/// Iterator over elements with a given local name, any prefix.
///
/// Self-closing elements yield empty text. Nested elements of the same name
/// are not supported; none of the fields read here nest.
struct Elements<'a> {
    xml: &'a str,
    pos: usize,
    local_name: &'a str,
}

impl<'a> Iterator for Elements<'a> {
    type Item = Element<'a>;

    fn next(&mut self) -> Option<Self::Item> {
        let xml = self.xml;
        while let Some(offset) = xml[self.pos..].find('<') {
            let start = self.pos + offset + 1;
            let tag_end = start + xml[start..].find('>')?;
            self.pos = tag_end + 1;

            let tag = &xml[start..tag_end];
            if tag.starts_with(['/', '?', '!']) {
                continue;
            }
            let name_len = tag
                .find(|c: char| c.is_whitespace() || c == '/')
                .unwrap_or(tag.len());
            let qname = &tag[..name_len];
            let local = qname.rsplit(':').next().unwrap_or(qname);
            if local != self.local_name {
                continue;
            }

            if let Some(attrs) = tag.strip_suffix('/') {
                return Some(Element {
                    attrs: &attrs[name_len.min(attrs.len())..],
                    text: "",
                });
            }

            let closing = format!("</{}>", qname);
            let close = xml[self.pos..].find(&closing)?;
            let text = &xml[self.pos..self.pos + close];
            self.pos += close + closing.len();
            return Some(Element {
                attrs: &tag[name_len..],
                text,
            });
        }
        None
    }
}

/// Value of `name="..."` (or single-quoted) in an attribute list.
fn attribute<'a>(attrs: &'a str, name: &str) -> Option<&'a str> {
    let mut rest = attrs;
    while let Some(idx) = rest.find(name) {
        let boundary = idx == 0 || rest[..idx].ends_with(|c: char| c.is_whitespace());
        let after = rest[idx + name.len()..].trim_start();
        if boundary && let Some(value) = after.strip_prefix('=') {
            let value = value.trim_start();
            let quote = value.chars().next()?;
            if quote == '"' || quote == '\'' {
                let inner = &value[1..];
                return inner.find(quote).map(|end| &inner[..end]);
            }
        }
        rest = &rest[idx + name.len()..];
    }
    None
}
