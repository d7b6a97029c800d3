//! Scripted in-process WinRM host for state machine tests.
//!
//! [`FakeHost`] plugs into a [`Client`] as its transport, records every
//! action it receives and answers from a script. Receive polls with an empty
//! script report a running command with no output.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use base64::{Engine, engine::general_purpose::STANDARD as BASE64_STANDARD};

use crate::client::Client;
use crate::config::{Endpoint, Parameters};
use crate::error::{Result, WinRmError};
use crate::soap::{Action, Envelope};
use crate::transport::Transporter;

pub(crate) const OPERATION_TIMEOUT_FAULT: &str = r#"<s:Envelope><s:Body><s:Fault><s:Detail><f:WSManFault Code="2150858793"><f:Message>The WS-Management service cannot complete the operation within the time specified in OperationTimeout.</f:Message></f:WSManFault></s:Detail></s:Fault></s:Body></s:Envelope>"#;

/// One scripted answer to a Receive poll.
#[derive(Debug, Clone)]
pub(crate) enum Reply {
    Output { stdout: Vec<u8>, stderr: Vec<u8> },
    Done(i32),
    Error(WinRmError),
}

#[derive(Default)]
struct HostState {
    shell_id: String,
    command_id: String,
    actions: Vec<Action>,
    commands: Vec<String>,
    create_response: Option<String>,
    receive_script: VecDeque<Reply>,
    receive_delay: Duration,
    failures: HashMap<Action, WinRmError>,
    echo_stdin: bool,
    stdin: Vec<u8>,
    stdin_chunks: usize,
    echoed: usize,
    stdin_closed: bool,
}

/// Handle to a scripted host; clones share the same state.
#[derive(Clone)]
pub(crate) struct FakeHost {
    state: Arc<Mutex<HostState>>,
}

impl FakeHost {
    pub(crate) fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(HostState {
                shell_id: "11111111-2222-3333-4444-555555555555".to_string(),
                command_id: "AAAAAAAA-BBBB-CCCC-DDDD-EEEEEEEEEEEE".to_string(),
                ..HostState::default()
            })),
        }
    }

    fn with_state(self, f: impl FnOnce(&mut HostState)) -> Self {
        f(&mut self.lock());
        self
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HostState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub(crate) fn with_create_response(self, body: &str) -> Self {
        let body = body.to_string();
        self.with_state(|s| s.create_response = Some(body))
    }

    /// Every call for `action` fails with `error`.
    pub(crate) fn fail_action(self, action: Action, error: WinRmError) -> Self {
        self.with_state(|s| {
            s.failures.insert(action, error);
        })
    }

    /// Delay every Receive answer by `delay`.
    pub(crate) fn with_receive_delay(self, delay: Duration) -> Self {
        self.with_state(|s| s.receive_delay = delay)
    }

    pub(crate) fn push_stdout(self, data: &[u8]) -> Self {
        self.push_reply(Reply::Output {
            stdout: data.to_vec(),
            stderr: Vec::new(),
        })
    }

    pub(crate) fn push_stderr(self, data: &[u8]) -> Self {
        self.push_reply(Reply::Output {
            stdout: Vec::new(),
            stderr: data.to_vec(),
        })
    }

    pub(crate) fn push_done(self, exit_code: i32) -> Self {
        self.push_reply(Reply::Done(exit_code))
    }

    pub(crate) fn push_reply(self, reply: Reply) -> Self {
        self.with_state(|s| s.receive_script.push_back(reply))
    }

    /// Answer Receive polls by echoing stdin back on stdout, then report
    /// Done(0) once end-of-input has arrived and everything was echoed.
    pub(crate) fn echo_stdin(self) -> Self {
        self.with_state(|s| s.echo_stdin = true)
    }

    pub(crate) fn client(&self) -> Client {
        self.client_with(Parameters::default())
    }

    pub(crate) fn client_with(&self, params: Parameters) -> Client {
        let state = Arc::clone(&self.state);
        let params = params.with_transport(move || {
            Box::new(FakeTransport {
                state: Arc::clone(&state),
            })
        });
        Client::with_parameters(&Endpoint::new("fake-host", 5985), "user", "pass", params)
            .unwrap_or_else(|e| panic!("fake client: {}", e))
    }

    pub(crate) fn shell_id(&self) -> String {
        self.lock().shell_id.clone()
    }

    pub(crate) fn actions(&self) -> Vec<Action> {
        self.lock().actions.clone()
    }

    pub(crate) fn count(&self, action: Action) -> usize {
        self.lock().actions.iter().filter(|a| **a == action).count()
    }

    pub(crate) fn commands(&self) -> Vec<String> {
        self.lock().commands.clone()
    }

    pub(crate) fn stdin(&self) -> Vec<u8> {
        self.lock().stdin.clone()
    }

    pub(crate) fn stdin_chunks(&self) -> usize {
        self.lock().stdin_chunks
    }

    pub(crate) fn stdin_closed(&self) -> bool {
        self.lock().stdin_closed
    }

    /// Wait up to one second for `action` to have been received.
    pub(crate) async fn wait_for(&self, action: Action) -> bool {
        for _ in 0..100 {
            if self.count(action) > 0 {
                return true;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        false
    }
}

struct FakeTransport {
    state: Arc<Mutex<HostState>>,
}

impl FakeTransport {
    fn lock(&self) -> std::sync::MutexGuard<'_, HostState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

#[async_trait]
impl Transporter for FakeTransport {
    fn configure(&mut self, _endpoint: &Endpoint) -> Result<()> {
        Ok(())
    }

    async fn post(&self, _client: &Client, envelope: &Envelope) -> Result<String> {
        // A real exchange always suspends; keep spinning pollers from
        // starving the current-thread test runtime
        tokio::task::yield_now().await;

        let action = envelope.action();
        let (failure, delay) = {
            let mut state = self.lock();
            state.actions.push(action);
            (state.failures.get(&action).cloned(), state.receive_delay)
        };
        if action == Action::Receive && !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        if let Some(error) = failure {
            return Err(error);
        }

        let xml = envelope.as_str();
        let mut state = self.lock();
        match action {
            Action::Create => Ok(state.create_response.clone().unwrap_or_else(|| {
                format!(
                    "<s:Envelope><s:Body><rsp:Shell><rsp:ShellId>{}</rsp:ShellId></rsp:Shell></s:Body></s:Envelope>",
                    state.shell_id
                )
            })),
            Action::Command => {
                if let Some(text) = between(xml, "<rsp:Command>", "</rsp:Command>") {
                    state.commands.push(text.to_string());
                }
                Ok(format!(
                    "<s:Envelope><s:Body><rsp:CommandResponse><rsp:CommandId>{}</rsp:CommandId></rsp:CommandResponse></s:Body></s:Envelope>",
                    state.command_id
                ))
            }
            Action::Send => {
                let stream = xml.find("<rsp:Stream").map_or("", |at| &xml[at..]);
                let payload = between(stream, ">", "</rsp:Stream>").unwrap_or_default();
                let decoded = BASE64_STANDARD.decode(payload).unwrap_or_default();
                state.stdin.extend_from_slice(&decoded);
                state.stdin_chunks += 1;
                if xml.contains("End=\"true\"") {
                    state.stdin_closed = true;
                }
                Ok(empty_body())
            }
            Action::Receive => receive_reply(&mut state),
            Action::Signal | Action::Delete => Ok(empty_body()),
        }
    }

    fn name(&self) -> &'static str {
        "fake"
    }
}

fn receive_reply(state: &mut HostState) -> Result<String> {
    let command_id = state.command_id.clone();
    if state.echo_stdin {
        let pending = state.stdin[state.echoed..].to_vec();
        state.echoed = state.stdin.len();
        let done = state.stdin_closed.then_some(0);
        return Ok(receive_body(&command_id, &pending, &[], done));
    }

    match state.receive_script.pop_front() {
        Some(Reply::Output { stdout, stderr }) => {
            Ok(receive_body(&command_id, &stdout, &stderr, None))
        }
        Some(Reply::Done(code)) => Ok(receive_body(&command_id, &[], &[], Some(code))),
        Some(Reply::Error(error)) => Err(error),
        None => Ok(receive_body(&command_id, &[], &[], None)),
    }
}

fn receive_body(command_id: &str, stdout: &[u8], stderr: &[u8], done: Option<i32>) -> String {
    let mut body = String::from("<s:Envelope><s:Body><rsp:ReceiveResponse>");
    if !stdout.is_empty() {
        body.push_str(&format!(
            "<rsp:Stream Name=\"stdout\" CommandId=\"{}\">{}</rsp:Stream>",
            command_id,
            BASE64_STANDARD.encode(stdout)
        ));
    }
    if !stderr.is_empty() {
        body.push_str(&format!(
            "<rsp:Stream Name=\"stderr\" CommandId=\"{}\">{}</rsp:Stream>",
            command_id,
            BASE64_STANDARD.encode(stderr)
        ));
    }
    match done {
        Some(code) => body.push_str(&format!(
            "<rsp:Stream Name=\"stdout\" CommandId=\"{id}\" End=\"true\"/>\
             <rsp:CommandState CommandId=\"{id}\" State=\"http://schemas.microsoft.com/wbem/wsman/1/windows/shell/CommandState/Done\">\
             <rsp:ExitCode>{code}</rsp:ExitCode></rsp:CommandState>",
            id = command_id,
            code = code
        )),
        None => body.push_str(&format!(
            "<rsp:CommandState CommandId=\"{}\" State=\"http://schemas.microsoft.com/wbem/wsman/1/windows/shell/CommandState/Running\"/>",
            command_id
        )),
    }
    body.push_str("</rsp:ReceiveResponse></s:Body></s:Envelope>");
    body
}

fn empty_body() -> String {
    "<s:Envelope><s:Body/></s:Envelope>".to_string()
}

fn between<'a>(text: &'a str, start: &str, end: &str) -> Option<&'a str> {
    let from = text.find(start)? + start.len();
    let len = text[from..].find(end)?;
    Some(&text[from..from + len])
}

/// A sink whose every write fails.
pub(crate) struct BrokenSink;

impl tokio::io::AsyncWrite for BrokenSink {
    fn poll_write(
        self: std::pin::Pin<&mut Self>,
        _cx: &mut std::task::Context<'_>,
        _buf: &[u8],
    ) -> std::task::Poll<std::io::Result<usize>> {
        std::task::Poll::Ready(Err(std::io::Error::new(
            std::io::ErrorKind::BrokenPipe,
            "sink closed",
        )))
    }

    fn poll_flush(
        self: std::pin::Pin<&mut Self>,
        _cx: &mut std::task::Context<'_>,
    ) -> std::task::Poll<std::io::Result<()>> {
        std::task::Poll::Ready(Ok(()))
    }

    fn poll_shutdown(
        self: std::pin::Pin<&mut Self>,
        _cx: &mut std::task::Context<'_>,
    ) -> std::task::Poll<std::io::Result<()>> {
        std::task::Poll::Ready(Ok(()))
    }
}
