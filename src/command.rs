//! Remote command execution and its stream duties.
//!
//! Each [`Command`] runs three duties until the remote process finishes:
//!
//! 1. **Receive loop**: a spawned task polling `Receive` one request at a
//!    time. Decoded stdout/stderr fragments go to bounded channels in wire
//!    order; the loop stops on the `Done` state, on the first error, on
//!    timeout, or on cancellation.
//!
//! 2. **Stdout/stderr**: [`OutputReader`]s drain the channels into caller
//!    sinks. A failing sink is recorded and its reader keeps draining so the
//!    receive loop never stalls.
//!
//! 3. **Stdin**: [`CommandInput`] pushes caller input as `Send` chunks and
//!    marks end-of-input with a final empty chunk.
//!
//! ## Error policy
//!
//! The first error raised by any duty is latched into the command; later
//! errors are logged and discarded. Duties are never aborted on another's
//! error, they drain to their own end.
//!
//! ## Cancellation and timeouts
//!
//! When the command's token fires, the receive loop sends one terminate
//! signal, lets the in-flight poll settle and stops with
//! [`WinRmError::Cancelled`]. Each poll is bounded by the operation timeout
//! plus [`RECEIVE_GRACE`]; `Parameters::command_timeout` bounds the whole
//! loop. Either bound elapsing terminates the command and latches
//! [`WinRmError::Timeout`]. An OperationTimeout fault from the host only
//! means "no output yet" and polling continues.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::{Mutex, mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

use crate::error::{Result, WinRmError};
use crate::shell::Shell;
use crate::soap;
use crate::types::CommandStatus;

/// Exit code reported when a command was cancelled or failed before the
/// host reported one.
pub const FAILURE_EXIT_CODE: i32 = -1;

/// Extra time a single Receive may take beyond the WS-Man OperationTimeout.
pub const RECEIVE_GRACE: Duration = Duration::from_secs(10);

/// Upper bound for one stdin chunk before base64 encoding.
const MAX_STDIN_CHUNK: usize = 32 * 1024;

/// Room left in each envelope for headers around a stdin chunk.
const ENVELOPE_OVERHEAD: usize = 4096;

/// Decoded fragments buffered per output stream.
const OUTPUT_CHANNEL_CAPACITY: usize = 64;

/// Largest stdin chunk that fits an envelope of `envelope_size` bytes once
/// base64 encoded.
pub(crate) fn stdin_chunk_size(envelope_size: usize) -> usize {
    let budget = envelope_size.saturating_sub(ENVELOPE_OVERHEAD) * 3 / 4;
    budget.clamp(1, MAX_STDIN_CHUNK)
}

/// Single-assignment error cell: the first writer wins.
#[derive(Debug, Default)]
pub(crate) struct ErrorSlot(OnceLock<WinRmError>);

impl ErrorSlot {
    /// Record `error` unless one is already latched. Returns whether this
    /// call won.
    pub(crate) fn latch(&self, error: WinRmError) -> bool {
        match self.0.set(error) {
            Ok(()) => true,
            Err(discarded) => {
                debug!(error = %discarded, "Discarding error after first failure");
                false
            }
        }
    }

    pub(crate) fn get(&self) -> Option<WinRmError> {
        self.0.get().cloned()
    }
}

/// State shared between a command handle and its receive loop.
struct CommandShared {
    error: ErrorSlot,
    exit_code: OnceLock<i32>,
    terminate_sent: AtomicBool,
    status: watch::Sender<CommandStatus>,
}

impl CommandShared {
    /// Send the terminate signal unless it was already sent.
    async fn terminate(&self, shell: &Shell, command_id: &str) -> Result<()> {
        if self.terminate_sent.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        let client = shell.client();
        let envelope = soap::signal(client.url(), client.parameters(), shell.id(), command_id);
        client.exchange(&envelope).await.map(|_| ())
    }
}

/// One process running inside a remote shell.
pub struct Command {
    shell: Shell,
    id: String,
    cancel: CancellationToken,
    finished: CancellationToken,
    shared: Arc<CommandShared>,
    stdin: CommandInput,
    stdout: Option<OutputReader>,
    stderr: Option<OutputReader>,
    poller: Option<JoinHandle<()>>,
}

impl Command {
    /// Spawn the receive loop for a freshly created command.
    pub(crate) fn start(shell: Shell, id: String, cancel: CancellationToken) -> Self {
        let (status_tx, _) = watch::channel(CommandStatus::Running);
        let shared = Arc::new(CommandShared {
            error: ErrorSlot::default(),
            exit_code: OnceLock::new(),
            terminate_sent: AtomicBool::new(false),
            status: status_tx,
        });
        let finished = CancellationToken::new();
        let (stdout_tx, stdout_rx) = mpsc::channel(OUTPUT_CHANNEL_CAPACITY);
        let (stderr_tx, stderr_rx) = mpsc::channel(OUTPUT_CHANNEL_CAPACITY);

        let receive_loop = ReceiveLoop {
            shell: shell.clone(),
            command_id: id.clone(),
            cancel: cancel.clone(),
            finished: finished.clone(),
            shared: Arc::clone(&shared),
            stdout: stdout_tx,
            stderr: stderr_tx,
        };
        let poller = tokio::spawn(receive_loop.run());

        let stdin = CommandInput {
            inner: Arc::new(InputInner {
                chunk_size: stdin_chunk_size(shell.client().parameters().envelope_size),
                shell: shell.clone(),
                command_id: id.clone(),
                closed: AtomicBool::new(false),
                cancel: cancel.clone(),
                finished: finished.clone(),
                send_lock: Mutex::new(()),
            }),
        };

        Self {
            shell,
            id,
            cancel,
            finished,
            shared,
            stdin,
            stdout: Some(OutputReader::new("stdout", stdout_rx)),
            stderr: Some(OutputReader::new("stderr", stderr_rx)),
            poller: Some(poller),
        }
    }

    /// Server-issued command ID.
    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn shell(&self) -> &Shell {
        &self.shell
    }

    pub fn status(&self) -> CommandStatus {
        *self.shared.status.borrow()
    }

    /// Watch status transitions.
    pub fn subscribe(&self) -> watch::Receiver<CommandStatus> {
        self.shared.status.subscribe()
    }

    pub fn is_cancelled(&self) -> bool {
        self.status() == CommandStatus::Cancelled
    }

    /// Whether the receive loop has stopped.
    pub fn is_finished(&self) -> bool {
        self.finished.is_cancelled()
    }

    /// Handle for writing to the remote process's stdin.
    pub fn stdin(&self) -> CommandInput {
        self.stdin.clone()
    }

    /// Take the stdout stream. Returns `None` once taken.
    pub fn take_stdout(&mut self) -> Option<OutputReader> {
        self.stdout.take()
    }

    /// Take the stderr stream. Returns `None` once taken.
    pub fn take_stderr(&mut self) -> Option<OutputReader> {
        self.stderr.take()
    }

    /// Run the stream duties against caller sinks and wait for the command.
    ///
    /// Output streams not yet taken are copied to `stdout` and `stderr`.
    /// With `stdin` set, its content is forwarded and end-of-input is sent
    /// when it is exhausted; with `None` the stdin duty is done at once.
    /// Returns the first error any duty raised.
    pub async fn pump<O, E, R>(
        &mut self,
        stdout: &mut O,
        stderr: &mut E,
        stdin: Option<R>,
    ) -> Result<()>
    where
        O: AsyncWrite + Unpin + ?Sized,
        E: AsyncWrite + Unpin + ?Sized,
        R: AsyncRead + Unpin,
    {
        let out = self.stdout.take();
        let err = self.stderr.take();
        let input = self.stdin.clone();
        let slot = &self.shared.error;

        let stdin_duty = async move {
            if let Some(reader) = stdin
                && let Err(e) = input.pump_from(reader).await
            {
                slot.latch(e);
            }
        };
        let stdout_duty = async move {
            if let Some(mut reader) = out
                && let Err(e) = reader.copy_to(stdout).await
            {
                slot.latch(e);
            }
        };
        let stderr_duty = async move {
            if let Some(mut reader) = err
                && let Err(e) = reader.copy_to(stderr).await
            {
                slot.latch(e);
            }
        };
        tokio::join!(stdin_duty, stdout_duty, stderr_duty);

        self.wait().await
    }

    /// Wait for the receive loop to stop.
    ///
    /// Output streams still held by the command are discarded. A stream
    /// taken with `take_stdout`/`take_stderr` must be drained concurrently,
    /// otherwise the receive loop stalls once its buffer is full.
    pub async fn wait(&mut self) -> Result<()> {
        self.stdout = None;
        self.stderr = None;

        if let Some(poller) = self.poller.take()
            && let Err(e) = poller.await
        {
            self.shared
                .error
                .latch(WinRmError::Protocol(format!("receive loop aborted: {}", e)));
            self.shared.status.send_replace(CommandStatus::Failed);
        }

        match self.shared.error.get() {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    /// Terminate the remote process.
    ///
    /// Stops the receive loop if it is still running. The terminate signal
    /// is sent at most once per command, whether by `close` or by
    /// cancellation.
    pub async fn close(&self) -> Result<()> {
        if self.shell.is_closed() {
            return Err(WinRmError::ShellClosed(self.shell.id().to_string()));
        }
        self.cancel.cancel();
        self.shared.terminate(&self.shell, &self.id).await
    }

    /// Exit code reported by the host, or [`FAILURE_EXIT_CODE`] when the
    /// command was cancelled or stopped before reaching `Done`.
    pub fn exit_code(&self) -> i32 {
        if self.is_cancelled() {
            return FAILURE_EXIT_CODE;
        }
        self.shared
            .exit_code
            .get()
            .copied()
            .unwrap_or(FAILURE_EXIT_CODE)
    }

    /// First error raised by any duty.
    pub fn error(&self) -> Option<WinRmError> {
        self.shared.error.get()
    }

    /// Exit code, or the latched error.
    pub fn result(&self) -> Result<i32> {
        match self.error() {
            Some(e) => Err(e),
            None => Ok(self.exit_code()),
        }
    }
}

impl std::fmt::Debug for Command {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Command")
            .field("id", &self.id)
            .field("shell_id", &self.shell.id())
            .field("status", &self.status())
            .finish()
    }
}

impl Drop for Command {
    fn drop(&mut self) {
        // An abandoned command still terminates remotely
        if self.poller.is_some() {
            self.cancel.cancel();
        }
    }
}

/// The receive loop of one command.
struct ReceiveLoop {
    shell: Shell,
    command_id: String,
    cancel: CancellationToken,
    finished: CancellationToken,
    shared: Arc<CommandShared>,
    stdout: mpsc::Sender<Vec<u8>>,
    stderr: mpsc::Sender<Vec<u8>>,
}

impl ReceiveLoop {
    async fn run(self) {
        let status = self.poll().await;
        debug!(
            shell_id = %self.shell.id(),
            command_id = %self.command_id,
            status = %status,
            "Receive loop finished"
        );
        self.shared.status.send_replace(status);
        self.finished.cancel();
    }

    async fn poll(&self) -> CommandStatus {
        let client = self.shell.client();
        let params = client.parameters();
        let round_trip = params.operation_timeout + RECEIVE_GRACE;
        let deadline = params
            .command_timeout
            .map(|limit| (limit, Instant::now() + limit));

        loop {
            if self.cancel.is_cancelled() {
                return self.stop(WinRmError::Cancelled).await;
            }

            let envelope =
                soap::receive(client.url(), params, self.shell.id(), &self.command_id);
            let request = tokio::time::timeout(round_trip, client.exchange(&envelope));
            tokio::pin!(request);

            let outcome = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => {
                    self.terminate().await;
                    let _ = request.await;
                    return self.stop(WinRmError::Cancelled).await;
                }
                _ = sleep_until(deadline.map(|(_, at)| at)) => {
                    self.terminate().await;
                    let _ = request.await;
                    let limit = deadline.map_or(round_trip, |(limit, _)| limit);
                    return self.stop(WinRmError::Timeout(limit)).await;
                }
                outcome = &mut request => outcome,
            };

            let body = match outcome {
                Err(_) => {
                    warn!(
                        command_id = %self.command_id,
                        timeout = ?round_trip,
                        "Receive exceeded its time bound"
                    );
                    return self.stop(WinRmError::Timeout(round_trip)).await;
                }
                Ok(Err(e)) if e.is_operation_timeout_fault() => {
                    trace!(command_id = %self.command_id, "No output within operation timeout");
                    continue;
                }
                Ok(Err(e)) => {
                    if let WinRmError::Http { ref body, .. } = e {
                        warn!(
                            command_id = %self.command_id,
                            fault = ?soap::fault_message(body),
                            "Receive failed"
                        );
                    }
                    self.shared.error.latch(e);
                    return CommandStatus::Failed;
                }
                Ok(Ok(body)) => body,
            };

            let response = match soap::parse_receive(&body) {
                Ok(response) => response,
                Err(e) => {
                    self.shared.error.latch(e);
                    return CommandStatus::Failed;
                }
            };

            for chunk in response.stdout {
                trace!(command_id = %self.command_id, len = chunk.len(), "stdout chunk");
                self.forward(&self.stdout, chunk).await;
            }
            for chunk in response.stderr {
                trace!(command_id = %self.command_id, len = chunk.len(), "stderr chunk");
                self.forward(&self.stderr, chunk).await;
            }

            if response.done {
                // Hosts always send ExitCode with Done; treat a missing one as success
                let code = response.exit_code.unwrap_or(0);
                let _ = self.shared.exit_code.set(code);
                debug!(command_id = %self.command_id, exit_code = code, "Command done");
                return CommandStatus::Done;
            }
        }
    }

    /// Hand a fragment to its reader. Dropped readers discard output;
    /// cancellation abandons a fragment the reader is not taking.
    async fn forward(&self, tx: &mpsc::Sender<Vec<u8>>, chunk: Vec<u8>) {
        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => {}
            _ = tx.send(chunk) => {}
        }
    }

    async fn terminate(&self) {
        if let Err(e) = self.shared.terminate(&self.shell, &self.command_id).await {
            warn!(command_id = %self.command_id, error = %e, "Terminate signal failed");
        }
    }

    async fn stop(&self, error: WinRmError) -> CommandStatus {
        self.terminate().await;
        let status = if error.is_cancelled() {
            CommandStatus::Cancelled
        } else {
            CommandStatus::Failed
        };
        self.shared.error.latch(error);
        status
    }
}

async fn sleep_until(deadline: Option<Instant>) {
    match deadline {
        Some(at) => tokio::time::sleep_until(at).await,
        None => std::future::pending().await,
    }
}

/// Writable stdin of a remote command. Clones write to the same stream.
#[derive(Clone)]
pub struct CommandInput {
    inner: Arc<InputInner>,
}

struct InputInner {
    shell: Shell,
    command_id: String,
    chunk_size: usize,
    closed: AtomicBool,
    cancel: CancellationToken,
    finished: CancellationToken,
    /// Keeps chunks from concurrent writers whole and in order
    send_lock: Mutex<()>,
}

impl CommandInput {
    /// Send `data`, split into envelope-sized chunks.
    ///
    /// Fails once end-of-input was sent, the shell is closed, or the
    /// command was cancelled or has finished.
    pub async fn write(&self, data: &[u8]) -> Result<usize> {
        let _guard = self.inner.send_lock.lock().await;
        self.check_writable()?;
        for chunk in data.chunks(self.inner.chunk_size) {
            self.check_writable()?;
            self.send(chunk, false).await?;
        }
        Ok(data.len())
    }

    /// Send end-of-input. Later calls are no-ops.
    pub async fn close(&self) -> Result<()> {
        let _guard = self.inner.send_lock.lock().await;
        if self.inner.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        if self.inner.shell.is_closed() {
            return Err(WinRmError::ShellClosed(self.inner.shell.id().to_string()));
        }
        if self.inner.cancel.is_cancelled() || self.inner.finished.is_cancelled() {
            return Ok(());
        }
        debug!(command_id = %self.inner.command_id, "Sending end of input");
        self.send(&[], true).await
    }

    /// Whether end-of-input was sent.
    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::Acquire)
    }

    /// Forward everything `reader` yields, then send end-of-input.
    ///
    /// Stops early, without error, when the command is cancelled or
    /// finishes first.
    pub async fn pump_from<R>(&self, mut reader: R) -> Result<u64>
    where
        R: AsyncRead + Unpin,
    {
        let mut buf = vec![0u8; self.inner.chunk_size];
        let mut total = 0u64;
        loop {
            let n = tokio::select! {
                biased;
                _ = self.inner.cancel.cancelled() => return Ok(total),
                _ = self.inner.finished.cancelled() => return Ok(total),
                read = reader.read(&mut buf) => read?,
            };
            if n == 0 {
                if self.is_settled() {
                    return Ok(total);
                }
                self.close().await?;
                return Ok(total);
            }

            if let Err(e) = self.write(&buf[..n]).await {
                if self.is_settled() {
                    return Ok(total);
                }
                return Err(e);
            }
            total += n as u64;
        }
    }

    fn is_settled(&self) -> bool {
        self.inner.cancel.is_cancelled() || self.inner.finished.is_cancelled()
    }

    fn check_writable(&self) -> Result<()> {
        if self.is_closed() {
            return Err(WinRmError::Io("stdin is closed".to_string()));
        }
        if self.inner.shell.is_closed() {
            return Err(WinRmError::ShellClosed(self.inner.shell.id().to_string()));
        }
        if self.inner.cancel.is_cancelled() {
            return Err(WinRmError::Cancelled);
        }
        if self.inner.finished.is_cancelled() {
            return Err(WinRmError::Io("command has finished".to_string()));
        }
        Ok(())
    }

    async fn send(&self, chunk: &[u8], end: bool) -> Result<()> {
        let shell = &self.inner.shell;
        let client = shell.client();
        let envelope = soap::send_input(
            client.url(),
            client.parameters(),
            shell.id(),
            &self.inner.command_id,
            chunk,
            end,
        );
        trace!(command_id = %self.inner.command_id, len = chunk.len(), end, "stdin chunk");
        client.exchange(&envelope).await.map(|_| ())
    }
}

/// Readable stdout or stderr of a remote command.
pub struct OutputReader {
    stream: &'static str,
    rx: mpsc::Receiver<Vec<u8>>,
}

impl OutputReader {
    fn new(stream: &'static str, rx: mpsc::Receiver<Vec<u8>>) -> Self {
        Self { stream, rx }
    }

    /// Next decoded fragment; `None` once the receive loop has stopped.
    pub async fn next_chunk(&mut self) -> Option<Vec<u8>> {
        self.rx.recv().await
    }

    /// Copy every fragment to `sink` as it arrives.
    ///
    /// After a sink error the stream is still drained to its end, then the
    /// error is returned.
    pub async fn copy_to<W>(&mut self, sink: &mut W) -> Result<u64>
    where
        W: AsyncWrite + Unpin + ?Sized,
    {
        let mut written = 0u64;
        let mut failure: Option<std::io::Error> = None;

        while let Some(chunk) = self.rx.recv().await {
            if failure.is_some() {
                continue;
            }
            let result = match sink.write_all(&chunk).await {
                Ok(()) => sink.flush().await,
                Err(e) => Err(e),
            };
            match result {
                Ok(()) => written += chunk.len() as u64,
                Err(e) => {
                    warn!(stream = self.stream, error = %e, "Output sink failed, draining");
                    failure = Some(e);
                }
            }
        }

        match failure {
            Some(e) => Err(e.into()),
            None => Ok(written),
        }
    }

    /// Collect the whole stream.
    pub async fn read_to_end(&mut self) -> Vec<u8> {
        let mut out = Vec::new();
        while let Some(chunk) = self.rx.recv().await {
            out.extend_from_slice(&chunk);
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Parameters;
    use crate::soap::Action;
    use crate::testing::{BrokenSink, FakeHost, OPERATION_TIMEOUT_FAULT, Reply};

    async fn start(host: &FakeHost, params: Parameters) -> (Shell, Command) {
        let shell = host.client_with(params).create_shell().await.unwrap();
        let command = shell.execute("cmd").await.unwrap();
        (shell, command)
    }

    mod chunking {
        use super::*;

        #[test]
        fn test_default_envelope_caps_at_32k() {
            assert_eq!(stdin_chunk_size(153_600), MAX_STDIN_CHUNK);
        }

        #[test]
        fn test_small_envelope() {
            // (8192 - 4096) * 3 / 4
            assert_eq!(stdin_chunk_size(8192), 3072);
        }

        #[test]
        fn test_tiny_envelope_still_sends() {
            assert_eq!(stdin_chunk_size(100), 1);
        }
    }

    mod error_slot {
        use super::*;

        #[test]
        fn test_first_error_wins() {
            let slot = ErrorSlot::default();
            assert!(slot.get().is_none());
            assert!(slot.latch(WinRmError::Io("first".into())));
            assert!(!slot.latch(WinRmError::Cancelled));
            assert!(matches!(slot.get(), Some(WinRmError::Io(ref m)) if m == "first"));
        }
    }

    mod output {
        use super::*;

        #[tokio::test]
        async fn test_streams_in_wire_order() {
            let host = FakeHost::new()
                .push_stdout(b"one ")
                .push_stderr(b"warn")
                .push_stdout(b"two")
                .push_done(0);
            let (shell, mut command) = start(&host, Parameters::default()).await;

            let mut stdout = Vec::new();
            let mut stderr = Vec::new();
            command
                .pump(&mut stdout, &mut stderr, None::<&[u8]>)
                .await
                .unwrap();

            assert_eq!(stdout, b"one two");
            assert_eq!(stderr, b"warn");
            assert_eq!(command.status(), CommandStatus::Done);
            assert_eq!(command.exit_code(), 0);
            shell.close().await.unwrap();
        }

        #[tokio::test]
        async fn test_take_stdout_and_read_chunks() {
            let host = FakeHost::new().push_stdout(b"a").push_stdout(b"b").push_done(7);
            let (shell, mut command) = start(&host, Parameters::default()).await;

            let mut stdout = command.take_stdout().unwrap();
            assert!(command.take_stdout().is_none());
            assert_eq!(stdout.next_chunk().await, Some(b"a".to_vec()));
            assert_eq!(stdout.next_chunk().await, Some(b"b".to_vec()));
            assert_eq!(stdout.next_chunk().await, None);

            command.wait().await.unwrap();
            assert_eq!(command.exit_code(), 7);
            assert_eq!(command.result().unwrap(), 7);
            shell.close().await.unwrap();
        }

        #[tokio::test]
        async fn test_wait_without_readers_discards_output() {
            let mut host = FakeHost::new();
            for _ in 0..(OUTPUT_CHANNEL_CAPACITY * 2) {
                host = host.push_stdout(b"x");
            }
            let host = host.push_done(0);
            let (shell, mut command) = start(&host, Parameters::default()).await;

            command.wait().await.unwrap();
            assert_eq!(command.exit_code(), 0);
            shell.close().await.unwrap();
        }

        #[tokio::test]
        async fn test_sink_failure_is_latched_and_stream_drained() {
            let host = FakeHost::new()
                .push_stdout(b"lost")
                .push_stdout(b"also lost")
                .push_stderr(b"kept")
                .push_done(0);
            let (shell, mut command) = start(&host, Parameters::default()).await;

            let mut stderr = Vec::new();
            let result = command
                .pump(&mut BrokenSink, &mut stderr, None::<&[u8]>)
                .await;

            assert!(matches!(result, Err(WinRmError::Io(_))));
            assert_eq!(stderr, b"kept");
            assert_eq!(command.status(), CommandStatus::Done);
            assert_eq!(command.exit_code(), 0);
            assert!(matches!(command.result(), Err(WinRmError::Io(_))));
            shell.close().await.unwrap();
        }

        #[tokio::test]
        async fn test_exit_code_before_done_is_sentinel() {
            let host = FakeHost::new().with_receive_delay(Duration::from_millis(50));
            let (shell, command) = start(&host, Parameters::default()).await;

            assert_eq!(command.exit_code(), FAILURE_EXIT_CODE);
            assert_eq!(command.status(), CommandStatus::Running);
            drop(command);
            shell.close().await.unwrap();
        }
    }

    mod input {
        use super::*;

        #[tokio::test]
        async fn test_no_stdin_does_not_block() {
            let host = FakeHost::new().push_done(0);
            let (shell, mut command) = start(&host, Parameters::default()).await;

            let (mut out, mut err) = (Vec::new(), Vec::new());
            command.pump(&mut out, &mut err, None::<&[u8]>).await.unwrap();

            assert_eq!(host.count(Action::Send), 0);
            shell.close().await.unwrap();
        }

        #[tokio::test]
        async fn test_stdin_is_chunked_and_closed() {
            let host = FakeHost::new().echo_stdin();
            // 4096 + 8 leaves room for 6-byte chunks
            let params = Parameters::default().with_envelope_size(4096 + 8);
            let (shell, mut command) = start(&host, params).await;

            let (mut out, mut err) = (Vec::new(), Vec::new());
            command
                .pump(&mut out, &mut err, Some(&b"hello world\r\n"[..]))
                .await
                .unwrap();

            assert_eq!(host.stdin(), b"hello world\r\n");
            assert!(host.stdin_closed());
            // 13 bytes in 6-byte chunks plus the end marker
            assert_eq!(host.stdin_chunks(), 4);
            assert_eq!(out, b"hello world\r\n");
            shell.close().await.unwrap();
        }

        #[tokio::test]
        async fn test_write_after_close_fails() {
            let host = FakeHost::new().with_receive_delay(Duration::from_millis(20));
            let (shell, command) = start(&host, Parameters::default()).await;
            let stdin = command.stdin();

            stdin.write(b"dir\r\n").await.unwrap();
            stdin.close().await.unwrap();
            stdin.close().await.unwrap();
            assert!(stdin.is_closed());

            let result = stdin.write(b"more").await;
            assert!(matches!(result, Err(WinRmError::Io(_))));
            assert!(host.stdin_closed());
            drop(command);
            shell.close().await.unwrap();
        }

        #[tokio::test]
        async fn test_write_after_shell_close_fails() {
            let host = FakeHost::new().with_receive_delay(Duration::from_millis(20));
            let (shell, command) = start(&host, Parameters::default()).await;
            let stdin = command.stdin();
            shell.close().await.unwrap();

            let result = stdin.write(b"dir\r\n").await;
            assert!(matches!(result, Err(WinRmError::ShellClosed(_))));
            assert_eq!(host.count(Action::Send), 0);
        }

        #[tokio::test]
        async fn test_cancel_stops_pending_stdin() {
            let host = FakeHost::new().with_receive_delay(Duration::from_millis(20));
            let shell = host.client().create_shell().await.unwrap();
            let token = CancellationToken::new();
            let mut command = shell.execute_with_cancel(&token, "more").await.unwrap();

            let (mut writer, reader) = tokio::io::duplex(1024);
            writer.write_all(b"first\r\n").await.unwrap();
            let feeder = {
                let token = token.clone();
                tokio::spawn(async move {
                    tokio::time::sleep(Duration::from_millis(60)).await;
                    token.cancel();
                    writer.write_all(b"late\r\n").await.unwrap();
                    // Hold the writer open so the reader never reaches EOF
                    writer
                })
            };

            let (mut out, mut err) = (Vec::new(), Vec::new());
            let result = command.pump(&mut out, &mut err, Some(reader)).await;
            let _writer = feeder.await.unwrap();

            assert!(matches!(result, Err(WinRmError::Cancelled)));
            assert_eq!(host.stdin(), b"first\r\n");
            assert_eq!(host.count(Action::Send), 1);
            assert!(!host.stdin_closed());
            shell.close().await.unwrap();
        }

        #[tokio::test]
        async fn test_send_failure_is_latched() {
            let host = FakeHost::new()
                .with_receive_delay(Duration::from_millis(20))
                .fail_action(Action::Send, WinRmError::Transport("connection reset".into()));
            let (shell, mut command) = start(&host, Parameters::default()).await;

            let (mut out, mut err) = (Vec::new(), Vec::new());
            let token = command.cancel.clone();
            let canceller = tokio::spawn(async move {
                tokio::time::sleep(Duration::from_millis(100)).await;
                token.cancel();
            });
            let result = command.pump(&mut out, &mut err, Some(&b"data"[..])).await;
            canceller.await.unwrap();

            // The send failure came first; the cancellation is discarded
            assert!(matches!(result, Err(WinRmError::Transport(_))));
            shell.close().await.unwrap();
        }
    }

    mod cancellation {
        use super::*;

        #[tokio::test]
        async fn test_cancel_sends_one_terminate() {
            let host = FakeHost::new().with_receive_delay(Duration::from_millis(30));
            let shell = host.client().create_shell().await.unwrap();
            let token = CancellationToken::new();
            let mut command = shell.execute_with_cancel(&token, "ping -t localhost").await.unwrap();

            tokio::time::sleep(Duration::from_millis(10)).await;
            token.cancel();
            let result = command.wait().await;

            assert!(matches!(result, Err(WinRmError::Cancelled)));
            assert_eq!(command.status(), CommandStatus::Cancelled);
            assert_eq!(command.exit_code(), FAILURE_EXIT_CODE);
            assert_eq!(host.count(Action::Signal), 1);

            command.close().await.unwrap();
            assert_eq!(host.count(Action::Signal), 1);
            shell.close().await.unwrap();
        }

        #[tokio::test]
        async fn test_close_does_not_cancel_caller() {
            let host = FakeHost::new().with_receive_delay(Duration::from_millis(20));
            let shell = host.client().create_shell().await.unwrap();
            let token = CancellationToken::new();
            let mut command = shell.execute_with_cancel(&token, "pause").await.unwrap();

            command.close().await.unwrap();
            let _ = command.wait().await;

            assert!(!token.is_cancelled());
            assert_eq!(command.exit_code(), FAILURE_EXIT_CODE);
            assert_eq!(host.count(Action::Signal), 1);
            shell.close().await.unwrap();
        }

        #[tokio::test]
        async fn test_dropped_command_terminates() {
            let host = FakeHost::new().with_receive_delay(Duration::from_millis(20));
            let (shell, command) = start(&host, Parameters::default()).await;
            drop(command);

            assert!(host.wait_for(Action::Signal).await);
            shell.close().await.unwrap();
        }
    }

    mod receive_errors {
        use super::*;

        #[tokio::test]
        async fn test_operation_timeout_fault_keeps_polling() {
            let fault = WinRmError::Http {
                status: 500,
                body: OPERATION_TIMEOUT_FAULT.to_string(),
            };
            let host = FakeHost::new()
                .push_reply(Reply::Error(fault.clone()))
                .push_reply(Reply::Error(fault))
                .push_stdout(b"late")
                .push_done(0);
            let (shell, mut command) = start(&host, Parameters::default()).await;

            let (mut out, mut err) = (Vec::new(), Vec::new());
            command.pump(&mut out, &mut err, None::<&[u8]>).await.unwrap();

            assert_eq!(out, b"late");
            assert_eq!(host.count(Action::Receive), 4);
            shell.close().await.unwrap();
        }

        #[tokio::test]
        async fn test_fault_stops_loop() {
            let host = FakeHost::new().push_reply(Reply::Error(WinRmError::Http {
                status: 500,
                body: "<s:Fault>The request is invalid</s:Fault>".into(),
            }));
            let (shell, mut command) = start(&host, Parameters::default()).await;

            let result = command.wait().await;
            assert!(matches!(result, Err(WinRmError::Http { status: 500, .. })));
            assert_eq!(command.status(), CommandStatus::Failed);
            assert_eq!(command.exit_code(), FAILURE_EXIT_CODE);
            shell.close().await.unwrap();
        }

        #[tokio::test]
        async fn test_transport_error_stops_loop() {
            let host = FakeHost::new()
                .push_stdout(b"partial")
                .push_reply(Reply::Error(WinRmError::Transport("connection closed".into())));
            let (shell, mut command) = start(&host, Parameters::default()).await;

            let (mut out, mut err) = (Vec::new(), Vec::new());
            let result = command.pump(&mut out, &mut err, None::<&[u8]>).await;

            assert!(matches!(result, Err(WinRmError::Transport(_))));
            assert_eq!(out, b"partial");
            shell.close().await.unwrap();
        }

        #[tokio::test]
        async fn test_command_timeout_terminates() {
            let host = FakeHost::new().with_receive_delay(Duration::from_millis(10));
            let params = Parameters::default().with_command_timeout(Some(Duration::from_millis(100)));
            let (shell, mut command) = start(&host, params).await;

            let result = command.wait().await;

            assert!(matches!(result, Err(WinRmError::Timeout(d)) if d == Duration::from_millis(100)));
            assert_eq!(command.status(), CommandStatus::Failed);
            assert_eq!(host.count(Action::Signal), 1);
            shell.close().await.unwrap();
        }

        #[tokio::test(start_paused = true)]
        async fn test_receive_round_trip_is_bounded() {
            let host = FakeHost::new().with_receive_delay(Duration::from_secs(3600));
            let params = Parameters::default().with_operation_timeout(Duration::from_secs(5));
            let (shell, mut command) = start(&host, params).await;

            let result = command.wait().await;

            let expected = Duration::from_secs(5) + RECEIVE_GRACE;
            assert!(matches!(result, Err(WinRmError::Timeout(d)) if d == expected));
            assert_eq!(host.count(Action::Signal), 1);
            shell.close().await.unwrap();
        }
    }
}
