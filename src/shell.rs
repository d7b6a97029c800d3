//! Remote shell lifecycle.
//!
//! A shell moves `Created -> Open -> Closed`. Commands may run while the
//! shell is not closed; `close` deletes the server-side shell at most once
//! and later calls are local no-ops. A shell opened by
//! [`Client::create_shell`] and dropped without `close` schedules a
//! best-effort delete on the current runtime.

use std::sync::Arc;
use std::sync::atomic::{AtomicU8, Ordering};

use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::client::Client;
use crate::command::Command;
use crate::error::{Result, WinRmError};
use crate::soap;
use crate::types::ShellState;

/// Handle to one remote shell. Clones refer to the same shell.
#[derive(Clone)]
pub struct Shell {
    inner: Arc<ShellInner>,
}

struct ShellInner {
    client: Client,
    id: String,
    state: AtomicU8,
    /// Delete on drop when never closed
    owned: bool,
}

impl Shell {
    /// Attach to an existing shell ID.
    pub(crate) fn new(client: Client, id: String) -> Self {
        Self::build(client, id, false)
    }

    /// Wrap a shell this process just opened.
    pub(crate) fn opened(client: Client, id: String) -> Self {
        Self::build(client, id, true)
    }

    fn build(client: Client, id: String, owned: bool) -> Self {
        Self {
            inner: Arc::new(ShellInner {
                client,
                id,
                state: AtomicU8::new(ShellState::Created.as_u8()),
                owned,
            }),
        }
    }

    /// Server-issued shell ID.
    pub fn id(&self) -> &str {
        &self.inner.id
    }

    pub fn state(&self) -> ShellState {
        ShellState::from_u8(self.inner.state.load(Ordering::Acquire))
    }

    pub fn is_closed(&self) -> bool {
        self.state() == ShellState::Closed
    }

    pub fn client(&self) -> &Client {
        &self.inner.client
    }

    /// Start `command` in this shell.
    pub async fn execute(&self, command: &str) -> Result<Command> {
        self.execute_with_cancel(&CancellationToken::new(), command)
            .await
    }

    /// Start `command`, governed by `token`.
    ///
    /// Cancelling `token` terminates the remote command; the returned
    /// command watches a child of `token`, so closing the command never
    /// cancels the caller.
    pub async fn execute_with_cancel(
        &self,
        token: &CancellationToken,
        command: &str,
    ) -> Result<Command> {
        if self.is_closed() {
            return Err(WinRmError::ShellClosed(self.inner.id.clone()));
        }
        if token.is_cancelled() {
            return Err(WinRmError::Cancelled);
        }

        let client = &self.inner.client;
        let envelope = soap::execute_command(client.url(), client.parameters(), self.id(), command);
        let response = tokio::select! {
            biased;
            _ = token.cancelled() => return Err(WinRmError::Cancelled),
            response = client.exchange(&envelope) => response?,
        };
        let command_id = soap::parse_command_id(&response)?;

        let _ = self.inner.state.compare_exchange(
            ShellState::Created.as_u8(),
            ShellState::Open.as_u8(),
            Ordering::AcqRel,
            Ordering::Acquire,
        );

        info!(shell_id = %self.inner.id, command_id = %command_id, "Started remote command");
        Ok(Command::start(self.clone(), command_id, token.child_token()))
    }

    /// Delete the remote shell.
    ///
    /// The shell is `Closed` after the first call whatever the outcome of
    /// the remote delete; later calls return `Ok(())` without contacting
    /// the host.
    pub async fn close(&self) -> Result<()> {
        let previous = self
            .inner
            .state
            .swap(ShellState::Closed.as_u8(), Ordering::AcqRel);
        if ShellState::from_u8(previous) == ShellState::Closed {
            debug!(shell_id = %self.inner.id, "Shell already closed");
            return Ok(());
        }

        let client = &self.inner.client;
        let envelope = soap::delete_shell(client.url(), client.parameters(), self.id());
        client.exchange(&envelope).await?;
        info!(shell_id = %self.inner.id, "Closed WinRM shell");
        Ok(())
    }
}

impl std::fmt::Debug for Shell {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Shell")
            .field("id", &self.inner.id)
            .field("state", &self.state())
            .finish()
    }
}

impl Drop for ShellInner {
    fn drop(&mut self) {
        if !self.owned || ShellState::from_u8(*self.state.get_mut()) == ShellState::Closed {
            return;
        }

        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            warn!(shell_id = %self.id, "Shell dropped without close and no runtime to delete it");
            return;
        };

        let client = self.client.clone();
        let shell_id = std::mem::take(&mut self.id);
        warn!(shell_id = %shell_id, "Shell dropped without close, deleting in background");
        runtime.spawn(async move {
            let envelope = soap::delete_shell(client.url(), client.parameters(), &shell_id);
            if let Err(e) = client.exchange(&envelope).await {
                warn!(shell_id = %shell_id, error = %e, "Background shell delete failed");
            }
        });
    }
}
