use serde::{Deserialize, Serialize};

/// Status of a remote command
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CommandStatus {
    /// Command is running on the remote host
    Running,
    /// Command reported its Done state (check exit_code)
    Done,
    /// Cancellation fired before the command finished
    Cancelled,
    /// Receive loop stopped on an error (check error)
    Failed,
}

impl CommandStatus {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, CommandStatus::Running)
    }
}

impl std::fmt::Display for CommandStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CommandStatus::Running => write!(f, "running"),
            CommandStatus::Done => write!(f, "done"),
            CommandStatus::Cancelled => write!(f, "cancelled"),
            CommandStatus::Failed => write!(f, "failed"),
        }
    }
}

/// Lifecycle state of a shell
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ShellState {
    /// ID known, no command executed yet
    Created,
    /// At least one command has been executed
    Open,
    /// Closed; no further commands may run
    Closed,
}

impl ShellState {
    pub(crate) fn from_u8(value: u8) -> Self {
        match value {
            0 => ShellState::Created,
            1 => ShellState::Open,
            _ => ShellState::Closed,
        }
    }

    pub(crate) fn as_u8(self) -> u8 {
        match self {
            ShellState::Created => 0,
            ShellState::Open => 1,
            ShellState::Closed => 2,
        }
    }
}

impl std::fmt::Display for ShellState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ShellState::Created => write!(f, "created"),
            ShellState::Open => write!(f, "open"),
            ShellState::Closed => write!(f, "closed"),
        }
    }
}

/// Buffered result of a command run
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunOutput {
    /// Standard output (lossy UTF-8)
    pub stdout: String,
    /// Standard error (lossy UTF-8)
    pub stderr: String,
    /// Remote exit code
    pub exit_code: i32,
}
