use serde::{Deserialize, Serialize};
use std::fmt::{Display, Formatter, Result as FmtResult};

/// Lifecycle state of a single transfer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum TransferState {
    #[default]
    Idle,
    Running,
    Paused,
    Success,
    Error,
}

impl TransferState {
    pub fn is_terminal(self) -> bool {
        matches!(self, TransferState::Success | TransferState::Error)
    }
}

impl Display for TransferState {
    fn fmt(&self, f: &mut Formatter<'_>) -> FmtResult {
        match self {
            TransferState::Idle => write!(f, "idle"),
            TransferState::Running => write!(f, "running"),
            TransferState::Paused => write!(f, "paused"),
            TransferState::Success => write!(f, "success"),
            TransferState::Error => write!(f, "error"),
        }
    }
}

/// Observable status of one transfer.
///
/// All mutators return `true` when they changed the status, so they can be
/// used directly with `watch::Sender::send_if_modified`. Once a terminal state
/// is reached every mutator is a no-op.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct TransferStatus {
    pub state: TransferState,
    pub progress_pct: f64,
    pub transferred_bytes: u64,
    /// Total size in bytes, 0 when unknown.
    pub total_bytes: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result_ref: Option<String>,
}

impl TransferStatus {
    pub fn idle() -> Self {
        Self::default()
    }

    pub fn is_terminal(&self) -> bool {
        self.state.is_terminal()
    }

    /// Idle -> Running.
    pub fn start(&mut self, total_bytes: u64) -> bool {
        if self.state != TransferState::Idle {
            return false;
        }
        self.state = TransferState::Running;
        self.total_bytes = total_bytes;
        true
    }

    /// Record `delta` more bytes as transferred.
    ///
    /// Bytes and percentage never decrease; the byte count is clamped to the
    /// known total.
    pub fn advance(&mut self, delta: u64) -> bool {
        if !matches!(self.state, TransferState::Running | TransferState::Paused) || delta == 0 {
            return false;
        }
        let mut next = self.transferred_bytes.saturating_add(delta);
        if self.total_bytes > 0 {
            next = next.min(self.total_bytes);
        }
        self.transferred_bytes = next;
        if self.total_bytes > 0 {
            let pct = (next as f64 / self.total_bytes as f64) * 100.0;
            self.progress_pct = self.progress_pct.max(pct.min(100.0));
        }
        true
    }

    /// Running -> Paused.
    pub fn pause(&mut self) -> bool {
        if self.state != TransferState::Running {
            return false;
        }
        self.state = TransferState::Paused;
        true
    }

    /// Paused -> Running.
    pub fn resume(&mut self) -> bool {
        if self.state != TransferState::Paused {
            return false;
        }
        self.state = TransferState::Running;
        true
    }

    /// Terminal success, carrying the durable reference confirmed by the store.
    pub fn succeed(&mut self, result_ref: String) -> bool {
        if self.is_terminal() {
            return false;
        }
        self.state = TransferState::Success;
        if self.total_bytes > 0 {
            self.transferred_bytes = self.total_bytes;
        } else {
            self.total_bytes = self.transferred_bytes;
        }
        self.progress_pct = 100.0;
        self.result_ref = Some(result_ref);
        true
    }

    /// Terminal error. Cancellation ends here as well, with its own message.
    pub fn fail(&mut self, message: impl Into<String>) -> bool {
        if self.is_terminal() {
            return false;
        }
        self.state = TransferState::Error;
        self.error_message = Some(message.into());
        true
    }
}
