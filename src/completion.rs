//! Single-slot completion cell for the frame transfer in flight
//!
//! One cell per session. A transfer is `begin`-ed, completed exactly once,
//! and its outcome is read and cleared by the next poll.

use crate::error::{HeliosError, Result};

/// What the next poll finds in the cell
#[derive(Debug, PartialEq, Eq)]
pub enum TransferState {
    /// No transfer outstanding and no unread outcome
    Idle,
    /// A transfer was submitted and has not completed yet
    InFlight,
    /// A transfer completed; the outcome has now been consumed
    Completed(rusb::Result<usize>),
}

#[derive(Debug, Default)]
enum Slot {
    #[default]
    Empty,
    Pending,
    Done(rusb::Result<usize>),
}

/// Completion cell for one frame transfer at a time
#[derive(Debug, Default)]
pub struct TransferCell {
    slot: Slot,
}

impl TransferCell {
    pub fn new() -> Self {
        Self::default()
    }

    /// Mark a transfer as submitted
    ///
    /// Fails with `FrameInFlight` while a previous transfer is pending. An
    /// unread outcome of a finished transfer is discarded.
    pub fn begin(&mut self) -> Result<()> {
        if matches!(self.slot, Slot::Pending) {
            return Err(HeliosError::FrameInFlight);
        }
        self.slot = Slot::Pending;
        Ok(())
    }

    /// Record the outcome of the pending transfer
    ///
    /// Returns `false` if no transfer was pending; the outcome is dropped.
    pub fn complete(&mut self, outcome: rusb::Result<usize>) -> bool {
        if !matches!(self.slot, Slot::Pending) {
            return false;
        }
        self.slot = Slot::Done(outcome);
        true
    }

    /// Check if a transfer is pending
    pub fn is_in_flight(&self) -> bool {
        matches!(self.slot, Slot::Pending)
    }

    /// Read the cell, clearing a completed outcome
    pub fn take(&mut self) -> TransferState {
        match std::mem::take(&mut self.slot) {
            Slot::Empty => TransferState::Idle,
            Slot::Pending => {
                self.slot = Slot::Pending;
                TransferState::InFlight
            }
            Slot::Done(outcome) => TransferState::Completed(outcome),
        }
    }

    /// Take a completed outcome and turn a failure into an error
    ///
    /// Returns `Ok(true)` while a transfer is still pending.
    pub fn take_failure(&mut self) -> Result<bool> {
        match self.take() {
            TransferState::Idle | TransferState::Completed(Ok(_)) => Ok(false),
            TransferState::InFlight => Ok(true),
            TransferState::Completed(Err(e)) => Err(HeliosError::FrameTransfer(e)),
        }
    }
}
