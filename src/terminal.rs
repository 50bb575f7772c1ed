use crossterm::terminal::{disable_raw_mode, enable_raw_mode, size};
use thiserror::Error;

use crate::identity::Geometry;

#[derive(Error, Debug)]
pub enum TerminalError {
    #[error("failed to enable raw mode: {0}")]
    EnableRawMode(#[source] std::io::Error),
}

/// RAII guard for terminal raw mode.
///
/// Raw mode hands every keystroke (Ctrl+C included) to the remote sandbox
/// instead of the local line discipline. Dropping the guard, even on panic,
/// restores the previous mode.
pub struct RawModeGuard {
    _private: (),
}

impl RawModeGuard {
    pub fn new() -> Result<Self, TerminalError> {
        enable_raw_mode().map_err(TerminalError::EnableRawMode)?;
        Ok(Self { _private: () })
    }
}

impl Drop for RawModeGuard {
    fn drop(&mut self) {
        let _ = disable_raw_mode();
    }
}

/// Current size of the local terminal.
pub fn terminal_size() -> anyhow::Result<Geometry> {
    let (cols, rows) = size()?;
    Ok(Geometry { cols, rows })
}
