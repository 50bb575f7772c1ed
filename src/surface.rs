//! Terminal surfaces: where remote output is shown and local keystrokes
//! come from.
//!
//! A controller binds to a surface once through [`TerminalSurface::subscribe`]
//! and releases both the subscription and the surface exactly once when it
//! is torn down.

use std::io::Write;
use std::sync::Arc;

use bytes::Bytes;
use parking_lot::Mutex;
use tokio::sync::mpsc;

use crate::terminal::{RawModeGuard, TerminalError};

/// Event emitted by a surface.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SurfaceEvent {
    /// Keystrokes typed by the operator.
    Data(Bytes),
    /// The surface changed size.
    Resize { cols: u16, rows: u16 },
}

/// Disposable binding to a surface's event stream.
pub struct InputSubscription {
    rx: Option<mpsc::UnboundedReceiver<SurfaceEvent>>,
}

impl InputSubscription {
    pub fn new(rx: mpsc::UnboundedReceiver<SurfaceEvent>) -> Self {
        Self { rx: Some(rx) }
    }

    /// Next event. Pends forever once disposed, so it can sit in a `select!`.
    pub async fn recv(&mut self) -> Option<SurfaceEvent> {
        match self.rx.as_mut() {
            Some(rx) => rx.recv().await,
            None => futures::future::pending().await,
        }
    }

    /// Drop the binding. Idempotent.
    pub fn dispose(&mut self) {
        self.rx = None;
    }
}

pub trait TerminalSurface: Send + 'static {
    /// Render bytes received from the remote terminal.
    fn write(&mut self, data: &[u8]);

    /// Bind to the surface's keystroke and resize events.
    fn subscribe(&mut self) -> InputSubscription;

    /// Release the surface. No further writes are expected.
    fn dispose(&mut self);
}

// ── In-memory surface ──────────────────────────────────────────────

#[derive(Default)]
struct MemoryInner {
    output: Vec<u8>,
    tx: Option<mpsc::UnboundedSender<SurfaceEvent>>,
    dispose_count: usize,
}

/// Headless surface that records output and lets callers inject events.
///
/// Clones share state, so one clone can be handed to a controller while
/// another is kept to drive and inspect it.
#[derive(Clone, Default)]
pub struct MemorySurface {
    inner: Arc<Mutex<MemoryInner>>,
}

impl MemorySurface {
    pub fn new() -> Self {
        Self::default()
    }

    /// Simulate keystrokes. Returns false when nothing is subscribed.
    pub fn type_input(&self, data: impl Into<Bytes>) -> bool {
        self.emit(SurfaceEvent::Data(data.into()))
    }

    /// Simulate a size change. Returns false when nothing is subscribed.
    pub fn resize(&self, cols: u16, rows: u16) -> bool {
        self.emit(SurfaceEvent::Resize { cols, rows })
    }

    /// Everything written to the surface so far.
    pub fn output(&self) -> Vec<u8> {
        self.inner.lock().output.clone()
    }

    pub fn output_string(&self) -> String {
        String::from_utf8_lossy(&self.inner.lock().output).into_owned()
    }

    pub fn dispose_count(&self) -> usize {
        self.inner.lock().dispose_count
    }

    /// True while a live subscription exists.
    pub fn is_subscribed(&self) -> bool {
        self.inner
            .lock()
            .tx
            .as_ref()
            .is_some_and(|tx| !tx.is_closed())
    }

    fn emit(&self, event: SurfaceEvent) -> bool {
        let inner = self.inner.lock();
        match inner.tx.as_ref() {
            Some(tx) => tx.send(event).is_ok(),
            None => false,
        }
    }
}

impl TerminalSurface for MemorySurface {
    fn write(&mut self, data: &[u8]) {
        let mut inner = self.inner.lock();
        if inner.dispose_count == 0 {
            inner.output.extend_from_slice(data);
        }
    }

    fn subscribe(&mut self) -> InputSubscription {
        let (tx, rx) = mpsc::unbounded_channel();
        self.inner.lock().tx = Some(tx);
        InputSubscription::new(rx)
    }

    fn dispose(&mut self) {
        let mut inner = self.inner.lock();
        inner.tx = None;
        inner.dispose_count += 1;
    }
}

// ── Local terminal surface ─────────────────────────────────────────

/// Operator commands typed after the escape prefix instead of being sent to
/// the sandbox.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShellCommand {
    Retry,
    Recreate,
    Quit,
}

/// Ctrl-], the same escape telnet uses.
pub const ESCAPE_BYTE: u8 = 0x1d;

/// Splits stdin chunks into keystrokes for the sandbox and local
/// [`ShellCommand`]s. State carries across chunks so the prefix and its
/// command key may arrive in separate reads.
#[derive(Debug, Default)]
pub struct EscapeScanner {
    armed: bool,
}

impl EscapeScanner {
    pub fn scan(&mut self, chunk: &[u8]) -> (Vec<u8>, Vec<ShellCommand>) {
        let mut passthrough = Vec::with_capacity(chunk.len());
        let mut commands = Vec::new();
        for &byte in chunk {
            if !self.armed {
                if byte == ESCAPE_BYTE {
                    self.armed = true;
                } else {
                    passthrough.push(byte);
                }
                continue;
            }
            self.armed = false;
            match byte {
                b'r' => commands.push(ShellCommand::Retry),
                b'n' => commands.push(ShellCommand::Recreate),
                b'q' | b'.' => commands.push(ShellCommand::Quit),
                // Pressing the prefix twice sends it literally.
                ESCAPE_BYTE => passthrough.push(ESCAPE_BYTE),
                other => {
                    passthrough.push(ESCAPE_BYTE);
                    passthrough.push(other);
                }
            }
        }
        (passthrough, commands)
    }
}

/// Process-wide reader for stdin and SIGWINCH.
///
/// Stdin can only be read by one thread for the life of the process, so the
/// pump outlives individual surfaces: each [`StdioSurface`] attaches itself
/// as the current target and detaches on dispose. Escape commands go to the
/// receiver returned by [`StdinPump::start`].
#[derive(Clone)]
pub struct StdinPump {
    target: Arc<Mutex<Option<mpsc::UnboundedSender<SurfaceEvent>>>>,
}

impl StdinPump {
    /// Start the reader thread and the resize watcher. Must be called from
    /// within a tokio runtime.
    pub fn start() -> std::io::Result<(Self, mpsc::UnboundedReceiver<ShellCommand>)> {
        let pump = Self {
            target: Arc::new(Mutex::new(None)),
        };
        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();

        let reader = pump.clone();
        // A plain thread rather than spawn_blocking: a read blocked on stdin
        // must not hold up runtime shutdown.
        std::thread::Builder::new()
            .name("stdin-pump".into())
            .spawn(move || {
                use std::io::Read;
                let mut stdin = std::io::stdin();
                let mut scanner = EscapeScanner::default();
                let mut buf = [0u8; 4096];
                loop {
                    match stdin.read(&mut buf) {
                        Ok(0) => break,
                        Ok(n) => {
                            let (data, commands) = scanner.scan(&buf[..n]);
                            if !data.is_empty() {
                                reader.deliver(SurfaceEvent::Data(Bytes::from(data)));
                            }
                            for cmd in commands {
                                if cmd_tx.send(cmd).is_err() {
                                    return;
                                }
                            }
                        }
                        Err(e) => {
                            tracing::debug!(error = %e, "stdin read failed");
                            break;
                        }
                    }
                }
                let _ = cmd_tx.send(ShellCommand::Quit);
            })?;

        let watcher = pump.clone();
        tokio::spawn(async move {
            use tokio::signal::unix::{signal, SignalKind};
            let mut sigwinch = match signal(SignalKind::window_change()) {
                Ok(s) => s,
                Err(e) => {
                    tracing::debug!(error = %e, "cannot watch SIGWINCH");
                    return;
                }
            };
            while sigwinch.recv().await.is_some() {
                if let Ok(geometry) = crate::terminal::terminal_size() {
                    watcher.deliver(SurfaceEvent::Resize {
                        cols: geometry.cols,
                        rows: geometry.rows,
                    });
                }
            }
        });

        Ok((pump, cmd_rx))
    }

    fn attach(&self) -> InputSubscription {
        let (tx, rx) = mpsc::unbounded_channel();
        *self.target.lock() = Some(tx);
        InputSubscription::new(rx)
    }

    fn detach(&self) {
        *self.target.lock() = None;
    }

    fn deliver(&self, event: SurfaceEvent) {
        if let Some(tx) = self.target.lock().as_ref() {
            let _ = tx.send(event);
        }
    }
}

/// The local terminal, in raw mode for as long as the surface is alive.
pub struct StdioSurface {
    pump: StdinPump,
    raw: Option<RawModeGuard>,
}

impl StdioSurface {
    pub fn new(pump: StdinPump) -> Result<Self, TerminalError> {
        let raw = RawModeGuard::new()?;
        Ok(Self {
            pump,
            raw: Some(raw),
        })
    }
}

impl TerminalSurface for StdioSurface {
    fn write(&mut self, data: &[u8]) {
        if self.raw.is_none() {
            return;
        }
        let mut stdout = std::io::stdout().lock();
        if let Err(e) = stdout.write_all(data).and_then(|_| stdout.flush()) {
            tracing::debug!(error = %e, "stdout write failed");
        }
    }

    fn subscribe(&mut self) -> InputSubscription {
        self.pump.attach()
    }

    fn dispose(&mut self) {
        self.pump.detach();
        self.raw = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn scanner_passes_plain_bytes() {
        let mut scanner = EscapeScanner::default();
        let (data, cmds) = scanner.scan(b"ls -la\r");
        assert_eq!(data, b"ls -la\r");
        assert!(cmds.is_empty());
    }

    #[test]
    fn scanner_extracts_commands() {
        let mut scanner = EscapeScanner::default();
        let (data, cmds) = scanner.scan(&[b'a', ESCAPE_BYTE, b'r', b'b', ESCAPE_BYTE, b'q']);
        assert_eq!(data, b"ab");
        assert_eq!(cmds, vec![ShellCommand::Retry, ShellCommand::Quit]);
    }

    #[test]
    fn scanner_keeps_state_across_chunks() {
        let mut scanner = EscapeScanner::default();
        let (data, cmds) = scanner.scan(&[b'x', ESCAPE_BYTE]);
        assert_eq!(data, b"x");
        assert!(cmds.is_empty());
        let (data, cmds) = scanner.scan(b"n");
        assert!(data.is_empty());
        assert_eq!(cmds, vec![ShellCommand::Recreate]);
    }

    #[test]
    fn scanner_double_escape_is_literal() {
        let mut scanner = EscapeScanner::default();
        let (data, cmds) = scanner.scan(&[ESCAPE_BYTE, ESCAPE_BYTE]);
        assert_eq!(data, vec![ESCAPE_BYTE]);
        assert!(cmds.is_empty());
    }

    #[test]
    fn scanner_unknown_command_passes_through() {
        let mut scanner = EscapeScanner::default();
        let (data, cmds) = scanner.scan(&[ESCAPE_BYTE, b'z']);
        assert_eq!(data, vec![ESCAPE_BYTE, b'z']);
        assert!(cmds.is_empty());
    }

    #[tokio::test]
    async fn memory_surface_delivers_events() {
        let mut surface = MemorySurface::new();
        let handle = surface.clone();
        assert!(!handle.type_input("early"));

        let mut sub = surface.subscribe();
        assert!(handle.is_subscribed());
        assert!(handle.type_input("ls\n"));
        assert!(handle.resize(100, 40));

        assert_eq!(sub.recv().await, Some(SurfaceEvent::Data(Bytes::from("ls\n"))));
        assert_eq!(
            sub.recv().await,
            Some(SurfaceEvent::Resize { cols: 100, rows: 40 })
        );
    }

    #[test]
    fn memory_surface_records_output_until_disposed() {
        let mut surface = MemorySurface::new();
        let handle = surface.clone();
        surface.write(b"$ ");
        surface.dispose();
        surface.write(b"late");
        assert_eq!(handle.output(), b"$ ");
        assert_eq!(handle.dispose_count(), 1);
    }

    #[test]
    fn disposed_subscription_unsubscribes() {
        let mut surface = MemorySurface::new();
        let handle = surface.clone();
        let mut sub = surface.subscribe();
        assert!(handle.is_subscribed());
        sub.dispose();
        sub.dispose();
        assert!(!handle.is_subscribed());
        assert!(!handle.type_input("x"));
    }
}
