//! Operator-facing side of a session: status text, the blocking failure
//! overlay, and the retry / re-create controls.

use tokio::sync::mpsc;

use crate::connection::{SessionEvent, SessionHandle};
use crate::controller::ConnectionState;
use crate::error::SessionError;
use crate::escalation::{EscalationPolicy, FallbackActions, Severity};
use crate::terminal::TerminalError;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OverlayAction {
    /// Reset the attempt counter and connect again.
    Retry,
    /// Open the sandbox's browser terminal.
    OpenLink(String),
    /// Copy a command that reaches the sandbox another way.
    CopyCommand(String),
}

/// Blocking overlay shown after repeated or fatal failures.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Overlay {
    pub title: String,
    pub message: String,
    pub actions: Vec<OverlayAction>,
}

impl Overlay {
    /// Plain-text rendering, one item per line.
    pub fn render(&self) -> String {
        let mut out = format!("{}\n{}\n", self.title, self.message);
        for action in &self.actions {
            match action {
                OverlayAction::Retry => out.push_str("  [r] retry\n"),
                OverlayAction::OpenLink(url) => {
                    out.push_str(&format!("  open in browser: {}\n", url));
                }
                OverlayAction::CopyCommand(cmd) => {
                    out.push_str(&format!("  or run: {}\n", cmd));
                }
            }
        }
        out
    }
}

/// What the shell shows for one session, folded from its events.
#[derive(Debug, Clone)]
pub struct StatusView {
    name: String,
    policy: EscalationPolicy,
    fallback: FallbackActions,
    state: ConnectionState,
    attempts: u32,
    last_error: Option<SessionError>,
}

impl StatusView {
    pub fn new(name: impl Into<String>, policy: EscalationPolicy, fallback: FallbackActions) -> Self {
        Self {
            name: name.into(),
            policy,
            fallback,
            state: ConnectionState::Disconnected,
            attempts: 0,
            last_error: None,
        }
    }

    pub fn apply(&mut self, event: &SessionEvent) {
        match event {
            SessionEvent::StatusChanged { state, attempts } => {
                self.state = *state;
                self.attempts = *attempts;
                if *state == ConnectionState::Connected {
                    self.last_error = None;
                }
            }
            SessionEvent::Error(err) => self.last_error = Some(err.clone()),
        }
    }

    /// Forget everything seen from a previous controller.
    pub fn reset(&mut self) {
        self.state = ConnectionState::Disconnected;
        self.attempts = 0;
        self.last_error = None;
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    pub fn last_error(&self) -> Option<&SessionError> {
        self.last_error.as_ref()
    }

    /// False when the last failure cannot be fixed by reconnecting.
    pub fn can_retry(&self) -> bool {
        self.last_error
            .as_ref()
            .map_or(true, SessionError::is_retryable)
    }

    pub fn fallback(&self) -> &FallbackActions {
        &self.fallback
    }

    pub fn severity(&self) -> Severity {
        self.policy.severity(
            self.state,
            self.attempts,
            self.last_error.as_ref().map(SessionError::kind),
        )
    }

    pub fn overlay(&self) -> Option<Overlay> {
        if self.severity() != Severity::Blocking {
            return None;
        }

        let message = match &self.last_error {
            Some(err) => err.to_string(),
            None => "connection failed".to_string(),
        };
        let title = match &self.last_error {
            Some(SessionError::Configuration(_)) => {
                format!("Cannot connect to '{}'", self.name)
            }
            _ => format!(
                "Unable to connect to '{}' after {} attempt{}",
                self.name,
                self.attempts,
                if self.attempts == 1 { "" } else { "s" }
            ),
        };

        let mut actions = vec![OverlayAction::Retry];
        if let Some(url) = &self.fallback.browser_url {
            actions.push(OverlayAction::OpenLink(url.clone()));
        }
        actions.push(OverlayAction::CopyCommand(self.fallback.command.clone()));

        Some(Overlay {
            title,
            message,
            actions,
        })
    }

    /// One-line status for the non-blocking states.
    pub fn status_line(&self) -> String {
        match self.state {
            ConnectionState::Connected => format!("connected to {}", self.name),
            ConnectionState::Disconnected => format!("disconnected from {}", self.name),
            ConnectionState::Connecting => match &self.last_error {
                Some(err) if self.attempts > 0 => format!(
                    "{} (attempt {}), reconnecting to {}...",
                    err, self.attempts, self.name
                ),
                _ => format!("connecting to {}...", self.name),
            },
            ConnectionState::Error => match &self.last_error {
                Some(err) => format!("{}: {}", self.name, err),
                None => format!("{}: connection error", self.name),
            },
        }
    }
}

/// Builds a session wired to the given event sender.
pub type SessionFactory =
    Box<dyn FnMut(mpsc::UnboundedSender<SessionEvent>) -> Result<SessionHandle, TerminalError> + Send>;

/// Owns the current session and swaps it out on demand.
pub struct PresentationShell {
    factory: SessionFactory,
    session: Option<SessionHandle>,
    events: mpsc::UnboundedReceiver<SessionEvent>,
    view: StatusView,
}

impl PresentationShell {
    /// Construct the first session right away.
    pub fn start(view: StatusView, mut factory: SessionFactory) -> Result<Self, TerminalError> {
        let (tx, events) = mpsc::unbounded_channel();
        let session = factory(tx)?;
        Ok(Self {
            factory,
            session: Some(session),
            events,
            view,
        })
    }

    pub fn view(&self) -> &StatusView {
        &self.view
    }

    pub fn session(&self) -> Option<&SessionHandle> {
        self.session.as_ref()
    }

    /// Wait for the next event of the current session and fold it into the
    /// view. Returns None once the session is gone.
    pub async fn next_event(&mut self) -> Option<SessionEvent> {
        let event = self.events.recv().await?;
        self.view.apply(&event);
        Some(event)
    }

    pub fn retry(&self) {
        if let Some(session) = &self.session {
            session.retry();
        }
    }

    /// Replace the session with a fresh one. The old session is fully torn
    /// down before the new one is constructed, and its late events are
    /// discarded.
    pub async fn force_recreate(&mut self) -> Result<(), TerminalError> {
        if let Some(mut old) = self.session.take() {
            tracing::info!(session = %old.name(), "re-creating session");
            old.close().await;
        }
        let (tx, events) = mpsc::unbounded_channel();
        self.events = events;
        self.view.reset();
        self.session = Some((self.factory)(tx)?);
        Ok(())
    }

    pub async fn close(&mut self) {
        if let Some(mut session) = self.session.take() {
            session.close().await;
        }
    }
}
