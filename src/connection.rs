//! Tokio driver for a [`SessionController`].
//!
//! [`SessionHandle::open`] spawns one task per session. The task owns the
//! WebSocket, the terminal surface and the timers, feeds every event into
//! the controller one at a time and carries out the returned effects in
//! order before looking at the next event. Nothing else writes to the
//! socket, so frames are never interleaved.

use std::collections::VecDeque;
use std::time::Duration;

use bytes::Bytes;
use futures::future::BoxFuture;
use futures::{FutureExt, SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_tungstenite::tungstenite::{self, Message};
use tokio_tungstenite::MaybeTlsStream;

use crate::controller::{ConnectionState, ControllerSettings, Effect, SessionController, TimerId};
use crate::error::SessionError;
use crate::identity::{Credential, SessionIdentity};
use crate::surface::{InputSubscription, SurfaceEvent, TerminalSurface};

type WsStream = tokio_tungstenite::WebSocketStream<MaybeTlsStream<tokio::net::TcpStream>>;
type Dial = BoxFuture<'static, Result<WsStream, tungstenite::Error>>;

/// Upper bound on waiting for the close frame to go out during teardown.
const CLOSE_TIMEOUT: Duration = Duration::from_secs(1);

/// Notifications for the presentation shell.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEvent {
    StatusChanged {
        state: ConnectionState,
        attempts: u32,
    },
    Error(SessionError),
}

enum Command {
    Input(Bytes),
    Resize { cols: u16, rows: u16 },
    Retry,
    Close,
}

/// Owner's handle to a running session task.
///
/// Dropping the handle without calling [`close`](Self::close) also tears the
/// session down, but without waiting for it.
pub struct SessionHandle {
    name: String,
    commands: mpsc::UnboundedSender<Command>,
    task: Option<JoinHandle<()>>,
}

impl SessionHandle {
    /// Spawn the session task and start connecting.
    pub fn open<S: TerminalSurface>(
        identity: SessionIdentity,
        credential: Credential,
        settings: ControllerSettings,
        surface: S,
        events: mpsc::UnboundedSender<SessionEvent>,
    ) -> Self {
        let name = identity.name.clone();
        let (commands, commands_rx) = mpsc::unbounded_channel();
        let core = SessionController::new(identity, credential, settings);
        let driver = Driver::new(core, surface, events);
        let task = tokio::spawn(driver.run(commands_rx));
        tracing::debug!(session = %name, "session task spawned");
        Self {
            name,
            commands,
            task: Some(task),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Forward keystrokes; dropped unless the session is connected.
    pub fn send_input(&self, data: impl Into<Bytes>) {
        let _ = self.commands.send(Command::Input(data.into()));
    }

    pub fn resize(&self, cols: u16, rows: u16) {
        let _ = self.commands.send(Command::Resize { cols, rows });
    }

    pub fn retry(&self) {
        let _ = self.commands.send(Command::Retry);
    }

    /// Tear the session down and wait until every resource is released.
    /// Safe to call more than once.
    pub async fn close(&mut self) {
        let _ = self.commands.send(Command::Close);
        if let Some(task) = self.task.take() {
            if let Err(e) = task.await {
                tracing::warn!(session = %self.name, error = %e, "session task failed");
            }
        }
    }

    pub fn is_closed(&self) -> bool {
        self.task.is_none()
    }
}

struct Driver<S> {
    core: SessionController,
    surface: S,
    input: InputSubscription,
    events: mpsc::UnboundedSender<SessionEvent>,
    transport: Option<WsStream>,
    dialing: Option<Dial>,
    timers: Vec<(TimerId, Instant)>,
}

impl<S: TerminalSurface> Driver<S> {
    fn new(core: SessionController, mut surface: S, events: mpsc::UnboundedSender<SessionEvent>) -> Self {
        let input = surface.subscribe();
        Self {
            core,
            surface,
            input,
            events,
            transport: None,
            dialing: None,
            timers: Vec::new(),
        }
    }

    async fn run(mut self, mut commands: mpsc::UnboundedReceiver<Command>) {
        let fx = self.core.open();
        self.apply(fx).await;

        while !self.core.is_closed() {
            let deadline = self.timers.iter().map(|(_, at)| *at).min();
            let fx = tokio::select! {
                cmd = commands.recv() => match cmd {
                    Some(Command::Input(data)) => self.core.send_input(&data),
                    Some(Command::Resize { cols, rows }) => self.core.resize(cols, rows),
                    Some(Command::Retry) => self.core.retry(),
                    Some(Command::Close) | None => self.core.close(),
                },
                event = self.input.recv() => match event {
                    Some(SurfaceEvent::Data(data)) => self.core.send_input(&data),
                    Some(SurfaceEvent::Resize { cols, rows }) => self.core.resize(cols, rows),
                    None => {
                        self.input.dispose();
                        Vec::new()
                    }
                },
                result = poll_dial(&mut self.dialing) => {
                    self.dialing = None;
                    match result {
                        Ok(ws) => {
                            self.transport = Some(ws);
                            self.core.on_transport_open()
                        }
                        Err(e) => self.core.on_transport_closed(&e.to_string()),
                    }
                },
                frame = next_frame(&mut self.transport) => self.on_frame(frame).await,
                _ = sleep_until(deadline) => match self.pop_due_timer() {
                    Some(id) => self.core.on_timer(id),
                    None => Vec::new(),
                },
            };
            self.apply(fx).await;
        }

        tracing::debug!(session = %self.core.identity().name, "session task exiting");
    }

    async fn on_frame(&mut self, frame: Option<Result<Message, tungstenite::Error>>) -> Vec<Effect> {
        match frame {
            Some(Ok(Message::Text(text))) => self.core.on_text(text.as_str()),
            Some(Ok(Message::Binary(data))) => self.core.on_binary(data),
            // tungstenite queues the Pong itself and flushes it on the next read.
            Some(Ok(Message::Ping(_)))
            | Some(Ok(Message::Pong(_)))
            | Some(Ok(Message::Frame(_))) => Vec::new(),
            Some(Ok(Message::Close(frame))) => {
                // The close reply is queued; keep reading until the peer
                // finishes the handshake so it goes out before the drop.
                if let Some(mut ws) = self.transport.take() {
                    let _ = tokio::time::timeout(CLOSE_TIMEOUT, async {
                        while ws.next().await.is_some() {}
                    })
                    .await;
                }
                let reason = match frame {
                    Some(f) if !f.reason.is_empty() => {
                        format!("closed by server: {}", f.reason.as_str())
                    }
                    Some(f) => format!("closed by server ({})", u16::from(f.code)),
                    None => "closed by server".to_string(),
                };
                self.core.on_transport_closed(&reason)
            }
            Some(Err(e)) => {
                self.transport = None;
                self.core.on_transport_closed(&e.to_string())
            }
            None => {
                self.transport = None;
                self.core.on_transport_closed("connection closed")
            }
        }
    }

    async fn apply(&mut self, effects: Vec<Effect>) {
        let mut queue: VecDeque<Effect> = effects.into();
        while let Some(effect) = queue.pop_front() {
            match effect {
                Effect::Connect { url } => {
                    tracing::debug!(session = %self.core.identity().name, "dialing proxy");
                    self.dialing = Some(
                        async move {
                            tokio_tungstenite::connect_async(url)
                                .await
                                .map(|(ws, _)| ws)
                        }
                        .boxed(),
                    );
                }
                Effect::Send(text) => {
                    if let Some(ws) = self.transport.as_mut() {
                        if let Err(e) = ws.send(Message::text(text)).await {
                            self.transport = None;
                            queue.extend(self.core.on_transport_closed(&e.to_string()));
                        }
                    }
                }
                Effect::CloseTransport => {
                    self.dialing = None;
                    if let Some(mut ws) = self.transport.take() {
                        let _ = tokio::time::timeout(CLOSE_TIMEOUT, ws.send(Message::Close(None))).await;
                    }
                }
                Effect::StartTimer { id, after, .. } => {
                    self.timers.push((id, Instant::now() + after));
                }
                Effect::CancelTimer(id) => {
                    self.timers.retain(|(t, _)| *t != id);
                }
                Effect::Write(data) => self.surface.write(&data),
                Effect::DisposeInput => self.input.dispose(),
                Effect::DisposeSurface => self.surface.dispose(),
                Effect::Status { state, attempts } => {
                    let _ = self.events.send(SessionEvent::StatusChanged { state, attempts });
                }
                Effect::Error(err) => {
                    let _ = self.events.send(SessionEvent::Error(err));
                }
            }
        }
    }

    /// Remove and return the earliest timer that has expired.
    fn pop_due_timer(&mut self) -> Option<TimerId> {
        let now = Instant::now();
        let (index, _) = self
            .timers
            .iter()
            .enumerate()
            .filter(|(_, (_, at))| *at <= now)
            .min_by_key(|(_, (_, at))| *at)?;
        Some(self.timers.swap_remove(index).0)
    }
}

async fn poll_dial(dial: &mut Option<Dial>) -> Result<WsStream, tungstenite::Error> {
    match dial.as_mut() {
        Some(fut) => fut.await,
        None => futures::future::pending().await,
    }
}

async fn next_frame(transport: &mut Option<WsStream>) -> Option<Result<Message, tungstenite::Error>> {
    match transport.as_mut() {
        Some(ws) => ws.next().await,
        None => futures::future::pending().await,
    }
}

async fn sleep_until(deadline: Option<Instant>) {
    match deadline {
        Some(at) => tokio::time::sleep_until(at).await,
        None => futures::future::pending().await,
    }
}
