//! Pairs "open terminal" requests with a registry entry and a credential.
//!
//! Requests can arrive before the registry has loaded or before the
//! operator's token is known. [`Matcher`] holds them pending and re-checks
//! every pending request whenever either source changes. [`Launcher`] is the
//! tokio task that feeds the matcher from the broker, a refresh interval and
//! an expiry sweep.
//!
//! The launcher stops at the [`Match`]. It never opens a session itself:
//! the host turns a match into a [`SessionIdentity`] with
//! [`Match::identity`], supplying the proxy URL and the current geometry,
//! and hands it to the factory of its `PresentationShell`. A host that only
//! asked for one sandbox ignores matches for other names.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{broadcast, mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;

use crate::broker::{LaunchBroker, OpenRequest};
use crate::identity::{Credential, Endpoint, Geometry, SessionIdentity};
use crate::registry::{CredentialStore, SandboxEntry, SandboxRegistry};

/// Longest pause between expiry checks.
const MAX_SWEEP_INTERVAL: Duration = Duration::from_secs(1);

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LauncherSettings {
    /// How long an unmatched request waits. `None` waits forever.
    pub pending_ttl: Option<Duration>,
    pub registry_refresh: Duration,
}

impl Default for LauncherSettings {
    fn default() -> Self {
        Self {
            pending_ttl: Some(Duration::from_secs(120)),
            registry_refresh: Duration::from_secs(5),
        }
    }
}

/// Everything needed to construct a session for a request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Match {
    pub entry: SandboxEntry,
    pub credential: Credential,
}

impl Match {
    pub fn name(&self) -> &str {
        &self.entry.name
    }

    pub fn identity(&self, proxy_url: Option<String>, geometry: Geometry) -> SessionIdentity {
        SessionIdentity {
            name: self.entry.name.clone(),
            endpoint: Endpoint {
                proxy_url,
                sandbox_id: Some(self.entry.sandbox_id.clone()),
                access_key: self.entry.access_key.clone(),
            },
            geometry,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct Pending {
    name: String,
    since: Instant,
}

/// Synchronous matching state. Time is passed in by the caller.
#[derive(Debug, Default)]
pub struct Matcher {
    entries: Vec<SandboxEntry>,
    credential: Option<Credential>,
    pending: Vec<Pending>,
}

impl Matcher {
    pub fn new() -> Self {
        Self::default()
    }

    /// Match `name` now, or hold it until the registry or credential
    /// catches up. A second request for a name that is already pending is
    /// folded into the first one.
    pub fn on_request(&mut self, name: &str, now: Instant) -> Option<Match> {
        if let Some(m) = self.try_match(name) {
            self.pending.retain(|p| p.name != name);
            return Some(m);
        }
        if !self.pending.iter().any(|p| p.name == name) {
            tracing::debug!(sandbox = %name, "open request pending");
            self.pending.push(Pending {
                name: name.to_string(),
                since: now,
            });
        }
        None
    }

    pub fn on_registry_update(&mut self, entries: Vec<SandboxEntry>) -> Vec<Match> {
        self.entries = entries;
        self.rematch()
    }

    pub fn on_credential(&mut self, credential: Option<Credential>) -> Vec<Match> {
        self.credential = credential.filter(|c| !c.is_empty());
        self.rematch()
    }

    /// Drop requests pending for at least `ttl` and return their names.
    pub fn expire(&mut self, now: Instant, ttl: Duration) -> Vec<String> {
        let mut expired = Vec::new();
        self.pending.retain(|p| {
            if now.saturating_duration_since(p.since) >= ttl {
                expired.push(p.name.clone());
                false
            } else {
                true
            }
        });
        expired
    }

    pub fn pending(&self) -> impl Iterator<Item = &str> {
        self.pending.iter().map(|p| p.name.as_str())
    }

    pub fn has_credential(&self) -> bool {
        self.credential.is_some()
    }

    fn try_match(&self, name: &str) -> Option<Match> {
        let credential = self.credential.clone()?;
        let entry = self.entries.iter().find(|e| e.name == name)?.clone();
        Some(Match { entry, credential })
    }

    fn rematch(&mut self) -> Vec<Match> {
        let mut matched = Vec::new();
        let mut still_pending = Vec::new();
        for p in std::mem::take(&mut self.pending) {
            match self.try_match(&p.name) {
                Some(m) => matched.push(m),
                None => still_pending.push(p),
            }
        }
        self.pending = still_pending;
        matched
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LaunchOutcome {
    Matched(Match),
    /// No registry entry and credential showed up within the pending TTL.
    Expired { name: String },
}

/// Background task that turns broker requests into [`LaunchOutcome`]s.
pub struct Launcher {
    shutdown_tx: watch::Sender<bool>,
    task: JoinHandle<()>,
}

impl Launcher {
    /// Subscribe to `broker` and start matching. The subscription is taken
    /// before this returns, so requests published afterwards are not lost.
    pub fn spawn(
        broker: &LaunchBroker,
        registry: Arc<dyn SandboxRegistry>,
        credentials: Arc<dyn CredentialStore>,
        settings: LauncherSettings,
    ) -> (Self, mpsc::UnboundedReceiver<LaunchOutcome>) {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let (outcomes_tx, outcomes_rx) = mpsc::unbounded_channel();
        let task = tokio::spawn(launcher_loop(
            broker.subscribe(),
            registry,
            credentials,
            settings,
            outcomes_tx,
            shutdown_rx,
        ));
        (Self { shutdown_tx, task }, outcomes_rx)
    }

    /// Signal the launcher task to shut down.
    pub fn shutdown(&self) {
        let _ = self.shutdown_tx.send(true);
    }

    /// Wait for the launcher task to complete. Consumes the handle.
    pub async fn join(self) {
        let _ = self.task.await;
    }
}

struct LoopState {
    matcher: Matcher,
    registry: Arc<dyn SandboxRegistry>,
    credentials: Arc<dyn CredentialStore>,
    outcomes: mpsc::UnboundedSender<LaunchOutcome>,
}

impl LoopState {
    fn emit(&self, matches: Vec<Match>) {
        for m in matches {
            tracing::info!(sandbox = %m.name(), "open request matched");
            let _ = self.outcomes.send(LaunchOutcome::Matched(m));
        }
    }

    /// Pull the credential and the registry listing, then re-match.
    async fn refresh(&mut self) {
        let credential = self.credentials.current_token().await;
        if credential.is_some() != self.matcher.has_credential() {
            let matches = self.matcher.on_credential(credential);
            self.emit(matches);
        }

        match self.registry.list().await {
            Ok(entries) => {
                let matches = self.matcher.on_registry_update(entries);
                self.emit(matches);
            }
            Err(e) => tracing::warn!(error = %e, "registry refresh failed"),
        }
    }

    async fn on_request(&mut self, request: OpenRequest) {
        if let Some(m) = self.matcher.on_request(&request.name, Instant::now()) {
            self.emit(vec![m]);
            return;
        }
        // Don't make the operator wait a full refresh period.
        self.refresh().await;
    }

    fn sweep(&mut self, ttl: Duration) {
        for name in self.matcher.expire(Instant::now(), ttl) {
            tracing::warn!(
                sandbox = %name,
                ttl_secs = ttl.as_secs(),
                "open request expired without a matching sandbox"
            );
            let _ = self.outcomes.send(LaunchOutcome::Expired { name });
        }
    }
}

async fn launcher_loop(
    mut requests: broadcast::Receiver<OpenRequest>,
    registry: Arc<dyn SandboxRegistry>,
    credentials: Arc<dyn CredentialStore>,
    settings: LauncherSettings,
    outcomes: mpsc::UnboundedSender<LaunchOutcome>,
    mut shutdown_rx: watch::Receiver<bool>,
) {
    let mut state = LoopState {
        matcher: Matcher::new(),
        registry,
        credentials,
        outcomes,
    };

    // First tick fires immediately and loads the registry.
    let mut refresh = tokio::time::interval(settings.registry_refresh);
    refresh.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    let sweep_every = settings
        .pending_ttl
        .map_or(MAX_SWEEP_INTERVAL, |ttl| ttl.min(MAX_SWEEP_INTERVAL))
        .max(Duration::from_millis(1));
    let mut sweep = tokio::time::interval(sweep_every);

    let mut requests_open = true;

    loop {
        if *shutdown_rx.borrow() {
            return;
        }

        tokio::select! {
            request = requests.recv(), if requests_open => match request {
                Ok(request) => state.on_request(request).await,
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    tracing::warn!(skipped = n, "launcher lagged behind open requests");
                }
                Err(broadcast::error::RecvError::Closed) => {
                    tracing::debug!("launch broker closed");
                    requests_open = false;
                }
            },
            _ = refresh.tick() => state.refresh().await,
            _ = sweep.tick(), if settings.pending_ttl.is_some() => {
                if let Some(ttl) = settings.pending_ttl {
                    state.sweep(ttl);
                }
            },
            _ = shutdown_rx.changed() => return,
        }
    }
}
