use tokio::sync::broadcast;

pub const BROADCAST_CAPACITY: usize = 64;

/// A request to open a terminal for the sandbox called `name`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OpenRequest {
    pub name: String,
}

/// Fan-out channel for open requests.
///
/// Constructed once by the host and passed by clone to whoever publishes
/// or consumes requests. Requests published while nobody subscribes are
/// dropped.
#[derive(Clone)]
pub struct LaunchBroker {
    tx: broadcast::Sender<OpenRequest>,
}

impl LaunchBroker {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(BROADCAST_CAPACITY);
        Self { tx }
    }

    /// Ask for a terminal on `name`. Returns how many subscribers saw it.
    pub fn request_open(&self, name: impl Into<String>) -> usize {
        let request = OpenRequest { name: name.into() };
        tracing::debug!(sandbox = %request.name, "open requested");
        // Ignore error - means no receivers
        self.tx.send(request).unwrap_or(0)
    }

    pub fn subscribe(&self) -> broadcast::Receiver<OpenRequest> {
        self.tx.subscribe()
    }
}

impl Default for LaunchBroker {
    fn default() -> Self {
        Self::new()
    }
}
