//! Decides how loudly a failure is presented to the operator.

use serde::Serialize;

use crate::controller::ConnectionState;
use crate::error::ErrorKind;
use crate::identity::url_encode;

/// Number of failed attempts at which the shell switches to a blocking overlay.
pub const ESCALATION_THRESHOLD: u32 = 2;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    /// Status text next to the terminal; the operator can keep working.
    Inline,
    /// Overlay that blocks the terminal until the operator acts.
    Blocking,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EscalationPolicy {
    pub threshold: u32,
}

impl Default for EscalationPolicy {
    fn default() -> Self {
        Self {
            threshold: ESCALATION_THRESHOLD,
        }
    }
}

impl EscalationPolicy {
    pub fn new(threshold: u32) -> Self {
        Self { threshold }
    }

    pub fn severity(
        &self,
        state: ConnectionState,
        attempts: u32,
        error: Option<ErrorKind>,
    ) -> Severity {
        if state != ConnectionState::Error {
            return Severity::Inline;
        }
        if attempts >= self.threshold || error == Some(ErrorKind::Configuration) {
            Severity::Blocking
        } else {
            Severity::Inline
        }
    }
}

/// Out-of-band ways to reach the sandbox when the terminal cannot connect.
/// Purely informational; nothing here talks to the proxy.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FallbackActions {
    /// Shell command the operator can copy and run elsewhere.
    pub command: String,
    /// Link to the sandbox's browser terminal, when one is configured.
    pub browser_url: Option<String>,
}

impl FallbackActions {
    /// Expand `{name}` in the configured templates. The URL template gets a
    /// percent-encoded name, the command template the name verbatim.
    pub fn from_templates(name: &str, command: &str, browser_url: Option<&str>) -> Self {
        Self {
            command: command.replace("{name}", name),
            browser_url: browser_url.map(|t| t.replace("{name}", &url_encode(name))),
        }
    }
}
