//! Who and where a terminal session connects to.

use crate::error::SessionError;

/// Terminal geometry in character cells.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Geometry {
    pub cols: u16,
    pub rows: u16,
}

impl Default for Geometry {
    fn default() -> Self {
        Self { cols: 80, rows: 24 }
    }
}

/// Proxy endpoint pieces. Any of them may be missing; a missing piece is a
/// configuration error reported when the session opens.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Endpoint {
    /// Base WebSocket URL of the terminal proxy, e.g. `wss://proxy.example.dev/terminal`.
    pub proxy_url: Option<String>,
    pub sandbox_id: Option<String>,
    pub access_key: Option<String>,
}

/// Immutable description of the session a controller drives.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionIdentity {
    pub name: String,
    pub endpoint: Endpoint,
    pub geometry: Geometry,
}

impl SessionIdentity {
    /// Build the transport URL:
    /// `{proxy_url}?sandbox={id}&key={access_key}&cols={cols}&rows={rows}`.
    pub fn endpoint_url(&self) -> Result<String, SessionError> {
        let proxy = required(self.endpoint.proxy_url.as_deref(), "proxy url")?;
        let sandbox = required(self.endpoint.sandbox_id.as_deref(), "sandbox id")?;
        let key = required(self.endpoint.access_key.as_deref(), "access key")?;

        if !(proxy.starts_with("ws://") || proxy.starts_with("wss://")) {
            return Err(SessionError::Configuration(format!(
                "proxy url must use ws:// or wss://, got '{}'",
                proxy
            )));
        }

        let separator = if proxy.contains('?') { '&' } else { '?' };
        Ok(format!(
            "{}{}sandbox={}&key={}&cols={}&rows={}",
            proxy,
            separator,
            url_encode(sandbox),
            url_encode(key),
            self.geometry.cols,
            self.geometry.rows,
        ))
    }
}

fn required<'a>(value: Option<&'a str>, what: &str) -> Result<&'a str, SessionError> {
    match value.map(str::trim) {
        Some(v) if !v.is_empty() => Ok(v),
        _ => Err(SessionError::Configuration(format!("{} is not set", what))),
    }
}

/// Opaque bearer token for the current operator.
#[derive(Clone, PartialEq, Eq)]
pub struct Credential(String);

impl Credential {
    pub fn new(token: impl Into<String>) -> Self {
        Self(token.into())
    }

    pub fn token(&self) -> &str {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.trim().is_empty()
    }
}

impl std::fmt::Debug for Credential {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("Credential(<redacted>)")
    }
}

/// Percent-encode a query parameter value.
pub(crate) fn url_encode(value: &str) -> String {
    let mut encoded = String::with_capacity(value.len());
    for c in value.chars() {
        match c {
            'A'..='Z' | 'a'..='z' | '0'..='9' | '-' | '_' | '.' | '~' => encoded.push(c),
            _ => {
                let mut buf = [0u8; 4];
                for b in c.encode_utf8(&mut buf).as_bytes() {
                    encoded.push_str(&format!("%{:02X}", b));
                }
            }
        }
    }
    encoded
}
