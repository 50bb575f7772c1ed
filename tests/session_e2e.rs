//! End-to-end tests: a real session task against a local WebSocket proxy.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio::time::timeout;
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::Message;

use sbxterm::connection::{SessionEvent, SessionHandle};
use sbxterm::controller::{ConnectionState, ControllerSettings};
use sbxterm::error::SessionError;
use sbxterm::identity::{Credential, Endpoint, Geometry, SessionIdentity};
use sbxterm::surface::MemorySurface;

/// What the fake proxy saw from the client.
#[derive(Debug)]
enum Seen {
    Uri(String),
    Text(serde_json::Value),
    Close,
}

/// Fake terminal proxy. Completes the handshake when it receives
/// `auth` with `tok123`, then sends `$ ` and reports everything it receives.
async fn spawn_proxy(extra_frames: Vec<String>) -> (String, mpsc::UnboundedReceiver<Seen>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let (tx, rx) = mpsc::unbounded_channel();

    tokio::spawn(async move {
        while let Ok((stream, _)) = listener.accept().await {
            let tx = tx.clone();
            let extra = extra_frames.clone();
            tokio::spawn(async move {
                let uri_tx = tx.clone();
                let callback = move |req: &Request, resp: Response| -> Result<Response, ErrorResponse> {
                    let _ = uri_tx.send(Seen::Uri(req.uri().to_string()));
                    Ok(resp)
                };
                let Ok(mut ws) = tokio_tungstenite::accept_hdr_async(stream, callback).await else {
                    return;
                };

                while let Some(Ok(msg)) = ws.next().await {
                    match msg {
                        Message::Text(text) => {
                            let value: serde_json::Value =
                                serde_json::from_str(text.as_str()).unwrap();
                            let is_auth = value["type"] == "auth" && value["token"] == "tok123";
                            let _ = tx.send(Seen::Text(value));
                            if is_auth {
                                let mut frames = vec![
                                    r#"{"type":"auth_success"}"#.to_string(),
                                    r#"{"type":"connected"}"#.to_string(),
                                    r#"{"type":"output","data":"$ "}"#.to_string(),
                                ];
                                frames.extend(extra.iter().cloned());
                                for frame in frames {
                                    ws.send(Message::text(frame)).await.unwrap();
                                }
                            }
                        }
                        Message::Close(_) => {
                            let _ = tx.send(Seen::Close);
                            break;
                        }
                        _ => {}
                    }
                }
            });
        }
    });

    (format!("ws://{}/terminal", addr), rx)
}

fn identity(proxy_url: String) -> SessionIdentity {
    SessionIdentity {
        name: "foo".into(),
        endpoint: Endpoint {
            proxy_url: Some(proxy_url),
            sandbox_id: Some("sb-123".into()),
            access_key: Some("key 1".into()),
        },
        geometry: Geometry { cols: 80, rows: 24 },
    }
}

fn open(
    proxy_url: String,
    settings: ControllerSettings,
) -> (SessionHandle, MemorySurface, mpsc::UnboundedReceiver<SessionEvent>) {
    let surface = MemorySurface::new();
    let (events_tx, events) = mpsc::unbounded_channel();
    let handle = SessionHandle::open(
        identity(proxy_url),
        Credential::new("tok123"),
        settings,
        surface.clone(),
        events_tx,
    );
    (handle, surface, events)
}

async fn wait_for_state(
    events: &mut mpsc::UnboundedReceiver<SessionEvent>,
    wanted: ConnectionState,
) -> (Vec<SessionEvent>, u32) {
    let mut seen = Vec::new();
    let attempts = timeout(Duration::from_secs(5), async {
        loop {
            let event = events.recv().await.expect("session ended early");
            seen.push(event.clone());
            if let SessionEvent::StatusChanged { state, attempts } = event {
                if state == wanted {
                    return attempts;
                }
            }
        }
    })
    .await
    .unwrap_or_else(|_| panic!("no {:?} within 5s", wanted));
    (seen, attempts)
}

async fn next_text(seen: &mut mpsc::UnboundedReceiver<Seen>) -> serde_json::Value {
    timeout(Duration::from_secs(5), async {
        loop {
            match seen.recv().await.expect("proxy gone") {
                Seen::Text(v) => return v,
                _ => continue,
            }
        }
    })
    .await
    .expect("frame within 5s")
}

async fn wait_for_output(surface: &MemorySurface, expected: &str) {
    timeout(Duration::from_secs(5), async {
        while !surface.output_string().contains(expected) {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .unwrap_or_else(|_| panic!("output {:?} never appeared, got {:?}", expected, surface.output_string()));
}

#[tokio::test]
async fn connects_authenticates_and_streams() {
    let (url, mut seen) = spawn_proxy(vec![]).await;
    let (mut handle, surface, mut events) = open(url, ControllerSettings::default());

    let (history, attempts) = wait_for_state(&mut events, ConnectionState::Connected).await;
    assert_eq!(attempts, 0);
    assert_eq!(
        history.first(),
        Some(&SessionEvent::StatusChanged {
            state: ConnectionState::Connecting,
            attempts: 0
        })
    );

    match seen.recv().await.unwrap() {
        Seen::Uri(uri) => {
            assert_eq!(uri, "/terminal?sandbox=sb-123&key=key%201&cols=80&rows=24");
        }
        other => panic!("expected uri first, got {:?}", other),
    }
    let auth = next_text(&mut seen).await;
    assert_eq!(auth, serde_json::json!({"type": "auth", "token": "tok123"}));

    wait_for_output(&surface, "$ ").await;
    assert_eq!(surface.output_string(), "$ ");

    assert!(surface.type_input("ls\n"));
    let input = next_text(&mut seen).await;
    assert_eq!(input, serde_json::json!({"type": "input", "data": "ls\n"}));

    handle.close().await;
    assert!(handle.is_closed());
    assert_eq!(surface.dispose_count(), 1);
}

#[tokio::test]
async fn raw_frames_pass_through_without_state_change() {
    let (url, _seen) = spawn_proxy(vec!["not json at all".into(), r#"{"type":"mystery"}"#.into()]).await;
    let (mut handle, surface, mut events) = open(url, ControllerSettings::default());

    wait_for_state(&mut events, ConnectionState::Connected).await;
    wait_for_output(&surface, r#"{"type":"mystery"}"#).await;
    assert_eq!(
        surface.output_string(),
        r#"$ not json at all{"type":"mystery"}"#
    );

    // Nothing after Connected.
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(events.try_recv().is_err());

    handle.close().await;
}

#[tokio::test]
async fn rapid_resizes_coalesce_into_one_frame() {
    let (url, mut seen) = spawn_proxy(vec![]).await;
    let (mut handle, surface, mut events) = open(url, ControllerSettings::default());
    wait_for_state(&mut events, ConnectionState::Connected).await;
    let _auth = next_text(&mut seen).await;

    assert!(surface.resize(100, 30));
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(surface.resize(120, 40));

    let resize = next_text(&mut seen).await;
    assert_eq!(
        resize,
        serde_json::json!({"type": "resize", "cols": 120, "rows": 40})
    );

    // No second resize frame follows.
    let extra = timeout(Duration::from_millis(400), next_text(&mut seen)).await;
    assert!(extra.is_err(), "unexpected frame: {:?}", extra);

    handle.close().await;
}

#[tokio::test]
async fn close_sends_exactly_one_close_frame() {
    let (url, mut seen) = spawn_proxy(vec![]).await;
    let (mut handle, surface, mut events) = open(url, ControllerSettings::default());
    wait_for_state(&mut events, ConnectionState::Connected).await;

    // A pending resize must not fire after close.
    surface.resize(90, 30);
    handle.close().await;
    handle.close().await;

    let mut closes = 0;
    let mut resizes = 0;
    let _ = timeout(Duration::from_millis(500), async {
        while let Some(s) = seen.recv().await {
            match s {
                Seen::Close => closes += 1,
                Seen::Text(v) if v["type"] == "resize" => resizes += 1,
                _ => {}
            }
        }
    })
    .await;
    assert_eq!(closes, 1);
    assert_eq!(resizes, 0);
    assert_eq!(surface.dispose_count(), 1);
    assert!(!surface.is_subscribed());
}

#[tokio::test]
async fn dropping_handle_tears_session_down() {
    let (url, mut seen) = spawn_proxy(vec![]).await;
    let (handle, surface, mut events) = open(url, ControllerSettings::default());
    wait_for_state(&mut events, ConnectionState::Connected).await;

    drop(handle);

    timeout(Duration::from_secs(5), async {
        while surface.dispose_count() == 0 || surface.is_subscribed() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("surface disposed after drop");

    let mut closes = 0;
    let _ = timeout(Duration::from_millis(500), async {
        while let Some(s) = seen.recv().await {
            if let Seen::Close = s {
                closes += 1;
            }
        }
    })
    .await;
    assert_eq!(closes, 1);
    assert_eq!(surface.dispose_count(), 1);
    assert!(!surface.is_subscribed());
}

#[tokio::test]
async fn gives_up_after_two_failed_attempts() {
    // Accept TCP and hang up before the WebSocket handshake.
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let connections = Arc::new(AtomicUsize::new(0));
    let counter = connections.clone();
    tokio::spawn(async move {
        while let Ok((stream, _)) = listener.accept().await {
            counter.fetch_add(1, Ordering::SeqCst);
            drop(stream);
        }
    });

    let settings = ControllerSettings {
        base_delay: Duration::from_millis(20),
        ..ControllerSettings::default()
    };
    let (mut handle, _surface, mut events) = open(format!("ws://{}/terminal", addr), settings);

    let (history, attempts) = wait_for_state(&mut events, ConnectionState::Error).await;
    assert_eq!(attempts, 2);
    let transport_errors = history
        .iter()
        .filter(|e| matches!(e, SessionEvent::Error(SessionError::Transport(_))))
        .count();
    assert_eq!(transport_errors, 2);

    // No third automatic attempt.
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(connections.load(Ordering::SeqCst), 2);
    assert!(events.try_recv().is_err());

    // Manual retry starts a fresh cycle of two attempts.
    handle.retry();
    let (_, attempts) = wait_for_state(&mut events, ConnectionState::Connecting).await;
    assert_eq!(attempts, 0);
    wait_for_state(&mut events, ConnectionState::Error).await;
    assert_eq!(connections.load(Ordering::SeqCst), 4);

    handle.close().await;
}

#[tokio::test]
async fn server_error_frame_is_reported() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        let (stream, _) = listener.accept().await.unwrap();
        let mut ws = tokio_tungstenite::accept_async(stream).await.unwrap();
        let _auth = ws.next().await;
        ws.send(Message::text(r#"{"type":"error","message":"invalid token"}"#))
            .await
            .unwrap();
        // Keep the socket open.
        while ws.next().await.is_some() {}
    });

    let (mut handle, _surface, mut events) =
        open(format!("ws://{}/terminal", addr), ControllerSettings::default());

    let (history, attempts) = wait_for_state(&mut events, ConnectionState::Error).await;
    assert_eq!(attempts, 0);
    assert!(history.contains(&SessionEvent::Error(SessionError::Handshake(
        "invalid token".into()
    ))));

    handle.close().await;
}

#[tokio::test]
async fn missing_token_fails_without_dialing() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let connections = Arc::new(AtomicUsize::new(0));
    let counter = connections.clone();
    tokio::spawn(async move {
        while let Ok((_stream, _)) = listener.accept().await {
            counter.fetch_add(1, Ordering::SeqCst);
        }
    });

    let (events_tx, mut events) = mpsc::unbounded_channel();
    let mut handle = SessionHandle::open(
        identity(format!("ws://{}/terminal", addr)),
        Credential::new(""),
        ControllerSettings::default(),
        MemorySurface::new(),
        events_tx,
    );

    let (history, attempts) = wait_for_state(&mut events, ConnectionState::Error).await;
    assert_eq!(attempts, 0);
    assert!(matches!(
        history.first(),
        Some(SessionEvent::Error(SessionError::Configuration(_)))
    ));
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(connections.load(Ordering::SeqCst), 0);

    handle.close().await;
}

/// How the client answered the proxy's control frames.
#[derive(Debug, PartialEq)]
enum Reply {
    Pong(Vec<u8>),
    CloseReply,
    Dropped,
}

/// Proxy that completes the handshake, pings, then closes the connection
/// itself and reports whether the client answered the close.
async fn spawn_closing_proxy() -> (String, mpsc::UnboundedReceiver<Reply>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let (tx, rx) = mpsc::unbounded_channel();

    tokio::spawn(async move {
        let (stream, _) = listener.accept().await.unwrap();
        let mut ws = tokio_tungstenite::accept_async(stream).await.unwrap();
        let _auth = ws.next().await;
        for frame in [r#"{"type":"auth_success"}"#, r#"{"type":"connected"}"#] {
            ws.send(Message::text(frame)).await.unwrap();
        }
        ws.send(Message::Ping("hb".into())).await.unwrap();

        // Collect pongs for a while before hanging up.
        while let Ok(Some(Ok(msg))) = timeout(Duration::from_millis(300), ws.next()).await {
            if let Message::Pong(data) = msg {
                let _ = tx.send(Reply::Pong(data.to_vec()));
            }
        }

        ws.send(Message::Close(Some(CloseFrame {
            code: CloseCode::Normal,
            reason: "bye".into(),
        })))
        .await
        .unwrap();
        let reply = match timeout(Duration::from_secs(2), ws.next()).await {
            Ok(Some(Ok(Message::Close(_)))) => Reply::CloseReply,
            _ => Reply::Dropped,
        };
        let _ = tx.send(reply);
    });

    (format!("ws://{}/terminal", addr), rx)
}

#[tokio::test]
async fn ping_gets_one_pong_and_server_close_is_answered() {
    let (url, mut replies) = spawn_closing_proxy().await;
    let (mut handle, _surface, mut events) = open(url, ControllerSettings::default());

    wait_for_state(&mut events, ConnectionState::Connected).await;
    let (_, attempts) = wait_for_state(&mut events, ConnectionState::Disconnected).await;
    assert_eq!(attempts, 0);

    let mut seen = Vec::new();
    let _ = timeout(Duration::from_secs(5), async {
        while let Some(reply) = replies.recv().await {
            let done = matches!(reply, Reply::CloseReply | Reply::Dropped);
            seen.push(reply);
            if done {
                break;
            }
        }
    })
    .await;
    assert_eq!(seen, vec![Reply::Pong(b"hb".to_vec()), Reply::CloseReply]);

    handle.close().await;
}
