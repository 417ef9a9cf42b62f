//! Fakes shared by the unit tests: a scripted REST transport and a local
//! gateway that speaks just enough of the protocol to drive a session.

use crate::error::Error;
use crate::protocol::{GatewayPayload, OpCode};
use crate::transport::{HttpRequest, HttpResponse, Transport};
use crate::Result;
use futures_util::{SinkExt, StreamExt};
use http::{HeaderMap, HeaderName, HeaderValue, StatusCode};
use parking_lot::Mutex;
use serde_json::{json, Value};
use std::collections::VecDeque;
use std::io::Write;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tokio::time::{timeout, Duration};
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode as WsCloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::Message;

const WAIT: Duration = Duration::from_secs(10);

#[derive(Default)]
struct Script {
    responses: VecDeque<HttpResponse>,
    requests: Vec<HttpRequest>,
}

/// Transport that answers from a queue of canned responses
#[derive(Clone, Default)]
pub(crate) struct ScriptedTransport {
    script: Arc<Mutex<Script>>,
}

impl ScriptedTransport {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn push(&self, status: u16, headers: &[(&str, &str)], body: &str) {
        let mut map = HeaderMap::new();
        for (name, value) in headers {
            map.insert(
                HeaderName::from_bytes(name.as_bytes()).unwrap(),
                HeaderValue::from_str(value).unwrap(),
            );
        }
        self.script.lock().responses.push_back(HttpResponse {
            status: StatusCode::from_u16(status).unwrap(),
            headers: map,
            body: body.as_bytes().to_vec(),
        });
    }

    /// Every request executed so far, in order
    pub(crate) fn requests(&self) -> Vec<HttpRequest> {
        self.script.lock().requests.clone()
    }
}

impl Transport for ScriptedTransport {
    async fn execute(&self, request: HttpRequest) -> Result<HttpResponse> {
        let mut script = self.script.lock();
        script.requests.push(request);
        script
            .responses
            .pop_front()
            .ok_or_else(|| Error::ConnectionFailed("script exhausted".to_string()))
    }
}

/// Behaviour of a [`MockGateway`]
#[derive(Debug, Clone)]
pub(crate) struct MockOptions {
    /// Interval announced in Hello, in milliseconds
    pub heartbeat_interval: u64,
    pub ack_heartbeats: bool,
    /// Close the first connection with this code right after READY
    pub close_after_ready: Option<u16>,
    /// Send op 7 on the first connection right after READY
    pub reconnect_after_ready: bool,
    /// Send op 9 with this `d` on the first connection right after READY
    pub invalidate_after_ready: Option<bool>,
    /// Send op 1 on the first connection right after READY
    pub request_heartbeat_after_ready: bool,
    /// Never answer identify or resume
    pub withhold_ready: bool,
    /// Send every payload as a zlib-stream binary frame
    pub compress: bool,
}

impl Default for MockOptions {
    fn default() -> Self {
        Self {
            heartbeat_interval: 45_000,
            ack_heartbeats: true,
            close_after_ready: None,
            reconnect_after_ready: false,
            invalidate_after_ready: None,
            request_heartbeat_after_ready: false,
            withhold_ready: false,
            compress: false,
        }
    }
}

/// Local gateway on an ephemeral port.
///
/// Every payload a client sends is recorded with the index of the
/// connection it arrived on. Sessions are named `session-{index}`.
pub(crate) struct MockGateway {
    pub url: String,
    frames: mpsc::UnboundedReceiver<(usize, GatewayPayload)>,
    connections: Arc<AtomicUsize>,
    task: JoinHandle<()>,
}

impl MockGateway {
    pub(crate) async fn start(options: MockOptions) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let url = format!("ws://{}", listener.local_addr().unwrap());
        let (frames_tx, frames) = mpsc::unbounded_channel();
        let connections = Arc::new(AtomicUsize::new(0));

        let task = tokio::spawn({
            let url = url.clone();
            let connections = Arc::clone(&connections);
            async move {
                while let Ok((stream, _)) = listener.accept().await {
                    let index = connections.fetch_add(1, Ordering::SeqCst);
                    tokio::spawn(serve(
                        stream,
                        index,
                        url.clone(),
                        options.clone(),
                        frames_tx.clone(),
                    ));
                }
            }
        });

        Self {
            url,
            frames,
            connections,
            task,
        }
    }

    /// Sockets accepted so far
    pub(crate) fn connections(&self) -> usize {
        self.connections.load(Ordering::SeqCst)
    }

    /// Wait for the next payload with opcode `op`, skipping others
    pub(crate) async fn next_op(&mut self, op: OpCode) -> (usize, GatewayPayload) {
        timeout(WAIT, async {
            loop {
                let (index, payload) = self.frames.recv().await.expect("gateway stopped");
                if payload.op == op.as_u8() {
                    return (index, payload);
                }
            }
        })
        .await
        .unwrap_or_else(|_| panic!("no {op:?} received"))
    }
}

impl Drop for MockGateway {
    fn drop(&mut self) {
        self.task.abort();
    }
}

async fn serve(
    stream: TcpStream,
    index: usize,
    url: String,
    options: MockOptions,
    frames: mpsc::UnboundedSender<(usize, GatewayPayload)>,
) {
    let Ok(ws) = tokio_tungstenite::accept_async(stream).await else {
        return;
    };
    let (mut sink, mut source) = ws.split();
    let mut encoder = options
        .compress
        .then(|| flate2::write::ZlibEncoder::new(Vec::new(), flate2::Compression::default()));

    let mut sequence = 0u64;
    // Scripted follow-ups run once, after the first READY on connection 0
    let mut scripted = index == 0;
    let mut reply = |payload: Value| {
        let text = payload.to_string();
        match encoder.as_mut() {
            Some(encoder) => {
                encoder.write_all(text.as_bytes()).unwrap();
                encoder.flush().unwrap();
                Message::Binary(std::mem::take(encoder.get_mut()))
            }
            None => Message::Text(text),
        }
    };

    let hello = reply(json!({"op": 10, "d": {"heartbeat_interval": options.heartbeat_interval}}));
    if sink.send(hello).await.is_err() {
        return;
    }

    while let Some(Ok(message)) = source.next().await {
        let text = match message {
            Message::Text(text) => text,
            Message::Close(_) => break,
            _ => continue,
        };
        let Ok(payload) = serde_json::from_str::<GatewayPayload>(&text) else {
            continue;
        };
        let op = payload.op;
        let _ = frames.send((index, payload));

        let mut replies = Vec::new();
        let mut close = None;
        match OpCode::from_u8(op) {
            Some(OpCode::Identify | OpCode::Resume) if options.withhold_ready => {}
            Some(OpCode::Identify) => {
                sequence += 1;
                replies.push(reply(json!({
                    "op": 0,
                    "t": "READY",
                    "s": sequence,
                    "d": {"session_id": format!("session-{index}"), "resume_gateway_url": url},
                })));
                if scripted {
                    scripted = false;
                    close = options.close_after_ready;
                    if options.reconnect_after_ready {
                        replies.push(reply(json!({"op": 7, "d": null})));
                    }
                    if let Some(resumable) = options.invalidate_after_ready {
                        replies.push(reply(json!({"op": 9, "d": resumable})));
                    }
                    if options.request_heartbeat_after_ready {
                        replies.push(reply(json!({"op": 1, "d": null})));
                    }
                }
            }
            Some(OpCode::Resume) => {
                sequence += 1;
                replies.push(reply(json!({"op": 0, "t": "RESUMED", "s": sequence, "d": {}})));
            }
            Some(OpCode::Heartbeat) if options.ack_heartbeats => {
                replies.push(reply(json!({"op": 11})));
            }
            _ => {}
        }

        for message in replies {
            if sink.send(message).await.is_err() {
                return;
            }
        }
        if let Some(code) = close {
            let frame = CloseFrame {
                code: WsCloseCode::from(code),
                reason: "".into(),
            };
            let _ = sink.send(Message::Close(Some(frame))).await;
            break;
        }
    }
}

/// Wait for the first event matching `predicate`, skipping others
pub(crate) async fn next_event<E: Clone>(
    events: &mut broadcast::Receiver<E>,
    predicate: impl Fn(&E) -> bool,
) -> E {
    timeout(WAIT, async {
        loop {
            match events.recv().await {
                Ok(event) if predicate(&event) => return event,
                Ok(_) | Err(broadcast::error::RecvError::Lagged(_)) => {}
                Err(broadcast::error::RecvError::Closed) => panic!("event channel closed"),
            }
        }
    })
    .await
    .unwrap_or_else(|_| panic!("timed out waiting for event"))
}

/// Collect events up to and including the first matching `predicate`
pub(crate) async fn collect_until<E>(
    events: &mut mpsc::UnboundedReceiver<E>,
    predicate: impl Fn(&E) -> bool,
) -> Vec<E> {
    timeout(WAIT, async {
        let mut seen = Vec::new();
        while let Some(event) = events.recv().await {
            let done = predicate(&event);
            seen.push(event);
            if done {
                return seen;
            }
        }
        panic!("event listener closed");
    })
    .await
    .unwrap_or_else(|_| panic!("timed out waiting for event"))
}
