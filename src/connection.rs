use crate::error::Error;
use crate::inflate::COMPRESSION_AVAILABLE;
use crate::metrics::Metrics;
use crate::Result;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::SinkExt;
use std::sync::Arc;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{timeout, Duration};
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode as WsCloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{client_async_tls_with_config, Connector, MaybeTlsStream, WebSocketStream};
use tracing::{debug, trace, warn};
use url::Url;

/// Type alias for WebSocket stream
pub(crate) type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;
pub(crate) type WsSink = SplitSink<WsStream, Message>;
pub(crate) type WsSource = SplitStream<WsStream>;

const COMMAND_BUFFER: usize = 256;

/// Commands that can be sent to a connection's writer
#[derive(Debug)]
pub enum ConnectionCommand {
    /// Write a frame
    Send(Message),
    /// Send a close frame with this code and stop writing
    Close(u16),
}

/// Handle to one open socket and the tasks serving it.
///
/// Dropping the handle aborts every task, including the writer.
pub(crate) struct Connection {
    id: u64,
    commands: mpsc::Sender<ConnectionCommand>,
    writer: Option<JoinHandle<()>>,
    timeout: Option<JoinHandle<()>>,
    tasks: Vec<JoinHandle<()>>,
}

impl Connection {
    pub(crate) fn new(
        id: u64,
        commands: mpsc::Sender<ConnectionCommand>,
        writer: JoinHandle<()>,
    ) -> Self {
        Self {
            id,
            commands,
            writer: Some(writer),
            timeout: None,
            tasks: Vec::new(),
        }
    }

    /// Identifier distinguishing this socket from earlier ones on the same shard
    pub(crate) fn id(&self) -> u64 {
        self.id
    }

    pub(crate) fn commands(&self) -> mpsc::Sender<ConnectionCommand> {
        self.commands.clone()
    }

    /// Tie a task's lifetime to this connection
    pub(crate) fn attach(&mut self, task: JoinHandle<()>) {
        self.tasks.push(task);
    }

    /// Install the task that fires if the session never becomes ready
    pub(crate) fn arm_timeout(&mut self, task: JoinHandle<()>) {
        if let Some(previous) = self.timeout.replace(task) {
            previous.abort();
        }
    }

    pub(crate) fn disarm_timeout(&mut self) {
        if let Some(task) = self.timeout.take() {
            task.abort();
        }
    }

    /// Ask the writer to send a close frame, then stop every other task.
    ///
    /// The writer is left running so the close frame reaches the socket.
    pub(crate) fn close(mut self, code: u16) {
        if self.commands.try_send(ConnectionCommand::Close(code)).is_ok() {
            self.writer.take();
        }
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        for task in self.tasks.drain(..) {
            task.abort();
        }
        self.disarm_timeout();
        if let Some(writer) = self.writer.take() {
            writer.abort();
        }
    }
}

pub(crate) fn command_channel() -> (
    mpsc::Sender<ConnectionCommand>,
    mpsc::Receiver<ConnectionCommand>,
) {
    mpsc::channel(COMMAND_BUFFER)
}

/// Build the gateway URL with protocol query parameters.
pub(crate) fn gateway_url(base: &str, version: u8, compress: bool) -> Result<Url> {
    let mut url = Url::parse(base)
        .map_err(|e| Error::ConnectionFailed(format!("Invalid gateway URL {}: {}", base, e)))?;

    // Drop any protocol parameters the base already carries
    let extra: Vec<(String, String)> = url
        .query_pairs()
        .filter(|(key, _)| !matches!(key.as_ref(), "v" | "encoding" | "compress"))
        .map(|(key, value)| (key.into_owned(), value.into_owned()))
        .collect();

    {
        let mut query = url.query_pairs_mut();
        query.clear();
        query.append_pair("v", &version.to_string());
        query.append_pair("encoding", "json");
        if compress && COMPRESSION_AVAILABLE {
            query.append_pair("compress", "zlib-stream");
        }
        for (key, value) in &extra {
            query.append_pair(key, value);
        }
    }

    Ok(url)
}

/// Open a WebSocket within `connect_timeout`.
pub(crate) async fn open(shard_id: u32, url: &Url, connect_timeout: Duration) -> Result<WsStream> {
    debug!("[SHARD-{}] Connecting to {}", shard_id, url);

    match timeout(connect_timeout, connect(url)).await {
        Ok(result) => result,
        Err(_) => Err(Error::ConnectTimeout {
            shard_id,
            timeout: connect_timeout,
        }),
    }
}

async fn connect(url: &Url) -> Result<WsStream> {
    let host = url
        .host_str()
        .ok_or_else(|| Error::ConnectionFailed("No host in URL".to_string()))?;

    let is_tls = url.scheme() == "wss";
    let port = url
        .port_or_known_default()
        .unwrap_or(if is_tls { 443 } else { 80 });

    let request = url
        .as_str()
        .into_client_request()
        .map_err(|e| Error::ConnectionFailed(format!("Invalid WebSocket request: {}", e)))?;

    let tcp_stream = TcpStream::connect((host, port))
        .await
        .map_err(|e| Error::ConnectionFailed(format!("TCP connect to {}:{} failed: {}", host, port, e)))?;

    // Set TCP options for low latency
    set_tcp_options(&tcp_stream);

    let connector = if is_tls {
        let tls = native_tls::TlsConnector::new()
            .map_err(|e| Error::ConnectionFailed(format!("TLS error: {}", e)))?;
        Some(Connector::NativeTls(tls))
    } else {
        None
    };

    let (ws_stream, _response) =
        client_async_tls_with_config(request, tcp_stream, None, connector).await?;

    Ok(ws_stream)
}

/// Set TCP options for low latency
fn set_tcp_options(stream: &TcpStream) {
    let sock2 = socket2::SockRef::from(stream);

    // Disable Nagle's algorithm
    let _ = sock2.set_nodelay(true);

    // Detect dead peers below the heartbeat interval
    let keepalive = socket2::TcpKeepalive::new()
        .with_time(Duration::from_secs(30))
        .with_interval(Duration::from_secs(10));
    let _ = sock2.set_tcp_keepalive(&keepalive);
}

/// Spawn the task that owns the socket's write half.
pub(crate) fn spawn_writer(
    shard_id: u32,
    mut sink: WsSink,
    mut commands: mpsc::Receiver<ConnectionCommand>,
    metrics: Arc<Metrics>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(command) = commands.recv().await {
            match command {
                ConnectionCommand::Send(message) => {
                    trace!("[SHARD-{}] Writing {} bytes", shard_id, message.len());
                    if let Err(e) = sink.send(message).await {
                        warn!("[SHARD-{}] Failed to send message: {}", shard_id, e);
                        return;
                    }
                    metrics.record_message_sent();
                }
                ConnectionCommand::Close(code) => {
                    debug!("[SHARD-{}] Closing connection with code {}", shard_id, code);
                    let frame = CloseFrame {
                        code: WsCloseCode::from(code),
                        reason: "".into(),
                    };
                    let _ = sink.send(Message::Close(Some(frame))).await;
                    let _ = sink.close().await;
                    return;
                }
            }
        }

        // Every sender is gone
        let _ = sink.close().await;
    })
}
