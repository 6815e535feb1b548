use std::{
    fmt,
    net::SocketAddr,
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
    time::Duration,
};

use axum::extract::ws::{CloseFrame, Message, WebSocket, close_code};
use futures_util::{
    SinkExt, StreamExt,
    stream::{SplitSink, SplitStream},
};
use thiserror::Error;
use tokio::{
    io::{AsyncBufReadExt, AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader},
    select,
    sync::{Mutex, watch},
    time::timeout,
};
use tracing::debug;

/// Upper bound on a single write so a stalled peer cannot hold up delivery.
pub const DEFAULT_WRITE_TIMEOUT: Duration = Duration::from_secs(10);

/// Longest line accepted from a stream transport, newline included.
pub const MAX_FRAME_LEN: usize = 64 * 1024;

static NEXT_CONNECTION_ID: AtomicU64 = AtomicU64::new(0);

/// Opaque identity of one physical connection.
///
/// Issued once when the transport is wrapped and never reused for the
/// lifetime of the process, so two sockets from the same peer address are
/// always distinct keys.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionId(u64);

impl ConnectionId {
    fn next() -> Self {
        Self(NEXT_CONNECTION_ID.fetch_add(1, Ordering::Relaxed))
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "conn-{}", self.0)
    }
}

#[derive(Debug, Error)]
pub enum ConnectionError {
    #[error("transport i/o failed: {0}")]
    Io(#[from] std::io::Error),
    #[error("websocket transport failed: {0}")]
    WebSocket(#[from] axum::Error),
    #[error("write timed out after {0:?}")]
    TimedOut(Duration),
    #[error("frame exceeds {0} bytes")]
    FrameTooLong(usize),
    #[error("connection closed")]
    Closed,
}

type BoxedReader = Box<dyn AsyncRead + Send + Unpin>;
type BoxedWriter = Box<dyn AsyncWrite + Send + Unpin>;

/// A freshly accepted transport, not yet registered.
///
/// Split with [`Connection::into_parts`] once the server has assigned the
/// client an id: the [`FrameReader`] goes to the reader loop and the
/// [`ConnectionHandle`] goes to the broadcast handler.
pub struct Connection {
    handle: ConnectionHandle,
    reader: FrameReader,
}

impl Connection {
    /// Wraps a byte stream carrying newline-delimited text, such as a TCP
    /// socket.
    pub fn from_stream<S>(stream: S, peer: SocketAddr, write_timeout: Duration) -> Self
    where
        S: AsyncRead + AsyncWrite + Send + Unpin + 'static,
    {
        let (reader, writer) = tokio::io::split(stream);
        let reader: BoxedReader = Box::new(reader);
        let writer: BoxedWriter = Box::new(writer);
        Self::assemble(
            FrameSource::Stream(BufReader::new(reader)),
            FrameSink::Stream(writer),
            peer,
            write_timeout,
        )
    }

    /// Wraps an upgraded WebSocket; each text message is one frame.
    pub fn from_websocket(socket: WebSocket, peer: SocketAddr, write_timeout: Duration) -> Self {
        let (sink, stream) = socket.split();
        Self::assemble(
            FrameSource::WebSocket(stream),
            FrameSink::WebSocket(sink),
            peer,
            write_timeout,
        )
    }

    fn assemble(
        source: FrameSource,
        sink: FrameSink,
        peer: SocketAddr,
        write_timeout: Duration,
    ) -> Self {
        let (closed_tx, closed_rx) = watch::channel(false);
        let handle = ConnectionHandle {
            shared: Arc::new(Shared {
                id: ConnectionId::next(),
                remote: peer.to_string(),
                sink: Mutex::new(sink),
                closed: closed_tx,
                write_timeout,
            }),
        };
        let reader = FrameReader {
            source,
            closed: closed_rx,
        };
        Self { handle, reader }
    }

    pub fn id(&self) -> ConnectionId {
        self.handle.id()
    }

    pub fn remote_addr(&self) -> &str {
        self.handle.remote_addr()
    }

    pub fn into_parts(self) -> (ConnectionHandle, FrameReader) {
        (self.handle, self.reader)
    }
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.id())
            .field("remote", &self.remote_addr())
            .finish_non_exhaustive()
    }
}

/// Read side of a connection. Owned by exactly one reader loop.
pub struct FrameReader {
    source: FrameSource,
    closed: watch::Receiver<bool>,
}

impl FrameReader {
    /// Waits for the next frame. `Ok(None)` means the peer ended the stream.
    ///
    /// Fails with [`ConnectionError::Closed`] as soon as the connection is
    /// closed through any [`ConnectionHandle`], even while suspended.
    pub async fn read(&mut self) -> Result<Option<String>, ConnectionError> {
        let FrameReader { source, closed } = self;
        if *closed.borrow() {
            return Err(ConnectionError::Closed);
        }

        select! {
            frame = source.next_frame() => frame,
            _ = closed.wait_for(|closed| *closed) => Err(ConnectionError::Closed),
        }
    }
}

enum FrameSource {
    Stream(BufReader<BoxedReader>),
    WebSocket(SplitStream<WebSocket>),
}

impl FrameSource {
    async fn next_frame(&mut self) -> Result<Option<String>, ConnectionError> {
        match self {
            FrameSource::Stream(reader) => {
                let mut line = Vec::new();
                let bytes = reader
                    .take(MAX_FRAME_LEN as u64)
                    .read_until(b'\n', &mut line)
                    .await?;
                if line.last() != Some(&b'\n') {
                    if bytes == MAX_FRAME_LEN {
                        return Err(ConnectionError::FrameTooLong(MAX_FRAME_LEN));
                    }
                    // A trailing fragment without a newline only shows up at EOF.
                    return Ok(None);
                }
                Ok(Some(String::from_utf8_lossy(&line).into_owned()))
            }
            FrameSource::WebSocket(stream) => loop {
                match stream.next().await {
                    None | Some(Ok(Message::Close(_))) => return Ok(None),
                    Some(Ok(Message::Text(text))) => return Ok(Some(format!("{text}\n"))),
                    Some(Ok(Message::Binary(bytes))) => {
                        return Ok(Some(format!("{}\n", String::from_utf8_lossy(&bytes))));
                    }
                    Some(Ok(Message::Ping(_) | Message::Pong(_))) => continue,
                    Some(Err(err)) => return Err(err.into()),
                }
            },
        }
    }
}

/// Write side of a connection. Cheap to clone; every clone refers to the
/// same transport.
#[derive(Clone)]
pub struct ConnectionHandle {
    shared: Arc<Shared>,
}

struct Shared {
    id: ConnectionId,
    remote: String,
    sink: Mutex<FrameSink>,
    closed: watch::Sender<bool>,
    write_timeout: Duration,
}

impl ConnectionHandle {
    pub fn id(&self) -> ConnectionId {
        self.shared.id
    }

    /// Peer address captured at accept time.
    pub fn remote_addr(&self) -> &str {
        &self.shared.remote
    }

    pub fn is_closed(&self) -> bool {
        *self.shared.closed.borrow()
    }

    pub async fn write(&self, text: &str) -> Result<(), ConnectionError> {
        if self.is_closed() {
            return Err(ConnectionError::Closed);
        }

        let limit = self.shared.write_timeout;
        let attempt = async {
            let mut sink = self.shared.sink.lock().await;
            if self.is_closed() {
                return Err(ConnectionError::Closed);
            }
            sink.send_text(text).await
        };
        match timeout(limit, attempt).await {
            Ok(result) => result,
            Err(_) => Err(ConnectionError::TimedOut(limit)),
        }
    }

    /// Closes the transport and wakes its reader. Calling it again is a no-op.
    pub async fn close(&self) {
        if self.shared.closed.send_replace(true) {
            return;
        }

        let limit = self.shared.write_timeout;
        let mut sink = self.shared.sink.lock().await;
        match timeout(limit, sink.close()).await {
            Ok(Ok(())) => {}
            Ok(Err(err)) => {
                debug!(connection = %self.id(), error = %err, "close did not complete cleanly");
            }
            Err(_) => debug!(connection = %self.id(), "close timed out"),
        }
    }
}

impl fmt::Debug for ConnectionHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionHandle")
            .field("id", &self.id())
            .field("remote", &self.remote_addr())
            .field("closed", &self.is_closed())
            .finish()
    }
}

enum FrameSink {
    Stream(BoxedWriter),
    WebSocket(SplitSink<WebSocket, Message>),
}

impl FrameSink {
    async fn send_text(&mut self, text: &str) -> Result<(), ConnectionError> {
        match self {
            FrameSink::Stream(writer) => {
                writer.write_all(text.as_bytes()).await?;
                writer.flush().await?;
            }
            FrameSink::WebSocket(sink) => sink.send(Message::Text(text.to_owned())).await?,
        }
        Ok(())
    }

    async fn close(&mut self) -> Result<(), ConnectionError> {
        match self {
            FrameSink::Stream(writer) => writer.shutdown().await?,
            FrameSink::WebSocket(sink) => {
                let frame = CloseFrame {
                    code: close_code::NORMAL,
                    reason: "connection closed".into(),
                };
                sink.send(Message::Close(Some(frame))).await?;
                sink.close().await?;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, DuplexStream, duplex};

    fn peer() -> SocketAddr {
        "127.0.0.1:4000".parse().expect("valid socket address")
    }

    fn pipe() -> (Connection, DuplexStream) {
        pipe_with(4096, DEFAULT_WRITE_TIMEOUT)
    }

    fn pipe_with(capacity: usize, write_timeout: Duration) -> (Connection, DuplexStream) {
        let (server_side, client_side) = duplex(capacity);
        let connection = Connection::from_stream(server_side, peer(), write_timeout);
        (connection, client_side)
    }

    #[test]
    fn connection_ids_are_distinct_for_the_same_peer() {
        let (first, _a) = pipe();
        let (second, _b) = pipe();

        assert_ne!(first.id(), second.id());
        assert_eq!(first.remote_addr(), second.remote_addr());
    }

    #[tokio::test]
    async fn reads_newline_terminated_lines() {
        let (connection, mut client) = pipe();
        let (_handle, mut reader) = connection.into_parts();

        client.write_all(b"hello\nworld\n").await.expect("write");

        assert_eq!(reader.read().await.expect("read").as_deref(), Some("hello\n"));
        assert_eq!(reader.read().await.expect("read").as_deref(), Some("world\n"));
    }

    #[tokio::test]
    async fn partial_line_at_eof_ends_the_stream() {
        let (connection, mut client) = pipe();
        let (_handle, mut reader) = connection.into_parts();

        client.write_all(b"no newline").await.expect("write");
        drop(client);

        assert_eq!(reader.read().await.expect("read"), None);
    }

    #[tokio::test]
    async fn invalid_utf8_is_decoded_lossily() {
        let (connection, mut client) = pipe();
        let (_handle, mut reader) = connection.into_parts();

        client.write_all(b"caf\xe9\nstill here\n").await.expect("write");

        assert_eq!(
            reader.read().await.expect("read").as_deref(),
            Some("caf\u{FFFD}\n")
        );
        assert_eq!(
            reader.read().await.expect("read").as_deref(),
            Some("still here\n")
        );
    }

    #[tokio::test]
    async fn overlong_line_is_rejected() {
        let (connection, mut client) = pipe();
        let (_handle, mut reader) = connection.into_parts();

        tokio::spawn(async move {
            let flood = vec![b'a'; MAX_FRAME_LEN + 16];
            let _ = client.write_all(&flood).await;
            // Keep the pipe open so the reader cannot see EOF instead.
            std::future::pending::<()>().await;
        });

        assert!(matches!(
            reader.read().await,
            Err(ConnectionError::FrameTooLong(MAX_FRAME_LEN))
        ));
    }

    #[tokio::test]
    async fn line_of_exactly_max_length_is_accepted() {
        let (connection, mut client) = pipe();
        let (_handle, mut reader) = connection.into_parts();

        let mut line = vec![b'a'; MAX_FRAME_LEN - 1];
        line.push(b'\n');
        tokio::spawn(async move {
            let _ = client.write_all(&line).await;
            std::future::pending::<()>().await;
        });

        let frame = reader.read().await.expect("read").expect("frame");
        assert_eq!(frame.len(), MAX_FRAME_LEN);
    }

    #[tokio::test]
    async fn write_to_stalled_peer_times_out() {
        let (connection, _client) = pipe_with(1, Duration::from_millis(100));
        let (handle, _reader) = connection.into_parts();

        let result = handle.write("nobody is reading this\n").await;

        assert!(matches!(result, Err(ConnectionError::TimedOut(_))));
    }

    #[tokio::test]
    async fn close_wakes_a_suspended_reader() {
        let (connection, _client) = pipe();
        let (handle, mut reader) = connection.into_parts();

        let pending = tokio::spawn(async move { reader.read().await });
        tokio::task::yield_now().await;
        handle.close().await;

        let result = pending.await.expect("reader task");
        assert!(matches!(result, Err(ConnectionError::Closed)));
    }

    #[tokio::test]
    async fn close_is_idempotent_and_blocks_later_writes() {
        let (connection, mut client) = pipe();
        let (handle, _reader) = connection.into_parts();

        handle.write("last\n").await.expect("write before close");
        handle.close().await;
        handle.close().await;

        assert!(handle.is_closed());
        assert!(matches!(handle.write("late\n").await, Err(ConnectionError::Closed)));

        let mut received = String::new();
        client.read_to_string(&mut received).await.expect("read to eof");
        assert_eq!(received, "last\n");
    }

    #[tokio::test]
    async fn write_to_dropped_peer_fails() {
        let (connection, client) = pipe();
        let (handle, _reader) = connection.into_parts();
        drop(client);

        assert!(handle.write("anyone there?\n").await.is_err());
    }
}
