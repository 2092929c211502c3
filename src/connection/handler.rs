//! Connection Handler
//!
//! Each client gets its own handler task that runs in a loop,
//! reading commands and sending responses.
//!
//! ## Connection Lifecycle
//!
//! ```text
//! 1. Client connects (TCP handshake)
//!        │
//!        ▼
//! 2. ConnectionHandler spawned
//!        │
//!        ▼
//! 3. ┌──────────────────────────────┐
//!    │      Main Loop (Open)        │
//!    │                              │
//!    │  Read bytes from socket      │
//!    │  Decode every full frame     │
//!    │  Execute, send response      │
//!    │  [Loop back]                 │
//!    └──────────────────────────────┘
//!        │
//!        ▼
//! 4. End of stream / QUIT / I/O error
//!        │
//!        ▼
//! 5. Handler task ends (Closed)
//! ```
//!
//! ## Buffer Management
//!
//! Incoming bytes accumulate in a `BytesMut` until a full frame is present.
//! TCP is a stream protocol: one read may hold half a command, or several.
//! Every complete frame in the buffer is answered in arrival order before
//! the next read.
//!
//! A malformed frame gets a protocol error reply and the rest of the buffer
//! is dropped, since there is no way to find the next frame boundary. The
//! connection stays open.

use crate::commands::CommandHandler;
use crate::error::CommandError;
use crate::protocol::{Command, ParseError, RespParser, RespValue};
use bytes::BytesMut;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufWriter};
use tokio::net::TcpStream;
use tracing::{debug, info, trace, warn};

/// Initial buffer capacity
const INITIAL_BUFFER_SIZE: usize = 4096;

/// Statistics for connection handling
#[derive(Debug, Default)]
pub struct ConnectionStats {
    /// Total number of connections accepted
    pub connections_accepted: AtomicU64,
    /// Currently active connections
    pub active_connections: AtomicU64,
    /// Total commands processed
    pub commands_processed: AtomicU64,
    /// Frames rejected by the decoder
    pub protocol_errors: AtomicU64,
    /// Total bytes read
    pub bytes_read: AtomicU64,
    /// Total bytes written
    pub bytes_written: AtomicU64,
}

impl ConnectionStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn connection_opened(&self) {
        self.connections_accepted.fetch_add(1, Ordering::Relaxed);
        self.active_connections.fetch_add(1, Ordering::Relaxed);
    }

    pub fn connection_closed(&self) {
        self.active_connections.fetch_sub(1, Ordering::Relaxed);
    }

    pub fn command_processed(&self) {
        self.commands_processed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn protocol_error(&self) {
        self.protocol_errors.fetch_add(1, Ordering::Relaxed);
    }

    pub fn bytes_read(&self, count: usize) {
        self.bytes_read.fetch_add(count as u64, Ordering::Relaxed);
    }

    pub fn bytes_written(&self, count: usize) {
        self.bytes_written.fetch_add(count as u64, Ordering::Relaxed);
    }
}

/// Handles a single client connection.
///
/// Generic over the stream so the same loop serves a `TcpStream` or any
/// other duplex byte stream.
pub struct ConnectionHandler<S> {
    /// The client stream, write side buffered
    stream: BufWriter<S>,

    /// Client's address (for logging)
    addr: SocketAddr,

    /// Bytes received but not yet decoded
    buffer: BytesMut,

    /// The command handler (shares the store with other connections)
    command_handler: CommandHandler,

    parser: RespParser,

    /// Connection statistics (shared)
    stats: Arc<ConnectionStats>,
}

impl<S> ConnectionHandler<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    /// Creates a new connection handler.
    ///
    /// # Arguments
    ///
    /// * `stream` - The byte stream for this connection
    /// * `addr` - The client's socket address
    /// * `command_handler` - The command handler for executing commands
    /// * `stats` - Shared connection statistics
    pub fn new(
        stream: S,
        addr: SocketAddr,
        command_handler: CommandHandler,
        stats: Arc<ConnectionStats>,
    ) -> Self {
        stats.connection_opened();

        Self {
            stream: BufWriter::new(stream),
            addr,
            buffer: BytesMut::with_capacity(INITIAL_BUFFER_SIZE),
            command_handler,
            parser: RespParser::new(),
            stats,
        }
    }

    /// Runs the connection until the client leaves.
    ///
    /// Returns `Ok(())` when the client sent `QUIT`. Every other way out is
    /// reported as a [`ConnectionError`], including an orderly end of stream.
    pub async fn run(mut self) -> Result<(), ConnectionError> {
        info!(client = %self.addr, "Client connected");

        let result = self.main_loop().await;

        match &result {
            Ok(()) => info!(client = %self.addr, "Client quit"),
            Err(ConnectionError::ClientDisconnected) => {
                info!(client = %self.addr, "Client disconnected")
            }
            Err(ConnectionError::UnexpectedEof) => {
                debug!(
                    client = %self.addr,
                    buffered = self.buffer.len(),
                    "Client disconnected mid-frame"
                )
            }
            Err(ConnectionError::IoError(io_err))
                if io_err.kind() == std::io::ErrorKind::ConnectionReset =>
            {
                debug!(client = %self.addr, "Connection reset by client")
            }
            Err(e) => warn!(client = %self.addr, error = %e, "Connection error"),
        }

        self.stats.connection_closed();
        result
    }

    /// The main read-execute-respond loop.
    async fn main_loop(&mut self) -> Result<(), ConnectionError> {
        loop {
            loop {
                match self.try_parse_command() {
                    Ok(Some(command)) => {
                        let name = command.name.clone();
                        let response = self.command_handler.execute(command);
                        self.stats.command_processed();

                        if response.value.is_error() {
                            debug!(
                                client = %self.addr,
                                command = %name,
                                reply = %response.value,
                                "Command failed"
                            );
                        }

                        self.send_response(&response.value).await?;

                        if response.close {
                            // Anything pipelined after QUIT is dropped
                            self.stream.shutdown().await?;
                            return Ok(());
                        }
                    }
                    Ok(None) => break,
                    Err(e) => {
                        warn!(client = %self.addr, error = %e, "Protocol error, discarding buffered input");
                        self.stats.protocol_error();
                        self.buffer.clear();

                        let reply = CommandError::from(e).to_resp();
                        self.send_response(&reply).await?;
                        break;
                    }
                }
            }

            self.read_more_data().await?;
        }
    }

    /// Attempts to decode one command from the front of the buffer.
    fn try_parse_command(&mut self) -> Result<Option<Command>, ParseError> {
        match self.parser.parse(&self.buffer)? {
            Some((command, consumed)) => {
                let _ = self.buffer.split_to(consumed);
                trace!(
                    client = %self.addr,
                    command = %command.name,
                    args = command.args.len(),
                    consumed = consumed,
                    remaining = self.buffer.len(),
                    "Parsed command"
                );
                Ok(Some(command))
            }
            None => {
                if !self.buffer.is_empty() {
                    trace!(
                        client = %self.addr,
                        buffered = self.buffer.len(),
                        "Incomplete command, need more data"
                    );
                }
                Ok(None)
            }
        }
    }

    /// Reads more data from the socket into the buffer.
    async fn read_more_data(&mut self) -> Result<(), ConnectionError> {
        if self.buffer.capacity() - self.buffer.len() < 1024 {
            self.buffer.reserve(INITIAL_BUFFER_SIZE);
        }

        let n = self.stream.get_mut().read_buf(&mut self.buffer).await?;

        if n == 0 {
            if self.buffer.is_empty() {
                return Err(ConnectionError::ClientDisconnected);
            } else {
                return Err(ConnectionError::UnexpectedEof);
            }
        }

        self.stats.bytes_read(n);
        trace!(client = %self.addr, bytes = n, "Read data");

        Ok(())
    }

    /// Sends a response to the client.
    async fn send_response(&mut self, response: &RespValue) -> Result<(), ConnectionError> {
        let bytes = response.serialize();
        self.stream.write_all(&bytes).await?;
        self.stream.flush().await?;
        self.stats.bytes_written(bytes.len());
        trace!(
            client = %self.addr,
            bytes = bytes.len(),
            reply = %response,
            "Sent response"
        );
        Ok(())
    }
}

/// Errors that end a connection.
#[derive(Debug, thiserror::Error)]
pub enum ConnectionError {
    /// I/O error (network issue)
    #[error("I/O error: {0}")]
    IoError(#[from] std::io::Error),

    /// Client closed the stream between frames
    #[error("Client disconnected")]
    ClientDisconnected,

    /// Client closed the stream in the middle of a frame
    #[error("Unexpected end of stream")]
    UnexpectedEof,
}

/// Handles a client connection.
///
/// Creates a [`ConnectionHandler`] for the TCP stream and runs it to
/// completion. Orderly disconnects are not reported.
pub async fn handle_connection(
    stream: TcpStream,
    addr: SocketAddr,
    command_handler: CommandHandler,
    stats: Arc<ConnectionStats>,
) {
    let handler = ConnectionHandler::new(stream, addr, command_handler, stats);
    if let Err(e) = handler.run().await {
        match e {
            ConnectionError::ClientDisconnected | ConnectionError::UnexpectedEof => {}
            ConnectionError::IoError(ref io_err)
                if io_err.kind() == std::io::ErrorKind::ConnectionReset => {}
            _ => {
                debug!(client = %addr, error = %e, "Connection ended with error");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::StorageEngine;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;
    use tokio::time::{timeout, Duration};

    async fn create_test_server() -> (SocketAddr, Arc<StorageEngine>, Arc<ConnectionStats>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let storage = Arc::new(StorageEngine::new());
        let stats = Arc::new(ConnectionStats::new());

        let storage_clone = Arc::clone(&storage);
        let stats_clone = Arc::clone(&stats);

        tokio::spawn(async move {
            while let Ok((stream, client_addr)) = listener.accept().await {
                let handler = CommandHandler::new(Arc::clone(&storage_clone));
                let stats = Arc::clone(&stats_clone);
                tokio::spawn(handle_connection(stream, client_addr, handler, stats));
            }
        });

        (addr, storage, stats)
    }

    /// Reads until `expected` bytes arrived, the peer closed, or 2s passed.
    async fn read_exact_reply(client: &mut TcpStream, expected: usize) -> Vec<u8> {
        let mut buf = vec![0u8; expected];
        timeout(Duration::from_secs(2), client.read_exact(&mut buf))
            .await
            .expect("timed out waiting for reply")
            .unwrap();
        buf
    }

    fn mock_handler(stream: tokio_test::io::Mock) -> ConnectionHandler<tokio_test::io::Mock> {
        let storage = Arc::new(StorageEngine::new());
        ConnectionHandler::new(
            stream,
            "127.0.0.1:50000".parse().unwrap(),
            CommandHandler::new(storage),
            Arc::new(ConnectionStats::new()),
        )
    }

    #[tokio::test]
    async fn test_ping_pong() {
        let (addr, _, _) = create_test_server().await;

        let mut client = TcpStream::connect(addr).await.unwrap();
        client.write_all(b"*1\r\n$4\r\nPING\r\n").await.unwrap();

        assert_eq!(read_exact_reply(&mut client, 7).await, b"+PONG\r\n");
    }

    #[tokio::test]
    async fn test_set_get() {
        let (addr, _, _) = create_test_server().await;

        let mut client = TcpStream::connect(addr).await.unwrap();

        client
            .write_all(b"*3\r\n$3\r\nSET\r\n$4\r\nname\r\n$4\r\nRosa\r\n")
            .await
            .unwrap();
        assert_eq!(read_exact_reply(&mut client, 5).await, b"+OK\r\n");

        client
            .write_all(b"*2\r\n$3\r\nGET\r\n$4\r\nname\r\n")
            .await
            .unwrap();
        assert_eq!(read_exact_reply(&mut client, 10).await, b"$4\r\nRosa\r\n");
    }

    #[tokio::test]
    async fn test_expiry_over_the_wire() {
        let (addr, storage, _) = create_test_server().await;

        let mut client = TcpStream::connect(addr).await.unwrap();

        client
            .write_all(b"*5\r\n$3\r\nSET\r\n$1\r\nk\r\n$1\r\nv\r\n$2\r\nPX\r\n$2\r\n50\r\n")
            .await
            .unwrap();
        assert_eq!(read_exact_reply(&mut client, 5).await, b"+OK\r\n");

        client.write_all(b"*2\r\n$3\r\nGET\r\n$1\r\nk\r\n").await.unwrap();
        assert_eq!(read_exact_reply(&mut client, 7).await, b"$1\r\nv\r\n");

        tokio::time::sleep(Duration::from_millis(100)).await;

        client.write_all(b"*2\r\n$3\r\nGET\r\n$1\r\nk\r\n").await.unwrap();
        assert_eq!(read_exact_reply(&mut client, 5).await, b"$-1\r\n");
        assert!(storage.is_empty());
    }

    #[tokio::test]
    async fn test_multiple_commands() {
        let (addr, _, _) = create_test_server().await;

        let mut client = TcpStream::connect(addr).await.unwrap();

        // Several frames in one write (pipelining)
        client
            .write_all(b"*3\r\n$3\r\nSET\r\n$2\r\nk1\r\n$2\r\nv1\r\n*3\r\n$3\r\nSET\r\n$2\r\nk2\r\n$2\r\nv2\r\n*2\r\n$3\r\nGET\r\n$2\r\nk1\r\n*2\r\n$3\r\nGET\r\n$2\r\nk2\r\n")
            .await
            .unwrap();

        let expected = b"+OK\r\n+OK\r\n$2\r\nv1\r\n$2\r\nv2\r\n";
        assert_eq!(read_exact_reply(&mut client, expected.len()).await, expected);
    }

    #[tokio::test]
    async fn test_frame_split_across_writes() {
        let (addr, _, _) = create_test_server().await;

        let mut client = TcpStream::connect(addr).await.unwrap();

        client.write_all(b"*2\r\n$4\r\nEC").await.unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;
        client.write_all(b"HO\r\n$5\r\nhel").await.unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;
        client.write_all(b"lo\r\n").await.unwrap();

        assert_eq!(read_exact_reply(&mut client, 11).await, b"$5\r\nhello\r\n");
    }

    #[tokio::test]
    async fn test_count_header_larger_than_strings_is_answered() {
        let (addr, _, _) = create_test_server().await;

        let mut client = TcpStream::connect(addr).await.unwrap();
        client.write_all(b"*2\r\n$4\r\nPING\r\n").await.unwrap();

        assert_eq!(read_exact_reply(&mut client, 7).await, b"+PONG\r\n");
    }

    #[tokio::test]
    async fn test_protocol_error_keeps_connection_open() {
        let (addr, _, stats) = create_test_server().await;

        let mut client = TcpStream::connect(addr).await.unwrap();

        client.write_all(b"*1\r\n@\r\n").await.unwrap();
        let expected = b"-ERR Protocol error: expected '$', got byte 0x40\r\n";
        assert_eq!(read_exact_reply(&mut client, expected.len()).await, expected);

        client.write_all(b"*1\r\n$4\r\nPING\r\n").await.unwrap();
        assert_eq!(read_exact_reply(&mut client, 7).await, b"+PONG\r\n");

        assert_eq!(stats.protocol_errors.load(Ordering::Relaxed), 1);
    }

    #[tokio::test]
    async fn test_unknown_command_keeps_connection_open() {
        let (addr, _, _) = create_test_server().await;

        let mut client = TcpStream::connect(addr).await.unwrap();

        client.write_all(b"*1\r\n$6\r\nFOOBAR\r\n").await.unwrap();
        let expected = b"-ERR unknown command\r\n";
        assert_eq!(read_exact_reply(&mut client, expected.len()).await, expected);

        client.write_all(b"*1\r\n$4\r\nPING\r\n").await.unwrap();
        assert_eq!(read_exact_reply(&mut client, 7).await, b"+PONG\r\n");
    }

    #[tokio::test]
    async fn test_quit_closes_connection() {
        let (addr, _, _) = create_test_server().await;

        let mut client = TcpStream::connect(addr).await.unwrap();

        client.write_all(b"*1\r\n$4\r\nQUIT\r\n").await.unwrap();
        assert_eq!(read_exact_reply(&mut client, 5).await, b"+OK\r\n");

        // Server side is closed: the next read sees end of stream
        let mut buf = [0u8; 16];
        let n = timeout(Duration::from_secs(2), client.read(&mut buf))
            .await
            .expect("timed out waiting for close")
            .unwrap_or(0);
        assert_eq!(n, 0);
    }

    #[tokio::test]
    async fn test_concurrent_clients_on_distinct_keys() {
        let (addr, storage, _) = create_test_server().await;

        let mut tasks = Vec::new();
        for i in 0..16 {
            tasks.push(tokio::spawn(async move {
                let mut client = TcpStream::connect(addr).await.unwrap();
                let key = format!("key{:02}", i);
                let value = format!("value{:02}", i);
                let set = format!(
                    "*3\r\n$3\r\nSET\r\n${}\r\n{}\r\n${}\r\n{}\r\n",
                    key.len(),
                    key,
                    value.len(),
                    value
                );
                client.write_all(set.as_bytes()).await.unwrap();
                assert_eq!(read_exact_reply(&mut client, 5).await, b"+OK\r\n");
            }));
        }
        for task in tasks {
            task.await.unwrap();
        }

        assert_eq!(storage.len(), 16);

        let mut client = TcpStream::connect(addr).await.unwrap();
        for i in 0..16 {
            let get = format!("*2\r\n$3\r\nGET\r\n$5\r\nkey{:02}\r\n", i);
            client.write_all(get.as_bytes()).await.unwrap();
            let expected = format!("$7\r\nvalue{:02}\r\n", i);
            assert_eq!(
                read_exact_reply(&mut client, expected.len()).await,
                expected.as_bytes()
            );
        }
    }

    #[tokio::test]
    async fn test_connection_stats() {
        let (addr, _, stats) = create_test_server().await;

        assert_eq!(stats.active_connections.load(Ordering::Relaxed), 0);

        let mut client = TcpStream::connect(addr).await.unwrap();

        // Give the server time to accept the connection
        tokio::time::sleep(Duration::from_millis(50)).await;

        assert_eq!(stats.connections_accepted.load(Ordering::Relaxed), 1);
        assert_eq!(stats.active_connections.load(Ordering::Relaxed), 1);

        client.write_all(b"*1\r\n$4\r\nPING\r\n").await.unwrap();
        let _ = read_exact_reply(&mut client, 7).await;

        tokio::time::sleep(Duration::from_millis(50)).await;

        assert!(stats.commands_processed.load(Ordering::Relaxed) >= 1);
        assert!(stats.bytes_read.load(Ordering::Relaxed) > 0);
        assert!(stats.bytes_written.load(Ordering::Relaxed) > 0);

        drop(client);

        tokio::time::sleep(Duration::from_millis(50)).await;

        assert_eq!(stats.active_connections.load(Ordering::Relaxed), 0);
    }

    #[tokio::test]
    async fn test_mock_pipelined_frames_answered_in_order() {
        let stream = tokio_test::io::Builder::new()
            .read(b"*1\r\n$4\r\nPING\r\n*3\r\n$4\r\nECHO\r\n$1\r\na\r\n$1\r\nb\r\n*2\r\n$3\r\nGET\r\n$4\r\nnone\r\n")
            .write(b"+PONG\r\n")
            .write(b"$1\r\na\r\n$1\r\nb\r\n")
            .write(b"$-1\r\n")
            .build();

        let result = mock_handler(stream).run().await;
        assert!(matches!(result, Err(ConnectionError::ClientDisconnected)));
    }

    #[tokio::test]
    async fn test_mock_split_frame() {
        let stream = tokio_test::io::Builder::new()
            .read(b"*2\r\n$3\r\nGET")
            .read(b"\r\n$1\r\nk\r\n")
            .write(b"$-1\r\n")
            .build();

        let result = mock_handler(stream).run().await;
        assert!(matches!(result, Err(ConnectionError::ClientDisconnected)));
    }

    #[tokio::test]
    async fn test_mock_quit_drops_pipelined_commands() {
        let stream = tokio_test::io::Builder::new()
            .read(b"*1\r\n$4\r\nQUIT\r\n*1\r\n$4\r\nPING\r\n")
            .write(b"+OK\r\n")
            .build();

        let result = mock_handler(stream).run().await;
        assert!(result.is_ok());
    }

    #[tokio::test]
    async fn test_mock_recovers_after_protocol_error() {
        let stream = tokio_test::io::Builder::new()
            .read(b"*1\r\n@\r\n*1\r\n$4\r\nPING\r\n")
            .write(b"-ERR Protocol error: expected '$', got byte 0x40\r\n")
            .read(b"*1\r\n$4\r\nPING\r\n")
            .write(b"+PONG\r\n")
            .build();

        let result = mock_handler(stream).run().await;
        assert!(matches!(result, Err(ConnectionError::ClientDisconnected)));
    }

    #[tokio::test]
    async fn test_mock_eof_mid_frame() {
        let stream = tokio_test::io::Builder::new()
            .read(b"*2\r\n$3\r\nGET\r\n$4\r\nna")
            .build();

        let result = mock_handler(stream).run().await;
        assert!(matches!(result, Err(ConnectionError::UnexpectedEof)));
    }

    #[tokio::test]
    async fn test_mock_count_header_larger_than_strings_sent() {
        let stream = tokio_test::io::Builder::new()
            .read(b"*3\r\n$4\r\nPING\r\n")
            .write(b"+PONG\r\n")
            .read(b"*2\r\n$3\r\nGET\r\n")
            .write(b"-ERR wrong number of arguments for 'get' command\r\n")
            .build();

        let result = mock_handler(stream).run().await;
        assert!(matches!(result, Err(ConnectionError::ClientDisconnected)));
    }
}
