//! Async TCP connection to a store node.
//!
//! Handles connecting, sending commands as RESP arrays, and reading back
//! parsed frames. Also serves as the transport for pub/sub, where frames
//! arrive without a preceding command.

use std::time::Duration;

use bytes::BytesMut;
use hoist_protocol::{parse_frame, Frame};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;

use crate::endpoint::Endpoint;

/// Errors that can occur during connection operations.
#[derive(Debug, thiserror::Error)]
pub enum ConnectionError {
    #[error("connection failed: {0}")]
    Io(#[from] std::io::Error),

    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("server disconnected")]
    Disconnected,

    #[error("authentication failed: {0}")]
    AuthFailed(String),

    #[error("connect timed out after {0:?}")]
    ConnectTimeout(Duration),
}

/// A TCP connection to a node with read/write buffering.
pub struct Connection {
    stream: TcpStream,
    read_buf: BytesMut,
    write_buf: BytesMut,
}

impl Connection {
    /// Connects to the node at `endpoint`, giving up after `timeout`.
    pub async fn connect(endpoint: &Endpoint, timeout: Duration) -> Result<Self, ConnectionError> {
        let connect = TcpStream::connect((endpoint.host.as_str(), endpoint.port));
        let stream = tokio::time::timeout(timeout, connect)
            .await
            .map_err(|_| ConnectionError::ConnectTimeout(timeout))??;
        stream.set_nodelay(true)?;
        Ok(Self {
            stream,
            read_buf: BytesMut::with_capacity(4096),
            write_buf: BytesMut::with_capacity(4096),
        })
    }

    /// Sends a command and reads the response.
    pub async fn send_command<S: AsRef<str>>(&mut self, args: &[S]) -> Result<Frame, ConnectionError> {
        self.write_command(args).await?;
        self.read_frame().await
    }

    /// Sends a command without waiting for a reply.
    pub async fn write_command<S: AsRef<str>>(&mut self, args: &[S]) -> Result<(), ConnectionError> {
        self.write_buf.clear();
        Frame::command(args).serialize(&mut self.write_buf);
        self.stream.write_all(&self.write_buf).await?;
        self.stream.flush().await?;
        Ok(())
    }

    /// Authenticates with the server using the AUTH command.
    pub async fn authenticate(&mut self, password: &str) -> Result<(), ConnectionError> {
        let response = self.send_command(&["AUTH", password]).await?;

        match &response {
            f if f.is_ok() => Ok(()),
            Frame::Error(e) => Err(ConnectionError::AuthFailed(e.clone())),
            _ => Err(ConnectionError::AuthFailed(
                "unexpected response to AUTH".into(),
            )),
        }
    }

    /// Reads the next complete frame from the server.
    pub async fn read_frame(&mut self) -> Result<Frame, ConnectionError> {
        loop {
            if !self.read_buf.is_empty() {
                match parse_frame(&self.read_buf) {
                    Ok(Some((frame, consumed))) => {
                        let _ = self.read_buf.split_to(consumed);
                        return Ok(frame);
                    }
                    Ok(None) => {}
                    Err(e) => return Err(ConnectionError::Protocol(e.to_string())),
                }
            }

            let n = self.stream.read_buf(&mut self.read_buf).await?;
            if n == 0 {
                return Err(ConnectionError::Disconnected);
            }
        }
    }

    /// Sends QUIT and closes the write half. Errors are ignored since the
    /// connection is going away either way.
    pub async fn shutdown(mut self) {
        let _ = self.write_command(&["QUIT"]).await;
        let _ = self.stream.shutdown().await;
    }
}
