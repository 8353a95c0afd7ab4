//! Session seams between node handles and the wire.
//!
//! [`Connector`] opens a [`Session`] per endpoint; a session issues
//! commands and can open a [`Subscription`] on a channel. The TCP
//! implementation is [`RespConnector`]. Tests swap in an in-memory
//! cluster behind the same traits.

use std::time::Duration;

use async_trait::async_trait;
use hoist_protocol::Frame;
use tracing::debug;

use crate::connection::{Connection, ConnectionError};
use crate::endpoint::Endpoint;

/// A command session to one node.
#[async_trait]
pub trait Session: Send + 'static {
    /// Sends one command and returns the node's reply frame. Error replies
    /// (`-ERR ...`) come back as `Ok(Frame::Error(..))`.
    async fn call(&mut self, args: &[&str]) -> Result<Frame, ConnectionError>;

    /// Subscribes to `channel` on a dedicated connection to the same node.
    ///
    /// Returns once the node has confirmed the subscription, so any message
    /// published afterwards is guaranteed to be delivered.
    async fn subscribe(&mut self, channel: &str) -> Result<Box<dyn Subscription>, ConnectionError>;
}

/// A live channel subscription.
#[async_trait]
pub trait Subscription: Send {
    /// Waits for the next message payload on the subscribed channel.
    async fn next_message(&mut self) -> Result<String, ConnectionError>;

    /// Leaves the channel and closes the underlying connection.
    async fn unsubscribe(self: Box<Self>) -> Result<(), ConnectionError>;
}

/// Opens sessions to endpoints.
#[async_trait]
pub trait Connector: Send + Sync + 'static {
    type Session: Session;

    async fn connect(&self, endpoint: &Endpoint) -> Result<Self::Session, ConnectionError>;
}

/// Opens RESP-over-TCP sessions.
#[derive(Debug, Clone)]
pub struct RespConnector {
    password: Option<String>,
    connect_timeout: Duration,
}

impl RespConnector {
    pub fn new(password: Option<String>, connect_timeout: Duration) -> Self {
        Self {
            password,
            connect_timeout,
        }
    }

    async fn open(&self, endpoint: &Endpoint) -> Result<Connection, ConnectionError> {
        let mut conn = Connection::connect(endpoint, self.connect_timeout).await?;
        if let Some(pw) = &self.password {
            conn.authenticate(pw).await?;
        }
        Ok(conn)
    }
}

#[async_trait]
impl Connector for RespConnector {
    type Session = RespSession;

    async fn connect(&self, endpoint: &Endpoint) -> Result<RespSession, ConnectionError> {
        let conn = self.open(endpoint).await?;
        debug!(%endpoint, "session established");
        Ok(RespSession {
            endpoint: endpoint.clone(),
            connector: self.clone(),
            conn,
        })
    }
}

/// A command session over one TCP connection.
pub struct RespSession {
    endpoint: Endpoint,
    connector: RespConnector,
    conn: Connection,
}

#[async_trait]
impl Session for RespSession {
    async fn call(&mut self, args: &[&str]) -> Result<Frame, ConnectionError> {
        self.conn.send_command(args).await
    }

    async fn subscribe(&mut self, channel: &str) -> Result<Box<dyn Subscription>, ConnectionError> {
        let mut conn = self.connector.open(&self.endpoint).await?;
        conn.write_command(&["SUBSCRIBE", channel]).await?;

        // the confirmation is the first push on a fresh connection
        loop {
            let frame = conn.read_frame().await?;
            match push_kind(&frame) {
                Some(("subscribe", ch)) if ch == channel => break,
                _ => {
                    if let Frame::Error(e) = &frame {
                        return Err(ConnectionError::Protocol(e.clone()));
                    }
                }
            }
        }

        debug!(endpoint = %self.endpoint, channel, "subscribed");
        Ok(Box::new(RespSubscription {
            conn,
            channel: channel.to_owned(),
        }))
    }
}

struct RespSubscription {
    conn: Connection,
    channel: String,
}

#[async_trait]
impl Subscription for RespSubscription {
    async fn next_message(&mut self) -> Result<String, ConnectionError> {
        loop {
            let frame = self.conn.read_frame().await?;
            match &frame {
                Frame::Array(parts) if parts.len() == 3 => {
                    if let Some(("message", ch)) = push_kind(&frame) {
                        if ch == self.channel {
                            return parts[2].as_text().map(str::to_owned).ok_or_else(|| {
                                ConnectionError::Protocol("non-text pub/sub payload".into())
                            });
                        }
                    }
                }
                Frame::Error(e) => return Err(ConnectionError::Protocol(e.clone())),
                _ => {}
            }
        }
    }

    async fn unsubscribe(mut self: Box<Self>) -> Result<(), ConnectionError> {
        let channel = self.channel.clone();
        self.conn.write_command(&["UNSUBSCRIBE", channel.as_str()]).await?;
        loop {
            let frame = self.conn.read_frame().await?;
            if let Some(("unsubscribe", _)) = push_kind(&frame) {
                break;
            }
        }
        self.conn.shutdown().await;
        Ok(())
    }
}

/// Splits a pub/sub push frame into its kind and channel name.
fn push_kind(frame: &Frame) -> Option<(&str, &str)> {
    match frame {
        Frame::Array(parts) if parts.len() >= 2 => {
            Some((parts[0].as_text()?, parts[1].as_text()?))
        }
        _ => None,
    }
}
