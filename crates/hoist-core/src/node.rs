//! A handle on one cluster member.
//!
//! The handle owns the member's command session, opened lazily on first
//! use and reused afterwards. A session that fails mid-call is dropped so
//! the next call starts from a fresh connection; the failure itself is
//! still returned, since retrying is the orchestrator's decision.

use std::sync::Arc;

use hoist_protocol::Frame;
use tracing::debug;

use crate::endpoint::Endpoint;
use crate::error::{Error, Result};
use crate::info::{InfoReport, ReplicaSet, ReplicationStatus, Role};
use crate::session::{Connector, Session, Subscription};

pub struct NodeHandle<C: Connector> {
    endpoint: Endpoint,
    connector: Arc<C>,
    session: Option<C::Session>,
}

impl<C: Connector> NodeHandle<C> {
    pub fn new(endpoint: Endpoint, connector: Arc<C>) -> Self {
        Self {
            endpoint,
            connector,
            session: None,
        }
    }

    pub fn endpoint(&self) -> &Endpoint {
        &self.endpoint
    }

    /// Takes the session out of the handle for the duration of one call.
    /// It goes back only once the call completes, so a call abandoned
    /// mid-reply leaves the handle to reconnect instead of reading the
    /// stale reply later.
    async fn checkout(&mut self) -> Result<C::Session> {
        match self.session.take() {
            Some(s) => Ok(s),
            None => self
                .connector
                .connect(&self.endpoint)
                .await
                .map_err(|e| Error::connection(&self.endpoint, e)),
        }
    }

    /// Issues a command, turning error replies into [`Error::Protocol`].
    async fn call(&mut self, args: &[&str]) -> Result<Frame> {
        let mut session = self.checkout().await?;
        let frame = session
            .call(args)
            .await
            .map_err(|e| Error::connection(&self.endpoint, e))?;
        self.session = Some(session);
        match frame {
            Frame::Error(msg) => Err(Error::protocol(
                &self.endpoint,
                format!("{} rejected: {msg}", args.join(" ")),
            )),
            frame => Ok(frame),
        }
    }

    async fn call_ok(&mut self, args: &[&str]) -> Result<()> {
        let frame = self.call(args).await?;
        if frame.is_ok() {
            Ok(())
        } else {
            Err(Error::protocol(
                &self.endpoint,
                format!("expected OK to {}, got {frame:?}", args[0]),
            ))
        }
    }

    /// Queries role, offset, and replicas from one INFO snapshot.
    pub async fn replication_status(&mut self) -> Result<ReplicationStatus> {
        let frame = self.call(&["INFO", "replication"]).await?;
        let text = frame
            .as_text()
            .ok_or_else(|| Error::protocol(&self.endpoint, format!("INFO returned {frame:?}")))?;
        ReplicationStatus::from_info(&InfoReport::parse(text))
            .map_err(|e| Error::protocol(&self.endpoint, e))
    }

    pub async fn role(&mut self) -> Result<Role> {
        Ok(self.replication_status().await?.role)
    }

    /// The primary's own write offset, or a replica's last-applied offset.
    pub async fn replication_offset(&mut self) -> Result<i64> {
        Ok(self.replication_status().await?.offset)
    }

    /// Online replicas attached to this node; empty unless it is a primary.
    pub async fn attached_replicas(&mut self) -> Result<ReplicaSet> {
        Ok(self.replication_status().await?.replicas)
    }

    /// Detaches from any primary. A no-op when already primary; returns
    /// whether a command was issued.
    pub async fn become_primary(&mut self) -> Result<bool> {
        if self.role().await? == Role::Primary {
            debug!(endpoint = %self.endpoint, "already primary");
            return Ok(false);
        }
        self.call_ok(&["SLAVEOF", "NO", "ONE"]).await?;
        Ok(true)
    }

    /// Points replication at `target`. Does not wait for the link to come up.
    pub async fn become_replica_of(&mut self, target: &Endpoint) -> Result<()> {
        if target == &self.endpoint {
            return Err(Error::Precondition(format!(
                "{} cannot replicate from itself",
                self.endpoint
            )));
        }
        let port = target.port.to_string();
        self.call_ok(&["SLAVEOF", &target.host, &port]).await
    }

    /// Persists the runtime configuration so a restart keeps the topology.
    pub async fn rewrite_config(&mut self) -> Result<()> {
        self.call_ok(&["CONFIG", "REWRITE"]).await
    }

    /// Reads one configuration parameter; `None` if the node doesn't know it.
    pub async fn config_get(&mut self, param: &str) -> Result<Option<String>> {
        let frame = self.call(&["CONFIG", "GET", param]).await?;
        let value = match &frame {
            Frame::Array(items) if items.is_empty() => None,
            Frame::Array(items) if items.len() == 2 => items[1].as_text(),
            Frame::Map(pairs) if pairs.is_empty() => None,
            Frame::Map(pairs) if pairs.len() == 1 => pairs[0].1.as_text(),
            _ => {
                return Err(Error::protocol(
                    &self.endpoint,
                    format!("CONFIG GET {param} returned {frame:?}"),
                ))
            }
        };
        Ok(value.map(str::to_owned))
    }

    pub async fn config_set(&mut self, param: &str, value: &str) -> Result<()> {
        self.call_ok(&["CONFIG", "SET", param, value]).await
    }

    /// Publishes on `channel`; returns how many subscribers received it.
    pub async fn publish(&mut self, channel: &str, message: &str) -> Result<i64> {
        match self.call(&["PUBLISH", channel, message]).await? {
            Frame::Integer(n) => Ok(n),
            other => Err(Error::protocol(
                &self.endpoint,
                format!("PUBLISH returned {other:?}"),
            )),
        }
    }

    pub async fn subscribe(&mut self, channel: &str) -> Result<Box<dyn Subscription>> {
        let mut session = self.checkout().await?;
        let subscription = session
            .subscribe(channel)
            .await
            .map_err(|e| Error::connection(&self.endpoint, e))?;
        self.session = Some(session);
        Ok(subscription)
    }
}
