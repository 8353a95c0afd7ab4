//! Pub/sub handshake confirming a replica attached to its new primary.
//!
//! The replica subscribes to a well-known channel on its own node, and the
//! primary repeatedly publishes `"<replica> seeks <primary>"`. A node relays
//! its primary's PUBLISH traffic through the replication stream, so the
//! replica only sees the message once its replication link is live. Receipt
//! says nothing about data convergence; that's what the flush wait is for.

use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::endpoint::Endpoint;
use crate::error::{Error, Result};
use crate::node::NodeHandle;
use crate::session::{Connector, Subscription};
use crate::wait::{Deadline, WaitOptions};

/// Channel the handshake runs on unless configured otherwise.
pub const DEFAULT_CHANNEL: &str = "select-master";

/// The exact payload that confirms `replica` attached to `primary`.
pub fn rendezvous_message(replica: &Endpoint, primary: &Endpoint) -> String {
    format!(
        "{}:{} seeks {}:{}",
        replica.host, replica.port, primary.host, primary.port
    )
}

#[derive(Debug, Clone)]
pub struct RendezvousChannel {
    channel: String,
    opts: WaitOptions,
}

impl RendezvousChannel {
    pub fn new(channel: impl Into<String>, opts: WaitOptions) -> Self {
        Self {
            channel: channel.into(),
            opts,
        }
    }

    pub fn channel(&self) -> &str {
        &self.channel
    }

    /// Runs the handshake for a replica that was just pointed at `primary`.
    ///
    /// The subscriber runs on its own task and reports through a oneshot;
    /// this task publishes on the configured interval until that report
    /// arrives, then joins the subscriber. Subscriber errors, timeouts, and
    /// cancellation all surface here.
    pub async fn confirm<C: Connector>(
        &self,
        replica: &mut NodeHandle<C>,
        primary: &mut NodeHandle<C>,
        cancel: &CancellationToken,
    ) -> Result<()> {
        let message = rendezvous_message(replica.endpoint(), primary.endpoint());
        let deadline = Deadline::start("attach confirmation", &self.opts);

        let subscription = deadline.guard(replica.subscribe(&self.channel), cancel).await?;
        let (done_tx, mut done_rx) = oneshot::channel();
        let expected = message.clone();
        let endpoint = replica.endpoint().clone();
        let waiter = tokio::spawn(async move {
            let result = await_message(subscription, &expected)
                .await
                .map_err(|e| Error::connection(&endpoint, e));
            let _ = done_tx.send(result);
        });

        let mut ticker = tokio::time::interval(self.opts.interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        let mut published = 0u64;

        let outcome = loop {
            tokio::select! {
                biased;
                received = &mut done_rx => {
                    break received.unwrap_or_else(|_| {
                        Err(Error::Precondition("rendezvous subscriber exited without reporting".into()))
                    });
                }
                _ = cancel.cancelled() => break Err(Error::Cancelled("attach confirmation")),
                _ = deadline.expired() => break Err(deadline.timeout_error()),
                _ = ticker.tick() => {
                    let publish = primary.publish(&self.channel, &message);
                    if let Err(e) = deadline.guard(publish, cancel).await {
                        break Err(e);
                    }
                    published += 1;
                }
            }
        };

        match &outcome {
            Ok(()) => {
                // the subscriber has reported, so this join is immediate
                if let Err(e) = waiter.await {
                    warn!(replica = %replica.endpoint(), "rendezvous subscriber task failed: {e}");
                }
                info!(replica = %replica.endpoint(), primary = %primary.endpoint(), published, "attach confirmed");
            }
            Err(e) => {
                waiter.abort();
                debug!(replica = %replica.endpoint(), published, "rendezvous abandoned: {e}");
            }
        }
        outcome
    }
}

/// Reads messages until `expected` arrives, then leaves the channel.
async fn await_message(
    mut subscription: Box<dyn Subscription>,
    expected: &str,
) -> Result<(), crate::connection::ConnectionError> {
    loop {
        let msg = subscription.next_message().await?;
        if msg == expected {
            break;
        }
        debug!(%msg, "ignoring rendezvous message for another pair");
    }
    subscription.unsubscribe().await
}
