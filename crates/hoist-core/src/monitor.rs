//! Replication convergence waits.
//!
//! Both waits poll a primary's INFO snapshot at a fixed cadence. A primary's
//! own offset and its replicas' offsets come from the same snapshot, so a
//! converged result reflects one consistent observation.

use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::endpoint::Endpoint;
use crate::error::{Error, Result};
use crate::info::{ReplicaSet, Role};
use crate::node::NodeHandle;
use crate::session::Connector;
use crate::wait::{Deadline, WaitOptions};

/// How a flush wait ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FlushOutcome {
    /// Every online replica reached the primary's offset.
    Converged { offset: i64, replicas: usize },
    /// The primary had no online replicas; nothing to wait for.
    NoReplicas,
}

/// Blocks until every replica attached to `primary` has applied the
/// primary's current offset.
///
/// An empty replica set ends the wait with a warning, since a primary may
/// legitimately have no replicas.
pub async fn wait_for_flush<C: Connector>(
    primary: &mut NodeHandle<C>,
    opts: &WaitOptions,
    cancel: &CancellationToken,
) -> Result<FlushOutcome> {
    let deadline = Deadline::start("flush wait", opts);

    loop {
        let status = deadline.guard(primary.replication_status(), cancel).await?;
        if status.role != Role::Primary {
            return Err(Error::Precondition(format!(
                "{} is no longer a primary",
                primary.endpoint()
            )));
        }
        note_unusable(primary.endpoint(), &status.replicas);

        if status.replicas.is_empty() {
            warn!(endpoint = %primary.endpoint(), "primary has no online replicas");
            return Ok(FlushOutcome::NoReplicas);
        }

        if status.replicas.replicas.iter().all(|r| r.offset == status.offset) {
            info!(
                endpoint = %primary.endpoint(),
                offset = status.offset,
                replicas = status.replicas.replicas.len(),
                "replicas caught up"
            );
            return Ok(FlushOutcome::Converged {
                offset: status.offset,
                replicas: status.replicas.replicas.len(),
            });
        }

        info!(
            endpoint = %primary.endpoint(),
            offset = status.offset,
            "waiting for replicas to reach offset"
        );
        for r in &status.replicas.replicas {
            debug!(replica = %r.endpoint, offset = r.offset, lag = status.offset - r.offset, "replica offset");
        }

        deadline.pause(opts.interval, cancel).await?;
    }
}

/// Blocks until `replica` shows up as online in `primary`'s replica list.
pub async fn wait_for_attached<C: Connector>(
    primary: &mut NodeHandle<C>,
    replica: &Endpoint,
    opts: &WaitOptions,
    cancel: &CancellationToken,
) -> Result<()> {
    let deadline = Deadline::start("attach wait", opts);

    loop {
        let replicas = deadline.guard(primary.attached_replicas(), cancel).await?;
        note_unusable(primary.endpoint(), &replicas);
        if replicas.contains(replica) {
            return Ok(());
        }
        debug!(primary = %primary.endpoint(), %replica, "replica not listed yet");
        deadline.pause(opts.interval, cancel).await?;
    }
}

fn note_unusable(primary: &Endpoint, set: &ReplicaSet) {
    if set.skipped > 0 {
        warn!(%primary, skipped = set.skipped, "ignored unparseable replica entries");
    }
    if set.syncing > 0 {
        debug!(%primary, syncing = set.syncing, "replicas still in initial sync");
    }
}
