//! Write fencing through the minimum-replica acknowledgement threshold.
//!
//! Raising `min-replicas-to-write` above any plausible replica count makes
//! the node refuse every client write while leaving connections open. The
//! original value travels in a [`FenceToken`], and only that token can lift
//! the fence.

use tracing::{info, warn};

use crate::endpoint::Endpoint;
use crate::error::{Error, Result};
use crate::node::NodeHandle;
use crate::session::Connector;

/// Threshold no real deployment reaches.
pub const DEFAULT_FENCE_THRESHOLD: u64 = 1_000_000;

const MIN_REPLICAS_PARAM: &str = "min-replicas-to-write";
/// Name used by servers that predate the replica terminology.
const LEGACY_MIN_REPLICAS_PARAM: &str = "min-slaves-to-write";

/// Proof that a node was fenced, carrying what is needed to undo it.
#[must_use = "a fenced node stays fenced until its token is passed to unfence"]
#[derive(Debug)]
pub struct FenceToken {
    endpoint: Endpoint,
    param: &'static str,
    original: String,
}

impl FenceToken {
    pub fn endpoint(&self) -> &Endpoint {
        &self.endpoint
    }

    /// The threshold in force before the fence went up.
    pub fn original(&self) -> &str {
        &self.original
    }
}

#[derive(Debug, Clone, Copy)]
pub struct WriteFence {
    threshold: u64,
}

impl Default for WriteFence {
    fn default() -> Self {
        Self::new(DEFAULT_FENCE_THRESHOLD)
    }
}

impl WriteFence {
    pub fn new(threshold: u64) -> Self {
        Self { threshold }
    }

    /// Records the node's current threshold, then raises it so every client
    /// write is rejected.
    pub async fn fence<C: Connector>(&self, node: &mut NodeHandle<C>) -> Result<FenceToken> {
        let (param, original) = match node.config_get(MIN_REPLICAS_PARAM).await? {
            Some(v) => (MIN_REPLICAS_PARAM, v),
            None => match node.config_get(LEGACY_MIN_REPLICAS_PARAM).await? {
                Some(v) => (LEGACY_MIN_REPLICAS_PARAM, v),
                None => {
                    return Err(Error::protocol(
                        node.endpoint(),
                        "node exposes no min-replicas-to-write setting",
                    ))
                }
            },
        };

        if original == self.threshold.to_string() {
            warn!(
                endpoint = %node.endpoint(),
                "threshold already at the fence value, probably left by an interrupted run; \
                 unfencing will keep writes blocked"
            );
        }

        node.config_set(param, &self.threshold.to_string()).await?;
        info!(endpoint = %node.endpoint(), %original, "fenced client writes");

        Ok(FenceToken {
            endpoint: node.endpoint().clone(),
            param,
            original,
        })
    }

    /// Restores the threshold recorded in `token`.
    pub async fn unfence<C: Connector>(
        &self,
        node: &mut NodeHandle<C>,
        token: FenceToken,
    ) -> Result<()> {
        if token.endpoint != *node.endpoint() {
            return Err(Error::Precondition(format!(
                "fence token for {} presented to {}",
                token.endpoint,
                node.endpoint()
            )));
        }
        node.config_set(token.param, &token.original).await?;
        info!(endpoint = %node.endpoint(), original = %token.original, "unfenced client writes");
        Ok(())
    }
}
