//! Error taxonomy for promotion runs.

use std::time::Duration;

use crate::connection::ConnectionError;
use crate::endpoint::Endpoint;
use crate::orchestrator::PromotionState;

/// Errors raised by node operations, discovery, and the orchestrator.
///
/// Node-level `Connection` and `Protocol` errors are never retried by the
/// component that raises them; the orchestrator decides what they mean
/// for the run.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// The node's session could not be established or dropped mid-call.
    #[error("{endpoint}: {source}")]
    Connection {
        endpoint: Endpoint,
        #[source]
        source: ConnectionError,
    },

    /// The node answered with an error or a reply of unexpected shape.
    #[error("{endpoint}: unexpected reply: {detail}")]
    Protocol { endpoint: Endpoint, detail: String },

    /// An operation was invoked out of order or on the wrong node.
    #[error("precondition failed: {0}")]
    Precondition(String),

    /// A service name resolved to no members.
    #[error("could not resolve service '{0}'")]
    Discovery(String),

    /// The DNS resolver could not be configured.
    #[error("resolver setup failed: {0}")]
    Resolver(String),

    /// The designated primary is not among the members.
    #[error("designated primary {0} is not among the cluster members")]
    Topology(Endpoint),

    /// A bounded wait ran past its deadline.
    #[error("{operation} timed out after {after:?}")]
    Timeout {
        operation: &'static str,
        after: Duration,
    },

    /// The run was cancelled while waiting.
    #[error("{0} cancelled")]
    Cancelled(&'static str),
}

impl Error {
    pub(crate) fn protocol(endpoint: &Endpoint, detail: impl Into<String>) -> Self {
        Error::Protocol {
            endpoint: endpoint.clone(),
            detail: detail.into(),
        }
    }

    pub(crate) fn connection(endpoint: &Endpoint, source: ConnectionError) -> Self {
        Error::Connection {
            endpoint: endpoint.clone(),
            source,
        }
    }
}

/// A promotion run that stopped, and the state it stopped in.
///
/// Nothing is rolled back: whatever the run did before `state` is still in
/// effect on the cluster.
#[derive(Debug, thiserror::Error)]
#[error("promotion failed during {state}: {source}")]
pub struct PromotionError {
    pub state: PromotionState,
    #[source]
    pub source: Error,
}

pub type Result<T, E = Error> = std::result::Result<T, E>;
