//! hoist-core: promoting a replica to primary across a replicated
//! key-value cluster.
//!
//! A run fences client writes on every member, waits for the current
//! primaries to flush to their replicas, promotes the designated node,
//! re-parents everyone else under it, confirms each attachment, then
//! lifts the fences and asks every node to persist its configuration.
//! [`PromotionOrchestrator`] drives the sequence; the other modules are
//! the pieces it is built from.

pub mod config;
pub mod connection;
pub mod discovery;
pub mod endpoint;
pub mod error;
pub mod fence;
pub mod info;
pub mod monitor;
pub mod node;
pub mod orchestrator;
pub mod rendezvous;
pub mod session;
pub mod wait;

#[cfg(test)]
mod testing;

pub use config::HoistConfig;
pub use connection::{Connection, ConnectionError};
pub use discovery::{plan_from_service, Discovery, SrvDiscovery, StaticDiscovery};
pub use endpoint::{Endpoint, DEFAULT_PORT};
pub use error::{Error, PromotionError, Result};
pub use fence::{FenceToken, WriteFence};
pub use info::{ReplicaInfo, ReplicaSet, ReplicationStatus, Role};
pub use monitor::{wait_for_attached, wait_for_flush, FlushOutcome};
pub use node::NodeHandle;
pub use orchestrator::{
    ConfirmMethod, ConfirmPolicy, PromotionOptions, PromotionOrchestrator, PromotionPlan,
    PromotionReport, PromotionState, Topology,
};
pub use rendezvous::RendezvousChannel;
pub use session::{Connector, RespConnector, Session, Subscription};
pub use wait::WaitOptions;
