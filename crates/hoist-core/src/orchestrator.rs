//! Primary promotion: fence, flush, promote, re-parent, confirm, unfence.
//!
//! Steps run strictly in sequence and re-parenting handles one node at a
//! time. Node errors abort the run except while confirming attachment
//! (subject to [`ConfirmPolicy`]) and while unfencing or persisting config,
//! where each node's failure is recorded and the remaining nodes are still
//! processed. Nothing is ever rolled back.

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::endpoint::Endpoint;
use crate::error::{Error, PromotionError, Result};
use crate::fence::{FenceToken, WriteFence, DEFAULT_FENCE_THRESHOLD};
use crate::info::Role;
use crate::monitor::{wait_for_attached, wait_for_flush};
use crate::node::NodeHandle;
use crate::rendezvous::{RendezvousChannel, DEFAULT_CHANNEL};
use crate::session::Connector;
use crate::wait::WaitOptions;

/// Where a promotion run is, or where it stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PromotionState {
    Discover,
    FenceAll,
    FlushOldPrimaries,
    Promote,
    Reparent,
    ConfirmAttach,
    UnfenceAll,
    PersistConfig,
    Done,
    Failed,
}

impl fmt::Display for PromotionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            PromotionState::Discover => "discover",
            PromotionState::FenceAll => "fence-all",
            PromotionState::FlushOldPrimaries => "flush-old-primaries",
            PromotionState::Promote => "promote",
            PromotionState::Reparent => "reparent",
            PromotionState::ConfirmAttach => "confirm-attach",
            PromotionState::UnfenceAll => "unfence-all",
            PromotionState::PersistConfig => "persist-config",
            PromotionState::Done => "done",
            PromotionState::Failed => "failed",
        };
        f.write_str(name)
    }
}

/// How attachment of a re-parented node is confirmed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ConfirmMethod {
    /// Pub/sub handshake relayed through the replication link.
    #[default]
    Rendezvous,
    /// Poll the new primary's replica list for the node.
    ReplicaList,
}

impl FromStr for ConfirmMethod {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, String> {
        match s.to_ascii_lowercase().as_str() {
            "rendezvous" => Ok(Self::Rendezvous),
            "replica-list" => Ok(Self::ReplicaList),
            _ => Err(format!(
                "unknown confirm method '{s}'. valid options: rendezvous, replica-list"
            )),
        }
    }
}

/// What an unconfirmed attachment means for the run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ConfirmPolicy {
    /// Warn, record the node, and carry on with the rest.
    #[default]
    BestEffort,
    /// Abort the run.
    Strict,
}

impl FromStr for ConfirmPolicy {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, String> {
        match s.to_ascii_lowercase().as_str() {
            "best-effort" => Ok(Self::BestEffort),
            "strict" => Ok(Self::Strict),
            _ => Err(format!(
                "unknown confirm policy '{s}'. valid options: best-effort, strict"
            )),
        }
    }
}

#[derive(Debug, Clone)]
pub struct PromotionOptions {
    pub fence_threshold: u64,
    pub flush: WaitOptions,
    pub confirm: WaitOptions,
    pub confirm_method: ConfirmMethod,
    pub confirm_policy: ConfirmPolicy,
    pub channel: String,
}

impl Default for PromotionOptions {
    fn default() -> Self {
        Self {
            fence_threshold: DEFAULT_FENCE_THRESHOLD,
            flush: WaitOptions::default(),
            confirm: WaitOptions::default(),
            confirm_method: ConfirmMethod::default(),
            confirm_policy: ConfirmPolicy::default(),
            channel: DEFAULT_CHANNEL.to_string(),
        }
    }
}

/// What the operator asked for: these members, with this one on top.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PromotionPlan {
    pub members: Vec<Endpoint>,
    pub designated: Endpoint,
}

impl PromotionPlan {
    pub fn new(members: Vec<Endpoint>, designated: Endpoint) -> Self {
        Self {
            members,
            designated,
        }
    }
}

/// The cluster shape a run works from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Topology {
    /// Every member, designated primary included, in the order given.
    pub all_nodes: Vec<Endpoint>,
    pub designated: Endpoint,
    /// Members that will end up replicating from `designated`.
    pub replicas: Vec<Endpoint>,
    /// Members reporting the primary role when the run started.
    pub current_primaries: Vec<Endpoint>,
}

impl Topology {
    /// Computes the target shape without touching any node.
    ///
    /// Duplicate members are collapsed. The designated primary must be one
    /// of the members.
    pub fn resolve(members: &[Endpoint], designated: &Endpoint) -> Result<Self> {
        let mut all_nodes: Vec<Endpoint> = Vec::with_capacity(members.len());
        for m in members {
            if !all_nodes.contains(m) {
                all_nodes.push(m.clone());
            }
        }
        if !all_nodes.contains(designated) {
            return Err(Error::Topology(designated.clone()));
        }
        let replicas = all_nodes
            .iter()
            .filter(|m| *m != designated)
            .cloned()
            .collect();
        Ok(Self {
            all_nodes,
            designated: designated.clone(),
            replicas,
            current_primaries: Vec::new(),
        })
    }
}

/// What a completed run did.
#[derive(Debug, Clone)]
pub struct PromotionReport {
    pub new_primary: Endpoint,
    pub topology: Topology,
    pub confirmed: Vec<Endpoint>,
    pub unconfirmed: Vec<(Endpoint, String)>,
    pub unfence_failures: Vec<(Endpoint, String)>,
    pub persist_failures: Vec<(Endpoint, String)>,
}

impl PromotionReport {
    /// True when every node attached, was unfenced, and persisted its config.
    pub fn is_clean(&self) -> bool {
        self.unconfirmed.is_empty()
            && self.unfence_failures.is_empty()
            && self.persist_failures.is_empty()
    }
}

/// Receives one human-readable line per promotion step.
pub type ProgressFn = Box<dyn Fn(&str) + Send + Sync>;

pub struct PromotionOrchestrator<C: Connector> {
    connector: Arc<C>,
    opts: PromotionOptions,
    cancel: CancellationToken,
    progress: Option<ProgressFn>,
    state: PromotionState,
}

impl<C: Connector> PromotionOrchestrator<C> {
    pub fn new(connector: Arc<C>, opts: PromotionOptions) -> Self {
        Self {
            connector,
            opts,
            cancel: CancellationToken::new(),
            progress: None,
            state: PromotionState::Discover,
        }
    }

    /// Uses `cancel` to abandon in-flight waits.
    pub fn with_cancellation(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    /// Reports each step to `progress` as it starts.
    pub fn with_progress(mut self, progress: impl Fn(&str) + Send + Sync + 'static) -> Self {
        self.progress = Some(Box::new(progress));
        self
    }

    pub fn state(&self) -> PromotionState {
        self.state
    }

    fn enter(&mut self, next: PromotionState) {
        debug!(from = %self.state, to = %next, "state transition");
        self.state = next;
    }

    fn step(&self, line: String) {
        match &self.progress {
            Some(progress) => {
                debug!("{line}");
                progress(&line);
            }
            None => info!("{line}"),
        }
    }

    fn fail(&mut self, source: Error) -> PromotionError {
        let state = self.state;
        error!(%state, "promotion aborted: {source}");
        self.state = PromotionState::Failed;
        PromotionError { state, source }
    }

    /// Promotes `designated` and re-parents every other member under it.
    pub async fn run(&mut self, plan: &PromotionPlan) -> Result<PromotionReport, PromotionError> {
        let designated = &plan.designated;
        self.state = PromotionState::Discover;
        info!(%designated, members = plan.members.len(), "starting promotion");

        let mut topology =
            Topology::resolve(&plan.members, designated).map_err(|e| self.fail(e))?;
        let mut nodes: Vec<NodeHandle<C>> = topology
            .all_nodes
            .iter()
            .map(|ep| NodeHandle::new(ep.clone(), Arc::clone(&self.connector)))
            .collect();
        let primary_idx = topology
            .all_nodes
            .iter()
            .position(|ep| ep == designated)
            .ok_or_else(|| self.fail(Error::Topology(designated.clone())))?;

        let mut was_primary = vec![false; nodes.len()];
        for (i, node) in nodes.iter_mut().enumerate() {
            let role = node.role().await.map_err(|e| self.fail(e))?;
            self.step(format!("{} is {role}", node.endpoint()));
            if role == Role::Primary {
                was_primary[i] = true;
                topology.current_primaries.push(node.endpoint().clone());
            }
        }

        self.enter(PromotionState::FenceAll);
        let fence = WriteFence::new(self.opts.fence_threshold);
        let mut tokens: Vec<Option<FenceToken>> = Vec::with_capacity(nodes.len());
        for node in nodes.iter_mut() {
            self.step(format!("fencing {}", node.endpoint()));
            match fence.fence(node).await {
                Ok(token) => tokens.push(Some(token)),
                Err(e) => {
                    report_still_fenced(&tokens);
                    return Err(self.fail(e));
                }
            }
        }

        self.enter(PromotionState::FlushOldPrimaries);
        for (i, node) in nodes.iter_mut().enumerate() {
            if !was_primary[i] {
                continue;
            }
            self.step(format!("waiting for {} to flush to its replicas", node.endpoint()));
            if let Err(e) = wait_for_flush(node, &self.opts.flush, &self.cancel).await {
                report_still_fenced(&tokens);
                return Err(self.fail(e));
            }
        }

        self.enter(PromotionState::Promote);
        self.step(format!("making {designated} primary"));
        if let Err(e) = nodes[primary_idx].become_primary().await {
            report_still_fenced(&tokens);
            return Err(self.fail(e));
        }

        let mut confirmed = Vec::new();
        let mut unconfirmed = Vec::new();
        for i in (0..nodes.len()).filter(|&i| i != primary_idx) {
            self.enter(PromotionState::Reparent);
            let (replica, primary) = pair_mut(&mut nodes, i, primary_idx);
            self.step(format!("pointing {} at {}", replica.endpoint(), primary.endpoint()));
            if let Err(e) = replica.become_replica_of(primary.endpoint()).await {
                report_still_fenced(&tokens);
                return Err(self.fail(e));
            }

            self.enter(PromotionState::ConfirmAttach);
            match self.confirm_attach(replica, primary).await {
                Ok(()) => confirmed.push(replica.endpoint().clone()),
                Err(e @ Error::Cancelled(_)) => {
                    report_still_fenced(&tokens);
                    return Err(self.fail(e));
                }
                Err(e) if self.opts.confirm_policy == ConfirmPolicy::Strict => {
                    report_still_fenced(&tokens);
                    return Err(self.fail(e));
                }
                Err(e) => {
                    warn!(replica = %replica.endpoint(), "attachment not confirmed, continuing: {e}");
                    unconfirmed.push((replica.endpoint().clone(), e.to_string()));
                }
            }
        }

        self.enter(PromotionState::UnfenceAll);
        let mut unfence_failures = Vec::new();
        for (node, token) in nodes.iter_mut().zip(tokens) {
            let Some(token) = token else { continue };
            self.step(format!("unfencing {}", node.endpoint()));
            if let Err(e) = fence.unfence(node, token).await {
                error!(endpoint = %node.endpoint(), "unfence failed: {e}");
                unfence_failures.push((node.endpoint().clone(), e.to_string()));
            }
        }

        self.enter(PromotionState::PersistConfig);
        let mut persist_failures = Vec::new();
        for node in nodes.iter_mut() {
            self.step(format!("rewriting config on {}", node.endpoint()));
            if let Err(e) = node.rewrite_config().await {
                warn!(endpoint = %node.endpoint(), "config rewrite failed: {e}");
                persist_failures.push((node.endpoint().clone(), e.to_string()));
            }
        }

        self.enter(PromotionState::Done);
        Ok(PromotionReport {
            new_primary: designated.clone(),
            topology,
            confirmed,
            unconfirmed,
            unfence_failures,
            persist_failures,
        })
    }

    async fn confirm_attach(
        &self,
        replica: &mut NodeHandle<C>,
        primary: &mut NodeHandle<C>,
    ) -> Result<()> {
        match self.opts.confirm_method {
            ConfirmMethod::Rendezvous => {
                RendezvousChannel::new(self.opts.channel.clone(), self.opts.confirm)
                    .confirm(replica, primary, &self.cancel)
                    .await
            }
            ConfirmMethod::ReplicaList => {
                let endpoint = replica.endpoint().clone();
                wait_for_attached(primary, &endpoint, &self.opts.confirm, &self.cancel).await?;
                info!(replica = %endpoint, primary = %primary.endpoint(), "attach confirmed");
                Ok(())
            }
        }
    }
}

/// Borrows two distinct handles mutably. `a` and `b` must differ; the
/// reparent loop filters out the primary's index before calling.
fn pair_mut<T>(items: &mut [T], a: usize, b: usize) -> (&mut T, &mut T) {
    debug_assert_ne!(a, b, "pair_mut needs distinct indices");
    if a < b {
        let (left, right) = items.split_at_mut(b);
        (&mut left[a], &mut right[0])
    } else {
        let (left, right) = items.split_at_mut(a);
        (&mut right[0], &mut left[b])
    }
}

fn report_still_fenced(tokens: &[Option<FenceToken>]) {
    let fenced: Vec<String> = tokens
        .iter()
        .flatten()
        .map(|t| format!("{} (restore {})", t.endpoint(), t.original()))
        .collect();
    if !fenced.is_empty() {
        error!(
            nodes = %fenced.join(", "),
            "nodes remain fenced; restore min-replicas-to-write by hand"
        );
    }
}
