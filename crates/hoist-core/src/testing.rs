//! In-memory cluster for unit tests.
//!
//! Speaks the same command surface as a real node at the frame level, so
//! node handles exercise their real reply parsing. Replication is modelled
//! just enough for promotion: replicas follow a primary, lagging offsets
//! catch up a configurable step per primary INFO poll, and PUBLISH traffic
//! is relayed down the replication tree.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use bytes::Bytes;
use hoist_protocol::Frame;
use tokio::sync::mpsc;

use crate::connection::ConnectionError;
use crate::endpoint::Endpoint;
use crate::node::NodeHandle;
use crate::session::{Connector, Session, Subscription};

#[derive(Clone, Default)]
pub(crate) struct FakeCluster {
    state: Arc<Mutex<State>>,
}

struct State {
    nodes: BTreeMap<Endpoint, FakeNode>,
    log: Vec<(Endpoint, String)>,
    catch_up_step: i64,
    next_sub_id: u64,
}

impl Default for State {
    fn default() -> Self {
        Self {
            nodes: BTreeMap::new(),
            log: Vec::new(),
            catch_up_step: i64::MAX,
            next_sub_id: 0,
        }
    }
}

struct FakeNode {
    primary: Option<Endpoint>,
    offset: i64,
    config: HashMap<String, String>,
    down: bool,
    link_blocked: bool,
    hung: bool,
    failing: Vec<String>,
    connects: usize,
    info_queries: usize,
    rewrites: usize,
    subscribers: Vec<(u64, String, mpsc::UnboundedSender<String>)>,
}

impl FakeNode {
    fn new(primary: Option<Endpoint>, offset: i64) -> Self {
        let mut config = HashMap::new();
        config.insert("min-replicas-to-write".to_string(), "0".to_string());
        Self {
            primary,
            offset,
            config,
            down: false,
            link_blocked: false,
            hung: false,
            failing: Vec::new(),
            connects: 0,
            info_queries: 0,
            rewrites: 0,
            subscribers: Vec::new(),
        }
    }
}

impl State {
    fn node(&mut self, ep: &Endpoint) -> &mut FakeNode {
        self.nodes
            .get_mut(ep)
            .unwrap_or_else(|| panic!("unknown fake node {ep}"))
    }

    fn online_replicas(&self, primary: &Endpoint) -> Vec<Endpoint> {
        self.nodes
            .iter()
            .filter(|(_, n)| n.primary.as_ref() == Some(primary) && !n.link_blocked)
            .map(|(ep, _)| ep.clone())
            .collect()
    }

    fn render_info(&self, ep: &Endpoint) -> String {
        let node = &self.nodes[ep];
        let mut out = String::from("# Replication\r\n");
        match &node.primary {
            None => {
                let replicas = self.online_replicas(ep);
                out.push_str("role:master\r\n");
                out.push_str(&format!("connected_slaves:{}\r\n", replicas.len()));
                for (i, r) in replicas.iter().enumerate() {
                    out.push_str(&format!(
                        "slave{i}:ip={},port={},state=online,offset={},lag=0\r\n",
                        r.host, r.port, self.nodes[r].offset
                    ));
                }
                out.push_str(&format!("master_repl_offset:{}\r\n", node.offset));
            }
            Some(p) => {
                let link = if node.link_blocked { "down" } else { "up" };
                out.push_str("role:slave\r\n");
                out.push_str(&format!("master_host:{}\r\nmaster_port:{}\r\n", p.host, p.port));
                out.push_str(&format!("master_link_status:{link}\r\n"));
                out.push_str(&format!("slave_repl_offset:{}\r\n", node.offset));
                out.push_str("connected_slaves:0\r\n");
            }
        }
        out
    }

    fn catch_up(&mut self, primary: &Endpoint) {
        let target = self.nodes[primary].offset;
        let step = self.catch_up_step;
        for r in self.online_replicas(primary) {
            let node = self.node(&r);
            if node.offset < target {
                node.offset = node.offset.saturating_add(step).min(target);
            }
        }
    }

    fn publish(&mut self, ep: &Endpoint, channel: &str, msg: &str) -> i64 {
        let mut delivered = 0;
        let mut seen = HashSet::new();
        let mut pending = vec![ep.clone()];
        while let Some(current) = pending.pop() {
            if !seen.insert(current.clone()) {
                continue;
            }
            for (_, ch, tx) in &self.nodes[&current].subscribers {
                if ch == channel && tx.send(msg.to_owned()).is_ok() && current == *ep {
                    delivered += 1;
                }
            }
            pending.extend(self.online_replicas(&current));
        }
        delivered
    }

    fn execute(&mut self, ep: &Endpoint, args: &[&str]) -> Frame {
        let upper: Vec<String> = args.iter().map(|a| a.to_ascii_uppercase()).collect();
        let upper: Vec<&str> = upper.iter().map(String::as_str).collect();
        match upper.as_slice() {
            ["INFO", ..] => {
                self.node(ep).info_queries += 1;
                let text = self.render_info(ep);
                if self.nodes[ep].primary.is_none() {
                    self.catch_up(ep);
                }
                bulk(&text)
            }
            ["CONFIG", "GET", _] => match self.node(ep).config.get(args[2]) {
                Some(v) => Frame::Array(vec![bulk(args[2]), bulk(v)]),
                None => Frame::Array(vec![]),
            },
            ["CONFIG", "SET", _, _] => {
                let node = self.node(ep);
                match node.config.get_mut(args[2]) {
                    Some(v) => {
                        *v = args[3].to_owned();
                        ok()
                    }
                    None => Frame::Error(format!("ERR Unsupported CONFIG parameter: {}", args[2])),
                }
            }
            ["CONFIG", "REWRITE"] => {
                self.node(ep).rewrites += 1;
                ok()
            }
            ["SLAVEOF", "NO", "ONE"] | ["REPLICAOF", "NO", "ONE"] => {
                self.node(ep).primary = None;
                ok()
            }
            ["SLAVEOF", _, _] | ["REPLICAOF", _, _] => {
                let Ok(port) = args[2].parse() else {
                    return Frame::Error("ERR Invalid master port".into());
                };
                let target = Endpoint::new(args[1], port);
                let synced = self.nodes.get(&target).map(|n| n.offset);
                let node = self.node(ep);
                node.primary = Some(target);
                if let (Some(offset), false) = (synced, node.link_blocked) {
                    node.offset = offset;
                }
                ok()
            }
            ["PUBLISH", _, _] => Frame::Integer(self.publish(ep, args[1], args[2])),
            _ => Frame::Error(format!("ERR unknown command '{}'", args[0])),
        }
    }
}

fn bulk(s: &str) -> Frame {
    Frame::Bulk(Bytes::copy_from_slice(s.as_bytes()))
}

fn ok() -> Frame {
    Frame::Simple("OK".into())
}

impl FakeCluster {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap()
    }

    pub(crate) fn add_primary(&self, host: &str, offset: i64) -> Endpoint {
        let ep = Endpoint::new(host, 6379);
        self.lock().nodes.insert(ep.clone(), FakeNode::new(None, offset));
        ep
    }

    pub(crate) fn add_replica(&self, host: &str, primary: &Endpoint, offset: i64) -> Endpoint {
        let ep = Endpoint::new(host, 6379);
        self.lock()
            .nodes
            .insert(ep.clone(), FakeNode::new(Some(primary.clone()), offset));
        ep
    }

    pub(crate) fn handle(&self, ep: &Endpoint) -> NodeHandle<FakeConnector> {
        NodeHandle::new(ep.clone(), Arc::new(self.connector()))
    }

    pub(crate) fn connector(&self) -> FakeConnector {
        FakeConnector {
            cluster: self.clone(),
        }
    }

    pub(crate) fn set_catch_up_step(&self, step: i64) {
        self.lock().catch_up_step = step;
    }

    pub(crate) fn set_down(&self, ep: &Endpoint, down: bool) {
        self.lock().node(ep).down = down;
    }

    /// Keeps `ep`'s replication link from coming up after re-parenting.
    pub(crate) fn set_link_blocked(&self, ep: &Endpoint, blocked: bool) {
        self.lock().node(ep).link_blocked = blocked;
    }

    /// Accepts connections on `ep` but never answers a command, like a
    /// stopped process or a blackholed link.
    pub(crate) fn set_hung(&self, ep: &Endpoint, hung: bool) {
        self.lock().node(ep).hung = hung;
    }

    /// Makes every command starting with `prefix` fail with an error reply.
    pub(crate) fn fail_command(&self, ep: &Endpoint, prefix: &str) {
        self.lock().node(ep).failing.push(prefix.to_owned());
    }

    pub(crate) fn set_config(&self, ep: &Endpoint, param: &str, value: &str) {
        self.lock()
            .node(ep)
            .config
            .insert(param.to_owned(), value.to_owned());
    }

    pub(crate) fn remove_config(&self, ep: &Endpoint, param: &str) {
        self.lock().node(ep).config.remove(param);
    }

    pub(crate) fn config(&self, ep: &Endpoint, param: &str) -> Option<String> {
        self.lock().node(ep).config.get(param).cloned()
    }

    /// Whether a client write would satisfy the node's replica threshold.
    pub(crate) fn accepts_writes(&self, ep: &Endpoint) -> bool {
        let mut state = self.lock();
        let replicas = state.online_replicas(ep).len();
        let node = state.node(ep);
        let threshold = node
            .config
            .get("min-replicas-to-write")
            .or_else(|| node.config.get("min-slaves-to-write"))
            .and_then(|v| v.parse::<usize>().ok())
            .unwrap_or(0);
        replicas >= threshold
    }

    pub(crate) fn primary_of(&self, ep: &Endpoint) -> Option<Endpoint> {
        self.lock().node(ep).primary.clone()
    }

    pub(crate) fn offset(&self, ep: &Endpoint) -> i64 {
        self.lock().node(ep).offset
    }

    pub(crate) fn connects(&self, ep: &Endpoint) -> usize {
        self.lock().node(ep).connects
    }

    pub(crate) fn info_queries(&self, ep: &Endpoint) -> usize {
        self.lock().node(ep).info_queries
    }

    pub(crate) fn rewrites(&self, ep: &Endpoint) -> usize {
        self.lock().node(ep).rewrites
    }

    pub(crate) fn subscribers(&self, ep: &Endpoint, channel: &str) -> usize {
        self.lock()
            .node(ep)
            .subscribers
            .iter()
            .filter(|(_, ch, _)| ch == channel)
            .count()
    }

    /// Severs every subscription on `ep`, as a dropped connection would.
    pub(crate) fn drop_subscribers(&self, ep: &Endpoint) {
        self.lock().node(ep).subscribers.clear();
    }

    /// Commands sent to `ep`, in order.
    pub(crate) fn commands(&self, ep: &Endpoint) -> Vec<String> {
        self.lock()
            .log
            .iter()
            .filter(|(e, _)| e == ep)
            .map(|(_, c)| c.clone())
            .collect()
    }

    /// Every command sent to any node, in order, excluding reads.
    pub(crate) fn mutations(&self) -> Vec<(Endpoint, String)> {
        self.lock()
            .log
            .iter()
            .filter(|(_, c)| !c.starts_with("INFO") && !c.starts_with("CONFIG GET"))
            .cloned()
            .collect()
    }
}

pub(crate) struct FakeConnector {
    cluster: FakeCluster,
}

#[async_trait]
impl Connector for FakeConnector {
    type Session = FakeSession;

    async fn connect(&self, endpoint: &Endpoint) -> Result<FakeSession, ConnectionError> {
        let mut state = self.cluster.lock();
        let node = state.node(endpoint);
        if node.down {
            return Err(ConnectionError::Io(std::io::Error::new(
                std::io::ErrorKind::ConnectionRefused,
                "connection refused",
            )));
        }
        node.connects += 1;
        Ok(FakeSession {
            cluster: self.cluster.clone(),
            endpoint: endpoint.clone(),
        })
    }
}

pub(crate) struct FakeSession {
    cluster: FakeCluster,
    endpoint: Endpoint,
}

impl FakeSession {
    fn hung(&self) -> bool {
        self.cluster.lock().node(&self.endpoint).hung
    }
}

#[async_trait]
impl Session for FakeSession {
    async fn call(&mut self, args: &[&str]) -> Result<Frame, ConnectionError> {
        if self.hung() {
            return std::future::pending().await;
        }
        let mut state = self.cluster.lock();
        let command = args.join(" ");
        state.log.push((self.endpoint.clone(), command.clone()));
        let node = state.node(&self.endpoint);
        if node.down {
            return Err(ConnectionError::Disconnected);
        }
        if node.failing.iter().any(|p| command.starts_with(p.as_str())) {
            return Ok(Frame::Error(format!("ERR injected failure for {command}")));
        }
        Ok(state.execute(&self.endpoint, args))
    }

    async fn subscribe(&mut self, channel: &str) -> Result<Box<dyn Subscription>, ConnectionError> {
        if self.hung() {
            return std::future::pending().await;
        }
        let mut state = self.cluster.lock();
        let id = state.next_sub_id;
        state.next_sub_id += 1;
        let node = state.node(&self.endpoint);
        if node.down {
            return Err(ConnectionError::Disconnected);
        }
        let (tx, rx) = mpsc::unbounded_channel();
        node.subscribers.push((id, channel.to_owned(), tx));
        Ok(Box::new(FakeSubscription {
            cluster: self.cluster.clone(),
            endpoint: self.endpoint.clone(),
            id,
            rx,
        }))
    }
}

struct FakeSubscription {
    cluster: FakeCluster,
    endpoint: Endpoint,
    id: u64,
    rx: mpsc::UnboundedReceiver<String>,
}

#[async_trait]
impl Subscription for FakeSubscription {
    async fn next_message(&mut self) -> Result<String, ConnectionError> {
        self.rx.recv().await.ok_or(ConnectionError::Disconnected)
    }

    async fn unsubscribe(self: Box<Self>) -> Result<(), ConnectionError> {
        let mut state = self.cluster.lock();
        state
            .node(&self.endpoint)
            .subscribers
            .retain(|(id, _, _)| *id != self.id);
        Ok(())
    }
}
