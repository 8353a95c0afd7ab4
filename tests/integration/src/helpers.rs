//! Scripted RESP nodes for exercising hoist over real sockets.
//!
//! A [`MockCluster`] runs one TCP listener per node inside the test's
//! runtime. Nodes share one state table, so `SLAVEOF` re-links them and
//! `PUBLISH` on a primary reaches subscribers on its replicas, the way a
//! real replication stream relays it. Replicas are always fully caught up.

use std::collections::{BTreeMap, HashMap};
use std::path::PathBuf;
use std::process::{Command, Output};
use std::sync::{Arc, Mutex};

use bytes::{Bytes, BytesMut};
use hoist_core::Endpoint;
use hoist_protocol::{parse_frame, Frame};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;

pub const HOST: &str = "127.0.0.1";

#[derive(Default)]
struct NodeState {
    primary: Option<u16>,
    offset: i64,
    config: HashMap<String, String>,
    lists: HashMap<String, Vec<String>>,
    rewrites: usize,
    subscribers: Vec<(String, mpsc::UnboundedSender<Frame>)>,
}

#[derive(Default)]
struct ClusterState {
    nodes: BTreeMap<u16, NodeState>,
    password: Option<String>,
}

impl ClusterState {
    fn replicas_of(&self, port: u16) -> Vec<u16> {
        self.nodes
            .iter()
            .filter(|(_, n)| n.primary == Some(port))
            .map(|(p, _)| *p)
            .collect()
    }

    fn info(&self, port: u16) -> String {
        let node = &self.nodes[&port];
        let mut out = String::from("# Replication\r\n");
        match node.primary {
            None => {
                let replicas = self.replicas_of(port);
                out.push_str("role:master\r\n");
                out.push_str(&format!("connected_slaves:{}\r\n", replicas.len()));
                for (i, r) in replicas.iter().enumerate() {
                    out.push_str(&format!(
                        "slave{i}:ip={HOST},port={r},state=online,offset={},lag=0\r\n",
                        self.nodes[r].offset
                    ));
                }
                out.push_str(&format!("master_repl_offset:{}\r\n", node.offset));
            }
            Some(p) => {
                out.push_str("role:slave\r\n");
                out.push_str(&format!("master_host:{HOST}\r\nmaster_port:{p}\r\n"));
                out.push_str("master_link_status:up\r\n");
                out.push_str(&format!("slave_repl_offset:{}\r\n", node.offset));
            }
        }
        out
    }

    /// Applies a write on `port` and everything replicating from it.
    fn replicate(&mut self, port: u16, apply: &dyn Fn(&mut NodeState)) {
        let mut pending = vec![port];
        while let Some(p) = pending.pop() {
            if let Some(node) = self.nodes.get_mut(&p) {
                apply(node);
                node.offset += 1;
            }
            pending.extend(self.replicas_of(p));
        }
    }

    fn publish(&mut self, port: u16, channel: &str, msg: &str) -> i64 {
        let mut local = 0;
        let mut pending = vec![port];
        while let Some(p) = pending.pop() {
            let Some(node) = self.nodes.get_mut(&p) else {
                continue;
            };
            node.subscribers.retain(|(_, tx)| !tx.is_closed());
            for (ch, tx) in &node.subscribers {
                if ch == channel && tx.send(message(channel, msg)).is_ok() && p == port {
                    local += 1;
                }
            }
            pending.extend(self.replicas_of(p));
        }
        local
    }

    fn execute(&mut self, port: u16, args: &[String]) -> Frame {
        let upper: Vec<String> = args.iter().map(|a| a.to_ascii_uppercase()).collect();
        let upper: Vec<&str> = upper.iter().map(String::as_str).collect();
        match upper.as_slice() {
            ["PING"] => Frame::Simple("PONG".into()),
            ["INFO", ..] => bulk(&self.info(port)),
            ["CONFIG", "GET", _] => match self.node(port).config.get(&args[2]) {
                Some(v) => Frame::Array(vec![bulk(&args[2]), bulk(v)]),
                None => Frame::Array(vec![]),
            },
            ["CONFIG", "SET", _, _] => {
                let node = self.node(port);
                if !node.config.contains_key(&args[2]) {
                    return Frame::Error(format!("ERR Unknown option '{}'", args[2]));
                }
                node.config.insert(args[2].clone(), args[3].clone());
                ok()
            }
            ["CONFIG", "REWRITE"] => {
                self.node(port).rewrites += 1;
                ok()
            }
            ["SLAVEOF", "NO", "ONE"] | ["REPLICAOF", "NO", "ONE"] => {
                self.node(port).primary = None;
                ok()
            }
            ["SLAVEOF", _, _] | ["REPLICAOF", _, _] => {
                let Ok(target) = args[2].parse::<u16>() else {
                    return Frame::Error("ERR Invalid master port".into());
                };
                let Some(source) = self.nodes.get(&target) else {
                    return Frame::Error("ERR no such node".into());
                };
                let (offset, lists) = (source.offset, source.lists.clone());
                let node = self.node(port);
                node.primary = Some(target);
                node.offset = offset;
                node.lists = lists;
                ok()
            }
            ["PUBLISH", _, _] => Frame::Integer(self.publish(port, &args[1], &args[2])),
            ["RPUSH", _, ..] => {
                if self.node(port).primary.is_some() {
                    return Frame::Error("READONLY replica is read-only".into());
                }
                let key = args[1].clone();
                let values = args[2..].to_vec();
                self.replicate(port, &|n| {
                    n.lists.entry(key.clone()).or_default().extend(values.iter().cloned())
                });
                Frame::Integer(self.node(port).lists[&args[1]].len() as i64)
            }
            ["LRANGE", _, "0", "-1"] => Frame::Array(
                self.node(port)
                    .lists
                    .get(&args[1])
                    .map(|l| l.iter().map(|v| bulk(v)).collect())
                    .unwrap_or_default(),
            ),
            ["DEL", _] => {
                let key = args[1].clone();
                let existed = self.node(port).lists.contains_key(&key);
                self.replicate(port, &|n| {
                    n.lists.remove(&key);
                });
                Frame::Integer(existed as i64)
            }
            _ => Frame::Error(format!("ERR unknown command '{}'", args[0])),
        }
    }

    fn node(&mut self, port: u16) -> &mut NodeState {
        self.nodes.get_mut(&port).expect("known port")
    }
}

fn bulk(s: &str) -> Frame {
    Frame::Bulk(Bytes::copy_from_slice(s.as_bytes()))
}

fn ok() -> Frame {
    Frame::Simple("OK".into())
}

fn message(channel: &str, msg: &str) -> Frame {
    Frame::Array(vec![bulk("message"), bulk(channel), bulk(msg)])
}

/// A set of scripted nodes listening on loopback.
#[derive(Clone, Default)]
pub struct MockCluster {
    state: Arc<Mutex<ClusterState>>,
}

impl MockCluster {
    pub fn new() -> Self {
        Self::default()
    }

    /// Requires `AUTH password` on every connection.
    pub fn require_password(&self, password: &str) {
        self.state.lock().unwrap().password = Some(password.to_owned());
    }

    /// Starts a primary and returns its endpoint.
    pub async fn primary(&self, offset: i64) -> Endpoint {
        self.spawn(None, offset).await
    }

    /// Starts a replica of `primary`, caught up to it.
    pub async fn replica(&self, primary: &Endpoint) -> Endpoint {
        let offset = self.offset(primary);
        self.spawn(Some(primary.port), offset).await
    }

    async fn spawn(&self, primary: Option<u16>, offset: i64) -> Endpoint {
        let listener = TcpListener::bind((HOST, 0)).await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let mut config = HashMap::new();
        config.insert("min-replicas-to-write".to_string(), "0".to_string());
        self.state.lock().unwrap().nodes.insert(
            port,
            NodeState {
                primary,
                offset,
                config,
                ..NodeState::default()
            },
        );

        let cluster = self.clone();
        tokio::spawn(async move {
            while let Ok((stream, _)) = listener.accept().await {
                let cluster = cluster.clone();
                tokio::spawn(async move { cluster.serve(port, stream).await });
            }
        });
        Endpoint::new(HOST, port)
    }

    async fn serve(self, port: u16, mut stream: TcpStream) {
        let mut buf = BytesMut::with_capacity(4096);
        let mut authed = self.state.lock().unwrap().password.is_none();
        let (push_tx, mut push_rx) = mpsc::unbounded_channel::<Frame>();
        let mut subscribed = false;

        loop {
            let args = tokio::select! {
                args = read_command(&mut stream, &mut buf) => match args {
                    Some(args) => args,
                    None => return,
                },
                Some(frame) = push_rx.recv(), if subscribed => {
                    if write_frame(&mut stream, &frame).await.is_err() {
                        return;
                    }
                    continue;
                }
            };
            let Some(name) = args.first().map(|a| a.to_ascii_uppercase()) else {
                continue;
            };

            let reply = match name.as_str() {
                "QUIT" => {
                    let _ = write_frame(&mut stream, &ok()).await;
                    return;
                }
                "AUTH" => {
                    let expected = self.state.lock().unwrap().password.clone();
                    if expected.as_deref() == args.get(1).map(String::as_str) {
                        authed = true;
                        ok()
                    } else {
                        Frame::Error("WRONGPASS invalid password".into())
                    }
                }
                _ if !authed => Frame::Error("NOAUTH Authentication required.".into()),
                "SUBSCRIBE" if args.len() == 2 => {
                    subscribed = true;
                    self.state
                        .lock()
                        .unwrap()
                        .node(port)
                        .subscribers
                        .push((args[1].clone(), push_tx.clone()));
                    Frame::Array(vec![bulk("subscribe"), bulk(&args[1]), Frame::Integer(1)])
                }
                "UNSUBSCRIBE" if args.len() == 2 => {
                    subscribed = false;
                    self.state
                        .lock()
                        .unwrap()
                        .node(port)
                        .subscribers
                        .retain(|(ch, tx)| !(ch == &args[1] && tx.same_channel(&push_tx)));
                    Frame::Array(vec![bulk("unsubscribe"), bulk(&args[1]), Frame::Integer(0)])
                }
                _ => self.state.lock().unwrap().execute(port, &args),
            };
            if write_frame(&mut stream, &reply).await.is_err() {
                return;
            }
        }
    }

    pub fn primary_of(&self, ep: &Endpoint) -> Option<u16> {
        self.state.lock().unwrap().node(ep.port).primary
    }

    pub fn offset(&self, ep: &Endpoint) -> i64 {
        self.state.lock().unwrap().node(ep.port).offset
    }

    pub fn config(&self, ep: &Endpoint, param: &str) -> Option<String> {
        self.state
            .lock()
            .unwrap()
            .node(ep.port)
            .config
            .get(param)
            .cloned()
    }

    pub fn rewrites(&self, ep: &Endpoint) -> usize {
        self.state.lock().unwrap().node(ep.port).rewrites
    }

    pub fn list(&self, ep: &Endpoint, key: &str) -> Vec<String> {
        self.state
            .lock()
            .unwrap()
            .node(ep.port)
            .lists
            .get(key)
            .cloned()
            .unwrap_or_default()
    }
}

async fn read_command(stream: &mut TcpStream, buf: &mut BytesMut) -> Option<Vec<String>> {
    loop {
        match parse_frame(buf) {
            Ok(Some((frame, consumed))) => {
                let _ = buf.split_to(consumed);
                let Frame::Array(parts) = frame else {
                    return Some(Vec::new());
                };
                return Some(
                    parts
                        .iter()
                        .filter_map(|p| p.as_text().map(str::to_owned))
                        .collect(),
                );
            }
            Ok(None) => {
                if stream.read_buf(buf).await.ok()? == 0 {
                    return None;
                }
            }
            Err(_) => return None,
        }
    }
}

async fn write_frame(stream: &mut TcpStream, frame: &Frame) -> std::io::Result<()> {
    let mut out = BytesMut::new();
    frame.serialize(&mut out);
    stream.write_all(&out).await
}

/// Runs the `hoist` binary to completion with tracing kept quiet.
pub async fn run_hoist(args: &[&str]) -> Output {
    let binary = hoist_binary();
    let args: Vec<String> = args.iter().map(|a| a.to_string()).collect();
    tokio::task::spawn_blocking(move || {
        Command::new(&binary)
            .args(&args)
            .env("RUST_LOG", "error")
            .env_remove("HOIST_CONFIG")
            .output()
            .unwrap_or_else(|e| panic!("failed to run {}: {e}", binary.display()))
    })
    .await
    .unwrap()
}

/// Locates the hoist binary next to the test binary's target directory.
fn hoist_binary() -> PathBuf {
    let mut path = std::env::current_exe().unwrap();
    // test binary is in target/debug/deps/; the binary is in target/debug/
    path.pop();
    if path.ends_with("deps") {
        path.pop();
    }
    path.push("hoist");
    assert!(
        path.exists(),
        "hoist binary not found. run `cargo build` first.\nlooked at: {}",
        path.display()
    );
    path
}
