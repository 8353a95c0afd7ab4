//! Tolerant parsing of a node's INFO report.
//!
//! INFO is free text: `# Section` headers followed by `key:value` lines.
//! Only the replication fields matter here. Replica descriptors that don't
//! have the expected `ip=..,port=..,state=..,offset=..` shape are counted
//! and skipped rather than failing the whole query.

use std::collections::HashMap;
use std::fmt;

use crate::endpoint::Endpoint;

/// Replication role reported by a node.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Primary,
    Replica,
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Role::Primary => f.write_str("primary"),
            Role::Replica => f.write_str("replica"),
        }
    }
}

/// A replica as seen by its primary at one instant.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReplicaInfo {
    pub endpoint: Endpoint,
    pub offset: i64,
}

/// The replicas a primary reports as online.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReplicaSet {
    pub replicas: Vec<ReplicaInfo>,
    /// Well-formed descriptors whose state isn't `online` (still syncing).
    pub syncing: usize,
    /// Descriptors that didn't parse.
    pub skipped: usize,
}

impl ReplicaSet {
    pub fn is_empty(&self) -> bool {
        self.replicas.is_empty()
    }

    pub fn contains(&self, endpoint: &Endpoint) -> bool {
        self.replicas.iter().any(|r| &r.endpoint == endpoint)
    }
}

/// Key-value view of an INFO report.
#[derive(Debug, Clone, Default)]
pub struct InfoReport {
    fields: HashMap<String, String>,
}

impl InfoReport {
    pub fn parse(text: &str) -> Self {
        let fields = text
            .lines()
            .map(str::trim)
            .filter(|line| !line.is_empty() && !line.starts_with('#'))
            .filter_map(|line| line.split_once(':'))
            .map(|(k, v)| (k.to_owned(), v.to_owned()))
            .collect();
        Self { fields }
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.fields.get(key).map(String::as_str)
    }

    /// Collects `slaveN` / `replicaN` descriptors in index order.
    fn replica_descriptors(&self) -> Vec<&str> {
        let mut indexed: Vec<(u32, &str)> = self
            .fields
            .iter()
            .filter_map(|(k, v)| {
                let idx = k
                    .strip_prefix("slave")
                    .or_else(|| k.strip_prefix("replica"))?;
                Some((idx.parse().ok()?, v.as_str()))
            })
            .collect();
        indexed.sort_by_key(|(idx, _)| *idx);
        indexed.into_iter().map(|(_, v)| v).collect()
    }
}

/// Replication state derived from a single INFO snapshot.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReplicationStatus {
    pub role: Role,
    /// Write offset on a primary, last-applied offset on a replica.
    pub offset: i64,
    /// Online replicas (always empty on a replica).
    pub replicas: ReplicaSet,
    /// The configured primary, when this node is a replica.
    pub primary: Option<Endpoint>,
    /// Whether a replica's link to its primary is up.
    pub link_up: bool,
}

impl ReplicationStatus {
    /// Derives replication state from an INFO report. Fails only when the
    /// role or offset is missing or unrecognised.
    pub fn from_info(info: &InfoReport) -> Result<Self, String> {
        let role = match info.get("role") {
            Some("master") => Role::Primary,
            Some("slave") | Some("replica") => Role::Replica,
            Some(other) => return Err(format!("unknown role '{other}'")),
            None => return Err("INFO has no role field".into()),
        };

        let offset_key = match role {
            Role::Primary => "master_repl_offset",
            Role::Replica => "slave_repl_offset",
        };
        let offset = info
            .get(offset_key)
            .ok_or_else(|| format!("INFO has no {offset_key} field"))?
            .parse::<i64>()
            .map_err(|_| format!("{offset_key} is not an integer"))?;

        let mut status = Self {
            role,
            offset,
            replicas: ReplicaSet::default(),
            primary: None,
            link_up: false,
        };

        match role {
            Role::Primary => {
                for desc in info.replica_descriptors() {
                    match parse_replica_descriptor(desc) {
                        Some((info, true)) => status.replicas.replicas.push(info),
                        Some((_, false)) => status.replicas.syncing += 1,
                        None => status.replicas.skipped += 1,
                    }
                }
            }
            Role::Replica => {
                let host = info.get("master_host");
                let port = info.get("master_port").and_then(|p| p.parse().ok());
                status.primary = host.zip(port).map(|(h, p)| Endpoint::new(h, p));
                status.link_up = info.get("master_link_status") == Some("up");
            }
        }

        Ok(status)
    }
}

/// Parses `ip=10.0.0.2,port=6379,state=online,offset=1234,lag=0`.
///
/// Returns the replica and whether its state is `online`, or `None` when
/// any of the four required fields is missing or malformed.
fn parse_replica_descriptor(desc: &str) -> Option<(ReplicaInfo, bool)> {
    let mut ip = None;
    let mut port = None;
    let mut state = None;
    let mut offset = None;

    for part in desc.split(',') {
        let (k, v) = part.split_once('=')?;
        match k {
            "ip" if !v.is_empty() => ip = Some(v),
            "port" => port = Some(v.parse::<u16>().ok()?),
            "state" => state = Some(v),
            "offset" => offset = Some(v.parse::<i64>().ok()?),
            _ => {}
        }
    }

    let info = ReplicaInfo {
        endpoint: Endpoint::new(ip?, port?),
        offset: offset?,
    };
    Some((info, state? == "online"))
}
