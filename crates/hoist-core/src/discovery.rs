//! Service discovery: turning a service name into member endpoints.
//!
//! Lookup failures are not errors at this layer. A name that cannot be
//! resolved yields an empty list (with the reason logged), and callers
//! decide whether that aborts anything.

use std::collections::HashMap;
use std::net::IpAddr;

use async_trait::async_trait;
use hickory_resolver::config::{NameServerConfigGroup, ResolverConfig, ResolverOpts};
use hickory_resolver::proto::rr::Name;
use hickory_resolver::TokioAsyncResolver;
use tracing::{debug, warn};

use crate::endpoint::Endpoint;
use crate::error::{Error, Result};
use crate::orchestrator::PromotionPlan;

const DNS_PORT: u16 = 53;

#[async_trait]
pub trait Discovery: Send + Sync {
    /// Every endpoint currently registered under `name`, best first.
    async fn resolve(&self, name: &str) -> Vec<Endpoint>;

    /// The single endpoint registered under a fully qualified member name.
    async fn resolve_one(&self, name: &str) -> Option<Endpoint> {
        self.resolve(name).await.into_iter().next()
    }
}

/// Builds a promotion plan from a service's members.
///
/// An empty member list is a [`Error::Discovery`]. Whether `designated` is
/// among the members is checked later, when the run resolves its topology.
pub async fn plan_from_service<D: Discovery + ?Sized>(
    discovery: &D,
    service: &str,
    designated: Endpoint,
) -> Result<PromotionPlan> {
    let members = discovery.resolve(service).await;
    if members.is_empty() {
        return Err(Error::Discovery(service.to_owned()));
    }
    Ok(PromotionPlan::new(members, designated))
}

/// Fixed name-to-endpoints table.
#[derive(Debug, Clone, Default)]
pub struct StaticDiscovery {
    services: HashMap<String, Vec<Endpoint>>,
}

impl StaticDiscovery {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, name: impl Into<String>, endpoints: Vec<Endpoint>) -> Self {
        self.insert(name, endpoints);
        self
    }

    pub fn insert(&mut self, name: impl Into<String>, endpoints: Vec<Endpoint>) {
        self.services.insert(name.into(), endpoints);
    }
}

#[async_trait]
impl Discovery for StaticDiscovery {
    async fn resolve(&self, name: &str) -> Vec<Endpoint> {
        match self.services.get(name) {
            Some(endpoints) => endpoints.clone(),
            None => {
                warn!(%name, "no such service");
                Vec::new()
            }
        }
    }
}

/// One SRV answer before its target is resolved to an address.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SrvRecord {
    pub priority: u16,
    pub weight: u16,
    pub port: u16,
    pub target: String,
}

/// Sorts by ascending priority, then descending weight.
pub fn order_records(mut records: Vec<SrvRecord>) -> Vec<SrvRecord> {
    records.sort_by(|a, b| {
        a.priority
            .cmp(&b.priority)
            .then_with(|| b.weight.cmp(&a.weight))
    });
    records
}

/// DNS SRV lookups, as published by SkyDNS-style registries.
pub struct SrvDiscovery {
    resolver: TokioAsyncResolver,
}

impl SrvDiscovery {
    /// Uses the host's resolver configuration.
    pub fn from_system() -> Result<Self> {
        let resolver = TokioAsyncResolver::tokio_from_system_conf()
            .map_err(|e| Error::Resolver(format!("reading system resolver config: {e}")))?;
        Ok(Self { resolver })
    }

    /// Queries `nameservers` (or the system's, when empty) with the given
    /// search domains.
    pub fn with_servers(nameservers: &[IpAddr], search: &[String]) -> Result<Self> {
        if nameservers.is_empty() && search.is_empty() {
            return Self::from_system();
        }

        let search = search
            .iter()
            .map(|d| {
                Name::from_ascii(d)
                    .map_err(|e| Error::Resolver(format!("search domain '{d}': {e}")))
            })
            .collect::<Result<Vec<_>>>()?;

        let (domain, servers, opts) = if nameservers.is_empty() {
            let (system, opts) = hickory_resolver::system_conf::read_system_conf()
                .map_err(|e| Error::Resolver(format!("reading system resolver config: {e}")))?;
            let servers = NameServerConfigGroup::from(system.name_servers().to_vec());
            (system.domain().cloned(), servers, opts)
        } else {
            let servers = NameServerConfigGroup::from_ips_clear(nameservers, DNS_PORT, true);
            (None, servers, ResolverOpts::default())
        };

        let config = ResolverConfig::from_parts(domain, search, servers);
        Ok(Self {
            resolver: TokioAsyncResolver::tokio(config, opts),
        })
    }

    async fn records(&self, name: &str) -> Option<Vec<SrvRecord>> {
        match self.resolver.srv_lookup(name).await {
            Ok(lookup) => Some(
                lookup
                    .iter()
                    .map(|srv| SrvRecord {
                        priority: srv.priority(),
                        weight: srv.weight(),
                        port: srv.port(),
                        target: srv.target().to_utf8(),
                    })
                    .collect(),
            ),
            Err(e) => {
                warn!(%name, "SRV lookup failed: {e}");
                None
            }
        }
    }

    async fn address_of(&self, target: &str) -> Option<IpAddr> {
        match self.resolver.lookup_ip(target).await {
            Ok(lookup) => lookup.iter().next(),
            Err(e) => {
                warn!(%target, "address lookup failed: {e}");
                None
            }
        }
    }
}

#[async_trait]
impl Discovery for SrvDiscovery {
    async fn resolve(&self, name: &str) -> Vec<Endpoint> {
        let Some(records) = self.records(name).await else {
            return Vec::new();
        };

        let mut endpoints = Vec::with_capacity(records.len());
        for record in order_records(records) {
            if let Some(ip) = self.address_of(&record.target).await {
                debug!(%name, target = %record.target, %ip, port = record.port, "resolved member");
                endpoints.push(Endpoint::new(ip.to_string(), record.port));
            }
        }
        endpoints
    }
}
