//! Operator configuration.
//!
//! Values resolve in order: built-in defaults, then a TOML file, then
//! whatever the command line overrides. Every field has a default, so a
//! file only needs the keys it changes.

use std::net::IpAddr;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::endpoint::DEFAULT_PORT;
use crate::fence::DEFAULT_FENCE_THRESHOLD;
use crate::orchestrator::{ConfirmMethod, ConfirmPolicy, PromotionOptions};
use crate::rendezvous::DEFAULT_CHANNEL;
use crate::session::RespConnector;
use crate::wait::WaitOptions;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct HoistConfig {
    /// port assumed for addresses given without one
    pub port: u16,
    /// AUTH password sent on every connection. empty disables AUTH
    pub password: String,
    pub connect_timeout_ms: u64,
    /// gap between replication polls and rendezvous publishes
    pub poll_interval_ms: u64,
    /// how long to wait for old primaries to flush. 0 waits indefinitely
    pub flush_timeout_secs: u64,
    /// how long to wait for each re-parented node to attach. 0 waits indefinitely
    pub confirm_timeout_secs: u64,
    pub confirm_method: ConfirmMethod,
    pub confirm_policy: ConfirmPolicy,
    pub fence_threshold: u64,
    pub channel: String,
    pub dns: DnsConfig,
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct DnsConfig {
    /// name server addresses. empty uses the system resolver
    pub nameservers: Vec<String>,
    pub search: Vec<String>,
}

impl Default for HoistConfig {
    fn default() -> Self {
        Self {
            port: DEFAULT_PORT,
            password: String::new(),
            connect_timeout_ms: 5_000,
            poll_interval_ms: 100,
            flush_timeout_secs: 0,
            confirm_timeout_secs: 60,
            confirm_method: ConfirmMethod::default(),
            confirm_policy: ConfirmPolicy::default(),
            fence_threshold: DEFAULT_FENCE_THRESHOLD,
            channel: DEFAULT_CHANNEL.to_string(),
            dns: DnsConfig::default(),
        }
    }
}

impl HoistConfig {
    pub fn from_file(path: &Path) -> Result<Self, String> {
        let text = std::fs::read_to_string(path)
            .map_err(|e| format!("failed to read config '{}': {e}", path.display()))?;
        toml::from_str(&text).map_err(|e| format!("invalid config '{}': {e}", path.display()))
    }

    pub fn to_toml(&self) -> Result<String, toml::ser::Error> {
        toml::to_string_pretty(self)
    }

    pub fn password(&self) -> Option<String> {
        (!self.password.is_empty()).then(|| self.password.clone())
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn connector(&self) -> RespConnector {
        RespConnector::new(self.password(), self.connect_timeout())
    }

    /// Checks the values that cannot be expressed in the types alone.
    pub fn validate(&self) -> Result<(), String> {
        if self.poll_interval_ms == 0 {
            return Err("poll_interval_ms must be greater than zero".into());
        }
        if self.connect_timeout_ms == 0 {
            return Err("connect_timeout_ms must be greater than zero".into());
        }
        if self.channel.is_empty() {
            return Err("channel must not be empty".into());
        }
        if self.fence_threshold == 0 {
            return Err("fence_threshold must be greater than zero".into());
        }
        self.nameserver_ips().map(|_| ())
    }

    pub fn promotion_options(&self) -> PromotionOptions {
        let interval = Duration::from_millis(self.poll_interval_ms);
        PromotionOptions {
            fence_threshold: self.fence_threshold,
            flush: WaitOptions {
                interval,
                timeout: seconds(self.flush_timeout_secs),
            },
            confirm: WaitOptions {
                interval,
                timeout: seconds(self.confirm_timeout_secs),
            },
            confirm_method: self.confirm_method,
            confirm_policy: self.confirm_policy,
            channel: self.channel.clone(),
        }
    }

    pub fn nameserver_ips(&self) -> Result<Vec<IpAddr>, String> {
        self.dns
            .nameservers
            .iter()
            .map(|s| {
                s.trim()
                    .parse()
                    .map_err(|_| format!("invalid name server address '{s}'"))
            })
            .collect()
    }
}

fn seconds(secs: u64) -> Option<Duration> {
    (secs > 0).then(|| Duration::from_secs(secs))
}
