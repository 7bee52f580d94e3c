//! The RPC surface the daemon consumes on each minion.
//!
//! The wire transport is not implemented here; the foreman only ever sees
//! [`MinionClient`] trait objects handed out by a [`MinionDialer`], and tests
//! inject in-memory fakes.

use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use drover_errors::{DroverError, DroverResult};

use crate::counters::Counter;
use crate::Role;

/// Timeout applied to every minion RPC.
pub const MINION_RPC_TIMEOUT: Duration = Duration::from_secs(10);

/// Timeout applied when dialing a minion.
pub const MINION_CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

/// Timeout applied to daemon API queries issued by clients.
pub const DAEMON_QUERY_TIMEOUT: Duration = Duration::from_secs(60);

/// The configuration the foreman pushes to a minion, and which the minion
/// reports back about itself.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct MinionConfig {
    pub role: Role,
    pub floating_ip: String,
    pub private_ip: String,
    /// The current blueprint as opaque text.
    pub blueprint: String,
    pub provider: String,
    pub size: String,
    pub region: String,
    /// Private IPs of the cluster's master machines.
    pub etcd_members: Vec<String>,
    pub authorized_keys: Vec<String>,
}

/// A live management channel to one minion.
#[async_trait]
pub trait MinionClient: Send + Sync {
    /// Fetch the minion's self-reported role and current configuration.
    async fn get_minion_config(&self) -> DroverResult<MinionConfig>;

    /// Replace the minion's configuration.
    async fn set_minion_config(&self, config: MinionConfig) -> DroverResult<()>;

    /// Fetch the minion's counters, for `QueryMinionCounters`.
    async fn query_counters(&self) -> DroverResult<Vec<Counter>>;
}

/// Dials minions by host. The foreman holds one dialer for the life of the
/// process; each dial yields an independent client.
#[async_trait]
pub trait MinionDialer: Send + Sync {
    async fn dial(&self, host: &str) -> DroverResult<Box<dyn MinionClient>>;
}

/// A dialer for builds with no minion transport linked in. Every dial
/// fails transiently; the foreman keeps the machine in connecting and
/// retries on its fast tick.
pub struct UnlinkedMinions;

#[async_trait]
impl MinionDialer for UnlinkedMinions {
    async fn dial(&self, host: &str) -> DroverResult<Box<dyn MinionClient>> {
        Err(DroverError::Rpc(format!(
            "no minion transport linked for {host}"
        )))
    }
}
