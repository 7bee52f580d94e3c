//! Types shared between the drover daemon and everything that talks to it:
//! the blueprint wire format, the minion RPC surface, the daemon query API,
//! and the counters registry exposed through that API.

use serde::{Deserialize, Serialize};

pub mod blueprint;
pub mod counters;
pub mod minion;

pub use blueprint::Blueprint;
pub use counters::{Counter, Counters};
pub use minion::{MinionClient, MinionConfig, MinionDialer};

/// The reserved hostname denoting the open Internet inside connections.
pub const PUBLIC: &str = "public";

/// The reserved ACL CIDR token substituted with the daemon's own public IP
/// at apply time.
pub const LOCAL: &str = "local";

/// The role a machine plays in the cluster.
///
/// `Role` as reported by a minion is authoritative; `DesiredRole` is what the
/// blueprint asked for. A machine whose minion has not yet reported in has
/// role [`Role::None`].
#[derive(
    Clone,
    Copy,
    Debug,
    Default,
    PartialEq,
    Eq,
    Hash,
    Serialize,
    Deserialize,
    strum::Display,
    strum::EnumString,
)]
pub enum Role {
    #[default]
    #[strum(serialize = "", serialize = "none")]
    None,
    #[strum(serialize = "master")]
    Master,
    #[strum(serialize = "worker")]
    Worker,
}

/// A supported cloud provider.
#[derive(
    Clone,
    Copy,
    Debug,
    Default,
    PartialEq,
    Eq,
    Hash,
    PartialOrd,
    Ord,
    Serialize,
    Deserialize,
    strum::Display,
    strum::EnumString,
)]
pub enum ProviderKind {
    #[default]
    Amazon,
    Google,
    DigitalOcean,
    Vagrant,
}

/// Version string reported by [`version`]-style daemon API calls.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
