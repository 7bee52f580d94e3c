//! Row types, one per table.
//!
//! Status transitions are owned exclusively by the foreman for machines and
//! by the scheduler for containers; no other component mutates those fields.

use std::collections::BTreeMap;
use std::time::Duration;

use serde::Serialize;

use drover_client::blueprint::{Blueprint, Image};
use drover_client::{ProviderKind, Role};

use crate::RowId;

/// Connection lifecycle of a machine, as driven by the reconciler (which
/// writes `Booting` and `Stopping`) and the foreman (everything else).
#[derive(
    Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, strum::Display, strum::EnumString,
)]
pub enum MachineStatus {
    /// No status reported yet.
    #[default]
    #[strum(serialize = "")]
    Unset,
    #[strum(serialize = "booting")]
    Booting,
    #[strum(serialize = "connecting")]
    Connecting,
    #[strum(serialize = "connected")]
    Connected,
    #[strum(serialize = "reconnecting")]
    Reconnecting,
    #[strum(serialize = "stopping")]
    Stopping,
}

/// One provisioned or desired cloud instance.
///
/// An empty `cloud_id` means the row is desired but the cloud has not yet
/// acknowledged it.
#[derive(Clone, Debug, Default, PartialEq, Serialize)]
pub struct Machine {
    pub id: RowId,
    /// Authoritative role, as reported by the minion.
    pub role: Role,
    /// What the blueprint asked for.
    pub desired_role: Role,
    pub provider: ProviderKind,
    pub region: String,
    pub size: String,
    /// Root disk size in GiB. Zero until known.
    pub disk_size: u32,
    pub preemptible: bool,
    pub ssh_keys: Vec<String>,
    pub floating_ip: String,
    /// The provider's opaque instance identifier.
    pub cloud_id: String,
    pub public_ip: String,
    pub private_ip: String,
    pub status: MachineStatus,
    /// Monotonic timestamp of the last `status` change. Updates only when
    /// `status` actually changes.
    pub status_time: Duration,
}

impl Machine {
    /// Set `status`, advancing `status_time` iff the status actually changed.
    pub fn set_status(&mut self, status: MachineStatus, now: Duration) {
        if self.status != status {
            self.status = status;
            self.status_time = now;
        }
    }

    /// Whether the cloud has acknowledged this instance.
    pub fn booted(&self) -> bool {
        !self.cloud_id.is_empty()
    }
}

/// The deployed blueprint. At most one row exists.
#[derive(Clone, Debug, Default, PartialEq, Serialize)]
pub struct BlueprintRow {
    pub id: RowId,
    pub blueprint: Blueprint,
}

/// A desired container assignment.
#[derive(Clone, Debug, Default, PartialEq, Serialize)]
pub struct Container {
    pub id: RowId,
    /// The content-hash ID this container had in the blueprint.
    pub blueprint_id: String,
    pub image: Image,
    /// Resolved image digest; may be empty until the image has been pulled.
    pub image_id: String,
    pub command: Vec<String>,
    pub env: BTreeMap<String, String>,
    pub filepath_to_content: BTreeMap<String, String>,
    /// Globally unique within a deployment, or empty.
    pub hostname: String,
    /// Assigned at scheduling time.
    pub ip: String,
    /// Private IP of the assigned worker; empty means unassigned.
    pub minion: String,
    pub docker_id: String,
    pub endpoint_id: String,
    pub status: String,
    /// Creation time as reported by Docker, unix seconds.
    pub created: i64,
}

/// An allowed network path between two hostnames, or between a hostname and
/// the reserved token `public`. Port bounds are inclusive.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct Connection {
    pub id: RowId,
    pub from: String,
    pub to: String,
    pub min_port: u16,
    pub max_port: u16,
}

/// An ingress rule to be applied at the cloud provider. `cidr_ip` supports
/// the reserved token `local`, substituted with the daemon's own public IP at
/// apply time.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct Acl {
    pub id: RowId,
    pub cidr_ip: String,
    pub min_port: u16,
    pub max_port: u16,
}

/// Cache of cluster membership: the private IPs of the etcd members (the
/// masters). Written by the foreman, consumed read-only elsewhere.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct Etcd {
    pub id: RowId,
    pub members: Vec<String>,
}

/// The local machine's identity as known to its minion. Written by the
/// scheduler side, consumed read-only by other components.
#[derive(Clone, Debug, Default, PartialEq, Serialize)]
pub struct MinionSelf {
    pub id: RowId,
    pub role: Role,
    pub private_ip: String,
    pub provider: String,
    pub size: String,
    pub region: String,
    pub authorized_keys: Vec<String>,
}
