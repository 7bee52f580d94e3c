//! The parsed cluster blueprint and its JSON wire format.
//!
//! A blueprint is produced by an external front-end and submitted to the
//! daemon as JSON. The daemon vets it before accepting it; a blueprint that
//! fails vetting is rejected with a human-readable message and no datastore
//! mutation occurs.

use std::collections::{BTreeMap, HashMap, HashSet};

use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha1::{Digest, Sha1};

use drover_errors::{DroverError, DroverResult};

use crate::{ProviderKind, Role, PUBLIC};

/// A user-supplied declarative description of the cluster.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Blueprint {
    pub machines: Vec<BlueprintMachine>,
    pub labels: Vec<Label>,
    pub containers: Vec<BlueprintContainer>,
    pub connections: Vec<Connection>,
    pub placements: Vec<Placement>,
    /// Cluster identity. Replacing the namespace invalidates every live
    /// machine row.
    pub namespace: String,
    /// CIDRs permitted to reach the control plane.
    #[serde(rename = "adminACL")]
    pub admin_acl: Vec<String>,
    /// Upper bound on the hourly price of any machine size chosen by the
    /// sizing function. Zero means unbounded.
    pub max_price: f64,
}

/// One machine the blueprint asks for.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct BlueprintMachine {
    pub provider: ProviderKind,
    pub role: Role,
    /// Provider instance size. Empty means "choose one that satisfies `cpu`,
    /// `ram`, and the blueprint's `maxPrice`".
    pub size: String,
    /// Empty means the provider's default region.
    pub region: String,
    /// Root disk size in GiB. Zero means the default.
    pub disk_size: u32,
    pub preemptible: bool,
    pub floating_ip: String,
    pub ssh_keys: Vec<String>,
    pub cpu: ResourceRange,
    pub ram: ResourceRange,
}

/// An inclusive requirement range for a machine resource. A zero `max` means
/// unbounded above.
#[derive(Clone, Copy, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ResourceRange {
    pub min: f64,
    pub max: f64,
}

impl ResourceRange {
    /// Whether `value` falls inside this range.
    pub fn accepts(&self, value: f64) -> bool {
        value >= self.min && (self.max == 0.0 || value <= self.max)
    }
}

/// A named group of containers, referenced by content-hash IDs.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Label {
    pub name: String,
    pub ids: Vec<String>,
}

/// One container the blueprint asks for.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct BlueprintContainer {
    /// Deterministic content-hash ID; see [`content_id`]. Filled in by
    /// [`Blueprint::assign_ids`] when the front-end left it empty.
    pub id: String,
    pub image: Image,
    pub command: Vec<String>,
    pub env: BTreeMap<String, String>,
    pub filepath_to_content: BTreeMap<String, String>,
    /// Globally unique within a deployment, or empty.
    pub hostname: String,
}

/// A container image: a name, plus an optional inline Dockerfile to build it
/// from.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Image {
    pub name: String,
    pub dockerfile: String,
}

/// An allowed network path between two hostnames, or between a hostname and
/// the reserved token `public`.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Connection {
    pub from: String,
    pub to: String,
    pub min_port: u16,
    pub max_port: u16,
}

impl Connection {
    /// Whether either end of this connection is the public Internet.
    pub fn is_public(&self) -> bool {
        self.from == PUBLIC || self.to == PUBLIC
    }
}

/// A placement constraint restricting which workers a container may land on.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Placement {
    /// Hostname the rule applies to.
    pub target: String,
    /// When set, `target` must not share a worker with `other`.
    pub exclusive: bool,
    pub other: String,
    /// When non-empty, `target` may only run on workers of this provider.
    pub provider: String,
    pub size: String,
    pub region: String,
}

impl Blueprint {
    /// Parse, vet, and ID-assign a blueprint from its JSON text.
    pub fn parse(text: &str) -> DroverResult<Blueprint> {
        let mut blueprint: Blueprint = serde_json::from_str(text)?;
        blueprint.vet()?;
        blueprint.assign_ids();
        Ok(blueprint)
    }

    /// Check the configuration invariants that must hold before a blueprint
    /// may be accepted. Returns the first violation found.
    pub fn vet(&self) -> DroverResult<()> {
        let mut hostnames = HashSet::new();
        for c in &self.containers {
            if !c.hostname.is_empty() && !hostnames.insert(c.hostname.as_str()) {
                return Err(DroverError::InvalidBlueprint(format!(
                    "hostname {} used by multiple containers",
                    c.hostname
                )));
            }
        }

        let mut dockerfiles: HashMap<&str, &str> = HashMap::new();
        for c in &self.containers {
            match dockerfiles.insert(&c.image.name, &c.image.dockerfile) {
                Some(previous) if previous != c.image.dockerfile => {
                    return Err(DroverError::InvalidBlueprint(format!(
                        "image {} has multiple conflicting Dockerfiles",
                        c.image.name
                    )));
                }
                _ => {}
            }
        }

        for conn in &self.connections {
            for end in [&conn.from, &conn.to] {
                if end != PUBLIC && !hostnames.contains(end.as_str()) {
                    return Err(DroverError::InvalidBlueprint(format!(
                        "connection references undeployed hostname {end}"
                    )));
                }
            }
        }

        for p in &self.placements {
            for host in [&p.target, &p.other] {
                if !host.is_empty() && !hostnames.contains(host.as_str()) {
                    return Err(DroverError::InvalidBlueprint(format!(
                        "placement references undeployed hostname {host}"
                    )));
                }
            }
        }

        let mut floating_ips = HashSet::new();
        for m in &self.machines {
            if !m.floating_ip.is_empty() && !floating_ips.insert(m.floating_ip.as_str()) {
                return Err(DroverError::InvalidBlueprint(format!(
                    "floating IP {} assigned more than once",
                    m.floating_ip
                )));
            }
        }

        Ok(())
    }

    /// Fill in deterministic content-hash IDs for containers the front-end
    /// left without one. Attribute-equal containers get distinct IDs via a
    /// per-duplicate disambiguator, assigned in declaration order.
    pub fn assign_ids(&mut self) {
        let mut seen: HashMap<String, usize> = HashMap::new();
        for c in &mut self.containers {
            if !c.id.is_empty() {
                continue;
            }
            let key = content_key(c);
            let n = seen.entry(key.clone()).or_insert(0);
            c.id = id_from_key(&key, *n);
            *n += 1;
        }
    }

}

/// Deterministic content-hash ID for a serializable blueprint entity.
///
/// The canonical stringification is the entity's JSON value with the `id` and
/// `sshKeys` fields removed; serde_json's map ordering is stable, so two
/// attribute-equal entities always hash identically. `ref_index`
/// disambiguates attribute-equal duplicates.
pub fn content_id<T: Serialize>(entity: &T, ref_index: usize) -> String {
    let mut value = serde_json::to_value(entity).expect("blueprint entities serialize infallibly");
    if let Value::Object(ref mut map) = value {
        map.remove("id");
        map.remove("sshKeys");
    }
    id_from_key(&value.to_string(), ref_index)
}

fn content_key(c: &BlueprintContainer) -> String {
    let mut value = serde_json::to_value(c).expect("blueprint entities serialize infallibly");
    if let Value::Object(ref mut map) = value {
        map.remove("id");
        map.remove("sshKeys");
    }
    value.to_string()
}

fn id_from_key(key: &str, ref_index: usize) -> String {
    let mut hasher = Sha1::new();
    hasher.update(key.as_bytes());
    hasher.update(ref_index.to_string().as_bytes());
    hex::encode(hasher.finalize())
}
