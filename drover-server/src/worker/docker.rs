//! The Docker surface the scheduler consumes.
//!
//! The concrete client library is a collaborator, not part of this crate;
//! the scheduler only ever sees [`DockerClient`] trait objects, and tests
//! inject in-memory fakes. Containers the scheduler owns carry
//! [`CONTAINER_LABEL`], which is also how list calls are filtered, plus a
//! label recording the hash of the files written into the container so a
//! changed file map forces a relaunch.

use std::collections::BTreeMap;

use async_trait::async_trait;
use sha1::{Digest, Sha1};

use drover_errors::DroverResult;

/// Label attached to every container the scheduler launches.
pub const CONTAINER_LABEL: &str = "drover.managed";

/// Label carrying the SHA-1 of the container's serialized file map.
pub const FILES_HASH_LABEL: &str = "drover.files-hash";

/// One container as Docker reports it.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct DkContainer {
    pub id: String,
    /// Image name the container was created from.
    pub image: String,
    /// Resolved image digest.
    pub image_id: String,
    pub ip: String,
    /// The container's entrypoint binary.
    pub path: String,
    /// Arguments after the entrypoint.
    pub args: Vec<String>,
    pub env: BTreeMap<String, String>,
    pub labels: BTreeMap<String, String>,
    pub status: String,
    /// Creation time, unix seconds.
    pub created: i64,
    /// Network endpoint the container is attached to.
    pub endpoint_id: String,
}

/// Everything needed to launch one container.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct RunOptions {
    pub image: String,
    pub ip: String,
    pub command: Vec<String>,
    pub env: BTreeMap<String, String>,
    pub filepath_to_content: BTreeMap<String, String>,
    pub labels: BTreeMap<String, String>,
}

/// The capability set the scheduler drives the local Docker daemon through.
#[async_trait]
pub trait DockerClient: Send + Sync {
    /// Install the network plugin the scheduler's forwarding rules depend
    /// on. Called once at startup; failure is fatal to the worker.
    async fn install_network_plugin(&self) -> DroverResult<()>;

    /// List containers carrying the given label.
    async fn list(&self, label: &str) -> DroverResult<Vec<DkContainer>>;

    /// Create and start a container.
    async fn run(&self, options: RunOptions) -> DroverResult<()>;

    /// Kill and remove a container by ID.
    async fn remove(&self, id: &str) -> DroverResult<()>;
}

/// SHA-1 over the serialized file map. The map is ordered, so the hash is a
/// pure function of its contents.
pub fn files_hash(filepath_to_content: &BTreeMap<String, String>) -> String {
    let serialized =
        serde_json::to_string(filepath_to_content).expect("string maps serialize infallibly");
    let mut hasher = Sha1::new();
    hasher.update(serialized.as_bytes());
    hex::encode(hasher.finalize())
}
