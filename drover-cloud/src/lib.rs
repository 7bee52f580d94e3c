//! The uniform capability set the cloud reconciler drives each provider
//! through.
//!
//! Every concrete adapter (Amazon, Google, DigitalOcean, Vagrant) exposes
//! exactly the [`Provider`] trait. Adapters are stateless across calls:
//! credentials and the cluster namespace are captured at construction, and
//! every method re-derives whatever it needs from its arguments. `boot`
//! returns once the provider has acknowledged the request, not once the VM is
//! up; duplicate boots caused by at-least-once providers are deduplicated by
//! the reconciler on the next `list`.

use async_trait::async_trait;

use drover_client::ProviderKind;
use drover_db::{Acl, Machine};
use drover_errors::{DroverError, DroverResult};

pub mod size;

/// The default region used when a blueprint machine leaves its region empty.
pub fn default_region(kind: ProviderKind) -> &'static str {
    match kind {
        ProviderKind::Amazon => "us-west-1",
        ProviderKind::Google => "us-east1-b",
        ProviderKind::DigitalOcean => "sfo1",
        ProviderKind::Vagrant => "",
    }
}

/// The default root disk size, in GiB, used when a blueprint machine leaves
/// its disk size unset.
pub const DEFAULT_DISK_SIZE_GIB: u32 = 32;

/// One (provider, region) worth of cloud capability.
#[async_trait]
pub trait Provider: Send + Sync {
    /// Enumerate the live instances in this (provider, region). Populates
    /// `cloud_id`, `public_ip`, `private_ip`, `size`, `preemptible`,
    /// `disk_size`, and `floating_ip` on every returned machine.
    async fn list(&self) -> DroverResult<Vec<Machine>>;

    /// Provision instances matching the given machines. The caller has
    /// filled in everything except the cloud-assigned fields.
    async fn boot(&self, machines: Vec<Machine>) -> DroverResult<()>;

    /// Terminate instances by `cloud_id`.
    async fn stop(&self, machines: Vec<Machine>) -> DroverResult<()>;

    /// Re-associate each machine's floating IP to match its `floating_ip`
    /// attribute.
    async fn update_floating_ips(&self, machines: Vec<Machine>) -> DroverResult<()>;

    /// Replace the provider's ingress rule set with exactly this set.
    /// Idempotent.
    async fn set_acls(&self, acls: Vec<Acl>) -> DroverResult<()>;
}

/// Constructs providers for the reconciler. Tests inject factories that
/// return in-memory fakes.
pub trait ProviderFactory: Send + Sync {
    fn new_provider(
        &self,
        kind: ProviderKind,
        region: &str,
        namespace: &str,
    ) -> DroverResult<Box<dyn Provider>>;
}

/// A factory for builds with no provider adapters linked in. Every
/// construction fails; the reconciler logs the failure and keeps ticking, so
/// the daemon still serves its API.
pub struct UnlinkedProviders;

impl ProviderFactory for UnlinkedProviders {
    fn new_provider(
        &self,
        kind: ProviderKind,
        region: &str,
        _namespace: &str,
    ) -> DroverResult<Box<dyn Provider>> {
        Err(DroverError::Provider(format!(
            "no adapter linked for {kind} in {region}"
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn every_provider_has_a_default_region() {
        assert_eq!(default_region(ProviderKind::Amazon), "us-west-1");
        assert_eq!(default_region(ProviderKind::Google), "us-east1-b");
        assert_eq!(default_region(ProviderKind::DigitalOcean), "sfo1");
        assert_eq!(default_region(ProviderKind::Vagrant), "");
    }

    #[test]
    fn unlinked_factory_fails_transiently() {
        let err = UnlinkedProviders
            .new_provider(ProviderKind::Amazon, "us-west-1", "prod")
            .err()
            .unwrap();
        assert!(err.is_transient());
    }
}
