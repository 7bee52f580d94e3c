//! The drover daemon.
//!
//! Three families of control loop reconcile a declarative cluster blueprint
//! with the world, synchronizing through the [`drover_db`] datastore:
//!
//! * the cloud reconciler ([`controller::cloud`]) drives each
//!   (provider, region) pair toward the blueprint's machine set,
//! * the foreman ([`controller::foreman`]) manages one management channel
//!   per booted machine, pushing minion configuration and reading back the
//!   minion's self-reported role,
//! * the scheduler ([`worker`]) runs on every worker and reconciles its
//!   container table with what Docker actually has.
//!
//! There is no global ordering between the loops; each reconciles
//! independently and convergence is eventual.

use std::sync::Arc;

use drover_client::{Counters, MinionDialer};
use drover_cloud::ProviderFactory;
use drover_db::Db;

pub mod api;
pub mod clock;
pub mod controller;
pub mod shutdown;
pub mod worker;

pub use api::Daemon;
pub use clock::{Clock, MockClock, SystemClock};

/// Everything a control loop needs, threaded explicitly so tests can inject
/// fakes for each piece.
#[derive(Clone)]
pub struct Context {
    pub db: Db,
    pub counters: Counters,
    pub clock: Arc<dyn Clock>,
    pub providers: Arc<dyn ProviderFactory>,
    pub minions: Arc<dyn MinionDialer>,
    /// The daemon's own public IP, substituted for the `local` ACL token at
    /// apply time.
    pub my_public_ip: String,
    /// Optional admin key appended to every desired machine's SSH keys.
    pub admin_ssh_key: Option<String>,
}
