//! The in-process daemon API.
//!
//! Clients reach the daemon through a [`Daemon`] handle: per-table queries,
//! blueprint deployment, version and counter inspection. The network
//! transport in front of this handle is a collaborator; the handle is the
//! seam it calls through.

use tokio::time::timeout;
use tracing::info;

use drover_client::minion::{DAEMON_QUERY_TIMEOUT, MINION_CONNECT_TIMEOUT};
use drover_client::{Blueprint, Counter};
use drover_db::{BlueprintRow, Connection, Container, Machine, TableId};
use drover_errors::{DroverError, DroverResult};

use crate::Context;

/// Handle exposing the daemon's API surface.
#[derive(Clone)]
pub struct Daemon {
    ctx: Context,
}

impl Daemon {
    pub fn new(ctx: Context) -> Daemon {
        Daemon { ctx }
    }

    /// Accept a new blueprint. The text is parsed and vetted first; a
    /// rejected blueprint leaves the datastore untouched. A namespace change
    /// invalidates every machine row in the same transaction that commits
    /// the new blueprint.
    pub fn deploy(&self, text: &str) -> DroverResult<()> {
        let blueprint = Blueprint::parse(text)?;

        let mut view = self.ctx.db.txn(&[TableId::Blueprint, TableId::Machine]);
        match view.select_from::<BlueprintRow>(|_| true).pop() {
            Some(mut row) => {
                if row.blueprint.namespace != blueprint.namespace {
                    info!(
                        old = %row.blueprint.namespace,
                        new = %blueprint.namespace,
                        "namespace replaced; invalidating machines"
                    );
                    for machine in view.select_from::<Machine>(|_| true) {
                        view.remove(&machine);
                    }
                }
                row.blueprint = blueprint;
                view.commit(row);
            }
            None => {
                let mut row: BlueprintRow = view.insert();
                row.blueprint = blueprint;
                view.commit(row);
            }
        }
        Ok(())
    }

    pub fn query_blueprint(&self) -> Option<Blueprint> {
        self.ctx
            .db
            .select::<BlueprintRow>(|_| true)
            .pop()
            .map(|row| row.blueprint)
    }

    pub fn query_machines(&self) -> Vec<Machine> {
        self.ctx.db.select(|_| true)
    }

    pub fn query_containers(&self) -> Vec<Container> {
        self.ctx.db.select(|_| true)
    }

    pub fn query_connections(&self) -> Vec<Connection> {
        self.ctx.db.select(|_| true)
    }

    pub fn version(&self) -> &'static str {
        drover_client::VERSION
    }

    pub fn query_counters(&self) -> Vec<Counter> {
        self.ctx.counters.snapshot()
    }

    /// Fetch the counters of the minion at `host`.
    pub async fn query_minion_counters(&self, host: &str) -> DroverResult<Vec<Counter>> {
        let client = timeout(MINION_CONNECT_TIMEOUT, self.ctx.minions.dial(host))
            .await
            .map_err(|_| DroverError::Rpc(format!("dial {host} timed out")))??;
        timeout(DAEMON_QUERY_TIMEOUT, client.query_counters())
            .await
            .map_err(|_| DroverError::Rpc(format!("counter query to {host} timed out")))?
    }
}
