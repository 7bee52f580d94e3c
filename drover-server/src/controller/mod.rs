//! Master-side control: blueprint fan-out plus supervision of the cloud
//! reconcilers and foremen.
//!
//! The controller watches the blueprint row. When its namespace changes,
//! every cloud reconciler is cancelled and a fresh set is spawned for the
//! (provider, region) pairs the new blueprint (and any surviving machine
//! rows) name. It also fans the blueprint's containers and connections out
//! into their tables, preserving scheduler-owned fields across updates.

use std::collections::{BTreeSet, HashMap};
use std::time::Duration;

use tracing::{info, warn};

use drover_client::blueprint::BlueprintContainer;
use drover_client::ProviderKind;
use drover_cloud::default_region;
use drover_db::{join, BlueprintRow, Connection, Container, Machine, TableId};

use crate::shutdown::{self, ShutdownReceiver, ShutdownSender};
use crate::Context;

pub mod cloud;
pub mod foreman;

pub use cloud::CloudReconciler;

const MODULE: &str = "controller";

/// How often the controller re-checks the cloud layout absent any change.
const LAYOUT_INTERVAL: Duration = Duration::from_secs(30);

/// Run the controller until shutdown.
pub async fn run(ctx: Context, mut shutdown: ShutdownReceiver) {
    let mut trigger = ctx
        .db
        .trigger_tick(LAYOUT_INTERVAL, &[TableId::Blueprint, TableId::Machine]);
    let mut namespace = String::new();
    let mut clouds: HashMap<(ProviderKind, String), ShutdownSender> = HashMap::new();

    loop {
        sync_layout(&ctx, &mut namespace, &mut clouds);
        sync_containers(&ctx);

        tokio::select! {
            _ = shutdown.recv() => break,
            _ = trigger.recv() => {}
        }
    }
}

/// Reconcile the set of running cloud reconcilers with the blueprint's
/// namespace and (provider, region) pairs. A namespace change cancels every
/// loop; within a namespace, loops are started for pairs as they appear.
fn sync_layout(
    ctx: &Context,
    namespace: &mut String,
    clouds: &mut HashMap<(ProviderKind, String), ShutdownSender>,
) {
    let blueprint = ctx
        .db
        .select::<BlueprintRow>(|_| true)
        .pop()
        .map(|row| row.blueprint);

    let new_namespace = blueprint
        .as_ref()
        .map(|bp| bp.namespace.clone())
        .unwrap_or_default();
    if new_namespace != *namespace {
        info!(old = %namespace, new = %new_namespace, "namespace changed; restarting cloud reconcilers");
        clouds.clear();
        *namespace = new_namespace;
    }

    let mut pairs: BTreeSet<(ProviderKind, String)> = BTreeSet::new();
    if let Some(blueprint) = &blueprint {
        for machine in &blueprint.machines {
            let region = if machine.region.is_empty() {
                default_region(machine.provider).to_owned()
            } else {
                machine.region.clone()
            };
            pairs.insert((machine.provider, region));
        }
    }
    // Pairs with leftover machine rows still need a loop to stop them.
    for machine in ctx.db.select::<Machine>(|_| true) {
        pairs.insert((machine.provider, machine.region));
    }

    for (kind, region) in pairs {
        if clouds.contains_key(&(kind, region.clone())) {
            continue;
        }
        match CloudReconciler::new(ctx.clone(), kind, region.clone(), namespace.clone()) {
            Ok(reconciler) => {
                let (stop_tx, stop_rx) = shutdown::channel();
                tokio::spawn(reconciler.run(stop_rx));
                clouds.insert((kind, region), stop_tx);
            }
            Err(error) => {
                ctx.counters.inc(MODULE, "Error");
                warn!(provider = %kind, region, %error, "failed to construct provider");
            }
        }
    }
}

/// Fan the blueprint's containers and connections out into their tables.
/// Scheduler-owned fields (assignment, Docker identity, status) survive
/// updates to a container's desired attributes.
pub fn sync_containers(ctx: &Context) {
    let mut view = ctx
        .db
        .txn(&[TableId::Blueprint, TableId::Container, TableId::Connection]);
    let blueprint = view
        .select_from::<BlueprintRow>(|_| true)
        .pop()
        .map(|row| row.blueprint)
        .unwrap_or_default();

    let db_containers = view.select_from::<Container>(|_| true);
    let joined = join(blueprint.containers.clone(), db_containers, container_score);
    for (want, mut have) in joined.pairs {
        have.blueprint_id = want.id;
        have.image = want.image;
        have.command = want.command;
        have.env = want.env;
        have.filepath_to_content = want.filepath_to_content;
        have.hostname = want.hostname;
        view.commit(have);
    }
    for want in joined.left {
        let mut row: Container = view.insert();
        row.blueprint_id = want.id;
        row.image = want.image;
        row.command = want.command;
        row.env = want.env;
        row.filepath_to_content = want.filepath_to_content;
        row.hostname = want.hostname;
        view.commit(row);
    }
    for have in joined.right {
        view.remove(&have);
    }

    let db_connections = view.select_from::<Connection>(|_| true);
    let joined = join(blueprint.connections, db_connections, |want, have| {
        let same = want.from == have.from
            && want.to == have.to
            && want.min_port == have.min_port
            && want.max_port == have.max_port;
        if same {
            0
        } else {
            -1
        }
    });
    for want in joined.left {
        let mut row: Connection = view.insert();
        row.from = want.from;
        row.to = want.to;
        row.min_port = want.min_port;
        row.max_port = want.max_port;
        view.commit(row);
    }
    for have in joined.right {
        view.remove(&have);
    }
}

/// Pair blueprint containers with their table rows: by content-hash ID
/// first, then by hostname, then by matching attributes.
fn container_score(want: &BlueprintContainer, have: &Container) -> i64 {
    if !want.id.is_empty() && want.id == have.blueprint_id {
        return 0;
    }
    if !want.hostname.is_empty() && want.hostname == have.hostname {
        return 1;
    }
    let same_attributes = want.image == have.image
        && want.command == have.command
        && want.env == have.env
        && want.filepath_to_content == have.filepath_to_content
        && want.hostname == have.hostname;
    if same_attributes {
        2
    } else {
        -1
    }
}
