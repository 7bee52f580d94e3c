//! The scheduler loop.
//!
//! On workers: reconcile the containers assigned to this worker with what
//! Docker actually has, launching and removing concurrently, then refresh
//! the forwarding rules. On the master: assign unassigned containers to
//! available workers subject to placement rules. A failed launch or removal
//! is logged and retried next tick; the loop never aborts.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::net::Ipv4Addr;
use std::sync::Arc;
use std::time::Duration;

use futures::future::join_all;
use tokio::sync::Semaphore;
use tracing::{debug, info, warn};

use drover_client::blueprint::Placement;
use drover_client::Role;
use drover_db::{join, BlueprintRow, Connection, Container, Machine, MinionSelf, TableId};
use drover_errors::DroverResult;

use crate::shutdown::ShutdownReceiver;
use crate::worker::docker::{
    files_hash, DkContainer, DockerClient, RunOptions, CONTAINER_LABEL, FILES_HASH_LABEL,
};
use crate::worker::network::{forwarding_rules, Forwarder};
use crate::Context;

const MODULE: &str = "scheduler";

const SYNC_INTERVAL: Duration = Duration::from_secs(60);

/// Cap on concurrent Docker operations.
const CONCURRENCY_LIMIT: usize = 32;

/// Run the scheduler until shutdown. The network plugin bootstrap is the
/// only fatal failure anywhere in the scheduler.
pub async fn run(
    ctx: Context,
    docker: Arc<dyn DockerClient>,
    forwarder: Arc<dyn Forwarder>,
    mut shutdown: ShutdownReceiver,
) -> DroverResult<()> {
    docker.install_network_plugin().await?;

    let mut trigger = ctx.db.trigger_tick(
        SYNC_INTERVAL,
        &[
            TableId::MinionSelf,
            TableId::Container,
            TableId::Connection,
            TableId::Etcd,
        ],
    );
    loop {
        run_once(&ctx, docker.as_ref(), forwarder.as_ref()).await;
        tokio::select! {
            _ = shutdown.recv() => return Ok(()),
            _ = trigger.recv() => {}
        }
    }
}

/// One scheduler pass, dispatched on this minion's role.
pub async fn run_once(ctx: &Context, docker: &dyn DockerClient, forwarder: &dyn Forwarder) {
    let Some(me) = ctx.db.select::<MinionSelf>(|_| true).pop() else {
        return;
    };
    match me.role {
        Role::Master => assign_placements(ctx),
        Role::Worker => {
            sync_containers(ctx, docker, &me).await;
            refresh_forwarding(ctx, forwarder, &me);
        }
        Role::None => {}
    }
}

/// Reconcile this worker's container table against Docker. Two passes: the
/// first kills and launches, the second absorbs the Docker identities of
/// whatever the first one launched.
async fn sync_containers(ctx: &Context, docker: &dyn DockerClient, me: &MinionSelf) {
    for _ in 0..2 {
        let dk_containers = match docker.list(CONTAINER_LABEL).await {
            Ok(containers) => containers,
            Err(error) => {
                ctx.counters.inc(MODULE, "Error");
                warn!(%error, "failed to list containers");
                return;
            }
        };

        let (to_boot, to_kill) = {
            let mut view = ctx.db.txn(&[TableId::Container]);
            let mine = view.select_from::<Container>(|c| c.minion == me.private_ip);
            let joined = join(mine, dk_containers, sync_score);
            for (mut dbc, dkc) in joined.pairs {
                dbc.docker_id = dkc.id;
                dbc.endpoint_id = dkc.endpoint_id;
                dbc.status = dkc.status;
                dbc.created = dkc.created;
                view.commit(dbc);
            }
            (joined.left, joined.right)
        };

        if to_boot.is_empty() && to_kill.is_empty() {
            break;
        }
        apply_changes(ctx, docker, to_boot, to_kill).await;
    }
}

/// Kill and launch concurrently, bounded by the operation semaphore.
async fn apply_changes(
    ctx: &Context,
    docker: &dyn DockerClient,
    to_boot: Vec<Container>,
    to_kill: Vec<DkContainer>,
) {
    let semaphore = Semaphore::new(CONCURRENCY_LIMIT);

    let kills = to_kill.iter().map(|dkc| {
        let semaphore = &semaphore;
        async move {
            let _permit = semaphore.acquire().await.expect("semaphore is never closed");
            ctx.counters.inc(MODULE, "Remove");
            info!(container = %dkc.id, "removing container");
            if let Err(error) = docker.remove(&dkc.id).await {
                ctx.counters.inc(MODULE, "Error");
                warn!(container = %dkc.id, %error, "remove failed");
            }
        }
    });

    let boots = to_boot.iter().map(|dbc| {
        let semaphore = &semaphore;
        async move {
            let _permit = semaphore.acquire().await.expect("semaphore is never closed");
            ctx.counters.inc(MODULE, "Run");
            info!(hostname = %dbc.hostname, image = %dbc.image.name, "launching container");
            let mut labels = BTreeMap::new();
            labels.insert(CONTAINER_LABEL.to_owned(), String::new());
            labels.insert(
                FILES_HASH_LABEL.to_owned(),
                files_hash(&dbc.filepath_to_content),
            );
            let options = RunOptions {
                image: if dbc.image_id.is_empty() {
                    dbc.image.name.clone()
                } else {
                    dbc.image_id.clone()
                },
                ip: dbc.ip.clone(),
                command: dbc.command.clone(),
                env: dbc.env.clone(),
                filepath_to_content: dbc.filepath_to_content.clone(),
                labels,
            };
            if let Err(error) = docker.run(options).await {
                ctx.counters.inc(MODULE, "Error");
                warn!(hostname = %dbc.hostname, %error, "run failed");
            }
        }
    });

    futures::future::join(join_all(kills), join_all(boots)).await;
}

/// Whether a table row and a Docker container describe the same thing. Any
/// mismatch in IP, file contents, image, environment, or command is
/// incompatible; the container will be killed and relaunched.
pub fn sync_score(dbc: &Container, dkc: &DkContainer) -> i64 {
    if dbc.ip != dkc.ip {
        return -1;
    }
    let expected_hash = files_hash(&dbc.filepath_to_content);
    let actual_hash = dkc
        .labels
        .get(FILES_HASH_LABEL)
        .map(String::as_str)
        .unwrap_or_default();
    if expected_hash != actual_hash {
        return -1;
    }
    // Compare digests once the image has been resolved, names before that.
    let image_matches = if dbc.image_id.is_empty() {
        dbc.image.name == dkc.image
    } else {
        dbc.image_id == dkc.image_id
    };
    if !image_matches {
        return -1;
    }
    if dbc.env != dkc.env {
        return -1;
    }
    if !command_matches(&dbc.command, dkc) {
        return -1;
    }
    0
}

/// An empty desired command accepts the image default. Otherwise accept the
/// raw arguments, or the entrypoint followed by the arguments.
fn command_matches(command: &[String], dkc: &DkContainer) -> bool {
    if command.is_empty() {
        return true;
    }
    if command == dkc.args.as_slice() {
        return true;
    }
    command.len() == dkc.args.len() + 1 && command[0] == dkc.path && command[1..] == dkc.args[..]
}

/// Refresh this worker's forwarding rules from the container and connection
/// tables.
fn refresh_forwarding(ctx: &Context, forwarder: &dyn Forwarder, me: &MinionSelf) {
    let (containers, connections) = {
        let view = ctx.db.txn(&[TableId::Container, TableId::Connection]);
        (
            view.select_from::<Container>(|c| c.minion == me.private_ip),
            view.select_from::<Connection>(|_| true),
        )
    };
    forwarder.replace(forwarding_rules(&ctx.counters, &containers, &connections));
}

/// Master-side placement: assign every unassigned container a worker and an
/// IP, subject to the blueprint's placement rules.
fn assign_placements(ctx: &Context) {
    let mut view = ctx
        .db
        .txn(&[TableId::Blueprint, TableId::Machine, TableId::Container]);
    let placements = view
        .select_from::<BlueprintRow>(|_| true)
        .pop()
        .map(|row| row.blueprint.placements)
        .unwrap_or_default();
    let workers =
        view.select_from::<Machine>(|m| m.role == Role::Worker && !m.private_ip.is_empty());
    let containers = view.select_from::<Container>(|_| true);
    for assigned in place(&containers, &workers, &placements) {
        view.commit(assigned);
    }
}

/// Pure placement function: every satisfiable container gets a non-empty
/// minion and IP. Spreading is least-loaded-first, ties broken by worker IP
/// so the outcome is deterministic.
pub fn place(
    containers: &[Container],
    workers: &[Machine],
    placements: &[Placement],
) -> Vec<Container> {
    let mut load: BTreeMap<String, usize> = workers
        .iter()
        .map(|w| (w.private_ip.clone(), 0))
        .collect();
    let mut host_worker: HashMap<String, String> = HashMap::new();
    let mut used_ips: HashSet<String> = containers
        .iter()
        .filter(|c| !c.ip.is_empty())
        .map(|c| c.ip.clone())
        .collect();
    for c in containers.iter().filter(|c| !c.minion.is_empty()) {
        if let Some(count) = load.get_mut(&c.minion) {
            *count += 1;
        }
        if !c.hostname.is_empty() {
            host_worker.insert(c.hostname.clone(), c.minion.clone());
        }
    }

    let mut next_ip = u32::from(Ipv4Addr::new(10, 0, 0, 1));
    let mut assigned = Vec::new();
    for c in containers.iter().filter(|c| c.minion.is_empty()) {
        let candidate = workers
            .iter()
            .filter(|w| allowed(c, w, placements, &host_worker))
            .min_by_key(|w| {
                (
                    load.get(&w.private_ip).copied().unwrap_or(0),
                    w.private_ip.clone(),
                )
            });
        let Some(worker) = candidate else {
            debug!(hostname = %c.hostname, "no worker satisfies placement constraints");
            continue;
        };

        let mut row = c.clone();
        row.minion = worker.private_ip.clone();
        if row.ip.is_empty() {
            row.ip = allocate_ip(&mut next_ip, &mut used_ips);
        }
        *load.entry(row.minion.clone()).or_insert(0) += 1;
        if !row.hostname.is_empty() {
            host_worker.insert(row.hostname.clone(), row.minion.clone());
        }
        assigned.push(row);
    }
    assigned
}

fn allowed(
    c: &Container,
    w: &Machine,
    placements: &[Placement],
    host_worker: &HashMap<String, String>,
) -> bool {
    if c.hostname.is_empty() {
        return true;
    }
    for p in placements {
        if p.target == c.hostname {
            if !p.provider.is_empty() && p.provider != w.provider.to_string() {
                return false;
            }
            if !p.size.is_empty() && p.size != w.size {
                return false;
            }
            if !p.region.is_empty() && p.region != w.region {
                return false;
            }
            if p.exclusive
                && host_worker
                    .get(&p.other)
                    .is_some_and(|ip| *ip == w.private_ip)
            {
                return false;
            }
        }
        // Exclusivity binds in both directions.
        if p.exclusive
            && p.other == c.hostname
            && host_worker
                .get(&p.target)
                .is_some_and(|ip| *ip == w.private_ip)
        {
            return false;
        }
    }
    true
}

fn allocate_ip(next: &mut u32, used: &mut HashSet<String>) -> String {
    loop {
        *next += 1;
        let ip = Ipv4Addr::from(*next).to_string();
        if used.insert(ip.clone()) {
            return ip;
        }
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use drover_client::blueprint::Image;

    use super::*;

    fn db_container(image: &str, ip: &str) -> Container {
        Container {
            image: Image {
                name: image.into(),
                dockerfile: String::new(),
            },
            ip: ip.into(),
            ..Default::default()
        }
    }

    fn dk_container(image: &str, ip: &str) -> DkContainer {
        let mut labels = BTreeMap::new();
        labels.insert(CONTAINER_LABEL.to_owned(), String::new());
        labels.insert(FILES_HASH_LABEL.to_owned(), files_hash(&BTreeMap::new()));
        DkContainer {
            id: "dk-1".into(),
            image: image.into(),
            ip: ip.into(),
            labels,
            ..Default::default()
        }
    }

    #[test]
    fn matching_containers_score_zero() {
        assert_eq!(
            sync_score(&db_container("alpine", "10.0.0.2"), &dk_container("alpine", "10.0.0.2")),
            0
        );
    }

    #[test]
    fn env_mismatch_is_incompatible() {
        let mut dbc = db_container("alpine", "10.0.0.2");
        dbc.env.insert("A".into(), "1".into());
        let mut dkc = dk_container("alpine", "10.0.0.2");
        dkc.env.insert("A".into(), "2".into());
        assert_eq!(sync_score(&dbc, &dkc), -1);
    }

    #[test]
    fn ip_mismatch_is_incompatible() {
        assert_eq!(
            sync_score(&db_container("alpine", "10.0.0.2"), &dk_container("alpine", "10.0.0.3")),
            -1
        );
    }

    #[test]
    fn digest_wins_over_name_when_resolved() {
        let mut dbc = db_container("alpine", "10.0.0.2");
        dbc.image_id = "sha256:aaa".into();
        let mut dkc = dk_container("renamed", "10.0.0.2");
        dkc.image_id = "sha256:aaa".into();
        assert_eq!(sync_score(&dbc, &dkc), 0);

        dkc.image_id = "sha256:bbb".into();
        assert_eq!(sync_score(&dbc, &dkc), -1);
    }

    #[test]
    fn command_forms() {
        let mut dkc = dk_container("alpine", "10.0.0.2");
        dkc.path = "/bin/sh".into();
        dkc.args = vec!["-c".into(), "sleep 1".into()];

        let mut dbc = db_container("alpine", "10.0.0.2");
        // Empty command accepts the image default.
        assert_eq!(sync_score(&dbc, &dkc), 0);
        // Arguments alone.
        dbc.command = vec!["-c".into(), "sleep 1".into()];
        assert_eq!(sync_score(&dbc, &dkc), 0);
        // Entrypoint plus arguments.
        dbc.command = vec!["/bin/sh".into(), "-c".into(), "sleep 1".into()];
        assert_eq!(sync_score(&dbc, &dkc), 0);
        // Anything else is incompatible.
        dbc.command = vec!["/bin/bash".into()];
        assert_eq!(sync_score(&dbc, &dkc), -1);
    }

    fn worker(ip: &str) -> Machine {
        Machine {
            role: Role::Worker,
            private_ip: ip.into(),
            ..Default::default()
        }
    }

    fn named_container(hostname: &str) -> Container {
        Container {
            hostname: hostname.into(),
            ..Default::default()
        }
    }

    #[test]
    fn placement_spreads_by_load() {
        let workers = vec![worker("10.1.0.1"), worker("10.1.0.2")];
        let containers = vec![named_container("a"), named_container("b")];
        let placed = place(&containers, &workers, &[]);
        assert_eq!(placed.len(), 2);
        assert_ne!(placed[0].minion, placed[1].minion);
        assert!(placed.iter().all(|c| !c.ip.is_empty()));
        assert_ne!(placed[0].ip, placed[1].ip);
    }

    #[test]
    fn exclusive_placement_separates_containers() {
        let workers = vec![worker("10.1.0.1")];
        let containers = vec![named_container("a"), named_container("b")];
        let rules = vec![Placement {
            target: "a".into(),
            exclusive: true,
            other: "b".into(),
            ..Default::default()
        }];
        let placed = place(&containers, &workers, &rules);
        // Only one of the two fits on the single worker.
        assert_eq!(placed.len(), 1);
    }

    #[test]
    fn provider_constraint_filters_workers() {
        let mut amazon = worker("10.1.0.1");
        amazon.provider = drover_client::ProviderKind::Amazon;
        let mut google = worker("10.1.0.2");
        google.provider = drover_client::ProviderKind::Google;

        let rules = vec![Placement {
            target: "a".into(),
            provider: "Google".into(),
            ..Default::default()
        }];
        let placed = place(&[named_container("a")], &[amazon, google], &rules);
        assert_eq!(placed.len(), 1);
        assert_eq!(placed[0].minion, "10.1.0.2");
    }

    #[test]
    fn assigned_containers_are_left_alone() {
        let workers = vec![worker("10.1.0.1")];
        let mut c = named_container("a");
        c.minion = "10.1.0.9".into();
        let placed = place(&[c], &workers, &[]);
        assert!(placed.is_empty());
    }
}
