//! The per-(provider, region) cloud reconciler.
//!
//! Each loop enumerates the provider's live instances, matches them against
//! the machine table in two phases (actual ↔ database, then desired ↔
//! actual), and issues boot / terminate / floating-IP / ACL operations so
//! the cloud converges on the blueprint. Provider errors are logged and the
//! iteration gives up; the next tick re-derives the plan from fresh state,
//! so nothing is ever retried in a tight loop.

use std::time::Duration;

use tokio::time::sleep;
use tracing::{debug, info, info_span, warn, Instrument};

use drover_client::blueprint::Blueprint;
use drover_client::{ProviderKind, PUBLIC};
use drover_cloud::size::pick_best_size;
use drover_cloud::{default_region, Provider, DEFAULT_DISK_SIZE_GIB};
use drover_db::{join, Acl, BlueprintRow, Machine, MachineStatus, TableId, View};
use drover_errors::{DroverError, DroverResult};

use crate::shutdown::ShutdownReceiver;
use crate::Context;

const MODULE: &str = "cloud";

/// Baseline re-reconcile interval absent any datastore change.
const RECONCILE_INTERVAL: Duration = Duration::from_secs(60);

/// How long a machine may sit in booting or stopping before the stale-boot
/// GC removes its row.
const BOOT_GRACE_PERIOD: Duration = Duration::from_secs(300);

/// Expedited re-trigger backoff after a mutating iteration: 1 s, 2 s, … 10 s.
const EXPEDITE_STEP: Duration = Duration::from_secs(1);
const EXPEDITE_MAX: Duration = Duration::from_secs(10);

/// What one planning pass decided to do to the cloud. Accumulated inside the
/// transaction, applied outside it.
#[derive(Debug, Default)]
struct Plan {
    boots: Vec<Machine>,
    stops: Vec<Machine>,
    ip_updates: Vec<Machine>,
    acls: Vec<Acl>,
}

impl Plan {
    /// Whether this pass asks the cloud to change anything. ACLs are only
    /// re-pushed in a quiescent pass, so they do not count.
    fn mutated(&self) -> bool {
        !self.boots.is_empty() || !self.stops.is_empty() || !self.ip_updates.is_empty()
    }
}

pub struct CloudReconciler {
    ctx: Context,
    kind: ProviderKind,
    region: String,
    namespace: String,
    provider: Box<dyn Provider>,
}

impl CloudReconciler {
    pub fn new(
        ctx: Context,
        kind: ProviderKind,
        region: String,
        namespace: String,
    ) -> DroverResult<Self> {
        let provider = ctx.providers.new_provider(kind, &region, &namespace)?;
        Ok(CloudReconciler {
            ctx,
            kind,
            region,
            namespace,
            provider,
        })
    }

    /// Drive this (provider, region) until shutdown.
    pub async fn run(mut self, mut shutdown: ShutdownReceiver) {
        let mut trigger = self
            .ctx
            .db
            .trigger_tick(RECONCILE_INTERVAL, &[TableId::Blueprint, TableId::Machine]);
        let mut expedite = Duration::ZERO;
        info!(provider = %self.kind, region = %self.region, "cloud reconciler starting");
        loop {
            let span = info_span!("reconcile", provider = %self.kind, region = %self.region);
            let mutated = self.run_once().instrument(span).await;

            // Fast convergence after a change, idle backoff otherwise.
            expedite = if mutated {
                (expedite + EXPEDITE_STEP).min(EXPEDITE_MAX)
            } else {
                Duration::ZERO
            };

            tokio::select! {
                _ = shutdown.recv() => break,
                _ = trigger.recv() => {}
                _ = sleep(expedite), if expedite > Duration::ZERO => {}
            }
        }
        debug!(provider = %self.kind, region = %self.region, "cloud reconciler exiting");
    }

    /// One reconciliation pass. Returns whether any cloud mutation was
    /// requested.
    pub async fn run_once(&mut self) -> bool {
        self.ctx.counters.inc(MODULE, "List");
        let cloud_machines = match self.provider.list().await {
            Ok(machines) => machines,
            Err(error) => {
                self.ctx.counters.inc(MODULE, "Error");
                warn!(%error, "failed to list instances");
                return false;
            }
        };

        let plan = {
            let mut view =
                self.ctx
                    .db
                    .txn(&[TableId::Blueprint, TableId::Machine, TableId::Acl]);
            match self.plan(&mut view, cloud_machines) {
                Ok(plan) => plan,
                Err(DroverError::NamespaceChanged { expected, found }) => {
                    // Abort without side effects; the controller will cancel
                    // this loop shortly.
                    debug!(%expected, %found, "namespace changed under reconciler");
                    return false;
                }
                Err(error) => {
                    self.ctx.counters.inc(MODULE, "Error");
                    warn!(%error, "planning failed");
                    return false;
                }
            }
        };

        let mutated = plan.mutated();
        self.apply(plan).await;
        mutated
    }

    /// Derive the full plan inside one transaction. The transaction commits
    /// the database's view of the world; the returned plan carries the
    /// provider calls to make after the locks are released.
    fn plan(&self, view: &mut View<'_>, cloud_machines: Vec<Machine>) -> DroverResult<Plan> {
        let blueprint = match view.select_from::<BlueprintRow>(|_| true).pop() {
            Some(row) => {
                if row.blueprint.namespace != self.namespace {
                    return Err(DroverError::NamespaceChanged {
                        expected: self.namespace.clone(),
                        found: row.blueprint.namespace,
                    });
                }
                Some(row.blueprint)
            }
            // A missing blueprint means no desired machines: stop everything.
            None => None,
        };

        let now = self.ctx.clock.now();

        for machine in view.select_from::<Machine>(|m| self.owns(m)) {
            let waiting = matches!(
                machine.status,
                MachineStatus::Booting | MachineStatus::Stopping
            );
            if waiting && now.saturating_sub(machine.status_time) > BOOT_GRACE_PERIOD {
                info!(machine = machine.id, status = %machine.status, "removing stale machine");
                view.remove(&machine);
            }
        }

        self.merge_cloud_state(view, cloud_machines);

        let mut plan = self.plan_desired(view, blueprint.as_ref(), now);
        plan.acls = derive_acls(view, blueprint.as_ref());
        Ok(plan)
    }

    /// Phase 1: reconcile what the cloud reports into the machine table.
    fn merge_cloud_state(&self, view: &mut View<'_>, cloud_machines: Vec<Machine>) {
        let db_machines = view.select_from::<Machine>(|m| self.owns(m));
        let joined = join(db_machines, cloud_machines, score_actual);

        for (mut db, cloud) in joined.pairs {
            // Copy the cloud-observed fields, preserving identity and
            // foreman-owned state.
            db.cloud_id = cloud.cloud_id;
            db.public_ip = cloud.public_ip;
            db.private_ip = cloud.private_ip;
            db.size = cloud.size;
            db.disk_size = cloud.disk_size;
            db.preemptible = cloud.preemptible;
            db.floating_ip = cloud.floating_ip;
            view.commit(db);
        }

        for cloud in joined.right {
            let inserted: Machine = view.insert();
            let mut row = cloud;
            row.id = inserted.id;
            row.provider = self.kind;
            row.region = self.region.clone();
            view.commit(row);
        }

        for db in joined.left {
            // Still waiting for the cloud to acknowledge the boot.
            if db.status != MachineStatus::Booting {
                view.remove(&db);
            }
        }
    }

    /// Phase 2: reconcile the blueprint's desires against the machine table,
    /// accumulating boots, stops, and floating-IP updates.
    fn plan_desired(&self, view: &mut View<'_>, blueprint: Option<&Blueprint>, now: Duration) -> Plan {
        let mut plan = Plan::default();
        let desired = self.desired_machines(blueprint);
        let db_machines = view.select_from::<Machine>(|m| self.owns(m));
        let joined = join(desired, db_machines, score_desired);

        for (want, mut have) in joined.pairs {
            let ip_drifted = have.floating_ip != want.floating_ip;
            have.desired_role = want.desired_role;
            have.ssh_keys = want.ssh_keys.clone();
            have.floating_ip = want.floating_ip.clone();
            if ip_drifted && have.booted() {
                plan.ip_updates.push(have.clone());
            }
            view.commit(have);
        }

        for want in joined.left {
            let inserted: Machine = view.insert();
            let mut row = want;
            row.id = inserted.id;
            row.set_status(MachineStatus::Booting, now);
            view.commit(row.clone());
            plan.boots.push(row);
        }

        for mut have in joined.right {
            if !have.booted() {
                view.remove(&have);
            } else {
                // Re-issued every pass until the instance disappears from
                // list(); terminate is idempotent.
                have.set_status(MachineStatus::Stopping, now);
                view.commit(have.clone());
                plan.stops.push(have);
            }
        }

        plan
    }

    /// The machines the blueprint wants in this (provider, region), with
    /// defaults substituted and sizes chosen.
    fn desired_machines(&self, blueprint: Option<&Blueprint>) -> Vec<Machine> {
        let Some(blueprint) = blueprint else {
            return Vec::new();
        };

        let mut desired = Vec::new();
        for bm in &blueprint.machines {
            let region = if bm.region.is_empty() {
                default_region(bm.provider).to_owned()
            } else {
                bm.region.clone()
            };
            if bm.provider != self.kind || region != self.region {
                continue;
            }

            let size = if bm.size.is_empty() {
                match pick_best_size(self.kind, bm.cpu, bm.ram, blueprint.max_price) {
                    Some(size) => size,
                    None => {
                        self.ctx.counters.inc(MODULE, "Unsatisfiable Size");
                        warn!(
                            provider = %self.kind,
                            cpu_min = bm.cpu.min,
                            ram_min = bm.ram.min,
                            "no instance size satisfies the machine's constraints; skipping"
                        );
                        continue;
                    }
                }
            } else {
                bm.size.clone()
            };

            let mut ssh_keys = bm.ssh_keys.clone();
            if let Some(admin_key) = &self.ctx.admin_ssh_key {
                ssh_keys.push(admin_key.clone());
            }

            desired.push(Machine {
                desired_role: bm.role,
                provider: self.kind,
                region: region.clone(),
                size,
                disk_size: if bm.disk_size == 0 {
                    DEFAULT_DISK_SIZE_GIB
                } else {
                    bm.disk_size
                },
                preemptible: bm.preemptible,
                floating_ip: bm.floating_ip.clone(),
                ssh_keys,
                ..Default::default()
            });
        }
        desired
    }

    /// Apply the accumulated plan to the provider. Each batch failure is
    /// logged and abandoned until the next tick.
    async fn apply(&mut self, plan: Plan) {
        let mutated = plan.mutated();
        let Plan {
            boots,
            stops,
            ip_updates,
            acls,
        } = plan;

        if !boots.is_empty() {
            self.ctx.counters.inc(MODULE, "Boot");
            info!(count = boots.len(), "booting machines");
            if let Err(error) = self.provider.boot(boots).await {
                self.ctx.counters.inc(MODULE, "Error");
                warn!(%error, "boot failed");
            }
        }
        if !stops.is_empty() {
            self.ctx.counters.inc(MODULE, "Stop");
            info!(count = stops.len(), "stopping machines");
            if let Err(error) = self.provider.stop(stops).await {
                self.ctx.counters.inc(MODULE, "Error");
                warn!(%error, "stop failed");
            }
        }
        if !ip_updates.is_empty() {
            self.ctx.counters.inc(MODULE, "UpdateFloatingIPs");
            if let Err(error) = self.provider.update_floating_ips(ip_updates).await {
                self.ctx.counters.inc(MODULE, "Error");
                warn!(%error, "floating IP update failed");
            }
        }

        // ACLs are only re-pushed in a quiescent pass, to avoid racing
        // provisioning.
        if !mutated {
            self.ctx.counters.inc(MODULE, "SetACLs");
            let acls = resolve_local(acls, &self.ctx.my_public_ip);
            if let Err(error) = self.provider.set_acls(acls).await {
                self.ctx.counters.inc(MODULE, "Error");
                warn!(%error, "ACL update failed");
            }
        }
    }

    fn owns(&self, machine: &Machine) -> bool {
        machine.provider == self.kind && machine.region == self.region
    }
}

/// Phase 1 score: prefer an exact cloud-ID match, then allow an unclaimed
/// database row (no cloud ID yet) whose shape matches what the cloud
/// reports. A zero database disk size accepts any reported size.
fn score_actual(db: &Machine, cloud: &Machine) -> i64 {
    if !db.cloud_id.is_empty() {
        return if db.cloud_id == cloud.cloud_id { 0 } else { -1 };
    }
    let shape_matches = db.size == cloud.size
        && db.preemptible == cloud.preemptible
        && (db.disk_size == 0 || db.disk_size == cloud.disk_size);
    if shape_matches {
        1
    } else {
        -1
    }
}

/// Phase 2 score: incompatible on size or preemptibility mismatch, on a
/// reported role conflicting with the desired one, or on a disk-size
/// mismatch for a row the cloud has not yet acknowledged. A live instance
/// with a different disk size is left alone (never rebooted or resized).
/// Among compatible pairs, prefer a matching reported role, then a matching
/// desired role, then a matching floating IP.
fn score_desired(want: &Machine, have: &Machine) -> i64 {
    use drover_client::Role;

    if want.size != have.size || want.preemptible != have.preemptible {
        return -1;
    }
    if !have.booted() && want.disk_size != have.disk_size {
        return -1;
    }
    if have.role != Role::None && have.role != want.desired_role {
        return -1;
    }

    let mut score = 0;
    if have.role != want.desired_role {
        score += 4;
    }
    if have.desired_role != want.desired_role {
        score += 2;
    }
    if have.floating_ip != want.floating_ip {
        score += 1;
    }
    score
}

/// Derive the ingress rule set from the blueprint and mirror it into the ACL
/// table: every admin CIDR may reach everything, and every connection
/// involving the public Internet opens its ports to the world.
fn derive_acls(view: &mut View<'_>, blueprint: Option<&Blueprint>) -> Vec<Acl> {
    let mut derived: Vec<Acl> = Vec::new();
    if let Some(blueprint) = blueprint {
        for cidr in &blueprint.admin_acl {
            derived.push(Acl {
                cidr_ip: cidr.clone(),
                min_port: 1,
                max_port: 65535,
                ..Default::default()
            });
        }
        for conn in &blueprint.connections {
            if conn.from == PUBLIC || conn.to == PUBLIC {
                derived.push(Acl {
                    cidr_ip: "0.0.0.0/0".to_owned(),
                    min_port: conn.min_port,
                    max_port: conn.max_port,
                    ..Default::default()
                });
            }
        }
    }
    derived.sort_by(|a, b| {
        (&a.cidr_ip, a.min_port, a.max_port).cmp(&(&b.cidr_ip, b.min_port, b.max_port))
    });
    derived.dedup_by(|a, b| (&a.cidr_ip, a.min_port, a.max_port) == (&b.cidr_ip, b.min_port, b.max_port));

    let existing = view.select_from::<Acl>(|_| true);
    let existing_set: Vec<(&str, u16, u16)> = existing
        .iter()
        .map(|a| (a.cidr_ip.as_str(), a.min_port, a.max_port))
        .collect();
    let derived_set: Vec<(&str, u16, u16)> = derived
        .iter()
        .map(|a| (a.cidr_ip.as_str(), a.min_port, a.max_port))
        .collect();
    if existing_set != derived_set {
        for acl in &existing {
            view.remove(acl);
        }
        for acl in &derived {
            let inserted: Acl = view.insert();
            let mut row = acl.clone();
            row.id = inserted.id;
            view.commit(row);
        }
    }

    derived
}

/// Substitute the reserved `local` token with the daemon's own public IP.
fn resolve_local(acls: Vec<Acl>, my_public_ip: &str) -> Vec<Acl> {
    acls.into_iter()
        .map(|mut acl| {
            if acl.cidr_ip == drover_client::LOCAL {
                acl.cidr_ip = format!("{my_public_ip}/32");
            }
            acl
        })
        .collect()
}
