//! The foreman: one long-lived management channel per booted machine.
//!
//! A per-machine loop dials the minion, pushes the configuration derived
//! from the blueprint, reads back the minion's self-reported role, and
//! drives the machine's connection status. All writes back into the machine
//! table are funnelled through a single coalescing task, which bounds the
//! number of write transactions under high churn regardless of fleet size.

use std::collections::{BTreeMap, HashMap};
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::time::{sleep, timeout};
use tracing::{debug, info, warn};

use drover_client::minion::{MINION_CONNECT_TIMEOUT, MINION_RPC_TIMEOUT};
use drover_client::{MinionClient, MinionConfig, Role};
use drover_db::{BlueprintRow, Etcd, Machine, MachineStatus, RowId, TableId};

use crate::shutdown::{self, ShutdownReceiver, ShutdownSender};
use crate::Context;

const MODULE: &str = "foreman";

/// Re-sync interval while a minion is connected.
const SLOW_TICK: Duration = Duration::from_secs(60);

/// Reconnect interval while a minion is not connected.
const FAST_TICK: Duration = Duration::from_secs(5);

/// How long the coalescer waits after the first pending update before
/// applying the batch. Bounds machine-table write transactions to roughly
/// four per second under sustained churn.
const COALESCE_WINDOW: Duration = Duration::from_millis(250);

/// One pending write-back for a machine row. Multiple pending updates for
/// the same machine merge, last writer per field winning.
#[derive(Clone, Debug, Default)]
pub struct MachineUpdate {
    pub machine_id: RowId,
    pub status: Option<MachineStatus>,
    pub role: Option<Role>,
}

/// Spawn the update coalescer; returns the channel foremen feed.
pub fn spawn_coalescer(ctx: Context) -> mpsc::Sender<MachineUpdate> {
    let (tx, mut rx) = mpsc::channel::<MachineUpdate>(1024);
    tokio::spawn(async move {
        while let Some(first) = rx.recv().await {
            sleep(COALESCE_WINDOW).await;
            let mut updates = vec![first];
            while let Ok(update) = rx.try_recv() {
                updates.push(update);
            }
            apply_updates(&ctx, updates);
        }
    });
    tx
}

/// Apply a drained batch in one transaction. FIFO per machine: later updates
/// for the same machine overwrite earlier ones field by field, and each
/// machine sees at most one commit.
fn apply_updates(ctx: &Context, updates: Vec<MachineUpdate>) {
    let now = ctx.clock.now();
    let mut view = ctx.db.txn(&[TableId::Machine]);
    let mut pending: BTreeMap<RowId, Machine> = BTreeMap::new();
    for update in updates {
        let row = match pending.remove(&update.machine_id) {
            Some(row) => Some(row),
            None => view.get::<Machine>(update.machine_id),
        };
        // The machine may have been removed since the update was queued.
        let Some(mut row) = row else { continue };
        if let Some(status) = update.status {
            row.set_status(status, now);
        }
        if let Some(role) = update.role {
            row.role = role;
        }
        pending.insert(update.machine_id, row);
    }
    for row in pending.into_values() {
        view.commit(row);
    }
}

/// Supervise the per-machine foreman tasks: spawn one per machine with a
/// public IP that is not stopping, and cancel it when the row disappears or
/// is marked stopping. Also maintains the etcd membership cache.
pub async fn run(ctx: Context, mut shutdown: ShutdownReceiver) {
    let updates = spawn_coalescer(ctx.clone());
    let mut trigger = ctx
        .db
        .trigger_tick(SLOW_TICK, &[TableId::Machine, TableId::Blueprint]);
    let mut foremen: HashMap<RowId, ShutdownSender> = HashMap::new();

    loop {
        let machines = ctx.db.select::<Machine>(|m| {
            !m.public_ip.is_empty() && m.status != MachineStatus::Stopping
        });

        sync_etcd_members(&ctx);

        for machine in &machines {
            foremen.entry(machine.id).or_insert_with(|| {
                info!(machine = machine.id, public_ip = %machine.public_ip, "starting foreman");
                let (stop_tx, stop_rx) = shutdown::channel();
                let foreman = Foreman {
                    ctx: ctx.clone(),
                    machine_id: machine.id,
                    updates: updates.clone(),
                    client: None,
                };
                tokio::spawn(foreman.run(stop_rx));
                stop_tx
            });
        }
        foremen.retain(|id, _| machines.iter().any(|m| m.id == *id));

        tokio::select! {
            _ = shutdown.recv() => break,
            _ = trigger.recv() => {}
        }
    }
}

/// Mirror the masters' private IPs into the etcd membership cache.
fn sync_etcd_members(ctx: &Context) {
    let mut view = ctx.db.txn(&[TableId::Machine, TableId::Etcd]);
    let members: Vec<String> = view
        .select_from::<Machine>(|m| m.desired_role == Role::Master && !m.private_ip.is_empty())
        .into_iter()
        .map(|m| m.private_ip)
        .collect();
    match view.select_from::<Etcd>(|_| true).pop() {
        Some(mut row) => {
            row.members = members;
            view.commit(row);
        }
        None => {
            let mut row: Etcd = view.insert();
            row.members = members;
            view.commit(row);
        }
    }
}

/// The per-machine control loop.
pub struct Foreman {
    ctx: Context,
    machine_id: RowId,
    updates: mpsc::Sender<MachineUpdate>,
    client: Option<Box<dyn MinionClient>>,
}

impl Foreman {
    pub fn new(ctx: Context, machine_id: RowId, updates: mpsc::Sender<MachineUpdate>) -> Self {
        Foreman {
            ctx,
            machine_id,
            updates,
            client: None,
        }
    }

    pub async fn run(mut self, mut shutdown: ShutdownReceiver) {
        loop {
            let Some(connected) = self.step().await else {
                debug!(machine = self.machine_id, "foreman exiting");
                return;
            };
            let tick = if connected { SLOW_TICK } else { FAST_TICK };
            tokio::select! {
                _ = shutdown.recv() => return,
                _ = sleep(tick) => {}
            }
        }
    }

    /// One foreman iteration. Returns `None` when the machine is gone or
    /// stopping and the loop should exit, otherwise whether the minion is
    /// currently connected and in sync.
    pub async fn step(&mut self) -> Option<bool> {
        let (machine, etcd_members, blueprint_text) = {
            let view = self.ctx.db.txn(&[TableId::Machine, TableId::Blueprint]);
            let machine = view.get::<Machine>(self.machine_id)?;
            if machine.status == MachineStatus::Stopping {
                return None;
            }
            let etcd_members: Vec<String> = view
                .select_from::<Machine>(|m| {
                    m.desired_role == Role::Master && !m.private_ip.is_empty()
                })
                .into_iter()
                .map(|m| m.private_ip)
                .collect();
            let blueprint_text = view
                .select_from::<BlueprintRow>(|_| true)
                .pop()
                .and_then(|row| serde_json::to_string(&row.blueprint).ok())
                .unwrap_or_default();
            (machine, etcd_members, blueprint_text)
        };

        if self.client.is_none() {
            self.send(MachineUpdate {
                machine_id: self.machine_id,
                status: Some(MachineStatus::Connecting),
                ..Default::default()
            });
            self.ctx.counters.inc(MODULE, "Dial");
            match timeout(
                MINION_CONNECT_TIMEOUT,
                self.ctx.minions.dial(&machine.public_ip),
            )
            .await
            {
                Ok(Ok(client)) => {
                    info!(machine = self.machine_id, public_ip = %machine.public_ip, "minion connected");
                    self.client = Some(client);
                    self.send(MachineUpdate {
                        machine_id: self.machine_id,
                        status: Some(MachineStatus::Connected),
                        ..Default::default()
                    });
                }
                Ok(Err(error)) => {
                    self.ctx.counters.inc(MODULE, "Error");
                    debug!(machine = self.machine_id, %error, "dial failed");
                    return Some(false);
                }
                Err(_) => {
                    self.ctx.counters.inc(MODULE, "Error");
                    debug!(machine = self.machine_id, "dial timed out");
                    return Some(false);
                }
            }
        }

        let Some(client) = self.client.as_deref() else {
            return Some(false);
        };

        self.ctx.counters.inc(MODULE, "GetMinionConfig");
        let reported = match timeout(MINION_RPC_TIMEOUT, client.get_minion_config()).await {
            Ok(Ok(config)) => config,
            Ok(Err(error)) => {
                self.ctx.counters.inc(MODULE, "Error");
                warn!(machine = self.machine_id, %error, "get config failed");
                return Some(self.reconnect());
            }
            Err(_) => {
                self.ctx.counters.inc(MODULE, "Error");
                warn!(machine = self.machine_id, "get config timed out");
                return Some(self.reconnect());
            }
        };

        if reported.role != Role::None && reported.role != machine.role {
            self.send(MachineUpdate {
                machine_id: self.machine_id,
                role: Some(reported.role),
                ..Default::default()
            });
        }

        let desired = MinionConfig {
            role: machine.desired_role,
            floating_ip: machine.floating_ip.clone(),
            private_ip: machine.private_ip.clone(),
            blueprint: blueprint_text,
            provider: machine.provider.to_string(),
            size: machine.size.clone(),
            region: machine.region.clone(),
            etcd_members,
            authorized_keys: machine.ssh_keys.clone(),
        };

        if desired != reported {
            self.ctx.counters.inc(MODULE, "SetMinionConfig");
            match timeout(MINION_RPC_TIMEOUT, client.set_minion_config(desired)).await {
                Ok(Ok(())) => {}
                Ok(Err(error)) => {
                    self.ctx.counters.inc(MODULE, "Error");
                    warn!(machine = self.machine_id, %error, "set config failed");
                    return Some(self.reconnect());
                }
                Err(_) => {
                    self.ctx.counters.inc(MODULE, "Error");
                    warn!(machine = self.machine_id, "set config timed out");
                    return Some(self.reconnect());
                }
            }
        }

        Some(true)
    }

    /// Drop the client and mark the machine reconnecting.
    fn reconnect(&mut self) -> bool {
        self.client = None;
        self.send(MachineUpdate {
            machine_id: self.machine_id,
            status: Some(MachineStatus::Reconnecting),
            ..Default::default()
        });
        false
    }

    fn send(&self, update: MachineUpdate) {
        // The channel is deep; if it is somehow full the next iteration will
        // re-derive an equivalent update anyway.
        let _ = self.updates.try_send(update);
    }
}
