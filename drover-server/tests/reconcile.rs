//! End-to-end reconciliation scenarios against in-memory fakes: a fake
//! cloud, a fake minion fleet, a fake Docker daemon, and a manually driven
//! clock.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use pretty_assertions::assert_eq;

use drover_client::blueprint::{
    Blueprint, BlueprintContainer, BlueprintMachine, Connection as BlueprintConnection, Image,
};
use drover_client::minion::{MinionClient, MinionConfig, MinionDialer};
use drover_client::{Counter, Counters, ProviderKind, Role};
use drover_cloud::{Provider, ProviderFactory};
use drover_db::{Acl, Connection, Container, Db, Machine, MachineStatus, MinionSelf, TableId};
use drover_errors::{DroverError, DroverResult};
use drover_server::controller::{self, foreman, CloudReconciler};
use drover_server::worker::docker::{
    files_hash, DkContainer, DockerClient, RunOptions, CONTAINER_LABEL, FILES_HASH_LABEL,
};
use drover_server::worker::network::{Forwarder, Forwarding};
use drover_server::worker::scheduler;
use drover_server::{Clock, Context, Daemon, MockClock};

// -- fakes -----------------------------------------------------------------

#[derive(Default)]
struct FakeCloud {
    machines: Mutex<Vec<Machine>>,
    boots: Mutex<Vec<Vec<Machine>>>,
    stops: Mutex<Vec<Vec<Machine>>>,
    ip_updates: Mutex<Vec<Vec<Machine>>>,
    acls: Mutex<Vec<Vec<Acl>>>,
}

impl FakeCloud {
    fn set_machines(&self, machines: Vec<Machine>) {
        *self.machines.lock() = machines;
    }

    fn boot_batches(&self) -> usize {
        self.boots.lock().len()
    }
}

struct FakeProvider(Arc<FakeCloud>);

#[async_trait]
impl Provider for FakeProvider {
    async fn list(&self) -> DroverResult<Vec<Machine>> {
        Ok(self.0.machines.lock().clone())
    }

    async fn boot(&self, machines: Vec<Machine>) -> DroverResult<()> {
        self.0.boots.lock().push(machines);
        Ok(())
    }

    async fn stop(&self, machines: Vec<Machine>) -> DroverResult<()> {
        self.0.stops.lock().push(machines);
        Ok(())
    }

    async fn update_floating_ips(&self, machines: Vec<Machine>) -> DroverResult<()> {
        self.0.ip_updates.lock().push(machines);
        Ok(())
    }

    async fn set_acls(&self, acls: Vec<Acl>) -> DroverResult<()> {
        self.0.acls.lock().push(acls);
        Ok(())
    }
}

struct FakeFactory(Arc<FakeCloud>);

impl ProviderFactory for FakeFactory {
    fn new_provider(
        &self,
        _kind: ProviderKind,
        _region: &str,
        _namespace: &str,
    ) -> DroverResult<Box<dyn Provider>> {
        Ok(Box::new(FakeProvider(self.0.clone())))
    }
}

#[derive(Default)]
struct FakeMinionState {
    reported: Mutex<MinionConfig>,
    set_configs: Mutex<Vec<MinionConfig>>,
    unreachable: Mutex<bool>,
}

struct FakeMinionClient(Arc<FakeMinionState>);

#[async_trait]
impl MinionClient for FakeMinionClient {
    async fn get_minion_config(&self) -> DroverResult<MinionConfig> {
        if *self.0.unreachable.lock() {
            return Err(DroverError::Rpc("connection reset".into()));
        }
        Ok(self.0.reported.lock().clone())
    }

    async fn set_minion_config(&self, config: MinionConfig) -> DroverResult<()> {
        if *self.0.unreachable.lock() {
            return Err(DroverError::Rpc("connection reset".into()));
        }
        self.0.set_configs.lock().push(config.clone());
        // The fake minion applies pushed configuration immediately, but its
        // reported role stays whatever the fleet was told to report.
        let mut reported = self.0.reported.lock();
        let role = reported.role;
        *reported = config;
        reported.role = role;
        Ok(())
    }

    async fn query_counters(&self) -> DroverResult<Vec<Counter>> {
        Ok(Vec::new())
    }
}

#[derive(Default)]
struct FakeFleet {
    minions: Mutex<HashMap<String, Arc<FakeMinionState>>>,
}

impl FakeFleet {
    fn add(&self, host: &str, role: Role) -> Arc<FakeMinionState> {
        let state = Arc::new(FakeMinionState::default());
        state.reported.lock().role = role;
        self.minions.lock().insert(host.to_owned(), state.clone());
        state
    }
}

#[async_trait]
impl MinionDialer for FakeFleet {
    async fn dial(&self, host: &str) -> DroverResult<Box<dyn MinionClient>> {
        match self.minions.lock().get(host) {
            Some(state) => Ok(Box::new(FakeMinionClient(state.clone()))),
            None => Err(DroverError::Rpc(format!("{host} unreachable"))),
        }
    }
}

#[derive(Default)]
struct FakeDocker {
    containers: Mutex<Vec<DkContainer>>,
    next_id: Mutex<u64>,
    removed: Mutex<Vec<String>>,
    launched: Mutex<Vec<RunOptions>>,
}

impl FakeDocker {
    fn seed(&self, container: DkContainer) {
        self.containers.lock().push(container);
    }
}

#[async_trait]
impl DockerClient for FakeDocker {
    async fn install_network_plugin(&self) -> DroverResult<()> {
        Ok(())
    }

    async fn list(&self, label: &str) -> DroverResult<Vec<DkContainer>> {
        Ok(self
            .containers
            .lock()
            .iter()
            .filter(|c| c.labels.contains_key(label))
            .cloned()
            .collect())
    }

    async fn run(&self, options: RunOptions) -> DroverResult<()> {
        self.launched.lock().push(options.clone());
        let mut next = self.next_id.lock();
        *next += 1;
        self.containers.lock().push(DkContainer {
            id: format!("dk-{}", *next),
            image: options.image,
            image_id: String::new(),
            ip: options.ip,
            path: String::new(),
            args: options.command,
            env: options.env,
            labels: options.labels,
            status: "running".into(),
            created: 1_700_000_000 + *next as i64,
            endpoint_id: format!("ep-{}", *next),
        });
        Ok(())
    }

    async fn remove(&self, id: &str) -> DroverResult<()> {
        self.removed.lock().push(id.to_owned());
        self.containers.lock().retain(|c| c.id != id);
        Ok(())
    }
}

#[derive(Default)]
struct RecordingForwarder {
    replaced: Mutex<Vec<Vec<Forwarding>>>,
}

impl Forwarder for RecordingForwarder {
    fn replace(&self, rules: Vec<Forwarding>) {
        self.replaced.lock().push(rules);
    }
}

// -- harness ---------------------------------------------------------------

struct Harness {
    ctx: Context,
    daemon: Daemon,
    cloud: Arc<FakeCloud>,
    fleet: Arc<FakeFleet>,
    clock: Arc<MockClock>,
}

fn harness() -> Harness {
    let cloud = Arc::new(FakeCloud::default());
    let fleet = Arc::new(FakeFleet::default());
    let clock = Arc::new(MockClock::new());
    let ctx = Context {
        db: Db::new(),
        counters: Counters::new(),
        clock: clock.clone(),
        providers: Arc::new(FakeFactory(cloud.clone())),
        minions: fleet.clone(),
        my_public_ip: "8.8.4.4".into(),
        admin_ssh_key: None,
    };
    Harness {
        daemon: Daemon::new(ctx.clone()),
        ctx,
        cloud,
        fleet,
        clock,
    }
}

fn worker_blueprint(namespace: &str) -> String {
    serde_json::to_string(&Blueprint {
        namespace: namespace.into(),
        machines: vec![BlueprintMachine {
            provider: ProviderKind::Amazon,
            role: Role::Worker,
            size: "m3.medium".into(),
            region: "us-west-1".into(),
            ..Default::default()
        }],
        ..Default::default()
    })
    .unwrap()
}

fn booted_instance(cloud_id: &str, public_ip: &str) -> Machine {
    Machine {
        cloud_id: cloud_id.into(),
        public_ip: public_ip.into(),
        private_ip: "10.0.1.5".into(),
        size: "m3.medium".into(),
        disk_size: 32,
        ..Default::default()
    }
}

fn reconciler(h: &Harness, namespace: &str) -> CloudReconciler {
    CloudReconciler::new(
        h.ctx.clone(),
        ProviderKind::Amazon,
        "us-west-1".into(),
        namespace.into(),
    )
    .unwrap()
}

// -- scenarios -------------------------------------------------------------

/// S1: a single worker boots, is acknowledged by the cloud, gets a foreman,
/// and converges to connected with its reported role.
#[tokio::test(start_paused = true)]
async fn single_worker_boot() {
    let h = harness();
    h.daemon.deploy(&worker_blueprint("prod")).unwrap();
    let mut cloud = reconciler(&h, "prod");

    // First pass boots the machine.
    assert!(cloud.run_once().await);
    assert_eq!(h.cloud.boot_batches(), 1);
    let booted = h.cloud.boots.lock()[0].clone();
    assert_eq!(booted.len(), 1);
    assert_eq!(booted[0].size, "m3.medium");
    let row = h.ctx.db.select::<Machine>(|_| true).pop().unwrap();
    assert_eq!(row.status, MachineStatus::Booting);
    assert_eq!(row.desired_role, Role::Worker);

    // The cloud acknowledges; the row absorbs the instance's identity.
    h.cloud.set_machines(vec![booted_instance("i-1", "1.2.3.4")]);
    cloud.run_once().await;
    let row = h.ctx.db.select::<Machine>(|_| true).pop().unwrap();
    assert_eq!(row.cloud_id, "i-1");
    assert_eq!(row.public_ip, "1.2.3.4");

    // A foreman attaches and the minion reports its role.
    h.fleet.add("1.2.3.4", Role::Worker);
    let updates = foreman::spawn_coalescer(h.ctx.clone());
    let mut foreman = foreman::Foreman::new(h.ctx.clone(), row.id, updates);
    assert_eq!(foreman.step().await, Some(true));

    tokio::time::sleep(Duration::from_millis(300)).await;
    let row = h.ctx.db.select::<Machine>(|_| true).pop().unwrap();
    assert_eq!(row.status, MachineStatus::Connected);
    assert_eq!(row.role, Role::Worker);
}

/// S2: a machine stuck in booting past the grace period is removed.
#[tokio::test]
async fn remove_stale_boot() {
    let h = harness();
    {
        let mut view = h.ctx.db.txn(&[TableId::Machine]);
        let mut m: Machine = view.insert();
        m.provider = ProviderKind::Amazon;
        m.region = "us-west-1".into();
        m.size = "m3.medium".into();
        m.set_status(MachineStatus::Booting, h.clock.now());
        view.commit(m);
    }

    h.clock.advance(Duration::from_secs(6 * 60));
    reconciler(&h, "").run_once().await;
    assert!(h.ctx.db.select::<Machine>(|_| true).is_empty());
}

/// S2 complement: a machine inside the grace period survives.
#[tokio::test]
async fn booting_machine_survives_grace_period() {
    let h = harness();
    h.daemon.deploy(&worker_blueprint("prod")).unwrap();
    let mut cloud = reconciler(&h, "prod");
    cloud.run_once().await;

    h.clock.advance(Duration::from_secs(60));
    cloud.run_once().await;
    assert_eq!(h.ctx.db.select::<Machine>(|_| true).len(), 1);
    // And the boot was not re-issued for a row already booting.
    assert_eq!(h.cloud.boot_batches(), 1);
}

/// S3: replacing the namespace removes every machine row in the same
/// transaction that commits the new blueprint.
#[tokio::test]
async fn namespace_switch_removes_machines() {
    let h = harness();
    h.daemon.deploy(&worker_blueprint("a")).unwrap();
    reconciler(&h, "a").run_once().await;
    assert_eq!(h.ctx.db.select::<Machine>(|_| true).len(), 1);

    h.daemon.deploy(&worker_blueprint("b")).unwrap();
    assert!(h.ctx.db.select::<Machine>(|_| true).is_empty());

    // The old loop aborts without side effects once it observes the switch.
    let stops_before = h.cloud.stops.lock().len();
    assert!(!reconciler(&h, "a").run_once().await);
    assert_eq!(h.cloud.stops.lock().len(), stops_before);
}

/// S4: floating-IP drift triggers an update batch naming the instance.
#[tokio::test]
async fn floating_ip_drift() {
    let h = harness();
    let mut blueprint: Blueprint =
        serde_json::from_str(&worker_blueprint("prod")).unwrap();
    blueprint.machines[0].floating_ip = "9.9.9.9".into();
    h.daemon
        .deploy(&serde_json::to_string(&blueprint).unwrap())
        .unwrap();

    h.cloud.set_machines(vec![booted_instance("i-1", "1.2.3.4")]);
    reconciler(&h, "prod").run_once().await;

    let updates = h.cloud.ip_updates.lock();
    assert_eq!(updates.len(), 1);
    assert_eq!(updates[0][0].cloud_id, "i-1");
    assert_eq!(updates[0][0].floating_ip, "9.9.9.9");
}

/// S5: a worker kills a container whose environment drifted and launches a
/// replacement, then absorbs the new Docker identity.
#[tokio::test]
async fn worker_sync_replaces_drifted_container() {
    let h = harness();
    {
        let mut view = h.ctx.db.txn(&[TableId::MinionSelf, TableId::Container]);
        let mut me: MinionSelf = view.insert();
        me.role = Role::Worker;
        me.private_ip = "10.9.0.1".into();
        view.commit(me);

        let mut c: Container = view.insert();
        c.image = Image {
            name: "alpine".into(),
            dockerfile: String::new(),
        };
        c.env.insert("A".into(), "1".into());
        c.ip = "10.0.0.2".into();
        c.minion = "10.9.0.1".into();
        view.commit(c);
    }

    let docker = FakeDocker::default();
    let mut labels = BTreeMap::new();
    labels.insert(CONTAINER_LABEL.to_owned(), String::new());
    labels.insert(FILES_HASH_LABEL.to_owned(), files_hash(&BTreeMap::new()));
    let mut env = BTreeMap::new();
    env.insert("A".to_owned(), "2".to_owned());
    docker.seed(DkContainer {
        id: "dk-stale".into(),
        image: "alpine".into(),
        ip: "10.0.0.2".into(),
        env,
        labels,
        ..Default::default()
    });

    let forwarder = RecordingForwarder::default();
    scheduler::run_once(&h.ctx, &docker, &forwarder).await;

    assert_eq!(docker.removed.lock().as_slice(), ["dk-stale"]);
    assert_eq!(docker.launched.lock().len(), 1);
    let row = h.ctx.db.select::<Container>(|_| true).pop().unwrap();
    assert_eq!(row.docker_id, "dk-1");
    assert!(!row.endpoint_id.is_empty());
}

/// S6: a public connection with a port range is omitted from the flow rules
/// and counted.
#[tokio::test]
async fn public_port_range_rejected() {
    let h = harness();
    {
        let mut view = h.ctx.db.txn(&[
            TableId::MinionSelf,
            TableId::Container,
            TableId::Connection,
        ]);
        let mut me: MinionSelf = view.insert();
        me.role = Role::Worker;
        me.private_ip = "10.9.0.1".into();
        view.commit(me);

        let mut c: Container = view.insert();
        c.hostname = "svc".into();
        c.ip = "10.0.0.3".into();
        c.minion = "10.9.0.1".into();
        c.docker_id = "dk-1".into();
        c.endpoint_id = "ep-1".into();
        view.commit(c);

        let mut conn: Connection = view.insert();
        conn.from = "public".into();
        conn.to = "svc".into();
        conn.min_port = 80;
        conn.max_port = 81;
        view.commit(conn);
    }

    // Seed Docker so the sync pass leaves the container alone.
    let docker = FakeDocker::default();
    let mut labels = BTreeMap::new();
    labels.insert(CONTAINER_LABEL.to_owned(), String::new());
    labels.insert(FILES_HASH_LABEL.to_owned(), files_hash(&BTreeMap::new()));
    docker.seed(DkContainer {
        id: "dk-1".into(),
        ip: "10.0.0.3".into(),
        labels,
        endpoint_id: "ep-1".into(),
        ..Default::default()
    });

    let forwarder = RecordingForwarder::default();
    scheduler::run_once(&h.ctx, &docker, &forwarder).await;

    let replaced = forwarder.replaced.lock();
    let rules = replaced.last().unwrap();
    assert_eq!(rules.len(), 1);
    assert!(rules[0].from_public.is_empty());
    assert_eq!(
        h.ctx
            .counters
            .get("network", "Unsupported Public Port Range"),
        1
    );
}

// -- invariants ------------------------------------------------------------

/// Submitting the same blueprint twice produces identical database contents
/// and no provider mutations on the second submit.
#[tokio::test]
async fn deploy_is_idempotent() {
    let h = harness();
    let text = worker_blueprint("prod");

    h.daemon.deploy(&text).unwrap();
    let mut cloud = reconciler(&h, "prod");
    cloud.run_once().await;
    let acked: Vec<Machine> = h.cloud.boots.lock()[0]
        .iter()
        .map(|m| {
            let mut acked = booted_instance("i-1", "1.2.3.4");
            acked.size = m.size.clone();
            acked.preemptible = m.preemptible;
            acked
        })
        .collect();
    h.cloud.set_machines(acked);
    cloud.run_once().await;
    let before = h.ctx.db.select::<Machine>(|_| true);

    h.daemon.deploy(&text).unwrap();
    let mutated = cloud.run_once().await;
    let after = h.ctx.db.select::<Machine>(|_| true);

    assert!(!mutated);
    assert_eq!(h.cloud.boot_batches(), 1);
    assert!(h.cloud.stops.lock().is_empty());
    assert!(h.cloud.ip_updates.lock().is_empty());
    assert_eq!(before, after);
}

/// A quiescent pass pushes ACLs with the `local` token resolved; a mutating
/// pass does not touch them.
#[tokio::test]
async fn acls_only_pushed_when_quiescent() {
    let h = harness();
    let mut blueprint: Blueprint = serde_json::from_str(&worker_blueprint("prod")).unwrap();
    blueprint.admin_acl = vec!["local".into(), "1.2.3.0/24".into()];
    h.daemon
        .deploy(&serde_json::to_string(&blueprint).unwrap())
        .unwrap();

    let mut cloud = reconciler(&h, "prod");
    assert!(cloud.run_once().await);
    assert!(h.cloud.acls.lock().is_empty());

    h.cloud.set_machines(vec![booted_instance("i-1", "1.2.3.4")]);
    assert!(!cloud.run_once().await);
    let pushed = h.cloud.acls.lock();
    let cidrs: Vec<&str> = pushed[0].iter().map(|a| a.cidr_ip.as_str()).collect();
    assert!(cidrs.contains(&"8.8.4.4/32"));
    assert!(cidrs.contains(&"1.2.3.0/24"));
    assert!(!cidrs.contains(&"local"));
}

/// Under a burst of foreman updates for one machine inside the coalescing
/// window, the datastore sees a single merged commit.
#[tokio::test(start_paused = true)]
async fn foreman_updates_coalesce() {
    let h = harness();
    let machine_id = {
        let mut view = h.ctx.db.txn(&[TableId::Machine]);
        let m: Machine = view.insert();
        m.id
    };

    let updates = foreman::spawn_coalescer(h.ctx.clone());
    for status in [
        MachineStatus::Connecting,
        MachineStatus::Connected,
        MachineStatus::Reconnecting,
        MachineStatus::Connecting,
        MachineStatus::Connected,
    ] {
        updates
            .send(foreman::MachineUpdate {
                machine_id,
                status: Some(status),
                ..Default::default()
            })
            .await
            .unwrap();
    }

    // Inside the window nothing has been applied yet.
    tokio::time::sleep(Duration::from_millis(100)).await;
    let row = h.ctx.db.select::<Machine>(|_| true).pop().unwrap();
    assert_eq!(row.status, MachineStatus::Unset);

    // After the window the burst lands as one merged commit.
    tokio::time::sleep(Duration::from_millis(200)).await;
    let row = h.ctx.db.select::<Machine>(|_| true).pop().unwrap();
    assert_eq!(row.status, MachineStatus::Connected);
}

/// A foreman exits once its machine is marked stopping, and a lost minion
/// moves the machine to reconnecting.
#[tokio::test(start_paused = true)]
async fn foreman_lifecycle() {
    let h = harness();
    let machine_id = {
        let mut view = h.ctx.db.txn(&[TableId::Machine]);
        let mut m: Machine = view.insert();
        m.public_ip = "1.2.3.4".into();
        view.commit(m.clone());
        m.id
    };
    let minion = h.fleet.add("1.2.3.4", Role::Worker);

    let updates = foreman::spawn_coalescer(h.ctx.clone());
    let mut foreman = foreman::Foreman::new(h.ctx.clone(), machine_id, updates);
    assert_eq!(foreman.step().await, Some(true));

    // The minion vanishes: the next step drops the client and reports
    // reconnecting.
    *minion.unreachable.lock() = true;
    assert_eq!(foreman.step().await, Some(false));
    tokio::time::sleep(Duration::from_millis(300)).await;
    let row = h.ctx.db.select::<Machine>(|_| true).pop().unwrap();
    assert_eq!(row.status, MachineStatus::Reconnecting);

    // Marking the machine stopping makes the foreman exit.
    {
        let mut view = h.ctx.db.txn(&[TableId::Machine]);
        let mut m: Machine = view.get(machine_id).unwrap();
        m.set_status(MachineStatus::Stopping, h.ctx.clock.now());
        view.commit(m);
    }
    assert_eq!(foreman.step().await, None);
}

/// The controller fans blueprint containers out and a master minion assigns
/// them to connected workers.
#[tokio::test]
async fn master_places_containers_on_workers() {
    let h = harness();
    let blueprint = Blueprint {
        namespace: "prod".into(),
        containers: vec![
            BlueprintContainer {
                hostname: "web".into(),
                image: Image {
                    name: "nginx".into(),
                    dockerfile: String::new(),
                },
                ..Default::default()
            },
            BlueprintContainer {
                hostname: "db".into(),
                image: Image {
                    name: "postgres".into(),
                    dockerfile: String::new(),
                },
                ..Default::default()
            },
        ],
        connections: vec![BlueprintConnection {
            from: "web".into(),
            to: "db".into(),
            min_port: 5432,
            max_port: 5432,
        }],
        ..Default::default()
    };
    h.daemon
        .deploy(&serde_json::to_string(&blueprint).unwrap())
        .unwrap();
    controller::sync_containers(&h.ctx);

    {
        let mut view = h.ctx.db.txn(&[TableId::Machine, TableId::MinionSelf]);
        for ip in ["10.1.0.1", "10.1.0.2"] {
            let mut w: Machine = view.insert();
            w.role = Role::Worker;
            w.private_ip = ip.into();
            view.commit(w);
        }
        let mut me: MinionSelf = view.insert();
        me.role = Role::Master;
        view.commit(me);
    }

    let docker = FakeDocker::default();
    let forwarder = RecordingForwarder::default();
    scheduler::run_once(&h.ctx, &docker, &forwarder).await;

    let rows = h.ctx.db.select::<Container>(|_| true);
    assert_eq!(rows.len(), 2);
    assert!(rows.iter().all(|c| !c.minion.is_empty() && !c.ip.is_empty()));
    let minions: Vec<&str> = rows.iter().map(|c| c.minion.as_str()).collect();
    assert!(minions.contains(&"10.1.0.1"));
    assert!(minions.contains(&"10.1.0.2"));
}
