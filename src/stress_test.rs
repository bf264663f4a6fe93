use quire_server::{
    ChannelConnection, DocumentService, DocumentStore, MemoryBus, MemoryStore, ServerMessage,
    ServiceConfig, ServiceError,
};
use quire_text::{Attributes, CrdtDocument, Operation, Replica};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc::UnboundedReceiver;
use tracing::{debug, info, warn};

const DOCUMENT_ID: &str = "stress-doc";

/// Shape of one simulated run.
#[derive(Clone, Debug)]
pub struct SimulationParams {
    pub servers: usize,
    pub clients_per_server: usize,
    pub steps: usize,
    pub snapshot_interval: u64,
    pub gc_interval: u64,
    pub seed: u64,
}

/// Statistics collected during a run
#[derive(Clone, Debug)]
pub struct StressTestStats {
    pub servers: usize,
    pub clients: usize,
    pub operations_sent: usize,
    pub offline_operations: usize,
    pub snapshots: u64,
    pub operations_truncated: u64,
    pub tombstones_collected: u64,
    pub retained_log: usize,
    pub document_length: usize,
    pub converged: bool,
    pub total_time: Duration,
    pub ops_per_second: f64,
}

impl StressTestStats {
    pub fn print(&self) {
        println!("\n╔════════════════════════════════════════════════════════════╗");
        println!("║              Stress Test Statistics                        ║");
        println!("╠════════════════════════════════════════════════════════════╣");
        println!("║  Servers:                   {:>30} ║", self.servers);
        println!("║  Clients:                   {:>30} ║", self.clients);
        println!("║  Operations Sent:           {:>30} ║", self.operations_sent);
        println!("║  Written Offline:           {:>30} ║", self.offline_operations);
        println!("║  Snapshots:                 {:>30} ║", self.snapshots);
        println!("║  Log Entries Truncated:     {:>30} ║", self.operations_truncated);
        println!("║  Tombstones Collected:      {:>30} ║", self.tombstones_collected);
        println!("║  Retained Log:              {:>30} ║", self.retained_log);
        println!("║  Final Length:              {:>30} ║", self.document_length);
        println!("║  Converged:                 {:>30} ║", self.converged);
        println!("║  Total Time:                {:>29}s ║", format!("{:.3}", self.total_time.as_secs_f64()));
        println!("║  Operations/Second:         {:>30.0} ║", self.ops_per_second);
        println!("╚════════════════════════════════════════════════════════════╝");
    }
}

/// A simulated editor attached to one server.
struct SimClient {
    client_id: String,
    server: usize,
    replica: Replica,
    rx: UnboundedReceiver<ServerMessage>,
    /// Partitioned: edits queue locally and incoming messages wait in the channel.
    offline: bool,
    outbox: Vec<Operation>,
}

impl SimClient {
    /// Apply everything the server has pushed so far.
    fn absorb(&mut self) {
        while let Ok(message) = self.rx.try_recv() {
            match message {
                ServerMessage::State { state, .. } => {
                    if !state.vector_clock.dominates(self.replica.vector_clock()) {
                        continue;
                    }
                    match CrdtDocument::from_state(state) {
                        Ok(document) => {
                            let site = self.replica.site().to_string();
                            self.replica = Replica::from_document(site, document);
                        }
                        Err(e) => warn!(client_id = %self.client_id, error = %e, "Unusable state"),
                    }
                }
                ServerMessage::Missing { operations, .. } => {
                    for op in &operations {
                        self.receive(op);
                    }
                }
                ServerMessage::Operation { operation, .. } => self.receive(&operation),
            }
        }
    }

    fn receive(&mut self, op: &Operation) {
        if let Err(e) = self.replica.receive(op) {
            warn!(client_id = %self.client_id, op = %op.id(), error = %e, "Client rejected operation");
        }
    }

    /// One random local edit.
    fn edit(&mut self, rng: &mut StdRng) -> Vec<Operation> {
        let len = self.replica.document().len();
        let roll: f64 = rng.gen();
        let result = if len == 0 || roll < 0.65 {
            let ch = (b'a' + rng.gen_range(0..26u8)) as char;
            self.replica.insert(rng.gen_range(0..=len), &ch.to_string())
        } else if roll < 0.92 {
            self.replica.delete(rng.gen_range(0..len), 1)
        } else {
            let start = rng.gen_range(0..len);
            let end = rng.gen_range(start + 1..=len);
            let mut attributes = Attributes::new();
            let key = if rng.gen_bool(0.5) { "bold" } else { "italic" };
            attributes.insert(key.to_string(), serde_json::Value::Bool(rng.gen_bool(0.7)));
            self.replica.format(start, end, attributes).map(|op| vec![op])
        };
        match result {
            Ok(ops) => ops,
            Err(e) => {
                debug!(client_id = %self.client_id, error = %e, "Skipped edit");
                Vec::new()
            }
        }
    }
}

async fn join(
    service: &DocumentService,
    client_id: &str,
    site_id: &str,
    last_seen: Option<&quire_core::VectorClock>,
) -> Result<UnboundedReceiver<ServerMessage>, ServiceError> {
    let (connection, rx) = ChannelConnection::channel();
    service
        .join_document(DOCUMENT_ID, client_id, site_id, connection, last_seen)
        .await?;
    Ok(rx)
}

async fn send(
    services: &[DocumentService],
    client: &SimClient,
    ops: Vec<Operation>,
) -> Result<usize, ServiceError> {
    let mut applied = 0;
    for op in ops {
        if services[client.server]
            .apply_operation(DOCUMENT_ID, &client.client_id, op)
            .await?
        {
            applied += 1;
        }
    }
    Ok(applied)
}

/// Report each online client's clock so tombstone collection can advance.
async fn report_clocks(
    services: &[DocumentService],
    clients: &mut [SimClient],
) -> Result<(), ServiceError> {
    for client in clients.iter_mut().filter(|c| !c.offline) {
        client.absorb();
        let clock = client.replica.vector_clock().clone();
        let missing = services[client.server]
            .sync_client(DOCUMENT_ID, &client.client_id, &clock)
            .await?;
        for op in &missing {
            client.receive(op);
        }
    }
    Ok(())
}

/// Several servers sharing a store and a distribution bus, with clients
/// editing one document at random. One client works through a partition,
/// another leaves and rejoins from its last seen clock.
pub async fn stress_test_service(params: SimulationParams) -> Result<StressTestStats, ServiceError> {
    println!("\n╔════════════════════════════════════════════════════════════╗");
    println!("║        Document Service Stress Test                        ║");
    println!("║  Servers: {} | Clients/Server: {} | Steps: {}",
             params.servers, params.clients_per_server, params.steps);
    println!("╚════════════════════════════════════════════════════════════╝");

    let start = Instant::now();
    let mut rng = StdRng::seed_from_u64(params.seed);

    let store = Arc::new(MemoryStore::new());
    let bus = MemoryBus::new();
    let services: Vec<DocumentService> = (0..params.servers)
        .map(|i| {
            let server_id = format!("server-{}", i);
            let config = ServiceConfig::builder()
                .server_id(server_id.clone())
                .snapshot_interval(params.snapshot_interval)
                .gc_interval(params.gc_interval)
                .build();
            DocumentService::new(config, store.clone(), bus.endpoint(server_id))
        })
        .collect();
    services[0].create_document(DOCUMENT_ID, "Stress test").await?;

    println!("\n[Phase 1/3] Joining clients...");
    let mut clients = Vec::new();
    for server in 0..params.servers {
        for i in 0..params.clients_per_server {
            let client_id = format!("client-{}-{}", server, i);
            let site_id = format!("site-{}-{}", server, i);
            let rx = join(&services[server], &client_id, &site_id, None).await?;
            let mut client = SimClient {
                client_id,
                server,
                replica: Replica::new(site_id),
                rx,
                offline: false,
                outbox: Vec::new(),
            };
            client.absorb();
            clients.push(client);
        }
    }
    println!("[Phase 1/3] ✓ Completed");

    println!("[Phase 2/3] Editing...");
    let partitioned = 0;
    let rejoining = clients.len() - 1;
    let mut operations_sent = 0;
    let mut offline_operations = 0;

    for step in 0..params.steps {
        if step == params.steps / 4 {
            clients[partitioned].offline = true;
            info!(client_id = %clients[partitioned].client_id, "Client partitioned");
        }
        if step == params.steps * 3 / 4 {
            let client = &mut clients[partitioned];
            client.offline = false;
            let outbox = std::mem::take(&mut client.outbox);
            info!(client_id = %client.client_id, queued = outbox.len(), "Client reconnected");
            operations_sent += send(&services, &clients[partitioned], outbox).await?;
            clients[partitioned].absorb();
        }
        if step == params.steps / 2 && rejoining != partitioned {
            let client = &mut clients[rejoining];
            let service = &services[client.server];
            service.leave_document(DOCUMENT_ID, &client.client_id).await?;
            let last_seen = client.replica.vector_clock().clone();
            client.rx = join(service, &client.client_id, client.replica.site(), Some(&last_seen)).await?;
            client.absorb();
        }

        let idx = rng.gen_range(0..clients.len());
        let client = &mut clients[idx];
        if !client.offline {
            client.absorb();
        }
        let ops = client.edit(&mut rng);
        if client.offline {
            offline_operations += ops.len();
            client.outbox.extend(ops);
        } else {
            operations_sent += send(&services, &clients[idx], ops).await?;
        }

        if step % 25 == 0 {
            report_clocks(&services, &mut clients).await?;
            tokio::task::yield_now().await;
        }
    }

    let client = &mut clients[partitioned];
    if client.offline {
        client.offline = false;
        let outbox = std::mem::take(&mut client.outbox);
        operations_sent += send(&services, &clients[partitioned], outbox).await?;
    }
    println!("[Phase 2/3] ✓ Completed");

    println!("[Phase 3/3] Checking convergence...");
    report_clocks(&services, &mut clients).await?;
    for service in &services {
        service.collect_garbage(DOCUMENT_ID).await?;
    }
    report_clocks(&services, &mut clients).await?;

    let reference = services[0]
        .session(DOCUMENT_ID)
        .map(|s| s.text())
        .unwrap_or_default();
    let servers_agree = services.iter().all(|s| {
        s.session(DOCUMENT_ID)
            .is_some_and(|session| session.text() == reference)
    });
    let clients_agree = clients.iter().all(|c| c.replica.text() == reference);
    let converged = servers_agree && clients_agree;
    if !converged {
        warn!(servers_agree, clients_agree, "Replicas diverged");
    }
    println!("[Phase 3/3] ✓ Completed");

    let mut snapshots = 0;
    let mut operations_truncated = 0;
    let mut tombstones_collected = 0;
    for service in &services {
        let stats = service.compaction_stats();
        snapshots += stats.snapshots_created;
        operations_truncated += stats.operations_truncated;
        tombstones_collected += stats.tombstones_collected;
    }
    let retained_log = store.all_operations(DOCUMENT_ID).await?.len();

    for service in &services {
        service.shutdown().await;
    }

    let total_time = start.elapsed();
    Ok(StressTestStats {
        servers: params.servers,
        clients: clients.len(),
        operations_sent,
        offline_operations,
        snapshots,
        operations_truncated,
        tombstones_collected,
        retained_log,
        document_length: reference.chars().count(),
        converged,
        total_time,
        ops_per_second: operations_sent as f64 / total_time.as_secs_f64(),
    })
}

/// Runs of increasing size with the same maintenance settings.
pub async fn stress_test_scaling(max_servers: usize, seed: u64) -> Result<(), ServiceError> {
    println!("\n╔════════════════════════════════════════════════════════════╗");
    println!("║      Scaling Analysis - Servers vs Throughput              ║");
    println!("╚════════════════════════════════════════════════════════════╝");

    for servers in 1..=max_servers {
        let stats = stress_test_service(SimulationParams {
            servers,
            clients_per_server: 3,
            steps: 500 * servers,
            snapshot_interval: 100,
            gc_interval: 150,
            seed: seed + servers as u64,
        })
        .await?;
        stats.print();
    }
    Ok(())
}
