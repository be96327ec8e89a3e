//! A simulated storefront session against an in-process fake API.

use color_eyre::Result;
use serde::Serialize;
use serde_json::{json, Value};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

use optistore::cache::{CacheSource, CacheStats, CacheTiers, Tier};
use optistore::config::Config;
use optistore::offline::{
  MemoryQueue, NetworkMonitor, NetworkStatus, OfflineOperation, OfflineQueue, OfflineSync,
  QueuedOperation, SqliteQueue,
};
use optistore::optimistic::{MutationOutcome, Operation, OptimisticManager};
use optistore::strategy::{ReadConfig, ReadStrategy, StrategyEngine};
use optistore::{Error, Result as StoreResult};

const LATENCY: Duration = Duration::from_millis(5);
const CATALOG_SIZE: u32 = 7;

/// Stands in for the remote API. Every call fails while the network is
/// down, and every `fail_every`-th call fails regardless.
struct FakeApi {
  calls: AtomicU32,
  next_id: AtomicU32,
  fail_every: u32,
  network: Arc<NetworkMonitor>,
}

impl FakeApi {
  fn call(&self) -> StoreResult<()> {
    let n = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
    if !self.network.is_online() {
      return Err(Error::remote("network unreachable"));
    }
    if self.fail_every > 0 && n % self.fail_every == 0 {
      return Err(Error::remote(format!("injected failure on call {}", n)));
    }
    Ok(())
  }

  async fn product(self: Arc<Self>, id: u32) -> StoreResult<Value> {
    tokio::time::sleep(LATENCY).await;
    self.call()?;
    Ok(json!({"id": id.to_string(), "name": format!("Product {}", id), "price": 10 + id}))
  }

  async fn save(self: Arc<Self>, op: OfflineOperation) -> StoreResult<Value> {
    tokio::time::sleep(LATENCY).await;
    self.call()?;
    let id = match op.entity_id {
      Some(id) => id,
      None => format!("srv-{}", self.next_id.fetch_add(1, Ordering::SeqCst) + 1),
    };
    Ok(match (op.operation, op.data) {
      (Operation::Delete, _) => json!({"id": id, "deleted": true}),
      (_, Some(Value::Object(mut data))) => {
        data.insert("id".to_string(), Value::String(id));
        Value::Object(data)
      }
      (_, _) => json!({"id": id}),
    })
  }

  async fn replay(self: Arc<Self>, queued: QueuedOperation) -> StoreResult<Value> {
    self.save(queued.operation).await
  }
}

#[derive(Debug, Default, Serialize)]
struct MutationCounts {
  confirmed: u32,
  queued: u32,
  failed: u32,
}

#[derive(Debug, Default, Serialize)]
struct SyncCounts {
  synced: usize,
  failed: usize,
  remaining: usize,
}

#[derive(Debug, Serialize)]
pub struct Report {
  requests: u32,
  api_calls: u32,
  reads: BTreeMap<&'static str, u32>,
  read_errors: u32,
  mutations: MutationCounts,
  offline_sync: SyncCounts,
  tiers: BTreeMap<&'static str, CacheStats>,
}

fn source_name(source: CacheSource) -> &'static str {
  match source {
    CacheSource::Network => "network",
    CacheSource::CacheFresh => "cache-fresh",
    CacheSource::CacheStale => "cache-stale",
    CacheSource::Offline => "offline",
  }
}

fn read_config(request: u32) -> ReadConfig {
  let config = match request % 4 {
    0 => ReadConfig::new(ReadStrategy::CacheFirst).with_max_age(Duration::from_millis(200)),
    1 => ReadConfig::new(ReadStrategy::StaleWhileRevalidate).with_max_age(Duration::from_millis(50)),
    2 => ReadConfig::new(ReadStrategy::NetworkFirst),
    _ => ReadConfig::new(ReadStrategy::NetworkOnly).with_sync_online(true),
  };
  config.with_tags(["api", "product"])
}

/// Network goes down for requests 20..30, 50..60 and so on.
fn offline_window(request: u32) -> bool {
  (request / 10) % 3 == 2
}

pub async fn run(config: &Config, requests: u32, fail_every: u32) -> Result<Report> {
  let tiers = CacheTiers::new(&config.stores);
  let engine = StrategyEngine::new(tiers.clone(), config.engine.clone());
  engine.start();

  let queue: Arc<dyn OfflineQueue> = match &config.offline.database_path {
    Some(path) => Arc::new(SqliteQueue::open(path)?),
    None => Arc::new(MemoryQueue::new()),
  };
  let network = Arc::new(NetworkMonitor::default());
  let api = Arc::new(FakeApi {
    calls: AtomicU32::new(0),
    next_id: AtomicU32::new(0),
    fail_every,
    network: network.clone(),
  });

  let manager = OptimisticManager::new(
    tiers.store(Tier::User).clone(),
    queue.clone(),
    network.clone(),
    config.mutations.clone(),
  );
  let replay_api = api.clone();
  let sync = OfflineSync::new(queue, network.clone(), config.offline.max_attempts, move |op| {
    replay_api.clone().replay(op)
  });
  manager.observe_sync(&sync);
  sync.start(config.offline.sync_interval());

  let mut reads: BTreeMap<&'static str, u32> = BTreeMap::new();
  let mut read_errors = 0;
  let mut mutations = MutationCounts::default();
  let mut offline_sync = SyncCounts::default();
  let mut cart: Vec<String> = Vec::new();

  for request in 0..requests {
    let offline = offline_window(request);
    if offline == network.is_online() {
      network.set_online(!offline);
      info!(request, online = !offline, "network status changed");
      if !offline {
        let report = sync.replay_pending().await?;
        offline_sync.synced += report.synced;
        offline_sync.failed += report.failed;
      }
    }

    let product = request % CATALOG_SIZE;
    let fetch_api = api.clone();
    let fetcher = move || fetch_api.clone().product(product);
    match engine
      .get::<Value, _, _>(&format!("product:{}", product), fetcher, &read_config(request))
      .await
    {
      Ok(result) => *reads.entry(source_name(result.source)).or_default() += 1,
      Err(e) => {
        read_errors += 1;
        warn!(request, product, error = %e, "product read failed");
      }
    }

    let op = match request % 9 {
      1 => Some(OfflineOperation {
        operation: Operation::Create,
        entity_type: "cart-item".to_string(),
        entity_id: None,
        data: Some(json!({"sku": format!("SKU-{}", product), "qty": 1})),
      }),
      4 => cart.last().map(|id| OfflineOperation {
        operation: Operation::Update,
        entity_type: "cart-item".to_string(),
        entity_id: Some(id.clone()),
        data: Some(json!({"qty": 2})),
      }),
      7 if cart.len() > 1 => Some(OfflineOperation {
        operation: Operation::Delete,
        entity_type: "cart-item".to_string(),
        entity_id: Some(cart.remove(0)),
        data: None,
      }),
      _ => None,
    };
    let Some(op) = op else {
      continue;
    };

    let mutation_api = api.clone();
    let payload = op.clone();
    let action = move || mutation_api.clone().save(payload.clone());
    let mutation_config = config.mutations.clone().with_retries(1);
    let outcome = match (op.operation, op.entity_id, op.data) {
      (Operation::Create, _, Some(data)) => {
        manager
          .optimistic_create(&op.entity_type, data, action, mutation_config)
          .await
      }
      (Operation::Update, Some(id), Some(changes)) => {
        manager
          .optimistic_update(&op.entity_type, &id, changes, action, mutation_config)
          .await
      }
      (Operation::Delete, Some(id), _) => {
        manager
          .optimistic_delete(&op.entity_type, &id, action, mutation_config)
          .await
      }
      _ => continue,
    };

    match outcome {
      Ok(MutationOutcome::Confirmed(data)) => {
        mutations.confirmed += 1;
        if op.operation == Operation::Create {
          if let Some(id) = data.get("id").and_then(Value::as_str) {
            cart.push(id.to_string());
          }
        }
      }
      Ok(MutationOutcome::Queued { .. }) => mutations.queued += 1,
      Err(e) => {
        mutations.failed += 1;
        warn!(request, error = %e, "cart mutation failed");
      }
    }
  }

  network.set_online(true);
  let report = sync.replay_pending().await?;
  offline_sync.synced += report.synced;
  offline_sync.failed += report.failed;
  offline_sync.remaining = report.remaining;
  // Let the manager observe the final sync events
  tokio::task::yield_now().await;

  let tiers_report = tiers
    .stats()
    .into_iter()
    .map(|(tier, stats)| (tier.name(), stats))
    .collect();

  manager.destroy();
  sync.destroy();
  engine.destroy();

  Ok(Report {
    requests,
    api_calls: api.calls.load(Ordering::SeqCst),
    reads,
    read_errors,
    mutations,
    offline_sync,
    tiers: tiers_report,
  })
}
