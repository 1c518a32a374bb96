//! Buffers inventory writes for a number of players against in-memory
//! backends, lets the scheduler flush them, then drains and reports.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use tracing::info;
use wbcache_core::{AddressRegistry, CacheEntity, EntityConfig, StorageMap, Value};
use wbcache_server::logging::{init_tracing, LogFormat};
use wbcache_server::storage::engines::{MemoryDurableStore, MemoryFastStore};
use wbcache_server::storage::now_millis;
use wbcache_server::{CacheConfig, CacheService, SourceFactory};

#[derive(Parser, Debug)]
#[command(name = "wbcache-demo", about = "Write-behind cache demo")]
struct Args {
    /// Players to write inventories for
    #[arg(long, env = "WBCACHE_PLAYERS", default_value = "100")]
    players: i64,

    /// Items per player
    #[arg(long, env = "WBCACHE_ITEMS", default_value = "5")]
    items: i64,

    /// Cache configuration file (`{"cache": {...}}`)
    #[arg(long, env = "WBCACHE_CONFIG")]
    config: Option<PathBuf>,

    /// How long to let the scheduler run before draining, in milliseconds
    #[arg(long, env = "WBCACHE_RUN_MS", default_value = "3000")]
    run_ms: u64,

    /// Log output format: pretty or json
    #[arg(long, env = "WBCACHE_LOG_FORMAT", default_value = "pretty")]
    log_format: LogFormat,
}

#[derive(Debug, Clone)]
struct InventoryItem {
    item_id: i64,
    count: i64,
}

impl CacheEntity for InventoryItem {
    type Key = i64;

    fn secondary_key(&self) -> i64 {
        self.item_id
    }

    fn to_storage(&self) -> StorageMap {
        StorageMap::from([
            ("itemId".to_string(), Value::Int(self.item_id)),
            ("count".to_string(), Value::Int(self.count)),
        ])
    }

    fn from_storage(map: StorageMap) -> anyhow::Result<Self> {
        let field = |name: &str| {
            map.get(name)
                .and_then(Value::as_int)
                .ok_or_else(|| anyhow::anyhow!("missing field {name}"))
        };
        Ok(Self {
            item_id: field("itemId")?,
            count: field("count")?,
        })
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    init_tracing(args.log_format, "info")?;

    let config = match &args.config {
        Some(path) => CacheConfig::from_path(path)?,
        None => CacheConfig::default(),
    };

    let mut registry = AddressRegistry::new();
    let address = registry.register(&EntityConfig::new("Inventory", 1, "playerId", "itemId"))?;
    let durable = Arc::new(MemoryDurableStore::new());
    let factory = SourceFactory::new(
        Arc::new(registry),
        Arc::new(MemoryFastStore::new()),
        durable.clone(),
        Arc::new(config),
    );

    let inventory = Arc::new(factory.delayed_source::<i64, InventoryItem>(&address)?);
    let service = CacheService::new();
    service.register(inventory.clone());
    service.start_all();

    for player in 0..args.players {
        let items: Vec<InventoryItem> = (0..args.items)
            .map(|item_id| InventoryItem {
                item_id,
                count: player + item_id,
            })
            .collect();
        inventory.replace_batch(&player, &items);
        if player % 10 == 0 {
            inventory.delete_one(&player, &0);
        }
    }
    info!(buffered = inventory.pending_count(), "writes buffered");

    tokio::select! {
        () = tokio::time::sleep(Duration::from_millis(args.run_ms)) => {
            info!(buffered = inventory.pending_count(), "scheduler ran");
        }
        _ = tokio::signal::ctrl_c() => {
            info!("interrupted, draining");
        }
    }

    let report = service.shutdown(now_millis()).await;
    let rows = durable.count(address.name());
    info!(rows, lost_keys = report.lost_keys(), "demo finished");
    println!("durable rows: {rows}");
    Ok(())
}
