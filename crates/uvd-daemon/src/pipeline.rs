//! Pipeline assembly: stores, bus, scheduler tasks, fleet.
//!
//! Startup is fail-fast: a dead database or (in redis mode) a dead KV
//! server surfaces here and stops the boot. Everything else — dispatch
//! cycles, producers, dead-letter maintenance, partition upkeep — runs as
//! scheduled tasks that log-and-continue.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use tracing::info;

use uvd_bus::{BusConfig, BusRouter};
use uvd_config::{KvMode, Settings};
use uvd_db::{DispatchStore, PgStore};
use uvd_deadletter::{DeadLetterConfig, DeadLetterObserver};
use uvd_dispatch::{Geocoder, OrderDispatcher};
use uvd_kv::{Kv, MemoryKv, RedisKv};
use uvd_producer::Producer;
use uvd_sched::{task_fn, CronScheduler};
use uvd_vehicle::{EndpointSet, VehicleClient, VehicleClientConfig, VehicleRegistry};

/// Cron lines for the periodic work.
const DISPATCH_CRON: &str = "*/5 * * * * *";
const DEADLETTER_MAINT_CRON: &str = "0 0 2 * * *";
const PARTITION_CRON: &str = "0 0 3 1 * *";

const GRAB_LOG_TABLE: &str = "uv_grab_log";
const PARTITION_COMMENT: &str = "grab log monthly partition";

pub struct Pipeline {
    pub store: Arc<PgStore>,
    pub kv: Arc<dyn Kv>,
    pub router: BusRouter,
    pub registry: VehicleRegistry,
    pub scheduler: CronScheduler,
    pub dispatcher: Arc<OrderDispatcher>,
    pub observer: Arc<DeadLetterObserver>,
    pub fleet: Vec<Arc<VehicleClient>>,
}

fn make_producer(store: &Arc<PgStore>, kv: &Arc<dyn Kv>, settings: &Settings) -> Producer {
    let geocoder = settings.geocode.base_url.as_ref().map(|u| Geocoder::new(u.clone()));
    Producer::new(
        Arc::clone(store) as Arc<dyn DispatchStore>,
        Arc::clone(kv),
        geocoder,
    )
}

impl Pipeline {
    /// Connect, wire and start everything described by `settings`.
    pub async fn boot(settings: &Settings) -> anyhow::Result<Self> {
        // Stores first: these failures are fatal at startup.
        let pool = match &settings.db.conn_str {
            Some(url) => uvd_db::connect(url, settings.db.pool_size).await?,
            None => uvd_db::connect_from_env(settings.db.pool_size).await?,
        };
        uvd_db::migrate(&pool).await?;
        let store = Arc::new(PgStore::new(pool));
        info!("database connected and migrated");

        let kv: Arc<dyn Kv> = match settings.kv.mode {
            KvMode::Memory => Arc::new(MemoryKv::new()),
            KvMode::Redis => Arc::new(
                RedisKv::connect(&settings.kv.redis_url())
                    .await
                    .context("redis connect failed")?,
            ),
        };
        info!(mode = ?settings.kv.mode, "kv backend ready");

        let router = BusRouter::new(BusConfig {
            max_queue_size: settings.bus.max_queue_size,
            send_timeout_ms: settings.bus.send_timeout_ms,
            batch_size: settings.bus.batch_size,
            hwm: settings.bus.hwm,
        });
        let endpoints = EndpointSet {
            e1: settings.bus.endpoints.e1.clone(),
            e2: settings.bus.endpoints.e2.clone(),
            e3: settings.bus.endpoints.e3.clone(),
        };

        let geocoder = settings.geocode.base_url.as_ref().map(|u| Geocoder::new(u.clone()));
        let dispatcher = Arc::new(OrderDispatcher::new(
            Arc::clone(&store) as Arc<dyn DispatchStore>,
            Arc::clone(&kv),
            router.publisher(&endpoints.e1),
            geocoder,
            100,
        ));

        let observer = DeadLetterObserver::new(
            Arc::clone(&kv),
            DeadLetterConfig {
                expire_sec: settings.deadletter.expire_sec,
                archive_dir: settings.deadletter.archive_dir.clone().into(),
            },
        );
        observer.attach(
            &router,
            &[endpoints.e1.clone(), endpoints.e2.clone(), endpoints.e3.clone()],
        );

        // Periodic work.
        let scheduler = CronScheduler::new(settings.sched.pool_size);

        let d = Arc::clone(&dispatcher);
        scheduler.add_task("dispatch-sweep", DISPATCH_CRON, task_fn(move || {
            let d = Arc::clone(&d);
            async move {
                d.run_cycle().await?;
                Ok(())
            }
        }))?;

        let o = Arc::clone(&observer);
        scheduler.add_task("deadletter-maintenance", DEADLETTER_MAINT_CRON, task_fn(move || {
            let o = Arc::clone(&o);
            async move {
                o.run_maintenance().await?;
                Ok(())
            }
        }))?;

        let lookahead = settings.partition.lookahead_months;
        let partition_pool = store.pool().clone();
        scheduler.add_task("partition-upkeep", PARTITION_CRON, task_fn(move || {
            let pool = partition_pool.clone();
            async move {
                uvd_db::partition::ensure_future_partitions(
                    &pool,
                    GRAB_LOG_TABLE,
                    lookahead,
                    PARTITION_COMMENT,
                )
                .await?;
                Ok(())
            }
        }))?;

        // Make sure the lookahead window is healthy before traffic starts.
        uvd_db::partition::ensure_future_partitions(
            store.pool(),
            GRAB_LOG_TABLE,
            lookahead,
            PARTITION_COMMENT,
        )
        .await?;

        // Synthetic load, when configured.
        if let Some(cron) = &settings.producer.order_cron {
            let producer = Arc::new(make_producer(&store, &kv, settings));
            let batch = settings.producer.order_batch;
            scheduler.add_task("produce-orders", cron, task_fn(move || {
                let producer = Arc::clone(&producer);
                async move {
                    producer.create_orders(batch).await?;
                    Ok(())
                }
            }))?;
        }
        if let Some(cron) = &settings.producer.vehicle_cron {
            let producer = Arc::new(make_producer(&store, &kv, settings));
            let batch = settings.producer.vehicle_batch;
            scheduler.add_task("produce-vehicles", cron, task_fn(move || {
                let producer = Arc::clone(&producer);
                async move {
                    producer.create_vehicles(batch).await?;
                    Ok(())
                }
            }))?;
        }

        scheduler.start()?;

        // The in-process fleet.
        let registry = VehicleRegistry::new();
        let mut fleet = Vec::new();
        for uv_id in &settings.fleet.vehicle_ids {
            let client = VehicleClient::new(
                *uv_id,
                Arc::clone(&store) as Arc<dyn DispatchStore>,
                Arc::clone(&kv),
                router.clone(),
                registry.clone(),
                VehicleClientConfig {
                    endpoints: endpoints.clone(),
                    lock_ttl_ms: settings.claim.lock_ttl_ms,
                    cache_ttl: Duration::from_secs(settings.cache.order_ttl_sec),
                },
            );
            client
                .start()
                .await
                .with_context(|| format!("vehicle client {uv_id} failed to start"))?;
            fleet.push(client);
        }
        info!(fleet = fleet.len(), "pipeline running");

        Ok(Self {
            store,
            kv,
            router,
            registry,
            scheduler,
            dispatcher,
            observer,
            fleet,
        })
    }

    pub async fn shutdown(&self) {
        for client in &self.fleet {
            client.stop().await;
        }
        self.scheduler.stop(Duration::from_secs(3)).await;
        self.router.shutdown();
        info!("pipeline stopped");
    }
}
