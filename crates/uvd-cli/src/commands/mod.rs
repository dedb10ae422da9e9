//! Command implementations.

use std::sync::Arc;

use clap::Subcommand;

use uvd_db::partition::{
    check_partition_health, create_next_month_partition, ensure_future_partitions,
    repair_missing_partitions,
};
use uvd_db::{DispatchStore, PgStore};
use uvd_dispatch::Geocoder;
use uvd_kv::{Kv, MemoryKv};
use uvd_producer::Producer;

const GRAB_LOG_TABLE: &str = "uv_grab_log";
const PARTITION_COMMENT: &str = "grab log monthly partition";
const DEFAULT_POOL: u32 = 5;

#[derive(Subcommand)]
pub enum DbCmd {
    /// Apply embedded migrations.
    Migrate,
    /// Connectivity + schema presence.
    Status,
}

#[derive(Subcommand)]
pub enum PartitionCmd {
    /// Create the current + next N monthly partitions.
    Ensure {
        #[arg(long, default_value_t = 3)]
        months: u32,
    },
    /// Report months in the lookahead window missing a partition.
    Check {
        #[arg(long, default_value_t = 3)]
        months: u32,
    },
    /// Create next month's partition (idempotent).
    Next,
    /// Create exactly the months the health check reports missing.
    Repair {
        #[arg(long, default_value_t = 3)]
        months: u32,
    },
}

#[derive(Subcommand)]
pub enum ProduceCmd {
    /// Insert randomized pending orders.
    Orders {
        #[arg(long, default_value_t = 10)]
        count: usize,
    },
    /// Insert randomized idle vehicles.
    Vehicles {
        #[arg(long, default_value_t = 5)]
        count: usize,
    },
}

async fn pool() -> anyhow::Result<sqlx::PgPool> {
    Ok(uvd_db::connect_from_env(DEFAULT_POOL).await?)
}

pub async fn run_db(cmd: DbCmd) -> anyhow::Result<()> {
    let pool = pool().await?;
    match cmd {
        DbCmd::Migrate => {
            uvd_db::migrate(&pool).await?;
            println!("migrations applied");
        }
        DbCmd::Status => {
            let status = uvd_db::status(&pool).await?;
            println!(
                "connectivity: {}  uv_order table: {}",
                if status.ok { "ok" } else { "FAILED" },
                if status.has_order_table { "present" } else { "missing" }
            );
        }
    }
    Ok(())
}

pub async fn run_partition(cmd: PartitionCmd) -> anyhow::Result<()> {
    let pool = pool().await?;
    match cmd {
        PartitionCmd::Ensure { months } => {
            let created =
                ensure_future_partitions(&pool, GRAB_LOG_TABLE, months, PARTITION_COMMENT).await?;
            println!("{created} partition(s) created");
        }
        PartitionCmd::Check { months } => {
            let missing = check_partition_health(&pool, GRAB_LOG_TABLE, months).await?;
            if missing.is_empty() {
                println!("all partitions present for the next {months} month(s)");
            } else {
                for window in missing {
                    println!("missing: {}", window.label());
                }
            }
        }
        PartitionCmd::Next => {
            let created =
                create_next_month_partition(&pool, GRAB_LOG_TABLE, PARTITION_COMMENT).await?;
            println!(
                "next month partition {}",
                if created { "created" } else { "already present" }
            );
        }
        PartitionCmd::Repair { months } => {
            let missing = check_partition_health(&pool, GRAB_LOG_TABLE, months).await?;
            let created =
                repair_missing_partitions(&pool, GRAB_LOG_TABLE, &missing, PARTITION_COMMENT)
                    .await?;
            println!("{created} partition(s) repaired");
        }
    }
    Ok(())
}

pub async fn run_produce(cmd: ProduceCmd) -> anyhow::Result<()> {
    let pool = pool().await?;
    let store = Arc::new(PgStore::new(pool));
    let kv: Arc<dyn Kv> = Arc::new(MemoryKv::new());
    let geocoder = std::env::var("UVD_GEOCODE_URL").ok().map(Geocoder::new);
    let producer = Producer::new(store as Arc<dyn DispatchStore>, kv, geocoder);

    match cmd {
        ProduceCmd::Orders { count } => {
            let ids = producer.create_orders(count).await?;
            println!("created {} order(s)", ids.len());
        }
        ProduceCmd::Vehicles { count } => {
            let ids = producer.create_vehicles(count).await?;
            println!("created {} vehicle(s)", ids.len());
        }
    }
    Ok(())
}
