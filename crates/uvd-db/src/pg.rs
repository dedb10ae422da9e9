//! `PgStore`: typed CRUD over the four tables plus the pipeline seam.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::{PgArguments, PgRow};
use sqlx::{PgPool, Postgres};
use tracing::debug;

use uvd_schemas::{DeliveryTask, GrabLog, Order, UVehicle};

use crate::query::{PageResult, QuerySpec, SqlParam};
use crate::store::DispatchStore;
use crate::StoreError;

/// Tables this store is allowed to touch with a caller-supplied name.
const TABLES: &[&str] = &["uv_order", "uv_vehicle", "uv_grab_log", "uv_delivery"];

fn checked_table(table: &str) -> Result<&str, StoreError> {
    TABLES
        .iter()
        .find(|t| **t == table)
        .copied()
        .ok_or_else(|| StoreError::BadQuery(format!("unknown table {table}")))
}

fn bind_query<'q>(
    mut q: sqlx::query::Query<'q, Postgres, PgArguments>,
    params: &[SqlParam],
) -> sqlx::query::Query<'q, Postgres, PgArguments> {
    for p in params {
        q = match p.clone() {
            SqlParam::I64(v) => q.bind(v),
            SqlParam::I32(v) => q.bind(v),
            SqlParam::F64(v) => q.bind(v),
            SqlParam::Str(v) => q.bind(v),
            SqlParam::Ts(v) => q.bind(v),
        };
    }
    q
}

fn bind_query_as<'q, T>(
    mut q: sqlx::query::QueryAs<'q, Postgres, T, PgArguments>,
    params: &[SqlParam],
) -> sqlx::query::QueryAs<'q, Postgres, T, PgArguments> {
    for p in params {
        q = match p.clone() {
            SqlParam::I64(v) => q.bind(v),
            SqlParam::I32(v) => q.bind(v),
            SqlParam::F64(v) => q.bind(v),
            SqlParam::Str(v) => q.bind(v),
            SqlParam::Ts(v) => q.bind(v),
        };
    }
    q
}

/// Postgres-backed store.
///
/// Bulk inserts serialize on one mutex: multi-row statements from
/// concurrent producers otherwise interleave badly with the sequence
/// cache and partition routing under load, and the producers are the only
/// bulk writers.
pub struct PgStore {
    pool: PgPool,
    bulk_mutex: tokio::sync::Mutex<()>,
}

impl PgStore {
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool,
            bulk_mutex: tokio::sync::Mutex::new(()),
        }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    // -- generic query surface -------------------------------------------

    pub async fn query_advanced<T>(
        &self,
        base: &str,
        spec: &QuerySpec,
    ) -> Result<Vec<T>, StoreError>
    where
        T: for<'r> sqlx::FromRow<'r, PgRow> + Send + Unpin,
    {
        let (sql, params) = spec.build_select(base);
        let rows = bind_query_as(sqlx::query_as::<_, T>(&sql), &params)
            .fetch_all(&self.pool)
            .await?;
        Ok(rows)
    }

    pub async fn query_one<T>(&self, base: &str, spec: &QuerySpec) -> Result<Option<T>, StoreError>
    where
        T: for<'r> sqlx::FromRow<'r, PgRow> + Send + Unpin,
    {
        let (sql, params) = spec.clone().limit(1).build_select(base);
        let row = bind_query_as(sqlx::query_as::<_, T>(&sql), &params)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row)
    }

    pub async fn query_page<T>(
        &self,
        base: &str,
        spec: &QuerySpec,
        page: i64,
        page_size: i64,
    ) -> Result<PageResult<T>, StoreError>
    where
        T: for<'r> sqlx::FromRow<'r, PgRow> + Send + Unpin,
    {
        let paged = spec.build_page(base, page, page_size)?;

        let (total_items,): (i64,) =
            bind_query_as(sqlx::query_as(&paged.count_sql), &paged.params)
                .fetch_one(&self.pool)
                .await?;
        let items = bind_query_as(sqlx::query_as::<_, T>(&paged.data_sql), &paged.params)
            .fetch_all(&self.pool)
            .await?;

        Ok(PageResult {
            items,
            total_items,
            total_pages: paged.total_pages(total_items),
            current_page: paged.page,
            page_size: paged.page_size,
        })
    }

    /// Raw parameterized update/delete; returns affected rows.
    pub async fn exec_update(&self, sql: &str, params: &[SqlParam]) -> Result<u64, StoreError> {
        let result = bind_query(sqlx::query(sql), params)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }

    // -- typed CRUD ------------------------------------------------------

    pub async fn insert_order(&self, order: &Order) -> Result<i64, StoreError> {
        let now = Utc::now();
        let (id,): (i64,) = sqlx::query_as(
            r#"
            insert into uv_order (
              order_no, merchant_id, reward, pickup, delivery, distance,
              status, version, order_type, order_type_code, expire_time,
              uv_id, created_at, updated_at, is_delete
            ) values (
              $1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15
            ) returning id
            "#,
        )
        .bind(&order.order_no)
        .bind(order.merchant_id)
        .bind(order.reward)
        .bind(&order.pickup)
        .bind(&order.delivery)
        .bind(order.distance)
        .bind(order.status.unwrap_or(0))
        .bind(order.version.unwrap_or(1))
        .bind(&order.order_type)
        .bind(order.order_type_code)
        .bind(order.expire_time)
        .bind(order.uv_id)
        .bind(order.created_at.unwrap_or(now))
        .bind(order.updated_at.unwrap_or(now))
        .bind(order.is_delete.unwrap_or(0))
        .fetch_one(&self.pool)
        .await?;
        Ok(id)
    }

    /// PK-scoped update; `None` fields are skipped, `updated_at` always
    /// touches.
    pub async fn update_order(&self, order: &Order) -> Result<(), StoreError> {
        let id = order
            .id
            .ok_or_else(|| StoreError::BadQuery("update requires an id".into()))?;

        let mut sets: Vec<String> = Vec::new();
        let mut params: Vec<SqlParam> = Vec::new();
        let push = |sets: &mut Vec<String>, params: &mut Vec<SqlParam>, col: &str, p: SqlParam| {
            params.push(p);
            sets.push(format!("{col} = ${}", params.len()));
        };

        if let Some(v) = &order.order_no {
            push(&mut sets, &mut params, "order_no", v.clone().into());
        }
        if let Some(v) = order.merchant_id {
            push(&mut sets, &mut params, "merchant_id", v.into());
        }
        if let Some(v) = order.reward {
            push(&mut sets, &mut params, "reward", v.into());
        }
        if let Some(v) = &order.pickup {
            push(&mut sets, &mut params, "pickup", v.clone().into());
        }
        if let Some(v) = &order.delivery {
            push(&mut sets, &mut params, "delivery", v.clone().into());
        }
        if let Some(v) = order.distance {
            push(&mut sets, &mut params, "distance", v.into());
        }
        if let Some(v) = order.status {
            push(&mut sets, &mut params, "status", v.into());
        }
        if let Some(v) = order.version {
            push(&mut sets, &mut params, "version", v.into());
        }
        if let Some(v) = &order.order_type {
            push(&mut sets, &mut params, "order_type", v.clone().into());
        }
        if let Some(v) = order.order_type_code {
            push(&mut sets, &mut params, "order_type_code", v.into());
        }
        if let Some(v) = order.expire_time {
            push(&mut sets, &mut params, "expire_time", v.into());
        }
        if let Some(v) = order.uv_id {
            push(&mut sets, &mut params, "uv_id", v.into());
        }
        push(&mut sets, &mut params, "updated_at", Utc::now().into());

        params.push(SqlParam::I64(id));
        let sql = format!(
            "update uv_order set {} where id = ${} and is_delete = 0",
            sets.join(", "),
            params.len()
        );

        let affected = self.exec_update(&sql, &params).await?;
        if affected == 0 {
            return Err(StoreError::NotFound {
                entity: "uv_order",
                id,
            });
        }
        Ok(())
    }

    /// PK-scoped updates for a batch, serialized like the bulk inserts.
    /// Rows reported missing are skipped, not fatal: a batch member may
    /// have been tombstoned since it was read.
    pub async fn bulk_update_orders(&self, orders: &[Order]) -> Result<u64, StoreError> {
        let _guard = self.bulk_mutex.lock().await;
        let mut updated = 0;
        for order in orders {
            match self.update_order(order).await {
                Ok(()) => updated += 1,
                Err(StoreError::NotFound { .. }) => {}
                Err(err) => return Err(err),
            }
        }
        Ok(updated)
    }

    pub async fn insert_vehicle(&self, v: &UVehicle) -> Result<i64, StoreError> {
        let now = Utc::now();
        let (id,): (i64,) = sqlx::query_as(
            r#"
            insert into uv_vehicle (
              uv_code, model_type, status, battery, capabilities, location,
              version, supported_types, heartbeat_time, created_at,
              updated_at, is_delete
            ) values (
              $1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12
            ) returning id
            "#,
        )
        .bind(&v.uv_code)
        .bind(v.model_type)
        .bind(v.status.unwrap_or(0))
        .bind(v.battery)
        .bind(&v.capabilities)
        .bind(&v.location)
        .bind(v.version.unwrap_or(1))
        .bind(&v.supported_types)
        .bind(v.heartbeat_time)
        .bind(v.created_at.unwrap_or(now))
        .bind(v.updated_at.unwrap_or(now))
        .bind(v.is_delete.unwrap_or(0))
        .fetch_one(&self.pool)
        .await?;
        Ok(id)
    }

    /// Soft delete: tombstone + touch. Zero affected rows is `NotFound`.
    pub async fn soft_delete(&self, table: &str, id: i64) -> Result<(), StoreError> {
        let table = checked_table(table)?;
        let affected = self
            .exec_update(
                &format!(
                    "update {table} set is_delete = 1, updated_at = now() \
                     where id = $1 and is_delete = 0"
                ),
                &[SqlParam::I64(id)],
            )
            .await?;
        if affected == 0 {
            return Err(StoreError::NotFound {
                entity: "row",
                id,
            });
        }
        Ok(())
    }

    pub async fn bulk_soft_delete(&self, table: &str, ids: &[i64]) -> Result<u64, StoreError> {
        let table = checked_table(table)?;
        if ids.is_empty() {
            return Ok(0);
        }
        let phs: Vec<String> = (1..=ids.len()).map(|n| format!("${n}")).collect();
        let params: Vec<SqlParam> = ids.iter().map(|id| SqlParam::I64(*id)).collect();
        self.exec_update(
            &format!(
                "update {table} set is_delete = 1, updated_at = now() \
                 where id in ({}) and is_delete = 0",
                phs.join(", ")
            ),
            &params,
        )
        .await
    }

    /// Undo a soft delete.
    pub async fn restore(&self, table: &str, id: i64) -> Result<(), StoreError> {
        let table = checked_table(table)?;
        let affected = self
            .exec_update(
                &format!(
                    "update {table} set is_delete = 0, updated_at = now() \
                     where id = $1 and is_delete = 1"
                ),
                &[SqlParam::I64(id)],
            )
            .await?;
        if affected == 0 {
            return Err(StoreError::NotFound {
                entity: "row",
                id,
            });
        }
        Ok(())
    }
}

#[async_trait]
impl DispatchStore for PgStore {
    async fn pending_orders_page(
        &self,
        page: i64,
        page_size: i64,
    ) -> Result<PageResult<Order>, StoreError> {
        let spec = QuerySpec::new()
            .eq("status", 0i32)
            .eq("is_delete", 0i32)
            .order_by("created_at DESC");
        self.query_page("SELECT * FROM uv_order", &spec, page, page_size)
            .await
    }

    async fn order_by_id(&self, id: i64) -> Result<Option<Order>, StoreError> {
        let spec = QuerySpec::new().eq("id", id).eq("is_delete", 0i32);
        self.query_one("SELECT * FROM uv_order", &spec).await
    }

    async fn vehicle_by_id(&self, id: i64) -> Result<Option<UVehicle>, StoreError> {
        let spec = QuerySpec::new().eq("id", id).eq("is_delete", 0i32);
        self.query_one("SELECT * FROM uv_vehicle", &spec).await
    }

    async fn claim_order(
        &self,
        order_id: i64,
        uv_id: i64,
        expected_version: i32,
        now: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        let affected = self
            .exec_update(
                "UPDATE uv_order SET status = 1, uv_id = $1, version = $2, updated_at = $3 \
                 WHERE id = $4 AND version = $5 AND is_delete = 0",
                &[
                    SqlParam::I64(uv_id),
                    SqlParam::I32(expected_version + 1),
                    SqlParam::Ts(now),
                    SqlParam::I64(order_id),
                    SqlParam::I32(expected_version),
                ],
            )
            .await?;
        if affected == 0 {
            return Err(StoreError::ClaimLost(order_id));
        }
        debug!(order_id, uv_id, new_version = expected_version + 1, "claim committed");
        Ok(())
    }

    async fn rollback_claim(&self, order_id: i64) -> Result<u64, StoreError> {
        self.exec_update(
            "UPDATE uv_order SET status = 0, version = 0, uv_id = NULL, updated_at = now() \
             WHERE id = $1 AND status = 1",
            &[SqlParam::I64(order_id)],
        )
        .await
    }

    async fn insert_grab_log(&self, log: &GrabLog) -> Result<i64, StoreError> {
        let now = Utc::now();
        let (id,): (i64,) = sqlx::query_as(
            r#"
            insert into uv_grab_log (
              order_id, status, uv_id, result, bid_amount, response_time,
              created_at, updated_at, is_delete
            ) values ($1, $2, $3, $4, $5, $6, $7, $8, $9)
            returning id
            "#,
        )
        .bind(log.order_id)
        .bind(log.status)
        .bind(log.uv_id)
        .bind(log.result)
        .bind(log.bid_amount)
        .bind(log.response_time)
        .bind(log.created_at.unwrap_or(now))
        .bind(log.updated_at.unwrap_or(now))
        .bind(log.is_delete.unwrap_or(0))
        .fetch_one(&self.pool)
        .await?;
        Ok(id)
    }

    async fn insert_delivery_task(&self, task: &DeliveryTask) -> Result<i64, StoreError> {
        let now = Utc::now();
        let (id,): (i64,) = sqlx::query_as(
            r#"
            insert into uv_delivery (
              order_id, uv_id, actual_distance, start_time, end_time,
              status, created_at, updated_at, is_delete
            ) values ($1, $2, $3, $4, $5, $6, $7, $8, $9)
            returning id
            "#,
        )
        .bind(task.order_id)
        .bind(task.uv_id)
        .bind(task.actual_distance)
        .bind(task.start_time)
        .bind(task.end_time)
        .bind(task.status)
        .bind(task.created_at.unwrap_or(now))
        .bind(task.updated_at.unwrap_or(now))
        .bind(task.is_delete.unwrap_or(0))
        .fetch_one(&self.pool)
        .await?;
        Ok(id)
    }

    async fn remove_grab_log(&self, id: i64) -> Result<(), StoreError> {
        self.soft_delete("uv_grab_log", id).await
    }

    async fn remove_delivery_task(&self, id: i64) -> Result<(), StoreError> {
        self.soft_delete("uv_delivery", id).await
    }

    async fn bulk_insert_orders(&self, orders: &[Order]) -> Result<Vec<i64>, StoreError> {
        if orders.is_empty() {
            return Ok(Vec::new());
        }
        let _guard = self.bulk_mutex.lock().await;
        let now = Utc::now();

        const COLS: usize = 15;
        let mut sql = String::from(
            "insert into uv_order (\
             order_no, merchant_id, reward, pickup, delivery, distance, \
             status, version, order_type, order_type_code, expire_time, \
             uv_id, created_at, updated_at, is_delete) values ",
        );
        for (row, _) in orders.iter().enumerate() {
            if row > 0 {
                sql.push_str(", ");
            }
            let base = row * COLS;
            sql.push('(');
            for col in 1..=COLS {
                if col > 1 {
                    sql.push_str(", ");
                }
                sql.push_str(&format!("${}", base + col));
            }
            sql.push(')');
        }
        sql.push_str(" returning id");

        let mut q = sqlx::query_as::<_, (i64,)>(&sql);
        for order in orders {
            q = q
                .bind(order.order_no.clone())
                .bind(order.merchant_id)
                .bind(order.reward)
                .bind(order.pickup.clone())
                .bind(order.delivery.clone())
                .bind(order.distance)
                .bind(order.status.unwrap_or(0))
                .bind(order.version.unwrap_or(1))
                .bind(order.order_type.clone())
                .bind(order.order_type_code)
                .bind(order.expire_time)
                .bind(order.uv_id)
                .bind(order.created_at.unwrap_or(now))
                .bind(order.updated_at.unwrap_or(now))
                .bind(order.is_delete.unwrap_or(0));
        }
        let ids = q.fetch_all(&self.pool).await?;
        Ok(ids.into_iter().map(|(id,)| id).collect())
    }

    async fn bulk_insert_vehicles(&self, vehicles: &[UVehicle]) -> Result<Vec<i64>, StoreError> {
        if vehicles.is_empty() {
            return Ok(Vec::new());
        }
        let _guard = self.bulk_mutex.lock().await;
        let now = Utc::now();

        const COLS: usize = 12;
        let mut sql = String::from(
            "insert into uv_vehicle (\
             uv_code, model_type, status, battery, capabilities, location, \
             version, supported_types, heartbeat_time, created_at, \
             updated_at, is_delete) values ",
        );
        for (row, _) in vehicles.iter().enumerate() {
            if row > 0 {
                sql.push_str(", ");
            }
            let base = row * COLS;
            sql.push('(');
            for col in 1..=COLS {
                if col > 1 {
                    sql.push_str(", ");
                }
                sql.push_str(&format!("${}", base + col));
            }
            sql.push(')');
        }
        sql.push_str(" returning id");

        let mut q = sqlx::query_as::<_, (i64,)>(&sql);
        for v in vehicles {
            q = q
                .bind(v.uv_code.clone())
                .bind(v.model_type)
                .bind(v.status.unwrap_or(0))
                .bind(v.battery)
                .bind(v.capabilities.clone())
                .bind(v.location.clone())
                .bind(v.version.unwrap_or(1))
                .bind(v.supported_types.clone())
                .bind(v.heartbeat_time)
                .bind(v.created_at.unwrap_or(now))
                .bind(v.updated_at.unwrap_or(now))
                .bind(v.is_delete.unwrap_or(0));
        }
        let ids = q.fetch_all(&self.pool).await?;
        Ok(ids.into_iter().map(|(id,)| id).collect())
    }
}
