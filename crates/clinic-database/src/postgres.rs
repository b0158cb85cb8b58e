//! PostgreSQL JSONB 文档存储

use async_trait::async_trait;
use clinic_core::{ClinicError, GroupBucket, Result};
use rust_decimal::Decimal;
use sqlx::{PgPool, Postgres, QueryBuilder, Row};
use uuid::Uuid;

use crate::connection::DatabasePool;
use crate::models::{Collection, DbDocument, StoredDocument};
use crate::queries::{group_expr, push_order_and_page, push_where, sum_expr, FieldPath, Filter, GroupBy, Query};
use crate::store::DocumentStore;

fn db_err(e: sqlx::Error) -> ClinicError {
    ClinicError::Database(e.to_string())
}

/// 基于 PostgreSQL 的文档存储
#[derive(Clone)]
pub struct PostgresStore {
    pool: DatabasePool,
}

impl PostgresStore {
    pub fn new(pool: DatabasePool) -> Self {
        Self { pool }
    }

    fn pool(&self) -> &PgPool {
        self.pool.pool()
    }
}

#[async_trait]
impl DocumentStore for PostgresStore {
    /// 创建数据库表
    async fn migrate(&self) -> Result<()> {
        let pool = self.pool();

        for collection in Collection::ALL {
            let table = collection.table();
            sqlx::query(&format!(
                r#"
                CREATE TABLE IF NOT EXISTS {table} (
                    id UUID PRIMARY KEY,
                    numero VARCHAR(32) UNIQUE NOT NULL,
                    sede VARCHAR(64) NOT NULL,
                    version BIGINT NOT NULL DEFAULT 0,
                    data JSONB NOT NULL,
                    created_at TIMESTAMP WITH TIME ZONE DEFAULT NOW(),
                    updated_at TIMESTAMP WITH TIME ZONE DEFAULT NOW()
                )
                "#
            ))
            .execute(pool)
            .await
            .map_err(db_err)?;

            // 创建索引以优化查询性能
            let indexes = [
                format!("CREATE INDEX IF NOT EXISTS idx_{table}_sede ON {table}(sede)"),
                format!("CREATE INDEX IF NOT EXISTS idx_{table}_estado ON {table}((data ->> 'estado'))"),
                format!("CREATE INDEX IF NOT EXISTS idx_{table}_data ON {table} USING GIN (data)"),
            ];
            for index_sql in indexes {
                sqlx::query(&index_sql).execute(pool).await.map_err(db_err)?;
            }
        }

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS counters (
                name VARCHAR(64) PRIMARY KEY,
                value BIGINT NOT NULL
            )
            "#,
        )
        .execute(pool)
        .await
        .map_err(db_err)?;

        tracing::info!("Database tables created successfully");
        Ok(())
    }

    async fn insert(&self, collection: Collection, doc: StoredDocument) -> Result<()> {
        let sql = format!(
            "INSERT INTO {} (id, numero, sede, version, data) VALUES ($1, $2, $3, $4, $5)",
            collection.table()
        );
        sqlx::query(&sql)
            .bind(doc.id)
            .bind(&doc.numero)
            .bind(&doc.sede)
            .bind(doc.version)
            .bind(sqlx::types::Json(&doc.data))
            .execute(self.pool())
            .await
            .map_err(|e| match e {
                sqlx::Error::Database(ref db) if db.is_unique_violation() => {
                    ClinicError::Conflict(format!("El registro {} ya existe", doc.numero))
                }
                other => db_err(other),
            })?;
        Ok(())
    }

    async fn get(&self, collection: Collection, id: Uuid) -> Result<Option<StoredDocument>> {
        let sql = format!(
            "SELECT id, numero, sede, version, data, created_at, updated_at FROM {} WHERE id = $1",
            collection.table()
        );
        let row = sqlx::query_as::<_, DbDocument>(&sql)
            .bind(id)
            .fetch_optional(self.pool())
            .await
            .map_err(db_err)?;
        Ok(row.map(StoredDocument::from))
    }

    async fn update(
        &self,
        collection: Collection,
        doc: StoredDocument,
        expected_version: i64,
    ) -> Result<i64> {
        let sql = format!(
            r#"
            UPDATE {} SET
                sede = $3,
                data = jsonb_set($4, '{{version}}', to_jsonb($2::bigint + 1)),
                version = $2 + 1,
                updated_at = NOW()
            WHERE id = $1 AND version = $2
            RETURNING version
            "#,
            collection.table()
        );
        let updated: Option<i64> = sqlx::query_scalar(&sql)
            .bind(doc.id)
            .bind(expected_version)
            .bind(&doc.sede)
            .bind(sqlx::types::Json(&doc.data))
            .fetch_optional(self.pool())
            .await
            .map_err(db_err)?;

        match updated {
            Some(version) => Ok(version),
            None => {
                // 区分记录不存在与版本冲突
                if self.get(collection, doc.id).await?.is_none() {
                    Err(ClinicError::not_found(collection.not_found_message()))
                } else {
                    tracing::warn!(table = collection.table(), id = %doc.id, expected_version, "optimistic lock conflict");
                    Err(ClinicError::Conflict(
                        "El registro fue modificado por otro usuario; recarga e inténtalo de nuevo"
                            .to_string(),
                    ))
                }
            }
        }
    }

    async fn delete(&self, collection: Collection, id: Uuid) -> Result<bool> {
        let sql = format!("DELETE FROM {} WHERE id = $1", collection.table());
        let result = sqlx::query(&sql)
            .bind(id)
            .execute(self.pool())
            .await
            .map_err(db_err)?;
        Ok(result.rows_affected() > 0)
    }

    async fn find(&self, collection: Collection, query: &Query) -> Result<Vec<StoredDocument>> {
        let mut qb = QueryBuilder::<Postgres>::new(format!(
            "SELECT id, numero, sede, version, data, created_at, updated_at FROM {}",
            collection.table()
        ));
        push_where(&mut qb, &query.filter)?;
        push_order_and_page(&mut qb, query)?;
        let rows = qb
            .build_query_as::<DbDocument>()
            .fetch_all(self.pool())
            .await
            .map_err(db_err)?;
        Ok(rows.into_iter().map(StoredDocument::from).collect())
    }

    async fn count(&self, collection: Collection, filter: &Filter) -> Result<u64> {
        let mut qb =
            QueryBuilder::<Postgres>::new(format!("SELECT COUNT(*) FROM {}", collection.table()));
        push_where(&mut qb, filter)?;
        let count: i64 = qb
            .build_query_scalar()
            .fetch_one(self.pool())
            .await
            .map_err(db_err)?;
        Ok(count.max(0) as u64)
    }

    async fn aggregate(
        &self,
        collection: Collection,
        filter: &Filter,
        group: GroupBy,
        sum: Option<FieldPath>,
    ) -> Result<Vec<GroupBucket>> {
        let mut qb = QueryBuilder::<Postgres>::new(format!(
            "SELECT {} AS key, COUNT(*) AS count, {} AS sum FROM {}",
            group_expr(group)?,
            sum_expr(sum)?,
            collection.table()
        ));
        push_where(&mut qb, filter)?;
        qb.push(" GROUP BY 1 ORDER BY 1");

        let rows = qb.build().fetch_all(self.pool()).await.map_err(db_err)?;
        rows.into_iter()
            .map(|row| {
                let key: String = row.try_get("key").map_err(db_err)?;
                let count: i64 = row.try_get("count").map_err(db_err)?;
                let sum: Decimal = row.try_get("sum").map_err(db_err)?;
                Ok(GroupBucket {
                    key,
                    count: count.max(0) as u64,
                    sum,
                })
            })
            .collect()
    }

    async fn next_sequence(&self, key: &str) -> Result<u64> {
        let value: i64 = sqlx::query_scalar(
            r#"
            INSERT INTO counters (name, value) VALUES ($1, 1)
            ON CONFLICT (name) DO UPDATE SET value = counters.value + 1
            RETURNING value
            "#,
        )
        .bind(key)
        .fetch_one(self.pool())
        .await
        .map_err(db_err)?;
        Ok(value as u64)
    }

    async fn ping(&self) -> Result<()> {
        sqlx::query("SELECT 1")
            .execute(self.pool())
            .await
            .map_err(db_err)?;
        Ok(())
    }
}
