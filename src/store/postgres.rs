//! Postgres store implementation.
//!
//! Named queries over plain row structs; one decision per transaction.
//! The decision transaction takes `FOR UPDATE` locks on the deployment,
//! its cluster row, and the cluster's RUNNING set. Locking the cluster
//! row keeps concurrent decisions from inserting phantom RUNNING rows
//! for the same cluster even if the distributed lock misbehaves.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::{PgPool, PgPoolOptions, PgRow};
use sqlx::{Postgres, Row, Transaction};
use tracing::info;

use crate::lifecycle;
use crate::model::{
    ClusterRecord, ClusterStatus, DeploymentRecord, DeploymentStatus, NewCluster, NewDeployment,
    ResourceVec, Role, UserRecord,
};
use crate::store::{
    DecisionSnapshot, DecisionTxn, IdempotencyCheck, IdempotencyRecord, Store, StoreError,
};

/// Connection pool configuration.
#[derive(Debug, Clone)]
pub struct PgStoreConfig {
    pub database_url: String,
    pub max_connections: u32,
    pub min_connections: u32,
    pub acquire_timeout: Duration,
}

impl Default for PgStoreConfig {
    fn default() -> Self {
        Self {
            database_url: "postgres://localhost/berth".to_string(),
            max_connections: 10,
            min_connections: 1,
            acquire_timeout: Duration::from_secs(5),
        }
    }
}

/// Postgres-backed store.
#[derive(Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub async fn connect(config: &PgStoreConfig) -> Result<Self, StoreError> {
        info!(
            max_connections = config.max_connections,
            min_connections = config.min_connections,
            "Connecting to database"
        );

        let pool = PgPoolOptions::new()
            .max_connections(config.max_connections)
            .min_connections(config.min_connections)
            .acquire_timeout(config.acquire_timeout)
            .connect(&config.database_url)
            .await
            .map_err(from_sqlx)?;

        info!("Database connection pool established");

        Ok(Self { pool })
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Run pending migrations. Candidate directories cover running from
    /// the repository root and from an installed binary's working dir.
    pub async fn run_migrations(&self) -> Result<(), StoreError> {
        info!("Running database migrations");

        let candidates = [
            std::path::PathBuf::from("./migrations"),
            std::path::PathBuf::from(env!("CARGO_MANIFEST_DIR")).join("migrations"),
        ];

        let mut last_error = None;
        for dir in &candidates {
            match sqlx::migrate::Migrator::new(dir.clone()).await {
                Ok(migrator) => {
                    info!(migrations_dir = %dir.display(), "Loaded migrations");
                    migrator.run(&self.pool).await.map_err(|e| {
                        StoreError::Backend {
                            message: format!("migration failed: {e}"),
                            retryable: false,
                        }
                    })?;
                    info!("Database migrations complete");
                    return Ok(());
                }
                Err(e) => last_error = Some(e),
            }
        }

        Err(StoreError::Backend {
            message: format!(
                "no migrations directory found: {}",
                last_error
                    .map(|e| e.to_string())
                    .unwrap_or_else(|| "unknown error".to_string())
            ),
            retryable: false,
        })
    }
}

fn from_sqlx(e: sqlx::Error) -> StoreError {
    let retryable = match &e {
        sqlx::Error::Io(_) => true,
        sqlx::Error::PoolTimedOut => true,
        sqlx::Error::PoolClosed => false,
        sqlx::Error::Database(db_err) => db_err.code().is_some_and(|code| {
            matches!(
                code.as_ref(),
                "40001" | // serialization_failure
                "40P01" | // deadlock_detected
                "57P01" | // admin_shutdown
                "57P02" | // crash_shutdown
                "57P03"   // cannot_connect_now
            )
        }),
        _ => false,
    };

    StoreError::Backend {
        message: e.to_string(),
        retryable,
    }
}

fn parse_cluster_status(raw: &str) -> Result<ClusterStatus, StoreError> {
    ClusterStatus::parse(raw).ok_or_else(|| StoreError::Backend {
        message: format!("unknown cluster status '{raw}' in store"),
        retryable: false,
    })
}

fn parse_deployment_status(raw: &str) -> Result<DeploymentStatus, StoreError> {
    DeploymentStatus::parse(raw).ok_or_else(|| StoreError::Backend {
        message: format!("unknown deployment status '{raw}' in store"),
        retryable: false,
    })
}

// =============================================================================
// Row types
// =============================================================================

#[derive(Debug)]
struct ClusterRow {
    id: i64,
    organisation_id: i64,
    name: String,
    cpu_total: i64,
    ram_total: i64,
    gpu_total: i64,
    status: String,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl<'r> sqlx::FromRow<'r, PgRow> for ClusterRow {
    fn from_row(row: &'r PgRow) -> Result<Self, sqlx::Error> {
        Ok(Self {
            id: row.try_get("id")?,
            organisation_id: row.try_get("organisation_id")?,
            name: row.try_get("name")?,
            cpu_total: row.try_get("cpu_total")?,
            ram_total: row.try_get("ram_total")?,
            gpu_total: row.try_get("gpu_total")?,
            status: row.try_get("status")?,
            created_at: row.try_get("created_at")?,
            updated_at: row.try_get("updated_at")?,
        })
    }
}

impl TryFrom<ClusterRow> for ClusterRecord {
    type Error = StoreError;

    fn try_from(row: ClusterRow) -> Result<Self, StoreError> {
        Ok(ClusterRecord {
            id: row.id,
            org_id: row.organisation_id,
            name: row.name,
            capacity: ResourceVec::new(row.cpu_total, row.ram_total, row.gpu_total),
            status: parse_cluster_status(&row.status)?,
            created_at: row.created_at,
            updated_at: row.updated_at,
        })
    }
}

#[derive(Debug)]
struct DeploymentRow {
    id: i64,
    cluster_id: i64,
    owner_id: i64,
    name: String,
    cpu: i64,
    ram: i64,
    gpu: i64,
    priority: i32,
    status: String,
    attempt_count: i32,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl<'r> sqlx::FromRow<'r, PgRow> for DeploymentRow {
    fn from_row(row: &'r PgRow) -> Result<Self, sqlx::Error> {
        Ok(Self {
            id: row.try_get("id")?,
            cluster_id: row.try_get("cluster_id")?,
            owner_id: row.try_get("owner_id")?,
            name: row.try_get("name")?,
            cpu: row.try_get("cpu")?,
            ram: row.try_get("ram")?,
            gpu: row.try_get("gpu")?,
            priority: row.try_get("priority")?,
            status: row.try_get("status")?,
            attempt_count: row.try_get("attempt_count")?,
            created_at: row.try_get("created_at")?,
            updated_at: row.try_get("updated_at")?,
        })
    }
}

impl TryFrom<DeploymentRow> for DeploymentRecord {
    type Error = StoreError;

    fn try_from(row: DeploymentRow) -> Result<Self, StoreError> {
        Ok(DeploymentRecord {
            id: row.id,
            cluster_id: row.cluster_id,
            owner_id: row.owner_id,
            name: row.name,
            resources: ResourceVec::new(row.cpu, row.ram, row.gpu),
            priority: row.priority,
            status: parse_deployment_status(&row.status)?,
            attempt_count: row.attempt_count,
            created_at: row.created_at,
            updated_at: row.updated_at,
        })
    }
}

const DEPLOYMENT_COLUMNS: &str = "id, cluster_id, owner_id, name, cpu, ram, gpu, priority, \
     status, attempt_count, created_at, updated_at";

const CLUSTER_COLUMNS: &str =
    "id, organisation_id, name, cpu_total, ram_total, gpu_total, status, created_at, updated_at";

// =============================================================================
// Store impl
// =============================================================================

#[async_trait]
impl Store for PgStore {
    async fn ping(&self) -> Result<(), StoreError> {
        sqlx::query("SELECT 1")
            .execute(&self.pool)
            .await
            .map_err(from_sqlx)?;
        Ok(())
    }

    async fn create_cluster(&self, new: NewCluster) -> Result<ClusterRecord, StoreError> {
        let mut txn = self.pool.begin().await.map_err(from_sqlx)?;

        let org_exists: bool =
            sqlx::query_scalar("SELECT EXISTS(SELECT 1 FROM organisation WHERE id = $1)")
                .bind(new.org_id)
                .fetch_one(&mut *txn)
                .await
                .map_err(from_sqlx)?;
        if !org_exists {
            return Err(StoreError::NotFound("organisation"));
        }

        let duplicate: bool = sqlx::query_scalar(
            r#"
            SELECT EXISTS(
                SELECT 1 FROM cluster
                WHERE organisation_id = $1 AND name = $2 AND status = 'active'
            )
            "#,
        )
        .bind(new.org_id)
        .bind(&new.name)
        .fetch_one(&mut *txn)
        .await
        .map_err(from_sqlx)?;
        if duplicate {
            return Err(StoreError::Conflict(format!(
                "cluster '{}' already exists in this organisation",
                new.name
            )));
        }

        let row = sqlx::query_as::<_, ClusterRow>(&format!(
            r#"
            INSERT INTO cluster (organisation_id, name, cpu_total, ram_total, gpu_total)
            VALUES ($1, $2, $3, $4, $5)
            RETURNING {CLUSTER_COLUMNS}
            "#
        ))
        .bind(new.org_id)
        .bind(&new.name)
        .bind(new.capacity.cpu)
        .bind(new.capacity.ram)
        .bind(new.capacity.gpu)
        .fetch_one(&mut *txn)
        .await
        .map_err(from_sqlx)?;

        txn.commit().await.map_err(from_sqlx)?;
        row.try_into()
    }

    async fn cluster(&self, id: i64) -> Result<Option<ClusterRecord>, StoreError> {
        let row = sqlx::query_as::<_, ClusterRow>(&format!(
            "SELECT {CLUSTER_COLUMNS} FROM cluster WHERE id = $1"
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await
        .map_err(from_sqlx)?;
        row.map(TryInto::try_into).transpose()
    }

    async fn list_clusters(
        &self,
        org_id: i64,
        include_deleted: bool,
    ) -> Result<Vec<ClusterRecord>, StoreError> {
        let rows = sqlx::query_as::<_, ClusterRow>(&format!(
            r#"
            SELECT {CLUSTER_COLUMNS} FROM cluster
            WHERE organisation_id = $1 AND ($2 OR status = 'active')
            ORDER BY created_at DESC, id DESC
            "#
        ))
        .bind(org_id)
        .bind(include_deleted)
        .fetch_all(&self.pool)
        .await
        .map_err(from_sqlx)?;
        rows.into_iter().map(TryInto::try_into).collect()
    }

    async fn soft_delete_cluster(&self, id: i64) -> Result<ClusterRecord, StoreError> {
        let mut txn = self.pool.begin().await.map_err(from_sqlx)?;

        let row = sqlx::query_as::<_, ClusterRow>(&format!(
            "SELECT {CLUSTER_COLUMNS} FROM cluster WHERE id = $1 FOR UPDATE"
        ))
        .bind(id)
        .fetch_optional(&mut *txn)
        .await
        .map_err(from_sqlx)?
        .ok_or(StoreError::NotFound("cluster"))?;

        if row.status == "deleted" {
            return Err(StoreError::Conflict("cluster is already deleted".into()));
        }

        let row = sqlx::query_as::<_, ClusterRow>(&format!(
            r#"
            UPDATE cluster SET status = 'deleted', updated_at = now()
            WHERE id = $1
            RETURNING {CLUSTER_COLUMNS}
            "#
        ))
        .bind(id)
        .fetch_one(&mut *txn)
        .await
        .map_err(from_sqlx)?;

        txn.commit().await.map_err(from_sqlx)?;
        row.try_into()
    }

    async fn create_deployment(&self, new: NewDeployment) -> Result<DeploymentRecord, StoreError> {
        let mut txn = self.pool.begin().await.map_err(from_sqlx)?;

        let duplicate: bool = sqlx::query_scalar(
            r#"
            SELECT EXISTS(
                SELECT 1 FROM deployment
                WHERE cluster_id = $1 AND name = $2 AND status = 'pending'
            )
            "#,
        )
        .bind(new.cluster_id)
        .bind(&new.name)
        .fetch_one(&mut *txn)
        .await
        .map_err(from_sqlx)?;
        if duplicate {
            return Err(StoreError::Conflict(format!(
                "a pending deployment named '{}' already exists in this cluster",
                new.name
            )));
        }

        let row = sqlx::query_as::<_, DeploymentRow>(&format!(
            r#"
            INSERT INTO deployment (cluster_id, owner_id, name, cpu, ram, gpu, priority)
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            RETURNING {DEPLOYMENT_COLUMNS}
            "#
        ))
        .bind(new.cluster_id)
        .bind(new.owner_id)
        .bind(&new.name)
        .bind(new.resources.cpu)
        .bind(new.resources.ram)
        .bind(new.resources.gpu)
        .bind(new.priority)
        .fetch_one(&mut *txn)
        .await
        .map_err(from_sqlx)?;

        txn.commit().await.map_err(from_sqlx)?;
        row.try_into()
    }

    async fn deployment(&self, id: i64) -> Result<Option<DeploymentRecord>, StoreError> {
        let row = sqlx::query_as::<_, DeploymentRow>(&format!(
            "SELECT {DEPLOYMENT_COLUMNS} FROM deployment WHERE id = $1"
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await
        .map_err(from_sqlx)?;
        row.map(TryInto::try_into).transpose()
    }

    async fn list_deployments(
        &self,
        org_id: i64,
        cluster_id: Option<i64>,
        include_deleted: bool,
    ) -> Result<Vec<DeploymentRecord>, StoreError> {
        let rows = sqlx::query_as::<_, DeploymentRow>(&format!(
            r#"
            SELECT d.{cols}
            FROM deployment d
            JOIN cluster c ON c.id = d.cluster_id
            WHERE c.organisation_id = $1
              AND ($2::BIGINT IS NULL OR d.cluster_id = $2)
              AND ($3 OR d.status <> 'deleted')
            ORDER BY d.priority DESC, d.created_at DESC, d.id DESC
            "#,
            cols = DEPLOYMENT_COLUMNS.replace(", ", ", d.")
        ))
        .bind(org_id)
        .bind(cluster_id)
        .bind(include_deleted)
        .fetch_all(&self.pool)
        .await
        .map_err(from_sqlx)?;
        rows.into_iter().map(TryInto::try_into).collect()
    }

    async fn deployments_by_status(
        &self,
        cluster_id: i64,
        status: DeploymentStatus,
    ) -> Result<Vec<DeploymentRecord>, StoreError> {
        let rows = sqlx::query_as::<_, DeploymentRow>(&format!(
            r#"
            SELECT {DEPLOYMENT_COLUMNS} FROM deployment
            WHERE cluster_id = $1 AND status = $2
            ORDER BY id
            "#
        ))
        .bind(cluster_id)
        .bind(status.as_str())
        .fetch_all(&self.pool)
        .await
        .map_err(from_sqlx)?;
        rows.into_iter().map(TryInto::try_into).collect()
    }

    async fn cancel_deployment(&self, id: i64) -> Result<DeploymentRecord, StoreError> {
        let mut txn = self.pool.begin().await.map_err(from_sqlx)?;

        let current = sqlx::query_as::<_, DeploymentRow>(&format!(
            "SELECT {DEPLOYMENT_COLUMNS} FROM deployment WHERE id = $1 FOR UPDATE"
        ))
        .bind(id)
        .fetch_optional(&mut *txn)
        .await
        .map_err(from_sqlx)?
        .ok_or(StoreError::NotFound("deployment"))?;

        let from = parse_deployment_status(&current.status)?;
        if !lifecycle::can_transition(from, DeploymentStatus::Deleted) {
            return Err(StoreError::IllegalTransition {
                from,
                to: DeploymentStatus::Deleted,
            });
        }

        let row = sqlx::query_as::<_, DeploymentRow>(&format!(
            r#"
            UPDATE deployment SET status = 'deleted', updated_at = now()
            WHERE id = $1
            RETURNING {DEPLOYMENT_COLUMNS}
            "#
        ))
        .bind(id)
        .fetch_one(&mut *txn)
        .await
        .map_err(from_sqlx)?;

        txn.commit().await.map_err(from_sqlx)?;
        row.try_into()
    }

    async fn live_deployments(&self) -> Result<Vec<DeploymentRecord>, StoreError> {
        let rows = sqlx::query_as::<_, DeploymentRow>(&format!(
            r#"
            SELECT {DEPLOYMENT_COLUMNS} FROM deployment
            WHERE status IN ('pending', 'preempted')
            ORDER BY id
            "#
        ))
        .fetch_all(&self.pool)
        .await
        .map_err(from_sqlx)?;
        rows.into_iter().map(TryInto::try_into).collect()
    }

    async fn user_by_email(&self, email: &str) -> Result<Option<UserRecord>, StoreError> {
        let row = sqlx::query(
            r#"SELECT id, email, organisation_id, role FROM "user" WHERE email = $1"#,
        )
        .bind(email)
        .fetch_optional(&self.pool)
        .await
        .map_err(from_sqlx)?;

        let Some(row) = row else {
            return Ok(None);
        };

        let role_raw: String = row.try_get("role").map_err(from_sqlx)?;
        let role = Role::parse(&role_raw).ok_or_else(|| StoreError::Backend {
            message: format!("unknown user role '{role_raw}' in store"),
            retryable: false,
        })?;

        Ok(Some(UserRecord {
            id: row.try_get("id").map_err(from_sqlx)?,
            email: row.try_get("email").map_err(from_sqlx)?,
            org_id: row.try_get("organisation_id").map_err(from_sqlx)?,
            role,
        }))
    }

    async fn begin_decision(
        &self,
        deployment_id: i64,
    ) -> Result<Box<dyn DecisionTxn>, StoreError> {
        let txn = self.pool.begin().await.map_err(from_sqlx)?;
        Ok(Box::new(PgDecisionTxn {
            txn,
            deployment_id,
        }))
    }

    async fn idempotency_check(
        &self,
        org_id: &str,
        actor_id: &str,
        endpoint_name: &str,
        idempotency_key: &str,
        request_hash: &str,
    ) -> Result<IdempotencyCheck, StoreError> {
        let row = sqlx::query(
            r#"
            SELECT request_hash, response_status_code, response_body
            FROM idempotency_record
            WHERE org_id = $1 AND actor_id = $2 AND endpoint_name = $3 AND idempotency_key = $4
            "#,
        )
        .bind(org_id)
        .bind(actor_id)
        .bind(endpoint_name)
        .bind(idempotency_key)
        .fetch_optional(&self.pool)
        .await
        .map_err(from_sqlx)?;

        let Some(row) = row else {
            return Ok(IdempotencyCheck::NotFound);
        };

        let stored_hash: String = row.try_get("request_hash").map_err(from_sqlx)?;
        if stored_hash != request_hash {
            return Ok(IdempotencyCheck::Conflict);
        }

        Ok(IdempotencyCheck::Found {
            status_code: row.try_get("response_status_code").map_err(from_sqlx)?,
            body: row.try_get("response_body").map_err(from_sqlx)?,
        })
    }

    async fn idempotency_store(&self, record: IdempotencyRecord) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO idempotency_record (
                org_id, actor_id, endpoint_name, idempotency_key, request_hash,
                response_status_code, response_body
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            ON CONFLICT (org_id, actor_id, endpoint_name, idempotency_key) DO NOTHING
            "#,
        )
        .bind(&record.org_id)
        .bind(&record.actor_id)
        .bind(&record.endpoint_name)
        .bind(&record.idempotency_key)
        .bind(&record.request_hash)
        .bind(record.response_status_code)
        .bind(&record.response_body)
        .execute(&self.pool)
        .await
        .map_err(from_sqlx)?;
        Ok(())
    }
}

// =============================================================================
// Decision transaction
// =============================================================================

struct PgDecisionTxn {
    txn: Transaction<'static, Postgres>,
    deployment_id: i64,
}

impl PgDecisionTxn {
    async fn current_status(&mut self, id: i64) -> Result<DeploymentStatus, StoreError> {
        let raw: Option<String> = sqlx::query_scalar("SELECT status FROM deployment WHERE id = $1")
            .bind(id)
            .fetch_optional(&mut *self.txn)
            .await
            .map_err(from_sqlx)?;
        let raw = raw.ok_or(StoreError::NotFound("deployment"))?;
        parse_deployment_status(&raw)
    }
}

#[async_trait]
impl DecisionTxn for PgDecisionTxn {
    async fn snapshot(&mut self) -> Result<DecisionSnapshot, StoreError> {
        let deployment: DeploymentRecord = sqlx::query_as::<_, DeploymentRow>(&format!(
            "SELECT {DEPLOYMENT_COLUMNS} FROM deployment WHERE id = $1 FOR UPDATE"
        ))
        .bind(self.deployment_id)
        .fetch_optional(&mut *self.txn)
        .await
        .map_err(from_sqlx)?
        .ok_or(StoreError::NotFound("deployment"))?
        .try_into()?;

        // Lock the cluster row: this is what serializes decisions for one
        // cluster at the store level and keeps phantom RUNNING rows out.
        let cluster = sqlx::query_as::<_, ClusterRow>(&format!(
            "SELECT {CLUSTER_COLUMNS} FROM cluster WHERE id = $1 FOR UPDATE"
        ))
        .bind(deployment.cluster_id)
        .fetch_optional(&mut *self.txn)
        .await
        .map_err(from_sqlx)?
        .map(TryInto::try_into)
        .transpose()?;

        let running = sqlx::query_as::<_, DeploymentRow>(&format!(
            r#"
            SELECT {DEPLOYMENT_COLUMNS} FROM deployment
            WHERE cluster_id = $1 AND status = 'running'
            ORDER BY id
            FOR UPDATE
            "#
        ))
        .bind(deployment.cluster_id)
        .fetch_all(&mut *self.txn)
        .await
        .map_err(from_sqlx)?
        .into_iter()
        .map(TryInto::try_into)
        .collect::<Result<Vec<_>, _>>()?;

        Ok(DecisionSnapshot {
            deployment,
            cluster,
            running,
        })
    }

    async fn set_status(&mut self, id: i64, to: DeploymentStatus) -> Result<(), StoreError> {
        let from = self.current_status(id).await?;
        if !lifecycle::can_transition(from, to) {
            return Err(StoreError::IllegalTransition { from, to });
        }

        sqlx::query("UPDATE deployment SET status = $2, updated_at = now() WHERE id = $1")
            .bind(id)
            .bind(to.as_str())
            .execute(&mut *self.txn)
            .await
            .map_err(from_sqlx)?;
        Ok(())
    }

    async fn bump_attempt(&mut self, id: i64) -> Result<(), StoreError> {
        sqlx::query(
            "UPDATE deployment SET attempt_count = attempt_count + 1, updated_at = now() \
             WHERE id = $1",
        )
        .bind(id)
        .execute(&mut *self.txn)
        .await
        .map_err(from_sqlx)?;
        Ok(())
    }

    async fn commit(mut self: Box<Self>) -> Result<(), StoreError> {
        let row = sqlx::query(
            r#"
            SELECT c.id AS cluster_id,
                   c.cpu_total - COALESCE(SUM(r.cpu), 0) AS cpu_free,
                   c.ram_total - COALESCE(SUM(r.ram), 0) AS ram_free,
                   c.gpu_total - COALESCE(SUM(r.gpu), 0) AS gpu_free
            FROM deployment t
            JOIN cluster c ON c.id = t.cluster_id
            LEFT JOIN deployment r ON r.cluster_id = c.id AND r.status = 'running'
            WHERE t.id = $1
            GROUP BY c.id
            "#,
        )
        .bind(self.deployment_id)
        .fetch_optional(&mut *self.txn)
        .await
        .map_err(from_sqlx)?;

        if let Some(row) = row {
            let cluster_id: i64 = row.try_get("cluster_id").map_err(from_sqlx)?;
            let cpu_free: i64 = row.try_get("cpu_free").map_err(from_sqlx)?;
            let ram_free: i64 = row.try_get("ram_free").map_err(from_sqlx)?;
            let gpu_free: i64 = row.try_get("gpu_free").map_err(from_sqlx)?;
            if cpu_free < 0 || ram_free < 0 || gpu_free < 0 {
                return Err(StoreError::CapacityExceeded { cluster_id });
            }
        }

        self.txn.commit().await.map_err(from_sqlx)?;
        Ok(())
    }
}
