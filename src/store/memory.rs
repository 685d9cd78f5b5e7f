//! In-memory store used by tests and local development.
//!
//! A mutex over plain tables. Decision transactions buffer their writes
//! and validate them against live rows at commit, which mirrors the
//! read-stage-commit discipline of the Postgres implementation.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use chrono::Utc;

use crate::lifecycle;
use crate::model::{
    ClusterRecord, ClusterStatus, DeploymentRecord, DeploymentStatus, NewCluster, NewDeployment,
    ResourceVec, Role, UserRecord,
};
use crate::store::{
    DecisionSnapshot, DecisionTxn, IdempotencyCheck, IdempotencyRecord, Store, StoreError,
};

#[derive(Default)]
struct State {
    orgs: HashMap<i64, String>,
    users: HashMap<i64, UserRecord>,
    clusters: HashMap<i64, ClusterRecord>,
    deployments: HashMap<i64, DeploymentRecord>,
    idempotency: HashMap<(String, String, String, String), IdempotencyRecord>,
    next_id: i64,
}

impl State {
    fn allocate_id(&mut self) -> i64 {
        self.next_id += 1;
        self.next_id
    }
}

#[derive(Clone, Default)]
pub struct MemoryStore {
    inner: Arc<Mutex<State>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.inner.lock().expect("store mutex poisoned")
    }

    /// Seed an organisation. Test/bootstrap helper.
    pub fn add_org(&self, name: &str) -> i64 {
        let mut state = self.lock();
        let id = state.allocate_id();
        state.orgs.insert(id, name.to_string());
        id
    }

    /// Seed a user. Test/bootstrap helper.
    pub fn add_user(&self, email: &str, org_id: i64, role: Role) -> i64 {
        let mut state = self.lock();
        let id = state.allocate_id();
        state.users.insert(
            id,
            UserRecord {
                id,
                email: email.to_string(),
                org_id,
                role,
            },
        );
        id
    }
}

fn used_resources(deployments: &HashMap<i64, DeploymentRecord>, cluster_id: i64) -> ResourceVec {
    deployments
        .values()
        .filter(|d| d.cluster_id == cluster_id && d.status == DeploymentStatus::Running)
        .fold(ResourceVec::ZERO, |acc, d| acc.plus(d.resources))
}

#[async_trait]
impl Store for MemoryStore {
    async fn ping(&self) -> Result<(), StoreError> {
        Ok(())
    }

    async fn create_cluster(&self, new: NewCluster) -> Result<ClusterRecord, StoreError> {
        let mut state = self.lock();

        if !state.orgs.contains_key(&new.org_id) {
            return Err(StoreError::NotFound("organisation"));
        }

        let duplicate = state.clusters.values().any(|c| {
            c.org_id == new.org_id && c.name == new.name && c.status == ClusterStatus::Active
        });
        if duplicate {
            return Err(StoreError::Conflict(format!(
                "cluster '{}' already exists in this organisation",
                new.name
            )));
        }

        let now = Utc::now();
        let id = state.allocate_id();
        let record = ClusterRecord {
            id,
            org_id: new.org_id,
            name: new.name,
            capacity: new.capacity,
            status: ClusterStatus::Active,
            created_at: now,
            updated_at: now,
        };
        state.clusters.insert(id, record.clone());
        Ok(record)
    }

    async fn cluster(&self, id: i64) -> Result<Option<ClusterRecord>, StoreError> {
        Ok(self.lock().clusters.get(&id).cloned())
    }

    async fn list_clusters(
        &self,
        org_id: i64,
        include_deleted: bool,
    ) -> Result<Vec<ClusterRecord>, StoreError> {
        let state = self.lock();
        let mut clusters: Vec<_> = state
            .clusters
            .values()
            .filter(|c| c.org_id == org_id)
            .filter(|c| include_deleted || c.status == ClusterStatus::Active)
            .cloned()
            .collect();
        clusters.sort_by(|a, b| b.created_at.cmp(&a.created_at).then(b.id.cmp(&a.id)));
        Ok(clusters)
    }

    async fn soft_delete_cluster(&self, id: i64) -> Result<ClusterRecord, StoreError> {
        let mut state = self.lock();
        let cluster = state
            .clusters
            .get_mut(&id)
            .ok_or(StoreError::NotFound("cluster"))?;

        if cluster.status == ClusterStatus::Deleted {
            return Err(StoreError::Conflict("cluster is already deleted".into()));
        }

        cluster.status = ClusterStatus::Deleted;
        cluster.updated_at = Utc::now();
        Ok(cluster.clone())
    }

    async fn create_deployment(&self, new: NewDeployment) -> Result<DeploymentRecord, StoreError> {
        let mut state = self.lock();

        if !state.clusters.contains_key(&new.cluster_id) {
            return Err(StoreError::NotFound("cluster"));
        }

        let duplicate = state.deployments.values().any(|d| {
            d.cluster_id == new.cluster_id
                && d.name == new.name
                && d.status == DeploymentStatus::Pending
        });
        if duplicate {
            return Err(StoreError::Conflict(format!(
                "a pending deployment named '{}' already exists in this cluster",
                new.name
            )));
        }

        let now = Utc::now();
        let id = state.allocate_id();
        let record = DeploymentRecord {
            id,
            cluster_id: new.cluster_id,
            owner_id: new.owner_id,
            name: new.name,
            resources: new.resources,
            priority: new.priority,
            status: DeploymentStatus::Pending,
            attempt_count: 0,
            created_at: now,
            updated_at: now,
        };
        state.deployments.insert(id, record.clone());
        Ok(record)
    }

    async fn deployment(&self, id: i64) -> Result<Option<DeploymentRecord>, StoreError> {
        Ok(self.lock().deployments.get(&id).cloned())
    }

    async fn list_deployments(
        &self,
        org_id: i64,
        cluster_id: Option<i64>,
        include_deleted: bool,
    ) -> Result<Vec<DeploymentRecord>, StoreError> {
        let state = self.lock();
        let mut deployments: Vec<_> = state
            .deployments
            .values()
            .filter(|d| {
                state
                    .clusters
                    .get(&d.cluster_id)
                    .is_some_and(|c| c.org_id == org_id)
            })
            .filter(|d| cluster_id.map_or(true, |cid| d.cluster_id == cid))
            .filter(|d| include_deleted || d.status != DeploymentStatus::Deleted)
            .cloned()
            .collect();
        deployments.sort_by(|a, b| {
            b.priority
                .cmp(&a.priority)
                .then(b.created_at.cmp(&a.created_at))
                .then(b.id.cmp(&a.id))
        });
        Ok(deployments)
    }

    async fn deployments_by_status(
        &self,
        cluster_id: i64,
        status: DeploymentStatus,
    ) -> Result<Vec<DeploymentRecord>, StoreError> {
        let state = self.lock();
        let mut deployments: Vec<_> = state
            .deployments
            .values()
            .filter(|d| d.cluster_id == cluster_id && d.status == status)
            .cloned()
            .collect();
        deployments.sort_by_key(|d| d.id);
        Ok(deployments)
    }

    async fn cancel_deployment(&self, id: i64) -> Result<DeploymentRecord, StoreError> {
        let mut state = self.lock();
        let deployment = state
            .deployments
            .get_mut(&id)
            .ok_or(StoreError::NotFound("deployment"))?;

        if !lifecycle::can_transition(deployment.status, DeploymentStatus::Deleted) {
            return Err(StoreError::IllegalTransition {
                from: deployment.status,
                to: DeploymentStatus::Deleted,
            });
        }

        deployment.status = DeploymentStatus::Deleted;
        deployment.updated_at = Utc::now();
        Ok(deployment.clone())
    }

    async fn live_deployments(&self) -> Result<Vec<DeploymentRecord>, StoreError> {
        let state = self.lock();
        let mut deployments: Vec<_> = state
            .deployments
            .values()
            .filter(|d| d.status.is_schedulable())
            .cloned()
            .collect();
        deployments.sort_by_key(|d| d.id);
        Ok(deployments)
    }

    async fn user_by_email(&self, email: &str) -> Result<Option<UserRecord>, StoreError> {
        Ok(self
            .lock()
            .users
            .values()
            .find(|u| u.email == email)
            .cloned())
    }

    async fn begin_decision(
        &self,
        deployment_id: i64,
    ) -> Result<Box<dyn DecisionTxn>, StoreError> {
        Ok(Box::new(MemoryDecisionTxn {
            inner: Arc::clone(&self.inner),
            deployment_id,
            staged: Vec::new(),
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
        let state = self.lock();
        let key = (
            org_id.to_string(),
            actor_id.to_string(),
            endpoint_name.to_string(),
            idempotency_key.to_string(),
        );
        match state.idempotency.get(&key) {
            None => Ok(IdempotencyCheck::NotFound),
            Some(record) if record.request_hash == request_hash => Ok(IdempotencyCheck::Found {
                status_code: record.response_status_code,
                body: record.response_body.clone(),
            }),
            Some(_) => Ok(IdempotencyCheck::Conflict),
        }
    }

    async fn idempotency_store(&self, record: IdempotencyRecord) -> Result<(), StoreError> {
        let mut state = self.lock();
        let key = (
            record.org_id.clone(),
            record.actor_id.clone(),
            record.endpoint_name.clone(),
            record.idempotency_key.clone(),
        );
        state.idempotency.entry(key).or_insert(record);
        Ok(())
    }
}

#[derive(Debug, Clone, Copy)]
enum StagedWrite {
    SetStatus { id: i64, to: DeploymentStatus },
    BumpAttempt { id: i64 },
}

struct MemoryDecisionTxn {
    inner: Arc<Mutex<State>>,
    deployment_id: i64,
    staged: Vec<StagedWrite>,
}

impl MemoryDecisionTxn {
    fn lock(&self) -> MutexGuard<'_, State> {
        self.inner.lock().expect("store mutex poisoned")
    }

    /// Apply the staged writes to a copy of the live rows, checking
    /// transition legality along the way.
    fn apply_staged(
        &self,
        deployments: &mut HashMap<i64, DeploymentRecord>,
    ) -> Result<(), StoreError> {
        let now = Utc::now();
        for write in &self.staged {
            match *write {
                StagedWrite::SetStatus { id, to } => {
                    let row = deployments
                        .get_mut(&id)
                        .ok_or(StoreError::NotFound("deployment"))?;
                    if !lifecycle::can_transition(row.status, to) {
                        return Err(StoreError::IllegalTransition {
                            from: row.status,
                            to,
                        });
                    }
                    row.status = to;
                    row.updated_at = now;
                }
                StagedWrite::BumpAttempt { id } => {
                    let row = deployments
                        .get_mut(&id)
                        .ok_or(StoreError::NotFound("deployment"))?;
                    row.attempt_count += 1;
                    row.updated_at = now;
                }
            }
        }
        Ok(())
    }
}

#[async_trait]
impl DecisionTxn for MemoryDecisionTxn {
    async fn snapshot(&mut self) -> Result<DecisionSnapshot, StoreError> {
        let state = self.lock();
        let deployment = state
            .deployments
            .get(&self.deployment_id)
            .cloned()
            .ok_or(StoreError::NotFound("deployment"))?;
        let cluster = state.clusters.get(&deployment.cluster_id).cloned();
        let mut running: Vec<_> = state
            .deployments
            .values()
            .filter(|d| {
                d.cluster_id == deployment.cluster_id && d.status == DeploymentStatus::Running
            })
            .cloned()
            .collect();
        running.sort_by_key(|d| d.id);
        Ok(DecisionSnapshot {
            deployment,
            cluster,
            running,
        })
    }

    async fn set_status(&mut self, id: i64, to: DeploymentStatus) -> Result<(), StoreError> {
        // Validate eagerly against live rows plus earlier staged writes so
        // the worker sees conflicts at staging time, not only at commit.
        let mut preview = self.lock().deployments.clone();
        self.apply_staged(&mut preview)?;
        let row = preview.get(&id).ok_or(StoreError::NotFound("deployment"))?;
        if !lifecycle::can_transition(row.status, to) {
            return Err(StoreError::IllegalTransition {
                from: row.status,
                to,
            });
        }
        self.staged.push(StagedWrite::SetStatus { id, to });
        Ok(())
    }

    async fn bump_attempt(&mut self, id: i64) -> Result<(), StoreError> {
        self.staged.push(StagedWrite::BumpAttempt { id });
        Ok(())
    }

    async fn commit(self: Box<Self>) -> Result<(), StoreError> {
        let mut state = self.inner.lock().expect("store mutex poisoned");

        let cluster_id = state
            .deployments
            .get(&self.deployment_id)
            .map(|d| d.cluster_id)
            .ok_or(StoreError::NotFound("deployment"))?;

        let mut updated = state.deployments.clone();
        self.apply_staged(&mut updated)?;

        if let Some(cluster) = state.clusters.get(&cluster_id) {
            let used = used_resources(&updated, cluster_id);
            if !used.fits_within(cluster.capacity) {
                return Err(StoreError::CapacityExceeded { cluster_id });
            }
        }

        state.deployments = updated;
        Ok(())
    }
}
