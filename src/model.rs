//! Plain records shared by every layer.
//!
//! The scheduler operates on these records; the store mediates persistence.
//! Nothing here knows about SQL, Redis, or HTTP.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Lowest allowed deployment priority.
pub const PRIORITY_MIN: i32 = 1;
/// Highest allowed deployment priority.
pub const PRIORITY_MAX: i32 = 5;

/// A three-dimensional resource request or capacity.
///
/// All arithmetic is integer; there are no fractional resources.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ResourceVec {
    pub cpu: i64,
    pub ram: i64,
    pub gpu: i64,
}

impl ResourceVec {
    pub const ZERO: ResourceVec = ResourceVec {
        cpu: 0,
        ram: 0,
        gpu: 0,
    };

    pub fn new(cpu: i64, ram: i64, gpu: i64) -> Self {
        Self { cpu, ram, gpu }
    }

    pub fn plus(self, other: ResourceVec) -> ResourceVec {
        ResourceVec {
            cpu: self.cpu + other.cpu,
            ram: self.ram + other.ram,
            gpu: self.gpu + other.gpu,
        }
    }

    pub fn minus(self, other: ResourceVec) -> ResourceVec {
        ResourceVec {
            cpu: self.cpu - other.cpu,
            ram: self.ram - other.ram,
            gpu: self.gpu - other.gpu,
        }
    }

    /// Component-wise `self <= other`.
    pub fn fits_within(self, other: ResourceVec) -> bool {
        self.cpu <= other.cpu && self.ram <= other.ram && self.gpu <= other.gpu
    }
}

/// Cluster lifecycle: deleted clusters reject new deployments but stay
/// queryable for history.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ClusterStatus {
    Active,
    Deleted,
}

impl ClusterStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ClusterStatus::Active => "active",
            ClusterStatus::Deleted => "deleted",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "active" => Some(ClusterStatus::Active),
            "deleted" => Some(ClusterStatus::Deleted),
            _ => None,
        }
    }
}

impl std::fmt::Display for ClusterStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Deployment status field. Transitions are governed by [`crate::lifecycle`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeploymentStatus {
    Pending,
    Running,
    Preempted,
    Failed,
    Completed,
    Deleted,
}

impl DeploymentStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            DeploymentStatus::Pending => "pending",
            DeploymentStatus::Running => "running",
            DeploymentStatus::Preempted => "preempted",
            DeploymentStatus::Failed => "failed",
            DeploymentStatus::Completed => "completed",
            DeploymentStatus::Deleted => "deleted",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(DeploymentStatus::Pending),
            "running" => Some(DeploymentStatus::Running),
            "preempted" => Some(DeploymentStatus::Preempted),
            "failed" => Some(DeploymentStatus::Failed),
            "completed" => Some(DeploymentStatus::Completed),
            "deleted" => Some(DeploymentStatus::Deleted),
            _ => None,
        }
    }

    /// Terminal statuses never transition again.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            DeploymentStatus::Failed | DeploymentStatus::Completed | DeploymentStatus::Deleted
        )
    }

    /// Statuses the worker will still make a decision for.
    pub fn is_schedulable(&self) -> bool {
        matches!(self, DeploymentStatus::Pending | DeploymentStatus::Preempted)
    }
}

impl std::fmt::Display for DeploymentStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Caller role, validated upstream of admission.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    Admin,
    Developer,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::Admin => "admin",
            Role::Developer => "developer",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "admin" => Some(Role::Admin),
            "developer" => Some(Role::Developer),
            _ => None,
        }
    }
}

/// A validated actor identity: who is calling admission, and under which
/// organisation. Authentication itself happens upstream.
#[derive(Debug, Clone, Copy)]
pub struct Actor {
    pub user_id: i64,
    pub org_id: i64,
    pub role: Role,
}

#[derive(Debug, Clone)]
pub struct ClusterRecord {
    pub id: i64,
    pub org_id: i64,
    pub name: String,
    pub capacity: ResourceVec,
    pub status: ClusterStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct DeploymentRecord {
    pub id: i64,
    pub cluster_id: i64,
    pub owner_id: i64,
    pub name: String,
    pub resources: ResourceVec,
    pub priority: i32,
    pub status: DeploymentStatus,
    pub attempt_count: i32,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct UserRecord {
    pub id: i64,
    pub email: String,
    pub org_id: i64,
    pub role: Role,
}

#[derive(Debug, Clone)]
pub struct NewCluster {
    pub org_id: i64,
    pub name: String,
    pub capacity: ResourceVec,
}

#[derive(Debug, Clone)]
pub struct NewDeployment {
    pub cluster_id: i64,
    pub owner_id: i64,
    pub name: String,
    pub resources: ResourceVec,
    pub priority: i32,
}
