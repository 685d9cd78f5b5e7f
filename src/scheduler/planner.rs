//! The preemption planner.
//!
//! Given one schedulable deployment and the RUNNING set of its cluster,
//! decides to admit directly, admit after preempting a set of strictly
//! lower-priority deployments, or defer.
//!
//! The victim order is the contract: candidates are taken ascending by
//! `(priority, created_at, id)` and accumulated greedily until the
//! request fits. No subset search happens beyond that, which keeps the
//! outcome a pure, deterministic function of its inputs.

use crate::model::{DeploymentRecord, ResourceVec};
use crate::scheduler::resources;

/// Outcome of planning one deployment against one cluster.
#[derive(Debug, Clone, PartialEq)]
pub enum Decision {
    /// Fits into free capacity as-is.
    Admit,
    /// Fits after preempting exactly these running deployments.
    Preempt(Vec<DeploymentRecord>),
    /// Does not fit, and preemption cannot make it fit.
    Defer,
}

pub fn plan(
    deployment: &DeploymentRecord,
    running: &[DeploymentRecord],
    capacity: ResourceVec,
) -> Decision {
    let available = resources::free(capacity, running);
    if resources::fits(deployment.resources, available) {
        return Decision::Admit;
    }

    let mut candidates: Vec<&DeploymentRecord> = running
        .iter()
        .filter(|r| r.priority < deployment.priority && r.id != deployment.id)
        .collect();
    candidates.sort_by(|a, b| {
        a.priority
            .cmp(&b.priority)
            .then(a.created_at.cmp(&b.created_at))
            .then(a.id.cmp(&b.id))
    });

    let mut victims = Vec::new();
    let mut freed = ResourceVec::ZERO;
    for candidate in candidates {
        victims.push(candidate.clone());
        freed = freed.plus(candidate.resources);
        if resources::fits(deployment.resources, available.plus(freed)) {
            return Decision::Preempt(victims);
        }
    }

    Decision::Defer
}
